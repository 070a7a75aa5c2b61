// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    ffi::OsStr,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use snafu::{ResultExt, ensure};
use tokio::{fs, io::AsyncWriteExt};

use crate::{
    Result,
    error::{InvalidPathSnafu, IoSnafu},
};

/// Extension given to a data file that failed to parse.
pub const QUARANTINE_EXTENSION: &str = "bak";

/// Extension of the staging file used for atomic rewrites.
pub const STAGING_EXTENSION: &str = "tmp";

/// Extensions a queue data file must not use.
pub const RESERVED_EXTENSIONS: [&str; 2] = [QUARANTINE_EXTENSION, STAGING_EXTENSION];

/// Where a corrupt data file is moved: `queue.dat` -> `queue.dat.bak`.
#[must_use]
pub fn quarantine_path<P: AsRef<Path>>(path: P) -> PathBuf {
    with_suffix(path.as_ref(), QUARANTINE_EXTENSION)
}

/// Fallback when [`quarantine_path`] is taken: `queue.dat.<n>.bak`.
pub(crate) fn numbered_quarantine_path(path: &Path, n: usize) -> PathBuf {
    with_suffix(path, &format!("{n}.{QUARANTINE_EXTENSION}"))
}

/// Where a rewrite is staged before it replaces the data file:
/// `queue.dat` -> `queue.dat.tmp`.
#[must_use]
pub fn staging_path<P: AsRef<Path>>(path: P) -> PathBuf {
    with_suffix(path.as_ref(), STAGING_EXTENSION)
}

/// Appends `.suffix` to the full file name, keeping any extension.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Rejects paths that cannot name a queue data file.
pub fn validate_data_path(path: &Path) -> Result<()> {
    ensure!(
        !path.as_os_str().is_empty(),
        InvalidPathSnafu {
            path,
            reason: "path is empty",
        }
    );
    ensure!(
        path.file_name().is_some(),
        InvalidPathSnafu {
            path,
            reason: "path does not name a file",
        }
    );

    if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
        ensure!(
            !RESERVED_EXTENSIONS.contains(&extension),
            InvalidPathSnafu {
                path,
                reason: format!(".{extension} suffix is reserved"),
            }
        );
    }

    ensure!(
        !path.is_dir(),
        InvalidPathSnafu {
            path,
            reason: "path is a directory",
        }
    );
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

pub(crate) async fn ensure_parent_dir(path: &Path) -> Result<()> {
    let parent = parent_dir(path);
    fs::create_dir_all(parent)
        .await
        .context(IoSnafu { path: parent })
}

/// Makes a rename or unlink inside the parent directory durable.
#[cfg(unix)]
pub(crate) async fn sync_parent_dir(path: &Path) -> Result<()> {
    let parent = parent_dir(path);
    let dir = fs::File::open(parent)
        .await
        .context(IoSnafu { path: parent })?;
    dir.sync_all().await.context(IoSnafu { path: parent })
}

#[cfg(not(unix))]
pub(crate) async fn sync_parent_dir(_path: &Path) -> Result<()> { Ok(()) }

/// Reads the whole file, `None` if it does not exist.
pub(crate) async fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(IoSnafu { path }),
    }
}

/// Removes the file, returning whether it existed.
pub(crate) async fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => {
            sync_parent_dir(path).await?;
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).context(IoSnafu { path }),
    }
}

/// Replaces `path` with `bytes` so that a crash leaves either the old or the
/// new content, never a mix.
pub(crate) async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let staging = staging_path(path);
    {
        let mut file = fs::File::create(&staging)
            .await
            .context(IoSnafu { path: &staging })?;
        file.write_all(bytes)
            .await
            .context(IoSnafu { path: &staging })?;
        file.sync_all().await.context(IoSnafu { path: &staging })?;
    }
    fs::rename(&staging, path)
        .await
        .context(IoSnafu { path })?;
    sync_parent_dir(path).await
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_quarantine_and_staging_paths() {
        assert_eq!(
            quarantine_path("/queue/jobs.dat"),
            PathBuf::from("/queue/jobs.dat.bak")
        );
        assert_eq!(quarantine_path("/queue/jobs"), PathBuf::from("/queue/jobs.bak"));
        assert_eq!(
            numbered_quarantine_path(Path::new("/queue/jobs.dat"), 2),
            PathBuf::from("/queue/jobs.dat.2.bak")
        );
        assert_eq!(
            staging_path("/queue/jobs.dat"),
            PathBuf::from("/queue/jobs.dat.tmp")
        );
    }

    #[test]
    fn test_sibling_files_stage_separately() {
        let staged: std::collections::HashSet<_> = ["jobs", "jobs.a", "jobs.b"]
            .into_iter()
            .map(|name| staging_path(Path::new("/queue").join(name)))
            .collect();
        assert_eq!(staged.len(), 3);
        assert_ne!(quarantine_path("/queue/jobs.a"), quarantine_path("/queue/jobs.b"));
    }

    #[test_case("queue.bak" ; "quarantine suffix")]
    #[test_case("queue.tmp" ; "staging suffix")]
    #[test_case("" ; "empty")]
    #[test_case("/" ; "root")]
    fn test_rejects_unusable_paths(path: &str) {
        let err = validate_data_path(Path::new(path)).unwrap_err();
        assert!(matches!(err, crate::QueueError::InvalidPath { .. }));
    }

    #[test_case("queue.dat" ; "with extension")]
    #[test_case("queue" ; "without extension")]
    #[test_case("nested/dir/queue.db" ; "nested")]
    fn test_accepts_plain_paths(path: &str) {
        validate_data_path(Path::new(path)).unwrap();
    }

    #[test]
    fn test_rejects_directory() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        assert!(validate_data_path(temp_dir.path()).is_err());
    }

    #[tokio::test]
    async fn test_write_atomically_replaces_content() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("queue.dat");

        write_atomically(&path, b"first").await.unwrap();
        write_atomically(&path, b"second").await.unwrap();

        assert_eq!(read_if_exists(&path).await.unwrap().unwrap(), b"second");
        assert!(!staging_path(&path).exists());
    }

    #[tokio::test]
    async fn test_missing_file_helpers() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("missing.dat");

        assert!(read_if_exists(&path).await.unwrap().is_none());
        assert!(!remove_if_exists(&path).await.unwrap());
    }
}

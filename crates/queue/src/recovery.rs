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

//! Startup recovery of a queue's persisted sequence.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
};

use snafu::ResultExt;
use tokio::fs;
use tracing::{debug, error, info};

use crate::{
    Item, QueueError, Result,
    engine::StorageEngine,
    error::IoSnafu,
    metrics::{QUEUE_CORRUPT_STORES, queue_label},
    path::{numbered_quarantine_path, quarantine_path, sync_parent_dir},
};

/// First quarantine location for `path` that holds no earlier evidence.
async fn vacant_quarantine_path(path: &Path) -> Result<PathBuf> {
    let mut target = quarantine_path(path);
    let mut attempt = 0;
    while fs::try_exists(&target)
        .await
        .context(IoSnafu { path: &target })?
    {
        attempt += 1;
        target = numbered_quarantine_path(path, attempt);
    }
    Ok(target)
}

/// Moves an unreadable data file out of the way, keeping it for inspection.
///
/// Earlier quarantined files are never replaced.
pub(crate) async fn quarantine(path: &Path, cause: &QueueError) -> Result<PathBuf> {
    let target = vacant_quarantine_path(path).await?;
    fs::rename(path, &target)
        .await
        .context(IoSnafu { path })?;
    sync_parent_dir(path).await?;

    error!(
        path = ?path,
        quarantined = ?target,
        error = %cause,
        "Data file is corrupt, moved aside and starting empty"
    );
    QUEUE_CORRUPT_STORES
        .with_label_values(&[queue_label(path).as_str()])
        .inc();
    Ok(target)
}

/// Loads the persisted sequence, leaving the store ready for mutations.
///
/// A missing or quarantined store is initialized empty.
pub(crate) async fn recover<T: Item>(engine: &mut dyn StorageEngine<T>) -> Result<VecDeque<T>> {
    let items: VecDeque<T> = engine.fetch_all().await?.into();
    if items.is_empty() {
        engine.initialize().await?;
        debug!(path = ?engine.path(), engine = ?engine.kind(), "Starting with an empty queue");
    } else {
        info!(
            path = ?engine.path(),
            engine = ?engine.kind(),
            items = items.len(),
            "Recovered persisted queue"
        );
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use test_case::test_case;

    use super::*;
    use crate::{Codec, EngineKind};

    struct TestFixture {
        _temp_dir: TempDir,
        path:      PathBuf,
    }

    impl TestFixture {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("jobs.queue");
            Self {
                _temp_dir: temp_dir,
                path,
            }
        }
    }

    #[tokio::test]
    async fn test_quarantine_moves_file_and_counts() {
        let fixture = TestFixture::new();
        std::fs::write(&fixture.path, b"junk").unwrap();
        let label = queue_label(&fixture.path);

        let cause = crate::error::CorruptedSnafu {
            path:   &fixture.path,
            reason: "junk",
        }
        .build();
        let target = quarantine(&fixture.path, &cause).await.unwrap();

        assert_eq!(target, quarantine_path(&fixture.path));
        assert_eq!(std::fs::read(&target).unwrap(), b"junk");
        assert!(!fixture.path.exists());
        assert_eq!(
            QUEUE_CORRUPT_STORES
                .with_label_values(&[label.as_str()])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_quarantine_keeps_earlier_evidence() {
        let fixture = TestFixture::new();
        let cause = crate::error::CorruptedSnafu {
            path:   &fixture.path,
            reason: "junk",
        }
        .build();

        let mut targets = Vec::new();
        for content in [b"first", b"other"] {
            std::fs::write(&fixture.path, content).unwrap();
            targets.push(quarantine(&fixture.path, &cause).await.unwrap());
        }

        assert_eq!(targets[0], quarantine_path(&fixture.path));
        assert_eq!(targets[1], numbered_quarantine_path(&fixture.path, 1));
        assert_eq!(std::fs::read(&targets[0]).unwrap(), b"first");
        assert_eq!(std::fs::read(&targets[1]).unwrap(), b"other");
    }

    #[test_case(EngineKind::Snapshot ; "snapshot")]
    #[test_case(EngineKind::AppendLog ; "append log")]
    #[test_case(EngineKind::Indexed ; "indexed")]
    #[tokio::test]
    async fn test_recover_fresh_store(kind: EngineKind) {
        let fixture = TestFixture::new();
        let mut engine = kind.open::<u32>(&fixture.path, Codec::Bincode);

        let items = recover(engine.as_mut()).await.unwrap();
        assert!(items.is_empty());

        engine.add_item(&7, &VecDeque::from([7])).await.unwrap();
        drop(engine);

        let mut engine = kind.open::<u32>(&fixture.path, Codec::Bincode);
        assert_eq!(recover(engine.as_mut()).await.unwrap(), VecDeque::from([7]));
    }

    #[test_case(EngineKind::Snapshot ; "snapshot")]
    #[test_case(EngineKind::AppendLog ; "append log")]
    #[test_case(EngineKind::Indexed ; "indexed")]
    #[tokio::test]
    async fn test_recover_quarantines_and_starts_empty(kind: EngineKind) {
        let fixture = TestFixture::new();
        std::fs::write(&fixture.path, vec![0x5A; 16 * 1024]).unwrap();

        let mut engine = kind.open::<u32>(&fixture.path, Codec::Bincode);
        assert!(recover(engine.as_mut()).await.unwrap().is_empty());
        assert!(quarantine_path(&fixture.path).exists());

        engine.add_item(&1, &VecDeque::from([1])).await.unwrap();
        engine.remove_item(&VecDeque::new()).await.unwrap();
    }
}

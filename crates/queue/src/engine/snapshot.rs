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

//! Whole-file snapshot engine.
//!
//! The data file holds the snapshot magic followed by a single frame whose
//! payload is the entire sequence. Every mutation rewrites the file through a
//! staging file and an atomic rename.

use std::{
    collections::VecDeque,
    marker::PhantomData,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use snafu::ensure;
use tracing::debug;

use super::{EngineKind, StorageEngine};
use crate::{
    Codec, Item, Result,
    error::{CorruptedSnafu, EmptyStoreSnafu},
    frame::{
        MAGIC_SIZE, SNAPSHOT_MAGIC, ScanOutcome, encode_frame, frame_size, scan_frames, strip_magic,
    },
    path::{read_if_exists, remove_if_exists, write_atomically},
    recovery::quarantine,
};

/// Stores the queue as one serialized sequence.
pub struct SnapshotEngine<T> {
    path:          PathBuf,
    codec:         Codec,
    /// Number of items in the last snapshot written or read.
    persisted_len: usize,
    _item:         PhantomData<fn() -> T>,
}

impl<T: Item> SnapshotEngine<T> {
    pub fn new<P: Into<PathBuf>>(path: P, codec: Codec) -> Self {
        Self {
            path: path.into(),
            codec,
            persisted_len: 0,
            _item: PhantomData,
        }
    }

    fn encode(&self, items: &VecDeque<T>) -> Result<Vec<u8>> {
        let payload = self.codec.encode(items)?;
        let mut buf = Vec::with_capacity(MAGIC_SIZE + frame_size(payload.len()));
        buf.extend_from_slice(SNAPSHOT_MAGIC);
        encode_frame(&payload, &mut buf)?;
        Ok(buf)
    }

    async fn read_items(&self) -> Result<Vec<T>> {
        let Some(bytes) = read_if_exists(&self.path).await? else {
            return Ok(Vec::new());
        };

        let body = strip_magic(&bytes, SNAPSHOT_MAGIC).map_err(|reason| {
            CorruptedSnafu {
                path: &self.path,
                reason,
            }
            .build()
        })?;
        let Some(body) = body else {
            return Ok(Vec::new());
        };

        let scanned = scan_frames(body).map_err(|reason| {
            CorruptedSnafu {
                path: &self.path,
                reason,
            }
            .build()
        })?;
        match (scanned.payloads.as_slice(), scanned.outcome) {
            ([payload], ScanOutcome::Clean) => self.codec.decode(payload),
            (payloads, outcome) => CorruptedSnafu {
                path:   &self.path,
                reason: format!(
                    "expected exactly one snapshot frame, found {} ({outcome:?})",
                    payloads.len()
                ),
            }
            .fail(),
        }
    }
}

#[async_trait]
impl<T: Item> StorageEngine<T> for SnapshotEngine<T> {
    async fn initialize(&mut self) -> Result<()> { self.save_all(&VecDeque::new()).await }

    async fn fetch_all(&mut self) -> Result<Vec<T>> {
        let items = match self.read_items().await {
            Ok(items) => items,
            Err(err) if err.is_corruption() => {
                quarantine(&self.path, &err).await?;
                Vec::new()
            }
            Err(err) => return Err(err),
        };
        self.persisted_len = items.len();
        Ok(items)
    }

    async fn add_item(&mut self, _item: &T, items: &VecDeque<T>) -> Result<()> {
        self.save_all(items).await
    }

    async fn remove_item(&mut self, items: &VecDeque<T>) -> Result<()> {
        ensure!(self.persisted_len > 0, EmptyStoreSnafu { path: &self.path });
        self.save_all(items).await
    }

    async fn save_all(&mut self, items: &VecDeque<T>) -> Result<()> {
        if items.is_empty() && self.persisted_len > 0 {
            remove_if_exists(&self.path).await?;
        } else {
            let bytes = self.encode(items)?;
            write_atomically(&self.path, &bytes).await?;
        }
        self.persisted_len = items.len();
        debug!(path = ?self.path, items = items.len(), "Wrote queue snapshot");
        Ok(())
    }

    fn can_append(&self) -> bool { false }

    fn kind(&self) -> EngineKind { EngineKind::Snapshot }

    fn path(&self) -> &Path { &self.path }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::path::quarantine_path;

    struct TestFixture {
        _temp_dir: TempDir,
        path:      PathBuf,
    }

    impl TestFixture {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("queue.dat");
            Self {
                _temp_dir: temp_dir,
                path,
            }
        }

        fn engine(&self) -> SnapshotEngine<String> {
            SnapshotEngine::new(&self.path, Codec::Bincode)
        }
    }

    fn items(values: &[&str]) -> VecDeque<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let fixture = TestFixture::new();
        let mut engine = fixture.engine();
        assert!(engine.fetch_all().await.unwrap().is_empty());
        assert!(!fixture.path.exists());
    }

    #[tokio::test]
    async fn test_initialize_writes_empty_snapshot() {
        let fixture = TestFixture::new();
        let mut engine = fixture.engine();
        engine.initialize().await.unwrap();
        engine.initialize().await.unwrap();

        assert!(fixture.path.exists());
        assert!(fixture.engine().fetch_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_every_mutation_rewrites_sequence() {
        let fixture = TestFixture::new();
        let mut engine = fixture.engine();
        engine.initialize().await.unwrap();

        let mut sequence = items(&["a"]);
        engine.add_item(&"a".to_string(), &sequence).await.unwrap();
        sequence.push_back("b".to_string());
        engine.add_item(&"b".to_string(), &sequence).await.unwrap();
        assert_eq!(fixture.engine().fetch_all().await.unwrap(), vec!["a", "b"]);

        sequence.pop_front();
        engine.remove_item(&sequence).await.unwrap();
        assert_eq!(fixture.engine().fetch_all().await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_empty_sequence_deletes_file() {
        let fixture = TestFixture::new();
        let mut engine = fixture.engine();
        engine.add_item(&"a".to_string(), &items(&["a"])).await.unwrap();
        assert!(fixture.path.exists());

        engine.remove_item(&VecDeque::new()).await.unwrap();
        assert!(!fixture.path.exists());
    }

    #[tokio::test]
    async fn test_remove_from_empty_store_fails() {
        let fixture = TestFixture::new();
        let mut engine = fixture.engine();
        engine.initialize().await.unwrap();

        let err = engine.remove_item(&VecDeque::new()).await.unwrap_err();
        assert!(matches!(err, crate::QueueError::EmptyStore { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_quarantined() {
        let fixture = TestFixture::new();
        std::fs::write(&fixture.path, b"definitely not a snapshot").unwrap();

        let mut engine = fixture.engine();
        assert!(engine.fetch_all().await.unwrap().is_empty());
        assert!(!fixture.path.exists());
        assert_eq!(
            std::fs::read(quarantine_path(&fixture.path)).unwrap(),
            b"definitely not a snapshot"
        );
    }

    #[tokio::test]
    async fn test_wrong_item_type_is_quarantined() {
        let fixture = TestFixture::new();
        let mut writer: SnapshotEngine<Vec<u64>> = SnapshotEngine::new(&fixture.path, Codec::Json);
        writer
            .add_item(&vec![1], &VecDeque::from([vec![1]]))
            .await
            .unwrap();

        let mut reader: SnapshotEngine<String> = SnapshotEngine::new(&fixture.path, Codec::Json);
        assert!(reader.fetch_all().await.unwrap().is_empty());
        assert!(quarantine_path(&fixture.path).exists());
    }
}

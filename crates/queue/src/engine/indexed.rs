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

//! Keyed log on top of redb.
//!
//! Items live in the `items` table under monotonically increasing ids. The
//! `meta` table holds two pointers, `head_id` and `tail_id`, bounding the live
//! range. Enqueue writes `tail + 1` and advances the tail, dequeue deletes the
//! head and advances it, both inside one write transaction. When the last item
//! leaves, both pointers are cleared and ids restart at 1.
//!
//! A store holding only one of the two pointers was interrupted mid-write by
//! something other than this engine. It reads as empty, and removing from it
//! fails instead of guessing which item is the head.

use std::{
    collections::VecDeque,
    io::ErrorKind,
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use redb::{
    Database, DatabaseError, ReadableTable, StorageError, TableDefinition, TableError,
    WriteTransaction,
};
use snafu::{IntoError, ResultExt, ensure};
use tracing::{debug, trace, warn};

use super::{EngineKind, StorageEngine};
use crate::{
    Codec, Item, QueueError, Result,
    error::{BlockingTaskSnafu, CorruptedSnafu, EmptyStoreSnafu, IoSnafu, StorageSnafu},
    recovery::quarantine,
};

const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
const ITEMS: TableDefinition<u64, &[u8]> = TableDefinition::new("items");

const HEAD_KEY: &str = "head_id";
const TAIL_KEY: &str = "tail_id";

/// First id handed out by an empty store.
const FIRST_ID: u64 = 1;

fn storage<E: Into<redb::Error>>(err: E) -> QueueError { StorageSnafu.into_error(err.into()) }

/// Runs a synchronous redb call off the async runtime.
async fn blocking<R, F>(task: F) -> Result<R>
where
    F: FnOnce() -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .context(BlockingTaskSnafu)?
}

/// State of the head/tail pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pointers {
    Empty,
    Live {
        head: u64,
        tail: u64,
    },
    /// Exactly one pointer is present.
    Dangling {
        head: Option<u64>,
        tail: Option<u64>,
    },
}

fn read_pointers<M>(meta: &M) -> Result<Pointers>
where
    M: ReadableTable<&'static str, u64>,
{
    let head = meta.get(HEAD_KEY).map_err(storage)?.map(|g| g.value());
    let tail = meta.get(TAIL_KEY).map_err(storage)?.map(|g| g.value());
    Ok(match (head, tail) {
        (None, None) => Pointers::Empty,
        (Some(head), Some(tail)) => Pointers::Live { head, tail },
        (head, tail) => Pointers::Dangling { head, tail },
    })
}

/// Whether a failure to open the database means its file is unreadable,
/// as opposed to unreachable or in use.
fn is_unreadable(err: &DatabaseError) -> bool {
    match err {
        DatabaseError::DatabaseAlreadyOpen => false,
        DatabaseError::Storage(StorageError::Io(io)) => {
            matches!(io.kind(), ErrorKind::UnexpectedEof | ErrorKind::InvalidData)
        }
        _ => true,
    }
}

fn open_database(path: &Path) -> Result<Database> {
    match Database::create(path) {
        Ok(db) => Ok(db),
        Err(err) if is_unreadable(&err) => CorruptedSnafu {
            path,
            reason: err.to_string(),
        }
        .fail(),
        Err(err) => Err(storage(err)),
    }
}

fn read_sequence<T: Item>(db: &Database, path: &Path, codec: Codec) -> Result<Vec<T>> {
    let txn = db.begin_read().map_err(storage)?;
    let meta = match txn.open_table(META) {
        Ok(meta) => meta,
        Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
        Err(err) => return Err(storage(err)),
    };

    let (head, tail) = match read_pointers(&meta)? {
        Pointers::Empty => return Ok(Vec::new()),
        Pointers::Dangling { head, tail } => {
            warn!(?path, ?head, ?tail, "Only one queue pointer present, treating store as empty");
            return Ok(Vec::new());
        }
        Pointers::Live { head, tail } => (head, tail),
    };
    ensure!(
        head <= tail,
        CorruptedSnafu {
            path,
            reason: format!("head {head} is past tail {tail}"),
        }
    );

    let items = match txn.open_table(ITEMS) {
        Ok(items) => items,
        Err(TableError::TableDoesNotExist(_)) => {
            return CorruptedSnafu {
                path,
                reason: "pointers present without an items table",
            }
            .fail();
        }
        Err(err) => return Err(storage(err)),
    };

    let mut sequence = Vec::with_capacity(usize::try_from(tail - head + 1).unwrap_or_default());
    for id in head..=tail {
        let Some(bytes) = items.get(id).map_err(storage)? else {
            return CorruptedSnafu {
                path,
                reason: format!("item {id} missing between head {head} and tail {tail}"),
            }
            .fail();
        };
        sequence.push(codec.decode(bytes.value())?);
    }
    Ok(sequence)
}

fn append_item(db: &Database, path: &Path, bytes: &[u8]) -> Result<u64> {
    let txn = db.begin_write().map_err(storage)?;
    let id = {
        let mut meta = txn.open_table(META).map_err(storage)?;
        let mut items = txn.open_table(ITEMS).map_err(storage)?;

        let (id, restart) = match read_pointers(&meta)? {
            Pointers::Empty => (FIRST_ID, true),
            Pointers::Live { tail, .. } => (tail + 1, false),
            Pointers::Dangling { head, tail } => {
                let id = head.max(tail).unwrap_or_default() + 1;
                warn!(?path, ?head, ?tail, id, "Restarting dangling queue pointers");
                (id, true)
            }
        };

        items.insert(id, bytes).map_err(storage)?;
        meta.insert(TAIL_KEY, id).map_err(storage)?;
        if restart {
            meta.insert(HEAD_KEY, id).map_err(storage)?;
        }
        id
    };
    txn.commit().map_err(storage)?;
    Ok(id)
}

fn remove_head(db: &Database, path: &Path) -> Result<u64> {
    let txn = db.begin_write().map_err(storage)?;
    let head = {
        let mut meta = txn.open_table(META).map_err(storage)?;
        let mut items = txn.open_table(ITEMS).map_err(storage)?;

        let Pointers::Live { head, tail } = read_pointers(&meta)? else {
            return EmptyStoreSnafu { path }.fail();
        };

        items.remove(head).map_err(storage)?;
        if head >= tail {
            meta.remove(HEAD_KEY).map_err(storage)?;
            meta.remove(TAIL_KEY).map_err(storage)?;
        } else {
            meta.insert(HEAD_KEY, head + 1).map_err(storage)?;
        }
        head
    };
    txn.commit().map_err(storage)?;
    Ok(head)
}

/// Drops and recreates both tables.
fn reset_tables(txn: &WriteTransaction) -> Result<()> {
    txn.delete_table(META).map_err(storage)?;
    txn.delete_table(ITEMS).map_err(storage)?;
    txn.open_table(META).map_err(storage)?;
    txn.open_table(ITEMS).map_err(storage)?;
    Ok(())
}

fn replace_all(db: &Database, encoded: &[Vec<u8>]) -> Result<()> {
    let txn = db.begin_write().map_err(storage)?;
    reset_tables(&txn)?;
    if !encoded.is_empty() {
        let mut meta = txn.open_table(META).map_err(storage)?;
        let mut items = txn.open_table(ITEMS).map_err(storage)?;
        let mut id = FIRST_ID;
        for bytes in encoded {
            items.insert(id, bytes.as_slice()).map_err(storage)?;
            id += 1;
        }
        meta.insert(HEAD_KEY, FIRST_ID).map_err(storage)?;
        meta.insert(TAIL_KEY, id - 1).map_err(storage)?;
    }
    txn.commit().map_err(storage)
}

fn ensure_tables(db: &Database) -> Result<()> {
    let txn = db.begin_write().map_err(storage)?;
    let pointers = {
        let meta = txn.open_table(META).map_err(storage)?;
        txn.open_table(ITEMS).map_err(storage)?;
        read_pointers(&meta)?
    };
    if !matches!(pointers, Pointers::Live { .. }) {
        reset_tables(&txn)?;
    }
    txn.commit().map_err(storage)
}

/// Stores items by id in a redb database.
pub struct IndexedEngine<T> {
    path:  PathBuf,
    codec: Codec,
    /// Open database; redb holds a file lock for as long as it lives.
    db:    Option<Arc<Database>>,
    _item: PhantomData<fn() -> T>,
}

impl<T: Item> IndexedEngine<T> {
    pub fn new<P: Into<PathBuf>>(path: P, codec: Codec) -> Self {
        Self {
            path: path.into(),
            codec,
            db: None,
            _item: PhantomData,
        }
    }

    async fn database(&mut self) -> Result<Arc<Database>> {
        if let Some(db) = &self.db {
            return Ok(Arc::clone(db));
        }
        let path = self.path.clone();
        let db = Arc::new(blocking(move || open_database(&path)).await?);
        self.db = Some(Arc::clone(&db));
        Ok(db)
    }

    /// Whether the data file holds anything worth opening.
    async fn has_content(&self) -> Result<bool> {
        match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => Ok(metadata.len() > 0),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).context(IoSnafu { path: &self.path }),
        }
    }

    async fn load(&mut self) -> Result<Vec<T>> {
        let db = self.database().await?;
        let path = self.path.clone();
        let codec = self.codec;
        blocking(move || read_sequence(&db, &path, codec)).await
    }

    #[cfg(test)]
    async fn pointers(&mut self) -> Result<Pointers> {
        let db = self.database().await?;
        blocking(move || {
            let txn = db.begin_read().map_err(storage)?;
            match txn.open_table(META) {
                Ok(meta) => read_pointers(&meta),
                Err(TableError::TableDoesNotExist(_)) => Ok(Pointers::Empty),
                Err(err) => Err(storage(err)),
            }
        })
        .await
    }
}

#[async_trait]
impl<T: Item> StorageEngine<T> for IndexedEngine<T> {
    async fn initialize(&mut self) -> Result<()> {
        let db = self.database().await?;
        blocking(move || ensure_tables(&db)).await?;
        debug!(path = ?self.path, "Initialized indexed store");
        Ok(())
    }

    async fn fetch_all(&mut self) -> Result<Vec<T>> {
        if !self.has_content().await? {
            return Ok(Vec::new());
        }
        match self.load().await {
            Ok(items) => Ok(items),
            Err(err) if err.is_corruption() => {
                // Release the file lock before moving the file away.
                self.db = None;
                quarantine(&self.path, &err).await?;
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    async fn add_item(&mut self, item: &T, items: &VecDeque<T>) -> Result<()> {
        let bytes = self.codec.encode(item)?;
        let db = self.database().await?;
        let path = self.path.clone();
        let id = blocking(move || append_item(&db, &path, &bytes)).await?;
        trace!(path = ?self.path, id, items = items.len(), "Stored item");
        Ok(())
    }

    async fn remove_item(&mut self, items: &VecDeque<T>) -> Result<()> {
        let db = self.database().await?;
        let path = self.path.clone();
        let id = blocking(move || remove_head(&db, &path)).await?;
        trace!(path = ?self.path, id, items = items.len(), "Removed item");
        Ok(())
    }

    async fn save_all(&mut self, items: &VecDeque<T>) -> Result<()> {
        let encoded = items
            .iter()
            .map(|item| self.codec.encode(item))
            .collect::<Result<Vec<_>>>()?;
        let db = self.database().await?;
        blocking(move || replace_all(&db, &encoded)).await?;
        debug!(path = ?self.path, items = items.len(), "Replaced indexed store contents");
        Ok(())
    }

    fn can_append(&self) -> bool { true }

    fn kind(&self) -> EngineKind { EngineKind::Indexed }

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
            let path = temp_dir.path().join("queue.db");
            Self {
                _temp_dir: temp_dir,
                path,
            }
        }

        fn engine(&self) -> IndexedEngine<String> { IndexedEngine::new(&self.path, Codec::Bincode) }

        /// Writes raw pointers and items behind the engine's back.
        fn write_raw(&self, head: Option<u64>, tail: Option<u64>, items: &[(u64, &str)]) {
            let db = Database::create(&self.path).unwrap();
            let txn = db.begin_write().unwrap();
            {
                let mut meta = txn.open_table(META).unwrap();
                let mut table = txn.open_table(ITEMS).unwrap();
                if let Some(head) = head {
                    meta.insert(HEAD_KEY, head).unwrap();
                }
                if let Some(tail) = tail {
                    meta.insert(TAIL_KEY, tail).unwrap();
                }
                for (id, value) in items {
                    let bytes = Codec::Bincode.encode(&(*value).to_string()).unwrap();
                    table.insert(*id, bytes.as_slice()).unwrap();
                }
            }
            txn.commit().unwrap();
        }
    }

    fn items(values: &[&str]) -> VecDeque<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_missing_file_is_not_created_by_fetch() {
        let fixture = TestFixture::new();
        let mut engine = fixture.engine();
        assert!(engine.fetch_all().await.unwrap().is_empty());
        assert!(!fixture.path.exists());

        engine.initialize().await.unwrap();
        assert!(fixture.path.exists());
        assert_eq!(engine.pointers().await.unwrap(), Pointers::Empty);
    }

    #[tokio::test]
    async fn test_zero_length_file_is_empty() {
        let fixture = TestFixture::new();
        std::fs::write(&fixture.path, b"").unwrap();

        let mut engine = fixture.engine();
        assert!(engine.fetch_all().await.unwrap().is_empty());
        engine.initialize().await.unwrap();
        assert!(!quarantine_path(&fixture.path).exists());
    }

    #[tokio::test]
    async fn test_ids_advance_and_restart_when_drained() {
        let fixture = TestFixture::new();
        let mut engine = fixture.engine();
        engine.initialize().await.unwrap();

        engine.add_item(&"a".to_string(), &items(&["a"])).await.unwrap();
        engine
            .add_item(&"b".to_string(), &items(&["a", "b"]))
            .await
            .unwrap();
        assert_eq!(
            engine.pointers().await.unwrap(),
            Pointers::Live { head: 1, tail: 2 }
        );

        engine.remove_item(&items(&["b"])).await.unwrap();
        assert_eq!(
            engine.pointers().await.unwrap(),
            Pointers::Live { head: 2, tail: 2 }
        );

        engine.remove_item(&items(&[])).await.unwrap();
        assert_eq!(engine.pointers().await.unwrap(), Pointers::Empty);
        assert!(fixture.path.exists());

        engine.add_item(&"c".to_string(), &items(&["c"])).await.unwrap();
        assert_eq!(
            engine.pointers().await.unwrap(),
            Pointers::Live { head: 1, tail: 1 }
        );
    }

    #[tokio::test]
    async fn test_reopen_recovers_in_order() {
        let fixture = TestFixture::new();
        {
            let mut engine = fixture.engine();
            engine.initialize().await.unwrap();
            let mut sequence = VecDeque::new();
            for value in ["x", "y", "z"] {
                sequence.push_back(value.to_string());
                engine.add_item(&value.to_string(), &sequence).await.unwrap();
            }
            sequence.pop_front();
            engine.remove_item(&sequence).await.unwrap();
        }

        let mut engine = fixture.engine();
        assert_eq!(engine.fetch_all().await.unwrap(), vec!["y", "z"]);
    }

    #[tokio::test]
    async fn test_remove_from_empty_store_fails() {
        let fixture = TestFixture::new();
        let mut engine = fixture.engine();
        engine.initialize().await.unwrap();

        let err = engine.remove_item(&items(&[])).await.unwrap_err();
        assert!(matches!(err, QueueError::EmptyStore { .. }));
    }

    #[tokio::test]
    async fn test_dangling_pointer_reads_empty_and_refuses_removal() {
        let fixture = TestFixture::new();
        fixture.write_raw(Some(3), None, &[(3, "stale"), (4, "stale")]);

        let mut engine = fixture.engine();
        assert!(engine.fetch_all().await.unwrap().is_empty());
        assert!(!quarantine_path(&fixture.path).exists());

        let err = engine.remove_item(&items(&[])).await.unwrap_err();
        assert!(matches!(err, QueueError::EmptyStore { .. }));

        engine
            .add_item(&"fresh".to_string(), &items(&["fresh"]))
            .await
            .unwrap();
        assert_eq!(
            engine.pointers().await.unwrap(),
            Pointers::Live { head: 4, tail: 4 }
        );
        drop(engine);

        assert_eq!(fixture.engine().fetch_all().await.unwrap(), vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_initialize_resets_dangling_store() {
        let fixture = TestFixture::new();
        fixture.write_raw(None, Some(9), &[(9, "stale")]);

        let mut engine = fixture.engine();
        assert!(engine.fetch_all().await.unwrap().is_empty());
        engine.initialize().await.unwrap();
        assert_eq!(engine.pointers().await.unwrap(), Pointers::Empty);
    }

    #[tokio::test]
    async fn test_hole_in_live_range_is_quarantined() {
        let fixture = TestFixture::new();
        fixture.write_raw(Some(1), Some(3), &[(1, "a"), (3, "c")]);

        let mut engine = fixture.engine();
        assert!(engine.fetch_all().await.unwrap().is_empty());
        assert!(quarantine_path(&fixture.path).exists());
        assert!(!fixture.path.exists());

        engine.initialize().await.unwrap();
        engine.add_item(&"new".to_string(), &items(&["new"])).await.unwrap();
        drop(engine);
        assert_eq!(fixture.engine().fetch_all().await.unwrap(), vec!["new"]);
    }

    #[tokio::test]
    async fn test_garbage_file_is_quarantined() {
        let fixture = TestFixture::new();
        let garbage = vec![0xAB; 64 * 1024];
        std::fs::write(&fixture.path, &garbage).unwrap();

        let mut engine = fixture.engine();
        assert!(engine.fetch_all().await.unwrap().is_empty());
        assert_eq!(std::fs::read(quarantine_path(&fixture.path)).unwrap(), garbage);
    }

    #[tokio::test]
    async fn test_save_all_replaces_contents() {
        let fixture = TestFixture::new();
        let mut engine = fixture.engine();
        engine.initialize().await.unwrap();
        engine.add_item(&"old".to_string(), &items(&["old"])).await.unwrap();

        engine.save_all(&items(&["p", "q"])).await.unwrap();
        assert_eq!(
            engine.pointers().await.unwrap(),
            Pointers::Live { head: 1, tail: 2 }
        );
        drop(engine);
        assert_eq!(fixture.engine().fetch_all().await.unwrap(), vec!["p", "q"]);
    }
}

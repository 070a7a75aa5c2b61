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

//! Storage engines persisting the item sequence of one queue.
//!
//! Every engine owns exactly one backing store and is only ever driven by the
//! [`Queue`](crate::Queue) holding it, always under the queue lock. Engines
//! therefore take `&mut self` and need no synchronisation of their own.
//!
//! | engine | append | remove head | file on empty |
//! |--------|--------|-------------|---------------|
//! | [`SnapshotEngine`] | O(n) rewrite | O(n) rewrite | deleted |
//! | [`AppendLogEngine`] | O(1) append | O(n) rewrite | deleted |
//! | [`IndexedEngine`] | O(1) insert | O(1) delete | kept |

mod append_log;
mod indexed;
mod snapshot;

use std::{collections::VecDeque, path::Path};

pub use append_log::AppendLogEngine;
use async_trait::async_trait;
pub use indexed::IndexedEngine;
use serde::{Deserialize, Serialize};
pub use snapshot::SnapshotEngine;

use crate::{Codec, Item, Result};

/// Persistence contract of a FIFO queue.
///
/// `items` arguments always carry the full logical sequence *after* the
/// mutation, so snapshot-style engines can rewrite it while log-style engines
/// ignore it.
#[async_trait]
pub trait StorageEngine<T: Item>: Send + Sync {
    /// Leaves the backing store in a valid, empty state. Idempotent.
    async fn initialize(&mut self) -> Result<()>;

    /// Every persisted item in FIFO order.
    ///
    /// A missing store yields an empty sequence. An unreadable store is
    /// quarantined and also yields an empty sequence; only failures to reach
    /// the store are returned as errors.
    async fn fetch_all(&mut self) -> Result<Vec<T>>;

    /// Durably appends `item`, the last element of `items`.
    async fn add_item(&mut self, item: &T, items: &VecDeque<T>) -> Result<()>;

    /// Durably removes the head item; `items` is what remains.
    ///
    /// Fails with `EmptyStore` if the store holds nothing.
    async fn remove_item(&mut self, items: &VecDeque<T>) -> Result<()>;

    /// Durably replaces the whole persisted sequence with `items`.
    async fn save_all(&mut self, items: &VecDeque<T>) -> Result<()>;

    /// Whether `add_item`/`remove_item` are cheaper than `save_all`.
    fn can_append(&self) -> bool;

    fn kind(&self) -> EngineKind;

    fn path(&self) -> &Path;
}

/// Selects the storage engine of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// One serialized sequence, rewritten on every mutation.
    Snapshot,
    /// Independently framed items appended to one file.
    AppendLog,
    /// Items keyed by id in a redb database with head/tail pointers.
    #[default]
    Indexed,
}

impl EngineKind {
    /// Creates the engine for the data file at `path`.
    ///
    /// Nothing is touched on disk until the engine is first used.
    pub fn open<T: Item>(self, path: &Path, codec: Codec) -> Box<dyn StorageEngine<T>> {
        match self {
            Self::Snapshot => Box::new(SnapshotEngine::new(path, codec)),
            Self::AppendLog => Box::new(AppendLogEngine::new(path, codec)),
            Self::Indexed => Box::new(IndexedEngine::new(path, codec)),
        }
    }

    /// Whether an empty queue is represented by the absence of its data file.
    #[must_use]
    pub const fn deletes_when_empty(self) -> bool {
        matches!(self, Self::Snapshot | Self::AppendLog)
    }
}

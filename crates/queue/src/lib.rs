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

//! Crash-durable FIFO queue for async Rust.
//!
//! A [`Queue`] persists every item to a single data file before `put`
//! returns, and recovers the persisted items when it is opened again. The
//! on-disk layout is chosen per queue through [`EngineKind`]:
//!
//! - [`EngineKind::Snapshot`]: one serialized sequence, rewritten per change.
//! - [`EngineKind::AppendLog`]: independently framed, checksummed items.
//! - [`EngineKind::Indexed`]: items keyed by id in a redb database.
//!
//! A data file that cannot be read is moved aside to `<file name>.bak` and
//! the queue starts empty.

pub mod builder;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
mod frame;
pub mod metrics;
pub mod path;
mod queue;
mod recovery;

pub use builder::QueueBuilder;
pub use codec::{Codec, Item};
pub use config::QueueConfig;
pub use engine::{AppendLogEngine, EngineKind, IndexedEngine, SnapshotEngine, StorageEngine};
pub use error::{QueueError, Result};
pub use queue::Queue;

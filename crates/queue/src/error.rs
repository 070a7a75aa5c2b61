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

use std::{io, path::PathBuf};

use snafu::Snafu;

/// Queue operation errors.
///
/// `Empty` and `Full` are ordinary flow-control signals of the non-blocking
/// operations. `TaskDoneUnderflow`, `InvalidPath` and `EmptyStore` point at a
/// caller bug. Everything else is a persistence failure and is propagated
/// without retry.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueueError {
    /// No item is immediately available.
    #[snafu(display("Queue is empty"))]
    Empty {
        #[snafu(implicit)]
        loc: snafu::Location,
    },

    /// The queue holds `maxsize` items.
    #[snafu(display("Queue is full"))]
    Full {
        #[snafu(implicit)]
        loc: snafu::Location,
    },

    /// `task_done` was called more often than items were put.
    #[snafu(display("task_done() called too many times"))]
    TaskDoneUnderflow {
        #[snafu(implicit)]
        loc: snafu::Location,
    },

    /// The data file path cannot be used for a queue.
    #[snafu(display("Invalid data file path {}: {reason}", path.display()))]
    InvalidPath {
        path:   PathBuf,
        reason: String,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// An engine was asked to remove the head of an empty store.
    #[snafu(display("Nothing to remove from empty store {}", path.display()))]
    EmptyStore {
        path: PathBuf,
        #[snafu(implicit)]
        loc:  snafu::Location,
    },

    /// Filesystem I/O failure.
    #[snafu(display("IO error on {}: {source}", path.display()))]
    Io {
        path:   PathBuf,
        source: io::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Failed to encode item with bincode: {source}"))]
    BincodeEncode {
        source: bincode::error::EncodeError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Failed to decode item with bincode: {source}"))]
    BincodeDecode {
        source: bincode::error::DecodeError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("JSON codec error: {source}"))]
    Json {
        source: serde_json::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// A decoded payload did not consume every byte of its frame.
    #[snafu(display("Decoded {consumed} of {len} payload bytes"))]
    TrailingBytes {
        consumed: usize,
        len:      usize,
        #[snafu(implicit)]
        loc:      snafu::Location,
    },

    /// A single encoded item does not fit the 32-bit frame length.
    #[snafu(display("Encoded item of {len} bytes exceeds the frame limit"))]
    ItemTooLarge {
        len: usize,
        #[snafu(implicit)]
        loc: snafu::Location,
    },

    /// The persisted store cannot be parsed.
    ///
    /// Engines never return this from `fetch_all`; they quarantine the store
    /// instead.
    #[snafu(display("Data file {} is corrupt: {reason}", path.display()))]
    Corrupted {
        path:   PathBuf,
        reason: String,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// Indexed store (redb) failure.
    #[snafu(display("Indexed store error: {source}"))]
    Storage {
        source: redb::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// A storage task panicked or was cancelled.
    #[snafu(display("Storage task failed: {source}"))]
    BlockingTask {
        source: tokio::task::JoinError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },
}

impl QueueError {
    /// Returns `true` for the `Empty` condition of `get_nowait`.
    #[must_use]
    pub const fn is_empty(&self) -> bool { matches!(self, Self::Empty { .. }) }

    /// Returns `true` for the `Full` condition of `put_nowait`.
    #[must_use]
    pub const fn is_full(&self) -> bool { matches!(self, Self::Full { .. }) }

    /// Whether this error means the persisted bytes are unreadable, as opposed
    /// to the storage being unreachable.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corrupted { .. }
                | Self::BincodeDecode { .. }
                | Self::Json { .. }
                | Self::TrailingBytes { .. }
                | Self::Storage {
                    source: redb::Error::Corrupted(_),
                    ..
                }
        )
    }
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use snafu::IntoError;

    use super::*;

    #[test]
    fn test_flow_control_predicates() {
        let empty = EmptySnafu.build();
        assert!(empty.is_empty());
        assert!(!empty.is_full());
        assert!(!empty.is_corruption());

        let full = FullSnafu.build();
        assert!(full.is_full());
        assert!(!full.is_empty());
    }

    #[test]
    fn test_corruption_classification() {
        let corrupted = CorruptedSnafu {
            path:   "/tmp/q.dat",
            reason: "bad magic",
        }
        .build();
        assert!(corrupted.is_corruption());
        assert!(corrupted.to_string().contains("bad magic"));

        let io = IoSnafu { path: "/tmp/q.dat" }
            .into_error(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!io.is_corruption());
    }
}

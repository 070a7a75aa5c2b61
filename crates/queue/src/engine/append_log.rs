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

//! Append-only log of individually framed items.
//!
//! Enqueue appends one frame and fsyncs. Dequeue has to drop bytes from the
//! front of the file, so it rewrites the remaining frames the same way the
//! snapshot engine does.
//!
//! On recovery a frame that runs past the end of the file is a write torn by a
//! crash; it was never acknowledged, so the file is truncated back to the last
//! complete frame. Anything else that fails to parse makes the whole file
//! corrupt.

use std::{
    collections::VecDeque,
    marker::PhantomData,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use snafu::{ResultExt, ensure};
use tokio::{fs::OpenOptions, io::AsyncWriteExt};
use tracing::{debug, trace, warn};

use super::{EngineKind, StorageEngine};
use crate::{
    Codec, Item, Result,
    error::{CorruptedSnafu, EmptyStoreSnafu, IoSnafu},
    frame::{LOG_MAGIC, MAGIC_SIZE, ScanOutcome, encode_frame, scan_frames, strip_magic},
    path::{read_if_exists, remove_if_exists, write_atomically},
    recovery::quarantine,
};

/// Stores the queue as a sequence of independently framed items.
pub struct AppendLogEngine<T> {
    path:          PathBuf,
    codec:         Codec,
    /// Number of complete frames in the file.
    persisted_len: usize,
    /// Length of the file up to the end of the last complete frame.
    file_len:      u64,
    _item:         PhantomData<fn() -> T>,
}

impl<T: Item> AppendLogEngine<T> {
    pub fn new<P: Into<PathBuf>>(path: P, codec: Codec) -> Self {
        Self {
            path: path.into(),
            codec,
            persisted_len: 0,
            file_len: 0,
            _item: PhantomData,
        }
    }

    fn encode_log<'a, I>(&self, items: I) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = &'a T>,
    {
        let mut buf = LOG_MAGIC.to_vec();
        for item in items {
            let payload = self.codec.encode(item)?;
            encode_frame(&payload, &mut buf)?;
        }
        Ok(buf)
    }

    /// Reads the log, truncating a torn final frame in place.
    async fn read_items(&mut self) -> Result<Vec<T>> {
        self.file_len = 0;
        let Some(bytes) = read_if_exists(&self.path).await? else {
            return Ok(Vec::new());
        };

        let body = strip_magic(&bytes, LOG_MAGIC).map_err(|reason| {
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
        let items = scanned
            .payloads
            .iter()
            .map(|payload| self.codec.decode(payload))
            .collect::<Result<Vec<T>>>()?;

        let valid_len = match scanned.outcome {
            ScanOutcome::Clean => bytes.len(),
            ScanOutcome::TornTail { valid_len } => {
                let valid_len = MAGIC_SIZE + valid_len;
                warn!(
                    path = ?self.path,
                    items = items.len(),
                    valid_len,
                    file_len = bytes.len(),
                    "Truncating torn frame at end of data file"
                );
                self.truncate_to(valid_len as u64).await?;
                valid_len
            }
        };
        self.file_len = valid_len as u64;
        Ok(items)
    }

    async fn truncate_to(&self, len: u64) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .context(IoSnafu { path: &self.path })?;
        file.set_len(len)
            .await
            .context(IoSnafu { path: &self.path })?;
        file.sync_all().await.context(IoSnafu { path: &self.path })
    }

    async fn append_frame(&self, frame: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .context(IoSnafu { path: &self.path })?;
        file.write_all(frame)
            .await
            .context(IoSnafu { path: &self.path })?;
        file.sync_data().await.context(IoSnafu { path: &self.path })
    }
}

#[async_trait]
impl<T: Item> StorageEngine<T> for AppendLogEngine<T> {
    async fn initialize(&mut self) -> Result<()> {
        write_atomically(&self.path, LOG_MAGIC).await?;
        self.persisted_len = 0;
        self.file_len = MAGIC_SIZE as u64;
        Ok(())
    }

    async fn fetch_all(&mut self) -> Result<Vec<T>> {
        let items = match self.read_items().await {
            Ok(items) => items,
            Err(err) if err.is_corruption() => {
                quarantine(&self.path, &err).await?;
                self.file_len = 0;
                Vec::new()
            }
            Err(err) => return Err(err),
        };
        self.persisted_len = items.len();
        Ok(items)
    }

    async fn add_item(&mut self, item: &T, items: &VecDeque<T>) -> Result<()> {
        if self.persisted_len == 0 {
            // Start a fresh file; whatever is on disk holds no live frames.
            let bytes = self.encode_log([item])?;
            write_atomically(&self.path, &bytes).await?;
            self.file_len = bytes.len() as u64;
        } else {
            let mut frame = Vec::new();
            encode_frame(&self.codec.encode(item)?, &mut frame)?;
            if let Err(err) = self.append_frame(&frame).await {
                // Drop a partially written frame so later appends stay
                // readable.
                if let Err(rollback) = self.truncate_to(self.file_len).await {
                    warn!(path = ?self.path, error = %rollback, "Failed to roll back partial append");
                }
                return Err(err);
            }
            self.file_len += frame.len() as u64;
        }
        self.persisted_len += 1;
        trace!(path = ?self.path, items = items.len(), "Appended item to log");
        Ok(())
    }

    async fn remove_item(&mut self, items: &VecDeque<T>) -> Result<()> {
        ensure!(self.persisted_len > 0, EmptyStoreSnafu { path: &self.path });
        self.save_all(items).await
    }

    async fn save_all(&mut self, items: &VecDeque<T>) -> Result<()> {
        if items.is_empty() {
            remove_if_exists(&self.path).await?;
            self.file_len = 0;
        } else {
            let bytes = self.encode_log(items)?;
            write_atomically(&self.path, &bytes).await?;
            self.file_len = bytes.len() as u64;
        }
        self.persisted_len = items.len();
        debug!(path = ?self.path, items = items.len(), "Rewrote queue log");
        Ok(())
    }

    fn can_append(&self) -> bool { true }

    fn kind(&self) -> EngineKind { EngineKind::AppendLog }

    fn path(&self) -> &Path { &self.path }
}

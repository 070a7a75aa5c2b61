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

use std::path::PathBuf;

use crate::{Codec, EngineKind, Item, Queue, QueueConfig, Result};

pub struct QueueBuilder {
    config: QueueConfig,
}

impl QueueBuilder {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config: QueueConfig {
                path: path.into(),
                ..Default::default()
            },
        }
    }

    #[must_use]
    pub fn from_config(config: QueueConfig) -> Self { Self { config } }

    /// Capacity bound; 0 means unbounded.
    #[must_use]
    pub fn maxsize(mut self, maxsize: usize) -> Self {
        self.config.maxsize = maxsize;
        self
    }

    #[must_use]
    pub fn engine(mut self, engine: EngineKind) -> Self {
        self.config.engine = engine;
        self
    }

    #[must_use]
    pub fn codec(mut self, codec: Codec) -> Self {
        self.config.codec = codec;
        self
    }

    /// Opens the queue, recovering whatever its data file holds.
    pub async fn build<T: Item>(self) -> Result<Queue<T>> { Queue::open(self.config).await }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_default_config() {
        let builder = QueueBuilder::new("/tmp/test_queue.db");
        assert_eq!(builder.config.path, PathBuf::from("/tmp/test_queue.db"));
        assert_eq!(builder.config.maxsize, 0);
        assert_eq!(builder.config.engine, EngineKind::Indexed);
        assert_eq!(builder.config.codec, Codec::Bincode);
    }

    #[test]
    fn test_builder_custom_config() {
        let builder = QueueBuilder::new("/tmp/test_queue.log")
            .maxsize(16)
            .engine(EngineKind::AppendLog)
            .codec(Codec::Json);

        assert_eq!(builder.config.maxsize, 16);
        assert_eq!(builder.config.engine, EngineKind::AppendLog);
        assert_eq!(builder.config.codec, Codec::Json);
    }

    #[test]
    fn test_builder_from_config_keeps_overrides() {
        let config = QueueConfig {
            maxsize: 3,
            engine: EngineKind::Snapshot,
            ..Default::default()
        };
        let builder = QueueBuilder::from_config(config.clone()).codec(Codec::Json);
        assert_eq!(builder.config.maxsize, 3);
        assert_eq!(builder.config.engine, EngineKind::Snapshot);
        assert_eq!(builder.config.path, config.path);
        assert_eq!(builder.config.codec, Codec::Json);
    }
}

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

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

use crate::{Codec, EngineKind};

#[derive(Debug, Clone, PartialEq, Eq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Data file of the queue. Its extension must not be `bak` or `tmp`.
    #[default(PathBuf::from("./queue_data/queue.db"))]
    pub path:    PathBuf,
    /// Capacity bound; 0 means unbounded.
    #[default = 0]
    pub maxsize: usize,
    pub engine:  EngineKind,
    pub codec:   Codec,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.maxsize, 0);
        assert_eq!(config.engine, EngineKind::Indexed);
        assert_eq!(config.codec, Codec::Bincode);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: QueueConfig =
            serde_json::from_str(r#"{"path": "/var/lib/jobs.log", "engine": "append_log"}"#)
                .unwrap();
        assert_eq!(config.path, PathBuf::from("/var/lib/jobs.log"));
        assert_eq!(config.engine, EngineKind::AppendLog);
        assert_eq!(config.maxsize, 0);
        assert_eq!(config.codec, Codec::Bincode);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = QueueConfig {
            path:    PathBuf::from("/tmp/q.dat"),
            maxsize: 8,
            engine:  EngineKind::Snapshot,
            codec:   Codec::Json,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<QueueConfig>(&json).unwrap(), config);
    }
}

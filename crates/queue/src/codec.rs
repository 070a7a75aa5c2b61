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

//! Serialization boundary between queue items and stored bytes.
//!
//! Storage engines are the only users of [`Codec`]. The queue core moves
//! typed items around and never looks at their bytes.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use snafu::{ResultExt, ensure};

use crate::{
    Result,
    error::{BincodeDecodeSnafu, BincodeEncodeSnafu, JsonSnafu, TrailingBytesSnafu},
};

/// Anything a queue can hold.
///
/// Implemented for every type that serializes losslessly through serde and
/// can move between tasks.
pub trait Item: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Item for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Byte representation used for persisted items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// Compact binary encoding via bincode's serde bridge.
    #[default]
    Bincode,
    /// Self-describing JSON, handy for inspecting data files by hand.
    Json,
}

impl Codec {
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Bincode => bincode::serde::encode_to_vec(value, bincode::config::standard())
                .context(BincodeEncodeSnafu),
            Self::Json => serde_json::to_vec(value).context(JsonSnafu),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Bincode => {
                let (value, consumed) =
                    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                        .context(BincodeDecodeSnafu)?;
                ensure!(
                    consumed == bytes.len(),
                    TrailingBytesSnafu {
                        consumed,
                        len: bytes.len(),
                    }
                );
                Ok(value)
            }
            Self::Json => serde_json::from_slice(bytes).context(JsonSnafu),
        }
    }
}

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

//! On-disk framing shared by the file-backed engines.
//!
//! A data file starts with an 8-byte magic header naming the engine that wrote
//! it, followed by frames:
//!
//! ```text
//! ┌─────────────────┬──────────────────────┬─────────────────┐
//! │  Length (4B)    │   Payload (variable) │   CRC32 (4B)    │
//! │  little-endian  │   codec bytes        │   little-endian │
//! └─────────────────┴──────────────────────┴─────────────────┘
//! ```
//!
//! The CRC covers the length field and the payload, so a flipped length is
//! caught as well as a flipped payload byte. A frame that runs past the end of
//! the buffer is reported as a torn tail rather than as corruption: it is what
//! a crash in the middle of an append leaves behind.

use crc32fast::Hasher;

use crate::{Result, error::ItemTooLargeSnafu};

pub(crate) const MAGIC_SIZE: usize = 8;

/// Header of a snapshot data file.
pub(crate) const SNAPSHOT_MAGIC: &[u8; MAGIC_SIZE] = b"DQSNAP01";

/// Header of an append-log data file.
pub(crate) const LOG_MAGIC: &[u8; MAGIC_SIZE] = b"DQLOG001";

pub(crate) const FRAME_LENGTH_SIZE: usize = 4;

pub(crate) const FRAME_CRC_SIZE: usize = 4;

/// Total on-disk size of a frame carrying `payload_len` bytes.
#[inline]
pub(crate) const fn frame_size(payload_len: usize) -> usize {
    FRAME_LENGTH_SIZE + payload_len + FRAME_CRC_SIZE
}

#[inline]
pub(crate) fn frame_crc(length: u32, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&length.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Appends one frame carrying `payload` to `out`.
pub(crate) fn encode_frame(payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let len = payload.len();
    let Ok(length) = u32::try_from(len) else {
        return ItemTooLargeSnafu { len }.fail();
    };

    out.reserve(frame_size(len));
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&frame_crc(length, payload).to_le_bytes());
    Ok(())
}

/// Checks the magic header and returns the bytes after it.
///
/// `Ok(None)` means the buffer is a strict prefix of the header (including
/// the empty buffer): the file was created but its header never fully
/// reached the disk, which is equivalent to an empty store.
pub(crate) fn strip_magic<'a>(
    buf: &'a [u8],
    magic: &[u8; MAGIC_SIZE],
) -> std::result::Result<Option<&'a [u8]>, String> {
    if buf.len() < MAGIC_SIZE {
        return if magic.starts_with(buf) {
            Ok(None)
        } else {
            Err(format!("truncated header of {} bytes", buf.len()))
        };
    }

    let (header, body) = buf.split_at(MAGIC_SIZE);
    if header == magic {
        Ok(Some(body))
    } else {
        Err(format!(
            "bad magic header {:?}, expected {:?}",
            String::from_utf8_lossy(header),
            String::from_utf8_lossy(magic)
        ))
    }
}

/// Whether a scan consumed the whole buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanOutcome {
    Clean,
    /// The buffer ends inside a frame; only `valid_len` bytes hold complete
    /// frames.
    TornTail { valid_len: usize },
}

#[derive(Debug)]
pub(crate) struct ScannedFrames<'a> {
    pub payloads: Vec<&'a [u8]>,
    pub outcome:  ScanOutcome,
}

/// Splits `buf` into frame payloads, verifying every checksum.
///
/// Fails with a human-readable reason on the first checksum mismatch.
pub(crate) fn scan_frames(buf: &[u8]) -> std::result::Result<ScannedFrames<'_>, String> {
    let mut payloads = Vec::new();
    let mut position = 0usize;

    while position < buf.len() {
        let rest = &buf[position..];
        if rest.len() < FRAME_LENGTH_SIZE {
            return Ok(ScannedFrames {
                payloads,
                outcome: ScanOutcome::TornTail {
                    valid_len: position,
                },
            });
        }

        let mut length_buf = [0u8; FRAME_LENGTH_SIZE];
        length_buf.copy_from_slice(&rest[..FRAME_LENGTH_SIZE]);
        let length = u32::from_le_bytes(length_buf);
        let total = frame_size(length as usize);

        if rest.len() < total {
            return Ok(ScannedFrames {
                payloads,
                outcome: ScanOutcome::TornTail {
                    valid_len: position,
                },
            });
        }

        let payload = &rest[FRAME_LENGTH_SIZE..FRAME_LENGTH_SIZE + length as usize];
        let mut crc_buf = [0u8; FRAME_CRC_SIZE];
        crc_buf.copy_from_slice(&rest[FRAME_LENGTH_SIZE + length as usize..total]);
        let stored = u32::from_le_bytes(crc_buf);

        if frame_crc(length, payload) != stored {
            return Err(format!(
                "checksum mismatch in frame {} at offset {position}",
                payloads.len()
            ));
        }

        payloads.push(payload);
        position += total;
    }

    Ok(ScannedFrames {
        payloads,
        outcome: ScanOutcome::Clean,
    })
}

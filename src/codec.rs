//! Payload compression
//!
//! Every stored payload is a single zstd frame. The empty payload is stored
//! as zero bytes rather than as an empty frame.

use crate::{Error, Result};

/// Default zstd level
pub const DEFAULT_LEVEL: i32 = 3;

/// Stateless zstd codec
#[derive(Clone, Copy, Debug)]
pub struct Codec {
    level: i32,
}

impl Default for Codec {
    fn default() -> Self {
        Codec::new(DEFAULT_LEVEL)
    }
}

impl Codec {
    pub fn new(level: i32) -> Self {
        Codec { level }
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    /// Compress a payload for storage
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        zstd::bulk::compress(data, self.level).map_err(|e| Error::Codec(e.to_string()))
    }

    /// Decompress a stored payload, checking it against its declared length
    pub fn decompress(&self, stored: &[u8], original_len: usize) -> Result<Vec<u8>> {
        if stored.is_empty() {
            return if original_len == 0 {
                Ok(Vec::new())
            } else {
                Err(Error::Codec(format!(
                    "empty stored payload, expected {} bytes",
                    original_len
                )))
            };
        }

        let data = zstd::bulk::decompress(stored, original_len)
            .map_err(|e| Error::Codec(e.to_string()))?;
        if data.len() != original_len {
            return Err(Error::Codec(format!(
                "length mismatch: declared {}, decoded {}",
                original_len,
                data.len()
            )));
        }
        Ok(data)
    }
}

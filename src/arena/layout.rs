//! On-disk layout of an arena file
//!
//! ```text
//! [HEADER: 64 bytes]
//!   - magic: 8 bytes ("INSTADB\0")
//!   - version: 4 bytes (u32 LE)
//!   - flags: 4 bytes
//!   - capacity: 8 bytes (u64 LE, total file size)
//!   - head: 8 bytes (u64 LE, logical offset of the oldest live record)
//!   - tail: 8 bytes (u64 LE, logical write cursor)
//!   - generation: 8 bytes (u64 LE, bumped on every commit)
//!   - records: 8 bytes (u64 LE, live record count)
//!   - image_id: 8 bytes (u64 LE, random per created image, copied by resync)
//!
//! [REGION: capacity - 64, rounded down to 8]
//!   - records, addressed by logical offset modulo the region length
//! ```
//!
//! Each record starts with a 64-byte header:
//!
//! ```text
//!   - magic: 4 bytes ("IDBR")
//!   - kind: 1 byte
//!   - reserved: 3 bytes
//!   - length: 4 bytes (u32 LE, whole record, 8-aligned)
//!   - crc32: 4 bytes (u32 LE, over key and stored bytes)
//!   - id: 32 bytes (content digest or key hash)
//!   - key_len: 4 bytes
//!   - original_len: 4 bytes
//!   - stored_len: 4 bytes
//!   - reserved: 4 bytes
//! ```

use crate::{Error, Result};

pub const MAGIC: &[u8; 8] = b"INSTADB\0";
pub const VERSION: u32 = 1;

pub const HEADER_LEN: u64 = 64;
pub const RECORD_HEADER_LEN: u64 = 64;
pub const RECORD_MAGIC: &[u8; 4] = b"IDBR";

/// Smallest arena we agree to create
pub const MIN_CAPACITY: u64 = 256;

/// Byte offset of the mutable state fields inside the header
pub const STATE_OFFSET: usize = 24;

/// Byte offset of the generation counter inside the header
pub const GENERATION_OFFSET: usize = 40;

/// Round `n` up to the record alignment
pub fn align(n: u64) -> u64 {
    (n + 7) & !7
}

/// Total encoded length of a record with the given key and payload sizes
pub fn record_len(key_len: usize, stored_len: usize) -> u64 {
    align(RECORD_HEADER_LEN + key_len as u64 + stored_len as u64)
}

/// Mutable bookkeeping of an arena, mirrored in its header
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArenaState {
    pub head: u64,
    pub tail: u64,
    pub generation: u64,
    pub records: u64,
}

impl ArenaState {
    /// Bytes currently occupied by live records and skips
    pub fn used(&self) -> u64 {
        self.tail - self.head
    }

    /// Header bytes from `STATE_OFFSET` on: head, tail, generation, records
    pub fn encode(&self) -> [u8; 32] {
        let mut buf = [0u8; 32];
        buf[0..8].copy_from_slice(&self.head.to_le_bytes());
        buf[8..16].copy_from_slice(&self.tail.to_le_bytes());
        buf[16..24].copy_from_slice(&self.generation.to_le_bytes());
        buf[24..32].copy_from_slice(&self.records.to_le_bytes());
        buf
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaHeader {
    pub capacity: u64,
    /// Identifies the image a file holds. Two files share it only when one
    /// was copied from the other.
    pub image_id: u64,
    pub state: ArenaState,
}

impl ArenaHeader {
    pub fn new(capacity: u64, image_id: u64) -> Self {
        ArenaHeader {
            capacity,
            image_id,
            state: ArenaState::default(),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN as usize] {
        let mut buf = [0u8; HEADER_LEN as usize];
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..12].copy_from_slice(&VERSION.to_le_bytes());
        // flags: 0
        buf[16..24].copy_from_slice(&self.capacity.to_le_bytes());
        buf[STATE_OFFSET..STATE_OFFSET + 32].copy_from_slice(&self.state.encode());
        buf[56..64].copy_from_slice(&self.image_id.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN as usize {
            return Err(Error::Init("Truncated arena header".into()));
        }
        if &buf[0..8] != MAGIC {
            return Err(Error::Init("Invalid magic bytes".into()));
        }
        let version = read_u32(buf, 8);
        if version != VERSION {
            return Err(Error::Init(format!(
                "Unsupported arena version {}, expected {}",
                version, VERSION
            )));
        }
        let header = ArenaHeader {
            capacity: read_u64(buf, 16),
            image_id: read_u64(buf, 56),
            state: ArenaState {
                head: read_u64(buf, 24),
                tail: read_u64(buf, 32),
                generation: read_u64(buf, 40),
                records: read_u64(buf, 48),
            },
        };
        if header.state.head > header.state.tail {
            return Err(Error::Init(format!(
                "Arena head {} is past tail {}",
                header.state.head, header.state.tail
            )));
        }
        Ok(header)
    }
}

/// Type tag for records
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    /// A content object, identified by its digest
    Object,
    /// An association, identified by the hash of its key
    Association,
    /// Skipped space before a wrap
    Padding,
}

impl RecordKind {
    pub fn as_byte(&self) -> u8 {
        match self {
            RecordKind::Object => 1,
            RecordKind::Association => 2,
            RecordKind::Padding => 3,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(RecordKind::Object),
            2 => Some(RecordKind::Association),
            3 => Some(RecordKind::Padding),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: RecordKind,
    pub length: u32,
    pub crc: u32,
    pub id: [u8; 32],
    pub key_len: u32,
    pub original_len: u32,
    pub stored_len: u32,
}

impl RecordHeader {
    pub fn padding(length: u64) -> Self {
        RecordHeader {
            kind: RecordKind::Padding,
            length: length as u32,
            crc: 0,
            id: [0u8; 32],
            key_len: 0,
            original_len: 0,
            stored_len: 0,
        }
    }

    pub fn encode(&self) -> [u8; RECORD_HEADER_LEN as usize] {
        let mut buf = [0u8; RECORD_HEADER_LEN as usize];
        buf[0..4].copy_from_slice(RECORD_MAGIC);
        buf[4] = self.kind.as_byte();
        buf[8..12].copy_from_slice(&self.length.to_le_bytes());
        buf[12..16].copy_from_slice(&self.crc.to_le_bytes());
        buf[16..48].copy_from_slice(&self.id);
        buf[48..52].copy_from_slice(&self.key_len.to_le_bytes());
        buf[52..56].copy_from_slice(&self.original_len.to_le_bytes());
        buf[56..60].copy_from_slice(&self.stored_len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RECORD_HEADER_LEN as usize || &buf[0..4] != RECORD_MAGIC {
            return Err(Error::Corruption("Missing record magic".into()));
        }
        let kind = RecordKind::from_byte(buf[4])
            .ok_or_else(|| Error::Corruption(format!("Invalid record kind: {}", buf[4])))?;
        let mut id = [0u8; 32];
        id.copy_from_slice(&buf[16..48]);
        let header = RecordHeader {
            kind,
            length: read_u32(buf, 8),
            crc: read_u32(buf, 12),
            id,
            key_len: read_u32(buf, 48),
            original_len: read_u32(buf, 52),
            stored_len: read_u32(buf, 56),
        };

        let min_len = match kind {
            RecordKind::Padding => RECORD_HEADER_LEN,
            _ => record_len(header.key_len as usize, header.stored_len as usize),
        };
        if (header.length as u64) < min_len || header.length % 8 != 0 {
            return Err(Error::Corruption(format!(
                "Invalid record length {}",
                header.length
            )));
        }
        Ok(header)
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

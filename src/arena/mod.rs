//! Fixed-capacity, memory-mapped storage file
//!
//! An arena is an append log laid over a ring: records are written at a
//! monotonic logical cursor and live at `HEADER_LEN + offset % region`.
//! When a new record would overrun the region, the oldest records are
//! evicted first. The arena only plans and performs byte-level writes; the
//! indexes over it live in [`crate::volume::Volume`].

mod layout;
mod lock;

pub use layout::{
    record_len, ArenaHeader, ArenaState, RecordHeader, RecordKind, HEADER_LEN, MAGIC,
    MIN_CAPACITY, RECORD_HEADER_LEN, VERSION,
};
pub use lock::FileLock;

use crate::{Error, Result};
use layout::{GENERATION_OFFSET, STATE_OFFSET};
use memmap2::{MmapOptions, MmapRaw};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Bytes moved per step when mirroring a whole image
const COPY_CHUNK: usize = 1 << 20;

/// A record copied out of an arena
#[derive(Clone, Debug)]
pub struct Record {
    pub offset: u64,
    pub kind: RecordKind,
    pub id: [u8; 32],
    pub key: Vec<u8>,
    pub original_len: u32,
    pub stored: Vec<u8>,
}

/// A record dropped by an allocation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Evicted {
    pub offset: u64,
    pub kind: RecordKind,
    pub id: [u8; 32],
}

/// Where the next record goes and what it costs
#[derive(Clone, Debug)]
pub struct Placement {
    /// Logical offset of the new record
    pub offset: u64,
    /// Encoded record length
    pub len: u64,
    /// State the plan was computed against
    pub before: ArenaState,
    /// State once the record is written
    pub after: ArenaState,
    /// Records that must go to make room, oldest first
    pub evicted: Vec<Evicted>,
}

impl Placement {
    /// Bytes skipped at the old tail so the record does not straddle the wrap
    pub fn skipped(&self) -> u64 {
        self.offset - self.before.tail
    }
}

/// Bytes overwritten by an [`Arena::apply`], restorable with [`Arena::revert`]
#[derive(Debug)]
pub struct Undo {
    ranges: Vec<(usize, Vec<u8>)>,
}

/// A single storage file
pub struct Arena {
    path: PathBuf,
    file: File,
    map: MmapRaw,
    capacity: u64,
    region: u64,
    writable: bool,
}

impl Arena {
    /// Open a writable arena, creating it at `capacity` bytes if absent
    pub fn open(path: impl AsRef<Path>, capacity: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if capacity < MIN_CAPACITY {
            return Err(Error::Init(format!(
                "Capacity {} is below the minimum of {} bytes",
                capacity, MIN_CAPACITY
            )));
        }
        if usize::try_from(capacity).is_err() {
            return Err(Error::Init(format!("Capacity {} cannot be mapped", capacity)));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::Init(format!("Could not open '{}': {}", path.display(), e)))?;

        let fresh = {
            let _lock = FileLock::exclusive(&file)?;
            let len = file.metadata()?.len();
            let existing = read_existing_header(&file, len, &path)?;

            match existing {
                Some(header) => {
                    if header.capacity != capacity {
                        return Err(Error::Init(format!(
                            "'{}' was created with capacity {}, configured size is {}",
                            path.display(),
                            header.capacity,
                            capacity
                        )));
                    }
                    if len < capacity {
                        return Err(Error::Init(format!(
                            "'{}' is truncated: {} of {} bytes",
                            path.display(),
                            len,
                            capacity
                        )));
                    }
                    false
                }
                None => {
                    file.set_len(capacity).map_err(|e| {
                        Error::Init(format!("Could not size '{}': {}", path.display(), e))
                    })?;
                    true
                }
            }
        };

        let map = MmapOptions::new()
            .len(capacity as usize)
            .map_raw(&file)
            .map_err(|e| Error::Init(format!("Could not map '{}': {}", path.display(), e)))?;

        let arena = Arena {
            path,
            file,
            map,
            capacity,
            region: region_len(capacity),
            writable: true,
        };

        if fresh {
            let _lock = arena.lock_exclusive()?;
            // Another process may have initialized it between our checks
            if arena.read_header().is_err() {
                let header = ArenaHeader::new(capacity, new_image_id(&arena.path));
                arena.write_raw(0, &header.encode())?;
            }
        }

        Ok(arena)
    }

    /// Open an existing arena for reading only; its capacity comes from its header
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new().read(true).open(&path).map_err(|e| {
            Error::Init(format!(
                "Read-only file '{}' is not readable: {}",
                path.display(),
                e
            ))
        })?;

        let len = file.metadata()?.len();
        let header = read_existing_header(&file, len, &path)?.ok_or_else(|| {
            Error::Init(format!("'{}' is not an initialized arena", path.display()))
        })?;
        if header.capacity < MIN_CAPACITY || len < header.capacity {
            return Err(Error::Init(format!(
                "'{}' is truncated: {} of {} bytes",
                path.display(),
                len,
                header.capacity
            )));
        }

        let map = MmapOptions::new()
            .len(header.capacity as usize)
            .map_raw_read_only(&file)
            .map_err(|e| Error::Init(format!("Could not map '{}': {}", path.display(), e)))?;

        Ok(Arena {
            path,
            file,
            map,
            capacity: header.capacity,
            region: region_len(header.capacity),
            writable: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total file size
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes available for records
    pub fn region_len(&self) -> u64 {
        self.region
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn read_header(&self) -> Result<ArenaHeader> {
        let mut buf = [0u8; HEADER_LEN as usize];
        self.read_raw(0, &mut buf)?;
        ArenaHeader::decode(&buf).map_err(|e| match e {
            Error::Init(msg) => Error::Corruption(msg),
            other => other,
        })
    }

    pub fn state(&self) -> Result<ArenaState> {
        Ok(self.read_header()?.state)
    }

    /// Current generation, read without locking
    pub fn generation(&self) -> u64 {
        // SAFETY: the header lies inside the mapping and the mapping is
        // page-aligned, so this 8-byte read is in bounds and aligned.
        let raw = unsafe {
            std::ptr::read_volatile(self.map.as_ptr().add(GENERATION_OFFSET) as *const u64)
        };
        u64::from_le(raw)
    }

    pub fn lock_shared(&self) -> Result<FileLock<'_>> {
        Ok(FileLock::shared(&self.file)?)
    }

    pub fn lock_exclusive(&self) -> Result<FileLock<'_>> {
        Ok(FileLock::exclusive(&self.file)?)
    }

    /// Read the record header at a logical offset
    pub fn read_record_header(&self, offset: u64) -> Result<RecordHeader> {
        let mut buf = [0u8; RECORD_HEADER_LEN as usize];
        self.read_raw(self.physical(offset), &mut buf)?;
        let header = RecordHeader::decode(&buf)
            .map_err(|e| Error::Corruption(format!("at offset {}: {}", offset, e)))?;
        if offset % self.region + header.length as u64 > self.region {
            return Err(Error::Corruption(format!(
                "Record at offset {} crosses the end of the region",
                offset
            )));
        }
        Ok(header)
    }

    /// Copy out and verify the record at a logical offset
    pub fn read_record(&self, offset: u64) -> Result<Record> {
        let header = self.read_record_header(offset)?;
        if header.kind == RecordKind::Padding {
            return Err(Error::Corruption(format!(
                "Expected a record at offset {}, found padding",
                offset
            )));
        }

        let body = self.physical(offset) + RECORD_HEADER_LEN as usize;
        let mut key = vec![0u8; header.key_len as usize];
        self.read_raw(body, &mut key)?;
        let mut stored = vec![0u8; header.stored_len as usize];
        self.read_raw(body + key.len(), &mut stored)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&key);
        hasher.update(&stored);
        if hasher.finalize() != header.crc {
            return Err(Error::Corruption(format!(
                "Checksum mismatch at offset {}",
                offset
            )));
        }

        Ok(Record {
            offset,
            kind: header.kind,
            id: header.id,
            key,
            original_len: header.original_len,
            stored,
        })
    }

    /// Visit every non-padding record header in `[from, to)`
    pub fn scan(
        &self,
        from: u64,
        to: u64,
        mut visit: impl FnMut(u64, &RecordHeader),
    ) -> Result<()> {
        let mut pos = from;
        while pos < to {
            if let Some(next) = self.wrap_skip(pos) {
                pos = next;
                continue;
            }
            let header = self.read_record_header(pos)?;
            if header.kind != RecordKind::Padding {
                visit(pos, &header);
            }
            pos += header.length as u64;
        }
        if pos != to {
            return Err(Error::Corruption(format!(
                "Scan overran tail: stopped at {}, tail is {}",
                pos, to
            )));
        }
        Ok(())
    }

    /// Decide where a record of `len` bytes goes, evicting oldest-first
    pub fn plan(&self, state: ArenaState, len: u64) -> Result<Placement> {
        if len > self.region {
            return Err(Error::Capacity {
                requested: len,
                capacity: self.capacity,
            });
        }

        let remaining = self.region - state.tail % self.region;
        let offset = if remaining < len {
            state.tail + remaining
        } else {
            state.tail
        };
        let end = offset + len;

        let mut head = state.head;
        let mut evicted = Vec::new();
        while end - head > self.region {
            if head >= state.tail {
                head = offset;
                break;
            }
            if let Some(next) = self.wrap_skip(head) {
                head = next;
                continue;
            }
            let header = self.read_record_header(head)?;
            if header.kind != RecordKind::Padding {
                evicted.push(Evicted {
                    offset: head,
                    kind: header.kind,
                    id: header.id,
                });
            }
            head += header.length as u64;
        }

        let after = ArenaState {
            head,
            tail: end,
            generation: state.generation + 1,
            records: (state.records + 1).saturating_sub(evicted.len() as u64),
        };

        Ok(Placement {
            offset,
            len,
            before: state,
            after,
            evicted,
        })
    }

    /// Write an encoded record according to `placement`
    ///
    /// The head moves before the freed space is reused, and the tail moves
    /// only once the record bytes are in place.
    pub fn apply(&self, placement: &Placement, record: &[u8]) -> Result<Undo> {
        if !self.writable {
            return Err(Error::Init(format!(
                "'{}' is opened read-only",
                self.path.display()
            )));
        }
        if record.len() as u64 != placement.len {
            return Err(Error::Corruption(format!(
                "Record is {} bytes, placement reserved {}",
                record.len(),
                placement.len
            )));
        }

        let mut undo = Undo { ranges: Vec::new() };
        undo.ranges.push(self.capture(0, HEADER_LEN as usize)?);

        // Bumping the generation here lets lock-free readers elsewhere notice
        // that evicted bytes may already be gone.
        self.write_header(ArenaState {
            head: placement.after.head.min(placement.before.tail),
            tail: placement.before.tail,
            generation: placement.after.generation,
            records: placement
                .before
                .records
                .saturating_sub(placement.evicted.len() as u64),
        })?;

        let skipped = placement.skipped();
        if skipped >= RECORD_HEADER_LEN {
            let at = self.physical(placement.before.tail);
            undo.ranges.push(self.capture(at, RECORD_HEADER_LEN as usize)?);
            self.write_raw(at, &RecordHeader::padding(skipped).encode())?;
        }

        let at = self.physical(placement.offset);
        undo.ranges.push(self.capture(at, record.len())?);
        self.write_raw(at, record)?;

        self.write_header(placement.after)?;
        Ok(undo)
    }

    /// Put back everything an [`Arena::apply`] overwrote
    pub fn revert(&self, undo: Undo) -> Result<()> {
        for (at, bytes) in undo.ranges.iter().rev() {
            self.write_raw(*at, bytes)?;
        }
        Ok(())
    }

    /// Overwrite this arena with a byte-for-byte image of `source`
    pub fn copy_image_from(&self, source: &Arena) -> Result<()> {
        if source.capacity != self.capacity {
            return Err(Error::Init(format!(
                "Cannot mirror '{}' ({} bytes) into '{}' ({} bytes)",
                source.path.display(),
                source.capacity,
                self.path.display(),
                self.capacity
            )));
        }
        let end = self.capacity as usize;
        let mut chunk = vec![0u8; COPY_CHUNK.min(end)];
        let mut at = HEADER_LEN as usize;
        while at < end {
            let len = chunk.len().min(end - at);
            source.read_raw(at, &mut chunk[..len])?;
            self.write_raw(at, &chunk[..len])?;
            at += len;
        }

        // Header last, so a reader never sees the new state over old bytes
        let mut header = [0u8; HEADER_LEN as usize];
        source.read_raw(0, &mut header)?;
        self.write_raw(0, &header)
    }

    /// Flush dirty pages to the file
    pub fn flush(&self) -> Result<()> {
        if self.writable {
            self.map.flush()?;
        }
        Ok(())
    }

    /// Rewrite the state fields, leaving magic, capacity and image id alone
    fn write_header(&self, state: ArenaState) -> Result<()> {
        self.write_raw(STATE_OFFSET, &state.encode())
    }

    fn physical(&self, offset: u64) -> usize {
        (HEADER_LEN + offset % self.region) as usize
    }

    /// Where a cursor at `pos` continues if too little room is left before the wrap
    fn wrap_skip(&self, pos: u64) -> Option<u64> {
        let remaining = self.region - pos % self.region;
        (remaining < RECORD_HEADER_LEN).then_some(pos + remaining)
    }

    fn capture(&self, at: usize, len: usize) -> Result<(usize, Vec<u8>)> {
        let mut saved = vec![0u8; len];
        self.read_raw(at, &mut saved)?;
        Ok((at, saved))
    }

    fn check_bounds(&self, at: usize, len: usize) -> Result<()> {
        match at.checked_add(len) {
            Some(end) if end <= self.map.len() => Ok(()),
            _ => Err(Error::Corruption(format!(
                "Access of {} bytes at {} is outside '{}'",
                len,
                at,
                self.path.display()
            ))),
        }
    }

    fn read_raw(&self, at: usize, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(at, buf.len())?;
        // SAFETY: bounds checked above; the mapping lives as long as `self`.
        unsafe {
            std::ptr::copy_nonoverlapping(self.map.as_ptr().add(at), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write_raw(&self, at: usize, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::Init(format!(
                "'{}' is opened read-only",
                self.path.display()
            )));
        }
        self.check_bounds(at, data.len())?;
        // SAFETY: bounds checked above and the mapping is writable. Callers
        // serialize writers through the volume gate and the file lock.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.map.as_mut_ptr().add(at), data.len());
        }
        Ok(())
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("writable", &self.writable)
            .finish()
    }
}

/// Id for a freshly created image, unique across files, processes and time
fn new_image_id(path: &Path) -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut hasher = blake3::Hasher::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(&std::process::id().to_le_bytes());
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());

    let mut id = [0u8; 8];
    id.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
    u64::from_le_bytes(id)
}

fn region_len(capacity: u64) -> u64 {
    (capacity - HEADER_LEN) & !7
}

/// Header of an existing file, `None` if the file is new or zeroed
fn read_existing_header(file: &File, len: u64, path: &Path) -> Result<Option<ArenaHeader>> {
    if len == 0 {
        return Ok(None);
    }
    if len < HEADER_LEN {
        return Err(Error::Init(format!(
            "'{}' is too short to be an arena",
            path.display()
        )));
    }
    let mut buf = [0u8; HEADER_LEN as usize];
    let mut reader = file;
    reader.read_exact(&mut buf)?;
    if buf.iter().all(|&b| b == 0) {
        return Ok(None);
    }
    ArenaHeader::decode(&buf)
        .map(Some)
        .map_err(|e| Error::Init(format!("'{}': {}", path.display(), e)))
}

/// Encode a record: header, key, stored payload, zero padding
pub fn encode_record(
    kind: RecordKind,
    id: [u8; 32],
    key: &[u8],
    original_len: u32,
    stored: &[u8],
) -> Vec<u8> {
    let len = record_len(key.len(), stored.len());
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(key);
    hasher.update(stored);

    let header = RecordHeader {
        kind,
        length: len as u32,
        crc: hasher.finalize(),
        id,
        key_len: key.len() as u32,
        original_len,
        stored_len: stored.len() as u32,
    };

    let mut buf = Vec::with_capacity(len as usize);
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(key);
    buf.extend_from_slice(stored);
    buf.resize(len as usize, 0);
    buf
}

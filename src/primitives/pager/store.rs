use std::convert::TryInto;
use std::io::ErrorKind;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::io::FileIo;
use crate::types::{CommitSeq, PageId, Result, TandemError};

const STORE_MAGIC: [u8; 4] = *b"TNDM";
const STORE_FORMAT_VERSION: u16 = 1;
/// Bytes of slot 0 occupied by the encoded header.
pub const STORE_HEADER_LEN: usize = 32;
/// Page size used when creating a database without an explicit override.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;
/// Smallest supported page size.
pub const MIN_PAGE_SIZE: u32 = 512;
/// Largest supported page size.
pub const MAX_PAGE_SIZE: u32 = 65536;

/// Validates a page size for a new database.
pub fn validate_page_size(page_size: u32) -> Result<()> {
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(TandemError::Invalid(
            "page size must be a power of two between 512 and 65536",
        ));
    }
    Ok(())
}

/// Header kept in slot 0 of the main database file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreHeader {
    /// Size of every page in bytes.
    pub page_size: u32,
    /// Number of pages present in the file.
    pub page_count: u32,
    /// Newest commit whose pages were copied in by a checkpoint.
    pub checkpoint_seq: CommitSeq,
}

impl StoreHeader {
    fn encode(&self) -> [u8; STORE_HEADER_LEN] {
        let mut buf = [0u8; STORE_HEADER_LEN];
        buf[0..4].copy_from_slice(&STORE_MAGIC);
        buf[4..6].copy_from_slice(&STORE_FORMAT_VERSION.to_be_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_be_bytes());
        buf[12..16].copy_from_slice(&self.page_count.to_be_bytes());
        buf[16..24].copy_from_slice(&self.checkpoint_seq.0.to_be_bytes());
        let crc = crc32fast::hash(&buf[..28]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < STORE_HEADER_LEN {
            return Err(TandemError::Corruption("store header truncated"));
        }
        if src[0..4] != STORE_MAGIC {
            return Err(TandemError::Corruption("store magic mismatch"));
        }
        let version = u16::from_be_bytes(src[4..6].try_into().unwrap());
        if version != STORE_FORMAT_VERSION {
            return Err(TandemError::Corruption("store format version mismatch"));
        }
        let stored_crc = u32::from_be_bytes(src[28..32].try_into().unwrap());
        if crc32fast::hash(&src[..28]) != stored_crc {
            return Err(TandemError::Corruption("store header crc mismatch"));
        }
        Ok(Self {
            page_size: u32::from_be_bytes(src[8..12].try_into().unwrap()),
            page_count: u32::from_be_bytes(src[12..16].try_into().unwrap()),
            checkpoint_seq: CommitSeq(u64::from_be_bytes(src[16..24].try_into().unwrap())),
        })
    }
}

/// Fixed-size page file.
///
/// Slot 0 holds the header; page `i` lives at `(i + 1) * page_size`. The store
/// performs no concurrency control beyond keeping its header consistent: only
/// the checkpointer writes pages, and it is serialized by the caller.
pub struct PageStore {
    io: Arc<dyn FileIo>,
    page_size: usize,
    header: Mutex<StoreHeader>,
}

impl PageStore {
    /// Opens the store, writing a fresh header when the file is empty.
    ///
    /// `page_size` only applies to new files; an existing header always wins.
    pub fn open(io: Arc<dyn FileIo>, page_size: u32) -> Result<Self> {
        validate_page_size(page_size)?;
        let len = io.len()?;
        let header = if len == 0 {
            let header = StoreHeader {
                page_size,
                page_count: 0,
                checkpoint_seq: CommitSeq(0),
            };
            let mut slot = vec![0u8; page_size as usize];
            slot[..STORE_HEADER_LEN].copy_from_slice(&header.encode());
            io.write_at(0, &slot)?;
            io.sync_all()?;
            info!(page_size, "store.created");
            header
        } else {
            let mut buf = [0u8; STORE_HEADER_LEN];
            match io.read_at(0, &mut buf) {
                Ok(()) => {}
                Err(TandemError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                    return Err(TandemError::Corruption("store header truncated"));
                }
                Err(err) => return Err(err),
            }
            let header = StoreHeader::decode(&buf)?;
            validate_page_size(header.page_size)
                .map_err(|_| TandemError::Corruption("store page size invalid"))?;
            if header.page_size != page_size {
                debug!(
                    requested = page_size,
                    stored = header.page_size,
                    "store.page_size_from_header"
                );
            }
            let required = (header.page_count as u64 + 1) * header.page_size as u64;
            if len < required {
                // The header of an extension reached disk before its zeroed
                // pages did. Those pages hold nothing a checkpoint finished
                // copying, so zeros are their correct contents.
                warn!(len, required, "store.zero_extended");
                io.truncate(required)?;
                io.sync_all()?;
            }
            header
        };
        Ok(Self {
            io,
            page_size: header.page_size as usize,
            header: Mutex::new(header),
        })
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> u32 {
        self.page_size as u32
    }

    /// Number of pages currently materialized in the file.
    pub fn page_count(&self) -> u32 {
        self.header.lock().page_count
    }

    /// Copy of the current header.
    pub fn header(&self) -> StoreHeader {
        self.header.lock().clone()
    }

    /// Re-reads the header from disk, picking up extensions and checkpoints
    /// made through another handle on the same file.
    pub fn reload_header(&self) -> Result<StoreHeader> {
        let mut header = self.header.lock();
        let mut buf = [0u8; STORE_HEADER_LEN];
        self.io.read_at(0, &mut buf)?;
        let fresh = StoreHeader::decode(&buf)?;
        if fresh.page_size as usize != self.page_size {
            return Err(TandemError::Corruption("store page size changed"));
        }
        *header = fresh.clone();
        Ok(fresh)
    }

    /// Reads the image of page `id`.
    pub fn read_page(&self, id: PageId) -> Result<Vec<u8>> {
        if id.0 >= self.page_count() {
            return Err(TandemError::OutOfRange);
        }
        let mut buf = vec![0u8; self.page_size];
        match self.io.read_at(self.page_offset(id), &mut buf) {
            Ok(()) => Ok(buf),
            Err(TandemError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                Err(TandemError::Corruption("store page truncated"))
            }
            Err(err) => Err(err),
        }
    }

    /// Overwrites page `id`. Only the checkpointer calls this.
    pub fn write_page(&self, id: PageId, src: &[u8]) -> Result<()> {
        if src.len() != self.page_size {
            return Err(TandemError::Invalid("page image size mismatch"));
        }
        if id.0 >= self.page_count() {
            return Err(TandemError::OutOfRange);
        }
        self.io.write_at(self.page_offset(id), src)
    }

    /// Appends one zeroed page and returns its id.
    pub fn extend(&self) -> Result<PageId> {
        let mut header = self.header.lock();
        let id = PageId(header.page_count);
        let next = header
            .page_count
            .checked_add(1)
            .ok_or(TandemError::Invalid("page store full"))?;
        self.io
            .write_at(self.page_offset(id), &vec![0u8; self.page_size])?;
        let updated = StoreHeader {
            page_count: next,
            ..header.clone()
        };
        self.io.write_at(0, &updated.encode())?;
        *header = updated;
        Ok(id)
    }

    /// Records the newest commit copied in by a checkpoint.
    pub fn set_checkpoint_seq(&self, seq: CommitSeq) -> Result<()> {
        let mut header = self.header.lock();
        let updated = StoreHeader {
            checkpoint_seq: seq,
            ..header.clone()
        };
        self.io.write_at(0, &updated.encode())?;
        *header = updated;
        Ok(())
    }

    /// Flushes pages and header to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }

    fn page_offset(&self, id: PageId) -> u64 {
        (id.0 as u64 + 1) * self.page_size as u64
    }
}

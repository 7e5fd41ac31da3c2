//! Shared identifiers and the unified error type for every GaldrDb crate.

use std::io;

/// Identifier of a page within a database file. Page 0 is always the header.
pub type PageId = u64;

/// Monotonic transaction identifier. 0 is reserved for auto-commit WAL framing.
pub type TxId = u64;

/// Identifier of a document within a collection, monotonic per collection.
pub type DocId = u64;

/// Index of a slot within a slotted page's slot directory.
pub type SlotIndex = u32;

pub const MIN_PAGE_SIZE: u32 = 4096;
pub const MAX_PAGE_SIZE: u32 = 65536;
pub const DEFAULT_PAGE_SIZE: u32 = 8192;

/// `TxId` used by non-transactional single-operation calls for WAL framing.
/// The real version-identity TxId is allocated separately (see Design Note
/// on auto-commit framing); this constant is a recovery-replay key only.
pub const AUTO_COMMIT_WAL_TX_ID: TxId = 0;

/// Stable identifier of a stored document version: the page holding it and
/// its slot index within that page's slot directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentLocation {
    pub page_id: PageId,
    pub slot_index: SlotIndex,
}

impl DocumentLocation {
    pub const fn new(page_id: PageId, slot_index: SlotIndex) -> Self {
        Self {
            page_id,
            slot_index,
        }
    }
}

/// Page kinds tagged in both the base file and WAL frames. A discriminated
/// union rather than a type hierarchy, per the storage engine's design note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Header = 0,
    Bitmap = 1,
    FreeSpaceMap = 2,
    Document = 3,
    Continuation = 4,
    CollectionsMetadata = 5,
    BTreeInternal = 6,
    BTreeLeaf = 7,
}

impl PageType {
    pub const fn to_byte(self) -> u8 {
        self as u8
    }

    pub const fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::Header,
            1 => Self::Bitmap,
            2 => Self::FreeSpaceMap,
            3 => Self::Document,
            4 => Self::Continuation,
            5 => Self::CollectionsMetadata,
            6 => Self::BTreeInternal,
            7 => Self::BTreeLeaf,
            _ => return None,
        })
    }
}

/// Free-space classes tracked by the Free-Space Map: two bits per page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum FreeClass {
    Full = 0,
    QuarterFree = 1,
    HalfFree = 2,
    MostlyFree = 3,
}

impl FreeClass {
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Full,
            1 => Self::QuarterFree,
            2 => Self::HalfFree,
            _ => Self::MostlyFree,
        }
    }

    pub const fn to_bits(self) -> u8 {
        self as u8
    }

    /// Classifies a page given its free byte count out of `page_size`.
    pub fn from_free_bytes(free_bytes: usize, page_size: usize) -> Self {
        if free_bytes == 0 {
            Self::Full
        } else if free_bytes * 4 <= page_size {
            Self::QuarterFree
        } else if free_bytes * 2 <= page_size {
            Self::HalfFree
        } else {
            Self::MostlyFree
        }
    }
}

/// Unified error type for the storage engine, per the error-handling design:
/// tagged variants, not a hierarchy of exception types.
#[derive(Debug, thiserror::Error)]
pub enum GaldrError {
    #[error("argument error: {0}")]
    ArgumentError(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error(
        "write conflict on {collection}/{doc_id}: conflicting transaction {conflicting_tx_id}"
    )]
    WriteConflict {
        collection: String,
        doc_id: DocId,
        conflicting_tx_id: TxId,
    },

    #[error("unique constraint violation on field {field}: value {value} already present")]
    UniqueConstraintViolation { field: String, value: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type GaldrResult<T> = Result<T, GaldrError>;

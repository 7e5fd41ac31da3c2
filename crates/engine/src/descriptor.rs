//! Caller-facing shapes for documents and indexes.
//!
//! The engine never inspects document bytes (no schema, no
//! query-expression evaluation). Every secondary-index key the caller wants
//! maintained for a write must be supplied alongside the opaque bytes; this
//! is an injected descriptor rather than a
//! reflection-based encoder living inside the core.

use galdr_common::DocId;

/// One secondary index to maintain on a collection.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub field: String,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(field: impl Into<String>, unique: bool) -> Self {
        IndexSpec {
            field: field.into(),
            unique,
        }
    }
}

/// A document write: raw bytes plus the index keys the caller has already
/// derived from them for every field the collection indexes.
#[derive(Debug, Clone, Default)]
pub struct DocumentWrite {
    /// Explicit DocId, or `None` to auto-assign the collection's next one.
    pub id: Option<DocId>,
    pub bytes: Vec<u8>,
    /// (field name, raw user key bytes) pairs. Fields the collection does
    /// not index are ignored; fields it does index but this write omits
    /// simply get no entry in that index for this document.
    pub index_keys: Vec<(String, Vec<u8>)>,
}

impl DocumentWrite {
    pub fn new(bytes: Vec<u8>) -> Self {
        DocumentWrite {
            id: None,
            bytes,
            index_keys: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: DocId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_index_key(mut self, field: impl Into<String>, key: Vec<u8>) -> Self {
        self.index_keys.push((field.into(), key));
        self
    }
}

/// Result of a `vacuum()` call.
#[derive(Debug, Clone, Default)]
pub struct VacuumReport {
    pub versions_collected: u64,
    pub pages_compacted: u64,
    pub horizon_tx_id: galdr_common::TxId,
}

/// Result of a `compact_to()` call.
#[derive(Debug, Clone, Default)]
pub struct CompactReport {
    pub collections_copied: u64,
    pub documents_copied: u64,
    pub source_page_count: u64,
    pub target_page_count: u64,
}

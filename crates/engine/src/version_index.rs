//! In-memory Version Index: per-DocId MVCC version chains with
//! back-pointers into a flat arena, following the "Arena + index for
//! back-pointers" design so chain links survive compaction of
//! the arena itself without invalidating other chains' positions.

use std::collections::HashMap;

use parking_lot::RwLock;

use galdr_common::{DocId, DocumentLocation, TxId};

/// `deleted_tx_id` sentinel meaning "not deleted".
pub const NOT_DELETED: TxId = TxId::MAX;

#[derive(Debug, Clone)]
pub struct VersionRecord {
    pub created_tx_id: TxId,
    pub deleted_tx_id: TxId,
    pub location: DocumentLocation,
    /// (field, user key bytes) pairs that were live in secondary indexes
    /// for this version at the time it was installed. Used by replace/
    /// delete/GC to know exactly which composite keys to remove.
    pub index_keys: Vec<(String, Vec<u8>)>,
    pub prev: Option<usize>,
}

impl VersionRecord {
    fn is_visible_at(&self, snapshot: TxId) -> bool {
        self.created_tx_id <= snapshot
            && (self.deleted_tx_id == NOT_DELETED || self.deleted_tx_id > snapshot)
    }
}

/// DocId -> version chain, backed by a shared arena.
pub struct VersionIndex {
    arena: RwLock<Vec<VersionRecord>>,
    heads: RwLock<HashMap<DocId, usize>>,
}

impl VersionIndex {
    pub fn new() -> Self {
        VersionIndex {
            arena: RwLock::new(Vec::new()),
            heads: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild from an explicit set of live (doc_id, location) pairs, used
    /// right after recovery scans the durable primary index. Every entry
    /// becomes a single-version chain visible to everyone (`created_tx_id
    /// = 0`).
    pub fn from_live_documents(entries: Vec<(DocId, DocumentLocation)>) -> Self {
        let index = VersionIndex::new();
        {
            let mut arena = index.arena.write();
            let mut heads = index.heads.write();
            for (doc_id, location) in entries {
                let pos = arena.len();
                arena.push(VersionRecord {
                    created_tx_id: 0,
                    deleted_tx_id: NOT_DELETED,
                    location,
                    index_keys: Vec::new(),
                    prev: None,
                });
                heads.insert(doc_id, pos);
            }
        }
        index
    }

    pub fn has_head(&self, doc_id: DocId) -> bool {
        self.heads.read().contains_key(&doc_id)
    }

    /// Current head record, regardless of tombstone/visibility state.
    pub fn head(&self, doc_id: DocId) -> Option<VersionRecord> {
        let heads = self.heads.read();
        let pos = *heads.get(&doc_id)?;
        self.arena.read().get(pos).cloned()
    }

    /// Walks the chain from the head, returning the first version visible
    /// at `snapshot`, or `None` if the document does not exist or its
    /// visible version is a tombstone.
    pub fn visible_version(&self, doc_id: DocId, snapshot: TxId) -> Option<DocumentLocation> {
        let heads = self.heads.read();
        let mut pos = *heads.get(&doc_id)?;
        let arena = self.arena.read();
        loop {
            let record = arena.get(pos)?;
            if record.is_visible_at(snapshot) {
                return if record.deleted_tx_id == NOT_DELETED || record.deleted_tx_id > snapshot {
                    Some(record.location)
                } else {
                    None
                };
            }
            pos = record.prev?;
        }
    }

    /// Installs a new head version for `doc_id`, chaining it above
    /// whatever was previously the head (if anything).
    pub fn install(
        &self,
        doc_id: DocId,
        created_tx_id: TxId,
        location: DocumentLocation,
        index_keys: Vec<(String, Vec<u8>)>,
    ) {
        let mut heads = self.heads.write();
        let mut arena = self.arena.write();
        let prev = heads.get(&doc_id).copied();
        let pos = arena.len();
        arena.push(VersionRecord {
            created_tx_id,
            deleted_tx_id: NOT_DELETED,
            location,
            index_keys,
            prev,
        });
        heads.insert(doc_id, pos);
    }

    /// Marks the current head of `doc_id` as deleted by `tx_id`.
    pub fn mark_deleted(&self, doc_id: DocId, tx_id: TxId) {
        let heads = self.heads.read();
        let Some(&pos) = heads.get(&doc_id) else {
            return;
        };
        let mut arena = self.arena.write();
        if let Some(record) = arena.get_mut(pos) {
            record.deleted_tx_id = tx_id;
        }
    }

    /// All DocIds with a chain, in arbitrary order. Used by GC.
    pub fn doc_ids(&self) -> Vec<DocId> {
        self.heads.read().keys().copied().collect()
    }

    /// Chain for `doc_id` from the head down to the root, newest first, as
    /// `(arena index, record)` pairs.
    pub fn chain_with_indices(&self, doc_id: DocId) -> Vec<(usize, VersionRecord)> {
        let heads = self.heads.read();
        let Some(&head_pos) = heads.get(&doc_id) else {
            return Vec::new();
        };
        let arena = self.arena.read();
        let mut out = Vec::new();
        let mut pos = Some(head_pos);
        while let Some(p) = pos {
            let Some(record) = arena.get(p) else { break };
            pos = record.prev;
            out.push((p, record.clone()));
        }
        out
    }

    /// Drops every version of `doc_id` strictly older than `keep_pos` by
    /// rewiring `keep_pos`'s `prev` link to `None`. The dropped arena slots
    /// become unreachable garbage, reclaimed later by `compact_arena`.
    pub fn truncate_chain_after(&self, keep_pos: usize) {
        let mut arena = self.arena.write();
        if let Some(record) = arena.get_mut(keep_pos) {
            record.prev = None;
        }
    }

    /// Removes `doc_id`'s chain entirely (whole-chain collection).
    pub fn remove_chain(&self, doc_id: DocId) {
        self.heads.write().remove(&doc_id);
    }

    /// Rebuilds the arena containing only records still reachable from a
    /// head, renumbering positions. Called at the end of `vacuum()` to
    /// reclaim memory left behind by `truncate_chain_after`/`remove_chain`.
    pub fn compact_arena(&self) {
        let mut heads = self.heads.write();
        let old_arena = self.arena.read().clone();
        let mut new_arena = Vec::with_capacity(old_arena.len());
        for pos in heads.values_mut() {
            let mut chain = Vec::new();
            let mut cur = Some(*pos);
            while let Some(p) = cur {
                let record = old_arena[p].clone();
                cur = record.prev;
                chain.push(record);
            }
            // chain is newest-first; relink oldest-first while appending so
            // `prev` indices point backwards into the freshly built arena.
            let mut prev_index = None;
            for record in chain.into_iter().rev() {
                let mut record = record;
                record.prev = prev_index;
                new_arena.push(record);
                prev_index = Some(new_arena.len() - 1);
            }
            *pos = prev_index.expect("chain always has at least one record");
        }
        drop(old_arena);
        *self.arena.write() = new_arena;
    }
}

impl Default for VersionIndex {
    fn default() -> Self {
        Self::new()
    }
}

//! Transaction Engine: buffered writes, first-writer-wins conflict
//! detection, unique constraint enforcement, and the commit protocol.
//! Scoped acquisition: a `Transaction` is RAII — dropping it without
//! an explicit commit rolls it back.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::instrument;

use galdr_common::{DocId, GaldrError, GaldrResult, TxId};
use galdr_index::compose_non_unique_key;
use galdr_storage::PageWriteLog;

use crate::descriptor::DocumentWrite;
use crate::metadata::CollectionsMetadata;
use crate::version_index::NOT_DELETED;
use crate::Inner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone)]
enum PendingOp {
    Upsert {
        bytes: Vec<u8>,
        index_keys: Vec<(String, Vec<u8>)>,
    },
    Delete,
}

/// A single logical unit of work over the database. Read-only
/// transactions may call the read methods only; read-write transactions
/// may call both, with writes buffered until [`Transaction::commit`].
pub struct Transaction {
    inner: Arc<Inner>,
    tx_id: TxId,
    snapshot_tx_id: TxId,
    read_only: bool,
    state: TxState,
    write_set: HashMap<(String, DocId), PendingOp>,
}

impl Transaction {
    pub(crate) fn begin(inner: Arc<Inner>, read_only: bool) -> Self {
        let tx_id = inner.txn_mgr.allocate_tx_id();
        let snapshot_tx_id = inner.txn_mgr.get_snapshot_tx_id();
        inner.txn_mgr.register(tx_id, snapshot_tx_id);
        Transaction {
            inner,
            tx_id,
            snapshot_tx_id,
            read_only,
            state: TxState::Active,
            write_set: HashMap::new(),
        }
    }

    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    pub fn snapshot_tx_id(&self) -> TxId {
        self.snapshot_tx_id
    }

    fn ensure_active(&self) -> GaldrResult<()> {
        if self.state != TxState::Active {
            return Err(GaldrError::InvalidOperation(
                "transaction is no longer active".into(),
            ));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> GaldrResult<()> {
        self.ensure_active()?;
        if self.read_only {
            return Err(GaldrError::InvalidOperation(
                "read-only transaction cannot write".into(),
            ));
        }
        Ok(())
    }

    fn doc_existed_at_snapshot(&self, collection: &str, id: DocId) -> GaldrResult<bool> {
        Ok(self
            .inner
            .version_index(collection)?
            .visible_version(id, self.snapshot_tx_id)
            .is_some())
    }

    /// First-writer-wins conflict check: the head version's
    /// creation or deletion must not postdate this transaction's snapshot.
    fn check_conflict(&self, collection: &str, id: DocId) -> GaldrResult<()> {
        let versions = self.inner.version_index(collection)?;
        let Some(head) = versions.head(id) else {
            return Ok(());
        };
        if head.created_tx_id > self.snapshot_tx_id {
            return Err(GaldrError::WriteConflict {
                collection: collection.to_string(),
                doc_id: id,
                conflicting_tx_id: head.created_tx_id,
            });
        }
        if head.deleted_tx_id != NOT_DELETED && head.deleted_tx_id > self.snapshot_tx_id {
            return Err(GaldrError::WriteConflict {
                collection: collection.to_string(),
                doc_id: id,
                conflicting_tx_id: head.deleted_tx_id,
            });
        }
        Ok(())
    }

    /// Checks every unique index touched by `index_keys` against both the
    /// durable B+-tree (the committed pre-image) and this transaction's own
    /// still-buffered writes, so two inserts in the same transaction cannot
    /// collide on a unique field before either has reached the tree.
    fn check_unique_constraints(
        &self,
        metadata: &CollectionsMetadata,
        collection: &str,
        doc_id: DocId,
        index_keys: &[(String, Vec<u8>)],
    ) -> GaldrResult<()> {
        let coll = metadata
            .find(collection)
            .ok_or_else(|| GaldrError::ArgumentError(format!("unknown collection {collection}")))?;
        let versions = self.inner.version_index(collection)?;
        let own_location = versions.visible_version(doc_id, self.snapshot_tx_id);
        let btree = self.inner.btree();

        for (field, key) in index_keys {
            let Some(idx) = coll.index(field) else { continue };
            if !idx.unique {
                continue;
            }
            if let Some(found) = btree.search(idx.root_page, key)? {
                if Some(found) != own_location {
                    return Err(GaldrError::UniqueConstraintViolation {
                        field: field.clone(),
                        value: String::from_utf8_lossy(key).to_string(),
                    });
                }
            }
            for ((other_collection, other_id), op) in &self.write_set {
                if other_collection != collection || *other_id == doc_id {
                    continue;
                }
                if let PendingOp::Upsert { index_keys: other_keys, .. } = op {
                    if other_keys.iter().any(|(f, k)| f == field && k == key) {
                        return Err(GaldrError::UniqueConstraintViolation {
                            field: field.clone(),
                            value: String::from_utf8_lossy(key).to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, collection: &str, write: DocumentWrite) -> GaldrResult<DocId> {
        self.ensure_writable()?;
        let doc_id = match write.id {
            Some(id) => {
                self.inner.bump_next_doc_id_past(collection, id)?;
                if self.doc_existed_at_snapshot(collection, id)? {
                    return Err(GaldrError::WriteConflict {
                        collection: collection.to_string(),
                        doc_id: id,
                        conflicting_tx_id: self.snapshot_tx_id,
                    });
                }
                id
            }
            None => self.inner.reserve_auto_doc_id(collection)?,
        };
        self.check_conflict(collection, doc_id)?;
        let metadata = self.inner.metadata_snapshot();
        self.check_unique_constraints(&metadata, collection, doc_id, &write.index_keys)?;

        self.write_set.insert(
            (collection.to_string(), doc_id),
            PendingOp::Upsert {
                bytes: write.bytes,
                index_keys: write.index_keys,
            },
        );
        Ok(doc_id)
    }

    pub fn replace(
        &mut self,
        collection: &str,
        id: DocId,
        bytes: Vec<u8>,
        index_keys: Vec<(String, Vec<u8>)>,
    ) -> GaldrResult<()> {
        self.ensure_writable()?;
        self.check_conflict(collection, id)?;
        let key = (collection.to_string(), id);
        let existed = self.doc_existed_at_snapshot(collection, id)? || self.write_set.contains_key(&key);
        if !existed {
            return Err(GaldrError::ArgumentError(format!(
                "document {id} not found in collection {collection}"
            )));
        }
        let metadata = self.inner.metadata_snapshot();
        self.check_unique_constraints(&metadata, collection, id, &index_keys)?;
        self.write_set.insert(key, PendingOp::Upsert { bytes, index_keys });
        Ok(())
    }

    pub fn delete_by_id(&mut self, collection: &str, id: DocId) -> GaldrResult<()> {
        self.ensure_writable()?;
        let key = (collection.to_string(), id);

        let existed_before_tx = self.doc_existed_at_snapshot(collection, id)?;
        if !existed_before_tx {
            if matches!(self.write_set.get(&key), Some(PendingOp::Upsert { .. })) {
                // Delete after an Insert within this same transaction
                // cancels the Insert outright.
                self.write_set.remove(&key);
                return Ok(());
            }
            return Err(GaldrError::ArgumentError(format!(
                "document {id} not found in collection {collection}"
            )));
        }

        self.check_conflict(collection, id)?;
        self.write_set.insert(key, PendingOp::Delete);
        Ok(())
    }

    pub fn get_by_id(&self, collection: &str, id: DocId) -> GaldrResult<Option<Vec<u8>>> {
        self.ensure_active()?;
        let key = (collection.to_string(), id);
        if let Some(op) = self.write_set.get(&key) {
            return Ok(match op {
                PendingOp::Upsert { bytes, .. } => Some(bytes.clone()),
                PendingOp::Delete => None,
            });
        }
        let versions = self.inner.version_index(collection)?;
        let Some(location) = versions.visible_version(id, self.snapshot_tx_id) else {
            return Ok(None);
        };
        let bytes = self
            .inner
            .document_store()
            .read_document(location.page_id, location.slot_index)?;
        Ok(Some(bytes))
    }

    /// Commits the transaction: re-validate
    /// conflicts, stage post-images, re-validate unique constraints,
    /// write + fsync the WAL batch, apply to the page cache, then install
    /// new MVCC versions and advance the commit watermark.
    #[instrument(skip(self), fields(tx_id = self.tx_id))]
    pub fn commit(mut self) -> GaldrResult<()> {
        self.ensure_active()?;
        if self.read_only || self.write_set.is_empty() {
            self.inner.txn_mgr.unregister(self.tx_id);
            self.state = TxState::Committed;
            return Ok(());
        }

        let write_set = std::mem::take(&mut self.write_set);
        let result = self.commit_write_set(&write_set);
        match &result {
            Ok(()) => {
                self.inner.txn_mgr.mark_committed(self.tx_id);
                self.state = TxState::Committed;
                self.inner.note_committed_write();
            }
            Err(_) => {
                self.inner.txn_mgr.unregister(self.tx_id);
                self.state = TxState::RolledBack;
            }
        }
        result
    }

    fn commit_write_set(&self, write_set: &HashMap<(String, DocId), PendingOp>) -> GaldrResult<()> {
        let _commit_guard = self.inner.commit_lock.lock();

        for (collection, doc_id) in write_set.keys() {
            self.check_conflict(collection, *doc_id)?;
        }

        let mut metadata = self.inner.metadata_snapshot();
        let mut log = PageWriteLog::new();
        let store = self.inner.document_store();
        let btree = self.inner.btree();

        struct Install {
            collection: String,
            doc_id: DocId,
            new: Option<(galdr_common::DocumentLocation, Vec<(String, Vec<u8>)>)>,
        }
        let mut installs = Vec::with_capacity(write_set.len());

        for ((collection, doc_id), op) in write_set {
            let doc_id = *doc_id;
            let versions = self.inner.version_index(collection)?;
            let old_head = versions.head(doc_id);
            let primary_key = doc_id.to_be_bytes().to_vec();

            match op {
                PendingOp::Upsert { bytes, index_keys } => {
                    self.check_unique_constraints(&metadata, collection, doc_id, index_keys)?;
                    let location = store.write_document(&mut log, bytes)?;

                    let coll = metadata.find_mut(collection).ok_or_else(|| {
                        GaldrError::ArgumentError(format!("unknown collection {collection}"))
                    })?;
                    if old_head.is_some() {
                        coll.primary_root_page = btree.delete(&mut log, coll.primary_root_page, &primary_key)?;
                    }
                    coll.primary_root_page =
                        btree.insert(&mut log, coll.primary_root_page, primary_key.clone(), location)?;

                    if let Some(old) = &old_head {
                        remove_secondary_entries(&btree, &mut log, coll, doc_id, &old.index_keys)?;
                    }
                    add_secondary_entries(&btree, &mut log, coll, doc_id, index_keys, location)?;

                    installs.push(Install {
                        collection: collection.clone(),
                        doc_id,
                        new: Some((location, index_keys.clone())),
                    });
                }
                PendingOp::Delete => {
                    let Some(old) = old_head else { continue };
                    store.delete_document(&mut log, old.location.page_id, old.location.slot_index)?;

                    let coll = metadata.find_mut(collection).ok_or_else(|| {
                        GaldrError::ArgumentError(format!("unknown collection {collection}"))
                    })?;
                    coll.primary_root_page = btree.delete(&mut log, coll.primary_root_page, &primary_key)?;
                    remove_secondary_entries(&btree, &mut log, coll, doc_id, &old.index_keys)?;

                    installs.push(Install {
                        collection: collection.clone(),
                        doc_id,
                        new: None,
                    });
                }
            }
        }

        self.inner.pager.set_last_committed_tx_id(&self.inner.cache, &mut log, self.tx_id)?;
        crate::metadata::save(&self.inner.cache, &self.inner.pager, &mut log, &metadata)?;
        self.inner.wal_commit(self.tx_id, &log)?;

        {
            let mut state = self.inner.state.write();
            state.metadata = metadata;
        }
        for install in installs {
            let versions = self.inner.version_index(&install.collection)?;
            match install.new {
                Some((location, index_keys)) => versions.install(install.doc_id, self.tx_id, location, index_keys),
                None => versions.mark_deleted(install.doc_id, self.tx_id),
            }
        }
        Ok(())
    }

    /// Explicitly rolls back the transaction, discarding its write set.
    pub fn rollback(mut self) {
        if self.state == TxState::Active {
            self.inner.txn_mgr.unregister(self.tx_id);
            self.state = TxState::RolledBack;
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            self.inner.txn_mgr.unregister(self.tx_id);
            self.state = TxState::RolledBack;
        }
    }
}

fn remove_secondary_entries(
    btree: &galdr_index::BTree<'_>,
    log: &mut PageWriteLog,
    coll: &mut crate::metadata::CollectionMeta,
    doc_id: DocId,
    old_keys: &[(String, Vec<u8>)],
) -> GaldrResult<()> {
    for (field, key) in old_keys {
        if let Some(idx) = coll.index_mut(field) {
            let composite = if idx.unique {
                key.clone()
            } else {
                compose_non_unique_key(key, doc_id)
            };
            idx.root_page = btree.delete(log, idx.root_page, &composite)?;
        }
    }
    Ok(())
}

fn add_secondary_entries(
    btree: &galdr_index::BTree<'_>,
    log: &mut PageWriteLog,
    coll: &mut crate::metadata::CollectionMeta,
    doc_id: DocId,
    new_keys: &[(String, Vec<u8>)],
    location: galdr_common::DocumentLocation,
) -> GaldrResult<()> {
    for (field, key) in new_keys {
        if let Some(idx) = coll.index_mut(field) {
            let composite = if idx.unique {
                key.clone()
            } else {
                compose_non_unique_key(key, doc_id)
            };
            idx.root_page = btree.insert(log, idx.root_page, composite, location)?;
        }
    }
    Ok(())
}

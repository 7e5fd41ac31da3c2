//! GaldrDb: an embedded, single-file document database with ACID
//! transactions, snapshot-isolated MVCC, secondary B+-tree indexes, WAL
//! crash recovery, garbage collection, and offline compaction.
//!
//! The crate is a thin orchestration layer over the lower crates:
//! `galdr-storage` for pages/documents, `galdr-wal` for the log,
//! `galdr-txn` for TxId bookkeeping, and `galdr-index` for secondary
//! B+-trees. This crate owns the one piece none of those know about: what
//! a "document" and "collection" mean, and how a transaction's write set
//! becomes durable, indexed, and visible.

mod compactor;
mod descriptor;
mod gc;
mod metadata;
mod options;
mod recovery;
mod transaction;
mod version_index;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument};

use galdr_common::{DocId, GaldrError, GaldrResult, TxId};
use galdr_index::BTree;
use galdr_storage::{DiskManager, DocumentStore, LruPageCache, PageManager, PageWriteLog};
use galdr_txn::{DeadlockPolicy, LatchTable, TransactionManager};

pub use descriptor::{CompactReport, DocumentWrite, IndexSpec, VacuumReport};
pub use metadata::{CollectionMeta, CollectionsMetadata, IndexMeta};
pub use options::Options;
pub use transaction::Transaction;
pub use version_index::VersionIndex;

pub use galdr_common::{DocumentLocation, PageId};

/// Index keys longer than this are rejected at the point of write (
/// ArgumentError: "oversized key").
const MAX_INDEX_KEY_SIZE: usize = 256;

pub(crate) struct EngineState {
    pub(crate) metadata: CollectionsMetadata,
    pub(crate) version_indexes: HashMap<String, Arc<VersionIndex>>,
    pub(crate) committed_since_gc: u64,
}

pub(crate) struct Inner {
    pub(crate) path: PathBuf,
    pub(crate) options: Options,
    pub(crate) cache: LruPageCache,
    pub(crate) pager: PageManager,
    pub(crate) wal: Option<galdr_wal::WalWriter>,
    pub(crate) wal_path: PathBuf,
    pub(crate) txn_mgr: TransactionManager,
    #[allow(dead_code)]
    pub(crate) latches: LatchTable,
    pub(crate) state: RwLock<EngineState>,
    pub(crate) commit_lock: Mutex<()>,
}

impl Inner {
    pub(crate) fn document_store(&self) -> DocumentStore<'_> {
        DocumentStore::new(&self.cache, &self.pager)
    }

    pub(crate) fn btree(&self) -> BTree<'_> {
        BTree::new(&self.cache, &self.pager, MAX_INDEX_KEY_SIZE)
    }

    pub(crate) fn metadata_snapshot(&self) -> CollectionsMetadata {
        self.state.read().metadata.clone()
    }

    pub(crate) fn version_index(&self, collection: &str) -> GaldrResult<Arc<VersionIndex>> {
        self.state
            .read()
            .version_indexes
            .get(collection)
            .cloned()
            .ok_or_else(|| unknown_collection(collection))
    }

    pub(crate) fn reserve_auto_doc_id(&self, collection: &str) -> GaldrResult<DocId> {
        let mut state = self.state.write();
        let meta = state
            .metadata
            .find_mut(collection)
            .ok_or_else(|| unknown_collection(collection))?;
        let id = meta.next_doc_id;
        meta.next_doc_id += 1;
        Ok(id)
    }

    pub(crate) fn bump_next_doc_id_past(&self, collection: &str, id: DocId) -> GaldrResult<()> {
        let mut state = self.state.write();
        let meta = state
            .metadata
            .find_mut(collection)
            .ok_or_else(|| unknown_collection(collection))?;
        if id >= meta.next_doc_id {
            meta.next_doc_id = id + 1;
        }
        Ok(())
    }

    /// Frames a transaction's staged page writes to the WAL (if enabled)
    /// and fsyncs them.
    pub(crate) fn wal_commit(&self, tx_id: TxId, log: &PageWriteLog) -> GaldrResult<()> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };
        let pending: Vec<_> = log
            .iter()
            .map(|(page_id, page_type, bytes)| (page_id, page_type, bytes.to_vec()))
            .collect();
        wal.write_transaction_batch(tx_id, &pending)?;
        wal.flush()?;
        Ok(())
    }

    /// Persists the in-memory collections metadata (root pages, NextDocId
    /// counters) into `log` so it rides along in the same WAL batch as the
    /// document/index page writes it describes.
    pub(crate) fn persist_metadata_into(&self, log: &mut PageWriteLog) -> GaldrResult<()> {
        let state = self.state.read();
        metadata::save(&self.cache, &self.pager, log, &state.metadata)
    }

    fn persist_metadata_now(&self) -> GaldrResult<()> {
        let tx_id = self.txn_mgr.allocate_tx_id();
        let mut log = PageWriteLog::new();
        self.persist_metadata_into(&mut log)?;
        self.wal_commit(tx_id, &log)?;
        self.txn_mgr.mark_committed(tx_id);
        Ok(())
    }

    /// Records a committed read-write transaction and, if `auto_gc` is on
    /// and the threshold is reached, runs `vacuum()` inline: GC is triggered
    /// automatically every `gc_threshold` committed read-write transactions.
    pub(crate) fn note_committed_write(self: &Arc<Self>) {
        if !self.options.auto_gc {
            return;
        }
        let should_vacuum = {
            let mut state = self.state.write();
            state.committed_since_gc += 1;
            if state.committed_since_gc >= self.options.gc_threshold {
                state.committed_since_gc = 0;
                true
            } else {
                false
            }
        };
        if should_vacuum {
            if let Err(err) = crate::gc::vacuum(self) {
                tracing::warn!(error = %err, "automatic vacuum failed");
            }
        }
    }
}

fn unknown_collection(name: &str) -> GaldrError {
    GaldrError::ArgumentError(format!("unknown collection {name}"))
}

/// An embedded, single-file document database handle. Cheap to clone-share
/// via [`Arc`]; cloning a `GaldrDb` shares the same underlying file and
/// in-memory state.
#[derive(Clone)]
pub struct GaldrDb {
    inner: Arc<Inner>,
}

impl GaldrDb {
    /// Creates a brand-new database file at `path`. Fails if a file
    /// already exists there.
    #[instrument(skip(options))]
    pub fn create<P: AsRef<Path>>(path: P, options: Options) -> GaldrResult<Self> {
        options.validate()?;
        let path = path.as_ref();
        if path.exists() {
            return Err(GaldrError::InvalidOperation(format!(
                "database file already exists at {}",
                path.display()
            )));
        }

        let disk = DiskManager::open(path, options.page_size)?;
        let cache = LruPageCache::new(disk, options.cache_page_count);
        let pager = PageManager::initialize(&cache, options.page_size, options.expansion_page_count)?;

        let wal_path = wal_path_for(path);
        let wal = if options.use_wal {
            Some(galdr_wal::WalWriter::open(&wal_path, options.page_size)?)
        } else {
            None
        };

        let metadata = CollectionsMetadata::default();
        let state = EngineState {
            metadata,
            version_indexes: HashMap::new(),
            committed_since_gc: 0,
        };

        let inner = Arc::new(Inner {
            path: path.to_path_buf(),
            options,
            cache,
            pager,
            wal,
            wal_path,
            txn_mgr: TransactionManager::new(0),
            latches: LatchTable::new(DeadlockPolicy::Timeout(std::time::Duration::from_secs(5))),
            state: RwLock::new(state),
            commit_lock: Mutex::new(()),
        });
        inner.persist_metadata_now()?;
        info!(path = %path.display(), "created database");
        Ok(GaldrDb { inner })
    }

    /// Opens an existing database file, replaying the WAL and rebuilding
    /// in-memory MVCC state.
    #[instrument(skip(options))]
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> GaldrResult<Self> {
        options.validate()?;
        let path = path.as_ref();
        if !path.exists() {
            return Err(GaldrError::FileNotFound(path.display().to_string()));
        }

        let disk = DiskManager::open(path, options.page_size)?;
        let cache = LruPageCache::new(disk, options.cache_page_count);

        let wal_path = wal_path_for(path);
        if options.use_wal {
            recovery::replay(&cache, &wal_path, options.page_size)?;
        }

        let pager = PageManager::load(&cache, options.expansion_page_count)?;
        let wal = if options.use_wal {
            Some(galdr_wal::WalWriter::open(&wal_path, options.page_size)?)
        } else {
            None
        };

        let metadata = metadata::load(&cache, &pager)?;
        let mut version_indexes = HashMap::new();
        for coll in &metadata.collections {
            let btree = BTree::new(&cache, &pager, MAX_INDEX_KEY_SIZE);
            let entries = btree.range(coll.primary_root_page, None, None)?;
            let live = entries
                .into_iter()
                .map(|(key, loc)| (decode_doc_id(&key), loc))
                .collect();
            version_indexes.insert(coll.name.clone(), Arc::new(VersionIndex::from_live_documents(live)));
        }

        let last_committed_tx_id = pager.last_committed_tx_id();
        let state = EngineState {
            metadata,
            version_indexes,
            committed_since_gc: 0,
        };

        let inner = Arc::new(Inner {
            path: path.to_path_buf(),
            options,
            cache,
            pager,
            wal,
            wal_path,
            txn_mgr: TransactionManager::new(last_committed_tx_id),
            latches: LatchTable::new(DeadlockPolicy::Timeout(std::time::Duration::from_secs(5))),
            state: RwLock::new(state),
            commit_lock: Mutex::new(()),
        });
        info!(path = %path.display(), "opened database");
        Ok(GaldrDb { inner })
    }

    /// Flushes the WAL's checkpoint marker and syncs the base file.
    pub fn checkpoint(&self) -> GaldrResult<()> {
        self.inner.cache.flush()?;
        if let Some(wal) = &self.inner.wal {
            wal.set_checkpoint_tx_id(self.inner.txn_mgr.last_committed_tx_id())?;
        }
        Ok(())
    }

    /// Flushes and drops the handle's resources. After this call the
    /// `GaldrDb` (and any clones) must not be used again.
    pub fn close(&self) -> GaldrResult<()> {
        self.checkpoint()
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    // ---- Schema operations ----------------------------------------------

    pub fn ensure_collection(&self, name: &str, indexes: Vec<IndexSpec>) -> GaldrResult<()> {
        if name.is_empty() {
            return Err(GaldrError::ArgumentError("collection name must not be empty".into()));
        }
        let already_exists = self.inner.state.read().metadata.find(name).is_some();
        if already_exists {
            return self.ensure_indexes(name, indexes);
        }

        let mut log = PageWriteLog::new();
        let primary_root_page = self.inner.btree().create(&mut log)?;
        let mut index_metas = Vec::with_capacity(indexes.len());
        for spec in &indexes {
            let root_page = self.inner.btree().create(&mut log)?;
            index_metas.push(IndexMeta {
                field: spec.field.clone(),
                unique: spec.unique,
                root_page,
            });
        }

        {
            let mut state = self.inner.state.write();
            state.metadata.collections.push(CollectionMeta {
                name: name.to_string(),
                next_doc_id: 1,
                primary_root_page,
                indexes: index_metas,
            });
            state
                .version_indexes
                .insert(name.to_string(), Arc::new(VersionIndex::new()));
        }

        self.inner.persist_metadata_into(&mut log)?;
        let tx_id = self.inner.txn_mgr.allocate_tx_id();
        self.inner.wal_commit(tx_id, &log)?;
        self.inner.txn_mgr.mark_committed(tx_id);
        debug!(collection = name, "collection ensured");
        Ok(())
    }

    fn ensure_indexes(&self, name: &str, indexes: Vec<IndexSpec>) -> GaldrResult<()> {
        let missing: Vec<IndexSpec> = {
            let state = self.inner.state.read();
            let coll = state.metadata.find(name).ok_or_else(|| unknown_collection(name))?;
            indexes
                .into_iter()
                .filter(|s| coll.index(&s.field).is_none())
                .collect()
        };
        if missing.is_empty() {
            return Ok(());
        }

        let mut log = PageWriteLog::new();
        let mut new_metas = Vec::with_capacity(missing.len());
        for spec in &missing {
            let root_page = self.inner.btree().create(&mut log)?;
            new_metas.push(IndexMeta {
                field: spec.field.clone(),
                unique: spec.unique,
                root_page,
            });
        }

        {
            let mut state = self.inner.state.write();
            let coll = state
                .metadata
                .find_mut(name)
                .ok_or_else(|| unknown_collection(name))?;
            coll.indexes.extend(new_metas);
        }
        self.inner.persist_metadata_into(&mut log)?;
        let tx_id = self.inner.txn_mgr.allocate_tx_id();
        self.inner.wal_commit(tx_id, &log)?;
        self.inner.txn_mgr.mark_committed(tx_id);
        Ok(())
    }

    /// Drops a collection. When `delete_documents` is true every live
    /// document's storage is reclaimed; otherwise the pages are simply
    /// abandoned (they are never reachable again and get collected on the
    /// next `vacuum()`... note: without a primary index they would be
    /// unreachable forever, which is why this always frees them).
    pub fn drop_collection(&self, name: &str) -> GaldrResult<()> {
        let removed = {
            let mut state = self.inner.state.write();
            state.version_indexes.remove(name);
            state.metadata.remove(name)
        };
        let Some(removed) = removed else {
            return Err(unknown_collection(name));
        };

        let mut log = PageWriteLog::new();
        let store = self.inner.document_store();
        let entries = self.inner.btree().range(removed.primary_root_page, None, None)?;
        for (_, loc) in entries {
            store.delete_document(&mut log, loc.page_id, loc.slot_index)?;
        }
        self.inner.persist_metadata_into(&mut log)?;
        let tx_id = self.inner.txn_mgr.allocate_tx_id();
        self.inner.wal_commit(tx_id, &log)?;
        self.inner.txn_mgr.mark_committed(tx_id);
        Ok(())
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.inner.state.read().metadata.names()
    }

    pub fn index_names(&self, collection: &str) -> GaldrResult<Vec<String>> {
        let state = self.inner.state.read();
        let coll = state.metadata.find(collection).ok_or_else(|| unknown_collection(collection))?;
        Ok(coll.indexes.iter().map(|i| i.field.clone()).collect())
    }

    pub fn drop_index(&self, collection: &str, field: &str) -> GaldrResult<()> {
        let mut state = self.inner.state.write();
        let coll = state
            .metadata
            .find_mut(collection)
            .ok_or_else(|| unknown_collection(collection))?;
        let before = coll.indexes.len();
        coll.indexes.retain(|i| i.field != field);
        if coll.indexes.len() == before {
            return Err(GaldrError::ArgumentError(format!(
                "no index on field {field} for collection {collection}"
            )));
        }
        drop(state);
        self.inner.persist_metadata_now()
    }

    // ---- Transactions -----------------------------------------------------

    pub fn begin_transaction(&self) -> Transaction {
        Transaction::begin(self.inner.clone(), false)
    }

    pub fn begin_read_only_transaction(&self) -> Transaction {
        Transaction::begin(self.inner.clone(), true)
    }

    // ---- Auto-commit convenience API ("single-operation APIs wrap
    // their action in an implicit transaction") --------------------------

    pub fn insert(&self, collection: &str, write: DocumentWrite) -> GaldrResult<DocId> {
        let mut tx = self.begin_transaction();
        let id = tx.insert(collection, write)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn replace(
        &self,
        collection: &str,
        id: DocId,
        bytes: Vec<u8>,
        index_keys: Vec<(String, Vec<u8>)>,
    ) -> GaldrResult<()> {
        let mut tx = self.begin_transaction();
        tx.replace(collection, id, bytes, index_keys)?;
        tx.commit()
    }

    pub fn delete_by_id(&self, collection: &str, id: DocId) -> GaldrResult<()> {
        let mut tx = self.begin_transaction();
        tx.delete_by_id(collection, id)?;
        tx.commit()
    }

    pub fn get_by_id(&self, collection: &str, id: DocId) -> GaldrResult<Option<Vec<u8>>> {
        let tx = self.begin_read_only_transaction();
        let result = tx.get_by_id(collection, id);
        tx.rollback();
        result
    }

    /// Range scan over a secondary index; the query
    /// expression layer that would turn `age < 30` into bounds is out of
    /// scope (out of scope for this engine) so callers pass already-computed byte bounds.
    /// Returns the indexed field's user key (DocId suffix stripped for
    /// non-unique indexes) alongside each match's document location; pair
    /// with [`Self::get_at_location`] to fetch the bytes.
    pub fn scan_index(
        &self,
        collection: &str,
        field: &str,
        lower: Option<(&[u8], bool)>,
        upper: Option<(&[u8], bool)>,
    ) -> GaldrResult<Vec<(Vec<u8>, DocumentLocation)>> {
        let state = self.inner.state.read();
        let coll = state.metadata.find(collection).ok_or_else(|| unknown_collection(collection))?;
        let idx = coll
            .index(field)
            .ok_or_else(|| GaldrError::ArgumentError(format!("no index on field {field}")))?;
        let root_page = idx.root_page;
        let unique = idx.unique;
        drop(state);

        let entries = self.inner.btree().range(root_page, lower, upper)?;
        Ok(entries
            .into_iter()
            .map(|(key, loc)| {
                let user_key = if unique { key } else { key[..key.len() - 8].to_vec() };
                (user_key, loc)
            })
            .collect())
    }

    /// Reads document bytes directly from a location returned by
    /// [`Self::scan_index`], bypassing MVCC visibility checks: callers
    /// scanning an index already hold whatever snapshot guarantee they
    /// need from the transaction that produced the location.
    pub fn get_at_location(&self, location: DocumentLocation) -> GaldrResult<Vec<u8>> {
        self.inner
            .document_store()
            .read_document(location.page_id, location.slot_index)
    }

    /// Async wrapper around [`Self::insert`] (page I/O is a suspension
    /// point for the async surface).
    pub async fn insert_async(&self, collection: String, write: DocumentWrite) -> GaldrResult<DocId> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.insert(&collection, write))
            .await
            .expect("insert_async worker task panicked")
    }

    pub async fn replace_async(
        &self,
        collection: String,
        id: DocId,
        bytes: Vec<u8>,
        index_keys: Vec<(String, Vec<u8>)>,
    ) -> GaldrResult<()> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.replace(&collection, id, bytes, index_keys))
            .await
            .expect("replace_async worker task panicked")
    }

    pub async fn delete_by_id_async(&self, collection: String, id: DocId) -> GaldrResult<()> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.delete_by_id(&collection, id))
            .await
            .expect("delete_by_id_async worker task panicked")
    }

    pub async fn get_by_id_async(&self, collection: String, id: DocId) -> GaldrResult<Option<Vec<u8>>> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.get_by_id(&collection, id))
            .await
            .expect("get_by_id_async worker task panicked")
    }

    // ---- Maintenance -------------------------------------------------------

    pub fn vacuum(&self) -> GaldrResult<VacuumReport> {
        gc::vacuum(&self.inner)
    }

    pub fn compact_to<P: AsRef<Path>>(&self, target_path: P) -> GaldrResult<CompactReport> {
        compactor::compact_to(&self.inner, target_path.as_ref())
    }
}

fn wal_path_for(path: &Path) -> PathBuf {
    path.with_extension("galdrwal")
}

fn decode_doc_id(key: &[u8]) -> DocId {
    let mut b = [0u8; 8];
    b.copy_from_slice(&key[..8]);
    DocId::from_be_bytes(b)
}

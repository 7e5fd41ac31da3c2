//! Transaction Manager: TxId allocation, the active set, and the
//! snapshot horizon used by readers and the garbage collector.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use galdr_common::TxId;

#[derive(Default)]
struct ActiveSet {
    // tx_id -> snapshot_tx_id
    entries: BTreeMap<TxId, TxId>,
}

/// Tracks in-flight transactions and the last-committed watermark. Every
/// operation is thread-safe; the active set itself is mutex-protected
/// protected by a single mutex.
pub struct TransactionManager {
    next_tx_id: AtomicU64,
    last_committed_tx_id: AtomicU64,
    active: Mutex<ActiveSet>,
}

impl TransactionManager {
    /// `last_committed_tx_id` should be the value recovered from the base
    /// file's header (or WAL replay) at open time.
    pub fn new(last_committed_tx_id: TxId) -> Self {
        Self {
            next_tx_id: AtomicU64::new(last_committed_tx_id + 1),
            last_committed_tx_id: AtomicU64::new(last_committed_tx_id),
            active: Mutex::new(ActiveSet::default()),
        }
    }

    /// Allocates a fresh, monotonically increasing TxId.
    pub fn allocate_tx_id(&self) -> TxId {
        self.next_tx_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Registers a transaction as active, recording both its own id and the
    /// snapshot it reads through. The GC horizon needs the minimum
    /// *snapshot*, not the minimum tx_id, since a transaction's tx_id is
    /// always later than the snapshot it was given at `begin`.
    pub fn register(&self, tx_id: TxId, snapshot_tx_id: TxId) {
        self.active.lock().entries.insert(tx_id, snapshot_tx_id);
    }

    /// Marks `tx_id` committed: advances the last-committed watermark (if
    /// `tx_id` is the new high-water mark) and removes it from the active
    /// set.
    pub fn mark_committed(&self, tx_id: TxId) {
        self.last_committed_tx_id.fetch_max(tx_id, Ordering::SeqCst);
        self.active.lock().entries.remove(&tx_id);
    }

    /// Removes an aborted or disposed-without-commit transaction from the
    /// active set. No watermark change.
    pub fn unregister(&self, tx_id: TxId) {
        self.active.lock().entries.remove(&tx_id);
    }

    /// The snapshot a newly started transaction should capture: the
    /// current last-committed TxId.
    pub fn get_snapshot_tx_id(&self) -> TxId {
        self.last_committed_tx_id.load(Ordering::SeqCst)
    }

    /// Oldest active transaction's TxId, or `None` if no transaction is
    /// currently active.
    pub fn oldest_active_tx_id(&self) -> Option<TxId> {
        self.active.lock().entries.keys().next().copied()
    }

    /// The oldest snapshot any currently active transaction can still read
    /// through, or `None` if no transaction is active. This, not the oldest
    /// active tx_id, is the collection horizon the Garbage Collector must
    /// respect: a transaction's own tx_id is always greater than its
    /// snapshot, so using the tx_id would let GC collect versions still
    /// visible to that transaction's snapshot.
    pub fn oldest_active_snapshot_tx_id(&self) -> Option<TxId> {
        self.active.lock().entries.values().min().copied()
    }

    pub fn last_committed_tx_id(&self) -> TxId {
        self.last_committed_tx_id.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_is_monotonic() {
        let mgr = TransactionManager::new(0);
        let a = mgr.allocate_tx_id();
        let b = mgr.allocate_tx_id();
        assert!(b > a);
    }

    #[test]
    fn commit_advances_watermark_and_clears_active() {
        let mgr = TransactionManager::new(0);
        let tx = mgr.allocate_tx_id();
        mgr.register(tx, 0);
        assert_eq!(mgr.oldest_active_tx_id(), Some(tx));
        mgr.mark_committed(tx);
        assert_eq!(mgr.last_committed_tx_id(), tx);
        assert_eq!(mgr.oldest_active_tx_id(), None);
    }

    #[test]
    fn unregister_does_not_advance_watermark() {
        let mgr = TransactionManager::new(5);
        let tx = mgr.allocate_tx_id();
        mgr.register(tx, 5);
        mgr.unregister(tx);
        assert_eq!(mgr.last_committed_tx_id(), 5);
        assert_eq!(mgr.oldest_active_tx_id(), None);
    }

    #[test]
    fn oldest_active_tracks_minimum() {
        let mgr = TransactionManager::new(0);
        let t1 = mgr.allocate_tx_id();
        let t2 = mgr.allocate_tx_id();
        mgr.register(t1, 0);
        mgr.register(t2, 0);
        assert_eq!(mgr.oldest_active_tx_id(), Some(t1));
        mgr.unregister(t1);
        assert_eq!(mgr.oldest_active_tx_id(), Some(t2));
    }

    #[test]
    fn snapshot_tx_id_reflects_last_committed() {
        let mgr = TransactionManager::new(0);
        assert_eq!(mgr.get_snapshot_tx_id(), 0);
        let tx = mgr.allocate_tx_id();
        mgr.register(tx, 0);
        mgr.mark_committed(tx);
        assert_eq!(mgr.get_snapshot_tx_id(), tx);
    }

    #[test]
    fn oldest_active_snapshot_tracks_minimum_snapshot_not_tx_id() {
        let mgr = TransactionManager::new(3);
        // Writer: tx_id=4, snapshot=3.
        let writer = mgr.allocate_tx_id();
        mgr.register(writer, 3);
        // Reader begun after, so its tx_id is larger, but its snapshot is
        // the same last-committed watermark (3) since the writer hasn't
        // committed yet.
        let reader = mgr.allocate_tx_id();
        mgr.register(reader, 3);
        assert!(reader > writer);
        mgr.mark_committed(writer);
        // Only the reader remains active: tx_id=5, snapshot=3. The horizon
        // must be 3, not 5.
        assert_eq!(mgr.oldest_active_tx_id(), Some(reader));
        assert_eq!(mgr.oldest_active_snapshot_tx_id(), Some(3));
    }
}

//! Page-structural latching used inside the Transaction Engine's commit
//! critical section when a B+-tree split/merge or Page Manager growth
//! pass needs to hold more than one page stable across several cache
//! operations. Shared/exclusive, keyed by page, not a general-purpose
//! row-level lock manager — commit itself is already serialized per engine,
//! so latches here resolve contention between the single writer and
//! concurrent readers walking the same B+-tree nodes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use galdr_common::{GaldrError, GaldrResult, PageId, TxId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlockPolicy {
    Timeout(Duration),
}

#[derive(Debug)]
struct LatchRequest {
    tx_id: TxId,
    mode: LatchMode,
}

#[derive(Debug, Default)]
struct LatchState {
    mode: Option<LatchMode>,
    holders: HashSet<TxId>,
    waiters: VecDeque<LatchRequest>,
}

#[derive(Debug, Default)]
struct LatchTableState {
    pages: HashMap<PageId, LatchState>,
    held_pages: HashMap<TxId, HashSet<PageId>>,
}

/// Per-page shared/exclusive latch table with timeout-based deadlock
/// avoidance, used by the commit critical section and the B+-tree reader
/// path it must coexist with.
pub struct LatchTable {
    state: Mutex<LatchTableState>,
    condvar: Condvar,
    policy: DeadlockPolicy,
}

impl LatchTable {
    pub fn new(policy: DeadlockPolicy) -> Self {
        Self {
            state: Mutex::new(LatchTableState::default()),
            condvar: Condvar::new(),
            policy,
        }
    }

    pub fn latch_shared(&self, tx_id: TxId, page_id: PageId) -> GaldrResult<()> {
        self.latch(tx_id, page_id, LatchMode::Shared)
    }

    pub fn latch_exclusive(&self, tx_id: TxId, page_id: PageId) -> GaldrResult<()> {
        self.latch(tx_id, page_id, LatchMode::Exclusive)
    }

    pub fn unlatch_all(&self, tx_id: TxId) {
        let mut state = self.state.lock();
        let Some(pages) = state.held_pages.remove(&tx_id) else {
            return;
        };
        for page_id in pages {
            let latch_state = state.pages.get_mut(&page_id).expect("latch state exists");
            latch_state.holders.remove(&tx_id);
            if latch_state.holders.is_empty() {
                latch_state.mode = None;
            }
        }
        self.promote_all_waiters(&mut state);
        self.condvar.notify_all();
    }

    pub fn held_pages_for(&self, tx_id: TxId) -> Vec<PageId> {
        let state = self.state.lock();
        state
            .held_pages
            .get(&tx_id)
            .map(|pages| pages.iter().copied().collect())
            .unwrap_or_default()
    }

    fn latch(&self, tx_id: TxId, page_id: PageId, mode: LatchMode) -> GaldrResult<()> {
        let mut state = self.state.lock();
        if self.holds(&state, tx_id, page_id, mode) {
            return Ok(());
        }
        let deadline = self.deadline();
        loop {
            {
                let latch_state = state.pages.entry(page_id).or_default();
                if self.can_grant(latch_state, tx_id, mode) && latch_state.waiters.is_empty() {
                    latch_state.mode = Some(mode);
                    latch_state.holders.insert(tx_id);
                    state.held_pages.entry(tx_id).or_default().insert(page_id);
                    return Ok(());
                }
                if !latch_state.waiters.iter().any(|w| w.tx_id == tx_id) {
                    latch_state.waiters.push_back(LatchRequest { tx_id, mode });
                }
            }
            state = self.wait(state, deadline)?;
        }
    }

    fn wait<'a>(
        &self,
        mut state: MutexGuard<'a, LatchTableState>,
        deadline: Option<Instant>,
    ) -> GaldrResult<MutexGuard<'a, LatchTableState>> {
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(GaldrError::InvalidOperation(
                        "latch acquisition timed out".into(),
                    ));
                }
                let remaining = deadline.saturating_duration_since(now);
                let timed_out = self.condvar.wait_for(&mut state, remaining).timed_out();
                if timed_out {
                    return Err(GaldrError::InvalidOperation(
                        "latch acquisition timed out".into(),
                    ));
                }
                Ok(state)
            }
            None => {
                self.condvar.wait(&mut state);
                Ok(state)
            }
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match self.policy {
            DeadlockPolicy::Timeout(duration) => Some(Instant::now() + duration),
        }
    }

    fn can_grant(&self, latch_state: &LatchState, tx_id: TxId, mode: LatchMode) -> bool {
        match latch_state.mode {
            None => true,
            Some(LatchMode::Shared) => {
                mode == LatchMode::Shared
                    || (latch_state.holders.len() == 1 && latch_state.holders.contains(&tx_id))
            }
            Some(LatchMode::Exclusive) => latch_state.holders.contains(&tx_id),
        }
    }

    fn holds(&self, state: &LatchTableState, tx_id: TxId, page_id: PageId, mode: LatchMode) -> bool {
        let Some(latch_state) = state.pages.get(&page_id) else {
            return false;
        };
        if !latch_state.holders.contains(&tx_id) {
            return false;
        }
        matches!(
            (latch_state.mode, mode),
            (Some(LatchMode::Exclusive), _) | (Some(LatchMode::Shared), LatchMode::Shared)
        )
    }

    fn promote_all_waiters(&self, state: &mut LatchTableState) {
        let page_ids: Vec<PageId> = state.pages.keys().copied().collect();
        for page_id in page_ids {
            self.promote_waiters(state, page_id);
        }
    }

    fn promote_waiters(&self, state: &mut LatchTableState, page_id: PageId) {
        let latch_state = state.pages.get_mut(&page_id).expect("latch state exists");
        let mut promoted_any = false;
        while let Some(request) = latch_state.waiters.front() {
            if !self.can_grant(latch_state, request.tx_id, request.mode) {
                break;
            }
            let request = latch_state.waiters.pop_front().expect("waiter exists");
            latch_state.mode = Some(request.mode);
            latch_state.holders.insert(request.tx_id);
            state
                .held_pages
                .entry(request.tx_id)
                .or_default()
                .insert(page_id);
            promoted_any = true;
            if request.mode == LatchMode::Exclusive {
                break;
            }
        }
        if promoted_any {
            self.condvar.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn table() -> LatchTable {
        LatchTable::new(DeadlockPolicy::Timeout(Duration::from_millis(200)))
    }

    #[test]
    fn shared_shared_is_compatible() {
        let table = table();
        assert!(table.latch_shared(1, 42).is_ok());
        assert!(table.latch_shared(2, 42).is_ok());
        assert_eq!(table.held_pages_for(1), vec![42]);
    }

    #[test]
    fn exclusive_blocks_shared_until_released() {
        let table = Arc::new(table());
        table.latch_exclusive(1, 7).unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let t = Arc::clone(&table);
        let b = Arc::clone(&barrier);
        let handle = thread::spawn(move || {
            b.wait();
            t.latch_shared(2, 7)
        });
        barrier.wait();
        thread::sleep(Duration::from_millis(50));
        table.unlatch_all(1);
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn conflicting_exclusive_times_out() {
        let table = Arc::new(LatchTable::new(DeadlockPolicy::Timeout(
            Duration::from_millis(50),
        )));
        table.latch_shared(1, 9).unwrap();
        let t = Arc::clone(&table);
        let handle = thread::spawn(move || t.latch_exclusive(2, 9));
        assert!(handle.join().unwrap().is_err());
    }

    #[test]
    fn upgrade_shared_to_exclusive_same_tx() {
        let table = table();
        table.latch_shared(1, 11).unwrap();
        table.latch_exclusive(1, 11).unwrap();
        assert_eq!(table.held_pages_for(1), vec![11]);
    }
}

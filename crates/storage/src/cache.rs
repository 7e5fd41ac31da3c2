//! LRU Page Cache: a bounded, thread-safe write-through cache layered over
//! Page I/O. Distinct pages must proceed in parallel; concurrent
//! misses on the same page collapse into a single underlying read; writes
//! update the cache and the backing file atomically for that page.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use galdr_common::{GaldrError, GaldrResult, PageId};

use crate::disk::DiskManager;
use crate::page::Page;

struct CacheState {
    table: std::collections::HashMap<PageId, Arc<RwLock<Page>>>,
    loading: HashSet<PageId>,
    order: VecDeque<PageId>,
}

impl CacheState {
    fn touch(&mut self, page_id: PageId) {
        if let Some(pos) = self.order.iter().position(|&id| id == page_id) {
            self.order.remove(pos);
        }
        self.order.push_front(page_id);
    }

    fn evict_if_over_capacity(&mut self, capacity: usize) {
        while self.table.len() > capacity {
            let victim = self
                .order
                .iter()
                .rev()
                .find(|id| !self.loading.contains(id))
                .copied();
            let Some(victim) = victim else { break };
            self.order.retain(|&id| id != victim);
            self.table.remove(&victim);
        }
    }
}

/// Bounded write-through page cache over a [`DiskManager`].
pub struct LruPageCache {
    disk: DiskManager,
    page_size: usize,
    capacity: usize,
    state: Mutex<CacheState>,
    cond: Condvar,
}

impl LruPageCache {
    pub fn new(disk: DiskManager, capacity: usize) -> Self {
        let page_size = disk.page_size() as usize;
        Self {
            disk,
            page_size,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState {
                table: std::collections::HashMap::new(),
                loading: HashSet::new(),
                order: VecDeque::new(),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn disk(&self) -> &DiskManager {
        &self.disk
    }

    fn check_len(&self, len: usize) -> GaldrResult<()> {
        if len != self.page_size {
            return Err(GaldrError::InvalidOperation(format!(
                "buffer length {len} does not match page size {}",
                self.page_size
            )));
        }
        Ok(())
    }

    /// Reads a page, filling `buf`. Cache hits copy under a shared lock;
    /// concurrent misses on the same page block on one another and only one
    /// of them performs the underlying disk read.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> GaldrResult<()> {
        self.check_len(buf.len())?;
        loop {
            let mut state = self.state.lock();
            if let Some(entry) = state.table.get(&page_id).cloned() {
                if state.loading.contains(&page_id) {
                    self.cond.wait(&mut state);
                    continue;
                }
                state.touch(page_id);
                drop(state);
                let guard = entry.read();
                buf.copy_from_slice(guard.data());
                return Ok(());
            }

            // Miss: claim the load so concurrent misses for this page wait
            // on us instead of each issuing their own disk read.
            state.loading.insert(page_id);
            let entry = Arc::new(RwLock::new(Page::new(self.page_size)));
            state.table.insert(page_id, Arc::clone(&entry));
            state.touch(page_id);
            state.evict_if_over_capacity(self.capacity);
            drop(state);

            let mut tmp = vec![0u8; self.page_size];
            let read_result = self.disk.read_page(page_id, &mut tmp);

            let mut state = self.state.lock();
            if let Err(err) = read_result {
                state.table.remove(&page_id);
                state.loading.remove(&page_id);
                drop(state);
                self.cond.notify_all();
                return Err(err);
            }
            let mut page = Page::new(self.page_size);
            page.set_page_id(Some(page_id));
            page.copy_from_slice(&tmp);
            *entry.write() = page;
            state.loading.remove(&page_id);
            drop(state);
            self.cond.notify_all();

            buf.copy_from_slice(&tmp);
            return Ok(());
        }
    }

    /// Writes `buf` to `page_id`, updating the cache and the backing file.
    /// The cache is never more stale than disk: there is no dirty-only
    /// caching state.
    pub fn write_page(&self, page_id: PageId, buf: &[u8]) -> GaldrResult<()> {
        self.check_len(buf.len())?;
        self.disk.write_page(page_id, buf)?;

        let mut page = Page::new(self.page_size);
        page.set_page_id(Some(page_id));
        page.copy_from_slice(buf);

        let mut state = self.state.lock();
        match state.table.get(&page_id).cloned() {
            Some(entry) => {
                *entry.write() = page;
            }
            None => {
                state.table.insert(page_id, Arc::new(RwLock::new(page)));
            }
        }
        state.touch(page_id);
        state.evict_if_over_capacity(self.capacity);
        Ok(())
    }

    /// Durable sync of the underlying file.
    pub fn flush(&self) -> GaldrResult<()> {
        self.disk.flush()
    }

    /// Grows or shrinks the backing file, dropping any cached pages that
    /// fall outside the new length.
    pub fn set_length(&self, page_count: u64) -> GaldrResult<()> {
        self.disk.set_length(page_count)?;
        let mut state = self.state.lock();
        state.table.retain(|&id, _| id < page_count);
        state.order.retain(|&id| id < page_count);
        Ok(())
    }

    pub fn page_count(&self) -> GaldrResult<u64> {
        self.disk.page_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::tempdir;

    fn new_cache(capacity: usize) -> LruPageCache {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.db");
        std::mem::forget(dir);
        let disk = DiskManager::open(&path, 4096).unwrap();
        LruPageCache::new(disk, capacity)
    }

    #[test]
    fn write_then_read_hits_cache() {
        let cache = new_cache(4);
        cache.write_page(1, &vec![7u8; 4096]).unwrap();
        let mut buf = vec![0u8; 4096];
        cache.read_page(1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[test]
    fn eviction_respects_capacity() {
        let cache = new_cache(2);
        for id in 0..5u64 {
            cache.write_page(id, &vec![id as u8; 4096]).unwrap();
        }
        let state = cache.state.lock();
        assert!(state.table.len() <= 2);
    }

    #[test]
    fn concurrent_reads_of_distinct_pages_progress() {
        let cache = Arc::new(new_cache(8));
        for id in 0..4u64 {
            cache.write_page(id, &vec![id as u8; 4096]).unwrap();
        }
        let barrier = Arc::new(Barrier::new(4));
        let mut handles = vec![];
        for id in 0..4u64 {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                let mut buf = vec![0u8; 4096];
                cache.read_page(id, &mut buf).unwrap();
                assert!(buf.iter().all(|&b| b == id as u8));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn wrong_buffer_length_is_invalid_operation() {
        let cache = new_cache(2);
        let buf = vec![0u8; 10];
        assert!(matches!(
            cache.read_page(0, &mut buf.clone()),
            Err(GaldrError::InvalidOperation(_))
        ));
    }
}

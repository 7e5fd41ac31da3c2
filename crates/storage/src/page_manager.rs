//! Page Manager: owns the database header, the allocation bitmap, and
//! the Free-Space Map (FSM); grows the file and relocates both structures
//! when they outgrow their current range.

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::RwLock;

use galdr_common::{FreeClass, GaldrError, GaldrResult, PageId, PageType, TxId};

use crate::cache::LruPageCache;
use crate::write_log::PageWriteLog;

pub const HEADER_MAGIC: u32 = 0x4741_4C44; // "GALD"
pub const HEADER_VERSION: u32 = 1;

// Header field byte offsets within page 0.
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_PAGE_SIZE: usize = 8;
const OFF_TOTAL_PAGE_COUNT: usize = 12;
const OFF_BITMAP_START: usize = 20;
const OFF_BITMAP_COUNT: usize = 24;
const OFF_FSM_START: usize = 28;
const OFF_FSM_COUNT: usize = 32;
const OFF_COLLECTIONS_ROOT: usize = 36;
const OFF_LAST_COMMITTED_TX_ID: usize = 40;
const OFF_CHECKSUM: usize = 48;
const HEADER_CHECKSUM_LEN: usize = 48;

#[derive(Debug, Clone)]
pub struct Header {
    pub page_size: u32,
    pub total_page_count: u64,
    pub bitmap_start_page: u32,
    pub bitmap_page_count: u32,
    pub fsm_start_page: u32,
    pub fsm_page_count: u32,
    pub collections_metadata_root_page: u32,
    pub last_committed_tx_id: TxId,
}

impl Header {
    fn to_bytes(&self, page_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; page_size];
        LittleEndian::write_u32(&mut buf[OFF_MAGIC..], HEADER_MAGIC);
        LittleEndian::write_u32(&mut buf[OFF_VERSION..], HEADER_VERSION);
        LittleEndian::write_u32(&mut buf[OFF_PAGE_SIZE..], self.page_size);
        LittleEndian::write_u64(&mut buf[OFF_TOTAL_PAGE_COUNT..], self.total_page_count);
        LittleEndian::write_u32(&mut buf[OFF_BITMAP_START..], self.bitmap_start_page);
        LittleEndian::write_u32(&mut buf[OFF_BITMAP_COUNT..], self.bitmap_page_count);
        LittleEndian::write_u32(&mut buf[OFF_FSM_START..], self.fsm_start_page);
        LittleEndian::write_u32(&mut buf[OFF_FSM_COUNT..], self.fsm_page_count);
        LittleEndian::write_u32(
            &mut buf[OFF_COLLECTIONS_ROOT..],
            self.collections_metadata_root_page,
        );
        LittleEndian::write_u64(&mut buf[OFF_LAST_COMMITTED_TX_ID..], self.last_committed_tx_id);
        let checksum = crc32fast::hash(&buf[..HEADER_CHECKSUM_LEN]);
        LittleEndian::write_u32(&mut buf[OFF_CHECKSUM..], checksum);
        buf
    }

    fn from_bytes(buf: &[u8]) -> GaldrResult<Self> {
        let magic = LittleEndian::read_u32(&buf[OFF_MAGIC..]);
        if magic != HEADER_MAGIC {
            return Err(GaldrError::InvalidData(format!(
                "header magic mismatch: expected {HEADER_MAGIC:#x}, found {magic:#x}"
            )));
        }
        let checksum = LittleEndian::read_u32(&buf[OFF_CHECKSUM..]);
        let computed = crc32fast::hash(&buf[..HEADER_CHECKSUM_LEN]);
        if checksum != computed {
            return Err(GaldrError::InvalidData(
                "header checksum mismatch".to_string(),
            ));
        }
        Ok(Self {
            page_size: LittleEndian::read_u32(&buf[OFF_PAGE_SIZE..]),
            total_page_count: LittleEndian::read_u64(&buf[OFF_TOTAL_PAGE_COUNT..]),
            bitmap_start_page: LittleEndian::read_u32(&buf[OFF_BITMAP_START..]),
            bitmap_page_count: LittleEndian::read_u32(&buf[OFF_BITMAP_COUNT..]),
            fsm_start_page: LittleEndian::read_u32(&buf[OFF_FSM_START..]),
            fsm_page_count: LittleEndian::read_u32(&buf[OFF_FSM_COUNT..]),
            collections_metadata_root_page: LittleEndian::read_u32(&buf[OFF_COLLECTIONS_ROOT..]),
            last_committed_tx_id: LittleEndian::read_u64(&buf[OFF_LAST_COMMITTED_TX_ID..]),
        })
    }
}

struct Bookkeeping {
    header: Header,
    bitmap: Vec<u8>,
    fsm: Vec<u8>,
}

/// Owns header/bitmap/FSM bookkeeping for one open database. Bitmap and FSM
/// are kept fully resident (they are a tiny fraction of file size) and
/// written through to their backing pages on every mutation.
pub struct PageManager {
    page_size: u32,
    expansion_page_count: u32,
    state: RwLock<Bookkeeping>,
}

fn bitmap_pages_needed(total_page_count: u64, page_size: u32) -> u32 {
    let bits_per_page = page_size as u64 * 8;
    (total_page_count.div_ceil(bits_per_page)).max(1) as u32
}

fn fsm_pages_needed(total_page_count: u64, page_size: u32) -> u32 {
    let entries_per_page = page_size as u64 * 4; // 2 bits per page -> 4 entries/byte
    (total_page_count.div_ceil(entries_per_page)).max(1) as u32
}

impl PageManager {
    /// Initializes a brand-new database's header/bitmap/FSM layout and
    /// writes the reserved pages through `cache`.
    pub fn initialize(
        cache: &LruPageCache,
        page_size: u32,
        expansion_page_count: u32,
    ) -> GaldrResult<Self> {
        let mut total: u64 = expansion_page_count.max(8) as u64;
        loop {
            let bitmap_pages = bitmap_pages_needed(total, page_size);
            let fsm_pages = fsm_pages_needed(total, page_size);
            let reserved = 1 + bitmap_pages as u64 + fsm_pages as u64 + 1; // header + bitmap + fsm + collections root
            if reserved <= total {
                break;
            }
            total += expansion_page_count.max(8) as u64;
        }

        let bitmap_page_count = bitmap_pages_needed(total, page_size);
        let fsm_page_count = fsm_pages_needed(total, page_size);
        let bitmap_start_page = 1u32;
        let fsm_start_page = bitmap_start_page + bitmap_page_count;
        let collections_metadata_root_page = fsm_start_page + fsm_page_count;

        let mut bitmap = vec![0u8; (bitmap_page_count as usize) * page_size as usize];
        let mut fsm = vec![0u8; (fsm_page_count as usize) * page_size as usize];

        let reserved_end = collections_metadata_root_page as u64 + 1;
        for page_id in 0..reserved_end {
            set_bit(&mut bitmap, page_id, true);
            set_fsm_class(&mut fsm, page_id, FreeClass::Full);
        }

        let header = Header {
            page_size,
            total_page_count: total,
            bitmap_start_page,
            bitmap_page_count,
            fsm_start_page,
            fsm_page_count,
            collections_metadata_root_page,
            last_committed_tx_id: 0,
        };

        cache.set_length(total)?;
        cache.write_page(0, &header.to_bytes(page_size as usize))?;
        write_region(cache, bitmap_start_page, page_size, &bitmap)?;
        write_region(cache, fsm_start_page, page_size, &fsm)?;
        cache.write_page(
            collections_metadata_root_page as u64,
            &vec![0u8; page_size as usize],
        )?;
        cache.flush()?;

        Ok(Self {
            page_size,
            expansion_page_count: expansion_page_count.max(1),
            state: RwLock::new(Bookkeeping {
                header,
                bitmap,
                fsm,
            }),
        })
    }

    /// Loads header/bitmap/FSM from an existing database file.
    pub fn load(cache: &LruPageCache, expansion_page_count: u32) -> GaldrResult<Self> {
        let mut header_buf = vec![0u8; cache.page_size()];
        cache.read_page(0, &mut header_buf)?;
        let header = Header::from_bytes(&header_buf)?;

        let mut bitmap = vec![0u8; header.bitmap_page_count as usize * header.page_size as usize];
        read_region(cache, header.bitmap_start_page, header.page_size, &mut bitmap)?;
        let mut fsm = vec![0u8; header.fsm_page_count as usize * header.page_size as usize];
        read_region(cache, header.fsm_start_page, header.page_size, &mut fsm)?;

        let page_size = header.page_size;
        Ok(Self {
            page_size,
            expansion_page_count: expansion_page_count.max(1),
            state: RwLock::new(Bookkeeping {
                header,
                bitmap,
                fsm,
            }),
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn collections_metadata_root_page(&self) -> PageId {
        self.state.read().header.collections_metadata_root_page as PageId
    }

    pub fn last_committed_tx_id(&self) -> TxId {
        self.state.read().header.last_committed_tx_id
    }

    pub fn total_page_count(&self) -> u64 {
        self.state.read().header.total_page_count
    }

    pub fn is_allocated(&self, page_id: PageId) -> bool {
        let state = self.state.read();
        get_bit(&state.bitmap, page_id)
    }

    pub fn free_class(&self, page_id: PageId) -> FreeClass {
        let state = self.state.read();
        get_fsm_class(&state.fsm, page_id)
    }

    /// Records the header in `log` and writes it through `cache`. Called
    /// whenever `last_committed_tx_id` changes at commit time.
    pub fn set_last_committed_tx_id(
        &self,
        cache: &LruPageCache,
        log: &mut PageWriteLog,
        tx_id: TxId,
    ) -> GaldrResult<()> {
        let mut state = self.state.write();
        state.header.last_committed_tx_id = tx_id;
        let bytes = state.header.to_bytes(self.page_size as usize);
        drop(state);
        cache.write_page(0, &bytes)?;
        log.record(0, PageType::Header, bytes);
        Ok(())
    }

    /// Finds the first free page at or above `min_class`, growing the file
    /// if none exists, and marks it allocated.
    pub fn allocate_page(
        &self,
        cache: &LruPageCache,
        log: &mut PageWriteLog,
    ) -> GaldrResult<PageId> {
        {
            let mut state = self.state.write();
            if let Some(page_id) = find_free_bit(&state.bitmap, state.header.total_page_count) {
                set_bit(&mut state.bitmap, page_id, true);
                set_fsm_class(&mut state.fsm, page_id, FreeClass::MostlyFree);
                self.persist_bit_region(&state, cache, log, page_id)?;
                self.persist_fsm_region(&state, cache, log, page_id)?;
                return Ok(page_id);
            }
        }
        self.grow(cache, log)?;
        let mut state = self.state.write();
        let page_id = find_free_bit(&state.bitmap, state.header.total_page_count)
            .ok_or_else(|| GaldrError::InvalidData("growth did not yield a free page".into()))?;
        set_bit(&mut state.bitmap, page_id, true);
        set_fsm_class(&mut state.fsm, page_id, FreeClass::MostlyFree);
        self.persist_bit_region(&state, cache, log, page_id)?;
        self.persist_fsm_region(&state, cache, log, page_id)?;
        Ok(page_id)
    }

    pub fn deallocate_page(
        &self,
        cache: &LruPageCache,
        log: &mut PageWriteLog,
        page_id: PageId,
    ) -> GaldrResult<()> {
        let mut state = self.state.write();
        set_bit(&mut state.bitmap, page_id, false);
        set_fsm_class(&mut state.fsm, page_id, FreeClass::MostlyFree);
        self.persist_bit_region(&state, cache, log, page_id)?;
        self.persist_fsm_region(&state, cache, log, page_id)?;
        Ok(())
    }

    pub fn mark_level(
        &self,
        cache: &LruPageCache,
        log: &mut PageWriteLog,
        page_id: PageId,
        class: FreeClass,
    ) -> GaldrResult<()> {
        let mut state = self.state.write();
        set_fsm_class(&mut state.fsm, page_id, class);
        self.persist_fsm_region(&state, cache, log, page_id)?;
        Ok(())
    }

    /// Marks `page_id` permanently full in the FSM so it is never again
    /// returned as a candidate — used for continuation pages.
    pub fn exclude_from_candidacy(
        &self,
        cache: &LruPageCache,
        log: &mut PageWriteLog,
        page_id: PageId,
    ) -> GaldrResult<()> {
        self.mark_level(cache, log, page_id, FreeClass::Full)
    }

    /// Finds a page whose FSM class is at least `min_class`, without
    /// allocating it. Returns `None` if none exists; the caller then falls
    /// back to `allocate_page`.
    pub fn find_free_page(&self, min_class: FreeClass) -> Option<PageId> {
        let state = self.state.read();
        let total_bytes = state.fsm.len();
        for byte_idx in 0..total_bytes {
            let byte = state.fsm[byte_idx];
            if byte == 0 {
                continue;
            }
            for slot in 0..4 {
                let page_id = (byte_idx as u64) * 4 + slot as u64;
                if page_id >= state.header.total_page_count {
                    break;
                }
                if !get_bit(&state.bitmap, page_id) {
                    continue;
                }
                let bits = (byte >> (slot * 2)) & 0b11;
                let class = FreeClass::from_bits(bits);
                if class >= min_class && class != FreeClass::Full {
                    return Some(page_id);
                }
            }
        }
        None
    }

    fn persist_bit_region(
        &self,
        state: &Bookkeeping,
        cache: &LruPageCache,
        log: &mut PageWriteLog,
        page_id: PageId,
    ) -> GaldrResult<()> {
        let bit_page_index = (page_id / (self.page_size as u64 * 8)) as u32;
        let bitmap_page_id = (state.header.bitmap_start_page + bit_page_index) as PageId;
        let start = bit_page_index as usize * self.page_size as usize;
        let end = start + self.page_size as usize;
        let bytes = state.bitmap[start..end].to_vec();
        cache.write_page(bitmap_page_id, &bytes)?;
        log.record(bitmap_page_id, PageType::Bitmap, bytes);
        Ok(())
    }

    fn persist_fsm_region(
        &self,
        state: &Bookkeeping,
        cache: &LruPageCache,
        log: &mut PageWriteLog,
        page_id: PageId,
    ) -> GaldrResult<()> {
        let fsm_page_index = (page_id / (self.page_size as u64 * 4)) as u32;
        let fsm_page_id = (state.header.fsm_start_page + fsm_page_index) as PageId;
        let start = fsm_page_index as usize * self.page_size as usize;
        let end = start + self.page_size as usize;
        let bytes = state.fsm[start..end].to_vec();
        cache.write_page(fsm_page_id, &bytes)?;
        log.record(fsm_page_id, PageType::FreeSpaceMap, bytes);
        Ok(())
    }

    /// Growth protocol: doubles capacity (minimum `expansion_page_count`
    /// granularity) until the bitmap/FSM can address the new range, relocating
    /// both to a freshly allocated contiguous region when they must grow.
    fn grow(&self, cache: &LruPageCache, log: &mut PageWriteLog) -> GaldrResult<()> {
        let mut state = self.state.write();
        let old_total = state.header.total_page_count;
        let mut new_total = old_total;
        loop {
            new_total = (new_total * 2).max(new_total + self.expansion_page_count as u64);
            let bitmap_pages = bitmap_pages_needed(new_total, self.page_size);
            let fsm_pages = fsm_pages_needed(new_total, self.page_size);
            if bitmap_pages <= state.header.bitmap_page_count
                && fsm_pages <= state.header.fsm_page_count
            {
                // No relocation needed; just extending the addressable range
                // is enough as long as existing bitmap/FSM already cover it.
                break;
            }
            // Relocating: place the larger bitmap/FSM at the tail of the
            // newly grown range.
            let new_bitmap_pages = bitmap_pages_needed(new_total, self.page_size);
            let new_fsm_pages = fsm_pages_needed(new_total, self.page_size);
            let new_bitmap_start = new_total as u32 - new_bitmap_pages - new_fsm_pages;
            let new_fsm_start = new_bitmap_start + new_bitmap_pages;

            let mut new_bitmap = vec![0u8; new_bitmap_pages as usize * self.page_size as usize];
            let mut new_fsm = vec![0u8; new_fsm_pages as usize * self.page_size as usize];
            new_bitmap[..state.bitmap.len()].copy_from_slice(&state.bitmap);
            new_fsm[..state.fsm.len()].copy_from_slice(&state.fsm);

            // (a) allocate the new range in the old (copied) bitmap, before
            // freeing the old range, so replay never sees an inconsistent
            // header so replay never observes a half-relocated bitmap/FSM.
            for page_id in new_bitmap_start as u64..(new_fsm_start + new_fsm_pages) as u64 {
                set_bit(&mut new_bitmap, page_id, true);
                set_fsm_class(&mut new_fsm, page_id, FreeClass::Full);
            }
            // Old bitmap/FSM pages become ordinary free data pages.
            for page_id in
                state.header.bitmap_start_page as u64..(state.header.bitmap_start_page
                    + state.header.bitmap_page_count) as u64
            {
                set_bit(&mut new_bitmap, page_id, false);
                set_fsm_class(&mut new_fsm, page_id, FreeClass::MostlyFree);
            }
            for page_id in
                state.header.fsm_start_page as u64..(state.header.fsm_start_page
                    + state.header.fsm_page_count) as u64
            {
                set_bit(&mut new_bitmap, page_id, false);
                set_fsm_class(&mut new_fsm, page_id, FreeClass::MostlyFree);
            }

            state.header.bitmap_start_page = new_bitmap_start;
            state.header.bitmap_page_count = new_bitmap_pages;
            state.header.fsm_start_page = new_fsm_start;
            state.header.fsm_page_count = new_fsm_pages;
            state.bitmap = new_bitmap;
            state.fsm = new_fsm;
            break;
        }

        state.header.total_page_count = new_total;
        cache.set_length(new_total)?;

        write_region(cache, state.header.bitmap_start_page, self.page_size, &state.bitmap)?;
        write_region(cache, state.header.fsm_start_page, self.page_size, &state.fsm)?;
        for (i, chunk) in state.bitmap.chunks(self.page_size as usize).enumerate() {
            log.record(
                (state.header.bitmap_start_page as u64) + i as u64,
                PageType::Bitmap,
                chunk.to_vec(),
            );
        }
        for (i, chunk) in state.fsm.chunks(self.page_size as usize).enumerate() {
            log.record(
                (state.header.fsm_start_page as u64) + i as u64,
                PageType::FreeSpaceMap,
                chunk.to_vec(),
            );
        }

        // (c)/(d)/(e): header WAL-framed and committed by the caller, which
        // always calls `set_last_committed_tx_id` (or records the header
        // directly) as part of the same commit batch this growth occurred in.
        let header_bytes = state.header.to_bytes(self.page_size as usize);
        cache.write_page(0, &header_bytes)?;
        log.record(0, PageType::Header, header_bytes);

        Ok(())
    }
}

fn write_region(cache: &LruPageCache, start_page: u32, page_size: u32, data: &[u8]) -> GaldrResult<()> {
    for (i, chunk) in data.chunks(page_size as usize).enumerate() {
        let mut buf = chunk.to_vec();
        buf.resize(page_size as usize, 0);
        cache.write_page((start_page as u64) + i as u64, &buf)?;
    }
    Ok(())
}

fn read_region(
    cache: &LruPageCache,
    start_page: u32,
    page_size: u32,
    out: &mut [u8],
) -> GaldrResult<()> {
    for (i, chunk) in out.chunks_mut(page_size as usize).enumerate() {
        cache.read_page((start_page as u64) + i as u64, chunk)?;
    }
    Ok(())
}

fn get_bit(bitmap: &[u8], page_id: PageId) -> bool {
    let byte = bitmap.get(page_id as usize / 8).copied().unwrap_or(0);
    (byte >> (page_id % 8)) & 1 == 1
}

fn set_bit(bitmap: &mut [u8], page_id: PageId, value: bool) {
    let idx = page_id as usize / 8;
    if idx >= bitmap.len() {
        return;
    }
    let mask = 1u8 << (page_id % 8);
    if value {
        bitmap[idx] |= mask;
    } else {
        bitmap[idx] &= !mask;
    }
}

fn find_free_bit(bitmap: &[u8], total_page_count: u64) -> Option<PageId> {
    for page_id in 0..total_page_count {
        if !get_bit(bitmap, page_id) {
            return Some(page_id);
        }
    }
    None
}

fn get_fsm_class(fsm: &[u8], page_id: PageId) -> FreeClass {
    let byte_idx = page_id as usize / 4;
    let slot = (page_id % 4) as u32;
    let byte = fsm.get(byte_idx).copied().unwrap_or(0);
    FreeClass::from_bits(byte >> (slot * 2))
}

fn set_fsm_class(fsm: &mut [u8], page_id: PageId, class: FreeClass) {
    let byte_idx = page_id as usize / 4;
    if byte_idx >= fsm.len() {
        return;
    }
    let slot = (page_id % 4) as u32;
    let mask = 0b11u8 << (slot * 2);
    fsm[byte_idx] = (fsm[byte_idx] & !mask) | (class.to_bits() << (slot * 2));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskManager;
    use tempfile::tempdir;

    fn new_cache() -> LruPageCache {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pm.db");
        std::mem::forget(dir);
        LruPageCache::new(DiskManager::open(&path, 4096).unwrap(), 64)
    }

    #[test]
    fn initialize_reserves_header_bitmap_fsm_and_metadata() {
        let cache = new_cache();
        let pm = PageManager::initialize(&cache, 4096, 8).unwrap();
        assert!(pm.is_allocated(0));
        assert!(pm.is_allocated(pm.collections_metadata_root_page()));
    }

    #[test]
    fn allocate_and_deallocate_round_trip() {
        let cache = new_cache();
        let pm = PageManager::initialize(&cache, 4096, 8).unwrap();
        let mut log = PageWriteLog::new();
        let page_id = pm.allocate_page(&cache, &mut log).unwrap();
        assert!(pm.is_allocated(page_id));
        pm.deallocate_page(&cache, &mut log, page_id).unwrap();
        assert!(!pm.is_allocated(page_id));
    }

    #[test]
    fn growth_triggers_when_bitmap_exhausted() {
        let cache = new_cache();
        let pm = PageManager::initialize(&cache, 4096, 8).unwrap();
        let mut log = PageWriteLog::new();
        let before = pm.total_page_count();
        for _ in 0..before * 2 {
            pm.allocate_page(&cache, &mut log).unwrap();
        }
        assert!(pm.total_page_count() > before);
    }

    #[test]
    fn reload_preserves_allocation_state() {
        let cache = new_cache();
        let page_id = {
            let pm = PageManager::initialize(&cache, 4096, 8).unwrap();
            let mut log = PageWriteLog::new();
            let page_id = pm.allocate_page(&cache, &mut log).unwrap();
            cache.flush().unwrap();
            page_id
        };
        let pm2 = PageManager::load(&cache, 8).unwrap();
        assert!(pm2.is_allocated(page_id));
    }
}

//! Slotted Page and Overflow: a slot directory growing forward from
//! the page header, payload bytes growing backward from the page end. Slot
//! indexes are stable physical addresses for the life of the page.

use byteorder::{ByteOrder, LittleEndian};

use galdr_common::{GaldrError, GaldrResult, PageId, SlotIndex};

pub const PAGE_HEADER_SIZE: usize = 16;
pub const SLOT_SIZE: usize = 16;

const OFF_PAGE_TYPE: usize = 0;
const OFF_IS_CONTINUATION: usize = 1;
const OFF_SLOT_COUNT: usize = 2;
const OFF_FREE_START: usize = 4;
const OFF_FREE_END: usize = 6;
const OFF_NEXT_CONTINUATION: usize = 8;

// Slot entry layout, relative to its own start:
const SLOT_OFF_OFFSET: usize = 0;
const SLOT_OFF_LENGTH: usize = 2;
const SLOT_OFF_FLAGS: usize = 4;
const SLOT_OFF_CONTINUATION: usize = 8;
const FLAG_TOMBSTONE: u8 = 0b0000_0001;

#[derive(Debug, Clone, Copy)]
pub struct SlotEntry {
    pub offset: u16,
    pub length: u16,
    pub tombstone: bool,
    pub continuation_page_id: PageId,
}

/// A read/write view over one page's bytes as a slotted page.
pub struct SlottedPage<'a> {
    buf: &'a mut [u8],
}

impl<'a> SlottedPage<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }

    /// Initializes a fresh, empty slotted page in `buf`.
    pub fn format(buf: &mut [u8], page_type: u8, is_continuation: bool) {
        buf.fill(0);
        buf[OFF_PAGE_TYPE] = page_type;
        buf[OFF_IS_CONTINUATION] = is_continuation as u8;
        LittleEndian::write_u16(&mut buf[OFF_SLOT_COUNT..], 0);
        LittleEndian::write_u16(&mut buf[OFF_FREE_START..], PAGE_HEADER_SIZE as u16);
        LittleEndian::write_u16(&mut buf[OFF_FREE_END..], buf.len() as u16);
        LittleEndian::write_u64(&mut buf[OFF_NEXT_CONTINUATION..], 0);
    }

    pub fn page_type(&self) -> u8 {
        self.buf[OFF_PAGE_TYPE]
    }

    pub fn is_continuation(&self) -> bool {
        self.buf[OFF_IS_CONTINUATION] != 0
    }

    pub fn slot_count(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[OFF_SLOT_COUNT..])
    }

    fn set_slot_count(&mut self, count: u16) {
        LittleEndian::write_u16(&mut self.buf[OFF_SLOT_COUNT..], count);
    }

    fn free_start(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[OFF_FREE_START..])
    }

    fn set_free_start(&mut self, v: u16) {
        LittleEndian::write_u16(&mut self.buf[OFF_FREE_START..], v);
    }

    fn free_end(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[OFF_FREE_END..])
    }

    fn set_free_end(&mut self, v: u16) {
        LittleEndian::write_u16(&mut self.buf[OFF_FREE_END..], v);
    }

    pub fn next_continuation_page_id(&self) -> PageId {
        LittleEndian::read_u64(&self.buf[OFF_NEXT_CONTINUATION..])
    }

    pub fn set_next_continuation_page_id(&mut self, page_id: PageId) {
        LittleEndian::write_u64(&mut self.buf[OFF_NEXT_CONTINUATION..], page_id);
    }

    fn slot_entry_offset(index: SlotIndex) -> usize {
        PAGE_HEADER_SIZE + index as usize * SLOT_SIZE
    }

    fn read_slot(&self, index: SlotIndex) -> SlotEntry {
        let base = Self::slot_entry_offset(index);
        SlotEntry {
            offset: LittleEndian::read_u16(&self.buf[base + SLOT_OFF_OFFSET..]),
            length: LittleEndian::read_u16(&self.buf[base + SLOT_OFF_LENGTH..]),
            tombstone: self.buf[base + SLOT_OFF_FLAGS] & FLAG_TOMBSTONE != 0,
            continuation_page_id: LittleEndian::read_u64(&self.buf[base + SLOT_OFF_CONTINUATION..]),
        }
    }

    fn write_slot(&mut self, index: SlotIndex, entry: SlotEntry) {
        let base = Self::slot_entry_offset(index);
        LittleEndian::write_u16(&mut self.buf[base + SLOT_OFF_OFFSET..], entry.offset);
        LittleEndian::write_u16(&mut self.buf[base + SLOT_OFF_LENGTH..], entry.length);
        self.buf[base + SLOT_OFF_FLAGS] = if entry.tombstone { FLAG_TOMBSTONE } else { 0 };
        LittleEndian::write_u64(
            &mut self.buf[base + SLOT_OFF_CONTINUATION..],
            entry.continuation_page_id,
        );
    }

    fn check_index(&self, index: SlotIndex) -> GaldrResult<()> {
        if index as u16 >= self.slot_count() {
            return Err(GaldrError::OutOfRange(format!(
                "slot index {index} >= slot count {}",
                self.slot_count()
            )));
        }
        Ok(())
    }

    pub fn slot(&self, index: SlotIndex) -> GaldrResult<SlotEntry> {
        self.check_index(index)?;
        Ok(self.read_slot(index))
    }

    /// Returns `(tombstone, payload)` for a slot. Fails `OutOfRange` if the
    /// index doesn't exist.
    pub fn get(&self, index: SlotIndex) -> GaldrResult<(bool, &[u8])> {
        self.check_index(index)?;
        let entry = self.read_slot(index);
        if entry.tombstone {
            return Ok((true, &[]));
        }
        let start = entry.offset as usize;
        let end = start + entry.length as usize;
        Ok((false, &self.buf[start..end]))
    }

    /// Contiguous free space between the slot array and the payload area.
    pub fn contiguous_free(&self) -> usize {
        self.free_end() as usize - self.free_start() as usize
    }

    /// Total free space recoverable by `compact` (contiguous free plus the
    /// space occupied by tombstoned payloads).
    pub fn total_free(&self) -> usize {
        let mut tombstoned = 0usize;
        for i in 0..self.slot_count() {
            let entry = self.read_slot(i);
            if entry.tombstone {
                tombstoned += entry.length as usize;
            }
        }
        self.contiguous_free() + tombstoned
    }

    /// Inserts `bytes` as a new slot if contiguous space allows; returns
    /// `None` if it does not fit without compaction or overflow.
    pub fn put(&mut self, bytes: &[u8]) -> Option<SlotIndex> {
        let needed = bytes.len() + SLOT_SIZE;
        if needed > self.contiguous_free() {
            return None;
        }
        let new_offset = self.free_end() as usize - bytes.len();
        self.buf[new_offset..new_offset + bytes.len()].copy_from_slice(bytes);
        self.set_free_end(new_offset as u16);

        let index = self.slot_count();
        self.write_slot(
            index,
            SlotEntry {
                offset: new_offset as u16,
                length: bytes.len() as u16,
                tombstone: false,
                continuation_page_id: 0,
            },
        );
        self.set_slot_count(index + 1);
        self.set_free_start(self.free_start() + SLOT_SIZE as u16);
        Some(index)
    }

    /// Sets a head slot's continuation pointer (used when the document
    /// overflows onto continuation pages).
    pub fn set_slot_continuation(&mut self, index: SlotIndex, continuation_page_id: PageId) -> GaldrResult<()> {
        self.check_index(index)?;
        let mut entry = self.read_slot(index);
        entry.continuation_page_id = continuation_page_id;
        self.write_slot(index, entry);
        Ok(())
    }

    /// Tombstones a slot without moving payload bytes. Returns the slot's
    /// continuation page id (0 if none) so the caller can free that chain.
    pub fn delete(&mut self, index: SlotIndex) -> GaldrResult<PageId> {
        self.check_index(index)?;
        let mut entry = self.read_slot(index);
        let continuation = entry.continuation_page_id;
        entry.tombstone = true;
        self.write_slot(index, entry);
        Ok(continuation)
    }

    /// Slides all live payloads together to reclaim tombstoned holes. Live
    /// slot indexes are never renumbered; only the payload bytes move.
    /// Tombstoned slots have their length zeroed so `total_free` doesn't
    /// keep counting bytes this call already reclaimed.
    pub fn compact(&mut self) {
        let slot_count = self.slot_count();
        let mut live: Vec<(SlotIndex, Vec<u8>)> = Vec::new();
        for i in 0..slot_count {
            let entry = self.read_slot(i);
            if entry.tombstone {
                if entry.length != 0 {
                    let mut cleared = entry;
                    cleared.offset = 0;
                    cleared.length = 0;
                    self.write_slot(i, cleared);
                }
            } else {
                let start = entry.offset as usize;
                let end = start + entry.length as usize;
                live.push((i, self.buf[start..end].to_vec()));
            }
        }
        let mut cursor = self.buf.len();
        for (index, payload) in live {
            cursor -= payload.len();
            self.buf[cursor..cursor + payload.len()].copy_from_slice(&payload);
            let mut entry = self.read_slot(index);
            entry.offset = cursor as u16;
            self.write_slot(index, entry);
        }
        self.set_free_end(cursor as u16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_page(size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; size];
        SlottedPage::format(&mut buf, 3, false);
        buf
    }

    #[test]
    fn put_and_get_roundtrip() {
        let mut buf = fresh_page(4096);
        let mut page = SlottedPage::new(&mut buf);
        let idx = page.put(b"hello").unwrap();
        let (tombstone, bytes) = page.get(idx).unwrap();
        assert!(!tombstone);
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn delete_preserves_slot_index_of_others() {
        let mut buf = fresh_page(4096);
        let mut page = SlottedPage::new(&mut buf);
        let a = page.put(&vec![1u8; 1000]).unwrap();
        let b = page.put(&vec![2u8; 1000]).unwrap();
        let c = page.put(&vec![3u8; 1000]).unwrap();
        page.delete(a).unwrap();
        page.delete(b).unwrap();
        let (_, bytes) = page.get(c).unwrap();
        assert_eq!(bytes, vec![3u8; 1000]);

        let new_idx = page.put(&vec![4u8; 1500]).unwrap();
        assert_eq!(new_idx, 3);
        let (_, bytes) = page.get(c).unwrap();
        assert_eq!(bytes, vec![3u8; 1000]);
    }

    #[test]
    fn out_of_range_errors() {
        let mut buf = fresh_page(4096);
        let page = SlottedPage::new(&mut buf);
        assert!(matches!(page.get(0), Err(GaldrError::OutOfRange(_))));
    }

    #[test]
    fn compact_frees_tombstoned_space_without_renumbering() {
        let mut buf = fresh_page(4096);
        let mut page = SlottedPage::new(&mut buf);
        let a = page.put(&vec![1u8; 1500]).unwrap();
        let b = page.put(&vec![2u8; 1500]).unwrap();
        page.delete(a).unwrap();
        let before = page.contiguous_free();
        page.compact();
        assert!(page.contiguous_free() > before);
        let (_, bytes) = page.get(b).unwrap();
        assert_eq!(bytes, vec![2u8; 1500]);
    }

    #[test]
    fn total_free_does_not_double_count_after_compact() {
        let mut buf = fresh_page(4096);
        let mut page = SlottedPage::new(&mut buf);
        let a = page.put(&vec![1u8; 1500]).unwrap();
        page.put(&vec![2u8; 1500]).unwrap();
        page.delete(a).unwrap();
        // Before compact, total_free already counts the tombstoned slot.
        let total_before = page.total_free();
        page.compact();
        // After compact, all that space is now contiguous; total_free must
        // match exactly rather than counting the same bytes twice.
        assert_eq!(page.total_free(), total_before);
        assert_eq!(page.total_free(), page.contiguous_free());
    }
}

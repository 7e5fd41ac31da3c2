//! In-memory page container used by the LRU cache and every higher layer.

use galdr_common::{GaldrResult, PageId};

/// A single page's bytes plus cache bookkeeping. Page size is fixed for the
/// lifetime of a database but configurable at creation, so the backing
/// buffer is heap-allocated rather than a compile-time-sized array.
#[derive(Debug, Clone)]
pub struct Page {
    data: Vec<u8>,
    page_id: Option<PageId>,
    is_dirty: bool,
    pin_count: u32,
}

impl Page {
    /// Creates a zeroed page of `page_size` bytes with no identity.
    pub fn new(page_size: usize) -> Self {
        Self {
            data: vec![0u8; page_size],
            page_id: None,
            is_dirty: false,
            pin_count: 0,
        }
    }

    pub fn page_size(&self) -> usize {
        self.data.len()
    }

    pub fn page_id(&self) -> Option<PageId> {
        self.page_id
    }

    pub fn set_page_id(&mut self, page_id: Option<PageId>) {
        self.page_id = page_id;
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.is_dirty = dirty;
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count
    }

    pub fn pin(&mut self) {
        self.pin_count += 1;
    }

    /// Returns false if the page was already unpinned.
    pub fn unpin(&mut self) -> bool {
        if self.pin_count == 0 {
            return false;
        }
        self.pin_count -= 1;
        true
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Replaces the full contents of the page, keeping its size.
    pub fn copy_from_slice(&mut self, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.data.len());
        self.data.copy_from_slice(bytes);
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        if end > self.data.len() {
            return None;
        }
        Some(&self.data[offset..end])
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> GaldrResult<()> {
        let end = offset
            .checked_add(bytes.len())
            .filter(|&e| e <= self.data.len())
            .ok_or_else(|| {
                galdr_common::GaldrError::OutOfRange(format!(
                    "write of {} bytes at offset {} exceeds page size {}",
                    bytes.len(),
                    offset,
                    self.data.len()
                ))
            })?;
        self.data[offset..end].copy_from_slice(bytes);
        self.is_dirty = true;
        Ok(())
    }

    /// Resets all data and metadata to defaults, keeping the page size.
    pub fn reset_memory(&mut self) {
        self.data.fill(0);
        self.page_id = None;
        self.is_dirty = false;
        self.pin_count = 0;
    }
}

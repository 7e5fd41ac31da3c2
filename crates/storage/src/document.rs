//! Document Storage: put/get/delete raw document bytes on top of
//! slotted pages, routing oversized documents through overflow chains.

use galdr_common::{DocumentLocation, FreeClass, GaldrError, GaldrResult, PageId, PageType, SlotIndex};

use crate::cache::LruPageCache;
use crate::page_manager::PageManager;
use crate::slotted::{PAGE_HEADER_SIZE, SLOT_SIZE, SlottedPage};
use crate::write_log::PageWriteLog;

/// Document Storage over a page cache and page manager pair. Stateless
/// beyond the borrowed references — every call records its page mutations
/// into the caller-supplied [`PageWriteLog`] for WAL framing at commit.
pub struct DocumentStore<'a> {
    cache: &'a LruPageCache,
    pager: &'a PageManager,
}

impl<'a> DocumentStore<'a> {
    pub fn new(cache: &'a LruPageCache, pager: &'a PageManager) -> Self {
        Self { cache, pager }
    }

    fn page_size(&self) -> usize {
        self.pager.page_size() as usize
    }

    fn single_page_capacity(&self) -> usize {
        self.page_size() - PAGE_HEADER_SIZE
    }

    fn continuation_capacity(&self) -> usize {
        self.page_size() - PAGE_HEADER_SIZE - SLOT_SIZE
    }

    fn load_page(&self, page_id: PageId) -> GaldrResult<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size()];
        self.cache.read_page(page_id, &mut buf)?;
        Ok(buf)
    }

    fn store_page(
        &self,
        log: &mut PageWriteLog,
        page_type: PageType,
        page_id: PageId,
        buf: Vec<u8>,
    ) -> GaldrResult<()> {
        self.cache.write_page(page_id, &buf)?;
        log.record(page_id, page_type, buf);
        Ok(())
    }

    fn refresh_free_class(&self, log: &mut PageWriteLog, page_id: PageId, buf: &[u8]) -> GaldrResult<()> {
        let mut owned = buf.to_vec();
        let page = SlottedPage::new(&mut owned);
        let class = FreeClass::from_free_bytes(page.total_free(), self.page_size());
        self.pager.mark_level(self.cache, log, page_id, class)
    }

    /// Finds (or allocates) a page with room for `needed` bytes total
    /// (payload + a new slot entry), compacting a promising candidate in
    /// memory if its contiguous space is insufficient but its total free
    /// space is not.
    fn find_or_allocate_page(
        &self,
        log: &mut PageWriteLog,
        needed: usize,
    ) -> GaldrResult<(PageId, Vec<u8>, bool)> {
        let mut tried = std::collections::HashSet::new();
        loop {
            let Some(candidate) = self.pager.find_free_page(FreeClass::QuarterFree) else {
                break;
            };
            if tried.contains(&candidate) {
                break;
            }
            tried.insert(candidate);

            let mut buf = self.load_page(candidate)?;
            {
                let mut page = SlottedPage::new(&mut buf);
                if page.contiguous_free() >= needed {
                    return Ok((candidate, buf, false));
                }
                if page.total_free() >= needed {
                    page.compact();
                    return Ok((candidate, buf, false));
                }
            }
        }
        let page_id = self.pager.allocate_page(self.cache, log)?;
        let mut buf = vec![0u8; self.page_size()];
        SlottedPage::format(&mut buf, PageType::Document.to_byte(), false);
        Ok((page_id, buf, true))
    }

    /// Writes `bytes` as a new document, returning its stable location.
    pub fn write_document(&self, log: &mut PageWriteLog, bytes: &[u8]) -> GaldrResult<DocumentLocation> {
        if bytes.len() + SLOT_SIZE <= self.single_page_capacity() {
            return self.write_single_page(log, bytes);
        }
        self.write_overflow(log, bytes)
    }

    fn write_single_page(&self, log: &mut PageWriteLog, bytes: &[u8]) -> GaldrResult<DocumentLocation> {
        let needed = bytes.len() + SLOT_SIZE;
        let (page_id, mut buf, _fresh) = self.find_or_allocate_page(log, needed)?;
        let slot_index = {
            let mut page = SlottedPage::new(&mut buf);
            page.put(bytes).ok_or_else(|| {
                GaldrError::InvalidData("page unexpectedly lacks space after selection".into())
            })?
        };
        self.refresh_free_class(log, page_id, &buf)?;
        self.store_page(log, PageType::Document, page_id, buf)?;
        Ok(DocumentLocation::new(page_id, slot_index))
    }

    fn write_overflow(&self, log: &mut PageWriteLog, bytes: &[u8]) -> GaldrResult<DocumentLocation> {
        let head_capacity = self.single_page_capacity().saturating_sub(SLOT_SIZE);
        let (head_chunk, mut rest) = bytes.split_at(head_capacity.min(bytes.len()));

        let head_needed = head_chunk.len() + SLOT_SIZE;
        let (head_page_id, mut head_buf, _fresh) = self.find_or_allocate_page(log, head_needed)?;
        let head_slot = {
            let mut page = SlottedPage::new(&mut head_buf);
            page.put(head_chunk).ok_or_else(|| {
                GaldrError::InvalidData("head page unexpectedly lacks space".into())
            })?
        };

        let cap = self.continuation_capacity();
        let mut continuation_pages = Vec::new();
        while !rest.is_empty() {
            let (chunk, remainder) = rest.split_at(cap.min(rest.len()));
            continuation_pages.push(chunk.to_vec());
            rest = remainder;
        }

        let mut page_ids = Vec::with_capacity(continuation_pages.len());
        for _ in &continuation_pages {
            page_ids.push(self.pager.allocate_page(self.cache, log)?);
        }

        for (i, chunk) in continuation_pages.iter().enumerate() {
            let page_id = page_ids[i];
            let mut buf = vec![0u8; self.page_size()];
            SlottedPage::format(&mut buf, PageType::Continuation.to_byte(), true);
            {
                let mut page = SlottedPage::new(&mut buf);
                page.put(chunk).ok_or_else(|| {
                    GaldrError::ArgumentError("document chunk exceeds continuation page capacity".into())
                })?;
                let next = page_ids.get(i + 1).copied().unwrap_or(0);
                page.set_next_continuation_page_id(next);
            }
            self.store_page(log, PageType::Continuation, page_id, buf)?;
            self.pager.exclude_from_candidacy(self.cache, log, page_id)?;
        }

        {
            let mut page = SlottedPage::new(&mut head_buf);
            page.set_slot_continuation(head_slot, page_ids.first().copied().unwrap_or(0))?;
        }
        self.refresh_free_class(log, head_page_id, &head_buf)?;
        self.store_page(log, PageType::Document, head_page_id, head_buf)?;

        Ok(DocumentLocation::new(head_page_id, head_slot))
    }

    /// Reads a document's full bytes, reassembling overflow chains.
    pub fn read_document(&self, page_id: PageId, slot: SlotIndex) -> GaldrResult<Vec<u8>> {
        let mut head_buf = self.load_page(page_id)?;
        let (mut out, mut next) = {
            let page = SlottedPage::new(&mut head_buf);
            let (tombstone, head_bytes) = page.get(slot)?;
            if tombstone {
                return Err(GaldrError::InvalidOperation(format!(
                    "slot {slot} on page {page_id} is tombstoned"
                )));
            }
            let out = head_bytes.to_vec();
            let entry = page.slot(slot)?;
            (out, entry.continuation_page_id)
        };
        while next != 0 {
            let mut buf = self.load_page(next)?;
            let cont = SlottedPage::new(&mut buf);
            let (_, bytes) = cont.get(0)?;
            out.extend_from_slice(bytes);
            next = cont.next_continuation_page_id();
        }
        Ok(out)
    }

    /// Tombstones the head slot and frees every continuation page.
    pub fn delete_document(
        &self,
        log: &mut PageWriteLog,
        page_id: PageId,
        slot: SlotIndex,
    ) -> GaldrResult<()> {
        let mut head_buf = self.load_page(page_id)?;
        let first_continuation = {
            let mut page = SlottedPage::new(&mut head_buf);
            page.delete(slot)?
        };
        self.refresh_free_class(log, page_id, &head_buf)?;
        self.store_page(log, PageType::Document, page_id, head_buf)?;

        let mut next = first_continuation;
        while next != 0 {
            let mut buf = self.load_page(next)?;
            let following = SlottedPage::new(&mut buf).next_continuation_page_id();
            self.pager.deallocate_page(self.cache, log, next)?;
            next = following;
        }
        Ok(())
    }
}

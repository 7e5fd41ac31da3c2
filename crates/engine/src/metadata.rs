//! Collections Metadata: name, NextDocId counter, primary and
//! secondary B+-tree roots for every collection, persisted as JSON at the
//! fixed `collections_metadata_root_page` reserved by the Page Manager.
//!
//! `DocumentStore::write_document` always allocates a fresh page for new
//! content, which is wrong here: the root page id must stay fixed so the
//! base file header never has to change. This module reimplements a small,
//! pinned-head variant of the document store's overflow chain logic
//! instead of reusing `write_document` directly.

use serde::{Deserialize, Serialize};

use galdr_common::{DocId, GaldrError, GaldrResult, PageId, PageType};
use galdr_storage::{LruPageCache, PageManager, PageWriteLog, SlottedPage, PAGE_HEADER_SIZE, SLOT_SIZE};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub field: String,
    pub unique: bool,
    pub root_page: PageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub name: String,
    pub next_doc_id: DocId,
    pub primary_root_page: PageId,
    pub indexes: Vec<IndexMeta>,
}

impl CollectionMeta {
    pub fn index(&self, field: &str) -> Option<&IndexMeta> {
        self.indexes.iter().find(|i| i.field == field)
    }

    pub fn index_mut(&mut self, field: &str) -> Option<&mut IndexMeta> {
        self.indexes.iter_mut().find(|i| i.field == field)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionsMetadata {
    pub collections: Vec<CollectionMeta>,
}

impl CollectionsMetadata {
    pub fn find(&self, name: &str) -> Option<&CollectionMeta> {
        self.collections.iter().find(|c| c.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut CollectionMeta> {
        self.collections.iter_mut().find(|c| c.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.collections.iter().map(|c| c.name.clone()).collect()
    }

    pub fn remove(&mut self, name: &str) -> Option<CollectionMeta> {
        let pos = self.collections.iter().position(|c| c.name == name)?;
        Some(self.collections.remove(pos))
    }
}

/// Loads the persisted metadata blob, or an empty one if the database was
/// just initialized and nothing has been saved yet.
pub fn load(cache: &LruPageCache, pager: &PageManager) -> GaldrResult<CollectionsMetadata> {
    let root = pager.collections_metadata_root_page();
    let page_size = pager.page_size() as usize;
    let mut head_buf = vec![0u8; page_size];
    cache.read_page(root, &mut head_buf)?;

    let (slot_count, first_slot, continuation) = {
        let page = SlottedPage::new(&mut head_buf);
        let slot_count = page.slot_count();
        if slot_count == 0 {
            (0u16, None, 0)
        } else {
            let (tombstone, bytes) = page.get(0)?;
            if tombstone {
                (slot_count, None, 0)
            } else {
                let entry = page.slot(0)?;
                (slot_count, Some(bytes.to_vec()), entry.continuation_page_id)
            }
        }
    };

    let Some(mut bytes) = (if slot_count == 0 { None } else { first_slot }) else {
        return Ok(CollectionsMetadata::default());
    };

    let mut next = continuation;
    while next != 0 {
        let mut buf = vec![0u8; page_size];
        cache.read_page(next, &mut buf)?;
        let cont = SlottedPage::new(&mut buf);
        let (_, chunk) = cont.get(0)?;
        bytes.extend_from_slice(chunk);
        next = cont.next_continuation_page_id();
    }

    serde_json::from_slice(&bytes)
        .map_err(|e| GaldrError::InvalidData(format!("collections metadata corrupt: {e}")))
}

/// Persists `metadata` at the fixed root page, freeing whatever
/// continuation chain it previously used and allocating a fresh one sized
/// to the new content.
pub fn save(
    cache: &LruPageCache,
    pager: &PageManager,
    log: &mut PageWriteLog,
    metadata: &CollectionsMetadata,
) -> GaldrResult<()> {
    let root = pager.collections_metadata_root_page();
    let page_size = pager.page_size() as usize;

    let mut head_buf = vec![0u8; page_size];
    cache.read_page(root, &mut head_buf)?;
    let old_continuation = {
        let mut page = SlottedPage::new(&mut head_buf);
        if page.slot_count() == 0 {
            0
        } else {
            page.delete(0)?
        }
    };
    let mut next = old_continuation;
    while next != 0 {
        let mut buf = vec![0u8; page_size];
        cache.read_page(next, &mut buf)?;
        let following = SlottedPage::new(&mut buf).next_continuation_page_id();
        pager.deallocate_page(cache, log, next)?;
        next = following;
    }

    let bytes = serde_json::to_vec(metadata)
        .map_err(|e| GaldrError::InvalidData(format!("failed to encode collections metadata: {e}")))?;

    let head_capacity = page_size - PAGE_HEADER_SIZE - SLOT_SIZE;
    let (head_chunk, mut rest) = bytes.split_at(head_capacity.min(bytes.len()));

    let continuation_capacity = page_size - PAGE_HEADER_SIZE - SLOT_SIZE;
    let mut chunks = Vec::new();
    while !rest.is_empty() {
        let take = continuation_capacity.min(rest.len());
        let (chunk, remainder) = rest.split_at(take);
        chunks.push(chunk.to_vec());
        rest = remainder;
    }

    let mut page_ids = Vec::with_capacity(chunks.len());
    for _ in &chunks {
        page_ids.push(pager.allocate_page(cache, log)?);
    }
    for (i, chunk) in chunks.iter().enumerate() {
        let page_id = page_ids[i];
        let mut buf = vec![0u8; page_size];
        SlottedPage::format(&mut buf, PageType::Continuation.to_byte(), true);
        {
            let mut page = SlottedPage::new(&mut buf);
            page.put(chunk).ok_or_else(|| {
                GaldrError::InvalidData("collections metadata chunk exceeds page capacity".into())
            })?;
            let next_id = page_ids.get(i + 1).copied().unwrap_or(0);
            page.set_next_continuation_page_id(next_id);
        }
        cache.write_page(page_id, &buf)?;
        log.record(page_id, PageType::Continuation, buf);
        pager.exclude_from_candidacy(cache, log, page_id)?;
    }

    let mut head_buf = vec![0u8; page_size];
    SlottedPage::format(&mut head_buf, PageType::CollectionsMetadata.to_byte(), false);
    let head_slot = {
        let mut page = SlottedPage::new(&mut head_buf);
        let slot = page.put(head_chunk).ok_or_else(|| {
            GaldrError::InvalidData("collections metadata head chunk exceeds page capacity".into())
        })?;
        page.set_slot_continuation(slot, page_ids.first().copied().unwrap_or(0))?;
        slot
    };
    debug_assert_eq!(head_slot, 0);
    cache.write_page(root, &head_buf)?;
    log.record(root, PageType::CollectionsMetadata, head_buf);
    pager.exclude_from_candidacy(cache, log, root)?;
    Ok(())
}

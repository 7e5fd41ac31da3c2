//! Per-transaction record of which pages were touched during the single
//! commit critical section, used to build the WAL frame batch at commit time.
//! Physical page mutation only ever happens inside that serialized section,
//! so recording final post-images here (rather than shadowing every read)
//! is sufficient — no other transaction can be mutating shared pages at the
//! same time.

use indexmap::IndexMap;

use galdr_common::{PageId, PageType};

/// Ordered, deduplicated (last-writer-wins) set of page post-images produced
/// by one commit or maintenance pass (vacuum, checkpoint-time growth).
#[derive(Default)]
pub struct PageWriteLog {
    pages: IndexMap<PageId, (PageType, Vec<u8>)>,
}

impl PageWriteLog {
    pub fn new() -> Self {
        Self {
            pages: IndexMap::new(),
        }
    }

    /// Records (or overwrites) the final image of `page_id` for this batch.
    pub fn record(&mut self, page_id: PageId, page_type: PageType, bytes: Vec<u8>) {
        self.pages.insert(page_id, (page_type, bytes));
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Iterates touched pages in first-touched order (stable thanks to
    /// `IndexMap`), the order in which WAL frames should be emitted.
    pub fn iter(&self) -> impl Iterator<Item = (PageId, PageType, &[u8])> {
        self.pages
            .iter()
            .map(|(&id, (ty, bytes))| (id, *ty, bytes.as_slice()))
    }

    pub fn into_iter(self) -> impl Iterator<Item = (PageId, PageType, Vec<u8>)> {
        self.pages.into_iter().map(|(id, (ty, bytes))| (id, ty, bytes))
    }
}

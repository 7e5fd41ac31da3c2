//! On-disk storage engine: Page I/O, the LRU page cache, the Page Manager
//! (header/bitmap/FSM/growth), slotted pages with overflow, and Document
//! Storage.
//!
//! An earlier pin-counted buffer pool and clock replacer were removed in
//! favor of `cache.rs`'s per-page `RwLock` design, which is required to
//! satisfy the cache's "distinct pages proceed in parallel" concurrency
//! contract (see DESIGN.md).
mod cache;
mod disk;
mod document;
mod page;
mod page_manager;
mod slotted;
mod write_log;

pub use cache::LruPageCache;
pub use disk::DiskManager;
pub use document::DocumentStore;
pub use page::Page;
pub use page_manager::{Header, PageManager, HEADER_MAGIC, HEADER_VERSION};
pub use slotted::{SlotEntry, SlottedPage, PAGE_HEADER_SIZE, SLOT_SIZE};
pub use write_log::PageWriteLog;

pub use galdr_common::{DocumentLocation, FreeClass, GaldrError, GaldrResult, PageId, PageType, SlotIndex};

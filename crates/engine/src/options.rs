//! Open/create-time configuration.

use galdr_common::{GaldrError, GaldrResult, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

/// Tuning knobs for [`crate::GaldrDb::create`] / [`crate::GaldrDb::open`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Page size in bytes. Must be a power of two within
    /// `[MIN_PAGE_SIZE, MAX_PAGE_SIZE]`. Fixed for the lifetime of the file.
    pub page_size: u32,
    /// Whether to maintain a write-ahead log. Disabling it drops crash
    /// recovery entirely and is only meaningful for scratch/throwaway files.
    pub use_wal: bool,
    /// Reserved for a future mmap-backed disk manager; the only implemented
    /// disk manager is file-based I/O, so this must stay `false`.
    pub use_mmap: bool,
    /// Pages to grow the file by when the allocator runs out of free pages.
    pub expansion_page_count: u32,
    /// Whether `vacuum()` runs automatically after every `gc_threshold`
    /// committed read-write transactions.
    pub auto_gc: bool,
    /// Committed read-write transaction count that triggers an automatic
    /// vacuum when `auto_gc` is set.
    pub gc_threshold: u64,
    /// Capacity, in pages, of the in-memory page cache.
    pub cache_page_count: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            page_size: galdr_common::DEFAULT_PAGE_SIZE as u32,
            use_wal: true,
            use_mmap: false,
            expansion_page_count: 64,
            auto_gc: true,
            gc_threshold: 1000,
            cache_page_count: 256,
        }
    }
}

impl Options {
    pub fn validate(&self) -> GaldrResult<()> {
        let page_size = self.page_size as usize;
        if page_size < MIN_PAGE_SIZE || page_size > MAX_PAGE_SIZE || !page_size.is_power_of_two() {
            return Err(GaldrError::ArgumentError(format!(
                "page_size {page_size} must be a power of two in [{MIN_PAGE_SIZE}, {MAX_PAGE_SIZE}]"
            )));
        }
        if self.use_mmap {
            return Err(GaldrError::ArgumentError(
                "use_mmap is not supported by this build".to_string(),
            ));
        }
        if self.expansion_page_count == 0 {
            return Err(GaldrError::ArgumentError(
                "expansion_page_count must be nonzero".to_string(),
            ));
        }
        if self.cache_page_count == 0 {
            return Err(GaldrError::ArgumentError(
                "cache_page_count must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}

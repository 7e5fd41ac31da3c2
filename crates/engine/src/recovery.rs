//! Crash Recovery: replays every committed WAL transaction's
//! frames against the page cache before the engine opens for business.
//! Uncommitted transactions are simply absent from `WalReader::recover`'s
//! output and so are never applied, giving atomic all-or-nothing replay.

use std::path::Path;

use tracing::{debug, instrument};

use galdr_common::GaldrResult;
use galdr_storage::LruPageCache;
use galdr_wal::WalReader;

/// Replays `wal_path` against `cache`. A missing WAL file (clean shutdown
/// with WAL disabled, or first-ever open) is not an error: there is
/// nothing to recover.
#[instrument(skip(cache))]
pub(crate) fn replay(cache: &LruPageCache, wal_path: &Path, _page_size: u32) -> GaldrResult<()> {
    if !wal_path.exists() {
        debug!("no wal file present, nothing to recover");
        return Ok(());
    }
    let reader = WalReader::open(wal_path)?;
    let transactions = reader.recover()?;
    debug!(committed_transactions = transactions.len(), "wal scan complete");

    let mut frames: Vec<_> = transactions.into_iter().flat_map(|t| t.frames).collect();
    // `recover()` groups frames by transaction in first-seen order, not
    // globally by append order, so later transactions can precede earlier
    // ones here. Re-sort to the true write order before applying.
    frames.sort_by_key(|f| f.frame_number);
    debug!(frames = frames.len(), "replaying frames in wal order");

    for frame in frames {
        cache.write_page(frame.page_id, &frame.payload)?;
    }
    Ok(())
}

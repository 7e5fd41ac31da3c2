//! Garbage Collector: reclaims MVCC versions no snapshot can ever
//! see again and defragments the pages they freed up.
//!
//! Secondary and primary index entries for a superseded version are
//! already removed at the moment it is superseded (every `Replace`/
//! `Delete` commit updates the indexes for its *old* head immediately).
//! What `vacuum` reclaims is strictly the version chain bookkeeping and
//! the orphaned document storage a superseded version leaves behind.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, instrument};

use galdr_common::{FreeClass, GaldrResult, PageId, PageType};
use galdr_storage::{PageWriteLog, SlottedPage};

use crate::descriptor::VacuumReport;
use crate::version_index::NOT_DELETED;
use crate::Inner;

#[instrument(skip(inner))]
pub(crate) fn vacuum(inner: &Arc<Inner>) -> GaldrResult<VacuumReport> {
    let horizon = inner
        .txn_mgr
        .oldest_active_snapshot_tx_id()
        .unwrap_or_else(|| inner.txn_mgr.last_committed_tx_id());
    debug!(horizon, "vacuum horizon computed");

    let _guard = inner.commit_lock.lock();
    let mut log = PageWriteLog::new();
    let store = inner.document_store();
    let mut versions_collected: u64 = 0;
    let mut touched_pages: HashSet<PageId> = HashSet::new();

    let collections = inner.state.read().metadata.names();
    for collection in &collections {
        let versions = inner.version_index(collection)?;
        for doc_id in versions.doc_ids() {
            let chain = versions.chain_with_indices(doc_id);
            if chain.is_empty() {
                continue;
            }
            // Newest version whose created_tx_id <= horizon: everyone at or
            // past the horizon sees this version or something newer, so
            // everything strictly older than it is unreachable.
            let Some(h) = chain.iter().position(|(_, r)| r.created_tx_id <= horizon) else {
                continue;
            };
            let (keep_pos, keep_record) = chain[h].clone();

            for (_, record) in &chain[h + 1..] {
                store.delete_document(&mut log, record.location.page_id, record.location.slot_index)?;
                touched_pages.insert(record.location.page_id);
                versions_collected += 1;
            }
            if h + 1 < chain.len() {
                versions.truncate_chain_after(keep_pos);
            }

            // The horizon version is also gone if it's the current head and
            // was itself tombstoned old enough ago; its storage and index
            // entries were already freed by the Delete that tombstoned it.
            if h == 0 && keep_record.deleted_tx_id != NOT_DELETED && keep_record.deleted_tx_id <= horizon {
                versions.remove_chain(doc_id);
                versions_collected += 1;
            }
        }
        versions.compact_arena();
    }

    let mut pages_compacted: u64 = 0;
    for page_id in touched_pages {
        if compact_page(inner, &mut log, page_id)? {
            pages_compacted += 1;
        }
    }

    if !log.is_empty() {
        let tx_id = inner.txn_mgr.allocate_tx_id();
        inner.wal_commit(tx_id, &log)?;
        inner.txn_mgr.mark_committed(tx_id);
    }

    debug!(versions_collected, pages_compacted, "vacuum finished");
    Ok(VacuumReport {
        versions_collected,
        pages_compacted,
        horizon_tx_id: horizon,
    })
}

fn compact_page(inner: &Arc<Inner>, log: &mut PageWriteLog, page_id: PageId) -> GaldrResult<bool> {
    let page_size = inner.pager.page_size() as usize;
    let mut buf = vec![0u8; page_size];
    inner.cache.read_page(page_id, &mut buf)?;

    let before = SlottedPage::new(&mut buf).contiguous_free();
    SlottedPage::new(&mut buf).compact();
    let (after, total_free) = {
        let page = SlottedPage::new(&mut buf);
        (page.contiguous_free(), page.total_free())
    };
    if after <= before {
        return Ok(false);
    }

    inner.cache.write_page(page_id, &buf)?;
    log.record(page_id, PageType::Document, buf);
    let class = FreeClass::from_free_bytes(total_free, page_size);
    inner.pager.mark_level(&inner.cache, log, page_id, class)?;
    Ok(true)
}

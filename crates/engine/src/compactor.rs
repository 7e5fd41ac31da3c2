//! Offline Compaction: rewrites a database into a brand-new file
//! containing only live documents, discarding dead versions, tombstones,
//! and accumulated page fragmentation in one pass. DocIds are preserved so
//! callers never have to renumber references to already-handed-out ids.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, instrument};

use galdr_common::{GaldrError, GaldrResult};

use crate::descriptor::{CompactReport, DocumentWrite, IndexSpec};
use crate::version_index::NOT_DELETED;
use crate::{GaldrDb, Inner};

#[instrument(skip(inner), fields(target = %target_path.display()))]
pub(crate) fn compact_to(inner: &Arc<Inner>, target_path: &Path) -> GaldrResult<CompactReport> {
    if target_path.exists() {
        return Err(GaldrError::InvalidOperation(format!(
            "compaction target {} already exists",
            target_path.display()
        )));
    }
    if inner.txn_mgr.active_count() > 0 {
        return Err(GaldrError::InvalidOperation(
            "cannot compact while transactions are active".into(),
        ));
    }

    let target = GaldrDb::create(target_path, inner.options.clone())?;

    let metadata = inner.metadata_snapshot();
    let store = inner.document_store();
    let mut collections_copied: u64 = 0;
    let mut documents_copied: u64 = 0;

    for coll in &metadata.collections {
        let indexes: Vec<IndexSpec> = coll
            .indexes
            .iter()
            .map(|i| IndexSpec::new(i.field.clone(), i.unique))
            .collect();
        target.ensure_collection(&coll.name, indexes)?;
        collections_copied += 1;

        let versions = inner.version_index(&coll.name)?;
        for doc_id in versions.doc_ids() {
            let Some(head) = versions.head(doc_id) else { continue };
            if head.deleted_tx_id != NOT_DELETED {
                continue;
            }
            let bytes = store.read_document(head.location.page_id, head.location.slot_index)?;
            let write = DocumentWrite {
                id: Some(doc_id),
                bytes,
                index_keys: head.index_keys.clone(),
            };
            target.insert(&coll.name, write)?;
            documents_copied += 1;
        }
    }

    target.checkpoint()?;
    let source_page_count = inner.pager.total_page_count();
    let target_page_count = target.inner.pager.total_page_count();
    info!(collections_copied, documents_copied, source_page_count, target_page_count, "compaction finished");

    Ok(CompactReport {
        collections_copied,
        documents_copied,
        source_page_count,
        target_page_count,
    })
}

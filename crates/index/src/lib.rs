//! Secondary B+-tree index over opaque composite byte keys: point
//! lookup, range scan, insert-with-split, and delete-with-rebalance.

mod node;
mod tree;

pub use node::{max_internal_keys, max_leaf_keys, InternalNode, LeafEntry, LeafNode};
pub use tree::BTree;

pub use galdr_common::{DocumentLocation, GaldrError, GaldrResult, PageId};

/// Appends a big-endian DocId suffix to a non-unique index's user key so
/// distinct documents sharing a key stay distinct tree entries while
/// preserving ordering by the user key first.
pub fn compose_non_unique_key(user_key: &[u8], doc_id: galdr_common::DocId) -> Vec<u8> {
    let mut out = Vec::with_capacity(user_key.len() + 8);
    out.extend_from_slice(user_key);
    out.extend_from_slice(&doc_id.to_be_bytes());
    out
}

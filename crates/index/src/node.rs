//! On-disk node layout for the secondary B+-tree: fixed-size
//! length-prefixed key slots sized by the tree's configured
//! `max_key_size`, so composite keys can be arbitrary opaque byte
//! sequences up to that bound.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use galdr_common::{DocumentLocation, GaldrError, GaldrResult, PageId, PageType, SlotIndex};

pub const NODE_HEADER_SIZE: usize = 24;
const OFF_PAGE_TYPE: usize = 0;
const OFF_KEY_COUNT: usize = 2;
const OFF_PARENT: usize = 8;
const OFF_SPECIAL: usize = 16;

/// `DocumentLocation` serialized form: page_id (8) + slot_index (4).
pub const LOCATION_SIZE: usize = 12;
const CHILD_PTR_SIZE: usize = 8;

pub fn leaf_slot_size(max_key_size: usize) -> usize {
    2 + max_key_size + LOCATION_SIZE
}

pub fn internal_slot_size(max_key_size: usize) -> usize {
    2 + max_key_size + CHILD_PTR_SIZE
}

/// Order guaranteeing >= 3 keys per node.
pub fn max_leaf_keys(page_size: usize, max_key_size: usize) -> usize {
    ((page_size - NODE_HEADER_SIZE) / leaf_slot_size(max_key_size)).max(3)
}

pub fn max_internal_keys(page_size: usize, max_key_size: usize) -> usize {
    ((page_size - NODE_HEADER_SIZE) / internal_slot_size(max_key_size)).max(3)
}

fn write_location(buf: &mut [u8], offset: usize, loc: DocumentLocation) {
    LittleEndian::write_u64(&mut buf[offset..], loc.page_id);
    LittleEndian::write_u32(&mut buf[offset + 8..], loc.slot_index);
}

fn read_location(buf: &[u8], offset: usize) -> DocumentLocation {
    let page_id = LittleEndian::read_u64(&buf[offset..]);
    let slot_index = LittleEndian::read_u32(&buf[offset + 8..]) as SlotIndex;
    DocumentLocation::new(page_id, slot_index)
}

fn write_key(buf: &mut [u8], offset: usize, key: &[u8], max_key_size: usize) -> GaldrResult<()> {
    if key.len() > max_key_size {
        return Err(GaldrError::ArgumentError(format!(
            "index key of {} bytes exceeds max_key_size {}",
            key.len(),
            max_key_size
        )));
    }
    BigEndian::write_u16(&mut buf[offset..], key.len() as u16);
    buf[offset + 2..offset + 2 + key.len()].copy_from_slice(key);
    Ok(())
}

fn read_key(buf: &[u8], offset: usize) -> Vec<u8> {
    let len = BigEndian::read_u16(&buf[offset..]) as usize;
    buf[offset + 2..offset + 2 + len].to_vec()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub location: DocumentLocation,
}

#[derive(Debug, Clone)]
pub struct LeafNode {
    pub parent: PageId,
    pub next_leaf: PageId,
    pub entries: Vec<LeafEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalEntry {
    pub key: Vec<u8>,
    pub child: PageId,
}

#[derive(Debug, Clone)]
pub struct InternalNode {
    pub parent: PageId,
    pub leftmost_child: PageId,
    pub entries: Vec<InternalEntry>,
}

impl InternalNode {
    /// All children in left-to-right order.
    pub fn children(&self) -> Vec<PageId> {
        let mut out = Vec::with_capacity(self.entries.len() + 1);
        out.push(self.leftmost_child);
        out.extend(self.entries.iter().map(|e| e.child));
        out
    }
}

pub fn is_leaf(buf: &[u8]) -> bool {
    buf[OFF_PAGE_TYPE] == PageType::BTreeLeaf.to_byte()
}

/// Parent pointer lives at the same offset in both node kinds.
pub fn read_parent(buf: &[u8]) -> PageId {
    LittleEndian::read_u64(&buf[OFF_PARENT..])
}

pub fn write_parent(buf: &mut [u8], parent: PageId) {
    LittleEndian::write_u64(&mut buf[OFF_PARENT..], parent);
}

pub fn format_leaf(buf: &mut [u8], parent: PageId, next_leaf: PageId) {
    buf.fill(0);
    buf[OFF_PAGE_TYPE] = PageType::BTreeLeaf.to_byte();
    BigEndian::write_u16(&mut buf[OFF_KEY_COUNT..], 0);
    LittleEndian::write_u64(&mut buf[OFF_PARENT..], parent);
    LittleEndian::write_u64(&mut buf[OFF_SPECIAL..], next_leaf);
}

pub fn format_internal(buf: &mut [u8], parent: PageId, leftmost_child: PageId) {
    buf.fill(0);
    buf[OFF_PAGE_TYPE] = PageType::BTreeInternal.to_byte();
    BigEndian::write_u16(&mut buf[OFF_KEY_COUNT..], 0);
    LittleEndian::write_u64(&mut buf[OFF_PARENT..], parent);
    LittleEndian::write_u64(&mut buf[OFF_SPECIAL..], leftmost_child);
}

pub fn read_leaf(buf: &[u8], max_key_size: usize) -> LeafNode {
    let count = BigEndian::read_u16(&buf[OFF_KEY_COUNT..]) as usize;
    let parent = LittleEndian::read_u64(&buf[OFF_PARENT..]);
    let next_leaf = LittleEndian::read_u64(&buf[OFF_SPECIAL..]);
    let slot_size = leaf_slot_size(max_key_size);
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let offset = NODE_HEADER_SIZE + i * slot_size;
        let key = read_key(buf, offset);
        let location = read_location(buf, offset + 2 + max_key_size);
        entries.push(LeafEntry { key, location });
    }
    LeafNode {
        parent,
        next_leaf,
        entries,
    }
}

pub fn write_leaf(buf: &mut [u8], node: &LeafNode, max_key_size: usize) -> GaldrResult<()> {
    format_leaf(buf, node.parent, node.next_leaf);
    BigEndian::write_u16(&mut buf[OFF_KEY_COUNT..], node.entries.len() as u16);
    let slot_size = leaf_slot_size(max_key_size);
    for (i, entry) in node.entries.iter().enumerate() {
        let offset = NODE_HEADER_SIZE + i * slot_size;
        write_key(buf, offset, &entry.key, max_key_size)?;
        write_location(buf, offset + 2 + max_key_size, entry.location);
    }
    Ok(())
}

pub fn read_internal(buf: &[u8], max_key_size: usize) -> InternalNode {
    let count = BigEndian::read_u16(&buf[OFF_KEY_COUNT..]) as usize;
    let parent = LittleEndian::read_u64(&buf[OFF_PARENT..]);
    let leftmost_child = LittleEndian::read_u64(&buf[OFF_SPECIAL..]);
    let slot_size = internal_slot_size(max_key_size);
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let offset = NODE_HEADER_SIZE + i * slot_size;
        let key = read_key(buf, offset);
        let child = LittleEndian::read_u64(&buf[offset + 2 + max_key_size..]);
        entries.push(InternalEntry { key, child });
    }
    InternalNode {
        parent,
        leftmost_child,
        entries,
    }
}

pub fn write_internal(buf: &mut [u8], node: &InternalNode, max_key_size: usize) -> GaldrResult<()> {
    format_internal(buf, node.parent, node.leftmost_child);
    BigEndian::write_u16(&mut buf[OFF_KEY_COUNT..], node.entries.len() as u16);
    let slot_size = internal_slot_size(max_key_size);
    for (i, entry) in node.entries.iter().enumerate() {
        let offset = NODE_HEADER_SIZE + i * slot_size;
        write_key(buf, offset, &entry.key, max_key_size)?;
        LittleEndian::write_u64(&mut buf[offset + 2 + max_key_size..], entry.child);
    }
    Ok(())
}

pub mod internal;
pub mod leaf;

pub use internal::InternalNode;
pub use leaf::LeafNode;

use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, Rid, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::index::btree::key::GenericKey;

pub const PAGE_TYPE_LEAF: u32 = 1;
pub const PAGE_TYPE_INTERNAL: u32 = 2;

/// Common node header: page_type, size, max_size, parent_page_id, page_id,
/// and a reserved word
pub const NODE_HEADER_SIZE: usize = 24;
/// Leaf nodes additionally store next_page_id
pub const LEAF_HEADER_SIZE: usize = NODE_HEADER_SIZE + 4;

pub fn leaf_entry_size(key_size: usize) -> usize {
    key_size + 8
}

pub fn internal_entry_size(key_size: usize) -> usize {
    key_size + 4
}

/// A tree node decoded from a page, discriminated by the page_type header
/// field. Nodes are decoded under the page latch, mutated in memory, and
/// encoded back under the same latch.
pub enum BTreeNode<const N: usize> {
    Leaf(LeafNode<N>),
    Internal(InternalNode<N>),
}

impl<const N: usize> BTreeNode<N> {
    pub fn decode(page: &Page) -> Result<Self, BTreeError> {
        let page_type = LittleEndian::read_u32(&page.data[0..4]);
        match page_type {
            PAGE_TYPE_LEAF => Ok(BTreeNode::Leaf(LeafNode::decode(page)?)),
            PAGE_TYPE_INTERNAL => Ok(BTreeNode::Internal(InternalNode::decode(page)?)),
            _ => Err(BTreeError::CorruptedPage(page.page_id)),
        }
    }

    pub fn encode(&self, page: &mut Page) {
        match self {
            BTreeNode::Leaf(leaf) => leaf.encode(page),
            BTreeNode::Internal(internal) => internal.encode(page),
        }
    }

    pub fn page_id(&self) -> PageId {
        match self {
            BTreeNode::Leaf(leaf) => leaf.page_id,
            BTreeNode::Internal(internal) => internal.page_id,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            BTreeNode::Leaf(leaf) => leaf.entries.len(),
            BTreeNode::Internal(internal) => internal.entries.len(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, BTreeNode::Leaf(_))
    }

    pub fn parent_page_id(&self) -> PageId {
        match self {
            BTreeNode::Leaf(leaf) => leaf.parent_page_id,
            BTreeNode::Internal(internal) => internal.parent_page_id,
        }
    }

    pub fn set_parent_page_id(&mut self, parent: PageId) {
        match self {
            BTreeNode::Leaf(leaf) => leaf.parent_page_id = parent,
            BTreeNode::Internal(internal) => internal.parent_page_id = parent,
        }
    }
}

pub(crate) fn write_node_header(
    page: &mut Page,
    page_type: u32,
    size: usize,
    max_size: usize,
    parent_page_id: PageId,
) {
    LittleEndian::write_u32(&mut page.data[0..4], page_type);
    LittleEndian::write_i32(&mut page.data[4..8], size as i32);
    LittleEndian::write_i32(&mut page.data[8..12], max_size as i32);
    LittleEndian::write_i32(&mut page.data[12..16], parent_page_id);
    LittleEndian::write_i32(&mut page.data[16..20], page.page_id);
    LittleEndian::write_u32(&mut page.data[20..24], 0);
}

pub(crate) struct NodeHeader {
    pub size: usize,
    pub max_size: usize,
    pub parent_page_id: PageId,
}

pub(crate) fn read_node_header(page: &Page) -> Result<NodeHeader, BTreeError> {
    let size = LittleEndian::read_i32(&page.data[4..8]);
    let max_size = LittleEndian::read_i32(&page.data[8..12]);
    let parent_page_id = LittleEndian::read_i32(&page.data[12..16]);
    if size < 0 || max_size < 3 {
        return Err(BTreeError::CorruptedPage(page.page_id));
    }
    Ok(NodeHeader {
        size: size as usize,
        max_size: max_size as usize,
        parent_page_id,
    })
}

pub(crate) fn read_key<const N: usize>(data: &[u8]) -> GenericKey<N> {
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(&data[..N]);
    GenericKey::from_bytes(bytes)
}

pub(crate) fn read_rid(data: &[u8]) -> Rid {
    Rid::new(
        LittleEndian::read_i32(&data[0..4]),
        LittleEndian::read_u32(&data[4..8]),
    )
}

pub(crate) fn write_rid(data: &mut [u8], rid: Rid) {
    LittleEndian::write_i32(&mut data[0..4], rid.page_id);
    LittleEndian::write_u32(&mut data[4..8], rid.slot);
}

/// Entry capacity sanity check used by the tree constructor
pub fn layout_fits<const N: usize>(leaf_max_size: usize, internal_max_size: usize) -> bool {
    LEAF_HEADER_SIZE + leaf_max_size * leaf_entry_size(N) <= PAGE_SIZE
        && NODE_HEADER_SIZE + internal_max_size * internal_entry_size(N) <= PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::INVALID_PAGE_ID;

    #[test]
    fn test_blank_page_is_not_a_node() {
        let page = Page::new(5);
        assert!(matches!(
            BTreeNode::<8>::decode(&page),
            Err(BTreeError::CorruptedPage(5))
        ));
    }

    #[test]
    fn test_leaf_survives_encode_decode() {
        let mut leaf = LeafNode::<8>::new(3, INVALID_PAGE_ID, 4);
        assert!(leaf.insert(GenericKey::from_i64(2), Rid::new(9, 1)));
        assert!(leaf.insert(GenericKey::from_i64(1), Rid::new(9, 0)));
        leaf.next_page_id = 7;

        let mut page = Page::new(3);
        leaf.encode(&mut page);

        match BTreeNode::<8>::decode(&page).unwrap() {
            BTreeNode::Leaf(decoded) => {
                assert_eq!(decoded.page_id, 3);
                assert_eq!(decoded.next_page_id, 7);
                assert_eq!(decoded.entries.len(), 2);
                assert_eq!(decoded.entries[0].0.to_i64(), 1);
                assert_eq!(decoded.entries[1].1, Rid::new(9, 1));
            }
            BTreeNode::Internal(_) => panic!("expected a leaf"),
        }
    }

    #[test]
    fn test_internal_survives_encode_decode() {
        let mut internal = InternalNode::<8>::new(11, INVALID_PAGE_ID, 4);
        internal.entries = vec![
            (GenericKey::zero(), 1),
            (GenericKey::from_i64(10), 2),
            (GenericKey::from_i64(20), 3),
        ];

        let mut page = Page::new(11);
        internal.encode(&mut page);

        match BTreeNode::<8>::decode(&page).unwrap() {
            BTreeNode::Internal(decoded) => {
                assert_eq!(decoded.entries.len(), 3);
                assert_eq!(decoded.entries[1].0.to_i64(), 10);
                assert_eq!(decoded.entries[2].1, 3);
            }
            BTreeNode::Leaf(_) => panic!("expected an internal node"),
        }
    }
}

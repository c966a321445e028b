use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId};
use crate::index::btree::error::BTreeError;
use crate::index::btree::key::GenericKey;
use crate::index::btree::node::{
    internal_entry_size, read_key, read_node_header, write_node_header, NODE_HEADER_SIZE,
    PAGE_TYPE_INTERNAL,
};

/// Internal node: `(key, child)` entries where the key at index 0 is a
/// placeholder. For `i >= 1`, the subtree at `child_i` holds keys in
/// `[key_i, key_{i+1})`.
pub struct InternalNode<const N: usize> {
    pub page_id: PageId,
    pub parent_page_id: PageId,
    pub max_size: usize,
    pub entries: Vec<(GenericKey<N>, PageId)>,
}

impl<const N: usize> InternalNode<N> {
    pub fn new(page_id: PageId, parent_page_id: PageId, max_size: usize) -> Self {
        Self {
            page_id,
            parent_page_id,
            max_size,
            entries: Vec::new(),
        }
    }

    /// A non-root internal node must keep at least this many entries
    pub fn min_size(&self) -> usize {
        (self.max_size + 1) / 2
    }

    pub fn decode(page: &Page) -> Result<Self, BTreeError> {
        let header = read_node_header(page)?;

        let entry_size = internal_entry_size(N);
        let mut entries = Vec::with_capacity(header.size);
        for i in 0..header.size {
            let offset = NODE_HEADER_SIZE + i * entry_size;
            let key = read_key::<N>(&page.data[offset..]);
            let child = LittleEndian::read_i32(&page.data[offset + N..offset + N + 4]);
            entries.push((key, child));
        }

        Ok(Self {
            page_id: page.page_id,
            parent_page_id: header.parent_page_id,
            max_size: header.max_size,
            entries,
        })
    }

    pub fn encode(&self, page: &mut Page) {
        write_node_header(
            page,
            PAGE_TYPE_INTERNAL,
            self.entries.len(),
            self.max_size,
            self.parent_page_id,
        );

        let entry_size = internal_entry_size(N);
        for (i, (key, child)) in self.entries.iter().enumerate() {
            let offset = NODE_HEADER_SIZE + i * entry_size;
            page.data[offset..offset + N].copy_from_slice(key.as_bytes());
            LittleEndian::write_i32(&mut page.data[offset + N..offset + N + 4], *child);
        }
    }

    /// The child whose subtree covers `key`
    pub fn child_for(&self, key: &GenericKey<N>) -> PageId {
        // Number of separators (indices >= 1) that are <= key.
        let pos = self.entries[1..].partition_point(|(k, _)| k <= key);
        self.entries[pos].1
    }

    /// Index of the entry pointing at `child`
    pub fn child_index_of(&self, child: PageId) -> Option<usize> {
        self.entries.iter().position(|&(_, c)| c == child)
    }

    pub fn key_at(&self, index: usize) -> GenericKey<N> {
        self.entries[index].0
    }

    pub fn set_key_at(&mut self, index: usize, key: GenericKey<N>) {
        self.entries[index].0 = key;
    }

    pub fn child_at(&self, index: usize) -> PageId {
        self.entries[index].1
    }

    /// Splice `(key, new_child)` immediately after the entry for
    /// `after_child`
    pub fn insert_after(&mut self, after_child: PageId, key: GenericKey<N>, new_child: PageId) {
        let pos = self
            .child_index_of(after_child)
            .expect("split child must be present in its parent");
        self.entries.insert(pos + 1, (key, new_child));
    }

    /// Remove the entry at `index`
    pub fn remove_at(&mut self, index: usize) {
        self.entries.remove(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::INVALID_PAGE_ID;

    fn key(v: i64) -> GenericKey<8> {
        GenericKey::from_i64(v)
    }

    fn node_with_separators() -> InternalNode<8> {
        let mut node = InternalNode::<8>::new(1, INVALID_PAGE_ID, 4);
        node.entries = vec![
            (GenericKey::zero(), 10),
            (key(100), 11),
            (key(200), 12),
        ];
        node
    }

    #[test]
    fn test_child_for_respects_separator_intervals() {
        let node = node_with_separators();
        assert_eq!(node.child_for(&key(50)), 10);
        assert_eq!(node.child_for(&key(100)), 11, "separator belongs right");
        assert_eq!(node.child_for(&key(150)), 11);
        assert_eq!(node.child_for(&key(200)), 12);
        assert_eq!(node.child_for(&key(500)), 12);
    }

    #[test]
    fn test_insert_after_splices_next_to_old_child() {
        let mut node = node_with_separators();
        node.insert_after(11, key(150), 13);
        let children: Vec<PageId> = node.entries.iter().map(|&(_, c)| c).collect();
        assert_eq!(children, vec![10, 11, 13, 12]);
        assert_eq!(node.key_at(2).to_i64(), 150);
    }

    #[test]
    fn test_min_size() {
        assert_eq!(InternalNode::<8>::new(1, INVALID_PAGE_ID, 4).min_size(), 2);
        assert_eq!(InternalNode::<8>::new(1, INVALID_PAGE_ID, 5).min_size(), 3);
    }
}

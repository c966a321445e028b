use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::key::GenericKey;
use crate::index::btree::node::{
    leaf_entry_size, read_key, read_node_header, read_rid, write_node_header, write_rid,
    LEAF_HEADER_SIZE, PAGE_TYPE_LEAF,
};

/// Leaf node: a sorted array of `(key, rid)` pairs, chained to the next
/// leaf in key order. Keys are unique tree-wide.
pub struct LeafNode<const N: usize> {
    pub page_id: PageId,
    pub parent_page_id: PageId,
    pub max_size: usize,
    pub next_page_id: PageId,
    pub entries: Vec<(GenericKey<N>, Rid)>,
}

impl<const N: usize> LeafNode<N> {
    pub fn new(page_id: PageId, parent_page_id: PageId, max_size: usize) -> Self {
        Self {
            page_id,
            parent_page_id,
            max_size,
            next_page_id: INVALID_PAGE_ID,
            entries: Vec::new(),
        }
    }

    /// A non-root leaf must keep at least this many entries
    pub fn min_size(&self) -> usize {
        self.max_size / 2
    }

    pub fn decode(page: &Page) -> Result<Self, BTreeError> {
        let header = read_node_header(page)?;
        let next_page_id = LittleEndian::read_i32(&page.data[24..28]);

        let entry_size = leaf_entry_size(N);
        let mut entries = Vec::with_capacity(header.size);
        for i in 0..header.size {
            let offset = LEAF_HEADER_SIZE + i * entry_size;
            let key = read_key::<N>(&page.data[offset..]);
            let rid = read_rid(&page.data[offset + N..]);
            entries.push((key, rid));
        }

        Ok(Self {
            page_id: page.page_id,
            parent_page_id: header.parent_page_id,
            max_size: header.max_size,
            next_page_id,
            entries,
        })
    }

    pub fn encode(&self, page: &mut Page) {
        write_node_header(
            page,
            PAGE_TYPE_LEAF,
            self.entries.len(),
            self.max_size,
            self.parent_page_id,
        );
        LittleEndian::write_i32(&mut page.data[24..28], self.next_page_id);

        let entry_size = leaf_entry_size(N);
        for (i, (key, rid)) in self.entries.iter().enumerate() {
            let offset = LEAF_HEADER_SIZE + i * entry_size;
            page.data[offset..offset + N].copy_from_slice(key.as_bytes());
            write_rid(&mut page.data[offset + N..offset + N + 8], *rid);
        }
    }

    /// Position of `key`, or the position it would be inserted at
    pub fn search(&self, key: &GenericKey<N>) -> Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.cmp(key))
    }

    pub fn lookup(&self, key: &GenericKey<N>) -> Option<Rid> {
        self.search(key).ok().map(|i| self.entries[i].1)
    }

    pub fn contains(&self, key: &GenericKey<N>) -> bool {
        self.search(key).is_ok()
    }

    /// Insert keeping the array sorted; false on a duplicate key
    pub fn insert(&mut self, key: GenericKey<N>, rid: Rid) -> bool {
        match self.search(&key) {
            Ok(_) => false,
            Err(pos) => {
                self.entries.insert(pos, (key, rid));
                true
            }
        }
    }

    /// Remove by key; false when absent
    pub fn remove(&mut self, key: &GenericKey<N>) -> bool {
        match self.search(key) {
            Ok(pos) => {
                self.entries.remove(pos);
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(v: i64) -> GenericKey<8> {
        GenericKey::from_i64(v)
    }

    #[test]
    fn test_insert_keeps_sorted_order_and_rejects_duplicates() {
        let mut leaf = LeafNode::<8>::new(1, INVALID_PAGE_ID, 6);
        for v in [5, 1, 3, 2, 4] {
            assert!(leaf.insert(key(v), Rid::new(0, v as u32)));
        }
        assert!(!leaf.insert(key(3), Rid::new(0, 99)));

        let keys: Vec<i64> = leaf.entries.iter().map(|(k, _)| k.to_i64()).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
        assert_eq!(leaf.lookup(&key(3)), Some(Rid::new(0, 3)));
        assert_eq!(leaf.lookup(&key(9)), None);
    }

    #[test]
    fn test_remove() {
        let mut leaf = LeafNode::<8>::new(1, INVALID_PAGE_ID, 6);
        for v in 1..=4 {
            leaf.insert(key(v), Rid::new(0, v as u32));
        }
        assert!(leaf.remove(&key(2)));
        assert!(!leaf.remove(&key(2)));
        let keys: Vec<i64> = leaf.entries.iter().map(|(k, _)| k.to_i64()).collect();
        assert_eq!(keys, vec![1, 3, 4]);
    }

    #[test]
    fn test_min_size() {
        assert_eq!(LeafNode::<8>::new(1, INVALID_PAGE_ID, 4).min_size(), 2);
        assert_eq!(LeafNode::<8>::new(1, INVALID_PAGE_ID, 5).min_size(), 2);
        assert_eq!(LeafNode::<8>::new(1, INVALID_PAGE_ID, 6).min_size(), 3);
    }
}

use std::sync::Arc;
use log::warn;

use crate::common::types::{Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::key::GenericKey;
use crate::index::btree::node::{BTreeNode, LeafNode};
use crate::storage::buffer::BufferPoolManager;

use super::base::{BPlusTree, LeafSearchMode, PageReadGuard};

/// Forward iterator over the leaf chain. Holds a read latch and a pin on
/// the current leaf; both are released on drop and when the iterator runs
/// off the last leaf. Not restartable.
pub struct TreeIterator<const N: usize> {
    buffer_pool: Arc<BufferPoolManager>,
    position: Option<Position<N>>,
    /// Last key yielded; resumption point when a leaf hop had to drop the
    /// current latch before taking the next one
    last_key: Option<GenericKey<N>>,
}

struct Position<const N: usize> {
    guard: PageReadGuard,
    leaf: LeafNode<N>,
    index: usize,
}

impl<const N: usize> TreeIterator<N> {
    fn new(buffer_pool: Arc<BufferPoolManager>, position: Option<Position<N>>) -> Self {
        Self {
            buffer_pool,
            position,
            last_key: None,
        }
    }

    fn release_position(&mut self) {
        if let Some(position) = self.position.take() {
            let page_id = position.leaf.page_id;
            drop(position.guard);
            self.buffer_pool.unpin_page(page_id, false);
        }
    }

    /// Hop to the next leaf. The next leaf's latch is normally taken before
    /// the current one is released; when that latch is contended the
    /// current latch is dropped first so a rebalance latching siblings
    /// right-to-left cannot deadlock against the scan.
    fn advance_leaf(&mut self) {
        let next_id = match &self.position {
            Some(position) => position.leaf.next_page_id,
            None => return,
        };
        if next_id == INVALID_PAGE_ID {
            self.release_position();
            return;
        }

        let next_ptr = match self.buffer_pool.fetch_page(next_id) {
            Ok(ptr) => ptr,
            Err(e) => {
                warn!("scan could not fetch leaf {}: {}", next_id, e);
                self.release_position();
                return;
            }
        };
        let next_guard = match next_ptr.try_read_arc() {
            Some(guard) => guard,
            None => {
                self.release_position();
                next_ptr.read_arc()
            }
        };
        self.release_position();

        match BTreeNode::<N>::decode(&next_guard) {
            Ok(BTreeNode::Leaf(leaf)) => {
                // Skip anything at or below the last yielded key; entries
                // can shift leftward if a rebalance ran during the hop.
                let index = match self.last_key {
                    Some(last) => leaf.entries.partition_point(|&(k, _)| k <= last),
                    None => 0,
                };
                self.position = Some(Position {
                    guard: next_guard,
                    leaf,
                    index,
                });
            }
            _ => {
                warn!("scan reached non-leaf page {}", next_id);
                drop(next_guard);
                self.buffer_pool.unpin_page(next_id, false);
            }
        }
    }
}

impl<const N: usize> Iterator for TreeIterator<N> {
    type Item = (GenericKey<N>, Rid);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let position = self.position.as_mut()?;
            if position.index < position.leaf.entries.len() {
                let entry = position.leaf.entries[position.index];
                position.index += 1;
                self.last_key = Some(entry.0);
                return Some(entry);
            }
            self.advance_leaf();
        }
    }
}

impl<const N: usize> Drop for TreeIterator<N> {
    fn drop(&mut self) {
        self.release_position();
    }
}

impl<const N: usize> BPlusTree<N> {
    /// Iterate from the smallest key
    pub fn begin(&self) -> Result<TreeIterator<N>, BTreeError> {
        let position = self
            .find_leaf_read(LeafSearchMode::Leftmost)?
            .map(|(guard, leaf)| Position {
                guard,
                leaf,
                index: 0,
            });
        Ok(TreeIterator::new(self.buffer_pool.clone(), position))
    }

    /// Iterate from `key`. When the key is absent the iterator is already
    /// exhausted.
    pub fn begin_at(&self, key: &GenericKey<N>) -> Result<TreeIterator<N>, BTreeError> {
        let position = match self.find_leaf_read(LeafSearchMode::ByKey(key))? {
            Some((guard, leaf)) => match leaf.search(key) {
                Ok(index) => Some(Position { guard, leaf, index }),
                Err(_) => {
                    let page_id = leaf.page_id;
                    drop(guard);
                    self.buffer_pool.unpin_page(page_id, false);
                    None
                }
            },
            None => None,
        };
        Ok(TreeIterator::new(self.buffer_pool.clone(), position))
    }
}

use crate::common::types::INVALID_PAGE_ID;
use crate::index::btree::error::BTreeError;
use crate::index::btree::key::GenericKey;
use crate::index::btree::node::BTreeNode;

use super::base::{BPlusTree, LatchedNode, WriteContext};

impl<const N: usize> BPlusTree<N> {
    /// Remove a key. Returns false when the key is absent; the tree is
    /// unchanged in that case.
    pub fn remove(&self, key: &GenericKey<N>) -> Result<bool, BTreeError> {
        if let Some(result) = self.try_optimistic_remove(key)? {
            return Ok(result);
        }
        self.remove_pessimistic(key)
    }

    /// Fast path: write-latch only the leaf. Succeeds when the leaf will
    /// not underflow (or the key is absent).
    fn try_optimistic_remove(&self, key: &GenericKey<N>) -> Result<Option<bool>, BTreeError> {
        let Some(mut found) = self.find_leaf_optimistic(key)? else {
            return Ok(Some(false));
        };

        if !found.leaf.contains(key) {
            found.release(&self.buffer_pool, false);
            return Ok(Some(false));
        }
        let min = if found.is_root {
            1
        } else {
            found.leaf.min_size()
        };
        if found.leaf.entries.len() > min {
            found.leaf.remove(key);
            found.release(&self.buffer_pool, true);
            return Ok(Some(true));
        }

        found.release(&self.buffer_pool, false);
        Ok(None)
    }

    fn remove_pessimistic(&self, key: &GenericKey<N>) -> Result<bool, BTreeError> {
        let mut ctx = WriteContext::new(&self.buffer_pool, self.root_page_id.write());
        if ctx.root_id() == INVALID_PAGE_ID {
            return Ok(false);
        }

        let mut current_id = ctx.root_id();
        let mut at_root = true;
        let mut leaf_latched = loop {
            let latched = self.latch_node_write(current_id)?;
            let safe = match &latched.node {
                BTreeNode::Leaf(leaf) => {
                    if at_root {
                        leaf.entries.len() > 1
                    } else {
                        leaf.entries.len() > leaf.min_size()
                    }
                }
                BTreeNode::Internal(internal) => {
                    if at_root {
                        internal.entries.len() > 2
                    } else {
                        internal.entries.len() > internal.min_size()
                    }
                }
            };
            if safe {
                ctx.release_ancestors();
            }
            match &latched.node {
                BTreeNode::Leaf(_) => break latched,
                BTreeNode::Internal(internal) => {
                    let child_id = internal.child_for(key);
                    ctx.push(latched);
                    current_id = child_id;
                }
            }
            at_root = false;
        };

        if !leaf_latched.leaf_mut().remove(key) {
            leaf_latched.release(&self.buffer_pool);
            return Ok(false);
        }
        leaf_latched.dirty = true;
        self.rebalance(&mut ctx, leaf_latched)?;
        Ok(true)
    }

    /// Restore size bounds from a shrunken node upward: borrow from a
    /// sibling with spare entries, otherwise merge and recurse into the
    /// parent. Drained pages are reclaimed once every latch is dropped.
    fn rebalance(
        &self,
        ctx: &mut WriteContext<'_, N>,
        mut node: LatchedNode<N>,
    ) -> Result<(), BTreeError> {
        loop {
            if ctx.stack.is_empty() {
                return self.finish_root(ctx, node);
            }

            let min = match &node.node {
                BTreeNode::Leaf(leaf) => leaf.min_size(),
                BTreeNode::Internal(internal) => internal.min_size(),
            };
            if node.size() >= min {
                node.release(&self.buffer_pool);
                return Ok(());
            }

            let mut parent = ctx
                .pop()
                .expect("ancestor latch must be retained for an unsafe node");
            let idx = parent
                .internal()
                .child_index_of(node.page_id)
                .expect("node must be referenced by its latched parent");

            if idx > 0 {
                let left_id = parent.internal().child_at(idx - 1);
                let mut left = match self.latch_node_write(left_id) {
                    Ok(latched) => latched,
                    Err(e) => {
                        node.release(&self.buffer_pool);
                        parent.release(&self.buffer_pool);
                        return Err(e);
                    }
                };
                if left.size() > min {
                    self.borrow_from_left(&mut parent, &mut left, &mut node, idx)?;
                    left.release(&self.buffer_pool);
                    node.release(&self.buffer_pool);
                    parent.release(&self.buffer_pool);
                    return Ok(());
                }
                // Left sibling is at minimum: drain `node` into it.
                self.merge_into_left(ctx, &mut parent, &mut left, &mut node, idx)?;
                left.release(&self.buffer_pool);
                node.dirty = false;
                node.release(&self.buffer_pool);
                parent.dirty = true;
                node = parent;
            } else {
                let right_id = parent.internal().child_at(idx + 1);
                let mut right = match self.latch_node_write(right_id) {
                    Ok(latched) => latched,
                    Err(e) => {
                        node.release(&self.buffer_pool);
                        parent.release(&self.buffer_pool);
                        return Err(e);
                    }
                };
                if right.size() > min {
                    self.borrow_from_right(&mut parent, &mut node, &mut right, idx)?;
                    right.release(&self.buffer_pool);
                    node.release(&self.buffer_pool);
                    parent.release(&self.buffer_pool);
                    return Ok(());
                }
                // Right sibling is at minimum: drain it into `node`.
                self.merge_from_right(ctx, &mut parent, &mut node, &mut right, idx)?;
                right.dirty = false;
                right.release(&self.buffer_pool);
                node.dirty = true;
                node.release(&self.buffer_pool);
                parent.dirty = true;
                node = parent;
            }
        }
    }

    /// The recursion reached the root. Collapse it when it became trivial:
    /// an internal root with a single child hands the root role down; an
    /// empty leaf root empties the tree.
    fn finish_root(
        &self,
        ctx: &mut WriteContext<'_, N>,
        node: LatchedNode<N>,
    ) -> Result<(), BTreeError> {
        match &node.node {
            BTreeNode::Leaf(leaf) if leaf.entries.is_empty() => {
                ctx.defer_delete(node.page_id);
                let mut node = node;
                node.dirty = false;
                node.release(&self.buffer_pool);
                self.set_root(ctx, INVALID_PAGE_ID)
            }
            BTreeNode::Internal(internal) if internal.entries.len() == 1 => {
                let child_id = internal.child_at(0);
                ctx.defer_delete(node.page_id);
                let mut node = node;
                node.dirty = false;
                node.release(&self.buffer_pool);
                self.set_child_parent(child_id, INVALID_PAGE_ID)?;
                self.set_root(ctx, child_id)
            }
            _ => {
                node.release(&self.buffer_pool);
                Ok(())
            }
        }
    }

    /// Move the left sibling's last entry to the front of `node`. For
    /// internal nodes the separator rotates through the parent: the moved
    /// child keeps the old separator as its key and the parent takes the
    /// left sibling's edge key.
    fn borrow_from_left(
        &self,
        parent: &mut LatchedNode<N>,
        left: &mut LatchedNode<N>,
        node: &mut LatchedNode<N>,
        idx: usize,
    ) -> Result<(), BTreeError> {
        match (&mut left.node, &mut node.node) {
            (BTreeNode::Leaf(left_leaf), BTreeNode::Leaf(leaf)) => {
                let moved = left_leaf
                    .entries
                    .pop()
                    .expect("sibling above minimum cannot be empty");
                leaf.entries.insert(0, moved);
                parent.internal_mut().set_key_at(idx, leaf.entries[0].0);
            }
            (BTreeNode::Internal(left_int), BTreeNode::Internal(int)) => {
                let (edge_key, moved_child) = left_int
                    .entries
                    .pop()
                    .expect("sibling above minimum cannot be empty");
                let separator = parent.internal().key_at(idx);
                int.entries[0].0 = separator;
                int.entries.insert(0, (edge_key, moved_child));
                parent.internal_mut().set_key_at(idx, edge_key);
                self.set_child_parent(moved_child, int.page_id)?;
            }
            _ => return Err(BTreeError::CorruptedPage(node.page_id)),
        }
        left.dirty = true;
        node.dirty = true;
        parent.dirty = true;
        Ok(())
    }

    /// Move the right sibling's first entry to the back of `node`
    fn borrow_from_right(
        &self,
        parent: &mut LatchedNode<N>,
        node: &mut LatchedNode<N>,
        right: &mut LatchedNode<N>,
        idx: usize,
    ) -> Result<(), BTreeError> {
        match (&mut node.node, &mut right.node) {
            (BTreeNode::Leaf(leaf), BTreeNode::Leaf(right_leaf)) => {
                let moved = right_leaf.entries.remove(0);
                leaf.entries.push(moved);
                parent
                    .internal_mut()
                    .set_key_at(idx + 1, right_leaf.entries[0].0);
            }
            (BTreeNode::Internal(int), BTreeNode::Internal(right_int)) => {
                let (_, moved_child) = right_int.entries.remove(0);
                let separator = parent.internal().key_at(idx + 1);
                int.entries.push((separator, moved_child));
                parent
                    .internal_mut()
                    .set_key_at(idx + 1, right_int.entries[0].0);
                self.set_child_parent(moved_child, int.page_id)?;
            }
            _ => return Err(BTreeError::CorruptedPage(node.page_id)),
        }
        node.dirty = true;
        right.dirty = true;
        parent.dirty = true;
        Ok(())
    }

    /// Concatenate `node` onto its left sibling and unlink it from the
    /// parent. The parent's separator key lands on the first copied entry
    /// of an internal merge.
    fn merge_into_left(
        &self,
        ctx: &mut WriteContext<'_, N>,
        parent: &mut LatchedNode<N>,
        left: &mut LatchedNode<N>,
        node: &mut LatchedNode<N>,
        idx: usize,
    ) -> Result<(), BTreeError> {
        match (&mut left.node, &mut node.node) {
            (BTreeNode::Leaf(left_leaf), BTreeNode::Leaf(leaf)) => {
                left_leaf.entries.append(&mut leaf.entries);
                left_leaf.next_page_id = leaf.next_page_id;
            }
            (BTreeNode::Internal(left_int), BTreeNode::Internal(int)) => {
                int.entries[0].0 = parent.internal().key_at(idx);
                let target = left_int.page_id;
                for &(_, child) in int.entries.iter() {
                    self.set_child_parent(child, target)?;
                }
                left_int.entries.append(&mut int.entries);
            }
            _ => return Err(BTreeError::CorruptedPage(node.page_id)),
        }
        parent.internal_mut().remove_at(idx);
        ctx.defer_delete(node.page_id);
        left.dirty = true;
        Ok(())
    }

    /// Concatenate the right sibling onto `node` and unlink the sibling
    fn merge_from_right(
        &self,
        ctx: &mut WriteContext<'_, N>,
        parent: &mut LatchedNode<N>,
        node: &mut LatchedNode<N>,
        right: &mut LatchedNode<N>,
        idx: usize,
    ) -> Result<(), BTreeError> {
        match (&mut node.node, &mut right.node) {
            (BTreeNode::Leaf(leaf), BTreeNode::Leaf(right_leaf)) => {
                leaf.entries.append(&mut right_leaf.entries);
                leaf.next_page_id = right_leaf.next_page_id;
            }
            (BTreeNode::Internal(int), BTreeNode::Internal(right_int)) => {
                right_int.entries[0].0 = parent.internal().key_at(idx + 1);
                let target = int.page_id;
                for &(_, child) in right_int.entries.iter() {
                    self.set_child_parent(child, target)?;
                }
                int.entries.append(&mut right_int.entries);
            }
            _ => return Err(BTreeError::CorruptedPage(node.page_id)),
        }
        parent.internal_mut().remove_at(idx + 1);
        ctx.defer_delete(right.page_id);
        Ok(())
    }
}

use crate::common::types::{Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::key::GenericKey;
use crate::index::btree::node::{BTreeNode, InternalNode, LeafNode};

use super::base::{BPlusTree, LatchedNode, WriteContext};

impl<const N: usize> BPlusTree<N> {
    /// Insert a unique key. Returns false (without modifying the tree) when
    /// the key is already present.
    pub fn insert(&self, key: GenericKey<N>, rid: Rid) -> Result<bool, BTreeError> {
        if let Some(result) = self.try_optimistic_insert(&key, rid)? {
            return Ok(result);
        }
        self.insert_pessimistic(key, rid)
    }

    /// Fast path: write-latch only the leaf. Succeeds when the leaf will
    /// not overflow; otherwise the caller retries pessimistically.
    fn try_optimistic_insert(
        &self,
        key: &GenericKey<N>,
        rid: Rid,
    ) -> Result<Option<bool>, BTreeError> {
        let Some(mut found) = self.find_leaf_optimistic(key)? else {
            // Empty tree: starting a new tree needs the root latch.
            return Ok(None);
        };

        if found.leaf.contains(key) {
            found.release(&self.buffer_pool, false);
            return Ok(Some(false));
        }
        if found.leaf.entries.len() < self.leaf_max_size - 1 {
            found.leaf.insert(*key, rid);
            found.release(&self.buffer_pool, true);
            return Ok(Some(true));
        }

        found.release(&self.buffer_pool, false);
        Ok(None)
    }

    fn insert_pessimistic(&self, key: GenericKey<N>, rid: Rid) -> Result<bool, BTreeError> {
        let mut ctx = WriteContext::new(&self.buffer_pool, self.root_page_id.write());
        if ctx.root_id() == INVALID_PAGE_ID {
            return self.start_new_tree(&mut ctx, key, rid);
        }

        let mut current_id = ctx.root_id();
        let mut leaf_latched = loop {
            let latched = self.latch_node_write(current_id)?;
            let safe = match &latched.node {
                BTreeNode::Leaf(leaf) => leaf.entries.len() < self.leaf_max_size - 1,
                BTreeNode::Internal(internal) => {
                    internal.entries.len() < self.internal_max_size
                }
            };
            if safe {
                ctx.release_ancestors();
            }
            match &latched.node {
                BTreeNode::Leaf(_) => break latched,
                BTreeNode::Internal(internal) => {
                    let child_id = internal.child_for(&key);
                    ctx.push(latched);
                    current_id = child_id;
                }
            }
        };

        let leaf = leaf_latched.leaf_mut();
        if leaf.contains(&key) {
            leaf_latched.release(&self.buffer_pool);
            return Ok(false);
        }
        leaf.insert(key, rid);
        if leaf.entries.len() < self.leaf_max_size {
            leaf_latched.dirty = true;
            leaf_latched.release(&self.buffer_pool);
            return Ok(true);
        }

        self.split_leaf(&mut ctx, leaf_latched)?;
        Ok(true)
    }

    fn start_new_tree(
        &self,
        ctx: &mut WriteContext<'_, N>,
        key: GenericKey<N>,
        rid: Rid,
    ) -> Result<bool, BTreeError> {
        let (root_id, root_ptr) = self.buffer_pool.new_page()?;
        {
            let mut guard = root_ptr.write();
            let mut leaf = LeafNode::<N>::new(root_id, INVALID_PAGE_ID, self.leaf_max_size);
            leaf.insert(key, rid);
            leaf.encode(&mut guard);
        }
        self.buffer_pool.unpin_page(root_id, true);
        self.set_root(ctx, root_id)?;
        Ok(true)
    }

    /// Split a full leaf, moving its upper half to a new right sibling, and
    /// push the copied separator into the parent.
    fn split_leaf(
        &self,
        ctx: &mut WriteContext<'_, N>,
        mut left: LatchedNode<N>,
    ) -> Result<(), BTreeError> {
        let (new_id, new_ptr) = match self.buffer_pool.new_page() {
            Ok(allocated) => allocated,
            Err(e) => {
                left.release(&self.buffer_pool);
                return Err(e.into());
            }
        };
        let new_guard = new_ptr.write_arc();

        let leaf = left.leaf_mut();
        let split_at = (self.leaf_max_size + 1) / 2;
        let moved = leaf.entries.split_off(split_at);

        let mut new_leaf = LeafNode::<N>::new(new_id, leaf.parent_page_id, self.leaf_max_size);
        new_leaf.entries = moved;
        new_leaf.next_page_id = leaf.next_page_id;
        leaf.next_page_id = new_id;
        let separator = new_leaf.entries[0].0;
        left.dirty = true;

        let right = LatchedNode {
            page_id: new_id,
            guard: new_guard,
            node: BTreeNode::Leaf(new_leaf),
            dirty: true,
        };
        self.insert_into_parent(ctx, left, separator, right)
    }

    /// Link a freshly split-off sibling into the parent, splitting upward
    /// as long as parents overflow. When the stack runs out the split node
    /// was the root and a new root is grown.
    fn insert_into_parent(
        &self,
        ctx: &mut WriteContext<'_, N>,
        mut left: LatchedNode<N>,
        mut separator: GenericKey<N>,
        mut right: LatchedNode<N>,
    ) -> Result<(), BTreeError> {
        loop {
            let Some(mut parent) = ctx.pop() else {
                return self.grow_new_root(ctx, left, separator, right);
            };

            parent
                .internal_mut()
                .insert_after(left.page_id, separator, right.page_id);
            right.node.set_parent_page_id(parent.page_id);
            right.dirty = true;
            left.release(&self.buffer_pool);
            right.release(&self.buffer_pool);

            if parent.internal().entries.len() <= self.internal_max_size {
                parent.dirty = true;
                parent.release(&self.buffer_pool);
                return Ok(());
            }

            // Parent overflowed to max+1 entries: split it. The first key
            // of the new sibling moves up as the next separator; its child
            // pointer moves with it.
            let (new_id, new_ptr) = match self.buffer_pool.new_page() {
                Ok(allocated) => allocated,
                Err(e) => {
                    parent.release(&self.buffer_pool);
                    return Err(e.into());
                }
            };
            let new_guard = new_ptr.write_arc();

            let pnode = parent.internal_mut();
            let split_at = (pnode.entries.len() + 1) / 2;
            let moved = pnode.entries.split_off(split_at);
            let new_separator = moved[0].0;

            let mut new_internal =
                InternalNode::<N>::new(new_id, pnode.parent_page_id, self.internal_max_size);
            new_internal.entries = moved;
            parent.dirty = true;

            let new_right = LatchedNode {
                page_id: new_id,
                guard: new_guard,
                node: BTreeNode::Internal(new_internal),
                dirty: true,
            };

            // Children that moved across now hang off the new sibling.
            let moved_children: Vec<_> = new_right
                .internal()
                .entries
                .iter()
                .map(|&(_, child)| child)
                .collect();
            for child_id in moved_children {
                if let Err(e) = self.set_child_parent(child_id, new_id) {
                    parent.release(&self.buffer_pool);
                    new_right.release(&self.buffer_pool);
                    return Err(e);
                }
            }

            left = parent;
            separator = new_separator;
            right = new_right;
        }
    }

    fn grow_new_root(
        &self,
        ctx: &mut WriteContext<'_, N>,
        mut left: LatchedNode<N>,
        separator: GenericKey<N>,
        mut right: LatchedNode<N>,
    ) -> Result<(), BTreeError> {
        let (root_id, root_ptr) = match self.buffer_pool.new_page() {
            Ok(allocated) => allocated,
            Err(e) => {
                left.release(&self.buffer_pool);
                right.release(&self.buffer_pool);
                return Err(e.into());
            }
        };

        let mut root = InternalNode::<N>::new(root_id, INVALID_PAGE_ID, self.internal_max_size);
        root.entries = vec![
            (GenericKey::zero(), left.page_id),
            (separator, right.page_id),
        ];

        left.node.set_parent_page_id(root_id);
        left.dirty = true;
        right.node.set_parent_page_id(root_id);
        right.dirty = true;
        left.release(&self.buffer_pool);
        right.release(&self.buffer_pool);

        {
            let mut guard = root_ptr.write();
            root.encode(&mut guard);
        }
        self.buffer_pool.unpin_page(root_id, true);
        self.set_root(ctx, root_id)
    }
}

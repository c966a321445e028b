use std::sync::Arc;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock, RwLockWriteGuard};

use crate::common::types::{Page, PageId, Rid, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::key::GenericKey;
use crate::index::btree::node::{layout_fits, BTreeNode, InternalNode, LeafNode};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::HeaderPage;

pub(crate) type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Page>;
pub(crate) type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Page>;

/// A concurrent B+Tree of unique fixed-width keys, backed by buffer pool
/// pages. Readers crab down with read latches; writers first try an
/// optimistic descent that write-latches only the leaf and fall back to a
/// pessimistic descent holding a write-latch stack.
pub struct BPlusTree<const N: usize> {
    pub(crate) index_name: String,
    pub(crate) buffer_pool: Arc<BufferPoolManager>,
    /// Guards `root_page_id` itself; acquired before any page latch
    pub(crate) root_page_id: RwLock<PageId>,
    pub(crate) leaf_max_size: usize,
    pub(crate) internal_max_size: usize,
    pub(crate) header: HeaderPage,
}

impl<const N: usize> BPlusTree<N> {
    /// Open or create the index named `name`. The root page id is persisted
    /// in the header page, so an existing index is picked up again.
    pub fn new(
        name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        let index_name = name.into();
        if leaf_max_size < 3 || internal_max_size < 3 {
            return Err(BTreeError::InvalidConfig(format!(
                "node capacities must be at least 3 (leaf {}, internal {})",
                leaf_max_size, internal_max_size
            )));
        }
        if !layout_fits::<N>(leaf_max_size, internal_max_size) {
            return Err(BTreeError::InvalidConfig(format!(
                "{}-byte keys with capacities {}/{} do not fit in a page",
                N, leaf_max_size, internal_max_size
            )));
        }

        let header = HeaderPage::new();
        let header_ptr = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let root_page_id = {
            let mut page = header_ptr.write();
            match header.get_record(&page, &index_name) {
                Some(root) => root,
                None => {
                    if !header.insert_record(&mut page, &index_name, INVALID_PAGE_ID) {
                        drop(page);
                        buffer_pool.unpin_page(HEADER_PAGE_ID, false);
                        return Err(BTreeError::InvalidConfig(format!(
                            "cannot register index {:?} in the header page",
                            index_name
                        )));
                    }
                    INVALID_PAGE_ID
                }
            }
        };
        buffer_pool.unpin_page(HEADER_PAGE_ID, true);

        Ok(Self {
            index_name,
            buffer_pool,
            root_page_id: RwLock::new(root_page_id),
            leaf_max_size,
            internal_max_size,
            header,
        })
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.read() == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    /// Point lookup
    pub fn get_value(&self, key: &GenericKey<N>) -> Result<Option<Rid>, BTreeError> {
        match self.find_leaf_read(LeafSearchMode::ByKey(key))? {
            None => Ok(None),
            Some((guard, leaf)) => {
                let result = leaf.lookup(key);
                drop(guard);
                self.buffer_pool.unpin_page(leaf.page_id, false);
                Ok(result)
            }
        }
    }

    /// Persist a root change through the header page. The caller holds the
    /// root latch.
    pub(crate) fn update_root_record(&self, root: PageId) -> Result<(), BTreeError> {
        let header_ptr = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut page = header_ptr.write();
            self.header.update_record(&mut page, &self.index_name, root);
        }
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true);
        Ok(())
    }

    /// Read-crab from the root down to a leaf. Returns the read-latched,
    /// pinned leaf, or None when the tree is empty.
    pub(crate) fn find_leaf_read(
        &self,
        mode: LeafSearchMode<'_, N>,
    ) -> Result<Option<(PageReadGuard, LeafNode<N>)>, BTreeError> {
        let root_latch = self.root_page_id.read();
        let root_id = *root_latch;
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let root_ptr = self.buffer_pool.fetch_page(root_id)?;
        let mut guard = root_ptr.read_arc();
        drop(root_latch);
        let mut current_id = root_id;

        loop {
            match BTreeNode::<N>::decode(&guard) {
                Ok(BTreeNode::Leaf(leaf)) => return Ok(Some((guard, leaf))),
                Ok(BTreeNode::Internal(internal)) => {
                    let child_id = match mode {
                        LeafSearchMode::ByKey(key) => internal.child_for(key),
                        LeafSearchMode::Leftmost => internal.child_at(0),
                    };
                    let child_ptr = match self.buffer_pool.fetch_page(child_id) {
                        Ok(ptr) => ptr,
                        Err(e) => {
                            drop(guard);
                            self.buffer_pool.unpin_page(current_id, false);
                            return Err(e.into());
                        }
                    };
                    let child_guard = child_ptr.read_arc();
                    drop(guard);
                    self.buffer_pool.unpin_page(current_id, false);
                    guard = child_guard;
                    current_id = child_id;
                }
                Err(e) => {
                    drop(guard);
                    self.buffer_pool.unpin_page(current_id, false);
                    return Err(e);
                }
            }
        }
    }

    /// Optimistic write descent: read latches down the tree, a write latch
    /// only on the leaf. Returns None when the tree is empty. The returned
    /// leaf may be unsafe for the intended mutation; the caller decides and
    /// falls back to the pessimistic path.
    ///
    /// The leaf's identity is pinned by its parent's read latch (or by the
    /// root latch when the root is the leaf), which blocks any structural
    /// change while the leaf latch is upgraded from read to write.
    pub(crate) fn find_leaf_optimistic(
        &self,
        key: &GenericKey<N>,
    ) -> Result<Option<OptimisticLeaf<N>>, BTreeError> {
        let root_latch = self.root_page_id.read();
        let root_id = *root_latch;
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let root_ptr = self.buffer_pool.fetch_page(root_id)?;

        let root_is_leaf = {
            let guard = root_ptr.read_arc();
            match BTreeNode::<N>::decode(&guard) {
                Ok(node) => node.is_leaf(),
                Err(e) => {
                    drop(guard);
                    self.buffer_pool.unpin_page(root_id, false);
                    return Err(e);
                }
            }
        };

        if root_is_leaf {
            // Still holding the root latch: the root page stays a leaf.
            let guard = root_ptr.write_arc();
            let leaf = match BTreeNode::<N>::decode(&guard) {
                Ok(BTreeNode::Leaf(leaf)) => leaf,
                _ => {
                    drop(guard);
                    self.buffer_pool.unpin_page(root_id, false);
                    return Err(BTreeError::CorruptedPage(root_id));
                }
            };
            return Ok(Some(OptimisticLeaf {
                guard,
                leaf,
                is_root: true,
            }));
        }

        let mut parent_guard = root_ptr.read_arc();
        let mut parent_id = root_id;
        drop(root_latch);

        loop {
            let internal = match BTreeNode::<N>::decode(&parent_guard) {
                Ok(BTreeNode::Internal(internal)) => internal,
                Ok(BTreeNode::Leaf(_)) | Err(_) => {
                    drop(parent_guard);
                    self.buffer_pool.unpin_page(parent_id, false);
                    return Err(BTreeError::CorruptedPage(parent_id));
                }
            };
            let child_id = internal.child_for(key);
            let child_ptr = match self.buffer_pool.fetch_page(child_id) {
                Ok(ptr) => ptr,
                Err(e) => {
                    drop(parent_guard);
                    self.buffer_pool.unpin_page(parent_id, false);
                    return Err(e.into());
                }
            };

            let child_is_leaf = {
                let child_guard = child_ptr.read_arc();
                match BTreeNode::<N>::decode(&child_guard) {
                    Ok(node) => node.is_leaf(),
                    Err(e) => {
                        drop(child_guard);
                        self.buffer_pool.unpin_page(child_id, false);
                        drop(parent_guard);
                        self.buffer_pool.unpin_page(parent_id, false);
                        return Err(e);
                    }
                }
            };

            if !child_is_leaf {
                let child_guard = child_ptr.read_arc();
                drop(parent_guard);
                self.buffer_pool.unpin_page(parent_id, false);
                parent_guard = child_guard;
                parent_id = child_id;
                continue;
            }

            // The parent read latch keeps the leaf in place while its latch
            // is re-acquired in write mode.
            let guard = child_ptr.write_arc();
            drop(parent_guard);
            self.buffer_pool.unpin_page(parent_id, false);

            let leaf = match BTreeNode::<N>::decode(&guard) {
                Ok(BTreeNode::Leaf(leaf)) => leaf,
                _ => {
                    drop(guard);
                    self.buffer_pool.unpin_page(child_id, false);
                    return Err(BTreeError::CorruptedPage(child_id));
                }
            };
            return Ok(Some(OptimisticLeaf {
                guard,
                leaf,
                is_root: false,
            }));
        }
    }

    /// Fetch and write-latch a page as a decoded node
    pub(crate) fn latch_node_write(&self, page_id: PageId) -> Result<LatchedNode<N>, BTreeError> {
        let ptr = self.buffer_pool.fetch_page(page_id)?;
        let guard = ptr.write_arc();
        match BTreeNode::<N>::decode(&guard) {
            Ok(node) => Ok(LatchedNode {
                page_id,
                guard,
                node,
                dirty: false,
            }),
            Err(e) => {
                drop(guard);
                self.buffer_pool.unpin_page(page_id, false);
                Err(e)
            }
        }
    }

    /// Rewrite a child's parent pointer. The caller holds write latches
    /// only on ancestors of `child_id`, so latching the child keeps the
    /// root-to-leaf latch order.
    pub(crate) fn set_child_parent(
        &self,
        child_id: PageId,
        parent_id: PageId,
    ) -> Result<(), BTreeError> {
        let ptr = self.buffer_pool.fetch_page(child_id)?;
        {
            let mut guard = ptr.write();
            let mut node = match BTreeNode::<N>::decode(&guard) {
                Ok(node) => node,
                Err(e) => {
                    drop(guard);
                    self.buffer_pool.unpin_page(child_id, false);
                    return Err(e);
                }
            };
            node.set_parent_page_id(parent_id);
            node.encode(&mut guard);
        }
        self.buffer_pool.unpin_page(child_id, true);
        Ok(())
    }

    /// Install a new root id under the held root latch and persist it.
    pub(crate) fn set_root(
        &self,
        ctx: &mut WriteContext<'_, N>,
        new_root: PageId,
    ) -> Result<(), BTreeError> {
        let guard = ctx
            .root_guard
            .as_mut()
            .expect("root latch must be held to change the root");
        **guard = new_root;
        self.update_root_record(new_root)
    }

    /// Walk the whole tree checking the key-order and size-bound
    /// invariants. Intended for tests; takes no latches beyond one page at
    /// a time.
    pub fn check_integrity(&self) -> Result<(), String> {
        let root_id = self.root_page_id();
        if root_id == INVALID_PAGE_ID {
            return Ok(());
        }
        self.check_subtree(root_id, None, None, true)?;
        self.check_leaf_chain()?;
        Ok(())
    }

    fn check_subtree(
        &self,
        page_id: PageId,
        lower: Option<GenericKey<N>>,
        upper: Option<GenericKey<N>>,
        is_root: bool,
    ) -> Result<(), String> {
        let ptr = self
            .buffer_pool
            .fetch_page(page_id)
            .map_err(|e| format!("fetch {}: {}", page_id, e))?;
        let node = {
            let guard = ptr.read();
            BTreeNode::<N>::decode(&guard).map_err(|e| {
                self.buffer_pool.unpin_page(page_id, false);
                format!("decode {}: {}", page_id, e)
            })?
        };
        self.buffer_pool.unpin_page(page_id, false);

        let result = match &node {
            BTreeNode::Leaf(leaf) => self.check_leaf(leaf, lower, upper, is_root),
            BTreeNode::Internal(internal) => self.check_internal(internal, lower, upper, is_root),
        };
        result
    }

    fn check_leaf(
        &self,
        leaf: &LeafNode<N>,
        lower: Option<GenericKey<N>>,
        upper: Option<GenericKey<N>>,
        is_root: bool,
    ) -> Result<(), String> {
        let size = leaf.entries.len();
        if !is_root && (size < leaf.min_size() || size > self.leaf_max_size - 1) {
            return Err(format!(
                "leaf {} size {} violates [{}, {}]",
                leaf.page_id,
                size,
                leaf.min_size(),
                self.leaf_max_size - 1
            ));
        }
        for window in leaf.entries.windows(2) {
            if window[0].0 >= window[1].0 {
                return Err(format!("leaf {} keys are not strictly ascending", leaf.page_id));
            }
        }
        for (key, _) in &leaf.entries {
            if let Some(lo) = lower {
                if *key < lo {
                    return Err(format!("leaf {} holds a key below its lower bound", leaf.page_id));
                }
            }
            if let Some(hi) = upper {
                if *key >= hi {
                    return Err(format!("leaf {} holds a key above its upper bound", leaf.page_id));
                }
            }
        }
        Ok(())
    }

    fn check_internal(
        &self,
        internal: &InternalNode<N>,
        lower: Option<GenericKey<N>>,
        upper: Option<GenericKey<N>>,
        is_root: bool,
    ) -> Result<(), String> {
        let size = internal.entries.len();
        if is_root {
            if size < 2 {
                return Err(format!("internal root {} has {} children", internal.page_id, size));
            }
        } else if size < internal.min_size() || size > self.internal_max_size {
            return Err(format!(
                "internal {} size {} violates [{}, {}]",
                internal.page_id,
                size,
                internal.min_size(),
                self.internal_max_size
            ));
        }
        for i in 2..size {
            if internal.key_at(i - 1) >= internal.key_at(i) {
                return Err(format!(
                    "internal {} separators are not strictly ascending",
                    internal.page_id
                ));
            }
        }
        for i in 0..size {
            let child_lower = if i == 0 { lower } else { Some(internal.key_at(i)) };
            let child_upper = if i + 1 < size {
                Some(internal.key_at(i + 1))
            } else {
                upper
            };
            self.check_subtree(internal.child_at(i), child_lower, child_upper, false)?;
        }
        Ok(())
    }

    fn check_leaf_chain(&self) -> Result<(), String> {
        let mut previous: Option<GenericKey<N>> = None;
        let mut current = match self
            .find_leaf_read(LeafSearchMode::Leftmost)
            .map_err(|e| format!("descend leftmost: {}", e))?
        {
            Some((guard, leaf)) => {
                drop(guard);
                self.buffer_pool.unpin_page(leaf.page_id, false);
                leaf
            }
            None => return Ok(()),
        };

        loop {
            for (key, _) in &current.entries {
                if let Some(prev) = previous {
                    if prev >= *key {
                        return Err(format!(
                            "leaf chain keys are not strictly ascending at page {}",
                            current.page_id
                        ));
                    }
                }
                previous = Some(*key);
            }
            if current.next_page_id == INVALID_PAGE_ID {
                return Ok(());
            }
            let next_id = current.next_page_id;
            let ptr = self
                .buffer_pool
                .fetch_page(next_id)
                .map_err(|e| format!("fetch {}: {}", next_id, e))?;
            let decoded = {
                let guard = ptr.read();
                BTreeNode::<N>::decode(&guard)
            };
            self.buffer_pool.unpin_page(next_id, false);
            match decoded {
                Ok(BTreeNode::Leaf(leaf)) => current = leaf,
                _ => return Err(format!("leaf chain points at non-leaf page {}", next_id)),
            }
        }
    }
}

/// Descent target for read operations
#[derive(Clone, Copy)]
pub(crate) enum LeafSearchMode<'k, const N: usize> {
    ByKey(&'k GenericKey<N>),
    Leftmost,
}

/// A write-latched leaf reached by the optimistic descent
pub(crate) struct OptimisticLeaf<const N: usize> {
    pub guard: PageWriteGuard,
    pub leaf: LeafNode<N>,
    pub is_root: bool,
}

impl<const N: usize> OptimisticLeaf<N> {
    /// Encode when dirty, release the latch and unpin
    pub fn release(mut self, buffer_pool: &BufferPoolManager, dirty: bool) {
        if dirty {
            self.leaf.encode(&mut self.guard);
        }
        let page_id = self.leaf.page_id;
        drop(self.guard);
        buffer_pool.unpin_page(page_id, dirty);
    }
}

/// A write-latched, decoded node held on the pessimistic latch stack
pub(crate) struct LatchedNode<const N: usize> {
    pub page_id: PageId,
    pub guard: PageWriteGuard,
    pub node: BTreeNode<N>,
    pub dirty: bool,
}

impl<const N: usize> LatchedNode<N> {
    pub fn size(&self) -> usize {
        self.node.size()
    }

    pub fn leaf_mut(&mut self) -> &mut LeafNode<N> {
        match &mut self.node {
            BTreeNode::Leaf(leaf) => leaf,
            BTreeNode::Internal(_) => panic!("expected a leaf node"),
        }
    }

    pub fn internal(&self) -> &InternalNode<N> {
        match &self.node {
            BTreeNode::Internal(internal) => internal,
            BTreeNode::Leaf(_) => panic!("expected an internal node"),
        }
    }

    pub fn internal_mut(&mut self) -> &mut InternalNode<N> {
        match &mut self.node {
            BTreeNode::Internal(internal) => internal,
            BTreeNode::Leaf(_) => panic!("expected an internal node"),
        }
    }

    /// Encode when dirty, release the latch and unpin
    pub fn release(self, buffer_pool: &BufferPoolManager) {
        let LatchedNode {
            page_id,
            mut guard,
            node,
            dirty,
        } = self;
        if dirty {
            node.encode(&mut guard);
        }
        drop(guard);
        buffer_pool.unpin_page(page_id, dirty);
    }
}

/// Per-operation state of a pessimistic descent: the root latch, the stack
/// of retained ancestor write latches, and pages scheduled for deletion
/// once every latch is dropped. Dropping the context releases everything
/// in order: latches first, deferred page deletions last.
pub(crate) struct WriteContext<'a, const N: usize> {
    pub buffer_pool: &'a BufferPoolManager,
    pub root_guard: Option<RwLockWriteGuard<'a, PageId>>,
    pub stack: Vec<LatchedNode<N>>,
    pub pending_delete: Vec<PageId>,
}

impl<'a, const N: usize> WriteContext<'a, N> {
    pub fn new(
        buffer_pool: &'a BufferPoolManager,
        root_guard: RwLockWriteGuard<'a, PageId>,
    ) -> Self {
        Self {
            buffer_pool,
            root_guard: Some(root_guard),
            stack: Vec::new(),
            pending_delete: Vec::new(),
        }
    }

    pub fn root_id(&self) -> PageId {
        **self
            .root_guard
            .as_ref()
            .expect("root latch released before the descent finished")
    }

    pub fn push(&mut self, node: LatchedNode<N>) {
        self.stack.push(node);
    }

    pub fn pop(&mut self) -> Option<LatchedNode<N>> {
        self.stack.pop()
    }

    /// The current node is safe: drop the root latch and every retained
    /// ancestor latch.
    pub fn release_ancestors(&mut self) {
        for node in self.stack.drain(..) {
            node.release(self.buffer_pool);
        }
        self.root_guard = None;
    }

    pub fn defer_delete(&mut self, page_id: PageId) {
        self.pending_delete.push(page_id);
    }
}

impl<const N: usize> Drop for WriteContext<'_, N> {
    fn drop(&mut self) {
        for node in self.stack.drain(..) {
            node.release(self.buffer_pool);
        }
        for page_id in self.pending_delete.drain(..) {
            if let Err(e) = self.buffer_pool.delete_page(page_id) {
                log::warn!("failed to reclaim emptied tree page {}: {}", page_id, e);
            }
        }
        self.root_guard = None;
    }
}

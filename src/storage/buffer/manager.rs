use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::common::types::{FrameId, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::LruKReplacer;
use crate::storage::disk::DiskManager;

/// Frame metadata, valid only while the pool mutex is held. The page bytes
/// themselves live behind the per-frame page latch in `pages`.
struct Frame {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

impl Frame {
    fn new() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
        }
    }

    fn reset(&mut self) {
        self.page_id = INVALID_PAGE_ID;
        self.pin_count = 0;
        self.is_dirty = false;
    }
}

struct PoolState {
    frames: Vec<Frame>,
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    replacer: LruKReplacer,
    next_page_id: PageId,
}

/// Fixed-size cache of disk pages with pinning, dirty tracking and LRU-K
/// eviction. One coarse mutex serializes every public operation; disk I/O
/// happens while it is held. Page latches of victim frames are always free
/// because a victim has no pins.
pub struct BufferPoolManager {
    pool_size: usize,
    pages: Vec<PagePtr>,
    state: Mutex<PoolState>,
    disk_manager: Arc<DiskManager>,
}

impl BufferPoolManager {
    pub fn new(
        pool_size: usize,
        replacer_k: usize,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::with_disk_manager(pool_size, replacer_k, disk_manager))
    }

    pub fn with_disk_manager(
        pool_size: usize,
        replacer_k: usize,
        disk_manager: Arc<DiskManager>,
    ) -> Self {
        assert!(pool_size > 0, "pool size must be positive");
        let mut pages = Vec::with_capacity(pool_size);
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);

        // Initially, every frame is on the free list.
        for i in 0..pool_size {
            pages.push(Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))));
            frames.push(Frame::new());
            free_list.push_back(i);
        }

        Self {
            pool_size,
            pages,
            state: Mutex::new(PoolState {
                frames,
                page_table: HashMap::new(),
                free_list,
                replacer: LruKReplacer::new(pool_size, replacer_k),
                // Page 0 is the header page and is never handed out by
                // new_page; it is reached through fetch_page only.
                next_page_id: 1,
            }),
            disk_manager,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Create a new page with a freshly allocated id, pinned once.
    pub fn new_page(&self) -> Result<(PageId, PagePtr), BufferPoolError> {
        let mut state = self.state.lock();
        let frame_id = self.acquire_frame(&mut state)?;

        let page_id = state.next_page_id;
        state.next_page_id += 1;

        {
            let mut page = self.pages[frame_id].write();
            page.data.fill(0);
            page.page_id = page_id;
        }

        let frame = &mut state.frames[frame_id];
        frame.page_id = page_id;
        frame.pin_count = 1;
        frame.is_dirty = false;
        state.page_table.insert(page_id, frame_id);
        state.replacer.record_access(frame_id);
        state.replacer.set_evictable(frame_id, false);

        Ok((page_id, self.pages[frame_id].clone()))
    }

    /// Fetch a page, reading it from disk if it is not resident. The page
    /// is returned pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id < 0 {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }
        let mut state = self.state.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let frame = &mut state.frames[frame_id];
            frame.pin_count += 1;
            state.replacer.record_access(frame_id);
            state.replacer.set_evictable(frame_id, false);
            return Ok(self.pages[frame_id].clone());
        }

        let frame_id = self.acquire_frame(&mut state)?;
        {
            let mut page = self.pages[frame_id].write();
            self.disk_manager.read_page(page_id, &mut page)?;
        }

        let frame = &mut state.frames[frame_id];
        frame.page_id = page_id;
        frame.pin_count = 1;
        frame.is_dirty = false;
        state.page_table.insert(page_id, frame_id);
        state.replacer.record_access(frame_id);
        state.replacer.set_evictable(frame_id, false);

        Ok(self.pages[frame_id].clone())
    }

    /// Drop one pin on a page. Returns false if the page is not resident or
    /// was not pinned. A `false` dirty argument never clears a dirty bit
    /// set earlier.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut state = self.state.lock();
        let frame_id = match state.page_table.get(&page_id) {
            Some(&id) => id,
            None => return false,
        };
        let frame = &mut state.frames[frame_id];
        if frame.pin_count == 0 {
            return false;
        }
        frame.pin_count -= 1;
        if is_dirty {
            frame.is_dirty = true;
        }
        if frame.pin_count == 0 {
            state.replacer.set_evictable(frame_id, true);
        }
        true
    }

    /// Write a resident page to disk regardless of its dirty bit, then
    /// clear the bit. Ok(false) if the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool, BufferPoolError> {
        let mut state = self.state.lock();
        let frame_id = match state.page_table.get(&page_id) {
            Some(&id) => id,
            None => return Ok(false),
        };
        {
            let page = self.pages[frame_id].read();
            self.disk_manager.write_page(&page)?;
        }
        state.frames[frame_id].is_dirty = false;
        Ok(true)
    }

    /// Flush every resident page, pinned or not.
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();
        let resident: Vec<FrameId> = state.page_table.values().copied().collect();
        for frame_id in resident {
            {
                let page = self.pages[frame_id].read();
                self.disk_manager.write_page(&page)?;
            }
            state.frames[frame_id].is_dirty = false;
        }
        Ok(())
    }

    /// Remove a page from the pool, returning its frame to the free list.
    /// Ok(true) if the page was not resident to begin with; Ok(false) if it
    /// is pinned and cannot be removed.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool, BufferPoolError> {
        let mut state = self.state.lock();
        let frame_id = match state.page_table.get(&page_id) {
            Some(&id) => id,
            None => return Ok(true),
        };
        if state.frames[frame_id].pin_count > 0 {
            return Ok(false);
        }
        if state.frames[frame_id].is_dirty {
            let page = self.pages[frame_id].read();
            self.disk_manager.write_page(&page)?;
        }

        state.page_table.remove(&page_id);
        state.replacer.remove(frame_id);
        state.frames[frame_id].reset();
        self.pages[frame_id].write().reset();
        state.free_list.push_back(frame_id);
        Ok(true)
    }

    /// Obtain a frame: free list first, otherwise evict. The evicted page
    /// is written back when dirty and unmapped.
    fn acquire_frame(&self, state: &mut PoolState) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = state.replacer.evict().ok_or(BufferPoolError::NoFreeFrame)?;
        let old_page_id = state.frames[frame_id].page_id;
        debug_assert_eq!(state.frames[frame_id].pin_count, 0);

        if state.frames[frame_id].is_dirty {
            debug!("evicting dirty page {} from frame {}", old_page_id, frame_id);
            let page = self.pages[frame_id].read();
            self.disk_manager.write_page(&page)?;
        }
        state.page_table.remove(&old_page_id);
        state.frames[frame_id].reset();
        Ok(frame_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn test_pool(pool_size: usize) -> (BufferPoolManager, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let pool = BufferPoolManager::new(pool_size, 2, file.path()).unwrap();
        (pool, file)
    }

    #[test]
    fn test_new_page_ids_are_monotonic() {
        let (pool, _file) = test_pool(4);
        let (id0, _) = pool.new_page().unwrap();
        let (id1, _) = pool.new_page().unwrap();
        let (id2, _) = pool.new_page().unwrap();
        assert_eq!((id0, id1, id2), (1, 2, 3));
    }

    #[test]
    fn test_full_pool_rejects_until_unpin() {
        let (pool, _file) = test_pool(3);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (id, _) = pool.new_page().unwrap();
            ids.push(id);
        }
        assert!(matches!(
            pool.new_page(),
            Err(BufferPoolError::NoFreeFrame)
        ));

        assert!(pool.unpin_page(ids[1], true));
        let (new_id, _) = pool.new_page().unwrap();
        assert_eq!(new_id, 4);

        // The evicted page was dirty: it must survive on disk.
        assert!(pool.unpin_page(new_id, false));
        let page = pool.fetch_page(ids[1]).unwrap();
        assert_eq!(page.read().page_id, ids[1]);
        assert!(pool.unpin_page(ids[1], false));
    }

    #[test]
    fn test_unpin_semantics() {
        let (pool, _file) = test_pool(3);
        let (id, _) = pool.new_page().unwrap();
        assert!(!pool.unpin_page(99, false), "not resident");
        assert!(pool.unpin_page(id, false));
        assert!(!pool.unpin_page(id, false), "already unpinned");
    }

    #[test]
    fn test_dirty_bit_is_sticky() {
        let (pool, _file) = test_pool(3);
        let (id, page) = pool.new_page().unwrap();
        page.write().data[0] = 7;
        assert!(pool.unpin_page(id, true));

        let _page = pool.fetch_page(id).unwrap();
        // Unpinning clean does not clear the earlier dirty mark: eviction
        // must still write the page back.
        assert!(pool.unpin_page(id, false));
        for _ in 0..3 {
            let (nid, _) = pool.new_page().unwrap();
            pool.unpin_page(nid, false);
        }
        let page = pool.fetch_page(id).unwrap();
        assert_eq!(page.read().data[0], 7);
        pool.unpin_page(id, false);
    }

    #[test]
    fn test_delete_page() {
        let (pool, _file) = test_pool(3);
        let (id, _) = pool.new_page().unwrap();

        assert!(!pool.delete_page(id).unwrap(), "pinned page stays");
        assert!(pool.unpin_page(id, false));
        assert!(pool.delete_page(id).unwrap());
        assert!(pool.delete_page(id).unwrap(), "absent page is trivially deleted");

        // Frame went back to the free list: three more pages fit.
        for _ in 0..3 {
            pool.new_page().unwrap();
        }
    }

    #[test]
    fn test_flush_page_clears_dirty() {
        let (pool, _file) = test_pool(3);
        let (id, page) = pool.new_page().unwrap();
        page.write().data[10] = 42;
        assert!(pool.unpin_page(id, true));
        assert!(pool.flush_page(id).unwrap());
        assert!(!pool.flush_page(999).unwrap());
    }

    #[test]
    fn test_fetch_unknown_page_reads_blank() {
        let (pool, _file) = test_pool(3);
        let page = pool.fetch_page(17).unwrap();
        assert_eq!(page.read().page_id, 17);
        assert!(page.read().data.iter().all(|&b| b == 0));
        assert!(pool.unpin_page(17, false));
    }
}

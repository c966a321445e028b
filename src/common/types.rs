use std::sync::Arc;
use parking_lot::RwLock;

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page ID type; pages are addressed from 0 in the database file
pub type PageId = i32;

/// Sentinel for "no page"
pub const INVALID_PAGE_ID: PageId = -1;

/// The header page always lives at the front of the file
pub const HEADER_PAGE_ID: PageId = 0;

/// Buffer pool frame index type
pub type FrameId = usize;

/// Transaction ID type
pub type TxnId = u32;

/// Sentinel for "no transaction"
pub const INVALID_TXN_ID: TxnId = TxnId::MAX;

/// Table object ID type
pub type TableOid = u32;

/// Record ID: the physical address of a tuple (heap page + slot)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rid {
    pub page_id: PageId,
    pub slot: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }
}

/// Page structure: a fixed-size byte buffer plus the id of the disk page it
/// currently holds. Pin counts and dirty bits are frame metadata owned by
/// the buffer pool; the surrounding `RwLock` is the page latch.
pub struct Page {
    pub data: Box<[u8; PAGE_SIZE]>,
    pub page_id: PageId,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            data: Box::new([0; PAGE_SIZE]),
            page_id,
        }
    }

    pub fn reset(&mut self) {
        self.data.fill(0);
        self.page_id = INVALID_PAGE_ID;
    }
}

/// Smart pointer to a latched page
pub type PagePtr = Arc<RwLock<Page>>;

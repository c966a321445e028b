use thiserror::Error;
use crate::common::types::PageId;
use crate::storage::buffer::BufferPoolError;

#[derive(Error, Debug)]
pub enum BTreeError {
    #[error("out of memory: {0}")]
    OutOfMemory(#[from] BufferPoolError),

    #[error("page {0} does not hold a valid tree node")]
    CorruptedPage(PageId),

    #[error("invalid index configuration: {0}")]
    InvalidConfig(String),
}

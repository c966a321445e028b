// Export public modules
pub mod common;
pub mod storage;
pub mod index;
pub mod transaction;

// Re-export key items for convenient access
pub use storage::buffer::BufferPoolManager;
pub use storage::buffer::BufferPoolError;
pub use index::btree::BPlusTree;
pub use transaction::concurrency::LockManager;
pub use transaction::concurrency::TransactionManager;

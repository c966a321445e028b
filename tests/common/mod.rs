use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use tempfile::NamedTempFile;

use stratadb::storage::buffer::BufferPoolManager;
use stratadb::transaction::concurrency::{LockManager, TransactionManager};

// Create a temporary database file for testing
#[allow(dead_code)]
pub fn create_temp_db_file() -> Result<(NamedTempFile, String)> {
    let file = NamedTempFile::new()?;
    let path = file.path().to_str().unwrap().to_string();
    Ok((file, path))
}

// Create a buffer pool manager with a temporary database
#[allow(dead_code)]
pub fn create_test_buffer_pool(
    pool_size: usize,
    replacer_k: usize,
) -> Result<(Arc<BufferPoolManager>, NamedTempFile)> {
    let (file, path) = create_temp_db_file()?;
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, replacer_k, path)?);
    Ok((buffer_pool, file))
}

// Lock manager plus transaction manager with a fast detection cycle so
// deadlock tests finish quickly
#[allow(dead_code)]
pub fn create_test_lock_managers() -> (Arc<LockManager>, Arc<TransactionManager>) {
    let lock_manager = LockManager::new(Duration::from_millis(30));
    let txn_manager = Arc::new(TransactionManager::new(lock_manager.clone()));
    (lock_manager, txn_manager)
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;

use crate::common::types::TxnId;
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionState,
};

/// Transaction manager - creates and tracks transactions and drives their
/// lock cleanup on commit and abort.
pub struct TransactionManager {
    /// Next transaction ID to assign; newer transactions are "younger"
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
    active_transactions: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            lock_manager,
            active_transactions: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a new transaction
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active_transactions.lock().insert(txn_id, txn.clone());
        txn
    }

    /// Commit: transition the state, then release every lock still held
    pub fn commit(&self, txn: &Arc<Transaction>) {
        txn.set_state(TransactionState::Committed);
        self.lock_manager.release_all(txn);
        self.active_transactions.lock().remove(&txn.id());
    }

    /// Abort: transition the state, then release every lock still held.
    /// Also the cleanup half for deadlock victims and protocol rejections,
    /// whose state is already Aborted.
    pub fn abort(&self, txn: &Arc<Transaction>) {
        txn.set_state(TransactionState::Aborted);
        self.lock_manager.release_all(txn);
        self.active_transactions.lock().remove(&txn.id());
    }

    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active_transactions.lock().get(&txn_id).cloned()
    }

    pub fn active_transaction_ids(&self) -> Vec<TxnId> {
        self.active_transactions.lock().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_manager() -> TransactionManager {
        TransactionManager::new(LockManager::new(Duration::from_millis(50)))
    }

    #[test]
    fn test_begin_assigns_increasing_ids() {
        let tm = test_manager();
        let t1 = tm.begin(IsolationLevel::ReadCommitted);
        let t2 = tm.begin(IsolationLevel::RepeatableRead);
        assert_eq!(t1.id(), 1);
        assert_eq!(t2.id(), 2);
        assert_eq!(tm.active_transaction_ids().len(), 2);
    }

    #[test]
    fn test_commit_and_abort_retire_transactions() {
        let tm = test_manager();
        let t1 = tm.begin(IsolationLevel::ReadCommitted);
        let t2 = tm.begin(IsolationLevel::ReadCommitted);

        tm.commit(&t1);
        assert_eq!(t1.state(), TransactionState::Committed);
        assert!(tm.get_transaction(t1.id()).is_none());

        tm.abort(&t2);
        assert_eq!(t2.state(), TransactionState::Aborted);
        assert!(tm.get_transaction(t2.id()).is_none());
        assert!(tm.active_transaction_ids().is_empty());
    }
}

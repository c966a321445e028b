// Represents an active database transaction and the locks it holds

use std::collections::{HashMap, HashSet};
use std::fmt;
use parking_lot::{Mutex, MutexGuard, RwLock};
use thiserror::Error;

use crate::common::types::{Rid, TableOid, TxnId};
use crate::transaction::concurrency::lock_manager::LockMode;

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase locking states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Why a lock request aborted its transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    LockSharedOnReadUncommitted,
    UpgradeConflict,
    IncompatibleUpgrade,
    AttemptedUnlockButNoLockHeld,
    AttemptedIntentionLockOnRow,
    TableLockNotPresent,
    TableUnlockedBeforeUnlockingRows,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AbortReason::LockOnShrinking => "lock requested while shrinking",
            AbortReason::LockSharedOnReadUncommitted => {
                "shared lock requested under READ_UNCOMMITTED"
            }
            AbortReason::UpgradeConflict => "another transaction is already upgrading",
            AbortReason::IncompatibleUpgrade => "lock upgrade is not a strict strengthening",
            AbortReason::AttemptedUnlockButNoLockHeld => "no lock held on the resource",
            AbortReason::AttemptedIntentionLockOnRow => "intention lock requested on a row",
            AbortReason::TableLockNotPresent => "row lock without a supporting table lock",
            AbortReason::TableUnlockedBeforeUnlockingRows => {
                "table unlocked while row locks remain"
            }
        };
        f.write_str(text)
    }
}

/// Raised when a lock operation violates the locking protocol. The
/// transaction has already been moved to the Aborted state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("transaction {txn_id} aborted: {reason}")]
pub struct TransactionAbortError {
    pub txn_id: TxnId,
    pub reason: AbortReason,
}

/// Granted locks, stored inline so abort cleanup stays local: one table set
/// per mode and per-table row sets for the two row modes.
#[derive(Default)]
pub struct LockSets {
    pub shared_table: HashSet<TableOid>,
    pub exclusive_table: HashSet<TableOid>,
    pub intention_shared_table: HashSet<TableOid>,
    pub intention_exclusive_table: HashSet<TableOid>,
    pub shared_intention_exclusive_table: HashSet<TableOid>,
    pub shared_rows: HashMap<TableOid, HashSet<Rid>>,
    pub exclusive_rows: HashMap<TableOid, HashSet<Rid>>,
}

impl LockSets {
    pub(crate) fn table_set_mut(&mut self, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::Shared => &mut self.shared_table,
            LockMode::Exclusive => &mut self.exclusive_table,
            LockMode::IntentionShared => &mut self.intention_shared_table,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_table,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_table,
        }
    }

    pub(crate) fn row_map_mut(
        &mut self,
        mode: LockMode,
    ) -> Option<&mut HashMap<TableOid, HashSet<Rid>>> {
        match mode {
            LockMode::Shared => Some(&mut self.shared_rows),
            LockMode::Exclusive => Some(&mut self.exclusive_rows),
            _ => None,
        }
    }
}

/// Transaction - identity, 2PL state and granted-lock bookkeeping. Lock
/// acquisition itself lives in the lock manager.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: RwLock<TransactionState>,
    locks: Mutex<LockSets>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: RwLock::new(TransactionState::Growing),
            locks: Mutex::new(LockSets::default()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.write() = state;
    }

    pub(crate) fn lock_sets(&self) -> MutexGuard<'_, LockSets> {
        self.locks.lock()
    }

    /// Does this transaction hold a table lock of exactly `mode` on `oid`?
    pub fn holds_table_lock(&self, oid: TableOid, mode: LockMode) -> bool {
        self.locks.lock().table_set_mut(mode).contains(&oid)
    }

    /// Does this transaction hold a row lock of exactly `mode`?
    pub fn holds_row_lock(&self, oid: TableOid, rid: Rid, mode: LockMode) -> bool {
        let mut locks = self.locks.lock();
        match locks.row_map_mut(mode) {
            Some(map) => map.get(&oid).is_some_and(|rows| rows.contains(&rid)),
            None => false,
        }
    }

    /// True when a write-capable table lock (X, IX or SIX) is held,
    /// which row X locks require.
    pub fn holds_write_table_lock(&self, oid: TableOid) -> bool {
        let locks = self.locks.lock();
        locks.exclusive_table.contains(&oid)
            || locks.intention_exclusive_table.contains(&oid)
            || locks.shared_intention_exclusive_table.contains(&oid)
    }

    /// True when any row lock on `oid` is still held
    pub fn holds_row_locks_on(&self, oid: TableOid) -> bool {
        let locks = self.locks.lock();
        locks
            .shared_rows
            .get(&oid)
            .is_some_and(|rows| !rows.is_empty())
            || locks
                .exclusive_rows
                .get(&oid)
                .is_some_and(|rows| !rows.is_empty())
    }

    /// All shared row locks held on `oid` (used by scan teardown)
    pub fn shared_row_locks_on(&self, oid: TableOid) -> Vec<Rid> {
        let locks = self.locks.lock();
        locks
            .shared_rows
            .get(&oid)
            .map(|rows| rows.iter().copied().collect())
            .unwrap_or_default()
    }
}

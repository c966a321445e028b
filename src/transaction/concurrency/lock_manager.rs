// Hierarchical two-phase lock manager: table and row locks with five
// modes, FIFO wait queues, lock upgrades and isolation-level enforcement.
// Deadlock detection lives in the sibling `deadlock` module.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TableOid, TxnId};
use crate::transaction::concurrency::deadlock;
use crate::transaction::concurrency::transaction::{
    AbortReason, IsolationLevel, Transaction, TransactionAbortError, TransactionState,
};

/// Lock modes on tables; rows only take `Shared` and `Exclusive`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
    IntentionShared,
    IntentionExclusive,
    SharedIntentionExclusive,
}

impl LockMode {
    /// May a lock of `self` be granted while `held` is granted?
    pub fn compatible_with(self, held: LockMode) -> bool {
        use LockMode::*;
        match self {
            IntentionShared => held != Exclusive,
            IntentionExclusive => matches!(held, IntentionShared | IntentionExclusive),
            Shared => matches!(held, IntentionShared | Shared),
            SharedIntentionExclusive => held == IntentionShared,
            Exclusive => false,
        }
    }

    /// Permitted upgrades strictly strengthen the held mode
    pub fn upgradable_to(self, requested: LockMode) -> bool {
        use LockMode::*;
        match self {
            IntentionShared => matches!(
                requested,
                Shared | Exclusive | IntentionExclusive | SharedIntentionExclusive
            ),
            Shared => matches!(requested, Exclusive | SharedIntentionExclusive),
            IntentionExclusive => matches!(requested, Exclusive | SharedIntentionExclusive),
            SharedIntentionExclusive => requested == Exclusive,
            Exclusive => false,
        }
    }

    fn is_shared_family(self) -> bool {
        use LockMode::*;
        matches!(self, Shared | IntentionShared | SharedIntentionExclusive)
    }

    fn is_intention(self) -> bool {
        use LockMode::*;
        matches!(
            self,
            IntentionShared | IntentionExclusive | SharedIntentionExclusive
        )
    }
}

/// The resource a request addresses; decides which lock set is updated
#[derive(Clone, Copy)]
enum ResourceId {
    Table(TableOid),
    Row(TableOid, Rid),
}

pub(crate) struct LockRequest {
    pub txn: Arc<Transaction>,
    pub mode: LockMode,
    pub granted: bool,
}

pub(crate) struct QueueState {
    pub requests: VecDeque<LockRequest>,
    /// At most one transaction may upgrade on a resource at a time
    pub upgrading: Option<TxnId>,
}

/// FIFO queue of lock requests on one resource
pub(crate) struct LockRequestQueue {
    pub state: Mutex<QueueState>,
    pub cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                requests: VecDeque::new(),
                upgrading: None,
            }),
            cv: Condvar::new(),
        }
    }
}

/// Table/row lock manager. Blocking acquires wait on per-resource
/// condition variables; a background thread aborts deadlock victims.
pub struct LockManager {
    pub(crate) table_lock_map: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    pub(crate) row_lock_map: Mutex<HashMap<Rid, Arc<LockRequestQueue>>>,
    pub(crate) running: AtomicBool,
    detector: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    /// Create the lock manager and start its deadlock detection thread,
    /// which wakes every `cycle_detection_interval`.
    pub fn new(cycle_detection_interval: Duration) -> Arc<Self> {
        let manager = Arc::new(Self {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
            detector: Mutex::new(None),
        });
        let weak: Weak<LockManager> = Arc::downgrade(&manager);
        let handle = std::thread::spawn(move || {
            deadlock::run_cycle_detection(weak, cycle_detection_interval);
        });
        *manager.detector.lock() = Some(handle);
        manager
    }

    /// Acquire a table lock. Ok(true) once granted; Ok(false) when the
    /// transaction was aborted while waiting (deadlock victim); Err when
    /// the request violates the protocol, which also aborts the
    /// transaction.
    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> Result<bool, TransactionAbortError> {
        if matches!(
            txn.state(),
            TransactionState::Aborted | TransactionState::Committed
        ) {
            return Ok(false);
        }
        Self::check_isolation(txn, mode)?;

        let queue = self.table_queue(oid);
        self.acquire(txn, mode, &queue, ResourceId::Table(oid))
    }

    /// Acquire a row lock. Intention modes are rejected, and row X
    /// requires a write-capable lock (X, IX or SIX) on the owning table.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Rid,
    ) -> Result<bool, TransactionAbortError> {
        if matches!(
            txn.state(),
            TransactionState::Aborted | TransactionState::Committed
        ) {
            return Ok(false);
        }
        if mode.is_intention() {
            return Err(Self::abort(txn, AbortReason::AttemptedIntentionLockOnRow));
        }
        Self::check_isolation(txn, mode)?;
        if mode == LockMode::Exclusive && !txn.holds_write_table_lock(oid) {
            return Err(Self::abort(txn, AbortReason::TableLockNotPresent));
        }

        let queue = self.row_queue(rid);
        self.acquire(txn, mode, &queue, ResourceId::Row(oid, rid))
    }

    /// Release a table lock. Every row lock on the table must already be
    /// released. May move the transaction to Shrinking.
    pub fn unlock_table(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
    ) -> Result<bool, TransactionAbortError> {
        let queue = {
            let map = self.table_lock_map.lock();
            match map.get(&oid) {
                Some(queue) => queue.clone(),
                None => {
                    return Err(Self::abort(txn, AbortReason::AttemptedUnlockButNoLockHeld))
                }
            }
        };
        if txn.holds_row_locks_on(oid) {
            return Err(Self::abort(
                txn,
                AbortReason::TableUnlockedBeforeUnlockingRows,
            ));
        }

        let mode = {
            let mut state = queue.state.lock();
            match Self::take_granted_request(&mut state, txn.id()) {
                Some(mode) => {
                    queue.cv.notify_all();
                    mode
                }
                None => {
                    drop(state);
                    return Err(Self::abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
                }
            }
        };

        Self::apply_unlock_transition(txn, mode);
        Self::remove_from_lock_sets(txn, mode, &ResourceId::Table(oid));
        Ok(true)
    }

    /// Release a row lock. May move the transaction to Shrinking.
    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: Rid,
    ) -> Result<bool, TransactionAbortError> {
        let queue = {
            let map = self.row_lock_map.lock();
            match map.get(&rid) {
                Some(queue) => queue.clone(),
                None => {
                    return Err(Self::abort(txn, AbortReason::AttemptedUnlockButNoLockHeld))
                }
            }
        };

        let mode = {
            let mut state = queue.state.lock();
            match Self::take_granted_request(&mut state, txn.id()) {
                Some(mode) => {
                    queue.cv.notify_all();
                    mode
                }
                None => {
                    drop(state);
                    return Err(Self::abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
                }
            }
        };

        Self::apply_unlock_transition(txn, mode);
        Self::remove_from_lock_sets(txn, mode, &ResourceId::Row(oid, rid));
        Ok(true)
    }

    /// Drop every granted lock of `txn` without 2PL state transitions.
    /// Used by commit and abort cleanup; rows go before tables so the
    /// table-before-rows unlock rule is never violated.
    pub fn release_all(&self, txn: &Arc<Transaction>) {
        let (rids, oids) = {
            let mut sets = txn.lock_sets();
            let mut rids: HashSet<Rid> = HashSet::new();
            for rows in sets.shared_rows.values() {
                rids.extend(rows.iter().copied());
            }
            for rows in sets.exclusive_rows.values() {
                rids.extend(rows.iter().copied());
            }
            let mut oids: HashSet<TableOid> = HashSet::new();
            oids.extend(sets.shared_table.iter().copied());
            oids.extend(sets.exclusive_table.iter().copied());
            oids.extend(sets.intention_shared_table.iter().copied());
            oids.extend(sets.intention_exclusive_table.iter().copied());
            oids.extend(sets.shared_intention_exclusive_table.iter().copied());
            sets.shared_rows.clear();
            sets.exclusive_rows.clear();
            sets.shared_table.clear();
            sets.exclusive_table.clear();
            sets.intention_shared_table.clear();
            sets.intention_exclusive_table.clear();
            sets.shared_intention_exclusive_table.clear();
            (rids, oids)
        };

        for rid in rids {
            let queue = {
                let map = self.row_lock_map.lock();
                map.get(&rid).cloned()
            };
            if let Some(queue) = queue {
                let mut state = queue.state.lock();
                state
                    .requests
                    .retain(|r| !(r.granted && r.txn.id() == txn.id()));
                queue.cv.notify_all();
            }
        }
        for oid in oids {
            let queue = {
                let map = self.table_lock_map.lock();
                map.get(&oid).cloned()
            };
            if let Some(queue) = queue {
                let mut state = queue.state.lock();
                state
                    .requests
                    .retain(|r| !(r.granted && r.txn.id() == txn.id()));
                queue.cv.notify_all();
            }
        }
    }

    fn table_queue(&self, oid: TableOid) -> Arc<LockRequestQueue> {
        let mut map = self.table_lock_map.lock();
        map.entry(oid)
            .or_insert_with(|| Arc::new(LockRequestQueue::new()))
            .clone()
    }

    fn row_queue(&self, rid: Rid) -> Arc<LockRequestQueue> {
        let mut map = self.row_lock_map.lock();
        map.entry(rid)
            .or_insert_with(|| Arc::new(LockRequestQueue::new()))
            .clone()
    }

    /// Queue protocol shared by tables and rows: dedup/upgrade handling,
    /// FIFO waiting on the condition variable, grant bookkeeping.
    fn acquire(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        queue: &Arc<LockRequestQueue>,
        resource: ResourceId,
    ) -> Result<bool, TransactionAbortError> {
        let mut state = queue.state.lock();

        if let Some(pos) = state
            .requests
            .iter()
            .position(|r| r.txn.id() == txn.id())
        {
            let held = state.requests[pos].mode;
            if held == mode {
                return Ok(true);
            }
            if state.upgrading.is_some() {
                drop(state);
                return Err(Self::abort(txn, AbortReason::UpgradeConflict));
            }
            if !held.upgradable_to(mode) {
                drop(state);
                return Err(Self::abort(txn, AbortReason::IncompatibleUpgrade));
            }

            // Re-queue the upgrade ahead of every waiter.
            state.requests.remove(pos);
            Self::remove_from_lock_sets(txn, held, &resource);
            let insert_at = state
                .requests
                .iter()
                .position(|r| !r.granted)
                .unwrap_or(state.requests.len());
            state.requests.insert(
                insert_at,
                LockRequest {
                    txn: txn.clone(),
                    mode,
                    granted: false,
                },
            );
            state.upgrading = Some(txn.id());

            while !Self::grantable(&state, txn.id(), mode) {
                queue.cv.wait(&mut state);
                if txn.state() == TransactionState::Aborted {
                    state.upgrading = None;
                    Self::remove_waiting_request(&mut state, txn.id());
                    queue.cv.notify_all();
                    return Ok(false);
                }
            }
            state.upgrading = None;
            Self::mark_granted(&mut state, txn.id());
            Self::add_to_lock_sets(txn, mode, &resource);
            if mode != LockMode::Exclusive {
                queue.cv.notify_all();
            }
            return Ok(true);
        }

        state.requests.push_back(LockRequest {
            txn: txn.clone(),
            mode,
            granted: false,
        });

        while !Self::grantable(&state, txn.id(), mode) {
            queue.cv.wait(&mut state);
            if txn.state() == TransactionState::Aborted {
                Self::remove_waiting_request(&mut state, txn.id());
                queue.cv.notify_all();
                return Ok(false);
            }
        }
        Self::mark_granted(&mut state, txn.id());
        Self::add_to_lock_sets(txn, mode, &resource);
        if mode != LockMode::Exclusive {
            queue.cv.notify_all();
        }
        Ok(true)
    }

    /// A waiter is granted only when it is the first ungranted request and
    /// its mode is compatible with every granted one: strict FIFO among
    /// waiters.
    fn grantable(state: &QueueState, txn_id: TxnId, mode: LockMode) -> bool {
        for request in &state.requests {
            if request.granted {
                if !mode.compatible_with(request.mode) {
                    return false;
                }
            } else {
                return request.txn.id() == txn_id;
            }
        }
        false
    }

    fn mark_granted(state: &mut QueueState, txn_id: TxnId) {
        if let Some(request) = state
            .requests
            .iter_mut()
            .find(|r| !r.granted && r.txn.id() == txn_id)
        {
            request.granted = true;
        }
    }

    fn remove_waiting_request(state: &mut QueueState, txn_id: TxnId) {
        if let Some(pos) = state
            .requests
            .iter()
            .position(|r| !r.granted && r.txn.id() == txn_id)
        {
            state.requests.remove(pos);
        }
    }

    fn take_granted_request(state: &mut QueueState, txn_id: TxnId) -> Option<LockMode> {
        let pos = state
            .requests
            .iter()
            .position(|r| r.granted && r.txn.id() == txn_id)?;
        state.requests.remove(pos).map(|r| r.mode)
    }

    /// Per-isolation-level admission rules. Rejection aborts.
    fn check_isolation(
        txn: &Arc<Transaction>,
        mode: LockMode,
    ) -> Result<(), TransactionAbortError> {
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                if mode.is_shared_family() {
                    return Err(Self::abort(
                        txn,
                        AbortReason::LockSharedOnReadUncommitted,
                    ));
                }
                if txn.state() == TransactionState::Shrinking
                    && matches!(mode, LockMode::Exclusive | LockMode::IntentionExclusive)
                {
                    return Err(Self::abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if txn.state() == TransactionState::Shrinking
                    && !matches!(mode, LockMode::Shared | LockMode::IntentionShared)
                {
                    return Err(Self::abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::RepeatableRead => {
                if txn.state() == TransactionState::Shrinking {
                    return Err(Self::abort(txn, AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    /// Unlocking S or X may end the growing phase, depending on the
    /// isolation level.
    fn apply_unlock_transition(txn: &Transaction, mode: LockMode) {
        if txn.state() != TransactionState::Growing {
            return;
        }
        let shrinks = match txn.isolation_level() {
            IsolationLevel::ReadUncommitted | IsolationLevel::ReadCommitted => {
                mode == LockMode::Exclusive
            }
            IsolationLevel::RepeatableRead => {
                matches!(mode, LockMode::Shared | LockMode::Exclusive)
            }
        };
        if shrinks {
            txn.set_state(TransactionState::Shrinking);
        }
    }

    fn add_to_lock_sets(txn: &Transaction, mode: LockMode, resource: &ResourceId) {
        let mut sets = txn.lock_sets();
        match resource {
            ResourceId::Table(oid) => {
                sets.table_set_mut(mode).insert(*oid);
            }
            ResourceId::Row(oid, rid) => {
                if let Some(map) = sets.row_map_mut(mode) {
                    map.entry(*oid).or_default().insert(*rid);
                }
            }
        }
    }

    fn remove_from_lock_sets(txn: &Transaction, mode: LockMode, resource: &ResourceId) {
        let mut sets = txn.lock_sets();
        match resource {
            ResourceId::Table(oid) => {
                sets.table_set_mut(mode).remove(oid);
            }
            ResourceId::Row(oid, rid) => {
                if let Some(map) = sets.row_map_mut(mode) {
                    if let Some(rows) = map.get_mut(oid) {
                        rows.remove(rid);
                    }
                }
            }
        }
    }

    fn abort(txn: &Transaction, reason: AbortReason) -> TransactionAbortError {
        txn.set_state(TransactionState::Aborted);
        TransactionAbortError {
            txn_id: txn.id(),
            reason,
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.detector.lock().take() {
            // The final Arc can be dropped from inside the detector thread
            // itself; joining there would wait forever.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_lattice() {
        use LockMode::*;
        let modes = [IntentionShared, IntentionExclusive, Shared, SharedIntentionExclusive, Exclusive];
        // Row-major truth table in the order IS, IX, S, SIX, X, with the
        // held mode indexing rows.
        let table = [
            [true, true, true, true, false],
            [true, true, false, false, false],
            [true, false, true, false, false],
            [true, false, false, false, false],
            [false, false, false, false, false],
        ];
        for (held_idx, &held) in modes.iter().enumerate() {
            for (req_idx, &requested) in modes.iter().enumerate() {
                assert_eq!(
                    requested.compatible_with(held),
                    table[held_idx][req_idx],
                    "held {:?} requested {:?}",
                    held,
                    requested
                );
            }
        }
    }

    #[test]
    fn test_upgrade_rules() {
        use LockMode::*;
        assert!(IntentionShared.upgradable_to(Shared));
        assert!(IntentionShared.upgradable_to(Exclusive));
        assert!(IntentionShared.upgradable_to(IntentionExclusive));
        assert!(IntentionShared.upgradable_to(SharedIntentionExclusive));
        assert!(Shared.upgradable_to(Exclusive));
        assert!(Shared.upgradable_to(SharedIntentionExclusive));
        assert!(!Shared.upgradable_to(IntentionShared));
        assert!(IntentionExclusive.upgradable_to(Exclusive));
        assert!(!IntentionExclusive.upgradable_to(Shared));
        assert!(SharedIntentionExclusive.upgradable_to(Exclusive));
        assert!(!Exclusive.upgradable_to(Shared));
    }
}

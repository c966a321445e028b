// Background deadlock detection over the lock manager's wait queues.
// The graph is rebuilt from scratch each cycle; detection is deterministic
// (vertices and neighbors visited in ascending id order) so victim choice
// is reproducible.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use log::info;

use crate::common::types::TxnId;
use crate::transaction::concurrency::lock_manager::{LockManager, LockRequestQueue};
use crate::transaction::concurrency::transaction::{Transaction, TransactionState};

/// Directed waits-for graph on transaction ids: an edge `a -> b` means `a`
/// waits on a resource where `b` holds a granted lock.
#[derive(Default)]
pub struct WaitsForGraph {
    edges: BTreeMap<TxnId, Vec<TxnId>>,
}

impl WaitsForGraph {
    pub fn add_edge(&mut self, from: TxnId, to: TxnId) {
        self.edges.entry(from).or_default().push(to);
        self.edges.entry(to).or_default();
    }

    /// Remove a transaction and every incident edge
    pub fn remove_txn(&mut self, txn_id: TxnId) {
        self.edges.remove(&txn_id);
        for neighbors in self.edges.values_mut() {
            neighbors.retain(|&n| n != txn_id);
        }
    }

    pub fn edge_list(&self) -> Vec<(TxnId, TxnId)> {
        let mut edges = Vec::new();
        for (&from, neighbors) in &self.edges {
            for &to in neighbors {
                edges.push((from, to));
            }
        }
        edges
    }

    /// Depth-first search from every vertex in ascending order, exploring
    /// neighbors in ascending order. Returns the members of the first
    /// cycle found (the path suffix that closes on itself).
    pub fn find_cycle(&self) -> Option<Vec<TxnId>> {
        let mut safe: HashSet<TxnId> = HashSet::new();
        for &start in self.edges.keys() {
            if safe.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            let mut on_path = HashSet::new();
            if let Some(cycle) = self.dfs(start, &mut path, &mut on_path, &mut safe) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs(
        &self,
        node: TxnId,
        path: &mut Vec<TxnId>,
        on_path: &mut HashSet<TxnId>,
        safe: &mut HashSet<TxnId>,
    ) -> Option<Vec<TxnId>> {
        if safe.contains(&node) {
            return None;
        }
        path.push(node);
        on_path.insert(node);

        let mut neighbors = self.edges.get(&node).cloned().unwrap_or_default();
        neighbors.sort_unstable();
        neighbors.dedup();
        for next in neighbors {
            if on_path.contains(&next) {
                let pos = path
                    .iter()
                    .position(|&n| n == next)
                    .expect("on_path nodes are on the path");
                return Some(path[pos..].to_vec());
            }
            if let Some(cycle) = self.dfs(next, path, on_path, safe) {
                return Some(cycle);
            }
        }

        path.pop();
        on_path.remove(&node);
        safe.insert(node);
        None
    }
}

/// Detector thread body: sleep, snapshot the wait queues, abort victims,
/// repeat until the lock manager goes away.
pub(crate) fn run_cycle_detection(manager: Weak<LockManager>, interval: Duration) {
    loop {
        std::thread::sleep(interval);
        let Some(manager) = manager.upgrade() else {
            return;
        };
        if !manager.running.load(Ordering::SeqCst) {
            return;
        }
        manager.detect_deadlocks();
    }
}

impl LockManager {
    /// One detection cycle: build the waits-for graph from a consistent
    /// snapshot of both resource maps, then abort the youngest member of
    /// each cycle until the graph is acyclic.
    pub(crate) fn detect_deadlocks(&self) {
        let mut graph = WaitsForGraph::default();
        let mut transactions: HashMap<TxnId, Arc<Transaction>> = HashMap::new();
        let mut waiting_queues: HashMap<TxnId, Vec<Arc<LockRequestQueue>>> = HashMap::new();

        {
            let table_map = self.table_lock_map.lock();
            let row_map = self.row_lock_map.lock();
            for queue in table_map.values().chain(row_map.values()) {
                let state = queue.state.lock();
                let mut granted: Vec<TxnId> = Vec::new();
                for request in &state.requests {
                    let txn_id = request.txn.id();
                    transactions.entry(txn_id).or_insert_with(|| request.txn.clone());
                    if request.granted {
                        granted.push(txn_id);
                    } else {
                        waiting_queues.entry(txn_id).or_default().push(queue.clone());
                        for &holder in &granted {
                            if holder != txn_id {
                                graph.add_edge(txn_id, holder);
                            }
                        }
                    }
                }
            }
        }

        while let Some(cycle) = graph.find_cycle() {
            let victim = *cycle
                .iter()
                .max()
                .expect("a cycle has at least one member");
            info!("deadlock detected among {:?}; aborting youngest txn {}", cycle, victim);
            if let Some(txn) = transactions.get(&victim) {
                txn.set_state(TransactionState::Aborted);
            }
            graph.remove_txn(victim);
            if let Some(queues) = waiting_queues.get(&victim) {
                for queue in queues {
                    // Take the queue mutex so the victim is parked on the
                    // condition variable before the wakeup fires.
                    let guard = queue.state.lock();
                    queue.cv.notify_all();
                    drop(guard);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_cycle_in_a_chain() {
        let mut graph = WaitsForGraph::default();
        graph.add_edge(1, 2);
        graph.add_edge(2, 3);
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn test_two_cycle_is_found() {
        let mut graph = WaitsForGraph::default();
        graph.add_edge(1, 2);
        graph.add_edge(2, 1);
        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.iter().copied().max(), Some(2));
        assert_eq!(cycle.len(), 2);
    }

    #[test]
    fn test_cycle_excludes_tail_into_it() {
        // 5 -> 1 -> 2 -> 3 -> 1: the cycle is {1, 2, 3}, not 5.
        let mut graph = WaitsForGraph::default();
        graph.add_edge(5, 1);
        graph.add_edge(1, 2);
        graph.add_edge(2, 3);
        graph.add_edge(3, 1);
        let cycle = graph.find_cycle().unwrap();
        let mut members = cycle.clone();
        members.sort_unstable();
        assert_eq!(members, vec![1, 2, 3]);
    }

    #[test]
    fn test_removal_breaks_cycle() {
        let mut graph = WaitsForGraph::default();
        graph.add_edge(1, 2);
        graph.add_edge(2, 1);
        graph.add_edge(2, 3);
        graph.remove_txn(2);
        assert!(graph.find_cycle().is_none());
        assert!(graph.edge_list().iter().all(|&(a, b)| a != 2 && b != 2));
    }

    #[test]
    fn test_detection_is_deterministic() {
        // Two disjoint cycles: the one containing the smallest id is
        // reported first.
        let mut graph = WaitsForGraph::default();
        graph.add_edge(7, 8);
        graph.add_edge(8, 7);
        graph.add_edge(2, 4);
        graph.add_edge(4, 2);
        let first = graph.find_cycle().unwrap();
        let mut members = first.clone();
        members.sort_unstable();
        assert_eq!(members, vec![2, 4]);
    }
}

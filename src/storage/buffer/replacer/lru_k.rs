use std::collections::{HashMap, VecDeque};
use parking_lot::Mutex;

use crate::common::types::FrameId;

/// Per-frame access metadata. A frame with fewer than `k` recorded accesses
/// is a *history* frame (infinite backward k-distance); once it reaches `k`
/// accesses it becomes a *cache* frame and only its last `k` timestamps are
/// retained.
struct LruKNode {
    /// Up to `k` most recent access timestamps, oldest at the front
    history: VecDeque<u64>,
    /// Timestamp of the very first access, kept for history-frame LRU order
    first_access: u64,
    evictable: bool,
}

impl LruKNode {
    fn backward_distance_anchor(&self, k: usize) -> Option<u64> {
        // The k-th most recent access; None while the frame is still in the
        // history set.
        if self.history.len() < k {
            None
        } else {
            self.history.front().copied()
        }
    }
}

struct ReplacerState {
    nodes: HashMap<FrameId, LruKNode>,
    current_timestamp: u64,
    /// Count of evictable frames
    curr_size: usize,
}

/// LRU-K page replacement policy over buffer pool frames.
///
/// The victim is the evictable frame with the largest backward k-distance
/// (current timestamp minus the k-th most recent access). Frames with fewer
/// than `k` accesses have infinite distance and are preferred, tie-broken
/// by earliest first access.
pub struct LruKReplacer {
    state: Mutex<ReplacerState>,
    replacer_size: usize,
    k: usize,
}

impl LruKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k >= 1, "replacer k must be at least 1");
        Self {
            state: Mutex::new(ReplacerState {
                nodes: HashMap::with_capacity(num_frames),
                current_timestamp: 0,
                curr_size: 0,
            }),
            replacer_size: num_frames,
            k,
        }
    }

    /// Record an access to `frame_id` at the next timestamp. Accesses to
    /// frames outside the pool are ignored.
    pub fn record_access(&self, frame_id: FrameId) {
        if frame_id >= self.replacer_size {
            return;
        }
        let mut state = self.state.lock();
        state.current_timestamp += 1;
        let ts = state.current_timestamp;
        let k = self.k;

        let node = state.nodes.entry(frame_id).or_insert_with(|| LruKNode {
            history: VecDeque::with_capacity(k),
            first_access: ts,
            evictable: false,
        });
        if node.history.len() == k {
            node.history.pop_front();
        }
        node.history.push_back(ts);
    }

    /// Toggle whether `frame_id` may be evicted, maintaining the evictable
    /// count. Unknown frames are ignored.
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let mut state = self.state.lock();
        if let Some(node) = state.nodes.get_mut(&frame_id) {
            let was = node.evictable;
            node.evictable = evictable;
            if was && !evictable {
                state.curr_size -= 1;
            } else if !was && evictable {
                state.curr_size += 1;
            }
        }
    }

    /// Drop all state for `frame_id`. Only evictable frames are removed;
    /// removing a pinned frame is a no-op.
    pub fn remove(&self, frame_id: FrameId) {
        let mut state = self.state.lock();
        let evictable = match state.nodes.get(&frame_id) {
            Some(node) => node.evictable,
            None => return,
        };
        if evictable {
            state.nodes.remove(&frame_id);
            state.curr_size -= 1;
        }
    }

    /// Select and remove a victim frame, or `None` when nothing is
    /// evictable. Never blocks.
    pub fn evict(&self) -> Option<FrameId> {
        let mut state = self.state.lock();
        if state.curr_size == 0 {
            return None;
        }

        let k = self.k;
        let mut victim: Option<FrameId> = None;
        // (is_history, ordering key): history frames win over cache frames;
        // within history the earliest first access wins, within cache the
        // oldest k-th most recent access wins.
        let mut best: Option<(bool, u64)> = None;

        for (&frame_id, node) in state.nodes.iter() {
            if !node.evictable {
                continue;
            }
            let candidate = match node.backward_distance_anchor(k) {
                None => (true, node.first_access),
                Some(anchor) => (false, anchor),
            };
            let better = match best {
                None => true,
                Some((best_history, best_key)) => match (candidate.0, best_history) {
                    (true, false) => true,
                    (false, true) => false,
                    _ => candidate.1 < best_key,
                },
            };
            if better {
                best = Some(candidate);
                victim = Some(frame_id);
            }
        }

        let victim = victim?;
        state.nodes.remove(&victim);
        state.curr_size -= 1;
        Some(victim)
    }

    /// Number of evictable frames
    pub fn size(&self) -> usize {
        self.state.lock().curr_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_frames_evicted_in_first_access_order() {
        let replacer = LruKReplacer::new(4, 2);
        for frame in [0usize, 1, 2] {
            replacer.record_access(frame);
            replacer.set_evictable(frame, true);
        }
        // All three have a single access: infinite distance, earliest first
        // access goes first.
        assert_eq!(replacer.evict(), Some(0));
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_cache_frames_evicted_by_kth_recent_access() {
        // Access frames 1,2,3,1,2,3,1 with k = 2. Second-most-recent
        // accesses are then f1: 4, f2: 2, f3: 3, so f2 has the largest
        // backward distance and goes first.
        let replacer = LruKReplacer::new(4, 2);
        for frame in [1usize, 2, 3, 1, 2, 3, 1] {
            replacer.record_access(frame);
            replacer.set_evictable(frame, true);
        }
        assert_eq!(replacer.size(), 3);
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), Some(1));
    }

    #[test]
    fn test_history_preferred_over_cache() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.record_access(0);
        replacer.record_access(0); // frame 0 reaches k accesses
        replacer.record_access(1); // frame 1 stays in history
        replacer.set_evictable(0, true);
        replacer.set_evictable(1, true);
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(0));
    }

    #[test]
    fn test_pinned_frames_are_skipped() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.set_evictable(0, false);
        replacer.set_evictable(1, true);
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_remove_only_drops_evictable_frames() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.set_evictable(1, true);

        replacer.remove(0); // pinned: no-op
        replacer.remove(1);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);

        // Frame 0 is still tracked and can become evictable later.
        replacer.set_evictable(0, true);
        assert_eq!(replacer.evict(), Some(0));
    }

    #[test]
    fn test_reaccess_refreshes_distance() {
        let replacer = LruKReplacer::new(4, 2);
        // f0: ts 1,2  f1: ts 3,4
        replacer.record_access(0);
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.record_access(1);
        replacer.set_evictable(0, true);
        replacer.set_evictable(1, true);
        // f0's 2nd-most-recent access (1) is older: f0 goes first.
        assert_eq!(replacer.evict(), Some(0));

        replacer.record_access(0);
        replacer.record_access(0);
        replacer.set_evictable(0, true);
        // Now f0's window is fresher than f1's.
        assert_eq!(replacer.evict(), Some(1));
    }
}

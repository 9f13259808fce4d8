//! Completely-fair run queue: a vruntime-ordered timeline with a cached
//! leftmost entry. The running entity is kept out of the timeline but
//! stays accounted in the queue's load and count.

use std::collections::BTreeMap;

use super::NICE_0_LOAD;
use crate::types::{msecs, TaskId, TimeNs, Vruntime};

/// Targeted preemption latency for CPU-bound tasks.
pub const SCHED_LATENCY_NS: TimeNs = msecs(6);
/// Minimal preemption granularity.
pub const SCHED_MIN_GRANULARITY_NS: TimeNs = 750_000;
/// Wakeup preemption granularity.
pub const SCHED_WAKEUP_GRANULARITY_NS: TimeNs = msecs(1);
/// Tasks per latency period before the period stretches.
const SCHED_NR_LATENCY: u64 = SCHED_LATENCY_NS / SCHED_MIN_GRANULARITY_NS;

/// Timeline position: vruntime, then insertion order.
pub(super) type TimelineKey = (Vruntime, u64);

#[derive(Debug, Default)]
pub(super) struct CfsRq {
    timeline: BTreeMap<TimelineKey, TaskId>,
    leftmost: Option<(TimelineKey, TaskId)>,
    pub(super) load_weight: u64,
    pub(super) nr_running: usize,
    pub(super) min_vruntime: u64,
    pub(super) curr: Option<TaskId>,
    seq: u64,
}

impl CfsRq {
    pub(super) fn insert(&mut self, id: TaskId, vruntime: Vruntime) -> TimelineKey {
        self.seq += 1;
        let key = (vruntime, self.seq);
        self.timeline.insert(key, id);
        if self.leftmost.map_or(true, |(left, _)| key < left) {
            self.leftmost = Some((key, id));
        }
        key
    }

    pub(super) fn remove(&mut self, key: TimelineKey) {
        let removed = self.timeline.remove(&key);
        assert!(removed.is_some(), "entity {key:?} not on the timeline");
        if self.leftmost.is_some_and(|(left, _)| left == key) {
            self.leftmost = self.timeline.iter().next().map(|(k, id)| (*k, *id));
        }
    }

    pub(super) fn leftmost(&self) -> Option<(TimelineKey, TaskId)> {
        self.leftmost
    }

    pub(super) fn rightmost(&self) -> Option<(TimelineKey, TaskId)> {
        self.timeline.iter().next_back().map(|(k, id)| (*k, *id))
    }

    /// Queued entities in timeline order.
    pub(super) fn iter(&self) -> impl DoubleEndedIterator<Item = (TimelineKey, TaskId)> + '_ {
        self.timeline.iter().map(|(k, id)| (*k, *id))
    }

    pub(super) fn account_enqueue(&mut self, weight: u64) {
        self.load_weight += weight;
        self.nr_running += 1;
    }

    pub(super) fn account_dequeue(&mut self, weight: u64) {
        self.load_weight -= weight;
        self.nr_running -= 1;
    }

    /// Advance `min_vruntime` towards the smaller of the running and the
    /// leftmost entity. It never decreases.
    pub(super) fn update_min_vruntime(&mut self, curr_vruntime: Option<Vruntime>) {
        let left = self.leftmost.map(|((v, _), _)| v);
        let candidate = match (curr_vruntime, left) {
            (Some(c), Some(l)) => Some(c.min(l)),
            (Some(c), None) => Some(c),
            (None, Some(l)) => Some(l),
            (None, None) => None,
        };
        if let Some(v) = candidate {
            let current = Vruntime(self.min_vruntime);
            self.min_vruntime = current.max(v).0;
        }
    }

    /// Wall-time slice of an entity of `weight` in this queue.
    pub(super) fn sched_slice(&self, weight: u64, on_rq: bool) -> TimeNs {
        let (nr, load) = if on_rq {
            (self.nr_running as u64, self.load_weight)
        } else {
            (self.nr_running as u64 + 1, self.load_weight + weight)
        };
        let period = if nr > SCHED_NR_LATENCY {
            nr * SCHED_MIN_GRANULARITY_NS
        } else {
            SCHED_LATENCY_NS
        };
        if load == 0 {
            return period;
        }
        period * weight / load
    }

    /// Place an entity being enqueued. New tasks start one virtual slice
    /// behind; waking sleepers get at most half a latency of credit.
    pub(super) fn place_entity(&self, vruntime: Vruntime, weight: u64, initial: bool) -> Vruntime {
        let mut v = self.min_vruntime;
        if initial {
            v += calc_delta_fair(self.sched_slice(weight, false), weight);
            return Vruntime(v);
        }
        v = v.wrapping_sub(SCHED_LATENCY_NS / 2);
        vruntime.max(Vruntime(v))
    }
}

/// Scale wall time to virtual time for an entity of `weight`.
pub(super) fn calc_delta_fair(delta: TimeNs, weight: u64) -> u64 {
    if weight == NICE_0_LOAD || weight == 0 {
        return delta;
    }
    ((delta as u128 * NICE_0_LOAD as u128) / weight as u128) as u64
}

/// Whether `curr` should yield to a waking entity.
pub(super) fn wakeup_preempt(curr: Vruntime, woken: Vruntime, woken_weight: u64) -> bool {
    let vdiff = curr.delta(woken);
    if vdiff <= 0 {
        return false;
    }
    vdiff as u64 > calc_delta_fair(SCHED_WAKEUP_GRANULARITY_NS, woken_weight)
}

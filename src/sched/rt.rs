//! Real-time run queue: one FIFO per priority plus a bitmap of non-empty
//! levels. The running real-time task stays queued.

use std::collections::VecDeque;

use super::RtRqSnapshot;
use crate::types::{msecs, TaskId, TimeNs};

pub const MAX_RT_PRIO: usize = 100;

/// Round-robin time slice.
pub const RR_TIMESLICE_NS: TimeNs = msecs(100);

/// Queue index for a user priority (1..=99); lower index runs first.
pub(super) fn prio_index(prio: u8) -> usize {
    MAX_RT_PRIO - 1 - (prio as usize).min(MAX_RT_PRIO - 1)
}

#[derive(Debug)]
pub(super) struct RtRq {
    queues: Vec<VecDeque<TaskId>>,
    bitmap: u128,
    pub(super) nr_running: usize,
}

impl Default for RtRq {
    fn default() -> Self {
        Self {
            queues: vec![VecDeque::new(); MAX_RT_PRIO],
            bitmap: 0,
            nr_running: 0,
        }
    }
}

impl RtRq {
    pub(super) fn enqueue(&mut self, idx: usize, id: TaskId, head: bool) {
        if head {
            self.queues[idx].push_front(id);
        } else {
            self.queues[idx].push_back(id);
        }
        self.bitmap |= 1u128 << idx;
        self.nr_running += 1;
    }

    pub(super) fn dequeue(&mut self, idx: usize, id: TaskId) {
        let queue = &mut self.queues[idx];
        let pos = queue.iter().position(|t| *t == id);
        let pos = match pos {
            Some(pos) => pos,
            None => panic!("rt task {id} not queued at index {idx}"),
        };
        queue.remove(pos);
        if queue.is_empty() {
            self.bitmap &= !(1u128 << idx);
        }
        self.nr_running -= 1;
    }

    /// Move `id` to the tail of its level. Returns whether anything else
    /// is queued at that level.
    pub(super) fn requeue(&mut self, idx: usize, id: TaskId) -> bool {
        let queue = &mut self.queues[idx];
        if let Some(pos) = queue.iter().position(|t| *t == id) {
            queue.remove(pos);
            queue.push_back(id);
        }
        queue.len() > 1
    }

    /// Highest-priority queued task.
    pub(super) fn pick(&self) -> Option<TaskId> {
        if self.bitmap == 0 {
            return None;
        }
        let idx = self.bitmap.trailing_zeros() as usize;
        self.queues[idx].front().copied()
    }

    pub(super) fn tasks(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.queues.iter().flat_map(|q| q.iter().copied())
    }

    pub(super) fn snapshot(&self) -> RtRqSnapshot {
        RtRqSnapshot {
            rt_nr_running: self.nr_running,
            bitmap: self.bitmap,
            queues: self
                .queues
                .iter()
                .enumerate()
                .filter(|(_, q)| !q.is_empty())
                .map(|(i, q)| (i, q.iter().copied().collect()))
                .collect(),
        }
    }
}

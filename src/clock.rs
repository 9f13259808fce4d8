//! Virtual time and per-CPU high-resolution timers.
//!
//! The clock only moves when the engine advances it to the earliest armed
//! timer expiry (or when trace replay sets it from a recorded timestamp).
//! Nothing ever reads host time.

use std::collections::BTreeMap;

use crate::types::{CpuId, TaskId, TimeNs, NSEC_PER_SEC};

/// Scheduler tick frequency.
pub const HZ: u64 = 1000;

/// Length of one tick (one jiffy).
pub const TICK_NS: TimeNs = NSEC_PER_SEC / HZ;

/// "Never": an unarmed timer slot or an idle machine.
pub const KTIME_MAX: TimeNs = u64::MAX;

/// Boot time. Starting above zero keeps "last_start == 0" meaning unset.
pub const BOOT_TIME_NS: TimeNs = 100;

/// Global virtual time plus the derived jiffies counter.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    now: TimeNs,
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualClock {
    pub fn new() -> Self {
        Self { now: BOOT_TIME_NS }
    }

    pub fn now(&self) -> TimeNs {
        self.now
    }

    pub fn jiffies(&self) -> u64 {
        self.now / TICK_NS
    }

    /// Move time forward to `t`.
    ///
    /// # Panics
    ///
    /// Time never flows backwards; advancing to an earlier instant is a
    /// fatal engine bug.
    pub fn advance(&mut self, t: TimeNs) {
        assert!(
            t >= self.now,
            "virtual clock moved backwards: {} -> {}",
            self.now,
            t
        );
        self.now = t;
    }

    /// Set the clock from an externally recorded timestamp. Earlier
    /// timestamps are clamped to the current time.
    pub fn set_external(&mut self, t: TimeNs) -> TimeNs {
        if t > self.now {
            self.now = t;
        }
        self.now
    }
}

/// Identity of a timer. Each owner has at most one armed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// The periodic scheduler tick of a CPU.
    Tick(CpuId),
    /// Remote reschedule request, delivered as a 1 ns timer.
    Trigger(CpuId),
    /// Wakeup timer of a task behavior.
    Task(TaskId),
    /// Wakes the stop task of a CPU for queued stop work.
    Stop(CpuId),
}

impl TimerId {
    /// Soft timers run from the high-resolution-timer deferred-work
    /// handler instead of directly in the hard interrupt.
    pub fn is_soft(self) -> bool {
        matches!(self, TimerId::Stop(_))
    }
}

/// Location of an armed timer.
#[derive(Debug, Clone, Copy)]
struct Armed {
    cpu: CpuId,
    expires: TimeNs,
    seq: u64,
}

/// Per-CPU ordered timer queues.
///
/// Timers on one CPU with equal expiry fire in arming order.
#[derive(Debug, Clone)]
pub struct TimerRegistry {
    queues: Vec<BTreeMap<(TimeNs, u64), TimerId>>,
    armed: BTreeMap<TimerId, Armed>,
    seq: u64,
}

impl TimerRegistry {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            queues: vec![BTreeMap::new(); nr_cpus],
            armed: BTreeMap::new(),
            seq: 0,
        }
    }

    /// Arm `id` on `cpu` to expire at absolute time `expires`.
    ///
    /// Re-arming an already armed timer moves it, possibly to another CPU.
    /// Returns the CPU the timer was previously armed on, if any.
    pub fn arm(&mut self, cpu: CpuId, id: TimerId, expires: TimeNs) -> Option<CpuId> {
        let prev = self.cancel(id);
        self.seq += 1;
        let seq = self.seq;
        self.queues[cpu.index()].insert((expires, seq), id);
        self.armed.insert(id, Armed { cpu, expires, seq });
        prev
    }

    /// Disarm `id`. Returns the CPU it was armed on.
    pub fn cancel(&mut self, id: TimerId) -> Option<CpuId> {
        let armed = self.armed.remove(&id)?;
        self.queues[armed.cpu.index()].remove(&(armed.expires, armed.seq));
        Some(armed.cpu)
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.armed.contains_key(&id)
    }

    pub fn expires(&self, id: TimerId) -> Option<TimeNs> {
        self.armed.get(&id).map(|a| a.expires)
    }

    /// Earliest expiry on `cpu`, or `KTIME_MAX`.
    pub fn next_event(&self, cpu: CpuId) -> TimeNs {
        self.queues[cpu.index()]
            .keys()
            .next()
            .map_or(KTIME_MAX, |(expires, _)| *expires)
    }

    /// Remove and return the earliest timer on `cpu` that has expired.
    pub fn pop_expired(&mut self, cpu: CpuId, now: TimeNs) -> Option<(TimerId, TimeNs)> {
        let queue = &mut self.queues[cpu.index()];
        let (&(expires, seq), &id) = queue.iter().next()?;
        if expires > now {
            return None;
        }
        queue.remove(&(expires, seq));
        self.armed.remove(&id);
        Some((id, expires))
    }

    pub fn nr_armed(&self, cpu: CpuId) -> usize {
        self.queues[cpu.index()].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_starts_at_boot() {
        let clock = VirtualClock::new();
        assert_eq!(clock.now(), BOOT_TIME_NS);
        assert_eq!(clock.jiffies(), 0);
    }

    #[test]
    #[should_panic(expected = "moved backwards")]
    fn test_clock_never_goes_backwards() {
        let mut clock = VirtualClock::new();
        clock.advance(5_000);
        clock.advance(4_000);
    }

    #[test]
    fn test_external_clock_is_clamped() {
        let mut clock = VirtualClock::new();
        assert_eq!(clock.set_external(3 * TICK_NS), 3 * TICK_NS);
        assert_eq!(clock.jiffies(), 3);
        assert_eq!(clock.set_external(TICK_NS), 3 * TICK_NS);
    }

    #[test]
    fn test_timer_ordering_and_rearm() {
        let mut timers = TimerRegistry::new(2);
        let a = TimerId::Task(TaskId(1));
        let b = TimerId::Task(TaskId(2));
        timers.arm(CpuId(0), a, 500);
        timers.arm(CpuId(0), b, 300);
        assert_eq!(timers.next_event(CpuId(0)), 300);
        assert_eq!(timers.next_event(CpuId(1)), KTIME_MAX);

        // Re-arming moves the timer to the other CPU.
        assert_eq!(timers.arm(CpuId(1), b, 200), Some(CpuId(0)));
        assert_eq!(timers.next_event(CpuId(0)), 500);
        assert_eq!(timers.next_event(CpuId(1)), 200);
        assert_eq!(timers.nr_armed(CpuId(0)), 1);

        assert_eq!(timers.pop_expired(CpuId(0), 499), None);
        assert_eq!(timers.pop_expired(CpuId(0), 500), Some((a, 500)));
        assert!(!timers.is_armed(a));
        assert_eq!(timers.cancel(b), Some(CpuId(1)));
        assert_eq!(timers.next_event(CpuId(1)), KTIME_MAX);
    }

    #[test]
    fn test_equal_expiry_fires_in_arm_order() {
        let mut timers = TimerRegistry::new(1);
        let ids = [
            TimerId::Tick(CpuId(0)),
            TimerId::Task(TaskId(4)),
            TimerId::Trigger(CpuId(0)),
        ];
        for id in ids {
            timers.arm(CpuId(0), id, 1_000);
        }
        let fired: Vec<_> = std::iter::from_fn(|| timers.pop_expired(CpuId(0), 1_000))
            .map(|(id, _)| id)
            .collect();
        assert_eq!(fired, ids);
    }
}

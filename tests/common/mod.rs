#![allow(dead_code)]

use std::sync::MutexGuard;

use scx_schedsim::{RefScheduler, SimFormat, Simulator, Topology, TopologyKind, SIM_LOCK};

/// Acquire the simulator lock and initialize tracing from `RUST_LOG`.
///
/// Hold the returned guard for the duration of the test.
pub fn setup_test() -> MutexGuard<'static, ()> {
    let guard = SIM_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(SimFormat)
        .with_test_writer()
        .try_init();
    guard
}

/// A freshly booted machine running the reference scheduler.
pub fn boot(kind: TopologyKind) -> Simulator<RefScheduler> {
    Simulator::new(Topology::canned(kind), RefScheduler::new())
}

pub const MS: u64 = 1_000_000;

/// Assert `v` lies within `[lo, hi]`.
pub fn assert_between(what: &str, v: u64, lo: u64, hi: u64) {
    assert!(
        (lo..=hi).contains(&v),
        "{what}: expected {lo}..={hi}, got {v}"
    );
}

//! The supervisor-side controller for one thread group of variants.
//!
//! A [`Monitor`] only holds bookkeeping. Its set of owned pids is only ever modified through the
//! [`MonitorRegistry`](crate::core::registry::MonitorRegistry) while holding the registry lock, so
//! that ownership of a pid can be transferred between monitors atomically. The thread that drives
//! a monitor lives in [`monitor_thread`](crate::core::monitor_thread).

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crossbeam::atomic::AtomicCell;
use nix::unistd::Pid;

/// A monitor identifier. Identifiers are handed out by the registry in increasing order and are
/// never reused while the supervisor runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonitorId(u32);

impl MonitorId {
    /// Not a real monitor. Used as the origin of variants that were started by the management
    /// thread and are waiting for the primary monitor to pick them up.
    pub const MANAGEMENT: MonitorId = MonitorId(0);

    /// The first id handed out to a real monitor.
    pub const FIRST: MonitorId = MonitorId(1);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    /// The following id, or `None` if this is the last one.
    pub(crate) fn next(&self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl std::fmt::Display for MonitorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MonitorState {
    /// Registered and tracing its variants.
    Active,
    /// Registered, but its variants are suspended indefinitely (for example while a policy
    /// decision is pending). The variants are not killed.
    Inactive,
    /// The monitor thread is exiting or has exited. The monitor is waiting to be garbage
    /// collected.
    Dead,
}

impl MonitorState {
    pub fn to_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

#[derive(Debug, Default)]
pub(crate) struct MonitorPids {
    /// All pids ptrace-attached under this monitor.
    pub owned: BTreeSet<Pid>,
    /// Pids that this monitor was created to adopt, but hasn't claimed yet.
    pub expected: BTreeSet<Pid>,
}

#[derive(Debug)]
pub struct Monitor {
    id: MonitorId,
    // only changed by the registry while holding the registry lock
    state: AtomicCell<MonitorState>,
    // only changed by the registry while holding the registry lock
    pids: Mutex<MonitorPids>,
    // set by other monitors, consumed by this monitor's control loop
    should_check_multithread_state: AtomicBool,
}

impl Monitor {
    /// A new monitor that expects to adopt `expected_pids` from the registry's handoff queue.
    pub fn new(id: MonitorId, expected_pids: impl IntoIterator<Item = Pid>) -> Self {
        Self {
            id,
            state: AtomicCell::new(MonitorState::Active),
            pids: Mutex::new(MonitorPids {
                owned: BTreeSet::new(),
                expected: expected_pids.into_iter().collect(),
            }),
            should_check_multithread_state: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> MonitorId {
        self.id
    }

    pub fn state(&self) -> MonitorState {
        self.state.load()
    }

    pub(crate) fn set_state(&self, state: MonitorState) {
        self.state.store(state)
    }

    pub(crate) fn pids(&self) -> std::sync::MutexGuard<'_, MonitorPids> {
        self.pids.lock().unwrap()
    }

    /// A snapshot of the pids currently owned by this monitor.
    pub fn owned_variant_pids(&self) -> BTreeSet<Pid> {
        self.pids().owned.clone()
    }

    pub fn owns(&self, pid: Pid) -> bool {
        self.pids().owned.contains(&pid)
    }

    pub fn num_owned(&self) -> usize {
        self.pids().owned.len()
    }

    /// A snapshot of the pids this monitor still expects to adopt.
    pub fn expected_variant_pids(&self) -> BTreeSet<Pid> {
        self.pids().expected.clone()
    }

    /// Returns `true` if the monitor neither owns nor expects any variants.
    pub fn is_idle(&self) -> bool {
        let pids = self.pids();
        pids.owned.is_empty() && pids.expected.is_empty()
    }

    pub(crate) fn latch_multithread_check(&self) {
        self.should_check_multithread_state
            .store(true, Ordering::Release);
    }

    /// Consume the "check whether the variants are multithreaded" flag.
    pub fn take_multithread_check(&self) -> bool {
        self.should_check_multithread_state
            .swap(false, Ordering::AcqRel)
    }

    /// The identifying information to attach to log messages about this monitor.
    pub fn context(&self) -> MonitorContext {
        MonitorContext {
            id: self.id,
            state: self.state(),
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        log::trace!("{} released", self.context());
    }
}

/// Identifies a monitor in log messages.
///
/// This is passed explicitly to logging calls, for example `log::debug!("{ctx}: attached")`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MonitorContext {
    pub id: MonitorId,
    pub state: MonitorState,
}

impl std::fmt::Display for MonitorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[monitor {}:{}]", self.id, self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new() {
        let mon = Monitor::new(MonitorId::new(3), [Pid::from_raw(10)]);
        assert_eq!(mon.id(), MonitorId::new(3));
        assert_eq!(mon.state(), MonitorState::Active);
        assert!(mon.owned_variant_pids().is_empty());
        assert_eq!(
            mon.expected_variant_pids(),
            BTreeSet::from([Pid::from_raw(10)])
        );
        assert!(!mon.is_idle());
    }

    #[test]
    fn test_multithread_latch() {
        let mon = Monitor::new(MonitorId::FIRST, []);
        assert!(!mon.take_multithread_check());
        mon.latch_multithread_check();
        mon.latch_multithread_check();
        assert!(mon.take_multithread_check());
        assert!(!mon.take_multithread_check());
    }

    #[test]
    fn test_context() {
        let mon = Monitor::new(MonitorId::new(7), []);
        assert_eq!(mon.context().to_string(), "[monitor 7:active]");
        mon.set_state(MonitorState::Inactive);
        assert_eq!(mon.context().to_string(), "[monitor 7:inactive]");
    }

    #[test]
    fn test_id_order() {
        assert!(MonitorId::MANAGEMENT < MonitorId::FIRST);
        assert_eq!(MonitorId::FIRST.next(), Some(MonitorId::new(2)));
        assert_eq!(MonitorId::new(u32::MAX).next(), None);
    }
}

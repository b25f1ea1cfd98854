//! Coordinated shutdown of all monitors.
//!
//! Shutdown moves through `Running -> ShutdownRequested -> Draining -> Terminated`. It can be
//! requested by the signal watcher, or internally when the last registered monitor unregisters.
//! Monitors notice the request by polling [`MonitorRegistry::shutdown_requested`] at safe points,
//! wind down, and unregister. The management thread runs the
//! [`ShutdownCoordinator`], which garbage-collects dead monitors and returns once shutdown was
//! requested and no registered monitors remain.
//!
//! There are no timeouts. A monitor that never unregisters blocks the drain forever.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use nix::sys::signal::Signal;

use crate::core::registry::{MonitorRegistry, RegistryError, RegistryState};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    ShutdownRequested,
    Draining,
    Terminated,
}

/// Why shutdown was requested.
///
/// Stored in the registry's shutdown signal as the signal number, or as `-1` for internal
/// requests. `0` means shutdown wasn't requested.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    Signal(Signal),
    /// The last monitor exited, or the supervisor failed to start.
    Internal,
}

impl ShutdownCause {
    const INTERNAL: i32 = -1;

    pub fn to_raw(&self) -> i32 {
        match self {
            Self::Signal(signal) => *signal as i32,
            Self::Internal => Self::INTERNAL,
        }
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => None,
            Self::INTERNAL => Some(Self::Internal),
            // unknown values are still a request
            x => Some(Signal::try_from(x).map_or(Self::Internal, Self::Signal)),
        }
    }
}

impl std::fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal(signal) => write!(f, "received {signal}"),
            Self::Internal => write!(f, "internal request"),
        }
    }
}

impl MonitorRegistry {
    /// Request shutdown. Only the first request has an effect. Returns `true` if this call made
    /// the transition.
    pub fn request_shutdown(&self, cause: ShutdownCause) -> bool {
        let mut state = self.lock_state();
        self.request_shutdown_locked(&mut state, cause)
    }

    pub(super) fn request_shutdown_locked(
        &self,
        state: &mut RegistryState,
        cause: ShutdownCause,
    ) -> bool {
        if state.shutdown_phase != ShutdownPhase::Running {
            return false;
        }

        state.shutdown_phase = ShutdownPhase::ShutdownRequested;
        self.shutdown_signal.store(cause.to_raw(), Ordering::Relaxed);
        log::info!("Shutdown requested: {cause}");

        self.cond.notify_all();
        true
    }

    /// Returns `true` if shutdown was requested. Doesn't take the registry lock.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_signal() != 0
    }

    /// The raw shutdown signal: `0` if shutdown wasn't requested, the signal number if it was
    /// requested by a signal, and `-1` otherwise. Doesn't take the registry lock.
    pub fn shutdown_signal(&self) -> i32 {
        self.shutdown_signal.load(Ordering::Relaxed)
    }

    pub fn shutdown_cause(&self) -> Option<ShutdownCause> {
        ShutdownCause::from_raw(self.shutdown_signal())
    }

    pub fn shutdown_phase(&self) -> ShutdownPhase {
        self.lock_state().shutdown_phase
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub cause: ShutdownCause,
    /// Number of dead monitors collected while running.
    pub collected: usize,
    /// Detached variants that no monitor claimed.
    pub orphaned: Vec<RegistryError>,
}

/// Runs the management thread's side of the shutdown protocol.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    registry: Arc<MonitorRegistry>,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<MonitorRegistry>) -> Self {
        Self { registry }
    }

    /// Block until shutdown was requested and every monitor has unregistered, collecting dead
    /// monitors along the way.
    pub fn run_until_terminated(&self) -> ShutdownReport {
        let mut collected = 0;
        let mut state = self.registry.lock_state();

        loop {
            let garbage = state.take_garbage();
            if !garbage.is_empty() {
                collected += garbage.len();
                // dropped without holding the lock
                drop(state);
                drop(garbage);
                state = self.registry.lock_state();
                continue;
            }

            if state.shutdown_phase == ShutdownPhase::ShutdownRequested {
                state.shutdown_phase = ShutdownPhase::Draining;
                log::debug!(
                    "Draining {} active and {} inactive monitors",
                    state.active.len(),
                    state.inactive.len()
                );
            }

            if state.shutdown_phase == ShutdownPhase::Draining && !state.has_live_monitors() {
                break;
            }

            state = self.registry.cond.wait(state).unwrap();
        }

        // monitors that unregistered without moving to the dead list aren't counted
        let garbage = state.take_garbage();
        state.shutdown_phase = ShutdownPhase::Terminated;
        let orphaned = state.orphans();
        drop(state);
        self.registry.cond.notify_all();

        collected += garbage.len();
        drop(garbage);

        for orphan in &orphaned {
            log::warn!("{orphan}");
        }

        let cause = self
            .registry
            .shutdown_cause()
            .unwrap_or(ShutdownCause::Internal);
        log::info!("All monitors have exited ({cause}); collected {collected}");

        ShutdownReport {
            cause,
            collected,
            orphaned,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::time::Duration;

    use nix::unistd::Pid;

    use super::*;
    use crate::core::detach::DetachedVariant;
    use crate::core::monitor::{Monitor, MonitorId};
    use crate::host::tracer::AttachContext;

    fn new_monitor(registry: &MonitorRegistry) -> Arc<Monitor> {
        let monitor = Arc::new(Monitor::new(registry.next_monitor_id().unwrap(), []));
        registry.register_monitor(Arc::clone(&monitor)).unwrap();
        monitor
    }

    fn spawn_coordinator(
        registry: &Arc<MonitorRegistry>,
    ) -> std::thread::JoinHandle<ShutdownReport> {
        let coordinator = ShutdownCoordinator::new(Arc::clone(registry));
        std::thread::spawn(move || coordinator.run_until_terminated())
    }

    #[test]
    fn test_cause_raw() {
        assert_eq!(ShutdownCause::from_raw(0), None);
        assert_eq!(
            ShutdownCause::from_raw(libc::SIGINT),
            Some(ShutdownCause::Signal(Signal::SIGINT))
        );
        assert_eq!(ShutdownCause::from_raw(-1), Some(ShutdownCause::Internal));
        assert_eq!(ShutdownCause::Signal(Signal::SIGTERM).to_raw(), libc::SIGTERM);
        assert_eq!(ShutdownCause::Internal.to_raw(), -1);
    }

    #[test]
    fn test_request_idempotent() {
        let registry = Arc::new(MonitorRegistry::new());
        assert!(!registry.shutdown_requested());
        assert_eq!(registry.shutdown_phase(), ShutdownPhase::Running);

        let num_threads = 16;
        let barrier = Arc::new(Barrier::new(num_threads));
        let handles: Vec<_> = (0..num_threads)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let cause = if i % 2 == 0 {
                        ShutdownCause::Signal(Signal::SIGTERM)
                    } else {
                        ShutdownCause::Internal
                    };
                    barrier.wait();
                    registry.request_shutdown(cause)
                })
            })
            .collect();

        let transitions = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|x| *x)
            .count();
        assert_eq!(transitions, 1);
        assert!(registry.shutdown_requested());
        assert_eq!(registry.shutdown_phase(), ShutdownPhase::ShutdownRequested);

        // the signal value doesn't change after the first request
        let signal = registry.shutdown_signal();
        assert!(!registry.request_shutdown(ShutdownCause::Signal(Signal::SIGINT)));
        assert_eq!(registry.shutdown_signal(), signal);
    }

    #[test]
    fn test_last_monitor_triggers_shutdown() {
        let registry = Arc::new(MonitorRegistry::new());
        let monitors: Vec<_> = (0..3).map(|_| new_monitor(&registry)).collect();
        let management = spawn_coordinator(&registry);

        registry.unregister_monitor(&monitors[0], true);
        registry.unregister_monitor(&monitors[1], true);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!registry.shutdown_requested());
        assert!(!management.is_finished());

        registry.unregister_monitor(&monitors[2], true);
        let report = management.join().unwrap();

        assert_eq!(report.cause, ShutdownCause::Internal);
        assert_eq!(report.collected, 3);
        assert!(report.orphaned.is_empty());
        assert_eq!(registry.shutdown_phase(), ShutdownPhase::Terminated);
        assert_eq!(registry.shutdown_signal(), -1);

        // already requested, so this isn't a new transition
        assert!(!registry.request_shutdown(ShutdownCause::Internal));
    }

    #[test]
    fn test_signal_drains_monitors() {
        let registry = Arc::new(MonitorRegistry::new());
        let monitors: Vec<_> = (0..4).map(|_| new_monitor(&registry)).collect();
        let management = spawn_coordinator(&registry);

        assert!(registry.request_shutdown(ShutdownCause::Signal(Signal::SIGINT)));

        // monitors notice the request and wind down on their own threads
        let handles: Vec<_> = monitors
            .into_iter()
            .map(|monitor| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    while !registry.shutdown_requested() {
                        std::thread::yield_now();
                    }
                    registry.unregister_monitor(&monitor, true);
                })
            })
            .collect();

        let report = management.join().unwrap();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(report.cause, ShutdownCause::Signal(Signal::SIGINT));
        assert_eq!(registry.num_monitors(), 0);
    }

    #[test]
    fn test_collected_monitors_released() {
        let registry = Arc::new(MonitorRegistry::new());
        let monitors: Vec<_> = (0..2).map(|_| new_monitor(&registry)).collect();
        let management = spawn_coordinator(&registry);

        registry.unregister_monitor(&monitors[0], true);
        while Arc::strong_count(&monitors[0]) > 1 {
            std::thread::sleep(Duration::from_millis(1));
        }
        // collected while the other monitor is still running
        assert!(!management.is_finished());
        assert!(!registry.shutdown_requested());

        registry.unregister_monitor(&monitors[1], true);
        let report = management.join().unwrap();

        assert_eq!(report.collected, 2);
        assert!(monitors.iter().all(|x| Arc::strong_count(x) == 1));
        assert_eq!(registry.garbage_collect(), 0);
    }

    #[test]
    fn test_inactive_monitor_blocks_drain() {
        let registry = Arc::new(MonitorRegistry::new());
        let monitor = new_monitor(&registry);
        assert!(registry.set_monitor_inactive(&monitor));
        let management = spawn_coordinator(&registry);

        registry.request_shutdown(ShutdownCause::Internal);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!management.is_finished());
        assert_eq!(registry.shutdown_phase(), ShutdownPhase::Draining);

        registry.unregister_monitor(&monitor, false);
        let report = management.join().unwrap();
        assert_eq!(report.collected, 0);
    }

    #[test]
    fn test_orphans_reported() {
        let registry = Arc::new(MonitorRegistry::new());
        let monitor = new_monitor(&registry);
        let pid = Pid::from_raw(100);
        registry.adopt_variant(&monitor, pid).unwrap();
        registry
            .add_detached_variant(DetachedVariant::new(
                pid,
                monitor.id(),
                AttachContext::initial(),
            ))
            .unwrap();

        let management = spawn_coordinator(&registry);
        registry.unregister_monitor(&monitor, true);
        let report = management.join().unwrap();

        assert_eq!(
            report.orphaned,
            vec![RegistryError::OrphanedVariant {
                pid,
                origin: MonitorId::FIRST
            }]
        );
        // orphans are reported, not disposed of
        assert_eq!(registry.num_pending_variants(), 1);
    }
}

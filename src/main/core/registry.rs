//! The process-wide registry of monitors.
//!
//! All registry state lives behind a single mutex and is paired with a single condition variable,
//! which is broadcast on every state change. Everything that needs to wait for another monitor
//! (the startup gate, sibling waits, the shutdown drain) waits on that condition variable with its
//! own predicate.
//!
//! The only state readable without the lock is the shutdown signal (see
//! [`shutdown`](crate::core::shutdown)).

use std::collections::HashMap;
use std::sync::atomic::AtomicI32;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use nix::unistd::Pid;

use crate::core::detach::{DetachedVariant, HandoffQueue};
use crate::core::monitor::{Monitor, MonitorId, MonitorState};
use crate::core::pid_mapping::PidMapping;
use crate::core::shutdown::{ShutdownCause, ShutdownPhase};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A monitor with this id is already registered, or the monitor is dead.
    DuplicateRegistration { id: MonitorId },
    /// The monitor isn't (or is no longer) registered.
    NotRegistered { id: MonitorId },
    /// No detached variant with this pid is waiting. Another monitor may have claimed it first.
    NotFound { pid: Pid },
    /// The variant is owned by a different monitor.
    AlreadyOwned { pid: Pid, owner: MonitorId },
    /// The variant is waiting in the handoff queue.
    InTransit { pid: Pid },
    /// A detached variant that was never claimed.
    OrphanedVariant { pid: Pid, origin: MonitorId },
    /// Every monitor id has been handed out.
    IdsExhausted,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateRegistration { id } => {
                write!(f, "Monitor {id} is already registered or is dead")
            }
            Self::NotRegistered { id } => write!(f, "Monitor {id} is not registered"),
            Self::NotFound { pid } => write!(f, "No detached variant with pid {pid}"),
            Self::AlreadyOwned { pid, owner } => {
                write!(f, "Variant {pid} is owned by monitor {owner}")
            }
            Self::InTransit { pid } => write!(f, "Variant {pid} is waiting to be claimed"),
            Self::OrphanedVariant { pid, origin } => write!(
                f,
                "Variant {pid} detached by monitor {origin} was never claimed"
            ),
            Self::IdsExhausted => write!(f, "No monitor ids remaining"),
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Debug)]
pub(super) struct RegistryState {
    /// `None` once the last id was handed out.
    pub next_monitor_id: Option<MonitorId>,
    /// All registered (active or inactive) monitors.
    pub monitors: HashMap<MonitorId, Arc<Monitor>>,
    pub active: Vec<Arc<Monitor>>,
    pub inactive: Vec<Arc<Monitor>>,
    /// Unregistered monitors waiting to be garbage collected.
    pub dead: Vec<Arc<Monitor>>,
    pub should_garbage_collect: bool,
    pub detached: HandoffQueue,
    pub pid_mapping: PidMapping,
    pub shutdown_phase: ShutdownPhase,
    pub can_run: bool,
}

impl RegistryState {
    fn new() -> Self {
        Self {
            next_monitor_id: Some(MonitorId::FIRST),
            monitors: HashMap::new(),
            active: Vec::new(),
            inactive: Vec::new(),
            dead: Vec::new(),
            should_garbage_collect: false,
            detached: HandoffQueue::new(),
            pid_mapping: PidMapping::new(),
            shutdown_phase: ShutdownPhase::Running,
            can_run: false,
        }
    }

    /// The registered monitor owning `pid`, if any.
    fn owner_of(&self, pid: Pid) -> Option<MonitorId> {
        self.monitors
            .values()
            .find(|mon| mon.owns(pid))
            .map(|mon| mon.id())
    }

    pub fn has_live_monitors(&self) -> bool {
        !(self.active.is_empty() && self.inactive.is_empty())
    }

    /// Take the dead monitors if a collection is pending.
    pub fn take_garbage(&mut self) -> Vec<Arc<Monitor>> {
        if !self.should_garbage_collect {
            return Vec::new();
        }
        self.should_garbage_collect = false;
        std::mem::take(&mut self.dead)
    }

    pub fn orphans(&self) -> Vec<RegistryError> {
        self.detached
            .iter()
            .map(|dv| RegistryError::OrphanedVariant {
                pid: dv.variant_pid,
                origin: dv.origin_monitor_id,
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct MonitorRegistry {
    pub(super) state: Mutex<RegistryState>,
    pub(super) cond: Condvar,
    /// Written once under the state lock. See [`ShutdownCause`].
    pub(super) shutdown_signal: AtomicI32,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::new()),
            cond: Condvar::new(),
            shutdown_signal: AtomicI32::new(0),
        }
    }

    pub(super) fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap()
    }

    /// Get a fresh monitor id. Ids are never reused.
    pub fn next_monitor_id(&self) -> Result<MonitorId, RegistryError> {
        let mut state = self.lock_state();
        let id = state.next_monitor_id.ok_or(RegistryError::IdsExhausted)?;
        state.next_monitor_id = id.next();
        Ok(id)
    }

    pub fn register_monitor(&self, monitor: Arc<Monitor>) -> Result<(), RegistryError> {
        let mut state = self.lock_state();
        let id = monitor.id();

        if state.monitors.contains_key(&id) || monitor.state() == MonitorState::Dead {
            return Err(RegistryError::DuplicateRegistration { id });
        }

        // an explicitly numbered monitor must not collide with later ids
        if state.next_monitor_id.is_some_and(|next| id >= next) {
            state.next_monitor_id = id.next();
        }

        monitor.set_state(MonitorState::Active);
        state.monitors.insert(id, Arc::clone(&monitor));
        state.active.push(monitor);
        log::debug!("Registered monitor {id}");

        self.cond.notify_all();
        Ok(())
    }

    /// Remove the monitor from the registry and mark it as dead. If `move_to_dead` is set, the
    /// registry keeps its handle until the next garbage collection. If no registered monitors
    /// remain, shutdown is requested.
    pub fn unregister_monitor(&self, monitor: &Arc<Monitor>, move_to_dead: bool) {
        let mut state = self.lock_state();
        let id = monitor.id();

        let was_registered = state.monitors.remove(&id).is_some();
        state.active.retain(|x| x.id() != id);
        state.inactive.retain(|x| x.id() != id);
        monitor.set_state(MonitorState::Dead);

        {
            let mut pids = monitor.pids();
            if !pids.owned.is_empty() {
                log::warn!(
                    "{}: unregistered while owning variants {:?}",
                    monitor.context(),
                    pids.owned
                );
            }
            pids.owned.clear();
            pids.expected.clear();
        }

        if was_registered {
            if move_to_dead {
                state.dead.push(Arc::clone(monitor));
                state.should_garbage_collect = true;
            }

            log::debug!("{}: unregistered", monitor.context());

            if !state.has_live_monitors() {
                self.request_shutdown_locked(&mut state, ShutdownCause::Internal);
            }
        }

        self.cond.notify_all();
    }

    /// Move the monitor to the inactive set. Returns `false` if it wasn't active.
    pub fn set_monitor_inactive(&self, monitor: &Monitor) -> bool {
        self.move_monitor(monitor, MonitorState::Inactive)
    }

    /// Move the monitor to the active set. Returns `false` if it wasn't inactive.
    pub fn set_monitor_active(&self, monitor: &Monitor) -> bool {
        self.move_monitor(monitor, MonitorState::Active)
    }

    fn move_monitor(&self, monitor: &Monitor, to: MonitorState) -> bool {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let id = monitor.id();

        let (from_set, to_set) = match to {
            MonitorState::Active => (&mut state.inactive, &mut state.active),
            MonitorState::Inactive => (&mut state.active, &mut state.inactive),
            MonitorState::Dead => unreachable!(),
        };

        let Some(idx) = from_set.iter().position(|x| x.id() == id) else {
            return false;
        };

        let monitor = from_set.remove(idx);
        monitor.set_state(to);
        log::debug!("{}: moved", monitor.context());
        to_set.push(monitor);

        self.cond.notify_all();
        true
    }

    /// Returns `true` if more than one monitor is registered, or if any monitor owns more than
    /// one variant.
    pub fn is_multiprocess(&self) -> bool {
        let state = self.lock_state();
        state.monitors.len() > 1 || state.monitors.values().any(|x| x.num_owned() > 1)
    }

    /// Release the dead monitors if any monitor died since the last collection. Returns the
    /// number of monitors collected.
    pub fn garbage_collect(&self) -> usize {
        let garbage = self.lock_state().take_garbage();
        let count = garbage.len();
        // dropped without holding the lock
        drop(garbage);
        count
    }

    /// Latch the "check multithreaded state" flag of the registered monitor `id`. Returns `false`
    /// if no such monitor is registered.
    pub fn set_should_check_multithread_state(&self, id: MonitorId) -> bool {
        let state = self.lock_state();
        match state.monitors.get(&id) {
            Some(monitor) => {
                monitor.latch_multithread_check();
                true
            }
            None => false,
        }
    }

    /// Record `pids` as a single synchronization group.
    pub fn register_variants(&self, pids: &[Pid]) {
        self.lock_state().pid_mapping.register_group(pids);
    }

    /// Add `new_pid` to the synchronization group of `member`.
    pub fn join_variant_group(&self, member: Pid, new_pid: Pid) {
        self.lock_state().pid_mapping.join_group(member, new_pid);
    }

    /// Remove an exited variant from its synchronization group.
    pub fn forget_variant(&self, pid: Pid) -> bool {
        self.lock_state().pid_mapping.remove(pid)
    }

    pub fn sync_group(&self, pid: Pid) -> Vec<Pid> {
        self.lock_state().pid_mapping.group_or_self(pid)
    }

    /// Add `pid` to the owned set of `monitor`.
    pub fn adopt_variant(&self, monitor: &Monitor, pid: Pid) -> Result<(), RegistryError> {
        let state = self.lock_state();
        let id = monitor.id();

        if !state.monitors.contains_key(&id) {
            return Err(RegistryError::NotRegistered { id });
        }
        if state.detached.contains(pid) {
            return Err(RegistryError::InTransit { pid });
        }
        match state.owner_of(pid) {
            Some(owner) if owner != id => return Err(RegistryError::AlreadyOwned { pid, owner }),
            _ => {}
        }

        let mut pids = monitor.pids();
        pids.owned.insert(pid);
        pids.expected.remove(&pid);
        Ok(())
    }

    /// Remove `pid` from the owned set of `monitor`. Returns `false` if it wasn't owned.
    pub fn release_variant(&self, monitor: &Monitor, pid: Pid) -> bool {
        let _state = self.lock_state();
        monitor.pids().owned.remove(&pid)
    }

    /// Hand off a stopped variant. The variant is removed from its origin monitor's owned set and
    /// queued until a monitor claims it.
    pub fn add_detached_variant(&self, variant: DetachedVariant) -> Result<(), RegistryError> {
        let mut state = self.lock_state();
        let pid = variant.variant_pid;
        let origin = variant.origin_monitor_id;

        if state.detached.contains(pid) {
            return Err(RegistryError::InTransit { pid });
        }
        match state.owner_of(pid) {
            Some(owner) if owner != origin => {
                return Err(RegistryError::AlreadyOwned { pid, owner })
            }
            _ => {}
        }

        if let Some(monitor) = state.monitors.get(&origin) {
            monitor.pids().owned.remove(&pid);
        }

        log::debug!("Variant {pid} detached by monitor {origin}");
        state.detached.push(variant);

        self.cond.notify_all();
        Ok(())
    }

    /// Find a detached variant that belongs to `monitor`: the first queued variant whose
    /// synchronization group intersects the pids the monitor owns or expects.
    pub fn have_pending_variants(&self, monitor: &Monitor) -> Option<Pid> {
        let state = self.lock_state();
        let pids = monitor.pids();
        let wanted = |pid: &Pid| pids.owned.contains(pid) || pids.expected.contains(pid);

        state
            .detached
            .find(|dv| match state.pid_mapping.group_of(dv.variant_pid) {
                Some(group) => group.iter().any(wanted),
                None => wanted(&dv.variant_pid),
            })
    }

    /// Take the detached variant `pid` and make `monitor` its owner. Only the first claim for a
    /// variant succeeds.
    pub fn claim_detached_variant(
        &self,
        monitor: &Monitor,
        pid: Pid,
    ) -> Result<DetachedVariant, RegistryError> {
        let mut state = self.lock_state();
        let id = monitor.id();

        if !state.monitors.contains_key(&id) {
            return Err(RegistryError::NotRegistered { id });
        }

        let variant = state
            .detached
            .take(pid)
            .ok_or(RegistryError::NotFound { pid })?;

        {
            let mut pids = monitor.pids();
            pids.owned.insert(pid);
            pids.expected.remove(&pid);
        }

        log::debug!(
            "{}: claimed variant {pid} from monitor {}",
            monitor.context(),
            variant.origin_monitor_id
        );

        self.cond.notify_all();
        Ok(variant)
    }

    /// Remove the detached variant `pid` without assigning it an owner.
    pub fn remove_detached_variant(&self, pid: Pid) -> Result<DetachedVariant, RegistryError> {
        let mut state = self.lock_state();
        let variant = state
            .detached
            .take(pid)
            .ok_or(RegistryError::NotFound { pid })?;
        self.cond.notify_all();
        Ok(variant)
    }

    pub fn num_pending_variants(&self) -> usize {
        self.lock_state().detached.len()
    }

    /// Detached variants that were never claimed.
    pub fn orphaned_variants(&self) -> Vec<RegistryError> {
        self.lock_state().orphans()
    }

    /// Open the startup gate, allowing the primary monitor to start tracing.
    pub fn open_can_run(&self) {
        let mut state = self.lock_state();
        state.can_run = true;
        self.cond.notify_all();
    }

    /// Wait until the startup gate is opened. Returns `false` if shutdown was requested first.
    pub fn wait_can_run(&self) -> bool {
        let state = self.lock_state();
        let state = self
            .cond
            .wait_while(state, |s| {
                !s.can_run && s.shutdown_phase == ShutdownPhase::Running
            })
            .unwrap();
        state.can_run
    }

    /// Wait until none of the monitors `ids` is registered.
    pub fn wait_for_monitors(&self, ids: &[MonitorId]) {
        let state = self.lock_state();
        let _state = self
            .cond
            .wait_while(state, |s| ids.iter().any(|id| s.monitors.contains_key(id)))
            .unwrap();
    }

    pub fn monitor_by_id(&self, id: MonitorId) -> Option<Arc<Monitor>> {
        self.lock_state().monitors.get(&id).cloned()
    }

    /// The number of registered (active or inactive) monitors.
    pub fn num_monitors(&self) -> usize {
        self.lock_state().monitors.len()
    }

    /// The registered monitors and their states, ordered by id.
    pub fn monitor_states(&self) -> Vec<(MonitorId, MonitorState)> {
        let state = self.lock_state();
        let mut states: Vec<_> = state
            .monitors
            .values()
            .map(|x| (x.id(), x.state()))
            .collect();
        states.sort_by_key(|(id, _)| *id);
        states
    }
}

impl Default for MonitorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

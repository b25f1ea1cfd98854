//! The control loop that runs on each monitor's OS thread.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::core::detach::DetachedVariant;
use crate::core::monitor::{Monitor, MonitorId};
use crate::core::registry::{MonitorRegistry, RegistryError};
use crate::core::shutdown::ShutdownCause;
use crate::host::syscall::fake::FakeSyscallNum;
use crate::host::syscall::locks::{GlobalLocks, SyscallLockTable};
use crate::host::syscall::{InterceptedSyscall, SyscallPolicy, Verdict};
use crate::host::tracer::{AttachContext, TraceEvent, Tracer, TracerFactory};

/// Everything a monitor thread needs, shared by all monitors. Cloning is cheap.
#[derive(Clone)]
pub struct MonitorSpawner {
    registry: Arc<MonitorRegistry>,
    lock_table: Arc<SyscallLockTable>,
    global_locks: Arc<GlobalLocks>,
    tracer_factory: TracerFactory,
    policy: Arc<dyn SyscallPolicy>,
    poll_interval: Duration,
}

impl MonitorSpawner {
    pub fn new(
        registry: Arc<MonitorRegistry>,
        tracer_factory: TracerFactory,
        policy: Arc<dyn SyscallPolicy>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            lock_table: Arc::new(SyscallLockTable::new()),
            global_locks: Arc::new(GlobalLocks::new()),
            tracer_factory,
            policy,
            poll_interval,
        }
    }

    pub fn registry(&self) -> &Arc<MonitorRegistry> {
        &self.registry
    }

    /// The locks held by monitors while emulating syscalls.
    pub fn global_locks(&self) -> &Arc<GlobalLocks> {
        &self.global_locks
    }

    /// Register a new monitor that will adopt `expected` from the handoff queue, and start its
    /// thread. The monitor is registered before this returns, so the registry never looks empty
    /// while a variant is being handed off. If `gated`, the monitor doesn't start tracing until
    /// the registry's startup gate opens.
    pub fn spawn(
        &self,
        expected: Vec<Pid>,
        gated: bool,
    ) -> anyhow::Result<(Arc<Monitor>, JoinHandle<()>)> {
        let id = self
            .registry
            .next_monitor_id()
            .context("Failed to allocate a monitor id")?;
        let monitor = Arc::new(Monitor::new(id, expected));
        self.registry
            .register_monitor(Arc::clone(&monitor))
            .with_context(|| format!("Failed to register monitor {id}"))?;

        let thread = MonitorThread {
            spawner: self.clone(),
            monitor: Arc::clone(&monitor),
            intercepting: BTreeSet::new(),
            suspended: BTreeSet::new(),
            children: Vec::new(),
        };

        let handle = std::thread::Builder::new()
            .name(format!("monitor-{id}"))
            .spawn(move || thread.run(gated));

        match handle {
            Ok(handle) => Ok((monitor, handle)),
            Err(e) => {
                self.registry.unregister_monitor(&monitor, true);
                Err(e).with_context(|| format!("Failed to start the thread for monitor {id}"))
            }
        }
    }
}

struct MonitorThread {
    spawner: MonitorSpawner,
    monitor: Arc<Monitor>,
    /// Variants whose loader has finished. Syscalls of other variants aren't checked.
    intercepting: BTreeSet<Pid>,
    /// Variants left stopped by the policy.
    suspended: BTreeSet<Pid>,
    /// Monitors started by this monitor.
    children: Vec<MonitorId>,
}

impl MonitorThread {
    fn registry(&self) -> &MonitorRegistry {
        &self.spawner.registry
    }

    fn run(mut self, gated: bool) {
        // the tracer must belong to this thread
        let mut tracer = (self.spawner.tracer_factory)();

        if gated && !self.registry().wait_can_run() {
            log::debug!(
                "{}: shutdown requested before tracing started",
                self.monitor.context()
            );
        }

        self.control_loop(tracer.as_mut());
        self.registry().unregister_monitor(&self.monitor, true);
    }

    fn control_loop(&mut self, tracer: &mut dyn Tracer) {
        loop {
            if self.registry().shutdown_requested() {
                self.wind_down(tracer);
                return;
            }

            self.claim_pending_variants(tracer);

            if self.monitor.take_multithread_check() {
                let num_threads = self.monitor.num_owned();
                log::debug!(
                    "{}: now tracing {num_threads} variant threads (agents {}, multiprocess: {})",
                    self.monitor.context(),
                    if num_threads > 1 { "needed" } else { "not needed" },
                    self.registry().is_multiprocess(),
                );
            }

            if self.monitor.is_idle() {
                log::debug!("{}: no variants remaining", self.monitor.context());
                return;
            }

            match tracer.wait_event(self.spawner.poll_interval) {
                Ok(Some(event)) => {
                    if let Err(e) = self.handle_event(tracer, event) {
                        log::warn!("{}: {e:?}", self.monitor.context());
                    }
                }
                Ok(None) => {}
                Err(e) => log::warn!("{}: wait failed: {e}", self.monitor.context()),
            }
        }
    }

    fn claim_pending_variants(&mut self, tracer: &mut dyn Tracer) {
        while let Some(pid) = self.registry().have_pending_variants(&self.monitor) {
            match self.registry().claim_detached_variant(&self.monitor, pid) {
                Ok(variant) => self.attach(tracer, variant),
                // another monitor took it
                Err(RegistryError::NotFound { .. }) => continue,
                Err(e) => {
                    log::warn!("{}: {e}", self.monitor.context());
                    break;
                }
            }
        }
    }

    fn attach(&mut self, tracer: &mut dyn Tracer, variant: DetachedVariant) {
        let pid = variant.variant_pid;

        if let Err(e) = tracer.attach(pid, &variant.payload) {
            log::warn!(
                "{}: could not attach to variant {pid}: {e}",
                self.monitor.context()
            );
            self.registry().release_variant(&self.monitor, pid);
            self.registry().forget_variant(pid);
            return;
        }

        if variant.payload.intercepting {
            self.intercepting.insert(pid);
        }

        log::debug!(
            "{}: attached to variant {pid} from monitor {}",
            self.monitor.context(),
            variant.origin_monitor_id
        );
    }

    fn resume(
        &self,
        tracer: &mut dyn Tracer,
        pid: Pid,
        signal: Option<Signal>,
    ) -> anyhow::Result<()> {
        if self.suspended.contains(&pid) {
            return Ok(());
        }
        tracer
            .resume(pid, signal)
            .with_context(|| format!("Failed to resume variant {pid}"))
    }

    fn handle_event(&mut self, tracer: &mut dyn Tracer, event: TraceEvent) -> anyhow::Result<()> {
        let ctx = self.monitor.context();

        match event {
            TraceEvent::SyscallEntry { pid, number } => {
                self.handle_syscall_entry(tracer, pid, number)?
            }
            TraceEvent::SyscallExit { pid } | TraceEvent::Exec { pid } => {
                self.resume(tracer, pid, None)?
            }
            TraceEvent::NewThread { parent, child } => {
                self.registry().adopt_variant(&self.monitor, child)?;
                self.registry().join_variant_group(parent, child);
                self.registry()
                    .set_should_check_multithread_state(self.monitor.id());
                if self.intercepting.contains(&parent) {
                    self.intercepting.insert(child);
                }
                log::debug!("{ctx}: variant {parent} created thread {child}");

                self.resume(tracer, child, None)?;
                self.resume(tracer, parent, None)?;
            }
            TraceEvent::NewProcess { parent, child } => {
                // the parent keeps running even if the child couldn't be handed off
                let handed_off = self.hand_off(tracer, parent, child);
                self.resume(tracer, parent, None)?;
                handed_off?;
            }
            TraceEvent::Signal { pid, signal } => {
                log::trace!("{ctx}: variant {pid} received {signal}");
                self.resume(tracer, pid, Some(signal))?;
            }
            TraceEvent::Exited { pid, status } => {
                self.registry().release_variant(&self.monitor, pid);
                self.registry().forget_variant(pid);
                self.intercepting.remove(&pid);
                log::debug!("{ctx}: variant {pid} exited with {status}");

                if self.suspended.remove(&pid)
                    && self.suspended.is_empty()
                    && self.registry().set_monitor_active(&self.monitor)
                {
                    log::info!("{}: no suspended variants remaining", self.monitor.context());
                }
            }
        }

        Ok(())
    }

    fn handle_syscall_entry(
        &mut self,
        tracer: &mut dyn Tracer,
        pid: Pid,
        number: i64,
    ) -> anyhow::Result<()> {
        let ctx = self.monitor.context();
        let syscall = InterceptedSyscall::from_num(number);

        match syscall {
            InterceptedSyscall::Fake(FakeSyscallNum::loader_done) => {
                log::debug!("{ctx}: variant {pid} finished loading");
                self.intercepting.insert(pid);
            }
            InterceptedSyscall::UnknownFake(_) => {
                log::warn!("{ctx}: variant {pid} issued {syscall}");
            }
            InterceptedSyscall::Native(num) if self.intercepting.contains(&pid) => {
                let locks = self.spawner.lock_table.locks_for(num);
                let _guard = self.spawner.global_locks.acquire(locks);
                log::trace!("{ctx}: variant {pid} entered {syscall} (locks: {locks})");

                if self.spawner.policy.check(ctx, pid, syscall) == Verdict::Suspend {
                    self.suspended.insert(pid);
                    self.registry().set_monitor_inactive(&self.monitor);
                    log::info!("{ctx}: suspended variant {pid} at {syscall}");
                }
            }
            InterceptedSyscall::Native(_) => {}
        }

        self.resume(tracer, pid, None)
    }

    /// Give a new thread group to a new monitor.
    fn hand_off(&mut self, tracer: &mut dyn Tracer, parent: Pid, child: Pid) -> anyhow::Result<()> {
        self.registry().register_variants(&[child]);

        let mut payload = tracer
            .detach(child)
            .with_context(|| format!("Failed to detach new variant {child}"))?;
        payload.intercepting = self.intercepting.contains(&parent);

        let queued = self.registry().add_detached_variant(DetachedVariant::new(
            child,
            self.monitor.id(),
            payload,
        ));
        if let Err(e) = queued {
            // nobody can claim it, so it must not stay stopped
            self.kill_detached(tracer, child, &payload);
            return Err(e).with_context(|| format!("Failed to hand off new variant {child}"));
        }

        match self.spawner.spawn(vec![child], false) {
            Ok((monitor, _handle)) => {
                log::debug!(
                    "{}: variant {parent} created process {child}, handed to monitor {}",
                    self.monitor.context(),
                    monitor.id()
                );
                self.children.push(monitor.id());
            }
            Err(e) => {
                log::error!("{}: {e:?}", self.monitor.context());
                self.registry().request_shutdown(ShutdownCause::Internal);
            }
        }

        Ok(())
    }

    /// Kill a variant this monitor detached from but couldn't queue.
    fn kill_detached(&self, tracer: &mut dyn Tracer, pid: Pid, payload: &AttachContext) {
        let killed = tracer
            .attach(pid, payload)
            .and_then(|()| tracer.kill(pid))
            .or_else(|_| nix::sys::signal::kill(pid, Signal::SIGKILL));

        if let Err(e) = killed {
            log::warn!(
                "{}: could not kill variant {pid}: {e}",
                self.monitor.context()
            );
        }
        self.registry().forget_variant(pid);
    }

    fn wind_down(&mut self, tracer: &mut dyn Tracer) {
        log::debug!("{}: shutting down", self.monitor.context());

        // variants waiting for us would otherwise stay stopped forever
        self.claim_pending_variants(tracer);

        for pid in self.monitor.owned_variant_pids() {
            if let Err(e) = tracer.kill(pid) {
                log::debug!(
                    "{}: could not kill variant {pid}: {e}",
                    self.monitor.context()
                );
            }
            self.registry().release_variant(&self.monitor, pid);
            self.registry().forget_variant(pid);
        }
        self.suspended.clear();

        if !self.children.is_empty() {
            log::debug!(
                "{}: waiting for monitors {:?}",
                self.monitor.context(),
                self.children
            );
            self.registry().wait_for_monitors(&self.children);
        }
    }
}

//! A [`Tracer`] backed by ptrace.
//!
//! The tracees of the calling thread are polled with a single non-blocking `waitpid`, so that a
//! monitor can wake up periodically to check for shutdown and pending handoffs. The tracer only
//! starts sleeping between polls after a run of empty polls, since a variant that is busy making
//! syscalls stops again within microseconds of being restarted. All calls must be made from the
//! thread that created the tracer.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::host::tracer::{AttachContext, ExitStatus, TraceEvent, Tracer};
use crate::utility::os::read_tgid;

/// Empty polls before the tracer starts sleeping.
const SPIN_POLLS: u32 = 64;
/// The first sleep after spinning. Doubled after every further empty poll.
const MIN_POLL_STEP: Duration = Duration::from_micros(5);
const MAX_POLL_STEP: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct TraceeState {
    in_syscall: bool,
    // SIGSTOPs caused by attaching that may still be reported after the attach stop
    stray_stops: u32,
}

#[derive(Debug, Default)]
pub struct PtraceTracer {
    tracees: BTreeMap<Pid, TraceeState>,
    // new children whose initial stop was collected before their parent's clone event
    early_stops: BTreeSet<Pid>,
}

impl PtraceTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_tracees(&self) -> usize {
        self.tracees.len()
    }

    /// Collect the next stop of any tracee of this thread without blocking.
    fn poll(&mut self) -> Result<Option<TraceEvent>, Errno> {
        if self.tracees.is_empty() {
            return Ok(None);
        }

        let flags = WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD | WaitPidFlag::WNOHANG;
        loop {
            match waitpid(None, Some(flags)) {
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(status) => {
                    if let Some(event) = self.translate(status)? {
                        return Ok(Some(event));
                    }
                }
                Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => {
                    // reaped by someone else, so we'll never see its exit status
                    let Some(pid) = self.tracees.keys().next().copied() else {
                        return Ok(None);
                    };
                    self.tracees.remove(&pid);
                    return Ok(Some(TraceEvent::Exited {
                        pid,
                        status: ExitStatus::Signaled(Signal::SIGKILL),
                    }));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Translate a wait status into an event. Returns `None` for stops that are handled here.
    fn translate(&mut self, status: WaitStatus) -> Result<Option<TraceEvent>, Errno> {
        match status {
            WaitStatus::PtraceSyscall(pid) => {
                let state = self.tracees.entry(pid).or_default();
                state.in_syscall = !state.in_syscall;
                if state.in_syscall {
                    Ok(Some(TraceEvent::SyscallEntry {
                        pid,
                        number: syscall_number(pid)?,
                    }))
                } else {
                    Ok(Some(TraceEvent::SyscallExit { pid }))
                }
            }
            WaitStatus::PtraceEvent(pid, _, event) => match event {
                libc::PTRACE_EVENT_CLONE | libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK => {
                    let child = Pid::from_raw(ptrace::getevent(pid)? as libc::pid_t);
                    if !self.early_stops.remove(&child) {
                        wait_for_initial_stop(child)?;
                    }
                    self.tracees.insert(child, TraceeState::default());

                    let same_group = match (read_tgid(pid), read_tgid(child)) {
                        (Ok(a), Ok(b)) => a == b,
                        _ => false,
                    };
                    if same_group {
                        Ok(Some(TraceEvent::NewThread { parent: pid, child }))
                    } else {
                        Ok(Some(TraceEvent::NewProcess { parent: pid, child }))
                    }
                }
                libc::PTRACE_EVENT_EXEC => Ok(Some(TraceEvent::Exec { pid })),
                _ => {
                    log::trace!("Ignoring ptrace event {event} of {pid}");
                    ptrace::syscall(pid, None)?;
                    Ok(None)
                }
            },
            WaitStatus::Stopped(pid, signal) => {
                let Some(state) = self.tracees.get_mut(&pid) else {
                    // reported again by the clone event of its parent
                    self.early_stops.insert(pid);
                    return Ok(None);
                };
                if signal == Signal::SIGSTOP && state.stray_stops > 0 {
                    state.stray_stops -= 1;
                    ptrace::syscall(pid, None)?;
                    return Ok(None);
                }
                Ok(Some(TraceEvent::Signal { pid, signal }))
            }
            WaitStatus::Exited(pid, code) => {
                self.tracees.remove(&pid);
                Ok(Some(TraceEvent::Exited {
                    pid,
                    status: ExitStatus::Code(code),
                }))
            }
            WaitStatus::Signaled(pid, signal, _) => {
                self.tracees.remove(&pid);
                Ok(Some(TraceEvent::Exited {
                    pid,
                    status: ExitStatus::Signaled(signal),
                }))
            }
            WaitStatus::Continued(_) | WaitStatus::StillAlive => Ok(None),
        }
    }
}

impl Tracer for PtraceTracer {
    fn wait_event(&mut self, timeout: Duration) -> Result<Option<TraceEvent>, Errno> {
        let deadline = Instant::now() + timeout;
        let mut empty_polls = 0;
        let mut step = MIN_POLL_STEP;

        loop {
            if let Some(event) = self.poll()? {
                return Ok(Some(event));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            if empty_polls < SPIN_POLLS && !self.tracees.is_empty() {
                empty_polls += 1;
                std::thread::yield_now();
            } else {
                std::thread::sleep(step.min(deadline - now));
                step = (step * 2).min(MAX_POLL_STEP);
            }
        }
    }

    fn resume(&mut self, pid: Pid, signal: Option<Signal>) -> Result<(), Errno> {
        if !self.tracees.contains_key(&pid) {
            return Err(Errno::ESRCH);
        }
        ptrace::syscall(pid, signal)
    }

    fn detach(&mut self, pid: Pid) -> Result<AttachContext, Errno> {
        let Some(state) = self.tracees.remove(&pid) else {
            return Err(Errno::ESRCH);
        };

        // the SIGSTOP keeps it stopped until the new tracer attaches
        ptrace::detach(pid, Some(Signal::SIGSTOP))?;

        Ok(AttachContext {
            in_syscall: state.in_syscall,
            ..AttachContext::initial()
        })
    }

    fn attach(&mut self, pid: Pid, ctx: &AttachContext) -> Result<(), Errno> {
        ptrace::attach(pid)?;

        let mut pending_signal = ctx.pending_signal;
        loop {
            match waitpid(pid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => break,
                Ok(WaitStatus::Stopped(_, signal)) => {
                    // delivered when we restart it
                    pending_signal.get_or_insert(signal);
                    break;
                }
                Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => return Err(Errno::ESRCH),
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }

        ptrace::setoptions(pid, ctx.options)?;
        self.tracees.insert(
            pid,
            TraceeState {
                in_syscall: ctx.in_syscall,
                stray_stops: 1,
            },
        );
        ptrace::syscall(pid, pending_signal)
    }

    fn kill(&mut self, pid: Pid) -> Result<(), Errno> {
        if self.tracees.remove(&pid).is_none() {
            return Err(Errno::ESRCH);
        }

        signal::kill(pid, Signal::SIGKILL)?;
        loop {
            match waitpid(pid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) | Err(Errno::ECHILD) => {
                    return Ok(())
                }
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Wait for the stop that a new auto-attached child reports before it runs.
fn wait_for_initial_stop(child: Pid) -> Result<(), Errno> {
    loop {
        match waitpid(child, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(..) | WaitStatus::PtraceEvent(..)) => return Ok(()),
            Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => return Err(Errno::ESRCH),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn syscall_number(pid: Pid) -> Result<i64, Errno> {
    Ok(ptrace::getregs(pid)?.orig_rax as i64)
}

#[cfg(not(target_arch = "x86_64"))]
fn syscall_number(_pid: Pid) -> Result<i64, Errno> {
    Err(Errno::ENOSYS)
}

//! The process-control interface used by monitor threads.
//!
//! A [`Tracer`] is owned by exactly one monitor thread. With ptrace, only the thread that attached
//! to a tracee may wait on it and restart it, so tracers must be created on the thread that uses
//! them (see [`TracerFactory`]).

use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// The ptrace state a new owner needs to continue tracing a variant that was detached by another
/// monitor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AttachContext {
    /// A signal that was pending when the variant was detached, and must be re-injected when it's
    /// restarted.
    pub pending_signal: Option<Signal>,
    /// The ptrace options to set after attaching.
    pub options: ptrace::Options,
    /// The variant was stopped at a syscall entry, so its next syscall stop is an exit.
    pub in_syscall: bool,
    /// The bootstrap loader has already handed control to the target binary.
    pub intercepting: bool,
}

impl AttachContext {
    /// The options every monitor sets on its variants.
    pub fn default_options() -> ptrace::Options {
        ptrace::Options::PTRACE_O_TRACESYSGOOD
            | ptrace::Options::PTRACE_O_TRACECLONE
            | ptrace::Options::PTRACE_O_TRACEFORK
            | ptrace::Options::PTRACE_O_TRACEVFORK
            | ptrace::Options::PTRACE_O_TRACEEXEC
            | ptrace::Options::PTRACE_O_EXITKILL
    }

    /// The context for a freshly launched variant that hasn't executed anything yet.
    pub fn initial() -> Self {
        Self {
            pending_signal: None,
            options: Self::default_options(),
            in_syscall: false,
            intercepting: false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Code(i32),
    Signaled(Signal),
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signaled(signal) => write!(f, "killed by {signal}"),
        }
    }
}

/// A stop reported by a [`Tracer`]. Apart from [`TraceEvent::Exited`], the pids named by the
/// event are left stopped until the monitor restarts them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    SyscallEntry { pid: Pid, number: i64 },
    SyscallExit { pid: Pid },
    /// A new thread was created in the thread group of `parent`. The child is already attached.
    NewThread { parent: Pid, child: Pid },
    /// A new thread group was created by `parent`. The child is attached and stopped.
    NewProcess { parent: Pid, child: Pid },
    Exec { pid: Pid },
    /// A signal was delivered to the variant. Restarting it with the signal delivers it.
    Signal { pid: Pid, signal: Signal },
    Exited { pid: Pid, status: ExitStatus },
}

impl TraceEvent {
    /// The pid that reported the event.
    pub fn pid(&self) -> Pid {
        match self {
            Self::SyscallEntry { pid, .. }
            | Self::SyscallExit { pid }
            | Self::Exec { pid }
            | Self::Signal { pid, .. }
            | Self::Exited { pid, .. } => *pid,
            Self::NewThread { parent, .. } | Self::NewProcess { parent, .. } => *parent,
        }
    }
}

pub trait Tracer {
    /// Wait up to `timeout` for the next stop of any attached variant. Returns `None` if nothing
    /// happened.
    fn wait_event(&mut self, timeout: Duration) -> Result<Option<TraceEvent>, Errno>;

    /// Restart a stopped variant until its next syscall stop, delivering `signal` if given.
    fn resume(&mut self, pid: Pid, signal: Option<Signal>) -> Result<(), Errno>;

    /// Detach from a stopped variant, leaving it stopped so that another tracer can attach.
    fn detach(&mut self, pid: Pid) -> Result<AttachContext, Errno>;

    /// Attach to a variant that another tracer detached from, and restart it.
    fn attach(&mut self, pid: Pid, ctx: &AttachContext) -> Result<(), Errno>;

    /// Kill an attached variant and reap it.
    fn kill(&mut self, pid: Pid) -> Result<(), Errno>;
}

/// Creates a tracer for the calling thread.
pub type TracerFactory = Arc<dyn Fn() -> Box<dyn Tracer> + Send + Sync>;

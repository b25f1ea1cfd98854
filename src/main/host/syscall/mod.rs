pub mod fake;
pub mod locks;

use nix::unistd::Pid;

use crate::core::monitor::MonitorContext;
use fake::FakeSyscallNum;

/// A syscall as seen by a monitor at a syscall-entry stop.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InterceptedSyscall {
    /// A marker issued by the bootstrap loader.
    Fake(FakeSyscallNum),
    /// A number in the loader's reserved range that we don't recognize.
    UnknownFake(i64),
    /// Anything else. The number may still be invalid for the kernel.
    Native(i64),
}

impl InterceptedSyscall {
    pub fn from_num(num: i64) -> Self {
        if !FakeSyscallNum::is_reserved(num) {
            return Self::Native(num);
        }
        match FakeSyscallNum::try_from(num) {
            Ok(fake) => Self::Fake(fake),
            Err(_) => Self::UnknownFake(num),
        }
    }

    /// The name of the syscall, if known.
    pub fn name(&self) -> Option<&'static str> {
        match self {
            Self::Fake(fake) => Some(fake.to_str()),
            Self::UnknownFake(_) => None,
            Self::Native(num) => native_syscall_name(*num),
        }
    }
}

impl std::fmt::Display for InterceptedSyscall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fake(fake) => write!(f, "{fake}"),
            Self::UnknownFake(num) => write!(f, "unknown-fake-syscall ({num:#x})"),
            Self::Native(num) => match native_syscall_name(*num) {
                Some(name) => write!(f, "{name} ({num})"),
                None => write!(f, "unknown-syscall ({num})"),
            },
        }
    }
}

/// What a monitor should do with an intercepted syscall.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Verdict {
    /// Let the variant execute the syscall.
    Allow,
    /// Leave the variant stopped until shutdown. The monitor becomes inactive.
    Suspend,
}

/// Decides whether variants may execute their syscalls. Called at every syscall entry after the
/// bootstrap loader has finished, while holding the syscall's global locks.
pub trait SyscallPolicy: Send + Sync {
    fn check(&self, monitor: MonitorContext, pid: Pid, syscall: InterceptedSyscall) -> Verdict;
}

/// Allows every syscall.
#[derive(Debug, Default, Copy, Clone)]
pub struct AllowAll;

impl SyscallPolicy for AllowAll {
    fn check(&self, _monitor: MonitorContext, _pid: Pid, _syscall: InterceptedSyscall) -> Verdict {
        Verdict::Allow
    }
}

// only the syscalls we care about for logging
fn native_syscall_name(num: i64) -> Option<&'static str> {
    let name = match num {
        libc::SYS_read => "read",
        libc::SYS_write => "write",
        libc::SYS_openat => "openat",
        libc::SYS_close => "close",
        libc::SYS_mmap => "mmap",
        libc::SYS_munmap => "munmap",
        libc::SYS_mprotect => "mprotect",
        libc::SYS_brk => "brk",
        libc::SYS_clone => "clone",
        libc::SYS_clone3 => "clone3",
        libc::SYS_execve => "execve",
        libc::SYS_execveat => "execveat",
        libc::SYS_exit => "exit",
        libc::SYS_exit_group => "exit_group",
        libc::SYS_getpid => "getpid",
        libc::SYS_gettid => "gettid",
        libc::SYS_kill => "kill",
        libc::SYS_tgkill => "tgkill",
        libc::SYS_wait4 => "wait4",
        libc::SYS_shmat => "shmat",
        libc::SYS_shmdt => "shmdt",
        #[cfg(target_arch = "x86_64")]
        libc::SYS_open => "open",
        #[cfg(target_arch = "x86_64")]
        libc::SYS_fork => "fork",
        #[cfg(target_arch = "x86_64")]
        libc::SYS_vfork => "vfork",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::fake::MVEE_FAKE_SYSCALL_BASE;
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            InterceptedSyscall::from_num(MVEE_FAKE_SYSCALL_BASE),
            InterceptedSyscall::Fake(FakeSyscallNum::loader_done)
        );
        assert_eq!(
            InterceptedSyscall::from_num(MVEE_FAKE_SYSCALL_BASE + 7),
            InterceptedSyscall::UnknownFake(MVEE_FAKE_SYSCALL_BASE + 7)
        );
        assert_eq!(
            InterceptedSyscall::from_num(libc::SYS_getpid),
            InterceptedSyscall::Native(libc::SYS_getpid)
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            InterceptedSyscall::Native(libc::SYS_close).to_string(),
            format!("close ({})", libc::SYS_close)
        );
        assert_eq!(
            InterceptedSyscall::Native(100_000).to_string(),
            "unknown-syscall (100000)"
        );
        assert_eq!(InterceptedSyscall::UnknownFake(0x70000000).name(), None);
    }
}

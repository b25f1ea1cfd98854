//! Which supervisor-shared locks a monitor must hold while emulating a syscall.
//!
//! Syscalls issued by variants under different monitors can touch the same supervisor state (the
//! monitor registry, the pid mapping, the special-file cache, ...). The [`SyscallLockTable`] maps
//! every syscall number onto the set of [`GlobalLocks`] that must be held while the syscall is
//! handled. The table is built once at startup and never modified afterwards, so lookups don't
//! need any synchronization.
//!
//! Any syscall that needs protection must be listed explicitly. A syscall number with no entry
//! needs no lock; this is not a gap in the table.

use std::sync::{Mutex, MutexGuard};

/// Number of entries in the syscall lock table. Larger than the highest syscall number on any
/// architecture we support.
pub const MAX_CALLS: usize = 512;

bitflags::bitflags! {
    /// A set of global locks, as stored in the [`SyscallLockTable`].
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct SyscallLocks: u8 {
        /// The file descriptor bookkeeping.
        const FD = 1 << 0;
        /// The address-space (mmap) bookkeeping.
        const MMAN = 1 << 1;
        /// The System V shared memory bookkeeping.
        const SHM = 1 << 2;
        /// The monitor registry. Held by syscalls that can create or destroy thread groups.
        const REGISTRY = 1 << 3;
        /// The variant pid mapping.
        const PID_MAPPING = 1 << 4;
        /// The cache of special executables.
        const SPECIAL_FILES = 1 << 5;
        const ALL = Self::FD.bits()
            | Self::MMAN.bits()
            | Self::SHM.bits()
            | Self::REGISTRY.bits()
            | Self::PID_MAPPING.bits()
            | Self::SPECIAL_FILES.bits();
    }
}

impl std::fmt::Display for SyscallLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        bitflags::parser::to_writer(self, f)
    }
}

/// Maps syscall numbers onto the locks they need to execute reliably.
#[derive(Debug, Clone)]
pub struct SyscallLockTable {
    table: Box<[SyscallLocks; MAX_CALLS]>,
}

impl SyscallLockTable {
    /// Build the table for the host architecture.
    pub fn new() -> Self {
        let mut table = Self {
            table: Box::new([SyscallLocks::empty(); MAX_CALLS]),
        };

        for (num, locks) in common_entries().into_iter().chain(arch_entries()) {
            table.set(num, locks);
        }

        table
    }

    fn set(&mut self, num: libc::c_long, locks: SyscallLocks) {
        let idx = usize::try_from(num).unwrap();
        assert!(idx < MAX_CALLS, "syscall {num} is outside of the lock table");
        self.table[idx] |= locks;
    }

    /// The locks to hold while emulating syscall `num`. Returns an empty set for any number
    /// without an explicit entry, including negative numbers, numbers past [`MAX_CALLS`], and the
    /// loader's fake syscalls.
    pub fn locks_for(&self, num: i64) -> SyscallLocks {
        usize::try_from(num)
            .ok()
            .and_then(|idx| self.table.get(idx))
            .copied()
            .unwrap_or_else(SyscallLocks::empty)
    }

    /// Iterate over all syscall numbers that need at least one lock.
    pub fn iter(&self) -> impl Iterator<Item = (usize, SyscallLocks)> + '_ {
        self.table
            .iter()
            .enumerate()
            .filter(|(_, locks)| !locks.is_empty())
            .map(|(num, locks)| (num, *locks))
    }
}

impl Default for SyscallLockTable {
    fn default() -> Self {
        Self::new()
    }
}

// syscalls available under the same name on every linux architecture
fn common_entries() -> Vec<(libc::c_long, SyscallLocks)> {
    use SyscallLocks as L;

    vec![
        // descriptor table
        (libc::SYS_openat, L::FD),
        (libc::SYS_close, L::FD),
        (libc::SYS_close_range, L::FD),
        (libc::SYS_dup, L::FD),
        (libc::SYS_dup3, L::FD),
        (libc::SYS_fcntl, L::FD),
        (libc::SYS_pipe2, L::FD),
        (libc::SYS_socket, L::FD),
        (libc::SYS_socketpair, L::FD),
        (libc::SYS_accept, L::FD),
        (libc::SYS_accept4, L::FD),
        (libc::SYS_eventfd2, L::FD),
        (libc::SYS_epoll_create1, L::FD),
        (libc::SYS_timerfd_create, L::FD),
        (libc::SYS_memfd_create, L::FD),
        (libc::SYS_inotify_init1, L::FD),
        // address space
        (libc::SYS_mmap, L::FD | L::MMAN),
        (libc::SYS_munmap, L::MMAN),
        (libc::SYS_mprotect, L::MMAN),
        (libc::SYS_pkey_mprotect, L::MMAN),
        (libc::SYS_mremap, L::MMAN),
        (libc::SYS_brk, L::MMAN),
        (libc::SYS_madvise, L::MMAN),
        // shared memory
        (libc::SYS_shmget, L::SHM),
        (libc::SYS_shmat, L::SHM | L::MMAN),
        (libc::SYS_shmdt, L::SHM | L::MMAN),
        (libc::SYS_shmctl, L::SHM),
        // thread group creation and destruction
        (libc::SYS_clone, L::REGISTRY | L::PID_MAPPING),
        (libc::SYS_clone3, L::REGISTRY | L::PID_MAPPING),
        (libc::SYS_exit, L::PID_MAPPING),
        (libc::SYS_exit_group, L::REGISTRY | L::PID_MAPPING),
        // exec replaces the whole image
        (libc::SYS_execve, L::ALL),
        (libc::SYS_execveat, L::ALL),
    ]
}

#[cfg(target_arch = "x86_64")]
fn arch_entries() -> Vec<(libc::c_long, SyscallLocks)> {
    use SyscallLocks as L;

    vec![
        (libc::SYS_open, L::FD),
        (libc::SYS_creat, L::FD),
        (libc::SYS_dup2, L::FD),
        (libc::SYS_pipe, L::FD),
        (libc::SYS_eventfd, L::FD),
        (libc::SYS_epoll_create, L::FD),
        (libc::SYS_inotify_init, L::FD),
        (libc::SYS_fork, L::REGISTRY | L::PID_MAPPING),
        (libc::SYS_vfork, L::REGISTRY | L::PID_MAPPING),
    ]
}

#[cfg(not(target_arch = "x86_64"))]
fn arch_entries() -> Vec<(libc::c_long, SyscallLocks)> {
    Vec::new()
}

/// The supervisor-shared locks named by [`SyscallLocks`].
///
/// The locks only guard supervisor-side bookkeeping, so they protect no data themselves.
#[derive(Debug, Default)]
pub struct GlobalLocks {
    fd: Mutex<()>,
    mman: Mutex<()>,
    shm: Mutex<()>,
    registry: Mutex<()>,
    pid_mapping: Mutex<()>,
    special_files: Mutex<()>,
}

impl GlobalLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, lock: SyscallLocks) -> &Mutex<()> {
        let locks = [
            (SyscallLocks::FD, &self.fd),
            (SyscallLocks::MMAN, &self.mman),
            (SyscallLocks::SHM, &self.shm),
            (SyscallLocks::REGISTRY, &self.registry),
            (SyscallLocks::PID_MAPPING, &self.pid_mapping),
            (SyscallLocks::SPECIAL_FILES, &self.special_files),
        ];

        locks
            .into_iter()
            .find_map(|(flag, mutex)| (flag == lock).then_some(mutex))
            .unwrap_or_else(|| unreachable!("{lock:?} is not a single lock"))
    }

    /// Acquire every lock in `locks`. Locks are always taken in increasing bit order, so callers
    /// can't deadlock each other regardless of which sets they request.
    pub fn acquire(&self, locks: SyscallLocks) -> GlobalLocksGuard<'_> {
        let guards = locks
            .iter()
            .map(|lock| {
                // a panic while holding one of these locks doesn't leave any data inconsistent
                self.lock_for(lock)
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
            })
            .collect();

        GlobalLocksGuard { locks, guards }
    }
}

/// Releases the held locks (in reverse order) when dropped.
#[must_use]
pub struct GlobalLocksGuard<'a> {
    locks: SyscallLocks,
    guards: Vec<MutexGuard<'a, ()>>,
}

impl GlobalLocksGuard<'_> {
    pub fn locks(&self) -> SyscallLocks {
        self.locks
    }
}

impl Drop for GlobalLocksGuard<'_> {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

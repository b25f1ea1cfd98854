/// The first syscall number used by the variant's bootstrap loader to talk to the monitor. These
/// numbers are far outside of the range of real syscalls, so the kernel would fail them with
/// ENOSYS if they were ever executed natively.
pub const MVEE_FAKE_SYSCALL_BASE: i64 = 0x6FFF_FFFF;

/// Syscall numbers that the bootstrap loader issues to signal a phase transition to the monitor.
/// These are never treated as real syscalls.
//
// Don't renumber or reuse retired entries: a loader built against an older numbering would
// otherwise signal the wrong transition.
#[derive(Debug, Copy, Clone, Eq, PartialEq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(i64)]
#[allow(non_camel_case_types)]
pub enum FakeSyscallNum {
    /// The loader has finished setting up the dynamic linker for the target binary and is about
    /// to jump to it. Normal syscall interception begins after this call.
    loader_done = MVEE_FAKE_SYSCALL_BASE,
}

impl FakeSyscallNum {
    /// Returns whether `num` is in the range reserved for loader markers. This is true even for
    /// markers we don't recognize.
    pub fn is_reserved(num: i64) -> bool {
        num >= MVEE_FAKE_SYSCALL_BASE
    }

    pub fn to_str(&self) -> &'static str {
        match self {
            Self::loader_done => "loader_done",
        }
    }
}

impl std::fmt::Display for FakeSyscallNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#x})", self.to_str(), i64::from(*self))
    }
}

use nix::unistd::Pid;

use crate::core::monitor::MonitorId;
use crate::host::tracer::AttachContext;

/// A variant that was released by one monitor and is waiting to be attached by another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedVariant {
    pub variant_pid: Pid,
    /// The monitor that released the variant, or [`MonitorId::MANAGEMENT`] for newly launched
    /// variants.
    pub origin_monitor_id: MonitorId,
    pub payload: AttachContext,
}

impl DetachedVariant {
    pub fn new(variant_pid: Pid, origin_monitor_id: MonitorId, payload: AttachContext) -> Self {
        Self {
            variant_pid,
            origin_monitor_id,
            payload,
        }
    }
}

/// The queue of variants in transit between monitors.
///
/// Entries are discovered by predicate rather than addressed to a monitor, and are removed by the
/// first monitor to take them. Entries that nobody takes stay in the queue.
#[derive(Debug, Default)]
pub struct HandoffQueue {
    entries: Vec<DetachedVariant>,
}

impl HandoffQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, variant: DetachedVariant) {
        debug_assert!(!self.contains(variant.variant_pid));
        self.entries.push(variant);
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.entries.iter().any(|x| x.variant_pid == pid)
    }

    /// The pid of the oldest entry matching `pred`.
    pub fn find(&self, mut pred: impl FnMut(&DetachedVariant) -> bool) -> Option<Pid> {
        self.entries
            .iter()
            .find(|x| pred(x))
            .map(|x| x.variant_pid)
    }

    /// Remove and return the entry for `pid`.
    pub fn take(&mut self, pid: Pid) -> Option<DetachedVariant> {
        let idx = self.entries.iter().position(|x| x.variant_pid == pid)?;
        Some(self.entries.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &DetachedVariant> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

use std::collections::HashMap;

use nix::unistd::Pid;

/// Maps every variant pid onto the synchronization group it belongs to: the ordered set of pids
/// that must be stopped and moved together. Every member of a group maps onto the same list.
#[derive(Debug, Default, Clone)]
pub struct PidMapping {
    groups: HashMap<Pid, Vec<Pid>>,
}

impl PidMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `pids` as one synchronization group. Any of the pids that were previously part of
    /// another group are removed from that group first.
    pub fn register_group(&mut self, pids: &[Pid]) {
        for pid in pids {
            self.remove(*pid);
        }

        let mut group: Vec<Pid> = Vec::with_capacity(pids.len());
        for pid in pids {
            if !group.contains(pid) {
                group.push(*pid);
            }
        }

        for pid in &group {
            self.groups.insert(*pid, group.clone());
        }
    }

    /// Add `new_pid` to the group of `member`. If `member` has no group, a new group containing
    /// both pids is created.
    pub fn join_group(&mut self, member: Pid, new_pid: Pid) {
        let mut group = self
            .groups
            .get(&member)
            .cloned()
            .unwrap_or_else(|| vec![member]);
        if !group.contains(&new_pid) {
            group.push(new_pid);
        }
        self.register_group(&group);
    }

    /// Remove `pid` from the mapping and from its group. Returns `false` if the pid wasn't mapped.
    pub fn remove(&mut self, pid: Pid) -> bool {
        let Some(group) = self.groups.remove(&pid) else {
            return false;
        };

        let remaining: Vec<Pid> = group.into_iter().filter(|x| *x != pid).collect();
        for member in &remaining {
            self.groups.insert(*member, remaining.clone());
        }

        true
    }

    /// The synchronization group of `pid`, if it was registered.
    pub fn group_of(&self, pid: Pid) -> Option<&[Pid]> {
        self.groups.get(&pid).map(Vec::as_slice)
    }

    /// The synchronization group of `pid`, treating an unregistered pid as a group of its own.
    pub fn group_or_self(&self, pid: Pid) -> Vec<Pid> {
        self.group_of(pid)
            .map(<[Pid]>::to_vec)
            .unwrap_or_else(|| vec![pid])
    }

    pub fn same_group(&self, a: Pid, b: Pid) -> bool {
        a == b || self.group_of(a).map(|g| g.contains(&b)).unwrap_or(false)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.groups.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

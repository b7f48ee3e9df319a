use std::collections::{HashMap, HashSet};

/// Per-pid bookkeeping that survives between scan cycles. Everything else
/// about a process is rebuilt fresh from the OS each poll.
#[derive(Debug, Clone, Default)]
pub struct PidBook {
    pub prev_cpu_seconds: Option<f64>,
    pub prev_sample_ms: Option<u64>,
    pub zombie_streak: u32,
    pub stale_streak: u32,
}

/// Set of pids explicitly registered as owned by this application: the
/// backend server plus workers discovered as its live children. Membership
/// is never inferred from role classification.
#[derive(Debug, Default)]
pub struct ManagedPidRegistry {
    backend_pid: Option<u32>,
    child_pids: HashSet<u32>,
    books: HashMap<u32, PidBook>,
}

impl ManagedPidRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend_pid(&self) -> Option<u32> {
        self.backend_pid
    }

    pub fn set_backend_pid(&mut self, pid: u32) {
        if self.backend_pid != Some(pid) {
            log::info!("registry: managed backend pid set to {}", pid);
        }
        self.backend_pid = Some(pid);
    }

    /// Clears the backend registration if it matches the given pid. The
    /// worker set is cleared with it: children of a gone backend are no
    /// longer ours to protect.
    pub fn clear_backend_pid(&mut self, pid: u32) -> bool {
        if self.backend_pid == Some(pid) {
            log::info!("registry: managed backend pid {} cleared", pid);
            self.backend_pid = None;
            self.child_pids.clear();
            true
        } else {
            false
        }
    }

    pub fn register_child(&mut self, pid: u32) -> bool {
        if Some(pid) == self.backend_pid {
            return false;
        }
        let added = self.child_pids.insert(pid);
        if added {
            log::info!("registry: managed child pid {} registered", pid);
        }
        added
    }

    pub fn is_managed(&self, pid: u32) -> bool {
        self.backend_pid == Some(pid) || self.child_pids.contains(&pid)
    }

    pub fn managed_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.backend_pid.into_iter().collect();
        pids.extend(self.child_pids.iter().copied());
        pids.sort_unstable();
        pids
    }

    pub fn book_mut(&mut self, pid: u32) -> &mut PidBook {
        self.books.entry(pid).or_default()
    }

    /// Drops bookkeeping and child membership for pids absent from the
    /// latest scan, so a reused pid never inherits stale counters. The
    /// backend registration itself is only ever cleared by the launcher.
    pub fn purge_absent(&mut self, live: &HashSet<u32>) {
        self.books.retain(|pid, _| live.contains(pid));
        let before = self.child_pids.len();
        self.child_pids.retain(|pid| live.contains(pid));
        if self.child_pids.len() != before {
            log::debug!(
                "registry: purged {} dead child pid(s)",
                before - self.child_pids.len()
            );
        }
        if let Some(pid) = self.backend_pid {
            if !live.contains(&pid) {
                log::warn!(
                    "registry: managed backend pid {} is not in the latest scan",
                    pid
                );
            }
        }
    }
}

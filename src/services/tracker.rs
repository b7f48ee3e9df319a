use regex::Regex;
use std::collections::{HashMap, HashSet};

use crate::models::{ProcessHealth, ProcessRole, RawProcessInfo, TrackedProcess, TrackerConfig};
use crate::services::registry::ManagedPidRegistry;

/// Classifies each scan cycle's raw process list by role and health.
/// Holds no per-process state of its own; streak counters and CPU-time
/// samples live in the registry so they can be purged on pid death.
pub struct ProcessTracker {
    config: TrackerConfig,
    backend_re: Option<Regex>,
}

impl ProcessTracker {
    pub fn new(config: TrackerConfig) -> Self {
        let backend_re = match Regex::new(&config.backend_pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                log::warn!(
                    "invalid backend pattern '{}', falling back to substring match: {}",
                    config.backend_pattern,
                    e
                );
                None
            }
        };
        Self { config, backend_re }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn matches_backend(&self, cmdline: &str) -> bool {
        match &self.backend_re {
            Some(re) => re.is_match(cmdline),
            None => cmdline.contains(&self.config.backend_pattern),
        }
    }

    /// One scan cycle: discovers children of managed pids, purges counters
    /// for pids gone from the table, computes windowed CPU percentages and
    /// classifies role and health with debouncing.
    ///
    /// `live_pids` is the full process table, not just the candidates:
    /// a candidate's parent (shell, init, launcher) rarely passes the
    /// candidate filter, and judging its liveness from the filtered list
    /// would orphan every shell-launched process.
    pub fn scan(
        &self,
        raw: &[RawProcessInfo],
        live_pids: &HashSet<u32>,
        gpu_memory_by_pid: &HashMap<u32, f64>,
        registry: &mut ManagedPidRegistry,
        now_ms: u64,
    ) -> Vec<TrackedProcess> {
        let scanned: HashSet<u32> = raw.iter().map(|p| p.pid).collect();

        // Child auto-discovery runs to a fixpoint so workers of workers
        // are picked up in a single scan.
        loop {
            let mut added = false;
            for proc in raw {
                if registry.is_managed(proc.pid) {
                    continue;
                }
                if let Some(parent) = proc.parent_pid {
                    if registry.is_managed(parent) && registry.register_child(proc.pid) {
                        added = true;
                    }
                }
            }
            if !added {
                break;
            }
        }

        registry.purge_absent(&scanned);

        let mut tracked = Vec::with_capacity(raw.len());
        for proc in raw {
            let managed = registry.is_managed(proc.pid);
            let gpu_memory_mb = gpu_memory_by_pid.get(&proc.pid).copied();

            let cpu_percent = {
                let book = registry.book_mut(proc.pid);
                let pct = match (book.prev_cpu_seconds, book.prev_sample_ms) {
                    (Some(prev_cpu), Some(prev_ms)) if now_ms > prev_ms => {
                        let elapsed = (now_ms - prev_ms) as f64 / 1000.0;
                        (((proc.cpu_seconds - prev_cpu) / elapsed) * 100.0).clamp(0.0, 100.0)
                            as f32
                    }
                    _ => 0.0,
                };
                book.prev_cpu_seconds = Some(proc.cpu_seconds);
                book.prev_sample_ms = Some(now_ms);
                pct
            };

            let role = if Some(proc.pid) == registry.backend_pid()
                || (managed && self.matches_backend(&proc.cmdline))
            {
                ProcessRole::BackendServer
            } else if managed {
                ProcessRole::ModelWorker
            } else {
                // an unmanaged backend look-alike is deliberately unknown
                ProcessRole::Unknown
            };

            // an inconsistent table (the process itself missing from the
            // live set) means no liveness data this cycle, not a dead parent
            let parent_dead = live_pids.contains(&proc.pid)
                && proc
                    .parent_pid
                    .map(|pp| !live_pids.contains(&pp))
                    .unwrap_or(false);
            let zombie_condition = parent_dead && !managed;
            let stale_condition = !managed
                && gpu_memory_mb.unwrap_or(0.0) > self.config.stale_gpu_floor_mb
                && cpu_percent <= self.config.stale_cpu_percent;

            let status = {
                let book = registry.book_mut(proc.pid);
                if zombie_condition {
                    book.zombie_streak += 1;
                } else {
                    book.zombie_streak = 0;
                }
                if stale_condition {
                    book.stale_streak += 1;
                } else {
                    book.stale_streak = 0;
                }

                if zombie_condition && book.zombie_streak >= self.config.zombie_cycles {
                    ProcessHealth::Zombie
                } else if stale_condition && book.stale_streak >= self.config.stale_cycles {
                    ProcessHealth::Stale
                } else {
                    ProcessHealth::Healthy
                }
            };

            tracked.push(TrackedProcess {
                pid: proc.pid,
                parent_pid: proc.parent_pid,
                role,
                cmdline: proc.cmdline.clone(),
                cpu_percent,
                memory_mb: proc.memory_mb,
                gpu_memory_mb,
                status,
                managed,
            });
        }

        tracked.sort_by_key(|p| p.pid);
        tracked
    }
}

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::models::{
    ActionOutcome, GpuSnapshot, ProcessHealth, ProcessRole, ReaperAction, ReaperConfig,
    ReaperConfigPatch, ReaperRule, TrackedProcess,
};
use crate::services::registry::ManagedPidRegistry;

const ACTION_LOG_CAP: usize = 200;

/// Confirmation state for one anomalous pid. Enumeration is racy, so a
/// single-sample anomaly never triggers termination: a pid must be seen
/// under the same rule on two consecutive cycles before it is acted on.
#[derive(Debug, Clone)]
struct Candidate {
    rule: ReaperRule,
    cycles: u32,
    acted: bool,
}

/// A confirmed candidate handed to the execution path.
#[derive(Debug, Clone)]
pub struct KillOrder {
    pub pid: u32,
    pub rule: ReaperRule,
    pub reason: String,
    pub memory_mb: Option<f64>,
}

/// Result of the safety checks that run before any signal is sent. A
/// `Logged` preflight has already appended its audit record.
#[derive(Debug, PartialEq, Eq)]
pub enum Preflight {
    Proceed,
    Logged(ActionOutcome),
}

pub struct Reaper {
    config: ReaperConfig,
    candidates: HashMap<u32, Candidate>,
    kill_times_ms: VecDeque<u64>,
    log: VecDeque<ReaperAction>,
}

impl Reaper {
    pub fn new(config: ReaperConfig) -> Self {
        Self {
            config,
            candidates: HashMap::new(),
            kill_times_ms: VecDeque::new(),
            log: VecDeque::with_capacity(ACTION_LOG_CAP),
        }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    pub fn update_config(&mut self, patch: ReaperConfigPatch) -> &ReaperConfig {
        self.config.apply(patch);
        log::info!("reaper config updated: {:?}", self.config);
        &self.config
    }

    pub fn log(&self) -> &VecDeque<ReaperAction> {
        &self.log
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn kills_in_window(&self, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(self.config.window_ms);
        self.kill_times_ms.iter().filter(|t| **t >= cutoff).count()
    }

    /// One evaluation cycle over the freshest snapshots. Advances the
    /// per-pid confirmation machine and returns the confirmed candidates;
    /// no signal is sent here.
    pub fn evaluate(
        &mut self,
        processes: &[TrackedProcess],
        gpu: Option<&GpuSnapshot>,
        port_owner: Option<u32>,
        registry: &ManagedPidRegistry,
    ) -> Vec<KillOrder> {
        if !self.config.enabled {
            return Vec::new();
        }

        let detections = self.detect(processes, gpu, port_owner, registry);

        // candidates not re-observed this cycle are dropped without action
        self.candidates.retain(|pid, _| detections.contains_key(pid));

        let mut orders = Vec::new();
        for (pid, (rule, reason, memory_mb)) in detections {
            let candidate = self.candidates.entry(pid).or_insert(Candidate {
                rule,
                cycles: 0,
                acted: false,
            });
            if candidate.rule != rule {
                // rule changed between cycles: confirmation starts over
                *candidate = Candidate {
                    rule,
                    cycles: 0,
                    acted: false,
                };
            }
            candidate.cycles += 1;

            if candidate.cycles >= 2 && !candidate.acted {
                candidate.acted = true;
                log::warn!(
                    "reaper: pid {} confirmed under rule {} ({})",
                    pid,
                    rule.as_str(),
                    reason
                );
                orders.push(KillOrder {
                    pid,
                    rule,
                    reason,
                    memory_mb,
                });
            }
        }

        orders.sort_by_key(|o| (o.rule, o.pid));
        orders
    }

    /// Detection pass. All enabled rules are evaluated and unioned; when
    /// several rules flag the same pid, the one earliest in precedence
    /// order wins the log line.
    fn detect(
        &self,
        processes: &[TrackedProcess],
        gpu: Option<&GpuSnapshot>,
        port_owner: Option<u32>,
        registry: &ManagedPidRegistry,
    ) -> BTreeMap<u32, (ReaperRule, String, Option<f64>)> {
        let mut detections: BTreeMap<u32, (ReaperRule, String, Option<f64>)> = BTreeMap::new();
        let mut flag = |pid: u32, rule: ReaperRule, reason: String, mem: Option<f64>| {
            detections.entry(pid).or_insert((rule, reason, mem));
        };

        if self.config.rule_enabled(ReaperRule::OrphanKill) {
            for p in processes {
                if p.status == ProcessHealth::Zombie && !registry.is_managed(p.pid) {
                    flag(
                        p.pid,
                        ReaperRule::OrphanKill,
                        "unmanaged process outlived its parent".to_string(),
                        p.gpu_memory_mb,
                    );
                }
            }
        }

        if self.config.rule_enabled(ReaperRule::DuplicateModel) {
            if let Some(gpu) = gpu {
                let models: Vec<_> = gpu
                    .processes
                    .iter()
                    .filter(|p| p.used_memory_mb > self.config.model_memory_floor_mb)
                    .collect();
                if models.len() > 1 {
                    for m in models.iter().filter(|m| !registry.is_managed(m.pid)) {
                        flag(
                            m.pid,
                            ReaperRule::DuplicateModel,
                            format!(
                                "{} model-sized gpu processes; pid {} is not managed ({:.0}MB)",
                                models.len(),
                                m.pid,
                                m.used_memory_mb
                            ),
                            Some(m.used_memory_mb),
                        );
                    }
                }
            }
        }

        if self.config.rule_enabled(ReaperRule::PortSquatter) {
            if let Some(owner) = port_owner {
                if !registry.is_managed(owner) {
                    flag(
                        owner,
                        ReaperRule::PortSquatter,
                        format!(
                            "pid {} is bound to backend port {} but is not the registered backend",
                            owner, self.config.backend_port
                        ),
                        None,
                    );
                }
            }
        }

        if self.config.rule_enabled(ReaperRule::StaleWorker) {
            for p in processes {
                if p.status == ProcessHealth::Stale && !registry.is_managed(p.pid) {
                    flag(
                        p.pid,
                        ReaperRule::StaleWorker,
                        "unmanaged gpu-resident process with no cpu activity".to_string(),
                        p.gpu_memory_mb,
                    );
                }
            }
        }

        if self.config.rule_enabled(ReaperRule::VramHog) {
            if let Some(gpu) = gpu {
                for gp in &gpu.processes {
                    if registry.is_managed(gp.pid)
                        || gp.used_memory_mb <= self.config.hog_memory_floor_mb
                    {
                        continue;
                    }
                    let role = processes
                        .iter()
                        .find(|p| p.pid == gp.pid)
                        .map(|p| p.role)
                        .unwrap_or(ProcessRole::Unknown);
                    if role == ProcessRole::Unknown {
                        flag(
                            gp.pid,
                            ReaperRule::VramHog,
                            format!(
                                "unrecognised process holds {:.0}MB of gpu memory",
                                gp.used_memory_mb
                            ),
                            Some(gp.used_memory_mb),
                        );
                    }
                }
            }
        }

        detections
    }

    /// Safety checks immediately before the signal. Order matters: the
    /// circuit breaker is checked first, the managed-pid refusal is
    /// unconditional, dry-run logs without sending.
    pub fn preflight(
        &mut self,
        order: &KillOrder,
        registry: &ManagedPidRegistry,
        now_ms: u64,
    ) -> Preflight {
        let cutoff = now_ms.saturating_sub(self.config.window_ms);
        while matches!(self.kill_times_ms.front(), Some(t) if *t < cutoff) {
            self.kill_times_ms.pop_front();
        }
        if self.kill_times_ms.len() >= self.config.max_kills_per_window as usize {
            self.record(
                order,
                ActionOutcome::SkippedSafety,
                format!(
                    "kill rate limit reached ({} in {}ms window)",
                    self.kill_times_ms.len(),
                    self.config.window_ms
                ),
                now_ms,
            );
            return Preflight::Logged(ActionOutcome::SkippedSafety);
        }

        if registry.is_managed(order.pid) {
            self.record(
                order,
                ActionOutcome::SkippedSafety,
                "target is a managed process".to_string(),
                now_ms,
            );
            return Preflight::Logged(ActionOutcome::SkippedSafety);
        }

        if self.config.dry_run {
            self.record(order, ActionOutcome::DryRun, order.reason.clone(), now_ms);
            return Preflight::Logged(ActionOutcome::DryRun);
        }

        Preflight::Proceed
    }

    /// The target exited between detection and action.
    pub fn record_target_gone(&mut self, order: &KillOrder, now_ms: u64) {
        self.record(
            order,
            ActionOutcome::SkippedSafety,
            "target exited before the signal was sent".to_string(),
            now_ms,
        );
        self.candidates.remove(&order.pid);
    }

    /// Records signal delivery. A successful kill counts against the rate
    /// window and drops the candidate entry so a reused pid starts unseen.
    pub fn record_signal_result(&mut self, order: &KillOrder, delivered: bool, now_ms: u64) {
        if delivered {
            self.record(order, ActionOutcome::Killed, order.reason.clone(), now_ms);
            self.kill_times_ms.push_back(now_ms);
            self.candidates.remove(&order.pid);
        } else {
            self.record(
                order,
                ActionOutcome::Failed,
                "termination signal rejected by the os".to_string(),
                now_ms,
            );
        }
    }

    fn record(&mut self, order: &KillOrder, outcome: ActionOutcome, reason: String, now_ms: u64) {
        if self.log.len() == ACTION_LOG_CAP {
            self.log.pop_front();
        }
        self.log.push_back(ReaperAction {
            timestamp_ms: now_ms,
            target_pid: order.pid,
            rule: order.rule,
            reason,
            outcome,
            freed_memory_mb: match outcome {
                ActionOutcome::Killed => order.memory_mb,
                _ => None,
            },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GpuProcess;

    fn gpu_snapshot(procs: Vec<(u32, f64, bool)>) -> GpuSnapshot {
        GpuSnapshot {
            name: "RTX 4090".to_string(),
            memory_used_mb: procs.iter().map(|p| p.1).sum(),
            memory_total_mb: 24_564.0,
            memory_free_mb: 12_000.0,
            utilization_percent: 30.0,
            temperature_c: 55.0,
            timestamp_ms: 0,
            processes: procs
                .into_iter()
                .map(|(pid, mb, is_managed)| GpuProcess {
                    pid,
                    process_name: format!("proc-{}", pid),
                    used_memory_mb: mb,
                    is_managed,
                })
                .collect(),
            alerts: vec![],
        }
    }

    fn tracked(pid: u32, status: ProcessHealth, role: ProcessRole, managed: bool) -> TrackedProcess {
        TrackedProcess {
            pid,
            parent_pid: Some(1),
            role,
            cmdline: format!("proc-{}", pid),
            cpu_percent: 0.0,
            memory_mb: 100.0,
            gpu_memory_mb: None,
            status,
            managed,
        }
    }

    #[test]
    fn duplicate_model_flags_only_the_unmanaged_process() {
        let mut reaper = Reaper::new(ReaperConfig::default());
        let mut registry = ManagedPidRegistry::new();
        registry.set_backend_pid(600);

        let gpu = gpu_snapshot(vec![(500, 5_000.0, false), (600, 6_000.0, true)]);

        let first = reaper.evaluate(&[], Some(&gpu), None, &registry);
        assert!(first.is_empty(), "first sighting must not confirm");

        let second = reaper.evaluate(&[], Some(&gpu), None, &registry);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].pid, 500);
        assert_eq!(second[0].rule, ReaperRule::DuplicateModel);

        // execution: pid 500 killed, pid 600 untouched
        assert_eq!(reaper.preflight(&second[0], &registry, 10_000), Preflight::Proceed);
        reaper.record_signal_result(&second[0], true, 10_000);
        assert_eq!(reaper.log().len(), 1);
        assert_eq!(reaper.log()[0].outcome, ActionOutcome::Killed);
        assert_eq!(reaper.log()[0].freed_memory_mb, Some(5_000.0));
    }

    #[test]
    fn single_sighting_then_absence_produces_no_action() {
        let mut reaper = Reaper::new(ReaperConfig::default());
        let registry = ManagedPidRegistry::new();

        let procs = [tracked(700, ProcessHealth::Zombie, ProcessRole::Unknown, false)];
        assert!(reaper.evaluate(&procs, None, None, &registry).is_empty());
        assert_eq!(reaper.pending_candidates(), 1);

        // anomaly gone next cycle: candidate dropped, nothing logged
        assert!(reaper.evaluate(&[], None, None, &registry).is_empty());
        assert_eq!(reaper.pending_candidates(), 0);
        assert!(reaper.log().is_empty());
    }

    #[test]
    fn managed_pid_is_never_killed_even_when_ordered() {
        let mut reaper = Reaper::new(ReaperConfig::default());
        let mut registry = ManagedPidRegistry::new();
        registry.set_backend_pid(600);
        registry.register_child(601);

        // detection never flags a managed pid under any rule
        let procs = [
            tracked(600, ProcessHealth::Zombie, ProcessRole::BackendServer, true),
            tracked(601, ProcessHealth::Stale, ProcessRole::ModelWorker, true),
        ];
        let gpu = gpu_snapshot(vec![(600, 6_000.0, true), (601, 5_000.0, true)]);
        for _ in 0..3 {
            assert!(reaper
                .evaluate(&procs, Some(&gpu), Some(600), &registry)
                .is_empty());
        }

        // even a forged order is refused by preflight
        let order = KillOrder {
            pid: 600,
            rule: ReaperRule::VramHog,
            reason: "forged".to_string(),
            memory_mb: None,
        };
        assert_eq!(
            reaper.preflight(&order, &registry, 1_000),
            Preflight::Logged(ActionOutcome::SkippedSafety)
        );
        assert!(reaper
            .log()
            .iter()
            .all(|a| a.outcome != ActionOutcome::Killed));
    }

    #[test]
    fn rule_change_restarts_confirmation() {
        let mut reaper = Reaper::new(ReaperConfig::default());
        let registry = ManagedPidRegistry::new();

        let zombie = [tracked(700, ProcessHealth::Zombie, ProcessRole::Unknown, false)];
        let stale = [tracked(700, ProcessHealth::Stale, ProcessRole::Unknown, false)];

        assert!(reaper.evaluate(&zombie, None, None, &registry).is_empty());
        // second cycle under a different rule must not confirm
        assert!(reaper.evaluate(&stale, None, None, &registry).is_empty());
        // same rule again: second consecutive stale cycle confirms
        let orders = reaper.evaluate(&stale, None, None, &registry);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].rule, ReaperRule::StaleWorker);
    }

    #[test]
    fn steady_state_emits_no_further_orders() {
        let mut reaper = Reaper::new(ReaperConfig::default());
        let registry = ManagedPidRegistry::new();
        let procs = [tracked(700, ProcessHealth::Zombie, ProcessRole::Unknown, false)];

        assert!(reaper.evaluate(&procs, None, None, &registry).is_empty());
        assert_eq!(reaper.evaluate(&procs, None, None, &registry).len(), 1);
        // unchanged snapshots afterwards: candidate already acted
        for _ in 0..5 {
            assert!(reaper.evaluate(&procs, None, None, &registry).is_empty());
        }
    }

    #[test]
    fn rate_limiter_caps_kills_per_window() {
        let config = ReaperConfig {
            max_kills_per_window: 2,
            ..ReaperConfig::default()
        };
        let mut reaper = Reaper::new(config);
        let registry = ManagedPidRegistry::new();

        for pid in [701, 702, 703] {
            let order = KillOrder {
                pid,
                rule: ReaperRule::OrphanKill,
                reason: "test".to_string(),
                memory_mb: None,
            };
            match reaper.preflight(&order, &registry, 1_000) {
                Preflight::Proceed => reaper.record_signal_result(&order, true, 1_000),
                Preflight::Logged(outcome) => {
                    assert_eq!(pid, 703, "only the third kill should be throttled");
                    assert_eq!(outcome, ActionOutcome::SkippedSafety);
                }
            }
        }
        assert_eq!(reaper.kills_in_window(1_000), 2);

        // window expiry frees the breaker
        let order = KillOrder {
            pid: 704,
            rule: ReaperRule::OrphanKill,
            reason: "test".to_string(),
            memory_mb: None,
        };
        assert_eq!(
            reaper.preflight(&order, &registry, 1_000 + reaper.config().window_ms + 1),
            Preflight::Proceed
        );
    }

    #[test]
    fn dry_run_logs_without_sending() {
        let config = ReaperConfig {
            dry_run: true,
            ..ReaperConfig::default()
        };
        let mut reaper = Reaper::new(config);
        let registry = ManagedPidRegistry::new();

        let order = KillOrder {
            pid: 700,
            rule: ReaperRule::StaleWorker,
            reason: "test".to_string(),
            memory_mb: Some(3_000.0),
        };
        assert_eq!(
            reaper.preflight(&order, &registry, 1_000),
            Preflight::Logged(ActionOutcome::DryRun)
        );
        assert_eq!(reaper.log().len(), 1);
        assert_eq!(reaper.log()[0].outcome, ActionOutcome::DryRun);
        assert_eq!(reaper.log()[0].freed_memory_mb, None);
        assert_eq!(reaper.kills_in_window(1_000), 0);
    }

    #[test]
    fn port_squatter_detection_spares_the_backend() {
        let mut reaper = Reaper::new(ReaperConfig::default());
        let mut registry = ManagedPidRegistry::new();
        registry.set_backend_pid(600);

        // the registered backend owns its port: nothing to do
        assert!(reaper.evaluate(&[], None, Some(600), &registry).is_empty());
        assert!(reaper.evaluate(&[], None, Some(600), &registry).is_empty());
        assert_eq!(reaper.pending_candidates(), 0);

        // a squatter on the same port confirms after two cycles
        assert!(reaper.evaluate(&[], None, Some(999), &registry).is_empty());
        let orders = reaper.evaluate(&[], None, Some(999), &registry);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].pid, 999);
        assert_eq!(orders[0].rule, ReaperRule::PortSquatter);
    }

    #[test]
    fn vram_hog_requires_unknown_role() {
        let mut reaper = Reaper::new(ReaperConfig::default());
        let registry = ManagedPidRegistry::new();
        let gpu = gpu_snapshot(vec![(800, 3_000.0, false)]);

        // recognised as a worker elsewhere: not a hog
        let known = [tracked(800, ProcessHealth::Healthy, ProcessRole::ModelWorker, false)];
        assert!(reaper.evaluate(&known, Some(&gpu), None, &registry).is_empty());
        assert!(reaper.evaluate(&known, Some(&gpu), None, &registry).is_empty());

        // absent from the tracker entirely: treated as unknown
        assert!(reaper.evaluate(&[], Some(&gpu), None, &registry).is_empty());
        let orders = reaper.evaluate(&[], Some(&gpu), None, &registry);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].rule, ReaperRule::VramHog);
    }

    #[test]
    fn disabled_rule_is_skipped() {
        let mut config = ReaperConfig::default();
        config.rules.insert(ReaperRule::OrphanKill, false);
        let mut reaper = Reaper::new(config);
        let registry = ManagedPidRegistry::new();

        let procs = [tracked(700, ProcessHealth::Zombie, ProcessRole::Unknown, false)];
        for _ in 0..3 {
            assert!(reaper.evaluate(&procs, None, None, &registry).is_empty());
        }
        assert_eq!(reaper.pending_candidates(), 0);
    }

    #[test]
    fn target_gone_before_signal_is_a_safety_skip() {
        let mut reaper = Reaper::new(ReaperConfig::default());
        let registry = ManagedPidRegistry::new();
        let procs = [tracked(700, ProcessHealth::Zombie, ProcessRole::Unknown, false)];

        reaper.evaluate(&procs, None, None, &registry);
        let orders = reaper.evaluate(&procs, None, None, &registry);
        assert_eq!(reaper.preflight(&orders[0], &registry, 1_000), Preflight::Proceed);
        reaper.record_target_gone(&orders[0], 1_000);

        assert_eq!(reaper.log()[0].outcome, ActionOutcome::SkippedSafety);
        assert_eq!(reaper.kills_in_window(1_000), 0);
        assert_eq!(reaper.pending_candidates(), 0);
    }

    #[test]
    fn failed_signal_is_not_retried() {
        let mut reaper = Reaper::new(ReaperConfig::default());
        let registry = ManagedPidRegistry::new();
        let procs = [tracked(700, ProcessHealth::Zombie, ProcessRole::Unknown, false)];

        reaper.evaluate(&procs, None, None, &registry);
        let orders = reaper.evaluate(&procs, None, None, &registry);
        reaper.record_signal_result(&orders[0], false, 1_000);
        assert_eq!(reaper.log()[0].outcome, ActionOutcome::Failed);

        // candidate stays acted: the same anomaly does not re-order
        for _ in 0..3 {
            assert!(reaper.evaluate(&procs, None, None, &registry).is_empty());
        }
    }

    #[test]
    fn action_log_is_bounded() {
        let mut reaper = Reaper::new(ReaperConfig {
            max_kills_per_window: u32::MAX,
            ..ReaperConfig::default()
        });
        for i in 0..(ACTION_LOG_CAP as u32 + 50) {
            let order = KillOrder {
                pid: 10_000 + i,
                rule: ReaperRule::OrphanKill,
                reason: "test".to_string(),
                memory_mb: None,
            };
            reaper.record_signal_result(&order, true, i as u64);
        }
        assert_eq!(reaper.log().len(), ACTION_LOG_CAP);
        assert_eq!(reaper.log().front().unwrap().target_pid, 10_050);
    }
}

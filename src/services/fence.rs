use std::collections::HashSet;

use crate::models::{
    FenceConfig, FenceConfigPatch, FenceStatus, GpuSnapshot, LaunchDecision, TrackedProcess,
};

/// Concurrency and budget gate in front of model launches. The lock is a
/// plain mutual-exclusion flag: a second acquire fails immediately rather
/// than queueing.
pub struct Fence {
    config: FenceConfig,
    locked: bool,
    prompt_started_at_ms: Option<u64>,
}

impl Fence {
    pub fn new(config: FenceConfig) -> Self {
        Self {
            config,
            locked: false,
            prompt_started_at_ms: None,
        }
    }

    pub fn config(&self) -> &FenceConfig {
        &self.config
    }

    pub fn update_config(&mut self, patch: FenceConfigPatch) -> &FenceConfig {
        self.config.apply(patch);
        log::info!("fence config updated: {:?}", self.config);
        &self.config
    }

    fn active_models(&self, gpu: Option<&GpuSnapshot>) -> u32 {
        gpu.map(|g| {
            g.processes
                .iter()
                .filter(|p| p.used_memory_mb > self.config.model_memory_floor_mb)
                .count() as u32
        })
        .unwrap_or(0)
    }

    /// Gate consulted by the launcher before spawning a new model process.
    pub fn can_launch_model(&self, gpu: Option<&GpuSnapshot>) -> LaunchDecision {
        if self.locked {
            return LaunchDecision::deny("launch lock is held by another operation");
        }
        let active = self.active_models(gpu);
        if active >= self.config.max_concurrent_models {
            return LaunchDecision::deny(format!(
                "{} model-sized gpu process(es) already resident, limit is {}",
                active, self.config.max_concurrent_models
            ));
        }
        LaunchDecision::allow()
    }

    /// Pure recomputation over the latest snapshots. Managed VRAM is summed
    /// from the GPU process list, then topped up from the tracker: a managed
    /// process may carry a GPU attribution from an earlier snapshot after
    /// the driver stops listing it.
    pub fn evaluate(
        &self,
        processes: &[TrackedProcess],
        gpu: Option<&GpuSnapshot>,
        now_ms: u64,
    ) -> FenceStatus {
        let gpu_pids: HashSet<u32> = gpu
            .map(|g| g.processes.iter().map(|p| p.pid).collect())
            .unwrap_or_default();
        let mut managed_vram_mb: f64 = gpu
            .map(|g| {
                g.processes
                    .iter()
                    .filter(|p| p.is_managed)
                    .map(|p| p.used_memory_mb)
                    .sum()
            })
            .unwrap_or(0.0);
        managed_vram_mb += processes
            .iter()
            .filter(|p| p.managed && !gpu_pids.contains(&p.pid))
            .filter_map(|p| p.gpu_memory_mb)
            .sum::<f64>();

        let prompt_timed_out = self
            .prompt_started_at_ms
            .map(|start| now_ms.saturating_sub(start) > self.config.prompt_timeout_ms)
            .unwrap_or(false);

        FenceStatus {
            active_models: self.active_models(gpu),
            managed_vram_mb,
            over_budget: managed_vram_mb > self.config.vram_budget_mb,
            prompt_started_at_ms: self.prompt_started_at_ms,
            prompt_timed_out,
            locked: self.locked,
        }
    }

    /// Non-blocking acquire; returns false while held.
    pub fn acquire_lock(&mut self) -> bool {
        if self.locked {
            return false;
        }
        self.locked = true;
        true
    }

    pub fn release_lock(&mut self) {
        self.locked = false;
    }

    pub fn mark_prompt_started(&mut self, now_ms: u64) {
        self.prompt_started_at_ms = Some(now_ms);
    }

    pub fn mark_prompt_finished(&mut self) {
        self.prompt_started_at_ms = None;
    }

    /// Administrative override for stuck states: clears the lock and the
    /// prompt timer unconditionally.
    pub fn reset(&mut self) {
        if self.locked || self.prompt_started_at_ms.is_some() {
            log::warn!("fence reset: clearing lock and prompt timer");
        }
        self.locked = false;
        self.prompt_started_at_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GpuProcess, ProcessHealth, ProcessRole};

    fn tracked_managed(pid: u32, gpu_memory_mb: Option<f64>) -> TrackedProcess {
        TrackedProcess {
            pid,
            parent_pid: Some(1),
            role: ProcessRole::ModelWorker,
            cmdline: format!("python3 worker-{}.py", pid),
            cpu_percent: 10.0,
            memory_mb: 900.0,
            gpu_memory_mb,
            status: ProcessHealth::Healthy,
            managed: true,
        }
    }

    fn gpu(procs: Vec<(u32, f64, bool)>) -> GpuSnapshot {
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

    #[test]
    fn launch_denied_at_model_limit() {
        let fence = Fence::new(FenceConfig::default());
        let snapshot = gpu(vec![(600, 6_000.0, true)]);

        let decision = fence.can_launch_model(Some(&snapshot));
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("limit is 1"));
    }

    #[test]
    fn launch_allowed_below_limit() {
        let fence = Fence::new(FenceConfig::default());
        // small residents do not count as models
        let snapshot = gpu(vec![(600, 500.0, true)]);
        assert!(fence.can_launch_model(Some(&snapshot)).allowed);
        // no gpu data reads as no active models
        assert!(fence.can_launch_model(None).allowed);
    }

    #[test]
    fn lock_is_exclusive_and_non_blocking() {
        let mut fence = Fence::new(FenceConfig::default());
        assert!(fence.acquire_lock());
        assert!(!fence.acquire_lock());
        assert!(!fence.can_launch_model(None).allowed);

        fence.release_lock();
        assert!(fence.acquire_lock());
    }

    #[test]
    fn evaluate_sums_managed_vram_and_flags_budget() {
        let config = FenceConfig {
            vram_budget_mb: 10_000.0,
            ..FenceConfig::default()
        };
        let fence = Fence::new(config);
        let snapshot = gpu(vec![
            (600, 6_000.0, true),
            (601, 5_000.0, true),
            (999, 4_500.0, false),
        ]);

        let status = fence.evaluate(&[], Some(&snapshot), 1_000);
        assert_eq!(status.active_models, 3);
        assert_eq!(status.managed_vram_mb, 11_000.0);
        assert!(status.over_budget);
    }

    #[test]
    fn evaluate_attributes_tracker_vram_missing_from_gpu_list() {
        let config = FenceConfig {
            vram_budget_mb: 10_000.0,
            ..FenceConfig::default()
        };
        let fence = Fence::new(config);
        // worker 601 fell out of the driver's process list but still
        // carries its last attribution in the tracker
        let snapshot = gpu(vec![(600, 6_000.0, true)]);
        let processes = [
            tracked_managed(600, Some(6_000.0)),
            tracked_managed(601, Some(5_000.0)),
        ];

        let status = fence.evaluate(&processes, Some(&snapshot), 1_000);
        // 600 is counted once, from the gpu list
        assert_eq!(status.managed_vram_mb, 11_000.0);
        assert!(status.over_budget);
    }

    #[test]
    fn prompt_timeout_flags_after_window() {
        let mut fence = Fence::new(FenceConfig::default());
        fence.mark_prompt_started(1_000);

        let status = fence.evaluate(&[], None, 60_000);
        assert!(!status.prompt_timed_out);

        let status = fence.evaluate(&[], None, 1_000 + fence.config().prompt_timeout_ms + 1);
        assert!(status.prompt_timed_out);

        fence.mark_prompt_finished();
        let status = fence.evaluate(&[], None, 500_000);
        assert!(!status.prompt_timed_out);
    }

    #[test]
    fn reset_clears_lock_and_timer() {
        let mut fence = Fence::new(FenceConfig::default());
        fence.acquire_lock();
        fence.mark_prompt_started(1_000);

        fence.reset();
        let status = fence.evaluate(&[], None, 500_000);
        assert!(!status.locked);
        assert!(!status.prompt_timed_out);
        assert_eq!(status.prompt_started_at_ms, None);
        assert!(fence.acquire_lock());
    }

    #[test]
    fn config_patch_merges() {
        let mut fence = Fence::new(FenceConfig::default());
        fence.update_config(FenceConfigPatch {
            max_concurrent_models: Some(2),
            ..FenceConfigPatch::default()
        });
        assert_eq!(fence.config().max_concurrent_models, 2);
        assert_eq!(
            fence.config().prompt_timeout_ms,
            FenceConfig::default().prompt_timeout_ms
        );

        // two models resident now allowed, a third is not
        let snapshot = gpu(vec![(600, 6_000.0, true), (601, 5_000.0, true)]);
        assert!(!fence.can_launch_model(Some(&snapshot)).allowed);
        let snapshot = gpu(vec![(600, 6_000.0, true)]);
        assert!(fence.can_launch_model(Some(&snapshot)).allowed);
    }
}

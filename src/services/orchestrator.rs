use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

use crate::metrics::METRICS;
use crate::models::ProcessHealth;
use crate::services::inspector::SystemInspector;
use crate::services::reaper::{KillOrder, Preflight};
use crate::state::{now_ms, AppState, GuardianInner};

/// Starts the two repeating poll timers. Each timer body awaits its own
/// inspector query before the next tick is taken, so two polls of the same
/// kind can never overlap; the process cadence is the faster of the two.
pub fn start<I: SystemInspector + 'static>(
    state: AppState,
    inspector: Arc<I>,
    process_interval: Duration,
    resource_interval: Duration,
) {
    {
        let mut inner = state.lock().unwrap();
        inner.running = true;
        inner.events.info(format!(
            "guardian started (process poll {}s, resource poll {}s)",
            process_interval.as_secs(),
            resource_interval.as_secs()
        ));
    }

    let process_state = state.clone();
    let process_inspector = inspector.clone();
    tokio::spawn(async move {
        let mut ticker = interval(process_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !process_state.lock().unwrap().running {
                break;
            }
            poll_processes_once(&process_state, &*process_inspector).await;
        }
    });

    tokio::spawn(async move {
        let mut ticker = interval(resource_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !state.lock().unwrap().running {
                break;
            }
            poll_resources_once(&state, &*inspector).await;
        }
    });
}

/// Marks the daemon stopped. In-flight queries are not cancelled; their
/// results are discarded when they resolve against a stopped state.
pub fn stop(state: &AppState) {
    let mut inner = state.lock().unwrap();
    if inner.running {
        inner.running = false;
        inner.events.info("guardian stopped");
    }
}

/// One process-poll cycle: scan the process table, classify, cache. The
/// inspector query runs before the state lock is taken.
pub async fn poll_processes_once<I: SystemInspector>(state: &AppState, inspector: &I) {
    let raw = inspector.list_candidate_processes().await;
    let live = inspector.list_live_pids().await;
    let now = now_ms();

    let mut guard = state.lock().unwrap();
    if !guard.running {
        return;
    }
    let inner = &mut *guard;

    let gpu_memory_by_pid: HashMap<u32, f64> = inner
        .monitor
        .latest()
        .map(|s| {
            s.processes
                .iter()
                .map(|p| (p.pid, p.used_memory_mb))
                .collect()
        })
        .unwrap_or_default();

    inner.processes = inner
        .tracker
        .scan(&raw, &live, &gpu_memory_by_pid, &mut inner.registry, now);
    inner.last_process_poll_ms = Some(now);
}

/// One resource-poll cycle: GPU and port queries, snapshot ingestion, then
/// the reaper and fence evaluations that need the freshest numbers.
/// Confirmed kill orders are executed at the end, outside the state lock.
pub async fn poll_resources_once<I: SystemInspector>(state: &AppState, inspector: &I) {
    let backend_port = {
        let guard = state.lock().unwrap();
        if !guard.running {
            return;
        }
        guard.reaper.config().backend_port
    };

    let (info, samples, port_owner) = tokio::join!(
        inspector.query_gpu_info(),
        inspector.query_gpu_processes(),
        inspector.query_port_owner(backend_port)
    );
    let now = now_ms();

    let orders = {
        let mut guard = state.lock().unwrap();
        if !guard.running {
            return;
        }
        let inner = &mut *guard;

        let _ = inner.monitor.ingest(info, samples, &inner.registry, now);
        if let Some(snapshot) = inner.monitor.latest() {
            if snapshot.timestamp_ms == now {
                for alert in &snapshot.alerts {
                    METRICS
                        .alerts_total
                        .with_label_values(&[alert.alert_type.as_str()])
                        .inc();
                }
            }
        }

        let orders =
            inner
                .reaper
                .evaluate(&inner.processes, inner.monitor.latest(), port_owner, &inner.registry);
        inner.last_resource_poll_ms = Some(now);
        orders
    };

    for order in &orders {
        execute_order(state, inspector, order).await;
    }
}

async fn execute_order<I: SystemInspector>(state: &AppState, inspector: &I, order: &KillOrder) {
    let preflight = {
        let mut guard = state.lock().unwrap();
        if !guard.running {
            return;
        }
        let inner = &mut *guard;
        let preflight = inner.reaper.preflight(order, &inner.registry, now_ms());
        if let Preflight::Logged(outcome) = &preflight {
            METRICS.reaper_skips_total.inc();
            inner.events.warn(format!(
                "reaper: pid {} under rule {} resolved as {:?} without signal",
                order.pid,
                order.rule.as_str(),
                outcome
            ));
        }
        preflight
    };
    if preflight != Preflight::Proceed {
        return;
    }

    // the target may have exited between detection and action
    if !inspector.is_alive(order.pid).await {
        let mut guard = state.lock().unwrap();
        let inner = &mut *guard;
        inner.reaper.record_target_gone(order, now_ms());
        inner
            .events
            .info(format!("reaper: pid {} exited before the signal", order.pid));
        return;
    }

    let delivered = inspector.terminate(order.pid).await;
    let mut guard = state.lock().unwrap();
    let inner = &mut *guard;
    inner.reaper.record_signal_result(order, delivered, now_ms());
    if delivered {
        METRICS.reaper_kills_total.inc();
        if let Some(p) = inner.processes.iter_mut().find(|p| p.pid == order.pid) {
            p.status = ProcessHealth::Killed;
        }
        inner.events.warn(format!(
            "reaper: killed pid {} under rule {} ({})",
            order.pid,
            order.rule.as_str(),
            order.reason
        ));
    } else {
        inner.events.warn(format!(
            "reaper: termination signal to pid {} failed",
            order.pid
        ));
    }
}

/// Unified status view served by `GET /api/guardian/status`.
pub fn aggregate_status(inner: &GuardianInner) -> serde_json::Value {
    let now = now_ms();
    json!({
        "running": inner.running,
        "last_process_poll_ms": inner.last_process_poll_ms,
        "last_resource_poll_ms": inner.last_resource_poll_ms,
        "managed_pids": inner.registry.managed_pids(),
        "processes": inner.processes,
        "cuda": {
            "latest": inner.monitor.latest(),
            "history": inner.monitor.history(),
        },
        "reaper": {
            "config": inner.reaper.config(),
            "log": inner.reaper.log(),
            "kills_in_window": inner.reaper.kills_in_window(now),
            "pending_candidates": inner.reaper.pending_candidates(),
        },
        "fence": {
            "config": inner.fence.config(),
            "status": inner.fence.evaluate(&inner.processes, inner.monitor.latest(), now),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionOutcome, GpuInfo, GpuProcessSample, ReaperConfigPatch};
    use crate::services::inspector::FakeInspector;
    use crate::state::new_state;

    fn gpu_info(used: f64) -> GpuInfo {
        GpuInfo {
            name: "RTX 4090".to_string(),
            memory_used_mb: used,
            memory_total_mb: 24_564.0,
            memory_free_mb: 24_564.0 - used,
            utilization_percent: 40.0,
            temperature_c: 55.0,
        }
    }

    fn sample(pid: u32, mb: f64) -> GpuProcessSample {
        GpuProcessSample {
            pid,
            process_name: format!("proc-{}", pid),
            used_memory_mb: mb,
        }
    }

    fn duplicate_model_inspector() -> FakeInspector {
        let inspector = FakeInspector::default();
        *inspector.gpu_info.lock().unwrap() = Some(gpu_info(11_000.0));
        *inspector.gpu_processes.lock().unwrap() =
            vec![sample(500, 5_000.0), sample(600, 6_000.0)];
        inspector
    }

    #[tokio::test]
    async fn duplicate_model_is_killed_after_two_cycles() {
        let state = new_state();
        state.lock().unwrap().registry.set_backend_pid(600);
        let inspector = duplicate_model_inspector();

        poll_resources_once(&state, &inspector).await;
        assert!(inspector.terminated.lock().unwrap().is_empty());

        poll_resources_once(&state, &inspector).await;
        assert_eq!(*inspector.terminated.lock().unwrap(), vec![500]);

        let inner = state.lock().unwrap();
        let last = inner.reaper.log().back().unwrap();
        assert_eq!(last.target_pid, 500);
        assert_eq!(last.outcome, ActionOutcome::Killed);
    }

    #[tokio::test]
    async fn dry_run_never_reaches_the_terminate_capability() {
        let state = new_state();
        {
            let mut inner = state.lock().unwrap();
            inner.registry.set_backend_pid(600);
            inner.reaper.update_config(ReaperConfigPatch {
                dry_run: Some(true),
                ..ReaperConfigPatch::default()
            });
        }
        let inspector = duplicate_model_inspector();

        poll_resources_once(&state, &inspector).await;
        poll_resources_once(&state, &inspector).await;

        assert!(inspector.terminated.lock().unwrap().is_empty());
        let inner = state.lock().unwrap();
        assert_eq!(inner.reaper.log().back().unwrap().outcome, ActionOutcome::DryRun);
    }

    #[tokio::test]
    async fn target_exit_between_detection_and_action_is_skipped() {
        let state = new_state();
        state.lock().unwrap().registry.set_backend_pid(600);
        let inspector = duplicate_model_inspector();
        inspector.dead_pids.lock().unwrap().insert(500);

        poll_resources_once(&state, &inspector).await;
        poll_resources_once(&state, &inspector).await;

        assert!(inspector.terminated.lock().unwrap().is_empty());
        let inner = state.lock().unwrap();
        assert_eq!(
            inner.reaper.log().back().unwrap().outcome,
            ActionOutcome::SkippedSafety
        );
    }

    #[tokio::test]
    async fn gpu_tool_failure_degrades_without_stopping_the_cycle() {
        let state = new_state();
        let inspector = FakeInspector::default();

        poll_resources_once(&state, &inspector).await;

        let inner = state.lock().unwrap();
        assert!(inner.monitor.latest().is_none());
        assert!(inner.last_resource_poll_ms.is_some());
    }

    #[tokio::test]
    async fn stopped_daemon_discards_poll_results() {
        let state = new_state();
        let inspector = duplicate_model_inspector();
        stop(&state);

        poll_resources_once(&state, &inspector).await;
        poll_processes_once(&state, &inspector).await;

        let inner = state.lock().unwrap();
        assert!(inner.monitor.latest().is_none());
        assert!(inner.last_resource_poll_ms.is_none());
        assert!(inner.last_process_poll_ms.is_none());
    }

    #[tokio::test]
    async fn shell_launched_process_with_live_parent_is_never_reaped() {
        let state = new_state();
        let inspector = FakeInspector::default();
        // pid 700 was launched from an interactive shell (pid 42). The
        // shell is alive but is not itself a tracked candidate.
        *inspector.processes.lock().unwrap() = vec![crate::models::RawProcessInfo {
            pid: 700,
            parent_pid: Some(42),
            name: "python3".to_string(),
            cmdline: "python3 session.py".to_string(),
            cpu_seconds: 1.0,
            memory_mb: 900.0,
        }];
        *inspector.live_pids.lock().unwrap() = [700, 42].into_iter().collect();
        *inspector.gpu_info.lock().unwrap() = Some(gpu_info(2_000.0));

        for _ in 0..4 {
            poll_processes_once(&state, &inspector).await;
            poll_resources_once(&state, &inspector).await;
        }

        assert!(inspector.terminated.lock().unwrap().is_empty());
        let inner = state.lock().unwrap();
        assert_eq!(inner.processes[0].status, crate::models::ProcessHealth::Healthy);
        assert!(inner.reaper.log().is_empty());
    }

    #[tokio::test]
    async fn process_poll_attaches_gpu_memory_from_latest_snapshot() {
        let state = new_state();
        let inspector = duplicate_model_inspector();
        *inspector.processes.lock().unwrap() = vec![crate::models::RawProcessInfo {
            pid: 500,
            parent_pid: Some(1),
            name: "python3".to_string(),
            cmdline: "python3 rogue.py".to_string(),
            cpu_seconds: 1.0,
            memory_mb: 900.0,
        }];

        poll_resources_once(&state, &inspector).await;
        poll_processes_once(&state, &inspector).await;

        let inner = state.lock().unwrap();
        assert_eq!(inner.processes.len(), 1);
        assert_eq!(inner.processes[0].gpu_memory_mb, Some(5_000.0));
    }
}

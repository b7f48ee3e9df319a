use std::collections::VecDeque;

use crate::models::{
    Alert, AlertSeverity, AlertType, GpuHistoryEntry, GpuInfo, GpuProcess, GpuProcessSample,
    GpuSnapshot, MonitorConfig,
};
use crate::services::registry::ManagedPidRegistry;

const HISTORY_CAP: usize = 120;

/// Correlates GPU state against the managed registry, derives alerts from
/// the current and previous snapshot, and keeps a bounded rolling history.
pub struct CudaMonitor {
    config: MonitorConfig,
    latest: Option<GpuSnapshot>,
    history: VecDeque<GpuHistoryEntry>,
}

impl CudaMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            latest: None,
            history: VecDeque::with_capacity(HISTORY_CAP),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn latest(&self) -> Option<&GpuSnapshot> {
        self.latest.as_ref()
    }

    pub fn history(&self) -> &VecDeque<GpuHistoryEntry> {
        &self.history
    }

    /// Ingests one resource poll. `info` is absent when the GPU tool failed
    /// this cycle; the previous snapshot is kept so readers see its stale
    /// timestamp rather than a fabricated empty one.
    pub fn ingest(
        &mut self,
        info: Option<GpuInfo>,
        samples: Vec<GpuProcessSample>,
        registry: &ManagedPidRegistry,
        now_ms: u64,
    ) -> Option<&GpuSnapshot> {
        let info = match info {
            Some(info) => info,
            None => {
                log::debug!("gpu query returned no data this cycle");
                return self.latest.as_ref();
            }
        };

        let processes: Vec<GpuProcess> = samples
            .into_iter()
            .map(|s| GpuProcess {
                is_managed: registry.is_managed(s.pid),
                pid: s.pid,
                process_name: s.process_name,
                used_memory_mb: s.used_memory_mb,
            })
            .collect();

        let alerts = self.derive_alerts(&info, &processes, now_ms);
        for alert in &alerts {
            match alert.severity {
                AlertSeverity::Critical => log::error!("gpu alert: {}", alert.message),
                AlertSeverity::Warning => log::warn!("gpu alert: {}", alert.message),
                AlertSeverity::Info => log::info!("gpu alert: {}", alert.message),
            }
        }

        if self.history.len() == HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(GpuHistoryEntry {
            timestamp_ms: now_ms,
            memory_used_mb: info.memory_used_mb,
            utilization_percent: info.utilization_percent,
            temperature_c: info.temperature_c,
            process_count: processes.len(),
        });

        self.latest = Some(GpuSnapshot {
            name: info.name,
            memory_used_mb: info.memory_used_mb,
            memory_total_mb: info.memory_total_mb,
            memory_free_mb: info.memory_free_mb,
            utilization_percent: info.utilization_percent,
            temperature_c: info.temperature_c,
            timestamp_ms: now_ms,
            processes,
            alerts,
        });
        self.latest.as_ref()
    }

    fn derive_alerts(
        &self,
        info: &GpuInfo,
        processes: &[GpuProcess],
        now_ms: u64,
    ) -> Vec<Alert> {
        let mut alerts = Vec::new();

        if info.memory_used_mb > self.config.vram_budget_mb {
            alerts.push(Alert {
                alert_type: AlertType::OverBudget,
                severity: AlertSeverity::Warning,
                message: format!(
                    "gpu memory {:.0}MB exceeds budget {:.0}MB",
                    info.memory_used_mb, self.config.vram_budget_mb
                ),
                pid: None,
                timestamp_ms: now_ms,
            });
        }

        if info.temperature_c >= self.config.temp_critical_c {
            alerts.push(Alert {
                alert_type: AlertType::Thermal,
                severity: AlertSeverity::Critical,
                message: format!("gpu temperature {:.0}C at critical threshold", info.temperature_c),
                pid: None,
                timestamp_ms: now_ms,
            });
        } else if info.temperature_c >= self.config.temp_warning_c {
            alerts.push(Alert {
                alert_type: AlertType::Thermal,
                severity: AlertSeverity::Warning,
                message: format!("gpu temperature {:.0}C above warning threshold", info.temperature_c),
                pid: None,
                timestamp_ms: now_ms,
            });
        }

        for proc in processes {
            if !proc.is_managed && proc.used_memory_mb > self.config.unmanaged_noise_floor_mb {
                alerts.push(Alert {
                    alert_type: AlertType::UnmanagedProcess,
                    severity: AlertSeverity::Warning,
                    message: format!(
                        "unmanaged process {} (pid {}) holds {:.0}MB of gpu memory",
                        proc.process_name, proc.pid, proc.used_memory_mb
                    ),
                    pid: Some(proc.pid),
                    timestamp_ms: now_ms,
                });
            }
        }

        // growth with no managed process to attribute it to
        if let Some(prev) = &self.latest {
            let delta = info.memory_used_mb - prev.memory_used_mb;
            let managed_resident = processes.iter().any(|p| p.is_managed);
            if delta > self.config.leak_delta_mb && !managed_resident {
                alerts.push(Alert {
                    alert_type: AlertType::VramLeak,
                    severity: AlertSeverity::Warning,
                    message: format!(
                        "gpu memory grew {:.0}MB since last poll with no managed process resident",
                        delta
                    ),
                    pid: None,
                    timestamp_ms: now_ms,
                });
            }
        }

        alerts
    }
}

use serde::{Deserialize, Serialize};

/// Device-level row parsed from the GPU query tool.
#[derive(Debug, Clone, Serialize)]
pub struct GpuInfo {
    pub name: String,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub memory_free_mb: f64,
    pub utilization_percent: f32,
    pub temperature_c: f32,
}

/// Per-process row parsed from the GPU query tool, before registry stamping.
#[derive(Debug, Clone)]
pub struct GpuProcessSample {
    pub pid: u32,
    pub process_name: String,
    pub used_memory_mb: f64,
}

/// GPU-resident process with its managed flag resolved at snapshot time.
#[derive(Debug, Clone, Serialize)]
pub struct GpuProcess {
    pub pid: u32,
    pub process_name: String,
    pub used_memory_mb: f64,
    pub is_managed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertType {
    OverBudget,
    Thermal,
    UnmanagedProcess,
    VramLeak,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::OverBudget => "over-budget",
            AlertType::Thermal => "thermal",
            AlertType::UnmanagedProcess => "unmanaged-process",
            AlertType::VramLeak => "vram-leak",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Generated fresh each resource poll from the current and previous
/// snapshot; never persisted beyond the snapshot it is attached to.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub timestamp_ms: u64,
}

/// Immutable snapshot of GPU state at one resource poll.
#[derive(Debug, Clone, Serialize)]
pub struct GpuSnapshot {
    pub name: String,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub memory_free_mb: f64,
    pub utilization_percent: f32,
    pub temperature_c: f32,
    pub timestamp_ms: u64,
    pub processes: Vec<GpuProcess>,
    pub alerts: Vec<Alert>,
}

/// Summarized history entry retained in the rolling ring buffer.
#[derive(Debug, Clone, Serialize)]
pub struct GpuHistoryEntry {
    pub timestamp_ms: u64,
    pub memory_used_mb: f64,
    pub utilization_percent: f32,
    pub temperature_c: f32,
    pub process_count: usize,
}

/// Alert thresholds for the resource monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub vram_budget_mb: f64,
    pub temp_warning_c: f32,
    pub temp_critical_c: f32,
    /// GPU usage (MB) below which an unmanaged process is ignored as noise.
    pub unmanaged_noise_floor_mb: f64,
    /// Unattributed VRAM growth (MB) between two polls that raises a leak alert.
    pub leak_delta_mb: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            vram_budget_mb: 20_000.0,
            temp_warning_c: 85.0,
            temp_critical_c: 95.0,
            unmanaged_noise_floor_mb: 200.0,
            leak_delta_mb: 500.0,
        }
    }
}

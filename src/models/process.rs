use serde::{Deserialize, Serialize};

/// One row of the OS process table as reported by the system inspector.
#[derive(Debug, Clone)]
pub struct RawProcessInfo {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub name: String,
    pub cmdline: String,
    /// Accumulated CPU time in seconds since process start.
    pub cpu_seconds: f64,
    /// Working set in megabytes.
    pub memory_mb: f64,
}

/// Role assigned to a tracked process each scan cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessRole {
    BackendServer,
    ModelWorker,
    Unknown,
}

/// Health classification, debounced across scan cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessHealth {
    Healthy,
    Stale,
    Zombie,
    Killed,
}

/// Point-in-time view of one process of interest. Rebuilt from a live OS
/// scan every poll cycle; only the per-pid counters in the registry survive
/// between cycles.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedProcess {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub role: ProcessRole,
    pub cmdline: String,
    pub cpu_percent: f32,
    pub memory_mb: f64,
    /// Absent when the process is not GPU-resident.
    pub gpu_memory_mb: Option<f64>,
    pub status: ProcessHealth,
    pub managed: bool,
}

/// Tunables for role/health classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Regex matched against the command line to recognise the backend
    /// server signature. An unmanaged look-alike still classifies as unknown.
    pub backend_pattern: String,
    /// GPU residency floor (MB) below which a quiet process is not
    /// considered stale.
    pub stale_gpu_floor_mb: f64,
    /// CPU activity ceiling (percent) for the stale classification.
    pub stale_cpu_percent: f32,
    /// Consecutive cycles with a dead parent before an unmanaged process
    /// is classified zombie.
    pub zombie_cycles: u32,
    /// Consecutive idle cycles before an unmanaged GPU process is
    /// classified stale.
    pub stale_cycles: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            backend_pattern: r"(uvicorn|hypercorn).*(serve|server|app)|model[-_]server".to_string(),
            stale_gpu_floor_mb: 256.0,
            stale_cpu_percent: 1.0,
            zombie_cycles: 2,
            stale_cycles: 3,
        }
    }
}

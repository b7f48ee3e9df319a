pub mod fence;
pub mod gpu;
pub mod process;
pub mod reaper;

pub use fence::{FenceConfig, FenceConfigPatch, FenceStatus, LaunchDecision};
pub use gpu::{
    Alert, AlertSeverity, AlertType, GpuHistoryEntry, GpuInfo, GpuProcess, GpuProcessSample,
    GpuSnapshot, MonitorConfig,
};
pub use process::{ProcessHealth, ProcessRole, RawProcessInfo, TrackedProcess, TrackerConfig};
pub use reaper::{ActionOutcome, ReaperAction, ReaperConfig, ReaperConfigPatch, ReaperRule};

pub mod cuda_monitor;
pub mod fence;
pub mod inspector;
pub mod orchestrator;
pub mod reaper;
pub mod registry;
pub mod tracker;

pub use cuda_monitor::CudaMonitor;
pub use fence::Fence;
pub use inspector::{HostInspector, SystemInspector};
pub use reaper::Reaper;
pub use registry::ManagedPidRegistry;
pub use tracker::ProcessTracker;

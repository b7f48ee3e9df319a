use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::models::{
    FenceConfig, MonitorConfig, ReaperConfig, TrackedProcess, TrackerConfig,
};
use crate::services::cuda_monitor::CudaMonitor;
use crate::services::fence::Fence;
use crate::services::reaper::Reaper;
use crate::services::registry::ManagedPidRegistry;
use crate::services::tracker::ProcessTracker;

const EVENT_LOG_CAP: usize = 500;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventLine {
    pub timestamp_ms: u64,
    pub level: EventLevel,
    pub message: String,
}

/// Human-readable guardian event log, bounded ring.
#[derive(Default)]
pub struct EventLog {
    lines: VecDeque<EventLine>,
}

impl EventLog {
    pub fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::info!("{}", message);
        self.push(EventLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{}", message);
        self.push(EventLevel::Warn, message);
    }

    fn push(&mut self, level: EventLevel, message: String) {
        if self.lines.len() == EVENT_LOG_CAP {
            self.lines.pop_front();
        }
        self.lines.push_back(EventLine {
            timestamp_ms: now_ms(),
            level,
            message,
        });
    }

    pub fn lines(&self) -> &VecDeque<EventLine> {
        &self.lines
    }
}

/// The single guardian context object: every mutable collection the daemon
/// owns lives here, behind one mutex. Poll callbacks and administrative
/// calls are the only writers; nothing is persisted across restarts.
pub struct GuardianInner {
    pub running: bool,
    pub registry: ManagedPidRegistry,
    pub tracker: ProcessTracker,
    pub monitor: CudaMonitor,
    pub reaper: Reaper,
    pub fence: Fence,
    /// Latest classified process list, refreshed each process poll.
    pub processes: Vec<TrackedProcess>,
    pub last_process_poll_ms: Option<u64>,
    pub last_resource_poll_ms: Option<u64>,
    pub events: EventLog,
}

pub type AppState = Arc<Mutex<GuardianInner>>;

pub fn new_state() -> AppState {
    Arc::new(Mutex::new(GuardianInner {
        running: true,
        registry: ManagedPidRegistry::new(),
        tracker: ProcessTracker::new(TrackerConfig::default()),
        monitor: CudaMonitor::new(MonitorConfig::default()),
        reaper: Reaper::new(ReaperConfig::default()),
        fence: Fence::new(FenceConfig::default()),
        processes: Vec::new(),
        last_process_poll_ms: None,
        last_resource_poll_ms: None,
        events: EventLog::default(),
    }))
}

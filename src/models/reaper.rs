use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Anomaly rules, in fixed precedence order. All enabled rules are
/// evaluated every cycle; precedence only decides which rule a pid is
/// logged under when several match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReaperRule {
    OrphanKill,
    DuplicateModel,
    PortSquatter,
    StaleWorker,
    VramHog,
}

impl ReaperRule {
    pub const ALL: [ReaperRule; 5] = [
        ReaperRule::OrphanKill,
        ReaperRule::DuplicateModel,
        ReaperRule::PortSquatter,
        ReaperRule::StaleWorker,
        ReaperRule::VramHog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReaperRule::OrphanKill => "orphan-kill",
            ReaperRule::DuplicateModel => "duplicate-model",
            ReaperRule::PortSquatter => "port-squatter",
            ReaperRule::StaleWorker => "stale-worker",
            ReaperRule::VramHog => "vram-hog",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionOutcome {
    Killed,
    Failed,
    SkippedSafety,
    DryRun,
}

/// Immutable audit record for one reaper decision, including skips.
#[derive(Debug, Clone, Serialize)]
pub struct ReaperAction {
    pub timestamp_ms: u64,
    pub target_pid: u32,
    pub rule: ReaperRule,
    pub reason: String,
    pub outcome: ActionOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freed_memory_mb: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    pub enabled: bool,
    pub dry_run: bool,
    pub max_kills_per_window: u32,
    pub window_ms: u64,
    /// A GPU process above this floor counts as a loaded model.
    pub model_memory_floor_mb: f64,
    /// Floor for the vram-hog rule.
    pub hog_memory_floor_mb: f64,
    /// Listening port owned by the registered backend server.
    pub backend_port: u16,
    pub rules: BTreeMap<ReaperRule, bool>,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        let rules = ReaperRule::ALL.iter().map(|r| (*r, true)).collect();
        Self {
            enabled: true,
            dry_run: false,
            max_kills_per_window: 3,
            window_ms: 60_000,
            model_memory_floor_mb: 4_000.0,
            hog_memory_floor_mb: 2_000.0,
            backend_port: 8000,
            rules,
        }
    }
}

impl ReaperConfig {
    pub fn rule_enabled(&self, rule: ReaperRule) -> bool {
        self.rules.get(&rule).copied().unwrap_or(true)
    }

    /// Merge-patch: only fields present in the patch are replaced, and
    /// rule toggles are merged entry by entry.
    pub fn apply(&mut self, patch: ReaperConfigPatch) {
        if let Some(v) = patch.enabled {
            self.enabled = v;
        }
        if let Some(v) = patch.dry_run {
            self.dry_run = v;
        }
        if let Some(v) = patch.max_kills_per_window {
            self.max_kills_per_window = v;
        }
        if let Some(v) = patch.window_ms {
            self.window_ms = v;
        }
        if let Some(v) = patch.model_memory_floor_mb {
            self.model_memory_floor_mb = v;
        }
        if let Some(v) = patch.hog_memory_floor_mb {
            self.hog_memory_floor_mb = v;
        }
        if let Some(v) = patch.backend_port {
            self.backend_port = v;
        }
        if let Some(rules) = patch.rules {
            for (rule, enabled) in rules {
                self.rules.insert(rule, enabled);
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReaperConfigPatch {
    pub enabled: Option<bool>,
    pub dry_run: Option<bool>,
    pub max_kills_per_window: Option<u32>,
    pub window_ms: Option<u64>,
    pub model_memory_floor_mb: Option<f64>,
    pub hog_memory_floor_mb: Option<f64>,
    pub backend_port: Option<u16>,
    pub rules: Option<BTreeMap<ReaperRule, bool>>,
}

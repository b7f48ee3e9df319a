use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FenceConfig {
    pub max_concurrent_models: u32,
    pub vram_budget_mb: f64,
    /// A GPU process above this floor counts as a loaded model.
    pub model_memory_floor_mb: f64,
    /// Warm-up window: prompt processing still running past this is flagged.
    pub prompt_timeout_ms: u64,
}

impl Default for FenceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_models: 1,
            vram_budget_mb: 20_000.0,
            model_memory_floor_mb: 4_000.0,
            prompt_timeout_ms: 120_000,
        }
    }
}

impl FenceConfig {
    pub fn apply(&mut self, patch: FenceConfigPatch) {
        if let Some(v) = patch.max_concurrent_models {
            self.max_concurrent_models = v;
        }
        if let Some(v) = patch.vram_budget_mb {
            self.vram_budget_mb = v;
        }
        if let Some(v) = patch.model_memory_floor_mb {
            self.model_memory_floor_mb = v;
        }
        if let Some(v) = patch.prompt_timeout_ms {
            self.prompt_timeout_ms = v;
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FenceConfigPatch {
    pub max_concurrent_models: Option<u32>,
    pub vram_budget_mb: Option<f64>,
    pub model_memory_floor_mb: Option<f64>,
    pub prompt_timeout_ms: Option<u64>,
}

/// Derived view, recomputed on every evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct FenceStatus {
    pub active_models: u32,
    pub managed_vram_mb: f64,
    pub over_budget: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_started_at_ms: Option<u64>,
    pub prompt_timed_out: bool,
    pub locked: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl LaunchDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

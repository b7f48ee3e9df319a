use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec_with_registry, register_counter_with_registry,
    register_gauge_with_registry, Counter, CounterVec, Encoder, Gauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

pub struct MetricsRegistry {
    registry: Registry,

    // Gauge metrics, refreshed from the latest cached snapshot on scrape
    pub gpu_memory_used_mb: Gauge,
    pub gpu_memory_total_mb: Gauge,
    pub gpu_utilization_percent: Gauge,
    pub gpu_temperature_celsius: Gauge,
    pub gpu_processes: Gauge,
    pub tracked_processes: Gauge,
    pub managed_processes: Gauge,
    pub fence_locked: Gauge,
    pub active_models: Gauge,

    // Counter metrics
    pub reaper_kills_total: Counter,
    pub reaper_skips_total: Counter,
    pub alerts_total: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let registry = Registry::new();

        let gpu_memory_used_mb = register_gauge_with_registry!(
            Opts::new("guardian_gpu_memory_used_mb", "GPU memory in use (MB)"),
            registry
        )
        .unwrap();

        let gpu_memory_total_mb = register_gauge_with_registry!(
            Opts::new("guardian_gpu_memory_total_mb", "Total GPU memory (MB)"),
            registry
        )
        .unwrap();

        let gpu_utilization_percent = register_gauge_with_registry!(
            Opts::new("guardian_gpu_utilization_percent", "GPU utilization percentage"),
            registry
        )
        .unwrap();

        let gpu_temperature_celsius = register_gauge_with_registry!(
            Opts::new("guardian_gpu_temperature_celsius", "GPU temperature"),
            registry
        )
        .unwrap();

        let gpu_processes = register_gauge_with_registry!(
            Opts::new("guardian_gpu_processes", "GPU-resident process count"),
            registry
        )
        .unwrap();

        let tracked_processes = register_gauge_with_registry!(
            Opts::new("guardian_tracked_processes", "Processes in the latest scan"),
            registry
        )
        .unwrap();

        let managed_processes = register_gauge_with_registry!(
            Opts::new("guardian_managed_processes", "Pids in the managed registry"),
            registry
        )
        .unwrap();

        let fence_locked = register_gauge_with_registry!(
            Opts::new("guardian_fence_locked", "Launch lock held (1) or free (0)"),
            registry
        )
        .unwrap();

        let active_models = register_gauge_with_registry!(
            Opts::new("guardian_active_models", "Model-sized GPU processes resident"),
            registry
        )
        .unwrap();

        let reaper_kills_total = register_counter_with_registry!(
            Opts::new("guardian_reaper_kills_total", "Processes terminated by the reaper"),
            registry
        )
        .unwrap();

        let reaper_skips_total = register_counter_with_registry!(
            Opts::new(
                "guardian_reaper_skips_total",
                "Reaper actions resolved without a signal"
            ),
            registry
        )
        .unwrap();

        let alerts_total = register_counter_vec_with_registry!(
            Opts::new("guardian_alerts_total", "Resource alerts by type"),
            &["type"],
            registry
        )
        .unwrap();

        Self {
            registry,
            gpu_memory_used_mb,
            gpu_memory_total_mb,
            gpu_utilization_percent,
            gpu_temperature_celsius,
            gpu_processes,
            tracked_processes,
            managed_processes,
            fence_locked,
            active_models,
            reaper_kills_total,
            reaper_skips_total,
            alerts_total,
        }
    }

    pub fn render(&self) -> Result<String, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

lazy_static! {
    pub static ref METRICS: Arc<MetricsRegistry> = Arc::new(MetricsRegistry::new());
}

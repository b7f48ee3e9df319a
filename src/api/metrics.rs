use actix_web::{web, HttpResponse, Responder};

use crate::metrics::METRICS;
use crate::state::{now_ms, AppState};

/// Prometheus scrape. Gauges are refreshed from the cached snapshots; the
/// counters are maintained by the orchestrator as events happen.
pub async fn get_metrics(data: web::Data<AppState>) -> impl Responder {
    {
        let inner = data.lock().unwrap();

        if let Some(snapshot) = inner.monitor.latest() {
            METRICS.gpu_memory_used_mb.set(snapshot.memory_used_mb);
            METRICS.gpu_memory_total_mb.set(snapshot.memory_total_mb);
            METRICS
                .gpu_utilization_percent
                .set(snapshot.utilization_percent as f64);
            METRICS
                .gpu_temperature_celsius
                .set(snapshot.temperature_c as f64);
            METRICS.gpu_processes.set(snapshot.processes.len() as f64);
        }

        METRICS.tracked_processes.set(inner.processes.len() as f64);
        METRICS
            .managed_processes
            .set(inner.registry.managed_pids().len() as f64);

        let fence = inner
            .fence
            .evaluate(&inner.processes, inner.monitor.latest(), now_ms());
        METRICS.fence_locked.set(if fence.locked { 1.0 } else { 0.0 });
        METRICS.active_models.set(fence.active_models as f64);
    }

    match METRICS.render() {
        Ok(metrics_text) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(metrics_text),
        Err(e) => {
            log::error!("Failed to render metrics: {}", e);
            HttpResponse::InternalServerError().body("Failed to render metrics")
        }
    }
}

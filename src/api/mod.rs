pub mod guardian;
pub mod metrics;
pub mod register;

pub use guardian::{
    cuda, cuda_history, event_log, fence_acquire, fence_can_launch, fence_release, fence_reset,
    fence_status, manual_kill, patch_fence_config, patch_reaper_config, processes, prompt_finished,
    prompt_started, reaper_log, status,
};
pub use metrics::get_metrics;
pub use register::{clear_backend, register_backend, register_child};

use actix_web::{HttpResponse, Responder};

pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy"
    }))
}

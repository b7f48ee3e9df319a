use actix_web::{web, App, HttpServer};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

mod api;
mod cli;
mod metrics;
mod models;
mod services;
mod state;

use api::{
    clear_backend, cuda, cuda_history, event_log, fence_acquire, fence_can_launch, fence_release,
    fence_reset, fence_status, get_metrics, health, manual_kill, patch_fence_config,
    patch_reaper_config, processes, prompt_finished, prompt_started, reaper_log, register_backend,
    register_child, status,
};
use cli::CommandArgs;
use services::inspector::HostInspector;
use services::orchestrator;
use state::new_state;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = CommandArgs::parse();
    let bind_address = format!("{}:{}", args.address, args.port);

    let state = new_state();
    let inspector = Arc::new(HostInspector::new(args.gpu_tool.clone()));

    orchestrator::start(
        state.clone(),
        inspector.clone(),
        Duration::from_secs(args.process_poll_secs),
        Duration::from_secs(args.resource_poll_secs),
    );

    print_banner(&args);

    let inspector_data = web::Data::from(inspector);
    let shutdown_state = state.clone();

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .app_data(inspector_data.clone())
            .route("/api/guardian/status", web::get().to(status))
            .route("/api/guardian/processes", web::get().to(processes))
            .route("/api/guardian/cuda", web::get().to(cuda))
            .route("/api/guardian/cuda/history", web::get().to(cuda_history))
            .route("/api/guardian/reaper/log", web::get().to(reaper_log))
            .route("/api/guardian/reaper/config", web::post().to(patch_reaper_config))
            .route("/api/guardian/fence/status", web::get().to(fence_status))
            .route("/api/guardian/fence/reset", web::post().to(fence_reset))
            .route("/api/guardian/fence/config", web::post().to(patch_fence_config))
            .route("/api/guardian/fence/can-launch", web::get().to(fence_can_launch))
            .route("/api/guardian/fence/acquire", web::post().to(fence_acquire))
            .route("/api/guardian/fence/release", web::post().to(fence_release))
            .route("/api/guardian/fence/prompt-started", web::post().to(prompt_started))
            .route("/api/guardian/fence/prompt-finished", web::post().to(prompt_finished))
            .route("/api/guardian/kill", web::post().to(manual_kill))
            .route("/api/guardian/log", web::get().to(event_log))
            .route("/api/guardian/backend/register", web::post().to(register_backend))
            .route("/api/guardian/backend/clear", web::post().to(clear_backend))
            .route("/api/guardian/child/register", web::post().to(register_child))
            .route("/metrics", web::get().to(get_metrics))
            .route("/health", web::get().to(health))
    })
    .bind(&bind_address)?
    .run()
    .await;

    orchestrator::stop(&shutdown_state);
    server
}

fn print_banner(args: &CommandArgs) {
    println!("╔═══════════════════════════════════════════════════════════╗");
    println!("║      Inference Guardian v0.1.0                            ║");
    println!("║      GPU & Process Supervisor                             ║");
    println!("╚═══════════════════════════════════════════════════════════╝");
    println!();
    println!("🚀 Server starting on http://{}:{}", args.address, args.port);
    println!();
    println!("📋 Available endpoints:");
    println!("  GET    /api/guardian/status          - Aggregated guardian status");
    println!("  GET    /api/guardian/processes       - Latest tracked processes");
    println!("  GET    /api/guardian/cuda            - Latest GPU snapshot");
    println!("  GET    /api/guardian/cuda/history    - GPU history ring");
    println!("  GET    /api/guardian/reaper/log      - Reaper audit log");
    println!("  POST   /api/guardian/reaper/config   - Patch reaper config");
    println!("  GET    /api/guardian/fence/status    - Fence status");
    println!("  POST   /api/guardian/fence/reset     - Clear fence lock & timer");
    println!("  POST   /api/guardian/kill            - Kill an unmanaged pid");
    println!("  GET    /api/guardian/log             - Guardian event log");
    println!("  GET    /metrics                      - Prometheus metrics");
    println!("  GET    /health                       - Health check");
    println!();
    println!("💡 Features:");
    println!("  • Process tracking & health classification (sysinfo)");
    println!("  • GPU memory/thermal monitoring ({})", args.gpu_tool);
    println!("  • Anomaly reaping with two-cycle confirmation");
    println!("  • Model launch fence & VRAM budget");
    println!("═══════════════════════════════════════════════════════════");
}

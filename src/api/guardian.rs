use actix_web::{web, HttpResponse, Responder};
use serde::Deserialize;

use crate::models::{FenceConfigPatch, ReaperConfigPatch};
use crate::services::inspector::{HostInspector, SystemInspector};
use crate::services::orchestrator::aggregate_status;
use crate::state::{now_ms, AppState};

pub async fn status(data: web::Data<AppState>) -> impl Responder {
    let inner = data.lock().unwrap();
    HttpResponse::Ok().json(aggregate_status(&inner))
}

pub async fn processes(data: web::Data<AppState>) -> impl Responder {
    let inner = data.lock().unwrap();
    HttpResponse::Ok().json(serde_json::json!({
        "last_poll_ms": inner.last_process_poll_ms,
        "processes": inner.processes,
    }))
}

pub async fn cuda(data: web::Data<AppState>) -> impl Responder {
    let inner = data.lock().unwrap();
    match inner.monitor.latest() {
        Some(snapshot) => HttpResponse::Ok().json(snapshot),
        None => HttpResponse::Ok().json(serde_json::json!({
            "status": "no-data",
            "message": "no gpu snapshot has been captured yet"
        })),
    }
}

pub async fn cuda_history(data: web::Data<AppState>) -> impl Responder {
    let inner = data.lock().unwrap();
    HttpResponse::Ok().json(inner.monitor.history())
}

pub async fn reaper_log(data: web::Data<AppState>) -> impl Responder {
    let inner = data.lock().unwrap();
    HttpResponse::Ok().json(serde_json::json!({
        "log": inner.reaper.log(),
        "kills_in_window": inner.reaper.kills_in_window(now_ms()),
        "config": inner.reaper.config(),
    }))
}

pub async fn patch_reaper_config(
    data: web::Data<AppState>,
    patch: web::Json<ReaperConfigPatch>,
) -> impl Responder {
    let mut inner = data.lock().unwrap();
    let config = inner.reaper.update_config(patch.into_inner()).clone();
    inner.events.info("reaper config patched");
    HttpResponse::Ok().json(config)
}

pub async fn fence_status(data: web::Data<AppState>) -> impl Responder {
    let inner = data.lock().unwrap();
    let status = inner
        .fence
        .evaluate(&inner.processes, inner.monitor.latest(), now_ms());
    HttpResponse::Ok().json(status)
}

pub async fn fence_reset(data: web::Data<AppState>) -> impl Responder {
    let mut inner = data.lock().unwrap();
    inner.fence.reset();
    inner.events.warn("fence reset by operator");
    HttpResponse::Ok().json(serde_json::json!({ "status": "reset" }))
}

pub async fn patch_fence_config(
    data: web::Data<AppState>,
    patch: web::Json<FenceConfigPatch>,
) -> impl Responder {
    let mut inner = data.lock().unwrap();
    let config = inner.fence.update_config(patch.into_inner()).clone();
    inner.events.info("fence config patched");
    HttpResponse::Ok().json(config)
}

pub async fn fence_can_launch(data: web::Data<AppState>) -> impl Responder {
    let inner = data.lock().unwrap();
    HttpResponse::Ok().json(inner.fence.can_launch_model(inner.monitor.latest()))
}

pub async fn fence_acquire(data: web::Data<AppState>) -> impl Responder {
    let mut inner = data.lock().unwrap();
    if inner.fence.acquire_lock() {
        inner.events.info("fence lock acquired");
        HttpResponse::Ok().json(serde_json::json!({ "acquired": true }))
    } else {
        HttpResponse::Conflict().json(serde_json::json!({
            "acquired": false,
            "message": "launch lock is already held"
        }))
    }
}

pub async fn fence_release(data: web::Data<AppState>) -> impl Responder {
    let mut inner = data.lock().unwrap();
    inner.fence.release_lock();
    inner.events.info("fence lock released");
    HttpResponse::Ok().json(serde_json::json!({ "released": true }))
}

pub async fn prompt_started(data: web::Data<AppState>) -> impl Responder {
    let mut inner = data.lock().unwrap();
    inner.fence.mark_prompt_started(now_ms());
    HttpResponse::Ok().json(serde_json::json!({ "status": "started" }))
}

pub async fn prompt_finished(data: web::Data<AppState>) -> impl Responder {
    let mut inner = data.lock().unwrap();
    inner.fence.mark_prompt_finished();
    HttpResponse::Ok().json(serde_json::json!({ "status": "finished" }))
}

#[derive(Deserialize)]
pub struct KillRequest {
    pub pid: u32,
}

/// Operator-initiated kill. Refuses managed pids outright; the result goes
/// to the event log, not the reaper audit log.
pub async fn manual_kill(
    data: web::Data<AppState>,
    inspector: web::Data<HostInspector>,
    req: web::Json<KillRequest>,
) -> impl Responder {
    let pid = req.pid;
    {
        let inner = data.lock().unwrap();
        if inner.registry.is_managed(pid) {
            return HttpResponse::Forbidden().json(serde_json::json!({
                "status": "refused",
                "message": format!("pid {} is managed and cannot be killed manually", pid)
            }));
        }
    }

    if !inspector.is_alive(pid).await {
        return HttpResponse::NotFound().json(serde_json::json!({
            "status": "not-found",
            "message": format!("pid {} is not alive", pid)
        }));
    }

    let delivered = inspector.terminate(pid).await;
    let mut inner = data.lock().unwrap();
    if delivered {
        inner.events.warn(format!("manual kill: pid {} terminated", pid));
        HttpResponse::Ok().json(serde_json::json!({ "status": "killed", "pid": pid }))
    } else {
        inner
            .events
            .warn(format!("manual kill: signal to pid {} failed", pid));
        HttpResponse::InternalServerError().json(serde_json::json!({
            "status": "failed",
            "message": format!("termination signal to pid {} was rejected", pid)
        }))
    }
}

pub async fn event_log(data: web::Data<AppState>) -> impl Responder {
    let inner = data.lock().unwrap();
    HttpResponse::Ok().json(inner.events.lines())
}

use actix_web::{web, HttpResponse, Responder};
use serde::Deserialize;

use crate::state::AppState;

/// Registration boundary consumed by the process launcher. These three
/// calls are the only external writes into the managed registry.

#[derive(Deserialize)]
pub struct PidRequest {
    pub pid: u32,
}

pub async fn register_backend(
    data: web::Data<AppState>,
    req: web::Json<PidRequest>,
) -> impl Responder {
    let mut inner = data.lock().unwrap();
    inner.registry.set_backend_pid(req.pid);
    inner
        .events
        .info(format!("launcher registered backend pid {}", req.pid));
    HttpResponse::Ok().json(serde_json::json!({
        "status": "registered",
        "backend_pid": req.pid
    }))
}

pub async fn clear_backend(
    data: web::Data<AppState>,
    req: web::Json<PidRequest>,
) -> impl Responder {
    let mut inner = data.lock().unwrap();
    if inner.registry.clear_backend_pid(req.pid) {
        inner
            .events
            .info(format!("launcher cleared backend pid {}", req.pid));
        HttpResponse::Ok().json(serde_json::json!({ "status": "cleared" }))
    } else {
        HttpResponse::NotFound().json(serde_json::json!({
            "status": "error",
            "message": format!("pid {} is not the registered backend", req.pid)
        }))
    }
}

pub async fn register_child(
    data: web::Data<AppState>,
    req: web::Json<PidRequest>,
) -> impl Responder {
    let mut inner = data.lock().unwrap();
    let added = inner.registry.register_child(req.pid);
    if added {
        inner
            .events
            .info(format!("launcher registered child pid {}", req.pid));
    }
    HttpResponse::Ok().json(serde_json::json!({
        "status": if added { "registered" } else { "already-registered" },
        "pid": req.pid
    }))
}

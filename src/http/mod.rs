//! Read-only observability endpoints.
//!
//! Runs on its own actix system thread so the ingestion runtime never
//! competes with scrapes. Health reports 200 for healthy/degraded and 503
//! for unhealthy.

use std::sync::Arc;

use actix_web::{web, App, HttpResponse, HttpServer};
use tracing::{error, info};

use crate::state::{AppContext, HealthStatus};

async fn health(ctx: web::Data<Arc<AppContext>>) -> HttpResponse {
    let snapshot = ctx.health();
    match snapshot.status {
        HealthStatus::Unhealthy => HttpResponse::ServiceUnavailable().json(snapshot),
        _ => HttpResponse::Ok().json(snapshot),
    }
}

async fn metrics(ctx: web::Data<Arc<AppContext>>) -> HttpResponse {
    HttpResponse::Ok().json(ctx.metrics())
}

async fn schedule(ctx: web::Data<Arc<AppContext>>) -> HttpResponse {
    HttpResponse::Ok().json(ctx.scheduler.snapshot())
}

async fn pool_utilization(ctx: web::Data<Arc<AppContext>>) -> HttpResponse {
    HttpResponse::Ok().json(ctx.pool.snapshot())
}

/// Active mailboxes joined with their status rows. Credentials never
/// leave the process.
async fn accounts(ctx: web::Data<Arc<AppContext>>) -> HttpResponse {
    match ctx.status.active_with_status() {
        Ok(rows) => {
            let view: Vec<serde_json::Value> = rows
                .into_iter()
                .map(|(mailbox, status)| {
                    serde_json::json!({
                        "mailbox_id": mailbox.id,
                        "address": mailbox.address,
                        "imap_host": mailbox.imap_host,
                        "owner": mailbox.owner,
                        "daily_limit": mailbox.daily_limit,
                        "status": status,
                    })
                })
                .collect();
            HttpResponse::Ok().json(view)
        }
        Err(e) => HttpResponse::InternalServerError().json(serde_json::json!({
            "error": e.to_string(),
        })),
    }
}

/// Serve the observability surface on a dedicated thread until the
/// process exits.
pub fn spawn(ctx: Arc<AppContext>, addr: String) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("observability-http".into())
        .spawn(move || {
            let system = actix_web::rt::System::new();
            let bind_addr = addr.clone();
            let result = system.block_on(async move {
                info!(addr = %bind_addr, "observability endpoints listening");
                HttpServer::new(move || {
                    App::new()
                        .app_data(web::Data::new(ctx.clone()))
                        .route("/health", web::get().to(health))
                        .route("/metrics", web::get().to(metrics))
                        .route("/schedule", web::get().to(schedule))
                        .route("/pool", web::get().to(pool_utilization))
                        .route("/accounts", web::get().to(accounts))
                })
                .workers(1)
                .disable_signals()
                .bind(&bind_addr)?
                .run()
                .await
            });
            if let Err(e) = result {
                error!(addr = %addr, error = %e, "observability server failed");
            }
        })
        .expect("failed to spawn observability thread")
}

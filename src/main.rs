use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mailpipe::config::{self, Settings};
use mailpipe::http;
use mailpipe::state::AppContext;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mailpipe=info,warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("starting mailpipe ...");

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("configuration error: {}", e);
            std::process::exit(1);
        }
    };
    let settings = Arc::new(config::init(settings).clone());

    let ctx = match AppContext::new(settings.clone()) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            error!("startup failed: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = ctx.start().await {
        error!("startup failed: {}", e);
        std::process::exit(1);
    }

    let _http = http::spawn(ctx.clone(), settings.http_addr.clone());

    wait_for_shutdown_signal().await;
    ctx.shutdown().await;
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

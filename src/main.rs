//! Chunk relay server binary.
//!
//! Clients split a file into numbered chunks and send them independently,
//! in any order. The server tracks each in-flight transmission, enforces a
//! size quota, reassembles the chunks once all have arrived and delivers the
//! result into the storage directory.

mod assembler;
mod atomic;
mod background;
mod chunk_store;
mod cleanup;
mod config;
mod delivery;
mod error;
mod http;
mod locking;
mod logging;
mod quota;
mod registry;
mod storage;
mod tempname;
mod tls;
mod upload;
mod version;

use axum::body::Body as AxumBody;
use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info};

use crate::background::spawn_background_tasks;
use crate::config::Args;
use crate::delivery::Delivery;
use crate::http::{build_cors_layer, make_request_span};
use crate::locking::LockManager;
use crate::registry::{RegistryConfig, TransmissionRegistry};
use crate::storage::Storage;
use crate::upload::GatewayConfig;

shadow!(build);

/// Starts the relay and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::new(PathBuf::from(&args.storage_dir)));
    storage.ensure_root().await?;
    info!(storage_dir = ?storage.root_path(), "storage ready");
    let registry = Arc::new(TransmissionRegistry::new(RegistryConfig {
        work_dir: args.work_dir(),
        max_transmission_size: args.max_transmission_size,
        max_chunks: args.max_chunks,
    }));
    registry.init().await?;
    let delivery = Arc::new(Delivery::new(storage, Arc::new(LockManager::new())));
    let gateway = Arc::new(GatewayConfig {
        client_id_prefix: args.client_id_prefix.clone(),
        max_transmission_size: args.max_transmission_size,
    });

    let mut app = Router::new()
        .route(
            "/api/upload/chunk",
            post(upload::upload_chunk).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/upload/abort", post(upload::abort_upload))
        .route("/api/upload/status", get(upload::upload_status))
        .route("/api/version", get(version::get_version_info))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<AxumBody>| make_request_span(request))
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(registry.clone()))
        .layer(Extension(delivery))
        .layer(Extension(gateway));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    let reaper = spawn_background_tasks(registry.clone(), Duration::from_secs(args.idle_ttl_secs));

    info!("🚀 Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.clone().into_make_service_with_connect_info::<SocketAddr>());

    let result = match args.https_port {
        Some(https_port) => {
            let https_addr = SocketAddr::new(host, https_port);
            let tls_config =
                tls::build_rustls_config(args.tls_cert.as_deref(), args.tls_key.as_deref(), host)
                    .await?;
            info!("🔒 Starting HTTPS server at {}", https_addr);
            let https_server = axum_server::bind_rustls(https_addr, tls_config)
                .handle(handle.clone())
                .serve(app.into_make_service_with_connect_info::<SocketAddr>());
            tokio::select! {
                result = http_server => result,
                result = https_server => result,
                _ = shutdown_signal(handle) => Ok(()),
            }
        }
        None => {
            tokio::select! {
                result = http_server => result,
                _ = shutdown_signal(handle) => Ok(()),
            }
        }
    };

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    registry.shutdown().await;
    result
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}

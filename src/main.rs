use anyhow::Result;
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod store;

use config::{AppConfig, Backend, Command};
use services::files_service::FilesService;
use store::{ObjectStore, memory::MemoryStore, s3::S3Store};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + command ---
    let (cfg, command) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting files-api with config: {:?}", cfg);

    // --- Initialize object store client ---
    let store: Arc<dyn ObjectStore> = match cfg.backend {
        Backend::S3 => Arc::new(S3Store::connect(&cfg.s3).await),
        Backend::Memory => {
            tracing::warn!("Using in-memory backend; files are lost on exit");
            Arc::new(MemoryStore::new(cfg.s3.bucket.clone()))
        }
    };
    let files = FilesService::new(store);

    // --- Handle bucket lifecycle modes ---
    match command {
        Command::InitBucket => {
            files.ensure_bucket().await?;
            tracing::info!("Bucket {} is ready.", files.bucket());
            return Ok(()); // exit after initialization
        }
        Command::DeleteBucket => {
            files.delete_bucket().await?;
            tracing::info!("Bucket {} deleted.", files.bucket());
            return Ok(());
        }
        Command::Serve => {}
    }

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(files);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

use axum::{response::Json, routing::get, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod assembly;
mod config;
mod db;
mod jobs;
mod media;

#[cfg(test)]
mod testing;

use assembly::{Assembler, AssemblerSettings};
use config::DaemonConfig;
use media::ffmpeg::FfmpegTranscoder;

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DaemonConfig::from_env()?;

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Arc::new(db::Database::new(&config.db_path)?);
    info!("Database initialized at {:?}", config.db_path);

    let job_manager = Arc::new(jobs::JobManager::new(db.clone()));

    let transcoder = Arc::new(FfmpegTranscoder::new(
        config.ffmpeg_bin.clone(),
        config.ffprobe_bin.clone(),
    ));
    let assembler = Arc::new(Assembler::new(
        db.clone(),
        transcoder,
        AssemblerSettings::from(&config),
    ));
    info!(
        work_dir = %config.work_dir.display(),
        max_parallel = config.max_parallel_transforms,
        "Assembler ready"
    );

    let job_processor = jobs::processor::JobProcessor::new(job_manager.clone(), assembler.clone());
    let _processor_handle = tokio::spawn(async move {
        job_processor.run().await;
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_credentials(false);

    let app = Router::new()
        .route("/health", get(health))
        .nest("/api", api::router(db, job_manager, assembler))
        .layer(cors);

    info!("Starting daemon server on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

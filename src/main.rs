//! # Transcription Worker - Main Application Entry Point
//!
//! Runs a local speech-to-text worker behind an Actix-web server. Recordings
//! are queued by file name, transcribed one at a time with a Whisper model
//! chosen per task, and results are pushed to subscribers as they arrive.
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (defaults, `config.toml`, environment)
//! - **error**: Domain errors and their HTTP mapping
//! - **storage**: The recordings directory and disk usage
//! - **transcription**: Queue, scheduler, executor, context cache, memory gate
//! - **whisper**: The candle Whisper engine behind the worker
//! - **handlers** / **websocket** / **health**: The HTTP and WebSocket surface
//! - **state**: What every request handler shares

mod config;
mod error;
mod handlers;
mod health;
mod state;
mod storage;
mod transcription;
mod websocket;
mod whisper;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use futures_util::StreamExt;
use state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use storage::Storage;
use transcription::{
    ModelCatalog, ResidentProcess, ResourceGate, SystemMemory, TranscriptionStatus,
    TranscriptionWorker,
};
use whisper::{DevicePreference, WhisperProvider};

/// ## What this function does:
/// 1. Loads configuration and sets up logging
/// 2. Builds the worker: catalog, memory gate, Whisper provider, storage
/// 3. Starts the update logger, which also starts task processing
/// 4. Serves HTTP and WebSocket until SIGINT/SIGTERM
/// 5. Cancels outstanding work before exiting
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting transcription-worker v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let catalog = Arc::new(ModelCatalog::whisper(
        &config.models.directory,
        &config.models.default_variant,
    )?);
    if !catalog.is_downloaded(catalog.default_variant()) {
        warn!(
            variant = %config.models.default_variant,
            directory = %config.models.directory.display(),
            "Default model variant is not on disk, transcriptions will fail until it is installed"
        );
    }

    let storage = Arc::new(Storage::new(&config.storage.recordings_dir));
    std::fs::create_dir_all(storage.recordings_dir())?;

    let gate = ResourceGate::new(Arc::new(SystemMemory::new()));
    let device_preference: DevicePreference = config.models.device.parse()?;
    let provider = Arc::new(WhisperProvider::new(device_preference));
    let device = provider.device_name();

    let worker = Arc::new(TranscriptionWorker::new(
        &config.worker,
        Arc::clone(&catalog),
        gate.clone(),
        provider,
        Arc::clone(&storage),
        Arc::new(ResidentProcess),
    ));
    worker.register_for_background_continuation();
    spawn_update_logger(&worker);

    let app_state = AppState::new(config.clone(), Arc::clone(&worker), storage, gate, device);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .configure(handlers::configure)
            .route("/ws/updates", web::get().to(websocket::updates_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        signal = wait_for_shutdown() => {
            signal?;
            info!("Shutdown signal received, stopping server...");
            let canceled = worker.cancel_all().await;
            info!(canceled, "Outstanding transcriptions canceled");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls the filter; defaults to
/// `transcription_worker=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transcription_worker=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Follows every published transcription and logs finished ones.
///
/// Subscribing is what starts the scheduler, so this runs for the life of
/// the process.
fn spawn_update_logger(worker: &TranscriptionWorker) {
    let mut updates = worker.transcription_updates();
    tokio::spawn(async move {
        while let Some(transcription) = updates.next().await {
            match &transcription.status {
                TranscriptionStatus::Done { .. } => info!(
                    task_id = %transcription.id,
                    file = %transcription.file_name,
                    variant = %transcription.model,
                    segments = transcription.segments.len(),
                    elapsed_ms = ?transcription.timings.elapsed_ms,
                    "Transcription finished: {}",
                    transcription.text()
                ),
                TranscriptionStatus::Error { message } => error!(
                    task_id = %transcription.id,
                    file = %transcription.file_name,
                    "Transcription failed: {}",
                    message
                ),
                TranscriptionStatus::Canceled => info!(
                    task_id = %transcription.id,
                    file = %transcription.file_name,
                    "Transcription canceled"
                ),
                _ => {}
            }
        }
        warn!("Transcription update stream closed");
    });
}

/// Resolves on the first SIGINT or SIGTERM.
async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

//! # Live Relay - Main Application Entry Point
//!
//! Relays browser voice sessions to a live streaming AI service and writes a summary
//! of each conversation when the client asks for one.
//!
//! ## Application Architecture:
//! - **config**: configuration (TOML file + environment variables)
//! - **state**: shared application state and HTTP metrics
//! - **websocket**: the client transport (`/ws`)
//! - **relay**: one session end to end: handshake, audio queue, event relay, teardown
//! - **session**: session model, audio queue and the session registry
//! - **upstream**: the live session protocol client
//! - **summary**: summarization prompt, model client and the at-most-once coordinator
//! - **backend**: profile and summary storage (HTTP service or local archive)
//! - **instructions**: system instruction loading and personalization
//! - **health**, **handlers**, **middleware**: the HTTP management surface
//! - **error**: custom error types and HTTP error responses

mod backend;
mod config;
mod error;
mod handlers;
mod health;
mod instructions;
mod middleware;
mod protocol;
mod relay;
mod session;
mod state;
mod summary;
mod upstream;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use backend::{ArchiveBackend, HttpBackend, ProfileBackend};
use config::AppConfig;
use relay::{RelayCounters, RelayServices};
use session::SessionRegistry;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use summary::GeminiSummarizer;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::GeminiLiveConnector;

/// Global shutdown signal, set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Builds the relay's collaborators** (live connector, summarizer, backend)
/// 3. **Configures the HTTP server** with middleware and routes
/// 4. **Handles graceful shutdown** when receiving system signals
///
/// Missing API keys fail here, before any client can connect.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting live-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let services = build_services(&config)?;
    info!(
        backend = services.backend.kind(),
        model = %config.upstream.model,
        features = ?config.features,
        "Relay services ready"
    );

    let app_state = AppState::new(config.clone(), services);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware executes in reverse order for responses
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .route("/ws", web::get().to(websocket::relay_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::get().to(handlers::get_session)),
            )
            .route("/health", web::get().to(health::health_check))
    })
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
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Build the collaborators every session shares.
///
/// ## Backend selection:
/// - `backend.base_url` set: the HTTP profile service
/// - otherwise: the local archive under `session.summaries_dir`
fn build_services(config: &AppConfig) -> Result<Arc<RelayServices>> {
    if config.upstream.api_key.is_none() {
        return Err(anyhow::anyhow!(
            "No live session API key configured (set GEMINI_API_KEY or APP__UPSTREAM__API_KEY)"
        ));
    }

    let summarizer = GeminiSummarizer::new(&config.summarizer, &config.upstream.model)?;

    let backend: Arc<dyn ProfileBackend> = match &config.backend.base_url {
        Some(base_url) => Arc::new(HttpBackend::new(base_url.clone(), &config.backend)?),
        None => {
            warn!(
                dir = %config.session.summaries_dir,
                "No backend URL configured; archiving summaries locally"
            );
            Arc::new(ArchiveBackend::new(&config.session.summaries_dir))
        }
    };

    Ok(Arc::new(RelayServices {
        registry: Arc::new(SessionRegistry::new(config.session.max_concurrent_sessions)),
        connector: Arc::new(GeminiLiveConnector::new(config.upstream.clone())),
        summarizer: Arc::new(summarizer),
        backend,
        base_instruction: instructions::load_system_instruction(&config.session.system_instruction_path),
        counters: Arc::new(RelayCounters::default()),
    }))
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "live_relay=trace")
/// - If not set, defaults to "live_relay=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Set up signal handlers for graceful shutdown (SIGTERM, SIGINT).
///
/// If a handler cannot be installed the server keeps running and can only be stopped
/// by killing the process.
fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown signal to be set, checking every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}

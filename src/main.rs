//! # Conversation Relay - Main Application Entry Point
//!
//! This is the main entry point for the conversation-relay web server.
//! Clients connect over a WebSocket, send text, and receive the spoken reply as MP3:
//! every message goes through a text generation backend and then a speech synthesis
//! backend, one message at a time per connection.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The entire application is asynchronous
//! - **Trait objects**: Backends are `Arc<dyn TextGenerator>` / `Arc<dyn SpeechSynthesizer>`
//! - **Result<T, E>**: Startup errors propagate with `?` and end the process
//! - **static**: The shutdown flag lives for the entire program duration
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **state**: Shared application state and metrics
//! - **registry**: Live WebSocket connections by client id
//! - **backends**: Text generation and speech synthesis clients
//! - **conversation**: Frame protocol and the per-connection pipeline
//! - **websocket**: WebSocket actor bridging frames to the pipeline
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request tracing spans and metrics
//! - **handlers**: Chat page and configuration endpoints
//! - **error**: Error types and HTTP error responses

mod backends;
mod config;
mod conversation;
mod error;
mod handlers;
mod health;
mod middleware;
mod registry;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::backends::{OpenAiSpeechSynthesizer, OpenAiTextGenerator};
use crate::config::AppConfig;
use crate::state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGTERM or SIGINT has been received.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Builds the backend clients** once, shared by every connection
/// 4. **Configures the HTTP server** with middleware, routes and the WebSocket endpoint
/// 5. **Handles graceful shutdown** when receiving system signals
#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting conversation-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        llm_model = %config.backend.llm_model,
        tts_model = %config.backend.tts_model,
        tts_voice = %config.backend.tts_voice,
        max_pending = ?config.conversation.max_pending,
        "Configuration loaded"
    );

    let generator = Arc::new(OpenAiTextGenerator::new(&config.backend)?);
    let synthesizer = Arc::new(OpenAiSpeechSynthesizer::new(&config.backend)?);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = AppState::new(config, generator, synthesizer);

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
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::<middleware::RelayRootSpan>::new())
            .route("/", web::get().to(handlers::get_interface))
            .route("/ws/{client_id}", web::get().to(websocket::conversation_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            // Also provide health check at root level for convenience
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
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

/// Initialize tracing.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "conversation_relay=trace")
/// - If not set, defaults to "conversation_relay=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conversation_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise the shutdown flag on either.
///
/// If the handlers cannot be installed the server keeps running and can only be
/// stopped by killing the process.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
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

/// Wait for the shutdown flag, checking every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}

//! HTTP server
//!
//! Serves the chat relay to the web client:
//! - `POST /chat-process` streams newline-delimited JSON chat fragments
//! - `POST /config`, `/session`, `/verify` for client bootstrap and diagnostics
//! - `GET /health`
//!
//! Every route is available both at the root and under `/api`.

mod handlers;
mod response;
mod stream;

pub use handlers::{ChatProcessRequest, ConfigRequest, SessionData, VerifyRequest};
pub use response::{ApiResponse, ResponseStatus};
pub use stream::{CONTENT_TYPE_NDJSON, chat_process_response, error_chunk};

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::balance::BalanceReporter;
use crate::config::{Config, non_blank};
use crate::crypto::{KeyCipher, cipher_for};
use crate::error::{RelayError, Result};
use crate::persona::PersonaRegistry;
use crate::provider::Provider;
use crate::relay::ChatRelay;

/// Shared application state for all handlers
///
/// Construction requires a selected [`Provider`], so no handler can run
/// before provider selection has finished.
pub struct AppState {
    pub relay: ChatRelay,
    pub balance: BalanceReporter,
    pub personas: Arc<PersonaRegistry>,
    /// Secret checked by `/verify`; `None` disables client auth
    pub auth_secret_key: Option<String>,
}

impl AppState {
    pub fn new(config: &Config, provider: Arc<Provider>) -> Self {
        let cipher: Arc<dyn KeyCipher> =
            Arc::from(cipher_for(non_blank(&config.provider.crypto_secret)));
        Self::with_cipher(config, provider, cipher)
    }

    pub fn with_cipher(config: &Config, provider: Arc<Provider>, cipher: Arc<dyn KeyCipher>) -> Self {
        let personas = Arc::new(PersonaRegistry::default());
        let relay = ChatRelay::new(
            Arc::clone(&provider),
            Arc::clone(&personas),
            Arc::clone(&cipher),
            config.provider.timeout_ms,
        );
        let balance = BalanceReporter::new(config, provider, cipher);

        Self {
            relay,
            balance,
            personas,
            auth_secret_key: non_blank(&config.server.auth_secret_key).map(str::to_string),
        }
    }
}

/// The relay HTTP server
pub struct RelayServer {
    config: Config,
    provider: Arc<Provider>,
}

impl RelayServer {
    pub fn new(config: Config, provider: Arc<Provider>) -> Self {
        Self { config, provider }
    }

    /// Bind the listener and serve until Ctrl+C/SIGTERM
    pub async fn serve(&self) -> Result<()> {
        let state = Arc::new(AppState::new(&self.config, Arc::clone(&self.provider)));
        let app = create_router(state);

        let addr: SocketAddr = self
            .config
            .server
            .listen_addr
            .parse()
            .map_err(|e| RelayError::Config(format!("Invalid listen address: {e}")))?;

        tracing::info!("Starting chat relay on {addr}");
        tracing::info!(
            mode = %self.provider.mode(),
            backend = self.provider.backend().name(),
            timeout_ms = self.config.provider.timeout_ms,
            "Provider ready"
        );

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::Server(format!("Failed to bind to {addr}: {e}")))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| RelayError::Server(format!("Server error: {e}")))?;

        tracing::info!("Chat relay shut down gracefully");
        Ok(())
    }
}

/// Create the router with all routes mounted at `/` and `/api`
pub fn create_router(state: Arc<AppState>) -> Router {
    let routes = Router::new()
        .route("/chat-process", post(handlers::chat_process))
        .route("/config", post(handlers::config))
        .route("/session", post(handlers::session))
        .route("/verify", post(handlers::verify))
        .route("/health", get(handlers::health));

    Router::new()
        .merge(routes.clone())
        .nest("/api", routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
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
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}

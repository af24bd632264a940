//! voxrelay server library logic.

pub mod api_ws;
pub mod capture;
pub mod config;
pub mod registry;
pub mod reply;
pub mod session;

use axum::{routing::get, Extension, Json, Router};
use capture::AudioCapture;
use config::{Config, SessionConfig};
use registry::SessionRegistry;
use reply::HttpReplyGenerator;
use serde_json::{json, Value};
use session::{SessionServices, SessionSettings};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use voxrelay_vendor::{
    ConnectionPool, RecognitionSigner, SynthesisCodec, SynthesisSigner, VendorSynthesizer,
    VoiceError, WsDialer,
};

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Collaborators every session borrows from.
    pub services: SessionServices,
    /// Synthesis connection pool, kept for shutdown.
    pub synthesis_pool: ConnectionPool,
    /// Per-session settings for the client endpoint.
    pub session: SessionConfig,
}

impl AppState {
    /// Wires the vendor pools and collaborators described by `config`.
    ///
    /// No vendor connection is opened until a session needs one. Fails only
    /// if the reply client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self, VoiceError> {
        let dialer = Arc::new(WsDialer);
        let recognition = ConnectionPool::new(
            "recognition",
            config.recognition.pool.clone(),
            Arc::new(RecognitionSigner::new(config.recognition.clone())),
            dialer.clone(),
        );
        let synthesis_pool = ConnectionPool::new(
            "synthesis",
            config.synthesis.pool.clone(),
            Arc::new(SynthesisSigner::new(config.synthesis.clone())),
            dialer,
        );
        let synthesizer = VendorSynthesizer::new(
            synthesis_pool.clone(),
            SynthesisCodec::new(&config.synthesis),
        );
        let capture = config.capture.dir.as_ref().map(|dir| {
            AudioCapture::new(dir, config.synthesis.voice.file_extension())
        });

        let reply = HttpReplyGenerator::new(&config.reply)?;
        let settings = SessionSettings {
            token_buffer: config.session.reply_token_buffer,
            ..SessionSettings::new(config.recognition.clone())
        };

        Ok(Self {
            services: SessionServices {
                registry: SessionRegistry::new(),
                recognition,
                reply: Arc::new(reply),
                synthesizer: Arc::new(synthesizer),
                capture,
                settings,
            },
            synthesis_pool,
            session: config.session.clone(),
        })
    }

    /// Closes idle vendor connections and refuses new checkouts.
    pub fn shutdown_pools(&self) {
        self.services.recognition.shutdown();
        self.synthesis_pool.shutdown();
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/audio", get(api_ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}

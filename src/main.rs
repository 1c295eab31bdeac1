use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tracing_subscriber::EnvFilter;

mod api;
mod chat;
mod config;
mod error;
mod llm;
mod ocr;
mod tts;

use api::routes::{self, ChatState, OcrState, TextState, TtsState};
use chat::ChatPipeline;
use config::{Config, ServiceKind};
use error::AppError;
use llm::GeminiClient;
use ocr::OcrService;
use tts::TtsService;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let config = Config::from_env()?;

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| AppError::Config(format!("Invalid address: {}", e)))?;

    tracing::info!("live-tts v{} ({} service)", env!("CARGO_PKG_VERSION"), config.service);

    let app = build_app(&config)?;

    tracing::info!("Starting server on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Load whatever the selected service needs and build its router.
fn build_app(config: &Config) -> Result<Router, AppError> {
    let app = match config.service {
        ServiceKind::Tts => {
            let tts = TtsService::load(config.tts()?)?;
            tracing::info!("Serving speech from model '{}'", tts.model_name());
            routes::tts_router(Arc::new(TtsState { tts }))
        }
        ServiceKind::Text => {
            let gemini = GeminiClient::new(config.gemini()?, config.upstream_timeout)?;
            tracing::info!("Serving text from Gemini model {}", gemini.model());
            routes::text_router(Arc::new(TextState { gemini }))
        }
        ServiceKind::Chat => {
            tracing::info!("Text service: {}", config.chat.text_server_url);
            tracing::info!("Speech service: {}", config.chat.tts_server_url);
            let pipeline = ChatPipeline::new(&config.chat, config.upstream_timeout)?;
            routes::chat_router(Arc::new(ChatState { pipeline }))
        }
        ServiceKind::Ocr => {
            let gemini = GeminiClient::new(config.gemini()?, config.upstream_timeout)?;
            tracing::info!("Serving OCR with Gemini model {}", gemini.model());
            tracing::info!("Static directory: {}", config.static_dir.display());
            let ocr = OcrService::new(gemini);
            routes::ocr_router(Arc::new(OcrState { ocr }), &config.static_dir)
        }
    };
    Ok(app)
}

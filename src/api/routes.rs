use axum::{
    extract::DefaultBodyLimit,
    http::{header, Method},
    routing::{get, post},
    Router,
};
use std::path::Path;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};

use super::handlers;
use crate::chat::ChatPipeline;
use crate::config::ServiceKind;
use crate::llm::GeminiClient;
use crate::ocr::OcrService;
use crate::tts::TtsService;

pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

pub struct TtsState {
    pub tts: TtsService,
}

pub struct TextState {
    pub gemini: GeminiClient,
}

pub struct ChatState {
    pub pipeline: ChatPipeline,
}

pub struct OcrState {
    pub ocr: OcrService,
}

fn with_common_layers(router: Router, service: ServiceKind) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    router
        .route("/health", get(move || handlers::health(service)))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

pub fn tts_router(state: Arc<TtsState>) -> Router {
    let router = Router::new()
        .route("/generate-speech", post(handlers::generate_speech))
        .with_state(state);
    with_common_layers(router, ServiceKind::Tts)
}

pub fn text_router(state: Arc<TextState>) -> Router {
    let router = Router::new()
        .route("/generate-text", post(handlers::generate_text))
        .with_state(state);
    with_common_layers(router, ServiceKind::Text)
}

pub fn chat_router(state: Arc<ChatState>) -> Router {
    let router = Router::new()
        .route("/api/chat", post(handlers::chat))
        .route("/api/chat/text", post(handlers::chat_text))
        .with_state(state);
    with_common_layers(router, ServiceKind::Chat)
}

pub fn ocr_router(state: Arc<OcrState>, static_dir: &Path) -> Router {
    let router = Router::new()
        .route("/upload-image", post(handlers::upload_image))
        .route("/upload-image/", post(handlers::upload_image))
        .route("/upload-image/stream", post(handlers::upload_image_stream))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
        .fallback_service(ServeDir::new(static_dir).append_index_html_on_directories(true));
    with_common_layers(router, ServiceKind::Ocr)
}

use axum::{
    body::Body,
    extract::{multipart::MultipartError, Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use std::sync::Arc;

use super::routes::{ChatState, OcrState, TextState, TtsState};
use super::{ChatReplyResponse, ChatRequest, HealthResponse, SpeechRequest, TextRequest, TextResponse};
use crate::config::ServiceKind;
use crate::error::AppError;
use crate::ocr;
use crate::tts;

fn wav_response(wav: Vec<u8>) -> Response {
    (StatusCode::OK, [(header::CONTENT_TYPE, "audio/wav")], wav).into_response()
}

pub async fn generate_speech(
    State(state): State<Arc<TtsState>>,
    Json(request): Json<SpeechRequest>,
) -> Result<Response, AppError> {
    tts::validate_request(&request.text, request.speed)?;

    // Synthesis is CPU-bound; keep it off the async workers.
    let service = state.tts.clone();
    let wav = tokio::task::spawn_blocking(move || service.speak(&request.text, request.speed))
        .await
        .map_err(|e| AppError::TtsError(format!("Synthesis task failed: {}", e)))??;

    Ok(wav_response(wav))
}

pub async fn generate_text(
    State(state): State<Arc<TextState>>,
    Json(request): Json<TextRequest>,
) -> Result<Json<TextResponse>, AppError> {
    if request.prompt.trim().is_empty() {
        return Err(AppError::BadRequest("Prompt cannot be empty".into()));
    }

    let text = state.gemini.generate(&request.prompt, &request.history).await?;
    Ok(Json(TextResponse { text }))
}

fn validate_message(message: &str) -> Result<(), AppError> {
    if message.trim().is_empty() {
        return Err(AppError::BadRequest("Message cannot be empty".into()));
    }
    Ok(())
}

pub async fn chat(
    State(state): State<Arc<ChatState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, AppError> {
    validate_message(&request.message)?;
    let wav = state.pipeline.chat(&request.message, &request.history).await?;
    Ok(wav_response(wav))
}

pub async fn chat_text(
    State(state): State<Arc<ChatState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatReplyResponse>, AppError> {
    validate_message(&request.message)?;
    let reply = state.pipeline.reply(&request.message, &request.history).await?;
    Ok(Json(ChatReplyResponse { reply }))
}

fn multipart_error(e: MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(e.body_text())
    } else {
        AppError::BadRequest(format!("Invalid multipart body: {}", e.body_text()))
    }
}

/// Pull the `file` field out of an upload and check it is a non-empty image.
async fn read_image(mut multipart: Multipart) -> Result<(Vec<u8>, String), AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(multipart_error)?
    {
        if field.name() != Some("file") {
            continue;
        }

        let content_type = field.content_type().map(str::to_string);
        let data = field.bytes().await.map_err(multipart_error)?;

        ocr::validate_image(content_type.as_deref(), &data)?;
        let mime = content_type.unwrap_or_default();
        return Ok((data.to_vec(), mime));
    }

    Err(AppError::InvalidFile("Missing 'file' field".into()))
}

pub async fn upload_image(
    State(state): State<Arc<OcrState>>,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, AppError> {
    let (image, mime) = read_image(multipart).await?;
    let result = state.ocr.extract(image, &mime).await?;
    Ok(Json(result))
}

pub async fn upload_image_stream(
    State(state): State<Arc<OcrState>>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let (image, mime) = read_image(multipart).await?;
    let stream = state.ocr.stream_markdown(image, &mime).await?.inspect(|chunk| {
        if let Err(e) = chunk {
            tracing::error!("OCR stream aborted: {}", e);
        }
    });

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
        Body::from_stream(stream),
    )
        .into_response())
}

pub async fn health(service: ServiceKind) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: service.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid file: {0}")]
    InvalidFile(String),

    #[error("Upload too large: {0}")]
    PayloadTooLarge(String),

    #[error("TTS generation failed: {0}")]
    TtsError(String),

    #[error("Text generation failed: {0}")]
    LlmError(String),

    #[error("Upstream service failed: {0}")]
    UpstreamError(String),

    #[error("Upstream service unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Failed to parse OCR result as JSON")]
    OcrParse { raw_text: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl AppError {
    /// Classify an outbound request failure: unreachable peers are 503, the rest 500.
    pub fn from_transport(err: reqwest::Error, target: &str) -> Self {
        if err.is_connect() || err.is_timeout() {
            AppError::UpstreamUnavailable(format!("{}: {}", target, err))
        } else {
            AppError::UpstreamError(format!("{}: {}", target, err))
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::InvalidFile(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::InvalidFile(_) => "INVALID_FILE",
            AppError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            AppError::TtsError(_) => "TTS_ERROR",
            AppError::LlmError(_) => "LLM_ERROR",
            AppError::UpstreamError(_) => "UPSTREAM_ERROR",
            AppError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            AppError::OcrParse { .. } => "OCR_PARSE_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::IoError(_) => "IO_ERROR",
            AppError::JsonError(_) => "JSON_ERROR",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let message = match &self {
            AppError::BadRequest(msg)
            | AppError::InvalidFile(msg)
            | AppError::PayloadTooLarge(msg)
            | AppError::TtsError(msg)
            | AppError::LlmError(msg)
            | AppError::UpstreamError(msg)
            | AppError::UpstreamUnavailable(msg)
            | AppError::Config(msg) => msg.clone(),
            other => other.to_string(),
        };
        let raw_text = match self {
            AppError::OcrParse { raw_text } => Some(raw_text),
            _ => None,
        };

        tracing::error!("Request failed: {} - {}", code, message);

        (
            status,
            Json(ErrorResponse {
                error: message,
                code: code.to_string(),
                raw_text,
            }),
        )
            .into_response()
    }
}

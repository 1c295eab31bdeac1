pub mod handlers;
pub mod routes;

use serde::{Deserialize, Serialize};

use crate::llm::ChatTurn;

fn default_speed() -> f32 {
    1.0
}

#[derive(Debug, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
    #[serde(default = "default_speed")]
    pub speed: f32,
}

#[derive(Debug, Deserialize)]
pub struct TextRequest {
    pub prompt: String,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
}

#[derive(Debug, Serialize)]
pub struct TextResponse {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
}

#[derive(Debug, Serialize)]
pub struct ChatReplyResponse {
    pub reply: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

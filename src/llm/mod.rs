//! Client for the hosted Gemini `generateContent` API.

pub mod gemini;
pub mod sse;

use serde::{Deserialize, Serialize};

pub use gemini::{GeminiClient, TextStream};

/// Who spoke a turn of conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[serde(alias = "assistant")]
    Model,
}

/// One prior turn, as accepted by our own endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    #[serde(alias = "content")]
    pub text: String,
}

/// A piece of multimodal input.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    InlineData { mime_type: String, data: Vec<u8> },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(text.into())
    }

    pub fn image(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Part::InlineData {
            mime_type: mime_type.into(),
            data,
        }
    }
}

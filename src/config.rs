use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;
use crate::tts::ModelFlavor;

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";

/// Which adapter this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Tts,
    Text,
    Chat,
    Ocr,
}

impl ServiceKind {
    pub fn default_port(self) -> u16 {
        match self {
            ServiceKind::Chat => 8000,
            ServiceKind::Text => 8001,
            ServiceKind::Tts => 8002,
            ServiceKind::Ocr => 8003,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::Tts => "tts",
            ServiceKind::Text => "text",
            ServiceKind::Chat => "chat",
            ServiceKind::Ocr => "ocr",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tts" | "speech" => Ok(ServiceKind::Tts),
            "text" | "gemini" => Ok(ServiceKind::Text),
            "chat" => Ok(ServiceKind::Chat),
            "ocr" => Ok(ServiceKind::Ocr),
            other => Err(AppError::Config(format!(
                "Unknown SERVICE '{}' (expected tts, text, chat or ocr)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub model_dir: PathBuf,
    pub model_id: String,
    pub flavor: ModelFlavor,
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub text_server_url: String,
    pub tts_server_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub service: ServiceKind,
    pub host: String,
    pub port: u16,
    pub upstream_timeout: Duration,
    pub static_dir: PathBuf,
    pub gemini: Option<GeminiConfig>,
    pub tts: Option<TtsConfig>,
    pub chat: ChatConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let service: ServiceKind = var("SERVICE", "tts").parse()?;

        let port = match lookup("PORT") {
            Some(p) => p
                .parse()
                .map_err(|_| AppError::Config(format!("PORT must be a number, got '{}'", p)))?,
            None => service.default_port(),
        };

        let timeout_secs: u64 = var("UPSTREAM_TIMEOUT_SECS", "120").parse().map_err(|_| {
            AppError::Config("UPSTREAM_TIMEOUT_SECS must be a number of seconds".into())
        })?;
        if timeout_secs == 0 {
            return Err(AppError::Config(
                "UPSTREAM_TIMEOUT_SECS must be at least 1".into(),
            ));
        }

        let gemini = match service {
            ServiceKind::Text | ServiceKind::Ocr => {
                let api_key = lookup("GEMINI_API_KEY")
                    .or_else(|| lookup("GOOGLE_API_KEY"))
                    .filter(|k| !k.trim().is_empty())
                    .ok_or_else(|| {
                        AppError::Config("GEMINI_API_KEY (or GOOGLE_API_KEY) must be set".into())
                    })?;
                let model = if service == ServiceKind::Ocr {
                    var("GEMINI_OCR_MODEL", "gemini-2.5-flash-lite")
                } else {
                    var("GEMINI_MODEL", "gemini-2.5-flash")
                };
                Some(GeminiConfig {
                    api_base: var("GEMINI_API_BASE", DEFAULT_GEMINI_API_BASE),
                    api_key,
                    model,
                })
            }
            _ => None,
        };

        let tts = match service {
            ServiceKind::Tts => Some(TtsConfig {
                model_dir: var("TTS_MODEL_DIR", "./models").into(),
                model_id: var("TTS_MODEL", "melo-kr"),
                flavor: var("TTS_FLAVOR", "melo").parse()?,
            }),
            _ => None,
        };

        Ok(Self {
            service,
            host: var("HOST", "0.0.0.0"),
            port,
            upstream_timeout: Duration::from_secs(timeout_secs),
            static_dir: var("STATIC_DIR", "static").into(),
            gemini,
            tts,
            chat: ChatConfig {
                text_server_url: var("TEXT_SERVER_URL", "http://127.0.0.1:8001/generate-text"),
                tts_server_url: var("TTS_SERVER_URL", "http://127.0.0.1:8002/generate-speech"),
            },
        })
    }

    pub fn gemini(&self) -> Result<&GeminiConfig, AppError> {
        self.gemini
            .as_ref()
            .ok_or_else(|| AppError::Config(format!("Gemini is not configured for {}", self.service)))
    }

    pub fn tts(&self) -> Result<&TtsConfig, AppError> {
        self.tts
            .as_ref()
            .ok_or_else(|| AppError::Config(format!("No speech model configured for {}", self.service)))
    }
}

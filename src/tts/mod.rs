pub mod model;
pub mod onnx;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::TtsConfig;
use crate::error::AppError;

pub use model::MeloModel;
pub use onnx::{samples_to_wav, OnnxSynthesizer};

pub const MAX_TEXT_CHARS: usize = 10_000;
pub const MIN_SPEED: f32 = 0.25;
pub const MAX_SPEED: f32 = 4.0;

/// Mono audio produced by a model, before WAV encoding.
#[derive(Debug, Clone)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// A loaded speech model. Implementations are CPU-bound and called from blocking threads.
pub trait Synthesizer: Send + Sync {
    fn name(&self) -> &str;

    fn synthesize(&self, text: &str, speed: f32) -> Result<Waveform, AppError>;
}

/// Input conventions of the supported model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFlavor {
    Melo,
    Dia,
}

impl ModelFlavor {
    pub fn format_text(self, text: &str) -> String {
        match self {
            ModelFlavor::Melo => text.to_string(),
            // Dia is a dialogue model and needs a speaker tag. Backends that
            // phonemize text strip it again.
            ModelFlavor::Dia => format!("[S1] {}", text),
        }
    }
}

impl fmt::Display for ModelFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelFlavor::Melo => f.write_str("melo"),
            ModelFlavor::Dia => f.write_str("dia"),
        }
    }
}

impl FromStr for ModelFlavor {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "melo" | "melotts" => Ok(ModelFlavor::Melo),
            "dia" => Ok(ModelFlavor::Dia),
            other => Err(AppError::Config(format!(
                "Unknown TTS_FLAVOR '{}' (expected melo or dia)",
                other
            ))),
        }
    }
}

#[derive(Clone)]
pub struct TtsService {
    synthesizer: Arc<dyn Synthesizer>,
    flavor: ModelFlavor,
}

impl TtsService {
    pub fn new(synthesizer: Arc<dyn Synthesizer>, flavor: ModelFlavor) -> Self {
        Self {
            synthesizer,
            flavor,
        }
    }

    /// Load the configured model once; failure here aborts start-up.
    pub fn load(config: &TtsConfig) -> Result<Self, AppError> {
        tracing::info!(
            "Loading {} model '{}' from {}",
            config.flavor,
            config.model_id,
            config.model_dir.display()
        );
        let model = MeloModel::open(&config.model_dir, &config.model_id)?;
        let synthesizer = OnnxSynthesizer::new(&model)?;
        tracing::info!(
            "Model '{}' ready ({}, {} Hz)",
            model.id,
            model.config.language,
            model.config.data.sampling_rate
        );
        Ok(Self::new(Arc::new(synthesizer), config.flavor))
    }

    pub fn model_name(&self) -> &str {
        self.synthesizer.name()
    }

    /// Synthesize `text` and return a complete PCM16 WAV file.
    pub fn speak(&self, text: &str, speed: f32) -> Result<Vec<u8>, AppError> {
        let formatted = self.flavor.format_text(text);
        tracing::info!("Speech request: '{}' (speed {})", formatted, speed);

        let waveform = self.synthesizer.synthesize(&formatted, speed)?;
        let wav = samples_to_wav(&waveform.samples, waveform.sample_rate)?;

        tracing::info!(
            "Speech ready: {} samples, {} bytes",
            waveform.samples.len(),
            wav.len()
        );
        Ok(wav)
    }
}

/// Check a speech request before it reaches the model.
pub fn validate_request(text: &str, speed: f32) -> Result<(), AppError> {
    if text.trim().is_empty() {
        return Err(AppError::BadRequest("Text cannot be empty".into()));
    }

    if text.chars().count() > MAX_TEXT_CHARS {
        return Err(AppError::BadRequest(format!(
            "Text too long (max {} chars)",
            MAX_TEXT_CHARS
        )));
    }

    if !speed.is_finite() || !(MIN_SPEED..=MAX_SPEED).contains(&speed) {
        return Err(AppError::BadRequest(format!(
            "Speed must be between {} and {}",
            MIN_SPEED, MAX_SPEED
        )));
    }

    Ok(())
}

//! On-disk layout of an exported MeloTTS checkpoint.
//!
//! ```text
//! <model_dir>/<id>/model.onnx
//! <model_dir>/<id>/config.json
//! ```
//!
//! `config.json` is MeloTTS's own hyper-parameter file (`data.sampling_rate`,
//! `data.spk2id`, `symbols`) with the checkpoint's `language` and optional
//! `synthesis` defaults added by the export.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::AppError;

pub const MODEL_FILE: &str = "model.onnx";
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Deserialize)]
pub struct MeloConfig {
    /// MeloTTS language code, e.g. `KR`.
    pub language: String,
    pub data: DataParams,
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Overrides the espeak-ng voice derived from `language`.
    #[serde(default)]
    pub espeak_voice: Option<String>,
    #[serde(default)]
    pub synthesis: SynthesisParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataParams {
    pub sampling_rate: u32,
    #[serde(default)]
    pub spk2id: BTreeMap<String, i64>,
}

/// MeloTTS `synthesize` defaults.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SynthesisParams {
    pub noise_scale: f32,
    pub length_scale: f32,
    pub noise_scale_w: f32,
}

impl Default for SynthesisParams {
    fn default() -> Self {
        Self {
            noise_scale: 0.6,
            length_scale: 1.0,
            noise_scale_w: 0.8,
        }
    }
}

impl MeloConfig {
    pub fn espeak_voice(&self) -> &str {
        if let Some(voice) = self.espeak_voice.as_deref() {
            return voice;
        }
        match self.language.to_ascii_uppercase().as_str() {
            "KR" => "ko",
            "JP" => "ja",
            "ZH" | "ZH_MIX_EN" => "cmn",
            "ES" => "es",
            "FR" => "fr",
            _ => "en-us",
        }
    }

    /// Speaker to condition on. Single-speaker exports have no `spk2id` and take no `sid` input.
    pub fn speaker_id(&self) -> Result<Option<i64>, AppError> {
        if self.data.spk2id.is_empty() {
            return Ok(None);
        }
        match self.data.spk2id.get(&self.language) {
            Some(id) => Ok(Some(*id)),
            None => Err(AppError::TtsError(format!(
                "No speaker for language {} (spk2id has {})",
                self.language,
                self.data.spk2id.keys().cloned().collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    pub fn symbol_table(&self) -> SymbolTable {
        SymbolTable::new(&self.symbols)
    }
}

/// Symbol → id lookup; ids are positions in the `symbols` list.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    ids: HashMap<String, i64>,
    blank: i64,
}

impl SymbolTable {
    pub fn new(symbols: &[String]) -> Self {
        let ids: HashMap<String, i64> = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as i64))
            .collect();
        let blank = ids.get("_").copied().unwrap_or(0);
        Self { ids, blank }
    }

    pub fn get(&self, symbol: &str) -> Option<i64> {
        self.ids.get(symbol).copied()
    }

    pub fn blank(&self) -> i64 {
        self.blank
    }
}

#[derive(Debug)]
pub struct MeloModel {
    pub id: String,
    pub config: MeloConfig,
    pub onnx_path: PathBuf,
}

impl MeloModel {
    pub fn open(model_dir: &Path, model_id: &str) -> Result<Self, AppError> {
        let dir = model_dir.join(model_id);
        let onnx_path = dir.join(MODEL_FILE);
        let config_path = dir.join(CONFIG_FILE);

        for path in [&onnx_path, &config_path] {
            if !path.is_file() {
                return Err(AppError::TtsError(format!(
                    "MeloTTS export incomplete, missing {}",
                    path.display()
                )));
            }
        }

        let raw = std::fs::read_to_string(&config_path)?;
        let config: MeloConfig = serde_json::from_str(&raw).map_err(|e| {
            AppError::TtsError(format!("Bad {}: {}", config_path.display(), e))
        })?;

        if config.symbols.is_empty() {
            return Err(AppError::TtsError(format!(
                "{} has no symbols",
                config_path.display()
            )));
        }
        // Surface a bad speaker table at load time, not on the first request.
        config.speaker_id()?;

        Ok(Self {
            id: model_id.to_string(),
            config,
            onnx_path,
        })
    }
}

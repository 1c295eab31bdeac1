use std::io::Cursor;
use std::process::Command;
use std::sync::Mutex;

use hound::{SampleFormat, WavSpec, WavWriter};
use lazy_static::lazy_static;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use regex::Regex;

use super::model::{MeloModel, SymbolTable, SynthesisParams};
use super::{Synthesizer, Waveform};
use crate::error::AppError;

lazy_static! {
    static ref SPEAKER_TAG: Regex = Regex::new(r"\[S\d+\]\s*").unwrap();
}

/// MeloTTS (VITS) exported to ONNX, run through ONNX Runtime.
pub struct OnnxSynthesizer {
    name: String,
    session: Mutex<Session>,
    espeak_voice: String,
    symbols: SymbolTable,
    speaker_id: Option<i64>,
    sample_rate: u32,
    params: SynthesisParams,
}

impl OnnxSynthesizer {
    pub fn new(model: &MeloModel) -> Result<Self, AppError> {
        let session = Session::builder()
            .map_err(|e| AppError::TtsError(format!("Failed to create session builder: {}", e)))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| AppError::TtsError(format!("Failed to set optimization level: {}", e)))?
            .with_intra_threads(4)
            .map_err(|e| AppError::TtsError(format!("Failed to set threads: {}", e)))?
            .commit_from_file(&model.onnx_path)
            .map_err(|e| AppError::TtsError(format!("Failed to load model: {}", e)))?;

        Ok(Self {
            name: model.id.clone(),
            session: Mutex::new(session),
            espeak_voice: model.config.espeak_voice().to_string(),
            symbols: model.config.symbol_table(),
            speaker_id: model.config.speaker_id()?,
            sample_rate: model.config.data.sampling_rate,
            params: model.config.synthesis,
        })
    }

    fn infer(&self, ids: &[i64], speed: f32) -> Result<Vec<f32>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let tensor_err = |what: &str, e: ort::Error| {
            AppError::TtsError(format!("Failed to build {} tensor: {}", what, e))
        };

        // [batch, sequence]
        let x = Value::from_array((vec![1, ids.len()], ids.to_vec()))
            .map_err(|e| tensor_err("phoneme", e))?;
        let x_lengths = Value::from_array((vec![1], vec![ids.len() as i64]))
            .map_err(|e| tensor_err("length", e))?;
        let scales = Value::from_array((vec![3], scales(&self.params, speed).to_vec()))
            .map_err(|e| tensor_err("scales", e))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| AppError::TtsError("Model session lock poisoned".to_string()))?;
        let outputs = match self.speaker_id {
            Some(sid) => {
                let sid = Value::from_array((vec![1], vec![sid]))
                    .map_err(|e| tensor_err("speaker", e))?;
                session.run(ort::inputs![x, x_lengths, scales, sid])
            }
            None => session.run(ort::inputs![x, x_lengths, scales]),
        }
        .map_err(|e| AppError::TtsError(format!("Inference failed: {}", e)))?;

        let audio = outputs
            .get("output")
            .or_else(|| outputs.get("audio"))
            .ok_or_else(|| AppError::TtsError("Model produced no audio output".to_string()))?;

        let (_, samples) = audio
            .try_extract_tensor::<f32>()
            .map_err(|e| AppError::TtsError(format!("Failed to read audio output: {}", e)))?;

        Ok(samples.to_vec())
    }
}

impl Synthesizer for OnnxSynthesizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn synthesize(&self, text: &str, speed: f32) -> Result<Waveform, AppError> {
        let phonemes = phonemize(&spoken_text(text), &self.espeak_voice)?;
        let ids = symbol_ids(&phonemes, &self.symbols);
        tracing::debug!("{} phonemes -> {} ids", phonemes.chars().count(), ids.len());
        let samples = self.infer(&ids, speed)?;
        Ok(Waveform {
            samples,
            sample_rate: self.sample_rate,
        })
    }
}

/// Drop dialogue speaker tags such as `[S1]`; espeak would read them out.
pub fn spoken_text(text: &str) -> String {
    SPEAKER_TAG.replace_all(text, "").trim().to_string()
}

/// `[noise_scale, length_scale, noise_scale_w]`; MeloTTS divides the length scale by speed.
pub fn scales(params: &SynthesisParams, speed: f32) -> [f32; 3] {
    [
        params.noise_scale,
        params.length_scale / speed,
        params.noise_scale_w,
    ]
}

/// Convert text to IPA phonemes using espeak-ng
pub fn phonemize(text: &str, voice: &str) -> Result<String, AppError> {
    if text.is_empty() {
        return Ok(String::new());
    }

    let output = Command::new("espeak-ng")
        .args(["--ipa", "-q", "-v", voice, text])
        .output()
        .map_err(|e| {
            AppError::TtsError(format!(
                "Failed to run espeak-ng (is it installed?): {}",
                e
            ))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::TtsError(format!("espeak-ng failed: {}", stderr)));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Look up each phoneme and intersperse the blank id, as MeloTTS does with `add_blank`.
pub fn symbol_ids(phonemes: &str, symbols: &SymbolTable) -> Vec<i64> {
    let blank = symbols.blank();
    let mut ids = vec![blank];
    let mut buf = [0u8; 4];
    for ch in phonemes.chars().filter(|c| !c.is_whitespace() || *c == ' ') {
        if let Some(id) = symbols.get(ch.encode_utf8(&mut buf)) {
            ids.push(id);
            ids.push(blank);
        }
    }
    if ids.len() == 1 {
        ids.clear();
    }
    ids
}

/// Encode mono f32 samples in `[-1.0, 1.0]` as a 16-bit PCM WAV held in memory.
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, AppError> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut buffer = Vec::new();
    {
        let cursor = Cursor::new(&mut buffer);
        let mut writer = WavWriter::new(cursor, spec)
            .map_err(|e| AppError::TtsError(format!("Failed to create WAV writer: {}", e)))?;

        for sample in samples {
            let scaled = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(scaled)
                .map_err(|e| AppError::TtsError(format!("Failed to write sample: {}", e)))?;
        }

        writer
            .finalize()
            .map_err(|e| AppError::TtsError(format!("Failed to finalize WAV: {}", e)))?;
    }

    Ok(buffer)
}

//! Prescription OCR: a vision-capable model reads the image and answers in JSON.

use chrono::{DateTime, FixedOffset, Utc};
use futures_util::StreamExt;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::AppError;
use crate::llm::{GeminiClient, Part, TextStream};

pub const EXTRACTION_PROMPT: &str = r#"
    이 이미지는 약 처방전입니다. 다음 정보를 추출하여 JSON 형식으로 반환해주세요.
    - 각 약에 대한 정보를 객체로 만들어 배열에 담아주세요.
    - 각 약 객체는 다음 키를 포함해야 합니다:
      - "MED_NM": 약의 이름 (문자열)
      - "DOSAGE": 1회 투여량 (숫자, 예: 1정 -> 1 혹 1.00 -> 1, 0.50 -> 0.5)
      - "TIMES_PER_DAY": 하루 복약 횟수 (숫자)
      - "DURATION_DAYS": 총 복약 일수 (숫자)
    - 최상위 객체에는 "medicines"라는 키로 약 정보 배열을 포함해주세요.
    - 만약 정보를 추출할 수 없다면, 빈 배열을 반환해주세요.

    예시 JSON 형식:
    {
      "medicines": [
        {
          "MED_NM": "알마겔",
          "DOSAGE": 1,
          "TIMES_PER_DAY": 3,
          "DURATION_DAYS": 3
        }
      ]
    }
    "#;

/// Asia/Seoul is UTC+9 all year.
const SEOUL_OFFSET_SECS: i32 = 9 * 3600;
pub const CREATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

lazy_static! {
    static ref FENCE_REGEX: Regex = Regex::new(r"(?s)```(json)?(.*)```").unwrap();
    static ref SEOUL: FixedOffset = FixedOffset::east_opt(SEOUL_OFFSET_SECS).unwrap();
}

/// Strip a markdown code fence around the model's answer, if there is one.
pub fn clean_json_string(raw: &str) -> String {
    match FENCE_REGEX.captures(raw).and_then(|cap| cap.get(2)) {
        Some(inner) => inner.as_str().trim().to_string(),
        None => raw.trim().to_string(),
    }
}

pub fn seoul_timestamp(now: DateTime<Utc>) -> String {
    now.with_timezone(&*SEOUL).format(CREATED_AT_FORMAT).to_string()
}

/// Parse the cleaned reply and normalize it into `{medicines: [...], CREATED_AT}`.
pub fn finalize_result(raw: &str, now: DateTime<Utc>) -> Result<Value, AppError> {
    let cleaned = clean_json_string(raw);

    let mut object: Map<String, Value> = match serde_json::from_str(&cleaned) {
        Ok(Value::Object(object)) => object,
        Ok(_) | Err(_) => {
            tracing::warn!("OCR reply is not a JSON object: {}", cleaned);
            return Err(AppError::OcrParse { raw_text: cleaned });
        }
    };

    object.insert("CREATED_AT".to_string(), Value::String(seoul_timestamp(now)));
    object
        .entry("medicines")
        .or_insert_with(|| Value::Array(Vec::new()));

    Ok(Value::Object(object))
}

#[derive(Clone)]
pub struct OcrService {
    gemini: GeminiClient,
}

impl OcrService {
    pub fn new(gemini: GeminiClient) -> Self {
        Self { gemini }
    }

    fn parts(image: Vec<u8>, mime_type: &str) -> [Part; 2] {
        [Part::text(EXTRACTION_PROMPT), Part::image(mime_type, image)]
    }

    /// Run extraction and return the structured result.
    pub async fn extract(&self, image: Vec<u8>, mime_type: &str) -> Result<Value, AppError> {
        tracing::info!("OCR request: {} bytes of {}", image.len(), mime_type);

        let mut stream = self
            .gemini
            .stream_generate(&Self::parts(image, mime_type))
            .await?;

        let mut full_text = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            tracing::debug!("Received chunk: {}", chunk);
            full_text.push_str(&chunk);
        }

        let result = finalize_result(&full_text, Utc::now())?;
        let count = result["medicines"].as_array().map(Vec::len).unwrap_or(0);
        tracing::info!("OCR extracted {} medicines", count);
        Ok(result)
    }

    /// Stream the model's raw answer through unchanged.
    pub async fn stream_markdown(
        &self,
        image: Vec<u8>,
        mime_type: &str,
    ) -> Result<TextStream, AppError> {
        tracing::info!("OCR stream request: {} bytes of {}", image.len(), mime_type);
        self.gemini
            .stream_generate(&Self::parts(image, mime_type))
            .await
    }
}

/// Upload checks shared by both OCR routes.
pub fn validate_image(content_type: Option<&str>, data: &[u8]) -> Result<(), AppError> {
    match content_type {
        Some(ct) if ct.starts_with("image/") => {}
        _ => {
            return Err(AppError::InvalidFile(
                "Invalid file type. Please upload an image.".into(),
            ))
        }
    }
    if data.is_empty() {
        return Err(AppError::InvalidFile("Uploaded image is empty".into()));
    }
    Ok(())
}

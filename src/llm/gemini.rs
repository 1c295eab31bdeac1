use std::collections::VecDeque;
use std::time::Duration;

use axum::body::Bytes;
use base64::Engine;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::sse::SseDecoder;
use super::{ChatTurn, Part, Role};
use crate::config::GeminiConfig;
use crate::error::AppError;

/// Text chunks of a streamed reply, in arrival order.
pub type TextStream = BoxStream<'static, Result<String, AppError>>;

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WirePart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: Blob,
    },
}

#[derive(Debug, Serialize)]
struct Blob {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<PromptFeedback>,
    error: Option<ApiError>,
}

/// Error object Gemini sends in place of a chunk, mid-stream.
#[derive(Debug, Deserialize)]
struct ApiError {
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<ResponseContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

impl GenerateContentResponse {
    /// Concatenated text of the first candidate, if it has any.
    fn text(&self) -> Option<String> {
        let candidate = self.candidates.first()?;
        let text: String = candidate
            .content
            .as_ref()?
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect();
        Some(text)
    }

    fn empty_reason(&self) -> String {
        if let Some(reason) = self
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_deref())
        {
            return format!("prompt blocked: {}", reason);
        }
        match self.candidates.first() {
            None => "No candidates returned".to_string(),
            Some(c) => format!(
                "No text in response (finish reason: {})",
                c.finish_reason.as_deref().unwrap_or("unknown")
            ),
        }
    }
}

impl From<&Part> for WirePart {
    fn from(part: &Part) -> Self {
        match part {
            Part::Text(text) => WirePart::Text { text: text.clone() },
            Part::InlineData { mime_type, data } => WirePart::InlineData {
                inline_data: Blob {
                    mime_type: mime_type.clone(),
                    data: base64::engine::general_purpose::STANDARD.encode(data),
                },
            },
        }
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Model => "model",
    }
}

/// Google Gemini REST client
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self, method: &str) -> String {
        let model = self.model.strip_prefix("models/").unwrap_or(&self.model);
        format!("{}/v1beta/models/{}:{}", self.api_base, model, method)
    }

    /// Single-shot generation: history turns first, then the new user prompt.
    pub async fn generate(&self, prompt: &str, history: &[ChatTurn]) -> Result<String, AppError> {
        let mut contents: Vec<Content> = history
            .iter()
            .map(|turn| Content {
                role: role_name(turn.role),
                parts: vec![WirePart::Text {
                    text: turn.text.clone(),
                }],
            })
            .collect();
        contents.push(Content {
            role: "user",
            parts: vec![WirePart::Text {
                text: prompt.to_string(),
            }],
        });

        tracing::info!(
            "Calling Gemini generateContent with model {} ({} history turns)",
            self.model,
            history.len()
        );

        let response = self
            .post(&self.endpoint("generateContent"), &[], &GenerateContentRequest { contents })
            .await?;

        let body: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| AppError::LlmError(format!("Failed to parse Gemini response: {}", e)))?;

        match body.text() {
            Some(text) if !text.is_empty() => {
                tracing::info!("Gemini generated {} characters", text.len());
                Ok(text)
            }
            _ => Err(AppError::LlmError(body.empty_reason())),
        }
    }

    /// Streamed generation over server-sent events. Empty chunks are dropped.
    pub async fn stream_generate(&self, parts: &[Part]) -> Result<TextStream, AppError> {
        let request = GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts: parts.iter().map(WirePart::from).collect(),
            }],
        };

        tracing::info!(
            "Calling Gemini streamGenerateContent with model {} ({} parts)",
            self.model,
            parts.len()
        );

        let response = self
            .post(
                &self.endpoint("streamGenerateContent"),
                &[("alt", "sse")],
                &request,
            )
            .await?;

        Ok(decode_event_stream(response))
    }

    async fn post<T: Serialize>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        body: &T,
    ) -> Result<reqwest::Response, AppError> {
        let response = self
            .client
            .post(url)
            .query(query)
            .query(&[("key", self.api_key.as_str())])
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::LlmError(format!(
                "Gemini returned {}: {}",
                status, error_text
            )));
        }

        Ok(response)
    }
}

fn transport_error(err: reqwest::Error) -> AppError {
    if err.is_connect() || err.is_timeout() {
        AppError::UpstreamUnavailable(format!("Gemini API: {}", err))
    } else {
        AppError::LlmError(format!("Gemini request failed: {}", err))
    }
}

fn parse_event(payload: &str) -> Option<Result<String, AppError>> {
    match serde_json::from_str::<GenerateContentResponse>(payload) {
        Ok(GenerateContentResponse {
            error: Some(error), ..
        }) => {
            let message = match error.code {
                Some(code) => format!("Gemini stream error {}: {}", code, error.message),
                None => format!("Gemini stream error: {}", error.message),
            };
            Some(Err(AppError::LlmError(message)))
        }
        Ok(chunk) => chunk.text().filter(|t| !t.is_empty()).map(Ok),
        Err(e) => Some(Err(AppError::LlmError(format!(
            "Failed to parse Gemini stream chunk: {}",
            e
        )))),
    }
}

fn decode_event_stream(response: reqwest::Response) -> TextStream {
    struct State {
        bytes: BoxStream<'static, reqwest::Result<Bytes>>,
        decoder: SseDecoder,
        pending: VecDeque<Result<String, AppError>>,
        done: bool,
    }

    let state = State {
        bytes: response.bytes_stream().boxed(),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    for event in state.decoder.push(&chunk) {
                        state.pending.extend(parse_event(&event));
                    }
                    // Nothing useful follows an error event.
                    if let Some(i) = state.pending.iter().position(Result::is_err) {
                        state.pending.truncate(i + 1);
                        state.done = true;
                    }
                }
                Some(Err(e)) => {
                    state.pending.push_back(Err(transport_error(e)));
                    state.done = true;
                }
                None => {
                    if let Some(event) = state.decoder.finish() {
                        state.pending.extend(parse_event(&event));
                    }
                    state.done = true;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(server: &MockServer, model: &str) -> GeminiClient {
        GeminiClient::new(
            &GeminiConfig {
                api_base: server.base_url(),
                api_key: "test-key".into(),
                model: model.into(),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn reply(text: &str) -> serde_json::Value {
        json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": text}]},
                "finishReason": "STOP"
            }]
        })
    }

    #[test]
    fn serializes_inline_image_as_base64() {
        let part = WirePart::from(&Part::image("image/png", vec![0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(
            serde_json::to_value(part).unwrap(),
            json!({"inlineData": {"mimeType": "image/png", "data": "3q2+7w=="}})
        );
    }

    #[test]
    fn concatenates_parts_of_first_candidate() {
        let body: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [
                {"content": {"parts": [{"text": "Hello, "}, {"text": "world"}]}},
                {"content": {"parts": [{"text": "ignored"}]}}
            ]
        }))
        .unwrap();
        assert_eq!(body.text().as_deref(), Some("Hello, world"));
    }

    #[test]
    fn reports_block_reason() {
        let body: GenerateContentResponse =
            serde_json::from_value(json!({"promptFeedback": {"blockReason": "SAFETY"}})).unwrap();
        assert_eq!(body.text(), None);
        assert_eq!(body.empty_reason(), "prompt blocked: SAFETY");
    }

    #[tokio::test]
    async fn generate_sends_history_then_prompt() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1beta/models/gemini-2.5-flash:generateContent")
                    .query_param("key", "test-key")
                    .json_body(json!({
                        "contents": [
                            {"role": "user", "parts": [{"text": "안녕"}]},
                            {"role": "model", "parts": [{"text": "안녕하세요!"}]},
                            {"role": "user", "parts": [{"text": "오늘 날씨 어때?"}]}
                        ]
                    }));
                then.status(200).json_body(reply("맑아요."));
            })
            .await;

        let history = vec![
            ChatTurn {
                role: Role::User,
                text: "안녕".into(),
            },
            ChatTurn {
                role: Role::Model,
                text: "안녕하세요!".into(),
            },
        ];
        let text = client(&server, "gemini-2.5-flash")
            .generate("오늘 날씨 어때?", &history)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(text, "맑아요.");
    }

    #[tokio::test]
    async fn generate_accepts_prefixed_model_name() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1beta/models/gemini-pro:generateContent");
                then.status(200).json_body(reply("ok"));
            })
            .await;

        let text = client(&server, "models/gemini-pro")
            .generate("ping", &[])
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(text, "ok");
    }

    #[tokio::test]
    async fn generate_maps_error_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST);
                then.status(400)
                    .json_body(json!({"error": {"message": "API key not valid"}}));
            })
            .await;

        let err = client(&server, "gemini-2.5-flash")
            .generate("hi", &[])
            .await
            .unwrap_err();
        assert!(
            matches!(&err, AppError::LlmError(msg) if msg.contains("400") && msg.contains("API key not valid"))
        );
    }

    #[tokio::test]
    async fn generate_rejects_empty_candidates() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST);
                then.status(200).json_body(json!({"candidates": []}));
            })
            .await;

        let err = client(&server, "gemini-2.5-flash")
            .generate("hi", &[])
            .await
            .unwrap_err();
        assert!(matches!(&err, AppError::LlmError(msg) if msg == "No candidates returned"));
    }

    #[tokio::test]
    async fn unreachable_api_is_unavailable() {
        let config = GeminiConfig {
            api_base: "http://127.0.0.1:1".into(),
            api_key: "k".into(),
            model: "m".into(),
        };
        let err = GeminiClient::new(&config, Duration::from_secs(2))
            .unwrap()
            .generate("hi", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn stream_generate_yields_chunks_in_order() {
        let server = MockServer::start_async().await;
        let body = format!(
            "data: {}\r\n\r\ndata: {}\r\n\r\ndata: {}\r\n\r\n",
            reply("```json\n{\"medicines\""),
            json!({"candidates": [{"content": {"parts": []}}]}),
            reply(": []}\n```"),
        );
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1beta/models/gemini-2.5-flash-lite:streamGenerateContent")
                    .query_param("alt", "sse")
                    .query_param("key", "test-key")
                    .body_contains("\"mimeType\":\"image/jpeg\"");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(body);
            })
            .await;

        let gemini = client(&server, "gemini-2.5-flash-lite");
        let parts = [Part::text("read this"), Part::image("image/jpeg", vec![1, 2, 3])];
        let chunks: Vec<String> = gemini
            .stream_generate(&parts)
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;

        mock.assert_async().await;
        assert_eq!(chunks, vec!["```json\n{\"medicines\"", ": []}\n```"]);
    }

    #[tokio::test]
    async fn stream_generate_surfaces_bad_chunks() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST);
                then.status(200).body("data: not-json\n\n");
            })
            .await;

        let mut stream = client(&server, "m")
            .stream_generate(&[Part::text("x")])
            .await
            .unwrap();
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(AppError::LlmError(_))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn stream_generate_surfaces_error_events() {
        let server = MockServer::start_async().await;
        let body = [
            format!(
                "data: {}\n\n",
                json!({"candidates": [{"content": {"parts": [{"text": "partial"}]}}]})
            ),
            "data: {\"error\":{\"code\":503,\"message\":\"The model is overloaded.\"}}\n\n".to_string(),
            format!(
                "data: {}\n\n",
                json!({"candidates": [{"content": {"parts": [{"text": "late"}]}}]})
            ),
        ]
        .concat();
        server
            .mock_async(|when, then| {
                when.method(POST);
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(body);
            })
            .await;

        let mut stream = client(&server, "m")
            .stream_generate(&[Part::text("x")])
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "partial");
        match stream.next().await.unwrap() {
            Err(AppError::LlmError(msg)) => {
                assert!(msg.contains("503"), "{}", msg);
                assert!(msg.contains("The model is overloaded."), "{}", msg);
            }
            other => panic!("expected LlmError, got {:?}", other),
        }
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn error_event_is_not_dropped() {
        let event = r#"{"error":{"code":503,"message":"The model is overloaded."}}"#;
        assert!(matches!(parse_event(event), Some(Err(AppError::LlmError(_)))));
    }
}

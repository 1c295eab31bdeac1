//! Chains the text adapter and the speech adapter for one chat turn.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::ChatConfig;
use crate::error::AppError;
use crate::llm::ChatTurn;

#[derive(Debug, Serialize)]
struct TextRequest<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "no_history")]
    history: &'a [ChatTurn],
}

fn no_history(history: &&[ChatTurn]) -> bool {
    history.is_empty()
}

#[derive(Debug, Deserialize)]
struct TextReply {
    text: String,
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
}

#[derive(Clone)]
pub struct ChatPipeline {
    client: Client,
    text_server_url: String,
    tts_server_url: String,
}

impl ChatPipeline {
    pub fn new(config: &ChatConfig, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            text_server_url: config.text_server_url.clone(),
            tts_server_url: config.tts_server_url.clone(),
        })
    }

    /// Ask the text adapter for a reply.
    pub async fn reply(&self, message: &str, history: &[ChatTurn]) -> Result<String, AppError> {
        tracing::debug!("Requesting reply from {}", self.text_server_url);
        let response = self
            .send(
                &self.text_server_url,
                &TextRequest {
                    prompt: message,
                    history,
                },
            )
            .await?;

        let reply: TextReply = response.json().await.map_err(|e| {
            AppError::UpstreamError(format!("Invalid reply from text service: {}", e))
        })?;
        Ok(reply.text)
    }

    /// Ask the speech adapter to voice `text`; returns WAV bytes.
    pub async fn speak(&self, text: &str) -> Result<Vec<u8>, AppError> {
        tracing::debug!("Requesting speech from {}", self.tts_server_url);
        let response = self
            .send(&self.tts_server_url, &SpeechRequest { text })
            .await?;

        let audio = response
            .bytes()
            .await
            .map_err(|e| AppError::from_transport(e, "speech service"))?;
        Ok(audio.to_vec())
    }

    /// Reply then speak. A failed reply never reaches the speech adapter.
    pub async fn chat(&self, message: &str, history: &[ChatTurn]) -> Result<Vec<u8>, AppError> {
        let reply = self.reply(message, history).await?;
        tracing::info!("Generated reply of {} characters", reply.chars().count());

        let audio = self.speak(&reply).await?;
        tracing::info!("Received {} bytes of audio", audio.len());
        Ok(audio)
    }

    async fn send<T: Serialize>(&self, url: &str, body: &T) -> Result<reqwest::Response, AppError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::from_transport(e, url))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::UpstreamError(format!(
                "{} returned {}: {}",
                url, status, error_text
            )));
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;
    use httpmock::prelude::*;
    use serde_json::json;

    fn pipeline(text_url: String, tts_url: String) -> ChatPipeline {
        ChatPipeline::new(
            &ChatConfig {
                text_server_url: text_url,
                tts_server_url: tts_url,
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn chat_chains_text_then_speech() {
        let server = MockServer::start_async().await;
        let text_mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/generate-text")
                    .json_body(json!({
                        "prompt": "hello",
                        "history": [{"role": "model", "text": "hi!"}]
                    }));
                then.status(200).json_body(json!({"text": "nice to meet you"}));
            })
            .await;
        let tts_mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/generate-speech")
                    .json_body(json!({"text": "nice to meet you"}));
                then.status(200)
                    .header("content-type", "audio/wav")
                    .body(b"RIFF....WAVE".to_vec());
            })
            .await;

        let history = vec![ChatTurn {
            role: Role::Model,
            text: "hi!".into(),
        }];
        let audio = pipeline(server.url("/generate-text"), server.url("/generate-speech"))
            .chat("hello", &history)
            .await
            .unwrap();

        text_mock.assert_async().await;
        tts_mock.assert_async().await;
        assert_eq!(audio, b"RIFF....WAVE".to_vec());
    }

    #[tokio::test]
    async fn reply_omits_empty_history() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/generate-text")
                    .json_body(json!({"prompt": "hello"}));
                then.status(200).json_body(json!({"text": "hey"}));
            })
            .await;

        let reply = pipeline(server.url("/generate-text"), server.url("/unused"))
            .reply("hello", &[])
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(reply, "hey");
    }

    #[tokio::test]
    async fn text_failure_skips_speech() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/generate-text");
                then.status(500).body("quota exceeded");
            })
            .await;
        let tts_mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/generate-speech");
                then.status(200).body("RIFF");
            })
            .await;

        let err = pipeline(server.url("/generate-text"), server.url("/generate-speech"))
            .chat("hello", &[])
            .await
            .unwrap_err();

        assert!(matches!(&err, AppError::UpstreamError(msg) if msg.contains("quota exceeded")));
        tts_mock.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn speech_failure_after_reply_is_upstream_error() {
        let server = MockServer::start_async().await;
        let text_mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/generate-text");
                then.status(200).json_body(json!({"text": "hello back"}));
            })
            .await;
        let tts_mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/generate-speech")
                    .json_body(json!({"text": "hello back"}));
                then.status(500).body("Error during speech generation: CUDA out of memory");
            })
            .await;

        let err = pipeline(server.url("/generate-text"), server.url("/generate-speech"))
            .chat("hello", &[])
            .await
            .unwrap_err();

        text_mock.assert_async().await;
        tts_mock.assert_async().await;
        match err {
            AppError::UpstreamError(msg) => {
                assert!(msg.contains("500"), "{}", msg);
                assert!(msg.contains("CUDA out of memory"), "{}", msg);
            }
            other => panic!("expected UpstreamError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_text_reply_is_upstream_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/generate-text");
                then.status(200).json_body(json!({"reply": "wrong shape"}));
            })
            .await;

        let err = pipeline(server.url("/generate-text"), server.url("/generate-speech"))
            .reply("hello", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UpstreamError(_)));
    }

    #[tokio::test]
    async fn unreachable_service_is_unavailable() {
        let err = pipeline(
            "http://127.0.0.1:1/generate-text".into(),
            "http://127.0.0.1:1/generate-speech".into(),
        )
        .chat("hello", &[])
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::UpstreamUnavailable(_)));
    }
}

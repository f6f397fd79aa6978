//! LLM chat client abstractions and the Gemini implementation.
//!
//! The [`ChatClient`] trait is the seam between route steps and the external
//! model service: one blocking-style call that returns the full response
//! text, and a streaming variant that yields tokens as they arrive. Tests
//! substitute a scripted stub.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;

use crate::config::GeminiConfig;
use crate::error::{EngineError, EngineResult};

/// Stream of response text fragments.
pub type TokenStream = Pin<Box<dyn Stream<Item = EngineResult<String>> + Send>>;

/// Chat interface to the external LLM service.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Send a prompt and return the complete response text.
    async fn chat(&self, prompt: &str) -> EngineResult<String>;

    /// Send a prompt and stream the response text fragments.
    async fn stream_chat(&self, prompt: &str) -> EngineResult<TokenStream>;

    /// Model identifier, for logging.
    fn model(&self) -> &str;
}

/// Gemini API client.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
}

impl GeminiClient {
    /// Create a client from configuration.
    #[must_use]
    pub fn new(config: &GeminiConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            api_key: config.api.key.clone(),
            model: config.model.name.clone(),
            temperature: config.model.temperature,
        }
    }

    /// Override the base URL (for tests against a local server).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/v1beta/models/{}:{method}",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }

    fn request_body(&self, prompt: &str) -> serde_json::Value {
        serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": prompt }]
            }],
            "generationConfig": {
                "temperature": self.temperature
            }
        })
    }

    fn api_key(&self) -> EngineResult<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| EngineError::External("no Gemini API key configured".to_string()))
    }
}

/// Response shape of `generateContent` (and each SSE chunk of the streaming
/// variant).
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

impl GenerateResponse {
    fn text(&self) -> String {
        self.candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|c| c.parts.iter())
            .filter_map(|p| p.text.as_deref())
            .collect()
    }
}

#[async_trait]
impl ChatClient for GeminiClient {
    async fn chat(&self, prompt: &str) -> EngineResult<String> {
        let key = self.api_key()?.to_string();

        let response = self
            .client
            .post(self.api_url("generateContent"))
            .header("x-goog-api-key", key)
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(|e| EngineError::External(format!("Gemini request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::External(format!(
                "Gemini API error ({status}): {text}"
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| EngineError::External(format!("Gemini response parse failed: {e}")))?;

        let text = parsed.text();
        if text.is_empty() {
            return Err(EngineError::External(
                "Gemini returned no candidates".to_string(),
            ));
        }
        Ok(text)
    }

    async fn stream_chat(&self, prompt: &str) -> EngineResult<TokenStream> {
        let key = self.api_key()?.to_string();

        let response = self
            .client
            .post(format!("{}?alt=sse", self.api_url("streamGenerateContent")))
            .header("x-goog-api-key", key)
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(|e| EngineError::External(format!("Gemini request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::External(format!(
                "Gemini API error ({status}): {text}"
            )));
        }

        let bytes = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut buffer = String::new();
            futures::pin_mut!(bytes);

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(EngineError::External(format!("stream error: {e}")));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE frames are separated by a blank line.
                while let Some(pos) = buffer.find("\n\n") {
                    let frame: String = buffer.drain(..pos + 2).collect();
                    for line in frame.lines() {
                        let Some(data) = line.strip_prefix("data:") else {
                            continue;
                        };
                        let data = data.trim();
                        if data.is_empty() || data == "[DONE]" {
                            continue;
                        }
                        match serde_json::from_str::<GenerateResponse>(data) {
                            Ok(parsed) => {
                                let text = parsed.text();
                                if !text.is_empty() {
                                    yield Ok(text);
                                }
                            }
                            Err(e) => {
                                yield Err(EngineError::External(format!(
                                    "stream chunk parse failed: {e}"
                                )));
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeminiConfig;

    #[test]
    fn test_api_url_shape() {
        let client = GeminiClient::new(&GeminiConfig::default());
        assert_eq!(
            client.api_url("generateContent"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }

    #[test]
    fn test_response_text_extraction() {
        let json = serde_json::json!({
            "candidates": [{
                "content": {
                    "parts": [{ "text": "Hello " }, { "text": "world" }]
                }
            }]
        });
        let parsed: GenerateResponse = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.text(), "Hello world");
    }

    #[test]
    fn test_empty_response_text() {
        let parsed: GenerateResponse = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(parsed.text(), "");
    }

    #[tokio::test]
    async fn test_chat_without_key_fails() {
        let client = GeminiClient::new(&GeminiConfig::default());
        let err = client.chat("Hi").await.unwrap_err();
        assert!(matches!(err, EngineError::External(_)));
    }
}

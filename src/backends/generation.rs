//! Text generation client (OpenAI chat completions).

use super::endpoint;
use crate::config::BackendConfig;
use crate::error::RelayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Prompt submitted for one conversation turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    /// Non-empty prompt text. Callers validate before sending.
    pub text: String,
    /// Correlation token, echoed back untouched.
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResponse {
    pub text: String,
    pub conversation_id: Option<String>,
}

/// Anything that turns a prompt into completion text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Make exactly one backend call. Failures come back as `RelayError::Generation`.
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, RelayError>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Generation client for any OpenAI-compatible `/chat/completions` endpoint.
///
/// Every call sends the prompt as a single user message with the configured
/// `max_tokens` and `temperature`, which bounds the cost and latency of a turn.
pub struct OpenAiTextGenerator {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiTextGenerator {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: endpoint(&config.base_url, "chat/completions"),
            api_key: config.api_key.clone(),
            model: config.llm_model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    fn request_body<'a>(&'a self, prompt: &'a str) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

#[async_trait]
impl TextGenerator for OpenAiTextGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, RelayError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(&request.text))
            .send()
            .await
            .map_err(|e| RelayError::generation_caused_by("request to generation backend failed", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::generation(format!(
                "generation backend returned {}: {}",
                status, body
            )));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| RelayError::generation_caused_by("undecodable generation response", e))?;
        let text = completion_text(completion)?;

        debug!(model = %self.model, chars = text.len(), "Generation completed");

        Ok(GenerationResponse {
            text,
            conversation_id: request.conversation_id,
        })
    }
}

/// Pull the first choice's content out of a completion.
fn completion_text(completion: ChatCompletionResponse) -> Result<String, RelayError> {
    completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| RelayError::generation("generation backend returned no choices"))?
        .message
        .content
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| RelayError::generation("generation backend returned no content"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn generator() -> OpenAiTextGenerator {
        let mut config = AppConfig::default().backend;
        config.base_url = "http://localhost:9999/v1/".to_string();
        config.api_key = "sk-test".to_string();
        OpenAiTextGenerator::new(&config).unwrap()
    }

    #[test]
    fn test_request_body_applies_token_budget() {
        let generator = generator();
        let body = serde_json::to_value(generator.request_body("Hello world")).unwrap();

        assert_eq!(generator.url, "http://localhost:9999/v1/chat/completions");
        assert_eq!(body["model"], "gpt-3.5-turbo");
        assert_eq!(body["max_tokens"], 50);
        assert!((body["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-6);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Hello world");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_completion_text_takes_first_choice() {
        let completion: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"Hi there"}},
                           {"message":{"role":"assistant","content":"ignored"}}]}"#,
        )
        .unwrap();
        assert_eq!(completion_text(completion).unwrap(), "Hi there");
    }

    #[test]
    fn test_completion_without_choices_is_generation_error() {
        let completion: ChatCompletionResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        let err = completion_text(completion).unwrap_err();
        assert!(matches!(err, RelayError::Generation { .. }));

        let completion: ChatCompletionResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap();
        assert!(completion_text(completion).is_err());

        let completion: ChatCompletionResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"  "}}]}"#).unwrap();
        assert!(completion_text(completion).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_generation_error() {
        let mut config = AppConfig::default().backend;
        // Port 9 (discard) is closed on test hosts, so the connection is refused
        config.base_url = "http://127.0.0.1:9/v1".to_string();
        config.api_key = "sk-test".to_string();
        let generator = OpenAiTextGenerator::new(&config).unwrap();

        let err = generator
            .generate(GenerationRequest {
                text: "Hello".to_string(),
                conversation_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Generation { source: Some(_), .. }));
        assert_eq!(err.user_message(), "Text generation failed");
    }

    fn generator_for(server: &MockServer) -> OpenAiTextGenerator {
        let mut config = AppConfig::default().backend;
        config.base_url = format!("{}/v1", server.uri());
        config.api_key = "sk-test".to_string();
        OpenAiTextGenerator::new(&config).unwrap()
    }

    fn request(text: &str) -> GenerationRequest {
        GenerationRequest {
            text: text.to_string(),
            conversation_id: Some("client-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_generate_decodes_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "gpt-3.5-turbo",
                "max_tokens": 50,
                "messages": [{"role": "user", "content": "Hello world"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "model": "gpt-3.5-turbo",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Hi there"},
                    "finish_reason": "stop"
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = generator_for(&server)
            .generate(request("Hello world"))
            .await
            .unwrap();

        assert_eq!(response.text, "Hi there");
        assert_eq!(response.conversation_id.as_deref(), Some("client-1"));
    }

    #[tokio::test]
    async fn test_server_error_is_generation_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "error": {"message": "The server had an error", "type": "server_error"}
            })))
            .mount(&server)
            .await;

        let err = generator_for(&server)
            .generate(request("Hello"))
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Generation { source: None, .. }));
        assert!(err.to_string().contains("500"));
        assert!(err.to_string().contains("The server had an error"));
        assert_eq!(err.user_message(), "Text generation failed");
    }

    #[tokio::test]
    async fn test_empty_body_is_generation_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let err = generator_for(&server)
            .generate(request("Hello"))
            .await
            .unwrap_err();

        // Nothing to decode, so the decode error is kept as the cause
        assert!(matches!(err, RelayError::Generation { source: Some(_), .. }));
        assert_eq!(err.user_message(), "Text generation failed");
    }
}

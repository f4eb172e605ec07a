use crate::error::InferenceError;
use crate::models::{Classification, Provider, ProviderConfig, Role};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{future, Stream, StreamExt};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;

// Alias for the stream of content deltas returned by streaming requests
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, InferenceError>> + Send>>;

/// One role-tagged entry of a transcript.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Where and how to send a request: resolved provider, endpoint and credential.
#[derive(Clone)]
pub struct InferenceTarget {
    pub provider: Provider,
    pub api_url: String, // Base URL, without /chat/completions
    pub api_key: Option<String>,
    pub model: String,
}

impl InferenceTarget {
    /// Resolves a stored configuration. Fails with `CredentialMissing` when no provider
    /// is selected or the provider needs a key that is absent.
    pub fn from_config(config: Option<&ProviderConfig>) -> Result<Self, InferenceError> {
        let (config, provider) = match config {
            Some(c) => match c.provider {
                Some(p) => (c, p),
                None => {
                    return Err(InferenceError::CredentialMissing(
                        "no inference provider selected".to_string(),
                    ))
                }
            },
            None => {
                return Err(InferenceError::CredentialMissing(
                    "no inference provider configured".to_string(),
                ))
            }
        };

        let api_key = config.api_key().map(str::to_string);
        if provider.requires_api_key() && api_key.is_none() {
            return Err(InferenceError::CredentialMissing(format!(
                "{} requires an API key",
                provider
            )));
        }

        let api_url = config
            .base_url()
            .unwrap_or(provider.default_base_url())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            provider,
            api_url,
            api_key,
            model: provider.chat_model().to_string(),
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_url.trim_end_matches('/'))
    }
}

// Keep the key out of logs.
impl fmt::Debug for InferenceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceTarget")
            .field("provider", &self.provider)
            .field("api_url", &self.api_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .finish()
    }
}

/// Sampling parameters sent with every chat request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f64,
    pub max_tokens: Option<u32>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: Some(1000),
        }
    }
}

// Trait defining the interface for LLM API providers
#[async_trait]
pub trait LLMApiProvider: Send + Sync {
    /// Single request/response completion.
    async fn send_chat_request(
        &self,
        target: &InferenceTarget,
        transcript: &[ChatTurn],
    ) -> Result<String, InferenceError>;

    /// Returns a stream of content deltas. Dropping the stream abandons the request.
    async fn send_chat_stream_request(
        &self,
        target: &InferenceTarget,
        transcript: &[ChatTurn],
    ) -> Result<DeltaStream, InferenceError>;

    /// Best-effort title/summary/keywords. Never fails; see [`Classification::fallback`].
    async fn classify(&self, target: &InferenceTarget, content: &str) -> Classification;

    /// Streams a completion, handing each delta to `on_chunk` in arrival order, and
    /// returns the full text once the stream ends.
    async fn complete_streaming(
        &self,
        target: &InferenceTarget,
        transcript: &[ChatTurn],
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
    ) -> Result<String, InferenceError> {
        let stream = self.send_chat_stream_request(target, transcript).await?;
        collect_stream(stream, on_chunk).await
    }
}

/// Drains a delta stream into a single string, calling `on_chunk` for every delta.
pub async fn collect_stream(
    mut stream: DeltaStream,
    on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
) -> Result<String, InferenceError> {
    let mut full_content = String::new();
    while let Some(delta) = stream.next().await {
        let delta = delta?;
        on_chunk(&delta);
        full_content.push_str(&delta);
    }
    Ok(full_content)
}

// --- OpenAI Compatible Provider Implementation ---

#[derive(Serialize, Debug)]
struct OpenAIRequestBody<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

// Response structure for single-shot completions
#[derive(Deserialize, Debug)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize, Debug)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Deserialize, Debug)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

// Response structure for STREAMING chunks
#[derive(Deserialize, Debug)]
struct OpenAIStreamChunk {
    #[serde(default)] // pings and keep-alives carry no choices
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Deserialize, Debug)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: OpenAIStreamDelta,
}

#[derive(Deserialize, Debug, Default)]
struct OpenAIStreamDelta {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct OpenAIErrorBody {
    error: OpenAIErrorDetail,
}

#[derive(Deserialize, Debug)]
struct OpenAIErrorDetail {
    message: String,
}

/// What a single SSE data payload means for the delta stream.
#[derive(Debug, PartialEq, Eq)]
enum StreamFrame {
    Delta(String),
    Done,
    Skip,
}

fn parse_stream_frame(data: &str) -> StreamFrame {
    let data = data.trim();
    if data == "[DONE]" {
        log::info!("Stream finished with [DONE]");
        return StreamFrame::Done;
    }

    match serde_json::from_str::<OpenAIStreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty())
            .map(StreamFrame::Delta)
            .unwrap_or(StreamFrame::Skip),
        Err(e) => {
            // Partial or garbled frame; the stream carries on without it.
            log::warn!("Skipping unparseable stream chunk: {} - Data: {}", e, data);
            StreamFrame::Skip
        }
    }
}

fn metadata_response_format() -> serde_json::Value {
    serde_json::json!({
        "type": "json_schema",
        "json_schema": {
            "name": "chat_metadata",
            "strict": true,
            "schema": {
                "type": "object",
                "properties": {
                    "chat_title": {
                        "type": "string",
                        "description": "Title of the chat based on the conversation content"
                    },
                    "summary": {
                        "type": "string",
                        "description": "A short summary of the chat"
                    },
                    "keywords": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "List of key topics or terms mentioned in the chat"
                    }
                },
                "required": ["chat_title", "summary", "keywords"]
            }
        }
    })
}

pub struct OpenAICompatibleProvider {
    client: Client,
    options: GenerationOptions,
}

impl Default for OpenAICompatibleProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAICompatibleProvider {
    pub fn new() -> Self {
        Self::with_options(GenerationOptions::default())
    }

    pub fn with_options(options: GenerationOptions) -> Self {
        Self {
            client: Client::new(),
            options,
        }
    }

    async fn post(
        &self,
        target: &InferenceTarget,
        body: &OpenAIRequestBody<'_>,
    ) -> Result<Response, InferenceError> {
        let request_url = target.completions_url();
        log::info!(
            "Sending {} request to {} using model: {}",
            if body.stream { "STREAM" } else { "chat" },
            request_url,
            body.model
        );

        let mut request = self.client.post(&request_url).json(body);
        if let Some(api_key) = &target.api_key {
            request = request.bearer_auth(api_key);
        }
        for (name, value) in target.provider.extra_headers() {
            request = request.header(*name, *value);
        }

        let response = request.send().await.map_err(|e| {
            log::error!("Failed to send request to {}: {}", request_url, e);
            InferenceError::from(e)
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response.text().await.unwrap_or_default();
            log::error!("API request failed with status {}: {}", status, error_body);
            let message = serde_json::from_str::<OpenAIErrorBody>(&error_body)
                .map(|body| body.error.message)
                .unwrap_or_else(|_| {
                    format!(
                        "API error: {}",
                        status.canonical_reason().unwrap_or(status.as_str())
                    )
                });
            return Err(InferenceError::status(status.as_u16(), message));
        }

        Ok(response)
    }

    /// Posts a non-streaming request and digs out `choices[0].message.content`.
    async fn post_for_content(
        &self,
        target: &InferenceTarget,
        body: &OpenAIRequestBody<'_>,
    ) -> Result<String, InferenceError> {
        let response = self.post(target, body).await?;
        let text = response.text().await?;

        let parsed: OpenAIResponse = serde_json::from_str(&text)
            .map_err(|e| InferenceError::Structural(format!("invalid completion body: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.is_empty())
            .ok_or_else(|| {
                InferenceError::Structural("missing choices[0].message.content".to_string())
            })
    }

    async fn request_classification(
        &self,
        target: &InferenceTarget,
        content: &str,
    ) -> Result<Classification, InferenceError> {
        let prompt = [ChatTurn::user(format!(
            "Generate metadata for this chat message: \"{}\"",
            content
        ))];
        let body = OpenAIRequestBody {
            model: target.provider.classification_model(),
            messages: &prompt,
            temperature: self.options.temperature,
            max_tokens: None,
            stream: false,
            response_format: Some(metadata_response_format()),
        };

        let raw = self.post_for_content(target, &body).await?;
        serde_json::from_str::<Classification>(&raw)
            .map_err(|e| InferenceError::Structural(format!("invalid metadata JSON: {}", e)))
    }
}

#[async_trait]
impl LLMApiProvider for OpenAICompatibleProvider {
    async fn send_chat_request(
        &self,
        target: &InferenceTarget,
        transcript: &[ChatTurn],
    ) -> Result<String, InferenceError> {
        let body = OpenAIRequestBody {
            model: &target.model,
            messages: transcript,
            temperature: self.options.temperature,
            max_tokens: self.options.max_tokens,
            stream: false,
            response_format: None,
        };
        self.post_for_content(target, &body).await
    }

    async fn send_chat_stream_request(
        &self,
        target: &InferenceTarget,
        transcript: &[ChatTurn],
    ) -> Result<DeltaStream, InferenceError> {
        let body = OpenAIRequestBody {
            model: &target.model,
            messages: transcript,
            temperature: self.options.temperature,
            max_tokens: self.options.max_tokens,
            stream: true, // Enable streaming
            response_format: None,
        };
        let response = self.post(target, &body).await?;

        // Process the SSE stream; stop at [DONE], drop frames without content
        let delta_stream = response
            .bytes_stream()
            .eventsource()
            .map(|event_result| match event_result {
                Ok(event) => Ok(parse_stream_frame(&event.data)),
                Err(e) => {
                    log::error!("Error reading stream event: {}", e);
                    Err(InferenceError::transport(format!("Error reading stream event: {}", e)))
                }
            })
            .take_while(|frame| future::ready(!matches!(frame, Ok(StreamFrame::Done))))
            .filter_map(|frame| {
                future::ready(match frame {
                    Ok(StreamFrame::Delta(content)) => Some(Ok(content)),
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                })
            });

        Ok(Box::pin(delta_stream))
    }

    async fn classify(&self, target: &InferenceTarget, content: &str) -> Classification {
        match self.request_classification(target, content).await {
            Ok(classification) => classification,
            Err(e) => {
                log::warn!("Chat classification failed, using fallback metadata: {}", e);
                Classification::fallback()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn target(server: &MockServer) -> InferenceTarget {
        InferenceTarget {
            provider: Provider::OpenAi,
            api_url: server.uri(),
            api_key: Some("k1".to_string()),
            model: "test-model".to_string(),
        }
    }

    fn sse(frames: &[&str]) -> ResponseTemplate {
        let body: String = frames.iter().map(|f| format!("{}\n\n", f)).collect();
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/event-stream")
            .set_body_raw(body, "text/event-stream")
    }

    fn delta(content: &str) -> String {
        format!("data: {}", json!({ "choices": [{ "delta": { "content": content } }] }))
    }

    fn transcript() -> Vec<ChatTurn> {
        vec![ChatTurn::system("be brief"), ChatTurn::user("Hello")]
    }

    fn config(provider: Option<Provider>, key: Option<&str>, url: Option<&str>) -> ProviderConfig {
        ProviderConfig {
            id: Uuid::new_v4(),
            user_id: "u1".into(),
            provider,
            api_key: key.map(String::from),
            base_url: url.map(String::from),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn target_resolution_checks_credentials() {
        assert!(InferenceTarget::from_config(None)
            .unwrap_err()
            .is_credential_missing());
        assert!(InferenceTarget::from_config(Some(&config(None, Some("k"), None)))
            .unwrap_err()
            .is_credential_missing());
        assert!(InferenceTarget::from_config(Some(&config(Some(Provider::OpenRouter), Some(""), None)))
            .unwrap_err()
            .is_credential_missing());

        let local = InferenceTarget::from_config(Some(&config(
            Some(Provider::Ollama),
            None,
            Some("http://gpu-box:11434/v1/"),
        )))
        .unwrap();
        assert_eq!(local.api_url, "http://gpu-box:11434/v1");
        assert_eq!(local.completions_url(), "http://gpu-box:11434/v1/chat/completions");

        let hosted =
            InferenceTarget::from_config(Some(&config(Some(Provider::OpenRouter), Some("k"), None)))
                .unwrap();
        assert_eq!(hosted.api_url, "https://openrouter.ai/api/v1");
        assert!(!format!("{:?}", hosted).contains("\"k\""));
    }

    #[test]
    fn stream_frames_are_classified() {
        assert_eq!(parse_stream_frame(" [DONE] "), StreamFrame::Done);
        assert_eq!(parse_stream_frame("{not json"), StreamFrame::Skip);
        assert_eq!(parse_stream_frame(r#"{"type":"ping"}"#), StreamFrame::Skip);
        assert_eq!(
            parse_stream_frame(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#),
            StreamFrame::Skip
        );
        assert_eq!(
            parse_stream_frame(r#"{"choices":[{"delta":{"content":"hi"}}]}"#),
            StreamFrame::Delta("hi".into())
        );
    }

    #[tokio::test]
    async fn complete_returns_message_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer k1"))
            .and(body_partial_json(json!({
                "model": "test-model",
                "stream": false,
                "messages": [
                    { "role": "system", "content": "be brief" },
                    { "role": "user", "content": "Hello" }
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "Hi there" } }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAICompatibleProvider::new();
        let text = provider
            .send_chat_request(&target(&server), &transcript())
            .await
            .unwrap();
        assert_eq!(text, "Hi there");
    }

    #[tokio::test]
    async fn missing_content_is_a_structural_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
            .mount(&server)
            .await;

        let err = OpenAICompatibleProvider::new()
            .send_chat_request(&target(&server), &transcript())
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Structural(_)), "{err:?}");
    }

    #[tokio::test]
    async fn error_status_is_a_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": { "message": "No auth credentials found" }
            })))
            .mount(&server)
            .await;

        let err = OpenAICompatibleProvider::new()
            .send_chat_request(&target(&server), &transcript())
            .await
            .unwrap_err();
        match err {
            InferenceError::Transport { status, message } => {
                assert_eq!(status, Some(401));
                assert_eq!(message, "No auth credentials found");
            }
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        let unreachable = InferenceTarget {
            provider: Provider::LmStudio,
            api_url: "http://127.0.0.1:1/v1".into(),
            api_key: None,
            model: "m".into(),
        };
        let err = OpenAICompatibleProvider::new()
            .send_chat_request(&unreachable, &transcript())
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Transport { status: None, .. }), "{err:?}");
    }

    #[tokio::test]
    async fn streaming_hands_every_delta_to_the_callback_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "stream": true })))
            .respond_with(sse(&[
                &delta("Hel"),
                &delta("lo, "),
                ": keep-alive comment",
                &delta("world"),
                "data: [DONE]",
            ]))
            .mount(&server)
            .await;

        let mut seen = Vec::new();
        let full = OpenAICompatibleProvider::new()
            .complete_streaming(&target(&server), &transcript(), &mut |chunk: &str| {
                seen.push(chunk.to_string())
            })
            .await
            .unwrap();

        assert_eq!(seen, ["Hel", "lo, ", "world"]);
        assert_eq!(full, seen.concat());
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped_and_done_ends_the_stream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sse(&[
                &delta("A"),
                "data: {\"choices\":[{\"delta\":{\"content\":",
                &delta("B"),
                "data: [DONE]",
                &delta("ignored"),
            ]))
            .mount(&server)
            .await;

        let mut chunks = 0;
        let full = OpenAICompatibleProvider::new()
            .complete_streaming(&target(&server), &transcript(), &mut |_: &str| chunks += 1)
            .await
            .unwrap();
        assert_eq!(full, "AB");
        assert_eq!(chunks, 2);
    }

    #[tokio::test]
    async fn classify_parses_structured_metadata() {
        let server = MockServer::start().await;
        let metadata = json!({
            "chat_title": "Rust ownership",
            "summary": "Questions about borrowing",
            "keywords": ["rust", "borrowing"]
        });
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "stream": false,
                "response_format": { "type": "json_schema" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": metadata.to_string() } }]
            })))
            .mount(&server)
            .await;

        let classification = OpenAICompatibleProvider::new()
            .classify(&target(&server), "How does borrowing work?")
            .await;
        assert_eq!(
            classification,
            Classification {
                title: "Rust ownership".into(),
                summary: "Questions about borrowing".into(),
                keywords: vec!["rust".into(), "borrowing".into()],
            }
        );
    }

    #[tokio::test]
    async fn classify_falls_back_on_any_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = OpenAICompatibleProvider::new();
        let fallback = provider.classify(&target(&server), "hi").await;
        assert_eq!(fallback.title, "New Chat");
        assert_eq!(fallback.summary, "Chat started");
        assert!(fallback.keywords.is_empty());

        let garbage = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "not metadata" } }]
            })))
            .mount(&garbage)
            .await;
        assert_eq!(
            provider.classify(&target(&garbage), "hi").await,
            Classification::fallback()
        );
    }
}

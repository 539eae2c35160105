//! Adapters for models running off the device
//!
//! Only reached after routing decided `external`, which requires recorded consent.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::download::is_transient_status;
use crate::error::{Result, RuntimeError};
use crate::inference::InferenceRequest;

#[async_trait]
pub trait ExternalModel: Send + Sync {
    async fn complete(&self, request: &InferenceRequest) -> Result<String>;

    fn name(&self) -> &str;

    fn model_info(&self) -> Option<String> {
        None
    }
}

/// Client for an OpenAI-compatible chat completions endpoint
pub struct OpenAiCompatibleModel {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    http_client: Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "no_stops")]
    stop: &'a [String],
    stream: bool,
}

fn no_stops(stop: &&[String]) -> bool {
    stop.is_empty()
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatContent>,
}

#[derive(Debug, Deserialize)]
struct ChatContent {
    #[serde(default)]
    content: String,
}

impl OpenAiCompatibleModel {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http_client = Client::builder().timeout(timeout).build().map_err(|e| {
            RuntimeError::plugin(format!("Failed to build HTTP client: {}", e))
        })?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            http_client,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[async_trait]
impl ExternalModel for OpenAiCompatibleModel {
    async fn complete(&self, request: &InferenceRequest) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.endpoint);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            temperature: request.params.temperature,
            top_p: request.params.top_p,
            max_tokens: request.params.max_tokens,
            stop: &request.params.stop_sequences,
            stream: false,
        };

        debug!("Sending external completion to {}", url);
        let start = Instant::now();

        let mut call = self.http_client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }
        let response = call.send().await.map_err(|e| {
            let message = format!("External model request failed: {}", e);
            let error = if e.is_timeout() || e.is_connect() {
                RuntimeError::network_transient(message)
            } else {
                RuntimeError::network_terminal(message)
            };
            error.with_context("url", &url)
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("External model returned HTTP {}: {}", status, text);
            let error = if is_transient_status(status) {
                RuntimeError::network_transient(message)
            } else {
                RuntimeError::network_terminal(message)
            };
            return Err(error.with_context("status", status.as_u16()));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            RuntimeError::plugin(format!("Invalid external model response: {}", e))
        })?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .map(|message| message.content)
            .ok_or_else(|| RuntimeError::plugin("External model response had no content"))?;

        info!(
            "External completion from {} in {:.2}s",
            self.model,
            start.elapsed().as_secs_f64()
        );
        Ok(content)
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }

    fn model_info(&self) -> Option<String> {
        Some(format!("{} at {}", self.model, self.endpoint))
    }
}

/// External model with canned replies, counting how often it was reached
pub struct CannedExternalModel {
    reply: String,
    calls: Mutex<Vec<String>>,
}

impl CannedExternalModel {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Prompts received so far
    pub fn calls(&self) -> Vec<String> {
        match self.calls.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl ExternalModel for CannedExternalModel {
    async fn complete(&self, request: &InferenceRequest) -> Result<String> {
        match self.calls.lock() {
            Ok(mut guard) => guard.push(request.prompt.clone()),
            Err(poisoned) => poisoned.into_inner().push(request.prompt.clone()),
        }
        Ok(self.reply.clone())
    }

    fn name(&self) -> &str {
        "canned"
    }
}

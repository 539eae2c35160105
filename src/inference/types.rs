//! Inference request and response types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::RuntimeError;

/// Sampling and length controls for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Nucleus sampling probability
    pub top_p: f32,
    pub stop_sequences: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 0.7,
            top_p: 0.9,
            stop_sequences: Vec::new(),
        }
    }
}

/// Request to generate text with a catalog model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
    pub model_id: String,
    pub prompt: String,
    #[serde(default)]
    pub params: GenerationParams,
    #[serde(default)]
    pub stream: bool,
}

impl InferenceRequest {
    pub fn new(model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            prompt: prompt.into(),
            params: GenerationParams::default(),
            stream: false,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.params.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.params.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.params.top_p = top_p;
        self
    }

    pub fn with_stop_sequences(mut self, stop_sequences: Vec<String>) -> Self {
        self.params.stop_sequences = stop_sequences;
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// `maxTokens` reached
    Length,
    /// Stop sequence matched or the model ended the sequence
    Stop,
    Error,
}

/// One incremental unit of output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingToken {
    pub token: String,
    pub token_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_prob: Option<f32>,
    /// Position in the stream, starting at 0
    pub index: usize,
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// Timing breakdown in milliseconds, accumulated from session start
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
    pub prompt_eval_ms: u64,
    pub generation_ms: u64,
    pub total_ms: u64,
}

impl Timings {
    pub fn from_durations(prompt_eval: Duration, generation: Duration, total: Duration) -> Self {
        Self {
            prompt_eval_ms: prompt_eval.as_millis() as u64,
            generation_ms: generation.as_millis() as u64,
            total_ms: total.as_millis() as u64,
        }
    }
}

/// Accumulated output of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResponse {
    pub session_id: String,
    pub model_id: String,
    pub text: String,
    pub prompt_tokens: usize,
    pub tokens_generated: usize,
    pub tokens_per_second: f64,
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    pub timings: Timings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RuntimeError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_params_default_when_omitted() {
        let request: InferenceRequest =
            serde_json::from_str(r#"{ "modelId": "phi-2", "prompt": "hi" }"#).unwrap();
        assert_eq!(request.params, GenerationParams::default());
        assert!(!request.stream);
    }

    #[test]
    fn test_partial_params() {
        let request: InferenceRequest = serde_json::from_str(
            r#"{ "modelId": "phi-2", "prompt": "hi", "params": { "maxTokens": 50, "stopSequences": ["\n"] }, "stream": true }"#,
        )
        .unwrap();
        assert_eq!(request.params.max_tokens, 50);
        assert_eq!(request.params.top_p, 0.9);
        assert_eq!(request.params.stop_sequences, vec!["\n".to_string()]);
        assert!(request.stream);
    }

    #[test]
    fn test_finish_reason_tags() {
        assert_eq!(serde_json::to_string(&FinishReason::Length).unwrap(), "\"length\"");
        let token = StreamingToken {
            token: "a".to_string(),
            token_id: 1,
            log_prob: None,
            index: 0,
            finished: false,
            finish_reason: None,
        };
        let json = serde_json::to_value(&token).unwrap();
        assert!(json.get("finishReason").is_none());
        assert_eq!(json["tokenId"], 1);
    }
}

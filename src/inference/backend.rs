//! Execution contract for the native inference library

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::types::InferenceRequest;
use crate::error::Result;

/// How a model should be loaded on this device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    pub threads: usize,
    pub use_memory_mapping: bool,
    pub context_length: u32,
}

/// Opaque reference to a loaded model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelHandle {
    pub id: u64,
    pub model_id: String,
    pub artifact_path: PathBuf,
}

/// A token as produced by the backend, before session bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedToken {
    pub text: String,
    pub token_id: u32,
    pub log_prob: Option<f32>,
}

impl GeneratedToken {
    pub fn new(text: impl Into<String>, token_id: u32) -> Self {
        Self {
            text: text.into(),
            token_id,
            log_prob: None,
        }
    }
}

/// Lazy token sequence of one generation
#[async_trait]
pub trait TokenSource: Send {
    /// `None` once the model ends the sequence
    async fn next_token(&mut self) -> Result<Option<GeneratedToken>>;

    /// Releases backend resources held by this generation
    fn release(&mut self) {}
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether one loaded model may serve several generations at once
    fn supports_concurrent_sessions(&self) -> bool;

    /// Prompt length in the model's tokens
    fn count_tokens(&self, text: &str) -> usize;

    async fn load(&self, model_id: &str, artifact: &Path, options: &LoadOptions) -> Result<ModelHandle>;

    async fn generate(
        &self,
        handle: &ModelHandle,
        request: &InferenceRequest,
    ) -> Result<Box<dyn TokenSource>>;

    async fn unload(&self, handle: &ModelHandle) -> Result<()>;
}

//! Deterministic simulated backend
//!
//! Stands in for the native library when none is linked. Output is a pure function
//! of the prompt, so identical requests stream identical tokens.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::backend::{ExecutionBackend, GeneratedToken, LoadOptions, ModelHandle, TokenSource};
use super::types::InferenceRequest;
use crate::error::{Result, RuntimeError};

const VOCABULARY: &[&str] = &[
    "the", "model", "runs", "locally", "on", "this", "device", "and", "keeps", "your",
    "data", "private", "while", "answering", "with", "short", "simulated", "tokens",
    "edge", "inference", "is", "fast", "enough", "for", "most", "prompts",
];

pub struct SimulatedBackend {
    token_delay: Duration,
    /// Tokens after which the model ends the sequence on its own
    sequence_limit: Option<usize>,
    next_handle: AtomicU64,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            token_delay: Duration::ZERO,
            sequence_limit: None,
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn with_token_delay(mut self, token_delay: Duration) -> Self {
        self.token_delay = token_delay;
        self
    }

    pub fn with_sequence_limit(mut self, limit: usize) -> Self {
        self.sequence_limit = Some(limit);
        self
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct SimulatedTokens {
    seed: [u8; 32],
    position: usize,
    limit: Option<usize>,
    delay: Duration,
}

#[async_trait]
impl TokenSource for SimulatedTokens {
    async fn next_token(&mut self) -> Result<Option<GeneratedToken>> {
        if self.limit.is_some_and(|limit| self.position >= limit) {
            return Ok(None);
        }
        if self.delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.delay).await;
        }

        let byte = self.seed[self.position % self.seed.len()] as usize;
        let token_id = ((byte + self.position * 7) % VOCABULARY.len()) as u32;
        let word = VOCABULARY[token_id as usize];
        let text = if self.position == 0 {
            word.to_string()
        } else {
            format!(" {}", word)
        };
        self.position += 1;

        Ok(Some(GeneratedToken {
            text,
            token_id,
            log_prob: Some(-((byte % 16) as f32) / 8.0),
        }))
    }
}

#[async_trait]
impl ExecutionBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    fn supports_concurrent_sessions(&self) -> bool {
        true
    }

    fn count_tokens(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }

    async fn load(&self, model_id: &str, artifact: &Path, options: &LoadOptions) -> Result<ModelHandle> {
        if !artifact.exists() {
            return Err(RuntimeError::plugin(format!(
                "Artifact {} does not exist",
                artifact.display()
            ))
            .with_context("model_id", model_id));
        }
        debug!(
            "Simulated load of {} ({} threads, mmap: {})",
            model_id, options.threads, options.use_memory_mapping
        );
        Ok(ModelHandle {
            id: self.next_handle.fetch_add(1, Ordering::SeqCst),
            model_id: model_id.to_string(),
            artifact_path: artifact.to_path_buf(),
        })
    }

    async fn generate(
        &self,
        _handle: &ModelHandle,
        request: &InferenceRequest,
    ) -> Result<Box<dyn TokenSource>> {
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&Sha256::digest(request.prompt.as_bytes()));
        Ok(Box::new(SimulatedTokens {
            seed,
            position: 0,
            limit: self.sequence_limit,
            delay: self.token_delay,
        }))
    }

    async fn unload(&self, handle: &ModelHandle) -> Result<()> {
        debug!("Simulated unload of {}", handle.model_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn collect(backend: &SimulatedBackend, prompt: &str, n: usize) -> Vec<GeneratedToken> {
        let file = NamedTempFile::new().unwrap();
        let options = LoadOptions {
            threads: 1,
            use_memory_mapping: false,
            context_length: 512,
        };
        let handle = backend.load("m", file.path(), &options).await.unwrap();
        let mut tokens = backend
            .generate(&handle, &InferenceRequest::new("m", prompt))
            .await
            .unwrap();

        let mut out = Vec::new();
        while out.len() < n {
            match tokens.next_token().await.unwrap() {
                Some(token) => out.push(token),
                None => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn test_output_is_deterministic() {
        let backend = SimulatedBackend::new();
        let a = collect(&backend, "hello there", 20).await;
        let b = collect(&backend, "hello there", 20).await;
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);
        assert!(!a[0].text.starts_with(' '));
        assert!(a[1].text.starts_with(' '));
    }

    #[tokio::test]
    async fn test_sequence_limit_ends_stream() {
        let backend = SimulatedBackend::new().with_sequence_limit(3);
        assert_eq!(collect(&backend, "x", 10).await.len(), 3);
    }

    #[tokio::test]
    async fn test_load_missing_artifact_is_plugin_error() {
        let backend = SimulatedBackend::new();
        let options = LoadOptions {
            threads: 1,
            use_memory_mapping: false,
            context_length: 512,
        };
        let err = backend
            .load("m", Path::new("/nonexistent/m.bin"), &options)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Plugin);
    }

    #[test]
    fn test_count_tokens() {
        let backend = SimulatedBackend::new();
        assert_eq!(backend.count_tokens("one two  three\nfour"), 4);
        assert_eq!(backend.count_tokens(""), 0);
    }
}

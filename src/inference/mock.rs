use super::backend::{ExecutionBackend, GeneratedToken, LoadOptions, ModelHandle, TokenSource};
use super::types::InferenceRequest;
use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// One scripted step of a mock generation
#[derive(Debug, Clone)]
pub enum MockStep {
    Token(String),
    Fail(RuntimeError),
}

/// Scripted output for one `generate` call
#[derive(Debug, Clone, Default)]
pub struct MockGeneration {
    pub steps: Vec<MockStep>,
    pub token_delay: Duration,
}

impl MockGeneration {
    pub fn tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            steps: tokens
                .into_iter()
                .map(|t| MockStep::Token(t.into()))
                .collect(),
            token_delay: Duration::ZERO,
        }
    }

    /// Emits the tokens, then fails
    pub fn failing_after<I, S>(tokens: I, error: RuntimeError) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut generation = Self::tokens(tokens);
        generation.steps.push(MockStep::Fail(error));
        generation
    }

    pub fn with_delay(mut self, token_delay: Duration) -> Self {
        self.token_delay = token_delay;
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    loads: AtomicUsize,
    unloads: AtomicUsize,
    releases: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

/// Execution backend that replays queued generations
pub struct MockBackend {
    generations: Mutex<VecDeque<MockGeneration>>,
    load_failure: Mutex<Option<RuntimeError>>,
    concurrent: bool,
    counters: Arc<Counters>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            generations: Mutex::new(VecDeque::new()),
            load_failure: Mutex::new(None),
            concurrent: true,
            counters: Arc::new(Counters::default()),
        }
    }

    /// A backend that declares itself unsafe for concurrent sessions
    pub fn exclusive() -> Self {
        Self {
            concurrent: false,
            ..Self::new()
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<MockGeneration>> {
        match self.generations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_generation(&self, generation: MockGeneration) {
        self.queue().push_back(generation);
    }

    pub fn add_generations(&self, generations: impl IntoIterator<Item = MockGeneration>) {
        let mut queue = self.queue();
        for generation in generations {
            queue.push_back(generation);
        }
    }

    /// Makes the next `load` fail with `error`
    pub fn fail_next_load(&self, error: RuntimeError) {
        let mut slot = match self.load_failure.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(error);
    }

    pub fn remaining_generations(&self) -> usize {
        self.queue().len()
    }

    pub fn loads(&self) -> usize {
        self.counters.loads.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.counters.unloads.load(Ordering::SeqCst)
    }

    /// Generations whose resources were released, by completion or cancellation
    pub fn releases(&self) -> usize {
        self.counters.releases.load(Ordering::SeqCst)
    }

    /// Highest number of generations that were running at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.counters.peak_active.load(Ordering::SeqCst)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct MockTokens {
    steps: VecDeque<MockStep>,
    delay: Duration,
    next_id: u32,
    counters: Arc<Counters>,
    released: bool,
}

impl MockTokens {
    fn finish(&mut self) {
        if !self.released {
            self.released = true;
            self.counters.active.fetch_sub(1, Ordering::SeqCst);
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockTokens {
    fn drop(&mut self) {
        self.finish();
    }
}

#[async_trait]
impl TokenSource for MockTokens {
    async fn next_token(&mut self) -> Result<Option<GeneratedToken>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        } else {
            tokio::task::yield_now().await;
        }

        match self.steps.pop_front() {
            Some(MockStep::Token(text)) => {
                self.next_id += 1;
                Ok(Some(GeneratedToken::new(text, self.next_id)))
            }
            Some(MockStep::Fail(error)) => Err(error),
            None => Ok(None),
        }
    }

    fn release(&mut self) {
        self.finish();
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn supports_concurrent_sessions(&self) -> bool {
        self.concurrent
    }

    fn count_tokens(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }

    async fn load(&self, model_id: &str, artifact: &Path, _options: &LoadOptions) -> Result<ModelHandle> {
        let failure = match self.load_failure.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(error) = failure {
            return Err(error);
        }
        let id = self.counters.loads.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        Ok(ModelHandle {
            id,
            model_id: model_id.to_string(),
            artifact_path: artifact.to_path_buf(),
        })
    }

    async fn generate(
        &self,
        _handle: &ModelHandle,
        _request: &InferenceRequest,
    ) -> Result<Box<dyn TokenSource>> {
        let generation = self
            .queue()
            .pop_front()
            .ok_or_else(|| RuntimeError::plugin("MockBackend: No more generations in queue"))?;

        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_active.fetch_max(active, Ordering::SeqCst);

        Ok(Box::new(MockTokens {
            steps: generation.steps.into(),
            delay: generation.token_delay,
            next_id: 0,
            counters: Arc::clone(&self.counters),
            released: false,
        }))
    }

    async fn unload(&self, _handle: &ModelHandle) -> Result<()> {
        self.counters.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

//! Lifecycle of one inference request
//!
//! A session is created only after its request passed validation. Tokens are pulled
//! lazily from the backend with one token of lookahead, so the terminal token is known
//! when it is emitted and carries `finished: true`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::backend::{ExecutionBackend, GeneratedToken, TokenSource};
use super::registry::ModelLease;
use super::types::{FinishReason, InferenceRequest, InferenceResponse, StreamingToken, Timings};
use crate::capability::Constraints;
use crate::catalog::ModelDescriptor;
use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Validating,
    Running,
    Streaming,
    Complete,
    Error,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }
}

#[derive(Debug, Default)]
struct CancelFlag {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation token, observed at token boundaries
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelFlag>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

enum Step {
    Token(GeneratedToken),
    End,
    Failed(RuntimeError),
    Cancelled,
}

pub struct InferenceSession {
    id: String,
    request: InferenceRequest,
    prompt_tokens: usize,
    backend: Arc<dyn ExecutionBackend>,
    lease: Option<ModelLease>,
    source: Option<Box<dyn TokenSource>>,
    state: SessionState,
    cancel: CancelHandle,

    lookahead: Option<GeneratedToken>,
    /// Generated text not yet emitted because it may begin a stop sequence
    held: String,
    deferred_error: Option<RuntimeError>,
    text: String,
    tokens_generated: usize,
    next_index: usize,
    finish_reason: Option<FinishReason>,
    error: Option<RuntimeError>,

    started: Instant,
    first_token_at: Option<Instant>,
    finished_at: Option<Instant>,
}

impl InferenceSession {
    /// Checks a request against the model and device limits.
    ///
    /// Runs before any session exists; a failure leaves no state behind.
    pub fn validate(
        request: &InferenceRequest,
        descriptor: &ModelDescriptor,
        constraints: &Constraints,
        prompt_tokens: usize,
    ) -> Result<()> {
        let params = &request.params;
        let invalid = |message: String| -> Result<()> {
            Err(RuntimeError::model(message).with_context("model_id", &descriptor.id))
        };

        if request.model_id != descriptor.id {
            return invalid(format!(
                "Request targets '{}' but session model is '{}'",
                request.model_id, descriptor.id
            ));
        }
        if params.max_tokens == 0 {
            return invalid("maxTokens must be at least 1".to_string());
        }
        if !(0.0..=2.0).contains(&params.temperature) {
            return invalid(format!(
                "temperature {} is outside 0.0..=2.0",
                params.temperature
            ));
        }
        if !(params.top_p > 0.0 && params.top_p <= 1.0) {
            return invalid(format!("topP {} is outside (0.0, 1.0]", params.top_p));
        }

        let context_window = descriptor.context_length.min(constraints.max_context_length) as usize;
        let needed = prompt_tokens + params.max_tokens as usize;
        if needed > context_window {
            return Err(RuntimeError::model(format!(
                "Prompt ({} tokens) plus maxTokens ({}) exceeds the context window of {}",
                prompt_tokens, params.max_tokens, context_window
            ))
            .with_context("model_id", &descriptor.id)
            .with_context("context_window", context_window));
        }
        Ok(())
    }

    pub(crate) fn new(
        id: String,
        request: InferenceRequest,
        prompt_tokens: usize,
        lease: ModelLease,
        backend: Arc<dyn ExecutionBackend>,
    ) -> Self {
        debug!("Session {} created for {}", id, request.model_id);
        Self {
            id,
            request,
            prompt_tokens,
            backend,
            lease: Some(lease),
            source: None,
            state: SessionState::Created,
            cancel: CancelHandle::new(),
            lookahead: None,
            held: String::new(),
            deferred_error: None,
            text: String::new(),
            tokens_generated: 0,
            next_index: 0,
            finish_reason: None,
            error: None,
            started: Instant::now(),
            first_token_at: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &InferenceRequest {
        &self.request
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether this session caused its model to be loaded
    pub fn loaded_model(&self) -> bool {
        self.lease.as_ref().is_some_and(|lease| lease.freshly_loaded)
    }

    /// Next token in generation order, `None` once the stream has ended
    pub async fn next_token(&mut self) -> Option<StreamingToken> {
        if self.state.is_terminal() {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.abort();
            return None;
        }
        if let Some(error) = self.deferred_error.take() {
            return Some(self.fail(error));
        }

        if self.source.is_none() {
            self.state = SessionState::Running;
            match self.open().await {
                Step::Cancelled => {
                    self.abort();
                    return None;
                }
                Step::Failed(error) => return Some(self.fail(error)),
                _ => {}
            }
            match self.pull().await {
                Step::Token(token) => self.lookahead = Some(token),
                Step::End => return Some(self.finish_empty()),
                Step::Failed(error) => return Some(self.fail(error)),
                Step::Cancelled => {
                    self.abort();
                    return None;
                }
            }
        }

        let current = self.lookahead.take()?;
        let mut text = std::mem::take(&mut self.held);
        text.push_str(&current.text);

        if let Some(cut) = self.stop_position(&text) {
            text.truncate(cut);
            return Some(self.emit(current, text, Some(FinishReason::Stop)));
        }
        if self.tokens_generated + 1 >= self.request.params.max_tokens as usize {
            return Some(self.emit(current, text, Some(FinishReason::Length)));
        }

        match self.pull().await {
            Step::Token(next) => {
                self.lookahead = Some(next);
                let keep = self.partial_stop_len(&text);
                self.held = text.split_off(text.len() - keep);
                Some(self.emit(current, text, None))
            }
            Step::End => Some(self.emit(current, text, Some(FinishReason::Stop))),
            Step::Failed(error) => {
                self.deferred_error = Some(error);
                Some(self.emit(current, text, None))
            }
            Step::Cancelled => {
                self.abort();
                None
            }
        }
    }

    /// Drains the stream and returns the final response
    pub async fn collect(mut self) -> InferenceResponse {
        while self.next_token().await.is_some() {}
        self.response()
    }

    /// The session as an ordered, finite token stream
    pub fn into_stream(self) -> impl Stream<Item = StreamingToken> + Send {
        futures_util::stream::unfold(self, |mut session| async move {
            let token = session.next_token().await?;
            Some((token, session))
        })
    }

    /// Snapshot of the accumulated output. Timings are final only in a terminal state.
    pub fn response(&self) -> InferenceResponse {
        let timings = self.timings();
        let generation_secs = timings.generation_ms as f64 / 1000.0;
        let tokens_per_second = if generation_secs > 0.0 {
            self.tokens_generated as f64 / generation_secs
        } else {
            0.0
        };

        InferenceResponse {
            session_id: self.id.clone(),
            model_id: self.request.model_id.clone(),
            text: self.text.clone(),
            prompt_tokens: self.prompt_tokens,
            tokens_generated: self.tokens_generated,
            tokens_per_second,
            finished: matches!(self.state, SessionState::Complete | SessionState::Error),
            finish_reason: self.finish_reason,
            timings,
            error: self.error.clone(),
        }
    }

    pub fn timings(&self) -> Timings {
        let end = self.finished_at.unwrap_or_else(Instant::now);
        let first = self.first_token_at.unwrap_or(end);
        Timings::from_durations(
            first.saturating_duration_since(self.started),
            end.saturating_duration_since(first),
            end.saturating_duration_since(self.started),
        )
    }

    async fn open(&mut self) -> Step {
        let cancel = self.cancel.clone();
        let Some(lease) = self.lease.as_ref() else {
            return Step::Cancelled;
        };
        let generated = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Step::Cancelled,
            generated = self.backend.generate(lease.handle(), &self.request) => generated,
        };
        match generated {
            Ok(source) => {
                self.source = Some(source);
                Step::End
            }
            Err(error) => Step::Failed(error),
        }
    }

    async fn pull(&mut self) -> Step {
        let cancel = self.cancel.clone();
        let Some(source) = self.source.as_mut() else {
            return Step::End;
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Step::Cancelled,
            next = source.next_token() => match next {
                Ok(Some(token)) => Step::Token(token),
                Ok(None) => Step::End,
                Err(error) => Step::Failed(error),
            },
        }
    }

    fn stop_position(&self, text: &str) -> Option<usize> {
        self.stop_sequences()
            .filter_map(|stop| text.find(stop))
            .min()
    }

    /// Length of the longest suffix of `text` that could still grow into a stop
    /// sequence. That suffix is held back until the next token decides it.
    fn partial_stop_len(&self, text: &str) -> usize {
        self.stop_sequences()
            .filter_map(|stop| {
                text.char_indices()
                    .map(|(i, _)| i)
                    .find(|&i| stop.starts_with(&text[i..]))
                    .map(|i| text.len() - i)
            })
            .max()
            .unwrap_or(0)
    }

    fn stop_sequences(&self) -> impl Iterator<Item = &str> {
        self.request
            .params
            .stop_sequences
            .iter()
            .map(String::as_str)
            .filter(|stop| !stop.is_empty())
    }

    fn emit(
        &mut self,
        token: GeneratedToken,
        text: String,
        finish: Option<FinishReason>,
    ) -> StreamingToken {
        let now = Instant::now();
        self.first_token_at.get_or_insert(now);
        self.tokens_generated += 1;
        self.text.push_str(&text);

        let streamed = StreamingToken {
            token: text,
            token_id: token.token_id,
            log_prob: token.log_prob,
            index: self.next_index,
            finished: finish.is_some(),
            finish_reason: finish,
        };
        self.next_index += 1;

        match finish {
            Some(reason) => self.complete(reason, SessionState::Complete),
            None => self.state = SessionState::Streaming,
        }
        streamed
    }

    fn finish_empty(&mut self) -> StreamingToken {
        let token = self.terminal_token(FinishReason::Stop);
        self.complete(FinishReason::Stop, SessionState::Complete);
        token
    }

    fn fail(&mut self, error: RuntimeError) -> StreamingToken {
        warn!(
            "Session {} failed after {} tokens: {}",
            self.id, self.tokens_generated, error
        );
        let error = error
            .with_context("session_id", &self.id)
            .with_context("tokens_generated", self.tokens_generated);
        self.error = Some(error);
        let token = self.terminal_token(FinishReason::Error);
        self.complete(FinishReason::Error, SessionState::Error);
        token
    }

    fn terminal_token(&mut self, reason: FinishReason) -> StreamingToken {
        let token = StreamingToken {
            token: String::new(),
            token_id: 0,
            log_prob: None,
            index: self.next_index,
            finished: true,
            finish_reason: Some(reason),
        };
        self.next_index += 1;
        token
    }

    fn complete(&mut self, reason: FinishReason, state: SessionState) {
        self.finish_reason = Some(reason);
        self.state = state;
        self.finished_at = Some(Instant::now());
        self.release();
        info!(
            "Session {} finished ({:?}) with {} tokens",
            self.id, reason, self.tokens_generated
        );
    }

    fn abort(&mut self) {
        self.state = SessionState::Cancelled;
        self.finished_at = Some(Instant::now());
        self.lookahead = None;
        self.held.clear();
        self.deferred_error = None;
        self.release();
        info!(
            "Session {} cancelled after {} tokens",
            self.id, self.tokens_generated
        );
    }

    fn release(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.release();
        }
        self.lease = None;
    }
}

impl Drop for InferenceSession {
    fn drop(&mut self) {
        self.release();
    }
}

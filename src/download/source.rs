//! Artifact sources
//!
//! The manager only needs "give me the bytes of this URL from offset N". HTTP is the
//! production source; [`MemorySource`] serves fixed payloads with scripted failures.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use tracing::debug;

use crate::error::{Result, RuntimeError};

/// Incremental body of an opened artifact
#[async_trait]
pub trait ArtifactBody: Send {
    /// Next chunk, `None` at end of body
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

pub struct OpenedArtifact {
    pub body: Box<dyn ArtifactBody>,
    /// Offset of the first byte of `body`. Zero when the server ignored the range
    pub start_offset: u64,
    /// Total artifact size when the server reported it
    pub total_bytes: Option<u64>,
}

#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn open(&self, url: &str, offset: u64) -> Result<OpenedArtifact>;
}

/// Whether an HTTP status is worth retrying against the same URL
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

fn status_error(url: &str, status: StatusCode) -> RuntimeError {
    let message = format!("HTTP {} from {}", status, url);
    let err = if is_transient_status(status) {
        RuntimeError::network_transient(message)
    } else {
        RuntimeError::network_terminal(message)
    };
    err.with_context("url", url)
        .with_context("status", status.as_u16())
}

fn reqwest_error(url: &str, e: reqwest::Error) -> RuntimeError {
    let message = format!("Request to {} failed: {}", url, e);
    let err = if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        RuntimeError::network_transient(message)
    } else {
        RuntimeError::network_terminal(message)
    };
    err.with_context("url", url)
}

/// Plain HTTP(S) source using ranged GET requests
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .user_agent(concat!("edgellm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RuntimeError::network_terminal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

struct HttpBody {
    url: String,
    response: reqwest::Response,
}

#[async_trait]
impl ArtifactBody for HttpBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.response
            .chunk()
            .await
            .map_err(|e| reqwest_error(&self.url, e))
    }
}

/// Parses the total from `Content-Range: bytes 100-199/1000`
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

#[async_trait]
impl ArtifactSource for HttpSource {
    async fn open(&self, url: &str, offset: u64) -> Result<OpenedArtifact> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().await.map_err(|e| reqwest_error(url, e))?;
        let status = response.status();

        let (start_offset, total_bytes) = match status {
            StatusCode::PARTIAL_CONTENT => {
                let total = response
                    .headers()
                    .get(reqwest::header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(content_range_total);
                (offset, total)
            }
            StatusCode::OK => {
                if offset > 0 {
                    debug!("{} ignored the range request, body starts at 0", url);
                }
                (0, response.content_length())
            }
            other => return Err(status_error(url, other)),
        };

        Ok(OpenedArtifact {
            body: Box::new(HttpBody {
                url: url.to_string(),
                response,
            }),
            start_offset,
            total_bytes,
        })
    }
}

/// A failure injected into [`MemorySource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Injected {
    /// `open` fails with this HTTP status
    Status(u16),
    /// The body drops the connection after delivering this many bytes
    DropAfter(u64),
}

#[derive(Debug, Default)]
struct MemoryState {
    failures: HashMap<String, VecDeque<Injected>>,
    opened: Vec<(String, u64)>,
}

/// In-memory artifact source with scripted failures
#[derive(Debug)]
pub struct MemorySource {
    payloads: HashMap<String, Bytes>,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
    honor_range: bool,
    state: Mutex<MemoryState>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            payloads: HashMap::new(),
            chunk_size: 64 * 1024,
            chunk_delay: None,
            honor_range: true,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn with_payload(mut self, url: &str, payload: impl Into<Bytes>) -> Self {
        self.payloads.insert(url.to_string(), payload.into());
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Pause before every chunk, leaving room to cancel mid-transfer
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Serve full bodies regardless of the requested offset
    pub fn ignoring_ranges(mut self) -> Self {
        self.honor_range = false;
        self
    }

    /// Queues a failure for the next `open` of `url`
    pub fn inject(&self, url: &str, failure: Injected) {
        self.lock()
            .failures
            .entry(url.to_string())
            .or_default()
            .push_back(failure);
    }

    /// Every `(url, offset)` passed to `open`, in call order
    pub fn opened(&self) -> Vec<(String, u64)> {
        self.lock().opened.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryBody {
    url: String,
    data: Bytes,
    position: usize,
    chunk_size: usize,
    delay: Option<Duration>,
    drop_at: Option<usize>,
}

#[async_trait]
impl ArtifactBody for MemoryBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match self.delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }

        if let Some(drop_at) = self.drop_at {
            if self.position >= drop_at {
                return Err(RuntimeError::network_transient(format!(
                    "Connection to {} reset",
                    self.url
                )));
            }
        }
        if self.position >= self.data.len() {
            return Ok(None);
        }

        let limit = self.drop_at.unwrap_or(self.data.len()).min(self.data.len());
        let end = (self.position + self.chunk_size).min(limit);
        let chunk = self.data.slice(self.position..end);
        self.position = end;
        Ok(Some(chunk))
    }
}

#[async_trait]
impl ArtifactSource for MemorySource {
    async fn open(&self, url: &str, offset: u64) -> Result<OpenedArtifact> {
        let failure = {
            let mut state = self.lock();
            state.opened.push((url.to_string(), offset));
            state.failures.get_mut(url).and_then(|queue| queue.pop_front())
        };

        let payload = self.payloads.get(url).cloned().ok_or_else(|| {
            status_error(url, StatusCode::NOT_FOUND)
        })?;

        let drop_after = match failure {
            Some(Injected::Status(code)) => {
                let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                return Err(status_error(url, status));
            }
            Some(Injected::DropAfter(bytes)) => Some(bytes as usize),
            None => None,
        };

        let start_offset = if self.honor_range { offset } else { 0 };
        let data = payload.slice((start_offset as usize).min(payload.len())..);

        Ok(OpenedArtifact {
            body: Box::new(MemoryBody {
                url: url.to_string(),
                data,
                position: 0,
                chunk_size: self.chunk_size,
                delay: self.chunk_delay,
                drop_at: drop_after,
            }),
            start_offset,
            total_bytes: Some(payload.len() as u64),
        })
    }
}

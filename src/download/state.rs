//! Download progress snapshots and the progress stream

use std::path::PathBuf;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Verifying,
    Complete,
    Error,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DownloadStatus::Complete | DownloadStatus::Error)
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Verifying => "verifying",
            DownloadStatus::Complete => "complete",
            DownloadStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// One progress snapshot of a transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadState {
    pub model_id: String,
    pub target_path: PathBuf,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub status: DownloadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RuntimeError>,
    /// Whether a later `download` call continues from `bytes_downloaded`
    #[serde(default)]
    pub resumable: bool,
    #[serde(default)]
    pub bytes_per_second: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
}

impl DownloadState {
    pub fn pending(model_id: &str, target_path: PathBuf, total_bytes: u64) -> Self {
        Self {
            model_id: model_id.to_string(),
            target_path,
            bytes_downloaded: 0,
            total_bytes,
            status: DownloadStatus::Pending,
            error: None,
            resumable: false,
            bytes_per_second: 0.0,
            eta_seconds: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.bytes_downloaded as f64 * 100.0 / self.total_bytes as f64
    }
}

/// Observer of one transfer's progress.
///
/// Yields the current snapshot first, then every later snapshot it observes, and
/// ends after the terminal one. Several observers of the same transfer each see
/// the terminal snapshot; intermediate snapshots may be skipped under load.
#[derive(Debug)]
pub struct DownloadProgress {
    rx: watch::Receiver<DownloadState>,
    started: bool,
    done: bool,
}

impl DownloadProgress {
    pub(crate) fn new(rx: watch::Receiver<DownloadState>) -> Self {
        Self {
            rx,
            started: false,
            done: false,
        }
    }

    /// Progress for a transfer that is already finished
    pub(crate) fn finished(state: DownloadState) -> Self {
        let (_tx, rx) = watch::channel(state);
        Self::new(rx)
    }

    pub fn current(&self) -> DownloadState {
        self.rx.borrow().clone()
    }

    pub async fn next(&mut self) -> Option<DownloadState> {
        if self.done {
            return None;
        }

        if self.started && self.rx.changed().await.is_err() {
            self.done = true;
            return None;
        }
        self.started = true;

        let state = self.rx.borrow_and_update().clone();
        if state.is_terminal() {
            self.done = true;
        }
        Some(state)
    }

    /// Drives the stream to its end and returns the terminal snapshot
    pub async fn wait(mut self) -> DownloadState {
        let mut last = self.current();
        while let Some(state) = self.next().await {
            last = state;
        }
        last
    }

    pub fn into_stream(self) -> impl Stream<Item = DownloadState> {
        futures_util::stream::unfold(self, |mut progress| async move {
            progress.next().await.map(|state| (state, progress))
        })
    }
}

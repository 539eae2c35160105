//! Resumable, verified, coalescing model downloads

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::locks::ArtifactLocks;
use super::source::ArtifactSource;
use super::state::{DownloadProgress, DownloadState, DownloadStatus};
use super::store::{LocalModel, ModelStore, ResumeMarker};
use super::verify::verify_artifact;
use crate::catalog::ModelDescriptor;
use crate::error::{ErrorKind, Result, RuntimeError};

/// Retry and durability knobs
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Bytes written between resume-marker checkpoints
    pub checkpoint_bytes: u64,
    /// Attempts per URL before falling through to the next mirror
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            checkpoint_bytes: 1024 * 1024,
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

struct Transfer {
    rx: watch::Receiver<DownloadState>,
    cancel: Arc<AtomicBool>,
}

/// How a transfer failed and whether its partial file survived
struct Failure {
    error: RuntimeError,
    resumable: bool,
}

impl Failure {
    fn resumable(error: RuntimeError) -> Self {
        Self {
            error,
            resumable: true,
        }
    }

    fn discarded(error: RuntimeError) -> Self {
        Self {
            error,
            resumable: false,
        }
    }
}

enum FetchEnd {
    Complete,
    EndedEarly,
    Cancelled,
}

struct Inner {
    store: Arc<ModelStore>,
    source: Arc<dyn ArtifactSource>,
    locks: ArtifactLocks,
    config: DownloadConfig,
    transfers: Mutex<HashMap<String, Transfer>>,
}

/// Owns every transfer; at most one in flight per model id
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    pub fn new(
        store: Arc<ModelStore>,
        source: Arc<dyn ArtifactSource>,
        locks: ArtifactLocks,
        config: DownloadConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                source,
                locks,
                config,
                transfers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &ModelStore {
        &self.inner.store
    }

    /// Downloads into the store's default artifact location
    pub fn download_model(&self, descriptor: &ModelDescriptor) -> DownloadProgress {
        let target = self.inner.store.artifact_path(&descriptor.id);
        self.download(descriptor, &target)
    }

    /// Starts, joins or short-circuits the transfer of `descriptor` to `target_path`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn download(&self, descriptor: &ModelDescriptor, target_path: &Path) -> DownloadProgress {
        let mut transfers = self.inner.lock_transfers();

        if let Some(existing) = transfers.get(&descriptor.id) {
            if !existing.rx.borrow().is_terminal() {
                debug!("Joining in-flight download of {}", descriptor.id);
                return DownloadProgress::new(existing.rx.clone());
            }
        }

        if let Some(local) = self.inner.store.verified_artifact(descriptor) {
            if local.artifact_path == target_path {
                info!("Model {} already downloaded and verified", descriptor.id);
                return DownloadProgress::finished(complete_state(&local));
            }
        }

        let (tx, rx) = watch::channel(DownloadState::pending(
            &descriptor.id,
            target_path.to_path_buf(),
            descriptor.size_bytes,
        ));
        let cancel = Arc::new(AtomicBool::new(false));
        transfers.insert(
            descriptor.id.clone(),
            Transfer {
                rx: rx.clone(),
                cancel: Arc::clone(&cancel),
            },
        );
        drop(transfers);

        let inner = Arc::clone(&self.inner);
        let descriptor = descriptor.clone();
        let target = target_path.to_path_buf();
        tokio::spawn(async move {
            inner.run(descriptor, target, tx, cancel).await;
        });

        DownloadProgress::new(rx)
    }

    /// Latest known state for a model: the in-flight or last transfer, else what is on disk
    pub fn progress(&self, model_id: &str) -> Option<DownloadState> {
        if let Some(transfer) = self.inner.lock_transfers().get(model_id) {
            return Some(transfer.rx.borrow().clone());
        }

        let store = &self.inner.store;
        if let Some(local) = store.local_model(model_id) {
            return Some(complete_state(&local));
        }

        store.load_marker(model_id).map(|marker| DownloadState {
            bytes_downloaded: marker.confirmed_offset,
            resumable: true,
            ..DownloadState::pending(model_id, store.artifact_path(model_id), marker.total_bytes)
        })
    }

    /// Requests cancellation of an in-flight transfer. The partial file is kept
    pub fn cancel(&self, model_id: &str) -> bool {
        match self.inner.lock_transfers().get(model_id) {
            Some(transfer) if !transfer.rx.borrow().is_terminal() => {
                info!("Cancelling download of {}", model_id);
                transfer.cancel.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// Deletes a local model once no session references it
    pub async fn remove(&self, model_id: &str) -> Result<bool> {
        {
            let mut transfers = self.inner.lock_transfers();
            if let Some(transfer) = transfers.get(model_id) {
                if !transfer.rx.borrow().is_terminal() {
                    return Err(RuntimeError::model(format!(
                        "Model '{}' is being downloaded",
                        model_id
                    ))
                    .with_context("model_id", model_id));
                }
            }
            transfers.remove(model_id);
        }

        let _exclusive = self.inner.locks.exclusive(model_id).await;
        let removed = self.inner.store.remove(model_id)?;
        if removed {
            info!("Removed model {}", model_id);
        }
        Ok(removed)
    }
}

fn complete_state(local: &LocalModel) -> DownloadState {
    DownloadState {
        bytes_downloaded: local.size_bytes,
        status: DownloadStatus::Complete,
        eta_seconds: Some(0),
        ..DownloadState::pending(&local.model_id, local.artifact_path.clone(), local.size_bytes)
    }
}

fn io_failure(action: &str, path: &Path, e: std::io::Error) -> RuntimeError {
    RuntimeError::model(format!("Failed to {} {}: {}", action, path.display(), e))
        .with_context("path", path.display())
}

impl Inner {
    fn lock_transfers(&self) -> MutexGuard<'_, HashMap<String, Transfer>> {
        match self.transfers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn run(
        self: Arc<Self>,
        descriptor: ModelDescriptor,
        target: PathBuf,
        tx: watch::Sender<DownloadState>,
        cancel: Arc<AtomicBool>,
    ) {
        let outcome = self.transfer(&descriptor, &target, &tx, &cancel).await;

        tx.send_modify(|state| match outcome {
            Ok(()) => {
                info!("Downloaded and verified {}", descriptor.id);
                state.status = DownloadStatus::Complete;
                state.bytes_downloaded = state.total_bytes;
                state.eta_seconds = Some(0);
                state.resumable = false;
            }
            Err(failure) => {
                warn!(
                    "Download of {} failed at {}/{} bytes (resumable: {}): {}",
                    descriptor.id,
                    state.bytes_downloaded,
                    state.total_bytes,
                    failure.resumable,
                    failure.error
                );
                state.status = DownloadStatus::Error;
                state.resumable = failure.resumable;
                state.eta_seconds = None;
                state.error = Some(
                    failure
                        .error
                        .with_context("bytes_downloaded", state.bytes_downloaded),
                );
            }
        });
    }

    async fn transfer(
        &self,
        descriptor: &ModelDescriptor,
        target: &Path,
        tx: &watch::Sender<DownloadState>,
        cancel: &AtomicBool,
    ) -> std::result::Result<(), Failure> {
        let model_id = &descriptor.id;
        let total = descriptor.size_bytes;

        let mut offset = self
            .store
            .resume_offset(descriptor)
            .map_err(Failure::resumable)?;
        if offset > 0 {
            info!("Resuming {} from byte {} of {}", model_id, offset, total);
        } else {
            info!("Downloading {} ({} bytes)", model_id, total);
        }

        tx.send_modify(|state| {
            state.status = DownloadStatus::Downloading;
            state.bytes_downloaded = offset;
            state.resumable = offset > 0;
        });

        let started = Instant::now();
        let first_offset = offset;
        let urls = &descriptor.download_urls;
        let mut url_index = 0;
        let mut attempt = 0;
        let mut backoff = self.config.initial_backoff;

        while offset < total {
            if cancel.load(Ordering::SeqCst) {
                return Err(Failure::resumable(cancelled(model_id)));
            }

            let url = &urls[url_index];
            let result = self
                .fetch(url, descriptor, &mut offset, tx, cancel, started, first_offset)
                .await;

            let error = match result {
                Ok(FetchEnd::Complete) => break,
                Ok(FetchEnd::Cancelled) => return Err(Failure::resumable(cancelled(model_id))),
                Ok(FetchEnd::EndedEarly) => RuntimeError::network_transient(format!(
                    "Connection to {} closed at byte {} of {}",
                    url, offset, total
                )),
                Err(e) => e,
            };

            if error.kind != ErrorKind::Network {
                return Err(Failure::resumable(error));
            }

            attempt += 1;
            let retry_same_url = error.is_transient() && attempt < self.config.max_attempts;
            if retry_same_url {
                warn!(
                    "Transient failure downloading {} (attempt {}/{}), retrying in {:?}: {}",
                    model_id, attempt, self.config.max_attempts, backoff, error
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.config.max_backoff);
                continue;
            }

            url_index += 1;
            if url_index >= urls.len() {
                return Err(Failure::resumable(error.with_context("attempts", attempt)));
            }
            warn!("Giving up on {} ({}), trying mirror {}", url, error, urls[url_index]);
            attempt = 0;
            backoff = self.config.initial_backoff;
        }

        self.verify_and_commit(descriptor, target, tx).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch(
        &self,
        url: &str,
        descriptor: &ModelDescriptor,
        offset: &mut u64,
        tx: &watch::Sender<DownloadState>,
        cancel: &AtomicBool,
        started: Instant,
        first_offset: u64,
    ) -> Result<FetchEnd> {
        let total = descriptor.size_bytes;
        let partial = self.store.partial_path(&descriptor.id);

        let opened = self.source.open(url, *offset).await?;
        if let Some(reported) = opened.total_bytes {
            if reported != total {
                warn!(
                    "{} reports {} bytes, catalog declares {}",
                    url, reported, total
                );
            }
        }

        // A server that ignores the range resends bytes we already have
        let mut skip = offset.saturating_sub(opened.start_offset);
        let mut body = opened.body;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&partial)
            .await
            .map_err(|e| io_failure("open", &partial, e))?;
        let mut unconfirmed = 0u64;

        loop {
            let chunk = match body.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    self.checkpoint(&mut file, descriptor, *offset).await?;
                    return Err(e);
                }
            };

            let mut data = &chunk[..];
            if skip > 0 {
                let n = (skip as usize).min(data.len());
                data = &data[n..];
                skip -= n as u64;
            }
            let remaining = total - *offset;
            if data.len() as u64 > remaining {
                data = &data[..remaining as usize];
            }

            if !data.is_empty() {
                file.write_all(data)
                    .await
                    .map_err(|e| io_failure("write", &partial, e))?;
                *offset += data.len() as u64;
                unconfirmed += data.len() as u64;

                if unconfirmed >= self.config.checkpoint_bytes {
                    self.checkpoint(&mut file, descriptor, *offset).await?;
                    unconfirmed = 0;
                }
                publish_progress(tx, *offset, started, first_offset);
            }

            if *offset >= total {
                self.checkpoint(&mut file, descriptor, *offset).await?;
                return Ok(FetchEnd::Complete);
            }
            if cancel.load(Ordering::SeqCst) {
                self.checkpoint(&mut file, descriptor, *offset).await?;
                return Ok(FetchEnd::Cancelled);
            }
        }

        self.checkpoint(&mut file, descriptor, *offset).await?;
        Ok(FetchEnd::EndedEarly)
    }

    /// Makes the partial durable up to `offset` and records it in the resume marker
    async fn checkpoint(&self, file: &mut File, descriptor: &ModelDescriptor, offset: u64) -> Result<()> {
        let partial = self.store.partial_path(&descriptor.id);
        file.flush()
            .await
            .map_err(|e| io_failure("flush", &partial, e))?;
        file.sync_data()
            .await
            .map_err(|e| io_failure("sync", &partial, e))?;

        self.store.save_marker(&ResumeMarker {
            model_id: descriptor.id.clone(),
            checksum: descriptor.checksum.clone(),
            total_bytes: descriptor.size_bytes,
            confirmed_offset: offset,
        })
    }

    async fn verify_and_commit(
        &self,
        descriptor: &ModelDescriptor,
        target: &Path,
        tx: &watch::Sender<DownloadState>,
    ) -> std::result::Result<(), Failure> {
        let model_id = &descriptor.id;
        let partial = self.store.partial_path(model_id);

        tx.send_modify(|state| {
            state.status = DownloadStatus::Verifying;
            state.bytes_downloaded = state.total_bytes;
            state.eta_seconds = None;
        });
        debug!("Verifying {}", model_id);

        let path = partial.clone();
        let checksum = descriptor.checksum.clone();
        let legacy_md5 = descriptor.legacy_md5.clone();
        let verified = tokio::task::spawn_blocking(move || {
            verify_artifact(&path, &checksum, legacy_md5.as_deref())
        })
        .await
        .map_err(|e| {
            Failure::resumable(RuntimeError::model(format!(
                "Verification task failed: {}",
                e
            )))
        })?;

        if let Err(error) = verified {
            warn!("Discarding corrupt download of {}: {}", model_id, error);
            if let Err(cleanup) = self.store.discard_partial(model_id) {
                warn!("Failed to discard partial of {}: {}", model_id, cleanup);
            }
            return Err(Failure::discarded(error.with_context("model_id", model_id)));
        }

        let _exclusive = self.locks.exclusive(model_id).await;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Failure::resumable(io_failure("create", parent, e)))?;
        }
        tokio::fs::rename(&partial, target)
            .await
            .map_err(|e| Failure::resumable(io_failure("move", &partial, e)))?;

        self.store
            .discard_partial(model_id)
            .and_then(|()| self.store.record_download(descriptor, target))
            .map_err(Failure::resumable)?;
        Ok(())
    }
}

fn cancelled(model_id: &str) -> RuntimeError {
    RuntimeError::network_terminal("Download cancelled").with_context("model_id", model_id)
}

fn publish_progress(tx: &watch::Sender<DownloadState>, offset: u64, started: Instant, first_offset: u64) {
    let elapsed = started.elapsed().as_secs_f64();
    let transferred = offset.saturating_sub(first_offset);

    tx.send_modify(|state| {
        state.bytes_downloaded = offset;
        if elapsed > 0.0 && transferred > 0 {
            state.bytes_per_second = transferred as f64 / elapsed;
            let remaining = state.total_bytes.saturating_sub(offset);
            state.eta_seconds = Some((remaining as f64 / state.bytes_per_second).ceil() as u64);
        }
    });
}

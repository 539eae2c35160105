//! Loaded models, admission control and reference-counted teardown

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use super::backend::{ExecutionBackend, LoadOptions, ModelHandle};
use super::session::InferenceSession;
use super::types::InferenceRequest;
use crate::capability::SystemCapabilities;
use crate::catalog::ModelDescriptor;
use crate::download::{ArtifactLocks, ModelStore, SharedArtifactGuard};
use crate::error::{Result, RuntimeError};

/// A model loaded into the backend, shared read-only by its sessions
pub struct LoadedModel {
    pub descriptor: ModelDescriptor,
    pub handle: ModelHandle,
    admission: Arc<Semaphore>,
    slots: u32,
    sessions: AtomicUsize,
}

impl LoadedModel {
    pub fn active_sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

/// Admission to run one session against a loaded model.
///
/// Holds the model, a shared guard on its artifact and an admission slot until dropped.
pub struct ModelLease {
    model: Arc<LoadedModel>,
    _slot: OwnedSemaphorePermit,
    _artifact: SharedArtifactGuard,
    /// Whether this acquisition loaded the model into the backend
    pub freshly_loaded: bool,
}

impl ModelLease {
    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.model.descriptor
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.model.handle
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        self.model.sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ModelRegistry {
    backend: Arc<dyn ExecutionBackend>,
    store: Arc<ModelStore>,
    locks: ArtifactLocks,
    max_concurrent_sessions: u32,
    loaded: Mutex<HashMap<String, Arc<LoadedModel>>>,
}

impl ModelRegistry {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        store: Arc<ModelStore>,
        locks: ArtifactLocks,
        max_concurrent_sessions: u32,
    ) -> Self {
        Self {
            backend,
            store,
            locks,
            max_concurrent_sessions: max_concurrent_sessions.max(1),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    pub async fn loaded_models(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.loaded.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Loads the model if needed and waits for an admission slot.
    ///
    /// Fails with `ModelError` unless a verified artifact for this descriptor is on disk.
    pub async fn acquire(
        &self,
        descriptor: &ModelDescriptor,
        capabilities: &SystemCapabilities,
    ) -> Result<ModelLease> {
        let artifact_guard = self.locks.shared(&descriptor.id).await;
        let local = self.store.verified_artifact(descriptor).ok_or_else(|| {
            RuntimeError::model(format!(
                "Model '{}' has not been downloaded and verified",
                descriptor.id
            ))
            .with_context("model_id", &descriptor.id)
        })?;

        let (model, freshly_loaded) = {
            let mut loaded = self.loaded.lock().await;
            match loaded.get(&descriptor.id) {
                Some(model) => (Arc::clone(model), false),
                None => {
                    let options = LoadOptions {
                        threads: capabilities.constraints.recommended_threads,
                        use_memory_mapping: capabilities.constraints.use_memory_mapping,
                        context_length: descriptor
                            .context_length
                            .min(capabilities.constraints.max_context_length),
                    };
                    let handle = self
                        .backend
                        .load(&descriptor.id, &local.artifact_path, &options)
                        .await?;

                    let slots = if self.backend.supports_concurrent_sessions() {
                        self.max_concurrent_sessions
                    } else {
                        1
                    };
                    info!(
                        "Loaded {} via {} backend ({} session slot(s))",
                        descriptor.id,
                        self.backend.name(),
                        slots
                    );

                    let model = Arc::new(LoadedModel {
                        descriptor: descriptor.clone(),
                        handle,
                        admission: Arc::new(Semaphore::new(slots as usize)),
                        slots,
                        sessions: AtomicUsize::new(0),
                    });
                    loaded.insert(descriptor.id.clone(), Arc::clone(&model));
                    (model, true)
                }
            }
        };

        let slot = Arc::clone(&model.admission)
            .acquire_owned()
            .await
            .map_err(|_| {
                RuntimeError::model(format!("Model '{}' was unloaded", descriptor.id))
                    .with_context("model_id", &descriptor.id)
            })?;
        model.sessions.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = self.store.mark_used(&descriptor.id) {
            debug!("Could not update usage of {}: {}", descriptor.id, e);
        }

        Ok(ModelLease {
            model,
            _slot: slot,
            _artifact: artifact_guard,
            freshly_loaded,
        })
    }

    /// Validates the request, then admits a session for it.
    ///
    /// Validation failures return before any model is loaded or slot taken.
    pub async fn start_session(
        &self,
        session_id: impl Into<String>,
        request: InferenceRequest,
        descriptor: &ModelDescriptor,
        capabilities: &SystemCapabilities,
    ) -> Result<InferenceSession> {
        let prompt_tokens = self.backend.count_tokens(&request.prompt);
        InferenceSession::validate(&request, descriptor, &capabilities.constraints, prompt_tokens)?;

        let lease = self.acquire(descriptor, capabilities).await?;
        Ok(InferenceSession::new(
            session_id.into(),
            request,
            prompt_tokens,
            lease,
            Arc::clone(&self.backend),
        ))
    }

    /// Unloads a model once every session using it has finished
    pub async fn unload(&self, model_id: &str) -> Result<bool> {
        let Some(model) = self.loaded.lock().await.remove(model_id) else {
            return Ok(false);
        };

        let drained = Arc::clone(&model.admission)
            .acquire_many_owned(model.slots)
            .await
            .map_err(|_| RuntimeError::model(format!("Model '{}' was already unloaded", model_id)))?;
        model.admission.close();
        drop(drained);

        self.backend.unload(&model.handle).await?;
        info!("Unloaded {}", model_id);
        Ok(true)
    }
}

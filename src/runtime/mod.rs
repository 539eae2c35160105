//! Runtime wiring
//!
//! [`Runtime`] owns one instance of every component and is the only place that knows
//! how they fit together. Front ends (the CLI and the JSON-RPC dispatcher) talk to it
//! and never to the components directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditFilter, AuditLog};
use crate::capability::{CapabilityDetector, PlatformProbe, SystemCapabilities};
use crate::catalog::{ModelCatalog, ModelDescriptor};
use crate::config::{RuntimeConfig, RuntimeLayout};
use crate::context::RuntimeContext;
use crate::download::{
    ArtifactLocks, ArtifactSource, DownloadManager, DownloadProgress, DownloadState, HttpSource,
    LocalModel, ModelStore,
};
use crate::error::{Result, RuntimeError};
use crate::inference::{
    CancelHandle, ExecutionBackend, FinishReason, InferenceRequest, InferenceResponse,
    InferenceSession, ModelRegistry, SimulatedBackend, StreamingToken, Timings,
};
use crate::routing::{
    prompt_digest, CapabilityMatch, ConsentRecord, ConsentScope, ConsentStore, ExternalModel,
    FileConsentStore, IntentResolver, OpenAiCompatibleModel, PatternIntentResolver,
    PolicyStore, PolicyUpdate, PrivacyPolicy, RouteTarget, RoutingController, RoutingDecision,
};

/// A request routed to this device, ready to stream
pub struct RoutedSession {
    pub decision: RoutingDecision,
    pub session: InferenceSession,
}

/// What `begin_inference` did with a request
pub enum Dispatch {
    Local(RoutedSession),
    External {
        decision: RoutingDecision,
        response: InferenceResponse,
    },
    Denied(RoutingDecision),
}

impl Dispatch {
    pub fn decision(&self) -> &RoutingDecision {
        match self {
            Dispatch::Local(routed) => &routed.decision,
            Dispatch::External { decision, .. } => decision,
            Dispatch::Denied(decision) => decision,
        }
    }
}

/// Result of a complete inference round trip. `response` is `None` when denied
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub decision: RoutingDecision,
    pub response: Option<InferenceResponse>,
}

/// Assembles a [`Runtime`], with optional replacements for its collaborators
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    backend: Option<Arc<dyn ExecutionBackend>>,
    source: Option<Arc<dyn ArtifactSource>>,
    probe: Option<Box<dyn PlatformProbe>>,
    catalog: Option<ModelCatalog>,
    external: Option<Arc<dyn ExternalModel>>,
    intent: Option<Arc<dyn IntentResolver>>,
}

impl RuntimeBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            backend: None,
            source: None,
            probe: None,
            catalog: None,
            external: None,
            intent: None,
        }
    }

    pub fn backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn artifact_source(mut self, source: Arc<dyn ArtifactSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn probe(mut self, probe: Box<dyn PlatformProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Uses this catalog instead of reading the configured catalog file
    pub fn catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn external(mut self, external: Arc<dyn ExternalModel>) -> Self {
        self.external = Some(external);
        self
    }

    pub fn intent_resolver(mut self, intent: Arc<dyn IntentResolver>) -> Self {
        self.intent = Some(intent);
        self
    }

    pub fn build(self) -> Result<Runtime> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| RuntimeError::platform(e.to_string()))?;
        let layout = config.layout();
        layout
            .ensure()
            .map_err(|e| RuntimeError::platform(e.to_string()))?;

        let context = RuntimeContext::new(config.device_id.clone());
        let detector = match self.probe {
            Some(probe) => CapabilityDetector::with_probe(probe),
            None => CapabilityDetector::new(config.platform),
        };
        let catalog = match self.catalog {
            Some(catalog) => catalog,
            None => ModelCatalog::load(&config.catalog_path)?,
        };

        let store = Arc::new(ModelStore::new(layout.models_dir(), layout.temp_dir())?);
        let locks = ArtifactLocks::new();
        let source: Arc<dyn ArtifactSource> = match self.source {
            Some(source) => source,
            None => Arc::new(HttpSource::new(config.request_timeout())?),
        };
        let downloads = DownloadManager::new(
            Arc::clone(&store),
            source,
            locks.clone(),
            config.download_config(),
        );

        let backend: Arc<dyn ExecutionBackend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(SimulatedBackend::new()),
        };
        let registry = ModelRegistry::new(
            backend,
            Arc::clone(&store),
            locks,
            config.max_concurrent_sessions,
        );

        let policy = PolicyStore::open(layout.privacy_policy_path())?;
        let consent = Arc::new(FileConsentStore::open(layout.consent_path())?);
        let audit = Arc::new(AuditLog::open(layout.audit_log_path())?);

        let external = match self.external {
            Some(external) => Some(external),
            None => match &config.external_endpoint {
                Some(endpoint) => {
                    let mut model = OpenAiCompatibleModel::new(
                        endpoint.as_str(),
                        config.external_model.as_str(),
                        config.request_timeout(),
                    )?;
                    if let Some(key) = &config.external_api_key {
                        model = model.with_api_key(key.as_str());
                    }
                    Some(Arc::new(model) as Arc<dyn ExternalModel>)
                }
                None => None,
            },
        };
        let intent = self
            .intent
            .unwrap_or_else(|| Arc::new(PatternIntentResolver::default()));

        let mut router = RoutingController::new(
            context.clone(),
            Arc::clone(&audit),
            Arc::clone(&consent) as Arc<dyn ConsentStore>,
            intent,
        );
        if let Some(external) = external {
            info!("External model configured: {}", external.name());
            router = router.with_external(external);
        }

        info!(
            "Runtime ready at {} (device {}, {} catalog models)",
            layout.root.display(),
            context.device_id,
            catalog.len()
        );

        Ok(Runtime {
            config,
            layout,
            detector,
            catalog,
            store,
            downloads,
            registry,
            policy,
            consent,
            router,
            sessions: Mutex::new(HashMap::new()),
        })
    }
}

pub struct Runtime {
    config: RuntimeConfig,
    layout: RuntimeLayout,
    detector: CapabilityDetector,
    catalog: ModelCatalog,
    store: Arc<ModelStore>,
    downloads: DownloadManager,
    registry: ModelRegistry,
    policy: PolicyStore,
    consent: Arc<FileConsentStore>,
    router: RoutingController,
    /// Cancellation handles of local sessions that are still streaming
    sessions: Mutex<HashMap<String, CancelHandle>>,
}

impl Runtime {
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    /// Runtime with the default collaborators for `config`
    pub fn open(config: RuntimeConfig) -> Result<Self> {
        RuntimeBuilder::new(config).build()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    pub fn context(&self) -> &RuntimeContext {
        self.router.context()
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn audit(&self) -> &AuditLog {
        self.router.audit()
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    // Capabilities and catalog

    /// Re-probes the host
    pub fn detect_capabilities(&self) -> Result<Arc<SystemCapabilities>> {
        self.detector.detect()
    }

    /// Latest snapshot, probing on first use
    pub fn capabilities(&self) -> Result<Arc<SystemCapabilities>> {
        self.detector.current()
    }

    /// Compatible catalog models, or the whole catalog when `all` is set
    pub fn list_models(&self, all: bool) -> Result<Vec<ModelDescriptor>> {
        if all {
            return Ok(self.catalog.all().to_vec());
        }
        let capabilities = self.capabilities()?;
        Ok(self
            .catalog
            .list_compatible(&capabilities)
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn recommend(&self) -> Result<Vec<ModelDescriptor>> {
        let capabilities = self.capabilities()?;
        Ok(self
            .catalog
            .recommend(&capabilities)
            .into_iter()
            .cloned()
            .collect())
    }

    // Downloads

    /// Starts or joins the download of a catalog model.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_download(&self, model_id: &str) -> Result<DownloadProgress> {
        let descriptor = self.catalog.get(model_id)?;
        Ok(self.downloads.download_model(descriptor))
    }

    pub fn download_progress(&self, model_id: &str) -> Option<DownloadState> {
        self.downloads.progress(model_id)
    }

    pub fn cancel_download(&self, model_id: &str) -> bool {
        self.downloads.cancel(model_id)
    }

    /// Unloads the model, waiting for its sessions, then deletes the artifact
    pub async fn remove_model(&self, model_id: &str) -> Result<bool> {
        self.registry.unload(model_id).await?;
        self.downloads.remove(model_id).await
    }

    pub fn local_models(&self) -> Vec<LocalModel> {
        self.store.list_local()
    }

    // Inference

    /// Validates and routes a request, then acts on the decision.
    ///
    /// Local decisions return a session that has not produced any token yet; external
    /// decisions have already been answered.
    pub async fn begin_inference(&self, request: InferenceRequest) -> Result<Dispatch> {
        let descriptor = self.catalog.get(&request.model_id)?.clone();
        let capabilities = self.capabilities()?;

        let prompt_tokens = self.registry.backend().count_tokens(&request.prompt);
        InferenceSession::validate(
            &request,
            &descriptor,
            &capabilities.constraints,
            prompt_tokens,
        )?;

        let compatible = self
            .catalog
            .list_compatible(&capabilities)
            .iter()
            .any(|candidate| candidate.id == descriptor.id);
        let available = compatible && self.store.is_verified(&descriptor);
        debug!(
            "Local availability of {}: compatible={}, available={}",
            descriptor.id, compatible, available
        );

        let session_id = Uuid::new_v4().to_string();
        let policy = self.policy.current();
        let decision = self.router.route(
            &session_id,
            &request,
            &policy,
            CapabilityMatch::local(available),
        )?;

        match decision.target {
            RouteTarget::Local => {
                let started = self
                    .registry
                    .start_session(session_id.as_str(), request, &descriptor, &capabilities)
                    .await;
                let session = match started {
                    Ok(session) => session,
                    Err(e) => {
                        warn!("Local session {} could not start: {}", session_id, e);
                        let failed =
                            failed_response(&decision, &descriptor.id, prompt_tokens, e.clone());
                        self.router.record_outcome(&decision, &failed, &policy)?;
                        return Err(e);
                    }
                };
                if session.loaded_model() {
                    self.router.record_model_load(
                        &session_id,
                        &descriptor.id,
                        self.registry.backend().name(),
                    )?;
                }
                self.lock_sessions()
                    .insert(session_id, session.cancel_handle());
                Ok(Dispatch::Local(RoutedSession { decision, session }))
            }
            RouteTarget::External => {
                match self.router.dispatch_external(&decision, &request).await {
                    Ok(response) => {
                        self.router.record_outcome(&decision, &response, &policy)?;
                        Ok(Dispatch::External { decision, response })
                    }
                    Err(e) => {
                        warn!("External model failed for {}: {}", session_id, e);
                        let failed =
                            failed_response(&decision, &descriptor.id, prompt_tokens, e.clone());
                        self.router.record_outcome(&decision, &failed, &policy)?;
                        Err(e)
                    }
                }
            }
            RouteTarget::Denied => Ok(Dispatch::Denied(decision)),
        }
    }

    /// Drives a local session to its end, passing every token to `on_token`
    pub async fn stream_local<F>(
        &self,
        routed: RoutedSession,
        mut on_token: F,
    ) -> Result<InferenceResponse>
    where
        F: FnMut(&StreamingToken),
    {
        let RoutedSession {
            decision,
            mut session,
        } = routed;

        while let Some(token) = session.next_token().await {
            on_token(&token);
        }
        let response = session.response();
        drop(session);

        self.lock_sessions().remove(&decision.session_id);
        self.router
            .record_outcome(&decision, &response, &self.policy.current())?;
        Ok(response)
    }

    /// Routes and runs a request to completion.
    ///
    /// External answers reach `on_token` as a single terminal token.
    pub async fn infer<F>(&self, request: InferenceRequest, mut on_token: F) -> Result<RunOutcome>
    where
        F: FnMut(&StreamingToken),
    {
        match self.begin_inference(request).await? {
            Dispatch::Local(routed) => {
                let decision = routed.decision.clone();
                let response = self.stream_local(routed, on_token).await?;
                Ok(RunOutcome {
                    decision,
                    response: Some(response),
                })
            }
            Dispatch::External { decision, response } => {
                on_token(&StreamingToken {
                    token: response.text.clone(),
                    token_id: 0,
                    log_prob: None,
                    index: 0,
                    finished: true,
                    finish_reason: response.finish_reason,
                });
                Ok(RunOutcome {
                    decision,
                    response: Some(response),
                })
            }
            Dispatch::Denied(decision) => Ok(RunOutcome {
                decision,
                response: None,
            }),
        }
    }

    /// Requests cancellation of a streaming local session
    pub fn cancel_inference(&self, session_id: &str) -> bool {
        match self.lock_sessions().get(session_id) {
            Some(handle) => {
                handle.cancel();
                info!("Cancellation requested for session {}", session_id);
                true
            }
            None => false,
        }
    }

    pub fn active_sessions(&self) -> Vec<String> {
        self.lock_sessions().keys().cloned().collect()
    }

    // Privacy, consent and audit

    pub fn privacy_policy(&self) -> PrivacyPolicy {
        self.policy.current()
    }

    /// Applies and persists a policy change, auditing it as `privacy_change`
    pub fn update_privacy_policy(&self, update: &PolicyUpdate) -> Result<PrivacyPolicy> {
        let (previous, next) = self.policy.update(update)?;
        self.router.record_privacy_change(&previous, &next)?;
        Ok(next)
    }

    /// Grants consent for one prompt, or for every query from this device when `None`
    pub fn grant_consent(&self, prompt: Option<&str>) -> Result<ConsentRecord> {
        match prompt {
            Some(prompt) => self.consent.grant_query(prompt_digest(prompt)),
            None => self.consent.grant_device(),
        }
    }

    /// Revokes consent. A query scope without a prompt revokes every query consent
    pub fn revoke_consent(&self, scope: ConsentScope, prompt: Option<&str>) -> Result<usize> {
        let digest = prompt.map(prompt_digest);
        self.consent.revoke(scope, digest.as_deref())
    }

    pub fn consents(&self) -> Vec<ConsentRecord> {
        self.consent.active()
    }

    pub fn query_audit(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        self.audit().query(filter)
    }

    /// Drops audit entries older than the policy's retention period
    pub fn purge_audit(&self) -> Result<usize> {
        let retention_days = self.policy.current().data_retention_days;
        self.audit().purge_older_than(retention_days)
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, CancelHandle>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Outcome recorded for a dispatch that failed before producing any token
fn failed_response(
    decision: &RoutingDecision,
    model_id: &str,
    prompt_tokens: usize,
    error: RuntimeError,
) -> InferenceResponse {
    InferenceResponse {
        session_id: decision.session_id.clone(),
        model_id: model_id.to_string(),
        text: String::new(),
        prompt_tokens,
        tokens_generated: 0,
        tokens_per_second: 0.0,
        finished: true,
        finish_reason: Some(FinishReason::Error),
        timings: Timings::default(),
        error: Some(error),
    }
}

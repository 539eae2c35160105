//! Maps JSON-RPC methods onto runtime operations

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::message::{parse_request, RpcError, RpcMessage, RpcNotification, RpcRequest, RpcResponse};
use crate::audit::AuditFilter;
use crate::error::RuntimeError;
use crate::inference::InferenceRequest;
use crate::routing::{ConsentScope, PolicyUpdate};
use crate::runtime::{Dispatch, Runtime};

pub const TOKEN_NOTIFICATION: &str = "inferenceToken";
pub const COMPLETE_NOTIFICATION: &str = "inferenceComplete";
pub const DOWNLOAD_NOTIFICATION: &str = "downloadProgress";

type RpcResult = std::result::Result<Value, RpcError>;

/// Notification stream a call opens; runs once the call's response is queued
type Followup = BoxFuture<'static, ()>;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ListModelsParams {
    all: bool,
    recommended: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelParams {
    model_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionParams {
    session_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GrantConsentParams {
    /// Query-scoped consent for this prompt; device-wide when absent
    prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevokeConsentParams {
    scope: ConsentScope,
    #[serde(default)]
    prompt: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenEvent<'a> {
    session_id: &'a str,
    #[serde(flatten)]
    token: &'a crate::inference::StreamingToken,
}

/// Params of `null` or an absent member deserialize like `{}`
fn params<T: DeserializeOwned>(params: Value) -> std::result::Result<T, RpcError> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(RpcError::invalid_params)
}

fn to_value<T: Serialize>(value: &T) -> RpcResult {
    serde_json::to_value(value).map_err(RpcError::internal)
}

pub struct RpcDispatcher {
    runtime: Arc<Runtime>,
    outgoing: UnboundedSender<RpcMessage>,
    /// Model ids whose download progress is already being forwarded
    forwarding: Arc<Mutex<HashSet<String>>>,
}

fn lock_ids(ids: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    match ids.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl RpcDispatcher {
    /// Responses and the notifications of streaming calls are written to `outgoing`
    pub fn new(runtime: Arc<Runtime>, outgoing: UnboundedSender<RpcMessage>) -> Self {
        Self {
            runtime,
            outgoing,
            forwarding: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Handles one raw line, queueing its response if it has one
    pub async fn handle_line(&self, line: &str) {
        match parse_request(line) {
            Ok(request) => self.handle(request).await,
            Err(response) => self.send(RpcMessage::Response(response)),
        }
    }

    /// Queues the response first, then starts any notification streams the call
    /// opened, so a client always sees a call's result before its notifications
    pub async fn handle(&self, request: RpcRequest) {
        debug!("IPC call {} ({:?})", request.method, request.id);
        let mut later = Vec::new();
        let outcome = self.call(&request.method, request.params, &mut later).await;

        if request.id.is_none() {
            if let Err(e) = outcome {
                warn!("IPC notification {} failed: {}", request.method, e.message);
            }
        } else {
            self.send(RpcMessage::Response(match outcome {
                Ok(result) => RpcResponse::success(request.id, result),
                Err(error) => RpcResponse::failure(request.id, error),
            }));
        }

        for followup in later {
            tokio::spawn(followup);
        }
    }

    fn send(&self, message: RpcMessage) {
        if self.outgoing.send(message).is_err() {
            debug!("IPC writer closed before a message could be sent");
        }
    }

    async fn call(&self, method: &str, raw: Value, later: &mut Vec<Followup>) -> RpcResult {
        match method {
            "detectCapabilities" => to_value(self.runtime.detect_capabilities()?.as_ref()),
            "listCompatibleModels" => {
                let p: ListModelsParams = params(raw)?;
                let models = if p.recommended {
                    self.runtime.recommend()?
                } else {
                    self.runtime.list_models(p.all)?
                };
                Ok(json!({ "models": models }))
            }
            "listLocalModels" => Ok(json!({ "models": self.runtime.local_models() })),
            "startDownload" => self.start_download(params(raw)?, later),
            "getDownloadProgress" => {
                let p: ModelParams = params(raw)?;
                match self.runtime.download_progress(&p.model_id) {
                    Some(state) => to_value(&state),
                    None => Err(RuntimeError::model(format!(
                        "No download of '{}' in this session",
                        p.model_id
                    ))
                    .with_context("model_id", &p.model_id)
                    .into()),
                }
            }
            "cancelDownload" => {
                let p: ModelParams = params(raw)?;
                Ok(json!({ "cancelled": self.runtime.cancel_download(&p.model_id) }))
            }
            "removeModel" => {
                let p: ModelParams = params(raw)?;
                Ok(json!({ "removed": self.runtime.remove_model(&p.model_id).await? }))
            }
            "startInference" => self.start_inference(params(raw)?, later).await,
            "cancelInference" => {
                let p: SessionParams = params(raw)?;
                Ok(json!({ "cancelled": self.runtime.cancel_inference(&p.session_id) }))
            }
            "queryAudit" => {
                let filter: AuditFilter = params(raw)?;
                Ok(json!({ "entries": self.runtime.query_audit(&filter) }))
            }
            "purgeAudit" => Ok(json!({ "removed": self.runtime.purge_audit()? })),
            "getPrivacyPolicy" => to_value(&self.runtime.privacy_policy()),
            "updatePrivacyPolicy" => {
                let update: PolicyUpdate = params(raw)?;
                if update.is_empty() {
                    return Err(RpcError::invalid_params("no policy field given"));
                }
                to_value(&self.runtime.update_privacy_policy(&update)?)
            }
            "grantConsent" => {
                let p: GrantConsentParams = params(raw)?;
                to_value(&self.runtime.grant_consent(p.prompt.as_deref())?)
            }
            "revokeConsent" => {
                let p: RevokeConsentParams = params(raw)?;
                let revoked = self
                    .runtime
                    .revoke_consent(p.scope, p.prompt.as_deref())?;
                Ok(json!({ "revoked": revoked }))
            }
            other => Err(RpcError::method_not_found(other)),
        }
    }

    /// Returns the first snapshot and forwards later ones as notifications. A
    /// transfer that is already forwarded is not forwarded a second time.
    fn start_download(&self, p: ModelParams, later: &mut Vec<Followup>) -> RpcResult {
        let progress = self.runtime.start_download(&p.model_id)?;
        let snapshot = progress.current();

        if snapshot.is_terminal() || !lock_ids(&self.forwarding).insert(p.model_id.clone()) {
            return to_value(&snapshot);
        }

        let outgoing = self.outgoing.clone();
        let forwarding = Arc::clone(&self.forwarding);
        let model_id = p.model_id;
        later.push(
            async move {
                let mut progress = progress;
                let mut released = false;
                while let Some(state) = progress.next().await {
                    // Released before the terminal notification so a retry it prompts is forwarded
                    if state.is_terminal() {
                        lock_ids(&forwarding).remove(&model_id);
                        released = true;
                    }
                    let Ok(params) = serde_json::to_value(&state) else {
                        continue;
                    };
                    if outgoing
                        .send(RpcMessage::Notification(RpcNotification::new(
                            DOWNLOAD_NOTIFICATION,
                            params,
                        )))
                        .is_err()
                    {
                        break;
                    }
                }
                if !released {
                    lock_ids(&forwarding).remove(&model_id);
                }
            }
            .boxed(),
        );

        to_value(&snapshot)
    }

    /// Without `stream` the call answers with the complete response. With it, the
    /// call answers with the routing decision and the tokens follow as notifications.
    async fn start_inference(&self, request: InferenceRequest, later: &mut Vec<Followup>) -> RpcResult {
        if !request.stream {
            let outcome = self.runtime.infer(request, |_| {}).await?;
            return Ok(json!({
                "sessionId": outcome.decision.session_id,
                "decision": outcome.decision,
                "response": outcome.response,
            }));
        }

        match self.runtime.begin_inference(request).await? {
            Dispatch::Local(routed) => {
                let decision = routed.decision.clone();
                let runtime = Arc::clone(&self.runtime);
                let outgoing = self.outgoing.clone();

                let stream = async move {
                    let session_id = routed.decision.session_id.clone();
                    let notify = |method: &str, params: Value| {
                        let _ = outgoing.send(RpcMessage::Notification(RpcNotification::new(
                            method, params,
                        )));
                    };

                    let result = runtime
                        .stream_local(routed, |token| {
                            let event = TokenEvent {
                                session_id: &session_id,
                                token,
                            };
                            if let Ok(params) = serde_json::to_value(&event) {
                                notify(TOKEN_NOTIFICATION, params);
                            }
                        })
                        .await;

                    let params = match result {
                        Ok(response) => json!({ "sessionId": session_id, "response": response }),
                        Err(error) => {
                            warn!("Streaming session {} could not be completed: {}", session_id, error);
                            json!({ "sessionId": session_id, "error": RpcError::from(error) })
                        }
                    };
                    notify(COMPLETE_NOTIFICATION, params);
                };
                later.push(stream.boxed());

                Ok(json!({ "sessionId": decision.session_id, "decision": decision }))
            }
            Dispatch::External { decision, response } => Ok(json!({
                "sessionId": decision.session_id,
                "decision": decision,
                "response": response,
            })),
            Dispatch::Denied(decision) => Ok(json!({
                "sessionId": decision.session_id,
                "decision": decision,
            })),
        }
    }
}

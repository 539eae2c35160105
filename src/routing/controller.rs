//! Per-request routing between local execution, an external model, or refusal
//!
//! Every decision is written to the audit log before the caller may act on it.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::consent::{prompt_digest, ConsentStore};
use super::external::ExternalModel;
use super::intent::{Intent, IntentResolver};
use super::policy::PrivacyPolicy;
use crate::audit::{AuditEventType, AuditLog, PrivacyLevel};
use crate::context::RuntimeContext;
use crate::error::{Result, RuntimeError};
use crate::inference::{FinishReason, InferenceRequest, InferenceResponse, Timings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteTarget {
    Local,
    External,
    Denied,
}

impl RouteTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::External => "external",
            Self::Denied => "denied",
        }
    }

    /// Where the query's data ends up under this decision
    pub fn privacy_level(self) -> PrivacyLevel {
        match self {
            Self::External => PrivacyLevel::External,
            Self::Local | Self::Denied => PrivacyLevel::Local,
        }
    }
}

/// What the device can do for a request, computed by the caller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityMatch {
    /// A verified model compatible with this device is available
    pub local_model_available: bool,
}

impl CapabilityMatch {
    pub fn local(available: bool) -> Self {
        Self {
            local_model_available: available,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    pub session_id: String,
    pub target: RouteTarget,
    pub reason: String,
    pub intent: Intent,
    pub prompt_digest: String,
}

pub struct RoutingController {
    context: RuntimeContext,
    audit: Arc<AuditLog>,
    consent: Arc<dyn ConsentStore>,
    intent: Arc<dyn IntentResolver>,
    external: Option<Arc<dyn ExternalModel>>,
}

impl RoutingController {
    pub fn new(
        context: RuntimeContext,
        audit: Arc<AuditLog>,
        consent: Arc<dyn ConsentStore>,
        intent: Arc<dyn IntentResolver>,
    ) -> Self {
        Self {
            context,
            audit,
            consent,
            intent,
            external: None,
        }
    }

    pub fn with_external(mut self, external: Arc<dyn ExternalModel>) -> Self {
        self.external = Some(external);
        self
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.context
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Decides where a request runs and audits the decision.
    ///
    /// Consent lookup failures become `denied`. Fails only when the decision cannot
    /// be audited, in which case nothing may be dispatched.
    pub fn route(
        &self,
        session_id: &str,
        request: &InferenceRequest,
        policy: &PrivacyPolicy,
        capability: CapabilityMatch,
    ) -> Result<RoutingDecision> {
        let digest = prompt_digest(&request.prompt);
        let intent = self.intent.resolve(request);
        let (target, reason) = self.decide(&digest, &intent, policy, capability);

        let decision = RoutingDecision {
            session_id: session_id.to_string(),
            target,
            reason,
            intent,
            prompt_digest: digest,
        };

        self.audit.record(
            &self.context,
            session_id,
            AuditEventType::Query,
            target.privacy_level(),
            json!({
                "decision": target.as_str(),
                "reason": decision.reason,
                "modelId": request.model_id,
                "promptSha256": decision.prompt_digest,
                "promptChars": request.prompt.chars().count(),
                "intent": decision.intent.kind,
                "localProcessingOnly": policy.local_processing_only,
            }),
        )?;

        info!(
            "Routed session {} to {} ({})",
            session_id,
            target.as_str(),
            decision.reason
        );
        Ok(decision)
    }

    fn decide(
        &self,
        digest: &str,
        intent: &Intent,
        policy: &PrivacyPolicy,
        capability: CapabilityMatch,
    ) -> (RouteTarget, String) {
        if policy.local_processing_only {
            return if capability.local_model_available {
                (RouteTarget::Local, "local processing only".to_string())
            } else {
                (
                    RouteTarget::Denied,
                    "local processing only and no compatible local model".to_string(),
                )
            };
        }

        if intent.resolvable_locally && capability.local_model_available {
            return (RouteTarget::Local, "resolvable on device".to_string());
        }

        if self.external.is_none() {
            return (
                RouteTarget::Denied,
                "no external model configured".to_string(),
            );
        }

        match self.consent.has_consent(digest) {
            Ok(true) => (RouteTarget::External, "consent recorded".to_string()),
            Ok(false) => (RouteTarget::Denied, "no consent recorded".to_string()),
            Err(e) => {
                warn!("Consent lookup failed, denying: {}", e);
                (RouteTarget::Denied, format!("consent unavailable: {}", e.message))
            }
        }
    }

    /// Audits the outcome of a dispatched request unless auditing is disabled.
    ///
    /// Returns whether an entry was written.
    pub fn record_outcome(
        &self,
        decision: &RoutingDecision,
        response: &InferenceResponse,
        policy: &PrivacyPolicy,
    ) -> Result<bool> {
        if !policy.auditing_enabled {
            debug!("Auditing disabled, skipping outcome of {}", decision.session_id);
            return Ok(false);
        }
        self.audit.record(
            &self.context,
            &decision.session_id,
            AuditEventType::Response,
            decision.target.privacy_level(),
            json!({
                "decision": decision.target.as_str(),
                "modelId": response.model_id,
                "responseSha256": prompt_digest(&response.text),
                "tokensGenerated": response.tokens_generated,
                "finished": response.finished,
                "finishReason": response.finish_reason,
                "totalMs": response.timings.total_ms,
                "errorKind": response.error.as_ref().map(|e| e.kind),
            }),
        )?;
        Ok(true)
    }

    pub fn record_model_load(&self, session_id: &str, model_id: &str, backend: &str) -> Result<()> {
        self.audit.record(
            &self.context,
            session_id,
            AuditEventType::ModelLoad,
            PrivacyLevel::Local,
            json!({ "modelId": model_id, "backend": backend }),
        )?;
        Ok(())
    }

    pub fn record_privacy_change(
        &self,
        previous: &PrivacyPolicy,
        next: &PrivacyPolicy,
    ) -> Result<()> {
        self.audit.record(
            &self.context,
            "privacy-policy",
            AuditEventType::PrivacyChange,
            PrivacyLevel::Local,
            json!({ "previous": previous, "current": next }),
        )?;
        Ok(())
    }

    /// Sends a request routed `external` to the configured adapter
    pub async fn dispatch_external(
        &self,
        decision: &RoutingDecision,
        request: &InferenceRequest,
    ) -> Result<InferenceResponse> {
        if decision.target != RouteTarget::External {
            return Err(RuntimeError::plugin(format!(
                "Session {} was routed {}, not external",
                decision.session_id,
                decision.target.as_str()
            )));
        }
        let external = self
            .external
            .as_ref()
            .ok_or_else(|| RuntimeError::plugin("No external model configured"))?;

        let start = Instant::now();
        let text = external.complete(request).await?;
        let elapsed = start.elapsed();
        let tokens_generated = text.split_whitespace().count();

        Ok(InferenceResponse {
            session_id: decision.session_id.clone(),
            model_id: request.model_id.clone(),
            text,
            prompt_tokens: request.prompt.split_whitespace().count(),
            tokens_generated,
            tokens_per_second: if elapsed.as_secs_f64() > 0.0 {
                tokens_generated as f64 / elapsed.as_secs_f64()
            } else {
                0.0
            },
            finished: true,
            finish_reason: Some(FinishReason::Stop),
            timings: Timings::from_durations(Default::default(), elapsed, elapsed),
            error: None,
        })
    }
}

//! Routing and audit integration tests
//!
//! Every request that passes validation leaves a `query` entry naming its routing
//! decision, whatever the outcome.

mod support;

use std::sync::Arc;

use chrono::{Duration, Utc};
use edgellm::audit::{AuditEntry, AuditEventType, AuditFilter, PrivacyLevel};
use edgellm::inference::mock::MockBackend;
use edgellm::inference::InferenceRequest;
use edgellm::routing::{
    CannedExternalModel, ConsentScope, ExternalModel, PolicyUpdate, RouteTarget,
};
use edgellm::{ErrorKind, Runtime};
use serde_json::json;
use support::*;
use tempfile::TempDir;

fn allow_external(runtime: &Runtime) {
    runtime
        .update_privacy_policy(&PolicyUpdate {
            local_processing_only: Some(false),
            ..Default::default()
        })
        .unwrap();
}

fn events(runtime: &Runtime, session_id: &str) -> Vec<AuditEventType> {
    runtime
        .query_audit(&AuditFilter {
            session_id: Some(session_id.to_string()),
            ..Default::default()
        })
        .into_iter()
        .map(|entry| entry.event_type)
        .collect()
}

#[tokio::test]
async fn test_local_only_without_model_is_denied_and_audited() {
    let home = TempDir::new().unwrap();
    let external = Arc::new(CannedExternalModel::new("remote answer"));
    let runtime = runtime_builder(&home, Arc::new(memory_source()))
        .external(external.clone())
        .build()
        .unwrap();
    runtime.grant_consent(None).unwrap();

    let outcome = runtime
        .infer(InferenceRequest::new(MODEL_ID, "Summarize my medical notes"), |_| {})
        .await
        .unwrap();

    assert_eq!(outcome.decision.target, RouteTarget::Denied);
    assert!(outcome.response.is_none());
    assert!(external.calls().is_empty());

    let entries = runtime.query_audit(&AuditFilter::default());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].event_type, AuditEventType::Query);
    assert_eq!(entries[0].privacy_level, PrivacyLevel::Local);
    assert_eq!(entries[0].payload["decision"], json!("denied"));
    assert_eq!(entries[0].device_id, "edge-it");
}

#[tokio::test]
async fn test_local_route_audits_query_load_and_response() {
    let home = TempDir::new().unwrap();
    let runtime = runtime_with_model(&home).await;

    let outcome = runtime
        .infer(
            InferenceRequest::new(MODEL_ID, "What is the capital of France?").with_max_tokens(8),
            |_| {},
        )
        .await
        .unwrap();
    let session_id = &outcome.decision.session_id;

    assert_eq!(outcome.decision.target, RouteTarget::Local);
    assert_eq!(
        events(&runtime, session_id),
        vec![
            AuditEventType::Query,
            AuditEventType::ModelLoad,
            AuditEventType::Response
        ]
    );

    // The model stays loaded, so a second session does not log a load
    let second = runtime
        .infer(InferenceRequest::new(MODEL_ID, "And of Spain?").with_max_tokens(4), |_| {})
        .await
        .unwrap();
    assert_eq!(
        events(&runtime, &second.decision.session_id),
        vec![AuditEventType::Query, AuditEventType::Response]
    );
}

#[tokio::test]
async fn test_audit_never_stores_prompt_or_response_text() {
    let home = TempDir::new().unwrap();
    let runtime = runtime_with_model(&home).await;
    let prompt = "my account number is 4242 and my name is Ada";

    let outcome = runtime
        .infer(InferenceRequest::new(MODEL_ID, prompt).with_max_tokens(6), |_| {})
        .await
        .unwrap();
    let text = outcome.response.unwrap().text;

    let raw = std::fs::read_to_string(runtime.audit().path()).unwrap();
    assert!(!raw.contains(prompt));
    assert!(!raw.contains("4242"));
    assert!(!raw.contains(&text));
    assert!(raw.contains(&outcome.decision.prompt_digest));
}

#[tokio::test]
async fn test_unresolvable_query_goes_external_with_consent() {
    let home = TempDir::new().unwrap();
    let external = Arc::new(CannedExternalModel::new("Here is a summary."));
    let runtime = runtime_builder(&home, Arc::new(memory_source()))
        .external(external.clone())
        .build()
        .unwrap();
    download(&runtime).await;
    allow_external(&runtime);

    let prompt = "Summarize this quarterly report";
    runtime.grant_consent(Some(prompt)).unwrap();

    let outcome = runtime
        .infer(InferenceRequest::new(MODEL_ID, prompt), |_| {})
        .await
        .unwrap();

    assert_eq!(outcome.decision.target, RouteTarget::External);
    assert_eq!(outcome.response.unwrap().text, "Here is a summary.");
    assert_eq!(external.calls(), vec![prompt.to_string()]);

    let entries = runtime.query_audit(&AuditFilter {
        session_id: Some(outcome.decision.session_id.clone()),
        ..Default::default()
    });
    assert_eq!(entries.len(), 2);
    assert!(entries
        .iter()
        .all(|entry| entry.privacy_level == PrivacyLevel::External));
}

#[tokio::test]
async fn test_resolvable_query_stays_local_even_with_consent() {
    let home = TempDir::new().unwrap();
    let external = Arc::new(CannedExternalModel::new("remote"));
    let runtime = runtime_builder(&home, Arc::new(memory_source()))
        .external(external.clone())
        .build()
        .unwrap();
    download(&runtime).await;
    allow_external(&runtime);
    runtime.grant_consent(None).unwrap();

    let outcome = runtime
        .infer(
            InferenceRequest::new(MODEL_ID, "hello, how are you?").with_max_tokens(4),
            |_| {},
        )
        .await
        .unwrap();

    assert_eq!(outcome.decision.target, RouteTarget::Local);
    assert!(external.calls().is_empty());
}

#[tokio::test]
async fn test_revoked_consent_denies_external() {
    let home = TempDir::new().unwrap();
    let runtime = runtime_builder(&home, Arc::new(memory_source()))
        .external(Arc::new(CannedExternalModel::new("remote")))
        .build()
        .unwrap();
    allow_external(&runtime);

    runtime.grant_consent(None).unwrap();
    assert_eq!(runtime.consents().len(), 1);
    assert_eq!(runtime.revoke_consent(ConsentScope::Device, None).unwrap(), 1);
    assert!(runtime.consents().is_empty());

    let outcome = runtime
        .infer(InferenceRequest::new(MODEL_ID, "Draft an email to my landlord"), |_| {})
        .await
        .unwrap();
    assert_eq!(outcome.decision.target, RouteTarget::Denied);
}

#[tokio::test]
async fn test_changes_from_another_runtime_apply_to_the_next_request() {
    let home = TempDir::new().unwrap();
    let external = Arc::new(CannedExternalModel::new("remote"));
    let serving = runtime_builder(&home, Arc::new(memory_source()))
        .external(external.clone())
        .build()
        .unwrap();
    allow_external(&serving);
    serving.grant_consent(None).unwrap();

    let request = || InferenceRequest::new(MODEL_ID, "Draft an email to my landlord");
    let outcome = serving.infer(request(), |_| {}).await.unwrap();
    assert_eq!(outcome.decision.target, RouteTarget::External);

    // Consent revoked from a second process on the same home
    let cli = runtime_builder(&home, Arc::new(memory_source())).build().unwrap();
    assert_eq!(cli.revoke_consent(ConsentScope::Device, None).unwrap(), 1);
    assert!(serving.consents().is_empty());

    let outcome = serving.infer(request(), |_| {}).await.unwrap();
    assert_eq!(outcome.decision.target, RouteTarget::Denied);

    // Consent back, but local-only switched on from the second process
    serving.grant_consent(None).unwrap();
    cli.update_privacy_policy(&PolicyUpdate {
        local_processing_only: Some(true),
        ..Default::default()
    })
    .unwrap();
    assert!(serving.privacy_policy().local_processing_only);

    let outcome = serving.infer(request(), |_| {}).await.unwrap();
    assert_eq!(outcome.decision.target, RouteTarget::Denied);
    assert_eq!(external.calls().len(), 1);
}

struct FailingExternal;

#[async_trait::async_trait]
impl ExternalModel for FailingExternal {
    fn name(&self) -> &str {
        "failing"
    }

    async fn complete(&self, _request: &InferenceRequest) -> edgellm::Result<String> {
        Err(edgellm::RuntimeError::plugin("upstream returned 500"))
    }
}

#[tokio::test]
async fn test_external_failure_is_audited_and_returned() {
    let home = TempDir::new().unwrap();
    let runtime = runtime_builder(&home, Arc::new(memory_source()))
        .external(Arc::new(FailingExternal))
        .build()
        .unwrap();
    allow_external(&runtime);
    runtime.grant_consent(None).unwrap();

    let err = runtime
        .infer(InferenceRequest::new(MODEL_ID, "Translate this contract"), |_| {})
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind, ErrorKind::Plugin);

    let responses = runtime.query_audit(&AuditFilter {
        event_type: Some(AuditEventType::Response),
        ..Default::default()
    });
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].payload["errorKind"], json!("PluginError"));
}

#[tokio::test]
async fn test_local_load_failure_is_audited_and_returned() {
    let home = TempDir::new().unwrap();
    let backend = Arc::new(MockBackend::new());
    backend.fail_next_load(edgellm::RuntimeError::plugin("accelerator unavailable"));
    let runtime = runtime_builder(&home, Arc::new(memory_source()))
        .backend(backend.clone())
        .build()
        .unwrap();
    download(&runtime).await;

    let err = runtime
        .infer(InferenceRequest::new(MODEL_ID, "What is the capital of France?"), |_| {})
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind, ErrorKind::Plugin);
    assert!(runtime.active_sessions().is_empty());

    let entries = runtime.query_audit(&AuditFilter::default());
    let kinds: Vec<AuditEventType> = entries.iter().map(|e| e.event_type).collect();
    assert_eq!(kinds, vec![AuditEventType::Query, AuditEventType::Response]);
    assert_eq!(entries[0].session_id, entries[1].session_id);

    let outcome = &entries[1].payload;
    assert_eq!(outcome["decision"], json!("local"));
    assert_eq!(outcome["finishReason"], json!("error"));
    assert_eq!(outcome["tokensGenerated"], json!(0));
    assert_eq!(outcome["errorKind"], json!("PluginError"));
    assert_eq!(backend.loads(), 0);
}

#[tokio::test]
async fn test_disabled_auditing_still_records_decisions() {
    let home = TempDir::new().unwrap();
    let runtime = runtime_with_model(&home).await;
    runtime
        .update_privacy_policy(&PolicyUpdate {
            auditing_enabled: Some(false),
            ..Default::default()
        })
        .unwrap();

    let outcome = runtime
        .infer(InferenceRequest::new(MODEL_ID, "What time is it?").with_max_tokens(3), |_| {})
        .await
        .unwrap();

    let recorded = events(&runtime, &outcome.decision.session_id);
    assert!(recorded.contains(&AuditEventType::Query));
    assert!(!recorded.contains(&AuditEventType::Response));
}

#[tokio::test]
async fn test_policy_changes_are_audited_and_bounded() {
    let home = TempDir::new().unwrap();
    let runtime = runtime_builder(&home, Arc::new(memory_source())).build().unwrap();

    let policy = runtime
        .update_privacy_policy(&PolicyUpdate {
            data_retention_days: Some(30),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(policy.data_retention_days, 30);

    let err = runtime
        .update_privacy_policy(&PolicyUpdate {
            data_retention_days: Some(0),
            ..Default::default()
        })
        .err()
        .unwrap();
    assert_eq!(err.kind, ErrorKind::Audit);
    assert_eq!(runtime.privacy_policy().data_retention_days, 30);

    let changes = runtime.query_audit(&AuditFilter {
        event_type: Some(AuditEventType::PrivacyChange),
        ..Default::default()
    });
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].payload["current"]["dataRetentionDays"], json!(30));

    // Persisted across restarts
    drop(runtime);
    let reopened = runtime_builder(&home, Arc::new(memory_source())).build().unwrap();
    assert_eq!(reopened.privacy_policy().data_retention_days, 30);
}

#[tokio::test]
async fn test_purge_drops_entries_past_retention() {
    let home = TempDir::new().unwrap();
    let runtime = runtime_builder(&home, Arc::new(memory_source())).build().unwrap();

    let old = AuditEntry::new(
        runtime.context(),
        "old-session",
        AuditEventType::Query,
        PrivacyLevel::Local,
        json!({ "decision": "local" }),
    )
    .at(Utc::now() - Duration::days(30));
    let recent = AuditEntry::new(
        runtime.context(),
        "recent-session",
        AuditEventType::Query,
        PrivacyLevel::Local,
        json!({ "decision": "local" }),
    );
    runtime.audit().append(old).unwrap();
    runtime.audit().append(recent).unwrap();

    assert_eq!(runtime.purge_audit().unwrap(), 1);
    let remaining = runtime.query_audit(&AuditFilter::default());
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].session_id, "recent-session");
}

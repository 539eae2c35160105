use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::context::RuntimeContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Query,
    Response,
    ModelLoad,
    PrivacyChange,
}

impl AuditEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Response => "response",
            Self::ModelLoad => "model_load",
            Self::PrivacyChange => "privacy_change",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "query" => Ok(Self::Query),
            "response" => Ok(Self::Response),
            "model_load" => Ok(Self::ModelLoad),
            "privacy_change" => Ok(Self::PrivacyChange),
            other => Err(format!(
                "Unknown audit event '{}' (expected query, response, model_load or privacy_change)",
                other
            )),
        }
    }
}

/// Where the data of an audited event was processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyLevel {
    Local,
    Cloud,
    External,
}

/// One immutable audit record, stored as a line of JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub event_type: AuditEventType,
    pub payload: Value,
    pub privacy_level: PrivacyLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub device_id: String,
}

impl AuditEntry {
    pub fn new(
        context: &RuntimeContext,
        session_id: impl Into<String>,
        event_type: AuditEventType,
        privacy_level: PrivacyLevel,
        payload: Value,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id: session_id.into(),
            event_type,
            payload,
            privacy_level,
            user_id: context.user_id.clone(),
            device_id: context.device_id.clone(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Read-only selection over the log. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditFilter {
    pub session_id: Option<String>,
    pub event_type: Option<AuditEventType>,
    pub privacy_level: Option<PrivacyLevel>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Keep only the most recent `limit` matches
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.session_id
            .as_ref()
            .map_or(true, |id| &entry.session_id == id)
            && self.event_type.map_or(true, |t| entry.event_type == t)
            && self.privacy_level.map_or(true, |l| entry.privacy_level == l)
            && self.since.map_or(true, |since| entry.timestamp >= since)
            && self.until.map_or(true, |until| entry.timestamp <= until)
    }
}

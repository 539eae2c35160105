//! Recorded user consent for sending queries off the device

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::policy::write_json_atomic;
use crate::error::{Result, RuntimeError};

pub const DEFAULT_CONSENT_DAYS: i64 = 30;

/// Hex SHA-256 of a prompt, the only form in which prompts are recorded
pub fn prompt_digest(prompt: &str) -> String {
    hex::encode(Sha256::digest(prompt.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentScope {
    /// Covers one query, identified by its prompt digest
    Query,
    /// Covers every query from this device
    Device,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRecord {
    pub scope: ConsentScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_digest: Option<String>,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ConsentRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    fn covers(&self, digest: &str, now: DateTime<Utc>) -> bool {
        self.is_active(now)
            && match self.scope {
                ConsentScope::Device => true,
                ConsentScope::Query => self.prompt_digest.as_deref() == Some(digest),
            }
    }
}

/// Consent lookup used by routing
#[cfg_attr(test, mockall::automock)]
pub trait ConsentStore: Send + Sync {
    /// Whether active consent covers sending the query with this prompt digest
    fn has_consent(&self, prompt_digest: &str) -> Result<bool>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConsentDocument {
    #[serde(default)]
    records: Vec<ConsentRecord>,
}

/// Consent records persisted in `config/consent.json`.
///
/// Every lookup re-reads the file so revocations made by another process take
/// effect on the next query.
pub struct FileConsentStore {
    path: PathBuf,
    validity: Duration,
    last_read: RwLock<Vec<ConsentRecord>>,
}

impl FileConsentStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = load_records(&path)?;
        debug!("Loaded {} consent records", records.len());

        Ok(Self {
            path,
            validity: Duration::days(DEFAULT_CONSENT_DAYS),
            last_read: RwLock::new(records),
        })
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records that are still in force
    pub fn active(&self) -> Vec<ConsentRecord> {
        let now = Utc::now();
        let records = match self.reload() {
            Ok(records) => records,
            Err(e) => {
                warn!("Using last known consent records: {}", e);
                match self.last_read.read() {
                    Ok(guard) => guard.clone(),
                    Err(poisoned) => poisoned.into_inner().clone(),
                }
            }
        };
        records.into_iter().filter(|r| r.is_active(now)).collect()
    }

    pub fn grant_device(&self) -> Result<ConsentRecord> {
        self.grant(ConsentScope::Device, None)
    }

    pub fn grant_query(&self, prompt_digest: impl Into<String>) -> Result<ConsentRecord> {
        self.grant(ConsentScope::Query, Some(prompt_digest.into()))
    }

    fn grant(&self, scope: ConsentScope, digest: Option<String>) -> Result<ConsentRecord> {
        let now = Utc::now();
        let record = ConsentRecord {
            scope,
            prompt_digest: digest,
            granted_at: now,
            expires_at: now + self.validity,
        };
        self.modify(|records| {
            records.retain(|r| {
                r.is_active(now)
                    && !(r.scope == record.scope && r.prompt_digest == record.prompt_digest)
            });
            records.push(record.clone());
        })?;
        info!("Consent granted ({:?}) until {}", scope, record.expires_at);
        Ok(record)
    }

    /// Revokes device consent, or query consent for one digest. Returns records removed.
    pub fn revoke(&self, scope: ConsentScope, prompt_digest: Option<&str>) -> Result<usize> {
        let removed = self.modify(|records| {
            let before = records.len();
            records.retain(|r| {
                let matches = r.scope == scope
                    && (scope == ConsentScope::Device
                        || prompt_digest.is_none()
                        || r.prompt_digest.as_deref() == prompt_digest);
                !matches
            });
            before - records.len()
        })?;
        info!("Revoked {} consent record(s) ({:?})", removed, scope);
        Ok(removed)
    }

    /// Reads the persisted records and remembers them
    fn reload(&self) -> Result<Vec<ConsentRecord>> {
        let records = load_records(&self.path)?;
        let mut guard = match self.last_read.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone_from(&records);
        Ok(records)
    }

    /// Applies `f` to the persisted records and writes them back
    fn modify<T>(&self, f: impl FnOnce(&mut Vec<ConsentRecord>) -> T) -> Result<T> {
        let mut guard = match self.last_read.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut updated = load_records(&self.path)?;
        let result = f(&mut updated);
        write_json_atomic(
            &self.path,
            &ConsentDocument {
                records: updated.clone(),
            },
        )?;
        *guard = updated;
        Ok(result)
    }
}

fn load_records(path: &Path) -> Result<Vec<ConsentRecord>> {
    match fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str::<ConsentDocument>(&contents)
            .map(|document| document.records)
            .map_err(|e| {
                RuntimeError::platform(format!("Invalid consent records {}: {}", path.display(), e))
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(RuntimeError::platform(format!(
            "Failed to read consent records {}: {}",
            path.display(),
            e
        ))),
    }
}

impl ConsentStore for FileConsentStore {
    /// Fails when the records cannot be read; routing treats that as no consent
    fn has_consent(&self, prompt_digest: &str) -> Result<bool> {
        let now = Utc::now();
        Ok(self
            .reload()?
            .iter()
            .any(|r| r.covers(prompt_digest, now)))
    }
}

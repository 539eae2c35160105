//! Privacy policy and its persisted store

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, RuntimeError};

pub const MIN_RETENTION_DAYS: u32 = 1;
pub const MAX_RETENTION_DAYS: u32 = 365;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrivacyPolicy {
    /// Never let a query leave the device
    pub local_processing_only: bool,
    /// Record response outcomes in the audit log
    pub auditing_enabled: bool,
    pub data_retention_days: u32,
}

impl Default for PrivacyPolicy {
    fn default() -> Self {
        Self {
            local_processing_only: true,
            auditing_enabled: true,
            data_retention_days: 7,
        }
    }
}

impl PrivacyPolicy {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_RETENTION_DAYS..=MAX_RETENTION_DAYS).contains(&self.data_retention_days) {
            return Err(RuntimeError::audit(format!(
                "dataRetentionDays must be between {} and {}, got {}",
                MIN_RETENTION_DAYS, MAX_RETENTION_DAYS, self.data_retention_days
            ))
            .with_context("data_retention_days", self.data_retention_days));
        }
        Ok(())
    }
}

/// Explicit user change to the policy. Unset fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyUpdate {
    pub local_processing_only: Option<bool>,
    pub auditing_enabled: Option<bool>,
    pub data_retention_days: Option<u32>,
}

impl PolicyUpdate {
    pub fn is_empty(&self) -> bool {
        self.local_processing_only.is_none()
            && self.auditing_enabled.is_none()
            && self.data_retention_days.is_none()
    }

    pub fn apply(&self, policy: &PrivacyPolicy) -> PrivacyPolicy {
        PrivacyPolicy {
            local_processing_only: self
                .local_processing_only
                .unwrap_or(policy.local_processing_only),
            auditing_enabled: self.auditing_enabled.unwrap_or(policy.auditing_enabled),
            data_retention_days: self
                .data_retention_days
                .unwrap_or(policy.data_retention_days),
        }
    }
}

/// Policy persisted in `config/privacy.json`.
///
/// Other processes (the CLI next to a running `serve`) change the file, so every
/// read goes back to disk. The in-memory copy is only used when the file cannot be
/// read.
pub struct PolicyStore {
    path: PathBuf,
    last_read: RwLock<PrivacyPolicy>,
}

impl PolicyStore {
    /// Loads the stored policy, falling back to defaults when none was saved
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let policy = load_policy(&path)?;
        Ok(Self {
            path,
            last_read: RwLock::new(policy),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The policy in force right now, as persisted
    pub fn current(&self) -> PrivacyPolicy {
        let mut guard = match self.last_read.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match load_policy(&self.path) {
            Ok(policy) => {
                if *guard != policy {
                    debug!("Privacy policy changed on disk, reloaded {}", self.path.display());
                    *guard = policy.clone();
                }
                policy
            }
            Err(e) => {
                warn!("Using last known privacy policy: {}", e);
                guard.clone()
            }
        }
    }

    /// Validates, persists and installs an update on top of the persisted policy.
    /// Returns the previous and new policy.
    pub fn update(&self, update: &PolicyUpdate) -> Result<(PrivacyPolicy, PrivacyPolicy)> {
        let mut guard = match self.last_read.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let previous = load_policy(&self.path)?;
        let next = update.apply(&previous);
        next.validate()?;

        write_json_atomic(&self.path, &next)?;
        *guard = next.clone();
        info!(
            "Privacy policy updated: localProcessingOnly={}, auditingEnabled={}, dataRetentionDays={}",
            next.local_processing_only, next.auditing_enabled, next.data_retention_days
        );
        Ok((previous, next))
    }
}

/// Reads the persisted policy. Missing or invalid documents give the defaults.
fn load_policy(path: &Path) -> Result<PrivacyPolicy> {
    match fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<PrivacyPolicy>(&contents) {
            Ok(policy) if policy.validate().is_ok() => Ok(policy),
            Ok(_) | Err(_) => {
                warn!(
                    "Ignoring invalid privacy policy at {}, using defaults",
                    path.display()
                );
                Ok(PrivacyPolicy::default())
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PrivacyPolicy::default()),
        Err(e) => Err(RuntimeError::platform(format!(
            "Failed to read privacy policy {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Writes `value` as pretty JSON via a temporary file and rename
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let io = |action: &str, target: &Path, e: std::io::Error| {
        RuntimeError::platform(format!("Failed to {} {}: {}", action, target.display(), e))
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io("create", parent, e))?;
    }
    let contents = serde_json::to_string_pretty(value)
        .map_err(|e| RuntimeError::platform(format!("Failed to serialize {}: {}", path.display(), e)))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents).map_err(|e| io("write", &tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| io("replace", path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_private() {
        let policy = PrivacyPolicy::default();
        assert!(policy.local_processing_only);
        assert!(policy.auditing_enabled);
        assert_eq!(policy.data_retention_days, 7);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let store = PolicyStore::open(dir.path().join("privacy.json")).unwrap();
        assert_eq!(store.current(), PrivacyPolicy::default());
    }

    #[test]
    fn test_update_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config").join("privacy.json");
        let store = PolicyStore::open(&path).unwrap();

        let (before, after) = store
            .update(&PolicyUpdate {
                local_processing_only: Some(false),
                data_retention_days: Some(30),
                ..Default::default()
            })
            .unwrap();
        assert!(before.local_processing_only);
        assert!(!after.local_processing_only);
        assert!(after.auditing_enabled);

        let reopened = PolicyStore::open(&path).unwrap();
        assert_eq!(reopened.current().data_retention_days, 30);
    }

    #[test]
    fn test_retention_bounds() {
        let dir = TempDir::new().unwrap();
        let store = PolicyStore::open(dir.path().join("privacy.json")).unwrap();

        for days in [0, 366] {
            let err = store
                .update(&PolicyUpdate {
                    data_retention_days: Some(days),
                    ..Default::default()
                })
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::Audit);
        }
        assert_eq!(store.current(), PrivacyPolicy::default());
        assert!(store
            .update(&PolicyUpdate {
                data_retention_days: Some(365),
                ..Default::default()
            })
            .is_ok());
    }

    #[test]
    fn test_sees_changes_written_by_another_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("privacy.json");
        let serving = PolicyStore::open(&path).unwrap();
        serving
            .update(&PolicyUpdate {
                local_processing_only: Some(false),
                ..Default::default()
            })
            .unwrap();

        let cli = PolicyStore::open(&path).unwrap();
        cli.update(&PolicyUpdate {
            local_processing_only: Some(true),
            data_retention_days: Some(14),
            ..Default::default()
        })
        .unwrap();

        let policy = serving.current();
        assert!(policy.local_processing_only);
        assert_eq!(policy.data_retention_days, 14);

        // Updates build on the persisted policy, not the stale copy
        let (previous, _) = serving
            .update(&PolicyUpdate {
                auditing_enabled: Some(false),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(previous.data_retention_days, 14);
        assert_eq!(cli.current().data_retention_days, 14);
        assert!(!cli.current().auditing_enabled);
    }

    #[test]
    fn test_invalid_stored_policy_falls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("privacy.json");
        fs::write(&path, r#"{ "dataRetentionDays": 9000 }"#).unwrap();
        let store = PolicyStore::open(&path).unwrap();
        assert_eq!(store.current(), PrivacyPolicy::default());
    }
}

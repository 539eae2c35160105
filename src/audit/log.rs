//! Durable append-only audit log
//!
//! Entries are kept in memory in submission order and appended to a JSON Lines file.
//! Writes go through a single writer; queries copy out of a read lock.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock};

use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::entry::{AuditEntry, AuditEventType, AuditFilter, PrivacyLevel};
use crate::context::RuntimeContext;
use crate::error::{Result, RuntimeError};

pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<File>,
    entries: RwLock<Vec<AuditEntry>>,
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> RuntimeError {
    RuntimeError::audit(format!("Failed to {} {}: {}", action, path.display(), err))
        .with_context("path", path.display())
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| io_error("open", path, e))
}

impl AuditLog {
    /// Opens the log at `path`, loading any entries already recorded there
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error("create", parent, e))?;
        }

        let mut entries = Vec::new();
        if path.exists() {
            let file = File::open(&path).map_err(|e| io_error("read", &path, e))?;
            for (number, line) in BufReader::new(file).lines().enumerate() {
                let line = line.map_err(|e| io_error("read", &path, e))?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditEntry>(&line) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!(
                        "Skipping malformed audit record at {}:{}: {}",
                        path.display(),
                        number + 1,
                        e
                    ),
                }
            }
        }
        debug!("Loaded {} audit entries from {}", entries.len(), path.display());

        Ok(Self {
            writer: Mutex::new(open_append(&path)?),
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&self) -> MutexGuard<'_, File> {
        match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut Vec<AuditEntry>) -> T) -> T {
        let mut guard = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Appends an entry after every entry submitted before it
    pub fn append(&self, entry: AuditEntry) -> Result<()> {
        let mut line = serde_json::to_string(&entry)
            .map_err(|e| RuntimeError::audit(format!("Failed to serialize audit entry: {}", e)))?;
        line.push('\n');

        let mut writer = self.writer();
        writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| io_error("append to", &self.path, e))?;
        self.with_entries(|entries| entries.push(entry));
        Ok(())
    }

    /// Builds an entry for this device and appends it
    pub fn record(
        &self,
        context: &RuntimeContext,
        session_id: &str,
        event_type: AuditEventType,
        privacy_level: PrivacyLevel,
        payload: Value,
    ) -> Result<AuditEntry> {
        let entry = AuditEntry::new(context, session_id, event_type, privacy_level, payload);
        self.append(entry.clone())?;
        Ok(entry)
    }

    /// Snapshot of matching entries in submission order
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut matched: Vec<AuditEntry> = entries
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();
        drop(entries);

        if let Some(limit) = filter.limit {
            if matched.len() > limit {
                matched.drain(..matched.len() - limit);
            }
        }
        matched
    }

    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes entries older than `retention_days` and rewrites the file.
    ///
    /// Returns the number of entries removed.
    pub fn purge_older_than(&self, retention_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let mut writer = self.writer();

        let (kept, removed) = self.with_entries(|entries| {
            let before = entries.len();
            entries.retain(|entry| entry.timestamp >= cutoff);
            (entries.clone(), before - entries.len())
        });
        if removed == 0 {
            return Ok(0);
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        let mut contents = String::new();
        for entry in &kept {
            let line = serde_json::to_string(entry)
                .map_err(|e| RuntimeError::audit(format!("Failed to serialize audit entry: {}", e)))?;
            contents.push_str(&line);
            contents.push('\n');
        }
        fs::write(&tmp, contents).map_err(|e| io_error("write", &tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| io_error("replace", &self.path, e))?;
        *writer = open_append(&self.path)?;

        info!(
            "Purged {} audit entries older than {} days",
            removed, retention_days
        );
        Ok(removed)
    }
}

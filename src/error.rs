//! Runtime error taxonomy
//!
//! Every fallible runtime operation returns a [`RuntimeError`]. Callers dispatch on
//! [`ErrorKind`] rather than on the concrete origin of the failure, and the kind maps to
//! a stable numeric code when the error crosses the IPC boundary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Result alias used across the runtime
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Classification of runtime failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Host capability introspection failed
    #[serde(rename = "PlatformError")]
    Platform,
    /// Unknown model, descriptor/constraint violation or checksum mismatch
    #[serde(rename = "ModelError")]
    Model,
    /// Artifact transfer failure
    #[serde(rename = "NetworkError")]
    Network,
    /// External model adapter or execution contract failure
    #[serde(rename = "PluginError")]
    Plugin,
    /// Audit log could not be written or read
    #[serde(rename = "AuditError")]
    Audit,
}

impl ErrorKind {
    /// Stable code used in IPC error objects
    pub fn code(self) -> i64 {
        match self {
            ErrorKind::Platform => -32001,
            ErrorKind::Model => -32002,
            ErrorKind::Network => -32003,
            ErrorKind::Plugin => -32004,
            ErrorKind::Audit => -32005,
        }
    }

    /// Reverse lookup of [`ErrorKind::code`]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -32001 => Some(ErrorKind::Platform),
            -32002 => Some(ErrorKind::Model),
            -32003 => Some(ErrorKind::Network),
            -32004 => Some(ErrorKind::Plugin),
            -32005 => Some(ErrorKind::Audit),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Platform => write!(f, "PlatformError"),
            ErrorKind::Model => write!(f, "ModelError"),
            ErrorKind::Network => write!(f, "NetworkError"),
            ErrorKind::Plugin => write!(f, "PluginError"),
            ErrorKind::Audit => write!(f, "AuditError"),
        }
    }
}

/// A tagged runtime error
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[error("{kind}: {message}")]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
    /// Structured diagnostic context (model id, url, offsets, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
    /// Only meaningful for network errors: whether a retry may succeed
    #[serde(default)]
    pub transient: bool,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: BTreeMap::new(),
            transient: false,
        }
    }

    pub fn platform(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Platform, message)
    }

    pub fn model(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Model, message)
    }

    /// Unknown model id
    pub fn model_not_found(model_id: &str) -> Self {
        Self::model(format!("Model '{}' not found in catalog", model_id))
            .with_context("model_id", model_id)
    }

    /// Network failure that is worth retrying (timeouts, 5xx, dropped connections)
    pub fn network_transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            ..Self::new(ErrorKind::Network, message)
        }
    }

    /// Network failure that will not go away by retrying the same URL
    pub fn network_terminal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn plugin(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Plugin, message)
    }

    pub fn audit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Audit, message)
    }

    /// Attaches a context key/value pair
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Network && self.transient
    }

    pub fn code(&self) -> i64 {
        self.kind.code()
    }
}

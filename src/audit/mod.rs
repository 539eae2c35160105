//! Append-only audit trail of routing decisions and their outcomes

mod entry;
mod log;

pub use entry::{AuditEntry, AuditEventType, AuditFilter, PrivacyLevel};
pub use log::AuditLog;

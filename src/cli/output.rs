//! Output formatting for multiple formats
//!
//! JSON and YAML render the same serde representation the IPC interface uses. The
//! human format is a compact text layout per result type.
//!
//! # Example
//!
//! ```no_run
//! use edgellm::cli::output::{OutputFormat, OutputFormatter};
//! use edgellm::routing::PrivacyPolicy;
//!
//! let formatter = OutputFormatter::new(OutputFormat::Json);
//! let output = formatter.format_policy(&PrivacyPolicy::default()).unwrap();
//! println!("{}", output);
//! ```

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::audit::AuditEntry;
use crate::capability::SystemCapabilities;
use crate::catalog::ModelDescriptor;
use crate::config::RuntimeConfig;
use crate::download::{DownloadState, LocalModel};
use crate::routing::{ConsentRecord, ConsentScope, PrivacyPolicy, RouteTarget};
use crate::runtime::RunOutcome;

const RULE: &str = "\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON format (machine-readable)
    Json,
    /// YAML format
    Yaml,
    /// Human-readable formatted text
    Human,
}

pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    fn render<T: Serialize + ?Sized>(
        &self,
        value: &T,
        what: &str,
        human: impl FnOnce() -> String,
    ) -> Result<String> {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(value)
                .with_context(|| format!("Failed to serialize {} to JSON", what)),
            OutputFormat::Yaml => serde_yaml::to_string(value)
                .with_context(|| format!("Failed to serialize {} to YAML", what)),
            OutputFormat::Human => Ok(human()),
        }
    }

    pub fn format_capabilities(&self, caps: &SystemCapabilities) -> Result<String> {
        self.render(caps, "capabilities", || {
            let mut output = String::new();
            output.push_str("\u{2713} System Capabilities\n");
            output.push_str(RULE);
            output.push_str("\n\n");

            output.push_str(&format!("Performance Tier:  {}\n", caps.performance_tier));
            output.push_str(&format!("Device Type:       {}\n", caps.platform.device_type));
            output.push_str(&format!(
                "Platform:          {} / {}\n",
                caps.platform.os, caps.hardware.architecture
            ));
            if let Some(ref board) = caps.platform.board_model {
                output.push_str(&format!("Board:             {}\n", board));
            }
            output.push('\n');

            output.push_str("Hardware:\n");
            output.push_str(&format!(
                "\u{251C}\u{2500} Memory:       {:.1}GB available of {:.1}GB\n",
                caps.available_memory_gb(),
                caps.total_memory_gb()
            ));
            output.push_str(&format!(
                "\u{251C}\u{2500} CPU Cores:    {}\n",
                caps.hardware.cpu_cores
            ));
            let features = caps.acceleration_features();
            output.push_str(&format!(
                "\u{2514}\u{2500} Acceleration: {}\n\n",
                if features.is_empty() {
                    "(none)".to_string()
                } else {
                    features.join(", ")
                }
            ));

            output.push_str("Constraints:\n");
            output.push_str(&format!(
                "\u{251C}\u{2500} Max Model Size:     {}MB\n",
                caps.constraints.max_model_size_mb
            ));
            output.push_str(&format!(
                "\u{251C}\u{2500} Max Context Length: {}\n",
                caps.constraints.max_context_length
            ));
            output.push_str(&format!(
                "\u{251C}\u{2500} Threads:            {}\n",
                caps.constraints.recommended_threads
            ));
            output.push_str(&format!(
                "\u{2514}\u{2500} Memory Mapping:     {}\n",
                if caps.constraints.use_memory_mapping {
                    "yes"
                } else {
                    "no"
                }
            ));
            output
        })
    }

    pub fn format_models(&self, models: &[ModelDescriptor]) -> Result<String> {
        self.render(models, "models", || {
            if models.is_empty() {
                return "No compatible models\n".to_string();
            }
            let mut output = String::new();
            output.push_str(&format!("{} model(s)\n", models.len()));
            output.push_str(RULE);
            output.push('\n');
            for model in models {
                output.push_str(&format!(
                    "{:<28} {:>6}MB  needs {:>5}MB RAM  ctx {:<6} min tier {}\n",
                    model.id,
                    model.size_mb(),
                    model.required_memory_mb,
                    model.context_length,
                    model.min_performance_tier
                ));
            }
            output
        })
    }

    pub fn format_local_models(&self, models: &[LocalModel]) -> Result<String> {
        self.render(models, "local models", || {
            if models.is_empty() {
                return "No downloaded models\n".to_string();
            }
            let mut output = String::new();
            for model in models {
                output.push_str(&format!(
                    "\u{2713} {} ({} bytes) used {} time(s)\n  {}\n",
                    model.model_id,
                    model.size_bytes,
                    model.use_count,
                    model.artifact_path.display()
                ));
            }
            output
        })
    }

    pub fn format_download(&self, state: &DownloadState) -> Result<String> {
        self.render(state, "download state", || match &state.error {
            None => format!(
                "\u{2713} {} {} ({} bytes)\n  {}\n",
                state.model_id,
                state.status,
                state.bytes_downloaded,
                state.target_path.display()
            ),
            Some(error) => format!(
                "\u{2717} {} failed after {} of {} bytes: {}\n  {}\n",
                state.model_id,
                state.bytes_downloaded,
                state.total_bytes,
                error,
                if state.resumable {
                    "Run the download again to resume"
                } else {
                    "The download will restart from the beginning"
                }
            ),
        })
    }

    /// Summary after a run. Streamed text has already been printed in human mode
    pub fn format_run(&self, outcome: &RunOutcome, streamed: bool) -> Result<String> {
        let value = serde_json::json!({
            "decision": outcome.decision,
            "response": outcome.response,
        });
        self.render(&value, "inference result", || {
            let decision = &outcome.decision;
            let mut output = String::new();
            match (&outcome.response, decision.target) {
                (_, RouteTarget::Denied) | (None, _) => {
                    output.push_str(&format!("\u{2717} Request denied: {}\n", decision.reason));
                }
                (Some(response), target) => {
                    if !streamed {
                        output.push_str(&response.text);
                    }
                    output.push_str("\n\n");
                    output.push_str(RULE);
                    output.push('\n');
                    output.push_str(&format!("Route:    {} ({})\n", target.as_str(), decision.reason));
                    output.push_str(&format!(
                        "Tokens:   {} in {}ms ({:.1} tok/s)\n",
                        response.tokens_generated,
                        response.timings.total_ms,
                        response.tokens_per_second
                    ));
                    if let Some(reason) = response.finish_reason {
                        output.push_str(&format!(
                            "Finished: {}\n",
                            format!("{:?}", reason).to_lowercase()
                        ));
                    }
                    if let Some(ref error) = response.error {
                        output.push_str(&format!("\u{26A0} {}\n", error));
                    }
                }
            }
            output.push_str(&format!("Session:  {}\n", decision.session_id));
            output
        })
    }

    pub fn format_audit(&self, entries: &[AuditEntry]) -> Result<String> {
        self.render(entries, "audit entries", || {
            if entries.is_empty() {
                return "No audit entries\n".to_string();
            }
            let mut output = String::new();
            for entry in entries {
                output.push_str(&format!(
                    "{}  {:<14} {:<8} {}  {}\n",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    entry.event_type.as_str(),
                    format!("{:?}", entry.privacy_level).to_lowercase(),
                    entry.session_id,
                    entry.payload
                ));
            }
            output
        })
    }

    pub fn format_policy(&self, policy: &PrivacyPolicy) -> Result<String> {
        self.render(policy, "privacy policy", || {
            let mut output = String::new();
            output.push_str("Privacy Policy\n");
            output.push_str(RULE);
            output.push_str("\n\n");
            output.push_str(&format!(
                "Local processing only: {}\n",
                policy.local_processing_only
            ));
            output.push_str(&format!("Auditing enabled:      {}\n", policy.auditing_enabled));
            output.push_str(&format!(
                "Data retention:        {} day(s)\n",
                policy.data_retention_days
            ));
            output
        })
    }

    pub fn format_consents(&self, records: &[ConsentRecord]) -> Result<String> {
        self.render(records, "consent records", || {
            if records.is_empty() {
                return "No active consent\n".to_string();
            }
            let mut output = String::new();
            for record in records {
                let scope = match record.scope {
                    ConsentScope::Device => "device".to_string(),
                    ConsentScope::Query => format!(
                        "query {}",
                        record
                            .prompt_digest
                            .as_deref()
                            .map(|digest| &digest[..digest.len().min(12)])
                            .unwrap_or("?")
                    ),
                };
                output.push_str(&format!(
                    "\u{2713} {} until {}\n",
                    scope,
                    record.expires_at.format("%Y-%m-%d %H:%M")
                ));
            }
            output
        })
    }

    pub fn format_config(&self, config: &RuntimeConfig) -> Result<String> {
        let map: BTreeMap<String, String> = config.to_display_map().into_iter().collect();
        self.render(&map, "config", || config.to_string())
    }
}

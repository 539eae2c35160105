//! Model descriptors

use serde::{Deserialize, Serialize};

use crate::capability::{DeviceType, PerformanceTier};
use crate::error::{Result, RuntimeError};

/// Free-form descriptive metadata carried by a descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

/// Immutable description of a downloadable model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    pub architecture: String,
    pub quantization: String,
    pub size_bytes: u64,
    pub required_memory_mb: u64,
    pub context_length: u32,
    pub supported_devices: Vec<DeviceType>,
    pub min_performance_tier: PerformanceTier,
    /// Primary URL first, mirrors after it
    pub download_urls: Vec<String>,
    /// Lowercase hex SHA-256 of the artifact
    pub checksum: String,
    /// Lowercase hex MD5, checked in addition to the SHA-256 when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_md5: Option<String>,
    #[serde(default)]
    pub metadata: ModelMetadata,
}

fn is_hex_of_len(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| c.is_ascii_hexdigit())
}

impl ModelDescriptor {
    pub fn size_mb(&self) -> u64 {
        const MB: u64 = 1024 * 1024;
        (self.size_bytes + MB - 1) / MB
    }

    pub fn supports_device(&self, device_type: DeviceType) -> bool {
        self.supported_devices.contains(&device_type)
    }

    /// Checks structural validity and normalizes checksums to lowercase
    pub fn validate(mut self) -> Result<Self> {
        let invalid = |reason: &str| {
            RuntimeError::model(format!("Invalid model descriptor: {}", reason))
                .with_context("model_id", &self.id)
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if !is_file_name_safe(&self.id) {
            return Err(invalid("id must not contain path separators, '..' or control characters"));
        }
        if self.download_urls.is_empty() {
            return Err(invalid("at least one download URL is required"));
        }
        if self.size_bytes == 0 {
            return Err(invalid("sizeBytes must be positive"));
        }
        if self.context_length == 0 {
            return Err(invalid("contextLength must be positive"));
        }
        if self.supported_devices.is_empty() {
            return Err(invalid("supportedDevices must not be empty"));
        }
        if !is_hex_of_len(&self.checksum, 64) {
            return Err(invalid("checksum must be a 64 character SHA-256 hex digest"));
        }
        if let Some(md5) = &self.legacy_md5 {
            if !is_hex_of_len(md5, 32) {
                return Err(invalid("legacyMd5 must be a 32 character hex digest"));
            }
        }

        self.checksum = self.checksum.to_lowercase();
        self.legacy_md5 = self.legacy_md5.map(|md5| md5.to_lowercase());
        Ok(self)
    }
}

/// Ids name files under the models and temp directories
fn is_file_name_safe(id: &str) -> bool {
    !id.contains(['/', '\\'])
        && !id.contains("..")
        && !id.chars().any(char::is_control)
}


#[cfg(test)]
mod tests {
    use super::fixtures::descriptor;
    use super::*;
    use crate::error::ErrorKind;
    use yare::parameterized;

    #[test]
    fn test_parses_camel_case_json() {
        let json = r#"{
            "id": "tinyllama-1.1b-q4",
            "name": "TinyLlama 1.1B Chat",
            "architecture": "llama",
            "quantization": "q4_0",
            "sizeBytes": 669000000,
            "requiredMemoryMb": 1024,
            "contextLength": 2048,
            "supportedDevices": ["desktop", "single_board"],
            "minPerformanceTier": "low",
            "downloadUrls": ["https://a.example/t.gguf", "https://b.example/t.gguf"],
            "checksum": "ABCDEF0123456789ABCDEF0123456789ABCDEF0123456789ABCDEF0123456789",
            "metadata": { "license": "apache-2.0", "tags": ["chat"] }
        }"#;

        let parsed: ModelDescriptor = serde_json::from_str(json).unwrap();
        let descriptor = parsed.validate().unwrap();

        assert_eq!(descriptor.min_performance_tier, PerformanceTier::Low);
        assert!(descriptor.supports_device(DeviceType::SingleBoard));
        assert_eq!(descriptor.download_urls.len(), 2);
        assert_eq!(descriptor.checksum, descriptor.checksum.to_lowercase());
        assert_eq!(descriptor.metadata.license.as_deref(), Some("apache-2.0"));
        assert_eq!(descriptor.size_mb(), 639);
    }

    #[test]
    fn test_rejects_missing_urls() {
        let mut d = descriptor("m", 512, PerformanceTier::Low);
        d.download_urls.clear();
        let err = d.validate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Model);
        assert_eq!(err.context.get("model_id").map(String::as_str), Some("m"));
    }

    #[test]
    fn test_rejects_weak_primary_checksum() {
        let mut d = descriptor("m", 512, PerformanceTier::Low);
        d.checksum = "d41d8cd98f00b204e9800998ecf8427e".to_string();
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_rejects_malformed_legacy_md5() {
        let mut d = descriptor("m", 512, PerformanceTier::Low);
        d.legacy_md5 = Some("xyz".to_string());
        assert!(d.validate().is_err());
    }

    #[parameterized(
        org_prefix = { "TinyLlama/TinyLlama-1.1B" },
        backslash = { "models\\tiny" },
        parent = { ".." },
        escape = { "../../etc/passwd" },
        embedded_parent = { "tiny..llama" },
        newline = { "tiny\nllama" },
    )]
    fn test_rejects_ids_unfit_for_file_names(id: &str) {
        let err = descriptor(id, 512, PerformanceTier::Low).validate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Model);
        assert!(err.message.contains("path separators"), "{}", err.message);
    }

    #[test]
    fn test_accepts_dotted_ids() {
        let d = descriptor("phi-3.5-mini.q4", 512, PerformanceTier::Low);
        assert!(d.validate().is_ok());
    }
}

//! Configuration management for edgellm
//!
//! Settings are loaded from environment variables with defaults suitable for a
//! single-user device.
//!
//! # Environment Variables
//!
//! - `EDGELLM_HOME`: Runtime root holding `models/`, `config/`, `logs/`, `temp/` - default: data dir + "edgellm"
//! - `EDGELLM_CATALOG`: Model catalog file - default: `<home>/models/catalog.json`
//! - `EDGELLM_PLATFORM`: Platform probe (auto|desktop|raspberry-pi|esp32|pico) - default: "auto"
//! - `EDGELLM_DEVICE_ID`: Device identifier recorded in the audit log - default: derived from the host name
//! - `EDGELLM_LOG_LEVEL`: Logging level - default: "info"
//! - `EDGELLM_DOWNLOAD_CHUNK_SIZE`: Bytes between download checkpoints - default: "1048576"
//! - `EDGELLM_DOWNLOAD_MAX_ATTEMPTS`: Attempts per download URL - default: "5"
//! - `EDGELLM_DOWNLOAD_BACKOFF_MS`: Initial retry backoff - default: "500"
//! - `EDGELLM_REQUEST_TIMEOUT`: HTTP timeout in seconds - default: "30"
//! - `EDGELLM_MAX_CONCURRENT_SESSIONS`: Sessions per loaded model - default: "4"
//! - `EDGELLM_EXTERNAL_ENDPOINT`: OpenAI-compatible endpoint for external routing - default: unset
//! - `EDGELLM_EXTERNAL_MODEL`: Model name at that endpoint - default: "gpt-4o-mini"
//! - `EDGELLM_EXTERNAL_API_KEY`: Bearer token for that endpoint - default: unset

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::capability::PlatformKind;
use crate::download::DownloadConfig;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_CHUNK_SIZE: u64 = 1_048_576;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BACKOFF_MS: u64 = 500;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_CONCURRENT_SESSIONS: u32 = 4;
const DEFAULT_EXTERNAL_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid platform: {0}")]
    InvalidPlatform(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Failed to parse {field}: {error}")]
    ParseError { field: String, error: String },

    #[error("Failed to create {path}: {error}")]
    LayoutError { path: PathBuf, error: String },
}

/// On-disk layout under the runtime root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLayout {
    pub root: PathBuf,
}

impl RuntimeLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    pub fn privacy_policy_path(&self) -> PathBuf {
        self.config_dir().join("privacy.json")
    }

    pub fn consent_path(&self) -> PathBuf {
        self.config_dir().join("consent.json")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.logs_dir().join("audit.jsonl")
    }

    pub fn default_catalog_path(&self) -> PathBuf {
        self.models_dir().join("catalog.json")
    }

    /// Creates every directory of the layout
    pub fn ensure(&self) -> Result<(), ConfigError> {
        for dir in [
            self.models_dir(),
            self.config_dir(),
            self.logs_dir(),
            self.temp_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| ConfigError::LayoutError {
                path: dir.clone(),
                error: e.to_string(),
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub home: PathBuf,
    pub catalog_path: PathBuf,
    pub platform: PlatformKind,
    pub device_id: String,
    pub log_level: String,
    pub download_chunk_size: u64,
    pub download_max_attempts: u32,
    pub download_backoff_ms: u64,
    pub request_timeout_secs: u64,
    pub max_concurrent_sessions: u32,
    pub external_endpoint: Option<String>,
    pub external_model: String,
    pub external_api_key: Option<String>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Stable identifier for this host that does not reveal its name
fn derive_device_id() -> String {
    match sysinfo::System::host_name().filter(|name| !name.is_empty()) {
        Some(host) => {
            let digest = format!("{:x}", md5::compute(host.as_bytes()));
            format!("edge-{}", &digest[..12])
        }
        None => format!("edge-{}", uuid::Uuid::new_v4().simple()),
    }
}

fn default_home() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(env::temp_dir)
        .join("edgellm")
}

impl Default for RuntimeConfig {
    /// Loads configuration from `EDGELLM_*` environment variables with defaults
    fn default() -> Self {
        let home = env::var("EDGELLM_HOME")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_home);

        let catalog_path = env::var("EDGELLM_CATALOG")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| RuntimeLayout::new(&home).default_catalog_path());

        let platform = env::var("EDGELLM_PLATFORM")
            .ok()
            .and_then(|v| v.parse::<PlatformKind>().ok())
            .unwrap_or(PlatformKind::Auto);

        let device_id = env::var("EDGELLM_DEVICE_ID")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(derive_device_id);

        let log_level = env::var("EDGELLM_LOG_LEVEL")
            .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string())
            .to_lowercase();

        Self {
            home,
            catalog_path,
            platform,
            device_id,
            log_level,
            download_chunk_size: env_parse("EDGELLM_DOWNLOAD_CHUNK_SIZE", DEFAULT_CHUNK_SIZE),
            download_max_attempts: env_parse("EDGELLM_DOWNLOAD_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS),
            download_backoff_ms: env_parse("EDGELLM_DOWNLOAD_BACKOFF_MS", DEFAULT_BACKOFF_MS),
            request_timeout_secs: env_parse("EDGELLM_REQUEST_TIMEOUT", DEFAULT_REQUEST_TIMEOUT_SECS),
            max_concurrent_sessions: env_parse(
                "EDGELLM_MAX_CONCURRENT_SESSIONS",
                DEFAULT_MAX_CONCURRENT_SESSIONS,
            ),
            external_endpoint: env::var("EDGELLM_EXTERNAL_ENDPOINT")
                .ok()
                .filter(|v| !v.is_empty()),
            external_model: env::var("EDGELLM_EXTERNAL_MODEL")
                .unwrap_or_else(|_| DEFAULT_EXTERNAL_MODEL.to_string()),
            external_api_key: env::var("EDGELLM_EXTERNAL_API_KEY")
                .ok()
                .filter(|v| !v.is_empty()),
        }
    }
}

impl RuntimeConfig {
    /// Configuration rooted at `home` with every other value at its default
    pub fn with_home(home: impl AsRef<Path>) -> Self {
        let home = home.as_ref().to_path_buf();
        let catalog_path = RuntimeLayout::new(&home).default_catalog_path();
        Self {
            home,
            catalog_path,
            platform: PlatformKind::Auto,
            device_id: derive_device_id(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            download_chunk_size: DEFAULT_CHUNK_SIZE,
            download_max_attempts: DEFAULT_MAX_ATTEMPTS,
            download_backoff_ms: DEFAULT_BACKOFF_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_concurrent_sessions: DEFAULT_MAX_CONCURRENT_SESSIONS,
            external_endpoint: None,
            external_model: DEFAULT_EXTERNAL_MODEL.to_string(),
            external_api_key: None,
        }
    }

    pub fn layout(&self) -> RuntimeLayout {
        RuntimeLayout::new(&self.home)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            checkpoint_bytes: self.download_chunk_size,
            max_attempts: self.download_max_attempts,
            initial_backoff: Duration::from_millis(self.download_backoff_ms),
            ..DownloadConfig::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "Request timeout must be at least 1 second".to_string(),
            ));
        }
        if self.request_timeout_secs > 600 {
            return Err(ConfigError::ValidationFailed(
                "Request timeout cannot exceed 10 minutes".to_string(),
            ));
        }

        if self.download_chunk_size < 4096 {
            return Err(ConfigError::ValidationFailed(
                "Download chunk size must be at least 4KB".to_string(),
            ));
        }
        if !(1..=20).contains(&self.download_max_attempts) {
            return Err(ConfigError::ValidationFailed(
                "Download attempts must be between 1 and 20".to_string(),
            ));
        }
        if !(1..=64).contains(&self.max_concurrent_sessions) {
            return Err(ConfigError::ValidationFailed(
                "Concurrent sessions must be between 1 and 64".to_string(),
            ));
        }
        if self.device_id.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "Device id cannot be empty".to_string(),
            ));
        }

        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationFailed(format!(
                    "Invalid log level: {}. Valid options: trace, debug, info, warn, error",
                    self.log_level
                )))
            }
        }

        Ok(())
    }

    /// Converts configuration to a display map for output formatting
    pub fn to_display_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();

        map.insert("home".to_string(), self.home.display().to_string());
        map.insert(
            "catalog_path".to_string(),
            self.catalog_path.display().to_string(),
        );
        map.insert("platform".to_string(), self.platform.to_string());
        map.insert("device_id".to_string(), self.device_id.clone());
        map.insert("log_level".to_string(), self.log_level.clone());
        map.insert(
            "download_chunk_size".to_string(),
            self.download_chunk_size.to_string(),
        );
        map.insert(
            "download_max_attempts".to_string(),
            self.download_max_attempts.to_string(),
        );
        map.insert(
            "download_backoff_ms".to_string(),
            self.download_backoff_ms.to_string(),
        );
        map.insert(
            "request_timeout_secs".to_string(),
            self.request_timeout_secs.to_string(),
        );
        map.insert(
            "max_concurrent_sessions".to_string(),
            self.max_concurrent_sessions.to_string(),
        );
        if let Some(ref endpoint) = self.external_endpoint {
            map.insert("external_endpoint".to_string(), endpoint.clone());
            map.insert("external_model".to_string(), self.external_model.clone());
        }

        map
    }
}

impl fmt::Display for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Edgellm Configuration:")?;
        writeln!(f, "  Home: {}", self.home.display())?;
        writeln!(f, "  Catalog: {}", self.catalog_path.display())?;
        writeln!(f, "  Platform: {}", self.platform)?;
        writeln!(f, "  Device Id: {}", self.device_id)?;
        writeln!(f, "  Download Chunk Size: {} bytes", self.download_chunk_size)?;
        writeln!(f, "  Download Attempts: {}", self.download_max_attempts)?;
        writeln!(f, "  Request Timeout: {}s", self.request_timeout_secs)?;
        writeln!(f, "  Concurrent Sessions: {}", self.max_concurrent_sessions)?;
        if let Some(ref endpoint) = self.external_endpoint {
            writeln!(f, "  External Model: {} at {}", self.external_model, endpoint)?;
        }
        writeln!(f, "  Log Level: {}", self.log_level)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    /// Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        old_value: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let old_value = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                old_value,
            }
        }

        fn unset(key: &str) -> Self {
            let old_value = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                old_value,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.old_value {
                Some(v) => env::set_var(&self.key, v),
                None => env::remove_var(&self.key),
            }
        }
    }

    #[test]
    #[serial]
    fn test_default_configuration() {
        let _guards = vec![
            EnvGuard::set("EDGELLM_HOME", "/var/lib/edgellm"),
            EnvGuard::unset("EDGELLM_CATALOG"),
            EnvGuard::unset("EDGELLM_PLATFORM"),
            EnvGuard::unset("EDGELLM_DOWNLOAD_CHUNK_SIZE"),
            EnvGuard::unset("EDGELLM_MAX_CONCURRENT_SESSIONS"),
            EnvGuard::set("EDGELLM_LOG_LEVEL", DEFAULT_LOG_LEVEL),
        ];

        let config = RuntimeConfig::default();

        assert_eq!(config.home, PathBuf::from("/var/lib/edgellm"));
        assert_eq!(
            config.catalog_path,
            PathBuf::from("/var/lib/edgellm/models/catalog.json")
        );
        assert_eq!(config.platform, PlatformKind::Auto);
        assert_eq!(config.download_chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.max_concurrent_sessions, DEFAULT_MAX_CONCURRENT_SESSIONS);
        assert!(config.device_id.starts_with("edge-"));
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_environment_variable_parsing() {
        let _guards = vec![
            EnvGuard::set("EDGELLM_PLATFORM", "raspberry-pi"),
            EnvGuard::set("EDGELLM_DEVICE_ID", "kitchen-pi"),
            EnvGuard::set("EDGELLM_LOG_LEVEL", "DEBUG"),
            EnvGuard::set("EDGELLM_DOWNLOAD_MAX_ATTEMPTS", "3"),
            EnvGuard::set("EDGELLM_DOWNLOAD_BACKOFF_MS", "50"),
            EnvGuard::set("EDGELLM_REQUEST_TIMEOUT", "60"),
            EnvGuard::set("EDGELLM_MAX_CONCURRENT_SESSIONS", "not-a-number"),
        ];

        let config = RuntimeConfig::default();

        assert_eq!(config.platform, PlatformKind::RaspberryPi);
        assert_eq!(config.device_id, "kitchen-pi");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.download_max_attempts, 3);
        assert_eq!(config.request_timeout_secs, 60);
        assert_eq!(config.max_concurrent_sessions, DEFAULT_MAX_CONCURRENT_SESSIONS);

        let download = config.download_config();
        assert_eq!(download.max_attempts, 3);
        assert_eq!(download.initial_backoff, Duration::from_millis(50));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = RuntimeConfig::with_home("/tmp/edgellm");
        config.request_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::with_home("/tmp/edgellm");
        config.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::with_home("/tmp/edgellm");
        config.max_concurrent_sessions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_layout_creates_directories() {
        let dir = TempDir::new().unwrap();
        let layout = RuntimeConfig::with_home(dir.path()).layout();
        layout.ensure().unwrap();

        for sub in ["models", "config", "logs", "temp"] {
            assert!(dir.path().join(sub).is_dir());
        }
        assert_eq!(layout.audit_log_path(), dir.path().join("logs/audit.jsonl"));
        assert_eq!(
            layout.privacy_policy_path(),
            dir.path().join("config/privacy.json")
        );
    }

    #[test]
    fn test_config_display() {
        let config = RuntimeConfig::with_home("/tmp/edgellm");
        let display = format!("{}", config);
        assert!(display.contains("Edgellm Configuration:"));
        assert!(display.contains("Platform: auto"));
        assert!(!config.to_display_map().contains_key("external_endpoint"));
    }
}

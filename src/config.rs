use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::constants::DEFAULT_MAX_MEMORY;
use crate::preprocess::Pipeline;
use crate::retry::RetryPolicy;

pub const ENV_PORT: &str = "PORT";
pub const ENV_AWS_REGION: &str = "AWS_REGION";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn default_port() -> u16 {
    5000
}

fn default_max_body_bytes() -> usize {
    25 * 1024 * 1024
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_attendance_collection() -> String {
    "attendance".to_string()
}

fn default_subjects_collection() -> String {
    "subjects".to_string()
}

fn default_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_max_memory() -> usize {
    DEFAULT_MAX_MEMORY
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    200
}

/// HTTP listener settings (maps to [server] section in TOML)
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on (default: 5000, overridden by PORT)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest accepted request body in bytes (default: 25 MiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Face recognition service settings (maps to [face_directory] section in TOML)
#[derive(Debug, Clone, Deserialize)]
pub struct FaceDirectoryConfig {
    /// AWS region (default: us-east-1, overridden by AWS_REGION)
    #[serde(default = "default_region")]
    pub region: String,
    /// Enhancement applied before detection: contrast or enhanced
    #[serde(default)]
    pub pipeline: Pipeline,
    /// Endpoint override, e.g. a local emulator
    pub endpoint: Option<String>,
}

/// Document store settings (maps to [store] section in TOML)
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Project id (default: the service account's project)
    pub project_id: Option<String>,
    #[serde(default = "default_attendance_collection")]
    pub attendance_collection: String,
    #[serde(default = "default_subjects_collection")]
    pub subjects_collection: String,
    /// Endpoint override, e.g. the Firestore emulator
    pub endpoint: Option<String>,
}

/// Chat assistant settings (maps to [chat] section in TOML)
#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// Turns kept in the transcript, system turn included (default: 20)
    #[serde(default = "default_max_memory")]
    pub max_memory: usize,
    /// Never evict the system turn when trimming
    #[serde(default)]
    pub pin_system_turn: bool,
    pub endpoint: Option<String>,
}

/// Outbound HTTP settings shared by every client (maps to [http] section in TOML)
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Total request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Attempts for idempotent calls, first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff before the first retry, doubled per retry
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

/// Configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub face_directory: FaceDirectoryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for FaceDirectoryConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            pipeline: Pipeline::default(),
            endpoint: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            attendance_collection: default_attendance_collection(),
            subjects_collection: default_subjects_collection(),
            endpoint: None,
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_memory: default_max_memory(),
            pin_system_turn: false,
            endpoint: None,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.backoff_ms),
        }
    }
}

impl AppConfig {
    /// Load a TOML config file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply PORT and AWS_REGION from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides through an arbitrary key lookup; empty values are ignored
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(ENV_PORT).filter(|v| !v.trim().is_empty()) {
            self.server.port = port.trim().parse().map_err(|_| ConfigError::Invalid {
                key: ENV_PORT,
                reason: format!("'{}' is not a port number", port),
            })?;
        }
        if let Some(region) = lookup(ENV_AWS_REGION).filter(|v| !v.trim().is_empty()) {
            self.face_directory.region = region.trim().to_string();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "http.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.http.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "http.timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.chat.max_memory < 2 {
            return Err(ConfigError::Invalid {
                key: "chat.max_memory",
                reason: "must keep at least one exchange (2 turns)".to_string(),
            });
        }
        if self.face_directory.region.is_empty() {
            return Err(ConfigError::Invalid {
                key: "face_directory.region",
                reason: "must not be empty".to_string(),
            });
        }
        if self.store.attendance_collection.is_empty() || self.store.subjects_collection.is_empty() {
            return Err(ConfigError::Invalid {
                key: "store",
                reason: "collection names must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.max_body_bytes, 26214400);
        assert_eq!(config.face_directory.pipeline, Pipeline::Contrast);
        assert_eq!(config.store.attendance_collection, "attendance");
        assert_eq!(config.chat.max_memory, 20);
        assert!(!config.chat.pin_system_turn);
        assert_eq!(config.http.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections() {
        let config: AppConfig = toml::from_str(
            r#"
            [face_directory]
            pipeline = "enhanced"

            [chat]
            max_memory = 8
            pin_system_turn = true

            [http]
            backoff_ms = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.face_directory.pipeline, Pipeline::Enhanced);
        assert_eq!(config.face_directory.region, "us-east-1");
        assert_eq!(config.chat.max_memory, 8);
        assert!(config.chat.pin_system_turn);
        assert_eq!(config.chat.model, "gemini-1.5-flash");
        assert_eq!(config.http.retry_policy().base_delay, Duration::from_millis(50));
        assert_eq!(config.http.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_unknown_pipeline_is_rejected() {
        let result: Result<AppConfig, _> = toml::from_str("[face_directory]\npipeline = \"sharp\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 8080\n\n[store]\nproject_id = \"demo\"").unwrap();
        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.store.project_id.as_deref(), Some("demo"));

        let missing = AppConfig::from_file(Path::new("/nonexistent/attendance.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [(ENV_PORT, "9090"), (ENV_AWS_REGION, "eu-west-2")]
            .into_iter()
            .collect();
        let mut config = AppConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.face_directory.region, "eu-west-2");

        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(|k| (k == ENV_PORT).then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = AppConfig::default();
        config.http.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                key: "http.max_attempts",
                ..
            })
        ));
    }
}

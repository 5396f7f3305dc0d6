//! Configuration management
//!
//! The daemon reads one JSON document at startup (never reloaded):
//!
//! ```json
//! {
//!   "sage_server": {
//!     "data_api_url": "https://data.sagecontinuum.org/api/v1/query",
//!     "nodes": ["W0A1", "W0B2"],
//!     "plugin": "registry.sagecontinuum.org/example/cmf-logger.*",
//!     "history_period": "-1h",
//!     "portal_username": "alice",
//!     "portal_access_token": "..."
//!   },
//!   "cmf_server": {
//!     "CMF_INIT_COMMAND": "cmf init minioS3 --url s3://dvc-art --endpoint-url http://${MINIO_IP}:9000 ...",
//!     "MINIO_IP": "10.0.0.5"
//!   },
//!   "pipeline": {
//!     "pipeline_name": "edge-pipeline",
//!     "pipeline_file": "mlmd",
//!     "stage_name": "ingest",
//!     "execution_name": "sync"
//!   },
//!   "sync": { "cycle_interval_secs": 120 }
//! }
//! ```
//!
//! Portal credentials may also come from `SAGE_PORTAL_USERNAME` and
//! `SAGE_PORTAL_TOKEN` (a `.env` file is honored), and the state directory
//! from `CMFPROXY_STATE_DIR`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};

// ============================================================================
// Defaults
// ============================================================================

/// Default telemetry query endpoint
pub const DEFAULT_DATA_API_URL: &str = "https://data.sagecontinuum.org/api/v1/query";

/// Default lookback window for discovery
pub const DEFAULT_HISTORY_PERIOD: &str = "-1h";

/// Idle delay between pipeline cycles
pub const DEFAULT_CYCLE_INTERVAL_SECS: u64 = 120;

/// Per-node telemetry query timeout
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 120;

/// Per-bundle download timeout
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 1800;

/// Per-command timeout for metadata-store invocations
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 3600;

/// Durable prefix that replaces `<pipeline>:/src` in artifact locations
pub const DEFAULT_ARTIFACT_PREFIX: &str = "s3://dvc-art";

/// Key of the init command template inside `cmf_server`
pub const INIT_COMMAND_KEY: &str = "CMF_INIT_COMMAND";

/// Full daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub sage_server: SageServerConfig,
    pub cmf_server: CmfServerConfig,
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub sync: SyncSettings,
}

/// Telemetry source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SageServerConfig {
    #[serde(default = "default_data_api_url")]
    pub data_api_url: String,
    pub nodes: Vec<String>,
    pub plugin: String,
    #[serde(default = "default_history_period")]
    pub history_period: String,
    #[serde(default)]
    pub portal_username: Option<String>,
    #[serde(default)]
    pub portal_access_token: Option<String>,
}

/// Metadata-store settings: the init template plus named connection
/// parameters, kept flat so existing config files load unchanged
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmfServerConfig {
    #[serde(rename = "CMF_INIT_COMMAND")]
    pub init_command: String,
    #[serde(flatten)]
    pub params: BTreeMap<String, String>,
}

/// Pipeline identity. `pipeline_file` is the ML-Metadata file the
/// metadata store keeps inside each workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub pipeline_name: String,
    pub pipeline_file: String,
    #[serde(default)]
    pub stage_name: Option<String>,
    #[serde(default)]
    pub execution_name: Option<String>,
}

/// Local layout, timing and adapter knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Directory holding the three checkpoint files
    pub state_dir: PathBuf,
    /// Shared download directory (relative paths resolve under `state_dir`)
    pub download_dir: PathBuf,
    /// Parent of the per-bundle workspaces (relative paths resolve under `state_dir`)
    pub workspace_root: PathBuf,
    pub cycle_interval_secs: u64,
    pub query_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub artifact_prefix: String,
    /// Metadata-store CLI executable
    pub cmf_bin: String,
    /// Check local files against their checksum sidecar before publishing
    pub verify_local_bundles: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("."),
            download_dir: PathBuf::from("cmf_downloads"),
            workspace_root: PathBuf::from("."),
            cycle_interval_secs: DEFAULT_CYCLE_INTERVAL_SECS,
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            artifact_prefix: DEFAULT_ARTIFACT_PREFIX.to_string(),
            cmf_bin: "cmf".to_string(),
            verify_local_bundles: true,
        }
    }
}

fn default_data_api_url() -> String {
    DEFAULT_DATA_API_URL.to_string()
}

fn default_history_period() -> String {
    DEFAULT_HISTORY_PERIOD.to_string()
}

/// Portal credentials for bundle downloads
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl Config {
    /// Load configuration from a JSON file plus environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        dotenvy::dotenv().ok();

        let raw = std::fs::read_to_string(path).map_err(|e| {
            SyncError::config(format!("cannot read config file {}: {}", path.display(), e))
        })?;

        let mut config = Self::from_json(&raw)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse without validation or environment overrides
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| SyncError::config(format!("invalid config: {}", e)))
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(user) = lookup("SAGE_PORTAL_USERNAME") {
            self.sage_server.portal_username = Some(user);
        }
        if let Some(token) = lookup("SAGE_PORTAL_TOKEN") {
            self.sage_server.portal_access_token = Some(token);
        }
        if let Some(dir) = lookup("CMFPROXY_STATE_DIR") {
            self.sync.state_dir = PathBuf::from(dir);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.sage_server.data_api_url.is_empty() {
            return Err(SyncError::config("sage_server.data_api_url cannot be empty"));
        }
        if self.sage_server.nodes.is_empty() {
            return Err(SyncError::config("sage_server.nodes must list at least one node"));
        }
        if self.sage_server.nodes.iter().any(|n| n.trim().is_empty()) {
            return Err(SyncError::config("sage_server.nodes contains an empty node id"));
        }
        if self.sage_server.plugin.is_empty() {
            return Err(SyncError::config("sage_server.plugin cannot be empty"));
        }
        if self.credentials().is_none() {
            return Err(SyncError::config(
                "portal username or access token not found (set sage_server.portal_username/portal_access_token or SAGE_PORTAL_USERNAME/SAGE_PORTAL_TOKEN)",
            ));
        }
        if self.pipeline.pipeline_name.is_empty() {
            return Err(SyncError::config("pipeline.pipeline_name cannot be empty"));
        }
        if self.pipeline.pipeline_file.is_empty() {
            return Err(SyncError::config("pipeline.pipeline_file cannot be empty"));
        }
        if self.sync.cycle_interval_secs == 0 {
            return Err(SyncError::config("sync.cycle_interval_secs must be greater than 0"));
        }
        if self.sync.query_timeout_secs == 0
            || self.sync.download_timeout_secs == 0
            || self.sync.command_timeout_secs == 0
        {
            return Err(SyncError::config("sync timeouts must be greater than 0"));
        }
        if self.sync.artifact_prefix.is_empty() {
            return Err(SyncError::config("sync.artifact_prefix cannot be empty"));
        }

        // Fail at startup rather than at the first publish attempt
        self.cmf_server.resolved_init_command()?;
        Ok(())
    }

    /// Credentials, if both parts are present and non-empty
    pub fn credentials(&self) -> Option<Credentials> {
        let username = self.sage_server.portal_username.as_deref()?.trim();
        let token = self.sage_server.portal_access_token.as_deref()?.trim();
        if username.is_empty() || token.is_empty() {
            return None;
        }
        Some(Credentials {
            username: username.to_string(),
            token: token.to_string(),
        })
    }

    /// Download directory, resolved against the state directory
    pub fn download_dir(&self) -> PathBuf {
        self.under_state_dir(&self.sync.download_dir)
    }

    /// Workspace root, resolved against the state directory
    pub fn workspace_root(&self) -> PathBuf {
        self.under_state_dir(&self.sync.workspace_root)
    }

    fn under_state_dir(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.sync.state_dir.join(path)
        }
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.sync.cycle_interval_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.query_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.download_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.command_timeout_secs)
    }
}

impl CmfServerConfig {
    /// Substitute every `${KEY}` with the matching parameter, exact match only.
    ///
    /// Any placeholder still present afterwards is a configuration error.
    pub fn resolved_init_command(&self) -> Result<String> {
        resolve_template(&self.init_command, &self.params)
    }
}

/// Exact-match `${KEY}` substitution; leftovers are reported, never run
pub fn resolve_template(template: &str, params: &BTreeMap<String, String>) -> Result<String> {
    if template.trim().is_empty() {
        return Err(SyncError::config(format!("cmf_server.{} cannot be empty", INIT_COMMAND_KEY)));
    }

    let mut resolved = template.to_string();
    for (key, value) in params {
        resolved = resolved.replace(&format!("${{{}}}", key), value);
    }

    let placeholder = Regex::new(r"\$\{([A-Za-z0-9_.-]+)\}")
        .map_err(|e| SyncError::config(format!("placeholder pattern: {}", e)))?;
    let unresolved: Vec<&str> = placeholder
        .captures_iter(&resolved)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    if !unresolved.is_empty() {
        return Err(SyncError::config(format!(
            "init command has unresolved placeholders: {}",
            unresolved.join(", ")
        )));
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> String {
        serde_json::json!({
            "sage_server": {
                "nodes": ["W0A1", "W0B2"],
                "plugin": "registry.sagecontinuum.org/example/cmf-logger.*",
                "portal_username": "alice",
                "portal_access_token": "s3cret"
            },
            "cmf_server": {
                "CMF_INIT_COMMAND": "cmf init minioS3 --endpoint-url http://${MINIO_IP}:${MINIO_PORT}",
                "MINIO_IP": "10.0.0.5",
                "MINIO_PORT": "9000"
            },
            "pipeline": {
                "pipeline_name": "edge-pipeline",
                "pipeline_file": "mlmd",
                "stage_name": "ingest",
                "execution_name": "sync"
            }
        })
        .to_string()
    }

    #[test]
    fn test_defaults_fill_optional_groups() {
        let config = Config::from_json(&sample_json()).unwrap();
        assert_eq!(config.sage_server.data_api_url, DEFAULT_DATA_API_URL);
        assert_eq!(config.sage_server.history_period, "-1h");
        assert_eq!(config.cycle_interval(), Duration::from_secs(120));
        assert_eq!(config.download_dir(), PathBuf::from("./cmf_downloads"));
        assert_eq!(config.sync.artifact_prefix, "s3://dvc-art");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_init_command_resolution() {
        let config = Config::from_json(&sample_json()).unwrap();
        assert_eq!(
            config.cmf_server.resolved_init_command().unwrap(),
            "cmf init minioS3 --endpoint-url http://10.0.0.5:9000"
        );
    }

    #[test]
    fn test_unresolved_placeholder_is_config_error() {
        let params: BTreeMap<String, String> =
            [("MINIO_IP".to_string(), "10.0.0.5".to_string())].into_iter().collect();
        let err = resolve_template("cmf init --ip ${MINIO_IP} --key ${ACCESS_KEY}", &params)
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("ACCESS_KEY"));
    }

    #[test]
    fn test_substitution_is_exact_match() {
        let params: BTreeMap<String, String> =
            [("IP".to_string(), "1.2.3.4".to_string())].into_iter().collect();
        // ${MINIO_IP} must not be touched by the IP key
        assert!(resolve_template("x ${MINIO_IP}", &params).is_err());
        assert_eq!(resolve_template("x $IP {IP}", &params).unwrap(), "x $IP {IP}");
    }

    #[test]
    fn test_missing_credentials_fail_validation() {
        let mut config = Config::from_json(&sample_json()).unwrap();
        config.sage_server.portal_access_token = None;
        assert!(config.credentials().is_none());
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::from_json(&sample_json()).unwrap();
        config.sage_server.portal_username = None;
        config.apply_overrides(|key| match key {
            "SAGE_PORTAL_USERNAME" => Some("bob".to_string()),
            "CMFPROXY_STATE_DIR" => Some("/var/lib/cmfproxy".to_string()),
            _ => None,
        });

        let creds = config.credentials().unwrap();
        assert_eq!(creds.username, "bob");
        assert_eq!(creds.token, "s3cret");
        assert_eq!(config.download_dir(), PathBuf::from("/var/lib/cmfproxy/cmf_downloads"));
        assert_eq!(config.workspace_root(), PathBuf::from("/var/lib/cmfproxy/."));
    }

    #[test]
    fn test_credentials_debug_hides_token() {
        let creds = Credentials {
            username: "alice".to_string(),
            token: "s3cret".to_string(),
        };
        assert!(!format!("{:?}", creds).contains("s3cret"));
    }

    #[test]
    fn test_empty_nodes_rejected() {
        let mut config = Config::from_json(&sample_json()).unwrap();
        config.sage_server.nodes.clear();
        assert!(config.validate().is_err());
    }
}

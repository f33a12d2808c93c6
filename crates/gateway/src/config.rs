use crate::authz::cedar::PolicySource;
use crate::error::{GatewayError, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// MCP request gateway: authenticate, authorize, filter, audit, instrument.
#[derive(Debug, Parser)]
#[command(name = "unrelated-mcp-guard", version)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, env = "UNRELATED_MCP_GUARD_CONFIG")]
    pub config: PathBuf,

    /// Listen address; overrides `server.bind` from the config file.
    #[arg(long, env = "UNRELATED_MCP_GUARD_BIND")]
    pub bind: Option<SocketAddr>,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text", env = "UNRELATED_MCP_GUARD_LOG_FORMAT")]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub authz: AuthzConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Name reported in audit `component` and metric `server` labels.
    #[serde(default = "default_server_name")]
    pub name: String,
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Transport label used in audit metadata and metrics.
    #[serde(default = "default_transport")]
    pub transport: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            bind: default_bind(),
            transport: default_transport(),
        }
    }
}

fn default_server_name() -> String {
    "mcp-server".to_string()
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_transport() -> String {
    "streamable-http".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
    /// Upper bound for responses the gateway must buffer (list filtering, response capture).
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
    #[serde(default)]
    pub forward_authorization: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_secs: default_timeout_secs(),
            max_request_bytes: default_max_request_bytes(),
            max_response_bytes: default_max_response_bytes(),
            forward_authorization: false,
        }
    }
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_request_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_max_response_bytes() -> usize {
    16 * 1024 * 1024
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Anonymous,
    Local,
    Oidc,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    #[serde(default)]
    pub local_user: Option<LocalUserConfig>,
    /// Realm for `WWW-Authenticate`; defaults to the issuer.
    #[serde(default)]
    pub realm: Option<String>,
    #[serde(default)]
    pub oidc: Option<OidcConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalUserConfig {
    pub username: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcConfig {
    pub issuer: String,
    #[serde(default)]
    pub audiences: Vec<String>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
    #[serde(default = "default_leeway_secs")]
    pub leeway_secs: u64,
    #[serde(default = "default_jwks_refresh_secs")]
    pub jwks_refresh_secs: u64,
    #[serde(default = "default_roles_claim")]
    pub roles_claim: String,
}

fn default_leeway_secs() -> u64 {
    30
}

fn default_jwks_refresh_secs() -> u64 {
    300
}

fn default_roles_claim() -> String {
    "roles".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthzConfig {
    /// Inline Cedar policies.
    #[serde(default)]
    pub policies: Vec<String>,
    /// Cedar policy files, read at startup and on reload. Relative paths resolve against the
    /// config file's directory.
    #[serde(default)]
    pub policy_files: Vec<PathBuf>,
    /// Static Cedar entities (JSON array, inline).
    #[serde(default)]
    pub entities_json: Option<String>,
    /// Methods that bypass authorization in addition to `ping`, `progress/update`, `initialize`.
    #[serde(default)]
    pub passthrough_methods: Vec<String>,
}

impl AuthzConfig {
    /// Gather inline and file policies into one source.
    ///
    /// # Errors
    ///
    /// Returns an error if a policy file cannot be read.
    pub fn policy_source(&self, base_dir: &Path) -> Result<PolicySource> {
        let mut policies = self.policies.clone();
        for file in &self.policy_files {
            let path = if file.is_absolute() {
                file.clone()
            } else {
                base_dir.join(file)
            };
            let text = std::fs::read_to_string(&path).map_err(|e| {
                GatewayError::Config(format!("read policy file {}: {e}", path.display()))
            })?;
            policies.push(text);
        }
        Ok(PolicySource {
            policies,
            entities_json: self.entities_json.clone(),
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Defaults to `server.name`.
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub include_request_data: bool,
    #[serde(default)]
    pub include_response_data: bool,
    #[serde(default = "default_max_data_size")]
    pub max_data_size: usize,
    /// When non-empty, only these event types are emitted.
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub exclude_event_types: Vec<String>,
    /// Also append events as JSON lines to this file.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_log_file_buffer")]
    pub log_file_buffer: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            component: None,
            include_request_data: false,
            include_response_data: false,
            max_data_size: default_max_data_size(),
            event_types: Vec::new(),
            exclude_event_types: Vec::new(),
            log_file: None,
            log_file_buffer: default_log_file_buffer(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_data_size() -> usize {
    4096
}

fn default_log_file_buffer() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    /// Environment variables copied onto spans as `environment.<NAME>`.
    #[serde(default)]
    pub environment_variables: Vec<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            environment_variables: Vec::new(),
        }
    }
}

impl Config {
    /// Parse and validate a YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Yaml`] for syntax errors and [`GatewayError::Config`] for invalid
    /// values.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a config file.
    ///
    /// # Errors
    ///
    /// See [`Config::from_yaml`]; IO errors are returned as [`GatewayError::Io`].
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.upstream.url)
            .map_err(|e| GatewayError::Config(format!("upstream.url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(GatewayError::Config(format!(
                "upstream.url must be http(s), got {}",
                url.scheme()
            )));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(GatewayError::Config(
                "upstream.timeoutSecs must be positive".to_string(),
            ));
        }
        match self.auth.mode {
            AuthMode::Oidc => match &self.auth.oidc {
                Some(oidc) if !oidc.issuer.trim().is_empty() => {}
                _ => {
                    return Err(GatewayError::Config(
                        "auth.mode=oidc requires auth.oidc.issuer".to_string(),
                    ));
                }
            },
            AuthMode::Local if self.auth.local_user.is_none() => {
                return Err(GatewayError::Config(
                    "auth.mode=local requires auth.localUser".to_string(),
                ));
            }
            _ => {}
        }
        Ok(())
    }
}

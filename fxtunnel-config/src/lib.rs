// Configuration structures for the fxtunnel server and client
// Loaded from a single TOML file; every field has a sensible default so a
// minimal config only names the base domain and credentials.

use fxtunnel_proto::TunnelKind;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};

/// Process exit codes
pub mod exit {
    pub const OK: i32 = 0;
    pub const CONFIG_ERROR: i32 = 2;
    pub const BIND_FAILURE: i32 = 3;
    pub const STORE_FAILURE: i32 = 4;
}

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
    /// File could not be read
    Io(String),
    /// File could not be parsed
    Parse(String),
    /// A value fails validation
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "config I/O error: {}", msg),
            ConfigError::Parse(msg) => write!(f, "config parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl Error for ConfigError {}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Tunnel server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Tunnel client settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate a configuration file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Validate the server sections; called before `serve` starts
    pub fn validate_server(&self) -> Result<(), ConfigError> {
        let s = &self.server;
        if s.base_domain.is_empty() {
            return Err(ConfigError::Invalid("server.base_domain must be set".to_string()));
        }
        if s.base_domain.contains('/') || s.base_domain.contains(':') {
            return Err(ConfigError::Invalid(format!(
                "server.base_domain '{}' is not a bare domain",
                s.base_domain
            )));
        }
        s.tcp_range.validate("server.tcp_range")?;
        s.udp_range.validate("server.udp_range")?;
        if s.api.jwt_secret.len() < 16 {
            return Err(ConfigError::Invalid(
                "server.api.jwt_secret must be at least 16 bytes".to_string(),
            ));
        }
        if s.inspect.ring_capacity == 0 {
            return Err(ConfigError::Invalid(
                "server.inspect.ring_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Validate the client sections; called before the client starts
    pub fn validate_client(&self) -> Result<(), ConfigError> {
        let c = &self.client;
        if c.server_host.is_empty() {
            return Err(ConfigError::Invalid("client.server_host must be set".to_string()));
        }
        if c.token.is_empty() {
            return Err(ConfigError::Invalid("client.token must be set".to_string()));
        }
        if c.tunnels.is_empty() {
            return Err(ConfigError::Invalid("client has no [[client.tunnels]] entries".to_string()));
        }
        for spec in &c.tunnels {
            if spec.local_port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "tunnel '{}' needs a local_port",
                    spec.display_name()
                )));
            }
        }
        Ok(())
    }
}

/// An inclusive public port range
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }

    pub fn len(&self) -> usize {
        (self.max as usize).saturating_sub(self.min as usize) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.max < self.min
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if self.max < self.min {
            return Err(ConfigError::Invalid(format!(
                "{}: max {} is below min {}",
                field, self.max, self.min
            )));
        }
        if self.min < 1024 {
            return Err(ConfigError::Invalid(format!(
                "{}: refusing to allocate privileged ports below 1024",
                field
            )));
        }
        Ok(())
    }
}

/// Tunnel server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base domain for subdomain endpoints (e.g. "example.test")
    #[serde(default)]
    pub base_domain: String,

    /// Public IP of this server, used to verify custom-domain A records
    pub public_ip: Option<String>,

    /// Bind address shared by all listeners
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Control channel port (client TLS connections)
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Public HTTPS edge port
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Plain HTTP port for ACME challenges and HTTPS redirects
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Public TCP endpoint range
    #[serde(default = "default_tcp_range")]
    pub tcp_range: PortRange,

    /// Public UDP endpoint range
    #[serde(default = "default_udp_range")]
    pub udp_range: PortRange,

    /// TLS material and ACME settings
    #[serde(default)]
    pub tls: TlsConfig,

    /// REST API settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Timeouts and grace periods
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Mux tuning
    #[serde(default)]
    pub mux: MuxTuningConfig,

    /// HTTP inspector settings
    #[serde(default)]
    pub inspect: InspectConfig,

    /// Path of the store file
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Key public requests by X-Real-IP instead of the socket peer
    /// address. Only enable behind a trusted front proxy.
    #[serde(default)]
    pub trust_proxy_header: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            base_domain: String::new(),
            public_ip: None,
            bind_address: default_bind_address(),
            control_port: default_control_port(),
            https_port: default_https_port(),
            http_port: default_http_port(),
            tcp_range: default_tcp_range(),
            udp_range: default_udp_range(),
            tls: TlsConfig::default(),
            api: ApiConfig::default(),
            timeouts: TimeoutConfig::default(),
            mux: MuxTuningConfig::default(),
            inspect: InspectConfig::default(),
            store_path: default_store_path(),
            trust_proxy_header: false,
        }
    }
}

/// TLS material and ACME issuance settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    /// Wildcard certificate for *.base_domain
    pub wildcard_cert_file: Option<PathBuf>,
    pub wildcard_key_file: Option<PathBuf>,

    /// Apex certificate for the base domain itself; falls back to the
    /// wildcard files when unset
    pub apex_cert_file: Option<PathBuf>,
    pub apex_key_file: Option<PathBuf>,

    /// ACME issuance for verified custom domains
    #[serde(default)]
    pub acme: AcmeConfig,
}

/// ACME client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    #[serde(default)]
    pub enabled: bool,

    /// ACME directory URL
    #[serde(default = "default_acme_directory")]
    pub directory_url: String,

    /// Contact email for the ACME account
    pub contact_email: Option<String>,

    /// On-disk certificate cache directory
    #[serde(default = "default_acme_cache_dir")]
    pub cache_dir: PathBuf,

    /// Budget for on-demand issuance during a TLS handshake
    #[serde(default = "default_acme_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Renew certificates this many days before expiry
    #[serde(default = "default_acme_renew_days")]
    pub renew_before_days: i64,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        AcmeConfig {
            enabled: false,
            directory_url: default_acme_directory(),
            contact_email: None,
            cache_dir: default_acme_cache_dir(),
            handshake_timeout_secs: default_acme_handshake_timeout(),
            renew_before_days: default_acme_renew_days(),
        }
    }
}

/// REST API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Admin API port
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// HMAC secret for access-token JWTs
    #[serde(default)]
    pub jwt_secret: String,

    /// Access token lifetime in seconds
    #[serde(default = "default_access_token_ttl")]
    pub access_token_ttl_secs: u64,

    /// Allowed CORS origins; empty disables cross-origin access
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Per-IP rate limiting
    #[serde(default)]
    pub rate_limiting: RateLimitConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            port: default_api_port(),
            jwt_secret: String::new(),
            access_token_ttl_secs: default_access_token_ttl(),
            cors_origins: Vec::new(),
            rate_limiting: RateLimitConfig::default(),
        }
    }
}

/// Two-tier per-IP rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Requests per minute per IP across the whole API
    #[serde(default = "default_global_per_minute")]
    pub global_per_minute: u32,

    /// Requests per minute per IP against auth endpoints
    #[serde(default = "default_auth_per_minute")]
    pub auth_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            enabled: true,
            global_per_minute: default_global_per_minute(),
            auth_per_minute: default_auth_per_minute(),
        }
    }
}

/// Timeouts and grace periods
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Public-side HTTP read timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub http_read_secs: u64,

    /// Public-side HTTP write timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub http_write_secs: u64,

    /// UDP session idle timeout in seconds
    #[serde(default = "default_udp_idle")]
    pub udp_idle_secs: u64,

    /// Drain budget during graceful shutdown in seconds
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            http_read_secs: default_http_timeout(),
            http_write_secs: default_http_timeout(),
            udp_idle_secs: default_udp_idle(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

/// Mux tuning knobs shared by server and client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxTuningConfig {
    /// Per-stream credit window in bytes
    #[serde(default = "default_mux_window")]
    pub window_bytes: u32,

    /// Keepalive ping interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    /// Maximum concurrent streams per session
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,
}

impl Default for MuxTuningConfig {
    fn default() -> Self {
        MuxTuningConfig {
            window_bytes: default_mux_window(),
            keepalive_secs: default_keepalive(),
            max_streams: default_max_streams(),
        }
    }
}

/// HTTP inspector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectConfig {
    /// Captured exchanges kept in memory per tunnel
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    /// Captured request body cap in bytes
    #[serde(default = "default_body_cap")]
    pub max_request_body: usize,

    /// Captured response body cap in bytes
    #[serde(default = "default_body_cap")]
    pub max_response_body: usize,
}

impl Default for InspectConfig {
    fn default() -> Self {
        InspectConfig {
            ring_capacity: default_ring_capacity(),
            max_request_body: default_body_cap(),
            max_response_body: default_body_cap(),
        }
    }
}

/// Tunnel client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server hostname (also used for SNI and cert validation)
    #[serde(default)]
    pub server_host: String,

    /// Server control channel port
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// API token (sk_...)
    #[serde(default)]
    pub token: String,

    /// Tunnels to open after authentication
    #[serde(default)]
    pub tunnels: Vec<TunnelSpec>,

    /// TLS settings for the control connection
    #[serde(default)]
    pub tls: ClientTlsConfig,

    /// Auto-reconnection settings
    #[serde(default)]
    pub reconnection: ReconnectionConfig,

    /// Mux tuning
    #[serde(default)]
    pub mux: MuxTuningConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_host: String::new(),
            control_port: default_control_port(),
            token: String::new(),
            tunnels: Vec::new(),
            tls: ClientTlsConfig::default(),
            reconnection: ReconnectionConfig::default(),
            mux: MuxTuningConfig::default(),
        }
    }
}

/// One tunnel the client keeps open
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub kind: TunnelKind,

    /// Requested subdomain (HTTP tunnels); absent for a random label
    pub subdomain: Option<String>,

    /// Preferred public port (TCP/UDP tunnels); absent or 0 for auto
    pub port: Option<u16>,

    /// Local service host
    #[serde(default = "default_local_host")]
    pub local_host: String,

    /// Local service port
    pub local_port: u16,

    /// Optional display name
    pub name: Option<String>,
}

impl TunnelSpec {
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(n) => n.clone(),
            None => format!("{}:{}", self.kind, self.local_port),
        }
    }
}

/// Client TLS settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientTlsConfig {
    /// Verify the server certificate
    #[serde(default = "default_true")]
    pub verify_server: bool,

    /// Additional trusted CA bundle (PEM)
    pub ca_file: Option<PathBuf>,

    /// SNI hostname override
    pub sni_hostname: Option<String>,
}

impl Default for ClientTlsConfig {
    fn default() -> Self {
        ClientTlsConfig { verify_server: true, ca_file: None, sni_hostname: None }
    }
}

/// Auto-reconnection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Initial retry delay in seconds
    #[serde(default = "default_initial_retry_delay")]
    pub initial_delay: u64,

    /// Maximum retry delay in seconds
    #[serde(default = "default_max_retry_delay")]
    pub max_delay: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Maximum attempts (0 = unlimited)
    #[serde(default)]
    pub max_attempts: u32,

    /// Jitter factor applied to each delay
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        ReconnectionConfig {
            enabled: true,
            initial_delay: default_initial_retry_delay(),
            max_delay: default_max_retry_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_attempts: 0,
            jitter_factor: default_jitter_factor(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "fxtunnel_server=debug")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// "console", "file", or "both"
    #[serde(default = "default_log_output")]
    pub output_mode: String,

    /// Directory for rolling log files
    #[serde(default = "default_logs_directory")]
    pub logs_directory: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
            output_mode: default_log_output(),
            logs_directory: default_logs_directory(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_control_port() -> u16 {
    4443
}

fn default_https_port() -> u16 {
    443
}

fn default_http_port() -> u16 {
    80
}

fn default_api_port() -> u16 {
    8080
}

fn default_tcp_range() -> PortRange {
    PortRange { min: 10_000, max: 20_000 }
}

fn default_udp_range() -> PortRange {
    PortRange { min: 20_001, max: 30_000 }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("fxtunnel_data/store.json")
}

fn default_acme_directory() -> String {
    "https://acme-v02.api.letsencrypt.org/directory".to_string()
}

fn default_acme_cache_dir() -> PathBuf {
    PathBuf::from("fxtunnel_data/certs")
}

fn default_acme_handshake_timeout() -> u64 {
    8
}

fn default_acme_renew_days() -> i64 {
    30
}

fn default_access_token_ttl() -> u64 {
    900 // 15 minutes
}

fn default_global_per_minute() -> u32 {
    600
}

fn default_auth_per_minute() -> u32 {
    30
}

fn default_http_timeout() -> u64 {
    15
}

fn default_udp_idle() -> u64 {
    60
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_mux_window() -> u32 {
    256 * 1024
}

fn default_keepalive() -> u64 {
    30
}

fn default_max_streams() -> usize {
    1024
}

fn default_ring_capacity() -> usize {
    1000
}

fn default_body_cap() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

fn default_initial_retry_delay() -> u64 {
    1
}

fn default_max_retry_delay() -> u64 {
    300
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_output() -> String {
    "console".to_string()
}

fn default_logs_directory() -> PathBuf {
    PathBuf::from("logs")
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_minimal_server_config_parses_with_defaults() {
        let toml_text = r#"
            [server]
            base_domain = "example.test"
            [server.api]
            jwt_secret = "0123456789abcdef0123456789abcdef"
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(config.server.base_domain, "example.test");
        assert_eq!(config.server.control_port, 4443);
        assert_eq!(config.server.https_port, 443);
        assert_eq!(config.server.tcp_range.min, 10_000);
        assert_eq!(config.server.udp_range.max, 30_000);
        assert_eq!(config.server.inspect.ring_capacity, 1000);
        assert_eq!(config.server.timeouts.shutdown_grace_secs, 5);
        assert!(!config.server.trust_proxy_header);
        config.validate_server().unwrap();
    }

    #[test]
    fn test_client_config_parses() {
        let toml_text = r#"
            [client]
            server_host = "tunnel.example.test"
            token = "sk_fxtunnel_a1b2"

            [[client.tunnels]]
            kind = "http"
            subdomain = "demo"
            local_port = 3000

            [[client.tunnels]]
            kind = "tcp"
            local_port = 5432
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        config.validate_client().unwrap();
        assert_eq!(config.client.tunnels.len(), 2);
        assert_eq!(config.client.tunnels[0].kind, TunnelKind::Http);
        assert_eq!(config.client.tunnels[0].subdomain.as_deref(), Some("demo"));
        assert_eq!(config.client.tunnels[1].local_host, "127.0.0.1");
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let toml_text = r#"
            [server]
            base_domain = "example.test"
            tcp_range = { min = 20000, max = 10000 }
            [server.api]
            jwt_secret = "0123456789abcdef0123456789abcdef"
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        assert!(config.validate_server().is_err());
    }

    #[test]
    fn test_short_jwt_secret_rejected() {
        let toml_text = r#"
            [server]
            base_domain = "example.test"
            [server.api]
            jwt_secret = "short"
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        assert!(config.validate_server().is_err());
    }

    #[test]
    fn test_missing_client_tunnels_rejected() {
        let toml_text = r#"
            [client]
            server_host = "tunnel.example.test"
            token = "sk_x"
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        assert!(config.validate_client().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nbase_domain = \"example.test\"\n[server.api]\njwt_secret = \"0123456789abcdef0123456789abcdef\""
        )
        .unwrap();
        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.server.base_domain, "example.test");
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = Config::load_from_file("/nonexistent/fxtunnel.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}

//! Configuration management
//!
//! TOML configuration for both binaries. Only the sections relevant to the
//! running side need to be present: `[server]` for aether-server,
//! `[client]` for aether-client.

use crate::protocol::ProxyType;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("failed to read config: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that the type system cannot express.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if let Some(server) = &self.server {
            server.validate()?;
        }
        if let Some(client) = &self.client {
            client.validate()?;
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the control port
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Control port
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// Shared authentication token (required)
    pub auth_token: String,
    /// TLS settings for the control/work transport
    #[serde(default)]
    pub tls: TlsServerConfig,
    /// Security and anti-abuse settings
    #[serde(default)]
    pub security: SecurityConfig,
    /// Remote-listener policy
    #[serde(default)]
    pub proxy: ProxyPolicyConfig,
}

impl ServerConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.auth_token.is_empty() {
            return Err(crate::Error::Config("server.auth_token is required".into()));
        }
        if self.tls.enabled && (self.tls.cert_file.is_none() || self.tls.key_file.is_none()) {
            return Err(crate::Error::Config(
                "server.tls.cert_file and key_file are required when TLS is enabled".into(),
            ));
        }
        if self.security.heartbeat_timeout < 3 {
            return Err(crate::Error::Config(
                "security.heartbeat_timeout must be at least 3 seconds".into(),
            ));
        }
        self.proxy.allow_set()?;
        self.proxy.deny_set()?;
        Ok(())
    }

    /// The control socket address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }
}

/// Server-side TLS settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsServerConfig {
    #[serde(default)]
    pub enabled: bool,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    /// CA bundle used to verify client certificates when `client_auth` is on
    pub ca_file: Option<String>,
    #[serde(default)]
    pub client_auth: bool,
    /// Minimum protocol version: "TLS1.2" or "TLS1.3"
    #[serde(default = "default_tls_min_version")]
    pub min_version: String,
}

impl Default for TlsServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_file: None,
            key_file: None,
            ca_file: None,
            client_auth: false,
            min_version: default_tls_min_version(),
        }
    }
}

/// Security and anti-abuse settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Seconds without a heartbeat before a session is torn down
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: u64,
    /// Seconds a new connection gets to present its first message
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Maximum concurrent control sessions per client id (0 = unlimited)
    #[serde(default)]
    pub max_connections_per_client: u32,
    #[serde(default)]
    pub enable_ip_whitelist: bool,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Base64 Ed25519 public keys allowed to log in; empty disables
    /// strict mode and any key presented in Login is accepted
    #[serde(default)]
    pub registered_public_keys: Vec<String>,
    /// Allowed clock skew for signed timestamps, in seconds
    #[serde(default = "default_signature_grace")]
    pub signature_grace: u64,
    /// Replay window for work-connection timestamps, in seconds
    #[serde(default = "default_anti_replay_window")]
    pub anti_replay_window: u64,
    /// Duration of the short IP block applied after auth failures, seconds
    #[serde(default = "default_block_duration")]
    pub block_duration: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: default_heartbeat_timeout(),
            connection_timeout: default_connection_timeout(),
            max_connections_per_client: 0,
            enable_ip_whitelist: false,
            allowed_ips: Vec::new(),
            registered_public_keys: Vec::new(),
            signature_grace: default_signature_grace(),
            anti_replay_window: default_anti_replay_window(),
            block_duration: default_block_duration(),
        }
    }
}

/// Remote-listener policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyPolicyConfig {
    /// Bind address for remote listeners
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Ports clients may request, as union of ranges ("2000-3000,8080").
    /// Empty allows any port.
    #[serde(default)]
    pub allow_ports: String,
    /// Ports clients may never take; deny wins over allow.
    #[serde(default)]
    pub deny_ports: String,
}

impl Default for ProxyPolicyConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            allow_ports: String::new(),
            deny_ports: String::new(),
        }
    }
}

impl ProxyPolicyConfig {
    /// Parsed allow set.
    pub fn allow_set(&self) -> Result<PortRangeSet, crate::Error> {
        self.allow_ports
            .parse()
            .map_err(|e| crate::Error::Config(format!("proxy.allow_ports: {}", e)))
    }

    /// Parsed deny set.
    pub fn deny_set(&self) -> Result<PortRangeSet, crate::Error> {
        self.deny_ports
            .parse()
            .map_err(|e| crate::Error::Config(format!("proxy.deny_ports: {}", e)))
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server host or IP (required)
    pub server_addr: String,
    /// Server control port (required)
    pub server_port: u16,
    /// Shared authentication token (required)
    pub auth_token: String,
    #[serde(default)]
    pub user: String,
    /// Stable identifier across reconnects; defaults to the hostname
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "default_pool_count")]
    pub pool_count: u32,
    /// Transport protocol: "tcp" or "tls"
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Seconds between heartbeats
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Ed25519 key pair as base64 PKCS#8; generated fresh when absent
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub tls: TlsClientConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
}

impl ClientConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.server_addr.is_empty() {
            return Err(crate::Error::Config("client.server_addr is required".into()));
        }
        if self.auth_token.is_empty() {
            return Err(crate::Error::Config("client.auth_token is required".into()));
        }
        match self.protocol.as_str() {
            "tcp" | "tls" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "client.protocol must be tcp or tls, got {}",
                    other
                )))
            }
        }

        let mut names = std::collections::HashSet::new();
        for proxy in &self.proxies {
            if proxy.name.is_empty() {
                return Err(crate::Error::Config("proxy name must not be empty".into()));
            }
            if !names.insert(proxy.name.as_str()) {
                return Err(crate::Error::Config(format!(
                    "duplicate proxy name: {}",
                    proxy.name
                )));
            }
            if proxy.proxy_type.is_stream() && proxy.local_port == 0 {
                return Err(crate::Error::Config(format!(
                    "proxy {} needs a local_port",
                    proxy.name
                )));
            }
            if !proxy.bandwidth_limit.is_empty() {
                parse_bandwidth(&proxy.bandwidth_limit)
                    .map_err(|e| crate::Error::Config(format!("proxy {}: {}", proxy.name, e)))?;
            }
        }
        Ok(())
    }

    /// The server control socket address.
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_addr, self.server_port)
    }
}

/// Client-side TLS settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsClientConfig {
    /// CA bundle to trust; webpki roots are used when absent
    pub ca_file: Option<String>,
    /// Client certificate for mutual TLS
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    /// SNI override; defaults to the server address host
    pub server_name: Option<String>,
    /// Skip server certificate verification (testing only)
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// Reconnect behaviour after a control-stream failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// "fixed", "linear", or "exponential"
    #[serde(default = "default_reconnect_strategy")]
    pub strategy: String,
    /// -1 retries forever
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    /// Uniform jitter factor applied to every delay
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Base delay in seconds
    #[serde(default = "default_base_delay")]
    pub base_delay: u64,
    /// Delay ceiling in seconds
    #[serde(default = "default_max_delay")]
    pub max_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: default_reconnect_strategy(),
            max_attempts: default_max_attempts(),
            jitter: default_jitter(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

/// One proxy registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub proxy_type: ProxyType,
    #[serde(default = "default_local_ip")]
    pub local_ip: String,
    #[serde(default)]
    pub local_port: u16,
    /// 0 requests an OS-assigned port within the server's allow set
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
    /// Human-readable rate such as "10MB"; empty means uncapped
    #[serde(default)]
    pub bandwidth_limit: String,
}

impl ProxyConfig {
    /// The upstream address this proxy forwards to.
    pub fn local_address(&self) -> String {
        format!("{}:{}", self.local_ip, self.local_port)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Union of inclusive port ranges, parsed from strings like
/// `"2000-3000,8080,9000-9100"`. The empty string parses to the empty set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRangeSet {
    ranges: Vec<(u16, u16)>,
}

impl PortRangeSet {
    /// Whether the set contains no ranges at all.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Whether `port` falls in any range.
    pub fn contains(&self, port: u16) -> bool {
        self.ranges.iter().any(|&(lo, hi)| lo <= port && port <= hi)
    }

    /// Every port in the set, in range order.
    pub fn iter_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ranges.iter().flat_map(|&(lo, hi)| lo..=hi)
    }
}

impl FromStr for PortRangeSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ranges = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (lo, hi) = match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u16 = lo.trim().parse().map_err(|_| bad_range(part))?;
                    let hi: u16 = hi.trim().parse().map_err(|_| bad_range(part))?;
                    (lo, hi)
                }
                None => {
                    let port: u16 = part.parse().map_err(|_| bad_range(part))?;
                    (port, port)
                }
            };
            if lo > hi {
                return Err(bad_range(part));
            }
            ranges.push((lo, hi));
        }
        Ok(Self { ranges })
    }
}

fn bad_range(part: &str) -> String {
    format!("invalid port range: {}", part)
}

/// Parse a human-readable byte rate ("512KB", "10MB", "1GB", or plain
/// bytes) into bytes per second.
pub fn parse_bandwidth(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, multiplier) = if let Some(d) = s.strip_suffix("GB") {
        (d, 1024 * 1024 * 1024)
    } else if let Some(d) = s.strip_suffix("MB") {
        (d, 1024 * 1024)
    } else if let Some(d) = s.strip_suffix("KB") {
        (d, 1024)
    } else {
        (s, 1)
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid bandwidth: {}", s))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("bandwidth overflows: {}", s))
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_bind_port() -> u16 {
    7000
}
fn default_tls_min_version() -> String {
    "TLS1.2".to_string()
}
fn default_heartbeat_timeout() -> u64 {
    90
}
fn default_connection_timeout() -> u64 {
    10
}
fn default_signature_grace() -> u64 {
    30
}
fn default_anti_replay_window() -> u64 {
    60
}
fn default_block_duration() -> u64 {
    300
}
fn default_pool_count() -> u32 {
    1
}
fn default_protocol() -> String {
    "tcp".to_string()
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_reconnect_strategy() -> String {
    "exponential".to_string()
}
fn default_max_attempts() -> i64 {
    -1
}
fn default_jitter() -> f64 {
    0.2
}
fn default_base_delay() -> u64 {
    1
}
fn default_max_delay() -> u64 {
    60
}
fn default_local_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_range_set_parse() {
        let set: PortRangeSet = "2000-3000,8080,9000-9100".parse().unwrap();
        assert!(set.contains(2000));
        assert!(set.contains(2500));
        assert!(set.contains(3000));
        assert!(set.contains(8080));
        assert!(set.contains(9100));
        assert!(!set.contains(1999));
        assert!(!set.contains(8081));
    }

    #[test]
    fn test_port_range_set_empty() {
        let set: PortRangeSet = "".parse().unwrap();
        assert!(set.is_empty());
        assert!(!set.contains(80));
    }

    #[test]
    fn test_port_range_set_rejects_garbage() {
        assert!("80-".parse::<PortRangeSet>().is_err());
        assert!("3000-2000".parse::<PortRangeSet>().is_err());
        assert!("http".parse::<PortRangeSet>().is_err());
    }

    #[test]
    fn test_parse_bandwidth() {
        assert_eq!(parse_bandwidth("512KB").unwrap(), 512 * 1024);
        assert_eq!(parse_bandwidth("10MB").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_bandwidth("1GB").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_bandwidth("4096").unwrap(), 4096);
        assert!(parse_bandwidth("fast").is_err());
    }

    #[test]
    fn test_server_config_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            auth_token = "t"
            "#,
        )
        .unwrap();

        let server = config.server.unwrap();
        assert_eq!(server.bind_address(), "0.0.0.0:7000");
        assert_eq!(server.security.heartbeat_timeout, 90);
        assert_eq!(server.security.connection_timeout, 10);
        assert_eq!(server.security.signature_grace, 30);
        assert!(!server.tls.enabled);
    }

    #[test]
    fn test_client_config_full() {
        let config: Config = toml::from_str(
            r#"
            [client]
            server_addr = "tunnel.example.com"
            server_port = 7000
            auth_token = "t"

            [client.reconnect]
            strategy = "linear"
            max_attempts = 5

            [[client.proxies]]
            name = "ssh"
            type = "tcp"
            local_port = 22
            remote_port = 2222
            bandwidth_limit = "10MB"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        let client = config.client.unwrap();
        assert_eq!(client.server_address(), "tunnel.example.com:7000");
        assert_eq!(client.heartbeat_interval, 30);
        assert_eq!(client.reconnect.strategy, "linear");
        assert_eq!(client.reconnect.max_attempts, 5);
        assert_eq!(client.proxies[0].local_address(), "127.0.0.1:22");
    }

    #[test]
    fn test_registered_public_keys_parse() {
        let config: Config = toml::from_str(
            r#"
            [server]
            auth_token = "t"

            [server.security]
            registered_public_keys = ["a2V5LW9uZQ==", "a2V5LXR3bw=="]
            "#,
        )
        .unwrap();

        let security = config.server.unwrap().security;
        assert_eq!(security.registered_public_keys.len(), 2);

        // Absent field means strict mode is off
        let config: Config = toml::from_str(
            r#"
            [server]
            auth_token = "t"
            "#,
        )
        .unwrap();
        assert!(config
            .server
            .unwrap()
            .security
            .registered_public_keys
            .is_empty());
    }

    #[test]
    fn test_duplicate_proxy_names_rejected() {
        let config: Config = toml::from_str(
            r#"
            [client]
            server_addr = "s"
            server_port = 7000
            auth_token = "t"

            [[client.proxies]]
            name = "dup"
            type = "tcp"
            local_port = 22

            [[client.proxies]]
            name = "dup"
            type = "tcp"
            local_port = 23
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_token_rejected() {
        let parsed: Result<Config, _> = toml::from_str(
            r#"
            [server]
            bind_port = 7000
            "#,
        );
        assert!(parsed.is_err());
    }
}

//! Control-channel message types
//!
//! Each variant carries a JSON payload struct. Binary fields (signatures,
//! keys, nonces, UDP content) travel base64-encoded inside the JSON body.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Type byte for Login (client → server)
pub const TYPE_LOGIN: u8 = b'L';
/// Type byte for LoginResp (server → client)
pub const TYPE_LOGIN_RESP: u8 = b'R';
/// Type byte for NewProxy (client → server)
pub const TYPE_NEW_PROXY: u8 = b'P';
/// Type byte for NewProxyResp (server → client)
pub const TYPE_NEW_PROXY_RESP: u8 = b'Q';
/// Type byte for CloseProxy (client → server)
pub const TYPE_CLOSE_PROXY: u8 = b'C';
/// Type byte for ReqWorkConn (server → client)
pub const TYPE_REQ_WORK_CONN: u8 = b'O';
/// Type byte for NewWorkConn (client → server, on a fresh connection)
pub const TYPE_NEW_WORK_CONN: u8 = b'W';
/// Type byte for StartWorkConn (server → client, on the work connection)
pub const TYPE_START_WORK_CONN: u8 = b'S';
/// Type byte for Ping (client → server)
pub const TYPE_PING: u8 = b'H';
/// Type byte for Pong (server → client)
pub const TYPE_PONG: u8 = b'G';
/// Type byte for UDPPacket (both directions)
pub const TYPE_UDP_PACKET: u8 = b'U';

/// Base64 (de)serialization for binary JSON fields
mod b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

/// Protocol type of a proxy's remote listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Tcp,
    Http,
    Https,
    Udp,
}

impl ProxyType {
    /// Whether this proxy type accepts stream connections.
    pub fn is_stream(&self) -> bool {
        !matches!(self, ProxyType::Udp)
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyType::Tcp => "tcp",
            ProxyType::Http => "http",
            ProxyType::Https => "https",
            ProxyType::Udp => "udp",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ProxyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(ProxyType::Tcp),
            "http" => Ok(ProxyType::Http),
            "https" => Ok(ProxyType::Https),
            "udp" => Ok(ProxyType::Udp),
            other => Err(format!("unsupported proxy type: {}", other)),
        }
    }
}

/// Login request, the first message on every control connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Login {
    pub version: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub user: String,
    pub token: String,
    pub timestamp: i64,
    /// Empty on first login; carried over on reconnect to resume the session id.
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub pool_count: u32,
    #[serde(default)]
    pub metas: HashMap<String, String>,
    /// Ed25519 signature over the decimal timestamp.
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
    /// Ed25519 public key of this client process.
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
}

/// Login response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoginResp {
    pub version: String,
    pub run_id: String,
    pub server_time: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Random nonce, reserved for channel binding.
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
}

/// Request to register a remote listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProxy {
    pub proxy_name: String,
    pub proxy_type: ProxyType,
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
    /// Human-readable rate such as "10MB"; empty means uncapped.
    #[serde(default)]
    pub bandwidth_limit: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group_key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subdomain: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http_user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http_pwd: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host_header_rewrite: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sk: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_users: Vec<String>,
    #[serde(default)]
    pub metas: HashMap<String, String>,
}

impl NewProxy {
    /// Minimal request for a stream proxy; the rest of the fields default.
    pub fn stream(name: &str, proxy_type: ProxyType, remote_port: u16) -> Self {
        Self {
            proxy_name: name.to_string(),
            proxy_type,
            remote_port,
            use_encryption: false,
            use_compression: false,
            bandwidth_limit: String::new(),
            group: String::new(),
            group_key: String::new(),
            custom_domains: Vec::new(),
            subdomain: String::new(),
            locations: Vec::new(),
            http_user: String::new(),
            http_pwd: String::new(),
            host_header_rewrite: String::new(),
            sk: String::new(),
            allow_users: Vec::new(),
            metas: HashMap::new(),
        }
    }
}

/// Response to NewProxy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewProxyResp {
    pub proxy_name: String,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Request to tear down a proxy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloseProxy {
    pub proxy_name: String,
}

/// Server asks the client to dial a fresh work connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReqWorkConn {
    pub proxy_name: String,
    pub request_id: u64,
}

/// First message on a client-dialed work connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewWorkConn {
    pub run_id: String,
    pub request_id: u64,
    pub timestamp: i64,
    /// Ed25519 signature over `run_id:request_id:timestamp`.
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

impl NewWorkConn {
    /// Canonical byte string the signature covers.
    pub fn signed_bytes(run_id: &str, request_id: u64, timestamp: i64) -> Vec<u8> {
        format!("{}:{}:{}", run_id, request_id, timestamp).into_bytes()
    }
}

/// Server response on a matched (or rejected) work connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartWorkConn {
    pub proxy_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub src_addr: String,
    #[serde(default)]
    pub src_port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dst_addr: String,
    #[serde(default)]
    pub dst_port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Heartbeat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub timestamp: i64,
    /// HMAC-SHA256 over the decimal timestamp.
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

/// Heartbeat response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub server_time: i64,
    /// HMAC-SHA256 over the decimal server time.
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// One relayed UDP datagram
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UdpPacket {
    /// Datagram payload, base64.
    #[serde(with = "b64")]
    pub content: Vec<u8>,
    /// The proxy's bound address; routes the packet to its listener.
    #[serde(default)]
    pub local_addr: String,
    /// The end user's address.
    #[serde(default)]
    pub remote_addr: String,
}

/// Tagged sum of every control-channel message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Login(Login),
    LoginResp(LoginResp),
    NewProxy(NewProxy),
    NewProxyResp(NewProxyResp),
    CloseProxy(CloseProxy),
    ReqWorkConn(ReqWorkConn),
    NewWorkConn(NewWorkConn),
    StartWorkConn(StartWorkConn),
    Ping(Ping),
    Pong(Pong),
    UdpPacket(UdpPacket),
}

impl Message {
    /// The wire type byte for this variant.
    pub fn type_byte(&self) -> u8 {
        match self {
            Message::Login(_) => TYPE_LOGIN,
            Message::LoginResp(_) => TYPE_LOGIN_RESP,
            Message::NewProxy(_) => TYPE_NEW_PROXY,
            Message::NewProxyResp(_) => TYPE_NEW_PROXY_RESP,
            Message::CloseProxy(_) => TYPE_CLOSE_PROXY,
            Message::ReqWorkConn(_) => TYPE_REQ_WORK_CONN,
            Message::NewWorkConn(_) => TYPE_NEW_WORK_CONN,
            Message::StartWorkConn(_) => TYPE_START_WORK_CONN,
            Message::Ping(_) => TYPE_PING,
            Message::Pong(_) => TYPE_PONG,
            Message::UdpPacket(_) => TYPE_UDP_PACKET,
        }
    }

    /// Human-readable variant name for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Login(_) => "Login",
            Message::LoginResp(_) => "LoginResp",
            Message::NewProxy(_) => "NewProxy",
            Message::NewProxyResp(_) => "NewProxyResp",
            Message::CloseProxy(_) => "CloseProxy",
            Message::ReqWorkConn(_) => "ReqWorkConn",
            Message::NewWorkConn(_) => "NewWorkConn",
            Message::StartWorkConn(_) => "StartWorkConn",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::UdpPacket(_) => "UdpPacket",
        }
    }
}

//! Control messages of the sprites-tcp-proxy-v1 protocol and the endpoint
//! descriptor handed to host-side callers.
//!
//! ```text
//! client → server  text   {"host":"localhost","port":5432}
//! server → client  text   {"status":"connected","target":"localhost:5432"}
//! both directions  binary raw TCP bytes
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, ProxyResult};

/// Protocol identifier advertised in every [`TcpProxyInfo`].
pub const PROTOCOL_ID: &str = "sprites-tcp-proxy-v1";

/// Upper bound on the init message payload.
pub const MAX_INIT_BYTES: usize = 4096;

/// Host used when the init message omits `host`.
pub const DEFAULT_INIT_HOST: &str = "localhost";

/// Hosts a tunnel may dial. Everything else is rejected.
pub const LOOPBACK_HOSTS: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

/// First client message: the TCP target to bridge to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitRequest {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

fn default_host() -> String {
    DEFAULT_INIT_HOST.to_string()
}

impl InitRequest {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse and validate an init payload.
    ///
    /// Checks, in order: size bound, JSON shape (`port` an integer, `host` an
    /// optional string), and `port` in 1..=65535.
    pub fn parse(payload: &[u8]) -> ProxyResult<Self> {
        if payload.len() > MAX_INIT_BYTES {
            return Err(ProxyError::InvalidInit(format!(
                "init message is {} bytes (max {MAX_INIT_BYTES})",
                payload.len()
            )));
        }
        let init: InitRequest = serde_json::from_slice(payload)
            .map_err(|e| ProxyError::InvalidInit(e.to_string()))?;
        if init.port == 0 {
            return Err(ProxyError::InvalidInit("port must be in 1..=65535".into()));
        }
        Ok(init)
    }

    /// Whether `host` names the local loopback interface.
    pub fn is_loopback(&self) -> bool {
        LOOPBACK_HOSTS.contains(&self.host.as_str())
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Server acknowledgement sent once the target connection is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedAck {
    pub status: String,
    pub target: String,
}

impl ConnectedAck {
    pub fn connected(init: &InitRequest) -> Self {
        Self {
            status: "connected".to_string(),
            target: init.target(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == "connected"
    }
}

/// Access level of a tunnel endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Reachable from the open internet without credentials.
    Public,
    /// Requires the headers or token carried in the endpoint descriptor.
    Private,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Public => f.write_str("public"),
            Visibility::Private => f.write_str("private"),
        }
    }
}

impl FromStr for Visibility {
    type Err = ProxyError;

    fn from_str(s: &str) -> ProxyResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            other => Err(ProxyError::Config(format!(
                "unknown visibility '{other}' (expected public or private)"
            ))),
        }
    }
}

/// Hint telling clients how to fill the init message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitHint {
    pub host_default: String,
    pub requires_host: bool,
}

impl Default for InitHint {
    fn default() -> Self {
        Self {
            host_default: DEFAULT_INIT_HOST.to_string(),
            requires_host: false,
        }
    }
}

/// Connectable endpoint descriptor returned to host-side callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpProxyInfo {
    /// `ws://` or `wss://` URL of the tunnel server.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    pub visibility: Visibility,
    pub protocol: String,
    pub init: InitHint,
}

impl TcpProxyInfo {
    pub fn new(
        url: impl Into<String>,
        headers: Option<BTreeMap<String, String>>,
        visibility: Visibility,
    ) -> Self {
        Self {
            url: url.into(),
            headers: headers.filter(|h| !h.is_empty()),
            visibility,
            protocol: PROTOCOL_ID.to_string(),
            init: InitHint::default(),
        }
    }
}

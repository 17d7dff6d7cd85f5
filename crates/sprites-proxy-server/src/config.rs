//! Server configuration: TOML file + CLI overrides.
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8765"
//! allowed_port = 5432
//! init_timeout_ms = 5000
//! max_connections = 256
//! max_frame_size = 16777216
//! cert = "~/.sprites-proxy/cert.pem"
//! key = "~/.sprites-proxy/key.pem"
//!
//! [auth]
//! token_secret = "<hex>"
//! token_audience = "<sandbox-id>:8765"
//! ```

use serde::Deserialize;
use sprites_proxy_core::{token, ProxyError, ProxyResult};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::handshake::HandshakeAuth;
use crate::policy::TargetPolicy;
use crate::session::SessionConfig;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub allowed_port: Option<u16>,
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u64,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            allowed_port: None,
            init_timeout_ms: default_init_timeout_ms(),
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
            cert: None,
            key: None,
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    /// Hex HMAC secret. Connect tokens are required only when set.
    #[serde(default)]
    pub token_secret: Option<String>,
    /// Audience tokens must be bound to; required with `token_secret`.
    #[serde(default)]
    pub token_audience: Option<String>,
}

fn default_listen() -> String {
    "0.0.0.0:8765".to_string()
}
fn default_init_timeout_ms() -> u64 {
    5000
}
fn default_max_connections() -> usize {
    256
}
fn default_max_frame_size() -> u64 {
    16 * 1024 * 1024
}

/// Values given on the command line. `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub listen: Option<String>,
    pub allowed_port: Option<u16>,
    pub init_timeout_ms: Option<u64>,
    pub max_connections: Option<usize>,
    pub cert: Option<String>,
    pub key: Option<String>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub allowed_port: Option<u16>,
    pub init_timeout: Duration,
    pub max_connections: usize,
    pub max_frame_size: u64,
    /// `(cert, key)` PEM paths. Plain WebSocket when `None`.
    pub tls: Option<(PathBuf, PathBuf)>,
    pub auth: Option<HandshakeAuth>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8765)),
            allowed_port: None,
            init_timeout: Duration::from_millis(default_init_timeout_ms()),
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
            tls: None,
            auth: None,
        }
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    ///
    /// A missing file is not an error; defaults are used.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> ProxyResult<Self> {
        let file_config = match config_path.map(expand_tilde) {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(&path)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| ProxyError::Config(format!("config parse error: {e}")))?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    /// Merge a parsed file with CLI overrides and validate the result.
    pub fn resolve(file: ConfigFile, overrides: ConfigOverrides) -> ProxyResult<Self> {
        let listen_str = overrides.listen.unwrap_or(file.server.listen);
        let listen = listen_str
            .parse::<SocketAddr>()
            .map_err(|e| ProxyError::Config(format!("invalid listen address {listen_str:?}: {e}")))?;

        let allowed_port = overrides.allowed_port.or(file.server.allowed_port);
        if allowed_port == Some(0) {
            return Err(ProxyError::Config("allowed_port must be in 1..=65535".into()));
        }

        let tls = match (
            overrides.cert.or(file.server.cert),
            overrides.key.or(file.server.key),
        ) {
            (Some(cert), Some(key)) => Some((expand_tilde_str(&cert), expand_tilde_str(&key))),
            (None, None) => None,
            _ => {
                return Err(ProxyError::Config(
                    "cert and key must be given together".into(),
                ))
            }
        };

        let auth = match (file.auth.token_secret, file.auth.token_audience) {
            (Some(secret), Some(audience)) if !audience.is_empty() => Some(HandshakeAuth {
                secret: token::decode_secret(&secret)?,
                audience,
            }),
            (Some(_), _) => {
                return Err(ProxyError::Config(
                    "auth.token_audience is required with auth.token_secret".into(),
                ))
            }
            (None, _) => None,
        };

        let max_connections = overrides
            .max_connections
            .unwrap_or(file.server.max_connections);
        if max_connections == 0 {
            return Err(ProxyError::Config("max_connections must be at least 1".into()));
        }

        Ok(Self {
            listen,
            allowed_port,
            init_timeout: Duration::from_millis(
                overrides.init_timeout_ms.unwrap_or(file.server.init_timeout_ms),
            ),
            max_connections,
            max_frame_size: file.server.max_frame_size,
            tls,
            auth,
        })
    }

    pub fn policy(&self) -> TargetPolicy {
        TargetPolicy {
            allowed_port: self.allowed_port,
            max_connections: self.max_connections,
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            init_timeout: self.init_timeout,
            max_frame_size: self.max_frame_size,
        }
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

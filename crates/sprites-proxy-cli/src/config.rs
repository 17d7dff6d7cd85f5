//! CLI configuration at `~/.sprites-proxy/config.toml`.
//!
//! `[bootstrap]` describes how the tunnel server is installed and launched;
//! `[backend]` describes how endpoints for it are minted. CLI flags always
//! override config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sprites_proxy_core::{token, Visibility};
use sprites_proxy_host::bootstrap::{DEFAULT_INSTALL_DIR, DEFAULT_INTERNAL_PORT};
use sprites_proxy_host::{BootstrapConfig, ServerAuth, StaticBackend, TunnelPayload};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bootstrap: BootstrapSection,
    #[serde(default)]
    pub backend: BackendSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapSection {
    /// Port the tunnel server listens on inside the sandbox.
    #[serde(default = "default_internal_port")]
    pub internal_port: u16,

    #[serde(default = "default_install_dir")]
    pub install_dir: String,

    /// Local server binary to upload before launching.
    #[serde(default)]
    pub payload: Option<String>,

    /// Server binary already present in the sandbox.
    #[serde(default)]
    pub installed_path: Option<String>,
}

impl Default for BootstrapSection {
    fn default() -> Self {
        Self {
            internal_port: default_internal_port(),
            install_dir: default_install_dir(),
            payload: None,
            installed_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSection {
    #[serde(default = "default_sandbox_id")]
    pub sandbox_id: String,

    /// Routable base URL of the tunnel server. Defaults to loopback.
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_visibility")]
    pub visibility: Visibility,

    /// Hex-encoded secret for minting connect tokens.
    #[serde(default)]
    pub token_secret: Option<String>,

    /// Token audience. Defaults to `<sandbox_id>:<internal_port>`.
    #[serde(default)]
    pub token_audience: Option<String>,

    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    /// Fixed bearer token for private endpoints.
    #[serde(default)]
    pub bearer_token: Option<String>,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            sandbox_id: default_sandbox_id(),
            base_url: None,
            visibility: default_visibility(),
            token_secret: None,
            token_audience: None,
            token_ttl_secs: default_token_ttl_secs(),
            bearer_token: None,
        }
    }
}

fn default_internal_port() -> u16 {
    DEFAULT_INTERNAL_PORT
}

fn default_install_dir() -> String {
    DEFAULT_INSTALL_DIR.to_string()
}

fn default_sandbox_id() -> String {
    "local".to_string()
}

fn default_visibility() -> Visibility {
    Visibility::Public
}

fn default_token_ttl_secs() -> u64 {
    3600
}

/// Flag values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub internal_port: Option<u16>,
    pub install_dir: Option<String>,
    pub payload: Option<String>,
    pub base_url: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &str) -> Result<Self> {
        let path = expand_tilde(path);
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(port) = overrides.internal_port {
            self.bootstrap.internal_port = port;
        }
        if let Some(dir) = overrides.install_dir {
            self.bootstrap.install_dir = dir;
        }
        if let Some(payload) = overrides.payload {
            self.bootstrap.payload = Some(payload);
        }
        if let Some(url) = overrides.base_url {
            self.backend.base_url = Some(url);
        }
    }

    pub fn bootstrap_config(&self) -> Result<BootstrapConfig> {
        let section = &self.bootstrap;
        let payload = match (&section.payload, &section.installed_path) {
            (Some(_), Some(_)) => {
                anyhow::bail!("bootstrap.payload and bootstrap.installed_path are exclusive")
            }
            (Some(local), None) => {
                let local = expand_tilde(local);
                TunnelPayload::from_file(&local)
                    .with_context(|| format!("failed to read payload {}", local.display()))?
            }
            (None, Some(path)) => TunnelPayload::installed(path.clone()),
            (None, None) => BootstrapConfig::default().payload,
        };

        // The launched server must verify the same audience the backend mints.
        let auth = match &self.backend.token_secret {
            Some(secret) => Some(ServerAuth {
                token_secret: secret.clone(),
                token_audience: self.backend()?.audience_for(section.internal_port),
            }),
            None => None,
        };
        Ok(BootstrapConfig {
            internal_port: section.internal_port,
            install_dir: section.install_dir.clone(),
            payload,
            auth,
            ..BootstrapConfig::default()
        })
    }

    pub fn backend(&self) -> Result<StaticBackend> {
        let section = &self.backend;
        let base_url = section
            .base_url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", self.bootstrap.internal_port));

        let mut backend = StaticBackend::new(&section.sandbox_id, base_url, section.visibility);
        backend.token_audience.clone_from(&section.token_audience);
        if let Some(bearer) = &section.bearer_token {
            backend = backend.with_bearer_token(bearer);
        }
        if let Some(secret) = &section.token_secret {
            let secret = token::decode_secret(secret).context("invalid backend.token_secret")?;
            backend = backend.with_token_secret(secret, Duration::from_secs(section.token_ttl_secs));
        }
        Ok(backend)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    Path::new(path).to_path_buf()
}

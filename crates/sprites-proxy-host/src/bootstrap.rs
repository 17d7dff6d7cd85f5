//! Proxy bootstrap: make sure exactly one tunnel server is listening inside
//! a sandbox before any client connects.
//!
//! 1. Probe the internal port. Listening already means done.
//! 2. Materialize the server binary and launch it detached, restricted to the
//!    caller's target port. Connect-token settings, when given, are written
//!    to the server's config file first.
//! 3. Classify the launch: missing capability is `Unsupported`, a non-zero
//!    exit is `StartFailed`.
//! 4. Poll the probe until ready or out of attempts (`ProxyUnavailable`).
//!
//! Whether the server runs is never remembered between calls; it is always
//! re-derived by probing.

use std::time::Duration;

use sprites_proxy_core::{ProxyError, ProxyResult};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::exec::{shell_quote, RemoteExec};
use crate::payload::{self, require_tool, TunnelPayload, SERVER_BINARY_NAME};

/// Default fixed port the tunnel server listens on inside the sandbox.
pub const DEFAULT_INTERNAL_PORT: u16 = 8765;

/// Default directory for the uploaded binary, pidfile, and log.
pub const DEFAULT_INSTALL_DIR: &str = "/tmp/sprites-tcp-proxy";

/// Probe attempts when the caller gives no timeout.
pub const DEFAULT_READY_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub internal_port: u16,
    pub install_dir: String,
    pub payload: TunnelPayload,
    pub poll_interval: Duration,
    pub default_attempts: u32,
    /// Written to the server's `[auth]` section before launch.
    pub auth: Option<ServerAuth>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            internal_port: DEFAULT_INTERNAL_PORT,
            install_dir: DEFAULT_INSTALL_DIR.to_string(),
            payload: TunnelPayload::installed(SERVER_BINARY_NAME),
            poll_interval: Duration::from_secs(1),
            default_attempts: DEFAULT_READY_ATTEMPTS,
            auth: None,
        }
    }
}

/// Connect-token settings the launched server verifies against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAuth {
    /// Hex-encoded HMAC secret.
    pub token_secret: String,
    pub token_audience: String,
}

impl ServerAuth {
    /// `[auth]` section of the server config. JSON string literals are
    /// valid TOML basic strings.
    pub(crate) fn to_toml(&self) -> ProxyResult<String> {
        Ok(format!(
            "[auth]\ntoken_secret = {}\ntoken_audience = {}\n",
            serde_json::to_string(&self.token_secret)?,
            serde_json::to_string(&self.token_audience)?,
        ))
    }
}

impl BootstrapConfig {
    fn install_path(&self, name: &str) -> String {
        format!("{}/{name}", self.install_dir.trim_end_matches('/'))
    }

    pub fn pid_file(&self) -> String {
        self.install_path(&format!("{SERVER_BINARY_NAME}.pid"))
    }

    pub fn log_file(&self) -> String {
        self.install_path(&format!("{SERVER_BINARY_NAME}.log"))
    }

    pub fn server_config_file(&self) -> String {
        self.install_path("server.toml")
    }

    /// Probe count for a readiness wait. `Some(0)` still probes once.
    pub fn attempts(&self, timeout_secs: Option<u64>) -> u32 {
        match timeout_secs {
            None => self.default_attempts.max(1),
            Some(secs) => u32::try_from(secs).unwrap_or(u32::MAX).max(1),
        }
    }
}

/// What [`ProxyBootstrap::ensure`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    AlreadyRunning,
    Launched,
}

/// Listening probe over `/proc/net/tcp{,6}`: exit 0 when a socket in LISTEN
/// state (`0A`) is bound to `port`.
pub(crate) fn probe_script(port: u16) -> String {
    format!(
        "files=''; for f in /proc/net/tcp /proc/net/tcp6; do [ -r \"$f\" ] && files=\"$files $f\"; done\n\
         [ -n \"$files\" ] || {{ echo '{marker} /proc/net/tcp'; exit 3; }}\n\
         {awk}\n\
         awk -v p={port:04X} 'FNR > 1 && $4 == \"0A\" {{ n = split($2, a, \":\"); if (a[n] == p) f = 1 }} END {{ exit !f }}' $files",
        marker = payload::UNSUPPORTED_MARKER,
        awk = require_tool("awk"),
    )
}

fn launch_script(config: &BootstrapConfig, binary: &str, target_port: u16) -> ProxyResult<String> {
    let bin = shell_quote(binary);
    let dir = shell_quote(&config.install_dir);
    let log = shell_quote(&config.log_file());
    let pid = shell_quote(&config.pid_file());
    let server_config = shell_quote(&config.server_config_file());
    let provision = match &config.auth {
        Some(auth) => format!(
            "(umask 077 && printf '%s' {} > {server_config}) || exit 1\n",
            shell_quote(&auth.to_toml()?)
        ),
        None => String::new(),
    };
    Ok(format!(
        "{nohup}\n\
         command -v {bin} >/dev/null 2>&1 || [ -x {bin} ] || {{ echo '{marker} {binary}'; exit 3; }}\n\
         mkdir -p {dir}\n\
         {provision}\
         nohup {bin} --listen 0.0.0.0:{port} --allowed-port {target_port} --config {server_config} \
         </dev/null >{log} 2>&1 &\n\
         echo $! > {pid}",
        nohup = require_tool("nohup"),
        marker = payload::UNSUPPORTED_MARKER,
        port = config.internal_port,
    ))
}

fn stop_script(config: &BootstrapConfig) -> String {
    let pid = shell_quote(&config.pid_file());
    format!(
        "[ -f {pid} ] || {{ echo absent; exit 0; }}\n\
         p=$(cat {pid}); rm -f {pid}\n\
         if [ -n \"$p\" ] && kill \"$p\" 2>/dev/null; then echo stopped; else echo absent; fi"
    )
}

/// Bootstraps the tunnel server through a [`RemoteExec`].
pub struct ProxyBootstrap<E> {
    exec: E,
    config: BootstrapConfig,
    /// Serializes launches issued through this instance.
    launch_lock: Mutex<()>,
}

impl<E: RemoteExec> ProxyBootstrap<E> {
    pub fn new(exec: E, config: BootstrapConfig) -> Self {
        Self {
            exec,
            config,
            launch_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    /// Whether something is listening on the internal port right now.
    pub async fn is_listening(&self) -> ProxyResult<bool> {
        let output =
            payload::run_script(&self.exec, &probe_script(self.config.internal_port)).await?;
        Ok(output.success())
    }

    /// Ensure the tunnel server is up, launching it for `target_port` if not.
    pub async fn ensure(
        &self,
        target_port: u16,
        timeout_secs: Option<u64>,
    ) -> ProxyResult<BootstrapOutcome> {
        if target_port == 0 {
            return Err(ProxyError::InvalidInit("target port must be in 1..=65535".into()));
        }
        if self.is_listening().await? {
            debug!(port = self.config.internal_port, "tunnel server already listening");
            return Ok(BootstrapOutcome::AlreadyRunning);
        }

        let _launch = self.launch_lock.lock().await;
        // Another caller may have finished launching while we waited.
        if self.is_listening().await? {
            debug!(port = self.config.internal_port, "tunnel server came up concurrently");
            return Ok(BootstrapOutcome::AlreadyRunning);
        }

        self.launch(target_port).await?;
        self.wait_ready(timeout_secs).await?;
        Ok(BootstrapOutcome::Launched)
    }

    async fn launch(&self, target_port: u16) -> ProxyResult<()> {
        let binary =
            payload::materialize(&self.exec, &self.config.payload, &self.config.install_dir)
                .await?;
        info!(
            binary = %binary,
            port = self.config.internal_port,
            target_port,
            "launching tunnel server"
        );

        let output = payload::run_script(
            &self.exec,
            &launch_script(&self.config, &binary, target_port)?,
        )
        .await?;
        match output.exit_code {
            Some(0) => Ok(()),
            // Indeterminate; readiness polling decides.
            None => {
                warn!("launch exit status unknown");
                Ok(())
            }
            Some(code) => Err(ProxyError::StartFailed {
                exit_code: Some(code),
                detail: output.stderr.trim().to_string(),
            }),
        }
    }

    /// Poll the listening probe, `poll_interval` apart.
    pub async fn wait_ready(&self, timeout_secs: Option<u64>) -> ProxyResult<()> {
        let attempts = self.config.attempts(timeout_secs);
        for attempt in 1..=attempts {
            match self.is_listening().await {
                Ok(true) => {
                    debug!(attempt, "tunnel server ready");
                    return Ok(());
                }
                Ok(false) => {}
                Err(e @ ProxyError::Unsupported(_)) => return Err(e),
                Err(e) => debug!(attempt, error = %e, "readiness probe failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
        Err(ProxyError::ProxyUnavailable {
            port: self.config.internal_port,
            attempts,
        })
    }

    /// Stop the server recorded in the pidfile. Returns whether one was running.
    pub async fn stop(&self) -> ProxyResult<bool> {
        let output = self.exec.exec(&stop_script(&self.config)).await?;
        if !output.success() {
            return Err(ProxyError::Transport(format!(
                "stop command failed: {}",
                output.stderr.trim()
            )));
        }
        let stopped = output.stdout.lines().any(|l| l.trim() == "stopped");
        if stopped {
            info!(port = self.config.internal_port, "tunnel server stopped");
        }
        Ok(stopped)
    }
}

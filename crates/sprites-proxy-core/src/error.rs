use thiserror::Error;

use crate::messages::Visibility;

/// Errors produced by the tunnel protocol, bootstrap, and endpoint resolution.
///
/// Every variant maps to a stable machine-readable code via [`ProxyError::code`];
/// the `Display` impl is the human-readable message.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A runtime capability the tunnel server needs is missing in the remote environment.
    #[error("unsupported environment: {0}")]
    Unsupported(String),

    /// The launch command for the tunnel server exited non-zero.
    #[error("tunnel server failed to start (exit code {exit_code:?}): {detail}")]
    StartFailed {
        exit_code: Option<i32>,
        detail: String,
    },

    /// The tunnel server never started listening before the deadline.
    #[error("tcp proxy on port {port} not ready after {attempts} probe(s)")]
    ProxyUnavailable { port: u16, attempts: u32 },

    /// The requested visibility conflicts with the sandbox's actual configuration.
    #[error("requested {requested} tcp proxy but sandbox is {actual}")]
    VisibilityMismatch {
        requested: Visibility,
        actual: Visibility,
    },

    #[error("service not ready: {0}")]
    ServiceNotReady(String),

    #[error("port {port} unavailable: {reason}")]
    PortUnavailable { port: u16, reason: String },

    /// The backend cannot provide this class of tunnel at all.
    #[error("tunnel unavailable: {0}")]
    TunnelUnavailable(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("invalid init message: {0}")]
    InvalidInit(String),

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("token error: {0}")]
    Token(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProxyError {
    /// Stable snake_case error code for callers that dispatch on error class.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::Unsupported(_) => "unsupported",
            ProxyError::StartFailed { .. } => "start_failed",
            ProxyError::ProxyUnavailable { .. } => "proxy_unavailable",
            ProxyError::VisibilityMismatch { .. } => "visibility_mismatch",
            ProxyError::ServiceNotReady(_) => "service_not_ready",
            ProxyError::PortUnavailable { .. } => "port_unavailable",
            ProxyError::TunnelUnavailable(_) => "tunnel_unavailable",
            ProxyError::Protocol(_) => "protocol_error",
            ProxyError::Handshake(_) => "handshake_failed",
            ProxyError::InvalidInit(_) => "invalid_init",
            ProxyError::PolicyDenied(_) => "policy_denied",
            ProxyError::Transport(_) => "transport_error",
            ProxyError::Token(_) => "token_error",
            ProxyError::Config(_) => "config_error",
            ProxyError::Io(_) => "io_error",
            ProxyError::Json(_) => "json_error",
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = ProxyError::VisibilityMismatch {
            requested: Visibility::Public,
            actual: Visibility::Private,
        };
        assert_eq!(err.code(), "visibility_mismatch");
        assert_eq!(
            err.to_string(),
            "requested public tcp proxy but sandbox is private"
        );

        let err = ProxyError::ProxyUnavailable {
            port: 8765,
            attempts: 1,
        };
        assert_eq!(err.code(), "proxy_unavailable");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: ProxyError = io.into();
        assert_eq!(err.code(), "io_error");
    }
}

//! Optional TLS termination for `wss://` endpoints.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use sprites_proxy_core::{ProxyError, ProxyResult};
use tokio_rustls::TlsAcceptor;

/// Load a PEM certificate chain and private key into a TLS acceptor.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> ProxyResult<TlsAcceptor> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        ProxyError::Config(format!("cannot read cert {}: {e}", cert_path.display()))
    })?;
    let key_pem = std::fs::read(key_path).map_err(|e| {
        ProxyError::Config(format!("cannot read key {}: {e}", key_path.display()))
    })?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Config(format!("invalid cert PEM: {e}")))?;
    if certs.is_empty() {
        return Err(ProxyError::Config(format!(
            "no certificates in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ProxyError::Config(format!("invalid key PEM: {e}")))?
        .ok_or_else(|| ProxyError::Config("no private key found in PEM".into()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Config(format!("TLS protocol setup failed: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Config(format!("TLS certificate rejected: {e}")))?;

    // The upgrade request is plain HTTP/1.1.
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

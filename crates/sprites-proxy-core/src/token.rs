//! HMAC connect tokens for private tunnel endpoints.
//!
//! A token binds an audience (typically `<sandbox-id>:<port>`) to an expiry.
//! Format: `<expiry-unix-secs as 16 hex digits>.<HMAC-SHA256 hex>`

use ring::hmac;

use crate::error::{ProxyError, ProxyResult};

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn signing_input(expiry: u64, audience: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 + audience.len());
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(audience.as_bytes());
    data
}

/// Create a token valid for `ttl_secs` from now.
pub fn create_token(secret: &[u8], audience: &str, ttl_secs: u64) -> String {
    create_token_at(secret, audience, now_secs().saturating_add(ttl_secs))
}

/// Create a token expiring at the given unix time.
pub fn create_token_at(secret: &[u8], audience: &str, expiry: u64) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, &signing_input(expiry, audience));
    format!("{expiry:016x}.{}", hex::encode(tag.as_ref()))
}

/// Verify a token against the current time.
pub fn verify_token(secret: &[u8], audience: &str, token: &str) -> ProxyResult<()> {
    verify_token_at(secret, audience, token, now_secs())
}

/// Verify signature and expiry as of `now`.
pub fn verify_token_at(secret: &[u8], audience: &str, token: &str, now: u64) -> ProxyResult<()> {
    let (expiry_hex, mac_hex) = token
        .split_once('.')
        .ok_or_else(|| ProxyError::Token("malformed token".into()))?;

    let expiry = u64::from_str_radix(expiry_hex, 16)
        .map_err(|_| ProxyError::Token("malformed token expiry".into()))?;
    let mac = hex::decode(mac_hex).map_err(|_| ProxyError::Token("malformed token mac".into()))?;

    if now > expiry {
        return Err(ProxyError::Token("token expired".into()));
    }

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, &signing_input(expiry, audience), &mac)
        .map_err(|_| ProxyError::Token("invalid token signature".into()))
}

/// Generate a random 32-byte secret.
pub fn generate_secret() -> ProxyResult<Vec<u8>> {
    use ring::rand::{SecureRandom, SystemRandom};
    let mut secret = vec![0u8; 32];
    SystemRandom::new()
        .fill(&mut secret)
        .map_err(|_| ProxyError::Token("system RNG unavailable".into()))?;
    Ok(secret)
}

/// Decode a hex-encoded secret from configuration.
pub fn decode_secret(hex_secret: &str) -> ProxyResult<Vec<u8>> {
    let secret = hex::decode(hex_secret.trim())
        .map_err(|e| ProxyError::Config(format!("token secret is not hex: {e}")))?;
    if secret.len() < 16 {
        return Err(ProxyError::Config(
            "token secret must be at least 16 bytes".into(),
        ));
    }
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_verify() {
        let secret = generate_secret().unwrap();
        let token = create_token(&secret, "sbx-1:8765", 300);
        assert!(verify_token(&secret, "sbx-1:8765", &token).is_ok());
    }

    #[test]
    fn wrong_audience() {
        let secret = generate_secret().unwrap();
        let token = create_token(&secret, "sbx-1:8765", 300);
        assert!(verify_token(&secret, "sbx-2:8765", &token).is_err());
    }

    #[test]
    fn wrong_secret() {
        let token = create_token(&generate_secret().unwrap(), "sbx-1:8765", 300);
        let err = verify_token(&generate_secret().unwrap(), "sbx-1:8765", &token).unwrap_err();
        assert_eq!(err.code(), "token_error");
    }

    #[test]
    fn expired_token() {
        let secret = generate_secret().unwrap();
        let token = create_token_at(&secret, "aud", 1_000);
        assert!(verify_token_at(&secret, "aud", &token, 1_000).is_ok());
        assert!(verify_token_at(&secret, "aud", &token, 1_001).is_err());
    }

    #[test]
    fn tampered_expiry_fails_signature() {
        let secret = generate_secret().unwrap();
        let token = create_token_at(&secret, "aud", 1_000);
        let (_, mac) = token.split_once('.').unwrap();
        let forged = format!("{:016x}.{mac}", 9_999_999_999u64);
        assert!(verify_token_at(&secret, "aud", &forged, 2_000).is_err());
    }

    #[test]
    fn malformed() {
        let secret = generate_secret().unwrap();
        assert!(verify_token(&secret, "aud", "nodot").is_err());
        assert!(verify_token(&secret, "aud", "zz.00").is_err());
    }

    #[test]
    fn secret_decoding() {
        assert_eq!(decode_secret(&"ab".repeat(16)).unwrap().len(), 16);
        assert!(decode_secret("abcd").is_err());
        assert!(decode_secret("not-hex").is_err());
    }
}

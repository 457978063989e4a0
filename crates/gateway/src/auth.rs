use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};

pub fn configured_secret(config: &GatewayConfig) -> Result<&str> {
    config
        .admin_secret
        .as_deref()
        .ok_or(GatewayError::SecretNotConfigured)
}

/// Exact match against the configured secret, compared in constant time.
pub fn check_admin(config: &GatewayConfig, provided: Option<&str>) -> Result<()> {
    let expected = configured_secret(config)?;
    match provided {
        Some(secret)
            if secret.len() == expected.len()
                && bool::from(secret.as_bytes().ct_eq(expected.as_bytes())) =>
        {
            Ok(())
        }
        _ => Err(GatewayError::Unauthorized),
    }
}

/// Secret from `x-admin-secret` or `Authorization: Bearer ...`.
pub fn header_secret(headers: &HeaderMap) -> Option<String> {
    if let Some(secret) = headers.get("x-admin-secret").and_then(|v| v.to_str().ok()) {
        return Some(secret.to_string());
    }
    let value = headers.get("authorization")?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config(secret: Option<&str>) -> GatewayConfig {
        let mut config = GatewayConfig::from_lookup(|_| None).unwrap();
        config.admin_secret = secret.map(str::to_string);
        config
    }

    #[test]
    fn test_check_admin() {
        let config = config(Some("s3cret"));
        assert!(check_admin(&config, Some("s3cret")).is_ok());
        assert!(matches!(
            check_admin(&config, Some("s3cre")),
            Err(GatewayError::Unauthorized)
        ));
        assert!(matches!(
            check_admin(&config, Some("S3CRET")),
            Err(GatewayError::Unauthorized)
        ));
        assert!(matches!(
            check_admin(&config, None),
            Err(GatewayError::Unauthorized)
        ));
    }

    #[test]
    fn test_unconfigured_secret() {
        assert!(matches!(
            check_admin(&config(None), Some("anything")),
            Err(GatewayError::SecretNotConfigured)
        ));
    }

    #[test]
    fn test_header_secret_sources() {
        let mut headers = HeaderMap::new();
        assert_eq!(header_secret(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("bearer abc"));
        assert_eq!(header_secret(&headers).as_deref(), Some("abc"));

        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(header_secret(&headers), None);

        headers.insert("x-admin-secret", HeaderValue::from_static("xyz"));
        assert_eq!(header_secret(&headers).as_deref(), Some("xyz"));
    }
}

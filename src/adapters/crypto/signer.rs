//! Bearer tokens for ePA authorization
//!
//! After the TEE3 handshake the client fetches a freshness value and proves
//! its identity with an ES256 JWT over that value.

use crate::domain::{ExporterError, Result};
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Lifetime of an issued bearer token in seconds
const TOKEN_LIFETIME_SECONDS: i64 = 20 * 60;

/// Claims of the authorization bearer token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationClaims {
    /// Token type marker
    #[serde(rename = "type")]
    pub token_type: String,
    /// Freshness value returned by the server
    pub challenge: String,
    /// Telematik-ID of the exporting institution
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Produces the bearer token answering a freshness challenge
pub trait AuthorizationSigner: Send + Sync {
    /// Signs `freshness` into a compact JWT
    fn sign_freshness(&self, freshness: &str) -> Result<String>;
}

/// ES256 signer over a PKCS#8 PEM key
pub struct JwtAuthorizationSigner {
    key: EncodingKey,
    telematik_id: String,
}

impl JwtAuthorizationSigner {
    /// Builds a signer from PEM bytes
    pub fn from_pem(pem: &[u8], telematik_id: impl Into<String>) -> Result<Self> {
        let key = EncodingKey::from_ec_pem(pem)
            .map_err(|e| ExporterError::Crypto(format!("Invalid authorization key: {e}")))?;
        Ok(Self {
            key,
            telematik_id: telematik_id.into(),
        })
    }

    /// Reads the PEM key from disk
    pub fn from_file(path: impl AsRef<Path>, telematik_id: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        let pem = std::fs::read(path).map_err(|e| {
            ExporterError::Configuration(format!(
                "Failed to read authorization key {}: {e}",
                path.display()
            ))
        })?;
        Self::from_pem(&pem, telematik_id)
    }
}

impl AuthorizationSigner for JwtAuthorizationSigner {
    fn sign_freshness(&self, freshness: &str) -> Result<String> {
        let iat = Utc::now().timestamp();
        let claims = AuthorizationClaims {
            token_type: "ePA-Authentisierung".to_string(),
            challenge: freshness.to_string(),
            sub: self.telematik_id.clone(),
            iat,
            exp: iat + TOKEN_LIFETIME_SECONDS,
        };
        encode(&Header::new(Algorithm::ES256), &claims, &self.key)
            .map_err(|e| ExporterError::Crypto(format!("Failed to sign bearer token: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};

    const PRIVATE_KEY: &[u8] = include_bytes!("../../../tests/fixtures/authorization_key.pem");
    const PUBLIC_KEY: &[u8] = include_bytes!("../../../tests/fixtures/authorization_key.pub.pem");

    #[test]
    fn test_token_verifies_and_carries_challenge() {
        let signer = JwtAuthorizationSigner::from_pem(PRIVATE_KEY, "9-2.58.00000040").unwrap();
        let token = signer.sign_freshness("fresh-123").unwrap();

        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        let decoded = decode::<AuthorizationClaims>(
            &token,
            &DecodingKey::from_ec_pem(PUBLIC_KEY).unwrap(),
            &validation,
        )
        .unwrap();

        assert_eq!(decoded.claims.challenge, "fresh-123");
        assert_eq!(decoded.claims.sub, "9-2.58.00000040");
        assert_eq!(decoded.claims.exp - decoded.claims.iat, TOKEN_LIFETIME_SECONDS);
    }

    #[test]
    fn test_invalid_pem_rejected() {
        let result = JwtAuthorizationSigner::from_pem(b"not a key", "x");
        assert!(matches!(result, Err(ExporterError::Crypto(_))));
    }

    #[test]
    fn test_missing_key_file() {
        let result = JwtAuthorizationSigner::from_file("/nonexistent/key.pem", "x");
        assert!(matches!(result, Err(ExporterError::Configuration(_))));
    }
}

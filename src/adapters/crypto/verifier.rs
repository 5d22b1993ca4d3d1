//! Outer TLS certificate checks
//!
//! Chain validation is done by the HTTPS client. A [`CertificateVerifier`]
//! gets the DER leaf certificate of every new outer connection and may veto
//! it.

use crate::config::{EpaConfig, TlsVerification};
use crate::domain::{ExporterError, Result, Tee3Error};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;

/// Decides whether a server certificate is acceptable
pub trait CertificateVerifier: Send + Sync {
    /// Checks the DER encoded leaf certificate, `None` when the connection
    /// carried no certificate (plain HTTP)
    fn verify(&self, certificate: Option<&[u8]>) -> std::result::Result<(), Tee3Error>;
}

/// Accepts whatever the platform trust store accepted
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTrustVerifier;

impl CertificateVerifier for SystemTrustVerifier {
    fn verify(&self, _certificate: Option<&[u8]>) -> std::result::Result<(), Tee3Error> {
        Ok(())
    }
}

/// Accepts only leaf certificates with a known SHA-256 fingerprint
#[derive(Debug, Clone)]
pub struct PinnedCertificateVerifier {
    fingerprints: HashSet<[u8; 32]>,
}

impl PinnedCertificateVerifier {
    /// Parses hex fingerprints, colons allowed
    pub fn new<S: AsRef<str>>(fingerprints: &[S]) -> Result<Self> {
        let mut parsed = HashSet::new();
        for fingerprint in fingerprints {
            let cleaned: String = fingerprint
                .as_ref()
                .chars()
                .filter(|c| *c != ':')
                .collect();
            let bytes = hex::decode(&cleaned).map_err(|e| {
                ExporterError::Configuration(format!("Invalid certificate fingerprint: {e}"))
            })?;
            let digest: [u8; 32] = bytes.try_into().map_err(|_| {
                ExporterError::Configuration(
                    "Certificate fingerprint must be 32 bytes of SHA-256".to_string(),
                )
            })?;
            parsed.insert(digest);
        }
        Ok(Self {
            fingerprints: parsed,
        })
    }
}

impl CertificateVerifier for PinnedCertificateVerifier {
    fn verify(&self, certificate: Option<&[u8]>) -> std::result::Result<(), Tee3Error> {
        let der = certificate.ok_or_else(|| {
            Tee3Error::CertificateRejected("no server certificate presented".to_string())
        })?;
        let digest: [u8; 32] = Sha256::digest(der).into();
        if self.fingerprints.contains(&digest) {
            Ok(())
        } else {
            Err(Tee3Error::CertificateRejected(format!(
                "fingerprint {} is not pinned",
                hex::encode(digest)
            )))
        }
    }
}

/// Builds the verifier selected by the configuration
pub fn create_verifier(config: &EpaConfig) -> Result<Arc<dyn CertificateVerifier>> {
    match config.tls_verification {
        TlsVerification::System => Ok(Arc::new(SystemTrustVerifier)),
        TlsVerification::Pinned => Ok(Arc::new(PinnedCertificateVerifier::new(
            &config.pinned_certificate_sha256,
        )?)),
    }
}

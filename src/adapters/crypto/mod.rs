//! Key material: blob keys, bearer token signing and certificate checks

pub mod keys;
pub mod signer;
pub mod verifier;

pub use keys::{
    decrypt_blob, encrypt_blob, HkdfKeyDerivation, KeyDerivation, KeyPurpose, SymmetricKey,
};
pub use signer::{AuthorizationClaims, AuthorizationSigner, JwtAuthorizationSigner};
pub use verifier::{
    create_verifier, CertificateVerifier, PinnedCertificateVerifier, SystemTrustVerifier,
};

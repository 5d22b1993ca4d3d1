//! Event blob key derivation and decryption
//!
//! Every encrypted column of a task event is sealed with AES-256-GCM under a
//! key derived per row from a blob generation id and a salt. Production
//! deployments plug an HSM behind [`KeyDerivation`]; [`HkdfKeyDerivation`]
//! derives the same shape of key in software from a master key.

use crate::domain::{BlobKeyRef, ExporterError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Which blob family a key is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    /// KVNR, prescription bundle and identities
    Task,
    /// Dispense bundle
    MedicationDispense,
}

impl KeyPurpose {
    fn label(&self) -> &'static [u8] {
        match self {
            KeyPurpose::Task => b"task",
            KeyPurpose::MedicationDispense => b"medication-dispense",
        }
    }
}

/// 256-bit symmetric key, zeroized on drop
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    /// Wraps raw key bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey([REDACTED])")
    }
}

/// Derives the symmetric key for one stored blob
#[async_trait]
pub trait KeyDerivation: Send + Sync {
    /// Derives the key identified by `key_ref` for `purpose`
    async fn derive_key(&self, purpose: KeyPurpose, key_ref: &BlobKeyRef) -> Result<SymmetricKey>;
}

/// HKDF-SHA256 key derivation from a master key
pub struct HkdfKeyDerivation {
    master_key: Zeroizing<Vec<u8>>,
}

impl HkdfKeyDerivation {
    /// Creates the derivation from master key bytes
    ///
    /// # Errors
    ///
    /// Returns an error when the master key is shorter than 32 bytes
    pub fn new(master_key: Zeroizing<Vec<u8>>) -> Result<Self> {
        if master_key.len() < 32 {
            return Err(ExporterError::Crypto(
                "master key must be at least 32 bytes".to_string(),
            ));
        }
        Ok(Self { master_key })
    }
}

#[async_trait]
impl KeyDerivation for HkdfKeyDerivation {
    async fn derive_key(&self, purpose: KeyPurpose, key_ref: &BlobKeyRef) -> Result<SymmetricKey> {
        let hkdf = Hkdf::<Sha256>::new(Some(&key_ref.salt), &self.master_key);
        let mut info = Vec::with_capacity(32);
        info.extend_from_slice(purpose.label());
        info.extend_from_slice(&key_ref.blob_id.to_be_bytes());

        let mut okm = [0u8; 32];
        hkdf.expand(&info, &mut okm)
            .map_err(|e| ExporterError::Crypto(format!("key derivation failed: {e}")))?;
        let key = SymmetricKey::from_bytes(okm);
        okm.zeroize();
        Ok(key)
    }
}

/// Decrypts a stored blob laid out as `iv | ciphertext | tag`
pub fn decrypt_blob(key: &SymmetricKey, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if blob.len() < IV_LEN + TAG_LEN {
        return Err(ExporterError::Crypto(format!(
            "encrypted blob too short: {} bytes",
            blob.len()
        )));
    }
    let (iv, ciphertext) = blob.split_at(IV_LEN);
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| ExporterError::Crypto(format!("invalid key: {e}")))?;
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| ExporterError::Crypto("blob authentication failed".to_string()))
}

/// Encrypts a blob into the stored layout, with a random IV
pub fn encrypt_blob(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| ExporterError::Crypto(format!("invalid key: {e}")))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| ExporterError::Crypto("blob encryption failed".to_string()))?;

    let mut blob = Vec::with_capacity(IV_LEN + ciphertext.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derivation() -> HkdfKeyDerivation {
        HkdfKeyDerivation::new(Zeroizing::new(vec![7u8; 32])).unwrap()
    }

    fn key_ref(blob_id: i32, salt: u8) -> BlobKeyRef {
        BlobKeyRef {
            blob_id,
            salt: vec![salt; 16],
        }
    }

    #[test]
    fn test_short_master_key_rejected() {
        assert!(HkdfKeyDerivation::new(Zeroizing::new(vec![1u8; 16])).is_err());
    }

    #[tokio::test]
    async fn test_derivation_is_deterministic_and_separated() {
        let kd = derivation();
        let a = kd.derive_key(KeyPurpose::Task, &key_ref(1, 1)).await.unwrap();
        let b = kd.derive_key(KeyPurpose::Task, &key_ref(1, 1)).await.unwrap();
        let other_salt = kd.derive_key(KeyPurpose::Task, &key_ref(1, 2)).await.unwrap();
        let other_blob = kd.derive_key(KeyPurpose::Task, &key_ref(2, 1)).await.unwrap();
        let other_purpose = kd
            .derive_key(KeyPurpose::MedicationDispense, &key_ref(1, 1))
            .await
            .unwrap();

        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), other_salt.as_bytes());
        assert_ne!(a.as_bytes(), other_blob.as_bytes());
        assert_ne!(a.as_bytes(), other_purpose.as_bytes());
    }

    #[tokio::test]
    async fn test_blob_decrypts_with_its_key_only() {
        let kd = derivation();
        let key = kd.derive_key(KeyPurpose::Task, &key_ref(1, 1)).await.unwrap();
        let wrong = kd.derive_key(KeyPurpose::Task, &key_ref(1, 9)).await.unwrap();

        let blob = encrypt_blob(&key, b"X123456789").unwrap();
        assert_eq!(decrypt_blob(&key, &blob).unwrap().as_slice(), b"X123456789");
        assert!(decrypt_blob(&wrong, &blob).is_err());
        assert!(decrypt_blob(&key, &blob[..10]).is_err());
    }

    #[test]
    fn test_key_debug_redacted() {
        let key = SymmetricKey::from_bytes([0x41; 32]);
        assert_eq!(format!("{key:?}"), "SymmetricKey([REDACTED])");
    }
}

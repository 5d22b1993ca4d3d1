//! Secret configuration values
//!
//! Connection strings and key material are held in [`SecretString`]: the
//! value is zeroized on drop, `Debug` prints `[REDACTED]`, and reading it
//! takes an explicit `expose_secret()`.
//!
//! ```rust
//! use medication_exporter::config::secret_string;
//! use secrecy::ExposeSecret;
//!
//! let key = secret_string("c2VjcmV0".to_string());
//! assert_eq!(key.expose_secret(), "c2VjcmV0");
//! assert!(!format!("{key:?}").contains("c2VjcmV0"));
//! ```

use base64::Engine;
use secrecy::{CloneableSecret, DebugSecret, ExposeSecret, Secret, SerializableSecret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, Zeroizing};

/// String newtype that satisfies the `Secret` trait bounds
#[derive(Clone, Debug, Zeroize)]
#[zeroize(drop)]
pub struct SecretValue(String);

impl CloneableSecret for SecretValue {}
impl DebugSecret for SecretValue {}
impl SerializableSecret for SecretValue {}

impl From<String> for SecretValue {
    fn from(s: String) -> Self {
        SecretValue(s)
    }
}

impl PartialEq<str> for SecretValue {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl AsRef<str> for SecretValue {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl SecretValue {
    /// Check if the secret value is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for SecretValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SecretValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(SecretValue)
    }
}

/// Zeroizing, redacted string
pub type SecretString = Secret<SecretValue>;

/// Wraps a String into a [`SecretString`]
#[inline]
pub fn secret_string(value: String) -> SecretString {
    Secret::new(SecretValue::from(value))
}

/// Decodes a base64 secret into zeroizing bytes
///
/// # Errors
///
/// Returns the decoder message when the value is not valid standard base64.
pub fn decode_base64_secret(secret: &SecretString) -> Result<Zeroizing<Vec<u8>>, String> {
    base64::engine::general_purpose::STANDARD
        .decode(secret.expose_secret().as_ref().trim())
        .map(Zeroizing::new)
        .map_err(|e| format!("invalid base64 secret: {e}"))
}

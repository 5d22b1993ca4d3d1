//! Domain identifier types with validation
//!
//! Newtype wrappers for the identifiers that flow through the export
//! pipeline. Each type validates its format on construction.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Plaintext insurant identifier (KVNR)
///
/// One uppercase letter followed by nine digits. The value is personal data:
/// `Debug` and `Display` are redacted, use [`Kvnr::as_str`] where the raw
/// value is needed (request headers).
///
/// # Examples
///
/// ```
/// use medication_exporter::domain::ids::Kvnr;
///
/// let kvnr = Kvnr::new("X123456789").unwrap();
/// assert_eq!(kvnr.as_str(), "X123456789");
/// assert_eq!(format!("{kvnr}"), "X*********");
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Kvnr(String);

impl Kvnr {
    /// Creates a new Kvnr after checking its format
    pub fn new(value: impl Into<String>) -> Result<Self, String> {
        let value = value.into();
        let mut chars = value.chars();
        let valid = value.len() == 10
            && chars.next().is_some_and(|c| c.is_ascii_uppercase())
            && chars.all(|c| c.is_ascii_digit());
        if !valid {
            return Err("KVNR must be one uppercase letter followed by nine digits".to_string());
        }
        Ok(Self(value))
    }

    /// Returns the raw KVNR
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Kvnr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let first = self.0.chars().next().unwrap_or('?');
        write!(f, "{first}*********")
    }
}

impl fmt::Debug for Kvnr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kvnr({self})")
    }
}

impl FromStr for Kvnr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Hashed KVNR, the primary key of the `kvnr` table
///
/// Displayed as a short hex prefix, which is what logs carry.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HashedKvnr(Vec<u8>);

impl HashedKvnr {
    /// Wraps the stored hash bytes
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Hashes a plaintext KVNR with a deployment specific key
    pub fn derive(kvnr: &Kvnr, hash_key: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(hash_key);
        hasher.update(kvnr.as_str().as_bytes());
        Self(hasher.finalize().to_vec())
    }

    /// Returns the raw hash bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for HashedKvnr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = &self.0[..self.0.len().min(6)];
        write!(f, "{}", hex::encode(prefix))
    }
}

impl fmt::Debug for HashedKvnr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashedKvnr({self})")
    }
}

/// E-prescription identifier
///
/// Format: `NNN.NNN.NNN.NNN.NNN.NN`, the first group is the flow type.
///
/// # Examples
///
/// ```
/// use medication_exporter::domain::ids::PrescriptionId;
/// use std::str::FromStr;
///
/// let id = PrescriptionId::from_str("160.000.100.000.001.05").unwrap();
/// assert_eq!(id.flow_type(), 160);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrescriptionId(String);

impl PrescriptionId {
    /// Creates a new PrescriptionId from a string
    pub fn new(id: impl Into<String>) -> Result<Self, String> {
        let id = id.into();
        let groups: Vec<&str> = id.split('.').collect();
        let valid = groups.len() == 6
            && groups[..5]
                .iter()
                .all(|g| g.len() == 3 && g.chars().all(|c| c.is_ascii_digit()))
            && groups[5].len() == 2
            && groups[5].chars().all(|c| c.is_ascii_digit());
        if !valid {
            return Err(format!(
                "Invalid prescription ID format. Expected NNN.NNN.NNN.NNN.NNN.NN, got: {}",
                id
            ));
        }
        Ok(Self(id))
    }

    /// Returns the prescription ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the numeric flow type prefix
    pub fn flow_type(&self) -> u16 {
        self.0[..3].parse().unwrap_or_default()
    }
}

impl fmt::Display for PrescriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PrescriptionId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for PrescriptionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

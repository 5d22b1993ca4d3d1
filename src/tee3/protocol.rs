//! TEE3 wire format
//!
//! Handshake messages are JSON objects tagged by `MessageType` with base64
//! binary fields. Application data travels in encrypted frames:
//!
//! ```text
//! version(0x02) | pu | req | request_counter (u64 BE) | key_id (32) | iv (12) | ciphertext | tag
//! ```
//!
//! The 43 header bytes are the AEAD associated data. The IV is four random
//! bytes followed by the request counter.

use crate::domain::Tee3Error;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Frame format version
pub const FRAME_VERSION: u8 = 0x02;
/// Length of the key identifier
pub const KEY_ID_LEN: usize = 32;
/// Length of the frame header
pub const HEADER_LEN: usize = 3 + 8 + KEY_ID_LEN;
/// Length of the AES-GCM IV
pub const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Path of the first handshake message
pub const HANDSHAKE_PATH: &str = "/VAU";
/// Response header carrying the session path
pub const CID_HEADER: &str = "VAU-CID";
/// Request header carrying the endpoint's VAU-NP
pub const VAU_NP_HEADER: &str = "VAU-NP";
/// Content type of handshake and restart messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type of encrypted frames
pub const FRAME_CONTENT_TYPE: &str = "application/octet-stream";

pub(crate) const K1_INFO: &[u8] = b"tee3-k1";
pub(crate) const K2_INFO: &[u8] = b"tee3-k2";

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, T: AsRef<[u8]>>(bytes: T, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Handshake and control messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "MessageType")]
pub enum HandshakeMessage {
    /// Client ephemeral public key
    M1 {
        #[serde(rename = "ECDH_PK", with = "b64")]
        ecdh_pk: Vec<u8>,
    },
    /// Server ephemeral public key and the encrypted server identity
    M2 {
        #[serde(rename = "ECDH_ct", with = "b64")]
        ecdh_ct: Vec<u8>,
        #[serde(rename = "AEAD_ct", with = "b64")]
        aead_ct: Vec<u8>,
    },
    /// Encapsulation to the static key plus client key confirmation
    M3 {
        #[serde(rename = "ECDH_ct", with = "b64")]
        ecdh_ct: Vec<u8>,
        #[serde(rename = "AEAD_ct", with = "b64")]
        aead_ct: Vec<u8>,
        #[serde(rename = "AEAD_ct_key_confirmation", with = "b64")]
        key_confirmation: Vec<u8>,
    },
    /// Server key confirmation
    M4 {
        #[serde(rename = "AEAD_ct_key_confirmation", with = "b64")]
        key_confirmation: Vec<u8>,
    },
    /// The server lost the session
    RestartMessage,
}

impl HandshakeMessage {
    /// Serializes the message body
    pub fn to_bytes(&self) -> Result<Vec<u8>, Tee3Error> {
        serde_json::to_vec(self)
            .map_err(|e| Tee3Error::Protocol(format!("cannot encode handshake message: {e}")))
    }

    /// Parses a message body
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Tee3Error> {
        serde_json::from_slice(bytes)
            .map_err(|e| Tee3Error::Protocol(format!("malformed handshake message: {e}")))
    }

    /// Value of `MessageType`
    pub fn message_type(&self) -> &'static str {
        match self {
            HandshakeMessage::M1 { .. } => "M1",
            HandshakeMessage::M2 { .. } => "M2",
            HandshakeMessage::M3 { .. } => "M3",
            HandshakeMessage::M4 { .. } => "M4",
            HandshakeMessage::RestartMessage => "RestartMessage",
        }
    }
}

/// Server identity sealed inside M2
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(with = "b64")]
    pub static_public_key: Vec<u8>,
    pub config_id: String,
}

/// Direction flag of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request = 1,
    Response = 2,
}

/// Decoded frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Production flag
    pub pu: bool,
    pub direction: Direction,
    pub request_counter: u64,
    pub key_id: [u8; KEY_ID_LEN],
}

impl FrameHeader {
    /// Encodes the header
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = FRAME_VERSION;
        out[1] = u8::from(self.pu);
        out[2] = self.direction as u8;
        out[3..11].copy_from_slice(&self.request_counter.to_be_bytes());
        out[11..].copy_from_slice(&self.key_id);
        out
    }

    /// Decodes the header at the start of `frame`
    pub fn parse(frame: &[u8]) -> Result<Self, Tee3Error> {
        if frame.len() < HEADER_LEN {
            return Err(Tee3Error::StreamTruncated(format!(
                "frame of {} bytes has no complete header",
                frame.len()
            )));
        }
        if frame[0] != FRAME_VERSION {
            return Err(Tee3Error::Protocol(format!(
                "unsupported frame version {:#04x}",
                frame[0]
            )));
        }
        let pu = match frame[1] {
            0 => false,
            1 => true,
            other => {
                return Err(Tee3Error::Protocol(format!("invalid pu flag {other}")));
            }
        };
        let direction = match frame[2] {
            1 => Direction::Request,
            2 => Direction::Response,
            other => {
                return Err(Tee3Error::Protocol(format!("invalid req flag {other}")));
            }
        };
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&frame[3..11]);
        let mut key_id = [0u8; KEY_ID_LEN];
        key_id.copy_from_slice(&frame[11..HEADER_LEN]);
        Ok(Self {
            pu,
            direction,
            request_counter: u64::from_be_bytes(counter),
            key_id,
        })
    }
}

fn cipher(key: &[u8; 32]) -> Result<Aes256Gcm, Tee3Error> {
    Aes256Gcm::new_from_slice(key).map_err(|e| Tee3Error::Protocol(format!("invalid key: {e}")))
}

/// Encrypts `plaintext` into a frame
pub fn seal_frame(
    key: &[u8; 32],
    header: &FrameHeader,
    plaintext: &[u8],
) -> Result<Vec<u8>, Tee3Error> {
    let header_bytes = header.to_bytes();
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv[..4]);
    iv[4..].copy_from_slice(&header.request_counter.to_be_bytes());

    let ciphertext = cipher(key)?
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad: &header_bytes,
            },
        )
        .map_err(|_| Tee3Error::Protocol("frame encryption failed".to_string()))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + IV_LEN + ciphertext.len());
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(&iv);
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

/// Decrypts a frame, returning its header and plaintext
pub fn open_frame(key: &[u8; 32], frame: &[u8]) -> Result<(FrameHeader, Vec<u8>), Tee3Error> {
    let header = FrameHeader::parse(frame)?;
    if frame.len() < HEADER_LEN + IV_LEN + TAG_LEN {
        return Err(Tee3Error::StreamTruncated(format!(
            "frame of {} bytes is shorter than header, iv and tag",
            frame.len()
        )));
    }
    let (header_bytes, rest) = frame.split_at(HEADER_LEN);
    let (iv, ciphertext) = rest.split_at(IV_LEN);
    let plaintext = cipher(key)?
        .decrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: ciphertext,
                aad: header_bytes,
            },
        )
        .map_err(|_| Tee3Error::Protocol("frame authentication failed".to_string()))?;
    Ok((header, plaintext))
}

/// Seals a handshake payload as `iv | ciphertext | tag`
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, Tee3Error> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let ciphertext = cipher(key)?
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| Tee3Error::HandshakeFailed("encryption failed".to_string()))?;
    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Opens a payload produced by [`seal`]
pub fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, Tee3Error> {
    if sealed.len() < IV_LEN + TAG_LEN {
        return Err(Tee3Error::HandshakeFailed(
            "sealed payload too short".to_string(),
        ));
    }
    let (iv, ciphertext) = sealed.split_at(IV_LEN);
    cipher(key)?
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| Tee3Error::HandshakeFailed("authentication failed".to_string()))
}

/// Expands `ikm` into `N` 32-byte keys
pub fn derive_keys<const N: usize>(ikm: &[u8], info: &[u8]) -> Result<[[u8; 32]; N], Tee3Error> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = vec![0u8; 32 * N];
    hkdf.expand(info, &mut okm)
        .map_err(|e| Tee3Error::HandshakeFailed(format!("key derivation failed: {e}")))?;

    let mut keys = [[0u8; 32]; N];
    for (key, chunk) in keys.iter_mut().zip(okm.chunks_exact(32)) {
        key.copy_from_slice(chunk);
    }
    okm.zeroize();
    Ok(keys)
}

/// Running SHA-256 over the handshake messages
#[derive(Clone, Default)]
pub struct Transcript(Sha256);

impl Transcript {
    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    /// Hash of everything seen so far
    pub fn hash(&self) -> [u8; 32] {
        self.0.clone().finalize().into()
    }
}

/// Keys of an established session
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SessionKeys {
    pub key_id: [u8; KEY_ID_LEN],
    /// Client to server application key
    pub c2s: [u8; 32],
    /// Server to client application key
    pub s2c: [u8; 32],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("key_id", &hex::encode(&self.key_id[..4]))
            .finish_non_exhaustive()
    }
}

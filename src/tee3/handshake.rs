//! TEE3 key exchange
//!
//! Both sides of the M1..M4 exchange as plain state machines, plus the
//! client driver that runs them over an [`OuterTransport`].
//!
//! K1 comes from the ephemeral-ephemeral ECDH and only protects the handshake.
//! K2 mixes in an encapsulation to the server's static key and yields the
//! confirmation keys, both application keys and the key id.

use super::protocol::{
    derive_keys, open, seal, HandshakeMessage, ServerInfo, SessionKeys, Transcript, CID_HEADER,
    HANDSHAKE_PATH, JSON_CONTENT_TYPE, K1_INFO, K2_INFO, VAU_NP_HEADER,
};
use super::transport::{OuterRequest, OuterTransport};
use crate::domain::Tee3Error;
use k256::ecdh::{diffie_hellman, EphemeralSecret};
use k256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use zeroize::Zeroizing;

fn public_bytes(key: &PublicKey) -> Vec<u8> {
    key.to_sec1_bytes().to_vec()
}

fn parse_public(bytes: &[u8]) -> Result<PublicKey, Tee3Error> {
    PublicKey::from_sec1_bytes(bytes)
        .map_err(|_| Tee3Error::HandshakeFailed("invalid public key".to_string()))
}

fn failed(reason: &str) -> Tee3Error {
    Tee3Error::HandshakeFailed(reason.to_string())
}

/// Derives the session keys and the two confirmation keys
fn derive_k2(ss_e: &[u8], ss_s: &[u8]) -> Result<(SessionKeys, [u8; 32], [u8; 32]), Tee3Error> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(64));
    ikm.extend_from_slice(ss_e);
    ikm.extend_from_slice(ss_s);
    let [c2s_kc, s2c_kc, c2s, s2c, key_id] = derive_keys::<5>(&ikm, K2_INFO)?;
    Ok((SessionKeys { key_id, c2s, s2c }, c2s_kc, s2c_kc))
}

/// Client state before M2
pub struct ClientHandshake {
    ephemeral: EphemeralSecret,
    transcript: Transcript,
}

/// Client state before M4
pub struct ClientAwaitingM4 {
    keys: SessionKeys,
    s2c_kc: Zeroizing<[u8; 32]>,
    transcript: Transcript,
}

impl ClientHandshake {
    /// Creates the ephemeral key and the M1 body
    pub fn start() -> Result<(Self, Vec<u8>), Tee3Error> {
        let ephemeral = EphemeralSecret::random(&mut OsRng);
        let m1 = HandshakeMessage::M1 {
            ecdh_pk: public_bytes(&ephemeral.public_key()),
        }
        .to_bytes()?;

        let mut transcript = Transcript::default();
        transcript.update(&m1);
        Ok((
            Self {
                ephemeral,
                transcript,
            },
            m1,
        ))
    }

    /// Consumes M2 and produces the M3 body
    pub fn process_m2(mut self, m2: &[u8]) -> Result<(ClientAwaitingM4, Vec<u8>), Tee3Error> {
        let HandshakeMessage::M2 { ecdh_ct, aead_ct } = HandshakeMessage::from_bytes(m2)? else {
            return Err(failed("expected M2"));
        };
        self.transcript.update(m2);

        let ss_e = self.ephemeral.diffie_hellman(&parse_public(&ecdh_ct)?);
        let [k1_c2s, k1_s2c] = derive_keys::<2>(ss_e.raw_secret_bytes().as_slice(), K1_INFO)?;
        let (k1_c2s, k1_s2c) = (Zeroizing::new(k1_c2s), Zeroizing::new(k1_s2c));

        let info: ServerInfo = serde_json::from_slice(&open(&k1_s2c, &aead_ct)?)
            .map_err(|e| Tee3Error::HandshakeFailed(format!("malformed server info: {e}")))?;
        let static_key = parse_public(&info.static_public_key)?;

        let encapsulation = EphemeralSecret::random(&mut OsRng);
        let ss_s = encapsulation.diffie_hellman(&static_key);
        let encapsulation_pk = public_bytes(&encapsulation.public_key());

        let (keys, c2s_kc, s2c_kc) = derive_k2(
            ss_e.raw_secret_bytes().as_slice(),
            ss_s.raw_secret_bytes().as_slice(),
        )?;
        let c2s_kc = Zeroizing::new(c2s_kc);

        let aead_ct = seal(&k1_c2s, &encapsulation_pk)?;
        self.transcript.update(&encapsulation_pk);
        self.transcript.update(&aead_ct);
        let key_confirmation = seal(&c2s_kc, &self.transcript.hash())?;

        let m3 = HandshakeMessage::M3 {
            ecdh_ct: encapsulation_pk,
            aead_ct,
            key_confirmation,
        }
        .to_bytes()?;
        self.transcript.update(&m3);

        Ok((
            ClientAwaitingM4 {
                keys,
                s2c_kc: Zeroizing::new(s2c_kc),
                transcript: self.transcript,
            },
            m3,
        ))
    }
}

impl ClientAwaitingM4 {
    /// Verifies the server confirmation and returns the session keys
    pub fn process_m4(self, m4: &[u8]) -> Result<SessionKeys, Tee3Error> {
        let HandshakeMessage::M4 { key_confirmation } = HandshakeMessage::from_bytes(m4)? else {
            return Err(failed("expected M4"));
        };
        let confirmed = open(&self.s2c_kc, &key_confirmation)?;
        if confirmed != self.transcript.hash() {
            return Err(failed("server key confirmation mismatch"));
        }
        Ok(self.keys)
    }
}

/// Server state before M3
pub struct ServerAwaitingM3 {
    ss_e: Zeroizing<Vec<u8>>,
    k1_c2s: Zeroizing<[u8; 32]>,
    transcript: Transcript,
}

/// Answers M1 with M2
pub fn respond_to_m1(
    static_key: &SecretKey,
    config_id: &str,
    m1: &[u8],
) -> Result<(ServerAwaitingM3, Vec<u8>), Tee3Error> {
    let HandshakeMessage::M1 { ecdh_pk } = HandshakeMessage::from_bytes(m1)? else {
        return Err(failed("expected M1"));
    };
    let client_key = parse_public(&ecdh_pk)?;

    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let ss_e = ephemeral.diffie_hellman(&client_key);
    let ss_e = Zeroizing::new(ss_e.raw_secret_bytes().to_vec());
    let [k1_c2s, k1_s2c] = derive_keys::<2>(&ss_e, K1_INFO)?;
    let k1_s2c = Zeroizing::new(k1_s2c);

    let info = ServerInfo {
        static_public_key: public_bytes(&static_key.public_key()),
        config_id: config_id.to_string(),
    };
    let info = serde_json::to_vec(&info)
        .map_err(|e| Tee3Error::HandshakeFailed(format!("cannot encode server info: {e}")))?;

    let m2 = HandshakeMessage::M2 {
        ecdh_ct: public_bytes(&ephemeral.public_key()),
        aead_ct: seal(&k1_s2c, &info)?,
    }
    .to_bytes()?;

    let mut transcript = Transcript::default();
    transcript.update(m1);
    transcript.update(&m2);

    Ok((
        ServerAwaitingM3 {
            ss_e,
            k1_c2s: Zeroizing::new(k1_c2s),
            transcript,
        },
        m2,
    ))
}

impl ServerAwaitingM3 {
    /// Checks M3 and answers with M4
    pub fn process_m3(
        mut self,
        static_key: &SecretKey,
        m3: &[u8],
    ) -> Result<(SessionKeys, Vec<u8>), Tee3Error> {
        let HandshakeMessage::M3 {
            ecdh_ct,
            aead_ct,
            key_confirmation,
        } = HandshakeMessage::from_bytes(m3)?
        else {
            return Err(failed("expected M3"));
        };

        if open(&self.k1_c2s, &aead_ct)? != ecdh_ct {
            return Err(failed("encapsulation key does not match its ciphertext"));
        }
        let encapsulation = parse_public(&ecdh_ct)?;
        let ss_s = diffie_hellman(static_key.to_nonzero_scalar(), encapsulation.as_affine());
        let (keys, c2s_kc, s2c_kc) =
            derive_k2(&self.ss_e, ss_s.raw_secret_bytes().as_slice())?;
        let (c2s_kc, s2c_kc) = (Zeroizing::new(c2s_kc), Zeroizing::new(s2c_kc));

        self.transcript.update(&ecdh_ct);
        self.transcript.update(&aead_ct);
        if open(&c2s_kc, &key_confirmation)? != self.transcript.hash() {
            return Err(failed("client key confirmation mismatch"));
        }

        self.transcript.update(m3);
        let m4 = HandshakeMessage::M4 {
            key_confirmation: seal(&s2c_kc, &self.transcript.hash())?,
        }
        .to_bytes()?;
        Ok((keys, m4))
    }
}

/// Result of a completed client handshake
#[derive(Debug)]
pub struct EstablishedHandshake {
    /// Session path returned in `VAU-CID`
    pub cid: String,
    pub keys: SessionKeys,
}

fn json_request(path: &str, body: Vec<u8>, user_agent: &str) -> OuterRequest {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    if let Ok(value) = HeaderValue::from_str(user_agent) {
        headers.insert(USER_AGENT, value);
    }
    OuterRequest {
        method: Method::POST,
        path: path.to_string(),
        headers,
        body,
    }
}

/// Runs M1..M4 over `transport`
pub async fn perform_handshake(
    transport: &mut dyn OuterTransport,
    vau_np: Option<&str>,
    user_agent: &str,
) -> Result<EstablishedHandshake, Tee3Error> {
    let (client, m1) = ClientHandshake::start()?;
    let mut request = json_request(HANDSHAKE_PATH, m1, user_agent);
    if let Some(np) = vau_np.and_then(|np| HeaderValue::from_str(np).ok()) {
        request.headers.insert(VAU_NP_HEADER, np);
    }

    let response = transport.send(request).await?;
    if response.status != 200 {
        return Err(Tee3Error::HandshakeFailed(format!(
            "M1 answered with status {}",
            response.status
        )));
    }
    let cid = response
        .headers
        .get(CID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|cid| cid.starts_with("/VAU/") && cid.len() > 5)
        .map(str::to_string)
        .ok_or_else(|| failed("M2 without a valid VAU-CID"))?;

    let (awaiting, m3) = client.process_m2(&response.body)?;
    let response = transport.send(json_request(&cid, m3, user_agent)).await?;
    if response.status != 200 {
        return Err(Tee3Error::HandshakeFailed(format!(
            "M3 answered with status {}",
            response.status
        )));
    }
    let keys = awaiting.process_m4(&response.body)?;

    Ok(EstablishedHandshake { cid, keys })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_key() -> SecretKey {
        SecretKey::random(&mut OsRng)
    }

    #[test]
    fn test_both_sides_agree_on_keys() {
        let server_key = static_key();
        let (client, m1) = ClientHandshake::start().unwrap();
        let (server, m2) = respond_to_m1(&server_key, "cfg-1", &m1).unwrap();
        let (awaiting, m3) = client.process_m2(&m2).unwrap();
        let (server_keys, m4) = server.process_m3(&server_key, &m3).unwrap();
        let client_keys = awaiting.process_m4(&m4).unwrap();

        assert_eq!(client_keys.key_id, server_keys.key_id);
        assert_eq!(client_keys.c2s, server_keys.c2s);
        assert_eq!(client_keys.s2c, server_keys.s2c);
        assert_ne!(client_keys.c2s, client_keys.s2c);
    }

    #[test]
    fn test_tampered_m3_rejected() {
        let server_key = static_key();
        let (client, m1) = ClientHandshake::start().unwrap();
        let (server, m2) = respond_to_m1(&server_key, "cfg-1", &m1).unwrap();
        let (_, m3) = client.process_m2(&m2).unwrap();

        let HandshakeMessage::M3 {
            ecdh_ct,
            aead_ct,
            mut key_confirmation,
        } = HandshakeMessage::from_bytes(&m3).unwrap()
        else {
            panic!("expected M3");
        };
        let last = key_confirmation.len() - 1;
        key_confirmation[last] ^= 1;
        let tampered = HandshakeMessage::M3 {
            ecdh_ct,
            aead_ct,
            key_confirmation,
        }
        .to_bytes()
        .unwrap();

        assert!(matches!(
            server.process_m3(&server_key, &tampered),
            Err(Tee3Error::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_m4_from_other_session_rejected() {
        let server_key = static_key();

        let (client_a, m1_a) = ClientHandshake::start().unwrap();
        let (server_a, m2_a) = respond_to_m1(&server_key, "cfg", &m1_a).unwrap();
        let (awaiting_a, m3_a) = client_a.process_m2(&m2_a).unwrap();
        server_a.process_m3(&server_key, &m3_a).unwrap();

        let (client_b, m1_b) = ClientHandshake::start().unwrap();
        let (server_b, m2_b) = respond_to_m1(&server_key, "cfg", &m1_b).unwrap();
        let (_, m3_b) = client_b.process_m2(&m2_b).unwrap();
        let (_, m4_b) = server_b.process_m3(&server_key, &m3_b).unwrap();

        assert!(awaiting_a.process_m4(&m4_b).is_err());
    }

    #[test]
    fn test_wrong_message_order() {
        let (client, m1) = ClientHandshake::start().unwrap();
        assert!(matches!(
            client.process_m2(&m1),
            Err(Tee3Error::HandshakeFailed(_))
        ));
    }
}

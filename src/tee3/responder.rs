//! In-process TEE3 server
//!
//! [`Responder`] implements the server half of the protocol: the key exchange,
//! encrypted frames, restart messages and the authorization service. Paired
//! with [`LoopbackTransport`] it lets the full client stack run without a
//! network, which the `check-connection --self-test` command and the test
//! suites rely on.
//!
//! Bearer tokens are checked for the issued freshness challenge, not for
//! their signature.

use super::channel::{BEARER_TOKEN_PATH, FRESHNESS_PATH};
use super::handshake::{respond_to_m1, ServerAwaitingM3};
use super::http::{InnerRequest, InnerResponse};
use super::protocol::{
    open_frame, seal_frame, Direction, FrameHeader, HandshakeMessage, SessionKeys, CID_HEADER,
    FRAME_CONTENT_TYPE, HANDSHAKE_PATH, JSON_CONTENT_TYPE, VAU_NP_HEADER,
};
use super::transport::{OuterRequest, OuterResponse, OuterTransport, TransportFactory};
use crate::adapters::crypto::AuthorizationSigner;
use crate::domain::{Result as ExporterResult, Tee3Error};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use k256::SecretKey;
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

/// Produces the inner response for an authorized application request
pub type InnerHandler = Arc<dyn Fn(&InnerRequest) -> InnerResponse + Send + Sync>;

/// An application request as the server saw it
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub endpoint: SocketAddr,
    pub request: InnerRequest,
}

struct ServerSession {
    keys: SessionKeys,
    last_counter: u64,
    freshness: Option<String>,
    authorized: bool,
}

#[derive(Default)]
struct ResponderState {
    next_cid: u64,
    pending: HashMap<String, ServerAwaitingM3>,
    sessions: HashMap<String, ServerSession>,
    unreachable: HashSet<SocketAddr>,
    outer_failures: VecDeque<u16>,
    handshakes: usize,
    presented_vau_np: Vec<Option<String>>,
    received: Vec<ReceivedRequest>,
}

/// Server side of the protocol
pub struct Responder {
    static_key: SecretKey,
    config_id: String,
    handler: RwLock<InnerHandler>,
    state: Mutex<ResponderState>,
}

impl Responder {
    /// A responder answering every application request with `200 {}`
    pub fn new() -> Arc<Self> {
        Self::with_handler(Arc::new(|_: &InnerRequest| {
            InnerResponse::json(StatusCode::OK, &json!({}))
        }))
    }

    pub fn with_handler(handler: InnerHandler) -> Arc<Self> {
        Arc::new(Self {
            static_key: SecretKey::random(&mut OsRng),
            config_id: "loopback".to_string(),
            handler: RwLock::new(handler),
            state: Mutex::new(ResponderState::default()),
        })
    }

    /// Replaces the application handler
    pub fn set_handler(&self, handler: InnerHandler) {
        *self.handler.write() = handler;
    }

    /// VAU-NP the responder issues for an endpoint
    pub fn vau_np_for(endpoint: SocketAddr) -> String {
        format!("np-{endpoint}")
    }

    /// Refuses connections to `endpoint`
    pub fn set_unreachable(&self, endpoint: SocketAddr, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.unreachable.insert(endpoint);
        } else {
            state.unreachable.remove(&endpoint);
        }
    }

    pub fn is_unreachable(&self, endpoint: SocketAddr) -> bool {
        self.state.lock().unreachable.contains(&endpoint)
    }

    /// Answers the next outer request with `status`, queued
    pub fn fail_next_outer(&self, status: u16) {
        self.state.lock().outer_failures.push_back(status);
    }

    /// Forgets every session, so the next frame gets a restart message
    pub fn drop_sessions(&self) {
        let mut state = self.state.lock();
        state.sessions.clear();
        state.pending.clear();
    }

    /// Completed handshakes
    pub fn handshake_count(&self) -> usize {
        self.state.lock().handshakes
    }

    /// `VAU-NP` header of every M1, in order
    pub fn presented_vau_np(&self) -> Vec<Option<String>> {
        self.state.lock().presented_vau_np.clone()
    }

    /// Authorized application requests, in order
    pub fn received(&self) -> Vec<ReceivedRequest> {
        self.state.lock().received.clone()
    }

    /// Handles one outer request arriving at `endpoint`
    pub fn handle(
        &self,
        endpoint: SocketAddr,
        request: OuterRequest,
    ) -> Result<OuterResponse, Tee3Error> {
        {
            let mut state = self.state.lock();
            if state.unreachable.contains(&endpoint) {
                return Err(Tee3Error::ConnectionReset(format!(
                    "{endpoint}: connection refused"
                )));
            }
            if let Some(status) = state.outer_failures.pop_front() {
                return Ok(plain(status));
            }
        }

        if request.method != Method::POST {
            return Ok(plain(405));
        }
        if request.path == HANDSHAKE_PATH {
            return Ok(self.handle_m1(&request));
        }
        if !request.path.starts_with("/VAU/") {
            return Ok(plain(404));
        }

        let is_json = request
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| v.starts_with(JSON_CONTENT_TYPE));
        if is_json {
            Ok(self.handle_m3(&request))
        } else {
            self.handle_frame(endpoint, &request)
        }
    }

    fn handle_m1(&self, request: &OuterRequest) -> OuterResponse {
        let vau_np = request
            .headers
            .get(VAU_NP_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let Ok((awaiting, m2)) = respond_to_m1(&self.static_key, &self.config_id, &request.body)
        else {
            return plain(400);
        };

        let mut state = self.state.lock();
        state.presented_vau_np.push(vau_np);
        state.next_cid += 1;
        let cid = format!("/VAU/{:016x}", state.next_cid);
        state.pending.insert(cid.clone(), awaiting);
        drop(state);

        let mut response = json_response(m2);
        if let Ok(value) = HeaderValue::from_str(&cid) {
            response.headers.insert(CID_HEADER, value);
        }
        response
    }

    fn handle_m3(&self, request: &OuterRequest) -> OuterResponse {
        let Some(awaiting) = self.state.lock().pending.remove(&request.path) else {
            return plain(404);
        };
        match awaiting.process_m3(&self.static_key, &request.body) {
            Ok((keys, m4)) => {
                let mut state = self.state.lock();
                state.handshakes += 1;
                state.sessions.insert(
                    request.path.clone(),
                    ServerSession {
                        keys,
                        last_counter: 0,
                        freshness: None,
                        authorized: false,
                    },
                );
                json_response(m4)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Rejecting M3");
                plain(400)
            }
        }
    }

    fn handle_frame(
        &self,
        endpoint: SocketAddr,
        request: &OuterRequest,
    ) -> Result<OuterResponse, Tee3Error> {
        let mut state = self.state.lock();
        let Some(session) = state.sessions.get_mut(&request.path) else {
            return Ok(json_response(HandshakeMessage::RestartMessage.to_bytes()?));
        };

        let Ok((header, plaintext)) = open_frame(&session.keys.c2s, &request.body) else {
            return Ok(plain(400));
        };
        if header.direction != Direction::Request
            || header.key_id != session.keys.key_id
            || header.request_counter <= session.last_counter
        {
            return Ok(plain(400));
        }
        session.last_counter = header.request_counter;
        let Ok(inner) = InnerRequest::parse(&plaintext) else {
            return Ok(plain(400));
        };

        let keys = session.keys.clone();
        let inner_response = match (inner.method.clone(), inner.path.as_str()) {
            (Method::GET, FRESHNESS_PATH) => {
                let mut challenge = [0u8; 16];
                OsRng.fill_bytes(&mut challenge);
                let freshness = hex::encode(challenge);
                session.freshness = Some(freshness.clone());
                InnerResponse::json(StatusCode::OK, &json!({ "freshness": freshness }))
            }
            (Method::POST, BEARER_TOKEN_PATH) => {
                let expected = session.freshness.take();
                if expected.is_some() && token_challenge(&inner.body) == expected {
                    session.authorized = true;
                    InnerResponse::json(
                        StatusCode::OK,
                        &json!({ "vau-np": Self::vau_np_for(endpoint) }),
                    )
                } else {
                    InnerResponse::json(StatusCode::FORBIDDEN, &json!({ "errorCode": "invalidToken" }))
                }
            }
            _ if !session.authorized => {
                InnerResponse::json(StatusCode::UNAUTHORIZED, &json!({ "errorCode": "notAuthorized" }))
            }
            _ => {
                state.received.push(ReceivedRequest {
                    endpoint,
                    request: inner.clone(),
                });
                drop(state);
                let handler = self.handler.read().clone();
                handler(&inner)
            }
        };

        let response_header = FrameHeader {
            pu: header.pu,
            direction: Direction::Response,
            request_counter: header.request_counter,
            key_id: keys.key_id,
        };
        let frame = seal_frame(&keys.s2c, &response_header, &inner_response.encode())?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(FRAME_CONTENT_TYPE));
        Ok(OuterResponse {
            status: 200,
            headers,
            body: frame,
        })
    }
}

fn plain(status: u16) -> OuterResponse {
    OuterResponse {
        status,
        headers: HeaderMap::new(),
        body: Vec::new(),
    }
}

fn json_response(body: Vec<u8>) -> OuterResponse {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    OuterResponse {
        status: 200,
        headers,
        body,
    }
}

/// `challenge` claim of the bearer token in an authorization request body
fn token_challenge(body: &[u8]) -> Option<String> {
    let request: serde_json::Value = serde_json::from_slice(body).ok()?;
    let token = request.get("bearerToken")?.as_str()?;
    let payload = token.split('.').nth(1)?;
    let claims: serde_json::Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).ok()?).ok()?;
    claims.get("challenge")?.as_str().map(str::to_string)
}

/// Outer transport delivering requests straight to a [`Responder`]
pub struct LoopbackTransport {
    responder: Arc<Responder>,
    endpoint: Option<SocketAddr>,
}

impl LoopbackTransport {
    pub fn new(responder: Arc<Responder>) -> Self {
        Self {
            responder,
            endpoint: None,
        }
    }
}

#[async_trait]
impl OuterTransport for LoopbackTransport {
    async fn connect(&mut self, endpoint: SocketAddr) -> Result<(), Tee3Error> {
        self.endpoint = None;
        if self.responder.is_unreachable(endpoint) {
            return Err(Tee3Error::ConnectionReset(format!(
                "{endpoint}: connection refused"
            )));
        }
        self.endpoint = Some(endpoint);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.endpoint.is_some()
    }

    fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }

    async fn send(&mut self, request: OuterRequest) -> Result<OuterResponse, Tee3Error> {
        let endpoint = self.endpoint.ok_or(Tee3Error::NotConnected)?;
        self.responder.handle(endpoint, request)
    }

    fn close(&mut self) {
        self.endpoint = None;
    }
}

/// Creates [`LoopbackTransport`]s for one responder
pub struct LoopbackTransportFactory {
    responder: Arc<Responder>,
}

impl LoopbackTransportFactory {
    pub fn new(responder: Arc<Responder>) -> Self {
        Self { responder }
    }
}

impl TransportFactory for LoopbackTransportFactory {
    fn create(&self, _host: &str, _port: u16) -> Box<dyn OuterTransport> {
        Box::new(LoopbackTransport::new(self.responder.clone()))
    }
}

/// Unsigned token carrying only the challenge
///
/// Accepted by [`Responder`]; a real server rejects it.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticSigner;

impl AuthorizationSigner for StaticSigner {
    fn sign_freshness(&self, freshness: &str) -> ExporterResult<String> {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let claims = URL_SAFE_NO_PAD.encode(json!({ "challenge": freshness }).to_string());
        Ok(format!("{header}.{claims}."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::crypto::JwtAuthorizationSigner;

    #[test]
    fn test_token_challenge_from_static_signer() {
        let token = StaticSigner.sign_freshness("abc").unwrap();
        let body = json!({ "bearerToken": token }).to_string();
        assert_eq!(token_challenge(body.as_bytes()).as_deref(), Some("abc"));
    }

    #[test]
    fn test_token_challenge_from_jwt_signer() {
        let pem = include_bytes!("../../tests/fixtures/authorization_key.pem");
        let signer = JwtAuthorizationSigner::from_pem(pem, "9-test").unwrap();
        let body = json!({ "bearerToken": signer.sign_freshness("f-1").unwrap() }).to_string();
        assert_eq!(token_challenge(body.as_bytes()).as_deref(), Some("f-1"));
    }

    #[test]
    fn test_token_challenge_rejects_garbage() {
        assert_eq!(token_challenge(b"{}"), None);
        assert_eq!(token_challenge(br#"{"bearerToken":"x"}"#), None);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_refuses_connect() {
        let responder = Responder::new();
        let endpoint = SocketAddr::from(([127, 0, 0, 1], 443));
        responder.set_unreachable(endpoint, true);

        let mut transport = LoopbackTransport::new(responder.clone());
        assert!(matches!(
            transport.connect(endpoint).await,
            Err(Tee3Error::ConnectionReset(_))
        ));
        assert!(!transport.is_connected());

        responder.set_unreachable(endpoint, false);
        transport.connect(endpoint).await.unwrap();
        assert!(transport.is_connected());
    }

    #[test]
    fn test_frame_for_unknown_session_gets_restart() {
        let responder = Responder::new();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(FRAME_CONTENT_TYPE));
        let response = responder
            .handle(
                SocketAddr::from(([127, 0, 0, 1], 443)),
                OuterRequest {
                    method: Method::POST,
                    path: "/VAU/unknown".to_string(),
                    headers,
                    body: vec![0; 80],
                },
            )
            .unwrap();
        assert_eq!(response.content_type().as_deref(), Some(JSON_CONTENT_TYPE));
        assert_eq!(
            HandshakeMessage::from_bytes(&response.body).unwrap(),
            HandshakeMessage::RestartMessage
        );
    }
}

//! Secure channel to one ePA host
//!
//! A [`SecureChannel`] owns one outer connection and at most one TEE3 session
//! on it. It moves through `Disconnected → Handshaking → Authorizing → Ready`
//! and is driven by whoever currently leases it from the pool.

use super::endpoints::EndpointRegistry;
use super::handshake::perform_handshake;
use super::http::{InnerRequest, InnerResponse};
use super::protocol::{HandshakeMessage, FRAME_CONTENT_TYPE, JSON_CONTENT_TYPE};
use super::session::Tee3Session;
use super::transport::{OuterRequest, OuterTransport};
use crate::adapters::crypto::AuthorizationSigner;
use crate::config::EpaConfig;
use crate::domain::Tee3Error;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Freshness endpoint of the authorization service
pub const FRESHNESS_PATH: &str = "/epa/authz/v1/freshness";
/// Bearer token endpoint of the authorization service
pub const BEARER_TOKEN_PATH: &str = "/epa/authz/v1/send_authorization_request_bearertoken";

/// Settings shared by every channel of a registry
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub user_agent: String,
    /// Age after which the session is renegotiated
    pub session_lifetime: Duration,
    /// Production flag carried in every frame
    pub production: bool,
}

impl ChannelSettings {
    pub fn from_config(config: &EpaConfig, production: bool) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            session_lifetime: Duration::from_secs(config.session_lifetime_seconds),
            production,
        }
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Handshaking,
    Authorizing,
    Ready,
}

#[derive(Debug, Deserialize)]
struct FreshnessResponse {
    freshness: String,
}

#[derive(Debug, Default, Deserialize)]
struct AuthorizationResponse {
    #[serde(rename = "vau-np", default)]
    vau_np: Option<String>,
}

/// An encrypted, authorized channel
pub struct SecureChannel {
    id: usize,
    host: String,
    settings: Arc<ChannelSettings>,
    signer: Arc<dyn AuthorizationSigner>,
    transport: Box<dyn OuterTransport>,
    session: Option<Tee3Session>,
    state: ChannelState,
}

impl SecureChannel {
    pub fn new(
        id: usize,
        host: impl Into<String>,
        settings: Arc<ChannelSettings>,
        signer: Arc<dyn AuthorizationSigner>,
        transport: Box<dyn OuterTransport>,
    ) -> Self {
        Self {
            id,
            host: host.into(),
            settings,
            signer,
            transport,
            session: None,
            state: ChannelState::Disconnected,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Endpoint of the current outer connection
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.transport.endpoint()
    }

    /// True when bound to an endpoint the registry no longer lists
    pub fn is_stale(&self, registry: &dyn EndpointRegistry) -> bool {
        self.endpoint()
            .map_or(false, |endpoint| !registry.contains(endpoint))
    }

    /// Makes the channel ready, renegotiating an expired session in place or
    /// connecting to a candidate endpoint
    pub async fn ensure_connected(
        &mut self,
        registry: &dyn EndpointRegistry,
    ) -> Result<(), Tee3Error> {
        if self.state == ChannelState::Ready && self.transport.is_connected() {
            let expired = self
                .session
                .as_ref()
                .map_or(true, |s| s.is_expired(self.settings.session_lifetime));
            if !expired {
                return Ok(());
            }
            if let Some(endpoint) = self.endpoint() {
                tracing::debug!(channel = self.id, endpoint = %endpoint, "Session expired, renegotiating");
                match self.establish(endpoint, registry).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        tracing::warn!(channel = self.id, endpoint = %endpoint, error = %e, "Renegotiation failed");
                    }
                }
            }
        }
        self.connect(registry).await
    }

    async fn connect(&mut self, registry: &dyn EndpointRegistry) -> Result<(), Tee3Error> {
        self.close();
        let candidates = registry.connect_candidates();
        if candidates.is_empty() {
            return Err(Tee3Error::Resolve(format!("{} has no endpoints", self.host)));
        }

        let mut last_error = Tee3Error::NotConnected;
        for endpoint in candidates {
            match self.connect_to(endpoint, registry).await {
                Ok(()) => {
                    registry.mark_succeeded(endpoint);
                    tracing::info!(channel = self.id, host = %self.host, endpoint = %endpoint, "Channel ready");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        channel = self.id,
                        host = %self.host,
                        endpoint = %endpoint,
                        error = %e,
                        "Connect failed"
                    );
                    registry.mark_failed(endpoint);
                    self.close();
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn connect_to(
        &mut self,
        endpoint: SocketAddr,
        registry: &dyn EndpointRegistry,
    ) -> Result<(), Tee3Error> {
        self.transport.connect(endpoint).await?;
        self.establish(endpoint, registry).await
    }

    /// Handshake and authorization on the current outer connection
    async fn establish(
        &mut self,
        endpoint: SocketAddr,
        registry: &dyn EndpointRegistry,
    ) -> Result<(), Tee3Error> {
        self.session = None;
        self.state = ChannelState::Handshaking;
        let vau_np = registry.vau_np(endpoint);
        let handshake = perform_handshake(
            self.transport.as_mut(),
            vau_np.as_deref(),
            &self.settings.user_agent,
        )
        .await?;
        self.session = Some(Tee3Session::new(handshake, self.settings.production));

        self.state = ChannelState::Authorizing;
        self.authorize(endpoint, registry).await?;
        self.state = ChannelState::Ready;
        Ok(())
    }

    async fn authorize(
        &mut self,
        endpoint: SocketAddr,
        registry: &dyn EndpointRegistry,
    ) -> Result<(), Tee3Error> {
        let request = InnerRequest::new(Method::GET, FRESHNESS_PATH)
            .header("accept", "application/json")
            .header("user-agent", &self.settings.user_agent);
        let response = self.exchange(&request).await?;
        if !response.status.is_success() {
            return Err(Tee3Error::Authorization(format!(
                "freshness request returned {}",
                response.status.as_u16()
            )));
        }
        let freshness: FreshnessResponse = serde_json::from_slice(&response.body)
            .map_err(|e| Tee3Error::Authorization(format!("malformed freshness: {e}")))?;

        let token = self
            .signer
            .sign_freshness(&freshness.freshness)
            .map_err(|e| Tee3Error::Authorization(e.to_string()))?;
        let body = serde_json::json!({ "bearerToken": token }).to_string();
        let request = InnerRequest::new(Method::POST, BEARER_TOKEN_PATH)
            .header("content-type", "application/json")
            .header("accept", "application/json")
            .header("user-agent", &self.settings.user_agent)
            .body(body.into_bytes());
        let response = self.exchange(&request).await?;
        if !response.status.is_success() {
            return Err(Tee3Error::Authorization(format!(
                "bearer token rejected with {}",
                response.status.as_u16()
            )));
        }

        let authorization: AuthorizationResponse = if response.body.is_empty() {
            AuthorizationResponse::default()
        } else {
            serde_json::from_slice(&response.body)
                .map_err(|e| Tee3Error::Authorization(format!("malformed response: {e}")))?
        };
        if let Some(vau_np) = authorization.vau_np {
            registry.set_vau_np(endpoint, vau_np);
        }
        if let Some(session) = self.session.as_mut() {
            session.mark_authorized();
        }
        Ok(())
    }

    /// Sends an inner request over the ready session
    ///
    /// A non-200 outer status renegotiates the session once and resends.
    pub async fn send(
        &mut self,
        request: &InnerRequest,
        registry: &dyn EndpointRegistry,
        request_id: &str,
    ) -> Result<InnerResponse, Tee3Error> {
        if self.state != ChannelState::Ready {
            return Err(Tee3Error::NotConnected);
        }
        match self.exchange(request).await {
            Err(Tee3Error::OuterResponseNotOk(status)) => {
                let endpoint = self.endpoint().ok_or(Tee3Error::NotConnected)?;
                tracing::warn!(
                    channel = self.id,
                    request_id = %request_id,
                    status,
                    "Outer response not OK, renegotiating session"
                );
                self.establish(endpoint, registry).await?;
                self.exchange(request).await
            }
            result => result,
        }
    }

    /// One encrypted round trip
    async fn exchange(&mut self, request: &InnerRequest) -> Result<InnerResponse, Tee3Error> {
        let session = self.session.as_mut().ok_or(Tee3Error::NotConnected)?;
        let (frame, counter) = session.encrypt_request(&request.encode(&self.host))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(FRAME_CONTENT_TYPE));
        if let Ok(value) = HeaderValue::from_str(&self.settings.user_agent) {
            headers.insert(USER_AGENT, value);
        }
        let outer = OuterRequest {
            method: Method::POST,
            path: session.cid().to_string(),
            headers,
            body: frame,
        };

        let response = self.transport.send(outer).await?;
        if response.status != 200 {
            return Err(Tee3Error::OuterResponseNotOk(response.status));
        }
        if response.content_type().as_deref() == Some(JSON_CONTENT_TYPE) {
            return match HandshakeMessage::from_bytes(&response.body)? {
                HandshakeMessage::RestartMessage => Err(Tee3Error::Restart),
                other => Err(Tee3Error::Protocol(format!(
                    "unexpected {} message",
                    other.message_type()
                ))),
            };
        }

        let plaintext = session.decrypt_response(&response.body, counter)?;
        InnerResponse::parse(&plaintext)
    }

    /// Drops the session and the outer connection
    pub fn close(&mut self) {
        self.session = None;
        self.transport.close();
        self.state = ChannelState::Disconnected;
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("state", &self.state)
            .field("endpoint", &self.endpoint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tee3::endpoints::EndpointSet;
    use crate::tee3::responder::{LoopbackTransport, Responder, StaticSigner};
    use parking_lot::Mutex;
    use reqwest::StatusCode;

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, last], 443))
    }

    fn endpoints(addresses: &[SocketAddr]) -> Mutex<EndpointSet> {
        let mut set = EndpointSet::new(
            "epa.test",
            443,
            Duration::from_secs(3),
            Duration::from_secs(300),
        );
        set.apply(Ok(addresses.to_vec()));
        Mutex::new(set)
    }

    impl EndpointRegistry for Mutex<EndpointSet> {
        fn connect_candidates(&self) -> Vec<SocketAddr> {
            self.lock().connect_candidates()
        }

        fn contains(&self, endpoint: SocketAddr) -> bool {
            self.lock().contains(endpoint)
        }

        fn mark_failed(&self, endpoint: SocketAddr) {
            self.lock().mark_failed(endpoint)
        }

        fn mark_succeeded(&self, endpoint: SocketAddr) {
            self.lock().mark_succeeded(endpoint)
        }

        fn vau_np(&self, endpoint: SocketAddr) -> Option<String> {
            self.lock().vau_np(endpoint)
        }

        fn set_vau_np(&self, endpoint: SocketAddr, vau_np: String) {
            self.lock().set_vau_np(endpoint, vau_np)
        }
    }

    fn channel(responder: &Arc<Responder>, lifetime: Duration) -> SecureChannel {
        SecureChannel::new(
            0,
            "epa.test",
            Arc::new(ChannelSettings {
                user_agent: "exporter-test".to_string(),
                session_lifetime: lifetime,
                production: false,
            }),
            Arc::new(StaticSigner),
            Box::new(LoopbackTransport::new(responder.clone())),
        )
    }

    fn medication_request() -> InnerRequest {
        InnerRequest::new(Method::POST, "/epa/medication/api/v1/fhir/$provide-prescription-erp")
            .body(b"{}".to_vec())
    }

    #[tokio::test]
    async fn test_connect_handshake_authorize_send() {
        let responder = Responder::new();
        let registry = endpoints(&[addr(1)]);
        let mut channel = channel(&responder, Duration::from_secs(600));

        channel.ensure_connected(&registry).await.unwrap();
        assert_eq!(channel.state(), ChannelState::Ready);
        assert_eq!(registry.vau_np(addr(1)), Some(Responder::vau_np_for(addr(1))));

        let response = channel
            .send(&medication_request(), &registry, "req-1")
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(responder.received().len(), 1);
        assert_eq!(responder.handshake_count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_backed_off() {
        let responder = Responder::new();
        responder.set_unreachable(addr(1), true);
        let registry = endpoints(&[addr(1), addr(2)]);
        let mut channel = channel(&responder, Duration::from_secs(600));

        channel.ensure_connected(&registry).await.unwrap();
        assert_eq!(channel.endpoint(), Some(addr(2)));
        let failed = registry.lock().snapshot();
        let first = failed.iter().find(|e| e.endpoint == addr(1)).unwrap();
        assert_eq!(first.retry_count, 1);
    }

    #[tokio::test]
    async fn test_all_endpoints_unreachable() {
        let responder = Responder::new();
        responder.set_unreachable(addr(1), true);
        let registry = endpoints(&[addr(1)]);
        let mut channel = channel(&responder, Duration::from_secs(600));

        let error = channel.ensure_connected(&registry).await.unwrap_err();
        assert!(matches!(error, Tee3Error::ConnectionReset(_)));
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn test_expired_session_renegotiates_on_same_endpoint() {
        let responder = Responder::new();
        let registry = endpoints(&[addr(1), addr(2)]);
        let mut channel = channel(&responder, Duration::ZERO);

        channel.ensure_connected(&registry).await.unwrap();
        let endpoint = channel.endpoint();
        channel.ensure_connected(&registry).await.unwrap();

        assert_eq!(channel.endpoint(), endpoint);
        assert_eq!(responder.handshake_count(), 2);
    }

    #[tokio::test]
    async fn test_vau_np_is_presented_on_reconnect() {
        let responder = Responder::new();
        let registry = endpoints(&[addr(1)]);
        let mut channel = channel(&responder, Duration::from_secs(600));

        channel.ensure_connected(&registry).await.unwrap();
        channel.close();
        channel.ensure_connected(&registry).await.unwrap();

        assert_eq!(
            responder.presented_vau_np(),
            vec![None, Some(Responder::vau_np_for(addr(1)))]
        );
    }

    #[tokio::test]
    async fn test_restart_message() {
        let responder = Responder::new();
        let registry = endpoints(&[addr(1)]);
        let mut channel = channel(&responder, Duration::from_secs(600));
        channel.ensure_connected(&registry).await.unwrap();

        responder.drop_sessions();
        let error = channel
            .send(&medication_request(), &registry, "req-1")
            .await
            .unwrap_err();
        assert_eq!(error, Tee3Error::Restart);
        assert!(error.is_graceful());
    }

    #[tokio::test]
    async fn test_outer_error_renegotiates_and_resends_once() {
        let responder = Responder::new();
        let registry = endpoints(&[addr(1)]);
        let mut channel = channel(&responder, Duration::from_secs(600));
        channel.ensure_connected(&registry).await.unwrap();

        responder.fail_next_outer(503);
        let response = channel
            .send(&medication_request(), &registry, "req-1")
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(responder.handshake_count(), 2);
        assert_eq!(responder.received().len(), 1);
    }

    #[tokio::test]
    async fn test_outer_error_after_renegotiation_fails() {
        let responder = Responder::new();
        let registry = endpoints(&[addr(1)]);
        let mut channel = channel(&responder, Duration::from_secs(600));
        channel.ensure_connected(&registry).await.unwrap();

        responder.fail_next_outer(503);
        responder.fail_next_outer(500);
        let error = channel
            .send(&medication_request(), &registry, "req-1")
            .await
            .unwrap_err();
        assert!(matches!(error, Tee3Error::HandshakeFailed(_)));
    }

    #[tokio::test]
    async fn test_send_requires_ready_channel() {
        let responder = Responder::new();
        let registry = endpoints(&[addr(1)]);
        let mut channel = channel(&responder, Duration::from_secs(600));
        assert_eq!(
            channel
                .send(&medication_request(), &registry, "req-1")
                .await
                .unwrap_err(),
            Tee3Error::NotConnected
        );
    }

    #[tokio::test]
    async fn test_stale_endpoint_detection() {
        let responder = Responder::new();
        let registry = endpoints(&[addr(1)]);
        let mut channel = channel(&responder, Duration::from_secs(600));
        channel.ensure_connected(&registry).await.unwrap();
        assert!(!channel.is_stale(&registry));

        registry.lock().apply(Ok(vec![addr(2)]));
        assert!(channel.is_stale(&registry));
    }
}

//! ePA medication service client over pooled TEE3 channels

use crate::domain::{Kvnr, Tee3Error, UseCase};
use crate::log_retry_attempt;
use crate::tee3::{ChannelLease, InnerRequest, PoolRegistry};
use async_trait::async_trait;
use reqwest::Method;
use std::sync::Arc;

const FHIR_JSON: &str = "application/fhir+json";

/// Inner HTTP response of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpaResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Sends medication operations to one ePA host
#[async_trait]
pub trait EpaTransport: Send {
    /// Posts `payload` to the operation of `use_case` for the insurant
    async fn send(
        &mut self,
        use_case: UseCase,
        kvnr: &Kvnr,
        payload: Vec<u8>,
        request_id: &str,
    ) -> Result<EpaResponse, Tee3Error>;

    /// Returns any channel still held
    async fn finish(&mut self);
}

/// Creates transports for the host an account is routed to
pub trait ClientProvider: Send + Sync {
    fn client(&self, host: &str) -> Box<dyn EpaTransport>;
}

/// [`EpaTransport`] over the pool of one host
///
/// In sticky mode the channel of a successful request is kept for the next
/// one until [`EpaTransport::finish`].
pub struct TransportClient {
    registry: Arc<PoolRegistry>,
    host: String,
    user_agent: String,
    sticky: bool,
    lease: Option<ChannelLease>,
}

impl TransportClient {
    pub fn new(
        registry: Arc<PoolRegistry>,
        host: impl Into<String>,
        user_agent: impl Into<String>,
        sticky: bool,
    ) -> Self {
        Self {
            registry,
            host: host.into(),
            user_agent: user_agent.into(),
            sticky,
            lease: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// True when a channel to the host connects and authorizes
    pub async fn test_connection(&self) -> bool {
        match self.registry.acquire(&self.host).await {
            Ok(lease) => {
                tracing::info!(host = %self.host, endpoint = ?lease.endpoint(), "ePA connection verified");
                lease.release();
                true
            }
            Err(e) => {
                tracing::warn!(host = %self.host, error = %e, "ePA connection test failed");
                false
            }
        }
    }

    fn build_request(
        &self,
        use_case: UseCase,
        kvnr: &Kvnr,
        payload: Vec<u8>,
        request_id: &str,
    ) -> InnerRequest {
        InnerRequest::new(Method::POST, use_case.operation_path())
            .header("x-insurantid", kvnr.as_str())
            .header("x-request-id", request_id)
            .header("content-type", FHIR_JSON)
            .header("accept", FHIR_JSON)
            .header("user-agent", &self.user_agent)
            .body(payload)
    }
}

#[async_trait]
impl EpaTransport for TransportClient {
    /// One delivery attempt
    ///
    /// A restart, reset or truncated stream closes the session and resends
    /// on a fresh one, at most once per known endpoint.
    async fn send(
        &mut self,
        use_case: UseCase,
        kvnr: &Kvnr,
        payload: Vec<u8>,
        request_id: &str,
    ) -> Result<EpaResponse, Tee3Error> {
        let request = self.build_request(use_case, kvnr, payload, request_id);
        let mut lease = match self.lease.take() {
            Some(mut lease) if lease.is_stale() => {
                tracing::debug!(
                    host = %self.host,
                    endpoint = ?lease.endpoint(),
                    "Kept channel points at a removed endpoint, leasing another"
                );
                lease.close();
                lease.release();
                self.registry.acquire(&self.host).await?
            }
            Some(lease) => lease,
            None => self.registry.acquire(&self.host).await?,
        };

        let max_attempts = lease.endpoint_count() + 1;
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            let sent = match lease.ensure_connected().await {
                Ok(()) => lease.send(&request, request_id).await,
                Err(e) => Err(e),
            };
            match sent {
                Ok(response) => break Ok(response),
                Err(e) => {
                    lease.close();
                    if !e.is_graceful() || attempt >= max_attempts {
                        break Err(e);
                    }
                    log_retry_attempt!(attempt, max_attempts, e);
                }
            }
        };

        match result {
            Ok(response) => {
                if self.sticky {
                    self.lease = Some(lease);
                } else {
                    lease.release();
                }
                Ok(EpaResponse {
                    status: response.status.as_u16(),
                    body: response.body,
                })
            }
            Err(e) => {
                tracing::warn!(
                    host = %self.host,
                    use_case = %use_case,
                    request_id,
                    attempts = attempt,
                    error = %e,
                    "ePA request failed"
                );
                lease.release();
                Err(e)
            }
        }
    }

    async fn finish(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
    }
}

/// Hands out [`TransportClient`]s over a shared registry
pub struct RegistryClientProvider {
    registry: Arc<PoolRegistry>,
    user_agent: String,
    sticky: bool,
}

impl RegistryClientProvider {
    pub fn new(registry: Arc<PoolRegistry>, user_agent: impl Into<String>, sticky: bool) -> Self {
        Self {
            registry,
            user_agent: user_agent.into(),
            sticky,
        }
    }
}

impl ClientProvider for RegistryClientProvider {
    fn client(&self, host: &str) -> Box<dyn EpaTransport> {
        Box::new(TransportClient::new(
            self.registry.clone(),
            host,
            self.user_agent.clone(),
            self.sticky,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tee3::{
        ChannelSettings, FixedResolver, InnerResponse, LoopbackTransportFactory, RegistrySettings,
        Responder, StaticSigner,
    };
    use reqwest::StatusCode;
    use std::net::SocketAddr;
    use std::time::Duration;

    const HOST: &str = "epa.test";

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, last], 443))
    }

    async fn registry(responder: &Arc<Responder>, endpoints: Vec<SocketAddr>) -> Arc<PoolRegistry> {
        let registry = Arc::new(PoolRegistry::new(
            Arc::new(LoopbackTransportFactory::new(responder.clone())),
            Arc::new(StaticSigner),
            Arc::new(FixedResolver(endpoints)),
            ChannelSettings {
                user_agent: "exporter-test".to_string(),
                session_lifetime: Duration::from_secs(600),
                production: false,
            },
            RegistrySettings {
                endpoint_retry_timeout: Duration::from_secs(3),
                endpoint_max_retry_timeout: Duration::from_secs(300),
                dns_refresh_interval: Duration::from_secs(60),
                resolve_retry: Duration::from_millis(5),
            },
        ));
        registry.add_host(HOST, 443, 2).await.unwrap();
        registry
    }

    fn kvnr() -> Kvnr {
        Kvnr::new("X123456789").unwrap()
    }

    #[tokio::test]
    async fn test_send_posts_operation_with_headers() {
        let responder = Responder::with_handler(Arc::new(|_: &InnerRequest| {
            InnerResponse::new(StatusCode::CREATED, b"{}".to_vec())
        }));
        let registry = registry(&responder, vec![addr(1)]).await;
        let mut client = TransportClient::new(registry.clone(), HOST, "exporter-test", false);

        let response = client
            .send(UseCase::ProvidePrescription, &kvnr(), b"{}".to_vec(), "req-1")
            .await
            .unwrap();
        assert_eq!(response.status, 201);

        let received = responder.received();
        assert_eq!(received.len(), 1);
        let request = &received[0].request;
        assert_eq!(request.path, UseCase::ProvidePrescription.operation_path());
        assert_eq!(request.headers.get("x-insurantid").unwrap(), "X123456789");
        assert_eq!(request.headers.get("x-request-id").unwrap(), "req-1");
        assert_eq!(request.headers.get("content-type").unwrap(), FHIR_JSON);
        assert_eq!(registry.status(HOST).unwrap().tokens, 2);
    }

    #[tokio::test]
    async fn test_sticky_client_keeps_channel_until_finish() {
        let responder = Responder::new();
        let registry = registry(&responder, vec![addr(1)]).await;
        let mut client = TransportClient::new(registry.clone(), HOST, "exporter-test", true);

        for request_id in ["a", "b", "c"] {
            client
                .send(UseCase::CancelPrescription, &kvnr(), Vec::new(), request_id)
                .await
                .unwrap();
            assert_eq!(registry.status(HOST).unwrap().tokens, 1);
        }
        assert_eq!(responder.handshake_count(), 1);

        client.finish().await;
        assert_eq!(registry.status(HOST).unwrap().tokens, 2);
    }

    #[tokio::test]
    async fn test_sticky_channel_follows_endpoint_refresh() {
        let responder = Responder::new();
        let registry = registry(&responder, vec![addr(1)]).await;
        let mut client = TransportClient::new(registry.clone(), HOST, "exporter-test", true);

        client
            .send(UseCase::CancelPrescription, &kvnr(), Vec::new(), "a")
            .await
            .unwrap();
        let pool = registry.pool(HOST).unwrap();
        pool.refresh_endpoints(&FixedResolver(vec![addr(2)])).await;
        client
            .send(UseCase::CancelPrescription, &kvnr(), Vec::new(), "b")
            .await
            .unwrap();
        client.finish().await;

        let received = responder.received();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].endpoint, addr(1));
        assert_eq!(received[1].endpoint, addr(2));
        assert_eq!(registry.status(HOST).unwrap().tokens, 2);
    }

    #[tokio::test]
    async fn test_restart_is_resent_on_new_session() {
        let responder = Responder::new();
        let registry = registry(&responder, vec![addr(1)]).await;
        let mut client = TransportClient::new(registry.clone(), HOST, "exporter-test", true);

        client
            .send(UseCase::CancelDispensation, &kvnr(), Vec::new(), "a")
            .await
            .unwrap();
        responder.drop_sessions();
        let response = client
            .send(UseCase::CancelDispensation, &kvnr(), Vec::new(), "b")
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(responder.handshake_count(), 2);
        assert_eq!(responder.received().len(), 2);
        client.finish().await;
    }

    #[tokio::test]
    async fn test_failed_reconnect_releases_channel() {
        let responder = Responder::new();
        let registry = registry(&responder, vec![addr(1), addr(2)]).await;
        let mut client = TransportClient::new(registry.clone(), HOST, "exporter-test", true);
        client
            .send(UseCase::CancelPrescription, &kvnr(), Vec::new(), "a")
            .await
            .unwrap();

        responder.drop_sessions();
        responder.set_unreachable(addr(1), true);
        responder.set_unreachable(addr(2), true);
        let result = client
            .send(UseCase::CancelPrescription, &kvnr(), Vec::new(), "b")
            .await;

        assert!(result.is_err());
        let status = registry.status(HOST).unwrap();
        assert_eq!(status.tokens, 2);
        assert_eq!(status.available, 2);
    }

    #[tokio::test]
    async fn test_connection_check() {
        let responder = Responder::new();
        let registry = registry(&responder, vec![addr(1)]).await;

        assert!(TransportClient::new(registry.clone(), HOST, "ua", false).test_connection().await);
        assert!(!TransportClient::new(registry.clone(), "other.test", "ua", false).test_connection().await);
        assert_eq!(registry.status(HOST).unwrap().tokens, 2);
    }

    #[tokio::test]
    async fn test_connection_check_unreachable_host() {
        let responder = Responder::new();
        responder.set_unreachable(addr(1), true);
        let registry = registry(&responder, vec![addr(1)]).await;

        let provider = RegistryClientProvider::new(registry.clone(), "ua", false);
        let mut client = provider.client(HOST);
        let result = client
            .send(UseCase::CancelPrescription, &kvnr(), Vec::new(), "a")
            .await;
        assert!(result.is_err());
        client.finish().await;

        assert!(!TransportClient::new(registry, HOST, "ua", false).test_connection().await);
    }
}

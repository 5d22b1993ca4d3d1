//! Outer HTTPS transport
//!
//! A [`SecureChannel`](super::channel::SecureChannel) talks to exactly one
//! resolved endpoint at a time. [`ReqwestTransport`] pins the host name to
//! that address and checks the server certificate of every response.

use crate::adapters::crypto::CertificateVerifier;
use crate::config::EpaConfig;
use crate::domain::Tee3Error;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// An outer request
#[derive(Debug, Clone)]
pub struct OuterRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// An outer response
#[derive(Debug, Clone)]
pub struct OuterResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl OuterResponse {
    /// Media type without parameters, lowercased
    pub fn content_type(&self) -> Option<String> {
        self.headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase())
    }
}

/// Connection to one endpoint of an ePA host
#[async_trait]
pub trait OuterTransport: Send + Sync {
    /// Binds the transport to `endpoint`, dropping any previous binding
    async fn connect(&mut self, endpoint: SocketAddr) -> Result<(), Tee3Error>;

    fn is_connected(&self) -> bool;

    /// Endpoint the transport is bound to
    fn endpoint(&self) -> Option<SocketAddr>;

    async fn send(&mut self, request: OuterRequest) -> Result<OuterResponse, Tee3Error>;

    fn close(&mut self);
}

/// Creates transports for the channels of a pool
pub trait TransportFactory: Send + Sync {
    fn create(&self, host: &str, port: u16) -> Box<dyn OuterTransport>;
}

/// Timeouts and identity of outer requests
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub scheme: String,
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl TransportSettings {
    pub fn from_config(config: &EpaConfig) -> Self {
        Self {
            scheme: config.scheme.clone(),
            user_agent: config.user_agent.clone(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
        }
    }
}

/// reqwest transport with the host pinned to one address
pub struct ReqwestTransport {
    host: String,
    port: u16,
    settings: Arc<TransportSettings>,
    verifier: Arc<dyn CertificateVerifier>,
    client: Option<Client>,
    endpoint: Option<SocketAddr>,
}

impl ReqwestTransport {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        settings: Arc<TransportSettings>,
        verifier: Arc<dyn CertificateVerifier>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            settings,
            verifier,
            client: None,
            endpoint: None,
        }
    }
}

#[async_trait]
impl OuterTransport for ReqwestTransport {
    async fn connect(&mut self, endpoint: SocketAddr) -> Result<(), Tee3Error> {
        self.close();
        let client = Client::builder()
            .resolve(&self.host, endpoint)
            .connect_timeout(self.settings.connect_timeout)
            .timeout(self.settings.request_timeout)
            .user_agent(self.settings.user_agent.clone())
            .pool_max_idle_per_host(1)
            .tls_info(true)
            .build()
            .map_err(|e| Tee3Error::ConnectionReset(format!("cannot create client: {e}")))?;

        self.client = Some(client);
        self.endpoint = Some(endpoint);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }

    async fn send(&mut self, request: OuterRequest) -> Result<OuterResponse, Tee3Error> {
        let client = self.client.as_ref().ok_or(Tee3Error::NotConnected)?;
        let url = format!(
            "{}://{}:{}{}",
            self.settings.scheme, self.host, self.port, request.path
        );

        let response = client
            .request(request.method, url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if self.settings.scheme == "https" {
            let certificate = response
                .extensions()
                .get::<reqwest::tls::TlsInfo>()
                .and_then(|info| info.peer_certificate());
            self.verifier.verify(certificate)?;
        }

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();

        Ok(OuterResponse {
            status,
            headers,
            body,
        })
    }

    fn close(&mut self) {
        self.client = None;
        self.endpoint = None;
    }
}

fn map_reqwest_error(error: reqwest::Error) -> Tee3Error {
    if error.is_timeout() {
        Tee3Error::Timeout(error.to_string())
    } else if error.is_body() || error.is_decode() {
        Tee3Error::StreamTruncated(error.to_string())
    } else {
        Tee3Error::ConnectionReset(error.to_string())
    }
}

/// Factory for [`ReqwestTransport`]s sharing settings and verifier
pub struct ReqwestTransportFactory {
    settings: Arc<TransportSettings>,
    verifier: Arc<dyn CertificateVerifier>,
}

impl ReqwestTransportFactory {
    pub fn new(config: &EpaConfig, verifier: Arc<dyn CertificateVerifier>) -> Self {
        Self {
            settings: Arc::new(TransportSettings::from_config(config)),
            verifier,
        }
    }
}

impl TransportFactory for ReqwestTransportFactory {
    fn create(&self, host: &str, port: u16) -> Box<dyn OuterTransport> {
        Box::new(ReqwestTransport::new(
            host,
            port,
            self.settings.clone(),
            self.verifier.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::crypto::SystemTrustVerifier;

    fn settings() -> Arc<TransportSettings> {
        Arc::new(TransportSettings {
            scheme: "http".to_string(),
            user_agent: "medication-exporter-test".to_string(),
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
        })
    }

    #[tokio::test]
    async fn test_send_requires_connect() {
        let mut transport =
            ReqwestTransport::new("epa.invalid", 80, settings(), Arc::new(SystemTrustVerifier));
        let request = OuterRequest {
            method: Method::POST,
            path: "/VAU".to_string(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        };
        assert_eq!(
            transport.send(request).await.unwrap_err(),
            Tee3Error::NotConnected
        );
    }

    #[tokio::test]
    async fn test_host_is_pinned_to_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/VAU")
            .match_header("user-agent", "medication-exporter-test")
            .with_status(200)
            .with_header("content-type", "application/json; charset=utf-8")
            .with_body("{}")
            .create_async()
            .await;

        let address = server.socket_address();
        let mut transport = ReqwestTransport::new(
            "epa.invalid",
            address.port(),
            settings(),
            Arc::new(SystemTrustVerifier),
        );
        transport.connect(address).await.unwrap();
        assert_eq!(transport.endpoint(), Some(address));

        let response = transport
            .send(OuterRequest {
                method: Method::POST,
                path: "/VAU".to_string(),
                headers: HeaderMap::new(),
                body: b"m1".to_vec(),
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.status, 200);
        assert_eq!(response.content_type().as_deref(), Some("application/json"));
        assert_eq!(response.body, b"{}");

        transport.close();
        assert!(!transport.is_connected());
    }
}

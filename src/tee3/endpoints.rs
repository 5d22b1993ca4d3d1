//! Resolved endpoints of one ePA host
//!
//! Every address a host name resolves to is an endpoint with its own failure
//! backoff and its own VAU-NP. The list is replaced wholesale on each DNS
//! refresh; data of surviving endpoints is kept.

use crate::domain::Tee3Error;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Upper bound of the random delay added to every endpoint backoff
const MAX_JITTER: Duration = Duration::from_secs(10);

/// Resolves a host name to endpoints
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, Tee3Error>;
}

/// System resolver through `tokio::net::lookup_host`
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsResolver;

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, Tee3Error> {
        let addresses = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Tee3Error::Resolve(format!("{host}: {e}")))?;
        let mut endpoints: Vec<SocketAddr> = Vec::new();
        for address in addresses {
            if !endpoints.contains(&address) {
                endpoints.push(address);
            }
        }
        Ok(endpoints)
    }
}

/// Resolver with a fixed answer, for loopback setups
#[derive(Debug, Clone)]
pub struct FixedResolver(pub Vec<SocketAddr>);

#[async_trait]
impl Resolver for FixedResolver {
    async fn resolve(&self, host: &str, _port: u16) -> Result<Vec<SocketAddr>, Tee3Error> {
        if self.0.is_empty() {
            return Err(Tee3Error::Resolve(host.to_string()));
        }
        Ok(self.0.clone())
    }
}

/// Endpoint bookkeeping a channel reads and updates while connecting
///
/// Implemented by the connection pool over its shared state, so a leased
/// channel never holds a reference to the pool itself.
pub trait EndpointRegistry: Send + Sync {
    fn connect_candidates(&self) -> Vec<SocketAddr>;
    fn contains(&self, endpoint: SocketAddr) -> bool;
    fn mark_failed(&self, endpoint: SocketAddr);
    fn mark_succeeded(&self, endpoint: SocketAddr);
    fn vau_np(&self, endpoint: SocketAddr) -> Option<String>;
    fn set_vau_np(&self, endpoint: SocketAddr, vau_np: String);
}

/// One resolved address
#[derive(Debug, Clone)]
pub struct EndpointData {
    pub endpoint: SocketAddr,
    /// Consecutive connect failures
    pub retry_count: u32,
    /// Earliest time the endpoint may be tried again
    pub next_retry: Instant,
    /// VAU-NP issued by this endpoint
    pub vau_np: Option<String>,
}

impl EndpointData {
    fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            retry_count: 0,
            next_retry: Instant::now(),
            vau_np: None,
        }
    }
}

/// Changes applied by a refresh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshDiff {
    pub added: Vec<SocketAddr>,
    pub removed: Vec<SocketAddr>,
}

impl RefreshDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Endpoints of one host
#[derive(Debug, Clone)]
pub struct EndpointSet {
    host: String,
    port: u16,
    endpoints: Vec<EndpointData>,
    retry_timeout: Duration,
    max_retry_timeout: Duration,
}

impl EndpointSet {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        retry_timeout: Duration,
        max_retry_timeout: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            endpoints: Vec::new(),
            retry_timeout,
            max_retry_timeout,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Resolves the host and applies the result
    pub async fn refresh(&mut self, resolver: &dyn Resolver) -> RefreshDiff {
        let resolved = resolver.resolve(&self.host, self.port).await;
        self.apply(resolved)
    }

    /// Replaces the endpoint list with a resolution result
    ///
    /// Failures and empty results keep the current list.
    pub fn apply(&mut self, resolved: Result<Vec<SocketAddr>, Tee3Error>) -> RefreshDiff {
        let addresses = match resolved {
            Ok(addresses) if !addresses.is_empty() => addresses,
            Ok(_) => {
                tracing::warn!(host = %self.host, "DNS returned no addresses, keeping endpoints");
                return RefreshDiff::default();
            }
            Err(e) => {
                tracing::warn!(host = %self.host, error = %e, "DNS refresh failed, keeping endpoints");
                return RefreshDiff::default();
            }
        };

        let mut previous = std::mem::take(&mut self.endpoints);
        let mut diff = RefreshDiff::default();
        for address in addresses {
            if self.endpoints.iter().any(|e| e.endpoint == address) {
                continue;
            }
            match previous.iter().position(|e| e.endpoint == address) {
                Some(index) => self.endpoints.push(previous.swap_remove(index)),
                None => {
                    diff.added.push(address);
                    self.endpoints.push(EndpointData::new(address));
                }
            }
        }
        diff.removed = previous.into_iter().map(|e| e.endpoint).collect();

        if !diff.is_empty() {
            tracing::info!(
                host = %self.host,
                added = ?diff.added,
                removed = ?diff.removed,
                endpoints = self.endpoints.len(),
                "Endpoints changed"
            );
        }
        diff
    }

    pub fn contains(&self, endpoint: SocketAddr) -> bool {
        self.endpoints.iter().any(|e| e.endpoint == endpoint)
    }

    pub fn snapshot(&self) -> Vec<EndpointData> {
        self.endpoints.clone()
    }

    /// Endpoints to try, in order
    ///
    /// Ready endpoints in random order. When all are backing off, only the
    /// one that becomes ready first.
    pub fn connect_candidates(&self) -> Vec<SocketAddr> {
        let now = Instant::now();
        let mut ready: Vec<SocketAddr> = self
            .endpoints
            .iter()
            .filter(|e| e.next_retry <= now)
            .map(|e| e.endpoint)
            .collect();
        if ready.is_empty() {
            return self
                .endpoints
                .iter()
                .min_by_key(|e| e.next_retry)
                .map(|e| vec![e.endpoint])
                .unwrap_or_default();
        }
        ready.shuffle(&mut rand::thread_rng());
        ready
    }

    /// Backs the endpoint off after a failed connect
    pub fn mark_failed(&mut self, endpoint: SocketAddr) {
        let (retry_timeout, max_retry_timeout) = (self.retry_timeout, self.max_retry_timeout);
        let host = self.host.clone();
        if let Some(data) = self.find_mut(endpoint) {
            data.retry_count = data.retry_count.saturating_add(1);
            let delay = backoff_delay(data.retry_count, retry_timeout, max_retry_timeout)
                + rand::thread_rng().gen_range(Duration::ZERO..MAX_JITTER);
            data.next_retry = Instant::now() + delay;
            if delay >= max_retry_timeout {
                tracing::warn!(
                    host = %host,
                    endpoint = %endpoint,
                    retry_count = data.retry_count,
                    delay_secs = delay.as_secs(),
                    "ePA down, backing off"
                );
            } else {
                tracing::debug!(
                    endpoint = %endpoint,
                    retry_count = data.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Endpoint backing off"
                );
            }
        }
    }

    pub fn mark_succeeded(&mut self, endpoint: SocketAddr) {
        if let Some(data) = self.find_mut(endpoint) {
            data.retry_count = 0;
            data.next_retry = Instant::now();
        }
    }

    pub fn vau_np(&self, endpoint: SocketAddr) -> Option<String> {
        self.endpoints
            .iter()
            .find(|e| e.endpoint == endpoint)
            .and_then(|e| e.vau_np.clone())
    }

    pub fn set_vau_np(&mut self, endpoint: SocketAddr, vau_np: String) {
        let host = self.host.clone();
        if let Some(data) = self.find_mut(endpoint) {
            if data.vau_np.as_deref() != Some(vau_np.as_str()) {
                tracing::info!(host = %host, endpoint = %endpoint, "VAU-NP changed");
                data.vau_np = Some(vau_np);
            }
        }
    }

    fn find_mut(&mut self, endpoint: SocketAddr) -> Option<&mut EndpointData> {
        self.endpoints.iter_mut().find(|e| e.endpoint == endpoint)
    }
}

/// `min(2^retry_count * retry_timeout, max_retry_timeout)`
pub fn backoff_delay(retry_count: u32, retry_timeout: Duration, max_retry_timeout: Duration) -> Duration {
    let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
    retry_timeout
        .checked_mul(factor)
        .unwrap_or(max_retry_timeout)
        .min(max_retry_timeout)
}

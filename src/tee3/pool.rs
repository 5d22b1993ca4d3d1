//! Channel pool of one ePA host
//!
//! A pool owns `N` channels and `N` tokens. [`ConnectionPool::acquire`] waits
//! for a token and hands out a random idle channel as a [`ChannelLease`];
//! releasing the lease returns both. Every lease returns its channel, even
//! when dropped without an explicit release, so the number of idle channels
//! always equals the number of available tokens.

use super::channel::{ChannelSettings, SecureChannel};
use super::endpoints::{EndpointRegistry, EndpointSet, RefreshDiff, Resolver};
use super::http::{InnerRequest, InnerResponse};
use super::transport::TransportFactory;
use crate::adapters::crypto::AuthorizationSigner;
use crate::domain::Tee3Error;
use parking_lot::Mutex;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Semaphore;

struct PoolState {
    available: Vec<SecureChannel>,
    endpoints: EndpointSet,
}

/// State shared between a pool and its leases
struct PoolCore {
    host: String,
    port: u16,
    capacity: usize,
    state: Mutex<PoolState>,
    tokens: Semaphore,
}

impl PoolCore {
    fn return_channel(&self, channel: SecureChannel) {
        self.state.lock().available.push(channel);
        self.tokens.add_permits(1);
    }
}

impl EndpointRegistry for PoolCore {
    fn connect_candidates(&self) -> Vec<SocketAddr> {
        self.state.lock().endpoints.connect_candidates()
    }

    fn contains(&self, endpoint: SocketAddr) -> bool {
        self.state.lock().endpoints.contains(endpoint)
    }

    fn mark_failed(&self, endpoint: SocketAddr) {
        self.state.lock().endpoints.mark_failed(endpoint)
    }

    fn mark_succeeded(&self, endpoint: SocketAddr) {
        self.state.lock().endpoints.mark_succeeded(endpoint)
    }

    fn vau_np(&self, endpoint: SocketAddr) -> Option<String> {
        self.state.lock().endpoints.vau_np(endpoint)
    }

    fn set_vau_np(&self, endpoint: SocketAddr, vau_np: String) {
        self.state.lock().endpoints.set_vau_np(endpoint, vau_np)
    }
}

/// Point-in-time view of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Idle channels
    pub available: usize,
    /// Tokens not held by a lease
    pub tokens: usize,
    /// Channels owned by the pool
    pub capacity: usize,
    /// Known endpoints
    pub endpoints: usize,
}

/// Fixed-size pool of secure channels to one host
pub struct ConnectionPool {
    core: Arc<PoolCore>,
}

impl ConnectionPool {
    /// Creates `channel_count` disconnected channels over `endpoints`
    pub fn new(
        endpoints: EndpointSet,
        channel_count: usize,
        settings: Arc<ChannelSettings>,
        signer: Arc<dyn AuthorizationSigner>,
        transports: &dyn TransportFactory,
    ) -> Self {
        let host = endpoints.host().to_string();
        let port = endpoints.port();
        let available = (0..channel_count)
            .map(|id| {
                SecureChannel::new(
                    id,
                    host.clone(),
                    settings.clone(),
                    signer.clone(),
                    transports.create(&host, port),
                )
            })
            .collect();

        Self {
            core: Arc::new(PoolCore {
                host,
                port,
                capacity: channel_count,
                state: Mutex::new(PoolState {
                    available,
                    endpoints,
                }),
                tokens: Semaphore::new(channel_count),
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.core.host
    }

    /// Leases a connected channel
    ///
    /// Waiting for a token is cancellation safe. A channel bound to an
    /// endpoint that disappeared from DNS is closed and another one drawn.
    /// A connect failure returns the channel and propagates.
    pub async fn acquire(&self) -> Result<ChannelLease, Tee3Error> {
        loop {
            let permit = self
                .core
                .tokens
                .acquire()
                .await
                .map_err(|_| Tee3Error::PoolClosed(self.core.host.clone()))?;
            permit.forget();

            let channel = {
                let mut state = self.core.state.lock();
                if state.available.is_empty() {
                    None
                } else {
                    let index = rand::thread_rng().gen_range(0..state.available.len());
                    Some(state.available.swap_remove(index))
                }
            };
            let Some(channel) = channel else {
                self.core.tokens.add_permits(1);
                return Err(Tee3Error::PoolClosed(self.core.host.clone()));
            };

            let mut lease = ChannelLease {
                channel: Some(channel),
                core: self.core.clone(),
            };
            if lease.is_stale() {
                tracing::debug!(host = %self.core.host, "Dropping channel bound to a removed endpoint");
                lease.close();
                lease.release();
                continue;
            }

            return match lease.ensure_connected().await {
                Ok(()) => Ok(lease),
                Err(e) => {
                    lease.release();
                    Err(e)
                }
            };
        }
    }

    /// Returns a lease to the pool
    pub fn release(&self, lease: ChannelLease) {
        lease.release();
    }

    /// Re-resolves the host and applies the new endpoint list
    pub async fn refresh_endpoints(&self, resolver: &dyn Resolver) -> RefreshDiff {
        let resolved = resolver.resolve(&self.core.host, self.core.port).await;
        self.core.state.lock().endpoints.apply(resolved)
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.core.state.lock();
        PoolStatus {
            available: state.available.len(),
            tokens: self.core.tokens.available_permits(),
            capacity: self.core.capacity,
            endpoints: state.endpoints.len(),
        }
    }

    /// Closes the session of every idle channel
    pub fn close_idle(&self) {
        let mut state = self.core.state.lock();
        for channel in state.available.iter_mut() {
            channel.close();
        }
    }
}

/// Exclusive use of one channel
///
/// Dropping a lease without [`ChannelLease::release`] still returns the
/// channel, unclosed, and logs a warning.
pub struct ChannelLease {
    channel: Option<SecureChannel>,
    core: Arc<PoolCore>,
}

impl ChannelLease {
    pub fn host(&self) -> &str {
        &self.core.host
    }

    /// Endpoints currently known for the host
    pub fn endpoint_count(&self) -> usize {
        self.core.state.lock().endpoints.len()
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.channel.as_ref().and_then(SecureChannel::endpoint)
    }

    /// True when the channel is bound to an endpoint no longer listed for the host
    pub(crate) fn is_stale(&self) -> bool {
        self.channel
            .as_ref()
            .map_or(false, |channel| channel.is_stale(self.core.as_ref()))
    }

    pub async fn ensure_connected(&mut self) -> Result<(), Tee3Error> {
        let channel = self.channel.as_mut().ok_or(Tee3Error::NotConnected)?;
        channel.ensure_connected(self.core.as_ref()).await
    }

    pub async fn send(
        &mut self,
        request: &InnerRequest,
        request_id: &str,
    ) -> Result<InnerResponse, Tee3Error> {
        let channel = self.channel.as_mut().ok_or(Tee3Error::NotConnected)?;
        channel.send(request, self.core.as_ref(), request_id).await
    }

    pub fn close(&mut self) {
        if let Some(channel) = self.channel.as_mut() {
            channel.close();
        }
    }

    /// Returns the channel and its token
    pub fn release(mut self) {
        if let Some(mut channel) = self.channel.take() {
            if channel.is_stale(self.core.as_ref()) {
                channel.close();
            }
            self.core.return_channel(channel);
        }
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            tracing::warn!(
                host = %self.core.host,
                channel = channel.id(),
                "Channel lease dropped without release"
            );
            self.core.return_channel(channel);
        }
    }
}

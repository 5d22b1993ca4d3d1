//! Connection pools of every registered ePA host

use super::channel::ChannelSettings;
use super::endpoints::{EndpointSet, Resolver};
use super::pool::{ChannelLease, ConnectionPool, PoolStatus};
use super::transport::TransportFactory;
use crate::adapters::crypto::AuthorizationSigner;
use crate::config::EpaConfig;
use crate::domain::Tee3Error;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Endpoint and DNS timing of the registry
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub endpoint_retry_timeout: Duration,
    pub endpoint_max_retry_timeout: Duration,
    pub dns_refresh_interval: Duration,
    /// Delay between initial resolution attempts
    pub resolve_retry: Duration,
}

impl RegistrySettings {
    pub fn from_config(config: &EpaConfig) -> Self {
        Self {
            endpoint_retry_timeout: Duration::from_secs(config.endpoint_retry_timeout_seconds),
            endpoint_max_retry_timeout: Duration::from_secs(
                config.endpoint_max_retry_timeout_seconds,
            ),
            dns_refresh_interval: Duration::from_secs(config.dns_refresh_interval_seconds),
            resolve_retry: Duration::from_secs(config.resolve_retry_seconds),
        }
    }
}

/// Routes channel requests to the pool of the named host
///
/// Every pool gets a background task re-resolving its host on a fixed
/// interval. [`PoolRegistry::shutdown`] stops those tasks and aborts pending
/// registrations.
pub struct PoolRegistry {
    pools: RwLock<HashMap<String, Arc<ConnectionPool>>>,
    transports: Arc<dyn TransportFactory>,
    signer: Arc<dyn AuthorizationSigner>,
    resolver: Arc<dyn Resolver>,
    channel_settings: Arc<ChannelSettings>,
    settings: RegistrySettings,
    shutdown: watch::Sender<bool>,
    refresh_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolRegistry {
    pub fn new(
        transports: Arc<dyn TransportFactory>,
        signer: Arc<dyn AuthorizationSigner>,
        resolver: Arc<dyn Resolver>,
        channel_settings: ChannelSettings,
        settings: RegistrySettings,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            pools: RwLock::new(HashMap::new()),
            transports,
            signer,
            resolver,
            channel_settings: Arc::new(channel_settings),
            settings,
            shutdown,
            refresh_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Registers a host and waits until its pool is usable
    ///
    /// Resolution is retried every `resolve_retry` until it returns at least
    /// one endpoint. Registering a known host again is a no-op.
    ///
    /// # Errors
    ///
    /// [`Tee3Error::PoolClosed`] when the registry shuts down first.
    pub async fn add_host(
        &self,
        host: &str,
        port: u16,
        channel_count: usize,
    ) -> Result<(), Tee3Error> {
        if self.pools.read().contains_key(host) {
            return Ok(());
        }

        let mut shutdown = self.shutdown.subscribe();
        let addresses = loop {
            if *shutdown.borrow() {
                return Err(Tee3Error::PoolClosed(host.to_string()));
            }
            match self.resolver.resolve(host, port).await {
                Ok(addresses) if !addresses.is_empty() => break addresses,
                Ok(_) => tracing::warn!(host, "Host resolved to no endpoints, retrying"),
                Err(e) => tracing::warn!(host, error = %e, "Failed to resolve host, retrying"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.resolve_retry) => {}
                _ = shutdown.changed() => {
                    return Err(Tee3Error::PoolClosed(host.to_string()));
                }
            }
        };

        let mut endpoints = EndpointSet::new(
            host,
            port,
            self.settings.endpoint_retry_timeout,
            self.settings.endpoint_max_retry_timeout,
        );
        endpoints.apply(Ok(addresses));
        let pool = Arc::new(ConnectionPool::new(
            endpoints,
            channel_count,
            self.channel_settings.clone(),
            self.signer.clone(),
            self.transports.as_ref(),
        ));

        {
            let mut pools = self.pools.write();
            if pools.contains_key(host) {
                return Ok(());
            }
            pools.insert(host.to_string(), pool.clone());
        }

        let task = self.spawn_refresh(pool);
        self.refresh_tasks.lock().push(task);

        tracing::info!(host, port, channel_count, "Registered ePA host");
        Ok(())
    }

    fn spawn_refresh(&self, pool: Arc<ConnectionPool>) -> JoinHandle<()> {
        let resolver = self.resolver.clone();
        let interval = self.settings.dns_refresh_interval;
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.refresh_endpoints(resolver.as_ref()).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!(host = pool.host(), "Endpoint refresh stopped");
        })
    }

    /// Leases a channel of the named host
    pub async fn acquire(&self, host: &str) -> Result<ChannelLease, Tee3Error> {
        let pool = self
            .pool(host)
            .ok_or_else(|| Tee3Error::UnknownHost(host.to_string()))?;
        pool.acquire().await
    }

    pub fn pool(&self, host: &str) -> Option<Arc<ConnectionPool>> {
        self.pools.read().get(host).cloned()
    }

    /// Registered hosts, sorted
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.pools.read().keys().cloned().collect();
        hosts.sort();
        hosts
    }

    pub fn status(&self, host: &str) -> Option<PoolStatus> {
        self.pool(host).map(|pool| pool.status())
    }

    /// Endpoints currently known for the host, 0 when unregistered
    pub fn endpoint_count(&self, host: &str) -> usize {
        self.status(host).map_or(0, |status| status.endpoints)
    }

    /// Stops the refresh tasks and closes idle sessions
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.refresh_tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Endpoint refresh task failed");
            }
        }
        let pools: Vec<Arc<ConnectionPool>> = self.pools.read().values().cloned().collect();
        for pool in pools {
            pool.close_idle();
        }
        tracing::info!("Connection pools shut down");
    }
}

//! CLI command implementations
//!
//! This module contains all CLI command implementations and the wiring they
//! share.

pub mod check_connection;
pub mod run;
pub mod validate;

use crate::adapters::crypto::{create_verifier, JwtAuthorizationSigner};
use crate::config::ExporterConfig;
use crate::domain::{Result, Tee3Error};
use crate::tee3::{
    ChannelSettings, DnsResolver, PoolRegistry, RegistrySettings, ReqwestTransportFactory,
};
use std::sync::Arc;
use tokio::sync::watch;

/// Builds the pool registry for the configured ePA hosts
///
/// No host is registered yet; see [`register_hosts`].
///
/// # Errors
///
/// Returns an error when the authorization key cannot be loaded or the
/// certificate pins are malformed
pub(crate) fn build_registry(config: &ExporterConfig) -> Result<Arc<PoolRegistry>> {
    let verifier = create_verifier(&config.epa)?;
    let signer = JwtAuthorizationSigner::from_file(
        &config.keys.authorization_key_path,
        config.keys.telematik_id.clone(),
    )?;

    Ok(Arc::new(PoolRegistry::new(
        Arc::new(ReqwestTransportFactory::new(&config.epa, verifier)),
        Arc::new(signer),
        Arc::new(DnsResolver),
        ChannelSettings::from_config(&config.epa, config.is_production()),
        RegistrySettings::from_config(&config.epa),
    )))
}

/// Registers every configured host, in order
///
/// Returns `Ok(false)` when shutdown was signalled before all hosts resolved.
pub(crate) async fn register_hosts(
    registry: &PoolRegistry,
    config: &ExporterConfig,
    shutdown_signal: &mut watch::Receiver<bool>,
) -> std::result::Result<bool, Tee3Error> {
    for host in &config.epa.hosts {
        if *shutdown_signal.borrow() {
            return Ok(false);
        }
        tracing::info!(
            host = %host.host,
            port = host.port,
            channels = host.connection_count,
            "Registering ePA host"
        );
        tokio::select! {
            registered = registry.add_host(&host.host, host.port, host.connection_count) => registered?,
            _ = shutdown_signal.changed() => return Ok(false),
        }
    }
    Ok(true)
}

//! Run command implementation
//!
//! Starts the worker loops and exports pending medication events until a
//! shutdown signal arrives.

use super::{build_registry, register_hosts};
use crate::adapters::codec::JsonPayloadCodec;
use crate::adapters::crypto::HkdfKeyDerivation;
use crate::adapters::database::{create_memory_store, create_store, StoreHandles};
use crate::adapters::epa::HttpAccountLookup;
use crate::config::{decode_base64_secret, load_config, ExporterConfig};
use crate::core::export::{
    EventDecoder, EventDispatcher, KvnrProcessor, ProcessorSettings, RegistryClientProvider,
    TransportClient,
};
use crate::core::scheduler::{Scheduler, SchedulerSettings};
use crate::domain::{ExporterError, Result};
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Arguments for the run command
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Keep events in memory instead of PostgreSQL (demo and local testing)
    #[arg(long)]
    pub memory_store: bool,

    /// Override the number of worker loops
    #[arg(long)]
    pub workers: Option<usize>,
}

impl RunArgs {
    /// Execute the run command
    pub async fn execute(
        &self,
        config_path: &str,
        mut shutdown_signal: watch::Receiver<bool>,
    ) -> anyhow::Result<i32> {
        tracing::info!("Starting run command");

        let mut config = match load_config(config_path) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load configuration");
                eprintln!("Failed to load configuration: {e}");
                return Ok(2); // Configuration error exit code
            }
        };

        if let Some(workers) = self.workers {
            tracing::info!(workers, "Overriding worker count from CLI");
            config.exporter.worker_count = workers;
            if let Err(e) = config.validate() {
                eprintln!("Configuration validation failed: {e}");
                return Ok(2);
            }
        }

        let keys = match decode_base64_secret(&config.keys.master_key)
            .map_err(ExporterError::Configuration)
            .and_then(HkdfKeyDerivation::new)
        {
            Ok(keys) => Arc::new(keys),
            Err(e) => {
                tracing::error!(error = %e, "Invalid master key");
                eprintln!("Invalid master key: {e}");
                return Ok(2);
            }
        };

        let lookup = match HttpAccountLookup::new(&config.epa) {
            Ok(lookup) => Arc::new(lookup),
            Err(e) => {
                tracing::error!(error = %e, "Failed to build the account lookup");
                eprintln!("Failed to build the account lookup: {e}");
                return Ok(2);
            }
        };

        let registry = match build_registry(&config) {
            Ok(registry) => registry,
            Err(e) => {
                tracing::error!(error = %e, "Failed to build the TEE3 transport");
                eprintln!("Failed to build the TEE3 transport: {e}");
                return Ok(2);
            }
        };

        let (store, audit) = match self.open_store(&config).await {
            Ok(handles) => handles,
            Err(e) => {
                tracing::error!(error = %e, "Failed to open the event store");
                eprintln!("Failed to open the event store: {e}");
                return Ok(4); // Connection error exit code
            }
        };
        if let Err(e) = store.health_check().await {
            tracing::error!(error = %e, "Event store health check failed");
            eprintln!("Event store health check failed: {e}");
            return Ok(4);
        }

        match register_hosts(&registry, &config, &mut shutdown_signal).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!("Shutdown requested during startup");
                registry.shutdown().await;
                return Ok(0);
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to register ePA hosts");
                eprintln!("Failed to register ePA hosts: {e}");
                registry.shutdown().await;
                return Ok(4);
            }
        }

        // An unreachable host is not fatal; its KVNRs are rescheduled
        for host in registry.hosts() {
            let client = TransportClient::new(
                registry.clone(),
                host.clone(),
                config.epa.user_agent.clone(),
                false,
            );
            if !client.test_connection().await {
                tracing::warn!(host = %host, "ePA host not reachable, starting workers anyway");
            }
        }

        let codec = Arc::new(JsonPayloadCodec);
        let processor = Arc::new(KvnrProcessor::new(
            store,
            lookup,
            EventDecoder::new(keys, codec.clone()),
            EventDispatcher::new(codec, audit),
            Arc::new(RegistryClientProvider::new(
                registry.clone(),
                config.epa.user_agent.clone(),
                config.epa.sticky_channels,
            )),
            ProcessorSettings::from_config(&config.exporter),
        ));

        let scheduler = Scheduler::start(processor, SchedulerSettings::from_config(&config.exporter));
        let handle = scheduler.handle();
        println!(
            "🚀 Exporting with {} workers, press Ctrl+C to stop",
            config.exporter.worker_count
        );

        while !*shutdown_signal.borrow() {
            if shutdown_signal.changed().await.is_err() {
                break;
            }
        }
        handle.shutdown();

        let shutdown_timeout = Duration::from_secs(config.exporter.shutdown_timeout_secs);
        let exit_code = match tokio::time::timeout(shutdown_timeout, scheduler.join()).await {
            Ok(processed) => {
                println!("✅ Stopped after processing {processed} KVNRs");
                0
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = config.exporter.shutdown_timeout_secs,
                    "Workers did not stop in time, abandoning in-flight KVNRs"
                );
                eprintln!("⚠️  Workers did not stop in time; their leases expire on their own");
                5 // Fatal error exit code
            }
        };

        registry.shutdown().await;
        Ok(exit_code)
    }

    async fn open_store(&self, config: &ExporterConfig) -> Result<StoreHandles> {
        if self.memory_store {
            Ok(create_memory_store())
        } else {
            create_store(&config.database).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_defaults() {
        let args = RunArgs::default();
        assert!(!args.memory_store);
        assert!(args.workers.is_none());
    }

    #[tokio::test]
    async fn test_missing_config_is_config_error() {
        let (_tx, rx) = watch::channel(false);
        let code = RunArgs::default()
            .execute("/nonexistent/medication-exporter.toml", rx)
            .await
            .unwrap();
        assert_eq!(code, 2);
    }
}

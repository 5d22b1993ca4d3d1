//! Check connection command implementation
//!
//! Establishes one TEE3 channel per configured ePA host (handshake plus
//! authorization) and reports the pool state. `--self-test` runs the same
//! path against the in-process responder instead.

use super::{build_registry, register_hosts};
use crate::config::load_config;
use crate::core::export::{EpaTransport, TransportClient};
use crate::domain::{Kvnr, UseCase};
use crate::tee3::{
    ChannelSettings, FixedResolver, LoopbackTransportFactory, PoolRegistry, RegistrySettings,
    Responder, StaticSigner,
};
use clap::Args;
use futures::future::join_all;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

const SELF_TEST_HOST: &str = "epa.loopback";

/// Arguments for the check-connection command
#[derive(Args, Debug)]
pub struct CheckConnectionArgs {
    /// Only check this host
    #[arg(long)]
    pub host: Option<String>,

    /// Give up on a host after this many seconds
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,

    /// Exercise handshake, authorization and one encrypted request against
    /// an in-process responder; no configuration or network needed
    #[arg(long)]
    pub self_test: bool,
}

impl Default for CheckConnectionArgs {
    fn default() -> Self {
        Self {
            host: None,
            timeout_secs: 30,
            self_test: false,
        }
    }
}

impl CheckConnectionArgs {
    /// Execute the check-connection command
    pub async fn execute(
        &self,
        config_path: &str,
        mut shutdown_signal: watch::Receiver<bool>,
    ) -> anyhow::Result<i32> {
        if self.self_test {
            return self.run_self_test().await;
        }

        println!("🔍 Checking ePA connections from: {config_path}");
        println!();

        let mut config = match load_config(config_path) {
            Ok(c) => c,
            Err(e) => {
                println!("❌ Failed to load configuration file");
                println!("   Error: {e}");
                return Ok(2); // Configuration error exit code
            }
        };
        if let Some(host) = &self.host {
            config.epa.hosts.retain(|h| &h.host == host);
            if config.epa.hosts.is_empty() {
                println!("❌ Host {host} is not configured");
                return Ok(2);
            }
        }

        let registry = match build_registry(&config) {
            Ok(registry) => registry,
            Err(e) => {
                println!("❌ Failed to build the TEE3 transport");
                println!("   Error: {e}");
                return Ok(2);
            }
        };

        let registered = tokio::time::timeout(
            Duration::from_secs(self.timeout_secs),
            register_hosts(&registry, &config, &mut shutdown_signal),
        )
        .await;
        match registered {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                registry.shutdown().await;
                return Ok(0);
            }
            Ok(Err(e)) => {
                println!("❌ Failed to register ePA hosts: {e}");
                registry.shutdown().await;
                return Ok(4); // Connection error exit code
            }
            Err(_) => {
                println!("❌ Host resolution did not finish within {}s", self.timeout_secs);
                registry.shutdown().await;
                return Ok(4);
            }
        }

        // Hosts are checked concurrently so one slow host does not hold up the report
        let checks = registry.hosts().into_iter().map(|host| {
            let client = TransportClient::new(
                registry.clone(),
                host.clone(),
                config.epa.user_agent.clone(),
                false,
            );
            let timeout = Duration::from_secs(self.timeout_secs);
            async move {
                let connected = tokio::time::timeout(timeout, client.test_connection())
                    .await
                    .unwrap_or(false);
                (host, connected)
            }
        });
        let results = join_all(checks).await;

        let mut failures = 0;
        for (host, connected) in results {
            print_host(&registry, &host, connected);
            if !connected {
                failures += 1;
            }
        }

        registry.shutdown().await;
        println!();
        if failures == 0 {
            println!("✅ All ePA hosts reachable");
            Ok(0)
        } else {
            println!("⚠️  {failures} ePA host(s) unreachable");
            Ok(4)
        }
    }

    async fn run_self_test(&self) -> anyhow::Result<i32> {
        println!("🔍 TEE3 self-test against the in-process responder");
        println!();

        let responder = Responder::new();
        let endpoint = SocketAddr::from((Ipv4Addr::LOCALHOST, 443));
        let registry = Arc::new(PoolRegistry::new(
            Arc::new(LoopbackTransportFactory::new(responder.clone())),
            Arc::new(StaticSigner),
            Arc::new(FixedResolver(vec![endpoint])),
            ChannelSettings {
                user_agent: "medication-exporter-self-test".to_string(),
                session_lifetime: Duration::from_secs(600),
                production: false,
            },
            RegistrySettings {
                endpoint_retry_timeout: Duration::from_secs(1),
                endpoint_max_retry_timeout: Duration::from_secs(10),
                dns_refresh_interval: Duration::from_secs(60),
                resolve_retry: Duration::from_millis(100),
            },
        ));
        registry.add_host(SELF_TEST_HOST, 443, 1).await?;

        let mut client = TransportClient::new(
            registry.clone(),
            SELF_TEST_HOST,
            "medication-exporter-self-test",
            true,
        );
        let connected = client.test_connection().await;
        print_host(&registry, SELF_TEST_HOST, connected);

        let exchanged = if connected {
            let kvnr = Kvnr::new("X000000000").map_err(anyhow::Error::msg)?;
            let request_id = Uuid::new_v4().to_string();
            let response = client
                .send(UseCase::CancelPrescription, &kvnr, b"{}".to_vec(), &request_id)
                .await;
            client.finish().await;
            match response {
                Ok(response) => {
                    println!("  Encrypted request: HTTP {}", response.status);
                    (200..300).contains(&response.status)
                }
                Err(e) => {
                    println!("  Encrypted request failed: {e}");
                    false
                }
            }
        } else {
            false
        };
        println!("  Handshakes: {}", responder.handshake_count());

        registry.shutdown().await;
        println!();
        if exchanged {
            println!("✅ Self-test passed");
            Ok(0)
        } else {
            println!("❌ Self-test failed");
            Ok(5) // Fatal error exit code
        }
    }
}

fn print_host(registry: &PoolRegistry, host: &str, connected: bool) {
    let mark = if connected { "✅" } else { "❌" };
    println!("{mark} {host}");
    if let Some(status) = registry.status(host) {
        println!(
            "  Endpoints: {}, channels: {} ({} idle, {} free)",
            status.endpoints, status.capacity, status.available, status.tokens
        );
    }
}

//! Validate config command implementation
//!
//! This module implements the `validate-config` command for validating
//! the exporter configuration file.

use crate::adapters::crypto::{create_verifier, JwtAuthorizationSigner};
use crate::config::{decode_base64_secret, load_config, ExporterConfig, TlsVerification};
use clap::Args;
use secrecy::ExposeSecret;

/// Arguments for the validate-config command
#[derive(Args, Debug, Default)]
pub struct ValidateArgs {
    /// Also load the authorization key and decode the master key
    #[arg(long)]
    pub check_keys: bool,
}

impl ValidateArgs {
    /// Execute the validate-config command
    pub async fn execute(&self, config_path: &str) -> anyhow::Result<i32> {
        tracing::info!(config_path = %config_path, "Validating configuration");

        println!("🔍 Validating configuration file: {config_path}");
        println!();

        // load_config validates every section before returning
        let config = match load_config(config_path) {
            Ok(c) => {
                println!("✅ Configuration is valid");
                c
            }
            Err(e) => {
                println!("❌ Configuration validation failed");
                println!("   Error: {e}");
                return Ok(2); // Configuration error exit code
            }
        };

        if self.check_keys {
            if let Err(message) = check_keys(&config) {
                println!("❌ Key material rejected");
                println!("   Error: {message}");
                return Ok(2);
            }
            println!("✅ Key material loaded");
        }

        print_summary(&config);
        Ok(0)
    }
}

fn check_keys(config: &ExporterConfig) -> Result<(), String> {
    let master_key = decode_base64_secret(&config.keys.master_key)?;
    if master_key.len() < 32 {
        return Err(format!(
            "keys.master_key must decode to at least 32 bytes, got {}",
            master_key.len()
        ));
    }
    JwtAuthorizationSigner::from_file(
        &config.keys.authorization_key_path,
        config.keys.telematik_id.clone(),
    )
    .map_err(|e| e.to_string())?;
    create_verifier(&config.epa).map_err(|e| e.to_string())?;
    Ok(())
}

fn print_summary(config: &ExporterConfig) {
    println!();
    println!("Configuration Summary:");
    println!("  Environment: {:?}", config.environment);
    println!("  Log Level: {}", config.application.log_level);
    let connection: &str = config.database.connection_string.expose_secret().as_ref();
    println!(
        "  Event Store: {}",
        connection.split('@').next_back().unwrap_or("***")
    );
    println!("  Workers: {}", config.exporter.worker_count);
    println!("  Max Retries: {}", config.exporter.max_retries);
    println!(
        "  Conflict Wait: {} minutes",
        config.exporter.conflict_wait_minutes
    );
    for host in &config.epa.hosts {
        println!(
            "  ePA Host: {}:{} ({} channels)",
            host.host, host.port, host.connection_count
        );
    }
    println!("  Sticky Channels: {}", config.epa.sticky_channels);
    let tls = match config.epa.tls_verification {
        TlsVerification::System => "system trust store".to_string(),
        TlsVerification::Pinned => format!(
            "{} pinned certificate(s)",
            config.epa.pinned_certificate_sha256.len()
        ),
    };
    println!("  TLS Verification: {tls}");
    println!("  Telematik-ID: {}", config.keys.telematik_id);
    println!();
}

// Medication Exporter - ePA medication event export over TEE3
// Copyright (c) 2025 Medication Exporter Contributors
// Licensed under the MIT License

//! # Medication Exporter
//!
//! Exports dispensed and prescribed medication events from the e-prescription
//! event store into the insurant's electronic patient record (ePA). Every
//! request to the ePA travels through a TEE3 channel: an end-to-end encrypted
//! session tunnelled inside ordinary HTTPS.
//!
//! ## Overview
//!
//! - **Claiming** KVNRs (insurant numbers) with pending events from the store
//! - **Decoding** the encrypted event rows into typed export events
//! - **Routing** each insurant to the ePA host holding the account
//! - **Delivering** the events of one prescription in order, over pooled
//!   TEE3 channels
//! - **Classifying** each response into delete, dead-letter, retry, defer or
//!   purge, and auditing every attempt
//!
//! ## Architecture
//!
//! - [`cli`] - Command-line interface and argument parsing
//! - [`core`] - Export pipeline (decoder, dispatcher, processor) and worker scheduling
//! - [`tee3`] - Secure channel, endpoint bookkeeping, connection pools
//! - [`adapters`] - Event store, account lookup, key material, payload codec
//! - [`domain`] - Core domain types and errors
//! - [`config`] - Configuration management
//! - [`logging`] - Structured logging and observability
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use medication_exporter::tee3::{
//!     ChannelSettings, DnsResolver, PoolRegistry, RegistrySettings, ReqwestTransportFactory,
//! };
//! use medication_exporter::adapters::crypto::{create_verifier, JwtAuthorizationSigner};
//! use medication_exporter::config::load_config;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("medication-exporter.toml")?;
//!
//! let registry = PoolRegistry::new(
//!     Arc::new(ReqwestTransportFactory::new(&config.epa, create_verifier(&config.epa)?)),
//!     Arc::new(JwtAuthorizationSigner::from_file(
//!         &config.keys.authorization_key_path,
//!         config.keys.telematik_id.clone(),
//!     )?),
//!     Arc::new(DnsResolver),
//!     ChannelSettings::from_config(&config.epa, config.is_production()),
//!     RegistrySettings::from_config(&config.epa),
//! );
//! for host in &config.epa.hosts {
//!     registry.add_host(&host.host, host.port, host.connection_count).await?;
//! }
//!
//! let lease = registry.acquire(&config.epa.hosts[0].host).await?;
//! println!("Connected to {:?}", lease.endpoint());
//! lease.release();
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Library code returns [`domain::ExporterError`]; TEE3 failures are
//! [`domain::Tee3Error`], which tells graceful session losses (restart,
//! reset, truncation) apart from hard failures:
//!
//! ```rust
//! use medication_exporter::domain::Tee3Error;
//!
//! assert!(Tee3Error::Restart.is_graceful());
//! assert!(!Tee3Error::OuterResponseNotOk(502).is_graceful());
//! ```
//!
//! ## Logging
//!
//! Structured logging goes through the `tracing` crate. Insurant numbers are
//! only ever logged hashed or masked.

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod logging;
pub mod tee3;

//! Configuration management.
//!
//! TOML configuration files with support for:
//! - Environment variable substitution (`${VAR_NAME}`)
//! - `MEDEXPORT_<SECTION>_<KEY>` overrides
//! - Default values for optional settings
//! - Per-section validation
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use medication_exporter::config::load_config;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("medication-exporter.toml")?;
//!
//! println!("Workers: {}", config.exporter.worker_count);
//! for host in &config.epa.hosts {
//!     println!("ePA host: {}:{} ({} channels)", host.host, host.port, host.connection_count);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Example configuration
//!
//! ```toml
//! environment = "production"
//!
//! [database]
//! connection_string = "${MEDEXPORT_DATABASE_URL}"
//!
//! [exporter]
//! worker_count = 8
//! max_retries = 10
//!
//! [[epa.hosts]]
//! host = "epa-as-1.epa4all.de"
//! connection_count = 8
//!
//! [keys]
//! master_key = "${MEDEXPORT_MASTER_KEY}"
//! authorization_key_path = "/run/secrets/authz.pem"
//! telematik_id = "9-E-Rezept-Fachdienst"
//! ```

pub mod loader;
pub mod schema;
pub mod secret;

// Re-export commonly used types
pub use loader::load_config;
pub use schema::{
    ApplicationConfig, DatabaseConfig, EpaConfig, EpaHostConfig, Environment, ExportConfig,
    ExporterConfig, KeysConfig, LoggingConfig, TlsVerification,
};
pub use secret::{decode_base64_secret, secret_string, SecretString, SecretValue};

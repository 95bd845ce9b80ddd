//! Outstation Broker Library
//!
//! Certificate-authenticated connection broker that provisions one virtual
//! outstation per client connection.
//!
//! # Flow
//!
//! 1. The [`relay`] terminates TLS and extracts the client's certificate chain.
//! 2. [`broker::Broker::authorize`] resolves the certificate's subject DN to a
//!    tenant server, builds the tenant's [`trust::TrustPolicy`], loads the
//!    server's points, reserves a port and provisions a backend on it.
//! 3. The relay validates the chain against the trust policy, enables the
//!    backend and shuttles bytes until either side closes.
//! 4. Stopping the connection stops the backend and returns its port.
//!
//! # Features
//!
//! - **Per-connection backends**: each client gets a fresh [`outstation`]
//!   bound to a port of its own
//! - **Tenant-scoped trust**: client chains are validated only against the
//!   CAs of the tenant the certificate is bound to
//! - **Pluggable collaborators**: configuration, telemetry, instruction queue,
//!   port allocation and backend provisioning are all traits

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod authorization;
pub mod backend;
pub mod broker;
pub mod certs;
pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod outstation;
pub mod points;
pub mod ports;
pub mod relay;
pub mod store;
pub mod trust;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`. `format` selects `json` output;
/// anything else yields human-readable text.
///
/// # Errors
///
/// Returns `Error::Config` if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Config(format!("Cannot install tracing subscriber: {e}")))
}

//! identity-mesh
//!
//! Identity-based mutual authentication and allow-list authorization for
//! service-to-service calls.
//!
//! # Features
//!
//! - **Identity cache**: certificate + trust bundle snapshots, refreshed from
//!   an identity source and swapped atomically on rotation
//! - **Authentication policy**: exact-match allow-lists for callers and callees
//! - **mTLS transport**: rustls servers and clients that enforce the policy
//!   inside the handshake
//! - **Interceptor pipeline**: auth, identity propagation, logging and
//!   metrics, in that order
//! - **Health monitor**: concurrent liveness/readiness checks of the identity
//!   infrastructure

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod health;
pub mod identity;
pub mod interceptor;
pub mod policy;
pub mod service;
pub mod transport;

pub use cache::{IdentityCache, IdentityProvider};
pub use config::Config;
pub use error::{Error, Result, Status, StatusCode};
pub use identity::{Certificate, PeerIdentity, ServiceIdentity, TrustBundle};
pub use policy::AuthenticationPolicy;
pub use service::IdentityService;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("tracing already initialized: {e}")))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("tracing already initialized: {e}")))?,
    }

    Ok(())
}

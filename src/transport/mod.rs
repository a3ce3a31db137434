//! Mutually authenticated transport.
//!
//! [`RustlsTransportProvider`] turns an identity snapshot and a policy into an
//! [`MtlsServer`] or [`MtlsClient`]. Both sides present their SVID, verify
//! the peer chain against the trust bundle and enforce the allow-list during
//! the handshake. Calls then travel as length-delimited JSON frames (see
//! [`frame`]) through the interceptor [`Pipeline`](crate::interceptor::Pipeline).

mod client;
pub mod frame;
mod provider;
mod server;
mod verifier;

pub use client::{MtlsClient, MtlsConnection};
pub use provider::{ALPN_PROTOCOL, RustlsTransportProvider, TransportProvider};
pub use server::{AuthenticatedStream, MtlsServer};
pub use verifier::{PolicyClientVerifier, PolicyServerVerifier};

use crate::Result;

/// Server handle lifecycle
pub trait TransportServer: Send + Sync {
    /// Stop accepting connections. Idempotent; in-flight connections run to
    /// completion.
    fn stop(&self) -> Result<()>;
}

/// Client handle lifecycle
pub trait TransportClient: Send + Sync {
    /// Refuse new connections. Idempotent.
    fn close(&self) -> Result<()>;
}

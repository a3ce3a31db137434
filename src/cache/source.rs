//! Identity source boundary.
//!
//! The external workload-identity agent is reached only through
//! [`IdentitySource`]. The cache never looks behind it.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::Result;
use crate::identity::{Certificate, TrustBundle};

/// Rotation generation published by a source; bumps on every new issue.
pub type RotationReceiver = watch::Receiver<u64>;

/// Supplier of identity material and rotation notices.
///
/// Implementations return typed errors:
/// `CertificateUnavailable`, `TrustBundleUnavailable` or `ConnectionFailed`.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// Short label for logs
    fn name(&self) -> &str;

    /// Fetch the current leaf certificate, chain and key
    async fn fetch_certificate(&self) -> Result<Certificate>;

    /// Fetch the current bundle for `trust_domain`
    async fn fetch_trust_bundle(&self, trust_domain: &str) -> Result<TrustBundle>;

    /// Subscribe to rotation notices
    fn watch(&self) -> Result<RotationReceiver>;

    /// Release the connection to the source
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

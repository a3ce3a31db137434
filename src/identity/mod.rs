//! Identity data model.
//!
//! - [`ServiceIdentity`]: who this process is (`spiffe://<domain>/<name>`).
//! - [`Certificate`] / [`TrustBundle`]: the X.509 material presented to and
//!   trusted from peers, grouped into an [`IdentitySnapshot`] so that a
//!   certificate is always paired with the bundle from the same rotation.
//! - [`PeerIdentity`]: the identity extracted from a verified peer certificate.
//! - [`CertGenerator`]: mints a CA and SVID-style leaves for tests and local
//!   development.

pub mod generate;
pub mod material;
pub mod peer;
pub mod service;

pub use generate::{CertGenerator, CertificateAuthority};
pub use material::{Certificate, IdentitySnapshot, TrustBundle};
pub use peer::PeerIdentity;
pub use service::ServiceIdentity;

/// URI scheme used by workload identities
pub const SPIFFE_SCHEME: &str = "spiffe";

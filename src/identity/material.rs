//! Certificate and trust bundle material.
//!
//! Both types are immutable once built. Rotation replaces them wholesale via
//! a new [`IdentitySnapshot`].

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use super::peer::spiffe_uri;
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Certificate
// ─────────────────────────────────────────────────────────────────────────────

/// Leaf certificate, its chain and private key.
///
/// `chain[0]` is always the leaf. The private key is never printed by the
/// `Debug` impl.
pub struct Certificate {
    chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    spiffe_id: Option<String>,
}

impl Certificate {
    /// Build from a DER chain (leaf first) and the leaf's private key.
    ///
    /// # Errors
    ///
    /// Returns `Error::CertificateUnavailable` when the chain is empty, the
    /// leaf cannot be parsed or the key does not belong to the leaf.
    pub fn new(
        chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<Self> {
        let leaf = chain
            .first()
            .ok_or_else(|| Error::CertificateUnavailable("certificate chain is empty".into()))?;
        let (_, parsed) = X509Certificate::from_der(leaf.as_ref()).map_err(|e| {
            Error::CertificateUnavailable(format!("failed to parse leaf certificate: {e}"))
        })?;

        let validity = parsed.validity();
        let not_before = to_utc(validity.not_before.timestamp())?;
        let not_after = to_utc(validity.not_after.timestamp())?;
        let spiffe_id = spiffe_uri(&parsed);
        check_key_matches(&private_key, parsed.public_key().raw)?;

        Ok(Self {
            chain,
            private_key,
            not_before,
            not_after,
            spiffe_id,
        })
    }

    /// Parse a PEM certificate chain and a PEM private key.
    ///
    /// # Errors
    ///
    /// Returns `Error::CertificateUnavailable` when either input holds no
    /// usable PEM block.
    pub fn from_pem(chain_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let chain = CertificateDer::pem_slice_iter(chain_pem)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::CertificateUnavailable(format!("invalid certificate PEM: {e}")))?;
        let key = PrivateKeyDer::from_pem_slice(key_pem)
            .map_err(|e| Error::CertificateUnavailable(format!("invalid private key PEM: {e}")))?;
        Self::new(chain, key)
    }

    /// The leaf certificate (`chain[0]`)
    #[must_use]
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    /// Full chain, leaf first
    #[must_use]
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Private key for the leaf
    #[must_use]
    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.private_key
    }

    /// Start of the validity window
    #[must_use]
    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    /// End of the validity window
    #[must_use]
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// `spiffe://` URI SAN carried by the leaf, if any
    #[must_use]
    pub fn spiffe_id(&self) -> Option<&str> {
        self.spiffe_id.as_deref()
    }

    /// Whether `at` falls inside the validity window
    #[must_use]
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.not_before <= at && at <= self.not_after
    }
}

impl Clone for Certificate {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            private_key: self.private_key.clone_key(),
            not_before: self.not_before,
            not_after: self.not_after,
            spiffe_id: self.spiffe_id.clone(),
        }
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("spiffe_id", &self.spiffe_id)
            .field("chain_len", &self.chain.len())
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// A key rotated before its certificate must not pair with the old leaf.
fn check_key_matches(private_key: &PrivateKeyDer<'_>, leaf_spki: &[u8]) -> Result<()> {
    let signing_key = any_supported_type(private_key).map_err(|e| {
        Error::CertificateUnavailable(format!("unsupported private key: {e}"))
    })?;
    match signing_key.public_key() {
        Some(spki) if spki.as_ref() != leaf_spki => Err(Error::CertificateUnavailable(
            "private key does not match leaf certificate".into(),
        )),
        _ => Ok(()),
    }
}

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp, 0).ok_or_else(|| {
        Error::CertificateUnavailable(format!("validity timestamp out of range: {timestamp}"))
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Trust bundle
// ─────────────────────────────────────────────────────────────────────────────

/// Trusted CA certificates for one trust domain.
#[derive(Clone)]
pub struct TrustBundle {
    pub(super) trust_domain: String,
    pub(super) authorities: Vec<CertificateDer<'static>>,
}

impl TrustBundle {
    /// Build a bundle.
    ///
    /// # Errors
    ///
    /// Returns `Error::TrustBundleUnavailable` when `authorities` is empty.
    pub fn new(
        trust_domain: impl Into<String>,
        authorities: Vec<CertificateDer<'static>>,
    ) -> Result<Self> {
        let trust_domain = trust_domain.into();
        if authorities.is_empty() {
            return Err(Error::TrustBundleUnavailable(format!(
                "no authorities for trust domain {trust_domain}"
            )));
        }
        Ok(Self {
            trust_domain,
            authorities,
        })
    }

    /// Parse PEM-encoded authorities.
    pub fn from_pem(trust_domain: impl Into<String>, pem: &[u8]) -> Result<Self> {
        let authorities = CertificateDer::pem_slice_iter(pem)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::TrustBundleUnavailable(format!("invalid bundle PEM: {e}")))?;
        Self::new(trust_domain, authorities)
    }

    /// Trust domain this bundle anchors
    #[must_use]
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// CA certificates
    #[must_use]
    pub fn authorities(&self) -> &[CertificateDer<'static>] {
        &self.authorities
    }
}

impl fmt::Debug for TrustBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustBundle")
            .field("trust_domain", &self.trust_domain)
            .field("authorities", &self.authorities.len())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// A certificate paired with the bundle fetched in the same refresh.
///
/// Readers hold an `Arc<IdentitySnapshot>`; the cache swaps the whole value on
/// rotation so the two halves always come from the same epoch.
#[derive(Debug, Clone)]
pub struct IdentitySnapshot {
    /// Monotonic refresh counter, starting at 1
    pub epoch: u64,
    /// Local certificate
    pub certificate: Arc<Certificate>,
    /// Bundle for the local trust domain
    pub bundle: Arc<TrustBundle>,
    /// When the material was fetched
    pub fetched_at: Instant,
}

impl IdentitySnapshot {
    /// Whether the snapshot is younger than `ttl` and the leaf is still valid
    #[must_use]
    pub fn is_fresh(&self, ttl: std::time::Duration) -> bool {
        self.fetched_at.elapsed() < ttl && self.certificate.is_valid_at(Utc::now())
    }
}

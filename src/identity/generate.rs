//! Certificate generation for tests and local development.
//!
//! [`CertGenerator::init_ca`] mints a self-signed CA for one trust domain;
//! the returned [`CertificateAuthority`] issues SVID-style leaves carrying a
//! single `spiffe://` URI SAN. This is not a production CA.

use std::fmt;
use std::time::Duration;

use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::CertificateDer;
use time::OffsetDateTime;

use super::{Certificate, ServiceIdentity, TrustBundle};
use crate::{Error, Result};

/// CA lifetime
const CA_VALIDITY_DAYS: i64 = 365;

/// Backdating applied to `not_before` to tolerate clock skew
const CLOCK_SKEW: time::Duration = time::Duration::minutes(1);

/// PEM-encoded leaf certificate and key
#[derive(Clone)]
pub struct SvidPem {
    /// Leaf certificate PEM
    pub cert_pem: String,
    /// PKCS#8 private key PEM
    pub key_pem: String,
}

/// Entry point for certificate generation
pub struct CertGenerator;

impl CertGenerator {
    /// Generate a self-signed CA for `trust_domain`.
    pub fn init_ca(trust_domain: &str) -> Result<CertificateAuthority> {
        super::service::validate_trust_domain(trust_domain)?;

        let key = KeyPair::generate().map_err(generation_error)?;
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("{trust_domain} root CA"));
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - CLOCK_SKEW;
        params.not_after = now + time::Duration::days(CA_VALIDITY_DAYS);

        let cert = params.self_signed(&key).map_err(generation_error)?;
        Ok(CertificateAuthority {
            trust_domain: trust_domain.to_owned(),
            cert_der: cert.der().clone(),
            cert_pem: cert.pem(),
            issuer: Issuer::new(params, key),
        })
    }
}

/// A CA able to issue leaves for one trust domain
pub struct CertificateAuthority {
    trust_domain: String,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    issuer: Issuer<'static, KeyPair>,
}

impl CertificateAuthority {
    /// Trust domain this CA anchors
    #[must_use]
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// CA certificate (DER)
    #[must_use]
    pub fn authority(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// CA certificate (PEM)
    #[must_use]
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Trust bundle containing just this CA
    #[must_use]
    pub fn bundle(&self) -> TrustBundle {
        TrustBundle {
            trust_domain: self.trust_domain.clone(),
            authorities: vec![self.cert_der.clone()],
        }
    }

    /// Issue a leaf valid from now for `ttl`.
    pub fn issue_svid(&self, identity: &ServiceIdentity, ttl: Duration) -> Result<Certificate> {
        let now = OffsetDateTime::now_utc();
        let ttl = time::Duration::try_from(ttl)
            .map_err(|e| Error::validation("ttl", format!("out of range: {e}")))?;
        self.issue_svid_between(identity, now - CLOCK_SKEW, now + ttl)
    }

    /// Issue a leaf with an explicit validity window (expired or
    /// not-yet-valid leaves included).
    pub fn issue_svid_between(
        &self,
        identity: &ServiceIdentity,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> Result<Certificate> {
        let pem = self.issue_svid_pem_between(identity, not_before, not_after)?;
        Certificate::from_pem(pem.cert_pem.as_bytes(), pem.key_pem.as_bytes())
    }

    /// Issue a leaf valid from now for `ttl`, returned as PEM.
    pub fn issue_svid_pem(&self, identity: &ServiceIdentity, ttl: Duration) -> Result<SvidPem> {
        let now = OffsetDateTime::now_utc();
        let ttl = time::Duration::try_from(ttl)
            .map_err(|e| Error::validation("ttl", format!("out of range: {e}")))?;
        self.issue_svid_pem_between(identity, now - CLOCK_SKEW, now + ttl)
    }

    fn issue_svid_pem_between(
        &self,
        identity: &ServiceIdentity,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> Result<SvidPem> {
        if identity.trust_domain() != self.trust_domain {
            return Err(Error::validation(
                "trust_domain",
                format!(
                    "CA for {} cannot issue {}",
                    self.trust_domain,
                    identity.uri()
                ),
            ));
        }

        let key = KeyPair::generate().map_err(generation_error)?;
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, identity.name());
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::URI(
            Ia5String::try_from(identity.uri()).map_err(generation_error)?,
        )];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params
            .signed_by(&key, &self.issuer)
            .map_err(generation_error)?;
        Ok(SvidPem {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("trust_domain", &self.trust_domain)
            .finish_non_exhaustive()
    }
}

fn generation_error(e: rcgen::Error) -> Error {
    Error::Internal(format!("certificate generation failed: {e}"))
}

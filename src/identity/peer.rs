//! Peer identity extraction.
//!
//! Parses a DER-encoded peer certificate that the TLS stack has already
//! verified and pulls out the `spiffe://` URI SAN used for policy matching.

use std::fmt;

use serde::Serialize;
use url::Url;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use super::SPIFFE_SCHEME;
use super::service::validate_trust_domain;
use crate::{Error, Result};

/// Identity fields of a verified peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PeerIdentity {
    /// Full identity URI, e.g. `spiffe://example.org/ns/prod/billing-service`
    pub uri: String,
    /// Trust domain (URI host)
    pub trust_domain: String,
    /// Workload path (URI path, leading `/` included)
    pub path: String,
    /// Last path segment; the allow-list key
    pub short_name: String,
}

impl PeerIdentity {
    /// Parse a DER-encoded certificate and extract its workload identity.
    ///
    /// # Errors
    ///
    /// Returns `Error::Unauthenticated` if the certificate cannot be parsed or
    /// carries no usable `spiffe://` URI SAN.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Unauthenticated(format!("unparseable peer certificate: {e}")))?;
        let uri = spiffe_uri(&cert)
            .ok_or_else(|| Error::Unauthenticated("peer certificate has no SPIFFE ID".into()))?;
        Self::from_uri(&uri)
    }

    /// Parse a `spiffe://<trust-domain>/<path>` URI.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::Unauthenticated(format!("invalid SPIFFE ID: {reason}"));

        let parsed = Url::parse(uri).map_err(|_| invalid("not a URI"))?;
        if parsed.scheme() != SPIFFE_SCHEME {
            return Err(invalid("scheme must be spiffe"));
        }
        if !parsed.username().is_empty()
            || parsed.password().is_some()
            || parsed.port().is_some()
            || parsed.query().is_some()
            || parsed.fragment().is_some()
        {
            return Err(invalid("must not carry userinfo, port, query or fragment"));
        }
        let trust_domain = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing trust domain"))?
            .to_owned();
        validate_trust_domain(&trust_domain).map_err(|_| invalid("bad trust domain"))?;

        let path = parsed.path().to_owned();
        let short_name = path
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .ok_or_else(|| invalid("missing workload path"))?
            .to_owned();

        Ok(Self {
            uri: parsed.as_str().to_owned(),
            trust_domain,
            path,
            short_name,
        })
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

/// First `spiffe://` URI SAN of `cert`.
pub(crate) fn spiffe_uri(cert: &X509Certificate<'_>) -> Option<String> {
    let san = cert.subject_alternative_name().ok().flatten()?;
    san.value.general_names.iter().find_map(|name| match name {
        GeneralName::URI(uri) if uri.starts_with("spiffe://") => Some((*uri).to_owned()),
        _ => None,
    })
}

//! Local service identity.

use std::fmt;

use serde::Serialize;

use super::SPIFFE_SCHEME;
use crate::{Error, Result};

/// Maximum length of a service name
pub const MAX_NAME_LEN: usize = 128;

/// Maximum length of a trust domain
pub const MAX_TRUST_DOMAIN_LEN: usize = 255;

/// The identity of this process: a name scoped to a trust domain.
///
/// The URI is derived from the two fields on construction and cannot be set
/// independently. Equality compares all three.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ServiceIdentity {
    name: String,
    trust_domain: String,
    uri: String,
}

impl ServiceIdentity {
    /// Build a validated identity.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` when either field is empty, too long or
    /// contains characters outside its allowed set.
    pub fn new(name: impl Into<String>, trust_domain: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let trust_domain = trust_domain.into();
        validate_name(&name)?;
        validate_trust_domain(&trust_domain)?;
        let uri = format!("{SPIFFE_SCHEME}://{trust_domain}/{name}");
        Ok(Self {
            name,
            trust_domain,
            uri,
        })
    }

    /// Short service name (the allow-list key)
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Trust domain
    #[must_use]
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// Full identity URI
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Validate a short service name: `[A-Za-z0-9_-]{1,128}`.
///
/// Also used for allow-list entries, which are matched against peer short
/// names.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("service_name", "must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::validation(
            "service_name",
            format!("must be at most {MAX_NAME_LEN} characters"),
        ));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(Error::validation(
            "service_name",
            format!("invalid character {c:?} in {name:?}"),
        ));
    }
    Ok(())
}

/// Validate a trust domain: lowercase DNS-like labels.
pub fn validate_trust_domain(domain: &str) -> Result<()> {
    if domain.is_empty() {
        return Err(Error::validation("trust_domain", "must not be empty"));
    }
    if domain.len() > MAX_TRUST_DOMAIN_LEN {
        return Err(Error::validation(
            "trust_domain",
            format!("must be at most {MAX_TRUST_DOMAIN_LEN} characters"),
        ));
    }
    if let Some(c) = domain
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '.'))
    {
        return Err(Error::validation(
            "trust_domain",
            format!("invalid character {c:?} (lowercase letters, digits, '-' and '.' only)"),
        ));
    }
    for label in domain.split('.') {
        if label.is_empty() {
            return Err(Error::validation("trust_domain", "contains an empty label"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(Error::validation(
                "trust_domain",
                format!("label {label:?} starts or ends with '-'"),
            ));
        }
    }
    Ok(())
}

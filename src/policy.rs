//! Allow-list authentication policy.
//!
//! A policy names its owner and two allow-lists keyed by peer short name:
//!
//! | list                 | consulted by | empty list means   |
//! |----------------------|--------------|--------------------|
//! | `authorized_clients` | servers      | every caller allowed |
//! | `trusted_servers`    | clients      | every server trusted |
//!
//! The empty-list behavior is permissive. [`AuthenticationPolicyBuilder::build`]
//! logs a warning for each permissive side, and
//! [`AuthenticationPolicyBuilder::strict`] turns an empty list into an error.
//! Matching is exact; there are no wildcards.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::PolicyConfig;
use crate::identity::ServiceIdentity;
use crate::identity::service::validate_name;
use crate::{Error, Result};

/// Outcome of a policy lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    /// Name is on a non-empty allow-list
    Allowed,
    /// Allow-list is empty
    AllowedByDefault,
    /// Name is not on a non-empty allow-list
    Denied,
}

impl PolicyDecision {
    /// Whether the decision permits the peer
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        !matches!(self, Self::Denied)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Policy
// ─────────────────────────────────────────────────────────────────────────────

/// Immutable allow-list policy for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthenticationPolicy {
    owner: ServiceIdentity,
    authorized_clients: BTreeSet<String>,
    trusted_servers: BTreeSet<String>,
}

impl AuthenticationPolicy {
    /// Start building a policy for `owner`
    #[must_use]
    pub fn builder(owner: ServiceIdentity) -> AuthenticationPolicyBuilder {
        AuthenticationPolicyBuilder::new(owner)
    }

    /// Build from the `policy` configuration block.
    pub fn from_config(owner: ServiceIdentity, config: &PolicyConfig) -> Result<Self> {
        config
            .authorized_clients
            .iter()
            .fold(Self::builder(owner), |b, name| b.add_authorized_client(name))
            .add_trusted_servers(&config.trusted_servers)
            .strict(config.strict)
            .build()
    }

    /// Identity the policy belongs to
    #[must_use]
    pub fn owner(&self) -> &ServiceIdentity {
        &self.owner
    }

    /// Server side: may `name` call us?
    #[must_use]
    pub fn is_client_authorized(&self, name: &str) -> bool {
        self.client_decision(name).is_allowed()
    }

    /// Client side: do we trust server `name`?
    #[must_use]
    pub fn is_server_trusted(&self, name: &str) -> bool {
        self.server_decision(name).is_allowed()
    }

    /// Detailed server-side decision
    #[must_use]
    pub fn client_decision(&self, name: &str) -> PolicyDecision {
        decide(&self.authorized_clients, name)
    }

    /// Detailed client-side decision
    #[must_use]
    pub fn server_decision(&self, name: &str) -> PolicyDecision {
        decide(&self.trusted_servers, name)
    }

    /// Authorized client short names
    pub fn authorized_clients(&self) -> impl Iterator<Item = &str> {
        self.authorized_clients.iter().map(String::as_str)
    }

    /// Trusted server short names
    pub fn trusted_servers(&self) -> impl Iterator<Item = &str> {
        self.trusted_servers.iter().map(String::as_str)
    }
}

fn decide(list: &BTreeSet<String>, name: &str) -> PolicyDecision {
    if list.is_empty() {
        PolicyDecision::AllowedByDefault
    } else if list.contains(name) {
        PolicyDecision::Allowed
    } else {
        PolicyDecision::Denied
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Additive builder for [`AuthenticationPolicy`].
///
/// Entries are validated in [`build`](Self::build) so calls can be chained.
#[derive(Debug, Clone)]
pub struct AuthenticationPolicyBuilder {
    owner: ServiceIdentity,
    authorized_clients: Vec<String>,
    trusted_servers: Vec<String>,
    strict: bool,
}

impl AuthenticationPolicyBuilder {
    /// New builder with empty allow-lists
    #[must_use]
    pub fn new(owner: ServiceIdentity) -> Self {
        Self {
            owner,
            authorized_clients: Vec::new(),
            trusted_servers: Vec::new(),
            strict: false,
        }
    }

    /// Allow `name` to call the owner
    #[must_use]
    pub fn add_authorized_client(mut self, name: impl Into<String>) -> Self {
        self.authorized_clients.push(name.into());
        self
    }

    /// Trust server `name` when the owner acts as a client
    #[must_use]
    pub fn add_trusted_server(mut self, name: impl Into<String>) -> Self {
        self.trusted_servers.push(name.into());
        self
    }

    /// Add several trusted servers
    #[must_use]
    pub fn add_trusted_servers<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names
            .into_iter()
            .fold(self, |b, name| b.add_trusted_server(name))
    }

    /// Reject empty allow-lists instead of allowing everyone
    #[must_use]
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Validate entries and freeze the policy.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for entries that are not valid short names
    /// (wildcards included), or for empty lists in strict mode.
    pub fn build(self) -> Result<AuthenticationPolicy> {
        let authorized_clients = collect("authorized_clients", self.authorized_clients)?;
        let trusted_servers = collect("trusted_servers", self.trusted_servers)?;

        for (field, list) in [
            ("authorized_clients", &authorized_clients),
            ("trusted_servers", &trusted_servers),
        ] {
            if !list.is_empty() {
                continue;
            }
            if self.strict {
                return Err(Error::validation(
                    field,
                    "must not be empty when policy.strict is set",
                ));
            }
            warn!(
                owner = %self.owner,
                list = field,
                "Empty allow-list: every peer is accepted on this side"
            );
        }

        debug!(
            owner = %self.owner,
            authorized_clients = authorized_clients.len(),
            trusted_servers = trusted_servers.len(),
            "Authentication policy built"
        );

        Ok(AuthenticationPolicy {
            owner: self.owner,
            authorized_clients,
            trusted_servers,
        })
    }
}

fn collect(field: &'static str, names: Vec<String>) -> Result<BTreeSet<String>> {
    names
        .into_iter()
        .map(|name| {
            if name.contains('*') {
                return Err(Error::validation(
                    field,
                    format!("wildcard entry {name:?} is not supported"),
                ));
            }
            validate_name(&name).map_err(|e| match e {
                Error::Validation { message, .. } => Error::Validation { field, message },
                other => other,
            })?;
            Ok(name)
        })
        .collect()
}

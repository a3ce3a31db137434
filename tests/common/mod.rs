//! Shared fixtures for integration tests

#![allow(dead_code)]

pub mod contract;

use std::sync::Arc;
use std::time::Duration;

use identity_mesh::AuthenticationPolicy;
use identity_mesh::identity::{CertGenerator, Certificate, CertificateAuthority, ServiceIdentity};

/// Trust domain used throughout the tests
pub const DOMAIN: &str = "example.org";

/// A CA for [`DOMAIN`] plus helpers to mint identities under it
pub struct Pki {
    pub ca: CertificateAuthority,
}

impl Pki {
    pub fn new() -> Self {
        Self {
            ca: CertGenerator::init_ca(DOMAIN).unwrap(),
        }
    }

    pub fn identity(name: &str) -> ServiceIdentity {
        ServiceIdentity::new(name, DOMAIN).unwrap()
    }

    /// Ten-minute SVID for `name`
    pub fn svid(&self, name: &str) -> Certificate {
        self.ca
            .issue_svid(&Self::identity(name), Duration::from_secs(600))
            .unwrap()
    }
}

/// Policy for `owner` admitting `clients` and trusting `servers`
pub fn policy(owner: &str, clients: &[&str], servers: &[&str]) -> Arc<AuthenticationPolicy> {
    let mut builder = AuthenticationPolicy::builder(Pki::identity(owner));
    for client in clients {
        builder = builder.add_authorized_client(*client);
    }
    for server in servers {
        builder = builder.add_trusted_server(*server);
    }
    Arc::new(builder.build().unwrap())
}

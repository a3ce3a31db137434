//! Transport construction: certificate + bundle + policy into an mTLS
//! server or client.

use std::sync::Arc;

use chrono::Utc;
use rustls::crypto::CryptoProvider;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::{debug, warn};

use super::client::MtlsClient;
use super::server::MtlsServer;
use super::verifier::{PolicyClientVerifier, PolicyServerVerifier};
use crate::identity::{Certificate, IdentitySnapshot, TrustBundle};
use crate::policy::AuthenticationPolicy;
use crate::{Error, Result};

/// ALPN protocol for the framed call protocol
pub const ALPN_PROTOCOL: &[u8] = b"identity-mesh/1";

/// Builds authenticated servers and clients.
///
/// Every argument is required; `None` is a validation error rather than a
/// downgrade to a less secure transport.
pub trait TransportProvider: Send + Sync {
    /// Server handle type
    type Server;
    /// Client handle type
    type Client;

    /// Build a server presenting `certificate`, trusting `bundle`, admitting
    /// callers allowed by `policy`.
    fn create_server(
        &self,
        certificate: Option<Arc<Certificate>>,
        bundle: Option<Arc<TrustBundle>>,
        policy: Option<Arc<AuthenticationPolicy>>,
    ) -> Result<Self::Server>;

    /// Build a client presenting `certificate`, trusting `bundle`, accepting
    /// servers allowed by `policy`.
    fn create_client(
        &self,
        certificate: Option<Arc<Certificate>>,
        bundle: Option<Arc<TrustBundle>>,
        policy: Option<Arc<AuthenticationPolicy>>,
    ) -> Result<Self::Client>;
}

/// rustls-backed provider (TLS 1.3, aws-lc-rs).
#[derive(Debug, Clone)]
pub struct RustlsTransportProvider {
    crypto: Arc<CryptoProvider>,
}

impl Default for RustlsTransportProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl RustlsTransportProvider {
    /// Provider using the aws-lc-rs crypto backend
    #[must_use]
    pub fn new() -> Self {
        Self {
            crypto: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }
    }

    /// Server from one consistent snapshot
    pub fn server_from_snapshot(
        &self,
        snapshot: &IdentitySnapshot,
        policy: Arc<AuthenticationPolicy>,
    ) -> Result<MtlsServer> {
        self.create_server(
            Some(Arc::clone(&snapshot.certificate)),
            Some(Arc::clone(&snapshot.bundle)),
            Some(policy),
        )
    }

    /// Client from one consistent snapshot
    pub fn client_from_snapshot(
        &self,
        snapshot: &IdentitySnapshot,
        policy: Arc<AuthenticationPolicy>,
    ) -> Result<MtlsClient> {
        self.create_client(
            Some(Arc::clone(&snapshot.certificate)),
            Some(Arc::clone(&snapshot.bundle)),
            Some(policy),
        )
    }

    fn server_config(
        &self,
        certificate: &Certificate,
        roots: Arc<RootCertStore>,
        policy: Arc<AuthenticationPolicy>,
    ) -> Result<ServerConfig> {
        let chain_verifier =
            WebPkiClientVerifier::builder_with_provider(roots, Arc::clone(&self.crypto))
                .build()
                .map_err(|e| Error::Config(format!("client verifier: {e}")))?;
        let verifier = Arc::new(PolicyClientVerifier::new(chain_verifier, policy));

        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.crypto))
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_client_cert_verifier(verifier)
            .with_single_cert(
                certificate.chain().to_vec(),
                certificate.private_key().clone_key(),
            )
            .map_err(key_mismatch)?;
        config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
        Ok(config)
    }

    fn client_config(
        &self,
        certificate: &Certificate,
        roots: Arc<RootCertStore>,
        policy: Arc<AuthenticationPolicy>,
    ) -> Result<ClientConfig> {
        let verifier = Arc::new(PolicyServerVerifier::new(
            roots,
            Arc::clone(&self.crypto),
            policy,
        ));
        let mut config = ClientConfig::builder_with_provider(Arc::clone(&self.crypto))
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(
                certificate.chain().to_vec(),
                certificate.private_key().clone_key(),
            )
            .map_err(key_mismatch)?;
        config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
        Ok(config)
    }
}

impl TransportProvider for RustlsTransportProvider {
    type Server = MtlsServer;
    type Client = MtlsClient;

    fn create_server(
        &self,
        certificate: Option<Arc<Certificate>>,
        bundle: Option<Arc<TrustBundle>>,
        policy: Option<Arc<AuthenticationPolicy>>,
    ) -> Result<MtlsServer> {
        let inputs = Inputs::check(certificate, bundle, policy)?;
        let config = self.server_config(
            &inputs.certificate,
            Arc::clone(&inputs.roots),
            Arc::clone(&inputs.policy),
        )?;
        debug!(
            owner = %inputs.policy.owner(),
            not_after = %inputs.certificate.not_after(),
            "mTLS server config built"
        );
        Ok(MtlsServer::new(
            Arc::new(config),
            inputs.certificate,
            inputs.policy,
        ))
    }

    fn create_client(
        &self,
        certificate: Option<Arc<Certificate>>,
        bundle: Option<Arc<TrustBundle>>,
        policy: Option<Arc<AuthenticationPolicy>>,
    ) -> Result<MtlsClient> {
        let inputs = Inputs::check(certificate, bundle, policy)?;
        let config = self.client_config(
            &inputs.certificate,
            Arc::clone(&inputs.roots),
            Arc::clone(&inputs.policy),
        )?;
        debug!(
            owner = %inputs.policy.owner(),
            not_after = %inputs.certificate.not_after(),
            "mTLS client config built"
        );
        Ok(MtlsClient::new(
            Arc::new(config),
            inputs.certificate,
            inputs.policy,
        ))
    }
}

/// Validated construction inputs
struct Inputs {
    certificate: Arc<Certificate>,
    roots: Arc<RootCertStore>,
    policy: Arc<AuthenticationPolicy>,
}

impl Inputs {
    fn check(
        certificate: Option<Arc<Certificate>>,
        bundle: Option<Arc<TrustBundle>>,
        policy: Option<Arc<AuthenticationPolicy>>,
    ) -> Result<Self> {
        let certificate =
            certificate.ok_or_else(|| Error::validation("certificate", "is required"))?;
        let bundle = bundle.ok_or_else(|| Error::validation("trust_bundle", "is required"))?;
        let policy = policy.ok_or_else(|| Error::validation("policy", "is required"))?;

        let now = Utc::now();
        if !certificate.is_valid_at(now) {
            warn!(
                not_before = %certificate.not_before(),
                not_after = %certificate.not_after(),
                "Refusing to build transport with a certificate outside its validity window"
            );
            return Err(Error::CertificateUnavailable(
                "certificate is expired or not yet valid".into(),
            ));
        }

        if bundle.trust_domain() != policy.owner().trust_domain() {
            return Err(Error::validation(
                "trust_bundle",
                format!(
                    "bundle for {} does not match policy trust domain {}",
                    bundle.trust_domain(),
                    policy.owner().trust_domain()
                ),
            ));
        }

        if certificate.spiffe_id() != Some(policy.owner().uri()) {
            return Err(Error::validation(
                "certificate",
                format!("does not carry the policy owner's identity {}", policy.owner()),
            ));
        }

        let mut roots = RootCertStore::empty();
        for authority in bundle.authorities() {
            roots.add(authority.clone()).map_err(|e| {
                Error::TrustBundleUnavailable(format!("unusable authority in bundle: {e}"))
            })?;
        }

        Ok(Self {
            certificate,
            roots: Arc::new(roots),
            policy,
        })
    }
}

fn key_mismatch(e: rustls::Error) -> Error {
    Error::validation(
        "certificate",
        format!("certificate and private key are unusable together: {e}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{CertGenerator, CertificateAuthority, ServiceIdentity};
    use crate::transport::{TransportClient, TransportServer};
    use std::time::Duration;

    // ─── helpers ─────────────────────────────────────────────────────────────

    struct Fixture {
        ca: CertificateAuthority,
        identity: ServiceIdentity,
        certificate: Arc<Certificate>,
        bundle: Arc<TrustBundle>,
        policy: Arc<AuthenticationPolicy>,
    }

    fn fixture() -> Fixture {
        let ca = CertGenerator::init_ca("example.org").unwrap();
        let identity = ServiceIdentity::new("payments", "example.org").unwrap();
        let certificate = Arc::new(ca.issue_svid(&identity, Duration::from_secs(600)).unwrap());
        let bundle = Arc::new(ca.bundle());
        let policy = Arc::new(
            AuthenticationPolicy::builder(identity.clone())
                .add_authorized_client("billing-service")
                .build()
                .unwrap(),
        );
        Fixture {
            ca,
            identity,
            certificate,
            bundle,
            policy,
        }
    }

    fn field(err: Error) -> &'static str {
        match err {
            Error::Validation { field, .. } => field,
            other => panic!("expected validation error, got {other}"),
        }
    }

    // ─── Argument validation ─────────────────────────────────────────────────

    #[test]
    fn complete_inputs_build_server_and_client() {
        let f = fixture();
        let provider = RustlsTransportProvider::new();
        let server = provider
            .create_server(
                Some(f.certificate.clone()),
                Some(f.bundle.clone()),
                Some(f.policy.clone()),
            )
            .unwrap();
        let client = provider
            .create_client(Some(f.certificate), Some(f.bundle), Some(f.policy))
            .unwrap();
        server.stop().unwrap();
        client.close().unwrap();
    }

    #[test]
    fn each_missing_argument_is_rejected() {
        let f = fixture();
        let p = RustlsTransportProvider::new();
        let (c, b, pol) = (
            Some(f.certificate.clone()),
            Some(f.bundle.clone()),
            Some(f.policy.clone()),
        );

        let server_err = |c, b, pol| field(p.create_server(c, b, pol).err().unwrap());
        assert_eq!(server_err(None, b.clone(), pol.clone()), "certificate");
        assert_eq!(server_err(c.clone(), None, pol.clone()), "trust_bundle");
        assert_eq!(server_err(c.clone(), b.clone(), None), "policy");

        let client_err = |c, b, pol| field(p.create_client(c, b, pol).err().unwrap());
        assert_eq!(client_err(None, b.clone(), pol.clone()), "certificate");
        assert_eq!(client_err(c.clone(), None, pol), "trust_bundle");
        assert_eq!(client_err(c, b, None), "policy");
    }

    #[test]
    fn expired_certificate_is_unavailable() {
        let f = fixture();
        let now = time::OffsetDateTime::now_utc();
        let expired = f
            .ca
            .issue_svid_between(
                &f.identity,
                now - time::Duration::hours(2),
                now - time::Duration::hours(1),
            )
            .unwrap();
        let err = RustlsTransportProvider::new()
            .create_server(Some(Arc::new(expired)), Some(f.bundle), Some(f.policy))
            .err()
            .unwrap();
        assert!(matches!(err, Error::CertificateUnavailable(_)));
    }

    #[test]
    fn bundle_from_other_domain_is_rejected() {
        let f = fixture();
        let other = CertGenerator::init_ca("other.org").unwrap();
        let err = RustlsTransportProvider::new()
            .create_client(
                Some(f.certificate),
                Some(Arc::new(other.bundle())),
                Some(f.policy),
            )
            .err()
            .unwrap();
        assert_eq!(field(err), "trust_bundle");
    }

    #[test]
    fn certificate_for_another_identity_is_rejected() {
        let f = fixture();
        let stranger = ServiceIdentity::new("stranger", "example.org").unwrap();
        let cert = f.ca.issue_svid(&stranger, Duration::from_secs(60)).unwrap();
        let err = RustlsTransportProvider::new()
            .create_server(Some(Arc::new(cert)), Some(f.bundle), Some(f.policy))
            .err()
            .unwrap();
        assert_eq!(field(err), "certificate");
    }

    #[test]
    fn stop_and_close_are_idempotent() {
        let f = fixture();
        let p = RustlsTransportProvider::new();
        let server = p
            .create_server(
                Some(f.certificate.clone()),
                Some(f.bundle.clone()),
                Some(f.policy.clone()),
            )
            .unwrap();
        let client = p
            .create_client(Some(f.certificate), Some(f.bundle), Some(f.policy))
            .unwrap();
        server.stop().unwrap();
        server.stop().unwrap();
        client.close().unwrap();
        client.close().unwrap();
    }
}

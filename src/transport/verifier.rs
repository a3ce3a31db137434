//! Certificate verifiers that enforce the allow-list inside the handshake.
//!
//! Chain validation is delegated to webpki; after it succeeds the peer's
//! SPIFFE ID is extracted and checked against the [`AuthenticationPolicy`].
//! A policy rejection aborts the handshake with
//! `CertificateError::ApplicationVerificationFailure`, so no application data
//! is exchanged with an unauthorized peer.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    CertificateError, DigitallySignedStruct, DistinguishedName, Error as TlsError, RootCertStore,
    SignatureScheme,
};
use tracing::{debug, warn};

use crate::identity::PeerIdentity;
use crate::policy::AuthenticationPolicy;

/// Which allow-list a verifier consults
#[derive(Debug, Clone, Copy)]
enum Side {
    /// Server verifying a client: `authorized_clients`
    Server,
    /// Client verifying a server: `trusted_servers`
    Client,
}

/// Check trust domain and allow-list for a chain-verified peer.
fn authorize(
    end_entity: &CertificateDer<'_>,
    policy: &AuthenticationPolicy,
    side: Side,
) -> Result<PeerIdentity, TlsError> {
    let peer = PeerIdentity::from_der(end_entity.as_ref()).map_err(|e| {
        warn!(error = %e, "Peer certificate carries no usable identity");
        TlsError::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
    })?;

    let owner = policy.owner();
    if peer.trust_domain != owner.trust_domain() {
        warn!(
            peer = %peer,
            expected_domain = owner.trust_domain(),
            "Peer from foreign trust domain rejected"
        );
        return Err(TlsError::InvalidCertificate(
            CertificateError::ApplicationVerificationFailure,
        ));
    }

    let allowed = match side {
        Side::Server => policy.is_client_authorized(&peer.short_name),
        Side::Client => policy.is_server_trusted(&peer.short_name),
    };
    if !allowed {
        warn!(peer = %peer, side = ?side, owner = %owner, "Peer not on allow-list");
        return Err(TlsError::InvalidCertificate(
            CertificateError::ApplicationVerificationFailure,
        ));
    }

    debug!(peer = %peer, side = ?side, "Peer authorized during handshake");
    Ok(peer)
}

// ─────────────────────────────────────────────────────────────────────────────
// Server side
// ─────────────────────────────────────────────────────────────────────────────

/// Mandatory client-certificate verifier with allow-list enforcement.
#[derive(Debug)]
pub struct PolicyClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    policy: Arc<AuthenticationPolicy>,
}

impl PolicyClientVerifier {
    /// Wrap a chain verifier (normally `WebPkiClientVerifier`)
    pub fn new(inner: Arc<dyn ClientCertVerifier>, policy: Arc<AuthenticationPolicy>) -> Self {
        Self { inner, policy }
    }
}

impl ClientCertVerifier for PolicyClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        let verified = self
            .inner
            .verify_client_cert(end_entity, intermediates, now)?;
        authorize(end_entity, &self.policy, Side::Server)?;
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client side
// ─────────────────────────────────────────────────────────────────────────────

/// Server-certificate verifier anchored on the trust bundle.
///
/// SPIFFE certificates carry no DNS names, so the server name is not
/// matched; the URI SAN and the allow-list take its place.
#[derive(Debug)]
pub struct PolicyServerVerifier {
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
    policy: Arc<AuthenticationPolicy>,
}

impl PolicyServerVerifier {
    /// Verifier over `roots`
    pub fn new(
        roots: Arc<RootCertStore>,
        provider: Arc<CryptoProvider>,
        policy: Arc<AuthenticationPolicy>,
    ) -> Self {
        Self {
            roots,
            provider,
            policy,
        }
    }
}

impl ServerCertVerifier for PolicyServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let parsed = ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &parsed,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;
        authorize(end_entity, &self.policy, Side::Client)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

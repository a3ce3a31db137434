//! Behavioral contract every `IdentityProvider` must satisfy.
//!
//! Each test binary that wants the suite builds a provider however it likes
//! and calls [`run_all`].

use std::collections::HashSet;
use std::sync::Arc;

use identity_mesh::cache::IdentityProvider;
use identity_mesh::identity::ServiceIdentity;
use identity_mesh::Error;

/// Run every contract check against `provider`, which must serve `expected`.
/// The provider is closed at the end.
pub async fn run_all(provider: Arc<dyn IdentityProvider>, expected: &ServiceIdentity) {
    identity_is_stable(provider.as_ref(), expected).await;
    certificate_matches_identity(provider.as_ref(), expected).await;
    bundle_matches_trust_domain(provider.as_ref(), expected).await;
    concurrent_reads_agree(Arc::clone(&provider)).await;
    close_is_idempotent_and_final(provider.as_ref()).await;
}

/// Repeated identity reads are value-equal
async fn identity_is_stable(provider: &dyn IdentityProvider, expected: &ServiceIdentity) {
    let first = provider.service_identity().await.unwrap();
    let second = provider.service_identity().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.name(), second.name());
    assert_eq!(first.trust_domain(), second.trust_domain());
    assert_eq!(first.uri(), second.uri());
    assert_eq!(&first, expected);
}

async fn certificate_matches_identity(provider: &dyn IdentityProvider, expected: &ServiceIdentity) {
    let cert = provider.certificate().await.unwrap();
    assert_eq!(cert.spiffe_id(), Some(expected.uri()));
    assert_eq!(cert.leaf(), &cert.chain()[0]);
    assert!(cert.is_valid_at(chrono::Utc::now()));
}

async fn bundle_matches_trust_domain(provider: &dyn IdentityProvider, expected: &ServiceIdentity) {
    let bundle = provider.trust_bundle().await.unwrap();
    assert_eq!(bundle.trust_domain(), expected.trust_domain());
    assert!(!bundle.authorities().is_empty());
}

/// Many concurrent readers all see complete snapshots
async fn concurrent_reads_agree(provider: Arc<dyn IdentityProvider>) {
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let provider = Arc::clone(&provider);
        tasks.push(tokio::spawn(async move {
            let snapshot = provider.snapshot().await.unwrap();
            assert_eq!(snapshot.certificate.leaf(), &snapshot.certificate.chain()[0]);
            snapshot.epoch
        }));
    }
    let mut epochs = HashSet::new();
    for task in tasks {
        epochs.insert(task.await.unwrap());
    }
    assert!(!epochs.is_empty());
}

async fn close_is_idempotent_and_final(provider: &dyn IdentityProvider) {
    provider.close().await.unwrap();
    provider.close().await.unwrap();
    assert!(matches!(
        provider.service_identity().await,
        Err(Error::ConnectionFailed(_))
    ));
    assert!(matches!(
        provider.certificate().await,
        Err(Error::ConnectionFailed(_))
    ));
    assert!(matches!(
        provider.trust_bundle().await,
        Err(Error::ConnectionFailed(_))
    ));
}

//! Identity provider contract, run against every provider implementation

mod common;

use std::sync::Arc;
use std::time::Duration;

use identity_mesh::cache::file::write_material;
use identity_mesh::cache::{
    CacheSettings, FileIdentitySource, IdentityCache, IdentityProvider, MemoryIdentityProvider,
    MemoryIdentitySource,
};
use identity_mesh::Error;

use common::{DOMAIN, Pki, contract};

fn settings() -> CacheSettings {
    CacheSettings {
        refresh_ttl: Duration::from_secs(60),
        retry_attempts: 3,
        retry_min_delay: Duration::from_millis(10),
    }
}

#[tokio::test]
async fn cache_over_memory_source_satisfies_contract() {
    let pki = Pki::new();
    let identity = Pki::identity("payments");
    let source = Arc::new(MemoryIdentitySource::with_material(
        pki.svid("payments"),
        pki.ca.bundle(),
    ));
    let cache = IdentityCache::connect(identity.clone(), source, settings())
        .await
        .unwrap();

    contract::run_all(Arc::new(cache), &identity).await;
}

#[tokio::test]
async fn cache_over_file_source_satisfies_contract() {
    let pki = Pki::new();
    let identity = Pki::identity("payments");
    let dir = tempfile::tempdir().unwrap();
    let svid = pki
        .ca
        .issue_svid_pem(&identity, Duration::from_secs(600))
        .unwrap();
    write_material(dir.path(), &svid.cert_pem, &svid.key_pem, pki.ca.cert_pem())
        .await
        .unwrap();

    let source = Arc::new(FileIdentitySource::new(dir.path(), DOMAIN));
    let cache = IdentityCache::connect(identity.clone(), source, settings())
        .await
        .unwrap();

    contract::run_all(Arc::new(cache), &identity).await;
}

#[tokio::test]
async fn memory_provider_satisfies_contract() {
    let pki = Pki::new();
    let identity = Pki::identity("payments");
    let provider =
        MemoryIdentityProvider::new(identity.clone(), pki.svid("payments"), pki.ca.bundle());

    contract::run_all(Arc::new(provider), &identity).await;
}

#[tokio::test]
async fn unavailable_source_fails_startup_with_typed_error() {
    // GIVEN: a source that never has material
    let source = Arc::new(MemoryIdentitySource::new());
    source.set_available(false);

    // WHEN: the cache connects
    let err = IdentityCache::connect(Pki::identity("payments"), source.clone(), settings())
        .await
        .err()
        .unwrap();

    // THEN: the source error surfaces after every retry was spent
    assert!(matches!(err, Error::ConnectionFailed(_)));
    assert_eq!(source.fetch_count(), 3);
}

#[tokio::test]
async fn rotation_is_observed_through_the_same_cache_handle() {
    // GIVEN: a connected cache
    let pki = Pki::new();
    let identity = Pki::identity("payments");
    let source = Arc::new(MemoryIdentitySource::with_material(
        pki.svid("payments"),
        pki.ca.bundle(),
    ));
    let cache = IdentityCache::connect(identity, source.clone(), settings())
        .await
        .unwrap();
    let before = cache.certificate().await.unwrap();

    // WHEN: the source rotates to material from a new CA
    let rotated = Pki::new();
    source.rotate(rotated.svid("payments"), rotated.ca.bundle());

    // THEN: the cache swaps to the new pair without being re-resolved
    tokio::time::timeout(Duration::from_secs(5), async {
        while cache.certificate().await.unwrap().leaf() == before.leaf() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let snapshot = cache.snapshot().await.unwrap();
    assert_eq!(snapshot.bundle.authorities()[0], *rotated.ca.authority());
    cache.close().await.unwrap();
}

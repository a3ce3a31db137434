//! Identity cache.
//!
//! [`IdentityCache`] holds the current [`IdentitySnapshot`] behind a
//! read-write lock and swaps it whole on refresh. A background task follows
//! the source's rotation stream so callers keep the same cache handle across
//! rotations.
//!
//! Access rules:
//!
//! - A fresh snapshot (younger than the TTL, leaf still valid) is served from
//!   memory.
//! - A stale or missing snapshot is refetched; a failed refetch returns the
//!   typed error and never the stale value.
//! - After [`IdentityCache::close`] every accessor returns
//!   `Error::ConnectionFailed`.

pub mod file;
pub mod memory;
pub mod source;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use file::FileIdentitySource;
pub use memory::{MemoryIdentityProvider, MemoryIdentitySource};
pub use source::{IdentitySource, RotationReceiver};

use crate::config::IdentitySourceConfig;
use crate::identity::{Certificate, IdentitySnapshot, ServiceIdentity, TrustBundle};
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Provider contract
// ─────────────────────────────────────────────────────────────────────────────

/// Read access to the local identity and its material.
///
/// All methods are safe to call concurrently. `close` is idempotent; after it
/// returns, accessors fail with `Error::ConnectionFailed`.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The local service identity
    async fn service_identity(&self) -> Result<ServiceIdentity>;

    /// Current certificate paired with its bundle
    async fn snapshot(&self) -> Result<Arc<IdentitySnapshot>>;

    /// Current certificate
    async fn certificate(&self) -> Result<Arc<Certificate>> {
        Ok(Arc::clone(&self.snapshot().await?.certificate))
    }

    /// Current trust bundle for the local trust domain
    async fn trust_bundle(&self) -> Result<Arc<TrustBundle>> {
        Ok(Arc::clone(&self.snapshot().await?.bundle))
    }

    /// Release resources
    async fn close(&self) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

/// Cache tuning
#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    /// Snapshot age after which the next access refetches
    pub refresh_ttl: Duration,
    /// Attempts for the initial fetch
    pub retry_attempts: usize,
    /// First backoff delay for the initial fetch
    pub retry_min_delay: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from(&IdentitySourceConfig::default())
    }
}

impl From<&IdentitySourceConfig> for CacheSettings {
    fn from(config: &IdentitySourceConfig) -> Self {
        Self {
            refresh_ttl: config.refresh_ttl,
            retry_attempts: config.retry_attempts,
            retry_min_delay: config.retry_min_delay,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache
// ─────────────────────────────────────────────────────────────────────────────

/// Fetch attempts when rotations keep landing between certificate and bundle
const MAX_PAIR_ATTEMPTS: usize = 3;

struct CacheInner {
    identity: ServiceIdentity,
    source: Arc<dyn IdentitySource>,
    settings: CacheSettings,
    current: RwLock<Option<Arc<IdentitySnapshot>>>,
    /// Source rotation generation, read around each fetch pair
    generation: RotationReceiver,
    epoch: AtomicU64,
    closed: AtomicBool,
    /// Serializes refetches so concurrent stale readers share one fetch
    refresh: tokio::sync::Mutex<()>,
}

/// Caching [`IdentityProvider`] over an [`IdentitySource`].
pub struct IdentityCache {
    inner: Arc<CacheInner>,
    shutdown: CancellationToken,
    rotation_task: Mutex<Option<JoinHandle<()>>>,
}

impl IdentityCache {
    /// Fetch the initial snapshot (retrying with backoff) and start following
    /// rotations.
    ///
    /// # Errors
    ///
    /// Returns the last fetch error once retries are exhausted, or the
    /// source's error when the rotation stream cannot be opened.
    pub async fn connect(
        identity: ServiceIdentity,
        source: Arc<dyn IdentitySource>,
        settings: CacheSettings,
    ) -> Result<Self> {
        let rotations = source.watch()?;
        let inner = Arc::new(CacheInner {
            identity,
            source,
            settings,
            current: RwLock::new(None),
            generation: rotations.clone(),
            epoch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            refresh: tokio::sync::Mutex::new(()),
        });

        let backoff = ExponentialBuilder::default()
            .with_min_delay(settings.retry_min_delay)
            .with_max_times(settings.retry_attempts.saturating_sub(1));
        let shared = &inner;
        let snapshot = (|| async move { shared.refresh(None).await })
            .retry(backoff)
            .when(|e| !matches!(e, Error::Validation { .. }))
            .notify(|err: &Error, delay: Duration| {
                warn!(
                    source = inner.source.name(),
                    error = %err,
                    retry_in = ?delay,
                    "Initial identity fetch failed, retrying"
                );
            })
            .await?;

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(follow_rotations(
            Arc::clone(&inner),
            rotations,
            shutdown.clone(),
        ));

        info!(
            identity = %inner.identity,
            source = inner.source.name(),
            epoch = snapshot.epoch,
            not_after = %snapshot.certificate.not_after(),
            "Identity cache ready"
        );

        Ok(Self {
            inner,
            shutdown,
            rotation_task: Mutex::new(Some(task)),
        })
    }

    /// The snapshot currently held, without refreshing
    #[must_use]
    pub fn current(&self) -> Option<Arc<IdentitySnapshot>> {
        self.inner.current.read().clone()
    }

    /// Number of snapshots installed so far
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::Acquire)
    }

    /// Refetch now regardless of freshness
    pub async fn force_refresh(&self) -> Result<Arc<IdentitySnapshot>> {
        self.inner.ensure_open()?;
        self.inner.refresh(None).await
    }
}

#[async_trait]
impl IdentityProvider for IdentityCache {
    async fn service_identity(&self) -> Result<ServiceIdentity> {
        self.inner.ensure_open()?;
        Ok(self.inner.identity.clone())
    }

    async fn snapshot(&self) -> Result<Arc<IdentitySnapshot>> {
        self.inner.ensure_open()?;
        let held = self.current();
        match held {
            Some(snapshot) if snapshot.is_fresh(self.inner.settings.refresh_ttl) => Ok(snapshot),
            stale => self.inner.refresh(stale.map(|s| s.epoch)).await,
        }
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();
        let task = self.rotation_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.current.write().take();
        self.inner.source.close().await?;
        info!(identity = %self.inner.identity, "Identity cache closed");
        Ok(())
    }
}

impl Drop for IdentityCache {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl CacheInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionFailed("identity cache is closed".into()));
        }
        Ok(())
    }

    /// Fetch certificate and bundle together and install them as one snapshot.
    ///
    /// `seen_epoch` is the stale epoch the caller observed; if another task
    /// already replaced it while we waited for the refresh lock, that newer
    /// snapshot is returned instead of fetching again.
    async fn refresh(&self, seen_epoch: Option<u64>) -> Result<Arc<IdentitySnapshot>> {
        let _guard = self.refresh.lock().await;

        if let Some(seen) = seen_epoch {
            let held = self.current.read().clone();
            if let Some(snapshot) = held.filter(|s| s.epoch > seen) {
                return Ok(snapshot);
            }
        }

        let (certificate, bundle) = self.fetch_pair().await?;

        match certificate.spiffe_id() {
            Some(id) if id == self.identity.uri() => {}
            other => {
                return Err(Error::CertificateUnavailable(format!(
                    "certificate identity {} does not match {}",
                    other.unwrap_or("<none>"),
                    self.identity
                )));
            }
        }

        let snapshot = Arc::new(IdentitySnapshot {
            epoch: self.epoch.fetch_add(1, Ordering::AcqRel) + 1,
            certificate: Arc::new(certificate),
            bundle: Arc::new(bundle),
            fetched_at: Instant::now(),
        });
        *self.current.write() = Some(Arc::clone(&snapshot));

        debug!(
            identity = %self.identity,
            epoch = snapshot.epoch,
            not_after = %snapshot.certificate.not_after(),
            "Identity snapshot installed"
        );
        Ok(snapshot)
    }
}

impl CacheInner {
    /// Fetch certificate then bundle, retrying when a rotation lands between
    /// the two fetches.
    async fn fetch_pair(&self) -> Result<(Certificate, TrustBundle)> {
        for _ in 0..MAX_PAIR_ATTEMPTS {
            let before = *self.generation.borrow();
            let certificate = self.source.fetch_certificate().await?;
            let bundle = self
                .source
                .fetch_trust_bundle(self.identity.trust_domain())
                .await?;
            if *self.generation.borrow() == before {
                return Ok((certificate, bundle));
            }
            debug!(identity = %self.identity, "Rotation during fetch, refetching pair");
        }
        Err(Error::CertificateUnavailable(
            "identity material kept rotating during fetch".into(),
        ))
    }
}

/// Refetch whenever the source publishes a rotation.
async fn follow_rotations(
    inner: Arc<CacheInner>,
    mut rotations: RotationReceiver,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            changed = rotations.changed() => {
                if changed.is_err() {
                    warn!(source = inner.source.name(), "Rotation stream ended");
                    break;
                }
                let generation = *rotations.borrow_and_update();
                let refreshed = tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    refreshed = inner.refresh(None) => refreshed,
                };
                match refreshed {
                    Ok(snapshot) => info!(
                        identity = %inner.identity,
                        generation,
                        epoch = snapshot.epoch,
                        "Identity rotated"
                    ),
                    Err(e) => warn!(
                        identity = %inner.identity,
                        generation,
                        error = %e,
                        "Refresh after rotation failed; next access retries"
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{CertGenerator, CertificateAuthority};
    use std::sync::atomic::AtomicUsize;

    // ─── helpers ─────────────────────────────────────────────────────────────

    fn identity() -> ServiceIdentity {
        ServiceIdentity::new("api", "example.org").unwrap()
    }

    fn issue(ca: &CertificateAuthority) -> Certificate {
        ca.issue_svid(&identity(), Duration::from_secs(600)).unwrap()
    }

    fn fast_settings() -> CacheSettings {
        CacheSettings {
            refresh_ttl: Duration::from_secs(300),
            retry_attempts: 2,
            retry_min_delay: Duration::from_millis(1),
        }
    }

    async fn loaded() -> (Arc<MemoryIdentitySource>, IdentityCache, CertificateAuthority) {
        let ca = CertGenerator::init_ca("example.org").unwrap();
        let source = Arc::new(MemoryIdentitySource::with_material(issue(&ca), ca.bundle()));
        let cache = IdentityCache::connect(identity(), source.clone(), fast_settings())
            .await
            .unwrap();
        (source, cache, ca)
    }

    /// Delegates to a memory source until `stall` is set, then never answers
    struct StallingSource {
        inner: MemoryIdentitySource,
        stall: AtomicBool,
        stalled_fetches: AtomicUsize,
    }

    #[async_trait]
    impl IdentitySource for StallingSource {
        fn name(&self) -> &str {
            "stalling"
        }

        async fn fetch_certificate(&self) -> Result<Certificate> {
            if self.stall.load(Ordering::SeqCst) {
                self.stalled_fetches.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<()>().await;
            }
            self.inner.fetch_certificate().await
        }

        async fn fetch_trust_bundle(&self, trust_domain: &str) -> Result<TrustBundle> {
            self.inner.fetch_trust_bundle(trust_domain).await
        }

        fn watch(&self) -> Result<RotationReceiver> {
            self.inner.watch()
        }
    }

    async fn wait_for_epoch(cache: &IdentityCache, epoch: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while cache.epoch() < epoch {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("epoch reached");
    }

    // ─── Initial fetch ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn connect_installs_first_snapshot() {
        let (_, cache, _) = loaded().await;
        let snapshot = cache.snapshot().await.unwrap();
        assert_eq!(snapshot.epoch, 1);
        assert_eq!(snapshot.certificate.leaf(), &snapshot.certificate.chain()[0]);
    }

    #[tokio::test]
    async fn connect_fails_when_source_is_down() {
        let source = Arc::new(MemoryIdentitySource::new());
        let err = IdentityCache::connect(identity(), source.clone(), fast_settings())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::CertificateUnavailable(_)));
        // two attempts, one certificate fetch each
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn connect_rejects_certificate_for_another_identity() {
        let ca = CertGenerator::init_ca("example.org").unwrap();
        let other = ServiceIdentity::new("other", "example.org").unwrap();
        let cert = ca.issue_svid(&other, Duration::from_secs(600)).unwrap();
        let source = Arc::new(MemoryIdentitySource::with_material(cert, ca.bundle()));
        let err = IdentityCache::connect(identity(), source, fast_settings())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::CertificateUnavailable(_)));
    }

    // ─── Freshness ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn fresh_snapshot_is_served_without_fetching() {
        let (source, cache, _) = loaded().await;
        let before = source.fetch_count();
        for _ in 0..10 {
            cache.certificate().await.unwrap();
        }
        assert_eq!(source.fetch_count(), before);
    }

    #[tokio::test]
    async fn stale_snapshot_with_unreachable_source_is_an_error_not_stale_data() {
        // GIVEN: a cache whose TTL expires immediately
        let ca = CertGenerator::init_ca("example.org").unwrap();
        let source = Arc::new(MemoryIdentitySource::with_material(issue(&ca), ca.bundle()));
        let settings = CacheSettings {
            refresh_ttl: Duration::ZERO,
            ..fast_settings()
        };
        let cache = IdentityCache::connect(identity(), source.clone(), settings)
            .await
            .unwrap();
        // WHEN: the source goes away
        source.set_available(false);
        // THEN: access reports the outage
        assert!(matches!(
            cache.certificate().await,
            Err(Error::ConnectionFailed(_))
        ));
        // AND: recovers once the source is back
        source.set_available(true);
        assert!(cache.certificate().await.is_ok());
    }

    // ─── Rotation ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn rotation_is_picked_up_without_reresolving() {
        let (source, cache, ca) = loaded().await;
        let old_leaf = cache.certificate().await.unwrap().leaf().clone();

        source.rotate(issue(&ca), ca.bundle());
        wait_for_epoch(&cache, 2).await;

        let snapshot = cache.snapshot().await.unwrap();
        assert_eq!(snapshot.epoch, 2);
        assert_ne!(snapshot.certificate.leaf(), &old_leaf);
    }

    #[tokio::test]
    async fn concurrent_readers_see_whole_snapshots() {
        // GIVEN: leaves from two CAs, each remembered with its issuing CA
        let (source, cache, first_ca) = loaded().await;
        let cache = Arc::new(cache);
        let cas: Vec<_> = (0..2)
            .map(|_| CertGenerator::init_ca("example.org").unwrap())
            .collect();
        let mut issued_by = std::collections::HashMap::new();
        let first_leaf = cache.certificate().await.unwrap().leaf().clone();
        issued_by.insert(first_leaf, first_ca.authority().clone());
        let rounds: Vec<_> = (0..20)
            .map(|round| {
                let ca = &cas[round % 2];
                let cert = issue(ca);
                issued_by.insert(cert.leaf().clone(), ca.authority().clone());
                (cert, ca.bundle())
            })
            .collect();
        let issued_by = Arc::new(issued_by);

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let issued_by = Arc::clone(&issued_by);
                tokio::spawn(async move {
                    for _ in 0..200 {
                        let s = cache.snapshot().await.unwrap();
                        // THEN: leaf is chain[0] and the bundle is the one
                        // rotated in with it
                        assert_eq!(s.certificate.leaf(), &s.certificate.chain()[0]);
                        assert_eq!(
                            issued_by.get(s.certificate.leaf()),
                            Some(&s.bundle.authorities()[0])
                        );
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        // WHEN: rotating repeatedly while readers run
        for (cert, bundle) in rounds {
            source.rotate(cert, bundle);
            cache.force_refresh().await.unwrap();
            tokio::task::yield_now().await;
        }
        for r in readers {
            r.await.unwrap();
        }
    }

    // ─── Close ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_access() {
        let (_, cache, _) = loaded().await;
        cache.close().await.unwrap();
        cache.close().await.unwrap();
        assert!(matches!(
            cache.service_identity().await,
            Err(Error::ConnectionFailed(_))
        ));
        assert!(matches!(
            cache.trust_bundle().await,
            Err(Error::ConnectionFailed(_))
        ));
        assert!(cache.current().is_none());
    }

    #[tokio::test]
    async fn close_does_not_wait_for_a_hung_rotation_fetch() {
        // GIVEN: a cache whose source stops answering after the first fetch
        let ca = CertGenerator::init_ca("example.org").unwrap();
        let source = Arc::new(StallingSource {
            inner: MemoryIdentitySource::with_material(issue(&ca), ca.bundle()),
            stall: AtomicBool::new(false),
            stalled_fetches: AtomicUsize::new(0),
        });
        let cache = IdentityCache::connect(identity(), source.clone(), fast_settings())
            .await
            .unwrap();
        source.stall.store(true, Ordering::SeqCst);

        // WHEN: a rotation starts a refresh that hangs
        source.inner.rotate(issue(&ca), ca.bundle());
        tokio::time::timeout(Duration::from_secs(5), async {
            while source.stalled_fetches.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("rotation refresh started");

        // THEN: close still completes promptly
        tokio::time::timeout(Duration::from_secs(2), cache.close())
            .await
            .expect("close finished")
            .unwrap();
        assert_eq!(cache.epoch(), 1);
    }
}

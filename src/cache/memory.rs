//! In-memory identity source and provider.
//!
//! Used by tests and local development: material is handed in directly and
//! rotated with `rotate()`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;

use super::IdentityProvider;
use super::source::{IdentitySource, RotationReceiver};
use crate::identity::{Certificate, IdentitySnapshot, ServiceIdentity, TrustBundle};
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Source
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct SourceState {
    certificate: Option<Certificate>,
    bundles: HashMap<String, TrustBundle>,
    unavailable: bool,
    closed: bool,
}

/// Identity source backed by process memory.
pub struct MemoryIdentitySource {
    state: RwLock<SourceState>,
    rotation: watch::Sender<u64>,
    fetches: AtomicU64,
}

impl MemoryIdentitySource {
    /// Empty source: every fetch fails until material is rotated in
    #[must_use]
    pub fn new() -> Self {
        let (rotation, _) = watch::channel(0);
        Self {
            state: RwLock::new(SourceState::default()),
            rotation,
            fetches: AtomicU64::new(0),
        }
    }

    /// Source pre-loaded with a certificate and its bundle
    #[must_use]
    pub fn with_material(certificate: Certificate, bundle: TrustBundle) -> Self {
        let source = Self::new();
        {
            let mut state = source.state.write();
            state.certificate = Some(certificate);
            state
                .bundles
                .insert(bundle.trust_domain().to_owned(), bundle);
        }
        source
    }

    /// Replace the material and notify watchers
    pub fn rotate(&self, certificate: Certificate, bundle: TrustBundle) {
        let mut state = self.state.write();
        state.certificate = Some(certificate);
        state
            .bundles
            .insert(bundle.trust_domain().to_owned(), bundle);
        // bumped under the state lock so a reader that sees the new material
        // also sees the new generation
        self.rotation.send_modify(|generation| *generation += 1);
        drop(state);
        debug!(generation = *self.rotation.borrow(), "In-memory identity rotated");
    }

    /// Simulate the agent going away (`false`) or coming back (`true`)
    pub fn set_available(&self, available: bool) {
        self.state.write().unavailable = !available;
    }

    /// Number of fetch calls served (certificate and bundle)
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    fn check_reachable(&self, state: &SourceState) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        if state.closed {
            return Err(Error::ConnectionFailed("identity source is closed".into()));
        }
        if state.unavailable {
            return Err(Error::ConnectionFailed("identity source unreachable".into()));
        }
        Ok(())
    }
}

impl Default for MemoryIdentitySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentitySource for MemoryIdentitySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch_certificate(&self) -> Result<Certificate> {
        let state = self.state.read();
        self.check_reachable(&state)?;
        state
            .certificate
            .clone()
            .ok_or_else(|| Error::CertificateUnavailable("no certificate issued yet".into()))
    }

    async fn fetch_trust_bundle(&self, trust_domain: &str) -> Result<TrustBundle> {
        let state = self.state.read();
        self.check_reachable(&state)?;
        state.bundles.get(trust_domain).cloned().ok_or_else(|| {
            Error::TrustBundleUnavailable(format!("no bundle for trust domain {trust_domain}"))
        })
    }

    fn watch(&self) -> Result<RotationReceiver> {
        Ok(self.rotation.subscribe())
    }

    async fn close(&self) -> Result<()> {
        self.state.write().closed = true;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider fake
// ─────────────────────────────────────────────────────────────────────────────

/// [`IdentityProvider`] that serves a fixed snapshot with no source behind it.
pub struct MemoryIdentityProvider {
    identity: ServiceIdentity,
    snapshot: RwLock<Arc<IdentitySnapshot>>,
    closed: AtomicBool,
}

impl MemoryIdentityProvider {
    /// Serve `certificate` and `bundle` as `identity`
    #[must_use]
    pub fn new(identity: ServiceIdentity, certificate: Certificate, bundle: TrustBundle) -> Self {
        Self {
            identity,
            snapshot: RwLock::new(Arc::new(IdentitySnapshot {
                epoch: 1,
                certificate: Arc::new(certificate),
                bundle: Arc::new(bundle),
                fetched_at: Instant::now(),
            })),
            closed: AtomicBool::new(false),
        }
    }

    /// Swap in new material as the next epoch
    pub fn rotate(&self, certificate: Certificate, bundle: TrustBundle) {
        let mut slot = self.snapshot.write();
        let epoch = slot.epoch + 1;
        *slot = Arc::new(IdentitySnapshot {
            epoch,
            certificate: Arc::new(certificate),
            bundle: Arc::new(bundle),
            fetched_at: Instant::now(),
        });
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionFailed("identity provider is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn service_identity(&self) -> Result<ServiceIdentity> {
        self.ensure_open()?;
        Ok(self.identity.clone())
    }

    async fn snapshot(&self) -> Result<Arc<IdentitySnapshot>> {
        self.ensure_open()?;
        Ok(Arc::clone(&self.snapshot.read()))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

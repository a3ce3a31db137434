//! File-backed identity source.
//!
//! Reads PEM material that an agent sidecar writes into a directory:
//!
//! - `svid.pem`: leaf certificate followed by intermediates
//! - `svid_key.pem`: leaf private key
//! - `bundle.pem`: trust bundle for the local trust domain
//!
//! Changes to any of these files are debounced and published as rotation
//! notices.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::source::{IdentitySource, RotationReceiver};
use crate::config::IdentitySourceConfig;
use crate::identity::{Certificate, TrustBundle};
use crate::{Error, Result};

/// Identity source reading PEM files from a directory.
pub struct FileIdentitySource {
    directory: PathBuf,
    cert_file: String,
    key_file: String,
    bundle_file: String,
    trust_domain: String,
    debounce: Duration,
    rotation: Arc<watch::Sender<u64>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    shutdown: CancellationToken,
}

impl FileIdentitySource {
    /// Source for `directory` using the default file names
    pub fn new(directory: impl Into<PathBuf>, trust_domain: impl Into<String>) -> Self {
        Self::from_config(
            directory,
            trust_domain,
            &IdentitySourceConfig::default(),
        )
    }

    /// Source using the file names and debounce from `config`
    pub fn from_config(
        directory: impl Into<PathBuf>,
        trust_domain: impl Into<String>,
        config: &IdentitySourceConfig,
    ) -> Self {
        let (rotation, _) = watch::channel(0);
        Self {
            directory: directory.into(),
            cert_file: config.cert_file.clone(),
            key_file: config.key_file.clone(),
            bundle_file: config.bundle_file.clone(),
            trust_domain: trust_domain.into(),
            debounce: config.watch_debounce,
            rotation: Arc::new(rotation),
            watcher: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Directory being read
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    async fn read(&self, file: &str) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(self.directory.join(file)).await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ConnectionFailed("identity source is closed".into()));
        }
        Ok(())
    }

    fn start_watcher(&self) -> Result<()> {
        let mut slot = self.watcher.lock();
        if slot.is_some() {
            return Ok(());
        }

        let (event_tx, event_rx) = mpsc::channel(16);
        let relevant = [
            self.cert_file.clone(),
            self.key_file.clone(),
            self.bundle_file.clone(),
        ];
        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) => {
                    let is_relevant = matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) && event.paths.iter().any(|p| {
                        p.file_name()
                            .and_then(|n| n.to_str())
                            .is_some_and(|n| relevant.iter().any(|r| r == n))
                    });
                    if is_relevant {
                        debug!(paths = ?event.paths, kind = ?event.kind, "Identity file change");
                        let _ = event_tx.try_send(());
                    }
                }
                Err(e) => error!(error = %e, "Identity file watcher error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| Error::Internal(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(&self.directory, RecursiveMode::NonRecursive)
            .map_err(|e| {
                Error::ConnectionFailed(format!(
                    "cannot watch {}: {e}",
                    self.directory.display()
                ))
            })?;
        info!(directory = %self.directory.display(), "Watching identity files");

        spawn_debounce(
            event_rx,
            Arc::clone(&self.rotation),
            self.debounce,
            self.shutdown.clone(),
        );
        *slot = Some(watcher);
        Ok(())
    }
}

/// Publish one rotation per burst of file events once `debounce` has passed
/// since the last event.
fn spawn_debounce(
    mut event_rx: mpsc::Receiver<()>,
    rotation: Arc<watch::Sender<u64>>,
    debounce: Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut last_event: Option<Instant> = None;
        let period = Duration::from_millis(50).min(debounce.max(Duration::from_millis(1)));
        let mut tick = tokio::time::interval(period);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("Identity file watcher shutting down");
                    break;
                }
                event = event_rx.recv() => {
                    if event.is_none() {
                        break;
                    }
                    last_event = Some(Instant::now());
                }
                _ = tick.tick() => {
                    if last_event.is_some_and(|last| last.elapsed() >= debounce) {
                        last_event = None;
                        rotation.send_modify(|generation| *generation += 1);
                        info!(generation = *rotation.borrow(), "Identity files rotated");
                    }
                }
            }
        }
    });
}

#[async_trait]
impl IdentitySource for FileIdentitySource {
    fn name(&self) -> &str {
        "file"
    }

    async fn fetch_certificate(&self) -> Result<Certificate> {
        self.ensure_open()?;
        let chain = self.read(&self.cert_file).await.map_err(|e| {
            Error::CertificateUnavailable(format!("cannot read {}: {e}", self.cert_file))
        })?;
        let key = self.read(&self.key_file).await.map_err(|e| {
            Error::CertificateUnavailable(format!("cannot read {}: {e}", self.key_file))
        })?;
        Certificate::from_pem(&chain, &key)
    }

    async fn fetch_trust_bundle(&self, trust_domain: &str) -> Result<TrustBundle> {
        self.ensure_open()?;
        if trust_domain != self.trust_domain {
            return Err(Error::TrustBundleUnavailable(format!(
                "no bundle for trust domain {trust_domain}"
            )));
        }
        let pem = self.read(&self.bundle_file).await.map_err(|e| {
            Error::TrustBundleUnavailable(format!("cannot read {}: {e}", self.bundle_file))
        })?;
        TrustBundle::from_pem(trust_domain, &pem)
    }

    fn watch(&self) -> Result<RotationReceiver> {
        self.ensure_open()?;
        self.start_watcher()?;
        Ok(self.rotation.subscribe())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.watcher.lock().take();
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Writing material (dev tooling, tests)
// ─────────────────────────────────────────────────────────────────────────────

/// Write PEM material into `directory` under the default file names.
pub async fn write_material(
    directory: &Path,
    cert_pem: &str,
    key_pem: &str,
    bundle_pem: &str,
) -> Result<()> {
    let defaults = IdentitySourceConfig::default();
    tokio::fs::create_dir_all(directory).await?;
    tokio::fs::write(directory.join(&defaults.key_file), key_pem).await?;
    tokio::fs::write(directory.join(&defaults.bundle_file), bundle_pem).await?;
    tokio::fs::write(directory.join(&defaults.cert_file), cert_pem).await?;
    Ok(())
}

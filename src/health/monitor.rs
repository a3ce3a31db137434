//! Scheduled, concurrent health aggregation.
//!
//! ```text
//!   Stopped ──start()──▶ Running ──stop()──▶ Stopped
//!                           │
//!                every interval: fan out one check per checker
//!                (bounded concurrency, per-check timeout), swap the report,
//!                then notify reporters
//! ```
//!
//! Registries and the latest report sit behind short `parking_lot` critical
//! sections. No check or reporter call runs while a lock is held.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use futures::future::{BoxFuture, FutureExt};
use futures::stream;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    HealthChecker, HealthReport, HealthReporter, HealthResult, HealthStatus, HttpHealthChecker,
    LogHealthReporter, aggregate,
};
use crate::config::HealthConfig;
use crate::{Error, Result};

/// Monitor timing and concurrency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthMonitorSettings {
    /// Time between cycles
    pub interval: Duration,
    /// Limit for a single check
    pub timeout: Duration,
    /// Checks run at once
    pub max_concurrency: usize,
}

impl Default for HealthMonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            max_concurrency: 8,
        }
    }
}

impl From<&HealthConfig> for HealthMonitorSettings {
    fn from(config: &HealthConfig) -> Self {
        Self {
            interval: config.interval,
            timeout: config.timeout,
            max_concurrency: config.max_concurrent_checks,
        }
    }
}

type CheckerMap = BTreeMap<String, Arc<dyn HealthChecker>>;
type ReporterMap = BTreeMap<String, Arc<dyn HealthReporter>>;

struct Inner {
    settings: HealthMonitorSettings,
    checkers: RwLock<CheckerMap>,
    reporters: RwLock<ReporterMap>,
    report: RwLock<Arc<HealthReport>>,
}

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Runs registered checkers on a schedule and fans results out to reporters.
pub struct HealthMonitor {
    inner: Arc<Inner>,
    session: Mutex<Option<Session>>,
}

impl HealthMonitor {
    /// Stopped monitor with no checkers or reporters
    #[must_use]
    pub fn new(settings: HealthMonitorSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                checkers: RwLock::new(CheckerMap::new()),
                reporters: RwLock::new(ReporterMap::new()),
                report: RwLock::new(Arc::new(HealthReport::default())),
            }),
            session: Mutex::new(None),
        }
    }

    /// Monitor with an HTTP checker for each configured endpoint
    /// (`agent`, `server`) and a [`LogHealthReporter`].
    ///
    /// With `enabled: false` no checkers are registered, so the monitor
    /// reports `Unknown`.
    pub fn from_config(config: &HealthConfig) -> Result<Self> {
        let monitor = Self::new(HealthMonitorSettings::from(config));
        monitor.register_reporter(Arc::new(LogHealthReporter::new()))?;
        if !config.enabled {
            debug!("Health monitoring disabled");
            return Ok(monitor);
        }
        let endpoints = [("agent", &config.agent), ("server", &config.server)];
        for (component, endpoint) in endpoints {
            if let Some(endpoint) = endpoint {
                monitor.register_checker(Arc::new(HttpHealthChecker::from_endpoint(
                    component,
                    endpoint,
                    config.timeout,
                )?))?;
            }
        }
        Ok(monitor)
    }

    /// Register `checker` under its component name; replaces an existing
    /// checker with the same name.
    pub fn register_checker(&self, checker: Arc<dyn HealthChecker>) -> Result<()> {
        let name = checker.component_name().to_owned();
        if name.trim().is_empty() {
            return Err(Error::validation("component_name", "must not be empty"));
        }
        if self.inner.checkers.write().insert(name.clone(), checker).is_some() {
            debug!(component = %name, "Health checker replaced");
        } else {
            debug!(component = %name, "Health checker registered");
        }
        Ok(())
    }

    /// Remove the checker for `component`
    pub fn unregister_checker(&self, component: &str) -> Result<()> {
        match self.inner.checkers.write().remove(component) {
            Some(_) => Ok(()),
            None => Err(Error::HealthCheck(format!(
                "no checker registered for component {component}"
            ))),
        }
    }

    /// Register `reporter` under its name; replaces an existing reporter
    /// with the same name.
    pub fn register_reporter(&self, reporter: Arc<dyn HealthReporter>) -> Result<()> {
        let name = reporter.name().to_owned();
        if name.trim().is_empty() {
            return Err(Error::validation("reporter_name", "must not be empty"));
        }
        self.inner.reporters.write().insert(name, reporter);
        Ok(())
    }

    /// Registered component names
    #[must_use]
    pub fn components(&self) -> Vec<String> {
        self.inner.checkers.read().keys().cloned().collect()
    }

    /// Start the scheduled loop. The first cycle runs one interval after
    /// start.
    ///
    /// # Errors
    ///
    /// `Error::AlreadyRunning` if a session is active.
    pub fn start(&self) -> Result<()> {
        let mut session = self.session.lock();
        if session.as_ref().is_some_and(|s| !s.task.is_finished()) {
            return Err(Error::AlreadyRunning("health monitor".into()));
        }

        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let task = tokio::spawn(async move { inner.run(token).await });
        *session = Some(Session { cancel, task });

        info!(
            interval = ?self.inner.settings.interval,
            timeout = ?self.inner.settings.timeout,
            "Health monitor started"
        );
        Ok(())
    }

    /// Stop the loop and wait for it to exit. A cycle in progress is
    /// abandoned and not reported. Stopping a stopped monitor is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };
        session.cancel.cancel();
        if let Err(e) = session.task.await {
            warn!(error = %e, "Health monitor task ended abnormally");
        }
        info!("Health monitor stopped");
        Ok(())
    }

    /// Whether a session is active
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|s| !s.task.is_finished())
    }

    /// Run one cycle now, publish and report it
    pub async fn check_all(&self) -> Arc<HealthReport> {
        let results = self.inner.fan_out().await;
        let report = self.inner.publish(results);
        self.inner.notify_reporters(&report).await;
        report
    }

    /// Latest complete report
    #[must_use]
    pub fn latest(&self) -> Arc<HealthReport> {
        Arc::clone(&self.inner.report.read())
    }

    /// Aggregate status of the latest report
    #[must_use]
    pub fn overall_status(&self) -> HealthStatus {
        self.inner.report.read().overall
    }

    /// Stop, then close and drop every reporter
    pub async fn close(&self) -> Result<()> {
        self.stop().await?;
        let reporters: Vec<_> = std::mem::take(&mut *self.inner.reporters.write())
            .into_values()
            .collect();
        for reporter in reporters {
            if let Err(e) = reporter.close().await {
                warn!(reporter = reporter.name(), error = %e, "Health reporter failed to close");
            }
        }
        self.inner.checkers.write().clear();
        Ok(())
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.cancel.cancel();
        }
    }
}

impl Inner {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let interval = self.settings.interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let results = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                results = self.fan_out() => results,
            };
            let report = self.publish(results);
            self.notify_reporters(&report).await;
        }
        debug!("Health monitor loop exited");
    }

    /// One check per registered checker, bounded concurrency.
    ///
    /// The returned future owns everything it touches so the loop task stays
    /// `Send + 'static`.
    fn fan_out(&self) -> BoxFuture<'static, Vec<HealthResult>> {
        let checkers: Vec<(String, Arc<dyn HealthChecker>)> = self
            .checkers
            .read()
            .iter()
            .map(|(name, checker)| (name.clone(), Arc::clone(checker)))
            .collect();
        let timeout = self.settings.timeout;
        let max_concurrency = self.settings.max_concurrency.max(1);

        stream::iter(checkers)
            .map(move |(name, checker)| run_check(name, checker, timeout).boxed())
            .buffer_unordered(max_concurrency)
            .collect()
            .boxed()
    }

    /// Replace the latest report with `results` as the next cycle
    fn publish(&self, results: Vec<HealthResult>) -> Arc<HealthReport> {
        let results: BTreeMap<String, HealthResult> = results
            .into_iter()
            .map(|r| (r.component.clone(), r))
            .collect();
        let overall = aggregate(results.values().map(|r| &r.status));

        let mut slot = self.report.write();
        let report = Arc::new(HealthReport {
            cycle: slot.cycle + 1,
            overall,
            results,
            completed_at: Some(Utc::now()),
        });
        *slot = Arc::clone(&report);
        drop(slot);

        debug!(
            cycle = report.cycle,
            overall = %report.overall,
            components = report.results.len(),
            "Health cycle complete"
        );
        report
    }

    async fn notify_reporters(&self, report: &HealthReport) {
        let reporters: Vec<Arc<dyn HealthReporter>> =
            self.reporters.read().values().cloned().collect();
        for reporter in reporters {
            for result in report.results.values() {
                if let Err(e) = reporter.report_health(result).await {
                    warn!(
                        reporter = reporter.name(),
                        component = %result.component,
                        error = %e,
                        "Health reporter failed"
                    );
                }
            }
            if let Err(e) = reporter.report_overall(report).await {
                warn!(reporter = reporter.name(), error = %e, "Health reporter failed");
            }
        }
    }
}

async fn run_check(
    name: String,
    checker: Arc<dyn HealthChecker>,
    timeout: Duration,
) -> HealthResult {
    let started = Instant::now();
    match tokio::time::timeout(timeout, checker.check_health()).await {
        Ok(Ok(mut result)) => {
            result.component = name;
            if result.response_time.is_zero() {
                result.response_time = started.elapsed();
            }
            result
        }
        Ok(Err(e)) => {
            warn!(component = %name, error = %e, "Health check failed");
            HealthResult::new(name, HealthStatus::Unknown, "Health check failed")
                .with_response_time(started.elapsed())
                .with_detail("error", e.to_string())
        }
        Err(_) => {
            warn!(component = %name, timeout = ?timeout, "Health check timed out");
            HealthResult::new(name, HealthStatus::Unknown, "Health check timed out")
                .with_response_time(started.elapsed())
                .with_detail("error", format!("timed out after {}ms", timeout.as_millis()))
        }
    }
}

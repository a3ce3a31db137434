//! Health aggregation for the identity infrastructure.
//!
//! Checkers watch one component each (the workload agent, the identity
//! server, ...). A [`HealthMonitor`] runs every registered checker
//! concurrently on a fixed interval, keeps the latest complete
//! [`HealthReport`] and hands it to every registered reporter.

pub mod http;
pub mod monitor;
pub mod reporter;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::http::HttpHealthChecker;
pub use monitor::{HealthMonitor, HealthMonitorSettings};
pub use reporter::LogHealthReporter;

use crate::Result;

/// Component health
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// No data, or the check itself failed
    #[default]
    Unknown,
    /// Component reported healthy
    Healthy,
    /// Component reported unhealthy
    Unhealthy,
}

impl HealthStatus {
    /// Lowercase label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one check of one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResult {
    /// Component name
    pub component: String,
    /// Status
    pub status: HealthStatus,
    /// Human-readable summary
    pub message: String,
    /// When the check finished
    pub checked_at: DateTime<Utc>,
    /// How long the check took
    #[serde(with = "humantime_serde")]
    pub response_time: Duration,
    /// Check-specific detail (status codes, truncated bodies, errors)
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl HealthResult {
    /// Result stamped with the current time
    pub fn new(
        component: impl Into<String>,
        status: HealthStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            component: component.into(),
            status,
            message: message.into(),
            checked_at: Utc::now(),
            response_time: Duration::ZERO,
            details: serde_json::Map::new(),
        }
    }

    /// Set the response time
    #[must_use]
    pub fn with_response_time(mut self, elapsed: Duration) -> Self {
        self.response_time = elapsed;
        self
    }

    /// Add a detail entry
    #[must_use]
    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_owned(), value.into());
        self
    }
}

/// Checks one component.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Registration key and result component name
    fn component_name(&self) -> &str;

    /// Overall health of the component
    async fn check_health(&self) -> Result<HealthResult>;

    /// Whether the component process is up
    async fn check_liveness(&self) -> Result<HealthResult> {
        self.check_health().await
    }

    /// Whether the component can serve
    async fn check_readiness(&self) -> Result<HealthResult> {
        self.check_health().await
    }
}

/// Consumes check results.
#[async_trait]
pub trait HealthReporter: Send + Sync {
    /// Registration key
    fn name(&self) -> &str;

    /// One component's result
    async fn report_health(&self, result: &HealthResult) -> Result<()>;

    /// The complete report for a cycle
    async fn report_overall(&self, report: &HealthReport) -> Result<()>;

    /// Release resources
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Results of one complete check cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthReport {
    /// Cycle number, starting at 1
    pub cycle: u64,
    /// Aggregate status
    pub overall: HealthStatus,
    /// Per-component results
    pub results: BTreeMap<String, HealthResult>,
    /// When the cycle finished
    pub completed_at: Option<DateTime<Utc>>,
}

/// `Healthy` iff every component is healthy; `Unknown` with no components;
/// `Unhealthy` otherwise.
#[must_use]
pub fn aggregate<'a, I>(statuses: I) -> HealthStatus
where
    I: IntoIterator<Item = &'a HealthStatus>,
{
    let mut any = false;
    for status in statuses {
        any = true;
        if *status != HealthStatus::Healthy {
            return HealthStatus::Unhealthy;
        }
    }
    if any {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unknown
    }
}

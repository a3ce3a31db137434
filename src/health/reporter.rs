//! Reporter that writes health results to the tracing log.

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{HealthReport, HealthReporter, HealthResult, HealthStatus};
use crate::Result;

/// Logs each result at a level matching its status.
#[derive(Debug, Clone, Default)]
pub struct LogHealthReporter;

impl LogHealthReporter {
    /// New reporter
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HealthReporter for LogHealthReporter {
    fn name(&self) -> &str {
        "log"
    }

    async fn report_health(&self, result: &HealthResult) -> Result<()> {
        let response_ms = u64::try_from(result.response_time.as_millis()).unwrap_or(u64::MAX);
        match result.status {
            HealthStatus::Healthy => info!(
                component = %result.component,
                response_ms,
                message = %result.message,
                "Component healthy"
            ),
            HealthStatus::Unhealthy => warn!(
                component = %result.component,
                response_ms,
                message = %result.message,
                "Component unhealthy"
            ),
            HealthStatus::Unknown => error!(
                component = %result.component,
                response_ms,
                message = %result.message,
                error = result.details.get("error").and_then(|v| v.as_str()).unwrap_or("-"),
                "Component health unknown"
            ),
        }
        Ok(())
    }

    async fn report_overall(&self, report: &HealthReport) -> Result<()> {
        let count = |status: HealthStatus| {
            report
                .results
                .values()
                .filter(|r| r.status == status)
                .count()
        };
        info!(
            cycle = report.cycle,
            overall = %report.overall,
            components = report.results.len(),
            healthy = count(HealthStatus::Healthy),
            unhealthy = count(HealthStatus::Unhealthy),
            unknown = count(HealthStatus::Unknown),
            "Health report"
        );
        Ok(())
    }
}

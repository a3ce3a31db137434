//! Structured call logging.
//!
//! One event per finished call: `error` for failures, `warn` for calls slower
//! than the threshold, `info` otherwise. Payloads are never logged, only
//! their sizes.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{Call, CallKind, CallResult, Interceptor, Next};

/// Logs every call that reaches it.
pub struct LoggingInterceptor {
    excluded_methods: HashSet<String>,
    slow_threshold: Duration,
}

impl Default for LoggingInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingInterceptor {
    /// Log all methods, slow threshold 500ms
    #[must_use]
    pub fn new() -> Self {
        Self {
            excluded_methods: HashSet::new(),
            slow_threshold: Duration::from_millis(500),
        }
    }

    /// Methods that are never logged
    #[must_use]
    pub fn with_excluded_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_methods = methods.into_iter().map(Into::into).collect();
        self
    }

    /// Calls taking longer than `threshold` are logged at `warn`
    #[must_use]
    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }
}

#[async_trait]
impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn intercept(&self, call: Call, next: Next<'_>) -> CallResult {
        if self.excluded_methods.contains(&call.method) {
            return next.run(call).await;
        }

        let method = call.method.clone();
        let caller = call
            .context
            .caller
            .as_ref()
            .or(call.peer.as_ref())
            .map(|p| p.uri.clone());
        let request_id = call.context.request_id.clone();
        let streaming = call.kind == CallKind::Streaming;
        let request_bytes = call.request_bytes();

        let started = Instant::now();
        let result = next.run(call).await;
        let elapsed = started.elapsed();
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        match &result {
            Err(status) => error!(
                method = %method,
                caller = caller.as_deref().unwrap_or("-"),
                request_id = %request_id,
                streaming,
                request_bytes,
                duration_ms,
                code = %status.code,
                message = %status.message,
                "Call failed"
            ),
            Ok(reply) if elapsed > self.slow_threshold => warn!(
                method = %method,
                caller = caller.as_deref().unwrap_or("-"),
                request_id = %request_id,
                streaming,
                request_bytes,
                response_bytes = reply.response_bytes(),
                duration_ms,
                threshold_ms = u64::try_from(self.slow_threshold.as_millis()).unwrap_or(u64::MAX),
                "Slow call"
            ),
            Ok(reply) => info!(
                method = %method,
                caller = caller.as_deref().unwrap_or("-"),
                request_id = %request_id,
                streaming,
                request_bytes,
                response_bytes = reply.response_bytes(),
                duration_ms,
                "Call completed"
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;
    use crate::interceptor::{Pipeline, Reply, handler_fn};

    #[tokio::test]
    async fn results_pass_through_unchanged() {
        let pipeline = Pipeline::builder()
            .with_logging(LoggingInterceptor::new().with_slow_threshold(Duration::ZERO))
            .build(handler_fn(|call: Call| async move {
                match call.method.as_str() {
                    "/svc/Ok" => Ok(Reply::message("fine")),
                    _ => Err(Status::internal("broken")),
                }
            }));

        assert_eq!(
            pipeline.dispatch(Call::new("/svc/Ok")).await.unwrap(),
            Reply::message("fine")
        );
        assert_eq!(
            pipeline.dispatch(Call::new("/svc/Bad")).await.unwrap_err(),
            Status::internal("broken")
        );
    }

    #[tokio::test]
    async fn excluded_methods_still_reach_the_handler() {
        let pipeline = Pipeline::builder()
            .with_logging(LoggingInterceptor::new().with_excluded_methods(["/health"]))
            .build(handler_fn(|_call: Call| async { Ok(Reply::message("up")) }));
        assert!(pipeline.dispatch(Call::new("/health")).await.is_ok());
    }
}

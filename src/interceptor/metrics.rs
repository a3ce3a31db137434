//! Call metrics.
//!
//! [`CallMetrics`] keeps in-process counters that tests and the service can
//! read back, and mirrors every update into the `metrics` facade so any
//! installed recorder (Prometheus, statsd, ...) sees the same data.
//!
//! Method names come from the wire, so only the first
//! [`DEFAULT_MAX_METHOD_LABELS`] distinct methods get their own label; later
//! ones are counted under [`OTHER_METHOD`].

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use telemetry_metrics::{counter, gauge, histogram};

use super::{Call, CallKind, CallResult, Interceptor, Next};
use crate::error::StatusCode;

/// Caller label for calls without an authenticated caller
pub const UNAUTHENTICATED_CALLER: &str = "unauthenticated";

/// Method label once the distinct-method limit is reached
pub const OTHER_METHOD: &str = "other";

/// Distinct method labels tracked by [`CallMetrics::new`]
pub const DEFAULT_MAX_METHOD_LABELS: usize = 256;

/// Stream message direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Caller to handler
    Received,
    /// Handler to caller
    Sent,
}

impl Direction {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Sent => "sent",
        }
    }
}

/// Authentication outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthOutcome {
    /// Peer admitted
    Success,
    /// Peer rejected
    Failure,
}

impl AuthOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RequestKey {
    method: String,
    caller: String,
    code: StatusCode,
}

#[derive(Default)]
struct Latency {
    count: AtomicU64,
    total_micros: AtomicU64,
    max_micros: AtomicU64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Call counters shared by the auth and metrics interceptors.
pub struct CallMetrics {
    methods: DashSet<String>,
    max_methods: usize,
    requests: DashMap<RequestKey, AtomicU64>,
    latency: DashMap<String, Latency>,
    active: DashMap<String, AtomicI64>,
    stream_messages: DashMap<(String, Direction), AtomicU64>,
    auth: DashMap<(String, AuthOutcome), AtomicU64>,
}

impl Default for CallMetrics {
    fn default() -> Self {
        Self::with_max_methods(DEFAULT_MAX_METHOD_LABELS)
    }
}

impl CallMetrics {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty registry labelling at most `max_methods` distinct methods
    #[must_use]
    pub fn with_max_methods(max_methods: usize) -> Self {
        Self {
            methods: DashSet::new(),
            max_methods,
            requests: DashMap::new(),
            latency: DashMap::new(),
            active: DashMap::new(),
            stream_messages: DashMap::new(),
            auth: DashMap::new(),
        }
    }

    /// Label for `method`, claiming a slot if one is free.
    ///
    /// Concurrent first sightings may overshoot the limit by the number of
    /// racing callers.
    fn method_label(&self, method: &str) -> String {
        if self.methods.contains(method) {
            return method.to_owned();
        }
        if self.methods.len() >= self.max_methods {
            return OTHER_METHOD.to_owned();
        }
        self.methods.insert(method.to_owned());
        method.to_owned()
    }

    /// Label `method` was or would be recorded under, without claiming a slot
    fn query_label<'a>(&self, method: &'a str) -> &'a str {
        if !self.methods.contains(method) && self.methods.len() >= self.max_methods {
            OTHER_METHOD
        } else {
            method
        }
    }

    /// Count a finished call
    pub fn record_request(&self, method: &str, caller: &str, code: StatusCode) {
        let method = self.method_label(method);
        self.requests
            .entry(RequestKey {
                method: method.clone(),
                caller: caller.to_owned(),
                code,
            })
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        counter!(
            "identity_mesh_requests_total",
            "method" => method,
            "caller" => caller.to_owned(),
            "code" => code.as_str()
        )
        .increment(1);
    }

    /// Record call latency
    pub fn record_latency(&self, method: &str, elapsed: Duration) {
        let method = self.method_label(method);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        {
            let entry = self.latency.entry(method.clone()).or_default();
            entry.count.fetch_add(1, Ordering::Relaxed);
            entry.total_micros.fetch_add(micros, Ordering::Relaxed);
            entry.max_micros.fetch_max(micros, Ordering::Relaxed);
        }
        histogram!("identity_mesh_request_duration_seconds", "method" => method)
            .record(elapsed.as_secs_f64());
    }

    /// A call entered the handler
    pub fn call_started(&self, method: &str) {
        let method = self.method_label(method);
        self.active
            .entry(method.clone())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        gauge!("identity_mesh_active_requests", "method" => method).increment(1.0);
    }

    /// A call left the handler
    pub fn call_finished(&self, method: &str) {
        let method = self.query_label(method).to_owned();
        if let Some(gauge) = self.active.get(&method) {
            gauge.fetch_sub(1, Ordering::Relaxed);
        }
        gauge!("identity_mesh_active_requests", "method" => method).decrement(1.0);
    }

    /// Count stream messages
    pub fn record_stream_messages(&self, method: &str, direction: Direction, count: u64) {
        if count == 0 {
            return;
        }
        let method = self.method_label(method);
        self.stream_messages
            .entry((method.clone(), direction))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(count, Ordering::Relaxed);
        counter!(
            "identity_mesh_stream_messages_total",
            "method" => method,
            "direction" => direction.as_str()
        )
        .increment(count);
    }

    /// Count an authentication decision
    pub fn record_auth(&self, caller: &str, outcome: AuthOutcome) {
        self.auth
            .entry((caller.to_owned(), outcome))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        counter!(
            "identity_mesh_authentication_total",
            "caller" => caller.to_owned(),
            "result" => outcome.as_str()
        )
        .increment(1);
    }

    // ── queries ──

    /// Calls counted for `caller`, any method and code
    #[must_use]
    pub fn requests_for_caller(&self, caller: &str) -> u64 {
        self.requests
            .iter()
            .filter(|e| e.key().caller == caller)
            .map(|e| e.value().load(Ordering::Relaxed))
            .sum()
    }

    /// Calls counted for one (method, caller, code)
    #[must_use]
    pub fn requests(&self, method: &str, caller: &str, code: StatusCode) -> u64 {
        self.requests
            .get(&RequestKey {
                method: self.query_label(method).to_owned(),
                caller: caller.to_owned(),
                code,
            })
            .map_or(0, |v| v.load(Ordering::Relaxed))
    }

    /// Total calls counted
    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.requests
            .iter()
            .map(|e| e.value().load(Ordering::Relaxed))
            .sum()
    }

    /// Authentication decisions with `outcome`, all callers
    #[must_use]
    pub fn auth_total(&self, outcome: AuthOutcome) -> u64 {
        self.auth
            .iter()
            .filter(|e| e.key().1 == outcome)
            .map(|e| e.value().load(Ordering::Relaxed))
            .sum()
    }

    /// Authentication failures, all callers
    #[must_use]
    pub fn auth_failures(&self) -> u64 {
        self.auth_total(AuthOutcome::Failure)
    }

    /// Calls currently inside the handler for `method`
    #[must_use]
    pub fn active_calls(&self, method: &str) -> i64 {
        self.active
            .get(self.query_label(method))
            .map_or(0, |v| v.load(Ordering::Relaxed))
    }

    /// Stream messages counted for `method` in `direction`
    #[must_use]
    pub fn stream_messages(&self, method: &str, direction: Direction) -> u64 {
        self.stream_messages
            .get(&(self.query_label(method).to_owned(), direction))
            .map_or(0, |v| v.load(Ordering::Relaxed))
    }

    /// Point-in-time copy of every counter
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut requests: Vec<RequestCount> = self
            .requests
            .iter()
            .map(|e| RequestCount {
                method: e.key().method.clone(),
                caller: e.key().caller.clone(),
                code: e.key().code,
                count: e.value().load(Ordering::Relaxed),
            })
            .collect();
        requests.sort_by(|a, b| (&a.method, &a.caller).cmp(&(&b.method, &b.caller)));

        let mut latency: Vec<LatencySummary> = self
            .latency
            .iter()
            .map(|e| {
                let count = e.value().count.load(Ordering::Relaxed);
                let total = e.value().total_micros.load(Ordering::Relaxed);
                LatencySummary {
                    method: e.key().clone(),
                    count,
                    mean_micros: total.checked_div(count).unwrap_or(0),
                    max_micros: e.value().max_micros.load(Ordering::Relaxed),
                }
            })
            .collect();
        latency.sort_by(|a, b| a.method.cmp(&b.method));

        MetricsSnapshot {
            requests,
            latency,
            auth_successes: self.auth_total(AuthOutcome::Success),
            auth_failures: self.auth_failures(),
        }
    }
}

/// Serializable counter dump
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Per (method, caller, code) counts
    pub requests: Vec<RequestCount>,
    /// Per-method latency
    pub latency: Vec<LatencySummary>,
    /// Admitted peers
    pub auth_successes: u64,
    /// Rejected peers
    pub auth_failures: u64,
}

/// One request counter
#[derive(Debug, Clone, Serialize)]
pub struct RequestCount {
    /// Method
    pub method: String,
    /// Caller short name
    pub caller: String,
    /// Result code
    pub code: StatusCode,
    /// Count
    pub count: u64,
}

/// Latency for one method
#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    /// Method
    pub method: String,
    /// Calls measured
    pub count: u64,
    /// Mean latency
    pub mean_micros: u64,
    /// Worst latency
    pub max_micros: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Interceptor
// ─────────────────────────────────────────────────────────────────────────────

/// Records counts, latency and active calls; never changes the result.
pub struct MetricsInterceptor {
    metrics: Arc<CallMetrics>,
}

impl MetricsInterceptor {
    /// Interceptor writing into `metrics`
    #[must_use]
    pub fn new(metrics: Arc<CallMetrics>) -> Self {
        Self { metrics }
    }

    /// Registry being written
    #[must_use]
    pub fn metrics(&self) -> &Arc<CallMetrics> {
        &self.metrics
    }
}

/// Decrements the active gauge even if the handler future is dropped.
struct ActiveGuard<'a> {
    metrics: &'a CallMetrics,
    method: &'a str,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.metrics.call_finished(self.method);
    }
}

#[async_trait]
impl Interceptor for MetricsInterceptor {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn intercept(&self, call: Call, next: Next<'_>) -> CallResult {
        let method = call.method.clone();
        let caller = call
            .context
            .caller
            .as_ref()
            .or(call.peer.as_ref())
            .map_or_else(|| UNAUTHENTICATED_CALLER.to_owned(), |p| p.short_name.clone());
        let streaming = call.kind == CallKind::Streaming;
        if streaming {
            self.metrics.record_stream_messages(
                &method,
                Direction::Received,
                call.messages.len() as u64,
            );
        }

        self.metrics.call_started(&method);
        let _active = ActiveGuard {
            metrics: &self.metrics,
            method: &method,
        };
        let started = Instant::now();
        let result = next.run(call).await;
        self.metrics.record_latency(&method, started.elapsed());

        let code = match &result {
            Ok(reply) => {
                if streaming {
                    self.metrics.record_stream_messages(
                        &method,
                        Direction::Sent,
                        reply.messages.len() as u64,
                    );
                }
                StatusCode::Ok
            }
            Err(status) => status.code,
        };
        self.metrics.record_request(&method, &caller, code);
        result
    }
}

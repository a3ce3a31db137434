//! Per-call authorization against the allow-list.
//!
//! The handshake verifier already rejects unauthorized peers; this stage
//! re-checks at the call layer so that policy holds for transports that do
//! not run the verifier, and so every decision is counted.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::metrics::{AuthOutcome, CallMetrics};
use super::{Call, CallResult, Interceptor, Next};
use crate::error::Status;
use crate::policy::AuthenticationPolicy;

/// Label recorded for calls that present no identity
const UNKNOWN_CALLER: &str = "unknown";

/// Admits calls whose verified peer is on the policy's client allow-list.
pub struct AuthInterceptor {
    policy: Arc<AuthenticationPolicy>,
    skip_methods: HashSet<String>,
    metrics: Option<Arc<CallMetrics>>,
}

impl AuthInterceptor {
    /// Enforce `policy` on every method
    #[must_use]
    pub fn new(policy: Arc<AuthenticationPolicy>) -> Self {
        Self {
            policy,
            skip_methods: HashSet::new(),
            metrics: None,
        }
    }

    /// Methods admitted without a check
    #[must_use]
    pub fn with_skip_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_methods = methods.into_iter().map(Into::into).collect();
        self
    }

    /// Record every decision in `metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<CallMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn record(&self, caller: &str, outcome: AuthOutcome) {
        if let Some(metrics) = &self.metrics {
            metrics.record_auth(caller, outcome);
        }
    }
}

#[async_trait]
impl Interceptor for AuthInterceptor {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn intercept(&self, mut call: Call, next: Next<'_>) -> CallResult {
        if self.skip_methods.contains(&call.method) {
            debug!(method = %call.method, "Authentication skipped for method");
            return next.run(call).await;
        }

        let Some(peer) = call.peer.clone() else {
            warn!(method = %call.method, "Call without verified peer identity rejected");
            self.record(UNKNOWN_CALLER, AuthOutcome::Failure);
            return Err(Status::unauthenticated("peer identity required"));
        };

        let owner = self.policy.owner();
        if peer.trust_domain != owner.trust_domain() {
            warn!(
                method = %call.method,
                peer = %peer,
                expected_domain = owner.trust_domain(),
                "Caller from foreign trust domain rejected"
            );
            self.record(&peer.short_name, AuthOutcome::Failure);
            return Err(Status::permission_denied("caller not authorized"));
        }

        let decision = self.policy.client_decision(&peer.short_name);
        if !decision.is_allowed() {
            warn!(method = %call.method, peer = %peer, "Caller not on allow-list");
            self.record(&peer.short_name, AuthOutcome::Failure);
            return Err(Status::permission_denied("caller not authorized"));
        }

        debug!(method = %call.method, peer = %peer, decision = ?decision, "Caller admitted");
        self.record(&peer.short_name, AuthOutcome::Success);
        call.context.caller = Some(peer);
        call.context.authenticated = true;
        next.run(call).await
    }
}

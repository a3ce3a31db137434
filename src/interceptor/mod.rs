//! Per-call interceptor pipeline.
//!
//! A [`Pipeline`] runs a fixed chain in front of a [`Handler`]:
//!
//! 1. [`AuthInterceptor`]: verified peer identity against the allow-list
//! 2. [`PropagationInterceptor`]: request id, caller, call chain
//! 3. [`LoggingInterceptor`]: structured call log
//! 4. [`MetricsInterceptor`]: counters, latency, active calls
//!
//! Each stage is optional. A rejected call stops at the stage that rejected
//! it, so later stages never see it.

pub mod auth;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod propagation;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use auth::AuthInterceptor;
pub use logging::LoggingInterceptor;
pub use metrics::{AuthOutcome, CallMetrics, Direction, MetricsInterceptor, MetricsSnapshot};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use propagation::{CallContext, OutboundPropagator, PropagationInterceptor};

use crate::error::Status;
use crate::identity::PeerIdentity;

/// Call metadata; keys are lowercase
pub type Metadata = BTreeMap<String, String>;

/// Outcome of a call as seen by interceptors
pub type CallResult = std::result::Result<Reply, Status>;

/// Call shape
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    /// One request message, one response message
    #[default]
    Unary,
    /// Any number of messages each way
    Streaming,
}

// ─────────────────────────────────────────────────────────────────────────────
// Call / Reply
// ─────────────────────────────────────────────────────────────────────────────

/// An inbound call travelling through the pipeline.
#[derive(Debug, Clone)]
pub struct Call {
    /// Fully qualified method name, e.g. `/billing.v1.Billing/Charge`
    pub method: String,
    /// Call shape
    pub kind: CallKind,
    /// Identity verified by the transport handshake
    pub peer: Option<PeerIdentity>,
    /// Caller-supplied metadata
    pub metadata: Metadata,
    /// Request messages
    pub messages: Vec<Bytes>,
    /// Context filled in by interceptors
    pub context: CallContext,
}

impl Call {
    /// Unary call to `method` with no peer and no payload
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            kind: CallKind::Unary,
            peer: None,
            metadata: Metadata::new(),
            messages: Vec::new(),
            context: CallContext::default(),
        }
    }

    /// Set the verified peer
    #[must_use]
    pub fn with_peer(mut self, peer: PeerIdentity) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Add a metadata entry (key lowercased)
    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_ascii_lowercase(), value.into());
        self
    }

    /// Append a request message
    #[must_use]
    pub fn with_message(mut self, message: impl Into<Bytes>) -> Self {
        self.messages.push(message.into());
        self
    }

    /// Mark as streaming
    #[must_use]
    pub fn streaming(mut self) -> Self {
        self.kind = CallKind::Streaming;
        self
    }

    /// Total request payload size
    #[must_use]
    pub fn request_bytes(&self) -> usize {
        self.messages.iter().map(Bytes::len).sum()
    }
}

/// Successful call result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    /// Response metadata
    pub metadata: Metadata,
    /// Response messages
    pub messages: Vec<Bytes>,
}

impl Reply {
    /// Reply carrying `messages`
    #[must_use]
    pub fn new(messages: Vec<Bytes>) -> Self {
        Self {
            metadata: Metadata::new(),
            messages,
        }
    }

    /// Single-message reply
    pub fn message(message: impl Into<Bytes>) -> Self {
        Self::new(vec![message.into()])
    }

    /// Total response payload size
    #[must_use]
    pub fn response_bytes(&self) -> usize {
        self.messages.iter().map(Bytes::len).sum()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handler / Interceptor
// ─────────────────────────────────────────────────────────────────────────────

/// Application handler at the end of the pipeline.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle an admitted call
    async fn handle(&self, call: Call) -> CallResult;
}

/// Handler built from an async closure; see [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap `f` as a [`Handler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
{
    async fn handle(&self, call: Call) -> CallResult {
        (self.0)(call).await
    }
}

/// A pipeline stage.
///
/// Implementations either return early (rejecting the call) or hand the call
/// on with `next.run(call)`.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Stage name for diagnostics
    fn name(&self) -> &'static str;

    /// Process `call`
    async fn intercept(&self, call: Call, next: Next<'_>) -> CallResult;
}

/// The rest of the chain after the current interceptor.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Interceptor>],
    handler: &'a dyn Handler,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Interceptor>], handler: &'a dyn Handler) -> Self {
        Self { chain, handler }
    }

    /// Run the remaining interceptors and then the handler
    pub async fn run(self, call: Call) -> CallResult {
        match self.chain.split_first() {
            Some((first, rest)) => first.intercept(call, Next::new(rest, self.handler)).await,
            None => self.handler.handle(call).await,
        }
    }
}

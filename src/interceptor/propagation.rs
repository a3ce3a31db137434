//! Identity propagation across service hops.
//!
//! Inbound, [`PropagationInterceptor`] reads the request id and call chain
//! from metadata, appends the verified caller and makes the resulting
//! [`CallContext`] available to the handler through a task-local. Outbound,
//! [`OutboundPropagator`] turns the current context into metadata for the
//! next hop, extending the chain with this service's own identity.
//!
//! Chains longer than the configured depth, or chains that already contain
//! the receiving service, are rejected to break call loops.

use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Call, CallResult, Interceptor, Metadata, Next};
use crate::error::Status;
use crate::identity::{PeerIdentity, ServiceIdentity};

/// Request id header
pub const REQUEST_ID: &str = "x-request-id";
/// First caller in the chain
pub const ORIGINAL_CALLER: &str = "x-original-caller";
/// Identity URIs of every hop so far
pub const CALL_CHAIN: &str = "x-call-chain";
/// Trust domain of the sending service
pub const TRUST_DOMAIN: &str = "x-trust-domain";
/// Name of the sending service
pub const SERVICE_NAME: &str = "x-service-name";
/// Send time, milliseconds since the Unix epoch
pub const REQUEST_TIMESTAMP: &str = "x-request-timestamp";

/// Separator between call-chain entries
pub const CHAIN_SEPARATOR: &str = " -> ";

/// Longest request id accepted from a caller
const MAX_REQUEST_ID_LEN: usize = 128;

tokio::task_local! {
    static CURRENT_CALL: CallContext;
}

/// Context of the call currently being handled, if any
#[must_use]
pub fn current() -> Option<CallContext> {
    CURRENT_CALL.try_with(Clone::clone).ok()
}

/// Run `fut` with `context` as the current call
pub async fn with_context<F: Future>(context: CallContext, fut: F) -> F::Output {
    CURRENT_CALL.scope(context, fut).await
}

/// Per-call identity context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallContext {
    /// Request id, shared by every hop
    pub request_id: String,
    /// Verified immediate caller
    pub caller: Option<PeerIdentity>,
    /// First caller in the chain (identity URI)
    pub original_caller: Option<String>,
    /// Identity URIs of every hop, oldest first, immediate caller last
    pub call_chain: Vec<String>,
    /// Inbound metadata selected for forwarding
    pub forwarded: Metadata,
    /// Set once the auth stage has admitted the caller
    pub authenticated: bool,
}

fn parse_chain(raw: Option<&String>) -> Vec<String> {
    raw.map(|value| {
        value
            .split(CHAIN_SEPARATOR)
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
            .map(str::to_owned)
            .collect()
    })
    .unwrap_or_default()
}

fn valid_request_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

fn new_request_id() -> String {
    format!("req-{}", Uuid::new_v4())
}

fn lowercase_all(headers: Vec<String>) -> Vec<String> {
    headers.into_iter().map(|h| h.to_ascii_lowercase()).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

/// Builds the [`CallContext`] for inbound calls.
pub struct PropagationInterceptor {
    identity: ServiceIdentity,
    max_depth: usize,
    forwarded_headers: Vec<String>,
}

impl PropagationInterceptor {
    /// Interceptor for the service `identity`, depth limit 10
    #[must_use]
    pub fn new(identity: ServiceIdentity) -> Self {
        Self {
            identity,
            max_depth: 10,
            forwarded_headers: Vec::new(),
        }
    }

    /// Maximum chain length, including the immediate caller
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Extra metadata keys copied into the context for forwarding
    #[must_use]
    pub fn with_forwarded_headers(mut self, headers: Vec<String>) -> Self {
        self.forwarded_headers = lowercase_all(headers);
        self
    }

    fn build_context(&self, call: &Call) -> Result<CallContext, Status> {
        let mut chain = parse_chain(call.metadata.get(CALL_CHAIN));
        let caller = call.context.caller.clone().or_else(|| call.peer.clone());

        if let Some(peer) = &caller {
            if chain.last() != Some(&peer.uri) {
                chain.push(peer.uri.clone());
            }
        }

        if chain.len() > self.max_depth {
            warn!(
                method = %call.method,
                depth = chain.len(),
                max_depth = self.max_depth,
                "Call chain too deep"
            );
            return Err(Status::permission_denied("call chain too deep"));
        }
        if chain.iter().any(|hop| hop == self.identity.uri()) {
            warn!(
                method = %call.method,
                service = %self.identity,
                "Call chain already contains this service"
            );
            return Err(Status::permission_denied("call chain contains a cycle"));
        }

        let request_id = call
            .metadata
            .get(REQUEST_ID)
            .filter(|id| valid_request_id(id))
            .cloned()
            .unwrap_or_else(new_request_id);

        let original_caller = call
            .metadata
            .get(ORIGINAL_CALLER)
            .cloned()
            .or_else(|| chain.first().cloned());

        let forwarded = self
            .forwarded_headers
            .iter()
            .filter_map(|key| call.metadata.get(key).map(|v| (key.clone(), v.clone())))
            .collect();

        Ok(CallContext {
            request_id,
            caller,
            original_caller,
            call_chain: chain,
            forwarded,
            authenticated: call.context.authenticated,
        })
    }
}

#[async_trait]
impl Interceptor for PropagationInterceptor {
    fn name(&self) -> &'static str {
        "propagation"
    }

    async fn intercept(&self, mut call: Call, next: Next<'_>) -> CallResult {
        let context = self.build_context(&call)?;
        debug!(
            request_id = %context.request_id,
            method = %call.method,
            depth = context.call_chain.len(),
            "Call context established"
        );
        call.context = context.clone();
        let request_id = context.request_id.clone();

        let mut reply = with_context(context, next.run(call)).await?;
        reply
            .metadata
            .entry(REQUEST_ID.to_owned())
            .or_insert(request_id);
        Ok(reply)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

/// Produces metadata for calls made by this service.
#[derive(Debug, Clone)]
pub struct OutboundPropagator {
    identity: ServiceIdentity,
    max_depth: usize,
    forwarded_headers: Vec<String>,
}

impl OutboundPropagator {
    /// Propagator for the service `identity`, depth limit 10
    #[must_use]
    pub fn new(identity: ServiceIdentity) -> Self {
        Self {
            identity,
            max_depth: 10,
            forwarded_headers: Vec::new(),
        }
    }

    /// Maximum chain length after appending this service
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Keys copied from the inbound context's forwarded metadata
    #[must_use]
    pub fn with_forwarded_headers(mut self, headers: Vec<String>) -> Self {
        self.forwarded_headers = lowercase_all(headers);
        self
    }

    /// Metadata for an outbound call made while handling `inbound`.
    ///
    /// Without an inbound context this service starts a new chain with a
    /// fresh request id.
    pub fn outbound_metadata(&self, inbound: Option<&CallContext>) -> Result<Metadata, Status> {
        let own = self.identity.uri().to_owned();
        let mut chain = inbound.map(|c| c.call_chain.clone()).unwrap_or_default();
        if chain.contains(&own) {
            return Err(Status::permission_denied("call chain contains a cycle"));
        }
        chain.push(own.clone());
        if chain.len() > self.max_depth {
            return Err(Status::permission_denied("call chain too deep"));
        }

        let request_id = inbound
            .map(|c| c.request_id.clone())
            .filter(|id| valid_request_id(id))
            .unwrap_or_else(new_request_id);
        let original_caller = inbound
            .and_then(|c| c.original_caller.clone())
            .or_else(|| chain.first().cloned())
            .unwrap_or(own);

        let mut metadata = Metadata::new();
        if let Some(context) = inbound {
            for key in &self.forwarded_headers {
                if let Some(value) = context.forwarded.get(key) {
                    metadata.insert(key.clone(), value.clone());
                }
            }
        }
        metadata.insert(REQUEST_ID.to_owned(), request_id);
        metadata.insert(ORIGINAL_CALLER.to_owned(), original_caller);
        metadata.insert(CALL_CHAIN.to_owned(), chain.join(CHAIN_SEPARATOR));
        metadata.insert(TRUST_DOMAIN.to_owned(), self.identity.trust_domain().to_owned());
        metadata.insert(SERVICE_NAME.to_owned(), self.identity.name().to_owned());
        metadata.insert(REQUEST_TIMESTAMP.to_owned(), unix_millis().to_string());
        Ok(metadata)
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusCode;
    use crate::interceptor::{Pipeline, Reply, handler_fn};

    // ─── helpers ─────────────────────────────────────────────────────────────

    fn identity(name: &str) -> ServiceIdentity {
        ServiceIdentity::new(name, "example.org").unwrap()
    }

    fn peer(name: &str) -> PeerIdentity {
        PeerIdentity::from_uri(&format!("spiffe://example.org/{name}")).unwrap()
    }

    /// Pipeline whose handler echoes the task-local context as JSON
    fn echo_pipeline(interceptor: PropagationInterceptor) -> Pipeline {
        Pipeline::builder()
            .with_propagation(interceptor)
            .build(handler_fn(|_call: Call| async {
                let context = current().ok_or_else(|| Status::internal("no context"))?;
                let body =
                    serde_json::to_vec(&context).map_err(|e| Status::internal(e.to_string()))?;
                Ok(Reply::message(body))
            }))
    }

    fn context_of(reply: &Reply) -> serde_json::Value {
        serde_json::from_slice(&reply.messages[0]).unwrap()
    }

    // ─── Inbound ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn first_hop_gets_generated_request_id_and_single_entry_chain() {
        let pipeline = echo_pipeline(PropagationInterceptor::new(identity("payments")));

        let reply = pipeline
            .dispatch(Call::new("/svc/Pay").with_peer(peer("frontend")))
            .await
            .unwrap();

        let ctx = context_of(&reply);
        let request_id = ctx["request_id"].as_str().unwrap();
        assert!(request_id.starts_with("req-"));
        assert_eq!(reply.metadata[REQUEST_ID], request_id);
        assert_eq!(ctx["call_chain"], serde_json::json!(["spiffe://example.org/frontend"]));
        assert_eq!(ctx["original_caller"], "spiffe://example.org/frontend");
    }

    #[tokio::test]
    async fn inbound_request_id_and_chain_are_continued() {
        // GIVEN: a call that already passed through edge-proxy
        let pipeline = echo_pipeline(PropagationInterceptor::new(identity("payments")));
        let call = Call::new("/svc/Pay")
            .with_peer(peer("frontend"))
            .with_metadata(REQUEST_ID, "req-abc")
            .with_metadata(CALL_CHAIN, "spiffe://example.org/edge-proxy")
            .with_metadata(ORIGINAL_CALLER, "spiffe://example.org/edge-proxy");

        // WHEN: handled
        let reply = pipeline.dispatch(call).await.unwrap();

        // THEN: the id is kept and the caller is appended
        let ctx = context_of(&reply);
        assert_eq!(ctx["request_id"], "req-abc");
        assert_eq!(
            ctx["call_chain"],
            serde_json::json!(["spiffe://example.org/edge-proxy", "spiffe://example.org/frontend"])
        );
        assert_eq!(ctx["original_caller"], "spiffe://example.org/edge-proxy");
    }

    #[tokio::test]
    async fn malformed_request_id_is_replaced() {
        let pipeline = echo_pipeline(PropagationInterceptor::new(identity("payments")));
        let call = Call::new("/svc/Pay").with_metadata(REQUEST_ID, "bad id\nwith newline");
        let reply = pipeline.dispatch(call).await.unwrap();
        assert!(context_of(&reply)["request_id"].as_str().unwrap().starts_with("req-"));
    }

    #[tokio::test]
    async fn chain_containing_this_service_is_rejected() {
        let pipeline = echo_pipeline(PropagationInterceptor::new(identity("payments")));
        let call = Call::new("/svc/Pay")
            .with_peer(peer("frontend"))
            .with_metadata(CALL_CHAIN, "spiffe://example.org/payments");
        let status = pipeline.dispatch(call).await.unwrap_err();
        assert_eq!(status.code, StatusCode::PermissionDenied);
    }

    #[tokio::test]
    async fn chain_over_depth_limit_is_rejected() {
        let pipeline =
            echo_pipeline(PropagationInterceptor::new(identity("payments")).with_max_depth(2));
        let call = Call::new("/svc/Pay")
            .with_peer(peer("c"))
            .with_metadata(CALL_CHAIN, "spiffe://example.org/a -> spiffe://example.org/b");
        let status = pipeline.dispatch(call).await.unwrap_err();
        assert_eq!(status.code, StatusCode::PermissionDenied);
    }

    #[tokio::test]
    async fn selected_headers_are_captured_for_forwarding() {
        let pipeline = echo_pipeline(
            PropagationInterceptor::new(identity("payments"))
                .with_forwarded_headers(vec!["X-Tenant".into()]),
        );
        let call = Call::new("/svc/Pay")
            .with_metadata("x-tenant", "acme")
            .with_metadata("authorization", "secret");
        let reply = pipeline.dispatch(call).await.unwrap();
        assert_eq!(context_of(&reply)["forwarded"], serde_json::json!({"x-tenant": "acme"}));
    }

    #[test]
    fn no_context_outside_a_call() {
        assert!(current().is_none());
    }

    // ─── Outbound ────────────────────────────────────────────────────────────

    #[test]
    fn outbound_without_context_starts_new_chain() {
        let propagator = OutboundPropagator::new(identity("payments"));
        let md = propagator.outbound_metadata(None).unwrap();
        assert!(md[REQUEST_ID].starts_with("req-"));
        assert_eq!(md[CALL_CHAIN], "spiffe://example.org/payments");
        assert_eq!(md[ORIGINAL_CALLER], "spiffe://example.org/payments");
        assert_eq!(md[SERVICE_NAME], "payments");
        assert_eq!(md[TRUST_DOMAIN], "example.org");
        assert!(md[REQUEST_TIMESTAMP].parse::<u128>().is_ok());
    }

    #[test]
    fn outbound_extends_inbound_chain() {
        let inbound = CallContext {
            request_id: "req-1".into(),
            caller: Some(peer("frontend")),
            original_caller: Some("spiffe://example.org/frontend".into()),
            call_chain: vec!["spiffe://example.org/frontend".into()],
            forwarded: Metadata::from([("x-tenant".to_owned(), "acme".to_owned())]),
            authenticated: true,
        };
        let propagator = OutboundPropagator::new(identity("payments"))
            .with_forwarded_headers(vec!["x-tenant".into()]);

        let md = propagator.outbound_metadata(Some(&inbound)).unwrap();

        assert_eq!(md[REQUEST_ID], "req-1");
        assert_eq!(
            md[CALL_CHAIN],
            "spiffe://example.org/frontend -> spiffe://example.org/payments"
        );
        assert_eq!(md[ORIGINAL_CALLER], "spiffe://example.org/frontend");
        assert_eq!(md["x-tenant"], "acme");
    }

    #[test]
    fn outbound_refuses_to_exceed_depth() {
        let inbound = CallContext {
            request_id: "req-1".into(),
            call_chain: vec!["spiffe://example.org/a".into(), "spiffe://example.org/b".into()],
            ..CallContext::default()
        };
        let propagator = OutboundPropagator::new(identity("payments")).with_max_depth(2);
        let status = propagator.outbound_metadata(Some(&inbound)).unwrap_err();
        assert_eq!(status.code, StatusCode::PermissionDenied);
    }
}

//! Interceptor chain assembly.

use std::sync::Arc;

use tracing::debug;

use super::auth::AuthInterceptor;
use super::logging::LoggingInterceptor;
use super::metrics::{CallMetrics, MetricsInterceptor};
use super::propagation::PropagationInterceptor;
use super::{Call, CallResult, Handler, Interceptor, Next};
use crate::config::InterceptorConfig;
use crate::identity::ServiceIdentity;
use crate::policy::AuthenticationPolicy;

/// Ordered interceptors in front of a handler.
pub struct Pipeline {
    chain: Vec<Arc<dyn Interceptor>>,
    handler: Arc<dyn Handler>,
}

impl Pipeline {
    /// Start building a pipeline
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Run `call` through every interceptor and then the handler
    pub async fn dispatch(&self, call: Call) -> CallResult {
        Next::new(&self.chain, self.handler.as_ref()).run(call).await
    }

    /// Interceptor names in execution order
    #[must_use]
    pub fn interceptor_names(&self) -> Vec<&'static str> {
        self.chain.iter().map(|i| i.name()).collect()
    }
}

/// Builder for [`Pipeline`].
///
/// The built-in stages always run in the order auth, propagation, logging,
/// metrics regardless of the order they were added in; extra interceptors
/// run after them, in insertion order.
#[derive(Default)]
pub struct PipelineBuilder {
    auth: Option<AuthInterceptor>,
    propagation: Option<PropagationInterceptor>,
    logging: Option<LoggingInterceptor>,
    metrics: Option<MetricsInterceptor>,
    extra: Vec<Arc<dyn Interceptor>>,
}

impl PipelineBuilder {
    /// Set the auth stage
    #[must_use]
    pub fn with_auth(mut self, auth: AuthInterceptor) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Set the propagation stage
    #[must_use]
    pub fn with_propagation(mut self, propagation: PropagationInterceptor) -> Self {
        self.propagation = Some(propagation);
        self
    }

    /// Set the logging stage
    #[must_use]
    pub fn with_logging(mut self, logging: LoggingInterceptor) -> Self {
        self.logging = Some(logging);
        self
    }

    /// Set the metrics stage
    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsInterceptor) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Append a custom interceptor
    #[must_use]
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.extra.push(interceptor);
        self
    }

    /// Stages enabled in `config`, wired to `policy`, `identity` and
    /// `metrics`
    #[must_use]
    pub fn from_config(
        config: &InterceptorConfig,
        policy: Arc<AuthenticationPolicy>,
        identity: ServiceIdentity,
        metrics: Arc<CallMetrics>,
    ) -> Self {
        let mut builder = Self::default();
        if config.auth {
            builder = builder.with_auth(
                AuthInterceptor::new(policy)
                    .with_skip_methods(config.skip_methods.iter().cloned())
                    .with_metrics(Arc::clone(&metrics)),
            );
        }
        if config.propagation {
            builder = builder.with_propagation(
                PropagationInterceptor::new(identity)
                    .with_max_depth(config.max_call_chain_depth)
                    .with_forwarded_headers(config.forwarded_headers.clone()),
            );
        }
        if config.logging {
            builder = builder.with_logging(
                LoggingInterceptor::new()
                    .with_excluded_methods(config.excluded_log_methods.iter().cloned())
                    .with_slow_threshold(config.slow_call_threshold),
            );
        }
        if config.metrics {
            builder = builder.with_metrics(MetricsInterceptor::new(metrics));
        }
        builder
    }

    /// Finish with `handler` at the end of the chain
    pub fn build(self, handler: impl Handler + 'static) -> Pipeline {
        self.build_shared(Arc::new(handler))
    }

    /// Finish with a shared handler
    #[must_use]
    pub fn build_shared(self, handler: Arc<dyn Handler>) -> Pipeline {
        let mut chain: Vec<Arc<dyn Interceptor>> = Vec::with_capacity(4 + self.extra.len());
        if let Some(auth) = self.auth {
            chain.push(Arc::new(auth));
        }
        if let Some(propagation) = self.propagation {
            chain.push(Arc::new(propagation));
        }
        if let Some(logging) = self.logging {
            chain.push(Arc::new(logging));
        }
        if let Some(metrics) = self.metrics {
            chain.push(Arc::new(metrics));
        }
        chain.extend(self.extra);

        let pipeline = Pipeline { chain, handler };
        debug!(interceptors = ?pipeline.interceptor_names(), "Interceptor pipeline built");
        pipeline
    }
}

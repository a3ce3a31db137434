//! Composition root.
//!
//! [`IdentityService`] wires the validated configuration into one identity
//! cache, one policy, one transport provider, one metrics registry and one
//! health monitor. Nothing here is global; every component receives what it
//! needs at construction.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, instrument};

use crate::cache::{
    CacheSettings, FileIdentitySource, IdentityCache, IdentityProvider, IdentitySource,
};
use crate::config::{Config, SourceKind};
use crate::health::HealthMonitor;
use crate::identity::ServiceIdentity;
use crate::interceptor::propagation::OutboundPropagator;
use crate::interceptor::{CallMetrics, Handler, Pipeline, PipelineBuilder};
use crate::policy::AuthenticationPolicy;
use crate::transport::{MtlsClient, MtlsServer, RustlsTransportProvider};
use crate::{Error, Result};

/// A running service identity with everything built from it.
pub struct IdentityService {
    config: Config,
    identity: ServiceIdentity,
    policy: Arc<AuthenticationPolicy>,
    cache: Arc<IdentityCache>,
    transport: RustlsTransportProvider,
    metrics: Arc<CallMetrics>,
    health: HealthMonitor,
    closed: AtomicBool,
}

impl IdentityService {
    /// Build from `config` over an explicit identity source.
    ///
    /// # Errors
    ///
    /// Validation errors for bad configuration; the cache's fetch error if
    /// the initial identity cannot be obtained.
    #[instrument(skip_all, fields(service = %config.service.name, source = source.name()))]
    pub async fn new(config: Config, source: Arc<dyn IdentitySource>) -> Result<Self> {
        config.validate()?;
        let identity = config.service_identity()?;
        let policy = Arc::new(AuthenticationPolicy::from_config(
            identity.clone(),
            &config.policy,
        )?);
        let cache = Arc::new(
            IdentityCache::connect(
                identity.clone(),
                source,
                CacheSettings::from(&config.identity_source),
            )
            .await?,
        );
        let health = HealthMonitor::from_config(&config.health)?;
        if config.health.enabled {
            health.start()?;
        }

        info!(identity = %identity, "Identity service ready");
        Ok(Self {
            config,
            identity,
            policy,
            cache,
            transport: RustlsTransportProvider::new(),
            metrics: Arc::new(CallMetrics::new()),
            health,
            closed: AtomicBool::new(false),
        })
    }

    /// Build from `config`, creating the identity source it names.
    ///
    /// Only the `file` source can be created from configuration; a `memory`
    /// source must be handed to [`IdentityService::new`].
    pub async fn from_config(config: Config) -> Result<Self> {
        let source: Arc<dyn IdentitySource> = match config.identity_source.kind {
            SourceKind::File => {
                let directory = config.identity_source.directory.clone().ok_or_else(|| {
                    Error::validation(
                        "identity_source.directory",
                        "is required for the file source",
                    )
                })?;
                Arc::new(FileIdentitySource::from_config(
                    directory,
                    config.service.trust_domain.clone(),
                    &config.identity_source,
                ))
            }
            SourceKind::Memory => {
                return Err(Error::Config(
                    "the memory identity source must be passed to IdentityService::new".into(),
                ));
            }
        };
        Self::new(config, source).await
    }

    /// Server presenting the current certificate
    pub async fn create_server(&self) -> Result<MtlsServer> {
        self.ensure_open()?;
        let snapshot = self.cache.snapshot().await?;
        self.transport
            .server_from_snapshot(&snapshot, Arc::clone(&self.policy))
    }

    /// Client presenting the current certificate and propagating identity
    /// metadata on every call
    pub async fn create_client(&self) -> Result<MtlsClient> {
        self.ensure_open()?;
        let snapshot = self.cache.snapshot().await?;
        let client = self
            .transport
            .client_from_snapshot(&snapshot, Arc::clone(&self.policy))?;
        let propagator = OutboundPropagator::new(self.identity.clone())
            .with_max_depth(self.config.interceptors.max_call_chain_depth)
            .with_forwarded_headers(self.config.interceptors.forwarded_headers.clone());
        Ok(client.with_propagator(propagator))
    }

    /// Interceptor pipeline configured from `interceptors`, in front of
    /// `handler`
    pub fn pipeline(&self, handler: impl Handler + 'static) -> Pipeline {
        PipelineBuilder::from_config(
            &self.config.interceptors,
            Arc::clone(&self.policy),
            self.identity.clone(),
            Arc::clone(&self.metrics),
        )
        .build(handler)
    }

    /// Local identity
    #[must_use]
    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    /// Allow-list policy
    #[must_use]
    pub fn policy(&self) -> &Arc<AuthenticationPolicy> {
        &self.policy
    }

    /// Identity cache
    #[must_use]
    pub fn cache(&self) -> &Arc<IdentityCache> {
        &self.cache
    }

    /// Call metrics shared by every pipeline built here
    #[must_use]
    pub fn metrics(&self) -> &Arc<CallMetrics> {
        &self.metrics
    }

    /// Health monitor, running when `health.enabled` is set
    #[must_use]
    pub fn health_monitor(&self) -> &HealthMonitor {
        &self.health
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop health monitoring and close the cache. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.health.close().await?;
        self.cache.close().await?;
        info!(identity = %self.identity, "Identity service closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionFailed("identity service is closed".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryIdentitySource;
    use crate::config::{EndpointConfig, ServiceConfig};
    use crate::identity::CertGenerator;
    use crate::interceptor::{Call, Reply, handler_fn};
    use std::time::Duration;

    fn config() -> Config {
        let mut config = Config {
            service: ServiceConfig {
                name: "payments".into(),
                trust_domain: "example.org".into(),
            },
            ..Config::default()
        };
        config.identity_source.kind = SourceKind::Memory;
        config.policy.authorized_clients = vec!["billing-service".into()];
        config
    }

    fn source() -> Arc<MemoryIdentitySource> {
        let ca = CertGenerator::init_ca("example.org").unwrap();
        let identity = ServiceIdentity::new("payments", "example.org").unwrap();
        let cert = ca.issue_svid(&identity, Duration::from_secs(600)).unwrap();
        Arc::new(MemoryIdentitySource::with_material(cert, ca.bundle()))
    }

    async fn service() -> IdentityService {
        IdentityService::new(config(), source()).await.unwrap()
    }

    #[tokio::test]
    async fn builds_server_client_and_pipeline_from_one_config() {
        let svc = service().await;
        let server = svc.create_server().await.unwrap();
        assert_eq!(server.certificate().spiffe_id(), Some("spiffe://example.org/payments"));
        svc.create_client().await.unwrap();

        let pipeline = svc.pipeline(handler_fn(|_call: Call| async { Ok(Reply::default()) }));
        assert_eq!(
            pipeline.interceptor_names(),
            vec!["auth", "propagation", "logging", "metrics"]
        );
        svc.close().await.unwrap();
    }

    #[tokio::test]
    async fn closed_service_refuses_to_build_transports() {
        let svc = service().await;
        svc.close().await.unwrap();
        svc.close().await.unwrap();
        assert!(matches!(
            svc.create_server().await,
            Err(Error::ConnectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn memory_source_cannot_come_from_config_alone() {
        let err = IdentityService::from_config(config()).await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn enabled_health_monitoring_runs_until_close() {
        // GIVEN: health enabled against an agent nobody listens on
        let mut config = config();
        config.health.enabled = true;
        config.health.interval = Duration::from_millis(50);
        config.health.agent = Some(EndpointConfig {
            address: "127.0.0.1:9".into(),
            ..EndpointConfig::default()
        });

        // WHEN: the service is built
        let svc = IdentityService::new(config, source()).await.unwrap();

        // THEN: the monitor is already running and stops on close
        assert!(svc.health_monitor().is_running());
        assert_eq!(svc.health_monitor().components(), vec!["agent".to_string()]);
        svc.close().await.unwrap();
        assert!(!svc.health_monitor().is_running());
    }

    #[tokio::test]
    async fn disabled_health_monitoring_is_not_started() {
        let svc = service().await;

        assert!(!svc.config().health.enabled);
        assert!(!svc.health_monitor().is_running());
        assert!(svc.health_monitor().components().is_empty());
        svc.close().await.unwrap();
    }
}

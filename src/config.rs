//! Configuration management
//!
//! The library consumes an already-built [`Config`]; [`Config::load`] is the
//! file + environment layer used by the binary.

use std::{collections::BTreeMap, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::identity::ServiceIdentity;
use crate::policy::AuthenticationPolicy;
use crate::{Error, Result};

/// Environment variable prefix (`IDENTITY_MESH_SERVICE__NAME=...`)
pub const ENV_PREFIX: &str = "IDENTITY_MESH_";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local service identity
    pub service: ServiceConfig,
    /// Where certificates and trust bundles come from
    pub identity_source: IdentitySourceConfig,
    /// Allow-lists
    pub policy: PolicyConfig,
    /// Interceptor pipeline
    pub interceptors: InterceptorConfig,
    /// Identity infrastructure health monitoring
    pub health: HealthConfig,
}

/// Local service identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Short service name
    pub name: String,
    /// Trust domain
    pub trust_domain: String,
}

/// Identity source kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// PEM files in a directory, watched for rotation
    #[default]
    File,
    /// Supplied programmatically (tests, local development)
    Memory,
}

/// Identity source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySourceConfig {
    /// Source kind
    pub kind: SourceKind,
    /// Directory holding the PEM files (file source)
    pub directory: Option<PathBuf>,
    /// Leaf certificate chain file name
    pub cert_file: String,
    /// Private key file name
    pub key_file: String,
    /// Trust bundle file name
    pub bundle_file: String,
    /// Maximum snapshot age before the next access refetches
    #[serde(with = "humantime_serde")]
    pub refresh_ttl: Duration,
    /// Attempts for the initial fetch
    pub retry_attempts: usize,
    /// First backoff delay for the initial fetch
    #[serde(with = "humantime_serde")]
    pub retry_min_delay: Duration,
    /// Quiet period after a file change before rotation is published
    #[serde(with = "humantime_serde")]
    pub watch_debounce: Duration,
}

impl Default for IdentitySourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::File,
            directory: None,
            cert_file: "svid.pem".to_string(),
            key_file: "svid_key.pem".to_string(),
            bundle_file: "bundle.pem".to_string(),
            refresh_ttl: Duration::from_secs(300),
            retry_attempts: 3,
            retry_min_delay: Duration::from_millis(200),
            watch_debounce: Duration::from_millis(500),
        }
    }
}

/// Allow-list configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Short names allowed to call this service (empty: everyone)
    pub authorized_clients: Vec<String>,
    /// Short names this service trusts as servers (empty: everyone)
    pub trusted_servers: Vec<String>,
    /// Reject empty allow-lists
    pub strict: bool,
}

/// Interceptor pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptorConfig {
    /// Enable the auth interceptor
    pub auth: bool,
    /// Enable identity propagation
    pub propagation: bool,
    /// Enable call logging
    pub logging: bool,
    /// Enable call metrics
    pub metrics: bool,
    /// Methods that bypass authentication (e.g. health checks)
    pub skip_methods: Vec<String>,
    /// Methods not logged
    pub excluded_log_methods: Vec<String>,
    /// Calls slower than this are logged at `warn`
    #[serde(with = "humantime_serde")]
    pub slow_call_threshold: Duration,
    /// Maximum propagated call-chain length
    pub max_call_chain_depth: usize,
    /// Extra metadata keys forwarded to outbound calls
    pub forwarded_headers: Vec<String>,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            auth: true,
            propagation: true,
            logging: true,
            metrics: true,
            skip_methods: vec!["/grpc.health.v1.Health/Check".to_string()],
            excluded_log_methods: Vec::new(),
            slow_call_threshold: Duration::from_millis(500),
            max_call_chain_depth: 10,
            forwarded_headers: Vec::new(),
        }
    }
}

/// Health monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Enable monitoring
    pub enabled: bool,
    /// Time between check cycles
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Per-check timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Maximum checks in flight per cycle
    pub max_concurrent_checks: usize,
    /// Identity agent endpoints
    pub agent: Option<EndpointConfig>,
    /// Identity server endpoints
    pub server: Option<EndpointConfig>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            max_concurrent_checks: 8,
            agent: None,
            server: None,
        }
    }
}

/// One monitored HTTP health endpoint pair
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// `host:port`
    pub address: String,
    /// Liveness path
    pub live_path: String,
    /// Readiness path
    pub ready_path: String,
    /// Use `https`
    pub use_https: bool,
    /// Extra request headers
    pub headers: BTreeMap<String, String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            live_path: "/live".to_string(),
            ready_path: "/ready".to_string(),
            use_https: false,
            headers: BTreeMap::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading and validation
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Load configuration from an optional YAML file plus
    /// `IDENTITY_MESH_`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Build the validated local identity
    pub fn service_identity(&self) -> Result<ServiceIdentity> {
        ServiceIdentity::new(&self.service.name, &self.service.trust_domain)
    }

    /// Validate every section, failing on the first bad field.
    pub fn validate(&self) -> Result<()> {
        let identity = self.service_identity()?;
        AuthenticationPolicy::from_config(identity, &self.policy)?;
        self.identity_source.validate()?;
        self.interceptors.validate()?;
        self.health.validate()
    }
}

impl IdentitySourceConfig {
    fn validate(&self) -> Result<()> {
        if self.kind == SourceKind::File && self.directory.is_none() {
            return Err(Error::validation(
                "identity_source.directory",
                "required for the file source",
            ));
        }
        for (field, value) in [
            ("identity_source.cert_file", &self.cert_file),
            ("identity_source.key_file", &self.key_file),
            ("identity_source.bundle_file", &self.bundle_file),
        ] {
            if value.is_empty() || value.contains('/') {
                return Err(Error::validation(field, "must be a plain file name"));
            }
        }
        if self.refresh_ttl.is_zero() {
            return Err(Error::validation(
                "identity_source.refresh_ttl",
                "must be greater than zero",
            ));
        }
        if self.retry_attempts == 0 {
            return Err(Error::validation(
                "identity_source.retry_attempts",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

impl InterceptorConfig {
    fn validate(&self) -> Result<()> {
        if self.max_call_chain_depth == 0 {
            return Err(Error::validation(
                "interceptors.max_call_chain_depth",
                "must be at least 1",
            ));
        }
        if let Some(bad) = self.skip_methods.iter().find(|m| m.trim().is_empty()) {
            return Err(Error::validation(
                "interceptors.skip_methods",
                format!("blank entry {bad:?}"),
            ));
        }
        if let Some(bad) = self
            .forwarded_headers
            .iter()
            .find(|h| h.is_empty() || h.chars().any(|c| c.is_whitespace() || c == ':'))
        {
            return Err(Error::validation(
                "interceptors.forwarded_headers",
                format!("invalid header name {bad:?}"),
            ));
        }
        Ok(())
    }
}

impl HealthConfig {
    fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::validation("health.interval", "must be greater than zero"));
        }
        if self.timeout.is_zero() {
            return Err(Error::validation("health.timeout", "must be greater than zero"));
        }
        if self.max_concurrent_checks == 0 {
            return Err(Error::validation(
                "health.max_concurrent_checks",
                "must be at least 1",
            ));
        }
        if self.enabled && self.agent.is_none() && self.server.is_none() {
            return Err(Error::validation(
                "health",
                "enabled without any agent or server endpoint",
            ));
        }
        for (field, endpoint) in [("health.agent", &self.agent), ("health.server", &self.server)] {
            if let Some(endpoint) = endpoint {
                endpoint.validate(field)?;
            }
        }
        Ok(())
    }
}

impl EndpointConfig {
    fn validate(&self, field: &'static str) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(Error::validation(field, "address must not be empty"));
        }
        if self.address.contains("://") {
            return Err(Error::validation(
                field,
                "address is host:port; use use_https to select the scheme",
            ));
        }
        for path in [&self.live_path, &self.ready_path] {
            if !path.starts_with('/') {
                return Err(Error::validation(field, format!("path {path:?} must start with '/'")));
            }
        }
        Ok(())
    }

    /// `http(s)://address`
    #[must_use]
    pub fn base_url(&self) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!("{scheme}://{}", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    // ─── helpers ─────────────────────────────────────────────────────────────

    fn valid() -> Config {
        Config {
            service: ServiceConfig {
                name: "payments".into(),
                trust_domain: "example.org".into(),
            },
            identity_source: IdentitySourceConfig {
                directory: Some(PathBuf::from("/run/identity")),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn field_of(err: Error) -> &'static str {
        match err {
            Error::Validation { field, .. } => field,
            other => panic!("expected validation error, got {other}"),
        }
    }

    // ─── Defaults ────────────────────────────────────────────────────────────

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.interceptors.slow_call_threshold, Duration::from_millis(500));
        assert_eq!(config.interceptors.max_call_chain_depth, 10);
        assert_eq!(config.health.interval, Duration::from_secs(30));
        assert_eq!(config.health.timeout, Duration::from_secs(10));
        assert_eq!(config.identity_source.cert_file, "svid.pem");
        assert!(!config.policy.strict);
    }

    #[test]
    fn valid_config_passes() {
        valid().validate().unwrap();
    }

    // ─── Validation ──────────────────────────────────────────────────────────

    #[test]
    fn missing_service_name_is_a_field_error() {
        let mut config = valid();
        config.service.name.clear();
        assert_eq!(field_of(config.validate().unwrap_err()), "service_name");
    }

    #[test]
    fn file_source_requires_directory() {
        let mut config = valid();
        config.identity_source.directory = None;
        assert_eq!(
            field_of(config.validate().unwrap_err()),
            "identity_source.directory"
        );
    }

    #[test]
    fn memory_source_needs_no_directory() {
        let mut config = valid();
        config.identity_source.kind = SourceKind::Memory;
        config.identity_source.directory = None;
        config.validate().unwrap();
    }

    #[test]
    fn strict_policy_with_empty_lists_fails() {
        let mut config = valid();
        config.policy.strict = true;
        assert_eq!(
            field_of(config.validate().unwrap_err()),
            "authorized_clients"
        );
    }

    #[test]
    fn enabled_health_needs_an_endpoint() {
        let mut config = valid();
        config.health.enabled = true;
        assert_eq!(field_of(config.validate().unwrap_err()), "health");

        config.health.agent = Some(EndpointConfig {
            address: "http://127.0.0.1:8080".into(),
            ..Default::default()
        });
        assert_eq!(field_of(config.validate().unwrap_err()), "health.agent");
    }

    #[test]
    fn endpoint_base_url_uses_scheme_flag() {
        let endpoint = EndpointConfig {
            address: "agent:8080".into(),
            use_https: true,
            ..Default::default()
        };
        assert_eq!(endpoint.base_url(), "https://agent:8080");
    }

    // ─── Loading ─────────────────────────────────────────────────────────────

    #[test]
    fn load_reads_yaml_with_humantime_durations() {
        // GIVEN: a YAML file
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity-mesh.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "service:\n  name: payments\n  trust_domain: example.org\n\
             identity_source:\n  directory: /run/identity\n  refresh_ttl: 2m\n\
             policy:\n  authorized_clients: [billing-service]\n\
             health:\n  interval: 15s\n  agent:\n    address: 127.0.0.1:8080"
        )
        .unwrap();
        drop(f);
        // WHEN: loading
        let config = Config::load(Some(&path)).unwrap();
        // THEN: fields land, defaults fill the rest
        assert_eq!(config.service.name, "payments");
        assert_eq!(config.identity_source.refresh_ttl, Duration::from_secs(120));
        assert_eq!(config.policy.authorized_clients, vec!["billing-service"]);
        assert_eq!(config.health.interval, Duration::from_secs(15));
        let agent = config.health.agent.unwrap();
        assert_eq!(agent.live_path, "/live");
        assert_eq!(config.interceptors.max_call_chain_depth, 10);
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/identity-mesh.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn check_config_dump_uses_readable_durations() {
        let yaml = serde_yaml::to_string(&valid()).unwrap();
        assert!(yaml.contains("refresh_ttl: 5m"));
        assert!(yaml.contains("slow_call_threshold: 500ms"));

        let reparsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(reparsed.identity_source.refresh_ttl, Duration::from_secs(300));
        assert_eq!(reparsed.service.name, "payments");
    }
}

//! identity-mesh operator tool
//!
//! Health checks against the identity infrastructure, configuration
//! validation and development certificates.

use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{error, info};

use identity_mesh::{
    ServiceIdentity,
    cache::file::write_material,
    cli::{Cli, Command},
    config::{Config, HealthConfig},
    health::HealthMonitor,
    identity::CertGenerator,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config_path = cli.config.as_deref();
    let result = match cli.command {
        Command::Health { watch } => run_health(config_path, watch).await,
        Command::CheckConfig => run_check_config(config_path),
        Command::DevCerts {
            names,
            trust_domain,
            out,
            ttl,
        } => run_dev_certs(&names, &trust_domain, &out, ttl).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = format!("{e:#}"), "Command failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// One health cycle, or continuous monitoring with `watch`
async fn run_health(config_path: Option<&Path>, watch: bool) -> anyhow::Result<ExitCode> {
    let config = Config::load(config_path).context("loading configuration")?;
    // an explicit check runs whether or not background monitoring is enabled
    let health = HealthConfig {
        enabled: true,
        ..config.health
    };
    let monitor = HealthMonitor::from_config(&health).context("building health monitor")?;
    if monitor.components().is_empty() {
        bail!("no health endpoints configured (health.agent / health.server)");
    }

    let report = monitor.check_all().await;
    println!("{}", serde_json::to_string_pretty(&*report)?);

    if watch {
        monitor.start()?;
        info!("Monitoring health, press Ctrl-C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("waiting for Ctrl-C")?;
    }
    monitor.close().await?;

    Ok(if monitor.overall_status() == identity_mesh::health::HealthStatus::Healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run_check_config(config_path: Option<&Path>) -> anyhow::Result<ExitCode> {
    let config = Config::load(config_path).context("loading configuration")?;
    config.validate().context("validating configuration")?;
    println!("{}", serde_yaml::to_string(&config)?);
    if config.policy.authorized_clients.is_empty() {
        eprintln!("warning: policy.authorized_clients is empty; every caller is authorized");
    }
    if config.policy.trusted_servers.is_empty() {
        eprintln!("warning: policy.trusted_servers is empty; every server is trusted");
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_dev_certs(
    names: &[String],
    trust_domain: &str,
    out: &Path,
    ttl: Duration,
) -> anyhow::Result<ExitCode> {
    let ca = CertGenerator::init_ca(trust_domain).context("creating development CA")?;
    for name in names {
        let identity = ServiceIdentity::new(name.as_str(), trust_domain)?;
        let svid = ca.issue_svid_pem(&identity, ttl)?;
        let dir = out.join(name);
        write_material(&dir, &svid.cert_pem, &svid.key_pem, ca.cert_pem())
            .await
            .with_context(|| format!("writing material to {}", dir.display()))?;
        println!("{identity} -> {}", dir.display());
    }
    Ok(ExitCode::SUCCESS)
}

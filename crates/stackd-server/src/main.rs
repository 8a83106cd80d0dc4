use anyhow::{Context, Result};
use clap::Parser;
use stackd_core::CollectorConfig;
use stackd_server::config_loader::ConfigLoader;
use stackd_server::{Collector, logging};
use stackd_utils::fs::OsFileSystem;
use stackd_utils::process::start_provider_executable_with_env;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

mod cli;

use cli::{Cli, Commands, ServiceArg};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Schema => {
            let schema = schemars::schema_for!(CollectorConfig);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
        Commands::Collect { services } => {
            let config = load_config(cli.config.as_deref()).await?;
            collect(&config, &services).await
        }
        Commands::Provider { path, env } => {
            let config = load_config(cli.config.as_deref()).await?;
            run_provider(&config, path, env).await
        }
    }
}

async fn load_config(path: Option<&Path>) -> Result<CollectorConfig> {
    let loader = ConfigLoader::load(path)
        .await
        .context("Failed to load config")?;
    logging::init(&loader.config.log);
    Ok(loader.config)
}

async fn collect(config: &CollectorConfig, services: &[ServiceArg]) -> Result<()> {
    let collector = Collector::from_config(&config.server);

    for service in services {
        collector
            .register_service(&service.name, &service.service_type)
            .await
            .with_context(|| format!("Failed to start collector for {}", service.name))?;

        let env = collector.service_env(&service.name).await?;
        for (key, value) in env {
            eprintln!("{}: {}={}", service.name, key, value);
        }
    }

    wait_for_ctrl_c().await;
    collector.shutdown().await;

    let report = collector.report().await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    let errors = collector.errors().await;
    if !errors.is_empty() {
        eprintln!("{} conflict(s) found:", errors.len());
        for error in &errors {
            eprintln!("  {error}");
        }
    }
    info!(
        "Collected {} service(s) needing {} worker(s)",
        report.services.len(),
        collector.worker_count().await
    );
    Ok(())
}

async fn run_provider(
    config: &CollectorConfig,
    path: Option<PathBuf>,
    env: Vec<(String, String)>,
) -> Result<()> {
    let path = path
        .or_else(|| config.provider.path.clone())
        .context("No provider given and provider.path is not configured")?;

    let mut vars = config.provider.env.clone();
    vars.extend(env);

    let mut provider = start_provider_executable_with_env(&OsFileSystem, &path, vars)
        .with_context(|| format!("Failed to start provider {}", path.display()))?;

    if let Some(addr) = provider.address() {
        println!("{addr}");
    }

    wait_for_ctrl_c().await;
    provider.stop().await.context("Failed to stop provider")?;
    Ok(())
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(err) => warn!("Unable to listen for shutdown signal: {}", err),
    }
}

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stackd")]
#[command(about = "Collect the cloud resources local services declare", long_about = None)]
pub struct Cli {
    /// Config file (default: $STACKD_CONFIG, then the platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a collector per service until Ctrl-C, then print what was collected
    ///
    /// Each service is started by you with the printed SERVICE_ADDRESS in its
    /// environment. On Ctrl-C the collected requirements are printed as JSON
    /// on stdout, followed by any conflicts on stderr.
    Collect {
        /// Service to collect for, as `name` or `name:type` (repeatable)
        #[arg(long = "service", short = 's', required = true, value_parser = parse_service)]
        services: Vec<ServiceArg>,
    },
    /// Launch a deployment engine on a free loopback port until Ctrl-C
    Provider {
        /// Engine executable (default: `provider.path` from the config)
        path: Option<PathBuf>,
        /// Extra environment for the engine, as KEY=VALUE (repeatable)
        #[arg(long = "env", short = 'e', value_parser = parse_env)]
        env: Vec<(String, String)>,
    },
    /// Print the JSON schema of the config file
    Schema,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceArg {
    pub name: String,
    pub service_type: String,
}

fn parse_service(value: &str) -> Result<ServiceArg, String> {
    let (name, service_type) = value.split_once(':').unwrap_or((value, ""));
    if name.is_empty() {
        return Err("service name must not be empty".to_string());
    }
    Ok(ServiceArg {
        name: name.to_string(),
        service_type: service_type.to_string(),
    })
}

fn parse_env(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{value}`")),
    }
}

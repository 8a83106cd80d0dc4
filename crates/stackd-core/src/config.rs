use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

/// Root configuration for the `stackd` collector.
///
/// # Example
/// ```toml
/// [server]
/// host = "127.0.0.1"
///
/// [log]
/// filter = "stackd_server=debug"
///
/// [provider]
/// path = "./bin/deploy-engine"
/// env = { REGION = "local" }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct CollectorConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address the per-service collector listeners bind to. Ports are always
    /// chosen by the OS.
    #[serde(default = "default_host")]
    pub host: IpAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct LogConfig {
    /// An `EnvFilter` directive. `RUST_LOG` takes precedence when set.
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Deployment engine executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Extra environment for the provider process. `PORT` is always set by
    /// the supervisor and overrides any value given here.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

const fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_filter() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: CollectorConfig = toml::from_str("").unwrap();
        assert_eq!(config, CollectorConfig::default());
        assert_eq!(config.server.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.log.filter, "info");
    }

    #[test]
    fn provider_section_parses() {
        let config: CollectorConfig = toml::from_str(
            r#"
[provider]
path = "/opt/engine"
env = { REGION = "local" }
"#,
        )
        .unwrap();
        assert_eq!(config.provider.path, Some(PathBuf::from("/opt/engine")));
        assert_eq!(config.provider.env["REGION"], "local");
    }
}

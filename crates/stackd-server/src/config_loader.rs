use stackd_core::CollectorConfig;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub const CONFIG_ENV: &str = "STACKD_CONFIG";
pub const HOST_ENV: &str = "STACKD_HOST";
pub const LOG_ENV: &str = "STACKD_LOG";
pub const PROVIDER_ENV: &str = "STACKD_PROVIDER";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{var} is not a valid IP address: {value}")]
    InvalidHost { var: &'static str, value: String },
}

/// Where a loaded config came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Default,
    Explicit(PathBuf),
    EnvVar(PathBuf),
    Platform(PathBuf),
}

impl ConfigSource {
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Default => None,
            Self::Explicit(path) | Self::EnvVar(path) | Self::Platform(path) => Some(path),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigLoader {
    pub config: CollectorConfig,
    pub source: ConfigSource,
}

impl ConfigLoader {
    /// Loads the config from `explicit`, `$STACKD_CONFIG` or the platform
    /// config dir, in that order, then applies `STACKD_*` overrides.
    ///
    /// # Errors
    ///
    /// Fails if the chosen file exists but cannot be read or parsed, or if an
    /// override is malformed.
    pub async fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(explicit, |key| std::env::var(key).ok()).await
    }

    /// Like [`ConfigLoader::load`], reading variables through `env`.
    ///
    /// # Errors
    ///
    /// See [`ConfigLoader::load`].
    pub async fn load_with<F>(explicit: Option<&Path>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let source = if let Some(path) = explicit {
            ConfigSource::Explicit(path.to_path_buf())
        } else if let Some(path) = env(CONFIG_ENV) {
            ConfigSource::EnvVar(PathBuf::from(path))
        } else if let Some(path) = Self::platform_config_path() {
            ConfigSource::Platform(path)
        } else {
            ConfigSource::Default
        };

        let mut loader = match source.path().map(Path::to_path_buf) {
            Some(path) => Self::read(&path, source).await?,
            None => Self {
                config: CollectorConfig::default(),
                source,
            },
        };

        apply_env_overrides(&mut loader.config, env)?;
        Ok(loader)
    }

    fn platform_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "stackd", "stackd")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    async fn read(path: &Path, source: ConfigSource) -> Result<Self, ConfigError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                return Ok(Self {
                    config: CollectorConfig::default(),
                    source: ConfigSource::Default,
                });
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded config from {}", path.display());
        Ok(Self { config, source })
    }
}

fn apply_env_overrides<F>(config: &mut CollectorConfig, env: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = env(HOST_ENV) {
        config.server.host = value.parse::<IpAddr>().map_err(|_| ConfigError::InvalidHost {
            var: HOST_ENV,
            value,
        })?;
    }
    if let Some(filter) = env(LOG_ENV) {
        config.log.filter = filter;
    }
    if let Some(path) = env(PROVIDER_ENV) {
        config.provider.path = Some(PathBuf::from(path));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[tokio::test]
    async fn explicit_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stackd.toml");
        std::fs::write(&path, "[log]\nfilter = \"debug\"\njson = true\n").unwrap();

        let loader = ConfigLoader::load_with(Some(path.as_path()), vars(&[])).await.unwrap();
        assert_eq!(loader.source, ConfigSource::Explicit(path));
        assert_eq!(loader.config.log.filter, "debug");
        assert!(loader.config.log.json);
    }

    #[tokio::test]
    async fn env_var_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stackd.toml");
        std::fs::write(&path, "[server]\nhost = \"0.0.0.0\"\n").unwrap();

        let path_str = path.display().to_string();
        let loader = ConfigLoader::load_with(None, vars(&[(CONFIG_ENV, path_str.as_str())]))
            .await
            .unwrap();
        assert_eq!(loader.source, ConfigSource::EnvVar(path));
        assert_eq!(loader.config.server.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let loader = ConfigLoader::load_with(Some(path.as_path()), vars(&[])).await.unwrap();
        assert_eq!(loader.source, ConfigSource::Default);
        assert_eq!(loader.config, CollectorConfig::default());
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stackd.toml");
        std::fs::write(&path, "[server\n").unwrap();

        let err = ConfigLoader::load_with(Some(path.as_path()), vars(&[])).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[tokio::test]
    async fn overrides_apply_last() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stackd.toml");
        std::fs::write(&path, "[log]\nfilter = \"debug\"\n").unwrap();

        let env = vars(&[
            (HOST_ENV, "::1"),
            (LOG_ENV, "stackd_server=trace"),
            (PROVIDER_ENV, "/opt/engine"),
        ]);
        let config = ConfigLoader::load_with(Some(path.as_path()), env).await.unwrap().config;
        assert!(config.server.host.is_loopback());
        assert!(config.server.host.is_ipv6());
        assert_eq!(config.log.filter, "stackd_server=trace");
        assert_eq!(config.provider.path, Some(PathBuf::from("/opt/engine")));
    }

    #[tokio::test]
    async fn bad_host_override_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = ConfigLoader::load_with(Some(path.as_path()), vars(&[(HOST_ENV, "localhost")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidHost { .. }));
    }
}

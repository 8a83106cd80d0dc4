//! Supervision of a locally executable deployment engine ("provider").
//!
//! The provider is launched with a free loopback port in `PORT` and is
//! expected to serve the deployment protocol there. Its output goes to the
//! debug log. The supervisor never watches for exit; it only kills.
//!
//! Launching and stopping must happen inside a tokio runtime.

use crate::discovery::{PortError, next_available_addr};
use crate::fs::FileSystem;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("failed to stat provider {}: {source}", .path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("provider binary is not executable: {}", .0.display())]
    NotExecutable(PathBuf),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("failed to launch provider {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("provider has already been started")]
    AlreadyStarted,
    #[error("failed to stop provider: {0}")]
    Kill(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Unstarted,
    Running,
    Stopped,
}

/// A deployment engine running as a child process.
///
/// Not meant to be shared: `start` and `stop` take `&mut self`.
#[derive(Debug)]
pub struct ProviderProcess {
    path: PathBuf,
    env: HashMap<String, String>,
    child: Option<Child>,
    address: Option<SocketAddr>,
    status: ProviderStatus,
}

impl ProviderProcess {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            env: HashMap::new(),
            child: None,
            address: None,
            status: ProviderStatus::Unstarted,
        }
    }

    /// Adds an environment variable for the launch. `PORT` is reserved and
    /// always replaced by the allocated port.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loopback address the provider was told to listen on.
    #[must_use]
    pub const fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.address.map(|addr| addr.port())
    }

    #[must_use]
    pub const fn status(&self) -> ProviderStatus {
        self.status
    }

    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Allocates a port and launches the executable.
    ///
    /// # Errors
    ///
    /// Fails if the process was started before, if no port can be allocated,
    /// or if the OS refuses to spawn the executable. No process is held on
    /// failure.
    pub fn start(&mut self) -> Result<(), ProviderError> {
        if self.status != ProviderStatus::Unstarted {
            return Err(ProviderError::AlreadyStarted);
        }

        // The scratch listener is closed again before the launch; the provider
        // binds the port itself.
        let addr = next_available_addr()?;

        let mut cmd = Command::new(&self.path);
        cmd.envs(&self.env);
        cmd.env("PORT", addr.port().to_string());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ProviderError::Spawn {
            path: self.path.clone(),
            source,
        })?;

        let name = self.path.display().to_string();
        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, name.clone(), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, name, "stderr");
        }

        info!(
            "Started provider {} (pid {}) on {}",
            self.path.display(),
            child.id().unwrap_or_default(),
            addr
        );

        self.child = Some(child);
        self.address = Some(addr);
        self.status = ProviderStatus::Running;
        Ok(())
    }

    /// Kills the provider. A no-op when nothing is running.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Kill` if the signal cannot be delivered. The
    /// handle is kept so the call can be retried.
    pub async fn stop(&mut self) -> Result<(), ProviderError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if let Err(e) = child.start_kill() {
            self.child = Some(child);
            return Err(ProviderError::Kill(e));
        }

        // Reap so the killed provider does not linger as a zombie.
        if let Err(e) = child.wait().await {
            warn!("Failed to reap provider {}: {}", self.path.display(), e);
        }

        info!("Stopped provider {}", self.path.display());
        self.status = ProviderStatus::Stopped;
        Ok(())
    }
}

fn forward_output<R>(reader: R, provider: String, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(provider = %provider, stream, "{}", line);
        }
    });
}

/// Validates `executable_path` and launches it as a provider.
///
/// # Errors
///
/// Returns `ProviderError::Stat` if the path cannot be inspected,
/// `ProviderError::NotExecutable` if it is not an executable regular file,
/// and any error from [`ProviderProcess::start`].
pub fn start_provider_executable(
    fs: &dyn FileSystem,
    executable_path: impl AsRef<Path>,
) -> Result<ProviderProcess, ProviderError> {
    start_provider_executable_with_env(fs, executable_path, HashMap::new())
}

/// Like [`start_provider_executable`], with extra environment for the
/// provider.
///
/// # Errors
///
/// See [`start_provider_executable`].
pub fn start_provider_executable_with_env(
    fs: &dyn FileSystem,
    executable_path: impl AsRef<Path>,
    env: HashMap<String, String>,
) -> Result<ProviderProcess, ProviderError> {
    let path = executable_path.as_ref();
    let stat = fs.stat(path).map_err(|source| ProviderError::Stat {
        path: path.to_path_buf(),
        source,
    })?;

    if !stat.is_executable() {
        return Err(ProviderError::NotExecutable(path.to_path_buf()));
    }

    let mut provider = ProviderProcess::new(path).envs(env);
    provider.start()?;
    Ok(provider)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::fs::MemoryFileSystem;
    use std::time::Duration;
    use tokio::time::Instant;

    #[test]
    fn missing_executable_is_a_stat_error() {
        let fs = MemoryFileSystem::new();
        let err = start_provider_executable(&fs, "/opt/engine").unwrap_err();
        assert!(matches!(err, ProviderError::Stat { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_file_is_rejected_without_launching() {
        let fs = MemoryFileSystem::new();
        fs.insert_file("/opt/engine", 0o644);

        let err = start_provider_executable(&fs, "/opt/engine").unwrap_err();
        assert!(matches!(err, ProviderError::NotExecutable(_)));
        assert_eq!(err.to_string(), "provider binary is not executable: /opt/engine");
    }

    #[tokio::test]
    async fn spawn_failure_holds_no_process() {
        let mut provider = ProviderProcess::new("/definitely/not/a/provider");
        let err = provider.start().unwrap_err();
        assert!(matches!(err, ProviderError::Spawn { .. }));
        assert_eq!(provider.status(), ProviderStatus::Unstarted);
        assert_eq!(provider.id(), None);
        provider.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn provider_receives_port_and_stops_once() {
        use crate::fs::OsFileSystem;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.out");
        let script = dir.path().join("engine.sh");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$PORT $REGION\" > {}\necho ready\nexec sleep 30\n",
                out.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let env = HashMap::from([("REGION".to_string(), "local".to_string())]);
        let mut provider = start_provider_executable_with_env(&OsFileSystem, &script, env).unwrap();

        let port = provider.port().unwrap();
        assert_ne!(port, 0);
        assert!(provider.address().unwrap().ip().is_loopback());
        assert_eq!(provider.status(), ProviderStatus::Running);

        let deadline = Instant::now() + Duration::from_secs(5);
        let written = loop {
            if let Ok(content) = tokio::fs::read_to_string(&out).await
                && content.ends_with('\n')
            {
                break content;
            }
            assert!(Instant::now() < deadline, "provider never wrote its env");
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert_eq!(written.trim(), format!("{port} local"));

        assert!(matches!(provider.start(), Err(ProviderError::AlreadyStarted)));

        assert!(provider.id().is_some());

        provider.stop().await.unwrap();
        assert_eq!(provider.status(), ProviderStatus::Stopped);
        assert_eq!(provider.id(), None);
        provider.stop().await.unwrap();
    }
}

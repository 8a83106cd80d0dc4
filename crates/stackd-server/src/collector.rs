use crate::ipc::run_collector_server;
use crate::requirements::{Requirements, ServiceRequirements};
use serde::Serialize;
use stackd_core::config::ServerConfig;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Environment variable a service reads to find its collector.
pub const SERVICE_ADDRESS_ENV: &str = "SERVICE_ADDRESS";

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("service {0} is already being collected")]
    DuplicateService(String),
    #[error("unknown service {0}")]
    UnknownService(String),
    #[error("failed to bind collector for service {service}: {source}")]
    Bind {
        service: String,
        #[source]
        source: io::Error,
    },
}

struct CollectedService {
    requirements: Arc<ServiceRequirements>,
    address: SocketAddr,
    server: JoinHandle<()>,
}

/// Runs one collector server per service and gathers what they declare.
#[derive(Clone)]
pub struct Collector {
    host: IpAddr,
    services: Arc<Mutex<BTreeMap<String, CollectedService>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    pub service_type: String,
    pub address: SocketAddr,
    pub worker_count: usize,
    #[serde(flatten)]
    pub requirements: Requirements,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionReport {
    pub services: BTreeMap<String, ServiceReport>,
}

impl CollectionReport {
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.services
            .values()
            .map(|s| s.requirements.errors.len())
            .sum()
    }
}

impl Collector {
    #[must_use]
    pub fn new(host: IpAddr) -> Self {
        Self {
            host,
            services: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.host)
    }

    /// Binds a collector for `name` on an OS-assigned port and starts
    /// serving it.
    ///
    /// # Errors
    ///
    /// Fails if the service is already registered or the listener cannot be
    /// bound.
    pub async fn register_service(
        &self,
        name: &str,
        service_type: &str,
    ) -> Result<SocketAddr, CollectorError> {
        let mut services = self.services.lock().await;
        if services.contains_key(name) {
            return Err(CollectorError::DuplicateService(name.to_string()));
        }

        let bind_error = |source| CollectorError::Bind {
            service: name.to_string(),
            source,
        };
        let listener = TcpListener::bind((self.host, 0)).await.map_err(bind_error)?;
        let address = listener.local_addr().map_err(bind_error)?;

        let requirements = Arc::new(ServiceRequirements::new(name, service_type));
        let server = tokio::spawn(run_collector_server(listener, Arc::clone(&requirements)));

        info!(
            "Collecting requirements for {} ({}) on {}",
            name,
            requirements.service_type(),
            address
        );

        services.insert(
            name.to_string(),
            CollectedService {
                requirements,
                address,
                server,
            },
        );
        Ok(address)
    }

    pub async fn requirements(&self, name: &str) -> Option<Arc<ServiceRequirements>> {
        let services = self.services.lock().await;
        services.get(name).map(|s| Arc::clone(&s.requirements))
    }

    pub async fn address(&self, name: &str) -> Option<SocketAddr> {
        self.services.lock().await.get(name).map(|s| s.address)
    }

    /// Environment to launch the service with so it reports to its collector.
    ///
    /// # Errors
    ///
    /// Returns `CollectorError::UnknownService` for unregistered names.
    pub async fn service_env(&self, name: &str) -> Result<HashMap<String, String>, CollectorError> {
        let address = self
            .address(name)
            .await
            .ok_or_else(|| CollectorError::UnknownService(name.to_string()))?;

        Ok(HashMap::from([(
            SERVICE_ADDRESS_ENV.to_string(),
            address.to_string(),
        )]))
    }

    pub async fn services(&self) -> Vec<String> {
        self.services.lock().await.keys().cloned().collect()
    }

    /// All conflicts recorded so far, prefixed with the service they came
    /// from.
    pub async fn errors(&self) -> Vec<String> {
        let services = self.services.lock().await;
        services
            .iter()
            .flat_map(|(name, service)| {
                service
                    .requirements
                    .errors()
                    .into_iter()
                    .map(move |e| format!("{name}: {e}"))
            })
            .collect()
    }

    pub async fn worker_count(&self) -> usize {
        let services = self.services.lock().await;
        services
            .values()
            .map(|s| s.requirements.worker_count())
            .sum()
    }

    pub async fn report(&self) -> CollectionReport {
        let services = self.services.lock().await;
        let services = services
            .iter()
            .map(|(name, service)| {
                let requirements = service.requirements.snapshot();
                let report = ServiceReport {
                    service_type: service.requirements.service_type().to_string(),
                    address: service.address,
                    worker_count: requirements.worker_count(),
                    requirements,
                };
                (name.clone(), report)
            })
            .collect();

        CollectionReport { services }
    }

    /// Closes every aggregate and stops every collector server along with
    /// its open connections. Collected requirements stay readable and no
    /// longer change.
    pub async fn shutdown(&self) {
        let mut services = self.services.lock().await;
        for (name, service) in services.iter_mut() {
            service.requirements.close();
            if !service.server.is_finished() {
                service.server.abort();
                // The server owns its connection tasks; they are gone once it is.
                if let Err(e) = (&mut service.server).await
                    && e.is_panic()
                {
                    warn!("Collector for {} panicked: {}", name, e);
                }
                info!("Stopped collector for {}", name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use stackd_core::ScheduleRegistration;
    use std::net::Ipv4Addr;

    fn collector() -> Collector {
        Collector::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[tokio::test]
    async fn services_get_distinct_loopback_addresses() {
        let collector = collector();
        let a = collector.register_service("a", "").await.unwrap();
        let b = collector.register_service("b", "worker").await.unwrap();

        assert_ne!(a, b);
        assert!(a.ip().is_loopback());
        assert_eq!(collector.services().await, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(collector.requirements("b").await.unwrap().service_type(), "worker");
        collector.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_service_is_rejected() {
        let collector = collector();
        collector.register_service("a", "").await.unwrap();
        let err = collector.register_service("a", "").await.unwrap_err();
        assert!(matches!(err, CollectorError::DuplicateService(name) if name == "a"));
    }

    #[tokio::test]
    async fn service_env_points_at_the_collector() {
        let collector = collector();
        let addr = collector.register_service("a", "").await.unwrap();

        let env = collector.service_env("a").await.unwrap();
        assert_eq!(env[SERVICE_ADDRESS_ENV], addr.to_string());
        assert!(matches!(
            collector.service_env("missing").await,
            Err(CollectorError::UnknownService(_))
        ));
    }

    #[tokio::test]
    async fn errors_and_workers_are_aggregated() {
        let collector = collector();
        collector.register_service("a", "").await.unwrap();
        collector.register_service("b", "").await.unwrap();

        let a = collector.requirements("a").await.unwrap();
        a.register_schedule(ScheduleRegistration::every("tick", "1 minute"));
        a.register_schedule(ScheduleRegistration::every("tick", "1 minute"));
        let b = collector.requirements("b").await.unwrap();
        b.register_schedule(ScheduleRegistration::every("tock", "1 minute"));

        assert_eq!(collector.worker_count().await, 2);
        assert_eq!(
            collector.errors().await,
            vec!["a: schedule already registered: tick".to_string()]
        );

        let report = collector.report().await;
        assert_eq!(report.error_count(), 1);
        assert_eq!(report.services["b"].worker_count, 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["services"]["a"]["service_type"], "default");
        assert!(json["services"]["a"]["schedules"]["tick"].is_object());
    }

    #[tokio::test]
    async fn shutdown_keeps_requirements() {
        let collector = collector();
        collector.register_service("a", "").await.unwrap();
        collector
            .requirements("a")
            .await
            .unwrap()
            .register_schedule(ScheduleRegistration::every("tick", "1 minute"));

        collector.shutdown().await;
        assert_eq!(collector.report().await.services["a"].requirements.schedules.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_requirements_and_can_repeat() {
        let collector = collector();
        collector.register_service("a", "").await.unwrap();
        let a = collector.requirements("a").await.unwrap();

        collector.shutdown().await;
        collector.shutdown().await;

        assert!(a.is_closed());
        a.register_schedule(ScheduleRegistration::every("tick", "1 minute"));
        assert_eq!(collector.worker_count().await, 0);
    }
}

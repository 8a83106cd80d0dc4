//! The per-service requirements aggregate.
//!
//! [`Requirements`] holds the maps and the merge rules. [`ServiceRequirements`]
//! owns one behind a mutex and is what the collector server hands to every
//! call for that service. Every mutation takes the lock for its whole
//! read-check-write sequence and releases it before any network I/O.
//!
//! Once [`ServiceRequirements::close`] returns, the maps never change again.

use serde::{Serialize, Serializer};
use stackd_core::{
    ApiResource, ApiSecurityDefinitionResource, BucketResource, CollectionResource,
    DeclareRequest, Declaration, HttpProxyRequest, ListenerRegistration, PolicyResource,
    ResourceIdentifier, ResourceKind, RouteRegistration, ScheduleRegistration, SecretResource,
    SubscriptionRegistration, TopicResource, WebsocketEventType, WebsocketRegistration,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_SERVICE_TYPE: &str = "default";

/// A registration that clashes with one already collected. Conflicts never
/// fail the call that caused them; they are kept and reported after the run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    #[error("route already registered: {api} {path}")]
    Route { api: String, path: String },
    #[error("schedule already registered: {0}")]
    Schedule(String),
    #[error("bucket listener already registered: {0}")]
    Listener(String),
    #[error("websocket handler already registered: {socket} {event_type}")]
    WebsocketHandler {
        socket: String,
        event_type: WebsocketEventType,
    },
    #[error("cannot register HTTP proxy, API routes have already been registered")]
    ProxyAfterRoutes,
    #[error("cannot register HTTP proxy, another proxy has already been registered")]
    DuplicateProxy,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeclareError {
    #[error("api security definition {name} does not name its owning api")]
    MissingOwner { name: String },
    #[error("requirements for service {0} are closed")]
    Closed(String),
}

/// Everything one service has declared.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Requirements {
    pub routes: BTreeMap<String, Vec<RouteRegistration>>,
    pub schedules: BTreeMap<String, ScheduleRegistration>,
    pub subscriptions: BTreeMap<String, Vec<SubscriptionRegistration>>,
    pub websockets: BTreeMap<String, Vec<WebsocketRegistration>>,
    pub listeners: BTreeMap<String, ListenerRegistration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<HttpProxyRequest>,
    pub apis: BTreeMap<String, ApiResource>,
    pub api_security_definitions: BTreeMap<String, BTreeMap<String, ApiSecurityDefinitionResource>>,
    pub buckets: BTreeMap<String, BucketResource>,
    pub collections: BTreeMap<String, CollectionResource>,
    pub topics: BTreeMap<String, TopicResource>,
    pub secrets: BTreeMap<String, SecretResource>,
    pub policies: BTreeMap<String, PolicyResource>,
    #[serde(serialize_with = "serialize_messages")]
    pub errors: Vec<Conflict>,
}

fn serialize_messages<S: Serializer>(errors: &[Conflict], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(errors.iter().map(ToString::to_string))
}

impl Requirements {
    /// How many local workers are needed to serve the collected triggers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.routes.values().filter(|r| !r.is_empty()).count()
            + self.listeners.len()
            + self.schedules.len()
            + self.subscriptions.values().filter(|s| !s.is_empty()).count()
            + self.websockets.values().filter(|w| !w.is_empty()).count()
    }

    fn record(&mut self, conflict: Conflict) -> Option<Conflict> {
        self.errors.push(conflict.clone());
        Some(conflict)
    }

    /// Adds a route unless one with the same path and an overlapping method
    /// already exists on the API. Returns the recorded conflict, if any.
    pub fn add_route(&mut self, registration: RouteRegistration) -> Option<Conflict> {
        let existing = self
            .routes
            .get(&registration.api)
            .and_then(|routes| routes.iter().find(|r| r.overlaps(&registration)))
            .map(|r| Conflict::Route {
                api: r.api.clone(),
                path: r.path.clone(),
            });

        if let Some(conflict) = existing {
            return self.record(conflict);
        }

        self.routes
            .entry(registration.api.clone())
            .or_default()
            .push(registration);
        None
    }

    /// The latest schedule under a name wins, but the clash is still recorded.
    pub fn add_schedule(&mut self, registration: ScheduleRegistration) -> Option<Conflict> {
        let name = registration.schedule_name.clone();
        let conflict = if self.schedules.contains_key(&name) {
            self.record(Conflict::Schedule(name.clone()))
        } else {
            None
        };

        self.schedules.insert(name, registration);
        conflict
    }

    pub fn add_subscription(&mut self, registration: SubscriptionRegistration) {
        self.subscriptions
            .entry(registration.topic_name.clone())
            .or_default()
            .push(registration);
    }

    pub fn add_listener(&mut self, registration: ListenerRegistration) -> Option<Conflict> {
        if self.listeners.contains_key(&registration.bucket_name) {
            return self.record(Conflict::Listener(registration.bucket_name));
        }

        self.listeners
            .insert(registration.bucket_name.clone(), registration);
        None
    }

    pub fn add_websocket_handler(&mut self, registration: WebsocketRegistration) -> Option<Conflict> {
        let taken = self
            .websockets
            .get(&registration.socket_name)
            .is_some_and(|handlers| {
                handlers
                    .iter()
                    .any(|h| h.event_type == registration.event_type)
            });

        if taken {
            return self.record(Conflict::WebsocketHandler {
                socket: registration.socket_name,
                event_type: registration.event_type,
            });
        }

        self.websockets
            .entry(registration.socket_name.clone())
            .or_default()
            .push(registration);
        None
    }

    /// A proxy takes over the whole service, so it excludes routes and other
    /// proxies. A rejected proxy leaves the current state untouched.
    pub fn set_proxy(&mut self, request: HttpProxyRequest) -> Option<Conflict> {
        if self.routes.values().any(|r| !r.is_empty()) {
            return self.record(Conflict::ProxyAfterRoutes);
        }
        if self.proxy.is_some() {
            return self.record(Conflict::DuplicateProxy);
        }

        self.proxy = Some(request);
        None
    }
}

/// The requirements of one running service, shared by all of its calls.
#[derive(Debug)]
pub struct ServiceRequirements {
    service_name: String,
    service_type: String,
    inner: Mutex<Requirements>,
    closed: AtomicBool,
}

impl ServiceRequirements {
    #[must_use]
    pub fn new(service_name: impl Into<String>, service_type: impl Into<String>) -> Self {
        let service_type = service_type.into();
        let service_type = if service_type.is_empty() {
            DEFAULT_SERVICE_TYPE.to_string()
        } else {
            service_type
        };

        Self {
            service_name: service_name.into(),
            service_type,
            inner: Mutex::new(Requirements::default()),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    #[must_use]
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    // Every critical section leaves the maps consistent, so a panic in
    // another holder does not invalidate them.
    fn lock(&self) -> MutexGuard<'_, Requirements> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Only written under the lock, so a mutation that saw the aggregate open
    // finishes before `close` returns.
    fn lock_open(&self) -> Option<MutexGuard<'_, Requirements>> {
        let guard = self.lock();
        if self.closed.load(Ordering::Acquire) {
            debug!("Service {} is closed; dropping the mutation", self.service_name);
            return None;
        }
        Some(guard)
    }

    /// Freezes the aggregate. Later declarations fail and later
    /// registrations are dropped. Reads keep working.
    pub fn close(&self) {
        let _guard = self.lock();
        self.closed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn report(&self, conflict: Option<Conflict>) -> Option<Conflict> {
        if let Some(conflict) = &conflict {
            warn!("Service {}: {}", self.service_name, conflict);
        }
        conflict
    }

    /// Records a declarative resource. Re-declaring a name replaces the
    /// previous definition.
    ///
    /// # Errors
    ///
    /// Returns `DeclareError::MissingOwner` for a security definition without
    /// an API name, and `DeclareError::Closed` once the aggregate is closed.
    /// Nothing is recorded in either case.
    pub fn declare(&self, request: DeclareRequest) -> Result<(), DeclareError> {
        let DeclareRequest { name, declaration } = request;
        let kind = declaration.kind();

        let declaration = match declaration {
            Declaration::Policy(policy) => Declaration::Policy(self.scope_policy(policy)),
            Declaration::ApiSecurityDefinition(def) if def.api_name.is_empty() => {
                return Err(DeclareError::MissingOwner { name });
            }
            other => other,
        };

        {
            let Some(mut requirements) = self.lock_open() else {
                return Err(DeclareError::Closed(self.service_name.clone()));
            };
            match declaration {
                Declaration::Bucket(bucket) => {
                    requirements.buckets.insert(name.clone(), bucket);
                }
                Declaration::Collection(collection) => {
                    requirements.collections.insert(name.clone(), collection);
                }
                Declaration::Api(api) => {
                    requirements.apis.insert(name.clone(), api);
                }
                Declaration::ApiSecurityDefinition(def) => {
                    requirements
                        .api_security_definitions
                        .entry(def.api_name.clone())
                        .or_default()
                        .insert(name.clone(), def);
                }
                Declaration::Secret(secret) => {
                    requirements.secrets.insert(name.clone(), secret);
                }
                Declaration::Policy(policy) => {
                    requirements.policies.insert(name.clone(), policy);
                }
                Declaration::Topic(topic) => {
                    requirements.topics.insert(name.clone(), topic);
                }
                Declaration::Unrecognized => {}
            }
        }

        match kind {
            Some(kind) => debug!("Service {} declared {} {}", self.service_name, kind, name),
            None => warn!(
                "Service {} declared {} with an unrecognized resource kind; ignoring it",
                self.service_name, name
            ),
        }
        Ok(())
    }

    // Services don't know their own name, so principals referring to "this
    // service" are filled in here, once, at declaration time.
    fn scope_policy(&self, mut policy: PolicyResource) -> PolicyResource {
        if policy.principals.is_empty() {
            policy.principals.push(ResourceIdentifier::new(
                &self.service_name,
                ResourceKind::Service,
            ));
        } else {
            for principal in &mut policy.principals {
                if principal.name.is_empty() && principal.kind == ResourceKind::Service {
                    principal.name.clone_from(&self.service_name);
                }
            }
        }
        policy
    }

    pub fn proxy(&self, request: HttpProxyRequest) -> Option<Conflict> {
        let conflict = self.lock_open()?.set_proxy(request);
        self.report(conflict)
    }

    pub fn register_route(&self, registration: RouteRegistration) -> Option<Conflict> {
        let conflict = self.lock_open()?.add_route(registration);
        self.report(conflict)
    }

    pub fn register_schedule(&self, registration: ScheduleRegistration) -> Option<Conflict> {
        let conflict = self.lock_open()?.add_schedule(registration);
        self.report(conflict)
    }

    pub fn register_subscription(&self, registration: SubscriptionRegistration) {
        if let Some(mut requirements) = self.lock_open() {
            requirements.add_subscription(registration);
        }
    }

    pub fn register_listener(&self, registration: ListenerRegistration) -> Option<Conflict> {
        let conflict = self.lock_open()?.add_listener(registration);
        self.report(conflict)
    }

    pub fn register_websocket_handler(
        &self,
        registration: WebsocketRegistration,
    ) -> Option<Conflict> {
        let conflict = self.lock_open()?.add_websocket_handler(registration);
        self.report(conflict)
    }

    /// Recomputed from the current maps on every call.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.lock().worker_count()
    }

    /// A copy of everything collected so far.
    #[must_use]
    pub fn snapshot(&self) -> Requirements {
        self.lock().clone()
    }

    #[must_use]
    pub fn errors(&self) -> Vec<Conflict> {
        self.lock().errors.clone()
    }

    #[must_use]
    pub fn routes(&self) -> BTreeMap<String, Vec<RouteRegistration>> {
        self.lock().routes.clone()
    }

    #[must_use]
    pub fn schedules(&self) -> BTreeMap<String, ScheduleRegistration> {
        self.lock().schedules.clone()
    }

    #[must_use]
    pub fn subscriptions(&self) -> BTreeMap<String, Vec<SubscriptionRegistration>> {
        self.lock().subscriptions.clone()
    }

    #[must_use]
    pub fn websockets(&self) -> BTreeMap<String, Vec<WebsocketRegistration>> {
        self.lock().websockets.clone()
    }

    #[must_use]
    pub fn listeners(&self) -> BTreeMap<String, ListenerRegistration> {
        self.lock().listeners.clone()
    }

    #[must_use]
    pub fn proxy_request(&self) -> Option<HttpProxyRequest> {
        self.lock().proxy.clone()
    }

    #[must_use]
    pub fn apis(&self) -> BTreeMap<String, ApiResource> {
        self.lock().apis.clone()
    }

    #[must_use]
    pub fn api_security_definitions(
        &self,
    ) -> BTreeMap<String, BTreeMap<String, ApiSecurityDefinitionResource>> {
        self.lock().api_security_definitions.clone()
    }

    #[must_use]
    pub fn buckets(&self) -> BTreeMap<String, BucketResource> {
        self.lock().buckets.clone()
    }

    #[must_use]
    pub fn collections(&self) -> BTreeMap<String, CollectionResource> {
        self.lock().collections.clone()
    }

    #[must_use]
    pub fn topics(&self) -> BTreeMap<String, TopicResource> {
        self.lock().topics.clone()
    }

    #[must_use]
    pub fn secrets(&self) -> BTreeMap<String, SecretResource> {
        self.lock().secrets.clone()
    }

    #[must_use]
    pub fn policies(&self) -> BTreeMap<String, PolicyResource> {
        self.lock().policies.clone()
    }
}

//! Registrations sent as the first frame of a streaming trigger endpoint.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The five streaming endpoints a service can open.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Route,
    Schedule,
    Subscription,
    Listener,
    Websocket,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Route => "route",
            Self::Schedule => "schedule",
            Self::Subscription => "subscription",
            Self::Listener => "listener",
            Self::Websocket => "websocket",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteOptions {
    #[serde(default)]
    pub security_disabled: bool,
    /// Security definition name to required scopes, overriding the API default.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub security: BTreeMap<String, Vec<String>>,
}

/// A handler for `methods` on `path` of the API `api`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteRegistration {
    pub api: String,
    pub path: String,
    pub methods: Vec<String>,
    #[serde(default)]
    pub options: RouteOptions,
}

impl RouteRegistration {
    #[must_use]
    pub fn new(api: impl Into<String>, path: impl Into<String>, methods: &[&str]) -> Self {
        Self {
            api: api.into(),
            path: path.into(),
            methods: methods.iter().map(|m| (*m).to_string()).collect(),
            options: RouteOptions::default(),
        }
    }

    /// Two routes collide when they share a path and at least one method.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.path == other.path && self.methods.iter().any(|m| other.methods.contains(m))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// A fixed rate such as `"5 minutes"`.
    Every { rate: String },
    Cron { expression: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleRegistration {
    pub schedule_name: String,
    pub cadence: Cadence,
}

impl ScheduleRegistration {
    #[must_use]
    pub fn every(schedule_name: impl Into<String>, rate: impl Into<String>) -> Self {
        Self {
            schedule_name: schedule_name.into(),
            cadence: Cadence::Every { rate: rate.into() },
        }
    }

    #[must_use]
    pub fn cron(schedule_name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            schedule_name: schedule_name.into(),
            cadence: Cadence::Cron {
                expression: expression.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionRegistration {
    pub topic_name: String,
}

impl SubscriptionRegistration {
    #[must_use]
    pub fn new(topic_name: impl Into<String>) -> Self {
        Self {
            topic_name: topic_name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlobEventType {
    Created,
    Deleted,
}

/// A storage event listener on a bucket. At most one per bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListenerRegistration {
    pub bucket_name: String,
    pub event_type: BlobEventType,
    #[serde(default)]
    pub key_prefix_filter: String,
}

impl ListenerRegistration {
    #[must_use]
    pub fn new(bucket_name: impl Into<String>, event_type: BlobEventType) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            event_type,
            key_prefix_filter: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WebsocketEventType {
    Connect,
    Disconnect,
    Message,
}

impl fmt::Display for WebsocketEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Message => "message",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebsocketRegistration {
    pub socket_name: String,
    pub event_type: WebsocketEventType,
}

impl WebsocketRegistration {
    #[must_use]
    pub fn new(socket_name: impl Into<String>, event_type: WebsocketEventType) -> Self {
        Self {
            socket_name: socket_name.into(),
            event_type,
        }
    }
}

/// Forward every HTTP request for the service to `host`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpProxyRequest {
    pub host: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_overlap_on_shared_method_and_path() {
        let a = RouteRegistration::new("main", "/users", &["GET", "POST"]);
        let b = RouteRegistration::new("main", "/users", &["POST"]);
        let c = RouteRegistration::new("main", "/users", &["DELETE"]);
        let d = RouteRegistration::new("main", "/users/:id", &["GET"]);

        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert!(!a.overlaps(&d));
    }
}

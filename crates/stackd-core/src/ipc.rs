//! Frames exchanged between a service and its collector.
//!
//! Every connection carries exactly one call. Frames are newline-delimited
//! JSON; the first frame is always a [`Call`].

use crate::resources::DeclareRequest;
use crate::triggers::{HttpProxyRequest, TriggerKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum Call {
    Declare(DeclareRequest),
    Details,
    Proxy(HttpProxyRequest),
    /// Opens an API route stream.
    Serve,
    Schedule,
    Subscribe,
    Listen,
    HandleEvents,
}

impl Call {
    /// The trigger stream this call opens, or `None` for unary calls.
    #[must_use]
    pub const fn stream(&self) -> Option<TriggerKind> {
        match self {
            Self::Serve => Some(TriggerKind::Route),
            Self::Schedule => Some(TriggerKind::Schedule),
            Self::Subscribe => Some(TriggerKind::Subscription),
            Self::Listen => Some(TriggerKind::Listener),
            Self::HandleEvents => Some(TriggerKind::Websocket),
            Self::Declare(_) | Self::Details | Self::Proxy(_) => None,
        }
    }

    /// The call that opens the stream for `kind`.
    #[must_use]
    pub const fn open(kind: TriggerKind) -> Self {
        match kind {
            TriggerKind::Route => Self::Serve,
            TriggerKind::Schedule => Self::Schedule,
            TriggerKind::Subscription => Self::Subscribe,
            TriggerKind::Listener => Self::Listen,
            TriggerKind::Websocket => Self::HandleEvents,
        }
    }
}

/// Resource details reported by the `details` call. The collector has no live
/// resources, so the report is always empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", content = "body", rename_all = "snake_case")]
pub enum UnaryResponse {
    Declared,
    Details(ResourceDetails),
    Proxied,
    Error(String),
}

/// Request/response traffic that follows registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataFrame {
    pub id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A frame sent by the service on a trigger stream. `R` is the registration
/// type of the stream's trigger kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum ClientMessage<R> {
    RegistrationRequest(R),
    Response(DataFrame),
}

/// A frame sent by the collector on a trigger stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum ServerMessage {
    RegistrationResponse,
    Request(DataFrame),
    Error(String),
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::triggers::SubscriptionRegistration;

    #[test]
    fn stream_calls_map_to_trigger_kinds() {
        for kind in [
            TriggerKind::Route,
            TriggerKind::Schedule,
            TriggerKind::Subscription,
            TriggerKind::Listener,
            TriggerKind::Websocket,
        ] {
            assert_eq!(Call::open(kind).stream(), Some(kind));
        }
        assert_eq!(Call::Details.stream(), None);
    }

    #[test]
    fn call_frames_are_tagged() {
        let json = serde_json::to_string(&Call::HandleEvents).unwrap();
        assert_eq!(json, r#"{"call":"handle_events"}"#);
    }

    #[test]
    fn client_message_wire_shape() {
        let msg = ClientMessage::RegistrationRequest(SubscriptionRegistration::new("orders"));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "registration_request");
        assert_eq!(value["content"]["topic_name"], "orders");

        let ack = serde_json::to_string(&ServerMessage::RegistrationResponse).unwrap();
        assert_eq!(ack, r#"{"type":"registration_response"}"#);
    }
}

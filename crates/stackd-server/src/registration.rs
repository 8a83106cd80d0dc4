//! The handshake every trigger stream starts with.
//!
//! A stream is opened, the service sends exactly one registration, and the
//! collector acknowledges it. Anything after that is request/response
//! traffic, which a collector only observes.

use crate::ipc::ProtocolError;
use crate::requirements::{Conflict, ServiceRequirements};
use serde::Serialize;
use serde::de::DeserializeOwned;
use stackd_core::{
    ClientMessage, ListenerRegistration, RouteRegistration, ScheduleRegistration, ServerMessage,
    SubscriptionRegistration, TriggerKind, WebsocketRegistration,
};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// A trigger registration and the rule it is collected under.
pub trait Registration: Serialize + DeserializeOwned + fmt::Debug + Send + 'static {
    const KIND: TriggerKind;

    fn register(self, requirements: &ServiceRequirements) -> Option<Conflict>;
}

impl Registration for RouteRegistration {
    const KIND: TriggerKind = TriggerKind::Route;

    fn register(self, requirements: &ServiceRequirements) -> Option<Conflict> {
        requirements.register_route(self)
    }
}

impl Registration for ScheduleRegistration {
    const KIND: TriggerKind = TriggerKind::Schedule;

    fn register(self, requirements: &ServiceRequirements) -> Option<Conflict> {
        requirements.register_schedule(self)
    }
}

impl Registration for SubscriptionRegistration {
    const KIND: TriggerKind = TriggerKind::Subscription;

    fn register(self, requirements: &ServiceRequirements) -> Option<Conflict> {
        requirements.register_subscription(self);
        None
    }
}

impl Registration for ListenerRegistration {
    const KIND: TriggerKind = TriggerKind::Listener;

    fn register(self, requirements: &ServiceRequirements) -> Option<Conflict> {
        requirements.register_listener(self)
    }
}

impl Registration for WebsocketRegistration {
    const KIND: TriggerKind = TriggerKind::Websocket;

    fn register(self, requirements: &ServiceRequirements) -> Option<Conflict> {
        requirements.register_websocket_handler(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    AwaitingRegistration,
    Registered,
}

/// Server side of one trigger stream, independent of the transport.
#[derive(Debug)]
pub struct RegistrationStream<R> {
    requirements: Arc<ServiceRequirements>,
    state: StreamState,
    _registration: PhantomData<fn() -> R>,
}

impl<R: Registration> RegistrationStream<R> {
    #[must_use]
    pub const fn new(requirements: Arc<ServiceRequirements>) -> Self {
        Self {
            requirements,
            state: StreamState::AwaitingRegistration,
            _registration: PhantomData,
        }
    }

    #[must_use]
    pub const fn state(&self) -> StreamState {
        self.state
    }

    /// Feeds one client frame through the stream and returns the reply to
    /// send, if any.
    ///
    /// A conflicting registration is still acknowledged; the conflict is
    /// recorded on the requirements, not returned to the service.
    ///
    /// # Errors
    ///
    /// The first frame must be a registration request and later frames must
    /// not be. Either violation ends the stream, as does a registration that
    /// arrives after the requirements were closed.
    pub fn handle(&mut self, message: ClientMessage<R>) -> Result<Option<ServerMessage>, ProtocolError> {
        match (self.state, message) {
            (StreamState::AwaitingRegistration, ClientMessage::RegistrationRequest(_))
                if self.requirements.is_closed() =>
            {
                Err(ProtocolError::Closed(self.requirements.service_name().to_string()))
            }
            (StreamState::AwaitingRegistration, ClientMessage::RegistrationRequest(registration)) => {
                debug!(
                    "Service {} registered {}: {:?}",
                    self.requirements.service_name(),
                    R::KIND,
                    registration
                );
                registration.register(&self.requirements);
                self.state = StreamState::Registered;
                Ok(Some(ServerMessage::RegistrationResponse))
            }
            (StreamState::AwaitingRegistration, ClientMessage::Response(_)) => {
                Err(ProtocolError::RegistrationExpected(R::KIND))
            }
            (StreamState::Registered, ClientMessage::RegistrationRequest(_)) => {
                Err(ProtocolError::AlreadyRegistered(R::KIND))
            }
            (StreamState::Registered, ClientMessage::Response(frame)) => {
                debug!(
                    "Service {} answered {} request {}",
                    self.requirements.service_name(),
                    R::KIND,
                    frame.id
                );
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use stackd_core::{BlobEventType, DataFrame, WebsocketEventType};

    fn requirements() -> Arc<ServiceRequirements> {
        Arc::new(ServiceRequirements::new("orders", "default"))
    }

    fn frame(id: &str) -> DataFrame {
        DataFrame {
            id: id.to_string(),
            payload: serde_json::Value::Null,
        }
    }

    #[test]
    fn first_registration_is_acknowledged_and_collected() {
        let reqs = requirements();
        let mut stream = RegistrationStream::<ScheduleRegistration>::new(Arc::clone(&reqs));
        assert_eq!(stream.state(), StreamState::AwaitingRegistration);

        let reply = stream
            .handle(ClientMessage::RegistrationRequest(ScheduleRegistration::every(
                "tick", "1 minute",
            )))
            .unwrap();

        assert_eq!(reply, Some(ServerMessage::RegistrationResponse));
        assert_eq!(stream.state(), StreamState::Registered);
        assert!(reqs.schedules().contains_key("tick"));
    }

    #[test]
    fn response_before_registration_is_a_protocol_error() {
        let reqs = requirements();
        let mut stream = RegistrationStream::<RouteRegistration>::new(Arc::clone(&reqs));

        let err = stream.handle(ClientMessage::Response(frame("1"))).unwrap_err();
        assert!(matches!(err, ProtocolError::RegistrationExpected(TriggerKind::Route)));
        assert!(reqs.routes().is_empty());
        assert_eq!(stream.state(), StreamState::AwaitingRegistration);
    }

    #[test]
    fn second_registration_is_rejected() {
        let reqs = requirements();
        let mut stream = RegistrationStream::<ListenerRegistration>::new(Arc::clone(&reqs));
        stream
            .handle(ClientMessage::RegistrationRequest(ListenerRegistration::new(
                "images",
                BlobEventType::Created,
            )))
            .unwrap();

        let err = stream
            .handle(ClientMessage::RegistrationRequest(ListenerRegistration::new(
                "videos",
                BlobEventType::Created,
            )))
            .unwrap_err();

        assert!(matches!(err, ProtocolError::AlreadyRegistered(TriggerKind::Listener)));
        assert_eq!(reqs.listeners().len(), 1);
    }

    #[test]
    fn responses_after_registration_are_observed_only() {
        let mut stream = RegistrationStream::<SubscriptionRegistration>::new(requirements());
        stream
            .handle(ClientMessage::RegistrationRequest(SubscriptionRegistration::new("orders")))
            .unwrap();

        assert_eq!(stream.handle(ClientMessage::Response(frame("a"))).unwrap(), None);
        assert_eq!(stream.handle(ClientMessage::Response(frame("b"))).unwrap(), None);
    }

    #[test]
    fn conflicting_registration_is_still_acknowledged() {
        let reqs = requirements();
        let register = || {
            let mut stream = RegistrationStream::<WebsocketRegistration>::new(Arc::clone(&reqs));
            stream
                .handle(ClientMessage::RegistrationRequest(WebsocketRegistration::new(
                    "chat",
                    WebsocketEventType::Message,
                )))
                .unwrap()
        };

        assert_eq!(register(), Some(ServerMessage::RegistrationResponse));
        assert_eq!(register(), Some(ServerMessage::RegistrationResponse));
        assert_eq!(reqs.errors().len(), 1);
    }

    #[test]
    fn registration_after_close_is_refused() {
        let reqs = requirements();
        reqs.close();
        let mut stream = RegistrationStream::<RouteRegistration>::new(Arc::clone(&reqs));

        let err = stream
            .handle(ClientMessage::RegistrationRequest(RouteRegistration::new(
                "main",
                "/orders",
                &["GET"],
            )))
            .unwrap_err();

        assert!(matches!(err, ProtocolError::Closed(name) if name == "orders"));
        assert_eq!(stream.state(), StreamState::AwaitingRegistration);
        assert!(reqs.routes().is_empty());
    }
}

pub mod config;
pub use config::CollectorConfig;
pub mod ipc;
pub use ipc::{Call, ClientMessage, DataFrame, ServerMessage, UnaryResponse};
pub mod resources;
pub use resources::{
    Action, ApiResource, ApiSecurityDefinitionResource, BucketResource, CollectionResource,
    DeclareRequest, Declaration, PolicyResource, ResourceIdentifier, ResourceKind, SecretResource,
    SecurityDefinition, TopicResource,
};
pub mod triggers;
pub use triggers::{
    BlobEventType, Cadence, HttpProxyRequest, ListenerRegistration, RouteOptions,
    RouteRegistration, ScheduleRegistration, SubscriptionRegistration, TriggerKind,
    WebsocketEventType, WebsocketRegistration,
};

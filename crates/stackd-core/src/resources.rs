//! Declarative resources a service asks for through the unary `declare` call.
//!
//! Each declaration is an idempotent fact: declaring the same name twice
//! replaces the earlier definition.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The kind of a named resource, used in policy principals and targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Service,
    Bucket,
    Collection,
    Api,
    ApiSecurityDefinition,
    Secret,
    Policy,
    Topic,
    Schedule,
    Websocket,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Service => "service",
            Self::Bucket => "bucket",
            Self::Collection => "collection",
            Self::Api => "api",
            Self::ApiSecurityDefinition => "api_security_definition",
            Self::Secret => "secret",
            Self::Policy => "policy",
            Self::Topic => "topic",
            Self::Schedule => "schedule",
            Self::Websocket => "websocket",
        };
        f.write_str(name)
    }
}

/// A reference to a named resource of a given kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceIdentifier {
    #[serde(default)]
    pub name: String,
    pub kind: ResourceKind,
}

impl ResourceIdentifier {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// A service principal that has not been told its own name yet.
    #[must_use]
    pub fn anonymous_service() -> Self {
        Self::new(String::new(), ResourceKind::Service)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketResource {}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionResource {}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretResource {}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicResource {}

/// An API gateway. `security` maps a security definition name to the scopes
/// required by default on every route of the API.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiResource {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub security: BTreeMap<String, Vec<String>>,
}

/// How an API authenticates callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecurityDefinition {
    Oidc {
        issuer: String,
        #[serde(default)]
        audiences: Vec<String>,
    },
}

/// A security definition attached to an API. The owning API is named by
/// `api_name` and must not be empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiSecurityDefinitionResource {
    pub api_name: String,
    pub definition: SecurityDefinition,
}

/// Permissions a policy can grant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    BucketFileList,
    BucketFileGet,
    BucketFilePut,
    BucketFileDelete,
    TopicList,
    TopicDetail,
    TopicPublish,
    CollectionDocumentRead,
    CollectionDocumentWrite,
    CollectionDocumentDelete,
    CollectionQuery,
    CollectionList,
    SecretPut,
    SecretAccess,
    WebsocketManage,
}

/// Grants `actions` on `resources` to `principals`.
///
/// An empty principal list means "the declaring service". The collector fills
/// it in, since services do not know their own name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyResource {
    #[serde(default)]
    pub principals: Vec<ResourceIdentifier>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub resources: Vec<ResourceIdentifier>,
}

/// The payload of a unary declaration, tagged by resource kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Declaration {
    Bucket(BucketResource),
    Collection(CollectionResource),
    Api(ApiResource),
    ApiSecurityDefinition(ApiSecurityDefinitionResource),
    Secret(SecretResource),
    Policy(PolicyResource),
    Topic(TopicResource),
    /// Any kind this collector does not know how to record.
    #[serde(other)]
    Unrecognized,
}

impl Declaration {
    /// The resource kind this declaration creates, if it is a known one.
    #[must_use]
    pub const fn kind(&self) -> Option<ResourceKind> {
        match self {
            Self::Bucket(_) => Some(ResourceKind::Bucket),
            Self::Collection(_) => Some(ResourceKind::Collection),
            Self::Api(_) => Some(ResourceKind::Api),
            Self::ApiSecurityDefinition(_) => Some(ResourceKind::ApiSecurityDefinition),
            Self::Secret(_) => Some(ResourceKind::Secret),
            Self::Policy(_) => Some(ResourceKind::Policy),
            Self::Topic(_) => Some(ResourceKind::Topic),
            Self::Unrecognized => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeclareRequest {
    pub name: String,
    pub declaration: Declaration,
}

impl DeclareRequest {
    #[must_use]
    pub fn new(name: impl Into<String>, declaration: Declaration) -> Self {
        Self {
            name: name.into(),
            declaration,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn declaration_is_tagged_by_kind() {
        let request = DeclareRequest::new("images", Declaration::Bucket(BucketResource {}));
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["declaration"]["kind"], "bucket");

        let parsed: DeclareRequest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn unknown_kind_parses_as_unrecognized() {
        let json = r#"{"name":"q","declaration":{"kind":"queue","depth":3}}"#;
        let parsed: DeclareRequest = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.declaration, Declaration::Unrecognized);
        assert_eq!(parsed.declaration.kind(), None);
    }

    #[test]
    fn policy_principals_default_to_empty() {
        let json = r#"{"kind":"policy","actions":["bucket_file_get"],"resources":[{"name":"images","kind":"bucket"}]}"#;
        let parsed: Declaration = serde_json::from_str(json).unwrap();
        let Declaration::Policy(policy) = parsed else {
            panic!("expected a policy declaration");
        };
        assert!(policy.principals.is_empty());
        assert_eq!(policy.actions, vec![Action::BucketFileGet]);
    }

    #[test]
    fn security_definition_round_trips_with_api_owner() {
        let json = r#"{"kind":"api_security_definition","api_name":"public","definition":{"type":"oidc","issuer":"https://auth.example.com"}}"#;
        let parsed: Declaration = serde_json::from_str(json).unwrap();
        let Declaration::ApiSecurityDefinition(def) = parsed else {
            panic!("expected a security definition");
        };
        assert_eq!(def.api_name, "public");
        assert_eq!(
            def.definition,
            SecurityDefinition::Oidc {
                issuer: "https://auth.example.com".to_string(),
                audiences: Vec::new(),
            }
        );
    }
}

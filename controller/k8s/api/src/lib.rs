#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod duration;
pub mod labels;
pub mod naming;
pub mod policy;
pub mod rbac;
pub mod request;

pub use self::labels::NamespaceSelector;
pub use k8s_openapi::{
    api::{
        self,
        core::v1::Namespace,
        rbac::v1::{ClusterRoleBinding, RoleBinding},
    },
    apimachinery::{self, pkg::apis::meta::v1::Time},
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams, Resource, ResourceExt},
    error::ErrorResponse,
    Client, Error,
};

/// API group served by every custom resource in this workspace.
pub const API_GROUP: &str = "tarbac.io";
pub const API_VERSION: &str = "tarbac.io/v1";

/// Label propagated from a request to every descendant resource so that an
/// audit trail can be stitched together across kinds.
pub const REQUEST_ID_LABEL: &str = "tarbac.io/request-id";

/// Label pointing a native binding back at the grant that created it.
pub const OWNED_BY_LABEL: &str = "tarbac.io/owner";

/// Annotations stamped by the admission mutator; the reconcilers trust these
/// and nothing else for caller identity.
pub const REQUESTER_ANNOTATION: &str = "tarbac.io/requester";
pub const REQUESTER_METADATA_ANNOTATION: &str = "tarbac.io/requester-metadata";

/// Sentinel namespace entry that means "grant cluster-wide instead of
/// per-namespace".
pub const ALL_NAMESPACES: &str = "*";

/// Reference to a Role or ClusterRole granted by a policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoleRef {
    #[serde(default)]
    pub api_group: String,
    pub kind: String,
    pub name: String,
}

/// A principal a grant applies to.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub kind: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Subject {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            kind: "User".to_string(),
            name: name.into(),
            api_group: Some("rbac.authorization.k8s.io".to_string()),
            namespace: None,
        }
    }
}

impl From<RoleRef> for k8s_openapi::api::rbac::v1::RoleRef {
    fn from(RoleRef { api_group, kind, name }: RoleRef) -> Self {
        Self {
            api_group,
            kind,
            name,
        }
    }
}

impl From<Subject> for k8s_openapi::api::rbac::v1::Subject {
    fn from(subject: Subject) -> Self {
        Self {
            kind: subject.kind,
            name: subject.name,
            api_group: subject.api_group,
            namespace: subject.namespace,
        }
    }
}

/// A resource created on behalf of a parent, persisted in the parent's status
/// so that expiry and aggregation can find it again.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChildResource {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

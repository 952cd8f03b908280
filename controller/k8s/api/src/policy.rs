use crate::{labels::NamespaceSelector, RoleRef};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Grants members of `allowedUsers` the right to request `roleRef` in the
/// policy's own namespace for at most `maxDuration`.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "tarbac.io",
    version = "v1",
    kind = "SudoPolicy",
    namespaced,
    status = "PolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SudoPolicySpec {
    /// Upper bound on the duration a request may ask for, e.g. `"1h"`.
    pub max_duration: String,
    pub role_ref: RoleRef,
    pub allowed_users: Vec<UserRef>,
}

/// Cluster-scoped variant: additionally constrains *where* the role may be
/// granted. Exactly one of `allowedNamespaces` and
/// `allowedNamespacesSelector` must be set; `["*"]` means a single
/// cluster-wide grant.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "tarbac.io",
    version = "v1",
    kind = "ClusterSudoPolicy",
    status = "ClusterPolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSudoPolicySpec {
    pub max_duration: String,
    pub role_ref: RoleRef,
    pub allowed_users: Vec<UserRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_namespaces: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_namespaces_selector: Option<NamespaceSelector>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct UserRef {
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    #[serde(default, skip_serializing_if = "PolicyState::is_unset")]
    pub state: PolicyState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPolicyStatus {
    #[serde(default, skip_serializing_if = "PolicyState::is_unset")]
    pub state: PolicyState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    /// Snapshot of the namespaces the policy currently resolves to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum PolicyState {
    #[default]
    #[serde(rename = "")]
    Unset,
    Active,
    Error,
}

impl PolicyState {
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }
}

impl std::fmt::Display for PolicyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unset => f.write_str(""),
            Self::Active => f.write_str("Active"),
            Self::Error => f.write_str("Error"),
        }
    }
}

impl UserRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// True when `requester` is one of the policy's allowed users.
pub fn user_allowed(allowed: &[UserRef], requester: &str) -> bool {
    allowed.iter().any(|user| user.name == requester)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_allowlist() {
        let allowed = vec![UserRef::named("alice"), UserRef::named("carol")];
        assert!(user_allowed(&allowed, "alice"));
        assert!(!user_allowed(&allowed, "bob"));
        assert!(!user_allowed(&[], "alice"));
    }

    #[test]
    fn spec_round_trips_camel_case() {
        let json = serde_json::json!({
            "maxDuration": "1h",
            "roleRef": {
                "apiGroup": "rbac.authorization.k8s.io",
                "kind": "ClusterRole",
                "name": "admin",
            },
            "allowedUsers": [{"name": "alice"}],
            "allowedNamespaces": ["ns1", "ns2"],
        });
        let spec: ClusterSudoPolicySpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.max_duration, "1h");
        assert_eq!(spec.role_ref.kind, "ClusterRole");
        assert_eq!(spec.allowed_namespaces.as_deref(), Some(&["ns1".to_string(), "ns2".to_string()][..]));
        assert!(spec.allowed_namespaces_selector.is_none());
    }
}

use crate::{ChildResource, RoleRef, Subject, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A materialized grant: owns one native RoleBinding per subject and revokes
/// them when `duration` elapses.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "tarbac.io",
    version = "v1",
    kind = "TemporaryRBAC",
    namespaced,
    status = "BindingStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct TemporaryRBACSpec {
    pub subjects: Vec<Subject>,
    pub role_ref: RoleRef,
    pub duration: String,
    #[serde(default, skip_serializing_if = "RetentionPolicy::is_retain")]
    pub retention_policy: RetentionPolicy,
}

/// Cluster-scoped variant; materializes ClusterRoleBindings.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "tarbac.io",
    version = "v1",
    kind = "ClusterTemporaryRBAC",
    status = "BindingStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTemporaryRBACSpec {
    pub subjects: Vec<Subject>,
    pub role_ref: RoleRef,
    pub duration: String,
    #[serde(default, skip_serializing_if = "RetentionPolicy::is_retain")]
    pub retention_policy: RetentionPolicy,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BindingStatus {
    #[serde(default, skip_serializing_if = "BindingState::is_unset")]
    pub state: BindingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Time>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Time>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    /// Native bindings still held; drained before the grant is marked
    /// Expired.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_resource: Vec<ChildResource>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum BindingState {
    #[default]
    #[serde(rename = "")]
    Unset,
    Created,
    Expired,
    Error,
}

impl BindingState {
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }
}

impl std::fmt::Display for BindingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unset => "",
            Self::Created => "Created",
            Self::Expired => "Expired",
            Self::Error => "Error",
        };
        f.write_str(s)
    }
}

/// What happens to the grant object itself after its bindings are revoked.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Keep the expired grant around for audit (garbage collection removes
    /// it with its owner).
    #[default]
    Retain,
    /// Delete the grant as soon as its bindings are gone.
    Delete,
}

impl RetentionPolicy {
    pub fn is_retain(&self) -> bool {
        matches!(self, Self::Retain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_policy_wire_format() {
        let spec: TemporaryRBACSpec = serde_json::from_value(serde_json::json!({
            "subjects": [{"kind": "User", "name": "alice"}],
            "roleRef": {"apiGroup": "rbac.authorization.k8s.io", "kind": "Role", "name": "admin"},
            "duration": "5m",
            "retentionPolicy": "delete",
        }))
        .unwrap();
        assert_eq!(spec.retention_policy, RetentionPolicy::Delete);

        let spec: TemporaryRBACSpec = serde_json::from_value(serde_json::json!({
            "subjects": [{"kind": "User", "name": "alice"}],
            "roleRef": {"apiGroup": "rbac.authorization.k8s.io", "kind": "Role", "name": "admin"},
            "duration": "5m",
        }))
        .unwrap();
        assert_eq!(spec.retention_policy, RetentionPolicy::Retain);
    }
}

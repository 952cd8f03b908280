use crate::{ChildResource, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A user asking to exercise a SudoPolicy in the request's namespace for a
/// bounded duration. Identity is taken from the admission-stamped
/// `tarbac.io/requester` annotation, never from the spec.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "tarbac.io",
    version = "v1",
    kind = "SudoRequest",
    namespaced,
    status = "RequestStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SudoRequestSpec {
    /// Requested validity window, e.g. `"30m"`. Must be positive and within
    /// the policy's `maxDuration`.
    pub duration: String,
    /// Name of the SudoPolicy to exercise.
    pub policy: String,
}

/// Cluster-scoped request against a ClusterSudoPolicy; may fan out to one
/// grant per allowed namespace.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "tarbac.io",
    version = "v1",
    kind = "ClusterSudoRequest",
    status = "RequestStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSudoRequestSpec {
    pub duration: String,
    pub policy: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestStatus {
    #[serde(default, skip_serializing_if = "RequestState::is_unset")]
    pub state: RequestState,
    /// Stable audit-correlation id; equals the request's original uid.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Time>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Time>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_resource: Vec<ChildResource>,
}

/// The request state machine. `Rejected` and `Expired` are absorbing: once a
/// request reaches either, reconciliation leaves it alone.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum RequestState {
    #[default]
    #[serde(rename = "")]
    Unset,
    Pending,
    Approved,
    Rejected,
    Expired,
    Error,
}

impl RequestState {
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Expired)
    }

    /// Legal transitions; everything else is a reconciler bug.
    pub fn may_transition_to(&self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Unset, Pending)
                | (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, Expired)
                | (Approved, Error)
        )
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unset => "",
            Self::Pending => "Pending",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
            Self::Expired => "Expired",
            Self::Error => "Error",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_absorb() {
        use RequestState::*;
        for terminal in [Rejected, Expired] {
            assert!(terminal.is_terminal());
            for next in [Unset, Pending, Approved, Rejected, Expired, Error] {
                assert!(
                    !terminal.may_transition_to(next),
                    "{terminal} must not transition to {next}"
                );
            }
        }
    }

    #[test]
    fn legal_transitions() {
        use RequestState::*;
        assert!(Unset.may_transition_to(Pending));
        assert!(Pending.may_transition_to(Approved));
        assert!(Pending.may_transition_to(Rejected));
        assert!(Approved.may_transition_to(Expired));
        assert!(Approved.may_transition_to(Error));

        assert!(!Unset.may_transition_to(Approved));
        assert!(!Pending.may_transition_to(Expired));
        assert!(!Approved.may_transition_to(Pending));
    }

    #[test]
    fn unset_state_serializes_to_nothing() {
        let status = RequestStatus::default();
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }
}

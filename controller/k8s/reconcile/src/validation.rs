//! Admission-of-requests logic shared by the two request loops.
//!
//! Everything here is pure: the reconcilers fetch, these functions decide.

use std::collections::BTreeMap;
use tarbac_k8s_api::{
    duration::{self, GoDuration},
    policy::{user_allowed, UserRef},
    request::RequestStatus,
    rbac::BindingStatus,
    REQUESTER_ANNOTATION,
};

/// Why a request moves `Pending -> Rejected`. Declarative conditions: no
/// requeue, the user fixes the spec (or the policy changes) and resubmits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Rejection {
    InvalidDuration(String),
    MissingRequester,
    PolicyNotFound,
    ExceedsMaxDuration { requested: String, max: String },
    UserNotAllowed,
    NoMatchedNamespaces,
}

impl Rejection {
    pub(crate) fn message(&self) -> String {
        match self {
            Self::InvalidDuration(d) => format!("Invalid duration requested: {d}"),
            Self::MissingRequester => "Requester information is missing".to_string(),
            Self::PolicyNotFound => "Referenced policy not found".to_string(),
            Self::ExceedsMaxDuration { requested, max } => {
                format!("Requested duration {requested} exceeds max allowed duration {max}")
            }
            Self::UserNotAllowed => "User not allowed by policy".to_string(),
            Self::NoMatchedNamespaces => "No namespaces matched policy constraints".to_string(),
        }
    }
}

/// Parses the requested duration, insisting on a strictly positive value.
pub(crate) fn requested_duration(spec_duration: &str) -> Result<GoDuration, Rejection> {
    match duration::parse(spec_duration) {
        Ok(d) if d.is_positive() => Ok(d),
        _ => Err(Rejection::InvalidDuration(spec_duration.to_string())),
    }
}

/// The admission-stamped requester identity; a request without it was never
/// mutated and cannot be trusted.
pub(crate) fn requester_of(annotations: &BTreeMap<String, String>) -> Result<&str, Rejection> {
    match annotations.get(REQUESTER_ANNOTATION).map(String::as_str) {
        Some(requester) if !requester.is_empty() => Ok(requester),
        _ => Err(Rejection::MissingRequester),
    }
}

/// Checks the requested duration and requester against the policy. A policy
/// whose own `maxDuration` does not parse is a configuration error, not a
/// rejection; that distinction is surfaced as `Err(Fault::BadPolicy)`.
pub(crate) fn check_policy(
    requested: GoDuration,
    max_duration_spec: &str,
    allowed_users: &[UserRef],
    requester: &str,
) -> Result<(), Fault> {
    let max = duration::parse(max_duration_spec)
        .map_err(|_| Fault::BadPolicy(format!("Invalid maxDuration in policy spec: {max_duration_spec}")))?;
    if requested.get() > max.get() {
        return Err(Fault::Reject(Rejection::ExceedsMaxDuration {
            requested: requested.to_string(),
            max: max.to_string(),
        }));
    }
    if !user_allowed(allowed_users, requester) {
        return Err(Fault::Reject(Rejection::UserNotAllowed));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Fault {
    Reject(Rejection),
    /// The policy itself is broken; the request lands in `Error`, not
    /// `Rejected`.
    BadPolicy(String),
}

/// Copies a child's timestamps up to the parent, first-writer-wins: once the
/// parent has a value it is never overwritten, so fan-out children reporting
/// slightly different times cannot make the parent oscillate.
pub(crate) fn adopt_child_times(status: &mut RequestStatus, child: &BindingStatus) -> bool {
    let mut changed = false;
    if status.created_at.is_none() && child.created_at.is_some() {
        status.created_at = child.created_at.clone();
        changed = true;
    }
    if status.expires_at.is_none() && child.expires_at.is_some() {
        status.expires_at = child.expires_at.clone();
        changed = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarbac_k8s_api::Time;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn duration_must_be_positive_and_parseable() {
        assert!(requested_duration("5m").is_ok());
        assert!(requested_duration("1h30m").is_ok());

        for bad in ["", "0", "-5m", "soon", "5 minutes"] {
            assert_eq!(
                requested_duration(bad),
                Err(Rejection::InvalidDuration(bad.to_string())),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn requester_comes_from_the_annotation() {
        let anns = annotations(&[("tarbac.io/requester", "alice")]);
        assert_eq!(requester_of(&anns), Ok("alice"));

        assert_eq!(
            requester_of(&annotations(&[])),
            Err(Rejection::MissingRequester)
        );
        assert_eq!(
            requester_of(&annotations(&[("tarbac.io/requester", "")])),
            Err(Rejection::MissingRequester)
        );
    }

    #[test]
    fn over_limit_duration_is_rejected() {
        let requested = requested_duration("1h").unwrap();
        let allowed = vec![UserRef::named("alice")];
        let fault = check_policy(requested, "10m", &allowed, "alice").unwrap_err();
        match fault {
            Fault::Reject(rejection) => {
                assert!(rejection.message().contains("exceeds max allowed duration"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn disallowed_user_is_rejected() {
        let requested = requested_duration("5m").unwrap();
        let allowed = vec![UserRef::named("alice")];
        assert_eq!(
            check_policy(requested, "1h", &allowed, "bob"),
            Err(Fault::Reject(Rejection::UserNotAllowed))
        );
        assert_eq!(
            Rejection::UserNotAllowed.message(),
            "User not allowed by policy"
        );
    }

    #[test]
    fn allowed_request_passes() {
        let requested = requested_duration("5m").unwrap();
        let allowed = vec![UserRef::named("alice")];
        assert_eq!(check_policy(requested, "1h", &allowed, "alice"), Ok(()));
    }

    #[test]
    fn broken_policy_is_a_fault_not_a_rejection() {
        let requested = requested_duration("5m").unwrap();
        match check_policy(requested, "whenever", &[], "alice") {
            Err(Fault::BadPolicy(msg)) => assert!(msg.contains("Invalid maxDuration")),
            other => panic!("expected BadPolicy, got {other:?}"),
        }
    }

    #[test]
    fn child_times_are_first_writer_wins() {
        let t0 = Time("2024-05-01T10:00:00Z".parse().unwrap());
        let t1 = Time("2024-05-01T10:05:00Z".parse().unwrap());
        let later = Time("2024-05-01T10:01:00Z".parse().unwrap());

        let mut status = RequestStatus::default();
        let child = BindingStatus {
            created_at: Some(t0.clone()),
            expires_at: Some(t1.clone()),
            ..Default::default()
        };
        assert!(adopt_child_times(&mut status, &child));
        assert_eq!(status.created_at, Some(t0.clone()));
        assert_eq!(status.expires_at, Some(t1.clone()));

        // A second child with different times must not overwrite.
        let other = BindingStatus {
            created_at: Some(later.clone()),
            expires_at: Some(later),
            ..Default::default()
        };
        assert!(!adopt_child_times(&mut status, &other));
        assert_eq!(status.created_at, Some(t0));
        assert_eq!(status.expires_at, Some(t1));
    }
}

//! Deterministic names for grants and native bindings.
//!
//! A name is `{kind}-{subject}-{role}-{uidSuffix}` with per-segment
//! truncation (10/20/20 characters) and the *last* 12 characters of the
//! RequestID as the suffix, which keeps the whole name under the 63-character
//! DNS label limit while separating concurrent grants for the same subject
//! and role under different requests.

use crate::Subject;

const KIND_LEN: usize = 10;
const SUBJECT_LEN: usize = 20;
const ROLE_LEN: usize = 20;
const UID_SUFFIX_LEN: usize = 12;
const MAX_NAME_LEN: usize = 63;

/// Name for a native RoleBinding/ClusterRoleBinding created from a grant.
pub fn binding_name(subject: &Subject, role_name: &str, request_id: &str) -> String {
    compose(&subject.kind, &subject.name, role_name, request_id)
}

/// Name for a TemporaryRBAC/ClusterTemporaryRBAC created from a request; the
/// third segment is the policy that admitted it.
pub fn grant_name(subject: &Subject, policy_name: &str, request_id: &str) -> String {
    compose(&subject.kind, &subject.name, policy_name, request_id)
}

fn compose(kind: &str, subject: &str, role: &str, request_id: &str) -> String {
    let kind = head(&kind.to_lowercase(), KIND_LEN);
    let subject = head(subject, SUBJECT_LEN);
    let mut role = head(role, ROLE_LEN);
    let suffix = tail(request_id, UID_SUFFIX_LEN);

    // The per-segment limits alone can overshoot the DNS label limit once
    // the three separators are counted; overflow comes out of the role
    // segment, never the uid suffix.
    let total = [&kind, &subject, &role, &suffix]
        .iter()
        .map(|s| s.chars().count())
        .sum::<usize>()
        + 3;
    if total > MAX_NAME_LEN {
        let keep = role.chars().count().saturating_sub(total - MAX_NAME_LEN);
        role = head(&role, keep);
    }

    format!("{kind}-{subject}-{role}-{suffix}")
}

fn head(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn tail(s: &str, max: usize) -> String {
    let skip = s.chars().count().saturating_sub(max);
    s.chars().skip(skip).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> Subject {
        Subject::user(name)
    }

    #[test]
    fn name_is_deterministic() {
        let a = binding_name(&user("alice"), "admin", "9f8e7d6c5b4a3f2e1d0c");
        let b = binding_name(&user("alice"), "admin", "9f8e7d6c5b4a3f2e1d0c");
        assert_eq!(a, b);
    }

    #[test]
    fn uses_last_twelve_uid_chars() {
        let name = binding_name(&user("alice"), "admin", "9f8e7d6c5b4a3f2e1d0c");
        assert_eq!(name, "user-alice-admin-5b4a3f2e1d0c");
    }

    #[test]
    fn short_uid_is_kept_whole() {
        let name = binding_name(&user("alice"), "admin", "abc");
        assert_eq!(name, "user-alice-admin-abc");
    }

    #[test]
    fn lowercases_kind() {
        let subject = Subject {
            kind: "ServiceAccount".to_string(),
            name: "deployer".to_string(),
            api_group: None,
            namespace: Some("ci".to_string()),
        };
        let name = binding_name(&subject, "admin", "0123456789abcdef");
        assert!(name.starts_with("serviceacc-deployer-admin-"));
    }

    #[test]
    fn stays_within_dns_label_limit() {
        let role = "an-equally-long-cluster-role-name-for-good-measure";
        let request_id = "0123456789abcdef0123456789abcdef0123456789abcdef";

        let user = Subject::user("a-very-long-user-name-that-keeps-going-and-going");
        let name = binding_name(&user, role, request_id);
        assert!(name.len() <= 63, "{} is {} chars", name, name.len());
        assert!(name.ends_with("456789abcdef"));

        // A maximal kind segment would overshoot without the overflow clamp.
        let sa = Subject {
            kind: "ServiceAccount".to_string(),
            name: "a-service-account-with-a-long-name".to_string(),
            api_group: None,
            namespace: Some("ci".to_string()),
        };
        let name = binding_name(&sa, role, request_id);
        assert!(name.len() <= 63, "{} is {} chars", name, name.len());
        assert!(name.ends_with("456789abcdef"));
    }

    #[test]
    fn distinct_requests_do_not_collide() {
        let a = binding_name(&user("alice"), "admin", "aaaaaaaaaaaa-request-one");
        let b = binding_name(&user("alice"), "admin", "bbbbbbbbbbbb-request-two");
        assert_ne!(a, b);
    }
}

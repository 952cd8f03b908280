//! Wall-clock expiry math shared by the request and grant loops.

use chrono::{DateTime, Utc};
use tarbac_k8s_api::{duration::GoDuration, Time};
use tokio::time::Duration;

/// The shortest interval a near-expiry requeue may use; anything smaller
/// busy-loops at the expiry boundary.
const MIN_REQUEUE: Duration = Duration::from_secs(1);

/// `expiresAt = createdAt + duration`; callers must never record an
/// `expiresAt` without its `createdAt`.
pub(crate) fn expires_from(created_at: &Time, duration: GoDuration) -> Time {
    Time(created_at.0 + duration.as_chrono())
}

pub(crate) fn is_expired(expires_at: &Time, now: DateTime<Utc>) -> bool {
    now >= expires_at.0
}

/// Requeue interval to the expiry instant, truncated to whole seconds and
/// clamped to [`MIN_REQUEUE`]. Returns `None` once the deadline has passed.
pub(crate) fn requeue_until(expires_at: &Time, now: DateTime<Utc>) -> Option<Duration> {
    let wait = expires_at.0 - now;
    if wait <= chrono::Duration::zero() {
        return None;
    }
    let secs = wait.num_seconds().max(0) as u64;
    Some(Duration::from_secs(secs).max(MIN_REQUEUE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarbac_k8s_api::duration;

    fn at(rfc3339: &str) -> Time {
        Time(rfc3339.parse().unwrap())
    }

    #[test]
    fn expiry_tracks_creation_plus_duration() {
        let created = at("2024-05-01T10:00:00Z");
        for (spec, expected) in [
            ("5m", "2024-05-01T10:05:00Z"),
            ("1h", "2024-05-01T11:00:00Z"),
            ("1h30m", "2024-05-01T11:30:00Z"),
            ("90s", "2024-05-01T10:01:30Z"),
        ] {
            let d = duration::parse(spec).unwrap();
            let expires = expires_from(&created, d);
            let drift = (expires.0 - (created.0 + d.as_chrono()))
                .num_milliseconds()
                .abs();
            assert!(drift < 1_000, "{spec}: drift {drift}ms");
            assert_eq!(expires, at(expected), "{spec}");
        }
    }

    #[test]
    fn requeue_truncates_to_seconds() {
        let expires = at("2024-05-01T10:05:30.700Z");
        let now = "2024-05-01T10:00:00Z".parse().unwrap();
        assert_eq!(
            requeue_until(&expires, now),
            Some(Duration::from_secs(330))
        );
    }

    #[test]
    fn requeue_clamps_near_expiry() {
        let expires = at("2024-05-01T10:00:00.400Z");
        let now = "2024-05-01T10:00:00Z".parse().unwrap();
        assert_eq!(requeue_until(&expires, now), Some(Duration::from_secs(1)));
    }

    #[test]
    fn requeue_stops_at_the_deadline() {
        let expires = at("2024-05-01T10:00:00Z");
        assert_eq!(requeue_until(&expires, "2024-05-01T10:00:00Z".parse().unwrap()), None);
        assert_eq!(requeue_until(&expires, "2024-05-01T10:00:01Z".parse().unwrap()), None);
        assert!(is_expired(&expires, "2024-05-01T10:00:00Z".parse().unwrap()));
        assert!(!is_expired(&expires, "2024-05-01T09:59:59Z".parse().unwrap()));
    }
}

//! Event plumbing shared by the control loops.
//!
//! Every state transition publishes a platform event on the originating
//! resource. Reasons form a closed set and messages carry the RequestID
//! suffix so operators can correlate a request with its descendants.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reason {
    Submitted,
    Approved,
    Rejected,
    Expired,
    PermissionsGranted,
    PermissionsRevoked,
    MissingChildResource,
    Error,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "Submitted",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
            Self::Expired => "Expired",
            Self::PermissionsGranted => "PermissionsGranted",
            Self::PermissionsRevoked => "PermissionsRevoked",
            Self::MissingChildResource => "MissingChildResource",
            Self::Error => "Error",
        }
    }

    fn action(&self) -> &'static str {
        match self {
            Self::Submitted => "Submitting",
            Self::Approved => "Approving",
            Self::Rejected => "Rejecting",
            Self::Expired => "Expiring",
            Self::PermissionsGranted => "Granting",
            Self::PermissionsRevoked => "Revoking",
            Self::MissingChildResource => "Aggregating",
            Self::Error => "Reconciling",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Appends the audit-correlation suffix every event message carries.
pub fn with_request_id(message: impl std::fmt::Display, request_id: &str) -> String {
    format!("{message} [RequestID: {request_id}]")
}

#[derive(Clone)]
pub(crate) struct Events {
    client: Client,
    controller: &'static str,
}

impl Events {
    pub(crate) fn new(client: Client, controller: &'static str) -> Self {
        Self { client, controller }
    }

    /// Publishes an event; failures are logged and swallowed since events are
    /// best-effort observability, never control flow.
    pub(crate) async fn publish(
        &self,
        reference: ObjectReference,
        type_: EventType,
        reason: Reason,
        note: String,
    ) {
        let recorder = Recorder::new(
            self.client.clone(),
            Reporter {
                controller: self.controller.to_string(),
                instance: None,
            },
        );
        if let Err(error) = recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.as_str().to_string(),
                    note: Some(note),
                    action: reason.action().to_string(),
                    secondary: None,
                },
                &reference,
            )
            .await
        {
            tracing::warn!(%error, reason = %reason, "failed to publish event");
        }
    }
}

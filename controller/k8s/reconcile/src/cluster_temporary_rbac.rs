//! Materializes a ClusterTemporaryRBAC into native ClusterRoleBindings and
//! revokes them when the grant's duration elapses.

use crate::{
    error_policy,
    events::{self, Events, Reason},
    expiry, ignore_already_exists, ignore_not_found, patch_label, patch_status,
    temporary_rbac::resolve_request_id,
    Ctx, Error,
};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    api::{DeleteParams, PostParams},
    runtime::{
        controller::{Action, Controller},
        events::EventType,
        watcher,
    },
    Api, Client, Resource, ResourceExt,
};
use std::sync::Arc;
use tarbac_k8s_api::{
    naming,
    rbac::{BindingState, BindingStatus, ClusterTemporaryRBAC, RetentionPolicy},
    ChildResource, ClusterRoleBinding, ObjectMeta, Subject, Time, OWNED_BY_LABEL,
    REQUEST_ID_LABEL,
};
use tokio::time::Duration;

const CONTROLLER: &str = "clustertemporaryrbac-controller";

const RBAC_API_VERSION: &str = "rbac.authorization.k8s.io/v1";

const CLEANUP_RETRY: Duration = Duration::from_secs(5);

pub async fn run(client: Client) {
    let grants = Api::<ClusterTemporaryRBAC>::all(client.clone());
    Controller::new(grants, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(Ctx { client }))
        .for_each(|res| async move {
            match res {
                Ok(obj) => tracing::debug!(?obj, "reconciled"),
                Err(error) => tracing::warn!(%error, "reconcile failed"),
            }
        })
        .await;
}

async fn reconcile(grant: Arc<ClusterTemporaryRBAC>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let now = Utc::now();
    let name = grant.name_any();
    let api = Api::<ClusterTemporaryRBAC>::all(ctx.client.clone());
    let events = Events::new(ctx.client.clone(), CONTROLLER);

    let mut status = grant.status.clone().unwrap_or_default();

    if status.request_id.is_empty() {
        status.request_id = resolve_request_id(&ctx.client, grant.as_ref(), None).await;
        patch_status(&api, &name, &status).await?;
        patch_label(&api, &name, REQUEST_ID_LABEL, &status.request_id).await?;
    }
    let request_id = status.request_id.clone();
    tracing::debug!(%name, request_id = %request_id, "reconciling ClusterTemporaryRBAC");

    let duration = match tarbac_k8s_api::duration::parse(&grant.spec.duration) {
        Ok(duration) if duration.is_positive() => duration,
        _ => {
            return fail(
                &api,
                &events,
                grant.object_ref(&()),
                &name,
                &mut status,
                format!(
                    "Invalid duration in ClusterTemporaryRBAC spec: {}",
                    grant.spec.duration
                ),
                &request_id,
            )
            .await;
        }
    };

    if status.created_at.is_none() {
        if grant.spec.subjects.is_empty() {
            return fail(
                &api,
                &events,
                grant.object_ref(&()),
                &name,
                &mut status,
                "No subjects specified in ClusterTemporaryRBAC".to_string(),
                &request_id,
            )
            .await;
        }
        // A cluster-wide grant can only bind a ClusterRole.
        if grant.spec.role_ref.kind != "ClusterRole" {
            return fail(
                &api,
                &events,
                grant.object_ref(&()),
                &name,
                &mut status,
                format!("unsupported roleRef.kind: {}", grant.spec.role_ref.kind),
                &request_id,
            )
            .await;
        }

        let bindings = Api::<ClusterRoleBinding>::all(ctx.client.clone());
        let mut children = Vec::new();
        for subject in &grant.spec.subjects {
            let binding = cluster_role_binding_for(grant.as_ref(), subject, &request_id, &name);
            let binding_name = binding.name_any();
            bindings
                .create(&PostParams::default(), &binding)
                .await
                .map(|_| ())
                .or_else(ignore_already_exists)?;
            children.push(ChildResource {
                api_version: RBAC_API_VERSION.to_string(),
                kind: "ClusterRoleBinding".to_string(),
                name: binding_name,
                namespace: None,
            });
        }

        let created_at = Time(now);
        status.expires_at = Some(expiry::expires_from(&created_at, duration));
        status.created_at = Some(created_at);
        status.state = BindingState::Created;
        status.child_resource = children;
        patch_status(&api, &name, &status).await?;
        events
            .publish(
                grant.object_ref(&()),
                EventType::Normal,
                Reason::PermissionsGranted,
                events::with_request_id(
                    format!(
                        "Granted '{}' cluster-wide to {} subject(s)",
                        grant.spec.role_ref.name,
                        grant.spec.subjects.len()
                    ),
                    &request_id,
                ),
            )
            .await;
        tracing::info!(%name, request_id = %request_id, "cluster bindings created");
    }

    if status.expires_at.is_none() {
        let created_at = status
            .created_at
            .clone()
            .ok_or(Error::MissingObjectKey(".status.createdAt"))?;
        status.expires_at = Some(expiry::expires_from(&created_at, duration));
        patch_status(&api, &name, &status).await?;
    }
    let expires_at = status
        .expires_at
        .clone()
        .ok_or(Error::MissingObjectKey(".status.expiresAt"))?;

    if expiry::is_expired(&expires_at, now) {
        tracing::info!(%name, request_id = %request_id, "ClusterTemporaryRBAC expired, revoking bindings");
        let bindings = Api::<ClusterRoleBinding>::all(ctx.client.clone());
        let mut remaining = Vec::new();
        for child in &status.child_resource {
            if child.kind != "ClusterRoleBinding" {
                tracing::warn!(%name, kind = %child.kind, "unsupported child resource kind");
                remaining.push(child.clone());
                continue;
            }
            match bindings
                .delete(&child.name, &DeleteParams::default())
                .await
                .map(|_| ())
                .or_else(ignore_not_found)
            {
                Ok(()) => tracing::debug!(binding = %child.name, "deleted ClusterRoleBinding"),
                Err(error) => {
                    tracing::warn!(%error, binding = %child.name, "failed to delete ClusterRoleBinding");
                    remaining.push(child.clone());
                }
            }
        }

        if !remaining.is_empty() {
            status.child_resource = remaining;
            patch_status(&api, &name, &status).await?;
            return Ok(Action::requeue(CLEANUP_RETRY));
        }

        status.child_resource.clear();
        status.state = BindingState::Expired;
        patch_status(&api, &name, &status).await?;
        events
            .publish(
                grant.object_ref(&()),
                EventType::Normal,
                Reason::PermissionsRevoked,
                events::with_request_id(
                    format!("Revoked cluster-wide '{}'", grant.spec.role_ref.name),
                    &request_id,
                ),
            )
            .await;

        if grant.spec.retention_policy == RetentionPolicy::Delete {
            api.delete(&name, &DeleteParams::default())
                .await
                .map(|_| ())
                .or_else(ignore_not_found)?;
        }
        return Ok(Action::await_change());
    }

    let wait = expiry::requeue_until(&expires_at, now).unwrap_or(Duration::from_secs(1));
    tracing::debug!(%name, request_id = %request_id, ?wait, "ClusterTemporaryRBAC still valid");
    Ok(Action::requeue(wait))
}

fn cluster_role_binding_for(
    grant: &ClusterTemporaryRBAC,
    subject: &Subject,
    request_id: &str,
    grant_name: &str,
) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(naming::binding_name(subject, &grant.spec.role_ref.name, request_id)),
            labels: Some(
                [
                    (REQUEST_ID_LABEL.to_string(), request_id.to_string()),
                    (OWNED_BY_LABEL.to_string(), grant_name.to_string()),
                ]
                .into_iter()
                .collect(),
            ),
            owner_references: grant.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        subjects: Some(vec![subject.clone().into()]),
        role_ref: grant.spec.role_ref.clone().into(),
    }
}

async fn fail(
    api: &Api<ClusterTemporaryRBAC>,
    events: &Events,
    reference: ObjectReference,
    name: &str,
    status: &mut BindingStatus,
    message: String,
    request_id: &str,
) -> Result<Action, Error> {
    tracing::warn!(%name, request_id = %request_id, %message, "ClusterTemporaryRBAC error");
    status.state = BindingState::Error;
    patch_status(api, name, status).await?;
    events
        .publish(
            reference,
            EventType::Warning,
            Reason::Error,
            events::with_request_id(message, request_id),
        )
        .await;
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarbac_k8s_api::{rbac::ClusterTemporaryRBACSpec, RoleRef};

    #[test]
    fn cluster_binding_shape() {
        let mut grant = ClusterTemporaryRBAC::new(
            "user-alice-p1-b0a090807060",
            ClusterTemporaryRBACSpec {
                subjects: vec![Subject::user("alice")],
                role_ref: RoleRef {
                    api_group: "rbac.authorization.k8s.io".to_string(),
                    kind: "ClusterRole".to_string(),
                    name: "admin".to_string(),
                },
                duration: "5m".to_string(),
                retention_policy: Default::default(),
            },
        );
        grant.metadata.uid = Some("11112222-3333-4444-5555-666677778888".to_string());

        let binding = cluster_role_binding_for(&grant, &grant.spec.subjects[0], "req-id-0001", &grant.name_any());
        assert_eq!(binding.name_any(), "user-alice-admin-req-id-0001");
        assert!(binding.namespace().is_none());
        assert_eq!(
            binding.labels().get(REQUEST_ID_LABEL).map(String::as_str),
            Some("req-id-0001")
        );

        let owners = binding.owner_references();
        assert_eq!(owners[0].kind, "ClusterTemporaryRBAC");
        assert_eq!(owners[0].controller, Some(true));
        assert_eq!(owners[0].block_owner_deletion, Some(true));
    }
}

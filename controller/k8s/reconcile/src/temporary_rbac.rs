//! Materializes a TemporaryRBAC into native RoleBindings and revokes them
//! when the grant's duration elapses.

use crate::{
    error_policy,
    events::{self, Events, Reason},
    expiry, ignore_already_exists, ignore_not_found, patch_label, patch_status, Ctx, Error,
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
    rbac::{BindingState, BindingStatus, RetentionPolicy, TemporaryRBAC},
    request::{ClusterSudoRequest, SudoRequest},
    ChildResource, ObjectMeta, RoleBinding, Subject, Time, OWNED_BY_LABEL, REQUEST_ID_LABEL,
};
use tokio::time::Duration;

const CONTROLLER: &str = "temporaryrbac-controller";

const RBAC_API_VERSION: &str = "rbac.authorization.k8s.io/v1";

/// Retry interval when a native binding resists deletion at expiry.
const CLEANUP_RETRY: Duration = Duration::from_secs(5);

pub async fn run(client: Client) {
    let grants = Api::<TemporaryRBAC>::all(client.clone());
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

async fn reconcile(grant: Arc<TemporaryRBAC>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let now = Utc::now();
    let name = grant.name_any();
    let namespace = grant
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let api = Api::<TemporaryRBAC>::namespaced(ctx.client.clone(), &namespace);
    let events = Events::new(ctx.client.clone(), CONTROLLER);

    let mut status = grant.status.clone().unwrap_or_default();

    // The RequestID must be in hand before anything is named after it.
    if status.request_id.is_empty() {
        status.request_id = resolve_request_id(&ctx.client, grant.as_ref(), Some(&namespace)).await;
        patch_status(&api, &name, &status).await?;
        patch_label(&api, &name, REQUEST_ID_LABEL, &status.request_id).await?;
    }
    let request_id = status.request_id.clone();
    tracing::debug!(%namespace, %name, request_id = %request_id, "reconciling TemporaryRBAC");

    let duration = match tarbac_k8s_api::duration::parse(&grant.spec.duration) {
        Ok(duration) if duration.is_positive() => duration,
        _ => {
            return fail(
                &api,
                &events,
                grant.object_ref(&()),
                &name,
                &mut status,
                format!("Invalid duration in TemporaryRBAC spec: {}", grant.spec.duration),
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
                "No subjects specified in TemporaryRBAC".to_string(),
                &request_id,
            )
            .await;
        }
        if !matches!(grant.spec.role_ref.kind.as_str(), "Role" | "ClusterRole") {
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

        let _owner_ref = grant
            .controller_owner_ref(&())
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;
        let bindings = Api::<RoleBinding>::namespaced(ctx.client.clone(), &namespace);
        let mut children = Vec::new();
        for subject in &grant.spec.subjects {
            let binding = role_binding_for(grant.as_ref(), subject, &namespace, &request_id, &name);
            let binding_name = binding.name_any();
            bindings
                .create(&PostParams::default(), &binding)
                .await
                .map(|_| ())
                .or_else(ignore_already_exists)?;
            children.push(ChildResource {
                api_version: RBAC_API_VERSION.to_string(),
                kind: "RoleBinding".to_string(),
                name: binding_name,
                namespace: Some(namespace.clone()),
            });
        }

        // createdAt and expiresAt are recorded together so expiry never
        // outruns creation.
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
                        "Granted '{}' to {} subject(s) in {namespace}",
                        grant.spec.role_ref.name,
                        grant.spec.subjects.len()
                    ),
                    &request_id,
                ),
            )
            .await;
        tracing::info!(%namespace, %name, request_id = %request_id, "bindings created");
    }

    // Resume path: a prior pass recorded createdAt but lost the expiry write.
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
        tracing::info!(%namespace, %name, request_id = %request_id, "TemporaryRBAC expired, revoking bindings");
        let bindings = Api::<RoleBinding>::namespaced(ctx.client.clone(), &namespace);
        let mut remaining = Vec::new();
        for child in &status.child_resource {
            if child.kind != "RoleBinding" {
                tracing::warn!(%namespace, %name, kind = %child.kind, "unsupported child resource kind");
                remaining.push(child.clone());
                continue;
            }
            match bindings
                .delete(&child.name, &DeleteParams::default())
                .await
                .map(|_| ())
                .or_else(ignore_not_found)
            {
                Ok(()) => tracing::debug!(%namespace, binding = %child.name, "deleted RoleBinding"),
                Err(error) => {
                    tracing::warn!(%error, %namespace, binding = %child.name, "failed to delete RoleBinding");
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
                    format!("Revoked '{}' in {namespace}", grant.spec.role_ref.name),
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
    tracing::debug!(%namespace, %name, request_id = %request_id, ?wait, "TemporaryRBAC still valid");
    Ok(Action::requeue(wait))
}

fn role_binding_for(
    grant: &TemporaryRBAC,
    subject: &Subject,
    namespace: &str,
    request_id: &str,
    grant_name: &str,
) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(naming::binding_name(subject, &grant.spec.role_ref.name, request_id)),
            namespace: Some(namespace.to_string()),
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

/// Copies the owning request's RequestID; a grant created out of band gets
/// its own uid as identity.
pub(crate) async fn resolve_request_id<K>(
    client: &Client,
    grant: &K,
    namespace: Option<&str>,
) -> String
where
    K: Resource<DynamicType = ()>,
{
    for owner in grant.owner_references() {
        let id = match owner.kind.as_str() {
            "SudoRequest" => {
                let Some(namespace) = namespace else { continue };
                Api::<SudoRequest>::namespaced(client.clone(), namespace)
                    .get(&owner.name)
                    .await
                    .ok()
                    .and_then(|request| request.status)
                    .map(|status| status.request_id)
                    .unwrap_or_default()
            }
            "ClusterSudoRequest" => Api::<ClusterSudoRequest>::all(client.clone())
                .get(&owner.name)
                .await
                .ok()
                .and_then(|request| request.status)
                .map(|status| status.request_id)
                .unwrap_or_default(),
            _ => continue,
        };
        if !id.is_empty() {
            return id;
        }
    }
    grant.uid().unwrap_or_default()
}

async fn fail(
    api: &Api<TemporaryRBAC>,
    events: &Events,
    reference: ObjectReference,
    name: &str,
    status: &mut BindingStatus,
    message: String,
    request_id: &str,
) -> Result<Action, Error> {
    tracing::warn!(%name, request_id = %request_id, %message, "TemporaryRBAC error");
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
    use tarbac_k8s_api::{rbac::TemporaryRBACSpec, RoleRef};

    fn grant(role_kind: &str) -> TemporaryRBAC {
        let mut grant = TemporaryRBAC::new(
            "user-alice-p1-b0a090807060",
            TemporaryRBACSpec {
                subjects: vec![Subject::user("alice")],
                role_ref: RoleRef {
                    api_group: "rbac.authorization.k8s.io".to_string(),
                    kind: role_kind.to_string(),
                    name: "admin".to_string(),
                },
                duration: "5m".to_string(),
                retention_policy: Default::default(),
            },
        );
        grant.metadata.namespace = Some("ns1".to_string());
        grant.metadata.uid = Some("11112222-3333-4444-5555-666677778888".to_string());
        grant
    }

    #[test]
    fn binding_carries_ownership_and_labels() {
        let grant = grant("Role");
        let request_id = "9f8e7d6c-5b4a-3f2e-1d0c-b0a090807060";
        let binding = role_binding_for(&grant, &grant.spec.subjects[0], "ns1", request_id, "user-alice-p1-b0a090807060");

        assert_eq!(binding.name_any(), "user-alice-admin-b0a090807060");
        assert_eq!(binding.namespace().as_deref(), Some("ns1"));
        assert_eq!(
            binding.labels().get(REQUEST_ID_LABEL).map(String::as_str),
            Some(request_id)
        );
        assert_eq!(
            binding.labels().get(OWNED_BY_LABEL).map(String::as_str),
            Some("user-alice-p1-b0a090807060")
        );

        let owners = binding.owner_references();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "TemporaryRBAC");
        assert_eq!(owners[0].controller, Some(true));
        assert_eq!(owners[0].block_owner_deletion, Some(true));
    }

    #[test]
    fn cluster_role_still_produces_a_namespaced_binding() {
        // A namespaced grant of a cluster-defined role binds it within the
        // grant's namespace only.
        let grant = grant("ClusterRole");
        let binding = role_binding_for(&grant, &grant.spec.subjects[0], "ns1", "req-1", "g1");
        assert_eq!(binding.namespace().as_deref(), Some("ns1"));
        assert_eq!(binding.role_ref.kind, "ClusterRole");
        assert_eq!(binding.role_ref.name, "admin");
        assert_eq!(
            binding.subjects.as_deref().map(|s| s.len()),
            Some(1)
        );
    }
}

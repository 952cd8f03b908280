//! The SudoRequest state machine: validate against the referenced policy,
//! materialize a TemporaryRBAC child, then track it until expiry.

use crate::{
    error_policy,
    events::{self, Events, Reason},
    expiry, ignore_already_exists, is_not_found, patch_label, patch_status,
    validation::{self, Fault},
    Ctx, Error,
};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    api::PostParams,
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
    policy::SudoPolicy,
    rbac::{BindingState, TemporaryRBAC, TemporaryRBACSpec},
    request::{RequestState, RequestStatus, SudoRequest},
    ChildResource, ObjectMeta, Subject, API_VERSION, REQUESTER_ANNOTATION, REQUEST_ID_LABEL,
};
use tokio::time::Duration;

const CONTROLLER: &str = "sudorequest-controller";

/// Interval for polling children while the expiry instant is still unknown.
const AGGREGATION_INTERVAL: Duration = Duration::from_secs(10);

pub async fn run(client: Client) {
    let requests = Api::<SudoRequest>::all(client.clone());
    Controller::new(requests, watcher::Config::default())
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

async fn reconcile(request: Arc<SudoRequest>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let name = request.name_any();
    let namespace = request
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let api = Api::<SudoRequest>::namespaced(ctx.client.clone(), &namespace);
    let events = Events::new(ctx.client.clone(), CONTROLLER);

    let mut status = request.status.clone().unwrap_or_default();
    let request_id = if status.request_id.is_empty() {
        request.uid().unwrap_or_default()
    } else {
        status.request_id.clone()
    };
    tracing::debug!(%namespace, %name, request_id = %request_id, "reconciling SudoRequest");

    if status.state.is_terminal() {
        tracing::debug!(%namespace, %name, request_id = %request_id, state = %status.state, "request already processed");
        return Ok(Action::await_change());
    }

    let requester = request
        .annotations()
        .get(REQUESTER_ANNOTATION)
        .cloned()
        .unwrap_or_default();

    if status.state == RequestState::Unset {
        events
            .publish(
                request.object_ref(&()),
                EventType::Normal,
                Reason::Submitted,
                events::with_request_id(
                    format!(
                        "User {requester} submitted a SudoRequest for policy {} for a duration of {}",
                        request.spec.policy, request.spec.duration
                    ),
                    &request_id,
                ),
            )
            .await;
        status.state = RequestState::Pending;
        status.request_id = request_id.clone();
        patch_status(&api, &name, &status).await?;
        // The request-id label lives on metadata, so it is a second write.
        patch_label(&api, &name, REQUEST_ID_LABEL, &request_id).await?;
    }

    if status.state == RequestState::Pending {
        let duration = match validation::requested_duration(&request.spec.duration) {
            Ok(duration) => duration,
            Err(rejection) => {
                return reject(
                    &api,
                    &events,
                    request.object_ref(&()),
                    &name,
                    &mut status,
                    rejection.message(),
                    &request_id,
                )
                .await;
            }
        };

        let requester = match validation::requester_of(request.annotations()) {
            Ok(requester) => requester.to_string(),
            Err(rejection) => {
                return reject(
                    &api,
                    &events,
                    request.object_ref(&()),
                    &name,
                    &mut status,
                    rejection.message(),
                    &request_id,
                )
                .await;
            }
        };

        let policies = Api::<SudoPolicy>::namespaced(ctx.client.clone(), &namespace);
        let policy = match policies.get(&request.spec.policy).await {
            Ok(policy) => policy,
            Err(err) if is_not_found(&err) => {
                return reject(
                    &api,
                    &events,
                    request.object_ref(&()),
                    &name,
                    &mut status,
                    validation::Rejection::PolicyNotFound.message(),
                    &request_id,
                )
                .await;
            }
            Err(err) => return Err(err.into()),
        };

        match validation::check_policy(
            duration,
            &policy.spec.max_duration,
            &policy.spec.allowed_users,
            &requester,
        ) {
            Ok(()) => {}
            Err(Fault::Reject(rejection)) => {
                return reject(
                    &api,
                    &events,
                    request.object_ref(&()),
                    &name,
                    &mut status,
                    rejection.message(),
                    &request_id,
                )
                .await;
            }
            Err(Fault::BadPolicy(message)) => {
                return fail(
                    &api,
                    &events,
                    request.object_ref(&()),
                    &name,
                    &mut status,
                    message,
                    &request_id,
                )
                .await;
            }
        }

        // Approved: materialize the grant as an owned child.
        let grant = grant_for(request.as_ref(), &policy, &requester, &request_id, &namespace)?;
        let grant_name = grant.name_any();
        let grants = Api::<TemporaryRBAC>::namespaced(ctx.client.clone(), &namespace);
        grants
            .create(&PostParams::default(), &grant)
            .await
            .map(|_| ())
            .or_else(ignore_already_exists)?;
        tracing::info!(%namespace, %name, request_id = %request_id, grant = %grant_name, "created TemporaryRBAC");

        status.state = RequestState::Approved;
        status.child_resource = vec![ChildResource {
            api_version: API_VERSION.to_string(),
            kind: "TemporaryRBAC".to_string(),
            name: grant_name,
            namespace: Some(namespace.clone()),
        }];
        patch_status(&api, &name, &status).await?;
        events
            .publish(
                request.object_ref(&()),
                EventType::Normal,
                Reason::Approved,
                events::with_request_id(
                    format!(
                        "User '{requester}' was approved by '{}' SudoPolicy",
                        request.spec.policy
                    ),
                    &request_id,
                ),
            )
            .await;
        return Ok(Action::requeue(AGGREGATION_INTERVAL));
    }

    if status.state == RequestState::Approved {
        let grants = Api::<TemporaryRBAC>::namespaced(ctx.client.clone(), &namespace);
        for child in status.child_resource.clone() {
            if child.kind != "TemporaryRBAC" || child.name.is_empty() {
                tracing::warn!(%namespace, %name, request_id = %request_id, ?child, "child resource has incomplete data");
                continue;
            }
            match grants.get(&child.name).await {
                Ok(grant) => {
                    let child_status = grant.status.clone().unwrap_or_default();
                    validation::adopt_child_times(&mut status, &child_status);
                    match child_status.state {
                        BindingState::Expired => {
                            return expire(
                                &api,
                                &events,
                                request.object_ref(&()),
                                &name,
                                &mut status,
                                &requester,
                                &request.spec.policy,
                                &request_id,
                            )
                            .await;
                        }
                        BindingState::Error => {
                            return fail(
                                &api,
                                &events,
                                request.object_ref(&()),
                                &name,
                                &mut status,
                                format!(
                                    "Error detected while processing SudoRequest for User '{requester}' and policy '{}'",
                                    request.spec.policy
                                ),
                                &request_id,
                            )
                            .await;
                        }
                        _ => {}
                    }
                }
                Err(err) if is_not_found(&err) => {
                    tracing::warn!(%namespace, %name, request_id = %request_id, child = %child.name, "child TemporaryRBAC not found");
                    events
                        .publish(
                            request.object_ref(&()),
                            EventType::Warning,
                            Reason::MissingChildResource,
                            events::with_request_id(
                                format!(
                                    "Child resource {}/{} not found",
                                    child.namespace.as_deref().unwrap_or_default(),
                                    child.name
                                ),
                                &request_id,
                            ),
                        )
                        .await;
                }
                Err(err) => return Err(err.into()),
            }
        }
        patch_status(&api, &name, &status).await?;

        if let Some(expires_at) = status.expires_at.clone() {
            return match expiry::requeue_until(&expires_at, Utc::now()) {
                Some(wait) => Ok(Action::requeue(wait)),
                None => {
                    expire(
                        &api,
                        &events,
                        request.object_ref(&()),
                        &name,
                        &mut status,
                        &requester,
                        &request.spec.policy,
                        &request_id,
                    )
                    .await
                }
            };
        }
        return Ok(Action::requeue(AGGREGATION_INTERVAL));
    }

    Ok(Action::await_change())
}

fn grant_for(
    request: &SudoRequest,
    policy: &SudoPolicy,
    requester: &str,
    request_id: &str,
    namespace: &str,
) -> Result<TemporaryRBAC, Error> {
    let owner_ref = request
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let subject = Subject::user(requester);
    Ok(TemporaryRBAC {
        metadata: ObjectMeta {
            name: Some(naming::grant_name(&subject, &request.spec.policy, request_id)),
            namespace: Some(namespace.to_string()),
            labels: Some(
                [(REQUEST_ID_LABEL.to_string(), request_id.to_string())]
                    .into_iter()
                    .collect(),
            ),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: TemporaryRBACSpec {
            subjects: vec![subject],
            role_ref: policy.spec.role_ref.clone(),
            duration: request.spec.duration.clone(),
            retention_policy: Default::default(),
        },
        status: None,
    })
}

async fn reject(
    api: &Api<SudoRequest>,
    events: &Events,
    reference: ObjectReference,
    name: &str,
    status: &mut RequestStatus,
    message: String,
    request_id: &str,
) -> Result<Action, Error> {
    tracing::info!(%name, request_id = %request_id, %message, "rejecting SudoRequest");
    status.state = RequestState::Rejected;
    status.error_message = message.clone();
    patch_status(api, name, status).await?;
    events
        .publish(
            reference,
            EventType::Warning,
            Reason::Rejected,
            events::with_request_id(message, request_id),
        )
        .await;
    Ok(Action::await_change())
}

async fn fail(
    api: &Api<SudoRequest>,
    events: &Events,
    reference: ObjectReference,
    name: &str,
    status: &mut RequestStatus,
    message: String,
    request_id: &str,
) -> Result<Action, Error> {
    tracing::warn!(%name, request_id = %request_id, %message, "SudoRequest error");
    status.state = RequestState::Error;
    status.error_message = message.clone();
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

#[allow(clippy::too_many_arguments)]
async fn expire(
    api: &Api<SudoRequest>,
    events: &Events,
    reference: ObjectReference,
    name: &str,
    status: &mut RequestStatus,
    requester: &str,
    policy: &str,
    request_id: &str,
) -> Result<Action, Error> {
    status.state = RequestState::Expired;
    patch_status(api, name, status).await?;
    events
        .publish(
            reference,
            EventType::Warning,
            Reason::Expired,
            events::with_request_id(
                format!(
                    "SudoRequest Expired for User {requester}, revoked permissions for policy {policy}"
                ),
                request_id,
            ),
        )
        .await;
    tracing::info!(%name, request_id = %request_id, "SudoRequest has expired");
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarbac_k8s_api::{policy::{SudoPolicySpec, UserRef}, rbac::RetentionPolicy, request::SudoRequestSpec, RoleRef};

    fn request() -> SudoRequest {
        let mut request = SudoRequest::new(
            "r1",
            SudoRequestSpec {
                duration: "5m".to_string(),
                policy: "p1".to_string(),
            },
        );
        request.metadata.namespace = Some("ns1".to_string());
        request.metadata.uid = Some("9f8e7d6c-5b4a-3f2e-1d0c-b0a090807060".to_string());
        request
    }

    fn policy() -> SudoPolicy {
        SudoPolicy::new(
            "p1",
            SudoPolicySpec {
                max_duration: "1h".to_string(),
                role_ref: RoleRef {
                    api_group: "rbac.authorization.k8s.io".to_string(),
                    kind: "Role".to_string(),
                    name: "admin".to_string(),
                },
                allowed_users: vec![UserRef::named("alice")],
            },
        )
    }

    #[test]
    fn grant_carries_ownership_and_audit_labels() {
        let request = request();
        let request_id = request.uid().unwrap();
        let grant = grant_for(&request, &policy(), "alice", &request_id, "ns1").unwrap();

        assert_eq!(grant.namespace().as_deref(), Some("ns1"));
        assert_eq!(
            grant.labels().get(REQUEST_ID_LABEL).map(String::as_str),
            Some(request_id.as_str())
        );

        let owners = grant.owner_references();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "SudoRequest");
        assert_eq!(owners[0].name, "r1");
        assert_eq!(owners[0].controller, Some(true));
        assert_eq!(owners[0].block_owner_deletion, Some(true));
    }

    #[test]
    fn grant_spec_mirrors_request_and_policy() {
        let request = request();
        let request_id = request.uid().unwrap();
        let grant = grant_for(&request, &policy(), "alice", &request_id, "ns1").unwrap();

        assert_eq!(grant.spec.duration, "5m");
        assert_eq!(grant.spec.role_ref.name, "admin");
        assert_eq!(grant.spec.retention_policy, RetentionPolicy::Retain);
        assert_eq!(grant.spec.subjects.len(), 1);
        assert_eq!(grant.spec.subjects[0].kind, "User");
        assert_eq!(grant.spec.subjects[0].name, "alice");
    }

    #[test]
    fn grant_name_is_stable_per_request() {
        let request = request();
        let request_id = request.uid().unwrap();
        let a = grant_for(&request, &policy(), "alice", &request_id, "ns1").unwrap();
        let b = grant_for(&request, &policy(), "alice", &request_id, "ns1").unwrap();
        assert_eq!(a.name_any(), b.name_any());
        assert!(a.name_any().starts_with("user-alice-p1-"));
        assert!(a.name_any().ends_with("b0a090807060"));
    }
}

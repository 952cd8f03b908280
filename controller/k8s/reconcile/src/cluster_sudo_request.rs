//! The ClusterSudoRequest state machine: like SudoRequest, but resolves the
//! policy's namespace constraint and fans out one grant per namespace, or a
//! single cluster-wide grant for the `["*"]` sentinel.

use crate::{
    cluster_sudo_policy::{namespace_mode, select_namespaces, NamespaceMode},
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
    policy::ClusterSudoPolicy,
    rbac::{
        BindingState, BindingStatus, ClusterTemporaryRBAC, ClusterTemporaryRBACSpec, TemporaryRBAC,
        TemporaryRBACSpec,
    },
    request::{ClusterSudoRequest, RequestState, RequestStatus},
    ChildResource, ObjectMeta, Subject, ALL_NAMESPACES, API_VERSION, REQUESTER_ANNOTATION,
    REQUEST_ID_LABEL,
};
use tokio::time::Duration;

const CONTROLLER: &str = "clustersudorequest-controller";

const AGGREGATION_INTERVAL: Duration = Duration::from_secs(10);

pub async fn run(client: Client) {
    let requests = Api::<ClusterSudoRequest>::all(client.clone());
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

async fn reconcile(request: Arc<ClusterSudoRequest>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let name = request.name_any();
    let api = Api::<ClusterSudoRequest>::all(ctx.client.clone());
    let events = Events::new(ctx.client.clone(), CONTROLLER);

    let mut status = request.status.clone().unwrap_or_default();
    let request_id = if status.request_id.is_empty() {
        request.uid().unwrap_or_default()
    } else {
        status.request_id.clone()
    };
    tracing::debug!(%name, request_id = %request_id, "reconciling ClusterSudoRequest");

    if status.state.is_terminal() {
        tracing::debug!(%name, request_id = %request_id, state = %status.state, "request already processed");
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
                        "User {requester} submitted a ClusterSudoRequest for policy {} for a duration of {}",
                        request.spec.policy, request.spec.duration
                    ),
                    &request_id,
                ),
            )
            .await;
        status.state = RequestState::Pending;
        status.request_id = request_id.clone();
        patch_status(&api, &name, &status).await?;
        patch_label(&api, &name, REQUEST_ID_LABEL, &request_id).await?;
    }

    if status.state == RequestState::Pending {
        let duration = match validation::requested_duration(&request.spec.duration) {
            Ok(duration) => duration,
            Err(rejection) => {
                return reject(&api, &events, request.object_ref(&()), &name, &mut status, rejection.message(), &request_id).await;
            }
        };

        let requester = match validation::requester_of(request.annotations()) {
            Ok(requester) => requester.to_string(),
            Err(rejection) => {
                return reject(&api, &events, request.object_ref(&()), &name, &mut status, rejection.message(), &request_id).await;
            }
        };

        let policies = Api::<ClusterSudoPolicy>::all(ctx.client.clone());
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
                return reject(&api, &events, request.object_ref(&()), &name, &mut status, rejection.message(), &request_id).await;
            }
            Err(Fault::BadPolicy(message)) => {
                return fail(&api, &events, request.object_ref(&()), &name, &mut status, message, &request_id).await;
            }
        }

        let namespaces = match namespace_mode(&policy.spec) {
            Err(message) => {
                return fail(&api, &events, request.object_ref(&()), &name, &mut status, message.to_string(), &request_id).await;
            }
            Ok(NamespaceMode::List(list)) => list.to_vec(),
            Ok(NamespaceMode::Selector(selector)) => {
                select_namespaces(&ctx.client, selector).await?
            }
        };

        if namespaces.is_empty() {
            return reject(
                &api,
                &events,
                request.object_ref(&()),
                &name,
                &mut status,
                validation::Rejection::NoMatchedNamespaces.message(),
                &request_id,
            )
            .await;
        }

        let children = if namespaces == [ALL_NAMESPACES] {
            vec![
                create_cluster_grant(&ctx.client, request.as_ref(), &policy, &requester, &request_id)
                    .await?,
            ]
        } else {
            let children =
                create_grants(&ctx.client, request.as_ref(), &policy, &requester, &request_id, &namespaces)
                    .await;
            if children.is_empty() {
                // Every creation failed; stay Pending and try again shortly.
                tracing::warn!(%name, request_id = %request_id, "no grants could be created");
                return Ok(Action::requeue(AGGREGATION_INTERVAL));
            }
            children
        };

        status.state = RequestState::Approved;
        status.child_resource = children;
        patch_status(&api, &name, &status).await?;
        events
            .publish(
                request.object_ref(&()),
                EventType::Normal,
                Reason::Approved,
                events::with_request_id(
                    format!(
                        "User '{requester}' was approved by '{}' ClusterSudoPolicy",
                        request.spec.policy
                    ),
                    &request_id,
                ),
            )
            .await;
        return Ok(Action::requeue(AGGREGATION_INTERVAL));
    }

    if status.state == RequestState::Approved {
        for child in status.child_resource.clone() {
            if child.name.is_empty() {
                tracing::warn!(%name, request_id = %request_id, ?child, "child resource has incomplete data");
                continue;
            }
            let child_status = match fetch_child_status(&ctx.client, &child).await {
                Ok(Some(child_status)) => child_status,
                Ok(None) => {
                    tracing::warn!(%name, request_id = %request_id, child = %child.name, "child resource not found");
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
                    continue;
                }
                Err(err) => return Err(err),
            };

            validation::adopt_child_times(&mut status, &child_status);
            match child_status.state {
                BindingState::Expired => {
                    return expire(&api, &events, request.object_ref(&()), &name, &mut status, &requester, &request.spec.policy, &request_id).await;
                }
                BindingState::Error => {
                    return fail(
                        &api,
                        &events,
                        request.object_ref(&()),
                        &name,
                        &mut status,
                        format!(
                            "Error detected while processing ClusterSudoRequest for User '{requester}' and policy '{}'",
                            request.spec.policy
                        ),
                        &request_id,
                    )
                    .await;
                }
                _ => {}
            }
        }
        patch_status(&api, &name, &status).await?;

        if let Some(expires_at) = status.expires_at.clone() {
            return match expiry::requeue_until(&expires_at, Utc::now()) {
                Some(wait) => Ok(Action::requeue(wait)),
                None => expire(&api, &events, request.object_ref(&()), &name, &mut status, &requester, &request.spec.policy, &request_id).await,
            };
        }
        return Ok(Action::requeue(AGGREGATION_INTERVAL));
    }

    Ok(Action::await_change())
}

/// One TemporaryRBAC per namespace, best effort: a namespace that cannot take
/// a grant is logged and skipped rather than failing the whole fan-out.
async fn create_grants(
    client: &Client,
    request: &ClusterSudoRequest,
    policy: &ClusterSudoPolicy,
    requester: &str,
    request_id: &str,
    namespaces: &[String],
) -> Vec<ChildResource> {
    let subject = Subject::user(requester);
    let mut children = Vec::new();
    for namespace in namespaces {
        let Some(owner_ref) = request.controller_owner_ref(&()) else {
            tracing::warn!(request_id = %request_id, "request has no owner identity");
            break;
        };
        let grant = TemporaryRBAC {
            metadata: ObjectMeta {
                name: Some(naming::grant_name(&subject, &request.spec.policy, request_id)),
                namespace: Some(namespace.clone()),
                labels: Some(
                    [(REQUEST_ID_LABEL.to_string(), request_id.to_string())]
                        .into_iter()
                        .collect(),
                ),
                owner_references: Some(vec![owner_ref]),
                ..Default::default()
            },
            spec: TemporaryRBACSpec {
                subjects: vec![subject.clone()],
                role_ref: policy.spec.role_ref.clone(),
                duration: request.spec.duration.clone(),
                retention_policy: Default::default(),
            },
            status: None,
        };
        let grant_name = grant.name_any();
        let grants = Api::<TemporaryRBAC>::namespaced(client.clone(), namespace);
        match grants
            .create(&PostParams::default(), &grant)
            .await
            .map(|_| ())
            .or_else(ignore_already_exists)
        {
            Ok(()) => {
                tracing::info!(request_id = %request_id, %namespace, grant = %grant_name, "created TemporaryRBAC");
                children.push(ChildResource {
                    api_version: API_VERSION.to_string(),
                    kind: "TemporaryRBAC".to_string(),
                    name: grant_name,
                    namespace: Some(namespace.clone()),
                });
            }
            Err(error) => {
                tracing::warn!(%error, request_id = %request_id, %namespace, "failed to create TemporaryRBAC");
            }
        }
    }
    children
}

/// A single cluster-wide grant for the `["*"]` sentinel.
async fn create_cluster_grant(
    client: &Client,
    request: &ClusterSudoRequest,
    policy: &ClusterSudoPolicy,
    requester: &str,
    request_id: &str,
) -> Result<ChildResource, Error> {
    let subject = Subject::user(requester);
    let owner_ref = request
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let grant = ClusterTemporaryRBAC {
        metadata: ObjectMeta {
            name: Some(naming::grant_name(&subject, &request.spec.policy, request_id)),
            labels: Some(
                [(REQUEST_ID_LABEL.to_string(), request_id.to_string())]
                    .into_iter()
                    .collect(),
            ),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: ClusterTemporaryRBACSpec {
            subjects: vec![subject],
            role_ref: policy.spec.role_ref.clone(),
            duration: request.spec.duration.clone(),
            retention_policy: Default::default(),
        },
        status: None,
    };
    let grant_name = grant.name_any();
    Api::<ClusterTemporaryRBAC>::all(client.clone())
        .create(&PostParams::default(), &grant)
        .await
        .map(|_| ())
        .or_else(ignore_already_exists)?;
    tracing::info!(request_id = %request_id, grant = %grant_name, "created ClusterTemporaryRBAC");
    Ok(ChildResource {
        api_version: API_VERSION.to_string(),
        kind: "ClusterTemporaryRBAC".to_string(),
        name: grant_name,
        namespace: None,
    })
}

/// Looks up a child's status by the kind recorded at fan-out time.
async fn fetch_child_status(
    client: &Client,
    child: &ChildResource,
) -> Result<Option<BindingStatus>, Error> {
    match child.kind.as_str() {
        "TemporaryRBAC" => {
            let namespace = child.namespace.clone().unwrap_or_default();
            let api = Api::<TemporaryRBAC>::namespaced(client.clone(), &namespace);
            match api.get(&child.name).await {
                Ok(grant) => Ok(Some(grant.status.unwrap_or_default())),
                Err(err) if is_not_found(&err) => Ok(None),
                Err(err) => Err(err.into()),
            }
        }
        "ClusterTemporaryRBAC" => {
            let api = Api::<ClusterTemporaryRBAC>::all(client.clone());
            match api.get(&child.name).await {
                Ok(grant) => Ok(Some(grant.status.unwrap_or_default())),
                Err(err) if is_not_found(&err) => Ok(None),
                Err(err) => Err(err.into()),
            }
        }
        _ => Ok(None),
    }
}

async fn reject(
    api: &Api<ClusterSudoRequest>,
    events: &Events,
    reference: ObjectReference,
    name: &str,
    status: &mut RequestStatus,
    message: String,
    request_id: &str,
) -> Result<Action, Error> {
    tracing::info!(%name, request_id = %request_id, %message, "rejecting ClusterSudoRequest");
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
    api: &Api<ClusterSudoRequest>,
    events: &Events,
    reference: ObjectReference,
    name: &str,
    status: &mut RequestStatus,
    message: String,
    request_id: &str,
) -> Result<Action, Error> {
    tracing::warn!(%name, request_id = %request_id, %message, "ClusterSudoRequest error");
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
    api: &Api<ClusterSudoRequest>,
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
                    "ClusterSudoRequest Expired for User {requester}, revoked permissions for policy {policy}"
                ),
                request_id,
            ),
        )
        .await;
    tracing::info!(%name, request_id = %request_id, "ClusterSudoRequest has expired");
    Ok(Action::await_change())
}

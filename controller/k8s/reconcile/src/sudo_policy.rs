//! Validates SudoPolicy documents and publishes the result in status.

use crate::{
    error_policy,
    events::{Events, Reason},
    patch_status, Ctx, Error,
};
use futures::StreamExt;
use kube::{
    runtime::{
        controller::{Action, Controller},
        events::EventType,
        watcher,
    },
    Api, Client, Resource, ResourceExt,
};
use std::sync::Arc;
use tarbac_k8s_api::{
    duration,
    policy::{PolicyState, PolicyStatus, SudoPolicy},
};

const CONTROLLER: &str = "sudopolicy-controller";

pub async fn run(client: Client) {
    let policies = Api::<SudoPolicy>::all(client.clone());
    Controller::new(policies, watcher::Config::default())
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

async fn reconcile(policy: Arc<SudoPolicy>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let name = policy.name_any();
    let namespace = policy
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    tracing::debug!(%namespace, %name, "reconciling SudoPolicy");

    let api = Api::<SudoPolicy>::namespaced(ctx.client.clone(), &namespace);

    if duration::parse(&policy.spec.max_duration).is_err() {
        let message = format!(
            "Invalid maxDuration in SudoPolicy spec: {}",
            policy.spec.max_duration
        );
        tracing::info!(%namespace, %name, %message, "invalid SudoPolicy");
        patch_status(
            &api,
            &name,
            &PolicyStatus {
                state: PolicyState::Error,
                error_message: message.clone(),
            },
        )
        .await?;
        Events::new(ctx.client.clone(), CONTROLLER)
            .publish(
                policy.object_ref(&()),
                EventType::Warning,
                Reason::Error,
                message,
            )
            .await;
        return Ok(Action::await_change());
    }

    patch_status(
        &api,
        &name,
        &PolicyStatus {
            state: PolicyState::Active,
            error_message: String::new(),
        },
    )
    .await?;
    tracing::debug!(%namespace, %name, "SudoPolicy is active");
    Ok(Action::await_change())
}

//! Validates ClusterSudoPolicy documents, resolving the allowed-namespace
//! constraint into a status snapshot.

use crate::{
    error_policy,
    events::{Events, Reason},
    patch_status, Ctx, Error,
};
use futures::StreamExt;
use kube::{
    api::ListParams,
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
    labels::NamespaceSelector,
    policy::{ClusterPolicyStatus, ClusterSudoPolicy, ClusterSudoPolicySpec, PolicyState},
    Namespace,
};
use tokio::time::Duration;

const CONTROLLER: &str = "clustersudopolicy-controller";

/// Selector-based policies track a namespace set that evolves independently,
/// so they are re-resolved on a timer; explicit lists are not.
const RESOLVE_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub async fn run(client: Client) {
    let policies = Api::<ClusterSudoPolicy>::all(client.clone());
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

/// How a policy constrains the namespaces a grant may land in. Exactly one
/// form must be used.
pub(crate) enum NamespaceMode<'a> {
    List(&'a [String]),
    Selector(&'a NamespaceSelector),
}

pub(crate) fn namespace_mode(spec: &ClusterSudoPolicySpec) -> Result<NamespaceMode<'_>, &'static str> {
    match (
        spec.allowed_namespaces.as_deref(),
        spec.allowed_namespaces_selector.as_ref(),
    ) {
        (Some(_), Some(_)) => {
            Err("both allowedNamespaces and allowedNamespacesSelector cannot be set simultaneously")
        }
        (None, None) => Err("either allowedNamespaces or allowedNamespacesSelector must be set"),
        (Some(list), None) => Ok(NamespaceMode::List(list)),
        (None, Some(selector)) => Ok(NamespaceMode::Selector(selector)),
    }
}

/// Resolves a selector against the live namespace set, matching labels
/// client-side so expression operators behave uniformly.
pub(crate) async fn select_namespaces(
    client: &Client,
    selector: &NamespaceSelector,
) -> Result<Vec<String>, kube::Error> {
    let namespaces = Api::<Namespace>::all(client.clone())
        .list(&ListParams::default())
        .await?;
    Ok(namespaces
        .items
        .iter()
        .filter(|ns| selector.matches(ns.labels()))
        .map(|ns| ns.name_any())
        .collect())
}

async fn reconcile(policy: Arc<ClusterSudoPolicy>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let name = policy.name_any();
    tracing::debug!(%name, "reconciling ClusterSudoPolicy");

    let api = Api::<ClusterSudoPolicy>::all(ctx.client.clone());
    let events = Events::new(ctx.client.clone(), CONTROLLER);

    if duration::parse(&policy.spec.max_duration).is_err() {
        let message = format!(
            "Invalid maxDuration in ClusterSudoPolicy spec: {}",
            policy.spec.max_duration
        );
        return fail(&api, &events, &policy, &name, message).await;
    }

    let namespaces = match namespace_mode(&policy.spec) {
        Err(message) => return fail(&api, &events, &policy, &name, message.to_string()).await,
        Ok(NamespaceMode::List(list)) => list.to_vec(),
        Ok(NamespaceMode::Selector(selector)) => {
            select_namespaces(&ctx.client, selector).await?
        }
    };

    patch_status(
        &api,
        &name,
        &ClusterPolicyStatus {
            state: PolicyState::Active,
            error_message: String::new(),
            namespaces,
        },
    )
    .await?;
    tracing::debug!(%name, "ClusterSudoPolicy is active");

    if policy.spec.allowed_namespaces_selector.is_some() {
        return Ok(Action::requeue(RESOLVE_INTERVAL));
    }
    Ok(Action::await_change())
}

async fn fail(
    api: &Api<ClusterSudoPolicy>,
    events: &Events,
    policy: &ClusterSudoPolicy,
    name: &str,
    message: String,
) -> Result<Action, Error> {
    tracing::info!(%name, %message, "invalid ClusterSudoPolicy");
    patch_status(
        api,
        name,
        &ClusterPolicyStatus {
            state: PolicyState::Error,
            error_message: message.clone(),
            namespaces: Vec::new(),
        },
    )
    .await?;
    events
        .publish(
            policy.object_ref(&()),
            EventType::Warning,
            Reason::Error,
            message,
        )
        .await;
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarbac_k8s_api::{policy::UserRef, RoleRef};

    fn spec(
        allowed_namespaces: Option<Vec<String>>,
        selector: Option<NamespaceSelector>,
    ) -> ClusterSudoPolicySpec {
        ClusterSudoPolicySpec {
            max_duration: "1h".to_string(),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: "admin".to_string(),
            },
            allowed_users: vec![UserRef::named("alice")],
            allowed_namespaces,
            allowed_namespaces_selector: selector,
        }
    }

    #[test]
    fn exactly_one_namespace_form_is_required() {
        let list = Some(vec!["ns1".to_string()]);
        let selector = Some(NamespaceSelector::from_iter([("team", "payments")]));

        assert!(matches!(
            namespace_mode(&spec(list.clone(), None)),
            Ok(NamespaceMode::List(_))
        ));
        assert!(matches!(
            namespace_mode(&spec(None, selector.clone())),
            Ok(NamespaceMode::Selector(_))
        ));
        assert!(namespace_mode(&spec(list, selector)).is_err());
        assert!(namespace_mode(&spec(None, None)).is_err());
    }
}

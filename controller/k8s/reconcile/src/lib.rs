#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The six tarbac control loops.
//!
//! Each loop is a level-triggered reconciler over one custom resource kind.
//! All cross-loop coordination goes through the API server: a reconciler
//! reads a snapshot of its object, performs its effects, records what it
//! observed in `status`, and schedules its own wake-up by returning a
//! requeue interval. There are no in-process channels between loops.

pub mod cluster_sudo_policy;
pub mod cluster_sudo_request;
pub mod cluster_temporary_rbac;
pub mod events;
pub mod sudo_policy;
pub mod sudo_request;
pub mod temporary_rbac;

mod expiry;
mod validation;

use kube::{
    api::{Api, Patch, PatchParams},
    runtime::controller::Action,
    Client,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Debug, sync::Arc};
use tokio::time::Duration;

/// Shared context handed to every reconcile call.
pub struct Ctx {
    pub client: Client,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("API request failed: {0}")]
    Api(#[from] kube::Error),

    #[error("missing object key: {0}")]
    MissingObjectKey(&'static str),
}

/// Transient failures are handed back to the framework for backoff; status is
/// left untouched so the next pass starts from the last recorded state.
pub(crate) fn error_policy<K>(_obj: Arc<K>, error: &Error, _ctx: Arc<Ctx>) -> Action {
    tracing::warn!(%error, "reconcile failed, requeueing");
    Action::requeue(Duration::from_secs(5))
}

/// Merge-patches the status subresource of `name`.
pub(crate) async fn patch_status<K>(
    api: &Api<K>,
    name: &str,
    status: &impl Serialize,
) -> Result<(), kube::Error>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug,
{
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({ "status": status })),
    )
    .await?;
    Ok(())
}

/// Merge-patches a single metadata label. Labels live on the main object, so
/// this is a separate write from any status update.
pub(crate) async fn patch_label<K>(
    api: &Api<K>,
    name: &str,
    key: &str,
    value: &str,
) -> Result<(), kube::Error>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug,
{
    api.patch(
        name,
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({ "metadata": { "labels": { key: value } } })),
    )
    .await?;
    Ok(())
}

/// "AlreadyExists" is success for idempotent create paths.
pub(crate) fn ignore_already_exists(err: kube::Error) -> Result<(), kube::Error> {
    match err {
        kube::Error::Api(ref response) if response.reason == "AlreadyExists" => Ok(()),
        err => Err(err),
    }
}

/// "NotFound" is success for delete paths: the binding is gone either way.
pub(crate) fn ignore_not_found(err: kube::Error) -> Result<(), kube::Error> {
    match err {
        kube::Error::Api(ref response) if response.code == 404 => Ok(()),
        err => Err(err),
    }
}

pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

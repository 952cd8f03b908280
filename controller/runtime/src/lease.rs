//! Coordination Lease bootstrap for `--enable-leader-election`.

use anyhow::Result;
use k8s_openapi::api::coordination::v1 as coordv1;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use std::sync::Arc;
use tokio::{sync::watch, time};

const LEASE_NAME: &str = "tarbac-controller-lock";
const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);
const FIELD_MANAGER: &str = "tarbac-controller";

pub(crate) async fn init<T>(
    runtime: &kubert::Runtime<T>,
    namespace: &str,
    claimant: &str,
) -> Result<watch::Receiver<Arc<kubert::lease::Claim>>> {
    let params = kubert::LeaseParams {
        name: LEASE_NAME.to_string(),
        namespace: namespace.to_string(),
        claimant: claimant.to_string(),
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
        field_manager: Some(FIELD_MANAGER.into()),
    };

    let patch = Patch::Apply(coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(params.name.clone()),
            namespace: Some(params.namespace.clone()),
            // A resource version of "0" creates the Lease only if it does
            // not already exist.
            resource_version: Some("0".to_string()),
            labels: Some(
                [("app.kubernetes.io/part-of".to_string(), "tarbac".to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    });
    let patch_params = PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };
    let api = Api::<coordv1::Lease>::namespaced(runtime.client(), namespace);

    // An individual request may hit a transient error, so try a few times
    // with a brief pause.
    let mut tries = 3;
    loop {
        tries -= 1;
        let error = match api.patch(LEASE_NAME, &patch_params, &patch).await {
            Ok(lease) => {
                tracing::info!(?lease, "created Lease");
                break;
            }
            Err(kube::Error::Api(error)) if error.code < 500 => {
                tracing::debug!(?error, "Lease already exists");
                break;
            }
            Err(error) => error,
        };
        if tries == 0 {
            anyhow::bail!(error);
        }
        tracing::warn!(?error, "failed to create Lease, retrying in 1s...");
        time::sleep(time::Duration::from_secs(1)).await;
    }

    let (claim, _task) = runtime.spawn_lease(params).await?;
    Ok(claim)
}

use crate::{admission::Admission, lease, reconcile};
use anyhow::{bail, Result};
use clap::Parser;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "tarbac", about = "Time-bounded, policy-gated RBAC controller")]
pub struct Args {
    #[clap(long, default_value = "tarbac=info,warn", env = "TARBAC_CONTROLLER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// Enable leader election for the controller manager.
    #[clap(long)]
    enable_leader_election: bool,

    /// Namespace holding the leader-election Lease.
    #[clap(long, default_value = "tarbac-system", env = "POD_NAMESPACE")]
    controller_namespace: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            server,
            admin,
            admission_controller_disabled,
            enable_leader_election,
            controller_namespace,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin)
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;
        let client = runtime.client();

        if enable_leader_election {
            let claimant = std::env::var("HOSTNAME")
                .unwrap_or_else(|_| "tarbac-controller".to_string());
            let mut claims = lease::init(&runtime, &controller_namespace, &claimant).await?;
            info!(%claimant, "waiting for leadership");
            claims
                .wait_for(|claim| claim.is_current_for(&claimant))
                .await?;
            info!(%claimant, "acquired leadership");
        }

        // The six control loops. Each owns its kind; everything they share
        // goes through the API server.
        tokio::spawn(
            reconcile::sudo_policy::run(client.clone()).instrument(info_span!("sudopolicies")),
        );
        tokio::spawn(
            reconcile::cluster_sudo_policy::run(client.clone())
                .instrument(info_span!("clustersudopolicies")),
        );
        tokio::spawn(
            reconcile::sudo_request::run(client.clone()).instrument(info_span!("sudorequests")),
        );
        tokio::spawn(
            reconcile::cluster_sudo_request::run(client.clone())
                .instrument(info_span!("clustersudorequests")),
        );
        tokio::spawn(
            reconcile::temporary_rbac::run(client.clone())
                .instrument(info_span!("temporaryrbacs")),
        );
        tokio::spawn(
            reconcile::cluster_temporary_rbac::run(client.clone())
                .instrument(info_span!("clustertemporaryrbacs")),
        );

        let runtime = runtime.spawn_server(Admission::new);

        // Block on the shutdown signal; background tasks drain before exit.
        if runtime.run().await.is_err() {
            bail!("aborted");
        }

        Ok(())
    }
}

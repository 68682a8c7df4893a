use crate::{admission::Admission, config::Config, metrics::DecisionMetrics, store::KubeStore};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc};
use tokio::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[clap(
    name = "tenancy-policy",
    about = "An admission controller enforcing multi-tenant fair use"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "tenancy=info,warn",
        env = "TENANCY_POLICY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Path to the policy configuration file.
    #[clap(long, default_value = "/etc/tenancy-policy/config.yaml")]
    config: PathBuf,

    /// Bounds every read against the API server.
    #[clap(long, default_value = "5000")]
    lookup_timeout_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            config,
            lookup_timeout_ms,
        } = self;

        // Fail before binding any port if the configuration is unusable.
        let config = Config::load(&config)?;

        let mut prom = <Registry>::default();
        let metrics = DecisionMetrics::register(prom.sub_registry_with_prefix("tenancy_policy"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_server(server)
            .build()
            .await?;

        let store = Arc::new(KubeStore::new(
            runtime.client(),
            Duration::from_millis(lookup_timeout_ms),
        ));
        let admission = Admission::new(config.policies(store.clone(), store)?, metrics);
        for policy in admission.policies() {
            info!(%policy, path = %format_args!("/{policy}"), "Serving policy");
        }

        let runtime = runtime.spawn_server(admission);

        // Block the main thread on the shutdown signal.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

//! Machine sync operator - mirrors machines between the Machine API and Cluster API

mod config;
mod runner;

use std::sync::Arc;

use clap::Parser;
use kube::Client;

use machinesync_common::events::KubeEventPublisher;
use machinesync_common::leader_election::LeaderElector;
use machinesync_common::telemetry::{init_telemetry, TelemetryConfig};
use machinesync_common::CONTROLLER_NAME;
use machinesync_controller::{strategy_for, Context, KubeMachineClient};

use crate::config::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        json: !cli.log_text,
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    let platform = cli
        .platform()
        .map_err(|e| anyhow::anyhow!("invalid --platform: {e}"))?;
    let Some(strategy) = strategy_for(platform) else {
        tracing::warn!(%platform, "platform has no machine conversion, nothing to sync");
        tokio::signal::ctrl_c().await?;
        return Ok(());
    };

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    let config = cli.sync_config();
    tracing::info!(
        %platform,
        mapi_namespace = %config.mapi_namespace,
        capi_namespace = %config.capi_namespace,
        cluster = %config.infrastructure_name,
        "Starting machine sync operator"
    );

    let machine_client = KubeMachineClient::new(
        client.clone(),
        &config.mapi_namespace,
        &config.capi_namespace,
        strategy.infra_machine_resource(),
        strategy.infra_cluster_resource(),
    );
    let ctx = Arc::new(
        Context::builder(Arc::new(machine_client), strategy)
            .events(Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME)))
            .config(config)
            .build(),
    );

    let guard = if cli.leader_elect {
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            &cli.lease_name,
            cli.lease_namespace(),
            &cli.identity(),
        ));
        Some(elector.acquire().await?)
    } else {
        tracing::warn!("leader election disabled, running controllers unconditionally");
        None
    };

    tracing::info!("Starting controllers:");
    let controllers = futures::future::join_all(runner::build_controllers(client, ctx));

    match guard {
        Some(mut guard) => {
            let lost = tokio::select! {
                _ = controllers => false,
                _ = guard.lost() => true,
            };
            if lost {
                anyhow::bail!("leadership lost");
            }
            tracing::info!("Controllers stopped, releasing leadership");
            if let Err(e) = guard.release_leadership().await {
                tracing::warn!(error = %e, "failed to release lease");
            }
        }
        None => {
            controllers.await;
        }
    }

    tracing::info!("Machine sync operator shut down");
    Ok(())
}

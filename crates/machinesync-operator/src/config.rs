//! Command-line and environment configuration

use std::time::Duration;

use clap::Parser;

use machinesync_common::leader_election::DEFAULT_LEASE_NAME;
use machinesync_common::{DEFAULT_CAPI_NAMESPACE, DEFAULT_MAPI_NAMESPACE};
use machinesync_controller::{Platform, SyncConfig};

/// Machine sync operator - mirrors machines between the Machine API and Cluster API
#[derive(Parser, Debug, Clone)]
#[command(name = "machinesync-operator", version, about, long_about = None)]
pub struct Cli {
    /// Namespace of legacy Machine API machines
    #[arg(long, env = "MAPI_NAMESPACE", default_value = DEFAULT_MAPI_NAMESPACE)]
    pub mapi_namespace: String,

    /// Namespace of Cluster API machines and infrastructure machines
    #[arg(long, env = "CAPI_NAMESPACE", default_value = DEFAULT_CAPI_NAMESPACE)]
    pub capi_namespace: String,

    /// Infrastructure platform of the cluster (aws, azure, gcp, ...)
    #[arg(long, env = "PLATFORM", default_value = "aws")]
    pub platform: String,

    /// Name of the Cluster API `Cluster` (the cluster's infrastructure name)
    #[arg(long, env = "INFRASTRUCTURE_NAME")]
    pub infrastructure_name: String,

    /// Requeue delay while a machine reports a progressing condition
    #[arg(long, env = "PROGRESS_REQUEUE_SECS", default_value_t = 5)]
    pub progress_requeue_secs: u64,

    /// Run controllers only while holding the leader lease
    #[arg(
        long,
        env = "LEADER_ELECT",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub leader_elect: bool,

    /// Namespace of the leader lease (defaults to the CAPI namespace)
    #[arg(long, env = "LEASE_NAMESPACE")]
    pub lease_namespace: Option<String>,

    /// Name of the leader lease
    #[arg(long, env = "LEASE_NAME", default_value = DEFAULT_LEASE_NAME)]
    pub lease_name: String,

    /// Identity recorded in the lease (defaults to the hostname)
    #[arg(long, env = "POD_NAME")]
    pub identity: Option<String>,

    /// Emit human-readable logs instead of JSON
    #[arg(long, env = "LOG_TEXT")]
    pub log_text: bool,
}

impl Cli {
    /// Parsed platform; invalid names are rejected at startup
    pub fn platform(&self) -> Result<Platform, machinesync_common::Error> {
        self.platform.parse()
    }

    /// Settings handed to the reconciler
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            mapi_namespace: self.mapi_namespace.clone(),
            capi_namespace: self.capi_namespace.clone(),
            infrastructure_name: self.infrastructure_name.clone(),
            progress_requeue: Duration::from_secs(self.progress_requeue_secs),
        }
    }

    /// Namespace the leader lease lives in
    pub fn lease_namespace(&self) -> &str {
        self.lease_namespace
            .as_deref()
            .unwrap_or(&self.capi_namespace)
    }

    /// Lease holder identity
    pub fn identity(&self) -> String {
        self.identity
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "machinesync-operator".to_string())
    }
}

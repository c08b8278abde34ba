//! Platform strategies
//!
//! Everything provider specific lives behind [`PlatformStrategy`]: which
//! infrastructure kinds pair with machines, how the provider payload converts
//! in both directions, how infrastructure machines are compared, and what
//! invariants a payload must satisfy before it is mirrored. A strategy is
//! selected once at startup from the [`Platform`] the cluster runs on.
//!
//! # Supported Platforms
//!
//! - [`AwsStrategy`] - `AWSMachineProviderConfig` ↔ `AWSMachine`

mod aws;
pub(crate) mod common;

pub use aws::AwsStrategy;

use std::sync::Arc;

use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde_json::Value;

use machinesync_common::crd::{CapiCluster, CapiMachine, MapiMachine};
use machinesync_common::Error;

use crate::client::MachineClient;

/// Infrastructure platform the cluster runs on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    /// Amazon Web Services
    Aws,
    /// Microsoft Azure
    Azure,
    /// Google Cloud Platform
    Gcp,
    /// OpenStack
    OpenStack,
    /// VMware vSphere
    VSphere,
    /// Bare metal
    BareMetal,
    /// No platform integration
    None,
}

impl std::str::FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "azure" => Ok(Self::Azure),
            "gcp" => Ok(Self::Gcp),
            "openstack" => Ok(Self::OpenStack),
            "vsphere" => Ok(Self::VSphere),
            "baremetal" => Ok(Self::BareMetal),
            "none" | "" => Ok(Self::None),
            _ => Err(Error::validation(format!(
                "invalid platform: {s}, expected one of: aws, azure, gcp, openstack, vsphere, baremetal, none"
            ))),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aws => write!(f, "aws"),
            Self::Azure => write!(f, "azure"),
            Self::Gcp => write!(f, "gcp"),
            Self::OpenStack => write!(f, "openstack"),
            Self::VSphere => write!(f, "vsphere"),
            Self::BareMetal => write!(f, "baremetal"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Strategy for a platform, or `None` if machines on it are not mirrored
pub fn strategy_for(platform: Platform) -> Option<Arc<dyn PlatformStrategy>> {
    match platform {
        Platform::Aws => Some(Arc::new(AwsStrategy)),
        _ => None,
    }
}

/// The cluster a machine belongs to, as conversions need it
#[derive(Clone, Debug, Default)]
pub struct ClusterContext {
    /// Name of the CAPI cluster (the infrastructure name)
    pub name: String,
    /// UID of the CAPI cluster, used for synthesized owner references
    pub uid: Option<String>,
    /// The platform infrastructure cluster, if it exists
    pub infra_cluster: Option<DynamicObject>,
}

impl ClusterContext {
    /// Load the CAPI cluster and the infrastructure cluster it references
    pub async fn load(client: &dyn MachineClient, name: &str) -> Result<Self, Error> {
        let cluster: CapiCluster = client
            .get_capi_cluster(name)
            .await?
            .ok_or_else(|| Error::missing_counterpart("Cluster", name))?;

        let infra_name = cluster
            .spec
            .infrastructure_ref
            .as_ref()
            .and_then(|r| r.name.as_deref())
            .unwrap_or(name)
            .to_string();
        let infra_cluster = client.get_infra_cluster(&infra_name).await?;

        Ok(Self {
            name: name.to_string(),
            uid: cluster.metadata.uid,
            infra_cluster,
        })
    }
}

/// Result of converting a legacy machine into the CAPI model
#[derive(Clone, Debug)]
pub struct CapiConversion {
    /// The CAPI machine, status included
    pub machine: CapiMachine,
    /// The infrastructure machine
    pub infra: DynamicObject,
    /// Non-fatal conversion warnings
    pub warnings: Vec<String>,
}

/// Result of converting a CAPI machine into the legacy model
#[derive(Clone, Debug)]
pub struct MapiConversion {
    /// The legacy machine, status included
    pub machine: MapiMachine,
    /// Non-fatal conversion warnings
    pub warnings: Vec<String>,
}

/// Provider-specific behavior for one platform
///
/// Implementations are pure; all store access stays in the reconciler.
pub trait PlatformStrategy: Send + Sync {
    /// Platform this strategy handles
    fn platform(&self) -> Platform;

    /// Infrastructure machine kind paired with CAPI machines
    fn infra_machine_resource(&self) -> ApiResource;

    /// Infrastructure cluster kind paired with the CAPI cluster
    fn infra_cluster_resource(&self) -> ApiResource;

    /// Convert a legacy machine into a CAPI machine and infrastructure machine
    fn to_capi(&self, mapi: &MapiMachine, cluster: &ClusterContext)
        -> Result<CapiConversion, Error>;

    /// Convert a CAPI machine and its infrastructure machine into a legacy machine
    fn to_mapi(
        &self,
        capi: &CapiMachine,
        infra: &DynamicObject,
        cluster: &ClusterContext,
    ) -> Result<MapiConversion, Error>;

    /// Provider payload with order-insensitive lists sorted, for comparison
    fn canonical_provider_spec(&self, value: &Value) -> Value {
        value.clone()
    }

    /// Carry payload keys the reverse conversion cannot produce from `current` into `desired`
    fn preserve_unmodeled_fields(&self, _current: &Value, _desired: &mut Value) {}

    /// Paths of infrastructure machine fields that differ and require replacement
    fn diff_infra(&self, current: &DynamicObject, desired: &DynamicObject) -> Vec<String>;

    /// Check platform invariants of a legacy machine payload
    fn validate(&self, _mapi: &MapiMachine, _cluster: &ClusterContext) -> Result<(), Error> {
        Ok(())
    }
}

//! AWS strategy: `AWSMachineProviderConfig` ↔ CAPA `AWSMachine`
//!
//! The legacy payload keeps tags as a list and load balancers per machine;
//! CAPA keeps tags as a map and attaches the cluster's control-plane load
//! balancers itself. Load balancers are therefore validated against the
//! `AWSCluster` on the way in and rebuilt from it on the way out.

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use machinesync_common::crd::{CapiMachine, MapiMachine};
use machinesync_common::Error;

use super::common::{
    capi_machine_skeleton, dynamic_spec, infra_object, is_control_plane_capi,
    is_control_plane_mapi, mapi_machine_skeleton,
};
use super::{CapiConversion, ClusterContext, MapiConversion, Platform, PlatformStrategy};
use crate::diff::json_paths;

const INFRA_GROUP: &str = "infrastructure.cluster.x-k8s.io";
const INFRA_VERSION: &str = "v1beta2";
const INFRA_API_VERSION: &str = "infrastructure.cluster.x-k8s.io/v1beta2";

const PROVIDER_CONFIG_API_VERSION: &str = "machine.openshift.io/v1beta1";
const PROVIDER_CONFIG_KIND: &str = "AWSMachineProviderConfig";

/// Credentials secret every legacy AWS machine uses; CAPA has no per-machine equivalent
const DEFAULT_CREDENTIALS_SECRET: &str = "aws-cloud-credentials";

const PROVIDER_SPEC_PATH: &str = "spec.providerSpec.value";

const LB_CLASSIC: &str = "classic";
const LB_NETWORK: &str = "network";

// =============================================================================
// Legacy payload
// =============================================================================

/// Reference to an AWS resource by ID, ARN or filters
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(default, rename_all = "camelCase")]
pub struct AwsResourceReference {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
}

impl AwsResourceReference {
    fn is_empty(&self) -> bool {
        self.id.is_none() && self.arn.is_none() && self.filters.is_empty()
    }
}

/// Name/values filter
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(default)]
pub struct Filter {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct TagSpecification {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SecretReference {
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Placement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenancy: Option<String>,
    /// Keys without an `AWSMachine` counterpart
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoadBalancerReference {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct BlockDeviceMapping {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ebs: Option<EbsBlockDevice>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct EbsBlockDevice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iops: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kms_key: Option<AwsResourceReference>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MetadataServiceOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication: Option<String>,
}

/// Legacy AWS provider payload (`providerSpec.value`)
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AwsMachineProviderConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub ami: AwsResourceReference,
    pub instance_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<TagSpecification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iam_instance_profile: Option<AwsResourceReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data_secret: Option<SecretReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<SecretReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<AwsResourceReference>,
    pub subnet: AwsResourceReference,
    pub placement: Placement,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub load_balancers: Vec<LoadBalancerReference>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub block_devices: Vec<BlockDeviceMapping>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_service_options: Option<MetadataServiceOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placement_group_name: Option<String>,
    /// Keys without an `AWSMachine` counterpart (e.g. `spotMarketOptions`)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl AwsMachineProviderConfig {
    /// Paths of payload keys the conversion does not carry into `AWSMachine`
    fn unmodeled_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.extra.keys().cloned().collect();
        paths.extend(self.placement.extra.keys().map(|k| format!("placement.{k}")));
        for (i, device) in self.block_devices.iter().enumerate() {
            paths.extend(device.extra.keys().map(|k| format!("blockDevices[{i}].{k}")));
            if let Some(ebs) = &device.ebs {
                paths.extend(ebs.extra.keys().map(|k| format!("blockDevices[{i}].ebs.{k}")));
            }
        }
        paths
    }

    /// Copy unmodeled keys from `current` that this payload does not set
    ///
    /// Block devices are matched by device name; the root device has none.
    fn keep_unmodeled(&mut self, current: &AwsMachineProviderConfig) {
        merge_missing(&mut self.extra, &current.extra);
        merge_missing(&mut self.placement.extra, &current.placement.extra);
        for device in &mut self.block_devices {
            let Some(previous) = current
                .block_devices
                .iter()
                .find(|d| d.device_name == device.device_name)
            else {
                continue;
            };
            merge_missing(&mut device.extra, &previous.extra);
            if let (Some(ebs), Some(previous_ebs)) = (device.ebs.as_mut(), previous.ebs.as_ref()) {
                merge_missing(&mut ebs.extra, &previous_ebs.extra);
            }
        }
    }

    /// Sort every list whose order carries no meaning
    fn canonicalize(&mut self) {
        self.tags.sort();
        self.load_balancers.sort();
        for group in &mut self.security_groups {
            sort_filters(&mut group.filters);
        }
        self.security_groups.sort();
        sort_filters(&mut self.subnet.filters);
        sort_filters(&mut self.ami.filters);
    }
}

fn merge_missing(target: &mut BTreeMap<String, Value>, source: &BTreeMap<String, Value>) {
    for (key, value) in source {
        target.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

fn sort_filters(filters: &mut [Filter]) {
    for filter in filters.iter_mut() {
        filter.values.sort();
    }
    filters.sort();
}

// =============================================================================
// CAPA payload
// =============================================================================

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
struct AmiReference {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(default)]
struct CapaResourceReference {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    filters: Vec<Filter>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
struct Volume {
    #[serde(skip_serializing_if = "Option::is_none")]
    device_name: Option<String>,
    size: i64,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    type_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    iops: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    encrypted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    encryption_key: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
struct InstanceMetadataOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    http_tokens: Option<String>,
}

/// `AWSMachine.spec` (the subset the conversion owns)
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
struct AwsMachineSpec {
    #[serde(rename = "providerID", skip_serializing_if = "Option::is_none")]
    provider_id: Option<String>,
    #[serde(rename = "instanceID", skip_serializing_if = "Option::is_none")]
    instance_id: Option<String>,
    ami: AmiReference,
    instance_type: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    additional_tags: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    iam_instance_profile: Option<String>,
    #[serde(rename = "publicIP", skip_serializing_if = "Option::is_none")]
    public_ip: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    additional_security_groups: Vec<CapaResourceReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subnet: Option<CapaResourceReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ssh_key_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    root_volume: Option<Volume>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    non_root_volumes: Vec<Volume>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_metadata_options: Option<InstanceMetadataOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenancy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    placement_group_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct AwsLoadBalancerSpec {
    name: Option<String>,
    load_balancer_type: Option<String>,
}

/// `AWSCluster.spec` (the subset machines depend on)
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct AwsClusterSpec {
    region: Option<String>,
    control_plane_load_balancer: Option<AwsLoadBalancerSpec>,
    secondary_control_plane_load_balancer: Option<AwsLoadBalancerSpec>,
}

impl AwsClusterSpec {
    fn from_context(cluster: &ClusterContext) -> Self {
        cluster
            .infra_cluster
            .as_ref()
            .and_then(|c| serde_json::from_value(dynamic_spec(c).clone()).ok())
            .unwrap_or_default()
    }

    /// Control-plane load balancers in legacy form
    fn load_balancers(&self) -> Vec<LoadBalancerReference> {
        [
            &self.control_plane_load_balancer,
            &self.secondary_control_plane_load_balancer,
        ]
        .into_iter()
        .flatten()
        .filter_map(|lb| {
            let name = lb.name.clone().filter(|n| !n.is_empty())?;
            let type_ = match lb.load_balancer_type.as_deref() {
                None | Some("classic") | Some("elb") => LB_CLASSIC,
                Some("nlb") => LB_NETWORK,
                _ => return None,
            };
            Some(LoadBalancerReference {
                name,
                type_: type_.to_string(),
            })
        })
        .collect()
    }
}

// =============================================================================
// Strategy
// =============================================================================

/// AWS platform strategy
#[derive(Clone, Copy, Debug, Default)]
pub struct AwsStrategy;

fn provider_config(mapi: &MapiMachine) -> Result<AwsMachineProviderConfig, String> {
    let value = mapi
        .spec
        .provider_spec
        .value
        .clone()
        .ok_or_else(|| format!("{PROVIDER_SPEC_PATH}: Required value"))?;
    serde_json::from_value(value).map_err(|e| format!("{PROVIDER_SPEC_PATH}: {e}"))
}

fn instance_id(provider_id: &str) -> Option<String> {
    provider_id
        .rsplit('/')
        .next()
        .filter(|id| id.starts_with("i-"))
        .map(str::to_string)
}

fn capa_reference(
    field: &str,
    reference: &AwsResourceReference,
    errors: &mut Vec<String>,
) -> CapaResourceReference {
    if reference.arn.is_some() {
        errors.push(format!(
            "{PROVIDER_SPEC_PATH}.{field}.arn: Forbidden: ARN references are not supported"
        ));
    }
    CapaResourceReference {
        id: reference.id.clone(),
        filters: reference.filters.clone(),
    }
}

fn capa_volume(
    field: &str,
    device: &BlockDeviceMapping,
    errors: &mut Vec<String>,
) -> Option<Volume> {
    let Some(ebs) = device.ebs.as_ref() else {
        errors.push(format!("{PROVIDER_SPEC_PATH}.{field}.ebs: Required value"));
        return None;
    };
    let Some(size) = ebs.volume_size else {
        errors.push(format!(
            "{PROVIDER_SPEC_PATH}.{field}.ebs.volumeSize: Required value"
        ));
        return None;
    };
    let encryption_key = ebs
        .kms_key
        .as_ref()
        .and_then(|k| k.arn.clone().or_else(|| k.id.clone()));
    Some(Volume {
        device_name: device.device_name.clone(),
        size,
        type_: ebs.volume_type.clone(),
        iops: ebs.iops,
        encrypted: ebs.encrypted,
        encryption_key,
    })
}

fn legacy_block_device(volume: &Volume) -> BlockDeviceMapping {
    let kms_key = volume.encryption_key.as_ref().map(|key| {
        if key.starts_with("arn:") {
            AwsResourceReference {
                arn: Some(key.clone()),
                ..Default::default()
            }
        } else {
            AwsResourceReference {
                id: Some(key.clone()),
                ..Default::default()
            }
        }
    });
    BlockDeviceMapping {
        device_name: volume.device_name.clone(),
        ebs: Some(EbsBlockDevice {
            volume_size: Some(volume.size),
            volume_type: volume.type_.clone(),
            iops: volume.iops,
            encrypted: volume.encrypted,
            kms_key,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn aws_machine_spec(
    config: &AwsMachineProviderConfig,
    provider_id: Option<&str>,
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
) -> AwsMachineSpec {
    if config.ami.id.is_none() {
        if config.ami.is_empty() {
            errors.push(format!("{PROVIDER_SPEC_PATH}.ami.id: Required value"));
        } else {
            errors.push(format!(
                "{PROVIDER_SPEC_PATH}.ami: Unsupported value: only AMI IDs are supported"
            ));
        }
    }
    if config.instance_type.is_empty() {
        errors.push(format!("{PROVIDER_SPEC_PATH}.instanceType: Required value"));
    }

    let iam_instance_profile = config.iam_instance_profile.as_ref().and_then(|profile| {
        if profile.id.is_none() {
            errors.push(format!(
                "{PROVIDER_SPEC_PATH}.iamInstanceProfile.id: Required value"
            ));
        }
        profile.id.clone()
    });

    let mut additional_tags = BTreeMap::new();
    for tag in &config.tags {
        if additional_tags
            .insert(tag.name.clone(), tag.value.clone())
            .is_some()
        {
            warnings.push(format!("duplicate tag {}: last value wins", tag.name));
        }
    }

    let additional_security_groups = config
        .security_groups
        .iter()
        .enumerate()
        .map(|(i, sg)| capa_reference(&format!("securityGroups[{i}]"), sg, errors))
        .collect();

    let subnet = (!config.subnet.is_empty()).then(|| capa_reference("subnet", &config.subnet, errors));

    let mut root_volume = None;
    let mut non_root_volumes = Vec::new();
    for (i, device) in config.block_devices.iter().enumerate() {
        let field = format!("blockDevices[{i}]");
        let Some(volume) = capa_volume(&field, device, errors) else {
            continue;
        };
        if device.device_name.is_some() {
            non_root_volumes.push(volume);
        } else if root_volume.is_some() {
            errors.push(format!(
                "{PROVIDER_SPEC_PATH}.{field}: Duplicate value: only one root volume is allowed"
            ));
        } else {
            root_volume = Some(volume);
        }
    }

    let instance_metadata_options = match config
        .metadata_service_options
        .as_ref()
        .and_then(|o| o.authentication.as_deref())
    {
        None => None,
        Some("Required") => Some("required"),
        Some("Optional") => Some("optional"),
        Some(other) => {
            errors.push(format!(
                "{PROVIDER_SPEC_PATH}.metadataServiceOptions.authentication: Unsupported value: \"{other}\""
            ));
            None
        }
    }
    .map(|tokens| InstanceMetadataOptions {
        http_tokens: Some(tokens.to_string()),
    });

    for path in config.unmodeled_paths() {
        warnings.push(format!(
            "{PROVIDER_SPEC_PATH}.{path} has no AWSMachine equivalent and is not mirrored"
        ));
    }

    if let Some(secret) = &config.credentials_secret {
        if secret.name != DEFAULT_CREDENTIALS_SECRET {
            warnings.push(format!(
                "credentialsSecret {} is not carried over; CAPA uses cluster-wide credentials",
                secret.name
            ));
        }
    }

    AwsMachineSpec {
        provider_id: provider_id.map(str::to_string),
        instance_id: provider_id.and_then(instance_id),
        ami: AmiReference {
            id: config.ami.id.clone(),
        },
        instance_type: config.instance_type.clone(),
        additional_tags,
        iam_instance_profile,
        public_ip: config.public_ip,
        additional_security_groups,
        subnet,
        ssh_key_name: config.key_name.clone(),
        root_volume,
        non_root_volumes,
        instance_metadata_options,
        tenancy: config.placement.tenancy.clone(),
        placement_group_name: config.placement_group_name.clone(),
    }
}

fn provider_config_from_capa(
    spec: AwsMachineSpec,
    capi: &CapiMachine,
    cluster: &AwsClusterSpec,
) -> AwsMachineProviderConfig {
    let reference = |r: CapaResourceReference| AwsResourceReference {
        id: r.id,
        arn: None,
        filters: r.filters,
    };

    let block_devices = spec
        .root_volume
        .iter()
        .chain(spec.non_root_volumes.iter())
        .map(legacy_block_device)
        .collect();

    let metadata_service_options = spec.instance_metadata_options.and_then(|o| {
        let authentication = match o.http_tokens.as_deref()? {
            "required" => "Required",
            _ => "Optional",
        };
        Some(MetadataServiceOptions {
            authentication: Some(authentication.to_string()),
        })
    });

    let load_balancers = if is_control_plane_capi(capi) {
        cluster.load_balancers()
    } else {
        Vec::new()
    };

    AwsMachineProviderConfig {
        api_version: Some(PROVIDER_CONFIG_API_VERSION.to_string()),
        kind: Some(PROVIDER_CONFIG_KIND.to_string()),
        ami: AwsResourceReference {
            id: spec.ami.id,
            ..Default::default()
        },
        instance_type: spec.instance_type,
        tags: spec
            .additional_tags
            .into_iter()
            .map(|(name, value)| TagSpecification { name, value })
            .collect(),
        iam_instance_profile: spec.iam_instance_profile.map(|id| AwsResourceReference {
            id: Some(id),
            ..Default::default()
        }),
        user_data_secret: capi
            .spec
            .bootstrap
            .data_secret_name
            .clone()
            .map(|name| SecretReference { name }),
        credentials_secret: Some(SecretReference {
            name: DEFAULT_CREDENTIALS_SECRET.to_string(),
        }),
        key_name: spec.ssh_key_name,
        public_ip: spec.public_ip,
        security_groups: spec
            .additional_security_groups
            .into_iter()
            .map(reference)
            .collect(),
        subnet: spec.subnet.map(reference).unwrap_or_default(),
        placement: Placement {
            region: cluster.region.clone(),
            availability_zone: capi.spec.failure_domain.clone(),
            tenancy: spec.tenancy,
            ..Default::default()
        },
        load_balancers,
        block_devices,
        metadata_service_options,
        placement_group_name: spec.placement_group_name,
        ..Default::default()
    }
}

/// Spec with controller-populated identity fields cleared
fn comparable_infra_spec(obj: &DynamicObject) -> Value {
    match serde_json::from_value::<AwsMachineSpec>(dynamic_spec(obj).clone()) {
        Ok(mut spec) => {
            spec.provider_id = None;
            spec.instance_id = None;
            for group in &mut spec.additional_security_groups {
                sort_filters(&mut group.filters);
            }
            spec.additional_security_groups.sort();
            serde_json::to_value(spec).unwrap_or(Value::Null)
        }
        Err(_) => {
            let mut raw = dynamic_spec(obj).clone();
            if let Some(map) = raw.as_object_mut() {
                map.remove("providerID");
                map.remove("instanceID");
            }
            raw
        }
    }
}

impl PlatformStrategy for AwsStrategy {
    fn platform(&self) -> Platform {
        Platform::Aws
    }

    fn infra_machine_resource(&self) -> ApiResource {
        ApiResource {
            group: INFRA_GROUP.to_string(),
            version: INFRA_VERSION.to_string(),
            api_version: INFRA_API_VERSION.to_string(),
            kind: "AWSMachine".to_string(),
            plural: "awsmachines".to_string(),
        }
    }

    fn infra_cluster_resource(&self) -> ApiResource {
        ApiResource {
            group: INFRA_GROUP.to_string(),
            version: INFRA_VERSION.to_string(),
            api_version: INFRA_API_VERSION.to_string(),
            kind: "AWSCluster".to_string(),
            plural: "awsclusters".to_string(),
        }
    }

    fn to_capi(
        &self,
        mapi: &MapiMachine,
        cluster: &ClusterContext,
    ) -> Result<CapiConversion, Error> {
        let name = mapi.name_any();
        let config = provider_config(mapi).map_err(|e| Error::conversion_for(&name, e))?;

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let spec = aws_machine_spec(
            &config,
            mapi.spec.provider_id.as_deref(),
            &mut errors,
            &mut warnings,
        );

        let cluster_spec = AwsClusterSpec::from_context(cluster);
        if let (Some(machine_region), Some(cluster_region)) =
            (&config.placement.region, &cluster_spec.region)
        {
            if machine_region != cluster_region {
                warnings.push(format!(
                    "placement.region {machine_region} differs from cluster region {cluster_region}"
                ));
            }
        }

        if !errors.is_empty() {
            return Err(Error::conversion_for(name, errors.join("; ")));
        }

        let resource = self.infra_machine_resource();
        let mut machine = capi_machine_skeleton(mapi, &cluster.name, &resource);
        machine.spec.bootstrap.data_secret_name =
            config.user_data_secret.as_ref().map(|s| s.name.clone());
        machine.spec.failure_domain = config.placement.availability_zone.clone();

        let spec = serde_json::to_value(&spec)
            .map_err(|e| Error::serialization_for_kind("AWSMachine", e.to_string()))?;
        let infra = infra_object(&resource, &name, spec);

        Ok(CapiConversion {
            machine,
            infra,
            warnings,
        })
    }

    fn to_mapi(
        &self,
        capi: &CapiMachine,
        infra: &DynamicObject,
        cluster: &ClusterContext,
    ) -> Result<MapiConversion, Error> {
        let name = capi.name_any();
        let spec: AwsMachineSpec = serde_json::from_value(dynamic_spec(infra).clone())
            .map_err(|e| Error::conversion_for(&name, format!("AWSMachine spec: {e}")))?;
        if spec.instance_type.is_empty() {
            return Err(Error::conversion_for(
                name,
                "AWSMachine spec.instanceType: Required value",
            ));
        }

        let config = provider_config_from_capa(spec, capi, &AwsClusterSpec::from_context(cluster));
        let value = serde_json::to_value(&config)
            .map_err(|e| Error::serialization_for_kind(PROVIDER_CONFIG_KIND, e.to_string()))?;

        Ok(MapiConversion {
            machine: mapi_machine_skeleton(capi, value),
            warnings: Vec::new(),
        })
    }

    fn canonical_provider_spec(&self, value: &Value) -> Value {
        match serde_json::from_value::<AwsMachineProviderConfig>(value.clone()) {
            Ok(mut config) => {
                config.canonicalize();
                serde_json::to_value(config).unwrap_or_else(|_| value.clone())
            }
            Err(_) => value.clone(),
        }
    }

    fn preserve_unmodeled_fields(&self, current: &Value, desired: &mut Value) {
        let (Ok(current), Ok(mut config)) = (
            serde_json::from_value::<AwsMachineProviderConfig>(current.clone()),
            serde_json::from_value::<AwsMachineProviderConfig>(desired.clone()),
        ) else {
            return;
        };
        config.keep_unmodeled(&current);
        if let Ok(value) = serde_json::to_value(config) {
            *desired = value;
        }
    }

    fn diff_infra(&self, current: &DynamicObject, desired: &DynamicObject) -> Vec<String> {
        json_paths(
            "spec",
            &comparable_infra_spec(current),
            &comparable_infra_spec(desired),
        )
    }

    fn validate(&self, mapi: &MapiMachine, cluster: &ClusterContext) -> Result<(), Error> {
        let name = mapi.name_any();
        let config = provider_config(mapi).map_err(|e| Error::validation_for(&name, e))?;
        let field = format!("{PROVIDER_SPEC_PATH}.loadBalancers");
        let cluster_lbs = AwsClusterSpec::from_context(cluster).load_balancers();
        let control_plane = is_control_plane_mapi(mapi);

        let mut errors = Vec::new();
        if !control_plane && !config.load_balancers.is_empty() {
            errors.push("load balancers may only be attached to control plane machines".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for (i, lb) in config.load_balancers.iter().enumerate() {
            if lb.name.is_empty() {
                errors.push(format!("[{i}].name: Required value"));
                continue;
            }
            if lb.type_ != LB_CLASSIC && lb.type_ != LB_NETWORK {
                errors.push(format!(
                    "[{i}].type: Unsupported value: \"{}\": supported values: \"classic\", \"network\"",
                    lb.type_
                ));
                continue;
            }
            if !seen.insert(lb) {
                errors.push(format!("[{i}]: Duplicate value: \"{}\"", lb.name));
                continue;
            }
            if control_plane && !cluster_lbs.contains(lb) {
                errors.push(format!(
                    "[{i}]: load balancer {} ({}) is not a control plane load balancer of cluster {}",
                    lb.name, lb.type_, cluster.name
                ));
            }
        }

        if control_plane {
            for lb in cluster_lbs
                .iter()
                .filter(|lb| !config.load_balancers.contains(lb))
            {
                errors.push(format!(
                    "missing control plane load balancer {} ({})",
                    lb.name, lb.type_
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::validation_for_field(name, field, errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use machinesync_common::crd::{MapiMachineSpec, ProviderSpec, MAPI_ROLE_LABEL};
    use serde_json::json;

    fn cluster() -> ClusterContext {
        let resource = AwsStrategy.infra_cluster_resource();
        let mut aws_cluster = DynamicObject::new("ci", &resource);
        aws_cluster.data = json!({
            "spec": {
                "region": "us-east-1",
                "controlPlaneLoadBalancer": {"name": "ci-ext", "loadBalancerType": "nlb"},
                "secondaryControlPlaneLoadBalancer": {"name": "ci-int", "loadBalancerType": "nlb"}
            }
        });
        ClusterContext {
            name: "ci".to_string(),
            uid: Some("cluster-uid".to_string()),
            infra_cluster: Some(aws_cluster),
        }
    }

    fn provider_value() -> Value {
        json!({
            "apiVersion": "machine.openshift.io/v1beta1",
            "kind": "AWSMachineProviderConfig",
            "ami": {"id": "ami-0123"},
            "instanceType": "m6i.xlarge",
            "tags": [
                {"name": "owner", "value": "platform"},
                {"name": "kubernetes.io/cluster/ci", "value": "owned"}
            ],
            "iamInstanceProfile": {"id": "ci-master-profile"},
            "userDataSecret": {"name": "master-user-data"},
            "credentialsSecret": {"name": "aws-cloud-credentials"},
            "keyName": "ops",
            "publicIp": false,
            "securityGroups": [
                {"filters": [{"name": "tag:Name", "values": ["ci-node", "ci-lb"]}]},
                {"id": "sg-0abc"}
            ],
            "subnet": {"filters": [{"name": "tag:Name", "values": ["ci-private-us-east-1a"]}]},
            "placement": {"region": "us-east-1", "availabilityZone": "us-east-1a"},
            "loadBalancers": [
                {"name": "ci-int", "type": "network"},
                {"name": "ci-ext", "type": "network"}
            ],
            "blockDevices": [{
                "ebs": {
                    "volumeSize": 120,
                    "volumeType": "gp3",
                    "encrypted": true,
                    "kmsKey": {"arn": "arn:aws:kms:us-east-1:123:key/abc"}
                }
            }],
            "metadataServiceOptions": {"authentication": "Required"}
        })
    }

    fn machine(role: &str, value: Value) -> MapiMachine {
        let mut machine = MapiMachine::new(
            "ci-master-0",
            MapiMachineSpec {
                provider_id: Some("aws:///us-east-1a/i-0abc".to_string()),
                provider_spec: ProviderSpec { value: Some(value) },
                authoritative_api: None,
            },
        );
        machine.metadata.labels = Some(BTreeMap::from([(
            MAPI_ROLE_LABEL.to_string(),
            role.to_string(),
        )]));
        machine
    }

    #[test]
    fn converts_payload_to_aws_machine() {
        let converted = AwsStrategy
            .to_capi(&machine("master", provider_value()), &cluster())
            .unwrap();

        assert!(converted.warnings.is_empty());
        assert_eq!(converted.machine.spec.failure_domain.as_deref(), Some("us-east-1a"));
        assert_eq!(
            converted.machine.spec.bootstrap.data_secret_name.as_deref(),
            Some("master-user-data")
        );
        assert_eq!(converted.machine.spec.cluster_name, "ci");

        let spec = dynamic_spec(&converted.infra);
        assert_eq!(spec["instanceType"], "m6i.xlarge");
        assert_eq!(spec["instanceID"], "i-0abc");
        assert_eq!(spec["additionalTags"]["owner"], "platform");
        assert_eq!(spec["rootVolume"]["size"], 120);
        assert_eq!(spec["rootVolume"]["encryptionKey"], "arn:aws:kms:us-east-1:123:key/abc");
        assert_eq!(spec["instanceMetadataOptions"]["httpTokens"], "required");
        assert_eq!(converted.infra.types.as_ref().unwrap().kind, "AWSMachine");
    }

    #[test]
    fn round_trip_preserves_provider_fields_up_to_ordering() {
        let original = machine("master", provider_value());
        let ctx = cluster();
        let forward = AwsStrategy.to_capi(&original, &ctx).unwrap();
        let back = AwsStrategy
            .to_mapi(&forward.machine, &forward.infra, &ctx)
            .unwrap();

        let before = AwsStrategy.canonical_provider_spec(&provider_value());
        let after = AwsStrategy
            .canonical_provider_spec(back.machine.spec.provider_spec.value.as_ref().unwrap());
        assert_eq!(before, after);

        // Load balancers come back in cluster order, not the original order
        let raw = back.machine.spec.provider_spec.value.unwrap();
        assert_eq!(raw["loadBalancers"][0]["name"], "ci-ext");
        assert_eq!(back.machine.spec.provider_id, original.spec.provider_id);
    }

    #[test]
    fn canonical_form_ignores_tag_order() {
        let mut reordered = provider_value();
        reordered["tags"] = json!([
            {"name": "kubernetes.io/cluster/ci", "value": "owned"},
            {"name": "owner", "value": "platform"}
        ]);
        assert_eq!(
            AwsStrategy.canonical_provider_spec(&reordered),
            AwsStrategy.canonical_provider_spec(&provider_value())
        );
    }

    #[test]
    fn instance_type_change_requires_replacement() {
        let ctx = cluster();
        let current = AwsStrategy.to_capi(&machine("master", provider_value()), &ctx).unwrap();
        let mut changed = provider_value();
        changed["instanceType"] = json!("m6i.2xlarge");
        let desired = AwsStrategy.to_capi(&machine("master", changed), &ctx).unwrap();

        assert_eq!(
            AwsStrategy.diff_infra(&current.infra, &desired.infra),
            vec!["spec.instanceType".to_string()]
        );
    }

    #[test]
    fn provider_id_alone_does_not_require_replacement() {
        let ctx = cluster();
        let mut without_id = machine("master", provider_value());
        without_id.spec.provider_id = None;
        let current = AwsStrategy.to_capi(&without_id, &ctx).unwrap();
        let desired = AwsStrategy.to_capi(&machine("master", provider_value()), &ctx).unwrap();

        assert!(AwsStrategy.diff_infra(&current.infra, &desired.infra).is_empty());
    }

    #[test]
    fn conversion_errors_are_aggregated() {
        let mut value = provider_value();
        value["instanceType"] = json!("");
        value["ami"] = json!({"arn": "arn:aws:ec2:::image/ami-1"});

        let err = AwsStrategy
            .to_capi(&machine("master", value), &cluster())
            .unwrap_err();
        assert!(err.is_terminal());
        let message = err.to_string();
        assert!(message.contains("instanceType: Required value"));
        assert!(message.contains("only AMI IDs are supported"));
    }

    #[test]
    fn custom_credentials_secret_is_a_warning() {
        let mut value = provider_value();
        value["credentialsSecret"] = json!({"name": "custom-creds"});
        let converted = AwsStrategy.to_capi(&machine("master", value), &cluster()).unwrap();
        assert_eq!(converted.warnings.len(), 1);
        assert!(converted.warnings[0].contains("custom-creds"));
    }

    fn spot_payload() -> Value {
        let mut value = provider_value();
        value["spotMarketOptions"] = json!({"maxPrice": "0.12"});
        value["blockDevices"][0]["ebs"]["throughput"] = json!(250);
        value
    }

    #[test]
    fn unmodeled_payload_keys_are_warned_about() {
        let converted = AwsStrategy
            .to_capi(&machine("master", spot_payload()), &cluster())
            .unwrap();

        assert_eq!(converted.warnings.len(), 2);
        assert!(converted
            .warnings
            .iter()
            .any(|w| w.contains("spec.providerSpec.value.spotMarketOptions")));
        assert!(converted
            .warnings
            .iter()
            .any(|w| w.contains("spec.providerSpec.value.blockDevices[0].ebs.throughput")));
    }

    #[test]
    fn reverse_payload_keeps_unmodeled_keys_of_current_payload() {
        let ctx = cluster();
        let forward = AwsStrategy.to_capi(&machine("master", spot_payload()), &ctx).unwrap();
        let back = AwsStrategy
            .to_mapi(&forward.machine, &forward.infra, &ctx)
            .unwrap();
        let mut desired = back.machine.spec.provider_spec.value.unwrap();
        assert!(desired.get("spotMarketOptions").is_none());

        AwsStrategy.preserve_unmodeled_fields(&spot_payload(), &mut desired);

        assert_eq!(desired["spotMarketOptions"]["maxPrice"], "0.12");
        assert_eq!(desired["blockDevices"][0]["ebs"]["throughput"], 250);
        assert_eq!(
            AwsStrategy.canonical_provider_spec(&desired),
            AwsStrategy.canonical_provider_spec(&spot_payload())
        );
    }

    #[test]
    fn converted_values_win_over_current_ones() {
        let mut current = spot_payload();
        current["instanceType"] = json!("m5.large");
        let mut desired = provider_value();
        desired["spotMarketOptions"] = json!({"maxPrice": "0.20"});

        AwsStrategy.preserve_unmodeled_fields(&current, &mut desired);

        assert_eq!(desired["instanceType"], "m6i.xlarge");
        assert_eq!(desired["spotMarketOptions"]["maxPrice"], "0.20");
    }

    #[test]
    fn control_plane_load_balancers_validate() {
        assert!(AwsStrategy
            .validate(&machine("master", provider_value()), &cluster())
            .is_ok());
    }

    #[test]
    fn workers_may_not_reference_load_balancers() {
        let err = AwsStrategy
            .validate(&machine("worker", provider_value()), &cluster())
            .unwrap_err();
        assert!(err.is_terminal());
        assert!(err
            .to_string()
            .contains("may only be attached to control plane machines"));
    }

    #[test]
    fn load_balancer_shape_errors_are_reported() {
        let mut value = provider_value();
        value["loadBalancers"] = json!([
            {"name": "ci-ext", "type": "network"},
            {"name": "ci-ext", "type": "network"},
            {"name": "ci-int", "type": "application"},
            {"name": "elsewhere", "type": "classic"}
        ]);

        let err = AwsStrategy
            .validate(&machine("master", value), &cluster())
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Duplicate value"));
        assert!(message.contains("Unsupported value: \"application\""));
        assert!(message.contains("elsewhere (classic) is not a control plane load balancer"));
        assert!(message.contains("missing control plane load balancer ci-int"));
    }

    #[test]
    fn worker_without_load_balancers_is_valid_without_cluster() {
        let mut value = provider_value();
        value.as_object_mut().unwrap().remove("loadBalancers");
        let ctx = ClusterContext {
            name: "ci".to_string(),
            ..Default::default()
        };
        assert!(AwsStrategy.validate(&machine("worker", value), &ctx).is_ok());
    }
}

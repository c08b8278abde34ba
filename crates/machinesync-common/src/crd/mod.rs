//! Resource types for both machine models
//!
//! The legacy Machine API and Cluster API CRDs are installed by their own
//! operators; these definitions only describe the fields the sync core uses.

mod capi;
mod mapi;
mod types;

pub use capi::{
    Bootstrap, CapiCluster, CapiClusterSpec, CapiMachine, CapiMachineSet, CapiMachineSetSpec,
    CapiMachineSpec, CapiMachineStatus, CAPI_API_VERSION, CAPI_DOMAIN_PREFIX, CAPI_GROUP,
    CAPI_MACHINE_FINALIZER, CLUSTER_NAME_LABEL, CONTROL_PLANE_LABEL, INFRA_FINALIZER_SUFFIX,
    PAUSED_ANNOTATION,
};
pub use mapi::{
    MapiMachine, MapiMachineSet, MapiMachineSetSpec, MapiMachineSpec, MapiMachineStatus,
    ProviderSpec, MAPI_API_VERSION, MAPI_CLUSTER_LABEL, MAPI_DOMAIN_PREFIX, MAPI_GROUP,
    MAPI_MACHINE_FINALIZER, MAPI_ROLE_LABEL, MAPI_TYPE_LABEL,
};
pub use types::{
    find_condition, AuthoritativeApi, Condition, ConditionSeverity, ConditionStatus,
    MachineAddress,
};

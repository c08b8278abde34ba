//! Common types for machine sync: resource models, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod leader_election;
pub mod meta;
pub mod telemetry;

pub use error::Error;

/// Finalizer the sync controller places on every object it links
pub const SYNC_FINALIZER: &str = "sync.machine.openshift.io/finalizer";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "machinesync-controller";

/// Controller name reported on Events
pub const CONTROLLER_NAME: &str = "machine-sync-controller";

/// Default namespace of the legacy machine model
pub const DEFAULT_MAPI_NAMESPACE: &str = "openshift-machine-api";

/// Default namespace of the Cluster API model
pub const DEFAULT_CAPI_NAMESPACE: &str = "openshift-cluster-api";

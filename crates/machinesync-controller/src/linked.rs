//! The linked triple: legacy machine, CAPI machine, infrastructure machine
//!
//! The three objects are correlated only by name. Every procedure works from
//! one freshly loaded [`LinkedMachines`], so absence is always an explicit
//! `None` and never a nil-check deep in a sync step.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;

use machinesync_common::crd::{CapiMachine, MapiMachine};
use machinesync_common::Error;

use crate::client::{LinkedKind, MachineClient};

/// Which model is authoritative for a sync pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Legacy machine is authoritative, the CAPI machine and infrastructure machine mirror it
    MapiToCapi,
    /// CAPI machine (with its infrastructure machine) is authoritative, the legacy machine mirrors it
    CapiToMapi,
}

impl Direction {
    /// The machine whose spec wins
    pub fn authoritative(self) -> LinkedKind {
        match self {
            Self::MapiToCapi => LinkedKind::MapiMachine,
            Self::CapiToMapi => LinkedKind::CapiMachine,
        }
    }

    /// The machine written by this pass
    pub fn mirror(self) -> LinkedKind {
        match self {
            Self::MapiToCapi => LinkedKind::CapiMachine,
            Self::CapiToMapi => LinkedKind::MapiMachine,
        }
    }

    /// True if the infrastructure machine is written by this pass
    pub fn mirrors_infra(self) -> bool {
        self == Self::MapiToCapi
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MapiToCapi => write!(f, "MAPI->CAPI"),
            Self::CapiToMapi => write!(f, "CAPI->MAPI"),
        }
    }
}

/// One logical machine as seen in both models
#[derive(Clone, Debug, Default)]
pub struct LinkedMachines {
    /// Shared name of all three objects
    pub name: String,
    /// Legacy machine, if present
    pub mapi: Option<MapiMachine>,
    /// CAPI machine, if present
    pub capi: Option<CapiMachine>,
    /// Infrastructure machine, if present
    pub infra: Option<DynamicObject>,
}

impl LinkedMachines {
    /// Load both machine objects; the infrastructure machine is loaded separately
    /// by [`LinkedMachines::load_infra`] so its failure can be reported on its own
    pub async fn load_machines(client: &dyn MachineClient, name: &str) -> Result<Self, Error> {
        let mapi = client.get_mapi_machine(name).await?;
        let capi = client.get_capi_machine(name).await?;
        Ok(Self {
            name: name.to_string(),
            mapi,
            capi,
            infra: None,
        })
    }

    /// Load the infrastructure machine referenced by the CAPI machine
    pub async fn load_infra(&mut self, client: &dyn MachineClient) -> Result<(), Error> {
        let infra_name = self.infra_name().to_string();
        self.infra = client.get_infra_machine(&infra_name).await?;
        Ok(())
    }

    /// Name of the infrastructure machine: the CAPI machine's reference, or the
    /// shared name when no CAPI machine exists yet
    pub fn infra_name(&self) -> &str {
        self.capi
            .as_ref()
            .and_then(|c| c.spec.infrastructure_ref.name.as_deref())
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.name)
    }

    /// Store name of one member of the triple
    pub fn name_of(&self, kind: LinkedKind) -> &str {
        match kind {
            LinkedKind::InfraMachine => self.infra_name(),
            _ => &self.name,
        }
    }

    /// Metadata of one member of the triple, if present
    pub fn meta(&self, kind: LinkedKind) -> Option<&ObjectMeta> {
        match kind {
            LinkedKind::MapiMachine => self.mapi.as_ref().map(|m| &m.metadata),
            LinkedKind::CapiMachine => self.capi.as_ref().map(|m| &m.metadata),
            LinkedKind::InfraMachine => self.infra.as_ref().map(|m| &m.metadata),
        }
    }
}

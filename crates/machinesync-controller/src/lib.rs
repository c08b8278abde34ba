//! Machine sync core
//!
//! Keeps a legacy Machine API machine and its Cluster API counterpart (plus the
//! platform infrastructure machine) consistent, in whichever direction the
//! authority field says, and tears all of them down together.

pub mod client;
pub mod conditions;
pub mod controller;
pub mod deletion;
pub mod diff;
pub mod linked;
pub mod ownership;
pub mod platform;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{KubeMachineClient, LinkedKind, MachineClient};
pub use controller::{error_policy, reconcile, reconcile_capi, Context, SyncConfig};
pub use platform::{strategy_for, Platform, PlatformStrategy};

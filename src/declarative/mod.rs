//! Declarative reconciliation engine
//!
//! Given an owner and an ordered list of builders, the engine drives the
//! object store toward the desired objects, tags everything it touches with
//! a component id, purges what the component no longer produces and can wait
//! for the result to become observable.
//!
//! Layers, leaves first:
//! - [`policy`]: desired state (`Created`/`Present`/`Absent`) and lifecycle hooks
//! - [`diff`]: three-way patch computation and the last-applied snapshot
//! - [`resource`]: the per-object state machine
//! - [`component`]: component ids, ownership annotations, owner references
//! - [`purge`]: type-based orphan deletion
//! - [`inventory`]: record-based orphan deletion for dynamic type sets
//! - [`readiness`]: condition polling on top of [`crate::backoff::Backoff`]
//! - [`orchestrator`]: one full pass for an (owner, component) pair

pub mod component;
pub mod diff;
pub mod inventory;
pub mod orchestrator;
pub mod policy;
pub mod purge;
pub mod readiness;
pub mod resource;

pub use component::{ComponentId, ResourceOwner, MANAGED_BY_ANNOTATION, RELATED_TO_ANNOTATION};
pub use diff::LAST_APPLIED_ANNOTATION;
pub use inventory::{ConfigMapInventory, InventoryStore, InventoryTracker, RecordKey};
pub use orchestrator::{
    ObjectModifier, ObjectState, ReconcileReport, ReconciledObject, Reconciler, ReconcilerOptions,
};
pub use policy::{
    Builder, DesiredObject, DesiredState, DesiredStatePolicy, PolicyChain, PreserveClusterIp,
    PreserveServiceAccountSecrets,
};
pub use purge::{purge_orphans, PurgeReport};
pub use readiness::{wait_for, Condition};
pub use resource::{Reconciled, RecreatePolicy, ResourceOutcome, ResourceReconciler};

use kube::core::DynamicObject;
use serde::Serialize;

use crate::error::Result;

/// Convert any typed Kubernetes object into a [`DynamicObject`]
pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

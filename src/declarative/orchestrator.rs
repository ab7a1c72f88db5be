//! One reconciliation pass for an (owner, component) pair
//!
//! 1. build every desired object, isolating builder failures
//! 2. tag, attach owner references, apply modifiers and run the state machine
//! 3. purge orphans of the listed types, only when nothing failed
//! 4. optionally wait for present objects to be ready and removed ones to be gone
//!
//! Every error is collected into the [`ReconcileReport`]; the pass never stops
//! at the first failure.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kube::core::{DynamicObject, GroupVersionKind};
use tracing::{debug, error, info, instrument, warn};

use super::component::{self, ComponentId, ResourceOwner};
use super::policy::{Builder, DesiredObject, DesiredState};
use super::purge::purge_orphans;
use super::readiness::{wait_for, Condition};
use super::resource::{Reconciled, RecreatePolicy, ResourceOutcome, ResourceReconciler, SCHEMA_WAIT};
use crate::backoff::Backoff;
use crate::error::{Error, Errors, Result};
use crate::store::{gvk_of, ObjectKey, ObjectStore};

/// Last-chance mutation applied to every desired object before it is reconciled
pub type ObjectModifier = Arc<dyn Fn(&mut DynamicObject) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct ReconcilerOptions {
    /// Point controller references at the owner where scoping allows
    pub owner_references: bool,
    pub recreate: RecreatePolicy,
    /// Readiness budget; `None` skips the readiness phase
    pub readiness: Option<Backoff>,
    /// Poll budget after creating a schema definition
    pub schema_wait: Backoff,
    pub modifiers: Vec<ObjectModifier>,
    pub field_manager: Option<String>,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            owner_references: false,
            recreate: RecreatePolicy::Never,
            readiness: None,
            schema_wait: SCHEMA_WAIT,
            modifiers: Vec::new(),
            field_manager: None,
        }
    }
}

impl fmt::Debug for ReconcilerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcilerOptions")
            .field("owner_references", &self.owner_references)
            .field("recreate", &self.recreate)
            .field("readiness", &self.readiness)
            .field("schema_wait", &self.schema_wait)
            .field("modifiers", &self.modifiers.len())
            .field("field_manager", &self.field_manager)
            .finish()
    }
}

/// Where an object ended up after a pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectState {
    Present,
    Absent,
    Purged,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconciledObject {
    pub key: ObjectKey,
    pub state: ObjectState,
    /// `None` for purged objects
    pub outcome: Option<ResourceOutcome>,
}

/// Aggregate result of one pass
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub objects: Vec<ReconciledObject>,
    pub errors: Vec<Error>,
    /// Shortest requeue hint raised by any object
    pub requeue_after: Option<Duration>,
}

impl ReconcileReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    fn requeue(&mut self, after: Duration) {
        self.requeue_after = Some(self.requeue_after.map_or(after, |d| d.min(after)));
    }

    pub fn keys(&self, state: ObjectState) -> Vec<&ObjectKey> {
        self.objects
            .iter()
            .filter(|o| o.state == state)
            .map(|o| &o.key)
            .collect()
    }

    /// Number of objects the pass wrote to the store
    pub fn mutations(&self) -> usize {
        self.objects
            .iter()
            .filter(|o| o.state == ObjectState::Purged || o.outcome.as_ref().is_some_and(ResourceOutcome::mutated))
            .count()
    }

    /// The requeue hint, or every collected error
    pub fn into_result(self) -> Result<Option<Duration>> {
        let Self {
            mut errors,
            requeue_after,
            ..
        } = self;
        match errors.len() {
            0 => Ok(requeue_after),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(Errors::new(errors))),
        }
    }
}

/// Drives components of owners against one object store
pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    resources: ResourceReconciler,
    options: ReconcilerOptions,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ObjectStore>, options: ReconcilerOptions) -> Self {
        let resources = ResourceReconciler::new(store.clone())
            .with_recreate(options.recreate.clone())
            .with_schema_wait(options.schema_wait.clone())
            .with_field_manager(options.field_manager.clone());
        Self {
            store,
            resources,
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// The per-object state machine this reconciler uses
    pub fn resources(&self) -> &ResourceReconciler {
        &self.resources
    }

    pub fn options(&self) -> &ReconcilerOptions {
        &self.options
    }

    /// Run one pass: build, apply, purge `purge_types`, then optionally wait
    #[instrument(skip_all, fields(owner = %owner, component))]
    pub async fn reconcile(
        &self,
        owner: &ResourceOwner,
        component: &str,
        builders: &[Box<dyn Builder>],
        purge_types: &[GroupVersionKind],
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let id = match ComponentId::new(owner, component) {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "cannot reconcile component");
                report.errors.push(e);
                return report;
            }
        };

        let mut produced = HashSet::new();
        for (index, builder) in builders.iter().enumerate() {
            let desired = match builder.build() {
                Ok(desired) => desired,
                Err(e) => {
                    warn!(index, error = %e, "builder failed");
                    report.errors.push(Error::Builder {
                        component: component.to_string(),
                        index,
                        source: Box::new(e),
                    });
                    continue;
                }
            };

            let state = match desired.state() {
                DesiredState::Absent => ObjectState::Absent,
                DesiredState::Created | DesiredState::Present => ObjectState::Present,
            };
            match self.apply(owner, &id, desired).await {
                Ok(done) => {
                    if let Some(after) = done.outcome.requeue_after() {
                        report.requeue(after);
                    }
                    produced.insert(done.key.clone());
                    report.objects.push(ReconciledObject {
                        key: done.key,
                        state,
                        outcome: Some(done.outcome),
                    });
                }
                Err(e) => {
                    warn!(index, error = %e, "failed to reconcile object");
                    report.errors.push(e);
                }
            }
        }

        if report.errors.is_empty() {
            let purged = purge_orphans(&*self.store, &id, purge_types, &produced).await;
            report.objects.extend(purged.purged.into_iter().map(|key| ReconciledObject {
                key,
                state: ObjectState::Purged,
                outcome: None,
            }));
            report.errors.extend(purged.errors);
        } else {
            warn!(errors = report.errors.len(), "skipping purge after failures");
        }

        if let Some(backoff) = &self.options.readiness {
            self.wait_ready(&mut report, backoff).await;
        }

        info!(
            objects = report.objects.len(),
            mutations = report.mutations(),
            errors = report.errors.len(),
            requeue_after = ?report.requeue_after,
            "component reconciled"
        );
        report
    }

    /// Tag, own, modify, then hand the object to the state machine
    async fn apply(
        &self,
        owner: &ResourceOwner,
        id: &ComponentId,
        desired: DesiredObject,
    ) -> Result<Reconciled> {
        let DesiredObject { mut object, policy } = desired;
        component::tag(&mut object, id, owner)?;

        if self.options.owner_references {
            if let Some(gvk) = gvk_of(&object) {
                match self.store.scope(&gvk).await {
                    Ok(scope) => {
                        if !component::set_owner_reference(&mut object, owner, scope) {
                            debug!(kind = %gvk.kind, "owner reference not applicable");
                        }
                    }
                    Err(e) => debug!(kind = %gvk.kind, error = %e, "scope unknown, no owner reference"),
                }
            }
        }

        for modifier in &self.options.modifiers {
            modifier(&mut object)?;
        }

        self.resources
            .reconcile(DesiredObject { object, policy })
            .await
    }

    async fn wait_ready(&self, report: &mut ReconcileReport, backoff: &Backoff) {
        let settled = |o: &&ReconciledObject| match &o.outcome {
            None => true,
            Some(outcome) => !matches!(outcome, ResourceOutcome::Skipped) && outcome.requeue_after().is_none(),
        };
        let present: Vec<ObjectKey> = report
            .objects
            .iter()
            .filter(|o| o.state == ObjectState::Present)
            .filter(settled)
            .map(|o| o.key.clone())
            .collect();
        let gone: Vec<ObjectKey> = report
            .objects
            .iter()
            .filter(|o| o.state != ObjectState::Present)
            .filter(settled)
            .map(|o| o.key.clone())
            .collect();

        let store = &*self.store;
        if let Err(e) = wait_for(
            store,
            "present",
            &present,
            &[Condition::Exists, Condition::ReplicasReady],
            backoff,
        )
        .await
        {
            report.errors.push(e);
        }
        if let Err(e) = wait_for(store, "absent", &gone, &[Condition::NotFound], backoff).await {
            report.errors.push(e);
        }
    }
}

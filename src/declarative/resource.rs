//! Per-object state machine
//!
//! Drives one desired object toward its [`DesiredState`]:
//!
//! - `Created`: create when absent, otherwise leave untouched
//! - `Present`: create when absent, otherwise merge metadata, diff, update
//! - `Absent`: delete when present
//!
//! Objects that are already terminating are never written; the caller gets a
//! requeue hint instead. Updates rejected for touching immutable fields can be
//! answered with a foreground delete when the [`RecreatePolicy`] allows it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kube::core::{DynamicObject, GroupVersionKind};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::component::MANAGED_BY_ANNOTATION;
use super::diff;
use super::policy::{DesiredObject, DesiredState, DesiredStatePolicy};
use crate::backoff::Backoff;
use crate::error::{Error, Result, StoreError};
use crate::metrics;
use crate::store::{
    describe, is_terminating, kinds, DeleteOptions, ObjectKey, ObjectStore,
    ResourceScope, WriteOptions,
};

/// Requeue hint when the object is being deleted by someone else
pub const TERMINATING_REQUEUE: Duration = Duration::from_secs(5);

/// Requeue hint after deleting an object so it can be recreated
pub const RECREATE_REQUEUE: Duration = Duration::from_secs(10);

/// Poll budget for a freshly created schema definition to become usable
pub const SCHEMA_WAIT: Backoff = Backoff::fixed(Duration::from_millis(500), 20);

/// What the state machine did to one object
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceOutcome {
    Created,
    Updated,
    InSync,
    /// A policy gate declined the operation
    Skipped,
    Deleted,
    AlreadyAbsent,
    Terminating { requeue_after: Duration },
    Recreating { requeue_after: Duration },
}

impl ResourceOutcome {
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            ResourceOutcome::Terminating { requeue_after }
            | ResourceOutcome::Recreating { requeue_after } => Some(*requeue_after),
            _ => None,
        }
    }

    /// Whether the store was written to
    pub fn mutated(&self) -> bool {
        matches!(
            self,
            ResourceOutcome::Created
                | ResourceOutcome::Updated
                | ResourceOutcome::Deleted
                | ResourceOutcome::Recreating { .. }
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceOutcome::Created => "created",
            ResourceOutcome::Updated => "updated",
            ResourceOutcome::InSync => "in_sync",
            ResourceOutcome::Skipped => "skipped",
            ResourceOutcome::Deleted => "deleted",
            ResourceOutcome::AlreadyAbsent => "already_absent",
            ResourceOutcome::Terminating { .. } => "terminating",
            ResourceOutcome::Recreating { .. } => "recreating",
        }
    }
}

type RecreatePredicate = dyn Fn(&GroupVersionKind, &str) -> bool + Send + Sync;

/// Decides whether an update rejected as immutable may be answered by delete-and-recreate
#[derive(Clone, Default)]
pub enum RecreatePolicy {
    /// Immutable-field rejections are always fatal
    #[default]
    Never,
    /// Recreate the listed kinds when the rejection message matches
    Matching { kinds: Vec<String>, message: Regex },
    Custom(Arc<RecreatePredicate>),
}

impl RecreatePolicy {
    /// Workload and Service kinds, matching any message mentioning immutability
    pub fn allow_list() -> Self {
        Self::Matching {
            kinds: ["Service", "Deployment", "StatefulSet", "DaemonSet"]
                .into_iter()
                .map(String::from)
                .collect(),
            message: IMMUTABLE.clone(),
        }
    }

    pub fn matching(kinds: Vec<String>, pattern: &str) -> Result<Self> {
        let message = Regex::new(pattern)
            .map_err(|e| Error::validation(format!("invalid recreate pattern '{}': {}", pattern, e)))?;
        Ok(Self::Matching { kinds, message })
    }

    pub fn custom(predicate: impl Fn(&GroupVersionKind, &str) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(predicate))
    }

    pub fn allows(&self, gvk: &GroupVersionKind, message: &str) -> bool {
        match self {
            RecreatePolicy::Never => false,
            RecreatePolicy::Matching { kinds, message: pattern } => {
                kinds.iter().any(|k| k == &gvk.kind) && pattern.is_match(message)
            }
            RecreatePolicy::Custom(predicate) => predicate(gvk, message),
        }
    }
}

impl fmt::Debug for RecreatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecreatePolicy::Never => write!(f, "Never"),
            RecreatePolicy::Matching { kinds, message } => f
                .debug_struct("Matching")
                .field("kinds", kinds)
                .field("message", &message.as_str())
                .finish(),
            RecreatePolicy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

lazy_static::lazy_static! {
    static ref IMMUTABLE: Regex = Regex::new(r"(?i)immutable").unwrap();
}

/// Result of one state machine run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reconciled {
    /// Key after scope normalization
    pub key: ObjectKey,
    pub outcome: ResourceOutcome,
}

/// Applies a single desired object to the store
pub struct ResourceReconciler {
    store: Arc<dyn ObjectStore>,
    recreate: RecreatePolicy,
    schema_wait: Backoff,
    field_manager: Option<String>,
}

impl ResourceReconciler {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            recreate: RecreatePolicy::Never,
            schema_wait: SCHEMA_WAIT,
            field_manager: None,
        }
    }

    #[must_use]
    pub fn with_recreate(mut self, recreate: RecreatePolicy) -> Self {
        self.recreate = recreate;
        self
    }

    #[must_use]
    pub fn with_schema_wait(mut self, backoff: Backoff) -> Self {
        self.schema_wait = backoff;
        self
    }

    #[must_use]
    pub fn with_field_manager(mut self, field_manager: Option<String>) -> Self {
        self.field_manager = field_manager;
        self
    }

    /// Drive one object to its desired state
    pub async fn reconcile(&self, desired: DesiredObject) -> Result<Reconciled> {
        let DesiredObject { mut object, policy } = desired;
        let key = self.scoped_key(&mut object).await?;

        let outcome = match policy.desired_state() {
            DesiredState::Created => self.ensure_created(&key, object, &*policy).await,
            DesiredState::Present => self.ensure_present(&key, object, &*policy).await,
            DesiredState::Absent => self.ensure_absent(&key, &*policy).await,
        }?;

        metrics::record_object_operation(&key.kind, outcome.as_str());
        Ok(Reconciled { key, outcome })
    }

    /// Key of the object, dropping the namespace of cluster-scoped types
    async fn scoped_key(&self, object: &mut DynamicObject) -> Result<ObjectKey> {
        let key = ObjectKey::from_object(object).map_err(|e| Error::store("reconcile", describe(object), e))?;
        match self.store.scope(&key.gvk()).await {
            Ok(ResourceScope::Cluster) if key.namespace.is_some() => {
                object.metadata.namespace = None;
                Ok(key.with_namespace(None))
            }
            _ => Ok(key),
        }
    }

    async fn fetch(&self, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        match self.store.get(key).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(Error::store("get", key, e)),
        }
    }

    async fn ensure_created(
        &self,
        key: &ObjectKey,
        object: DynamicObject,
        policy: &dyn DesiredStatePolicy,
    ) -> Result<ResourceOutcome> {
        if self.fetch(key).await?.is_some() {
            debug!(object = %key, "already exists, create-only object left untouched");
            return Ok(ResourceOutcome::InSync);
        }
        self.create(key, object, policy).await
    }

    async fn create(
        &self,
        key: &ObjectKey,
        mut object: DynamicObject,
        policy: &dyn DesiredStatePolicy,
    ) -> Result<ResourceOutcome> {
        policy.before_create(&mut object)?;
        if !policy.should_create(&object)? {
            info!(object = %key, "create declined by policy");
            return Ok(ResourceOutcome::Skipped);
        }

        let mut opts = WriteOptions {
            field_manager: self.field_manager.clone(),
            ..Default::default()
        };
        policy.create_options(&mut opts);
        diff::stamp_last_applied(&mut object)?;

        self.store
            .create(&object, &opts)
            .await
            .map_err(|e| Error::store("create", key, e))?;
        info!(object = %key, dry_run = opts.dry_run, "created");

        if kinds::is_crd(&key.gvk()) && !opts.dry_run {
            self.wait_for_defined_type(key, &object).await?;
        }
        Ok(ResourceOutcome::Created)
    }

    async fn ensure_present(
        &self,
        key: &ObjectKey,
        mut object: DynamicObject,
        policy: &dyn DesiredStatePolicy,
    ) -> Result<ResourceOutcome> {
        let Some(current) = self.fetch(key).await? else {
            return self.create(key, object, policy).await;
        };

        if is_terminating(&current) {
            info!(object = %key, "object is terminating, waiting before reconciling it");
            return Ok(ResourceOutcome::Terminating {
                requeue_after: TERMINATING_REQUEUE,
            });
        }

        guard_tagging(key, &current, &mut object)?;
        merge_metadata(&current, &mut object);

        if !policy.should_update(&current, &object)? {
            debug!(object = %key, "update declined by policy");
            return Ok(ResourceOutcome::Skipped);
        }
        policy.before_update(&current, &mut object)?;

        let original = diff::last_applied(&current);
        let modified = diff::normalize(&object)?;
        let live = diff::normalize(&current)?;
        let Some(patch) = diff::compute_patch(original.as_ref(), &modified, &live) else {
            debug!(object = %key, "in sync");
            return Ok(ResourceOutcome::InSync);
        };
        debug!(object = %key, %patch, "object differs from desired state");

        diff::stamp_last_applied(&mut object)?;
        object.metadata.resource_version = current.metadata.resource_version.clone();
        let mut opts = WriteOptions {
            field_manager: self.field_manager.clone(),
            ..Default::default()
        };
        policy.update_options(&mut opts);

        match self.store.update(&object, &opts).await {
            Ok(_) => {
                info!(object = %key, dry_run = opts.dry_run, "updated");
                Ok(ResourceOutcome::Updated)
            }
            Err(StoreError::Conflict { reason, message }) => {
                self.on_rejected_update(key, &current, reason, message).await
            }
            Err(e) => Err(Error::store("update", key, e)),
        }
    }

    async fn on_rejected_update(
        &self,
        key: &ObjectKey,
        current: &DynamicObject,
        reason: String,
        message: String,
    ) -> Result<ResourceOutcome> {
        let gvk = key.gvk();
        if self.recreate.allows(&gvk, &message) {
            warn!(object = %key, %message, "update rejected, deleting object so it can be recreated");
            return match self.store.delete(current, &DeleteOptions::foreground()).await {
                Ok(()) => Ok(ResourceOutcome::Recreating {
                    requeue_after: RECREATE_REQUEUE,
                }),
                Err(e) if e.is_not_found() => Ok(ResourceOutcome::Recreating {
                    requeue_after: RECREATE_REQUEUE,
                }),
                Err(e) => Err(Error::store("delete", key, e)),
            };
        }

        if IMMUTABLE.is_match(&message) {
            return Err(Error::ImmutableField {
                key: key.to_string(),
                message,
            });
        }
        Err(Error::store("update", key, StoreError::Conflict { reason, message }))
    }

    async fn ensure_absent(&self, key: &ObjectKey, policy: &dyn DesiredStatePolicy) -> Result<ResourceOutcome> {
        let current = match self.store.get(key).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() || e.is_type_unknown() => {
                debug!(object = %key, "already absent");
                return Ok(ResourceOutcome::AlreadyAbsent);
            }
            Err(e) => return Err(Error::store("get", key, e)),
        };

        policy.before_delete(&current)?;
        if !policy.should_delete(&current)? {
            info!(object = %key, "delete declined by policy");
            return Ok(ResourceOutcome::Skipped);
        }

        let mut opts = DeleteOptions::default();
        policy.delete_options(&mut opts);
        match self.store.delete(&current, &opts).await {
            Ok(()) => {
                info!(object = %key, dry_run = opts.dry_run, "deleted");
                Ok(ResourceOutcome::Deleted)
            }
            Err(e) if e.is_not_found() => Ok(ResourceOutcome::AlreadyAbsent),
            Err(e) => Err(Error::store("delete", key, e)),
        }
    }

    /// Poll the type a schema definition introduces until the store serves it
    async fn wait_for_defined_type(&self, key: &ObjectKey, crd: &DynamicObject) -> Result<()> {
        let Some(defined) = defined_type(crd) else {
            warn!(object = %key, "schema definition does not name a served version, not waiting");
            return Ok(());
        };
        debug!(object = %key, kind = %defined.kind, "waiting for defined type to be served");

        let store = &*self.store;
        let defined = &defined;
        self.schema_wait
            .retry(|_| async move {
                match store.list(defined).await {
                    Ok(_) => Ok(()),
                    Err(e) => Err(e.to_string()),
                }
            })
            .await
            .map_err(|exhausted| Error::ReadinessTimeout {
                phase: "schema-definition".to_string(),
                key: key.to_string(),
                attempts: exhausted.attempts,
                last: exhausted.last,
            })
    }
}

/// Type a CRD object defines: its storage version, else the first served one
fn defined_type(crd: &DynamicObject) -> Option<GroupVersionKind> {
    let spec = crd.data.get("spec")?;
    let group = spec.get("group")?.as_str()?;
    let kind = spec.pointer("/names/kind")?.as_str()?;
    let versions = spec.get("versions")?.as_array()?;
    let flag = |v: &Value, name: &str| v.get(name).and_then(Value::as_bool).unwrap_or(false);
    let version = versions
        .iter()
        .find(|v| flag(v, "storage"))
        .or_else(|| versions.iter().find(|v| flag(v, "served")))?
        .get("name")?
        .as_str()?;
    Some(GroupVersionKind::gvk(group, version, kind))
}

/// Refuse to take over objects tagged by another component; never adopt untagged ones
fn guard_tagging(key: &ObjectKey, current: &DynamicObject, desired: &mut DynamicObject) -> Result<()> {
    let existing = current
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(MANAGED_BY_ANNOTATION));
    let requested = desired
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(MANAGED_BY_ANNOTATION));

    match (existing, requested) {
        (Some(existing), Some(requested)) if existing != requested => Err(Error::TaggingConflict {
            key: key.to_string(),
            existing: existing.clone(),
            requested: requested.clone(),
        }),
        (None, Some(_)) => {
            debug!(object = %key, "existing object is not tagged, leaving it unclaimed");
            if let Some(annotations) = desired.metadata.annotations.as_mut() {
                annotations.remove(MANAGED_BY_ANNOTATION);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Keep labels and annotations other writers put on the live object.
///
/// A key survives when desired does not set it and it is not in our last
/// snapshot; keys in the snapshot but missing from desired were cleared by us.
fn merge_metadata(current: &DynamicObject, desired: &mut DynamicObject) {
    let snapshot = diff::last_applied(current);
    let applied = |field: &str| {
        snapshot
            .as_ref()
            .and_then(|s| s.pointer(&format!("/metadata/{}", field)))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    };

    merge_map(
        current.metadata.labels.as_ref(),
        &mut desired.metadata.labels,
        &applied("labels"),
    );
    merge_map(
        current.metadata.annotations.as_ref(),
        &mut desired.metadata.annotations,
        &applied("annotations"),
    );
}

fn merge_map(
    live: Option<&BTreeMap<String, String>>,
    want: &mut Option<BTreeMap<String, String>>,
    applied: &serde_json::Map<String, Value>,
) {
    let Some(live) = live else {
        return;
    };
    for (k, v) in live {
        if k == diff::LAST_APPLIED_ANNOTATION || applied.contains_key(k) {
            continue;
        }
        let target = want.get_or_insert_with(Default::default);
        if !target.contains_key(k) {
            target.insert(k.clone(), v.clone());
        }
    }
}

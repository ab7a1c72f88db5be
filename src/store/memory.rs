//! In-memory object store
//!
//! Behaves like a small API server: version tokens with stale-write rejection,
//! finalizer-aware deletes, immutable fields, CRDs that register the types
//! they define. Used by the test-suite and for dry simulations.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use super::{
    api_version, kinds, DeleteOptions, ObjectKey, ObjectStore, ResourceScope, ScopeCache,
    WriteOptions,
};
use crate::error::{StoreError, StoreResult};

/// Store call kinds, used for fault injection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    List,
    Create,
    Update,
    Delete,
}

struct ImmutableField {
    group: String,
    kind: String,
    pointer: String,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    version: u64,
    mutations: u64,
    immutable: Vec<ImmutableField>,
    failures: HashMap<(Operation, ObjectKey), String>,
    list_failures: HashMap<(String, String, String), String>,
}

/// Object store kept entirely in process memory
pub struct MemoryStore {
    scopes: ScopeCache,
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store that serves the built-in Kubernetes kinds
    pub fn new() -> Self {
        Self {
            scopes: ScopeCache::new(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Store that serves nothing until types are registered
    pub fn without_builtins() -> Self {
        Self {
            scopes: ScopeCache::empty(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Serve an additional type
    pub fn register(&self, gvk: &GroupVersionKind, scope: ResourceScope) {
        self.scopes.insert(gvk, ApiResource::from_gvk(gvk), scope);
    }

    /// Stop serving a previously registered type
    pub fn unregister(&self, gvk: &GroupVersionKind) {
        self.scopes.remove(gvk);
    }

    /// Reject updates that change the value at `pointer` for this type
    pub fn add_immutable_field(&self, gvk: &GroupVersionKind, pointer: &str) {
        self.inner.lock().immutable.push(ImmutableField {
            group: gvk.group.clone(),
            kind: gvk.kind.clone(),
            pointer: pointer.to_string(),
        });
    }

    /// Make every `operation` on `key` fail with a backend error
    pub fn fail(&self, operation: Operation, key: &ObjectKey, message: &str) {
        self.inner
            .lock()
            .failures
            .insert((operation, key.clone()), message.to_string());
    }

    /// Make every list of `gvk` fail with a backend error
    pub fn fail_list(&self, gvk: &GroupVersionKind, message: &str) {
        self.inner.lock().list_failures.insert(
            (gvk.group.clone(), gvk.version.clone(), gvk.kind.clone()),
            message.to_string(),
        );
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) {
        let mut inner = self.inner.lock();
        inner.failures.clear();
        inner.list_failures.clear();
    }

    /// Number of create/update/delete calls that changed the store
    pub fn mutations(&self) -> u64 {
        self.inner.lock().mutations
    }

    /// Seed an object without counting it as a mutation
    pub fn insert(&self, obj: DynamicObject) -> StoreResult<DynamicObject> {
        self.create_object(obj, false, false)
    }

    /// Apply a change as another actor would (status writers, other controllers)
    pub fn modify<F>(&self, key: &ObjectKey, f: F) -> StoreResult<DynamicObject>
    where
        F: FnOnce(&mut DynamicObject),
    {
        let key = self.normalize(key.clone())?;
        let mut inner = self.inner.lock();
        let version = next_version(&mut inner);
        let obj = inner
            .objects
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        f(obj);
        obj.metadata.resource_version = Some(version.to_string());
        Ok(obj.clone())
    }

    /// Current copy of an object
    pub fn object(&self, key: &ObjectKey) -> Option<DynamicObject> {
        let key = self.normalize(key.clone()).ok()?;
        self.inner.lock().objects.get(&key).cloned()
    }

    /// Whether an object exists
    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.object(key).is_some()
    }

    /// All stored objects of a type
    pub fn objects(&self, gvk: &GroupVersionKind) -> Vec<DynamicObject> {
        self.inner
            .lock()
            .objects
            .iter()
            .filter(|(key, _)| same_type(key, gvk))
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    /// Check the key's type is served and fix up its namespace for the type's scope
    fn normalize(&self, key: ObjectKey) -> StoreResult<ObjectKey> {
        let gvk = key.gvk();
        match self.scopes.scope(&gvk) {
            None => Err(StoreError::TypeUnknown(format!(
                "{}/{}",
                key.api_version(),
                key.kind
            ))),
            Some(ResourceScope::Cluster) => Ok(key.with_namespace(None)),
            Some(ResourceScope::Namespaced) if key.namespace.is_none() => Err(
                StoreError::Invalid(format!("{} is namespaced but has no namespace", key)),
            ),
            Some(ResourceScope::Namespaced) => Ok(key),
        }
    }

    fn injected(&self, operation: Operation, key: &ObjectKey) -> StoreResult<()> {
        match self.inner.lock().failures.get(&(operation, key.clone())) {
            Some(message) => Err(StoreError::Backend(message.clone())),
            None => Ok(()),
        }
    }

    fn create_object(
        &self,
        mut obj: DynamicObject,
        dry_run: bool,
        count: bool,
    ) -> StoreResult<DynamicObject> {
        let key = self.normalize(ObjectKey::from_object(&obj)?)?;
        self.injected(Operation::Create, &key)?;

        let mut inner = self.inner.lock();
        if inner.objects.contains_key(&key) {
            return Err(StoreError::Conflict {
                reason: "AlreadyExists".to_string(),
                message: format!("{} already exists", key),
            });
        }

        obj.metadata.namespace = key.namespace.clone();
        obj.metadata.deletion_timestamp = None;
        if dry_run {
            return Ok(obj);
        }

        let version = next_version(&mut inner);
        obj.metadata.resource_version = Some(version.to_string());
        obj.metadata.uid = Some(format!("00000000-0000-4000-8000-{:012}", version));
        obj.metadata.creation_timestamp = Some(Time(Utc::now()));
        obj.metadata.generation = Some(1);
        if count {
            inner.mutations += 1;
        }
        inner.objects.insert(key.clone(), obj.clone());
        drop(inner);

        if kinds::is_crd(&key.gvk()) {
            self.register_defined_types(&obj);
        }
        debug!(key = %key, "memory store created object");
        Ok(obj)
    }

    /// Serve the kinds declared by a CustomResourceDefinition
    fn register_defined_types(&self, crd: &DynamicObject) {
        let spec = &crd.data["spec"];
        let group = spec["group"].as_str().unwrap_or_default();
        let kind = spec["names"]["kind"].as_str().unwrap_or_default();
        let plural = spec["names"]["plural"].as_str().unwrap_or_default();
        let scope = match spec["scope"].as_str() {
            Some("Cluster") => ResourceScope::Cluster,
            _ => ResourceScope::Namespaced,
        };
        let versions = spec["versions"].as_array().cloned().unwrap_or_default();
        for version in versions {
            if version["served"].as_bool() == Some(false) {
                continue;
            }
            let Some(name) = version["name"].as_str() else {
                continue;
            };
            let gvk = GroupVersionKind::gvk(group, name, kind);
            let resource = ApiResource {
                group: group.to_string(),
                version: name.to_string(),
                api_version: api_version(group, name),
                kind: kind.to_string(),
                plural: plural.to_string(),
            };
            self.scopes.insert(&gvk, resource, scope);
        }
    }

    fn update_object(&self, obj: &DynamicObject, dry_run: bool) -> StoreResult<DynamicObject> {
        let key = self.normalize(ObjectKey::from_object(obj)?)?;
        self.injected(Operation::Update, &key)?;

        let mut inner = self.inner.lock();
        let existing = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        match obj.metadata.resource_version.as_deref() {
            None | Some("") => {
                return Err(StoreError::Conflict {
                    reason: "Invalid".to_string(),
                    message: format!(
                        "{} \"{}\" is invalid: metadata.resourceVersion: must be specified for an update",
                        key.kind, key.name
                    ),
                })
            }
            Some(token) if Some(token) != existing.metadata.resource_version.as_deref() => {
                return Err(StoreError::Conflict {
                    reason: "Conflict".to_string(),
                    message: format!(
                        "Operation cannot be fulfilled on {} \"{}\": the object has been modified; please apply your changes to the latest version and try again",
                        key.kind, key.name
                    ),
                })
            }
            Some(_) => {}
        }

        let old_value = serde_json::to_value(&existing)?;
        let new_value = serde_json::to_value(obj)?;
        for rule in inner
            .immutable
            .iter()
            .filter(|r| r.group == key.group && r.kind == key.kind)
        {
            if old_value.pointer(&rule.pointer) != new_value.pointer(&rule.pointer) {
                return Err(StoreError::Conflict {
                    reason: "Invalid".to_string(),
                    message: format!(
                        "{} \"{}\" is invalid: {}: Invalid value: field is immutable",
                        key.kind,
                        key.name,
                        rule.pointer.trim_start_matches('/').replace('/', ".")
                    ),
                });
            }
        }

        // status is only written through `modify`
        let mut stored = obj.clone();
        match existing.data.get("status") {
            Some(status) => stored.data["status"] = status.clone(),
            None => {
                if let Some(data) = stored.data.as_object_mut() {
                    data.remove("status");
                }
            }
        }
        stored.metadata.namespace = key.namespace.clone();
        stored.metadata.uid = existing.metadata.uid.clone();
        stored.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
        stored.metadata.deletion_timestamp = existing.metadata.deletion_timestamp.clone();
        stored.metadata.generation = existing.metadata.generation;
        if strip_metadata(&old_value) != strip_metadata(&new_value) {
            stored.metadata.generation = Some(existing.metadata.generation.unwrap_or(1) + 1);
        }
        if dry_run {
            return Ok(stored);
        }

        let version = next_version(&mut inner);
        stored.metadata.resource_version = Some(version.to_string());
        inner.mutations += 1;

        let finalized = stored.metadata.deletion_timestamp.is_some()
            && stored.metadata.finalizers.as_ref().map_or(true, Vec::is_empty);
        if finalized {
            inner.objects.remove(&key);
        } else {
            inner.objects.insert(key, stored.clone());
        }
        Ok(stored)
    }

    fn delete_object(&self, obj: &DynamicObject, dry_run: bool) -> StoreResult<()> {
        let key = self.normalize(ObjectKey::from_object(obj)?)?;
        self.injected(Operation::Delete, &key)?;

        let mut inner = self.inner.lock();
        let has_finalizers = match inner.objects.get(&key) {
            None => return Err(StoreError::NotFound(key.to_string())),
            Some(existing) => existing
                .metadata
                .finalizers
                .as_ref()
                .is_some_and(|f| !f.is_empty()),
        };
        if dry_run {
            return Ok(());
        }

        let version = next_version(&mut inner);
        inner.mutations += 1;
        if has_finalizers {
            if let Some(existing) = inner.objects.get_mut(&key) {
                if existing.metadata.deletion_timestamp.is_none() {
                    existing.metadata.deletion_timestamp = Some(Time(Utc::now()));
                }
                existing.metadata.resource_version = Some(version.to_string());
            }
        } else {
            inner.objects.remove(&key);
        }
        debug!(key = %key, "memory store deleted object");
        Ok(())
    }
}

fn next_version(inner: &mut Inner) -> u64 {
    inner.version += 1;
    inner.version
}

fn same_type(key: &ObjectKey, gvk: &GroupVersionKind) -> bool {
    key.group == gvk.group && key.version == gvk.version && key.kind == gvk.kind
}

fn strip_metadata(value: &Value) -> Value {
    let mut value = value.clone();
    if let Some(obj) = value.as_object_mut() {
        obj.remove("metadata");
        obj.remove("status");
    }
    value
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<DynamicObject> {
        let key = self.normalize(key.clone())?;
        self.injected(Operation::Get, &key)?;
        self.inner
            .lock()
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, gvk: &GroupVersionKind) -> StoreResult<Vec<DynamicObject>> {
        if self.scopes.scope(gvk).is_none() {
            return Err(StoreError::TypeUnknown(format!(
                "{}/{}",
                api_version(&gvk.group, &gvk.version),
                gvk.kind
            )));
        }
        let failure = self
            .inner
            .lock()
            .list_failures
            .get(&(gvk.group.clone(), gvk.version.clone(), gvk.kind.clone()))
            .cloned();
        if let Some(message) = failure {
            return Err(StoreError::Backend(message));
        }
        Ok(self.objects(gvk))
    }

    async fn create(&self, obj: &DynamicObject, opts: &WriteOptions) -> StoreResult<DynamicObject> {
        self.create_object(obj.clone(), opts.dry_run, true)
    }

    async fn update(&self, obj: &DynamicObject, opts: &WriteOptions) -> StoreResult<DynamicObject> {
        self.update_object(obj, opts.dry_run)
    }

    async fn delete(&self, obj: &DynamicObject, opts: &DeleteOptions) -> StoreResult<()> {
        self.delete_object(obj, opts.dry_run)
    }

    async fn scope(&self, gvk: &GroupVersionKind) -> StoreResult<ResourceScope> {
        self.scopes.scope(gvk).ok_or_else(|| {
            StoreError::TypeUnknown(format!(
                "{}/{}",
                api_version(&gvk.group, &gvk.version),
                gvk.kind
            ))
        })
    }
}

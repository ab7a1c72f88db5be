//! Object store abstraction
//!
//! The engine never talks to the Kubernetes API directly. Everything goes
//! through [`ObjectStore`], which is implemented by [`KubeStore`] for a live
//! cluster and by [`MemoryStore`] for tests and simulations.

mod kube_store;
mod memory;
mod scope;

pub use kube_store::KubeStore;
pub use memory::{MemoryStore, Operation};
pub use scope::ScopeCache;

use std::fmt;

use async_trait::async_trait;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::ResourceExt;

use crate::error::{StoreError, StoreResult};

/// Whether a type lives inside namespaces or at cluster level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceScope {
    Namespaced,
    Cluster,
}

/// Deletion propagation requested from the store
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Propagation {
    /// Dependents are deleted before the object disappears
    Foreground,
    /// Object disappears immediately, dependents are collected afterwards
    #[default]
    Background,
    /// Dependents are left behind
    Orphan,
}

/// Options for create and update calls
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub dry_run: bool,
    pub field_manager: Option<String>,
}

/// Options for delete calls
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub dry_run: bool,
    pub propagation: Propagation,
}

impl DeleteOptions {
    /// Foreground cascading delete
    pub fn foreground() -> Self {
        Self {
            dry_run: false,
            propagation: Propagation::Foreground,
        }
    }
}

/// Abstract client capability consumed by the engine
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a single object
    async fn get(&self, key: &ObjectKey) -> StoreResult<DynamicObject>;

    /// List all objects of a type across namespaces
    async fn list(&self, gvk: &GroupVersionKind) -> StoreResult<Vec<DynamicObject>>;

    /// Create an object, returning the stored representation
    async fn create(&self, obj: &DynamicObject, opts: &WriteOptions) -> StoreResult<DynamicObject>;

    /// Replace an object; `metadata.resourceVersion` must carry the current token
    async fn update(&self, obj: &DynamicObject, opts: &WriteOptions) -> StoreResult<DynamicObject>;

    /// Delete an object
    async fn delete(&self, obj: &DynamicObject, opts: &DeleteOptions) -> StoreResult<()>;

    /// Scope of a type, or `TypeUnknown` when the store does not serve it
    async fn scope(&self, gvk: &GroupVersionKind) -> StoreResult<ResourceScope>;
}

/// Structured identity of one object: type plus namespaced name
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            kind: gvk.kind.clone(),
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Key of an object; fails when type or name are missing
    pub fn from_object(obj: &DynamicObject) -> StoreResult<Self> {
        let gvk = gvk_of(obj)
            .ok_or_else(|| StoreError::Invalid("object has no apiVersion/kind".to_string()))?;
        let name = obj
            .metadata
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| StoreError::Invalid(format!("{} object has no name", gvk.kind)))?;
        Ok(Self::new(&gvk, obj.metadata.namespace.as_deref(), name))
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    pub fn api_version(&self) -> String {
        api_version(&self.group, &self.version)
    }

    /// Same object, placed in (or removed from) a namespace
    #[must_use]
    pub fn with_namespace(mut self, namespace: Option<&str>) -> Self {
        self.namespace = namespace.filter(|ns| !ns.is_empty()).map(str::to_string);
        self
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version(), self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version(), self.kind, self.name),
        }
    }
}

/// `group/version`, or just `version` for the core group
pub fn api_version(group: &str, version: &str) -> String {
    if group.is_empty() {
        version.to_string()
    } else {
        format!("{}/{}", group, version)
    }
}

/// Type identity of an object, parsed from its `apiVersion` and `kind`
pub fn gvk_of(obj: &DynamicObject) -> Option<GroupVersionKind> {
    let types = obj.types.as_ref()?;
    if types.kind.is_empty() || types.api_version.is_empty() {
        return None;
    }
    let (group, version) = match types.api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", types.api_version.as_str()),
    };
    Some(GroupVersionKind::gvk(group, version, &types.kind))
}

/// Whether an object carries a deletion timestamp
pub fn is_terminating(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some()
}

/// Human-readable identity used in log fields when no key can be built
pub fn describe(obj: &DynamicObject) -> String {
    match ObjectKey::from_object(obj) {
        Ok(key) => key.to_string(),
        Err(_) => obj.name_any(),
    }
}

/// Well-known type identities
pub mod kinds {
    use kube::core::GroupVersionKind;

    pub const APIEXTENSIONS_GROUP: &str = "apiextensions.k8s.io";
    pub const CUSTOM_RESOURCE_DEFINITION: &str = "CustomResourceDefinition";
    pub const NAMESPACE: &str = "Namespace";

    pub fn config_map() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "ConfigMap")
    }

    pub fn secret() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "Secret")
    }

    pub fn namespace() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", NAMESPACE)
    }

    pub fn service() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "Service")
    }

    pub fn service_account() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "ServiceAccount")
    }

    pub fn deployment() -> GroupVersionKind {
        GroupVersionKind::gvk("apps", "v1", "Deployment")
    }

    pub fn stateful_set() -> GroupVersionKind {
        GroupVersionKind::gvk("apps", "v1", "StatefulSet")
    }

    pub fn daemon_set() -> GroupVersionKind {
        GroupVersionKind::gvk("apps", "v1", "DaemonSet")
    }

    pub fn custom_resource_definition() -> GroupVersionKind {
        GroupVersionKind::gvk(APIEXTENSIONS_GROUP, "v1", CUSTOM_RESOURCE_DEFINITION)
    }

    /// Schema-defining objects
    pub fn is_crd(gvk: &GroupVersionKind) -> bool {
        gvk.group == APIEXTENSIONS_GROUP && gvk.kind == CUSTOM_RESOURCE_DEFINITION
    }

    /// Namespace-defining objects
    pub fn is_namespace(gvk: &GroupVersionKind) -> bool {
        gvk.group.is_empty() && gvk.kind == NAMESPACE
    }

    /// Types that are never purged nor structurally owned
    pub fn is_protected(gvk: &GroupVersionKind) -> bool {
        is_crd(gvk) || is_namespace(gvk)
    }
}

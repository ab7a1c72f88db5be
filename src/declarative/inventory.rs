//! Record-based orphan tracking
//!
//! Type-based purge needs the set of types up front. When a component's types
//! change from pass to pass, the inventory keeps a persisted list of every
//! object the previous pass produced instead, and deletes whatever dropped out
//! of the list.
//!
//! Records are stored in a ConfigMap per (owner, component), one reference per
//! entry in the `references` key, formatted `group/version/kind/namespace/name`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use kube::core::DynamicObject;
use tracing::{debug, info, warn};

use super::component::ResourceOwner;
use super::policy::{DesiredObject, DesiredState};
use super::resource::ResourceReconciler;
use super::to_dynamic;
use crate::error::{Error, Errors, Result};
use crate::store::{is_terminating, kinds, ObjectKey, ObjectStore, ResourceScope, WriteOptions};

/// Data key holding the encoded references
pub const REFERENCES_KEY: &str = "references";

const SEPARATOR: char = ',';

/// Where the inventory of one (owner, component) pair is stored
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub namespace: String,
    pub name: String,
}

impl RecordKey {
    /// `<owner>-<owner namespace>-<component>`, lowercased, in `namespace`
    pub fn for_component(owner: &ResourceOwner, component: &str, namespace: &str) -> Self {
        let name = match owner.namespace.as_deref() {
            Some(ns) => format!("{}-{}-{}", owner.name, ns, component),
            None => format!("{}-{}", owner.name, component),
        };
        Self {
            namespace: namespace.to_string(),
            name: name.to_lowercase(),
        }
    }
}

/// Persistence of object reference lists
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Previously saved references, `None` when nothing was saved yet
    async fn load(&self, record: &RecordKey) -> Result<Option<Vec<ObjectKey>>>;

    async fn save(&self, record: &RecordKey, refs: &[ObjectKey]) -> Result<()>;
}

fn encode_ref(key: &ObjectKey) -> String {
    format!(
        "{}/{}/{}/{}/{}",
        key.group,
        key.version,
        key.kind,
        key.namespace.as_deref().unwrap_or_default(),
        key.name
    )
}

fn decode_ref(entry: &str) -> Result<ObjectKey> {
    let parts: Vec<&str> = entry.split('/').collect();
    let [group, version, kind, namespace, name] = parts.as_slice() else {
        return Err(Error::validation(format!("malformed inventory reference '{}'", entry)));
    };
    if version.is_empty() || kind.is_empty() || name.is_empty() {
        return Err(Error::validation(format!("incomplete inventory reference '{}'", entry)));
    }
    Ok(ObjectKey {
        group: group.to_string(),
        version: version.to_string(),
        kind: kind.to_string(),
        namespace: Some(namespace.to_string()).filter(|ns| !ns.is_empty()),
        name: name.to_string(),
    })
}

pub fn encode(refs: &[ObjectKey]) -> String {
    refs.iter()
        .map(encode_ref)
        .collect::<Vec<_>>()
        .join(&SEPARATOR.to_string())
}

pub fn decode(raw: &str) -> Result<Vec<ObjectKey>> {
    raw.split(SEPARATOR)
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(decode_ref)
        .collect()
}

/// Inventory records kept in ConfigMaps through an [`ObjectStore`]
pub struct ConfigMapInventory {
    store: Arc<dyn ObjectStore>,
}

impl ConfigMapInventory {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn key(record: &RecordKey) -> ObjectKey {
        ObjectKey::new(&kinds::config_map(), Some(&record.namespace), &record.name)
    }
}

#[async_trait]
impl InventoryStore for ConfigMapInventory {
    async fn load(&self, record: &RecordKey) -> Result<Option<Vec<ObjectKey>>> {
        let key = Self::key(record);
        let obj = match self.store.get(&key).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() || e.is_type_unknown() => return Ok(None),
            Err(e) => return Err(Error::store("load inventory", &key, e)),
        };
        let raw = obj
            .data
            .pointer(&format!("/data/{}", REFERENCES_KEY))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        decode(raw).map(Some)
    }

    async fn save(&self, record: &RecordKey, refs: &[ObjectKey]) -> Result<()> {
        let key = Self::key(record);
        let existing = match self.store.get(&key).await {
            Ok(obj) => Some(obj),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(Error::store("load inventory", &key, e)),
        };

        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(record.name.clone()),
                namespace: Some(record.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    "app.kubernetes.io/managed-by".to_string(),
                    "kube-declarative".to_string(),
                )])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(REFERENCES_KEY.to_string(), encode(refs))])),
            ..Default::default()
        };
        let mut obj: DynamicObject = to_dynamic(&cm)?;

        match existing {
            Some(current) => {
                obj.metadata.resource_version = current.metadata.resource_version;
                self.store
                    .update(&obj, &WriteOptions::default())
                    .await
                    .map_err(|e| Error::store("save inventory", &key, e))?;
            }
            None => {
                self.store
                    .create(&obj, &WriteOptions::default())
                    .await
                    .map_err(|e| Error::store("save inventory", &key, e))?;
            }
        }
        debug!(record = %key, count = refs.len(), "saved inventory");
        Ok(())
    }
}

/// Computes deletion candidates from the previous inventory
pub struct InventoryTracker {
    store: Arc<dyn ObjectStore>,
    records: Arc<dyn InventoryStore>,
    /// Namespace the records live in
    namespace: String,
}

impl InventoryTracker {
    pub fn new(store: Arc<dyn ObjectStore>, records: Arc<dyn InventoryStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            records,
            namespace: namespace.into(),
        }
    }

    /// Save the references of `desired` and return previously tracked objects that are no longer desired.
    ///
    /// `Absent` objects are not recorded. Protected types, terminating objects
    /// and namespaced references without a namespace are never returned.
    pub async fn track(
        &self,
        owner: &ResourceOwner,
        component: &str,
        desired: &[DesiredObject],
    ) -> Result<Vec<DynamicObject>> {
        let record = RecordKey::for_component(owner, component, &self.namespace);
        let previous = self.records.load(&record).await?.unwrap_or_default();

        let mut current = Vec::with_capacity(desired.len());
        for d in desired.iter().filter(|d| d.state() != DesiredState::Absent) {
            let key = ObjectKey::from_object(&d.object)
                .map_err(|e| Error::store("track", crate::store::describe(&d.object), e))?;
            current.push(self.scoped(key, owner).await);
        }
        self.records.save(&record, &current).await?;

        let wanted: HashSet<&ObjectKey> = current.iter().collect();
        let mut deletable = Vec::new();
        for key in previous {
            if kinds::is_protected(&key.gvk()) || wanted.contains(&key) {
                continue;
            }
            match self.store.scope(&key.gvk()).await {
                Ok(ResourceScope::Namespaced) if key.namespace.is_none() => {
                    warn!(object = %key, "tracked reference has no namespace, skipping");
                    continue;
                }
                Ok(_) => {}
                Err(e) if e.is_type_unknown() => continue,
                Err(e) => return Err(Error::store("resolve scope", &key, e)),
            }
            let obj = match self.store.get(&key).await {
                Ok(obj) => obj,
                Err(e) if e.is_not_found() || e.is_type_unknown() => continue,
                Err(e) => return Err(Error::store("get", &key, e)),
            };
            if is_terminating(&obj) {
                continue;
            }
            deletable.push(obj);
        }
        Ok(deletable)
    }

    /// Track `desired` and delete, in reverse order, everything that dropped out
    pub async fn collect_garbage(
        &self,
        owner: &ResourceOwner,
        component: &str,
        desired: &[DesiredObject],
        resources: &ResourceReconciler,
    ) -> Result<Vec<ObjectKey>> {
        let deletable = self.track(owner, component, desired).await?;
        let mut deleted = Vec::new();
        let mut errors = Vec::new();
        for obj in deletable.into_iter().rev() {
            match resources.reconcile(DesiredObject::absent(obj)).await {
                Ok(done) => {
                    info!(object = %done.key, outcome = done.outcome.as_str(), "collected untracked object");
                    deleted.push(done.key);
                }
                Err(e) => errors.push(e),
            }
        }
        match errors.len() {
            0 => Ok(deleted),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(Errors::new(errors))),
        }
    }

    /// Normalize the namespace of a reference against its type's scope
    async fn scoped(&self, key: ObjectKey, owner: &ResourceOwner) -> ObjectKey {
        match self.store.scope(&key.gvk()).await {
            Ok(ResourceScope::Cluster) => key.with_namespace(None),
            Ok(ResourceScope::Namespaced) if key.namespace.is_none() => {
                let ns = owner.namespace.clone().unwrap_or_else(|| "default".to_string());
                key.with_namespace(Some(&ns))
            }
            _ => key,
        }
    }
}

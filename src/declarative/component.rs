//! Component identity and ownership metadata
//!
//! A component id names one (owner, component) pair. Every object the engine
//! writes for that pair carries the id under [`MANAGED_BY_ANNOTATION`]; the id
//! is what purge uses to find objects the component stopped producing.

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::{Resource, ResourceExt};

use crate::error::{Error, Result};
use crate::store::{api_version, describe, gvk_of, kinds, ObjectKey, ResourceScope};

/// Annotation carrying the id of the component that manages an object
pub const MANAGED_BY_ANNOTATION: &str = "declarative.dev/managed-by";

/// Annotation pointing back at the owner as `namespace/name`
pub const RELATED_TO_ANNOTATION: &str = "declarative.dev/related-to";

/// The object a set of managed objects belongs to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceOwner {
    pub name: String,
    pub namespace: Option<String>,
    pub gvk: GroupVersionKind,
    pub uid: Option<String>,
}

impl ResourceOwner {
    pub fn new(name: impl Into<String>, namespace: Option<&str>, gvk: GroupVersionKind) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            gvk,
            uid: None,
        }
    }

    #[must_use]
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    /// Owner description of a typed resource
    pub fn from_resource<K>(obj: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        let gvk = GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()));
        Self {
            name: obj.name_any(),
            namespace: obj.namespace().filter(|ns| !ns.is_empty()),
            gvk,
            uid: obj.uid(),
        }
    }

    /// Owner description of a dynamic object
    pub fn from_object(obj: &DynamicObject) -> Result<Self> {
        let gvk = gvk_of(obj).ok_or_else(|| Error::validation("owner has no apiVersion/kind"))?;
        Ok(Self {
            name: obj.name_any(),
            namespace: obj.namespace().filter(|ns| !ns.is_empty()),
            gvk,
            uid: obj.uid(),
        })
    }

    /// `namespace/name`, or `name` for cluster-scoped owners
    pub fn namespaced_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.gvk, self.namespace.as_deref(), &self.name)
    }

    /// Controller reference to this owner; needs the owner's uid
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        let uid = self.uid.clone().filter(|u| !u.is_empty())?;
        Some(OwnerReference {
            api_version: api_version(&self.gvk.group, &self.gvk.version),
            kind: self.gvk.kind.clone(),
            name: self.name.clone(),
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }
}

impl fmt::Display for ResourceOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.gvk.kind, self.namespaced_name())
    }
}

/// Identity of one (owner, component) pair
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ComponentId(String);

impl ComponentId {
    /// `name[-namespace]-component-apiVersion-kind`, kind lowercased
    pub fn new(owner: &ResourceOwner, component: &str) -> Result<Self> {
        if owner.name.is_empty() {
            return Err(Error::validation("cannot derive component id: owner has no name"));
        }
        if component.is_empty() {
            return Err(Error::validation("cannot derive component id: component name is empty"));
        }

        let api = api_version(&owner.gvk.group, &owner.gvk.version);
        let kind = owner.gvk.kind.to_lowercase();
        let mut parts = vec![owner.name.as_str()];
        if let Some(ns) = owner.namespace.as_deref() {
            parts.push(ns);
        }
        parts.extend([component, api.as_str(), kind.as_str()]);
        Ok(Self(parts.join("-")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Component id an object is tagged with, if any
pub fn managed_by(obj: &DynamicObject) -> Option<&str> {
    obj.metadata
        .annotations
        .as_ref()?
        .get(MANAGED_BY_ANNOTATION)
        .map(String::as_str)
}

/// Tag a desired object with the component id and owner pointer.
///
/// Fails when the object already carries a different component id.
pub fn tag(obj: &mut DynamicObject, id: &ComponentId, owner: &ResourceOwner) -> Result<()> {
    if let Some(existing) = managed_by(obj) {
        if existing != id.as_str() {
            return Err(Error::TaggingConflict {
                key: describe(obj),
                existing: existing.to_string(),
                requested: id.to_string(),
            });
        }
    }

    let annotations = obj.annotations_mut();
    annotations.insert(MANAGED_BY_ANNOTATION.to_string(), id.to_string());
    annotations.insert(RELATED_TO_ANNOTATION.to_string(), owner.namespaced_name());
    Ok(())
}

/// Point the object's controller reference at the owner where the cluster allows it.
///
/// Skipped for protected types, for owners without a uid, and whenever the
/// object lives outside the owner's namespace. Returns whether it was set.
pub fn set_owner_reference(obj: &mut DynamicObject, owner: &ResourceOwner, scope: ResourceScope) -> bool {
    if gvk_of(obj).is_some_and(|gvk| kinds::is_protected(&gvk)) {
        return false;
    }
    if let Some(owner_ns) = owner.namespace.as_deref() {
        let same_namespace = scope == ResourceScope::Namespaced
            && obj.metadata.namespace.as_deref().map_or(true, |ns| ns == owner_ns);
        if !same_namespace {
            return false;
        }
    }
    let Some(reference) = owner.owner_reference() else {
        return false;
    };

    let references = obj.owner_references_mut();
    if let Some(existing) = references.iter_mut().find(|r| r.uid == reference.uid) {
        *existing = reference;
    } else {
        references.retain(|r| r.controller != Some(true));
        references.push(reference);
    }
    true
}

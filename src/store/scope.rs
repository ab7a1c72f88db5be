//! Type scope cache
//!
//! Maps a type identity to its API resource and scope. Built-in kinds are
//! seeded statically; everything else is added by the owning store when it
//! discovers a type. Entries live as long as the owning store instance.

use std::collections::HashMap;

use kube::core::{ApiResource, GroupVersionKind};
use parking_lot::RwLock;

use super::ResourceScope;

type TypeKey = (String, String, String);

const CLUSTER_BUILTINS: &[(&str, &str, &str)] = &[
    ("", "v1", "Namespace"),
    ("", "v1", "Node"),
    ("", "v1", "PersistentVolume"),
    ("apiextensions.k8s.io", "v1", "CustomResourceDefinition"),
    ("rbac.authorization.k8s.io", "v1", "ClusterRole"),
    ("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding"),
    ("storage.k8s.io", "v1", "StorageClass"),
    ("admissionregistration.k8s.io", "v1", "MutatingWebhookConfiguration"),
    ("admissionregistration.k8s.io", "v1", "ValidatingWebhookConfiguration"),
    ("scheduling.k8s.io", "v1", "PriorityClass"),
];

const NAMESPACED_BUILTINS: &[(&str, &str, &str)] = &[
    ("", "v1", "ConfigMap"),
    ("", "v1", "Secret"),
    ("", "v1", "Service"),
    ("", "v1", "ServiceAccount"),
    ("", "v1", "Pod"),
    ("", "v1", "PersistentVolumeClaim"),
    ("apps", "v1", "Deployment"),
    ("apps", "v1", "StatefulSet"),
    ("apps", "v1", "DaemonSet"),
    ("apps", "v1", "ReplicaSet"),
    ("batch", "v1", "Job"),
    ("batch", "v1", "CronJob"),
    ("rbac.authorization.k8s.io", "v1", "Role"),
    ("rbac.authorization.k8s.io", "v1", "RoleBinding"),
    ("networking.k8s.io", "v1", "Ingress"),
    ("networking.k8s.io", "v1", "NetworkPolicy"),
    ("policy", "v1", "PodDisruptionBudget"),
];

fn type_key(gvk: &GroupVersionKind) -> TypeKey {
    (gvk.group.clone(), gvk.version.clone(), gvk.kind.clone())
}

/// Cache of known type scopes with a static built-in table and a discovered table
pub struct ScopeCache {
    builtin: HashMap<TypeKey, ResourceScope>,
    discovered: RwLock<HashMap<TypeKey, (ApiResource, ResourceScope)>>,
}

impl Default for ScopeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeCache {
    /// Cache seeded with the built-in Kubernetes kinds
    pub fn new() -> Self {
        let builtin = CLUSTER_BUILTINS
            .iter()
            .map(|t| (t, ResourceScope::Cluster))
            .chain(NAMESPACED_BUILTINS.iter().map(|t| (t, ResourceScope::Namespaced)))
            .map(|((g, v, k), scope)| ((g.to_string(), v.to_string(), k.to_string()), scope))
            .collect();
        Self {
            builtin,
            discovered: RwLock::new(HashMap::new()),
        }
    }

    /// Cache with no built-in entries
    pub fn empty() -> Self {
        Self {
            builtin: HashMap::new(),
            discovered: RwLock::new(HashMap::new()),
        }
    }

    /// Resolved resource and scope, if known
    pub fn lookup(&self, gvk: &GroupVersionKind) -> Option<(ApiResource, ResourceScope)> {
        let key = type_key(gvk);
        if let Some(found) = self.discovered.read().get(&key) {
            return Some(found.clone());
        }
        self.builtin
            .get(&key)
            .map(|scope| (ApiResource::from_gvk(gvk), *scope))
    }

    /// Scope only, if known
    pub fn scope(&self, gvk: &GroupVersionKind) -> Option<ResourceScope> {
        self.lookup(gvk).map(|(_, scope)| scope)
    }

    /// Record a discovered type
    pub fn insert(&self, gvk: &GroupVersionKind, resource: ApiResource, scope: ResourceScope) {
        self.discovered.write().insert(type_key(gvk), (resource, scope));
    }

    /// Forget a discovered type
    pub fn remove(&self, gvk: &GroupVersionKind) {
        self.discovered.write().remove(&type_key(gvk));
    }

    /// Drop every discovered entry; built-ins stay
    pub fn invalidate(&self) {
        self.discovered.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_known_without_discovery() {
        let cache = ScopeCache::new();
        let ns = GroupVersionKind::gvk("", "v1", "Namespace");
        let cm = GroupVersionKind::gvk("", "v1", "ConfigMap");
        assert_eq!(cache.scope(&ns), Some(ResourceScope::Cluster));
        assert_eq!(cache.scope(&cm), Some(ResourceScope::Namespaced));
        assert_eq!(cache.lookup(&cm).unwrap().0.plural, "configmaps");
    }

    #[test]
    fn discovered_entries_are_dropped_on_invalidate() {
        let cache = ScopeCache::new();
        let gvk = GroupVersionKind::gvk("example.com", "v1", "Widget");
        assert_eq!(cache.scope(&gvk), None);

        cache.insert(&gvk, ApiResource::from_gvk(&gvk), ResourceScope::Namespaced);
        assert_eq!(cache.scope(&gvk), Some(ResourceScope::Namespaced));

        cache.invalidate();
        assert_eq!(cache.scope(&gvk), None);
        assert!(cache.scope(&GroupVersionKind::gvk("apps", "v1", "Deployment")).is_some());
    }
}

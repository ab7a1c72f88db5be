//! Kubernetes-backed object store
//!
//! Uses `Api<DynamicObject>` so one store instance can handle every type the
//! cluster serves. Type resolution goes through the store's own
//! [`ScopeCache`]; a miss triggers pinned discovery of that single kind.

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, PropagationPolicy},
    core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta},
    discovery::{self, Scope},
    Client, ResourceExt,
};
use tracing::{debug, info};

use super::{
    DeleteOptions, ObjectKey, ObjectStore, Propagation, ResourceScope, ScopeCache, WriteOptions,
};
use crate::error::{StoreError, StoreResult};

/// Object store talking to a live cluster
pub struct KubeStore {
    client: Client,
    scopes: ScopeCache,
}

impl KubeStore {
    /// Create a store with a fresh scope cache
    pub fn new(client: Client) -> Self {
        Self {
            client,
            scopes: ScopeCache::new(),
        }
    }

    /// The store's scope cache
    pub fn scopes(&self) -> &ScopeCache {
        &self.scopes
    }

    /// Resolve a type, discovering it on cache miss
    async fn resolve(&self, gvk: &GroupVersionKind) -> StoreResult<(ApiResource, ResourceScope)> {
        if let Some(found) = self.scopes.lookup(gvk) {
            return Ok(found);
        }

        debug!(group = %gvk.group, version = %gvk.version, kind = %gvk.kind, "scope cache miss, discovering type");
        match discovery::pinned_kind(&self.client, gvk).await {
            Ok((resource, caps)) => {
                let scope = match caps.scope {
                    Scope::Namespaced => ResourceScope::Namespaced,
                    Scope::Cluster => ResourceScope::Cluster,
                };
                info!(kind = %gvk.kind, plural = %resource.plural, ?scope, "discovered type");
                self.scopes.insert(gvk, resource.clone(), scope);
                Ok((resource, scope))
            }
            Err(kube::Error::Discovery(e)) => Err(StoreError::TypeUnknown(format!(
                "{}/{}/{}: {}",
                gvk.group, gvk.version, gvk.kind, e
            ))),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Err(StoreError::TypeUnknown(
                format!("{}/{}/{}: {}", gvk.group, gvk.version, gvk.kind, resp.message),
            )),
            Err(e) => Err(StoreError::Kube(e)),
        }
    }

    /// Api handle scoped the way the key's type requires
    async fn api_for(&self, key: &ObjectKey) -> StoreResult<(Api<DynamicObject>, ApiResource)> {
        let (resource, scope) = self.resolve(&key.gvk()).await?;
        let api = match scope {
            ResourceScope::Cluster => Api::all_with(self.client.clone(), &resource),
            ResourceScope::Namespaced => {
                let namespace = key.namespace.as_deref().ok_or_else(|| {
                    StoreError::Invalid(format!("{} is namespaced but has no namespace", key))
                })?;
                Api::namespaced_with(self.client.clone(), namespace, &resource)
            }
        };
        Ok((api, resource))
    }
}

/// Translate API status codes into the store's error classes
fn map_api_error(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(resp.message),
        kube::Error::Api(resp) if resp.code == 409 || resp.code == 422 => StoreError::Conflict {
            reason: resp.reason,
            message: resp.message,
        },
        other => StoreError::Kube(other),
    }
}

/// List items and some get responses come back without apiVersion/kind
fn with_types(mut obj: DynamicObject, resource: &ApiResource) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
    }
    obj
}

fn post_params(opts: &WriteOptions) -> PostParams {
    PostParams {
        dry_run: opts.dry_run,
        field_manager: opts.field_manager.clone(),
    }
}

fn delete_params(opts: &DeleteOptions) -> DeleteParams {
    let propagation_policy = match opts.propagation {
        Propagation::Foreground => PropagationPolicy::Foreground,
        Propagation::Background => PropagationPolicy::Background,
        Propagation::Orphan => PropagationPolicy::Orphan,
    };
    DeleteParams {
        dry_run: opts.dry_run,
        propagation_policy: Some(propagation_policy),
        ..Default::default()
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<DynamicObject> {
        let (api, resource) = self.api_for(key).await?;
        let obj = api.get(&key.name).await.map_err(map_api_error)?;
        Ok(with_types(obj, &resource))
    }

    async fn list(&self, gvk: &GroupVersionKind) -> StoreResult<Vec<DynamicObject>> {
        let (resource, _) = self.resolve(gvk).await?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(map_api_error)?;
        Ok(list
            .items
            .into_iter()
            .map(|obj| with_types(obj, &resource))
            .collect())
    }

    async fn create(&self, obj: &DynamicObject, opts: &WriteOptions) -> StoreResult<DynamicObject> {
        let key = ObjectKey::from_object(obj)?;
        let (api, resource) = self.api_for(&key).await?;
        let created = api
            .create(&post_params(opts), obj)
            .await
            .map_err(map_api_error)?;
        Ok(with_types(created, &resource))
    }

    async fn update(&self, obj: &DynamicObject, opts: &WriteOptions) -> StoreResult<DynamicObject> {
        let key = ObjectKey::from_object(obj)?;
        let (api, resource) = self.api_for(&key).await?;
        let updated = api
            .replace(&obj.name_any(), &post_params(opts), obj)
            .await
            .map_err(map_api_error)?;
        Ok(with_types(updated, &resource))
    }

    async fn delete(&self, obj: &DynamicObject, opts: &DeleteOptions) -> StoreResult<()> {
        let key = ObjectKey::from_object(obj)?;
        let (api, _) = self.api_for(&key).await?;
        api.delete(&key.name, &delete_params(opts))
            .await
            .map_err(map_api_error)?;
        Ok(())
    }

    async fn scope(&self, gvk: &GroupVersionKind) -> StoreResult<ResourceScope> {
        self.resolve(gvk).await.map(|(_, scope)| scope)
    }
}

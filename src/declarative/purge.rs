//! Type-based orphan deletion
//!
//! After a successful pass, every object of the listed types that carries the
//! component's id but was not produced in this pass is deleted. Deletion runs
//! in reverse discovery order and keeps going past individual failures.

use std::collections::HashSet;

use kube::core::{DynamicObject, GroupVersionKind};
use tracing::{debug, info, warn};

use super::component::{managed_by, ComponentId};
use crate::error::Error;
use crate::metrics;
use crate::store::{api_version, is_terminating, kinds, DeleteOptions, ObjectKey, ObjectStore};

/// Objects deleted by a sweep and the failures met along the way
#[derive(Debug, Default)]
pub struct PurgeReport {
    pub purged: Vec<ObjectKey>,
    pub errors: Vec<Error>,
}

/// Delete objects of `types` tagged with `id`, sparing `excluded` ones
pub async fn purge_orphans(
    store: &dyn ObjectStore,
    id: &ComponentId,
    types: &[GroupVersionKind],
    excluded: &HashSet<ObjectKey>,
) -> PurgeReport {
    let mut report = PurgeReport::default();
    let mut candidates: Vec<(ObjectKey, DynamicObject)> = Vec::new();

    for gvk in types {
        if kinds::is_protected(gvk) {
            debug!(kind = %gvk.kind, "protected type is never purged");
            continue;
        }
        let objects = match store.list(gvk).await {
            Ok(objects) => objects,
            Err(e) if e.is_type_unknown() => {
                debug!(kind = %gvk.kind, "type not served, nothing to purge");
                continue;
            }
            Err(e) => {
                warn!(kind = %gvk.kind, error = %e, "failed to list purge candidates");
                report.errors.push(Error::Purge {
                    key: format!("{}/{}", api_version(&gvk.group, &gvk.version), gvk.kind),
                    source: e,
                });
                continue;
            }
        };

        for obj in objects {
            let Ok(key) = ObjectKey::from_object(&obj) else {
                continue;
            };
            if excluded.contains(&key) || is_terminating(&obj) {
                continue;
            }
            if managed_by(&obj) == Some(id.as_str()) {
                candidates.push((key, obj));
            }
        }
    }

    for (key, obj) in candidates.into_iter().rev() {
        match store.delete(&obj, &DeleteOptions::default()).await {
            Ok(()) => {
                info!(object = %key, component = %id, "purged orphaned object");
                metrics::PURGED_OBJECTS.with_label_values(&[&key.kind]).inc();
                report.purged.push(key);
            }
            Err(e) if e.is_not_found() => {
                debug!(object = %key, "orphan already gone");
                report.purged.push(key);
            }
            Err(e) => {
                warn!(object = %key, error = %e, "failed to purge orphaned object");
                report.errors.push(Error::Purge {
                    key: key.to_string(),
                    source: e,
                });
            }
        }
    }

    report
}

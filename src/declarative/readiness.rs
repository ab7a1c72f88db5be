//! Readiness polling
//!
//! Waits for a set of objects to satisfy a set of conditions, polling each
//! object independently with a [`Backoff`].

use std::fmt;
use std::sync::Arc;

use kube::core::DynamicObject;
use serde_json::Value;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::error::{Error, Errors, Result, StoreResult};
use crate::metrics;
use crate::store::{gvk_of, kinds, ObjectKey, ObjectStore};

type Check = dyn Fn(&StoreResult<DynamicObject>) -> bool + Send + Sync;

/// A predicate over the result of fetching an object
#[derive(Clone)]
pub enum Condition {
    /// The object can be fetched
    Exists,
    /// The store reports the object, or its whole type, as not found
    NotFound,
    /// `status.readyReplicas` equals `spec.replicas`; objects without replicas pass
    ReplicasReady,
    /// Schema definitions report the `Established` condition; other objects pass
    Established,
    Custom { name: String, check: Arc<Check> },
}

impl Condition {
    pub fn custom(
        name: impl Into<String>,
        check: impl Fn(&StoreResult<DynamicObject>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::Custom {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Condition::Exists => "exists",
            Condition::NotFound => "not-found",
            Condition::ReplicasReady => "replicas-ready",
            Condition::Established => "established",
            Condition::Custom { name, .. } => name,
        }
    }

    pub fn check(&self, fetched: &StoreResult<DynamicObject>) -> bool {
        match (self, fetched) {
            (Condition::Exists, fetched) => fetched.is_ok(),
            (Condition::NotFound, Err(e)) => e.is_not_found() || e.is_type_unknown(),
            (Condition::NotFound, Ok(_)) => false,
            (Condition::ReplicasReady, Ok(obj)) => replicas_ready(obj),
            (Condition::Established, Ok(obj)) => established(obj),
            (Condition::ReplicasReady | Condition::Established, Err(_)) => false,
            (Condition::Custom { check, .. }, fetched) => check(fetched),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Condition({})", self.name())
    }
}

pub fn replicas_ready(obj: &DynamicObject) -> bool {
    let Some(wanted) = obj.data.pointer("/spec/replicas").and_then(Value::as_i64) else {
        return true;
    };
    let ready = obj
        .data
        .pointer("/status/readyReplicas")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    ready == wanted
}

pub fn established(obj: &DynamicObject) -> bool {
    if !gvk_of(obj).is_some_and(|gvk| kinds::is_crd(&gvk)) {
        return true;
    }
    obj.data
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some("Established")
                    && c.get("status").and_then(Value::as_str) == Some("True")
            })
        })
}

/// Poll every object until all conditions hold, one backoff budget per object
pub async fn wait_for(
    store: &dyn ObjectStore,
    phase: &str,
    objects: &[ObjectKey],
    conditions: &[Condition],
    backoff: &Backoff,
) -> Result<()> {
    let mut errors = Vec::new();
    for key in objects {
        let waited = backoff
            .retry(|attempt| async move {
                let fetched = store.get(key).await;
                if let Err(e) = &fetched {
                    if !e.is_not_found() && !e.is_type_unknown() {
                        warn!(object = %key, error = %e, attempt, "readiness probe failed");
                        return Err(e.to_string());
                    }
                }
                match conditions.iter().find(|c| !c.check(&fetched)) {
                    None => Ok(()),
                    Some(unmet) => {
                        debug!(object = %key, condition = unmet.name(), attempt, "condition not met yet");
                        Err(format!("condition '{}' not met", unmet.name()))
                    }
                }
            })
            .await;

        if let Err(exhausted) = waited {
            metrics::READINESS_TIMEOUTS.with_label_values(&[phase]).inc();
            errors.push(Error::ReadinessTimeout {
                phase: phase.to_string(),
                key: key.to_string(),
                attempts: exhausted.attempts,
                last: exhausted.last,
            });
        }
    }

    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(Error::Multiple(Errors::new(errors))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use serde_json::json;

    fn object(value: Value) -> DynamicObject {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn replica_readiness() {
        let ready = object(json!({
            "apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "d"},
            "spec": {"replicas": 2}, "status": {"readyReplicas": 2}
        }));
        let starting = object(json!({
            "apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "d"},
            "spec": {"replicas": 2}, "status": {"readyReplicas": 1}
        }));
        let replicaless = object(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}}));
        assert!(replicas_ready(&ready));
        assert!(!replicas_ready(&starting));
        assert!(replicas_ready(&replicaless));
    }

    #[test]
    fn crd_establishment() {
        let crd = object(json!({
            "apiVersion": "apiextensions.k8s.io/v1", "kind": "CustomResourceDefinition",
            "metadata": {"name": "widgets.example.com"},
            "status": {"conditions": [{"type": "Established", "status": "True"}]}
        }));
        let pending = object(json!({
            "apiVersion": "apiextensions.k8s.io/v1", "kind": "CustomResourceDefinition",
            "metadata": {"name": "widgets.example.com"}
        }));
        assert!(established(&crd));
        assert!(!established(&pending));
    }

    #[test]
    fn not_found_condition_only_accepts_not_found() {
        assert!(Condition::NotFound.check(&Err(StoreError::NotFound("x".into()))));
        assert!(!Condition::NotFound.check(&Err(StoreError::Backend("x".into()))));
        assert!(!Condition::Exists.check(&Err(StoreError::NotFound("x".into()))));
    }

    #[test]
    fn unknown_type_counts_as_gone() {
        let unknown = Err(StoreError::TypeUnknown("example.com/v1/Widget".into()));
        assert!(Condition::NotFound.check(&unknown));
        assert!(!Condition::Exists.check(&unknown));
    }

    #[tokio::test(start_paused = true)]
    async fn absent_wait_succeeds_for_unserved_types() {
        let store = crate::store::MemoryStore::new();
        let widget = kube::core::GroupVersionKind::gvk("example.com", "v1", "Widget");
        let key = ObjectKey::new(&widget, Some("control"), "w");
        let waited = wait_for(
            &store,
            "absent",
            &[key],
            &[Condition::NotFound],
            &Backoff::fixed(std::time::Duration::from_secs(1), 3),
        )
        .await;
        assert!(waited.is_ok(), "{:?}", waited);
    }
}

//! ConfigSet reconciliation tests
//!
//! Runs the ConfigSet reconciler against the in-memory store through a
//! scale-up, scale-down and deletion sequence.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use kube::ResourceExt;

use kube_declarative::config::OperatorConfig;
use kube_declarative::crd::{ConfigSet, ConfigSetSpec};
use kube_declarative::declarative::{ObjectState, Reconciler, MANAGED_BY_ANNOTATION};
use kube_declarative::reconcilers::config_set::{self, COMPONENT};
use kube_declarative::store::{kinds, MemoryStore, ObjectKey};

// ============================================================================
// Test Helpers
// ============================================================================

const NAMESPACE: &str = "control";

fn config_set(count: u32) -> ConfigSet {
    let mut cs = ConfigSet::new(
        "sample",
        ConfigSetSpec {
            count,
            prefix: "asd".to_string(),
            data: BTreeMap::from([("greeting".to_string(), "hello".to_string())]),
            secret_name: "keep-the-secret".to_string(),
        },
    );
    cs.metadata.namespace = Some(NAMESPACE.to_string());
    cs.metadata.uid = Some("3b0c2f7e-0000-4000-8000-00000000c0de".to_string());
    cs.metadata.generation = Some(1);
    cs
}

fn setup() -> (Arc<MemoryStore>, Reconciler) {
    let store = Arc::new(MemoryStore::new());
    let options = OperatorConfig::default().reconciler_options();
    let reconciler = Reconciler::new(store.clone(), options);
    (store, reconciler)
}

fn config_map_names(store: &MemoryStore) -> Vec<String> {
    store
        .objects(&kinds::config_map())
        .iter()
        .map(|o| o.name_any())
        .collect()
}

fn secret_key() -> ObjectKey {
    ObjectKey::new(&kinds::secret(), Some(NAMESPACE), "keep-the-secret")
}

// ============================================================================
// Scenario Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn config_maps_follow_count_and_secret_survives_deletion() {
    let (store, reconciler) = setup();

    let report = config_set::apply(&config_set(1), &reconciler).await;
    assert!(report.is_success(), "{:?}", report.errors);
    assert_eq!(config_map_names(&store), ["asd-0"]);
    assert!(store.contains(&secret_key()));

    let report = config_set::apply(&config_set(2), &reconciler).await;
    assert!(report.is_success(), "{:?}", report.errors);
    assert_eq!(config_map_names(&store), ["asd-0", "asd-1"]);

    let report = config_set::apply(&config_set(1), &reconciler).await;
    assert!(report.is_success(), "{:?}", report.errors);
    let purged: Vec<&str> = report
        .keys(ObjectState::Purged)
        .into_iter()
        .map(|k| k.name.as_str())
        .collect();
    assert_eq!(purged, ["asd-1"]);
    assert_eq!(config_map_names(&store), ["asd-0"]);

    let report = config_set::apply(&config_set(0), &reconciler).await;
    assert!(report.is_success(), "{:?}", report.errors);
    assert!(config_map_names(&store).is_empty());
    assert!(store.contains(&secret_key()));

    let report = config_set::cleanup(&config_set(0), &reconciler).await;
    assert!(report.is_success(), "{:?}", report.errors);
    assert!(report.keys(ObjectState::Purged).is_empty());
    assert!(store.contains(&secret_key()));
}

#[tokio::test(start_paused = true)]
async fn cleanup_purges_config_maps_and_keeps_the_secret() {
    let (store, reconciler) = setup();
    config_set::apply(&config_set(2), &reconciler).await;

    let report = config_set::cleanup(&config_set(2), &reconciler).await;
    assert!(report.is_success(), "{:?}", report.errors);
    assert!(config_map_names(&store).is_empty());
    assert!(store.contains(&secret_key()));
}

#[tokio::test(start_paused = true)]
async fn repeated_apply_is_a_no_op() {
    let (store, reconciler) = setup();
    let cs = config_set(3);

    config_set::apply(&cs, &reconciler).await;
    let writes = store.mutations();
    let report = config_set::apply(&cs, &reconciler).await;

    assert!(report.is_success(), "{:?}", report.errors);
    assert_eq!(report.mutations(), 0);
    assert_eq!(store.mutations(), writes);
}

#[tokio::test(start_paused = true)]
async fn generated_objects_are_owned_by_the_config_set() {
    let (store, reconciler) = setup();
    let cs = config_set(1);
    config_set::apply(&cs, &reconciler).await;

    let cm = store
        .object(&ObjectKey::new(&kinds::config_map(), Some(NAMESPACE), "asd-0"))
        .unwrap();
    assert_eq!(cm.data["data"]["greeting"], "hello");
    let refs = cm.owner_references();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].name, "sample");
    assert_eq!(refs[0].controller, Some(true));

    let id = cm.annotations().get(MANAGED_BY_ANNOTATION).cloned().unwrap();
    assert!(id.contains(COMPONENT));
    assert!(id.ends_with("-configset"));
}

#[tokio::test(start_paused = true)]
async fn data_changes_reach_every_config_map() {
    let (store, reconciler) = setup();
    config_set::apply(&config_set(2), &reconciler).await;

    let mut changed = config_set(2);
    changed.spec.data.insert("greeting".to_string(), "bonjour".to_string());
    let report = config_set::apply(&changed, &reconciler).await;
    assert!(report.is_success(), "{:?}", report.errors);

    for cm in store.objects(&kinds::config_map()) {
        assert_eq!(cm.data["data"]["greeting"], "bonjour");
    }
}

#[tokio::test(start_paused = true)]
async fn status_reflects_the_pass() {
    let (_store, reconciler) = setup();
    let cs = config_set(2);
    let report = config_set::apply(&cs, &reconciler).await;

    let status = config_set::status_for(&cs, &report, Utc::now());
    assert_eq!(status.phase.as_deref(), Some("Ready"));
    assert_eq!(status.managed_objects, Some(3));
    assert_eq!(status.observed_generation, Some(1));
    assert_eq!(status.conditions[0].reason.as_deref(), Some("Reconciled"));
}

#[tokio::test(start_paused = true)]
async fn foreign_config_map_blocks_the_pass() {
    let (store, reconciler) = setup();
    let mut foreign = ConfigSet::new("other", config_set(1).spec);
    foreign.metadata.namespace = Some(NAMESPACE.to_string());
    foreign.metadata.uid = Some("3b0c2f7e-0000-4000-8000-00000000beef".to_string());
    config_set::apply(&foreign, &reconciler).await;

    let report = config_set::apply(&config_set(1), &reconciler).await;
    assert!(report.errors.iter().any(|e| e.is_tagging_conflict()));

    let status = config_set::status_for(&config_set(1), &report, Utc::now());
    assert_eq!(status.phase.as_deref(), Some("Failed"));

    let cm = store
        .object(&ObjectKey::new(&kinds::config_map(), Some(NAMESPACE), "asd-0"))
        .unwrap();
    assert_eq!(cm.owner_references()[0].name, "other");
}

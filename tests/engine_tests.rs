//! Integration tests for the declarative engine
//!
//! These tests drive full reconciliation passes against the in-memory store
//! and check convergence, idempotence, ownership and cleanup behaviour.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::core::{DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use serde_json::{json, Value};

use kube_declarative::backoff::Backoff;
use kube_declarative::declarative::{
    Builder, ConfigMapInventory, DesiredObject, DesiredState, DesiredStatePolicy, InventoryStore,
    InventoryTracker, ObjectModifier, ObjectState, PolicyChain, PreserveClusterIp, RecordKey, ReconcileReport, Reconciler,
    ReconcilerOptions, RecreatePolicy, ResourceOutcome, ResourceOwner, MANAGED_BY_ANNOTATION,
    RELATED_TO_ANNOTATION,
};
use kube_declarative::error::{Error, Result};
use kube_declarative::store::{
    kinds, DeleteOptions, MemoryStore, ObjectKey, ObjectStore, Operation, WriteOptions,
};

// ============================================================================
// Test Helpers
// ============================================================================

const NAMESPACE: &str = "control";

fn owner() -> ResourceOwner {
    ResourceOwner::new(
        "sample",
        Some(NAMESPACE),
        GroupVersionKind::gvk("declarative.dev", "v1alpha1", "ConfigSet"),
    )
    .with_uid("6f1c1a52-0000-4000-8000-000000000001")
}

fn object(value: Value) -> DynamicObject {
    serde_json::from_value(value).unwrap()
}

fn config_map(name: &str, value: &str) -> DynamicObject {
    config_map_in(NAMESPACE, name, value)
}

fn config_map_in(namespace: &str, name: &str, value: &str) -> DynamicObject {
    object(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name, "namespace": namespace},
        "data": {"value": value}
    }))
}

fn deployment(name: &str, replicas: i64, app: &str) -> DynamicObject {
    object(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": name, "namespace": NAMESPACE},
        "spec": {
            "replicas": replicas,
            "selector": {"matchLabels": {"app": app}},
            "template": {
                "metadata": {"labels": {"app": app}},
                "spec": {"containers": [{"name": "web", "image": "nginx:1.27"}]}
            }
        }
    }))
}

fn cm_key(name: &str) -> ObjectKey {
    ObjectKey::new(&kinds::config_map(), Some(NAMESPACE), name)
}

fn with_policy(obj: DynamicObject, policy: impl DesiredStatePolicy + Clone + 'static) -> Box<dyn Builder> {
    Box::new(move || -> Result<DesiredObject> { Ok(DesiredObject::new(obj.clone(), policy.clone())) })
}

fn present(obj: DynamicObject) -> Box<dyn Builder> {
    with_policy(obj, DesiredState::Present)
}

fn failing(message: &'static str) -> Box<dyn Builder> {
    Box::new(move || -> Result<DesiredObject> { Err(Error::validation(message)) })
}

fn setup(options: ReconcilerOptions) -> (Arc<MemoryStore>, Reconciler) {
    let store = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::new(store.clone(), options);
    (store, reconciler)
}

fn config_maps() -> Vec<GroupVersionKind> {
    vec![kinds::config_map()]
}

fn outcomes(report: &ReconcileReport) -> Vec<ResourceOutcome> {
    report.objects.iter().filter_map(|o| o.outcome.clone()).collect()
}

// ============================================================================
// Convergence & Idempotence
// ============================================================================

#[tokio::test]
async fn second_pass_with_unchanged_builders_writes_nothing() {
    let (store, reconciler) = setup(ReconcilerOptions {
        owner_references: true,
        ..Default::default()
    });
    let builders = vec![
        present(config_map("a", "1")),
        present(config_map("b", "2")),
        present(deployment("web", 1, "web")),
    ];

    let first = reconciler.reconcile(&owner(), "web", &builders, &config_maps()).await;
    assert!(first.is_success(), "{:?}", first.errors);
    assert_eq!(store.mutations(), 3);

    let second = reconciler.reconcile(&owner(), "web", &builders, &config_maps()).await;
    assert!(second.is_success(), "{:?}", second.errors);
    assert_eq!(store.mutations(), 3);
    assert_eq!(second.mutations(), 0);
    assert!(outcomes(&second).iter().all(|o| *o == ResourceOutcome::InSync));
}

#[tokio::test]
async fn shrinking_builder_list_purges_exactly_the_dropped_objects() {
    let (store, reconciler) = setup(ReconcilerOptions::default());
    let all: Vec<Box<dyn Builder>> = (1..=3)
        .map(|i| present(config_map(&format!("cm-{}", i), "v")))
        .collect();
    let report = reconciler.reconcile(&owner(), "web", &all, &config_maps()).await;
    assert!(report.is_success());

    let fewer = vec![present(config_map("cm-1", "v"))];
    let report = reconciler.reconcile(&owner(), "web", &fewer, &config_maps()).await;
    assert!(report.is_success(), "{:?}", report.errors);

    let purged: Vec<String> = report
        .keys(ObjectState::Purged)
        .into_iter()
        .map(|k| k.name.clone())
        .collect();
    assert_eq!(purged, ["cm-3", "cm-2"]);
    assert!(store.contains(&cm_key("cm-1")));
    assert!(!store.contains(&cm_key("cm-2")));
    assert!(!store.contains(&cm_key("cm-3")));
}

#[tokio::test]
async fn changed_content_is_updated() {
    let (store, reconciler) = setup(ReconcilerOptions::default());
    reconciler
        .reconcile(&owner(), "web", &[present(config_map("a", "1"))], &config_maps())
        .await;

    let report = reconciler
        .reconcile(&owner(), "web", &[present(config_map("a", "2"))], &config_maps())
        .await;
    assert_eq!(outcomes(&report), [ResourceOutcome::Updated]);
    assert_eq!(store.object(&cm_key("a")).unwrap().data["data"]["value"], "2");
}

#[tokio::test]
async fn foreign_metadata_survives_updates() {
    let (store, reconciler) = setup(ReconcilerOptions::default());
    reconciler
        .reconcile(&owner(), "web", &[present(config_map("a", "1"))], &config_maps())
        .await;
    store
        .modify(&cm_key("a"), |obj| {
            obj.labels_mut().insert("team".to_string(), "platform".to_string());
        })
        .unwrap();

    reconciler
        .reconcile(&owner(), "web", &[present(config_map("a", "2"))], &config_maps())
        .await;
    let stored = store.object(&cm_key("a")).unwrap();
    assert_eq!(stored.labels().get("team").map(String::as_str), Some("platform"));
    assert_eq!(stored.data["data"]["value"], "2");
}

// ============================================================================
// Ownership
// ============================================================================

#[tokio::test]
async fn objects_are_tagged_with_component_and_owner() {
    let (store, reconciler) = setup(ReconcilerOptions::default());
    reconciler
        .reconcile(&owner(), "web", &[present(config_map("a", "1"))], &config_maps())
        .await;

    let stored = store.object(&cm_key("a")).unwrap();
    assert_eq!(
        stored.annotations().get(MANAGED_BY_ANNOTATION).map(String::as_str),
        Some("sample-control-web-declarative.dev/v1alpha1-configset")
    );
    assert_eq!(
        stored.annotations().get(RELATED_TO_ANNOTATION).map(String::as_str),
        Some("control/sample")
    );
}

#[tokio::test]
async fn object_owned_by_another_component_is_left_alone() {
    let (store, reconciler) = setup(ReconcilerOptions::default());
    let mut foreign = config_map("a", "theirs");
    foreign
        .annotations_mut()
        .insert(MANAGED_BY_ANNOTATION.to_string(), "someone-else".to_string());
    store.insert(foreign).unwrap();

    let report = reconciler
        .reconcile(&owner(), "web", &[present(config_map("a", "ours"))], &config_maps())
        .await;

    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].is_tagging_conflict());
    assert_eq!(store.mutations(), 0);
    assert_eq!(store.object(&cm_key("a")).unwrap().data["data"]["value"], "theirs");
}

#[tokio::test]
async fn purge_never_touches_objects_of_other_components() {
    let (store, reconciler) = setup(ReconcilerOptions::default());
    let other_id = "other-control-web-declarative.dev/v1alpha1-configset";
    let mut foreign = config_map("theirs", "1");
    foreign
        .annotations_mut()
        .insert(MANAGED_BY_ANNOTATION.to_string(), other_id.to_string());
    store.insert(foreign).unwrap();

    let three: Vec<Box<dyn Builder>> = (1..=3)
        .map(|i| present(config_map(&format!("cm-{}", i), "v")))
        .collect();
    let report = reconciler.reconcile(&owner(), "web", &three, &config_maps()).await;
    assert!(report.is_success(), "{:?}", report.errors);

    let one = vec![present(config_map("cm-1", "v"))];
    let report = reconciler.reconcile(&owner(), "web", &one, &config_maps()).await;
    assert!(report.is_success(), "{:?}", report.errors);
    assert_eq!(report.keys(ObjectState::Purged).len(), 2);

    let report = reconciler.reconcile(&owner(), "web", &[], &config_maps()).await;
    assert!(report.is_success(), "{:?}", report.errors);

    let stored = store.object(&cm_key("theirs")).unwrap();
    assert_eq!(
        stored.annotations().get(MANAGED_BY_ANNOTATION).map(String::as_str),
        Some(other_id)
    );
    assert_eq!(stored.data["data"]["value"], "1");
    assert_eq!(stored.metadata.resource_version.as_deref(), Some("1"));
}

#[tokio::test]
async fn untagged_objects_are_updated_but_not_claimed() {
    let (store, reconciler) = setup(ReconcilerOptions::default());
    store.insert(config_map("a", "old")).unwrap();

    let report = reconciler
        .reconcile(&owner(), "web", &[present(config_map("a", "new"))], &config_maps())
        .await;
    assert!(report.is_success(), "{:?}", report.errors);

    let stored = store.object(&cm_key("a")).unwrap();
    assert_eq!(stored.data["data"]["value"], "new");
    assert!(!stored.annotations().contains_key(MANAGED_BY_ANNOTATION));

    // never purged either, since it carries no component id
    let report = reconciler.reconcile(&owner(), "web", &[], &config_maps()).await;
    assert!(report.keys(ObjectState::Purged).is_empty());
    assert!(store.contains(&cm_key("a")));
}

#[tokio::test]
async fn owner_references_stay_inside_the_owner_namespace() {
    let (store, reconciler) = setup(ReconcilerOptions {
        owner_references: true,
        ..Default::default()
    });
    let cluster_role = object(json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "ClusterRole",
        "metadata": {"name": "sample-reader"},
        "rules": []
    }));
    let builders = vec![
        present(config_map("local", "1")),
        present(config_map_in("elsewhere", "remote", "1")),
        present(cluster_role),
    ];

    let report = reconciler.reconcile(&owner(), "web", &builders, &[]).await;
    assert!(report.is_success(), "{:?}", report.errors);

    let local = store.object(&cm_key("local")).unwrap();
    assert_eq!(local.owner_references().len(), 1);
    assert_eq!(local.owner_references()[0].kind, "ConfigSet");

    let remote = store
        .object(&ObjectKey::new(&kinds::config_map(), Some("elsewhere"), "remote"))
        .unwrap();
    assert!(remote.owner_references().is_empty());

    let role_gvk = GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "ClusterRole");
    let role = store.object(&ObjectKey::new(&role_gvk, None, "sample-reader")).unwrap();
    assert!(role.owner_references().is_empty());
}

// ============================================================================
// Failure Isolation
// ============================================================================

#[tokio::test]
async fn builder_failure_is_isolated_and_blocks_purge() {
    let (store, reconciler) = setup(ReconcilerOptions::default());
    reconciler
        .reconcile(&owner(), "web", &[present(config_map("stale", "1"))], &config_maps())
        .await;

    let builders = vec![
        present(config_map("a", "1")),
        failing("template rendering failed"),
        present(config_map("b", "1")),
    ];
    let report = reconciler.reconcile(&owner(), "web", &builders, &config_maps()).await;

    assert_eq!(report.errors.len(), 1);
    assert!(matches!(report.errors[0], Error::Builder { index: 1, .. }));
    assert!(store.contains(&cm_key("a")));
    assert!(store.contains(&cm_key("b")));
    // purge skipped because of the failure
    assert!(store.contains(&cm_key("stale")));
    assert!(report.into_result().is_err());
}

#[tokio::test]
async fn store_failures_are_collected_per_object() {
    let (store, reconciler) = setup(ReconcilerOptions::default());
    store.fail(Operation::Create, &cm_key("a"), "quota exceeded");

    let builders = vec![present(config_map("a", "1")), present(config_map("b", "1"))];
    let report = reconciler.reconcile(&owner(), "web", &builders, &config_maps()).await;

    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].to_string().contains("quota exceeded"));
    assert!(store.contains(&cm_key("b")));
}

#[tokio::test]
async fn purge_list_failures_are_reported() {
    let (store, reconciler) = setup(ReconcilerOptions::default());
    store.fail_list(&kinds::config_map(), "list timed out");

    let report = reconciler.reconcile(&owner(), "web", &[], &config_maps()).await;
    assert_eq!(report.errors.len(), 1);
    assert!(matches!(report.errors[0], Error::Purge { .. }));
}

#[tokio::test]
async fn unknown_purge_types_are_skipped() {
    let (_store, reconciler) = setup(ReconcilerOptions::default());
    let gadgets = vec![GroupVersionKind::gvk("example.com", "v1", "Gadget")];
    let report = reconciler.reconcile(&owner(), "web", &[], &gadgets).await;
    assert!(report.is_success(), "{:?}", report.errors);
}

#[tokio::test]
async fn empty_component_name_is_rejected() {
    let (store, reconciler) = setup(ReconcilerOptions::default());
    let report = reconciler
        .reconcile(&owner(), "", &[present(config_map("a", "1"))], &config_maps())
        .await;
    assert!(matches!(report.errors.as_slice(), [Error::Validation(_)]));
    assert_eq!(store.mutations(), 0);
}

// ============================================================================
// Deletion & Recreation
// ============================================================================

#[tokio::test]
async fn terminating_objects_are_not_written_and_requeue() {
    let (store, reconciler) = setup(ReconcilerOptions::default());
    let mut held = config_map("a", "1");
    held.metadata.finalizers = Some(vec!["example.com/hold".to_string()]);
    let held = store.insert(held).unwrap();
    store.delete(&held, &DeleteOptions::default()).await.unwrap();
    let before = store.mutations();

    let report = reconciler
        .reconcile(&owner(), "web", &[present(config_map("a", "2"))], &config_maps())
        .await;

    assert_eq!(
        outcomes(&report),
        [ResourceOutcome::Terminating {
            requeue_after: Duration::from_secs(5)
        }]
    );
    assert_eq!(report.requeue_after, Some(Duration::from_secs(5)));
    assert_eq!(store.mutations(), before);
}

#[tokio::test]
async fn immutable_change_recreates_allowed_kinds() {
    let (store, reconciler) = setup(ReconcilerOptions {
        recreate: RecreatePolicy::allow_list(),
        ..Default::default()
    });
    store.add_immutable_field(&kinds::deployment(), "/spec/selector");
    let key = ObjectKey::new(&kinds::deployment(), Some(NAMESPACE), "web");

    reconciler
        .reconcile(&owner(), "web", &[present(deployment("web", 1, "v1"))], &[])
        .await;

    let changed = [present(deployment("web", 1, "v2"))];
    let report = reconciler.reconcile(&owner(), "web", &changed, &[]).await;
    assert!(report.is_success(), "{:?}", report.errors);
    assert_eq!(report.requeue_after, Some(Duration::from_secs(10)));
    assert!(!store.contains(&key));

    let report = reconciler.reconcile(&owner(), "web", &changed, &[]).await;
    assert_eq!(outcomes(&report), [ResourceOutcome::Created]);
    assert_eq!(
        store.object(&key).unwrap().data["spec"]["selector"]["matchLabels"]["app"],
        "v2"
    );
}

#[tokio::test]
async fn immutable_change_is_fatal_without_recreate_permission() {
    let (store, reconciler) = setup(ReconcilerOptions::default());
    store.add_immutable_field(&kinds::deployment(), "/spec/selector");
    reconciler
        .reconcile(&owner(), "web", &[present(deployment("web", 1, "v1"))], &[])
        .await;

    let report = reconciler
        .reconcile(&owner(), "web", &[present(deployment("web", 1, "v2"))], &[])
        .await;
    assert!(matches!(report.errors.as_slice(), [Error::ImmutableField { .. }]));
    assert!(store.contains(&ObjectKey::new(&kinds::deployment(), Some(NAMESPACE), "web")));
}

#[tokio::test]
async fn allow_list_does_not_cover_other_kinds() {
    let (store, reconciler) = setup(ReconcilerOptions {
        recreate: RecreatePolicy::allow_list(),
        ..Default::default()
    });
    store.add_immutable_field(&kinds::config_map(), "/data/value");
    reconciler
        .reconcile(&owner(), "web", &[present(config_map("a", "1"))], &config_maps())
        .await;

    let report = reconciler
        .reconcile(&owner(), "web", &[present(config_map("a", "2"))], &config_maps())
        .await;
    assert!(matches!(report.errors.as_slice(), [Error::ImmutableField { .. }]));
    assert!(store.contains(&cm_key("a")));
}

#[tokio::test]
async fn absent_objects_are_deleted_once() {
    let (store, reconciler) = setup(ReconcilerOptions::default());
    reconciler
        .reconcile(&owner(), "web", &[present(config_map("a", "1"))], &[])
        .await;

    let gone = [with_policy(config_map("a", "1"), DesiredState::Absent)];
    let report = reconciler.reconcile(&owner(), "web", &gone, &[]).await;
    assert_eq!(outcomes(&report), [ResourceOutcome::Deleted]);
    assert!(!store.contains(&cm_key("a")));

    let report = reconciler.reconcile(&owner(), "web", &gone, &[]).await;
    assert_eq!(outcomes(&report), [ResourceOutcome::AlreadyAbsent]);
}

// ============================================================================
// Policies
// ============================================================================

#[derive(Clone)]
struct Frozen;

impl DesiredStatePolicy for Frozen {
    fn desired_state(&self) -> DesiredState {
        DesiredState::Present
    }

    fn should_update(&self, _current: &DynamicObject, _desired: &DynamicObject) -> Result<bool> {
        Ok(false)
    }
}

#[derive(Clone)]
struct DryRunUpdates;

impl DesiredStatePolicy for DryRunUpdates {
    fn desired_state(&self) -> DesiredState {
        DesiredState::Present
    }

    fn update_options(&self, opts: &mut WriteOptions) {
        opts.dry_run = true;
    }
}

#[tokio::test]
async fn update_gate_skips_changes() {
    let (store, reconciler) = setup(ReconcilerOptions::default());
    reconciler
        .reconcile(&owner(), "web", &[with_policy(config_map("a", "1"), Frozen)], &[])
        .await;

    let report = reconciler
        .reconcile(&owner(), "web", &[with_policy(config_map("a", "2"), Frozen)], &[])
        .await;
    assert_eq!(outcomes(&report), [ResourceOutcome::Skipped]);
    assert_eq!(store.object(&cm_key("a")).unwrap().data["data"]["value"], "1");
}

#[tokio::test]
async fn create_only_objects_are_never_updated() {
    let (store, reconciler) = setup(ReconcilerOptions::default());
    reconciler
        .reconcile(&owner(), "web", &[with_policy(config_map("a", "1"), DesiredState::Created)], &[])
        .await;

    let report = reconciler
        .reconcile(&owner(), "web", &[with_policy(config_map("a", "2"), DesiredState::Created)], &[])
        .await;
    assert_eq!(outcomes(&report), [ResourceOutcome::InSync]);
    assert_eq!(store.object(&cm_key("a")).unwrap().data["data"]["value"], "1");
}

#[tokio::test]
async fn chained_option_providers_apply_to_writes() {
    let (store, reconciler) = setup(ReconcilerOptions::default());
    reconciler
        .reconcile(&owner(), "web", &[present(config_map("a", "1"))], &[])
        .await;
    let before = store.mutations();

    let chain = PolicyChain::default()
        .with(DesiredState::Present)
        .with(DryRunUpdates);
    let report = reconciler
        .reconcile(&owner(), "web", &[with_policy(config_map("a", "2"), chain)], &[])
        .await;
    assert_eq!(outcomes(&report), [ResourceOutcome::Updated]);
    assert_eq!(store.mutations(), before);
    assert_eq!(store.object(&cm_key("a")).unwrap().data["data"]["value"], "1");
}

#[tokio::test]
async fn service_cluster_ip_is_preserved() {
    let (store, reconciler) = setup(ReconcilerOptions::default());
    let service = |port: i64| {
        object(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "web", "namespace": NAMESPACE},
            "spec": {"ports": [{"port": port}]}
        }))
    };
    let key = ObjectKey::new(&kinds::service(), Some(NAMESPACE), "web");

    reconciler
        .reconcile(&owner(), "web", &[with_policy(service(80), PreserveClusterIp)], &[])
        .await;
    store
        .modify(&key, |obj| obj.data["spec"]["clusterIP"] = json!("10.96.0.17"))
        .unwrap();

    let report = reconciler
        .reconcile(&owner(), "web", &[with_policy(service(8080), PreserveClusterIp)], &[])
        .await;
    assert!(report.is_success(), "{:?}", report.errors);
    let stored = store.object(&key).unwrap();
    assert_eq!(stored.data["spec"]["clusterIP"], "10.96.0.17");
    assert_eq!(stored.data["spec"]["ports"][0]["port"], 8080);
}

#[tokio::test]
async fn modifiers_run_on_every_object() {
    let part_of: ObjectModifier = Arc::new(|obj: &mut DynamicObject| -> Result<()> {
        obj.labels_mut()
            .insert("app.kubernetes.io/part-of".to_string(), "sample".to_string());
        Ok(())
    });
    let (store, reconciler) = setup(ReconcilerOptions {
        modifiers: vec![part_of],
        ..Default::default()
    });
    reconciler
        .reconcile(&owner(), "web", &[present(config_map("a", "1"))], &[])
        .await;
    let stored = store.object(&cm_key("a")).unwrap();
    assert_eq!(
        stored.labels().get("app.kubernetes.io/part-of").map(String::as_str),
        Some("sample")
    );
}

// ============================================================================
// Schema Definitions
// ============================================================================

#[tokio::test]
async fn defined_type_is_usable_in_the_same_pass() {
    let (store, reconciler) = setup(ReconcilerOptions::default());
    let crd = object(json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": {"name": "widgets.example.com"},
        "spec": {
            "group": "example.com",
            "scope": "Namespaced",
            "names": {"kind": "Widget", "plural": "widgets"},
            "versions": [{"name": "v1", "served": true, "storage": true}]
        }
    }));
    let widget = object(json!({
        "apiVersion": "example.com/v1",
        "kind": "Widget",
        "metadata": {"name": "w", "namespace": NAMESPACE},
        "spec": {"size": 3}
    }));

    let report = reconciler
        .reconcile(&owner(), "web", &[present(crd), present(widget)], &[])
        .await;
    assert!(report.is_success(), "{:?}", report.errors);

    let widget_gvk = GroupVersionKind::gvk("example.com", "v1", "Widget");
    assert!(store.contains(&ObjectKey::new(&widget_gvk, Some(NAMESPACE), "w")));
}

// ============================================================================
// Readiness
// ============================================================================

#[tokio::test(start_paused = true)]
async fn readiness_times_out_until_replicas_are_ready() {
    let (store, reconciler) = setup(ReconcilerOptions {
        readiness: Some(Backoff::fixed(Duration::from_secs(1), 3)),
        ..Default::default()
    });
    let builders = [present(deployment("web", 2, "web"))];

    let report = reconciler.reconcile(&owner(), "web", &builders, &[]).await;
    assert!(matches!(
        report.errors.as_slice(),
        [Error::ReadinessTimeout { attempts: 3, .. }]
    ));

    let key = ObjectKey::new(&kinds::deployment(), Some(NAMESPACE), "web");
    store
        .modify(&key, |obj| obj.data["status"] = json!({"readyReplicas": 2}))
        .unwrap();
    let report = reconciler.reconcile(&owner(), "web", &builders, &[]).await;
    assert!(report.is_success(), "{:?}", report.errors);
}

#[tokio::test(start_paused = true)]
async fn readiness_waits_for_purged_objects_to_disappear() {
    let (store, reconciler) = setup(ReconcilerOptions {
        readiness: Some(Backoff::fixed(Duration::from_secs(1), 2)),
        ..Default::default()
    });
    reconciler
        .reconcile(&owner(), "web", &[present(config_map("a", "1"))], &config_maps())
        .await;
    store
        .modify(&cm_key("a"), |obj| {
            obj.metadata.finalizers = Some(vec!["example.com/hold".to_string()]);
        })
        .unwrap();

    let report = reconciler.reconcile(&owner(), "web", &[], &config_maps()).await;
    assert_eq!(report.keys(ObjectState::Purged).len(), 1);
    assert!(matches!(
        report.errors.as_slice(),
        [Error::ReadinessTimeout { phase, .. }] if phase == "absent"
    ));
}

#[tokio::test(start_paused = true)]
async fn absent_object_of_unserved_type_is_ready() {
    let (_store, reconciler) = setup(ReconcilerOptions {
        readiness: Some(Backoff::fixed(Duration::from_secs(1), 3)),
        ..Default::default()
    });
    let widget = object(json!({
        "apiVersion": "example.com/v1",
        "kind": "Widget",
        "metadata": {"name": "w", "namespace": NAMESPACE}
    }));

    let report = reconciler
        .reconcile(&owner(), "web", &[with_policy(widget, DesiredState::Absent)], &[])
        .await;
    assert_eq!(outcomes(&report), [ResourceOutcome::AlreadyAbsent]);
    assert!(report.is_success(), "{:?}", report.errors);
}

// ============================================================================
// Inventory
// ============================================================================

fn inventory(store: &Arc<MemoryStore>) -> (InventoryTracker, Arc<ConfigMapInventory>) {
    let records = Arc::new(ConfigMapInventory::new(store.clone()));
    (
        InventoryTracker::new(store.clone(), records.clone(), "ops"),
        records,
    )
}

#[tokio::test]
async fn inventory_collects_objects_dropped_between_passes() {
    let (store, reconciler) = setup(ReconcilerOptions::default());
    let (tracker, records) = inventory(&store);

    let first = vec![
        DesiredObject::present(config_map("a", "1")),
        DesiredObject::present(config_map("b", "1")),
    ];
    for d in &first {
        reconciler.resources().reconcile(d.clone()).await.unwrap();
    }
    let deleted = tracker
        .collect_garbage(&owner(), "web", &first, reconciler.resources())
        .await
        .unwrap();
    assert!(deleted.is_empty());

    let record = RecordKey::for_component(&owner(), "web", "ops");
    assert_eq!(records.load(&record).await.unwrap().unwrap().len(), 2);

    let second = vec![DesiredObject::present(config_map("a", "1"))];
    let deleted = tracker
        .collect_garbage(&owner(), "web", &second, reconciler.resources())
        .await
        .unwrap();
    assert_eq!(deleted, [cm_key("b")]);
    assert!(store.contains(&cm_key("a")));
    assert!(!store.contains(&cm_key("b")));
    assert_eq!(records.load(&record).await.unwrap().unwrap(), [cm_key("a")]);
}

#[tokio::test]
async fn inventory_never_returns_protected_or_terminating_objects() {
    let (store, _reconciler) = setup(ReconcilerOptions::default());
    let (tracker, _records) = inventory(&store);

    let namespace = object(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "team"}}));
    store.insert(namespace.clone()).unwrap();
    let mut held = config_map("held", "1");
    held.metadata.finalizers = Some(vec!["example.com/hold".to_string()]);
    let held = store.insert(held).unwrap();
    store.insert(config_map("plain", "1")).unwrap();

    let previous = vec![
        DesiredObject::present(namespace),
        DesiredObject::present(held.clone()),
        DesiredObject::present(config_map("plain", "1")),
    ];
    assert!(tracker.track(&owner(), "web", &previous).await.unwrap().is_empty());

    store.delete(&held, &DeleteOptions::default()).await.unwrap();
    let deletable = tracker.track(&owner(), "web", &[]).await.unwrap();
    let names: Vec<String> = deletable.iter().map(|o| o.name_any()).collect();
    assert_eq!(names, ["plain"]);
}

#[tokio::test]
async fn inventory_defaults_missing_namespaces_to_the_owner() {
    let (store, _reconciler) = setup(ReconcilerOptions::default());
    let (tracker, records) = inventory(&store);

    let unplaced = object(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}}));
    tracker
        .track(&owner(), "web", &[DesiredObject::present(unplaced)])
        .await
        .unwrap();

    let record = RecordKey::for_component(&owner(), "web", "ops");
    let saved = records.load(&record).await.unwrap().unwrap();
    assert_eq!(saved, [cm_key("a")]);

    let raw = store
        .object(&ObjectKey::new(&kinds::config_map(), Some("ops"), &record.name))
        .unwrap();
    let data: BTreeMap<String, String> = serde_json::from_value(raw.data["data"].clone()).unwrap();
    assert_eq!(data["references"], "/v1/ConfigMap/control/a");
}

//! ConfigSet reconciler
//!
//! Handles the business logic for ConfigSet resources:
//! - Spec validation
//! - Builders for the generated ConfigMaps and the kept Secret
//! - Engine passes for apply and cleanup
//! - Status updates

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{
    api::{ObjectMeta, Patch, PatchParams},
    core::GroupVersionKind,
    Api, Client, ResourceExt,
};
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::FIELD_MANAGER;
use crate::crd::{Condition, ConfigSet, ConfigSetStatus};
use crate::declarative::{
    to_dynamic, Builder, DesiredObject, ObjectState, ReconcileReport, Reconciler, ResourceOwner,
};
use crate::error::{Error, Result};
use crate::store::kinds;

/// Component name of everything a ConfigSet produces
pub const COMPONENT: &str = "web";

/// Upper bound on generated ConfigMaps per ConfigSet
pub const MAX_COUNT: u32 = 256;

const MAX_NAME_LEN: usize = 253;

lazy_static::lazy_static! {
    static ref DNS_SUBDOMAIN: Regex =
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap();
}

fn validate_name(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::validation(format!("{} must not be empty", field)));
    }
    if value.len() > MAX_NAME_LEN || !DNS_SUBDOMAIN.is_match(value) {
        return Err(Error::validation(format!(
            "{} '{}' is not a valid lowercase DNS subdomain name",
            field, value
        )));
    }
    Ok(())
}

/// Validate the ConfigSet spec
pub fn validate(config_set: &ConfigSet) -> Result<()> {
    let spec = &config_set.spec;
    if spec.count > MAX_COUNT {
        return Err(Error::validation(format!(
            "count {} exceeds the maximum of {}",
            spec.count, MAX_COUNT
        )));
    }

    // largest generated name must be valid too
    validate_name("prefix", &config_map_name(&spec.prefix, spec.count.saturating_sub(1)))
        .map_err(|_| Error::validation(format!("prefix '{}' does not yield valid ConfigMap names", spec.prefix)))?;
    validate_name("secretName", &spec.secret_name)?;

    if spec.count > 0 && spec.secret_name.starts_with(&format!("{}-", spec.prefix)) {
        let suffix = &spec.secret_name[spec.prefix.len() + 1..];
        if suffix.parse::<u32>().is_ok_and(|i| i < spec.count) {
            return Err(Error::validation(format!(
                "secretName '{}' collides with a generated ConfigMap name",
                spec.secret_name
            )));
        }
    }
    Ok(())
}

pub fn owner(config_set: &ConfigSet) -> ResourceOwner {
    ResourceOwner::from_resource(config_set)
}

/// Name of the i-th generated ConfigMap, starting at 0
pub fn config_map_name(prefix: &str, index: u32) -> String {
    format!("{}-{}", prefix, index)
}

fn config_map(namespace: &str, name: &str, data: &BTreeMap<String, String>) -> Result<DesiredObject> {
    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(data.clone()),
        ..Default::default()
    };
    Ok(DesiredObject::present(to_dynamic(&cm)?))
}

fn secret(namespace: &str, name: &str) -> Result<DesiredObject> {
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        ..Default::default()
    };
    Ok(DesiredObject::present(to_dynamic(&secret)?))
}

/// One builder per generated ConfigMap, then the Secret
pub fn builders(config_set: &ConfigSet) -> Vec<Box<dyn Builder>> {
    let namespace = config_set.namespace().unwrap_or_else(|| "default".to_string());
    let spec = &config_set.spec;

    let mut builders: Vec<Box<dyn Builder>> = (0..spec.count)
        .map(|i| {
            let namespace = namespace.clone();
            let name = config_map_name(&spec.prefix, i);
            let data = spec.data.clone();
            Box::new(move || config_map(&namespace, &name, &data)) as Box<dyn Builder>
        })
        .collect();

    let secret_name = spec.secret_name.clone();
    builders.push(Box::new(move || secret(&namespace, &secret_name)));
    builders
}

/// Types swept for orphans; the Secret is deliberately absent
pub fn purge_types() -> Vec<GroupVersionKind> {
    vec![kinds::config_map()]
}

/// Drive the cluster toward the ConfigSet's spec
pub async fn apply(config_set: &ConfigSet, reconciler: &Reconciler) -> ReconcileReport {
    reconciler
        .reconcile(&owner(config_set), COMPONENT, &builders(config_set), &purge_types())
        .await
}

/// Pass with no desired objects: purges every generated ConfigMap, keeps the Secret
pub async fn cleanup(config_set: &ConfigSet, reconciler: &Reconciler) -> ReconcileReport {
    let report = reconciler
        .reconcile(&owner(config_set), COMPONENT, &[], &purge_types())
        .await;
    info!(
        name = %config_set.name_any(),
        purged = report.keys(ObjectState::Purged).len(),
        "cleaned up ConfigSet objects"
    );
    report
}

/// Status reflecting one engine pass
pub fn status_for(config_set: &ConfigSet, report: &ReconcileReport, now: DateTime<Utc>) -> ConfigSetStatus {
    let managed = u32::try_from(report.keys(ObjectState::Present).len()).unwrap_or(u32::MAX);
    let (phase, ready, reason, message) = if !report.errors.is_empty() {
        let message = report
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        ("Failed", "False", "ReconcileFailed", message)
    } else if let Some(after) = report.requeue_after {
        (
            "Progressing",
            "False",
            "WaitingForObjects",
            format!("objects still settling, retrying in {}s", after.as_secs()),
        )
    } else {
        (
            "Ready",
            "True",
            "Reconciled",
            format!("{} objects reconciled", managed),
        )
    };

    ConfigSetStatus {
        phase: Some(phase.to_string()),
        message: Some(message.clone()),
        managed_objects: Some(managed),
        observed_generation: config_set.metadata.generation,
        conditions: vec![ready_condition(config_set, ready, reason, message, now)],
    }
}

/// Status for a spec that failed validation
pub fn failed_status(config_set: &ConfigSet, error_message: &str, now: DateTime<Utc>) -> ConfigSetStatus {
    ConfigSetStatus {
        phase: Some("Failed".to_string()),
        message: Some(error_message.to_string()),
        managed_objects: None,
        observed_generation: config_set.metadata.generation,
        conditions: vec![ready_condition(
            config_set,
            "False",
            "ValidationFailed",
            error_message.to_string(),
            now,
        )],
    }
}

/// `Ready` condition; keeps the previous transition time while status and reason hold
fn ready_condition(
    config_set: &ConfigSet,
    status: &str,
    reason: &str,
    message: String,
    now: DateTime<Utc>,
) -> Condition {
    let last_transition_time = config_set
        .status
        .as_ref()
        .and_then(|s| s.conditions.iter().find(|c| c.type_ == "Ready"))
        .filter(|c| c.status == status && c.reason.as_deref() == Some(reason))
        .map_or(now, |c| c.last_transition_time);

    Condition {
        type_: "Ready".to_string(),
        status: status.to_string(),
        last_transition_time,
        reason: Some(reason.to_string()),
        message: Some(message),
    }
}

/// Whether writing `status` would change the stored object
pub fn status_changed(config_set: &ConfigSet, status: &ConfigSetStatus) -> bool {
    config_set.status.as_ref() != Some(status)
}

fn status_patch(status: &ConfigSetStatus) -> Result<Value> {
    Ok(json!({ "status": serde_json::to_value(status)? }))
}

/// Write a status to the ConfigSet's status subresource.
///
/// Unchanged statuses are not written, so the controller's own writes do not
/// wake it up again.
pub async fn update_status(
    config_set: &ConfigSet,
    client: &Client,
    namespace: &str,
    status: &ConfigSetStatus,
) -> Result<()> {
    let name = config_set.name_any();
    if !status_changed(config_set, status) {
        debug!(name = %name, "status unchanged, not patching");
        return Ok(());
    }
    let api: Api<ConfigSet> = Api::namespaced(client.clone(), namespace);

    api.patch_status(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(status_patch(status)?),
    )
    .await?;

    Ok(())
}

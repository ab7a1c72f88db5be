//! ConfigSet Custom Resource Definition

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ConfigSet resource specification
///
/// Produces `count` ConfigMaps named `<prefix>-<i>` carrying `data`, plus one
/// Secret that outlives the ConfigSet.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "declarative.dev",
    version = "v1alpha1",
    kind = "ConfigSet",
    plural = "configsets",
    singular = "configset",
    shortname = "cfs",
    namespaced,
    status = "ConfigSetStatus",
    printcolumn = r#"{"name": "Count", "type": "integer", "jsonPath": ".spec.count"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Managed", "type": "integer", "jsonPath": ".status.managedObjects"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSetSpec {
    /// Number of ConfigMaps to maintain
    pub count: u32,

    /// Name prefix of the generated ConfigMaps
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Data copied into every generated ConfigMap
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,

    /// Name of the Secret kept alongside the ConfigMaps
    #[serde(default = "default_secret_name")]
    pub secret_name: String,
}

fn default_prefix() -> String {
    "asd".to_string()
}

fn default_secret_name() -> String {
    "keep-the-secret".to_string()
}

/// ConfigSet status
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSetStatus {
    /// Current phase (Ready, Progressing, Failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Objects produced by the last successful pass
    #[serde(skip_serializing_if = "Option::is_none")]
    pub managed_objects: Option<u32>,

    /// Observed generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Status condition
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    /// Status (True, False, Unknown)
    pub status: String,

    /// Last transition time
    pub last_transition_time: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

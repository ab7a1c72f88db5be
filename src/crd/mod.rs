//! Custom Resource Definitions served by the operator

mod config_set;

pub use config_set::*;

use kube::CustomResourceExt;

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Result<Vec<String>, serde_yaml::Error> {
    Ok(vec![serde_yaml::to_string(&ConfigSet::crd())?])
}

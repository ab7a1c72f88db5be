//! Kubernetes controllers
//!
//! Controllers watch owner resources and hand each change to the matching
//! reconciler, which drives the declarative engine.

mod config_set_controller;

pub use config_set_controller::run as run_config_set_controller;

use std::sync::Arc;

use kube::Client;

use crate::config::OperatorConfig;
use crate::declarative::Reconciler;
use crate::store::KubeStore;

/// Shared context for all controllers
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Engine bound to the cluster store
    pub reconciler: Reconciler,
    pub config: OperatorConfig,
}

impl Context {
    /// Create a new context with a cluster-backed engine
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        let store = Arc::new(KubeStore::new(client.clone()));
        let reconciler = Reconciler::new(store, config.reconciler_options());
        Self {
            client,
            reconciler,
            config,
        }
    }
}

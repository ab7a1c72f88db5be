//! ConfigSet controller
//!
//! Watches ConfigSet resources and triggers reconciliation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config as WatcherConfig,
    },
    Api, Client, ResourceExt,
};
use tracing::{error, info, instrument, warn};

use crate::controllers::Context;
use crate::crd::ConfigSet;
use crate::declarative::ObjectState;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::config_set as config_set_reconciler;

/// Finalizer name for ConfigSet resources
const FINALIZER_NAME: &str = "declarative.dev/configset-finalizer";

const KIND: &str = "ConfigSet";

/// Resync interval once everything is in place
const RESYNC: Duration = Duration::from_secs(300);

/// Run the ConfigSet controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<ConfigSet> = match context.config.watch_namespace.as_deref() {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("ConfigSet CRD not installed: {}", e);
        return;
    }

    info!(
        namespace = context.config.watch_namespace.as_deref().unwrap_or("*"),
        "Starting ConfigSet controller"
    );

    Controller::new(api, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    info!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or("default"),
                        ?action,
                        "Reconciled ConfigSet"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation error");
                    metrics::RECONCILIATION_ERRORS.with_label_values(&[KIND]).inc();
                }
            }
        })
        .await;
}

/// Main reconciliation function
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<ConfigSet>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[KIND])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&[KIND]).inc();

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<ConfigSet> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, FINALIZER_NAME, obj, |event| async {
        match event {
            FinalizerEvent::Apply(config_set) => apply(config_set, ctx.clone()).await,
            FinalizerEvent::Cleanup(config_set) => cleanup(config_set, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

/// Apply reconciliation (create/update)
async fn apply(config_set: Arc<ConfigSet>, ctx: Arc<Context>) -> Result<Action> {
    let name = config_set.name_any();
    let namespace = config_set.namespace().unwrap_or_else(|| "default".to_string());

    info!(
        name = %name,
        namespace = %namespace,
        generation = config_set.metadata.generation.unwrap_or(0),
        count = config_set.spec.count,
        "Reconciling ConfigSet"
    );

    if let Err(e) = config_set_reconciler::validate(&config_set) {
        warn!(error = %e, "Validation failed");
        let status = config_set_reconciler::failed_status(&config_set, &e.to_string(), Utc::now());
        config_set_reconciler::update_status(&config_set, &ctx.client, &namespace, &status).await?;
        return Ok(Action::requeue(RESYNC));
    }

    let report = config_set_reconciler::apply(&config_set, &ctx.reconciler).await;

    metrics::MANAGED_OBJECTS
        .with_label_values(&[KIND, &namespace, &name])
        .set(report.keys(ObjectState::Present).len() as f64);
    let status = config_set_reconciler::status_for(&config_set, &report, Utc::now());
    config_set_reconciler::update_status(&config_set, &ctx.client, &namespace, &status).await?;

    match report.into_result()? {
        Some(after) => Ok(Action::requeue(after)),
        None => Ok(Action::requeue(RESYNC)),
    }
}

/// Cleanup when resource is being deleted
async fn cleanup(config_set: Arc<ConfigSet>, ctx: Arc<Context>) -> Result<Action> {
    let name = config_set.name_any();
    let namespace = config_set.namespace().unwrap_or_else(|| "default".to_string());
    info!(name = %name, "Cleaning up ConfigSet");

    // The Secret is not a purge type and stays behind
    let report = config_set_reconciler::cleanup(&config_set, &ctx.reconciler).await;
    report.into_result()?;

    metrics::CLEANUPS.with_label_values(&[KIND]).inc();
    let _ = metrics::MANAGED_OBJECTS.remove_label_values(&[KIND, &namespace, &name]);

    Ok(Action::await_change())
}

/// Requeue delay for a failed reconciliation
fn requeue_after(error: &Error) -> Duration {
    match error {
        Error::Validation(_) | Error::ImmutableField { .. } => Duration::from_secs(300),
        e if e.is_tagging_conflict() => Duration::from_secs(300),
        Error::ReadinessTimeout { .. } => Duration::from_secs(15),
        _ => Duration::from_secs(30),
    }
}

/// Error policy for the controller
fn error_policy(obj: Arc<ConfigSet>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    error!(
        name = %name,
        error = %error,
        "Reconciliation failed, scheduling retry"
    );

    Action::requeue(requeue_after(error))
}

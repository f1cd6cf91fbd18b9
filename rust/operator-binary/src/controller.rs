//! Drives reconciliation passes off the webhook Deployment, and on a fixed schedule
//!
//! Only one pass runs at a time. Shutting down drops the pass in flight, which is safe since the
//! certificates are persisted before any dependent is touched.

use std::{future::Future, sync::Arc};

use const_format::concatcp;
use futures::StreamExt;
use stackable_operator::{
    k8s_openapi::api::apps::v1::Deployment,
    kube::{
        runtime::{controller, watcher, Controller},
        Api, ResourceExt,
    },
    logging::controller::report_controller_reconciled,
    time::Duration,
};
use time::OffsetDateTime;
use tracing::info;

use crate::{
    config::ReconcileSettings,
    reconciler::{Error, PassReport, Reconciler},
    store::KubeStore,
    OPERATOR_NAME,
};

const CONTROLLER_NAME: &str = "webhook-certificates";
const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);

/// Backoff after a failed pass, much shorter than the regular interval.
const ERROR_REQUEUE_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

pub struct Ctx {
    pub store: KubeStore,
    pub settings: ReconcileSettings,
    /// Delay until the next pass after a successful one
    pub reconcile_interval: Duration,
}

/// Runs until `shutdown` resolves.
pub async fn start(
    client: &stackable_operator::client::Client,
    deployment_name: &str,
    ctx: Ctx,
    shutdown: impl Future<Output = ()> + Send + Sync + 'static,
) {
    let deployments =
        Api::<Deployment>::namespaced(client.as_kube_client(), &ctx.settings.identity.namespace);
    Controller::new(
        deployments,
        watcher::Config::default().fields(&format!("metadata.name={deployment_name}")),
    )
    .graceful_shutdown_on(shutdown)
    .run(reconcile, error_policy, Arc::new(ctx))
    .map(|res| report_controller_reconciled(client, FULL_CONTROLLER_NAME, &res))
    .collect::<()>()
    .await;
}

async fn reconcile(
    deployment: Arc<Deployment>,
    ctx: Arc<Ctx>,
) -> Result<controller::Action, Error> {
    info!(deployment = %deployment.name_any(), "reconciling webhook certificates");
    let report = Reconciler::new(&ctx.store, &ctx.store, &ctx.settings)
        .reconcile(OffsetDateTime::now_utc())
        .await?;
    info!(
        renewed_root = report.renewed_root,
        renewed_server = report.renewed_server,
        saved = report.saved,
        wrote_cert_files = report.wrote_cert_files,
        updated_dependents = report.updated.len(),
        "webhook certificates are up to date"
    );
    Ok(next_pass(Ok(&report), ctx.reconcile_interval))
}

fn error_policy(_obj: Arc<Deployment>, error: &Error, ctx: Arc<Ctx>) -> controller::Action {
    next_pass(Err(error), ctx.reconcile_interval)
}

/// The regular interval after a successful pass, a short backoff after a failed one.
fn next_pass(
    outcome: Result<&PassReport, &Error>,
    reconcile_interval: Duration,
) -> controller::Action {
    match outcome {
        Ok(_) => controller::Action::requeue(*reconcile_interval),
        Err(_) => controller::Action::requeue(ERROR_REQUEUE_DELAY),
    }
}

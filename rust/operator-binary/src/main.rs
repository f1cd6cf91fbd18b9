use std::path::PathBuf;

use clap::{crate_description, crate_version, Parser};
use futures::FutureExt;
use stackable_operator::{logging::TracingTarget, time::Duration};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use crate::{
    config::{
        CertificateLifetimes, DependentSelector, ReconcileSettings, ServerIdentity,
        DEFAULT_RECONCILE_INTERVAL, DEFAULT_RENEWAL_LEAD, DEFAULT_ROOT_LIFETIME,
        DEFAULT_SERVER_LIFETIME, SECRET_NAME_SUFFIX,
    },
    store::KubeStore,
};

mod bundle;
mod cert_files;
mod config;
mod controller;
mod dependents;
mod material;
mod reconciler;
mod store;
mod utils;

pub const APP_NAME: &str = "webhook-cert-manager";
pub const OPERATOR_NAME: &str = "webhook-cert-manager.stackable.tech";

#[derive(clap::Parser)]
#[clap(author, version)]
struct Opts {
    /// Namespace that the webhook runs in, and that the certificate Secret is stored in
    #[arg(long, env)]
    operator_namespace: String,
    /// Service that fronts the webhook
    #[arg(long, env)]
    service_name: String,
    /// Deployment of the webhook, the certificate Secret is named after it
    #[arg(long, env)]
    deployment_name: String,
    /// API group of the CustomResourceDefinitions that the webhook converts
    #[arg(long, env)]
    crd_group: String,
    /// MutatingWebhookConfiguration that points at the webhook
    #[arg(long, env)]
    webhook_config_name: String,
    /// Directory to write tls.key, tls.crt and ca.crt to, for a TLS server in the same process
    #[arg(long, env)]
    cert_dir: Option<PathBuf>,
    #[arg(long, env, default_value_t = DEFAULT_ROOT_LIFETIME)]
    root_lifetime: Duration,
    #[arg(long, env, default_value_t = DEFAULT_SERVER_LIFETIME)]
    server_lifetime: Duration,
    /// How long before expiry a certificate is renewed
    #[arg(long, env, default_value_t = DEFAULT_RENEWAL_LEAD)]
    renewal_lead: Duration,
    #[arg(long, env, default_value_t = DEFAULT_RECONCILE_INTERVAL)]
    reconcile_interval: Duration,
    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    tracing_target: TracingTarget,
}

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
    pub const TARGET: Option<&str> = option_env!("TARGET");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Opts {
        operator_namespace,
        service_name,
        deployment_name,
        crd_group,
        webhook_config_name,
        cert_dir,
        root_lifetime,
        server_lifetime,
        renewal_lead,
        reconcile_interval,
        tracing_target,
    } = Opts::parse();
    stackable_operator::logging::initialize_logging(
        "WEBHOOK_CERT_MANAGER_LOG",
        APP_NAME,
        tracing_target,
    );
    stackable_operator::utils::print_startup_string(
        crate_description!(),
        crate_version!(),
        built_info::GIT_VERSION,
        built_info::TARGET.unwrap_or("unknown target"),
        built_info::BUILT_TIME_UTC,
        built_info::RUSTC_VERSION,
    );

    let lifetimes = CertificateLifetimes {
        root: root_lifetime,
        server: server_lifetime,
        renewal_lead,
    };
    lifetimes.validate()?;

    let client = stackable_operator::client::create_client(Some(OPERATOR_NAME.to_string())).await?;
    let store = KubeStore::new(
        client.as_kube_client(),
        format!("{deployment_name}{SECRET_NAME_SUFFIX}"),
        &operator_namespace,
    );
    let ctx = controller::Ctx {
        store,
        settings: ReconcileSettings {
            identity: ServerIdentity {
                service_name,
                namespace: operator_namespace,
            },
            lifetimes,
            dependents: DependentSelector {
                crd_group,
                webhook_configuration_name: webhook_config_name,
            },
            cert_dir,
        },
        reconcile_interval,
    };

    let mut sigterm = signal(SignalKind::terminate())?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        sigterm.recv().await;
        info!("received SIGTERM, shutting down");
        let _ = shutdown_tx.send(());
    });
    controller::start(&client, &deployment_name, ctx, shutdown_rx.map(|_| ())).await;
    Ok(())
}

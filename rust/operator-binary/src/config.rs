//! Operational parameters of the certificate lifecycle and the names of the objects it manages

use std::path::PathBuf;

use snafu::{ensure, Snafu};
use stackable_operator::time::Duration;

/// The root is long-lived, every rotation has to be propagated to all dependents.
pub const DEFAULT_ROOT_LIFETIME: Duration = Duration::from_days_unchecked(2 * 365);

/// Server certificates are cheap to reissue since the bundle does not change.
pub const DEFAULT_SERVER_LIFETIME: Duration = Duration::from_days_unchecked(30);

/// How long before expiry a certificate is considered due for renewal.
///
/// Needs to be comfortably longer than [`DEFAULT_RECONCILE_INTERVAL`], so that at least one
/// pass runs inside the window.
pub const DEFAULT_RENEWAL_LEAD: Duration = Duration::from_days_unchecked(1);

/// Delay until the next pass after a successful one.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_hours_unchecked(3);

/// Suffix appended to the webhook deployment's name to get the name of the certificate Secret.
pub const SECRET_NAME_SUFFIX: &str = "-certs";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "renewal lead ({renewal_lead}) must be shorter than the server certificate lifetime ({server_lifetime})"
    ))]
    RenewalLeadTooLong {
        renewal_lead: Duration,
        server_lifetime: Duration,
    },

    #[snafu(display(
        "server certificate lifetime ({server_lifetime}) must not exceed the root lifetime ({root_lifetime})"
    ))]
    ServerOutlivesRoot {
        server_lifetime: Duration,
        root_lifetime: Duration,
    },
}

/// Validity windows of issued certificates.
#[derive(Clone, Debug)]
pub struct CertificateLifetimes {
    pub root: Duration,
    pub server: Duration,
    pub renewal_lead: Duration,
}

impl Default for CertificateLifetimes {
    fn default() -> Self {
        Self {
            root: DEFAULT_ROOT_LIFETIME,
            server: DEFAULT_SERVER_LIFETIME,
            renewal_lead: DEFAULT_RENEWAL_LEAD,
        }
    }
}

impl CertificateLifetimes {
    pub fn validate(&self) -> Result<(), Error> {
        ensure!(
            self.renewal_lead < self.server,
            RenewalLeadTooLongSnafu {
                renewal_lead: self.renewal_lead,
                server_lifetime: self.server,
            }
        );
        ensure!(
            self.server <= self.root,
            ServerOutlivesRootSnafu {
                server_lifetime: self.server,
                root_lifetime: self.root,
            }
        );
        Ok(())
    }
}

/// The in-cluster identity of the webhook's TLS endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerIdentity {
    pub service_name: String,
    pub namespace: String,
}

impl ServerIdentity {
    /// The trust domain that the server certificate is issued for.
    pub fn domain(&self) -> String {
        format!("{}.{}.svc", self.service_name, self.namespace)
    }

    /// All names the Service is reachable under from inside the cluster, the domain first.
    pub fn dns_names(&self) -> Vec<String> {
        let Self {
            service_name,
            namespace,
        } = self;
        vec![
            self.domain(),
            format!("{service_name}.{namespace}.svc.cluster.local"),
            format!("{service_name}.{namespace}"),
            service_name.clone(),
        ]
    }
}

/// Which cluster objects have to carry the CA bundle.
#[derive(Clone, Debug)]
pub struct DependentSelector {
    /// API group of the custom resource definitions served by the conversion webhook
    pub crd_group: String,
    /// Name of the MutatingWebhookConfiguration pointing at the webhook
    pub webhook_configuration_name: String,
}

/// Everything a reconciliation pass needs besides access to the cluster.
#[derive(Clone, Debug)]
pub struct ReconcileSettings {
    pub identity: ServerIdentity,
    pub lifetimes: CertificateLifetimes,
    pub dependents: DependentSelector,
    /// Where to write the served key pair, if the webhook reads it from disk
    pub cert_dir: Option<PathBuf>,
}

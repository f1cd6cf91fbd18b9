//! Boundary to the Kubernetes API: the Secret holding the [`CertificateRecord`], and the objects that carry the CA bundle

use std::collections::BTreeMap;

use async_trait::async_trait;
use snafu::Snafu;
use stackable_operator::{
    k8s_openapi::{
        api::{admissionregistration::v1::MutatingWebhookConfiguration, core::v1::Secret},
        apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
        ByteString,
    },
    kube::{self, api::entry, runtime::reflector::ObjectRef},
};

use crate::material::CertificateRecord;

pub mod kube_api;
#[cfg(test)]
pub mod memory;

pub use kube_api::KubeStore;

pub const ROOT_KEY: &str = "ca.key";
pub const ROOT_CERT: &str = "ca.crt";
pub const ROOT_CERT_PRIOR: &str = "ca.crt.old";
pub const SERVER_KEY: &str = "tls.key";
pub const SERVER_CERT: &str = "tls.crt";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to load certificates from {secret}"))]
    LoadSecret {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to save certificates to {secret}"))]
    SaveSecret {
        source: entry::CommitError,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to list CustomResourceDefinitions"))]
    ListCrds { source: kube::Error },

    #[snafu(display("failed to get {config}"))]
    GetWebhookConfiguration {
        source: kube::Error,
        config: ObjectRef<MutatingWebhookConfiguration>,
    },

    #[snafu(display("failed to update {crd}"))]
    ReplaceCrd {
        source: kube::Error,
        crd: ObjectRef<CustomResourceDefinition>,
    },

    #[snafu(display("failed to update {config}"))]
    ReplaceWebhookConfiguration {
        source: kube::Error,
        config: ObjectRef<MutatingWebhookConfiguration>,
    },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Persists the [`CertificateRecord`] under a fixed name and namespace. Holds no renewal policy.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Returns `None` if nothing has been stored yet.
    async fn load(&self) -> Result<Option<CertificateRecord>>;

    /// Creates the record, or updates its fields in place, leaving unrelated data alone.
    async fn save(&self, record: &CertificateRecord) -> Result<()>;
}

/// Reads and writes back the objects that carry the CA bundle.
#[async_trait]
pub trait DependentStore: Send + Sync {
    async fn list_crds(&self) -> Result<Vec<CustomResourceDefinition>>;

    /// Returns `None` if there is no MutatingWebhookConfiguration called `name`.
    async fn get_webhook_configuration(
        &self,
        name: &str,
    ) -> Result<Option<MutatingWebhookConfiguration>>;

    /// Writes back the whole object, failing if it was modified since it was read.
    async fn replace_crd(&self, crd: &CustomResourceDefinition) -> Result<()>;

    /// Writes back the whole object, failing if it was modified since it was read.
    async fn replace_webhook_configuration(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<()>;
}

impl CertificateRecord {
    /// Reads the managed keys out of Secret data, missing keys are treated as absent.
    pub fn from_secret_data(data: &BTreeMap<String, ByteString>) -> Self {
        let field = |key: &str| data.get(key).map_or_else(Vec::new, |value| value.0.clone());
        Self {
            root_key: field(ROOT_KEY),
            root_cert: field(ROOT_CERT),
            root_cert_prior: field(ROOT_CERT_PRIOR),
            server_key: field(SERVER_KEY),
            server_cert: field(SERVER_CERT),
        }
    }

    /// Writes all managed keys into Secret data, any other keys are kept.
    pub fn write_secret_data(&self, data: &mut BTreeMap<String, ByteString>) {
        for (key, value) in [
            (ROOT_KEY, &self.root_key),
            (ROOT_CERT, &self.root_cert),
            (ROOT_CERT_PRIOR, &self.root_cert_prior),
            (SERVER_KEY, &self.server_key),
            (SERVER_CERT, &self.server_cert),
        ] {
            data.insert(key.to_string(), ByteString(value.clone()));
        }
    }
}

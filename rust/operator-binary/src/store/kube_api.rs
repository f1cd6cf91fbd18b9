use std::collections::BTreeMap;

use async_trait::async_trait;
use snafu::ResultExt;
use stackable_operator::{
    k8s_openapi::{
        api::{admissionregistration::v1::MutatingWebhookConfiguration, core::v1::Secret},
        apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    },
    kube::{
        api::{ListParams, PostParams},
        runtime::reflector::ObjectRef,
        Api, ResourceExt,
    },
};
use tracing::debug;

use super::{
    CertificateStore, DependentStore, GetWebhookConfigurationSnafu, ListCrdsSnafu, LoadSecretSnafu,
    ReplaceCrdSnafu, ReplaceWebhookConfigurationSnafu, Result, SaveSecretSnafu,
};
use crate::material::CertificateRecord;

/// Stores everything in the Kubernetes API.
///
/// Timeouts and retries are left to the [`stackable_operator::kube::Client`].
#[derive(Clone)]
pub struct KubeStore {
    client: stackable_operator::kube::Client,
    secret_name: String,
    secret_namespace: String,
}

impl KubeStore {
    pub fn new(
        client: stackable_operator::kube::Client,
        secret_name: impl Into<String>,
        secret_namespace: impl Into<String>,
    ) -> Self {
        Self {
            client,
            secret_name: secret_name.into(),
            secret_namespace: secret_namespace.into(),
        }
    }

    fn secret_ref(&self) -> ObjectRef<Secret> {
        ObjectRef::new(&self.secret_name).within(&self.secret_namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.secret_namespace)
    }
}

#[async_trait]
impl CertificateStore for KubeStore {
    async fn load(&self) -> Result<Option<CertificateRecord>> {
        let secret = self
            .secrets()
            .get_opt(&self.secret_name)
            .await
            .with_context(|_| LoadSecretSnafu {
                secret: self.secret_ref(),
            })?;
        let data = secret.map(|secret| secret.data.unwrap_or_default());
        Ok(data.as_ref().map(CertificateRecord::from_secret_data))
    }

    async fn save(&self, record: &CertificateRecord) -> Result<()> {
        // Use entry API rather than apply so that we fail and retry on conflicts, rather than
        // overwriting certificates that another writer just issued
        let secrets = self.secrets();
        let entry = secrets
            .entry(&self.secret_name)
            .await
            .with_context(|_| LoadSecretSnafu {
                secret: self.secret_ref(),
            })?;
        let mut secret = entry.or_insert(Secret::default);
        record.write_secret_data(secret.get_mut().data.get_or_insert_with(BTreeMap::new));
        secret
            .commit(&PostParams::default())
            .await
            .with_context(|_| SaveSecretSnafu {
                secret: self.secret_ref(),
            })?;
        debug!(secret = %self.secret_ref(), "saved certificates");
        Ok(())
    }
}

#[async_trait]
impl DependentStore for KubeStore {
    async fn list_crds(&self) -> Result<Vec<CustomResourceDefinition>> {
        let crds = Api::<CustomResourceDefinition>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .context(ListCrdsSnafu)?;
        Ok(crds.items)
    }

    async fn get_webhook_configuration(
        &self,
        name: &str,
    ) -> Result<Option<MutatingWebhookConfiguration>> {
        Api::<MutatingWebhookConfiguration>::all(self.client.clone())
            .get_opt(name)
            .await
            .with_context(|_| GetWebhookConfigurationSnafu {
                config: ObjectRef::<MutatingWebhookConfiguration>::new(name),
            })
    }

    async fn replace_crd(&self, crd: &CustomResourceDefinition) -> Result<()> {
        Api::<CustomResourceDefinition>::all(self.client.clone())
            .replace(&crd.name_any(), &PostParams::default(), crd)
            .await
            .with_context(|_| ReplaceCrdSnafu {
                crd: ObjectRef::from_obj(crd),
            })?;
        Ok(())
    }

    async fn replace_webhook_configuration(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<()> {
        Api::<MutatingWebhookConfiguration>::all(self.client.clone())
            .replace(&config.name_any(), &PostParams::default(), config)
            .await
            .with_context(|_| ReplaceWebhookConfigurationSnafu {
                config: ObjectRef::from_obj(config),
            })?;
        Ok(())
    }
}

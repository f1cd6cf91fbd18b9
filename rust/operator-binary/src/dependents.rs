//! Finds the cluster objects that must trust the webhook, and keeps their CA bundles current

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::admissionregistration::v1::MutatingWebhookConfiguration,
        apiextensions_apiserver::pkg::apis::apiextensions::v1::{
            CustomResourceDefinition, WebhookClientConfig,
        },
        ByteString,
    },
    kube::{api::DynamicObject, runtime::reflector::ObjectRef, ResourceExt},
};
use tracing::debug;

use crate::{
    config::DependentSelector,
    store::{self, DependentStore},
};

/// CRDs that don't declare the group in `spec.group` can opt in through this label.
pub const CRD_GROUP_LABEL: &str = "crdGroup";

const CONVERSION_STRATEGY_WEBHOOK: &str = "Webhook";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to discover CustomResourceDefinitions"))]
    DiscoverCrds { source: store::Error },

    #[snafu(display("failed to discover the MutatingWebhookConfiguration"))]
    DiscoverWebhookConfiguration { source: store::Error },
}

/// An object holding one or more CA bundle fields.
#[derive(Clone, Debug)]
pub enum Dependent {
    /// A CRD converted by the webhook, its conversion client config holds the bundle
    Crd(CustomResourceDefinition),
    /// Every webhook entry's client config holds the bundle
    WebhookConfiguration(MutatingWebhookConfiguration),
}

impl Dependent {
    pub fn object_ref(&self) -> ObjectRef<DynamicObject> {
        match self {
            Dependent::Crd(crd) => ObjectRef::from_obj(crd).erase(),
            Dependent::WebhookConfiguration(config) => ObjectRef::from_obj(config).erase(),
        }
    }

    /// Whether every bundle field already holds `bundle`.
    pub fn is_up_to_date(&self, bundle: &[u8]) -> bool {
        let matches = |ca_bundle: &Option<ByteString>| {
            ca_bundle.as_ref().map(|ca| ca.0.as_slice()) == Some(bundle)
        };
        match self {
            Dependent::Crd(crd) => conversion_client_config(crd)
                .map_or(true, |client_config| matches(&client_config.ca_bundle)),
            Dependent::WebhookConfiguration(config) => config
                .webhooks
                .iter()
                .flatten()
                .all(|webhook| matches(&webhook.client_config.ca_bundle)),
        }
    }

    /// Sets every bundle field to `bundle`, leaving everything else as it was.
    pub fn set_bundle(&mut self, bundle: &[u8]) {
        match self {
            Dependent::Crd(crd) => {
                if let Some(client_config) = crd
                    .spec
                    .conversion
                    .as_mut()
                    .and_then(|conversion| conversion.webhook.as_mut())
                    .and_then(|webhook| webhook.client_config.as_mut())
                {
                    client_config.ca_bundle = Some(ByteString(bundle.to_vec()));
                }
            }
            Dependent::WebhookConfiguration(config) => {
                for webhook in config.webhooks.iter_mut().flatten() {
                    webhook.client_config.ca_bundle = Some(ByteString(bundle.to_vec()));
                }
            }
        }
    }

    pub async fn write_back(&self, store: &impl DependentStore) -> store::Result<()> {
        match self {
            Dependent::Crd(crd) => store.replace_crd(crd).await,
            Dependent::WebhookConfiguration(config) => {
                store.replace_webhook_configuration(config).await
            }
        }
    }
}

fn conversion_client_config(crd: &CustomResourceDefinition) -> Option<&WebhookClientConfig> {
    let conversion = crd.spec.conversion.as_ref()?;
    if !conversion
        .strategy
        .eq_ignore_ascii_case(CONVERSION_STRATEGY_WEBHOOK)
    {
        return None;
    }
    conversion.webhook.as_ref()?.client_config.as_ref()
}

/// Whether the CRD belongs to the selected group and is converted by a webhook.
pub fn is_managed_crd(crd: &CustomResourceDefinition, group: &str) -> bool {
    let in_group = crd.spec.group == group
        || crd.labels().get(CRD_GROUP_LABEL).map(String::as_str) == Some(group);
    in_group && conversion_client_config(crd).is_some()
}

/// The result of one discovery, with failures per kind of object.
///
/// The kinds are discovered independently, so that a failure to read one does not keep the
/// others from being updated.
pub struct Discovery {
    pub dependents: Vec<Dependent>,
    pub errors: Vec<Error>,
}

/// Queries the cluster for all current dependents, in a stable order: CRDs by name, then the
/// webhook configuration.
pub async fn locate(store: &impl DependentStore, selector: &DependentSelector) -> Discovery {
    let mut dependents = Vec::new();
    let mut errors = Vec::new();

    match store.list_crds().await.context(DiscoverCrdsSnafu) {
        Ok(crds) => {
            let mut managed = crds
                .into_iter()
                .filter(|crd| is_managed_crd(crd, &selector.crd_group))
                .collect::<Vec<_>>();
            managed.sort_by_key(|crd| crd.name_any());
            debug!(
                crds = ?managed.iter().map(|crd| crd.name_any()).collect::<Vec<_>>(),
                "found CustomResourceDefinitions converted by the webhook"
            );
            dependents.extend(managed.into_iter().map(Dependent::Crd));
        }
        Err(err) => errors.push(err),
    }

    match store
        .get_webhook_configuration(&selector.webhook_configuration_name)
        .await
        .context(DiscoverWebhookConfigurationSnafu)
    {
        Ok(Some(config)) => dependents.push(Dependent::WebhookConfiguration(config)),
        Ok(None) => debug!(
            name = %selector.webhook_configuration_name,
            "MutatingWebhookConfiguration does not exist, nothing to update"
        ),
        Err(err) => errors.push(err),
    }

    Discovery { dependents, errors }
}

//! In-memory stores for testing the reconciliation without a Kubernetes cluster

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use async_trait::async_trait;
use snafu::IntoError;
use stackable_operator::{
    k8s_openapi::{
        api::{admissionregistration::v1::MutatingWebhookConfiguration, core::v1::Secret},
        apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    },
    kube::{
        self, api::entry::CommitError, core::ErrorResponse, runtime::reflector::ObjectRef,
        ResourceExt,
    },
};

use super::{
    CertificateStore, DependentStore, ReplaceCrdSnafu, ReplaceWebhookConfigurationSnafu, Result,
    SaveSecretSnafu,
};
use crate::material::CertificateRecord;

/// Name under which writes of the certificate record are tracked.
pub const SECRET: &str = "secret";

#[derive(Default)]
struct State {
    record: Option<CertificateRecord>,
    crds: BTreeMap<String, CustomResourceDefinition>,
    webhook_configurations: BTreeMap<String, MutatingWebhookConfiguration>,
    failing: BTreeSet<String>,
    writes: Vec<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn injected_failure(name: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("injected failure for {name}"),
        reason: "InternalError".to_string(),
        code: 500,
    })
}

impl MemoryStore {
    pub fn with_record(self, record: CertificateRecord) -> Self {
        self.state.lock().unwrap().record = Some(record);
        self
    }

    pub fn with_crd(self, crd: CustomResourceDefinition) -> Self {
        self.state.lock().unwrap().crds.insert(crd.name_any(), crd);
        self
    }

    pub fn with_webhook_configuration(self, config: MutatingWebhookConfiguration) -> Self {
        self.state
            .lock()
            .unwrap()
            .webhook_configurations
            .insert(config.name_any(), config);
        self
    }

    /// Makes every write to an object with this name fail.
    pub fn failing_writes_to(self, name: &str) -> Self {
        self.state.lock().unwrap().failing.insert(name.to_string());
        self
    }

    pub fn record(&self) -> Option<CertificateRecord> {
        self.state.lock().unwrap().record.clone()
    }

    pub fn crd(&self, name: &str) -> CustomResourceDefinition {
        self.state.lock().unwrap().crds[name].clone()
    }

    pub fn webhook_configuration(&self, name: &str) -> MutatingWebhookConfiguration {
        self.state.lock().unwrap().webhook_configurations[name].clone()
    }

    /// Names of all successfully written objects, in write order.
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().unwrap().writes.clear();
    }
}

#[async_trait]
impl CertificateStore for MemoryStore {
    async fn load(&self) -> Result<Option<CertificateRecord>> {
        Ok(self.record())
    }

    async fn save(&self, record: &CertificateRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(SECRET) {
            return Err(SaveSecretSnafu {
                secret: ObjectRef::<Secret>::new(SECRET),
            }
            .into_error(CommitError::Save(injected_failure(SECRET))));
        }
        state.record = Some(record.clone());
        state.writes.push(SECRET.to_string());
        Ok(())
    }
}

#[async_trait]
impl DependentStore for MemoryStore {
    async fn list_crds(&self) -> Result<Vec<CustomResourceDefinition>> {
        Ok(self.state.lock().unwrap().crds.values().cloned().collect())
    }

    async fn get_webhook_configuration(
        &self,
        name: &str,
    ) -> Result<Option<MutatingWebhookConfiguration>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .webhook_configurations
            .get(name)
            .cloned())
    }

    async fn replace_crd(&self, crd: &CustomResourceDefinition) -> Result<()> {
        let name = crd.name_any();
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(&name) {
            return Err(ReplaceCrdSnafu {
                crd: ObjectRef::from_obj(crd),
            }
            .into_error(injected_failure(&name)));
        }
        state.crds.insert(name.clone(), crd.clone());
        state.writes.push(name);
        Ok(())
    }

    async fn replace_webhook_configuration(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<()> {
        let name = config.name_any();
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(&name) {
            return Err(ReplaceWebhookConfigurationSnafu {
                config: ObjectRef::from_obj(config),
            }
            .into_error(injected_failure(&name)));
        }
        state
            .webhook_configurations
            .insert(name.clone(), config.clone());
        state.writes.push(name);
        Ok(())
    }
}

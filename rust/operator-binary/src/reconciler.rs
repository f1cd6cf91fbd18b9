//! One pass over the certificate lifecycle: renew what is due, persist it, and push the CA bundle
//! to every dependent

use std::fmt::Display;

use snafu::{ensure, ResultExt, Snafu};
use stackable_operator::{
    kube::{api::DynamicObject, runtime::reflector::ObjectRef},
    logging::controller::ReconcilerError,
};
use strum::{EnumDiscriminants, IntoStaticStr};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::{
    bundle, cert_files,
    config::ReconcileSettings,
    dependents::{self, Discovery},
    material::{self, CertificateMaterial},
    store::{self, CertificateStore, DependentStore},
    utils::error_full_message,
};

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to load stored certificates"))]
    LoadCertificates { source: store::Error },

    #[snafu(display("failed to renew root certificate"))]
    RenewRoot { source: material::Error },

    #[snafu(display("failed to renew server certificate"))]
    RenewServer { source: material::Error },

    #[snafu(display("failed to save certificates"))]
    SaveCertificates { source: store::Error },

    #[snafu(display("failed to write certificate files"))]
    WriteCertFiles { source: cert_files::Error },

    #[snafu(display("failed to compose CA bundle"))]
    ComposeBundle { source: bundle::Error },

    #[snafu(display(
        "failed to update the CA bundle of {} dependent(s): {}",
        failures.len(),
        join(failures)
    ))]
    UpdateDependents { failures: Vec<DependentFailure> },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::UpdateDependents { failures } => {
                failures.iter().find_map(|failure| failure.object.clone())
            }
            _ => None,
        }
    }
}

/// A dependent that could not be found or updated.
#[derive(Debug, Clone)]
pub struct DependentFailure {
    /// `None` if the failure happened before the object was known
    pub object: Option<ObjectRef<DynamicObject>>,
    pub message: String,
}

impl Display for DependentFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.object {
            Some(object) => write!(f, "{object}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

fn join(failures: &[DependentFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// What a successful pass did.
#[derive(Debug)]
pub struct PassReport {
    pub renewed_root: bool,
    pub renewed_server: bool,
    /// Whether the record had to be written back
    pub saved: bool,
    /// Whether any served certificate file was replaced
    pub wrote_cert_files: bool,
    /// Dependents whose CA bundle was rewritten
    pub updated: Vec<ObjectRef<DynamicObject>>,
}

pub struct Reconciler<'a, C, D> {
    pub certificates: &'a C,
    pub dependents: &'a D,
    pub settings: &'a ReconcileSettings,
}

impl<'a, C: CertificateStore, D: DependentStore> Reconciler<'a, C, D> {
    pub fn new(certificates: &'a C, dependents: &'a D, settings: &'a ReconcileSettings) -> Self {
        Self {
            certificates,
            dependents,
            settings,
        }
    }

    /// Runs one pass as of `now`.
    ///
    /// Certificates are always persisted before any dependent is touched, so that no dependent
    /// ever trusts a root that could be lost. Dependents are updated one by one, a failure on one
    /// of them does not stop the others, but fails the pass once all have been attempted.
    pub async fn reconcile(&self, now: OffsetDateTime) -> Result<PassReport> {
        let stored = self
            .certificates
            .load()
            .await
            .context(LoadCertificatesSnafu)?;
        if stored.is_none() {
            info!("no certificates stored yet, issuing new ones");
        }
        let mut material = CertificateMaterial::new(
            stored.unwrap_or_default(),
            self.settings.identity.clone(),
            self.settings.lifetimes.clone(),
        );

        // The root goes first, a new root always invalidates the server certificate
        let renewed_root = material.needs_root_renewal(now);
        if renewed_root {
            material.renew_root(now).context(RenewRootSnafu)?;
        }
        let renewed_server = material.needs_server_renewal(now);
        if renewed_server {
            material.renew_server(now).context(RenewServerSnafu)?;
        }

        let saved = material.is_modified();
        if saved {
            self.certificates
                .save(material.record())
                .await
                .context(SaveCertificatesSnafu)?;
        } else {
            debug!("stored certificates are current");
        }
        let wrote_cert_files = match &self.settings.cert_dir {
            Some(cert_dir) => cert_files::write(cert_dir, material.record())
                .await
                .context(WriteCertFilesSnafu)?,
            None => false,
        };

        let bundle = bundle::compose(&material).context(ComposeBundleSnafu)?;
        let updated = self.update_dependents(&bundle).await?;
        Ok(PassReport {
            renewed_root,
            renewed_server,
            saved,
            wrote_cert_files,
            updated,
        })
    }

    async fn update_dependents(&self, bundle: &[u8]) -> Result<Vec<ObjectRef<DynamicObject>>> {
        let Discovery { dependents, errors } =
            dependents::locate(self.dependents, &self.settings.dependents).await;
        let mut failures = errors
            .iter()
            .map(|err| DependentFailure {
                object: None,
                message: error_full_message(err),
            })
            .collect::<Vec<_>>();

        let mut updated = Vec::new();
        for mut dependent in dependents {
            let object = dependent.object_ref();
            if dependent.is_up_to_date(bundle) {
                debug!(%object, "CA bundle is up to date");
                continue;
            }
            dependent.set_bundle(bundle);
            match dependent.write_back(self.dependents).await {
                Ok(()) => {
                    info!(%object, "updated CA bundle");
                    updated.push(object);
                }
                Err(err) => {
                    let message = error_full_message(&err);
                    warn!(%object, error = %message, "failed to update CA bundle");
                    failures.push(DependentFailure {
                        object: Some(object),
                        message,
                    });
                }
            }
        }

        ensure!(failures.is_empty(), UpdateDependentsSnafu { failures });
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use openssl::x509::X509;
    use stackable_operator::{
        k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration, time::Duration,
    };

    use super::*;
    use crate::{
        config::CertificateLifetimes,
        dependents::tests::{
            converted_crd, crd_bundle, selector, unconverted_crd, webhook_configuration, GROUP,
            OTHER_GROUP, WEBHOOK_CONFIGURATION,
        },
        material::{
            tests::{identity, issued_at, valid_record},
            CertificateRecord,
        },
        store::memory::{MemoryStore, SECRET},
    };

    fn settings() -> ReconcileSettings {
        ReconcileSettings {
            identity: identity(),
            lifetimes: CertificateLifetimes::default(),
            dependents: selector(),
            cert_dir: None,
        }
    }

    async fn reconcile(store: &MemoryStore, now: OffsetDateTime) -> Result<PassReport> {
        Reconciler::new(store, store, &settings())
            .reconcile(now)
            .await
    }

    fn webhook_bundles(config: &MutatingWebhookConfiguration) -> Vec<Option<Vec<u8>>> {
        config
            .webhooks
            .iter()
            .flatten()
            .map(|webhook| {
                webhook
                    .client_config
                    .ca_bundle
                    .as_ref()
                    .map(|ca| ca.0.clone())
            })
            .collect()
    }

    fn assert_complete(record: &CertificateRecord) {
        for field in [
            &record.root_key,
            &record.root_cert,
            &record.server_key,
            &record.server_cert,
        ] {
            assert!(!field.is_empty());
        }
    }

    #[tokio::test]
    async fn first_pass_issues_and_propagates() {
        let store = MemoryStore::default()
            .with_crd(converted_crd("widgets.webhooks.example.com", GROUP, None))
            .with_webhook_configuration(webhook_configuration(2));

        let report = reconcile(&store, issued_at()).await.unwrap();
        assert!(report.renewed_root && report.renewed_server && report.saved);

        let record = store.record().unwrap();
        assert_complete(&record);
        assert!(record.root_cert_prior.is_empty());
        assert_eq!(
            crd_bundle(&store.crd("widgets.webhooks.example.com")),
            Some(record.root_cert.clone())
        );
        assert_eq!(
            webhook_bundles(&store.webhook_configuration(WEBHOOK_CONFIGURATION)),
            vec![Some(record.root_cert.clone()); 2]
        );
        // certificates are persisted before any dependent is touched
        assert_eq!(store.writes()[0], SECRET);
        assert_eq!(report.updated.len(), 2);
    }

    #[tokio::test]
    async fn garbage_is_replaced_and_kept_as_prior() {
        let store = MemoryStore::default()
            .with_record(CertificateRecord {
                root_key: vec![123],
                root_cert: vec![123],
                root_cert_prior: Vec::new(),
                server_key: vec![123],
                server_cert: vec![123],
            })
            .with_crd(converted_crd("widgets.webhooks.example.com", GROUP, None));

        let report = reconcile(&store, issued_at()).await.unwrap();
        assert!(report.renewed_root);

        let record = store.record().unwrap();
        assert_complete(&record);
        assert_ne!(record.root_cert, vec![123]);
        assert_eq!(record.root_cert_prior, vec![123]);
        assert_eq!(
            crd_bundle(&store.crd("widgets.webhooks.example.com")),
            Some([record.root_cert.as_slice(), &[123u8][..]].concat())
        );
    }

    #[tokio::test]
    async fn valid_certificates_are_kept() {
        let now = issued_at();
        let stored = valid_record(now);
        let crd = converted_crd("widgets.webhooks.example.com", GROUP, Some("stale"));
        let store = MemoryStore::default()
            .with_record(stored.clone())
            .with_crd(crd)
            .with_webhook_configuration(webhook_configuration(1));

        let report = reconcile(&store, now + Duration::from_days_unchecked(7))
            .await
            .unwrap();
        assert!(!report.renewed_root && !report.renewed_server && !report.saved);
        assert_eq!(store.record().unwrap(), stored);
        assert_eq!(
            store.writes(),
            ["widgets.webhooks.example.com", WEBHOOK_CONFIGURATION]
        );
        assert_eq!(
            crd_bundle(&store.crd("widgets.webhooks.example.com")),
            Some(stored.root_cert)
        );
    }

    #[tokio::test]
    async fn certificates_are_issued_without_dependents() {
        let store = MemoryStore::default();
        let report = reconcile(&store, issued_at()).await.unwrap();
        assert!(report.updated.is_empty());
        assert_complete(&store.record().unwrap());
        assert_eq!(store.writes(), [SECRET]);
    }

    #[tokio::test]
    async fn second_pass_writes_nothing() {
        let now = issued_at();
        let store = MemoryStore::default()
            .with_crd(converted_crd("widgets.webhooks.example.com", GROUP, None))
            .with_webhook_configuration(webhook_configuration(2));
        reconcile(&store, now).await.unwrap();
        let first = store.record().unwrap();
        store.clear_writes();

        let report = reconcile(&store, now + Duration::from_hours_unchecked(3))
            .await
            .unwrap();
        assert!(!report.saved);
        assert!(report.updated.is_empty());
        assert!(store.writes().is_empty());
        assert_eq!(store.record().unwrap(), first);
    }

    #[tokio::test]
    async fn unrelated_crds_are_never_touched() {
        let foreign = converted_crd("things.other.example.com", OTHER_GROUP, Some("theirs"));
        let unconverted = unconverted_crd("gadgets.webhooks.example.com");
        let store = MemoryStore::default()
            .with_crd(foreign.clone())
            .with_crd(unconverted.clone())
            .with_crd(converted_crd("widgets.webhooks.example.com", GROUP, None));

        let mut now = issued_at();
        for _ in 0..3 {
            reconcile(&store, now).await.unwrap();
            now = now + Duration::from_days_unchecked(40);
        }
        assert_eq!(store.crd("things.other.example.com"), foreign);
        assert_eq!(store.crd("gadgets.webhooks.example.com"), unconverted);
        assert!(!store
            .writes()
            .iter()
            .any(|name| name != SECRET && name != "widgets.webhooks.example.com"));
    }

    #[tokio::test]
    async fn failing_dependent_does_not_block_the_others() {
        let store = MemoryStore::default()
            .with_crd(converted_crd("a.webhooks.example.com", GROUP, None))
            .with_crd(converted_crd("b.webhooks.example.com", GROUP, None))
            .with_webhook_configuration(webhook_configuration(1))
            .failing_writes_to("a.webhooks.example.com");

        let err = reconcile(&store, issued_at()).await.unwrap_err();
        let Error::UpdateDependents { failures } = &err else {
            panic!("expected dependent failures, got {err:?}");
        };
        assert_eq!(failures.len(), 1);
        let failed = err.secondary_object().map(|object| object.name);
        assert_eq!(failed.as_deref(), Some("a.webhooks.example.com"));

        let record = store.record().unwrap();
        assert_eq!(
            crd_bundle(&store.crd("b.webhooks.example.com")),
            Some(record.root_cert.clone())
        );
        assert_eq!(
            webhook_bundles(&store.webhook_configuration(WEBHOOK_CONFIGURATION)),
            [Some(record.root_cert)]
        );
        assert_eq!(crd_bundle(&store.crd("a.webhooks.example.com")), None);
    }

    #[tokio::test]
    async fn failed_save_leaves_dependents_alone() {
        let store = MemoryStore::default()
            .with_crd(converted_crd("widgets.webhooks.example.com", GROUP, None))
            .failing_writes_to(SECRET);

        let err = reconcile(&store, issued_at()).await.unwrap_err();
        assert!(matches!(err, Error::SaveCertificates { .. }));
        assert!(store.writes().is_empty());
        assert_eq!(crd_bundle(&store.crd("widgets.webhooks.example.com")), None);
    }

    #[tokio::test]
    async fn root_rotation_bundles_both_roots() {
        let now = issued_at();
        let crd = converted_crd("widgets.webhooks.example.com", GROUP, None);
        let store = MemoryStore::default().with_crd(crd);
        reconcile(&store, now).await.unwrap();
        let first = store.record().unwrap();

        // a day before the root expires
        let later = now + Duration::from_days_unchecked(2 * 365 - 1);
        let report = reconcile(&store, later).await.unwrap();
        assert!(report.renewed_root && report.renewed_server);

        let second = store.record().unwrap();
        assert_ne!(second.root_cert, first.root_cert);
        assert_eq!(second.root_cert_prior, first.root_cert);
        let bundle = crd_bundle(&store.crd("widgets.webhooks.example.com")).unwrap();
        assert_eq!(
            bundle,
            [second.root_cert.as_slice(), first.root_cert.as_slice()].concat()
        );

        // the new server certificate validates against the bundle
        let roots = X509::stack_from_pem(&bundle).unwrap();
        let server = X509::from_pem(&second.server_cert).unwrap();
        let root_key = roots[0].public_key().unwrap();
        assert!(server.verify(&root_key).unwrap());
    }

    #[tokio::test]
    async fn domain_change_reissues_everything() {
        let now = issued_at();
        let store = MemoryStore::default().with_record(valid_record(now));
        let settings = ReconcileSettings {
            identity: crate::config::ServerIdentity {
                service_name: "renamed-service".to_string(),
                namespace: "webhook-ns".to_string(),
            },
            ..settings()
        };
        let report = Reconciler::new(&store, &store, &settings)
            .reconcile(now)
            .await
            .unwrap();
        assert!(report.renewed_root && report.renewed_server && report.saved);
    }

    #[tokio::test]
    async fn cert_files_follow_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::default();
        let settings = ReconcileSettings {
            cert_dir: Some(dir.path().to_path_buf()),
            ..settings()
        };
        let reconciler = Reconciler::new(&store, &store, &settings);
        let report = reconciler.reconcile(issued_at()).await.unwrap();
        assert!(report.wrote_cert_files);

        let record = store.record().unwrap();
        assert_eq!(
            std::fs::read(dir.path().join(cert_files::CERT_FILE)).unwrap(),
            record.server_cert
        );
        assert_eq!(
            std::fs::read(dir.path().join(cert_files::KEY_FILE)).unwrap(),
            record.server_key
        );

        let report = reconciler.reconcile(issued_at()).await.unwrap();
        assert!(!report.wrote_cert_files);
    }
}

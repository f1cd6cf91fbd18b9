//! Derives the CA bundle that dependents use to validate the webhook's server certificate

use openssl::x509::X509;
use snafu::{ensure, ResultExt, Snafu};
use tracing::warn;

use crate::material::CertificateMaterial;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no root certificate to build the CA bundle from"))]
    MissingRoot,

    #[snafu(display("root certificate is malformed, refusing to publish it as CA bundle"))]
    MalformedRoot { source: openssl::error::ErrorStack },
}

/// The current root followed by the retained prior root, if there is one.
///
/// The current root must be well-formed. A prior root that does not parse is still included
/// (it is what the dependents may currently trust) but reported.
pub fn compose(material: &CertificateMaterial) -> Result<Vec<u8>, Error> {
    let record = material.record();
    ensure!(!record.root_cert.is_empty(), MissingRootSnafu);
    X509::from_pem(&record.root_cert).context(MalformedRootSnafu)?;

    let mut bundle = record.root_cert.clone();
    let prior = &record.root_cert_prior;
    if !prior.is_empty() {
        if X509::from_pem(prior).is_err() {
            warn!(
                prior.len = prior.len(),
                "prior root certificate is malformed, keeping it in the CA bundle until it is rotated out"
            );
        }
        if !bundle.ends_with(b"\n") {
            bundle.push(b'\n');
        }
        bundle.extend_from_slice(prior);
    }
    Ok(bundle)
}

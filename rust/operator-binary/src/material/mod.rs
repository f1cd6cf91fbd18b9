//! The certificate material owned by the webhook, and the decisions about when it must be reissued
//!
//! All checks take the current time as a parameter, nothing in here reads the clock.

use std::fmt::Debug;

use openssl::{
    nid::Nid,
    pkey::{PKey, Private},
    x509::X509,
};
use snafu::{OptionExt, ResultExt, Snafu};
use time::OffsetDateTime;
use tracing::info;

use crate::{
    config::{CertificateLifetimes, ServerIdentity},
    utils::{asn1time_to_offsetdatetime, Unloggable},
};

pub mod issue;

/// The persisted certificate material. An empty field means "absent".
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CertificateRecord {
    pub root_key: Vec<u8>,
    pub root_cert: Vec<u8>,
    /// The root that `root_cert` replaced, kept so that clients holding the previous bundle keep working
    pub root_cert_prior: Vec<u8>,
    pub server_key: Vec<u8>,
    pub server_cert: Vec<u8>,
}

impl Debug for CertificateRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("root_key", &Unloggable(&self.root_key))
            .field("root_cert", &String::from_utf8_lossy(&self.root_cert))
            .field(
                "root_cert_prior",
                &String::from_utf8_lossy(&self.root_cert_prior),
            )
            .field("server_key", &Unloggable(&self.server_key))
            .field("server_cert", &String::from_utf8_lossy(&self.server_cert))
            .finish()
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to issue root certificate"))]
    IssueRoot { source: issue::Error },

    #[snafu(display("failed to issue server certificate"))]
    IssueServer { source: issue::Error },

    #[snafu(display("cannot issue a server certificate without a valid root: {reason}"))]
    NoUsableRoot { reason: Staleness },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a key/certificate pair has to be reissued.
#[derive(Debug, Snafu)]
pub enum Staleness {
    #[snafu(display("no certificate stored"))]
    Missing,

    #[snafu(display("stored {what} could not be parsed"))]
    Malformed { what: &'static str },

    #[snafu(display("private key does not belong to the certificate"))]
    KeyMismatch,

    #[snafu(display("certificate expires at {not_after}, renewing from {renew_from}"))]
    Expiring {
        not_after: OffsetDateTime,
        renew_from: OffsetDateTime,
    },

    #[snafu(display("certificate was issued for {found:?}, but {expected:?} is expected"))]
    DomainChanged { found: String, expected: String },

    #[snafu(display("root certificate names no domain, {expected:?} is expected"))]
    UnnamedRoot { expected: String },

    #[snafu(display("certificate does not name {expected:?} as subject alternative name"))]
    MissingSan { expected: String },

    #[snafu(display("certificate is not signed by the current root"))]
    NotSignedByRoot,
}

/// A root that passed validation.
struct LiveRoot {
    cert: X509,
    key: PKey<Private>,
    not_after: OffsetDateTime,
}

/// Working copy of a [`CertificateRecord`] for one reconciliation pass.
///
/// Keeps the record as it was read, so that callers can tell whether anything needs persisting.
pub struct CertificateMaterial {
    source: CertificateRecord,
    record: CertificateRecord,
    identity: ServerIdentity,
    lifetimes: CertificateLifetimes,
}

impl CertificateMaterial {
    pub fn new(
        record: CertificateRecord,
        identity: ServerIdentity,
        lifetimes: CertificateLifetimes,
    ) -> Self {
        Self {
            source: record.clone(),
            record,
            identity,
            lifetimes,
        }
    }

    pub fn record(&self) -> &CertificateRecord {
        &self.record
    }

    /// Whether any field differs from the record this material was built from.
    pub fn is_modified(&self) -> bool {
        self.record != self.source
    }

    pub fn needs_root_renewal(&self, now: OffsetDateTime) -> bool {
        match self.live_root(now) {
            Ok(_) => false,
            Err(reason) => {
                info!(%reason, "root certificate needs to be renewed");
                true
            }
        }
    }

    pub fn needs_server_renewal(&self, now: OffsetDateTime) -> bool {
        match self.check_server(now) {
            Ok(()) => false,
            Err(reason) => {
                info!(%reason, "server certificate needs to be renewed");
                true
            }
        }
    }

    /// Replaces the root with a freshly issued one, retaining the current root as the prior one.
    ///
    /// Whatever was retained before is discarded. The server certificate is left alone and will no
    /// longer chain to the root.
    pub fn renew_root(&mut self, now: OffsetDateTime) -> Result<()> {
        let issued = issue::issue_root(now, self.lifetimes.root, &self.identity.domain())
            .context(IssueRootSnafu)?;
        let prior = std::mem::replace(&mut self.record.root_cert, issued.cert_pem);
        self.record.root_cert_prior = prior;
        self.record.root_key = issued.key_pem;
        info!(domain = %self.identity.domain(), "issued new root certificate");
        Ok(())
    }

    /// Issues a server certificate for the expected domain, signed by the current root.
    pub fn renew_server(&mut self, now: OffsetDateTime) -> Result<()> {
        let root = self
            .live_root(now)
            .map_err(|reason| Error::NoUsableRoot { reason })?;
        let issued = issue::issue_server(
            now,
            self.lifetimes.server,
            &self.identity.dns_names(),
            &root.cert,
            &root.key,
            root.not_after,
        )
        .context(IssueServerSnafu)?;
        self.record.server_key = issued.key_pem;
        self.record.server_cert = issued.cert_pem;
        info!(domain = %self.identity.domain(), "issued new server certificate");
        Ok(())
    }

    /// Parses the root pair and checks that it is usable at `now`.
    fn live_root(&self, now: OffsetDateTime) -> Result<LiveRoot, Staleness> {
        let CertificateRecord {
            root_key,
            root_cert,
            ..
        } = &self.record;
        if root_key.is_empty() || root_cert.is_empty() {
            return MissingSnafu.fail();
        }
        let cert = parse_cert(root_cert, "root certificate")?;
        let key = parse_key(root_key, "root key")?;
        check_key_pair(&cert, &key)?;
        let not_after = self.check_expiry(&cert, now)?;
        let expected = self.identity.domain();
        let found = cert
            .subject_name()
            .entries_by_nid(Nid::ORGANIZATIONALUNITNAME)
            .next()
            .and_then(|entry| entry.data().as_utf8().ok())
            .map(|ou| ou.to_string());
        match found {
            None => return UnnamedRootSnafu { expected }.fail(),
            Some(found) if found != expected => {
                return DomainChangedSnafu { found, expected }.fail();
            }
            Some(_) => {}
        }
        Ok(LiveRoot {
            cert,
            key,
            not_after,
        })
    }

    fn check_server(&self, now: OffsetDateTime) -> Result<(), Staleness> {
        let CertificateRecord {
            server_key,
            server_cert,
            ..
        } = &self.record;
        if server_key.is_empty() || server_cert.is_empty() {
            return MissingSnafu.fail();
        }
        let cert = parse_cert(server_cert, "server certificate")?;
        let key = parse_key(server_key, "server key")?;
        check_key_pair(&cert, &key)?;
        self.check_expiry(&cert, now)?;
        let expected = self.identity.domain();
        let has_domain = cert.subject_alt_names().is_some_and(|names| {
            names
                .iter()
                .any(|name| name.dnsname() == Some(expected.as_str()))
        });
        if !has_domain {
            return MissingSanSnafu { expected }.fail();
        }
        // A root that fails to parse cannot have signed anything
        let signed_by_root = X509::from_pem(&self.record.root_cert)
            .and_then(|root| root.public_key())
            .and_then(|root_key| cert.verify(&root_key))
            .unwrap_or(false);
        if !signed_by_root {
            return NotSignedByRootSnafu.fail();
        }
        Ok(())
    }

    /// Returns the certificate's expiry if it is not yet inside the renewal window.
    fn check_expiry(
        &self,
        cert: &X509,
        now: OffsetDateTime,
    ) -> Result<OffsetDateTime, Staleness> {
        let not_after = asn1time_to_offsetdatetime(cert.not_after())
            .ok()
            .context(MalformedSnafu { what: "validity" })?;
        let renew_from = not_after - self.lifetimes.renewal_lead;
        if now >= renew_from {
            return ExpiringSnafu {
                not_after,
                renew_from,
            }
            .fail();
        }
        Ok(not_after)
    }
}

fn parse_cert(pem: &[u8], what: &'static str) -> Result<X509, Staleness> {
    X509::from_pem(pem).ok().context(MalformedSnafu { what })
}

fn parse_key(pem: &[u8], what: &'static str) -> Result<PKey<Private>, Staleness> {
    PKey::private_key_from_pem(pem)
        .ok()
        .context(MalformedSnafu { what })
}

fn check_key_pair(cert: &X509, key: &PKey<Private>) -> Result<(), Staleness> {
    let matches = cert
        .public_key()
        .map(|public| public.public_eq(key))
        .unwrap_or(false);
    if matches {
        Ok(())
    } else {
        KeyMismatchSnafu.fail()
    }
}

//! Generates keys and X.509 certificates for the root and the webhook server

use openssl::{
    asn1::Asn1Integer,
    bn::{BigNum, MsbOption},
    conf::{Conf, ConfMethod},
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, PKeyRef, Private},
    rsa::Rsa,
    x509::{
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
            SubjectAlternativeName, SubjectKeyIdentifier,
        },
        X509Builder, X509NameBuilder, X509Ref,
    },
};
use snafu::{ResultExt, Snafu};
use stackable_operator::time::Duration;
use time::OffsetDateTime;

use crate::utils::offsetdatetime_to_asn1time;

/// Common name of every root this system issues. The root identifies the CA, not the Service.
pub const ROOT_COMMON_NAME: &str = "webhook-cert-manager self-signed CA";

/// Certificates are backdated slightly to tolerate clock skew between nodes.
const NOT_BEFORE_SKEW: Duration = Duration::from_minutes_unchecked(5);

const KEY_BITS: u32 = 2048;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to generate {tpe:?} key"))]
    GenerateKey { source: ErrorStack, tpe: CertType },

    #[snafu(display("failed to build {tpe:?} certificate"))]
    BuildCertificate { source: ErrorStack, tpe: CertType },

    #[snafu(display("failed to serialize {tpe:?} certificate"))]
    SerializeCertificate { source: ErrorStack, tpe: CertType },
}
type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy)]
pub enum CertType {
    Root,
    Server,
}

/// A freshly generated key pair with its certificate, PEM-encoded.
pub struct IssuedPair {
    pub key_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
}

impl IssuedPair {
    fn encode(key: &PKeyRef<Private>, cert: &X509Ref, tpe: CertType) -> Result<Self> {
        Ok(Self {
            key_pem: key
                .private_key_to_pem_pkcs8()
                .context(SerializeCertificateSnafu { tpe })?,
            cert_pem: cert.to_pem().context(SerializeCertificateSnafu { tpe })?,
        })
    }
}

fn generate_key(tpe: CertType) -> Result<PKey<Private>> {
    Rsa::generate(KEY_BITS)
        .and_then(PKey::try_from)
        .context(GenerateKeySnafu { tpe })
}

fn random_serial() -> Result<Asn1Integer, ErrorStack> {
    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
    Asn1Integer::from_bn(&serial)
}

/// Issues a self-signed root, valid from `now` for `lifetime`.
///
/// `domain` is recorded as the organizational unit, to tie the root's lineage to the deployment
/// it protects.
pub fn issue_root(now: OffsetDateTime, lifetime: Duration, domain: &str) -> Result<IssuedPair> {
    let tpe = CertType::Root;
    let not_before = now - NOT_BEFORE_SKEW;
    let not_after = now + lifetime;
    let key = generate_key(tpe)?;
    let cert = X509Builder::new()
        .and_then(|mut x509| {
            let subject_name = X509NameBuilder::new()
                .and_then(|mut name| {
                    name.append_entry_by_nid(Nid::COMMONNAME, ROOT_COMMON_NAME)?;
                    name.append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, domain)?;
                    Ok(name)
                })?
                .build();
            x509.set_subject_name(&subject_name)?;
            x509.set_issuer_name(&subject_name)?;
            x509.set_not_before(offsetdatetime_to_asn1time(not_before)?.as_ref())?;
            x509.set_not_after(offsetdatetime_to_asn1time(not_after)?.as_ref())?;
            x509.set_pubkey(&key)?;
            x509.set_serial_number(random_serial()?.as_ref())?;
            x509.set_version(
                3 - 1, // zero-indexed
            )?;
            let conf = Conf::new(ConfMethod::default())?;
            let ctx = x509.x509v3_context(None, Some(&conf));
            let exts = [
                BasicConstraints::new().critical().ca().build()?,
                SubjectKeyIdentifier::new().build(&ctx)?,
                AuthorityKeyIdentifier::new()
                    .issuer(false)
                    .keyid(false)
                    .build(&ctx)?,
                KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .key_cert_sign()
                    .crl_sign()
                    .build()?,
            ];
            for ext in exts {
                x509.append_extension(ext)?;
            }
            x509.sign(&key, MessageDigest::sha256())?;
            Ok(x509)
        })
        .context(BuildCertificateSnafu { tpe })?
        .build();
    IssuedPair::encode(&key, &cert, tpe)
}

/// Issues a server certificate for `dns_names` signed by the given root.
///
/// The first name becomes the subject. The certificate never outlives its root.
pub fn issue_server(
    now: OffsetDateTime,
    lifetime: Duration,
    dns_names: &[String],
    root_cert: &X509Ref,
    root_key: &PKeyRef<Private>,
    root_not_after: OffsetDateTime,
) -> Result<IssuedPair> {
    let tpe = CertType::Server;
    let not_before = now - NOT_BEFORE_SKEW;
    let not_after = (now + lifetime).min(root_not_after);
    let key = generate_key(tpe)?;
    let cert = X509Builder::new()
        .and_then(|mut x509| {
            let subject_name = X509NameBuilder::new()
                .and_then(|mut name| {
                    if let Some(domain) = dns_names.first() {
                        name.append_entry_by_nid(Nid::COMMONNAME, domain)?;
                    }
                    Ok(name)
                })?
                .build();
            x509.set_subject_name(&subject_name)?;
            x509.set_issuer_name(root_cert.subject_name())?;
            x509.set_not_before(offsetdatetime_to_asn1time(not_before)?.as_ref())?;
            x509.set_not_after(offsetdatetime_to_asn1time(not_after)?.as_ref())?;
            x509.set_pubkey(&key)?;
            x509.set_version(
                3 - 1, // zero-indexed
            )?;
            x509.set_serial_number(random_serial()?.as_ref())?;
            let conf = Conf::new(ConfMethod::default())?;
            let ctx = x509.x509v3_context(Some(root_cert), Some(&conf));
            let mut exts = vec![
                BasicConstraints::new().critical().build()?,
                KeyUsage::new()
                    .key_encipherment()
                    .digital_signature()
                    .build()?,
                ExtendedKeyUsage::new().server_auth().build()?,
                SubjectKeyIdentifier::new().build(&ctx)?,
                AuthorityKeyIdentifier::new()
                    .issuer(true)
                    .keyid(true)
                    .build(&ctx)?,
            ];
            if !dns_names.is_empty() {
                let mut san_ext = SubjectAlternativeName::new();
                san_ext.critical();
                for name in dns_names {
                    san_ext.dns(name);
                }
                exts.push(san_ext.build(&ctx)?);
            }
            for ext in exts {
                x509.append_extension(ext)?;
            }
            x509.sign(root_key, MessageDigest::sha256())?;
            Ok(x509)
        })
        .context(BuildCertificateSnafu { tpe })?
        .build();
    IssuedPair::encode(&key, &cert, tpe)
}

//! Materialises the served key pair as files, for the webhook's TLS server to pick up

use std::{
    fs::Permissions,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use snafu::{ResultExt, Snafu};
use tracing::info;

use crate::material::CertificateRecord;

pub const KEY_FILE: &str = "tls.key";
pub const CERT_FILE: &str = "tls.crt";
pub const CA_FILE: &str = "ca.crt";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create certificate directory {}", path.display()))]
    CreateDir {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to read {}", path.display()))]
    ReadFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to write {}", path.display()))]
    WriteFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to set permissions of {}", path.display()))]
    SetPermissions {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to move {} into place", path.display()))]
    Rename {
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Writes the current root, server certificate and server key into `dir`.
///
/// Files whose contents are already current are not touched, so that file watchers in the TLS
/// server only fire on actual rotations. Returns whether any file was replaced.
///
/// Each file is replaced atomically, but not the set of them. A reader that finds a certificate
/// not matching the key has raced a rotation and must read both again.
pub async fn write(dir: &Path, record: &CertificateRecord) -> Result<bool, Error> {
    tokio::fs::create_dir_all(dir)
        .await
        .context(CreateDirSnafu { path: dir })?;
    let mut changed = false;
    for (name, contents, mode) in served_files(record) {
        let path = dir.join(name);
        if is_current(&path, contents).await? {
            continue;
        }
        replace_file(&path, contents, mode).await?;
        info!(file = %path.display(), "updated certificate file");
        changed = true;
    }
    Ok(changed)
}

/// In write order, the key last.
fn served_files(record: &CertificateRecord) -> [(&'static str, &[u8], u32); 3] {
    [
        (CA_FILE, record.root_cert.as_slice(), 0o644),
        (CERT_FILE, record.server_cert.as_slice(), 0o644),
        (KEY_FILE, record.server_key.as_slice(), 0o600),
    ]
}

async fn is_current(path: &Path, contents: &[u8]) -> Result<bool, Error> {
    match tokio::fs::read(path).await {
        Ok(existing) => Ok(existing == contents),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).context(ReadFileSnafu { path }),
    }
}

/// Readers must never observe a half-written file, so write next to it and rename over it.
async fn replace_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), Error> {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);
    tokio::fs::write(&staging, contents)
        .await
        .context(WriteFileSnafu { path: &staging })?;
    tokio::fs::set_permissions(&staging, Permissions::from_mode(mode))
        .await
        .context(SetPermissionsSnafu { path: &staging })?;
    tokio::fs::rename(&staging, path)
        .await
        .context(RenameSnafu { path })
}

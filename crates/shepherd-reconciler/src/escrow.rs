//! Disk-encryption key escrow: accept, encrypt, decrypt, track.

use chrono::{DateTime, Utc};
use shepherd_domain::{
    Decryptable, DiskEncryptionKey, DiskEncryptionStatus, Host, Platform, ProfileStatus,
    RequiredAction, DISK_ENCRYPTION_PROFILE_IDENTIFIER,
};
use shepherd_pki::{envelope, CertificateAuthority};
use shepherd_store::{Activity, Store};
use tracing::{debug, info};

use crate::error::ReconcileError;

/// Resolve the escrow CA for a platform: SCEP CA for Apple hosts, WSTEP CA
/// for Windows.
pub struct EscrowCas<'a> {
    pub scep: &'a CertificateAuthority,
    pub wstep: &'a CertificateAuthority,
}

impl<'a> EscrowCas<'a> {
    fn for_platform(&self, platform: Platform) -> &'a CertificateAuthority {
        match platform {
            Platform::Windows => self.wstep,
            _ => self.scep,
        }
    }
}

/// Escrow a plaintext recovery key: encrypt under the platform CA and store.
/// Clears any previous client error and resets decryptability to unknown.
pub async fn submit_key(
    store: &dyn Store,
    cas: &EscrowCas<'_>,
    host: &Host,
    plaintext: &str,
    now: DateTime<Utc>,
) -> Result<(), ReconcileError> {
    let ca = cas.for_platform(host.platform);
    let ciphertext = envelope::encrypt(ca.cert_pem(), plaintext.as_bytes())?;
    store
        .put_disk_encryption_key(&DiskEncryptionKey::with_key(host.id, ciphertext, now))
        .await?;
    debug!(host_id = %host.id, "escrowed disk encryption key");
    Ok(())
}

/// Record a client-side escrow failure; drops any stored ciphertext.
pub async fn submit_client_error(
    store: &dyn Store,
    host: &Host,
    error: &str,
    now: DateTime<Utc>,
) -> Result<(), ReconcileError> {
    store
        .put_disk_encryption_key(&DiskEncryptionKey::with_client_error(
            host.id,
            error.to_string(),
            now,
        ))
        .await?;
    Ok(())
}

/// Decrypt the escrowed key for an authorized reader. Emits an activity
/// naming the reader.
pub async fn read_key(
    store: &dyn Store,
    cas: &EscrowCas<'_>,
    host: &Host,
    reader: &str,
) -> Result<String, ReconcileError> {
    let key = store
        .get_disk_encryption_key(host.id)
        .await?
        .and_then(|k| k.encrypted)
        .ok_or_else(|| ReconcileError::Internal(format!("no key escrowed for host {}", host.id)))?;
    let ca = cas.for_platform(host.platform);
    let plaintext = envelope::decrypt(ca.key_pem(), &key)?;
    let plaintext = String::from_utf8(plaintext)
        .map_err(|_| ReconcileError::Internal("escrowed key is not UTF-8".into()))?;
    store
        .append_activity(&Activity::ReadHostDiskEncryptionKey {
            at: Utc::now(),
            host_id: host.id,
            reader: reader.to_string(),
        })
        .await?;
    info!(host_id = %host.id, reader, "disk encryption key read");
    Ok(plaintext)
}

/// Periodic decryptability probe: attempt decryption of every key with
/// unknown decryptability and record the verdict.
pub async fn probe_decryptability(
    store: &dyn Store,
    cas: &EscrowCas<'_>,
) -> Result<usize, ReconcileError> {
    let mut probed = 0;
    for key in store.list_disk_encryption_keys().await? {
        if key.decryptable != Decryptable::Unknown {
            continue;
        }
        let Some(ciphertext) = &key.encrypted else {
            continue;
        };
        let Some(host) = store.get_host(key.host_id).await? else {
            continue;
        };
        let ca = cas.for_platform(host.platform);
        let verdict = match envelope::decrypt(ca.key_pem(), ciphertext) {
            Ok(_) => Decryptable::Yes,
            Err(_) => Decryptable::No,
        };
        store.set_decryptable(key.host_id, verdict).await?;
        probed += 1;
    }
    Ok(probed)
}

/// User-visible status, by precedence.
///
/// `disks_encrypted` is the inventory's verdict on whether the host's disks
/// are actually encrypted.
pub async fn host_status(
    store: &dyn Store,
    host: &Host,
    disks_encrypted: bool,
) -> Result<DiskEncryptionStatus, ReconcileError> {
    let profile_row = store
        .get_host_profile(&host.uuid, DISK_ENCRYPTION_PROFILE_IDENTIFIER)
        .await?;
    if let Some(row) = &profile_row {
        if row.status == ProfileStatus::Failed {
            return Ok(DiskEncryptionStatus::Failed {
                detail: row.detail.clone().unwrap_or_default(),
            });
        }
    }

    let key = store.get_disk_encryption_key(host.id).await?;
    if let Some(k) = &key {
        if let Some(err) = &k.client_error {
            return Ok(DiskEncryptionStatus::Failed { detail: err.clone() });
        }
    }
    let Some(key) = key.filter(|k| k.encrypted.is_some()) else {
        return Ok(DiskEncryptionStatus::Enforcing);
    };
    match key.decryptable {
        Decryptable::Unknown => Ok(DiskEncryptionStatus::Enforcing),
        Decryptable::No => Ok(DiskEncryptionStatus::ActionRequired {
            action: RequiredAction::RotateKey,
        }),
        Decryptable::Yes => {
            let verified = profile_row
                .map(|r| r.status == ProfileStatus::Verified)
                .unwrap_or(false);
            if verified && disks_encrypted {
                Ok(DiskEncryptionStatus::Verified)
            } else {
                Ok(DiskEncryptionStatus::ActionRequired {
                    action: RequiredAction::LogOut,
                })
            }
        }
    }
}

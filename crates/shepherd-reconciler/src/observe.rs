//! The observation paths that settle `verifying` rows: inventory reports of
//! installed profiles, and device command results.

use chrono::{DateTime, Utc};
use shepherd_domain::{
    Platform, ProfileOperation, ProfileStatus, MAX_PROFILE_RETRIES,
};
use shepherd_store::{InstalledProfiles, Store};
use tracing::{debug, info};

use crate::error::ReconcileError;
use crate::reconcile::verification_grace;

/// Ingest a host's reported set of installed profile identifiers and settle
/// its rows.
///
/// For each install row: identifier present ⇒ `verified`; absent and stale
/// past the grace period ⇒ retry (bounded) or `failed`; absent but fresh ⇒
/// untouched. Remove rows settle inversely. The retry counter never resets.
pub async fn ingest_installed_profiles(
    store: &dyn Store,
    host_uuid: &str,
    identifiers: &[String],
    now: DateTime<Utc>,
) -> Result<(), ReconcileError> {
    store
        .put_installed_profiles(&InstalledProfiles {
            host_uuid: host_uuid.to_string(),
            identifiers: identifiers.to_vec(),
            reported_at: now,
        })
        .await?;

    let rows = store.list_host_profiles(host_uuid).await?;
    let mut dirty = Vec::new();
    let mut remove_converged = Vec::new();

    for mut row in rows {
        let present = identifiers.contains(&row.profile_identifier);
        match (row.operation, row.status) {
            (ProfileOperation::Install, ProfileStatus::Verifying) if present => {
                row.status = ProfileStatus::Verified;
                row.updated_at = now;
                dirty.push(row);
            }
            (ProfileOperation::Install, ProfileStatus::Verifying) if !present => {
                if now - row.updated_at < verification_grace() {
                    continue; // fresh; give the device time
                }
                row.retries += 1;
                if row.retries > MAX_PROFILE_RETRIES {
                    row.status = ProfileStatus::Failed;
                    if row.detail.is_none() {
                        row.detail =
                            Some("profile not present after verification grace period".into());
                    }
                } else {
                    row.status = ProfileStatus::Pending;
                    row.command_uuid = None;
                }
                row.updated_at = now;
                dirty.push(row);
            }
            // A verified install that disappeared from the report re-enters
            // verification through the next reconcile pass as a fresh
            // install, still carrying its retry count.
            (ProfileOperation::Install, ProfileStatus::Verified) if !present => {
                if now - row.updated_at < verification_grace() {
                    continue;
                }
                row.retries += 1;
                if row.retries > MAX_PROFILE_RETRIES {
                    row.status = ProfileStatus::Failed;
                    if row.detail.is_none() {
                        row.detail =
                            Some("profile not present after verification grace period".into());
                    }
                } else {
                    row.status = ProfileStatus::Pending;
                    row.command_uuid = None;
                }
                row.updated_at = now;
                dirty.push(row);
            }
            (ProfileOperation::Remove, ProfileStatus::Verifying) if !present => {
                // Removal confirmed: the pair has converged, drop the row.
                remove_converged.push(row.profile_identifier.clone());
            }
            _ => {}
        }
    }

    if !dirty.is_empty() {
        store.bulk_upsert_host_profiles(&dirty).await?;
    }
    for identifier in &remove_converged {
        store.delete_host_profile(host_uuid, identifier).await?;
    }
    debug!(
        host_uuid,
        settled = dirty.len(),
        removed = remove_converged.len(),
        "installed-profile report ingested"
    );
    Ok(())
}

/// Settle a device's answer to a profile command.
///
/// Apple `Acknowledged` keeps install rows `verifying` (the inventory report
/// is the authority); Windows `2xx` verifies immediately since there is no
/// later observation. Errors re-plan the install up to the retry bound,
/// preserving the first error chain as detail.
pub async fn handle_command_result(
    store: &dyn Store,
    command_uuid: &str,
    status: &str,
    error_detail: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), ReconcileError> {
    let Some(mut row) = store.get_host_profile_by_command(command_uuid).await? else {
        return Ok(()); // not a profile command
    };

    let succeeded = match row.platform {
        Platform::Windows => status.parse::<u16>().map(|c| (200..300).contains(&c)).unwrap_or(false),
        _ => status == "Acknowledged",
    };

    if succeeded {
        match (row.platform, row.operation) {
            (_, ProfileOperation::Remove) => {
                store
                    .delete_host_profile(&row.host_uuid, &row.profile_identifier)
                    .await?;
            }
            (Platform::Windows, ProfileOperation::Install) => {
                row.status = ProfileStatus::Verified;
                row.updated_at = now;
                store.bulk_upsert_host_profiles(&[row]).await?;
            }
            // Apple installs stay verifying until the inventory confirms.
            _ => {}
        }
        return Ok(());
    }

    row.retries += 1;
    if row.detail.is_none() {
        row.detail = Some(
            error_detail
                .map(String::from)
                .unwrap_or_else(|| format!("device returned status {}", status)),
        );
    }
    if row.retries > MAX_PROFILE_RETRIES {
        row.status = ProfileStatus::Failed;
        info!(
            host_uuid = %row.host_uuid,
            profile = %row.profile_identifier,
            "profile failed after exhausting retries"
        );
    } else {
        row.status = ProfileStatus::Pending;
        row.command_uuid = None;
    }
    row.updated_at = now;
    store.bulk_upsert_host_profiles(&[row]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shepherd_domain::HostProfile;
    use shepherd_store::InMemoryStore;

    fn verifying_row(ident: &str, age_hours: i64) -> HostProfile {
        HostProfile {
            host_uuid: "U1".into(),
            profile_identifier: ident.into(),
            profile_name: ident.into(),
            platform: Platform::Darwin,
            operation: ProfileOperation::Install,
            status: ProfileStatus::Verifying,
            command_uuid: Some(format!("cmd-{}", ident)),
            retries: 0,
            checksum: "c".into(),
            detail: None,
            updated_at: Utc::now() - chrono::Duration::hours(age_hours),
        }
    }

    #[tokio::test]
    async fn present_identifier_verifies_row() {
        let store = InMemoryStore::new();
        store
            .bulk_upsert_host_profiles(&[verifying_row("I1", 0)])
            .await
            .unwrap();
        ingest_installed_profiles(&store, "U1", &["I1".into()], Utc::now())
            .await
            .unwrap();
        let row = store.get_host_profile("U1", "I1").await.unwrap().unwrap();
        assert_eq!(row.status, ProfileStatus::Verified);
    }

    #[tokio::test]
    async fn missing_but_fresh_is_untouched() {
        let store = InMemoryStore::new();
        store
            .bulk_upsert_host_profiles(&[verifying_row("I2", 1)])
            .await
            .unwrap();
        ingest_installed_profiles(&store, "U1", &[], Utc::now())
            .await
            .unwrap();
        let row = store.get_host_profile("U1", "I2").await.unwrap().unwrap();
        assert_eq!(row.status, ProfileStatus::Verifying);
        assert_eq!(row.retries, 0);
    }

    #[tokio::test]
    async fn missing_past_grace_retries_then_fails() {
        let store = InMemoryStore::new();
        store
            .bulk_upsert_host_profiles(&[verifying_row("I2", 49)])
            .await
            .unwrap();

        // First stale miss: back to pending with one retry burned.
        ingest_installed_profiles(&store, "U1", &[], Utc::now())
            .await
            .unwrap();
        let row = store.get_host_profile("U1", "I2").await.unwrap().unwrap();
        assert_eq!(row.status, ProfileStatus::Pending);
        assert_eq!(row.retries, 1);

        // Re-issued and stale again: failed, no further installs.
        let mut row = row;
        row.status = ProfileStatus::Verifying;
        row.updated_at = Utc::now() - chrono::Duration::hours(49);
        store.bulk_upsert_host_profiles(&[row]).await.unwrap();
        ingest_installed_profiles(&store, "U1", &[], Utc::now())
            .await
            .unwrap();
        let row = store.get_host_profile("U1", "I2").await.unwrap().unwrap();
        assert_eq!(row.status, ProfileStatus::Failed);
        assert_eq!(row.retries, 2);
        assert!(row.detail.is_some());
    }

    #[tokio::test]
    async fn confirmed_removal_deletes_row() {
        let store = InMemoryStore::new();
        let mut row = verifying_row("I3", 0);
        row.operation = ProfileOperation::Remove;
        store.bulk_upsert_host_profiles(&[row]).await.unwrap();
        ingest_installed_profiles(&store, "U1", &[], Utc::now())
            .await
            .unwrap();
        assert!(store.get_host_profile("U1", "I3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn device_error_replans_then_fails_preserving_first_detail() {
        let store = InMemoryStore::new();
        store
            .bulk_upsert_host_profiles(&[verifying_row("I1", 0)])
            .await
            .unwrap();

        handle_command_result(&store, "cmd-I1", "Error", Some("first error"), Utc::now())
            .await
            .unwrap();
        let row = store.get_host_profile("U1", "I1").await.unwrap().unwrap();
        assert_eq!(row.status, ProfileStatus::Pending);
        assert_eq!(row.retries, 1);
        assert_eq!(row.detail.as_deref(), Some("first error"));

        // Reconciler re-issues; second error exhausts the bound.
        let mut row = row;
        row.status = ProfileStatus::Verifying;
        row.command_uuid = Some("cmd-I1b".into());
        store.bulk_upsert_host_profiles(&[row]).await.unwrap();
        handle_command_result(&store, "cmd-I1b", "Error", Some("second error"), Utc::now())
            .await
            .unwrap();
        let row = store.get_host_profile("U1", "I1").await.unwrap().unwrap();
        assert_eq!(row.status, ProfileStatus::Failed);
        assert_eq!(row.retries, 2);
        assert_eq!(row.detail.as_deref(), Some("first error"), "first chain kept");
    }

    #[tokio::test]
    async fn windows_200_verifies_install_immediately() {
        let store = InMemoryStore::new();
        let mut row = verifying_row("./Device/Vendor/X", 0);
        row.platform = Platform::Windows;
        row.command_uuid = Some("wcmd-1".into());
        store.bulk_upsert_host_profiles(&[row]).await.unwrap();

        handle_command_result(&store, "wcmd-1", "200", None, Utc::now())
            .await
            .unwrap();
        let row = store
            .get_host_profile("U1", "./Device/Vendor/X")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ProfileStatus::Verified);
    }

    #[tokio::test]
    async fn apple_acknowledged_install_stays_verifying() {
        let store = InMemoryStore::new();
        store
            .bulk_upsert_host_profiles(&[verifying_row("I1", 0)])
            .await
            .unwrap();
        handle_command_result(&store, "cmd-I1", "Acknowledged", None, Utc::now())
            .await
            .unwrap();
        let row = store.get_host_profile("U1", "I1").await.unwrap().unwrap();
        assert_eq!(row.status, ProfileStatus::Verifying);
    }

    #[tokio::test]
    async fn unknown_command_is_ignored() {
        let store = InMemoryStore::new();
        handle_command_result(&store, "nope", "Error", None, Utc::now())
            .await
            .unwrap();
    }
}

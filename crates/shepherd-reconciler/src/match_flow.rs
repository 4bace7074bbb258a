//! Preassign/match: an external orchestrator declares per-host profile sets;
//! the server derives team membership from the group labels.

use chrono::{DateTime, Utc};
use shepherd_domain::{Platform, PreassignedProfile, Profile, TeamId};
use shepherd_store::{compute_checksum, Store};
use tracing::{debug, info};

use crate::error::ReconcileError;

/// Buffer lifetime. Stale rows are garbage-collected; callers are not
/// trusted to clean up after themselves.
pub const PREASSIGN_TTL_HOURS: i64 = 4;

#[derive(Debug, Clone)]
pub struct PreassignRequest {
    pub external_host_id: String,
    pub host_uuid: String,
    pub profile: Vec<u8>,
    pub group_label: Option<String>,
    pub exclude: bool,
}

/// Buffer one profile for a later match call.
pub async fn preassign(store: &dyn Store, req: PreassignRequest) -> Result<(), ReconcileError> {
    let (identifier, name) = parse_profile_identity(&req.profile)?;
    store
        .add_preassigned_profile(&PreassignedProfile {
            external_host_id: req.external_host_id,
            host_uuid: req.host_uuid,
            profile_identifier: identifier,
            profile_name: name,
            payload: req.profile,
            group_label: req.group_label,
            exclude: req.exclude,
            created_at: Utc::now(),
        })
        .await?;
    Ok(())
}

#[derive(Debug)]
pub struct MatchOutcome {
    pub team_id: TeamId,
    pub team_name: String,
    pub profiles_changed: bool,
    pub host_moved: bool,
}

/// Resolve the buffered preassignments for `external_host_id`.
///
/// The derived team name is the sorted, joined set of all group labels;
/// excluded entries shape the name but contribute no profile. When the host
/// already sits in a team with the same effective profile set, nothing is
/// touched.
pub async fn match_profiles(
    store: &dyn Store,
    external_host_id: &str,
) -> Result<MatchOutcome, ReconcileError> {
    let rows = store.list_preassigned_profiles(external_host_id).await?;
    if rows.is_empty() {
        return Err(ReconcileError::NoPreassignedProfiles(
            external_host_id.to_string(),
        ));
    }

    let host = store
        .get_host_by_uuid(&rows[0].host_uuid)
        .await?
        .ok_or_else(|| ReconcileError::HostNotEnrolled(rows[0].host_uuid.clone()))?;
    let enrolled = store
        .get_apple_enrollment(&host.uuid)
        .await?
        .map(|e| e.enabled && e.active)
        .unwrap_or(false);
    if !enrolled {
        return Err(ReconcileError::HostNotEnrolled(host.uuid));
    }

    let mut labels: Vec<String> = rows
        .iter()
        .filter_map(|r| r.group_label.clone())
        .filter(|l| !l.is_empty())
        .collect();
    labels.sort();
    labels.dedup();
    let team_name = if labels.is_empty() {
        "default".to_string()
    } else {
        labels.join(" - ")
    };

    let team = match store.get_team_by_name(&team_name).await? {
        Some(team) => team,
        None => store.create_team(&team_name).await?,
    };

    let now = Utc::now();
    let desired: Vec<Profile> = rows
        .iter()
        .filter(|r| !r.exclude)
        .map(|r| Profile {
            identifier: r.profile_identifier.clone(),
            name: r.profile_name.clone(),
            platform: Platform::Darwin,
            team_id: Some(team.id),
            checksum: compute_checksum(&r.payload),
            payload: r.payload.clone(),
            uploaded_at: now,
        })
        .collect();

    // Compare the team's current (non-reserved) set by checksum.
    let existing = store.list_profiles(Some(team.id)).await?;
    let mut existing_set: Vec<(String, String)> = existing
        .iter()
        .filter(|p| !Profile::is_reserved_identifier(&p.identifier))
        .map(|p| (p.identifier.clone(), p.checksum.clone()))
        .collect();
    existing_set.sort();
    let mut desired_set: Vec<(String, String)> = desired
        .iter()
        .map(|p| (p.identifier.clone(), p.checksum.clone()))
        .collect();
    desired_set.sort();

    let profiles_changed = existing_set != desired_set;
    if profiles_changed {
        store.replace_profiles(Some(team.id), &desired).await?;
        debug!(team = %team_name, profiles = desired.len(), "team profile set replaced");
    }

    let host_moved = host.team_id != Some(team.id);
    if host_moved {
        store.set_host_team(host.id, Some(team.id)).await?;
    }

    store.delete_preassigned_profiles(external_host_id).await?;
    info!(
        external_host_id,
        team = %team_name,
        profiles_changed,
        host_moved,
        "preassigned profiles matched"
    );
    Ok(MatchOutcome {
        team_id: team.id,
        team_name,
        profiles_changed,
        host_moved,
    })
}

/// Drop buffered rows older than the TTL.
pub async fn gc_preassigned(store: &dyn Store, now: DateTime<Utc>) -> Result<u64, ReconcileError> {
    let cutoff = now - chrono::Duration::hours(PREASSIGN_TTL_HOURS);
    Ok(store.gc_preassigned_profiles(cutoff).await?)
}

/// Pull `(PayloadIdentifier, PayloadDisplayName)` out of a mobileconfig.
fn parse_profile_identity(payload: &[u8]) -> Result<(String, String), ReconcileError> {
    let value: plist::Value = plist::from_bytes(payload)
        .map_err(|e| ReconcileError::Internal(format!("invalid mobileconfig: {}", e)))?;
    let dict = value
        .as_dictionary()
        .ok_or_else(|| ReconcileError::Internal("mobileconfig root is not a dict".into()))?;
    let identifier = dict
        .get("PayloadIdentifier")
        .and_then(|v| v.as_string())
        .ok_or_else(|| ReconcileError::Internal("mobileconfig has no PayloadIdentifier".into()))?
        .to_string();
    let name = dict
        .get("PayloadDisplayName")
        .and_then(|v| v.as_string())
        .unwrap_or(identifier.as_str())
        .to_string();
    Ok((identifier, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shepherd_domain::AppleEnrollment;
    use shepherd_store::{HostSeed, InMemoryStore};

    fn mobileconfig(identifier: &str, name: &str) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0"><dict>
  <key>PayloadType</key><string>Configuration</string>
  <key>PayloadIdentifier</key><string>{identifier}</string>
  <key>PayloadDisplayName</key><string>{name}</string>
</dict></plist>"#
        )
        .into_bytes()
    }

    async fn enrolled_host(store: &InMemoryStore, uuid: &str) {
        store
            .upsert_host(&HostSeed {
                uuid: uuid.into(),
                serial: format!("SN-{}", uuid),
                hostname: "mac".into(),
                platform: Platform::Darwin,
            })
            .await
            .unwrap();
        store
            .upsert_apple_enrollment(&AppleEnrollment {
                device_uuid: uuid.into(),
                push_token: "t".into(),
                push_magic: "m".into(),
                unlock_token: None,
                bootstrap_token: None,
                cert_fingerprint: None,
                enrollment_reference: None,
                enabled: true,
                active: true,
                enrolled_at: Utc::now(),
                last_seen_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    async fn preassign_one(
        store: &InMemoryStore,
        ext: &str,
        host: &str,
        ident: &str,
        label: Option<&str>,
        exclude: bool,
    ) {
        preassign(
            store,
            PreassignRequest {
                external_host_id: ext.into(),
                host_uuid: host.into(),
                profile: mobileconfig(ident, ident),
                group_label: label.map(String::from),
                exclude,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn match_creates_team_from_sorted_labels() {
        let store = InMemoryStore::new();
        enrolled_host(&store, "U1").await;
        preassign_one(&store, "ext-1", "U1", "com.example.b", Some("workstations"), false).await;
        preassign_one(&store, "ext-1", "U1", "com.example.a", Some("engineering"), false).await;

        let outcome = match_profiles(&store, "ext-1").await.unwrap();
        assert_eq!(outcome.team_name, "engineering - workstations");
        assert!(outcome.profiles_changed);
        assert!(outcome.host_moved);

        let host = store.get_host_by_uuid("U1").await.unwrap().unwrap();
        assert_eq!(host.team_id, Some(outcome.team_id));
        let profiles = store.list_profiles(Some(outcome.team_id)).await.unwrap();
        assert_eq!(profiles.len(), 2);

        // Buffer cleared after a successful match.
        assert!(store
            .list_preassigned_profiles("ext-1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn excluded_profiles_shape_name_but_not_contents() {
        let store = InMemoryStore::new();
        enrolled_host(&store, "U1").await;
        preassign_one(&store, "ext-1", "U1", "com.example.a", Some("alpha"), false).await;
        preassign_one(&store, "ext-1", "U1", "com.example.skip", Some("beta"), true).await;

        let outcome = match_profiles(&store, "ext-1").await.unwrap();
        assert_eq!(outcome.team_name, "alpha - beta");
        let profiles = store.list_profiles(Some(outcome.team_id)).await.unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].identifier, "com.example.a");
    }

    #[tokio::test]
    async fn rematch_with_same_set_is_a_noop() {
        let store = InMemoryStore::new();
        enrolled_host(&store, "U1").await;
        preassign_one(&store, "ext-1", "U1", "com.example.a", Some("alpha"), false).await;
        let first = match_profiles(&store, "ext-1").await.unwrap();
        assert!(first.profiles_changed);

        preassign_one(&store, "ext-1", "U1", "com.example.a", Some("alpha"), false).await;
        let second = match_profiles(&store, "ext-1").await.unwrap();
        assert_eq!(second.team_id, first.team_id);
        assert!(!second.profiles_changed);
        assert!(!second.host_moved);
    }

    #[tokio::test]
    async fn match_for_unenrolled_host_is_rejected() {
        let store = InMemoryStore::new();
        store
            .upsert_host(&HostSeed {
                uuid: "U2".into(),
                serial: "SN2".into(),
                hostname: "mac".into(),
                platform: Platform::Darwin,
            })
            .await
            .unwrap();
        preassign_one(&store, "ext-2", "U2", "com.example.a", None, false).await;
        assert!(matches!(
            match_profiles(&store, "ext-2").await,
            Err(ReconcileError::HostNotEnrolled(_))
        ));
    }

    #[tokio::test]
    async fn match_without_preassignments_is_rejected() {
        let store = InMemoryStore::new();
        assert!(matches!(
            match_profiles(&store, "nope").await,
            Err(ReconcileError::NoPreassignedProfiles(_))
        ));
    }
}

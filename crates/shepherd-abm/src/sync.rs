//! Roster sync: pull ABM device pages, maintain DEP assignments, and show the
//! right automatic-enrollment profile to each device batch.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::json;
use shepherd_domain::{DepAssignment, Platform, SetupAssistant, TeamId};
use shepherd_store::{HostSeed, Store};
use tracing::{info, warn};

use crate::client::{AbmClient, DeviceEntry};
use crate::error::AbmError;

/// URLs the server owns inside every registered enrollment profile.
#[derive(Debug, Clone)]
pub struct ProfileUrls {
    pub enroll_url: String,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub assigned_batches: usize,
}

/// One full sync pass. Cursor advancement is persisted per page so an
/// interrupted sync resumes instead of restarting.
pub async fn sync_roster(
    store: &dyn Store,
    client: &AbmClient,
    urls: &ProfileUrls,
) -> Result<SyncReport, AbmError> {
    let result = sync_roster_inner(store, client, urls).await;
    match &result {
        Ok(_) => store.set_abm_terms_expired(false).await?,
        Err(AbmError::TermsNotSigned) => {
            warn!("ABM terms not signed; flagging for operators");
            store.set_abm_terms_expired(true).await?;
        }
        // 401 and transient upstream errors leave the flag untouched.
        Err(_) => {}
    }
    result
}

async fn sync_roster_inner(
    store: &dyn Store,
    client: &AbmClient,
    urls: &ProfileUrls,
) -> Result<SyncReport, AbmError> {
    // Last OpType wins when a serial appears multiple times in one sync.
    let mut ops: HashMap<String, DeviceEntry> = HashMap::new();

    let mut cursor = store.get_dep_cursor().await?;
    loop {
        let page = match &cursor {
            None => client.fetch_devices().await?,
            Some(c) => client.sync_devices(c).await?,
        };
        for device in page.devices {
            if device.serial_number.is_empty() {
                continue;
            }
            ops.insert(device.serial_number.clone(), device);
        }
        store.put_dep_cursor(&page.cursor).await?;
        cursor = Some(page.cursor);
        if !page.more_to_sync {
            break;
        }
    }

    let settings = store.get_settings().await?;
    let default_team = settings.apple_bm_default_team;
    let now = Utc::now();
    let mut report = SyncReport::default();
    // Serial batches grouped by target team, per OpType group.
    let mut added_by_team: HashMap<Option<TeamId>, Vec<String>> = HashMap::new();
    let mut modified_by_team: HashMap<Option<TeamId>, Vec<String>> = HashMap::new();

    for (serial, device) in ops {
        match device.op_type.as_str() {
            "added" | "modified" | "" => {
                // Full-fetch rows carry no op; treat them as added.
                let existing = store.get_dep_assignment(&serial).await?;
                let team_id = existing
                    .as_ref()
                    .filter(|a| a.deleted_at.is_none())
                    .and_then(|a| a.team_id)
                    .or(default_team);

                store
                    .upsert_host(&HostSeed {
                        uuid: String::new(),
                        serial: serial.clone(),
                        hostname: device.model.clone(),
                        platform: Platform::Darwin,
                    })
                    .await?;
                store
                    .upsert_dep_assignment(&DepAssignment {
                        serial_number: serial.clone(),
                        profile_uuid: existing.as_ref().and_then(|a| a.profile_uuid.clone()),
                        team_id,
                        added_at: existing.as_ref().map(|a| a.added_at).unwrap_or(now),
                        deleted_at: None,
                    })
                    .await?;

                if device.op_type == "modified" {
                    modified_by_team.entry(team_id).or_default().push(serial.clone());
                    report.modified.push(serial);
                } else {
                    added_by_team.entry(team_id).or_default().push(serial.clone());
                    report.added.push(serial);
                }
            }
            "deleted" => {
                if let Some(mut assignment) = store.get_dep_assignment(&serial).await? {
                    assignment.deleted_at = Some(now);
                    store.upsert_dep_assignment(&assignment).await?;
                }
                report.deleted.push(serial);
            }
            other => {
                warn!(serial = %serial, op_type = %other, "ignoring unknown op type");
            }
        }
    }

    // Register each batch against its team's enrollment profile. The added
    // and modified groups post separately, mirroring how they arrived.
    for by_team in [&added_by_team, &modified_by_team] {
        for (team_id, serials) in by_team {
            let profile_uuid = ensure_profile(store, client, urls, *team_id).await?;
            client.assign_profile(&profile_uuid, serials).await?;
            report.assigned_batches += 1;
            for serial in serials {
                if let Some(mut assignment) = store.get_dep_assignment(serial).await? {
                    assignment.profile_uuid = Some(profile_uuid.clone());
                    store.upsert_dep_assignment(&assignment).await?;
                }
            }
        }
    }

    info!(
        added = report.added.len(),
        modified = report.modified.len(),
        deleted = report.deleted.len(),
        batches = report.assigned_batches,
        "ABM roster sync complete"
    );
    Ok(report)
}

/// Register (or reuse) the automatic-enrollment profile for a team scope and
/// return its ABM uuid.
pub async fn ensure_profile(
    store: &dyn Store,
    client: &AbmClient,
    urls: &ProfileUrls,
    team_id: Option<TeamId>,
) -> Result<String, AbmError> {
    let assistant = store.get_setup_assistant(team_id).await?;
    if let Some(uuid) = assistant.as_ref().and_then(|a| a.profile_uuid.clone()) {
        return Ok(uuid);
    }

    let mut profile = json!({
        "profile_name": "Shepherd automatic enrollment",
        "org_magic": "com.shepherd.mdm",
        "is_mdm_removable": true,
        "await_device_configured": true,
    });
    if let Some(assistant) = &assistant {
        if let (Some(base), Some(custom)) =
            (profile.as_object_mut(), assistant.profile.as_object())
        {
            for (k, v) in custom {
                base.insert(k.clone(), v.clone());
            }
        }
    }
    // The server owns the enrollment URLs unconditionally.
    if let Some(base) = profile.as_object_mut() {
        base.insert("url".into(), json!(urls.enroll_url));
        base.insert("configuration_web_url".into(), json!(urls.enroll_url));
    }

    let profile_uuid = client.define_profile(&profile).await?;
    let record = SetupAssistant {
        team_id,
        name: assistant
            .as_ref()
            .map(|a| a.name.clone())
            .unwrap_or_else(|| "default".into()),
        profile: assistant.map(|a| a.profile).unwrap_or_else(|| json!({})),
        profile_uuid: Some(profile_uuid.clone()),
        uploaded_at: Utc::now(),
    };
    store.put_setup_assistant(&record).await?;
    Ok(profile_uuid)
}

/// Re-register a device against another team's profile (team transfer).
pub async fn reassign_device_team(
    store: &dyn Store,
    client: &AbmClient,
    urls: &ProfileUrls,
    serial: &str,
    new_team: Option<TeamId>,
) -> Result<(), AbmError> {
    let profile_uuid = ensure_profile(store, client, urls, new_team).await?;
    client.assign_profile(&profile_uuid, &[serial.to_string()]).await?;
    if let Some(mut assignment) = store.get_dep_assignment(serial).await? {
        assignment.team_id = new_team;
        assignment.profile_uuid = Some(profile_uuid);
        store.upsert_dep_assignment(&assignment).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::OAuth1Credentials;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn urls() -> ProfileUrls {
        ProfileUrls {
            enroll_url: "https://mdm.example.com/mdm/apple/enroll?token=t".into(),
        }
    }

    async fn mock_abm(server: &MockServer) -> AbmClient {
        Mock::given(method("GET"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "auth_session_token": "sess"
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/profile"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "profile_uuid": "prof-1"
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/profile/devices"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(server)
            .await;
        AbmClient::with_base_url(
            OAuth1Credentials {
                consumer_key: "ck".into(),
                consumer_secret: "cs".into(),
                access_token: "at".into(),
                access_secret: "as".into(),
            },
            server.uri(),
        )
    }

    #[tokio::test]
    async fn sync_with_deletion_matches_op_groups() {
        let server = MockServer::start().await;
        let client = mock_abm(&server).await;
        let store = shepherd_store::InMemoryStore::new();

        // Pre-existing assignment for the deleted device.
        store
            .upsert_dep_assignment(&DepAssignment {
                serial_number: "D3".into(),
                profile_uuid: None,
                team_id: None,
                added_at: Utc::now(),
                deleted_at: None,
            })
            .await
            .unwrap();

        Mock::given(method("POST"))
            .and(path("/server/devices"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "devices": [
                    {"serial_number": "D1", "op_type": "added"},
                    {"serial_number": "D2", "op_type": "modified"},
                    {"serial_number": "D3", "op_type": "deleted"},
                    {"serial_number": "D4", "op_type": "added"}
                ],
                "cursor": "c-1",
                "more_to_sync": false
            })))
            .mount(&server)
            .await;

        let report = sync_roster(&store, &client, &urls()).await.unwrap();
        let mut added = report.added.clone();
        added.sort();
        assert_eq!(added, vec!["D1", "D4"]);
        assert_eq!(report.modified, vec!["D2"]);
        assert_eq!(report.deleted, vec!["D3"]);
        // Added group and modified group each posted once.
        assert_eq!(report.assigned_batches, 2);

        let deleted = store.get_dep_assignment("D3").await.unwrap().unwrap();
        assert!(deleted.deleted_at.is_some());
        let kept = store.get_dep_assignment("D1").await.unwrap().unwrap();
        assert_eq!(kept.profile_uuid.as_deref(), Some("prof-1"));
        assert_eq!(store.get_dep_cursor().await.unwrap().as_deref(), Some("c-1"));

        // Hosts were created for the surviving devices.
        assert!(store.get_host_by_serial("D1").await.unwrap().is_some());
        assert!(!store.abm_terms_expired().await.unwrap());
    }

    #[tokio::test]
    async fn last_op_type_wins() {
        let server = MockServer::start().await;
        let client = mock_abm(&server).await;
        let store = shepherd_store::InMemoryStore::new();

        Mock::given(method("POST"))
            .and(path("/server/devices"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "devices": [
                    {"serial_number": "D1", "op_type": "added"},
                    {"serial_number": "D1", "op_type": "deleted"}
                ],
                "cursor": "c-1",
                "more_to_sync": false
            })))
            .mount(&server)
            .await;

        let report = sync_roster(&store, &client, &urls()).await.unwrap();
        assert!(report.added.is_empty());
        assert_eq!(report.deleted, vec!["D1"]);
    }

    #[tokio::test]
    async fn terms_not_signed_sets_flag_and_success_clears_it() {
        let server = MockServer::start().await;
        let client = mock_abm(&server).await;
        let store = shepherd_store::InMemoryStore::new();

        let guard = Mock::given(method("POST"))
            .and(path("/server/devices"))
            .respond_with(
                ResponseTemplate::new(403).set_body_string(r#"{"error":"T_C_NOT_SIGNED"}"#),
            )
            .expect(1)
            .mount_as_scoped(&server)
            .await;

        let err = sync_roster(&store, &client, &urls()).await.unwrap_err();
        assert!(matches!(err, AbmError::TermsNotSigned));
        assert!(store.abm_terms_expired().await.unwrap());
        drop(guard);

        Mock::given(method("POST"))
            .and(path("/server/devices"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "devices": [],
                "cursor": "c-2",
                "more_to_sync": false
            })))
            .mount(&server)
            .await;
        sync_roster(&store, &client, &urls()).await.unwrap();
        assert!(!store.abm_terms_expired().await.unwrap());
    }

    #[tokio::test]
    async fn cursor_resumes_incremental_sync() {
        let server = MockServer::start().await;
        let client = mock_abm(&server).await;
        let store = shepherd_store::InMemoryStore::new();
        store.put_dep_cursor("c-prev").await.unwrap();

        Mock::given(method("POST"))
            .and(path("/devices/sync"))
            .and(body_partial_json(serde_json::json!({"cursor": "c-prev"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "devices": [],
                "cursor": "c-next",
                "more_to_sync": false
            })))
            .mount(&server)
            .await;

        sync_roster(&store, &client, &urls()).await.unwrap();
        assert_eq!(
            store.get_dep_cursor().await.unwrap().as_deref(),
            Some("c-next")
        );
    }
}

//! The profile reconciler: one pass per invocation, diffing desired against
//! observed per host and driving install/remove commands through the pipeline.
//!
//! Guarantees: eventual convergence, at most one install in flight per
//! (host, profile), bounded retries.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use shepherd_apple::apns::{ApnsClient, PushOutcome, PushTarget};
use shepherd_apple::commands as apple_commands;
use shepherd_domain::{
    Command, Host, HostProfile, MdmProtocol, Platform, Profile, ProfileOperation, ProfileStatus,
    TeamId, AGENT_CONFIG_PROFILE_IDENTIFIER, DISK_ENCRYPTION_PROFILE_IDENTIFIER,
};
use shepherd_store::{compute_checksum, Store};
use shepherd_windows::syncml;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ReconcileError;
use crate::report::{Change, ReconcileReport};

/// How long a `verifying` install may sit unobserved before it is retried.
pub const VERIFICATION_GRACE_HOURS: i64 = 48;

/// Backwards-compatible alias used by the observation path.
pub fn verification_grace() -> chrono::Duration {
    chrono::Duration::hours(VERIFICATION_GRACE_HOURS)
}

pub struct ReconcileParams<'a> {
    pub store: &'a dyn Store,
    pub server_url: &'a str,
    /// When present, Apple hosts with freshly enqueued commands get pushed.
    pub apns: Option<&'a ApnsClient>,
}

/// Run one reconciliation pass.
pub async fn reconcile(params: ReconcileParams<'_>) -> Result<ReconcileReport, ReconcileError> {
    let store = params.store;
    let mut report = ReconcileReport::new();
    let now = Utc::now();

    // 1. Refresh server-managed profiles for every scope.
    let settings = store.get_settings().await?;
    let mut scopes: Vec<(Option<TeamId>, String, bool)> = vec![(
        None,
        settings.enroll_secret.clone(),
        settings.enable_disk_encryption,
    )];
    for team in store.list_teams().await? {
        scopes.push((Some(team.id), team.enroll_secret, team.enable_disk_encryption));
    }
    for (scope, secret, disk_encryption) in &scopes {
        ensure_managed_profiles(
            store,
            params.server_url,
            *scope,
            secret,
            *disk_encryption,
            &mut report,
        )
        .await?;
    }

    // 2. Snapshot the desired and observed state once per pass, so an
    //    operator edit mid-pass cannot make the loop chase a moving target.
    let hosts = store.list_hosts().await?;
    let mut profiles_by_scope: HashMap<Option<TeamId>, Vec<Profile>> = HashMap::new();
    for (scope, _, _) in &scopes {
        profiles_by_scope.insert(*scope, store.list_profiles(*scope).await?);
    }
    let all_rows = store.list_all_host_profiles().await?;
    let mut rows_by_host: HashMap<String, Vec<HostProfile>> = HashMap::new();
    for row in all_rows {
        rows_by_host.entry(row.host_uuid.clone()).or_default().push(row);
    }

    // 3. Plan and issue per host. Errors are isolated per host.
    let mut push_targets: Vec<PushTarget> = Vec::new();
    for host in &hosts {
        let desired: Vec<&Profile> = profiles_by_scope
            .get(&host.team_id)
            .map(|ps| ps.iter().filter(|p| p.platform == host.platform).collect())
            .unwrap_or_default();
        let rows = rows_by_host.remove(&host.uuid).unwrap_or_default();

        match plan_host(store, host, &desired, rows, &mut report, now).await {
            Ok(Some(enqueued)) if enqueued > 0 => {
                report.hosts_seen += 1;
                report.commands_enqueued += enqueued;
                if host.platform == Platform::Darwin {
                    if let Some(e) = store.get_apple_enrollment(&host.uuid).await? {
                        if e.active && !e.push_token.is_empty() {
                            push_targets.push(PushTarget {
                                device_uuid: e.device_uuid,
                                push_token: e.push_token,
                                push_magic: e.push_magic,
                            });
                        }
                    }
                }
            }
            Ok(Some(_)) => report.hosts_seen += 1,
            Ok(None) => {}
            Err(e) => {
                warn!(host_uuid = %host.uuid, error = %e, "host reconcile failed");
                report.errors.push(format!("host {}: {}", host.uuid, e));
            }
        }
    }

    // 4. Wake Apple devices. Push failures never abort the pass.
    if let Some(apns) = params.apns {
        if !push_targets.is_empty() {
            let outcomes = apns.push_all(push_targets).await;
            report.pushes_sent = outcomes
                .iter()
                .filter(|(_, o)| *o == PushOutcome::Delivered)
                .count();
            for (uuid, outcome) in outcomes {
                if outcome != PushOutcome::Delivered {
                    report.errors.push(format!("push {}: {:?}", uuid, outcome));
                }
            }
        }
    }

    info!(
        hosts = report.hosts_seen,
        commands = report.commands_enqueued,
        errors = report.errors.len(),
        "reconcile pass complete"
    );
    Ok(report)
}

/// Diff one host and enqueue commands for every newly pending row. Returns
/// `None` when the host is not MDM enrolled.
async fn plan_host(
    store: &dyn Store,
    host: &Host,
    desired: &[&Profile],
    rows: Vec<HostProfile>,
    report: &mut ReconcileReport,
    now: chrono::DateTime<Utc>,
) -> Result<Option<usize>, ReconcileError> {
    let Some(protocol) = host.platform.mdm_protocol() else {
        return Ok(None);
    };
    let command_target = match protocol {
        MdmProtocol::Apple => match store.get_apple_enrollment(&host.uuid).await? {
            Some(e) if e.enabled && e.active => host.uuid.clone(),
            _ => return Ok(None),
        },
        MdmProtocol::Windows => {
            match store.get_windows_enrollment_by_host_uuid(&host.uuid).await? {
                Some(e) => e.mdm_device_id,
                None => return Ok(None),
            }
        }
    };

    let mut rows_by_ident: HashMap<String, HostProfile> = rows
        .into_iter()
        .map(|r| (r.profile_identifier.clone(), r))
        .collect();
    let desired_idents: HashSet<&str> =
        desired.iter().map(|p| p.identifier.as_str()).collect();
    let mut dirty: Vec<HostProfile> = Vec::new();

    // Installs: desired but missing, coming back after a remove, or drifted.
    for profile in desired {
        match rows_by_ident.remove(&profile.identifier) {
            None => dirty.push(new_row(host, profile, ProfileOperation::Install, now)),
            Some(row) => {
                let needs_install = match (row.operation, row.status) {
                    (_, ProfileStatus::Failed) => false,
                    // In flight: leave it alone, the observation path decides.
                    (_, ProfileStatus::Verifying) => false,
                    (ProfileOperation::Remove, _) => true,
                    (ProfileOperation::Install, _) => row.checksum != profile.checksum,
                };
                if needs_install {
                    let mut row = row;
                    row.operation = ProfileOperation::Install;
                    row.status = ProfileStatus::Pending;
                    row.command_uuid = None;
                    row.checksum = profile.checksum.clone();
                    row.updated_at = now;
                    dirty.push(row);
                } else {
                    dirty.push(row);
                }
            }
        }
    }

    // Removes: installed (or installing) but no longer desired.
    for (_ident, row) in rows_by_ident {
        if desired_idents.contains(row.profile_identifier.as_str()) {
            continue;
        }
        let plan_remove = row.operation == ProfileOperation::Install
            && row.status != ProfileStatus::Failed
            && row.status != ProfileStatus::Verifying;
        if plan_remove {
            let mut row = row;
            row.operation = ProfileOperation::Remove;
            row.status = ProfileStatus::Pending;
            row.command_uuid = None;
            row.retries = 0;
            row.detail = None;
            row.updated_at = now;
            dirty.push(row);
        } else {
            dirty.push(row);
        }
    }

    // Issue commands for pending rows, then compress pending → verifying.
    let desired_by_ident: HashMap<&str, &Profile> =
        desired.iter().map(|p| (p.identifier.as_str(), *p)).collect();
    let mut enqueued = 0usize;
    for row in dirty.iter_mut() {
        if row.status != ProfileStatus::Pending {
            continue;
        }
        let built = match (host.platform, row.operation) {
            (Platform::Darwin, ProfileOperation::Install) => {
                let Some(profile) = desired_by_ident.get(row.profile_identifier.as_str()) else {
                    continue;
                };
                let cmd = apple_commands::install_profile(&profile.payload)?;
                (cmd.command_uuid, cmd.request_type.to_string(), cmd.payload)
            }
            (Platform::Darwin, ProfileOperation::Remove) => {
                let cmd = apple_commands::remove_profile(&row.profile_identifier)?;
                (cmd.command_uuid, cmd.request_type.to_string(), cmd.payload)
            }
            (Platform::Windows, ProfileOperation::Install) => {
                let Some(profile) = desired_by_ident.get(row.profile_identifier.as_str()) else {
                    continue;
                };
                let command_uuid = Uuid::new_v4().to_string();
                let fragment = String::from_utf8_lossy(&profile.payload);
                let payload = syncml::wrap_profile_command(&fragment, &command_uuid)?;
                (command_uuid, row.profile_identifier.clone(), payload.into_bytes())
            }
            (Platform::Windows, ProfileOperation::Remove) => {
                let command_uuid = Uuid::new_v4().to_string();
                let payload = syncml::build_delete(&command_uuid, &row.profile_identifier);
                (command_uuid, row.profile_identifier.clone(), payload.into_bytes())
            }
            (Platform::Linux, _) => continue,
        };

        let (command_uuid, request_type, payload) = built;
        store
            .enqueue_command(&Command {
                command_uuid: command_uuid.clone(),
                device_uuid: command_target.clone(),
                platform: host.platform,
                request_type,
                payload,
                created_at: now,
            })
            .await?;
        let change = match row.operation {
            ProfileOperation::Install => Change::InstallPlanned {
                host_uuid: host.uuid.clone(),
                profile_identifier: row.profile_identifier.clone(),
            },
            ProfileOperation::Remove => Change::RemovePlanned {
                host_uuid: host.uuid.clone(),
                profile_identifier: row.profile_identifier.clone(),
            },
        };
        report.changes.push(change);
        row.status = ProfileStatus::Verifying;
        row.command_uuid = Some(command_uuid);
        row.updated_at = now;
        enqueued += 1;
    }

    if !dirty.is_empty() {
        store.bulk_upsert_host_profiles(&dirty).await?;
    }
    debug!(host_uuid = %host.uuid, enqueued, "host planned");
    Ok(Some(enqueued))
}

fn new_row(
    host: &Host,
    profile: &Profile,
    operation: ProfileOperation,
    now: chrono::DateTime<Utc>,
) -> HostProfile {
    HostProfile {
        host_uuid: host.uuid.clone(),
        profile_identifier: profile.identifier.clone(),
        profile_name: profile.name.clone(),
        platform: host.platform,
        operation,
        status: ProfileStatus::Pending,
        command_uuid: None,
        retries: 0,
        checksum: profile.checksum.clone(),
        detail: None,
        updated_at: now,
    }
}

// ── Server-managed profiles ───────────────────────────────────────────────────

/// Deterministic agent-config payload: stable bytes ⇒ stable checksum ⇒ no
/// phantom drift between passes.
pub fn agent_config_profile_payload(server_url: &str, enroll_secret: &str) -> Vec<u8> {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0"><dict>
  <key>PayloadType</key><string>Configuration</string>
  <key>PayloadIdentifier</key><string>{ident}</string>
  <key>PayloadUUID</key><string>2C7B1E44-1D34-4E36-9A1C-6F1A20A4A201</string>
  <key>PayloadDisplayName</key><string>Agent configuration</string>
  <key>PayloadVersion</key><integer>1</integer>
  <key>PayloadContent</key>
  <array>
    <dict>
      <key>PayloadType</key><string>com.apple.ManagedClient.preferences</string>
      <key>PayloadIdentifier</key><string>{ident}.prefs</string>
      <key>PayloadUUID</key><string>2C7B1E44-1D34-4E36-9A1C-6F1A20A4A202</string>
      <key>PayloadVersion</key><integer>1</integer>
      <key>PayloadContent</key>
      <dict>
        <key>com.shepherd.agent</key>
        <dict>
          <key>Forced</key>
          <array>
            <dict>
              <key>mcx_preference_settings</key>
              <dict>
                <key>EnrollSecret</key><string>{secret}</string>
                <key>ServerURL</key><string>{server}</string>
              </dict>
            </dict>
          </array>
        </dict>
      </dict>
    </dict>
  </array>
</dict></plist>"#,
        ident = AGENT_CONFIG_PROFILE_IDENTIFIER,
        secret = enroll_secret,
        server = server_url,
    )
    .into_bytes()
}

/// FileVault escrow payload: enables FileVault and points recovery-key escrow
/// at this server.
pub fn disk_encryption_profile_payload(server_url: &str) -> Vec<u8> {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0"><dict>
  <key>PayloadType</key><string>Configuration</string>
  <key>PayloadIdentifier</key><string>{ident}</string>
  <key>PayloadUUID</key><string>5D2F9C10-8B71-42A3-BD41-90C4F1E7A301</string>
  <key>PayloadDisplayName</key><string>Disk encryption</string>
  <key>PayloadVersion</key><integer>1</integer>
  <key>PayloadContent</key>
  <array>
    <dict>
      <key>PayloadType</key><string>com.apple.MCX.FileVault2</string>
      <key>PayloadIdentifier</key><string>{ident}.fv2</string>
      <key>PayloadUUID</key><string>5D2F9C10-8B71-42A3-BD41-90C4F1E7A302</string>
      <key>PayloadVersion</key><integer>1</integer>
      <key>Enable</key><string>On</string>
      <key>Defer</key><true/>
      <key>ShowRecoveryKey</key><false/>
    </dict>
    <dict>
      <key>PayloadType</key><string>com.apple.security.FDERecoveryKeyEscrow</string>
      <key>PayloadIdentifier</key><string>{ident}.escrow</string>
      <key>PayloadUUID</key><string>5D2F9C10-8B71-42A3-BD41-90C4F1E7A303</string>
      <key>PayloadVersion</key><integer>1</integer>
      <key>Location</key><string>{server}</string>
      <key>EncryptCertPayloadUUID</key><string>5D2F9C10-8B71-42A3-BD41-90C4F1E7A304</string>
    </dict>
  </array>
</dict></plist>"#,
        ident = DISK_ENCRYPTION_PROFILE_IDENTIFIER,
        server = server_url,
    )
    .into_bytes()
}

async fn ensure_managed_profiles(
    store: &dyn Store,
    server_url: &str,
    scope: Option<TeamId>,
    enroll_secret: &str,
    disk_encryption: bool,
    report: &mut ReconcileReport,
) -> Result<(), ReconcileError> {
    let now = Utc::now();

    let agent_payload = agent_config_profile_payload(server_url, enroll_secret);
    let agent_checksum = compute_checksum(&agent_payload);
    let existing = store.get_profile(scope, AGENT_CONFIG_PROFILE_IDENTIFIER).await?;
    if existing.map(|p| p.checksum) != Some(agent_checksum.clone()) {
        store
            .upsert_profile(&Profile {
                identifier: AGENT_CONFIG_PROFILE_IDENTIFIER.into(),
                name: "Agent configuration".into(),
                platform: Platform::Darwin,
                team_id: scope,
                payload: agent_payload,
                checksum: agent_checksum,
                uploaded_at: now,
            })
            .await?;
        report.changes.push(Change::ManagedProfileRefreshed {
            team_id: scope,
            profile_identifier: AGENT_CONFIG_PROFILE_IDENTIFIER.into(),
        });
    }

    if disk_encryption {
        let payload = disk_encryption_profile_payload(server_url);
        let checksum = compute_checksum(&payload);
        let existing = store
            .get_profile(scope, DISK_ENCRYPTION_PROFILE_IDENTIFIER)
            .await?;
        if existing.map(|p| p.checksum) != Some(checksum.clone()) {
            store
                .upsert_profile(&Profile {
                    identifier: DISK_ENCRYPTION_PROFILE_IDENTIFIER.into(),
                    name: "Disk encryption".into(),
                    platform: Platform::Darwin,
                    team_id: scope,
                    payload,
                    checksum,
                    uploaded_at: now,
                })
                .await?;
            report.changes.push(Change::ManagedProfileRefreshed {
                team_id: scope,
                profile_identifier: DISK_ENCRYPTION_PROFILE_IDENTIFIER.into(),
            });
        }
    } else if store
        .get_profile(scope, DISK_ENCRYPTION_PROFILE_IDENTIFIER)
        .await?
        .is_some()
    {
        store
            .delete_profile(scope, DISK_ENCRYPTION_PROFILE_IDENTIFIER)
            .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shepherd_domain::{AppleEnrollment, OrgSettings};
    use shepherd_store::{HostSeed, InMemoryStore};

    const SERVER_URL: &str = "https://mdm.example.com";

    async fn enrolled_apple_host(store: &InMemoryStore, uuid: &str, serial: &str) -> Host {
        let host = store
            .upsert_host(&HostSeed {
                uuid: uuid.into(),
                serial: serial.into(),
                hostname: format!("mac-{}", serial),
                platform: Platform::Darwin,
            })
            .await
            .unwrap();
        store
            .upsert_apple_enrollment(&AppleEnrollment {
                device_uuid: uuid.into(),
                push_token: "tok".into(),
                push_magic: "magic".into(),
                unlock_token: None,
                bootstrap_token: None,
                cert_fingerprint: Some("fp".into()),
                enrollment_reference: None,
                enabled: true,
                active: true,
                enrolled_at: Utc::now(),
                last_seen_at: Utc::now(),
            })
            .await
            .unwrap();
        host
    }

    fn user_profile(identifier: &str, name: &str, team_id: Option<TeamId>) -> Profile {
        let payload = format!("<plist>{}</plist>", identifier).into_bytes();
        Profile {
            identifier: identifier.into(),
            name: name.into(),
            platform: Platform::Darwin,
            team_id,
            checksum: compute_checksum(&payload),
            payload,
            uploaded_at: Utc::now(),
        }
    }

    async fn settings_with_secret(store: &InMemoryStore, secret: &str) {
        store
            .put_settings(&OrgSettings {
                apple_mdm_enabled: true,
                enroll_secret: secret.into(),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    async fn run(store: &InMemoryStore) -> ReconcileReport {
        reconcile(ReconcileParams {
            store,
            server_url: SERVER_URL,
            apns: None,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn fresh_enrollment_gets_profiles_and_agent_config() {
        let store = InMemoryStore::new();
        settings_with_secret(&store, "s").await;
        store
            .replace_profiles(
                None,
                &[user_profile("I1", "N1", None), user_profile("I2", "N2", None)],
            )
            .await
            .unwrap();
        enrolled_apple_host(&store, "U1", "SN1").await;

        let report = run(&store).await;
        assert_eq!(report.commands_enqueued, 3, "I1, I2, agent-config");

        // All three rows are in flight after issue.
        let rows = store.list_host_profiles("U1").await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.status == ProfileStatus::Verifying));
        assert!(rows.iter().all(|r| r.command_uuid.is_some()));

        // The agent-config payload carries the secret and the server URL.
        let agent = store
            .get_profile(None, AGENT_CONFIG_PROFILE_IDENTIFIER)
            .await
            .unwrap()
            .unwrap();
        let text = String::from_utf8(agent.payload).unwrap();
        assert!(text.contains("<string>s</string>"));
        assert!(text.contains(SERVER_URL));

        // Delivered commands are InstallProfile plists.
        let next = store.next_pending_command("U1").await.unwrap().unwrap();
        assert_eq!(next.request_type, "InstallProfile");
    }

    #[tokio::test]
    async fn second_pass_enqueues_nothing_while_in_flight() {
        let store = InMemoryStore::new();
        settings_with_secret(&store, "s").await;
        store
            .replace_profiles(None, &[user_profile("I1", "N1", None)])
            .await
            .unwrap();
        enrolled_apple_host(&store, "U1", "SN1").await;

        let first = run(&store).await;
        assert_eq!(first.commands_enqueued, 2);
        let second = run(&store).await;
        assert_eq!(second.commands_enqueued, 0, "at most one in flight");
    }

    #[tokio::test]
    async fn team_move_plans_removes_and_installs() {
        let store = InMemoryStore::new();
        settings_with_secret(&store, "s").await;
        let team = store.create_team("T2").await.unwrap();
        store
            .replace_profiles(
                Some(team.id),
                &[
                    user_profile("T2.1", "T2 one", Some(team.id)),
                    user_profile("T2.2", "T2 two", Some(team.id)),
                ],
            )
            .await
            .unwrap();

        let host = enrolled_apple_host(&store, "U1", "SN1").await;
        // Previously verified no-team profiles.
        let verified = |ident: &str| HostProfile {
            host_uuid: "U1".into(),
            profile_identifier: ident.into(),
            profile_name: ident.into(),
            platform: Platform::Darwin,
            operation: ProfileOperation::Install,
            status: ProfileStatus::Verified,
            command_uuid: None,
            retries: 0,
            checksum: "old".into(),
            detail: None,
            updated_at: Utc::now(),
        };
        store
            .bulk_upsert_host_profiles(&[verified("G1"), verified("G2")])
            .await
            .unwrap();

        store.set_host_team(host.id, Some(team.id)).await.unwrap();
        let report = run(&store).await;

        let rows = store.list_host_profiles("U1").await.unwrap();
        let by_ident: HashMap<&str, &HostProfile> = rows
            .iter()
            .map(|r| (r.profile_identifier.as_str(), r))
            .collect();
        assert_eq!(by_ident["G1"].operation, ProfileOperation::Remove);
        assert_eq!(by_ident["G2"].operation, ProfileOperation::Remove);
        assert_eq!(by_ident["T2.1"].operation, ProfileOperation::Install);
        assert_eq!(by_ident["T2.2"].operation, ProfileOperation::Install);
        assert_eq!(
            by_ident[AGENT_CONFIG_PROFILE_IDENTIFIER].operation,
            ProfileOperation::Install
        );
        assert!(rows.iter().all(|r| r.status == ProfileStatus::Verifying));
        // 2 removes + 2 installs + agent config for the new scope.
        assert_eq!(report.commands_enqueued, 5);
    }

    #[tokio::test]
    async fn failed_rows_get_no_further_commands() {
        let store = InMemoryStore::new();
        settings_with_secret(&store, "s").await;
        store
            .replace_profiles(None, &[user_profile("I1", "N1", None)])
            .await
            .unwrap();
        enrolled_apple_host(&store, "U1", "SN1").await;

        let profile = store.get_profile(None, "I1").await.unwrap().unwrap();
        store
            .bulk_upsert_host_profiles(&[HostProfile {
                host_uuid: "U1".into(),
                profile_identifier: "I1".into(),
                profile_name: "N1".into(),
                platform: Platform::Darwin,
                operation: ProfileOperation::Install,
                status: ProfileStatus::Failed,
                command_uuid: None,
                retries: 2,
                checksum: profile.checksum,
                detail: Some("boom".into()),
                updated_at: Utc::now(),
            }])
            .await
            .unwrap();

        let report = run(&store).await;
        // Only the agent-config install goes out; the failed row is frozen.
        assert_eq!(report.commands_enqueued, 1);
        let row = store.get_host_profile("U1", "I1").await.unwrap().unwrap();
        assert_eq!(row.status, ProfileStatus::Failed);
    }

    #[tokio::test]
    async fn disk_encryption_toggle_manages_reserved_profile() {
        let store = InMemoryStore::new();
        let mut settings = OrgSettings {
            enroll_secret: "s".into(),
            enable_disk_encryption: true,
            ..Default::default()
        };
        store.put_settings(&settings).await.unwrap();
        run(&store).await;
        assert!(store
            .get_profile(None, DISK_ENCRYPTION_PROFILE_IDENTIFIER)
            .await
            .unwrap()
            .is_some());

        settings.enable_disk_encryption = false;
        store.put_settings(&settings).await.unwrap();
        run(&store).await;
        assert!(store
            .get_profile(None, DISK_ENCRYPTION_PROFILE_IDENTIFIER)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn checksum_drift_replans_install() {
        let store = InMemoryStore::new();
        settings_with_secret(&store, "s").await;
        store
            .replace_profiles(None, &[user_profile("I1", "N1", None)])
            .await
            .unwrap();
        enrolled_apple_host(&store, "U1", "SN1").await;
        run(&store).await;

        // Mark everything verified, then change the payload.
        let rows: Vec<HostProfile> = store
            .list_host_profiles("U1")
            .await
            .unwrap()
            .into_iter()
            .map(|mut r| {
                r.status = ProfileStatus::Verified;
                r
            })
            .collect();
        store.bulk_upsert_host_profiles(&rows).await.unwrap();

        let changed = {
            let payload = b"<plist>I1-v2</plist>".to_vec();
            Profile {
                identifier: "I1".into(),
                name: "N1".into(),
                platform: Platform::Darwin,
                team_id: None,
                checksum: compute_checksum(&payload),
                payload,
                uploaded_at: Utc::now(),
            }
        };
        store.replace_profiles(None, &[changed]).await.unwrap();

        let report = run(&store).await;
        assert_eq!(report.commands_enqueued, 1);
        let row = store.get_host_profile("U1", "I1").await.unwrap().unwrap();
        assert_eq!(row.operation, ProfileOperation::Install);
        assert_eq!(row.status, ProfileStatus::Verifying);
    }
}

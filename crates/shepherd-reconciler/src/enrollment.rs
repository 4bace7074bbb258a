//! Post-enrollment workflow: DEP follow-ups, bootstrap-package delivery,
//! SSO account configuration, and the MDM migration webhook.

use chrono::{DateTime, Utc};
use serde_json::json;
use shepherd_apple::commands as apple_commands;
use shepherd_domain::{Command, Host, Platform};
use shepherd_store::Store;
use tracing::{debug, info, warn};

use crate::error::ReconcileError;

/// Durable job kinds for the worker queue. Jobs are idempotent on their
/// arguments.
pub const JOB_POST_DEP_ENROLLMENT: &str = "post_dep_enrollment";

/// How long after a migration webhook fires before another may be sent.
pub const MIGRATION_COOLDOWN_MINUTES: i64 = 1;

/// Queue the post-enrollment workflow for a device whose first TokenUpdate
/// just landed.
pub async fn schedule_post_enrollment(
    store: &dyn Store,
    device_uuid: &str,
) -> Result<(), ReconcileError> {
    store
        .enqueue_job(
            JOB_POST_DEP_ENROLLMENT,
            json!({ "device_uuid": device_uuid }),
            Utc::now(),
        )
        .await?;
    Ok(())
}

/// What the post-enrollment job produced; the caller (worker) follows up
/// with a reconcile trigger and an APNs push.
#[derive(Debug, Default)]
pub struct PostEnrollmentOutcome {
    pub account_configuration_sent: bool,
    pub bootstrap_package_sent: bool,
}

/// Run the post-enrollment workflow for one device. Idempotent: already
/// delivered steps are skipped on redelivery.
pub async fn run_post_enrollment(
    store: &dyn Store,
    server_url: &str,
    device_uuid: &str,
) -> Result<PostEnrollmentOutcome, ReconcileError> {
    let mut outcome = PostEnrollmentOutcome::default();
    let Some(enrollment) = store.get_apple_enrollment(device_uuid).await? else {
        debug!(device_uuid, "post-enrollment for unknown device, skipping");
        return Ok(outcome);
    };
    let Some(host) = store.get_host_by_uuid(device_uuid).await? else {
        return Ok(outcome);
    };
    let now = Utc::now();
    let existing = store.list_commands(Some(device_uuid)).await?;

    // SSO-gated setup: pin the local account to the IdP identity.
    let settings = store.get_settings().await?;
    if settings.end_user_auth_enabled {
        if let Some(reference) = &enrollment.enrollment_reference {
            if let Some(account) = store.get_idp_account_by_reference(reference).await? {
                let already_sent = existing
                    .iter()
                    .any(|c| c.request_type == "AccountConfiguration");
                if !already_sent {
                    let cmd =
                        apple_commands::account_configuration(&account.fullname, &account.username)?;
                    store
                        .enqueue_command(&Command {
                            command_uuid: cmd.command_uuid,
                            device_uuid: device_uuid.to_string(),
                            platform: Platform::Darwin,
                            request_type: cmd.request_type.to_string(),
                            payload: cmd.payload,
                            created_at: now,
                        })
                        .await?;
                    outcome.account_configuration_sent = true;
                }
            }
        }
    }

    // Bootstrap package for the host's scope.
    if let Some(package) = store.get_bootstrap_package(host.team_id).await? {
        let already_sent = existing
            .iter()
            .any(|c| c.request_type == "InstallEnterpriseApplication");
        if !already_sent {
            let manifest_url = format!(
                "{}/mdm/apple/bootstrap/manifest?token={}",
                server_url, package.token
            );
            let cmd = apple_commands::install_enterprise_application(&manifest_url)?;
            store
                .enqueue_command(&Command {
                    command_uuid: cmd.command_uuid,
                    device_uuid: device_uuid.to_string(),
                    platform: Platform::Darwin,
                    request_type: cmd.request_type.to_string(),
                    payload: cmd.payload,
                    created_at: now,
                })
                .await?;
            outcome.bootstrap_package_sent = true;
        }
    }

    info!(
        device_uuid,
        account_configuration = outcome.account_configuration_sent,
        bootstrap_package = outcome.bootstrap_package_sent,
        "post-enrollment workflow ran"
    );
    Ok(outcome)
}

/// Bootstrap-package delivery status for a host, from the command pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapDeliveryStatus {
    Pending,
    Installed,
    Failed { detail: String },
}

pub async fn bootstrap_delivery_status(
    store: &dyn Store,
    device_uuid: &str,
) -> Result<Option<BootstrapDeliveryStatus>, ReconcileError> {
    let commands = store.list_commands(Some(device_uuid)).await?;
    let Some(cmd) = commands
        .iter()
        .find(|c| c.request_type == "InstallEnterpriseApplication")
    else {
        return Ok(None);
    };
    let results = store.get_command_results(&cmd.command_uuid).await?;
    let Some(result) = results.iter().find(|r| r.device_uuid == device_uuid) else {
        return Ok(Some(BootstrapDeliveryStatus::Pending));
    };
    if result.status == "Acknowledged" {
        return Ok(Some(BootstrapDeliveryStatus::Installed));
    }
    let detail = shepherd_apple::checkin::parse_command_report(&result.payload)
        .ok()
        .and_then(|r| r.error_detail())
        .unwrap_or_else(|| result.status.clone());
    Ok(Some(BootstrapDeliveryStatus::Failed { detail }))
}

// ── MDM migration ─────────────────────────────────────────────────────────────

/// Why a migration request was not forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationDecision {
    Sent,
    /// Recently signalled; webhook suppressed until the window passes.
    Cooldown,
    NotEligible(&'static str),
}

/// Forward a device's migration request to the operator webhook when the
/// host is ABM-assigned, enrolled elsewhere, and not a server.
pub async fn request_migration(
    store: &dyn Store,
    http: &reqwest::Client,
    host: &Host,
    enrolled_in_third_party_mdm: bool,
    now: DateTime<Utc>,
) -> Result<MigrationDecision, ReconcileError> {
    if host.is_server {
        return Ok(MigrationDecision::NotEligible("host is a server"));
    }
    if !enrolled_in_third_party_mdm {
        return Ok(MigrationDecision::NotEligible(
            "host is not enrolled in a third-party MDM",
        ));
    }
    let assigned = store
        .get_dep_assignment(&host.serial)
        .await?
        .map(|a| a.deleted_at.is_none())
        .unwrap_or(false);
    if !assigned {
        return Ok(MigrationDecision::NotEligible("host is not assigned in ABM"));
    }
    if let Some(until) = host.refetch_critical_queries_until {
        if until > now {
            return Ok(MigrationDecision::Cooldown);
        }
    }

    let settings = store.get_settings().await?;
    let Some(webhook_url) = settings.mdm_migration_webhook_url else {
        return Ok(MigrationDecision::NotEligible("no migration webhook configured"));
    };

    let body = json!({
        "timestamp": now,
        "host": {
            "id": host.id.0,
            "uuid": host.uuid,
            "hardware_serial": host.serial,
        },
    });
    http.post(&webhook_url)
        .json(&body)
        .send()
        .await
        .map_err(|e| ReconcileError::Internal(format!("migration webhook: {}", e)))?
        .error_for_status()
        .map_err(|e| ReconcileError::Internal(format!("migration webhook: {}", e)))?;

    store
        .set_host_refetch_until(
            host.id,
            Some(now + chrono::Duration::minutes(MIGRATION_COOLDOWN_MINUTES)),
        )
        .await?;
    info!(host_id = %host.id, "migration webhook invoked");
    Ok(MigrationDecision::Sent)
}

/// Handle one durable job from the worker queue. Unknown kinds are skipped.
pub async fn handle_job(
    store: &dyn Store,
    server_url: &str,
    kind: &str,
    args: &serde_json::Value,
) -> Result<bool, ReconcileError> {
    match kind {
        JOB_POST_DEP_ENROLLMENT => {
            let Some(device_uuid) = args.get("device_uuid").and_then(|v| v.as_str()) else {
                warn!(kind, "job args missing device_uuid");
                return Ok(true); // malformed, don't redeliver forever
            };
            run_post_enrollment(store, server_url, device_uuid).await?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shepherd_domain::{AppleEnrollment, BootstrapPackage, IdpAccount, OrgSettings};
    use shepherd_store::{HostSeed, InMemoryStore};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SERVER_URL: &str = "https://mdm.example.com";

    async fn enrolled(store: &InMemoryStore, reference: Option<&str>) -> Host {
        let host = store
            .upsert_host(&HostSeed {
                uuid: "U1".into(),
                serial: "SN1".into(),
                hostname: "mac".into(),
                platform: Platform::Darwin,
            })
            .await
            .unwrap();
        store
            .upsert_apple_enrollment(&AppleEnrollment {
                device_uuid: "U1".into(),
                push_token: "t".into(),
                push_magic: "m".into(),
                unlock_token: None,
                bootstrap_token: None,
                cert_fingerprint: None,
                enrollment_reference: reference.map(String::from),
                enabled: true,
                active: true,
                enrolled_at: Utc::now(),
                last_seen_at: Utc::now(),
            })
            .await
            .unwrap();
        host
    }

    #[tokio::test]
    async fn bootstrap_package_is_sent_once() {
        let store = InMemoryStore::new();
        enrolled(&store, None).await;
        store
            .put_bootstrap_package(&BootstrapPackage {
                team_id: None,
                name: "pkg.pkg".into(),
                sha256: "abc".into(),
                token: "tok-1".into(),
                payload: vec![1],
                uploaded_at: Utc::now(),
            })
            .await
            .unwrap();

        let first = run_post_enrollment(&store, SERVER_URL, "U1").await.unwrap();
        assert!(first.bootstrap_package_sent);
        let second = run_post_enrollment(&store, SERVER_URL, "U1").await.unwrap();
        assert!(!second.bootstrap_package_sent, "idempotent on redelivery");

        let commands = store.list_commands(Some("U1")).await.unwrap();
        assert_eq!(commands.len(), 1);
        let text = String::from_utf8(commands[0].payload.clone()).unwrap();
        assert!(text.contains("/mdm/apple/bootstrap/manifest?token=tok-1"));
    }

    #[tokio::test]
    async fn sso_account_configuration_uses_idp_identity() {
        let store = InMemoryStore::new();
        enrolled(&store, Some("ref-1")).await;
        store
            .put_settings(&OrgSettings {
                end_user_auth_enabled: true,
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .upsert_idp_account(&IdpAccount {
                subject: "sub".into(),
                username: "user1".into(),
                fullname: "User One".into(),
                enrollment_reference: "ref-1".into(),
            })
            .await
            .unwrap();

        let outcome = run_post_enrollment(&store, SERVER_URL, "U1").await.unwrap();
        assert!(outcome.account_configuration_sent);
        let commands = store.list_commands(Some("U1")).await.unwrap();
        let text = String::from_utf8(commands[0].payload.clone()).unwrap();
        assert!(text.contains("User One"));
        assert!(text.contains("LockPrimaryAccountInfo"));
    }

    #[tokio::test]
    async fn bootstrap_status_follows_command_result() {
        let store = InMemoryStore::new();
        enrolled(&store, None).await;
        store
            .put_bootstrap_package(&BootstrapPackage {
                team_id: None,
                name: "pkg.pkg".into(),
                sha256: "abc".into(),
                token: "tok-1".into(),
                payload: vec![1],
                uploaded_at: Utc::now(),
            })
            .await
            .unwrap();
        run_post_enrollment(&store, SERVER_URL, "U1").await.unwrap();

        assert_eq!(
            bootstrap_delivery_status(&store, "U1").await.unwrap(),
            Some(BootstrapDeliveryStatus::Pending)
        );

        let cmd = &store.list_commands(Some("U1")).await.unwrap()[0];
        store
            .record_command_result(&shepherd_domain::CommandResult {
                command_uuid: cmd.command_uuid.clone(),
                device_uuid: "U1".into(),
                status: "Acknowledged".into(),
                payload: vec![],
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(
            bootstrap_delivery_status(&store, "U1").await.unwrap(),
            Some(BootstrapDeliveryStatus::Installed)
        );
    }

    #[tokio::test]
    async fn migration_webhook_fires_once_per_window() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(serde_json::json!({
                "host": { "hardware_serial": "SN1" }
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = InMemoryStore::new();
        let host = enrolled(&store, None).await;
        store
            .put_settings(&OrgSettings {
                mdm_migration_webhook_url: Some(format!("{}/hook", server.uri())),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .upsert_dep_assignment(&shepherd_domain::DepAssignment {
                serial_number: "SN1".into(),
                profile_uuid: None,
                team_id: None,
                added_at: Utc::now(),
                deleted_at: None,
            })
            .await
            .unwrap();

        let http = reqwest::Client::new();
        let now = Utc::now();
        let first = request_migration(&store, &http, &host, true, now).await.unwrap();
        assert_eq!(first, MigrationDecision::Sent);

        // Reload: the cooldown window was stamped on the host.
        let host = store.get_host_by_uuid("U1").await.unwrap().unwrap();
        let second = request_migration(&store, &http, &host, true, now).await.unwrap();
        assert_eq!(second, MigrationDecision::Cooldown);
    }

    #[tokio::test]
    async fn migration_rejects_servers_and_unassigned_hosts() {
        let store = InMemoryStore::new();
        let mut host = enrolled(&store, None).await;
        let http = reqwest::Client::new();

        let verdict = request_migration(&store, &http, &host, true, Utc::now()).await.unwrap();
        assert_eq!(
            verdict,
            MigrationDecision::NotEligible("host is not assigned in ABM")
        );

        host.is_server = true;
        let verdict = request_migration(&store, &http, &host, true, Utc::now()).await.unwrap();
        assert_eq!(verdict, MigrationDecision::NotEligible("host is a server"));
    }
}

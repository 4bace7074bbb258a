//! Check-in and command-endpoint processing against the store.

use base64::Engine as _;
use chrono::Utc;
use serde::Serialize;
use shepherd_domain::{AppleEnrollment, CommandResult, Platform};
use shepherd_store::{Activity, HostSeed, Store};
use tracing::{debug, info};

use crate::checkin::{parse_checkin, parse_command_report, CheckinMessage};
use crate::error::AppleError;

/// What the transport should do after a check-in was processed.
#[derive(Debug)]
pub enum CheckinOutcome {
    /// Respond 200 with an empty body.
    Handled,
    /// Enrollment progressed; `first_token_update` asks the caller to kick
    /// off the post-enrollment workflow.
    Enrolled {
        device_uuid: String,
        first_token_update: bool,
        awaiting_configuration: bool,
    },
    /// Respond with the given plist body.
    Body(Vec<u8>),
}

#[derive(Debug, Serialize)]
struct BootstrapTokenResponse {
    #[serde(rename = "BootstrapToken")]
    bootstrap_token: plist::Data,
}

fn verify_cert(enrollment: &AppleEnrollment, presented: Option<&str>) -> Result<(), AppleError> {
    match (&enrollment.cert_fingerprint, presented) {
        (Some(stored), Some(presented)) if stored == presented => Ok(()),
        (Some(_), _) => Err(AppleError::CertMismatch),
        (None, _) => Ok(()),
    }
}

/// Process one check-in message. `presented_fingerprint` is the SHA-256 of
/// the client certificate forwarded by the TLS terminator.
pub async fn process_checkin(
    store: &dyn Store,
    body: &[u8],
    presented_fingerprint: Option<&str>,
) -> Result<CheckinOutcome, AppleError> {
    let msg = parse_checkin(body)?;
    let now = Utc::now();

    match msg {
        CheckinMessage::Authenticate(m) => {
            // The enrollment row and its cert association are written in one
            // store call, so the first TokenUpdate can never observe the row
            // without the association.
            if let Some(existing) = store.get_apple_enrollment(&m.udid).await? {
                verify_cert(&existing, presented_fingerprint)?;
            }
            store
                .upsert_host(&HostSeed {
                    uuid: m.udid.clone(),
                    serial: m.serial_number.clone().unwrap_or_default(),
                    hostname: m
                        .device_name
                        .clone()
                        .or(m.model.clone())
                        .unwrap_or_else(|| m.udid.clone()),
                    platform: Platform::Darwin,
                })
                .await?;
            let existing = store.get_apple_enrollment(&m.udid).await?;
            let enrollment = AppleEnrollment {
                device_uuid: m.udid.clone(),
                push_token: String::new(),
                push_magic: String::new(),
                unlock_token: None,
                bootstrap_token: existing.as_ref().and_then(|e| e.bootstrap_token.clone()),
                cert_fingerprint: presented_fingerprint
                    .map(String::from)
                    .or(existing.as_ref().and_then(|e| e.cert_fingerprint.clone())),
                enrollment_reference: existing
                    .as_ref()
                    .and_then(|e| e.enrollment_reference.clone()),
                enabled: true,
                active: false,
                enrolled_at: existing.map(|e| e.enrolled_at).unwrap_or(now),
                last_seen_at: now,
            };
            store.upsert_apple_enrollment(&enrollment).await?;
            info!(device_uuid = %m.udid, "Authenticate processed");
            Ok(CheckinOutcome::Handled)
        }
        CheckinMessage::TokenUpdate(m) => {
            let mut enrollment = store
                .get_apple_enrollment(&m.udid)
                .await?
                .ok_or_else(|| AppleError::NotEnrolled(m.udid.clone()))?;
            verify_cert(&enrollment, presented_fingerprint)?;

            let first_token_update = !enrollment.active;
            let token: Vec<u8> = m.token.into();
            enrollment.push_token = hex::encode(token);
            enrollment.push_magic = m.push_magic;
            if let Some(unlock) = m.unlock_token {
                let unlock: Vec<u8> = unlock.into();
                enrollment.unlock_token =
                    Some(base64::engine::general_purpose::STANDARD.encode(unlock));
            }
            enrollment.enabled = true;
            enrollment.active = true;
            enrollment.last_seen_at = now;
            store.upsert_apple_enrollment(&enrollment).await?;

            if first_token_update {
                store
                    .append_activity(&Activity::MdmEnrolled {
                        at: now,
                        host_uuid: m.udid.clone(),
                        platform: Platform::Darwin,
                    })
                    .await?;
            }
            info!(device_uuid = %m.udid, first_token_update, "TokenUpdate processed");
            Ok(CheckinOutcome::Enrolled {
                device_uuid: m.udid,
                first_token_update,
                awaiting_configuration: m.awaiting_configuration,
            })
        }
        CheckinMessage::CheckOut(m) => {
            let mut enrollment = store
                .get_apple_enrollment(&m.udid)
                .await?
                .ok_or_else(|| AppleError::NotEnrolled(m.udid.clone()))?;
            verify_cert(&enrollment, presented_fingerprint)?;
            // Soft disable: the cert association survives so a re-enroll by
            // the same device keeps authenticating.
            enrollment.enabled = false;
            enrollment.active = false;
            enrollment.last_seen_at = now;
            store.upsert_apple_enrollment(&enrollment).await?;
            store
                .append_activity(&Activity::MdmUnenrolled {
                    at: now,
                    host_uuid: m.udid.clone(),
                    platform: Platform::Darwin,
                })
                .await?;
            info!(device_uuid = %m.udid, "CheckOut processed");
            Ok(CheckinOutcome::Handled)
        }
        CheckinMessage::SetBootstrapToken(m) => {
            let mut enrollment = store
                .get_apple_enrollment(&m.udid)
                .await?
                .ok_or_else(|| AppleError::NotEnrolled(m.udid.clone()))?;
            verify_cert(&enrollment, presented_fingerprint)?;
            enrollment.bootstrap_token = m.bootstrap_token.map(|d| {
                let bytes: Vec<u8> = d.into();
                base64::engine::general_purpose::STANDARD.encode(bytes)
            });
            enrollment.last_seen_at = now;
            store.upsert_apple_enrollment(&enrollment).await?;
            Ok(CheckinOutcome::Handled)
        }
        CheckinMessage::GetBootstrapToken(m) => {
            let enrollment = store
                .get_apple_enrollment(&m.udid)
                .await?
                .ok_or_else(|| AppleError::NotEnrolled(m.udid.clone()))?;
            verify_cert(&enrollment, presented_fingerprint)?;
            if enrollment.cert_fingerprint.is_none() {
                return Err(AppleError::MissingCertAssociation(m.udid.clone()));
            }
            match enrollment.bootstrap_token {
                Some(token_b64) => {
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(token_b64.as_bytes())
                        .map_err(|e| AppleError::Plist(e.to_string()))?;
                    let mut out = Vec::new();
                    plist::to_writer_xml(
                        &mut out,
                        &BootstrapTokenResponse {
                            bootstrap_token: plist::Data::new(bytes),
                        },
                    )?;
                    Ok(CheckinOutcome::Body(out))
                }
                None => Ok(CheckinOutcome::Handled),
            }
        }
    }
}

/// Result of processing a command-endpoint POST.
#[derive(Debug)]
pub struct ReportOutcome {
    pub device_uuid: String,
    /// `(command_uuid, status, error_detail)` when the report settled a
    /// command.
    pub settled: Option<(String, String, Option<String>)>,
    /// The next pending command's plist, if any.
    pub next_command_payload: Option<Vec<u8>>,
}

/// Process an `Idle` poll or a command result, releasing the next queued
/// command for the device.
pub async fn process_command_report(
    store: &dyn Store,
    body: &[u8],
    presented_fingerprint: Option<&str>,
) -> Result<ReportOutcome, AppleError> {
    let report = parse_command_report(body)?;
    let enrollment = store
        .get_apple_enrollment(&report.udid)
        .await?
        .ok_or_else(|| AppleError::NotEnrolled(report.udid.clone()))?;
    verify_cert(&enrollment, presented_fingerprint)?;

    let mut settled = None;
    if !report.is_idle() && report.status != "NotNow" {
        if let Some(command_uuid) = &report.command_uuid {
            store
                .record_command_result(&CommandResult {
                    command_uuid: command_uuid.clone(),
                    device_uuid: report.udid.clone(),
                    status: report.status.clone(),
                    payload: body.to_vec(),
                    updated_at: Utc::now(),
                })
                .await?;
            settled = Some((
                command_uuid.clone(),
                report.status.clone(),
                report.error_detail(),
            ));
        }
    }

    // A NotNow device asked us to pause; deliver nothing until the next poll.
    let next_command_payload = if report.status == "NotNow" {
        None
    } else {
        store
            .next_pending_command(&report.udid)
            .await?
            .map(|cmd| cmd.payload)
    };
    debug!(
        device_uuid = %report.udid,
        status = %report.status,
        has_next = next_command_payload.is_some(),
        "command report processed"
    );

    Ok(ReportOutcome {
        device_uuid: report.udid,
        settled,
        next_command_payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shepherd_domain::Command;
    use shepherd_store::InMemoryStore;

    fn checkin_plist(kind: &str, udid: &str, extra: &str) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0"><dict>
  <key>MessageType</key><string>{kind}</string>
  <key>UDID</key><string>{udid}</string>
  {extra}
</dict></plist>"#
        )
        .into_bytes()
    }

    fn token_update(udid: &str) -> Vec<u8> {
        checkin_plist(
            "TokenUpdate",
            udid,
            "<key>Token</key><data>dG9r</data><key>PushMagic</key><string>magic</string>",
        )
    }

    async fn enroll(store: &InMemoryStore, udid: &str, fp: Option<&str>) {
        let auth = checkin_plist(
            "Authenticate",
            udid,
            "<key>SerialNumber</key><string>SN1</string>",
        );
        process_checkin(store, &auth, fp).await.unwrap();
        process_checkin(store, &token_update(udid), fp).await.unwrap();
    }

    #[tokio::test]
    async fn enrollment_is_idempotent() {
        let store = InMemoryStore::new();
        enroll(&store, "U1", Some("fp1")).await;
        enroll(&store, "U1", Some("fp1")).await;

        let activities = store.list_activities(100).await.unwrap();
        let enrolled = activities
            .iter()
            .filter(|a| matches!(a, Activity::MdmEnrolled { .. }))
            .count();
        assert_eq!(enrolled, 1, "one mdm_enrolled activity for a re-enroll");
        assert_eq!(store.list_apple_enrollments().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mismatched_cert_is_rejected() {
        let store = InMemoryStore::new();
        enroll(&store, "U1", Some("fp1")).await;
        let err = process_checkin(&store, &token_update("U1"), Some("fp2"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppleError::CertMismatch));
    }

    #[tokio::test]
    async fn checkout_soft_disables_and_keeps_association() {
        let store = InMemoryStore::new();
        enroll(&store, "U1", Some("fp1")).await;
        process_checkin(&store, &checkin_plist("CheckOut", "U1", ""), Some("fp1"))
            .await
            .unwrap();
        let e = store.get_apple_enrollment("U1").await.unwrap().unwrap();
        assert!(!e.enabled);
        assert_eq!(e.cert_fingerprint.as_deref(), Some("fp1"));
    }

    #[tokio::test]
    async fn get_bootstrap_token_without_association_errors() {
        let store = InMemoryStore::new();
        enroll(&store, "U1", None).await;
        let err = process_checkin(
            &store,
            &checkin_plist("GetBootstrapToken", "U1", ""),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppleError::MissingCertAssociation(_)));
    }

    #[tokio::test]
    async fn bootstrap_token_round_trips() {
        let store = InMemoryStore::new();
        enroll(&store, "U1", Some("fp1")).await;
        process_checkin(
            &store,
            &checkin_plist(
                "SetBootstrapToken",
                "U1",
                "<key>BootstrapToken</key><data>Ym9vdHN0cmFw</data>",
            ),
            Some("fp1"),
        )
        .await
        .unwrap();
        let out = process_checkin(
            &store,
            &checkin_plist("GetBootstrapToken", "U1", ""),
            Some("fp1"),
        )
        .await
        .unwrap();
        match out {
            CheckinOutcome::Body(body) => {
                let text = String::from_utf8(body).unwrap();
                assert!(text.contains("BootstrapToken"));
            }
            other => panic!("expected Body, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn idle_drains_queue_and_results_release_next() {
        let store = InMemoryStore::new();
        enroll(&store, "U1", Some("fp1")).await;
        for uuid in ["c1", "c2"] {
            store
                .enqueue_command(&Command {
                    command_uuid: uuid.into(),
                    device_uuid: "U1".into(),
                    platform: Platform::Darwin,
                    request_type: "InstallProfile".into(),
                    payload: format!("payload-{}", uuid).into_bytes(),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let idle_body = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0"><dict>
  <key>Status</key><string>Idle</string>
  <key>UDID</key><string>U1</string>
</dict></plist>"#
        );
        let out = process_command_report(&store, idle_body.as_bytes(), Some("fp1"))
            .await
            .unwrap();
        assert_eq!(out.next_command_payload, Some(b"payload-c1".to_vec()));

        let ack = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0"><dict>
  <key>Status</key><string>Acknowledged</string>
  <key>UDID</key><string>U1</string>
  <key>CommandUUID</key><string>c1</string>
</dict></plist>"#
        );
        let out = process_command_report(&store, ack.as_bytes(), Some("fp1"))
            .await
            .unwrap();
        assert_eq!(
            out.settled,
            Some(("c1".to_string(), "Acknowledged".to_string(), None))
        );
        assert_eq!(out.next_command_payload, Some(b"payload-c2".to_vec()));
    }
}

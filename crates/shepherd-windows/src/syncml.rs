//! SyncML 1.2 management sessions.
//!
//! Each device POST carries status items for previously delivered commands
//! plus optional result items; the response acknowledges them and drains the
//! device's pending command queue. Commands are stored with `CmdID` equal to
//! the pipeline's `command_uuid`, so device `CmdRef`s correlate directly.

use chrono::Utc;
use quick_xml::events::Event;
use quick_xml::Reader;
use shepherd_domain::{Command, CommandResult, Platform, WindowsEnrollType};
use shepherd_store::{Activity, Store};
use tracing::{debug, info};

use crate::error::WindowsError;
use crate::soap::{escape, extract_text};

/// Target URI the automatic-enrollment flow installs the agent through.
pub const AGENT_INSTALLER_URI: &str =
    "./Device/Vendor/MSFT/EnterpriseDesktopAppManagement/MSI/%7BF2C5D8AB-6C44-4A18-9E2B-7D10A4C63F91%7D/DownloadInstall";

const UNENROLL_META_TYPE: &str = "com.microsoft:mdm.unenrollment.userrequest";

// ── Wire model ────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct Alert {
    pub cmd_id: String,
    pub code: String,
    pub meta_type: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct StatusItem {
    pub cmd_id: String,
    pub cmd_ref: String,
    pub cmd: String,
    pub data: String,
}

#[derive(Debug, Default, Clone)]
pub struct ResultItem {
    pub cmd_ref: String,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SyncmlMessage {
    pub session_id: String,
    pub msg_id: String,
    pub device_id: String,
    pub alerts: Vec<Alert>,
    pub statuses: Vec<StatusItem>,
    pub results: Vec<ResultItem>,
}

impl SyncmlMessage {
    /// Unenroll: alerts 1201 + 1224 + 1226 with the user-request meta item.
    pub fn is_unenroll(&self) -> bool {
        let has = |code: &str| self.alerts.iter().any(|a| a.code == code);
        has("1201")
            && has("1224")
            && has("1226")
            && self
                .alerts
                .iter()
                .any(|a| a.meta_type.as_deref() == Some(UNENROLL_META_TYPE))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    None,
    Header,
    Alert,
    Status,
    Results,
}

/// Parse a SyncML document leniently (local names only).
pub fn parse_syncml(xml: &str) -> Result<SyncmlMessage, WindowsError> {
    let mut reader = Reader::from_str(xml);
    let mut msg = SyncmlMessage::default();
    let mut section = Section::None;
    let mut in_source = false;
    let mut alert = Alert::default();
    let mut status = StatusItem::default();
    let mut result = ResultItem::default();

    loop {
        match reader.read_event().map_err(|e| WindowsError::Xml(e.to_string()))? {
            Event::Start(e) => {
                let local = e.local_name().as_ref().to_vec();
                match local.as_slice() {
                    b"SyncHdr" => section = Section::Header,
                    b"Alert" => {
                        section = Section::Alert;
                        alert = Alert::default();
                    }
                    b"Status" => {
                        section = Section::Status;
                        status = StatusItem::default();
                    }
                    b"Results" => {
                        section = Section::Results;
                        result = ResultItem::default();
                    }
                    b"Source" => in_source = true,
                    b"SessionID" | b"MsgID" | b"LocURI" | b"CmdID" | b"CmdRef" | b"Cmd"
                    | b"Data" | b"Type" => {
                        let end = e.to_end().into_owned();
                        let text = reader
                            .read_text(end.name())
                            .map_err(|e| WindowsError::Xml(e.to_string()))?
                            .trim()
                            .to_string();
                        match (section, local.as_slice()) {
                            (Section::Header, b"SessionID") => msg.session_id = text,
                            (Section::Header, b"MsgID") => msg.msg_id = text,
                            (Section::Header, b"LocURI") if in_source => msg.device_id = text,
                            (Section::Alert, b"CmdID") => alert.cmd_id = text,
                            (Section::Alert, b"Data") => {
                                if alert.code.is_empty() {
                                    alert.code = text;
                                }
                            }
                            (Section::Alert, b"Type") => alert.meta_type = Some(text),
                            (Section::Status, b"CmdID") => status.cmd_id = text,
                            (Section::Status, b"CmdRef") => status.cmd_ref = text,
                            (Section::Status, b"Cmd") => status.cmd = text,
                            (Section::Status, b"Data") => status.data = text,
                            (Section::Results, b"CmdRef") => result.cmd_ref = text,
                            (Section::Results, b"Data") => result.data = text,
                            _ => {}
                        }
                    }
                    _ => {}
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"SyncHdr" => section = Section::None,
                b"Alert" => {
                    msg.alerts.push(std::mem::take(&mut alert));
                    section = Section::None;
                }
                b"Status" => {
                    msg.statuses.push(std::mem::take(&mut status));
                    section = Section::None;
                }
                b"Results" => {
                    msg.results.push(std::mem::take(&mut result));
                    section = Section::None;
                }
                b"Source" => in_source = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if msg.device_id.is_empty() {
        return Err(WindowsError::Xml("SyncHdr.Source.LocURI is missing".into()));
    }
    Ok(msg)
}

// ── Command builders ──────────────────────────────────────────────────────────

pub fn build_exec(command_uuid: &str, target_uri: &str) -> String {
    format!(
        "<Exec><CmdID>{}</CmdID><Item><Target><LocURI>{}</LocURI></Target></Item></Exec>",
        escape(command_uuid),
        escape(target_uri),
    )
}

pub fn build_add(command_uuid: &str, target_uri: &str) -> String {
    format!(
        "<Add><CmdID>{}</CmdID><Item><Target><LocURI>{}</LocURI></Target></Item></Add>",
        escape(command_uuid),
        escape(target_uri),
    )
}

pub fn build_replace(command_uuid: &str, target_uri: &str, data: &str) -> String {
    format!(
        "<Replace><CmdID>{}</CmdID><Item><Target><LocURI>{}</LocURI></Target><Data>{}</Data></Item></Replace>",
        escape(command_uuid),
        escape(target_uri),
        escape(data),
    )
}

pub fn build_delete(command_uuid: &str, target_uri: &str) -> String {
    format!(
        "<Delete><CmdID>{}</CmdID><Item><Target><LocURI>{}</LocURI></Target></Item></Delete>",
        escape(command_uuid),
        escape(target_uri),
    )
}

/// Stamp a profile fragment (one top-level `Add`/`Replace`/`Delete` element)
/// with the pipeline's command uuid as its `CmdID`.
pub fn wrap_profile_command(fragment: &str, command_uuid: &str) -> Result<String, WindowsError> {
    let trimmed = fragment.trim();
    let open_end = trimmed
        .find('>')
        .ok_or_else(|| WindowsError::Xml("profile payload is not a SyncML element".into()))?;
    Ok(format!(
        "{}<CmdID>{}</CmdID>{}",
        &trimmed[..=open_end],
        escape(command_uuid),
        &trimmed[open_end + 1..],
    ))
}

/// Extract `(CmdID, first LocURI)` from a raw operator-supplied command.
pub fn parse_raw_command(xml: &str) -> Result<(String, String), WindowsError> {
    let cmd_id = extract_text(xml, "CmdID")
        .ok_or_else(|| WindowsError::Xml("command is missing CmdID".into()))?;
    let loc_uri = extract_text(xml, "LocURI")
        .ok_or_else(|| WindowsError::Xml("command is missing Target LocURI".into()))?;
    Ok((cmd_id, loc_uri))
}

// ── Management session ────────────────────────────────────────────────────────

/// Outcome of one management POST.
#[derive(Debug)]
pub struct ManagementOutcome {
    pub response: String,
    /// `(command_uuid, status_code)` for every settled server command.
    pub settled: Vec<(String, String)>,
    /// Device id when this session ended in an unenroll.
    pub unenrolled: Option<String>,
}

/// Process one SyncML session POST.
pub async fn process_management(
    store: &dyn Store,
    server_url: &str,
    body: &str,
) -> Result<ManagementOutcome, WindowsError> {
    let msg = parse_syncml(body)?;
    let enrollment = store
        .get_windows_enrollment(&msg.device_id)
        .await?
        .ok_or_else(|| WindowsError::NotEnrolled(msg.device_id.clone()))?;
    let now = Utc::now();

    // Unenroll alert: hard-delete the enrollment, ack, deliver nothing.
    if msg.is_unenroll() {
        store.delete_windows_enrollment(&msg.device_id).await?;
        store
            .append_activity(&Activity::MdmUnenrolled {
                at: now,
                host_uuid: enrollment
                    .host_uuid
                    .clone()
                    .unwrap_or_else(|| msg.device_id.clone()),
                platform: Platform::Windows,
            })
            .await?;
        info!(mdm_device_id = %msg.device_id, "windows device unenrolled");
        let response = render_response(server_url, &msg, &[]);
        return Ok(ManagementOutcome {
            response,
            settled: Vec::new(),
            unenrolled: Some(msg.device_id),
        });
    }

    // Settle results for previously delivered commands.
    let mut settled = Vec::new();
    for status in &msg.statuses {
        if status.cmd == "SyncHdr" || status.cmd_ref == "0" || status.cmd_ref.is_empty() {
            continue;
        }
        if store.get_command(&status.cmd_ref).await?.is_none() {
            continue;
        }
        let payload = msg
            .results
            .iter()
            .find(|r| r.cmd_ref == status.cmd_ref)
            .map(|r| r.data.clone().into_bytes())
            .unwrap_or_default();
        store
            .record_command_result(&CommandResult {
                command_uuid: status.cmd_ref.clone(),
                device_uuid: msg.device_id.clone(),
                status: status.data.clone(),
                payload,
                updated_at: now,
            })
            .await?;
        settled.push((status.cmd_ref.clone(), status.data.clone()));
    }

    // First session of an automatic enrollment: stage the agent installer.
    if enrollment.enroll_type == WindowsEnrollType::Automatic
        && store.list_commands(Some(&msg.device_id)).await?.is_empty()
    {
        for builder in [build_add, build_exec] {
            let command_uuid = uuid::Uuid::new_v4().to_string();
            let payload = builder(&command_uuid, AGENT_INSTALLER_URI);
            store
                .enqueue_command(&Command {
                    command_uuid,
                    device_uuid: msg.device_id.clone(),
                    platform: Platform::Windows,
                    request_type: AGENT_INSTALLER_URI.to_string(),
                    payload: payload.into_bytes(),
                    created_at: now,
                })
                .await?;
        }
        debug!(mdm_device_id = %msg.device_id, "staged agent installer commands");
    }

    // Drain everything still unanswered, in enqueue order.
    let mut pending = Vec::new();
    for cmd in store.list_commands(Some(&msg.device_id)).await? {
        let answered = store
            .get_command_results(&cmd.command_uuid)
            .await?
            .iter()
            .any(|r| r.device_uuid == msg.device_id);
        if !answered {
            pending.push(String::from_utf8_lossy(&cmd.payload).into_owned());
        }
    }

    let response = render_response(server_url, &msg, &pending);
    Ok(ManagementOutcome {
        response,
        settled,
        unenrolled: None,
    })
}

fn render_response(server_url: &str, msg: &SyncmlMessage, commands: &[String]) -> String {
    let mut body = String::new();
    let mut cmd_id = 1u32;

    // Ack the header.
    body.push_str(&format!(
        "<Status><CmdID>{}</CmdID><MsgRef>{}</MsgRef><CmdRef>0</CmdRef><Cmd>SyncHdr</Cmd><Data>200</Data></Status>",
        cmd_id,
        escape(&msg.msg_id),
    ));
    cmd_id += 1;

    // Ack each alert.
    for alert in &msg.alerts {
        body.push_str(&format!(
            "<Status><CmdID>{}</CmdID><MsgRef>{}</MsgRef><CmdRef>{}</CmdRef><Cmd>Alert</Cmd><Data>200</Data></Status>",
            cmd_id,
            escape(&msg.msg_id),
            escape(&alert.cmd_id),
        ));
        cmd_id += 1;
    }

    for command in commands {
        body.push_str(command);
    }

    format!(
        r#"<SyncML xmlns="SYNCML:SYNCML1.2">
<SyncHdr>
<VerDTD>1.2</VerDTD>
<VerProto>DM/1.2</VerProto>
<SessionID>{session}</SessionID>
<MsgID>{msg_id}</MsgID>
<Target><LocURI>{device}</LocURI></Target>
<Source><LocURI>{server}/ManagementServer/Manage.svc</LocURI></Source>
</SyncHdr>
<SyncBody>
{body}
<Final/>
</SyncBody>
</SyncML>"#,
        session = escape(&msg.session_id),
        msg_id = escape(&msg.msg_id),
        device = escape(&msg.device_id),
        server = escape(server_url),
        body = body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shepherd_domain::WindowsEnrollment;
    use shepherd_store::InMemoryStore;

    const SERVER_URL: &str = "https://mdm.example.com";
    const DEVICE_ID: &str = "AB157C3A18778F4FB21E2739066C1F27";

    fn syncml(body: &str) -> String {
        format!(
            r#"<SyncML xmlns="SYNCML:SYNCML1.2">
<SyncHdr>
<VerDTD>1.2</VerDTD><VerProto>DM/1.2</VerProto>
<SessionID>1</SessionID><MsgID>1</MsgID>
<Target><LocURI>{SERVER_URL}/ManagementServer/Manage.svc</LocURI></Target>
<Source><LocURI>{DEVICE_ID}</LocURI></Source>
</SyncHdr>
<SyncBody>
{body}
<Final/>
</SyncBody>
</SyncML>"#
        )
    }

    fn device_status() -> String {
        "<Status><CmdID>1</CmdID><MsgRef>1</MsgRef><CmdRef>0</CmdRef><Cmd>SyncHdr</Cmd><Data>200</Data></Status>".into()
    }

    async fn enrolled_store(enroll_type: WindowsEnrollType) -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .upsert_windows_enrollment(&WindowsEnrollment {
                mdm_device_id: DEVICE_ID.into(),
                hardware_id: DEVICE_ID.into(),
                device_name: "DESKTOP-1".into(),
                enroll_type,
                os_version: "10.0".into(),
                not_in_oobe: false,
                host_uuid: Some("W1".into()),
                cert_fingerprint: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store
    }

    #[test]
    fn parses_header_and_statuses() {
        let msg = parse_syncml(&syncml(&device_status())).unwrap();
        assert_eq!(msg.device_id, DEVICE_ID);
        assert_eq!(msg.session_id, "1");
        assert_eq!(msg.statuses.len(), 1);
        assert_eq!(msg.statuses[0].cmd, "SyncHdr");
    }

    #[test]
    fn detects_unenroll_alerts() {
        let alerts = r#"
<Alert><CmdID>2</CmdID><Data>1201</Data></Alert>
<Alert><CmdID>3</CmdID><Data>1224</Data></Alert>
<Alert><CmdID>4</CmdID><Data>1226</Data>
  <Item><Meta><Type xmlns="syncml:metinf">com.microsoft:mdm.unenrollment.userrequest</Type></Meta><Data>user</Data></Item>
</Alert>"#;
        let msg = parse_syncml(&syncml(alerts)).unwrap();
        assert!(msg.is_unenroll());

        let partial = parse_syncml(&syncml(
            "<Alert><CmdID>2</CmdID><Data>1201</Data></Alert>",
        ))
        .unwrap();
        assert!(!partial.is_unenroll());
    }

    #[tokio::test]
    async fn unenroll_deletes_enrollment() {
        let store = enrolled_store(WindowsEnrollType::Programmatic).await;
        let alerts = r#"
<Alert><CmdID>2</CmdID><Data>1201</Data></Alert>
<Alert><CmdID>3</CmdID><Data>1224</Data></Alert>
<Alert><CmdID>4</CmdID><Data>1226</Data>
  <Item><Meta><Type>com.microsoft:mdm.unenrollment.userrequest</Type></Meta></Item>
</Alert>"#;
        let out = process_management(&store, SERVER_URL, &syncml(alerts))
            .await
            .unwrap();
        assert_eq!(out.unenrolled.as_deref(), Some(DEVICE_ID));
        assert!(store.get_windows_enrollment(DEVICE_ID).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delivers_queued_exec_and_settles_result() {
        let store = enrolled_store(WindowsEnrollType::Programmatic).await;
        let uuid = "reboot-cmd-1";
        let target = "./Device/Vendor/MSFT/Reboot/RebootNow";
        store
            .enqueue_command(&Command {
                command_uuid: uuid.into(),
                device_uuid: DEVICE_ID.into(),
                platform: Platform::Windows,
                request_type: target.into(),
                payload: build_exec(uuid, target).into_bytes(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        // First session: the Exec is delivered.
        let out = process_management(&store, SERVER_URL, &syncml(&device_status()))
            .await
            .unwrap();
        assert!(out.response.contains("RebootNow"));
        assert!(out.response.contains(uuid));

        // Device posts Status 200 for it.
        let ack = format!(
            "{}<Status><CmdID>2</CmdID><MsgRef>2</MsgRef><CmdRef>{}</CmdRef><Cmd>Exec</Cmd><Data>200</Data></Status>",
            device_status(),
            uuid
        );
        let out = process_management(&store, SERVER_URL, &syncml(&ack)).await.unwrap();
        assert_eq!(out.settled, vec![(uuid.to_string(), "200".to_string())]);

        let results = store.get_command_results(uuid).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, "200");

        // Settled command is not redelivered.
        assert!(!out.response.contains("RebootNow"));
    }

    #[tokio::test]
    async fn automatic_enrollment_stages_agent_installer() {
        let store = enrolled_store(WindowsEnrollType::Automatic).await;
        let out = process_management(&store, SERVER_URL, &syncml(&device_status()))
            .await
            .unwrap();
        let commands = store.list_commands(Some(DEVICE_ID)).await.unwrap();
        assert_eq!(commands.len(), 2, "Add then Exec");
        assert!(out.response.contains("EnterpriseDesktopAppManagement"));
        assert!(out.response.contains("<Add>"));
        assert!(out.response.contains("<Exec>"));
    }

    #[test]
    fn wrap_profile_command_stamps_cmd_id() {
        let fragment = "<Replace><Item><Target><LocURI>./Device/X</LocURI></Target><Data>1</Data></Item></Replace>";
        let wrapped = wrap_profile_command(fragment, "u-1").unwrap();
        assert!(wrapped.starts_with("<Replace><CmdID>u-1</CmdID>"));
        let (uuid, uri) = parse_raw_command(&wrapped).unwrap();
        assert_eq!(uuid, "u-1");
        assert_eq!(uri, "./Device/X");
    }
}

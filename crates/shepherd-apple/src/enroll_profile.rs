//! Enrollment profile generation: a configuration profile carrying a SCEP
//! payload (challenge + URL) and an MDM payload (server URL + topic).

use serde::Serialize;
use uuid::Uuid;

use crate::error::AppleError;

#[derive(Debug, Clone)]
pub struct EnrollProfileParams {
    pub server_url: String,
    pub scep_challenge: String,
    /// APNs topic of the server's push certificate.
    pub topic: String,
    pub organization: String,
    /// Threaded through the SSO-gated flow; appended to the command endpoint
    /// URL so results correlate back to the IdP user.
    pub enrollment_reference: Option<String>,
}

#[derive(Debug, Serialize)]
struct ScepPayloadContent {
    #[serde(rename = "URL")]
    url: String,
    #[serde(rename = "Challenge")]
    challenge: String,
    #[serde(rename = "Key Type")]
    key_type: &'static str,
    #[serde(rename = "Key Usage")]
    key_usage: u32,
    #[serde(rename = "Keysize")]
    key_size: u32,
    #[serde(rename = "Subject")]
    subject: Vec<Vec<Vec<String>>>,
}

#[derive(Debug, Serialize)]
struct ScepPayload {
    #[serde(rename = "PayloadType")]
    payload_type: &'static str,
    #[serde(rename = "PayloadVersion")]
    payload_version: u32,
    #[serde(rename = "PayloadIdentifier")]
    payload_identifier: String,
    #[serde(rename = "PayloadUUID")]
    payload_uuid: String,
    #[serde(rename = "PayloadDisplayName")]
    payload_display_name: &'static str,
    #[serde(rename = "PayloadContent")]
    payload_content: ScepPayloadContent,
}

#[derive(Debug, Serialize)]
struct MdmPayload {
    #[serde(rename = "PayloadType")]
    payload_type: &'static str,
    #[serde(rename = "PayloadVersion")]
    payload_version: u32,
    #[serde(rename = "PayloadIdentifier")]
    payload_identifier: String,
    #[serde(rename = "PayloadUUID")]
    payload_uuid: String,
    #[serde(rename = "PayloadDisplayName")]
    payload_display_name: &'static str,
    #[serde(rename = "ServerURL")]
    server_url: String,
    #[serde(rename = "CheckInURL")]
    check_in_url: String,
    #[serde(rename = "Topic")]
    topic: String,
    #[serde(rename = "IdentityCertificateUUID")]
    identity_certificate_uuid: String,
    #[serde(rename = "AccessRights")]
    access_rights: u32,
    #[serde(rename = "CheckOutWhenRemoved")]
    check_out_when_removed: bool,
    #[serde(rename = "SignMessage")]
    sign_message: bool,
    #[serde(rename = "ServerCapabilities")]
    server_capabilities: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ProfilePayload {
    Scep(ScepPayload),
    Mdm(MdmPayload),
}

#[derive(Debug, Serialize)]
struct EnrollProfile {
    #[serde(rename = "PayloadType")]
    payload_type: &'static str,
    #[serde(rename = "PayloadVersion")]
    payload_version: u32,
    #[serde(rename = "PayloadIdentifier")]
    payload_identifier: &'static str,
    #[serde(rename = "PayloadUUID")]
    payload_uuid: String,
    #[serde(rename = "PayloadDisplayName")]
    payload_display_name: String,
    #[serde(rename = "PayloadOrganization")]
    payload_organization: String,
    #[serde(rename = "PayloadContent")]
    payload_content: Vec<ProfilePayload>,
}

/// Render the enrollment profile as plist XML.
pub fn enrollment_profile(params: &EnrollProfileParams) -> Result<Vec<u8>, AppleError> {
    let scep_uuid = Uuid::new_v4().to_string();
    let mdm_uuid = Uuid::new_v4().to_string();

    let mut server_url = format!("{}/mdm/apple/server", params.server_url);
    if let Some(reference) = &params.enrollment_reference {
        server_url = format!("{}?enrollment_reference={}", server_url, reference);
    }

    let scep = ScepPayload {
        payload_type: "com.apple.security.scep",
        payload_version: 1,
        payload_identifier: "com.shepherd.mdm.scep".into(),
        payload_uuid: scep_uuid.clone(),
        payload_display_name: "Device identity",
        payload_content: ScepPayloadContent {
            url: format!("{}/mdm/apple/scep", params.server_url),
            challenge: params.scep_challenge.clone(),
            key_type: "RSA",
            key_usage: 5,
            key_size: 2048,
            subject: vec![vec![vec!["CN".into(), "Shepherd identity".into()]]],
        },
    };

    let mdm = MdmPayload {
        payload_type: "com.apple.mdm",
        payload_version: 1,
        payload_identifier: "com.shepherd.mdm.enrollment".into(),
        payload_uuid: mdm_uuid,
        payload_display_name: "Device management",
        server_url,
        check_in_url: format!("{}/mdm/apple/checkin", params.server_url),
        topic: params.topic.clone(),
        identity_certificate_uuid: scep_uuid,
        access_rights: 8191,
        check_out_when_removed: true,
        sign_message: true,
        server_capabilities: vec!["com.apple.mdm.per-user-connections"],
    };

    let profile = EnrollProfile {
        payload_type: "Configuration",
        payload_version: 1,
        payload_identifier: "com.shepherd.mdm.enroll",
        payload_uuid: Uuid::new_v4().to_string(),
        payload_display_name: format!("{} enrollment", params.organization),
        payload_organization: params.organization.clone(),
        payload_content: vec![ProfilePayload::Scep(scep), ProfilePayload::Mdm(mdm)],
    };

    let mut out = Vec::new();
    plist::to_writer_xml(&mut out, &profile)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> EnrollProfileParams {
        EnrollProfileParams {
            server_url: "https://mdm.example.com".into(),
            scep_challenge: "challenge".into(),
            topic: "com.apple.mgmt.External.abc".into(),
            organization: "Acme".into(),
            enrollment_reference: None,
        }
    }

    #[test]
    fn profile_contains_both_payloads() {
        let bytes = enrollment_profile(&params()).unwrap();
        let value: plist::Value = plist::from_bytes(&bytes).unwrap();
        let content = value
            .as_dictionary()
            .and_then(|d| d.get("PayloadContent"))
            .and_then(|v| v.as_array())
            .unwrap();
        assert_eq!(content.len(), 2);
        let types: Vec<&str> = content
            .iter()
            .filter_map(|p| p.as_dictionary())
            .filter_map(|d| d.get("PayloadType"))
            .filter_map(|v| v.as_string())
            .collect();
        assert!(types.contains(&"com.apple.security.scep"));
        assert!(types.contains(&"com.apple.mdm"));
    }

    #[test]
    fn topic_comes_from_push_certificate() {
        let bytes = enrollment_profile(&params()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("com.apple.mgmt.External.abc"));
    }

    #[test]
    fn enrollment_reference_lands_in_server_url() {
        let mut p = params();
        p.enrollment_reference = Some("ref-42".into());
        let text = String::from_utf8(enrollment_profile(&p).unwrap()).unwrap();
        assert!(text.contains("enrollment_reference=ref-42"));
    }

    #[test]
    fn mdm_payload_points_identity_at_scep_payload() {
        let bytes = enrollment_profile(&params()).unwrap();
        let value: plist::Value = plist::from_bytes(&bytes).unwrap();
        let content = value
            .as_dictionary()
            .and_then(|d| d.get("PayloadContent"))
            .and_then(|v| v.as_array())
            .unwrap();
        let scep_uuid = content
            .iter()
            .filter_map(|p| p.as_dictionary())
            .find(|d| d.get("PayloadType").and_then(|v| v.as_string()) == Some("com.apple.security.scep"))
            .and_then(|d| d.get("PayloadUUID"))
            .and_then(|v| v.as_string())
            .unwrap();
        let identity_uuid = content
            .iter()
            .filter_map(|p| p.as_dictionary())
            .find(|d| d.get("PayloadType").and_then(|v| v.as_string()) == Some("com.apple.mdm"))
            .and_then(|d| d.get("IdentityCertificateUUID"))
            .and_then(|v| v.as_string())
            .unwrap();
        assert_eq!(scep_uuid, identity_uuid);
    }
}

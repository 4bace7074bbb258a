//! Wire types for the MDM check-in and command endpoints.

use serde::Deserialize;

use crate::error::AppleError;

/// A check-in message, dispatched on `MessageType`.
#[derive(Debug, Deserialize)]
#[serde(tag = "MessageType")]
pub enum CheckinMessage {
    Authenticate(AuthenticateMessage),
    TokenUpdate(TokenUpdateMessage),
    CheckOut(CheckOutMessage),
    SetBootstrapToken(SetBootstrapTokenMessage),
    GetBootstrapToken(GetBootstrapTokenMessage),
}

impl CheckinMessage {
    pub fn udid(&self) -> &str {
        match self {
            CheckinMessage::Authenticate(m) => &m.udid,
            CheckinMessage::TokenUpdate(m) => &m.udid,
            CheckinMessage::CheckOut(m) => &m.udid,
            CheckinMessage::SetBootstrapToken(m) => &m.udid,
            CheckinMessage::GetBootstrapToken(m) => &m.udid,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthenticateMessage {
    #[serde(rename = "UDID")]
    pub udid: String,
    #[serde(rename = "Topic")]
    pub topic: Option<String>,
    #[serde(rename = "SerialNumber")]
    pub serial_number: Option<String>,
    #[serde(rename = "DeviceName")]
    pub device_name: Option<String>,
    #[serde(rename = "Model")]
    pub model: Option<String>,
    #[serde(rename = "OSVersion")]
    pub os_version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TokenUpdateMessage {
    #[serde(rename = "UDID")]
    pub udid: String,
    #[serde(rename = "Token")]
    pub token: plist::Data,
    #[serde(rename = "PushMagic")]
    pub push_magic: String,
    #[serde(rename = "UnlockToken")]
    pub unlock_token: Option<plist::Data>,
    #[serde(rename = "AwaitingConfiguration", default)]
    pub awaiting_configuration: bool,
}

#[derive(Debug, Deserialize)]
pub struct CheckOutMessage {
    #[serde(rename = "UDID")]
    pub udid: String,
}

#[derive(Debug, Deserialize)]
pub struct SetBootstrapTokenMessage {
    #[serde(rename = "UDID")]
    pub udid: String,
    #[serde(rename = "BootstrapToken")]
    pub bootstrap_token: Option<plist::Data>,
}

#[derive(Debug, Deserialize)]
pub struct GetBootstrapTokenMessage {
    #[serde(rename = "UDID")]
    pub udid: String,
}

/// Parse a check-in plist body.
pub fn parse_checkin(body: &[u8]) -> Result<CheckinMessage, AppleError> {
    Ok(plist::from_bytes(body)?)
}

// ── Command endpoint ──────────────────────────────────────────────────────────

/// Device report posted to the command endpoint: an `Idle` poll or the result
/// of the previously delivered command.
#[derive(Debug, Deserialize)]
pub struct CommandReport {
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "UDID")]
    pub udid: String,
    #[serde(rename = "CommandUUID")]
    pub command_uuid: Option<String>,
    #[serde(rename = "ErrorChain")]
    pub error_chain: Option<Vec<ErrorChainItem>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorChainItem {
    #[serde(rename = "ErrorCode")]
    pub error_code: i64,
    #[serde(rename = "ErrorDomain")]
    pub error_domain: String,
    #[serde(rename = "LocalizedDescription")]
    pub localized_description: String,
}

impl CommandReport {
    pub fn is_idle(&self) -> bool {
        self.status == "Idle"
    }

    pub fn is_error(&self) -> bool {
        self.status == "Error" || self.status == "CommandFormatError"
    }

    /// Flatten the error chain into a single detail string, outermost first.
    pub fn error_detail(&self) -> Option<String> {
        let chain = self.error_chain.as_ref()?;
        if chain.is_empty() {
            return None;
        }
        Some(
            chain
                .iter()
                .map(|e| format!("{} ({}): {}", e.error_domain, e.error_code, e.localized_description))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

pub fn parse_command_report(body: &[u8]) -> Result<CommandReport, AppleError> {
    Ok(plist::from_bytes(body)?)
}

//! Builders and parsers for MDM command plists.

use serde::Serialize;
use uuid::Uuid;

use crate::error::AppleError;

#[derive(Debug, Serialize)]
struct CommandEnvelope<T: Serialize> {
    #[serde(rename = "CommandUUID")]
    command_uuid: String,
    #[serde(rename = "Command")]
    command: T,
}

/// A built command ready for the pipeline.
#[derive(Debug, Clone)]
pub struct BuiltCommand {
    pub command_uuid: String,
    pub request_type: &'static str,
    pub payload: Vec<u8>,
}

fn build<T: Serialize>(request_type: &'static str, command: T) -> Result<BuiltCommand, AppleError> {
    let command_uuid = Uuid::new_v4().to_string();
    let envelope = CommandEnvelope { command_uuid: command_uuid.clone(), command };
    let mut payload = Vec::new();
    plist::to_writer_xml(&mut payload, &envelope)?;
    Ok(BuiltCommand { command_uuid, request_type, payload })
}

#[derive(Debug, Serialize)]
struct InstallProfileCommand {
    #[serde(rename = "RequestType")]
    request_type: &'static str,
    #[serde(rename = "Payload")]
    payload: plist::Data,
}

pub fn install_profile(mobileconfig: &[u8]) -> Result<BuiltCommand, AppleError> {
    build(
        "InstallProfile",
        InstallProfileCommand {
            request_type: "InstallProfile",
            payload: plist::Data::new(mobileconfig.to_vec()),
        },
    )
}

#[derive(Debug, Serialize)]
struct RemoveProfileCommand {
    #[serde(rename = "RequestType")]
    request_type: &'static str,
    #[serde(rename = "Identifier")]
    identifier: String,
}

pub fn remove_profile(identifier: &str) -> Result<BuiltCommand, AppleError> {
    build(
        "RemoveProfile",
        RemoveProfileCommand {
            request_type: "RemoveProfile",
            identifier: identifier.to_string(),
        },
    )
}

#[derive(Debug, Serialize)]
struct InstallEnterpriseApplicationCommand {
    #[serde(rename = "RequestType")]
    request_type: &'static str,
    #[serde(rename = "ManifestURL")]
    manifest_url: String,
}

/// Bootstrap-package delivery: the manifest URL points back at this server's
/// token-guarded package download.
pub fn install_enterprise_application(manifest_url: &str) -> Result<BuiltCommand, AppleError> {
    build(
        "InstallEnterpriseApplication",
        InstallEnterpriseApplicationCommand {
            request_type: "InstallEnterpriseApplication",
            manifest_url: manifest_url.to_string(),
        },
    )
}

#[derive(Debug, Serialize)]
struct AccountConfigurationCommand {
    #[serde(rename = "RequestType")]
    request_type: &'static str,
    #[serde(rename = "LockPrimaryAccountInfo")]
    lock_primary_account_info: bool,
    #[serde(rename = "PrimaryAccountFullName")]
    primary_account_full_name: String,
    #[serde(rename = "PrimaryAccountUserName")]
    primary_account_user_name: String,
}

/// Pin the local account created by the setup assistant to the IdP identity.
pub fn account_configuration(fullname: &str, username: &str) -> Result<BuiltCommand, AppleError> {
    build(
        "AccountConfiguration",
        AccountConfigurationCommand {
            request_type: "AccountConfiguration",
            lock_primary_account_info: true,
            primary_account_full_name: fullname.to_string(),
            primary_account_user_name: username.to_string(),
        },
    )
}

#[derive(Debug, Serialize)]
struct DeviceInformationCommand {
    #[serde(rename = "RequestType")]
    request_type: &'static str,
    #[serde(rename = "Queries")]
    queries: Vec<String>,
}

pub fn device_information(queries: &[&str]) -> Result<BuiltCommand, AppleError> {
    build(
        "DeviceInformation",
        DeviceInformationCommand {
            request_type: "DeviceInformation",
            queries: queries.iter().map(|q| q.to_string()).collect(),
        },
    )
}

// ── Raw command inspection (operator enqueue path) ────────────────────────────

/// Extract `CommandUUID` and `Command.RequestType` from a raw command plist.
pub fn parse_raw_command(payload: &[u8]) -> Result<(String, String), AppleError> {
    let value: plist::Value = plist::from_bytes(payload)?;
    let dict = value
        .as_dictionary()
        .ok_or(AppleError::MissingField("Command plist root"))?;
    let command_uuid = dict
        .get("CommandUUID")
        .and_then(|v| v.as_string())
        .ok_or(AppleError::MissingField("CommandUUID"))?
        .to_string();
    let request_type = dict
        .get("Command")
        .and_then(|v| v.as_dictionary())
        .and_then(|c| c.get("RequestType"))
        .and_then(|v| v.as_string())
        .ok_or(AppleError::MissingField("Command.RequestType"))?
        .to_string();
    Ok((command_uuid, request_type))
}

//! Apple Business Manager client.
//!
//! Authentication is OAuth1 (HMAC-SHA1) against `/session`, which yields an
//! `X-ADM-Auth-Session` token used on every roster call. The base URL is
//! injectable so tests can point at a mock server.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;
use sha1::Sha1;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::AbmError;

const PRODUCTION_BASE_URL: &str = "https://mdmenrollment.apple.com";

#[derive(Debug, Clone)]
pub struct OAuth1Credentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub access_secret: String,
}

/// One device row from `/server/devices` or `/devices/sync`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub serial_number: String,
    /// "added", "modified", "deleted", or empty for full-fetch rows.
    #[serde(default)]
    pub op_type: String,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Deserialize)]
pub struct SyncPage {
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    pub cursor: String,
    #[serde(default)]
    pub more_to_sync: bool,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    auth_session_token: String,
}

#[derive(Debug, Deserialize)]
struct DefineProfileResponse {
    profile_uuid: String,
}

pub struct AbmClient {
    client: reqwest::Client,
    base_url: String,
    creds: OAuth1Credentials,
    session: RwLock<Option<String>>,
}

impl AbmClient {
    pub fn new(creds: OAuth1Credentials) -> Self {
        Self::with_base_url(creds, PRODUCTION_BASE_URL.to_string())
    }

    /// Test constructor pointing at a mock server.
    pub fn with_base_url(creds: OAuth1Credentials, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            creds,
            session: RwLock::new(None),
        }
    }

    // ── OAuth1 ────────────────────────────────────────────────────────────────

    fn oauth_header(&self, method: &str, url: &str) -> Result<String, AbmError> {
        let nonce = {
            let mut bytes = [0u8; 16];
            rand::rngs::OsRng.fill_bytes(&mut bytes);
            hex::encode(bytes)
        };
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            .to_string();

        let mut params: Vec<(String, String)> = vec![
            ("oauth_consumer_key".into(), self.creds.consumer_key.clone()),
            ("oauth_nonce".into(), nonce),
            ("oauth_signature_method".into(), "HMAC-SHA1".into()),
            ("oauth_timestamp".into(), timestamp),
            ("oauth_token".into(), self.creds.access_token.clone()),
            ("oauth_version".into(), "1.0".into()),
        ];
        params.sort();

        let param_string = params
            .iter()
            .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let base_string = format!(
            "{}&{}&{}",
            method,
            percent_encode(url),
            percent_encode(&param_string)
        );
        let signing_key = format!(
            "{}&{}",
            percent_encode(&self.creds.consumer_secret),
            percent_encode(&self.creds.access_secret)
        );

        let mut mac = Hmac::<Sha1>::new_from_slice(signing_key.as_bytes())
            .map_err(|e| AbmError::Transport(format!("HMAC key: {}", e)))?;
        mac.update(base_string.as_bytes());
        let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        let mut header = String::from("OAuth ");
        for (i, (k, v)) in params.iter().enumerate() {
            if i > 0 {
                header.push_str(", ");
            }
            header.push_str(&format!("{}=\"{}\"", k, percent_encode(v)));
        }
        header.push_str(&format!(", oauth_signature=\"{}\"", percent_encode(&signature)));
        Ok(header)
    }

    async fn authenticate(&self) -> Result<String, AbmError> {
        let url = format!("{}/session", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("Authorization", self.oauth_header("GET", &url)?)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let session: SessionResponse = resp
            .json()
            .await
            .map_err(|e| AbmError::Decode(e.to_string()))?;
        debug!("ABM session established");
        *self.session.write().await = Some(session.auth_session_token.clone());
        Ok(session.auth_session_token)
    }

    /// POST `path` with the session header, re-authenticating once on 401.
    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, AbmError> {
        let url = format!("{}{}", self.base_url, path);
        for attempt in 0..2 {
            let session = match self.session.read().await.clone() {
                Some(s) => s,
                None => self.authenticate().await?,
            };
            let resp = self
                .client
                .post(&url)
                .header("X-ADM-Auth-Session", session)
                .header("Content-Type", "application/json;charset=UTF8")
                .json(&body)
                .send()
                .await?;
            if resp.status() == reqwest::StatusCode::UNAUTHORIZED && attempt == 0 {
                warn!(path, "ABM session expired, re-authenticating");
                *self.session.write().await = None;
                continue;
            }
            return check_status(resp).await;
        }
        Err(AbmError::Unauthorized)
    }

    // ── Roster ────────────────────────────────────────────────────────────────

    /// Initial full fetch (`/server/devices`).
    pub async fn fetch_devices(&self) -> Result<SyncPage, AbmError> {
        let resp = self.post("/server/devices", json!({ "limit": 1000 })).await?;
        resp.json().await.map_err(|e| AbmError::Decode(e.to_string()))
    }

    /// Incremental sync from an opaque cursor (`/devices/sync`).
    pub async fn sync_devices(&self, cursor: &str) -> Result<SyncPage, AbmError> {
        let resp = self
            .post("/devices/sync", json!({ "limit": 1000, "cursor": cursor }))
            .await?;
        resp.json().await.map_err(|e| AbmError::Decode(e.to_string()))
    }

    // ── Profiles ──────────────────────────────────────────────────────────────

    /// Register an automatic-enrollment profile, returning its uuid.
    pub async fn define_profile(
        &self,
        profile: &serde_json::Value,
    ) -> Result<String, AbmError> {
        let resp = self.post("/profile", profile.clone()).await?;
        let defined: DefineProfileResponse = resp
            .json()
            .await
            .map_err(|e| AbmError::Decode(e.to_string()))?;
        Ok(defined.profile_uuid)
    }

    /// Show `profile_uuid` to the given serial numbers.
    pub async fn assign_profile(
        &self,
        profile_uuid: &str,
        serials: &[String],
    ) -> Result<(), AbmError> {
        self.post(
            "/profile/devices",
            json!({ "profile_uuid": profile_uuid, "devices": serials }),
        )
        .await?;
        Ok(())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, AbmError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::FORBIDDEN && body.contains("T_C_NOT_SIGNED") {
        return Err(AbmError::TermsNotSigned);
    }
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(AbmError::Unauthorized);
    }
    Err(AbmError::Upstream {
        status: status.as_u16(),
        body,
    })
}

/// RFC 3986 percent-encoding with the OAuth1 unreserved set.
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn creds() -> OAuth1Credentials {
        OAuth1Credentials {
            consumer_key: "ck".into(),
            consumer_secret: "cs".into(),
            access_token: "at".into(),
            access_secret: "as".into(),
        }
    }

    async fn mock_session(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/session"))
            .and(header_exists("Authorization"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "auth_session_token": "sess-1"
                })),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn percent_encoding_matches_rfc3986() {
        assert_eq!(percent_encode("abc-._~123"), "abc-._~123");
        assert_eq!(percent_encode("a b&c"), "a%20b%26c");
        assert_eq!(percent_encode("https://x/y"), "https%3A%2F%2Fx%2Fy");
    }

    #[tokio::test]
    async fn fetch_devices_authenticates_then_pages() {
        let server = MockServer::start().await;
        mock_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/server/devices"))
            .and(wiremock::matchers::header("X-ADM-Auth-Session", "sess-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "devices": [{"serial_number": "SN1", "op_type": "added"}],
                "cursor": "c-1",
                "more_to_sync": false
            })))
            .mount(&server)
            .await;

        let client = AbmClient::with_base_url(creds(), server.uri());
        let page = client.fetch_devices().await.unwrap();
        assert_eq!(page.devices.len(), 1);
        assert_eq!(page.cursor, "c-1");
        assert!(!page.more_to_sync);
    }

    #[tokio::test]
    async fn terms_not_signed_maps_to_dedicated_error() {
        let server = MockServer::start().await;
        mock_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/devices/sync"))
            .respond_with(
                ResponseTemplate::new(403).set_body_string(r#"{"error": "T_C_NOT_SIGNED"}"#),
            )
            .mount(&server)
            .await;

        let client = AbmClient::with_base_url(creds(), server.uri());
        let err = client.sync_devices("c").await.unwrap_err();
        assert!(matches!(err, AbmError::TermsNotSigned));
    }

    #[tokio::test]
    async fn define_profile_returns_uuid() {
        let server = MockServer::start().await;
        mock_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/profile"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "profile_uuid": "prof-1"
            })))
            .mount(&server)
            .await;

        let client = AbmClient::with_base_url(creds(), server.uri());
        let uuid = client
            .define_profile(&serde_json::json!({"profile_name": "x"}))
            .await
            .unwrap();
        assert_eq!(uuid, "prof-1");
    }
}

//! APNs pusher for MDM wake-ups.
//!
//! Each push is an HTTP/2 POST to `/3/device/<token>` with the device's
//! `PushMagic` as the `mdm` payload key. Pushes are batched across devices;
//! a per-device failure never aborts the batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::AppleError;

const PRODUCTION_BASE_URL: &str = "https://api.push.apple.com";
const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PushTarget {
    pub device_uuid: String,
    /// Hex-encoded APNs device token.
    pub push_token: String,
    pub push_magic: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// APNs answered with a per-device error (bad token, unregistered, ...).
    DeviceError(String),
    /// The request never produced an APNs verdict.
    TransportError(String),
}

#[derive(Clone)]
pub struct ApnsClient {
    client: reqwest::Client,
    base_url: String,
    topic: String,
}

impl ApnsClient {
    /// Production client authenticated with the MDM push certificate.
    pub fn new(cert_pem: &str, key_pem: &str, topic: String) -> Result<Self, AppleError> {
        let identity = reqwest::Identity::from_pkcs8_pem(cert_pem.as_bytes(), key_pem.as_bytes())
            .map_err(|e| AppleError::PushTransportError(e.to_string()))?;
        let client = reqwest::Client::builder()
            .identity(identity)
            .timeout(PUSH_TIMEOUT)
            .build()
            .map_err(|e| AppleError::PushTransportError(e.to_string()))?;
        Ok(Self {
            client,
            base_url: PRODUCTION_BASE_URL.to_string(),
            topic,
        })
    }

    /// Test constructor pointing at a mock server; no client identity.
    pub fn with_base_url(base_url: String, topic: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            topic,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    async fn push_one(&self, target: &PushTarget) -> PushOutcome {
        let url = format!("{}/3/device/{}", self.base_url, target.push_token);
        let body = json!({ "mdm": target.push_magic });
        let resp = self
            .client
            .post(&url)
            .header("apns-topic", &self.topic)
            .header("apns-push-type", "mdm")
            .header("apns-priority", "10")
            .json(&body)
            .send()
            .await;
        match resp {
            Ok(resp) if resp.status().is_success() => PushOutcome::Delivered,
            Ok(resp) => {
                let status = resp.status();
                let reason = resp
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get("reason").and_then(|r| r.as_str()).map(String::from))
                    .unwrap_or_else(|| status.to_string());
                PushOutcome::DeviceError(reason)
            }
            Err(e) => PushOutcome::TransportError(e.to_string()),
        }
    }

    /// Push to every target in parallel. Outcomes are correlated back by
    /// device uuid; ordering of the result vec is unspecified.
    pub async fn push_all(&self, targets: Vec<PushTarget>) -> Vec<(String, PushOutcome)> {
        let mut set = JoinSet::new();
        for target in targets {
            let client = self.clone();
            set.spawn(async move {
                let outcome = client.push_one(&target).await;
                (target.device_uuid, outcome)
            });
        }
        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((uuid, outcome)) => {
                    if let PushOutcome::DeviceError(reason) = &outcome {
                        warn!(device_uuid = %uuid, reason = %reason, "APNs rejected push");
                    } else {
                        debug!(device_uuid = %uuid, "push settled");
                    }
                    results.push((uuid, outcome));
                }
                Err(e) => warn!(error = %e, "push task panicked"),
            }
        }
        results
    }
}

/// In-process cache of push clients keyed by APNs topic. Push credentials are
/// loaded once and shared by every caller.
#[derive(Default)]
pub struct ApnsCredentialCache {
    clients: RwLock<HashMap<String, Arc<ApnsClient>>>,
}

impl ApnsCredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, topic: &str) -> Option<Arc<ApnsClient>> {
        self.clients.read().await.get(topic).cloned()
    }

    pub async fn insert(&self, client: ApnsClient) -> Arc<ApnsClient> {
        let arc = Arc::new(client);
        self.clients
            .write()
            .await
            .insert(arc.topic().to_string(), arc.clone());
        arc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn target(uuid: &str, token: &str) -> PushTarget {
        PushTarget {
            device_uuid: uuid.into(),
            push_token: token.into(),
            push_magic: format!("magic-{}", uuid),
        }
    }

    #[tokio::test]
    async fn successful_push_is_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/3/device/tok1"))
            .and(header("apns-push-type", "mdm"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = ApnsClient::with_base_url(server.uri(), "topic".into());
        let results = client.push_all(vec![target("D1", "tok1")]).await;
        assert_eq!(results, vec![("D1".to_string(), PushOutcome::Delivered)]);
    }

    #[tokio::test]
    async fn per_device_rejection_does_not_abort_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/3/device/bad"))
            .respond_with(
                ResponseTemplate::new(410).set_body_json(serde_json::json!({"reason": "Unregistered"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/3/device/good"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = ApnsClient::with_base_url(server.uri(), "topic".into());
        let mut results = client
            .push_all(vec![target("D1", "bad"), target("D2", "good")])
            .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            results[0].1,
            PushOutcome::DeviceError("Unregistered".into())
        );
        assert_eq!(results[1].1, PushOutcome::Delivered);
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error() {
        // Port 9 (discard) refuses connections in test environments.
        let client = ApnsClient::with_base_url("http://127.0.0.1:9".into(), "topic".into());
        let results = client.push_all(vec![target("D1", "tok")]).await;
        assert!(matches!(results[0].1, PushOutcome::TransportError(_)));
    }

    #[tokio::test]
    async fn cache_shares_clients_by_topic() {
        let cache = ApnsCredentialCache::new();
        assert!(cache.get("t").await.is_none());
        cache
            .insert(ApnsClient::with_base_url("http://localhost".into(), "t".into()))
            .await;
        assert!(cache.get("t").await.is_some());
    }
}

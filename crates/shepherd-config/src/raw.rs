use serde::{Deserialize, Serialize};

/// Raw YAML representation of the server config file (shepherd.yml).
///
/// Everything optional here is defaulted or validated in the loader; secrets
/// can be overridden by environment variables.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RawServerConfig {
    /// Public base URL devices use to reach this server, e.g.
    /// "https://mdm.example.com".
    pub server_url: Option<String>,
    /// Listen address, "host:port".
    pub listen: Option<String>,
    /// Directory for the state database and PKI material.
    pub data_dir: Option<String>,
    /// Operator API bearer token. Env override: SHEPHERD_API_TOKEN.
    pub api_token: Option<String>,
    #[serde(default)]
    pub apns: RawApnsConfig,
    #[serde(default)]
    pub abm: RawAbmConfig,
    #[serde(default)]
    pub scep: RawScepConfig,
    /// Reconciliation cadence in seconds.
    pub reconcile_interval_secs: Option<u64>,
    /// ABM roster sync cadence in seconds.
    pub dep_sync_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RawApnsConfig {
    /// APNs topic of the push certificate, e.g. "com.apple.mgmt.External.<uuid>".
    pub topic: Option<String>,
    /// PEM file with the MDM push certificate.
    pub cert_path: Option<String>,
    /// PEM file with the push certificate's private key.
    pub key_path: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RawAbmConfig {
    #[serde(default)]
    pub enabled: bool,
    pub consumer_key: Option<String>,
    /// Env override: SHEPHERD_ABM_CONSUMER_SECRET.
    pub consumer_secret: Option<String>,
    pub access_token: Option<String>,
    /// Env override: SHEPHERD_ABM_ACCESS_SECRET.
    pub access_secret: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RawScepConfig {
    /// Static challenge embedded in enrollment profiles and verified on
    /// PKIOperation. Env override: SHEPHERD_SCEP_CHALLENGE.
    pub challenge: Option<String>,
}

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ConfigError;
use crate::raw::RawServerConfig;

/// Validated server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_url: String,
    pub listen: String,
    pub data_dir: PathBuf,
    pub api_token: String,
    pub apns: ApnsConfig,
    pub abm: Option<AbmConfig>,
    pub scep: ScepConfig,
    pub reconcile_interval_secs: u64,
    pub dep_sync_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ApnsConfig {
    pub topic: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AbmConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub access_secret: String,
}

#[derive(Debug, Clone)]
pub struct ScepConfig {
    pub challenge: String,
}

/// Load and validate the server config from `path`.
///
/// Secrets honor environment overrides so the YAML file can be committed:
/// `SHEPHERD_API_TOKEN`, `SHEPHERD_ABM_CONSUMER_SECRET`,
/// `SHEPHERD_ABM_ACCESS_SECRET`, `SHEPHERD_SCEP_CHALLENGE`.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let raw: RawServerConfig =
        serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
            path: path.display().to_string(),
            source: e,
        })?;
    debug!("loaded raw config from {}", path.display());
    convert(raw, path)
}

fn convert(raw: RawServerConfig, path: &Path) -> Result<ServerConfig, ConfigError> {
    let invalid = |message: String| ConfigError::Invalid {
        path: path.display().to_string(),
        message,
    };

    let server_url = raw
        .server_url
        .ok_or_else(|| invalid("server_url is required".into()))?;
    if !server_url.starts_with("https://") && !server_url.starts_with("http://") {
        return Err(invalid(format!(
            "server_url must be an absolute http(s) URL, got {:?}",
            server_url
        )));
    }
    let server_url = server_url.trim_end_matches('/').to_string();

    let api_token = env_or("SHEPHERD_API_TOKEN", raw.api_token)
        .ok_or_else(|| invalid("api_token is required (or set SHEPHERD_API_TOKEN)".into()))?;

    let apns_topic = raw
        .apns
        .topic
        .ok_or_else(|| invalid("apns.topic is required".into()))?;
    let apns = ApnsConfig {
        topic: apns_topic,
        cert_path: raw
            .apns
            .cert_path
            .map(PathBuf::from)
            .ok_or_else(|| invalid("apns.cert_path is required".into()))?,
        key_path: raw
            .apns
            .key_path
            .map(PathBuf::from)
            .ok_or_else(|| invalid("apns.key_path is required".into()))?,
    };

    let abm = if raw.abm.enabled {
        Some(AbmConfig {
            consumer_key: raw
                .abm
                .consumer_key
                .ok_or_else(|| invalid("abm.consumer_key is required when abm.enabled".into()))?,
            consumer_secret: env_or("SHEPHERD_ABM_CONSUMER_SECRET", raw.abm.consumer_secret)
                .ok_or_else(|| {
                    invalid("abm.consumer_secret is required when abm.enabled".into())
                })?,
            access_token: raw
                .abm
                .access_token
                .ok_or_else(|| invalid("abm.access_token is required when abm.enabled".into()))?,
            access_secret: env_or("SHEPHERD_ABM_ACCESS_SECRET", raw.abm.access_secret)
                .ok_or_else(|| invalid("abm.access_secret is required when abm.enabled".into()))?,
        })
    } else {
        None
    };

    let scep = ScepConfig {
        challenge: env_or("SHEPHERD_SCEP_CHALLENGE", raw.scep.challenge)
            .ok_or_else(|| invalid("scep.challenge is required (or set SHEPHERD_SCEP_CHALLENGE)".into()))?,
    };

    Ok(ServerConfig {
        server_url,
        listen: raw.listen.unwrap_or_else(|| "0.0.0.0:8080".into()),
        data_dir: raw
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data")),
        api_token,
        apns,
        abm,
        scep,
        reconcile_interval_secs: raw.reconcile_interval_secs.unwrap_or(3600),
        dep_sync_interval_secs: raw.dep_sync_interval_secs.unwrap_or(3600),
    })
}

fn env_or(var: &str, fallback: Option<String>) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty()).or(fallback)
}

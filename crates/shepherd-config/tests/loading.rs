use std::io::Write;

use shepherd_config::{load_config, ConfigError};

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    f
}

const FULL: &str = r#"
server_url: https://mdm.example.com/
listen: 127.0.0.1:9090
data_dir: /var/lib/shepherd
api_token: tok
apns:
  topic: com.apple.mgmt.External.1111
  cert_path: /etc/shepherd/push.crt
  key_path: /etc/shepherd/push.key
scep:
  challenge: secret-challenge
abm:
  enabled: true
  consumer_key: ck
  consumer_secret: cs
  access_token: at
  access_secret: as
reconcile_interval_secs: 60
"#;

#[test]
fn loads_full_config() {
    let f = write_config(FULL);
    let cfg = load_config(f.path()).unwrap();
    assert_eq!(cfg.server_url, "https://mdm.example.com");
    assert_eq!(cfg.listen, "127.0.0.1:9090");
    assert_eq!(cfg.apns.topic, "com.apple.mgmt.External.1111");
    assert_eq!(cfg.reconcile_interval_secs, 60);
    assert_eq!(cfg.dep_sync_interval_secs, 3600);
    let abm = cfg.abm.expect("abm enabled");
    assert_eq!(abm.consumer_key, "ck");
    assert_eq!(abm.access_secret, "as");
}

#[test]
fn trailing_slash_is_stripped_from_server_url() {
    let f = write_config(FULL);
    let cfg = load_config(f.path()).unwrap();
    assert!(!cfg.server_url.ends_with('/'));
}

#[test]
fn missing_server_url_is_rejected() {
    let f = write_config("api_token: t\n");
    match load_config(f.path()) {
        Err(ConfigError::Invalid { message, .. }) => {
            assert!(message.contains("server_url"), "got: {}", message)
        }
        other => panic!("expected Invalid, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn non_http_server_url_is_rejected() {
    let f = write_config(
        "server_url: ldap://x\napi_token: t\napns:\n  topic: t\n  cert_path: a\n  key_path: b\nscep:\n  challenge: c\n",
    );
    assert!(load_config(f.path()).is_err());
}

#[test]
fn abm_disabled_by_default() {
    let f = write_config(
        "server_url: http://localhost:8080\napi_token: t\napns:\n  topic: t\n  cert_path: a\n  key_path: b\nscep:\n  challenge: c\n",
    );
    let cfg = load_config(f.path()).unwrap();
    assert!(cfg.abm.is_none());
}

#[test]
fn abm_enabled_without_credentials_is_rejected() {
    let f = write_config(
        "server_url: http://localhost:8080\napi_token: t\napns:\n  topic: t\n  cert_path: a\n  key_path: b\nscep:\n  challenge: c\nabm:\n  enabled: true\n",
    );
    assert!(load_config(f.path()).is_err());
}

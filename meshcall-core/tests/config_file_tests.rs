//! Service configuration loading

use meshcall_core::{CallServiceConfig, SubscriptionTier};
use pretty_assertions::assert_eq;
use std::io::Write;

#[test]
fn loads_full_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "signaling": {{ "url": "wss://signal.example.net/ws", "reconnect_delay_ms": 1500 }},
            "media": {{ "screen_share_enabled": false }},
            "mesh": {{
                "ice_servers": [{{ "urls": ["turn:turn.example.net:3478"], "username": "u", "credential": "p" }}],
                "retry_delay_ms": 2000
            }},
            "admission": {{
                "starter": {{ "call_access": true, "group_calls": true, "max_participants": 3 }}
            }},
            "event_capacity": 64
        }}"#
    )
    .unwrap();

    let config = CallServiceConfig::from_json_file(file.path()).unwrap();
    assert_eq!(config.signaling.url, "wss://signal.example.net/ws");
    assert_eq!(config.signaling.reconnect_delay_ms, 1500);
    assert_eq!(config.signaling.max_message_bytes, 64 * 1024);
    assert!(!config.media.screen_share_enabled);
    assert_eq!(config.mesh.retry_delay_ms, 2000);
    assert_eq!(config.mesh.ice_servers.len(), 1);
    assert_eq!(config.mesh.ice_servers[0].username.as_deref(), Some("u"));
    assert_eq!(config.event_capacity, 64);

    let starter = config.admission.limits(SubscriptionTier::Starter);
    assert!(starter.group_calls);
    assert_eq!(starter.max_participants, 3);
    // Tiers left out keep the reference table.
    assert_eq!(
        config.admission.limits(SubscriptionTier::Vip),
        SubscriptionTier::Vip.limits()
    );
}

#[test]
fn missing_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.json");
    let err = CallServiceConfig::from_json_file(&path).unwrap_err();
    assert!(format!("{err:#}").contains("absent.json"));
}

#[test]
fn malformed_file_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(br#"{ "event_capacity": "lots" }"#).unwrap();
    let err = CallServiceConfig::from_json_file(file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("Invalid config file"));
}

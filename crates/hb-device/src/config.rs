//! hb-device configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/hb-device/config.toml`.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Config types (validated, with defaults applied)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub server: ServerConfig,
    pub poll_interval_minutes: u32,
    pub tls: TlsConfig,
    pub ip_family: IpFamily,
    pub spare_slot: SpareSlotConfig,
    pub action_log: ActionLogConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub json_url_root: String,
    pub board: String,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub enabled: bool,
    pub ca_tag: Option<String>,
    pub root_cert_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

#[derive(Debug, Clone)]
pub struct SpareSlotConfig {
    pub path: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ActionLogConfig {
    pub sqlite_path: String,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    server: Option<RawServerConfig>,
    poll_interval_minutes: Option<u32>,
    tls: Option<RawTlsConfig>,
    ip_family: Option<String>,
    spare_slot: Option<RawSpareSlotConfig>,
    action_log: Option<RawActionLogConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    host: Option<String>,
    port: Option<u16>,
    json_url_root: Option<String>,
    board: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTlsConfig {
    enabled: Option<bool>,
    ca_tag: Option<String>,
    root_cert_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSpareSlotConfig {
    path: Option<String>,
    size_bytes: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawActionLogConfig {
    sqlite_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<DeviceConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {e}", path.display())))?;
    load_config_from_str(&toml_str)
}

/// Load config from the default path `/etc/hb-device/config.toml`.
pub fn load_config() -> Result<DeviceConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/hb-device/config.toml"))
}

/// Minutes clamp applied to `poll_interval_minutes`: outside `1 < v < 43200`
/// the default of 300 seconds (5 minutes) is used instead.
fn clamp_poll_interval_minutes(minutes: Option<u32>) -> u32 {
    match minutes {
        Some(m) if m > 1 && m < 43200 => m,
        _ => 5,
    }
}

pub fn load_config_from_str(toml_str: &str) -> Result<DeviceConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let raw_server = raw
        .server
        .ok_or_else(|| ConfigError::MissingField("server".to_owned()))?;
    let host = raw_server
        .host
        .ok_or_else(|| ConfigError::MissingField("server.host".to_owned()))?;
    let board = raw_server
        .board
        .ok_or_else(|| ConfigError::MissingField("server.board".to_owned()))?;
    let server = ServerConfig {
        host,
        port: raw_server.port.unwrap_or(443),
        json_url_root: raw_server
            .json_url_root
            .unwrap_or_else(|| "/default/controller/v1".to_owned()),
        board,
    };

    let poll_interval_minutes = clamp_poll_interval_minutes(raw.poll_interval_minutes);

    let tls = match raw.tls {
        Some(t) => {
            let enabled = t.enabled.unwrap_or(false);
            if enabled && t.root_cert_path.is_none() {
                return Err(ConfigError::InvalidValue(
                    "tls.root_cert_path is required when tls.enabled = true".to_owned(),
                ));
            }
            TlsConfig {
                enabled,
                ca_tag: t.ca_tag,
                root_cert_path: t.root_cert_path,
            }
        }
        None => TlsConfig {
            enabled: false,
            ca_tag: None,
            root_cert_path: None,
        },
    };

    let ip_family = match raw.ip_family.as_deref() {
        None | Some("v4") => IpFamily::V4,
        Some("v6") => IpFamily::V6,
        Some(other) => {
            return Err(ConfigError::InvalidValue(format!(
                "ip_family must be 'v4' or 'v6', got '{other}'"
            )))
        }
    };

    let raw_slot = raw
        .spare_slot
        .ok_or_else(|| ConfigError::MissingField("spare_slot".to_owned()))?;
    let spare_slot = SpareSlotConfig {
        path: raw_slot
            .path
            .ok_or_else(|| ConfigError::MissingField("spare_slot.path".to_owned()))?,
        size_bytes: raw_slot
            .size_bytes
            .ok_or_else(|| ConfigError::MissingField("spare_slot.size_bytes".to_owned()))?,
    };

    let action_log = match raw.action_log {
        Some(a) => ActionLogConfig {
            sqlite_path: a
                .sqlite_path
                .unwrap_or_else(|| "/var/lib/hb-device/action_log.sqlite3".to_owned()),
        },
        None => ActionLogConfig {
            sqlite_path: "/var/lib/hb-device/action_log.sqlite3".to_owned(),
        },
    };

    Ok(DeviceConfig {
        server,
        poll_interval_minutes,
        tls,
        ip_family,
        spare_slot,
        action_log,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_valid_config() {
        let toml = r#"
            [server]
            host = "srv.example.com"
            board = "bd"

            [spare_slot]
            path = "/tmp/spare.bin"
            size_bytes = 1048576
        "#;
        let cfg = load_config_from_str(toml).unwrap();
        assert_eq!(cfg.server.host, "srv.example.com");
        assert_eq!(cfg.server.board, "bd");
        assert_eq!(cfg.server.port, 443);
        assert_eq!(cfg.poll_interval_minutes, 5);
        assert!(!cfg.tls.enabled);
        assert_eq!(cfg.ip_family, IpFamily::V4);
    }

    #[test]
    fn clamps_out_of_range_poll_interval() {
        assert_eq!(clamp_poll_interval_minutes(Some(0)), 5);
        assert_eq!(clamp_poll_interval_minutes(Some(1)), 5);
        assert_eq!(clamp_poll_interval_minutes(Some(50000)), 5);
        assert_eq!(clamp_poll_interval_minutes(Some(60)), 60);
        assert_eq!(clamp_poll_interval_minutes(None), 5);
    }

    #[test]
    fn missing_server_is_an_error() {
        let err = load_config_from_str("").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));
    }

    #[test]
    fn tls_enabled_requires_root_cert_path() {
        let toml = r#"
            [server]
            host = "srv"
            board = "bd"
            [spare_slot]
            path = "/tmp/spare.bin"
            size_bytes = 100
            [tls]
            enabled = true
        "#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn rejects_unknown_ip_family() {
        let toml = r#"
            [server]
            host = "srv"
            board = "bd"
            [spare_slot]
            path = "/tmp/spare.bin"
            size_bytes = 100
            ip_family = "v7"
        "#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }
}

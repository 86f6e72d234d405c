//! Plugin configuration, loaded from a YAML file on the host.

use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::error::{CniError, CniResult};

/// Default location of the plugin configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/default/vport-cni.yaml";

/// Plugin configuration. Every field has a working default so the plugin
/// runs without a config file at all.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Path to the vswitch database unix socket.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Bridge the host-side veth ends attach to.
    #[serde(default = "default_bridge")]
    pub bridge: String,

    /// Seconds between audit reconciliation cycles.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval: u64,

    /// Seconds between audit connection liveness probes.
    #[serde(default = "default_connection_check_interval")]
    pub connection_check_interval: u64,

    /// Seconds an attach waits for the control plane to resolve an address.
    #[serde(default = "default_port_resolve_timeout")]
    pub port_resolve_timeout: u64,

    /// Seconds a stale audit entry must persist before deletion.
    #[serde(default)]
    pub stale_entry_timeout: i64,

    /// MTU applied to both veth ends.
    #[serde(default = "default_mtu")]
    pub mtu: u32,

    /// CNI spec version reported in results and errors.
    #[serde(default = "default_cni_version")]
    pub cni_version: String,

    /// Log level filter (trace/debug/info/warn/error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log file, if logging to a file rather than stderr.
    #[serde(default)]
    pub log_file: Option<String>,

    /// Maximum log file size in MiB before the file is truncated on open.
    #[serde(default = "default_log_file_size")]
    pub log_file_size: u64,

    /// Base URL of the monitor REST service (metadata and deletion
    /// notifications).
    #[serde(default = "default_monitor_url")]
    pub monitor_url: String,

    /// Kubernetes API server base URL (used by the resolver and inventory).
    #[serde(default = "default_api_server")]
    pub api_server: String,

    /// Mesos agent base URL (used by the Mesos inventory).
    #[serde(default = "default_mesos_agent")]
    pub mesos_agent: String,

    /// User recorded on entities created without an explicit user label.
    #[serde(default = "default_admin_user")]
    pub admin_user: String,

    /// Enterprise recorded on entities created without an explicit label.
    #[serde(default)]
    pub enterprise: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            endpoint: default_endpoint(),
            bridge: default_bridge(),
            monitor_interval: default_monitor_interval(),
            connection_check_interval: default_connection_check_interval(),
            port_resolve_timeout: default_port_resolve_timeout(),
            stale_entry_timeout: 0,
            mtu: default_mtu(),
            cni_version: default_cni_version(),
            log_level: default_log_level(),
            log_file: None,
            log_file_size: default_log_file_size(),
            monitor_url: default_monitor_url(),
            api_server: default_api_server(),
            mesos_agent: default_mesos_agent(),
            admin_user: default_admin_user(),
            enterprise: String::new(),
        }
    }
}

impl Config {
    /// Loads the configuration from `path`. A missing file is not an error:
    /// the plugin falls back to full defaults with a warning. A present but
    /// malformed file is.
    pub fn load(path: impl AsRef<Path>) -> CniResult<Self> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "No configuration file, using defaults");
                return Ok(Config::default());
            }
            Err(e) => {
                return Err(CniError::Config {
                    message: format!("cannot read {}: {e}", path.display()),
                })
            }
        };
        serde_yaml::from_str(&text).map_err(|e| CniError::Config {
            message: format!("cannot parse {}: {e}", path.display()),
        })
    }
}

fn default_endpoint() -> String {
    "/var/run/openvswitch/db.sock".to_string()
}

fn default_bridge() -> String {
    "alubr0".to_string()
}

fn default_monitor_interval() -> u64 {
    60
}

fn default_connection_check_interval() -> u64 {
    180
}

fn default_port_resolve_timeout() -> u64 {
    60
}

fn default_mtu() -> u32 {
    1500
}

fn default_cni_version() -> String {
    "0.2.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file_size() -> u64 {
    10
}

fn default_monitor_url() -> String {
    "http://127.0.0.1:9443".to_string()
}

fn default_api_server() -> String {
    "https://127.0.0.1:6443".to_string()
}

fn default_mesos_agent() -> String {
    "http://127.0.0.1:5051".to_string()
}

fn default_admin_user() -> String {
    "admin".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("nope.yaml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.endpoint, "/var/run/openvswitch/db.sock");
        assert_eq!(config.bridge, "alubr0");
        assert_eq!(config.monitor_interval, 60);
        assert_eq!(config.connection_check_interval, 180);
        assert_eq!(config.port_resolve_timeout, 60);
        assert_eq!(config.stale_entry_timeout, 0);
        assert_eq!(config.mtu, 1500);
        assert_eq!(config.cni_version, "0.2.0");
    }

    #[test]
    fn partial_file_keeps_field_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bridge: br-ovl\nmonitor_interval: 15\nlog_level: debug").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.bridge, "br-ovl");
        assert_eq!(config.monitor_interval, 15);
        assert_eq!(config.log_level, "debug");
        // Untouched fields keep their defaults.
        assert_eq!(config.endpoint, "/var/run/openvswitch/db.sock");
        assert_eq!(config.mtu, 1500);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bridgee: typo").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(CniError::Config { .. })
        ));
    }
}

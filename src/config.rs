//! Configuration input: which instruments exist and how patient to be with them.
//!
//! ```toml
//! last_active = "lab"
//!
//! [session]
//! probe_timeout_ms = 150
//!
//! [[scopes]]
//! name = "lab"
//! host = "osc05"
//! ```
//!
//! Where the TOML comes from, and writing it back, is up to the caller.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::oscilloscope::Oscilloscope;
use crate::transport::Connector;

/// Portmapper port, answered by every VXI-11 capable instrument.
pub const DEFAULT_PROBE_PORT: u16 = 111;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Scope {name} has an empty host")]
    EmptyHost { name: String },

    #[error("Scope name {name} is used more than once")]
    DuplicateName { name: String },
}

mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Delays of the device side export on instruments that render files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CaptureTiming {
    #[serde(rename = "opc_poll_interval_ms", with = "duration_ms")]
    pub opc_poll_interval: Duration,
    /// Give up on `*OPC?` polling after this long.
    #[serde(rename = "opc_max_wait_ms", with = "duration_ms")]
    pub opc_max_wait: Duration,
    #[serde(rename = "export_settle_ms", with = "duration_ms")]
    pub export_settle: Duration,
    #[serde(rename = "print_settle_ms", with = "duration_ms")]
    pub print_settle: Duration,
}

impl Default for CaptureTiming {
    fn default() -> Self {
        Self {
            opc_poll_interval: Duration::from_millis(10),
            opc_max_wait: Duration::from_secs(10),
            export_settle: Duration::from_secs(3),
            print_settle: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub probe_port: u16,
    #[serde(rename = "probe_timeout_ms", with = "duration_ms")]
    pub probe_timeout: Duration,
    /// I/O timeout for plain command/response exchanges.
    #[serde(rename = "command_timeout_ms", with = "duration_ms")]
    pub command_timeout: Duration,
    /// I/O timeout while a screenshot or waveform is transferred.
    #[serde(rename = "capture_timeout_ms", with = "duration_ms")]
    pub capture_timeout: Duration,
    #[serde(rename = "monitor_interval_ms", with = "duration_ms")]
    pub monitor_interval: Duration,
    pub timing: CaptureTiming,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            probe_port: DEFAULT_PROBE_PORT,
            probe_timeout: Duration::from_millis(100),
            command_timeout: Duration::from_secs(2),
            capture_timeout: Duration::from_secs(10),
            monitor_interval: Duration::from_secs(5),
            timing: CaptureTiming::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScopeConfig {
    pub name: String,
    pub host: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct HotKey {
    pub modifiers: u32,
    pub keycode: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OscCapConfig {
    pub scopes: Vec<ScopeConfig>,
    pub last_active: Option<String>,
    pub hotkey: Option<HotKey>,
    pub session: SessionSettings,
}

impl OscCapConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for scope in &self.scopes {
            if scope.host.trim().is_empty() {
                return Err(ConfigError::EmptyHost {
                    name: scope.name.clone(),
                });
            }
            if !names.insert(scope.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    name: scope.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// The last active scope, or the first one if that is unset or gone.
    pub fn active_scope(&self) -> Option<&ScopeConfig> {
        self.last_active
            .as_deref()
            .and_then(|name| self.scopes.iter().find(|s| s.name == name))
            .or_else(|| self.scopes.first())
    }

    /// One session per configured scope, in configuration order.
    pub fn build_oscilloscopes(&self, connector: Arc<dyn Connector>) -> Vec<Arc<Oscilloscope>> {
        self.scopes
            .iter()
            .map(|scope| {
                Arc::new(Oscilloscope::new(
                    scope,
                    self.session,
                    Arc::clone(&connector),
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_transport::MockConnector;

    const CONFIG: &str = r#"
        last_active = "bench"

        [hotkey]
        modifiers = 1
        keycode = 112

        [session]
        probe_timeout_ms = 250

        [session.timing]
        opc_max_wait_ms = 5000

        [[scopes]]
        name = "lab"
        host = "osc05"

        [[scopes]]
        name = "bench"
        host = "192.168.1.20"
    "#;

    #[test]
    fn test_parse_config() {
        let config = OscCapConfig::from_toml_str(CONFIG).unwrap();
        assert_eq!(config.scopes.len(), 2);
        assert_eq!(config.active_scope().unwrap().host, "192.168.1.20");
        assert_eq!(config.hotkey, Some(HotKey { modifiers: 1, keycode: 112 }));
        assert_eq!(config.session.probe_timeout, Duration::from_millis(250));
        assert_eq!(config.session.timing.opc_max_wait, Duration::from_secs(5));
        // untouched fields keep their defaults
        assert_eq!(config.session.probe_port, DEFAULT_PROBE_PORT);
        assert_eq!(config.session.timing.opc_poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_defaults() {
        let config = OscCapConfig::from_toml_str("").unwrap();
        assert!(config.scopes.is_empty());
        assert!(config.active_scope().is_none());
        assert_eq!(config.session, SessionSettings::default());
    }

    #[test]
    fn test_active_scope_falls_back_to_first() {
        let mut config = OscCapConfig::from_toml_str(CONFIG).unwrap();
        config.last_active = Some("gone".to_string());
        assert_eq!(config.active_scope().unwrap().name, "lab");
    }

    #[test]
    fn test_rejects_invalid_scopes() {
        let duplicate = "[[scopes]]\nname = \"a\"\nhost = \"h1\"\n[[scopes]]\nname = \"a\"\nhost = \"h2\"\n";
        assert!(matches!(
            OscCapConfig::from_toml_str(duplicate),
            Err(ConfigError::DuplicateName { name }) if name == "a"
        ));

        let empty = "[[scopes]]\nname = \"a\"\nhost = \" \"\n";
        assert!(matches!(
            OscCapConfig::from_toml_str(empty),
            Err(ConfigError::EmptyHost { .. })
        ));

        assert!(matches!(
            OscCapConfig::from_toml_str("[[scopes]]\nname = 3\n"),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_build_oscilloscopes() {
        let config = OscCapConfig::from_toml_str(CONFIG).unwrap();
        let scopes = config.build_oscilloscopes(Arc::new(MockConnector::default()));
        assert_eq!(scopes.len(), 2);
        assert_eq!(scopes[0].name(), "lab");
        assert_eq!(scopes[1].host(), "192.168.1.20");
    }
}

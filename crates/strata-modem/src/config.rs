//! Modem configuration.
//!
//! Parsed from TOML in two layers: `*Input` structs mirror the file and
//! leave every field optional, then [`ModemConfigInput::resolve`] fills in
//! defaults and validates. An empty document resolves to the defaults.
//!
//! ```toml
//! version = 1
//!
//! [device]
//! path = "/dev/ttyUSB2"
//! flow_control = "hardware"
//! boot_delay_ms = 5000
//!
//! [pdp]
//! apn = "internet.vodafone.gr"
//!
//! [[operators]]
//! pattern = "vodafone"
//! name = "VODAFONE"
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::operator::{OperatorAlias, OperatorAllowList};

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModemConfigInput {
    pub version: u32,
    pub device: DeviceConfigInput,
    pub pdp: PdpConfigInput,
    pub connect: ConnectConfigInput,
    pub registrar: RegistrarConfigInput,
    pub operators: Option<Vec<OperatorAliasInput>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeviceConfigInput {
    pub path: Option<String>,
    pub model: Option<String>,
    pub baud_rate: Option<u32>,
    pub flow_control: Option<FlowControl>,
    pub boot_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PdpConfigInput {
    pub apn: Option<String>,
    pub context_id: Option<u8>,
    pub pdp_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectConfigInput {
    pub outer_attempts: Option<u32>,
    pub mode_switch_attempts: Option<u32>,
    pub mode_switch_delay_ms: Option<u64>,
    pub ip_timeout_ms: Option<u64>,
    pub step_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistrarConfigInput {
    pub quick_polls: Option<u32>,
    pub poll_interval_ms: Option<u64>,
    pub settle_delay_ms: Option<u64>,
    pub clear_delay_ms: Option<u64>,
    pub resync_attempts: Option<u32>,
    pub resync_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OperatorAliasInput {
    pub pattern: String,
    pub name: String,
}

/// Serial flow control between the host and the modem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub path: String,
    /// Free-form module name, only used in logs (e.g. `sim7600`, `bg96`).
    pub model: String,
    pub baud_rate: u32,
    pub flow_control: FlowControl,
    /// Time the modem needs after the transport opens (USB modems ~5 s).
    pub boot_delay: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".into(),
            model: "generic".into(),
            baud_rate: 115_200,
            flow_control: FlowControl::None,
            boot_delay: Duration::ZERO,
        }
    }
}

/// Packet-data profile provisioned on the modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdpConfig {
    pub apn: String,
    pub context_id: u8,
    pub pdp_type: String,
}

impl Default for PdpConfig {
    fn default() -> Self {
        Self {
            apn: "internet".into(),
            context_id: 1,
            pdp_type: "IP".into(),
        }
    }
}

/// Retry and timing parameters of the connect sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectConfig {
    /// Full sync → clear → mode switch → IP wait sequences per `connect()`.
    pub outer_attempts: u32,
    /// Data-mode switch attempts inside one sequence.
    pub mode_switch_attempts: u32,
    pub mode_switch_delay: Duration,
    pub ip_timeout: Duration,
    pub step_delay: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            outer_attempts: 2,
            mode_switch_attempts: 3,
            mode_switch_delay: Duration::from_millis(1000),
            ip_timeout: Duration::from_millis(15_000),
            step_delay: Duration::from_millis(200),
        }
    }
}

/// Polling and recovery parameters of operator registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrarConfig {
    /// Operator polls per quick phase.
    pub quick_polls: u32,
    pub poll_interval: Duration,
    /// Pause after each provisioning command.
    pub settle_delay: Duration,
    /// Pause after each context-clearing command.
    pub clear_delay: Duration,
    pub resync_attempts: u32,
    pub resync_interval: Duration,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            quick_polls: 8,
            poll_interval: Duration::from_millis(3000),
            settle_delay: Duration::from_millis(200),
            clear_delay: Duration::from_millis(500),
            resync_attempts: 5,
            resync_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModemConfig {
    pub version: u32,
    pub device: DeviceConfig,
    pub pdp: PdpConfig,
    pub connect: ConnectConfig,
    pub registrar: RegistrarConfig,
    pub operators: OperatorAllowList,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            device: DeviceConfig::default(),
            pdp: PdpConfig::default(),
            connect: ConnectConfig::default(),
            registrar: RegistrarConfig::default(),
            operators: OperatorAllowList::default(),
        }
    }
}

fn at_least_one(key: &'static str, value: u32) -> Result<u32, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            reason: "must be at least 1".into(),
        });
    }
    Ok(value)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn ms_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

impl ModemConfigInput {
    pub fn resolve(self) -> Result<ModemConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let dev_default = DeviceConfig::default();
        let device = DeviceConfig {
            path: non_empty(self.device.path).unwrap_or(dev_default.path),
            model: non_empty(self.device.model).unwrap_or(dev_default.model),
            baud_rate: self.device.baud_rate.unwrap_or(dev_default.baud_rate),
            flow_control: self.device.flow_control.unwrap_or_default(),
            boot_delay: ms_or(self.device.boot_delay_ms, dev_default.boot_delay),
        };

        let pdp_default = PdpConfig::default();
        if matches!(self.pdp.apn.as_deref(), Some(apn) if apn.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                key: "pdp.apn",
                reason: "must not be empty".into(),
            });
        }
        let context_id = self.pdp.context_id.unwrap_or(pdp_default.context_id);
        if context_id == 0 {
            return Err(ConfigError::Invalid {
                key: "pdp.context_id",
                reason: "must be at least 1".into(),
            });
        }
        let pdp = PdpConfig {
            apn: non_empty(self.pdp.apn).unwrap_or(pdp_default.apn),
            context_id,
            pdp_type: non_empty(self.pdp.pdp_type).unwrap_or(pdp_default.pdp_type),
        };

        let c = ConnectConfig::default();
        let connect = ConnectConfig {
            outer_attempts: at_least_one(
                "connect.outer_attempts",
                self.connect.outer_attempts.unwrap_or(c.outer_attempts),
            )?,
            mode_switch_attempts: at_least_one(
                "connect.mode_switch_attempts",
                self.connect
                    .mode_switch_attempts
                    .unwrap_or(c.mode_switch_attempts),
            )?,
            mode_switch_delay: ms_or(self.connect.mode_switch_delay_ms, c.mode_switch_delay),
            ip_timeout: ms_or(self.connect.ip_timeout_ms, c.ip_timeout),
            step_delay: ms_or(self.connect.step_delay_ms, c.step_delay),
        };

        let r = RegistrarConfig::default();
        let registrar = RegistrarConfig {
            quick_polls: at_least_one(
                "registrar.quick_polls",
                self.registrar.quick_polls.unwrap_or(r.quick_polls),
            )?,
            poll_interval: ms_or(self.registrar.poll_interval_ms, r.poll_interval),
            settle_delay: ms_or(self.registrar.settle_delay_ms, r.settle_delay),
            clear_delay: ms_or(self.registrar.clear_delay_ms, r.clear_delay),
            resync_attempts: at_least_one(
                "registrar.resync_attempts",
                self.registrar.resync_attempts.unwrap_or(r.resync_attempts),
            )?,
            resync_interval: ms_or(self.registrar.resync_interval_ms, r.resync_interval),
        };

        let operators = match self.operators {
            None => OperatorAllowList::default(),
            Some(entries) => OperatorAllowList::new(
                entries
                    .into_iter()
                    .map(|e| OperatorAlias::new(&e.pattern, &e.name)),
            ),
        };

        Ok(ModemConfig {
            version,
            device,
            pdp,
            connect,
            registrar,
            operators,
        })
    }
}

impl ModemConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(ModemConfig::default());
        }
        let parsed: ModemConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_resolves_to_defaults() {
        let cfg = ModemConfig::from_toml_str("  \n").unwrap();
        assert_eq!(cfg.version, CONFIG_VERSION);
        assert_eq!(cfg.connect, ConnectConfig::default());
        assert_eq!(cfg.registrar.quick_polls, 8);
        assert_eq!(cfg.connect.ip_timeout, Duration::from_secs(15));
        assert_eq!(cfg.pdp.apn, "internet");
        assert_eq!(cfg.operators.len(), 6);
    }

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            version = 1

            [device]
            path = "/dev/ttyACM0"
            model = "sim7600"
            flow_control = "hardware"
            boot_delay_ms = 5000

            [pdp]
            apn = "internet.vodafone.gr"
            context_id = 2

            [connect]
            ip_timeout_ms = 20000
            outer_attempts = 3

            [registrar]
            quick_polls = 4
            poll_interval_ms = 1500

            [[operators]]
            pattern = "orange"
            name = "ORANGE"
        "#;

        let cfg = ModemConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.device.path, "/dev/ttyACM0");
        assert_eq!(cfg.device.flow_control, FlowControl::Hardware);
        assert_eq!(cfg.device.boot_delay, Duration::from_secs(5));
        assert_eq!(cfg.device.baud_rate, 115_200);
        assert_eq!(cfg.pdp.apn, "internet.vodafone.gr");
        assert_eq!(cfg.pdp.context_id, 2);
        assert_eq!(cfg.pdp.pdp_type, "IP");
        assert_eq!(cfg.connect.ip_timeout, Duration::from_secs(20));
        assert_eq!(cfg.connect.outer_attempts, 3);
        assert_eq!(cfg.connect.mode_switch_attempts, 3);
        assert_eq!(cfg.registrar.quick_polls, 4);
        assert_eq!(cfg.registrar.poll_interval, Duration::from_millis(1500));
        assert_eq!(cfg.registrar.resync_attempts, 5);
        assert_eq!(cfg.operators.len(), 1);
    }

    #[test]
    fn rejects_unknown_version() {
        let err = ModemConfig::from_toml_str("version = 7").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion(7)));
    }

    #[test]
    fn rejects_zero_counts() {
        let err = ModemConfig::from_toml_str("[connect]\nouter_attempts = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "connect.outer_attempts",
                ..
            }
        ));
    }

    #[test]
    fn rejects_blank_apn() {
        let err = ModemConfig::from_toml_str("[pdp]\napn = \"  \"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "pdp.apn", .. }));
    }

    #[test]
    fn empty_operator_list_disables_fallback() {
        let cfg = ModemConfig::from_toml_str("operators = []").unwrap();
        assert!(cfg.operators.is_empty());
    }

    #[test]
    fn invalid_toml_is_reported() {
        let err = ModemConfig::from_toml_str("[device\npath = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}

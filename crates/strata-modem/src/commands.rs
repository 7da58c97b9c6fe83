//! AT commands issued by the orchestrator and registrar, with their timeouts.

use std::time::Duration;

use crate::config::PdpConfig;

/// A command line and how long the modem gets to answer it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtCommand {
    pub text: String,
    pub timeout: Duration,
}

impl AtCommand {
    pub fn new(text: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            text: text.into(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

pub const OPERATOR_QUERY: &str = "AT+COPS?";
pub const OPERATOR_QUERY_TIMEOUT: Duration = Duration::from_millis(3000);

pub const REGISTRATION_QUERY: &str = "AT+CREG?";
pub const REGISTRATION_QUERY_TIMEOUT: Duration = Duration::from_millis(1000);

pub const RADIO_OFF: &str = "AT+CFUN=0";
pub const RADIO_OFF_TIMEOUT: Duration = Duration::from_millis(3000);
/// Pause after switching the radio off, before the functional reset.
pub const RADIO_OFF_SETTLE: Duration = Duration::from_millis(2000);

pub const FULL_RESET: &str = "AT+CFUN=1,1";
pub const FULL_RESET_TIMEOUT: Duration = Duration::from_millis(5000);
/// Pause after the functional reset before the first resync probe.
pub const FULL_RESET_SETTLE: Duration = Duration::from_millis(1000);

/// Pause before the single signal-quality retry.
pub const SIGNAL_RETRY_DELAY: Duration = Duration::from_millis(500);

pub const HARDWARE_FLOW_CONTROL: &str = "AT+IFC=2,2";

/// Best-effort context clearing: IP shutdown, PDP deactivate, bearer release.
pub fn context_clear() -> [AtCommand; 3] {
    [
        AtCommand::new("AT+CIPSHUT", 2000),
        AtCommand::new("AT+CGACT=0", 2000),
        AtCommand::new("AT+SAPBR=0,1", 2000),
    ]
}

/// Access-point provisioning for `pdp`, followed by a profile save.
pub fn provision(pdp: &PdpConfig) -> [AtCommand; 5] {
    let cid = pdp.context_id;
    [
        AtCommand::new(format!("AT+CGDCONT={cid}"), 4000),
        AtCommand::new(
            format!("AT+CGDCONT={cid},\"{}\",\"{}\"", pdp.pdp_type, pdp.apn),
            4000,
        ),
        AtCommand::new(format!("AT+CSTT=\"{}\"", pdp.apn), 4000),
        AtCommand::new("AT+CLTS=1", 3000),
        AtCommand::new("AT&W", 4000),
    ]
}

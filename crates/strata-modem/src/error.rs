//! Error taxonomy.
//!
//! Three layers, from the wire up:
//!
//! - [`TransportError`]: what a [`ModemTransport`](crate::transport::ModemTransport)
//!   collaborator reports for a single exchange.
//! - [`CommandError`]: the outcome of one command exchange through the
//!   [`CommandExecutor`](crate::executor::CommandExecutor).
//! - [`ModemError`]: the small set of outcome kinds surfaced by the two
//!   public operations, `connect` and `register_operator`. Raw command
//!   failures never reach callers directly; each kind carries the last raw
//!   response as diagnostic text instead.

use thiserror::Error;

/// Failure reported by a transport collaborator.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No final result line arrived in time. `partial` holds whatever was read.
    #[error("no response within deadline")]
    Timeout { partial: String },
    /// The modem answered with an error result (`ERROR`, `+CME ERROR: …`, …).
    #[error("modem rejected command: {response}")]
    Rejected { response: String },
    /// The physical device is permanently gone (e.g. USB unplug).
    #[error("modem device is gone")]
    DeviceGone,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The response could not be interpreted.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Raw modem text attached to this failure, if any.
    pub fn raw_response(&self) -> &str {
        match self {
            TransportError::Timeout { partial } => partial,
            TransportError::Rejected { response } => response,
            _ => "",
        }
    }
}

/// Failed command exchange (`outcome = Fail` of a command exchange).
#[derive(Debug, Error)]
pub enum CommandError {
    /// Transport presence is latched off; the transport was not touched.
    #[error("modem device is gone")]
    DeviceGone,
    /// The shared shutdown signal fired while the exchange was pending.
    #[error("cancelled")]
    Cancelled,
    #[error("`{command}` timed out")]
    Timeout { command: String, partial: String },
    #[error("`{command}` rejected: {response}")]
    Rejected { command: String, response: String },
    #[error("`{command}` failed: {source}")]
    Transport {
        command: String,
        #[source]
        source: TransportError,
    },
}

impl CommandError {
    pub(crate) fn from_transport(command: &str, err: TransportError) -> Self {
        match err {
            TransportError::DeviceGone => CommandError::DeviceGone,
            TransportError::Timeout { partial } => CommandError::Timeout {
                command: command.to_string(),
                partial,
            },
            TransportError::Rejected { response } => CommandError::Rejected {
                command: command.to_string(),
                response,
            },
            other => CommandError::Transport {
                command: command.to_string(),
                source: other,
            },
        }
    }

    /// Raw modem text attached to this failure, if any.
    pub fn raw_response(&self) -> &str {
        match self {
            CommandError::Timeout { partial, .. } => partial,
            CommandError::Rejected { response, .. } => response,
            CommandError::Transport { source, .. } => source.raw_response(),
            CommandError::DeviceGone | CommandError::Cancelled => "",
        }
    }

    /// The failure ends the whole operation rather than a single step.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandError::DeviceGone | CommandError::Cancelled)
    }

    /// `Err` with the public outcome when this failure ends the whole
    /// operation, `Ok` when the calling step may carry on.
    pub(crate) fn escalate(&self) -> Result<(), ModemError> {
        match ModemError::from_terminal(self) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Outcome kinds of `connect` and `register_operator`.
#[derive(Debug, Error)]
pub enum ModemError {
    /// The modem did not answer the liveness probe.
    #[error("modem did not answer liveness probe (last response: {last_response:?})")]
    SyncFailed { last_response: String },
    /// Switching to data mode failed on every inner attempt.
    #[error("data mode switch failed after {attempts} attempts (last response: {last_response:?})")]
    ModeSwitchFailed { attempts: u32, last_response: String },
    /// The connect sequence exhausted its outer attempts.
    #[error("no IP after {attempts} connect attempts: {detail}")]
    Timeout { attempts: u32, detail: String },
    /// The physical transport is permanently gone.
    #[error("modem device is gone")]
    DeviceGone,
    /// Neither quick phase found a serving operator.
    #[error("no operator found after {polls} polls (last response: {last_response:?})")]
    NoOperatorFound { polls: u32, last_response: String },
    /// The full reset phase could not resynchronize the modem, and the
    /// follow-up polls found no operator either.
    #[error("modem did not recover from full reset (last response: {last_response:?})")]
    ResetFailed { last_response: String },
    /// The modem could neither be probed nor forced into command mode.
    #[error("could not enter command mode (last response: {last_response:?})")]
    CommandModeUnavailable { last_response: String },
    #[error("cancelled")]
    Cancelled,
}

impl ModemError {
    /// Structured diagnostic text for operator-facing logs.
    pub fn diagnostic(&self) -> &str {
        match self {
            ModemError::SyncFailed { last_response }
            | ModemError::ModeSwitchFailed { last_response, .. }
            | ModemError::NoOperatorFound { last_response, .. }
            | ModemError::ResetFailed { last_response }
            | ModemError::CommandModeUnavailable { last_response } => last_response,
            ModemError::Timeout { detail, .. } => detail,
            ModemError::DeviceGone | ModemError::Cancelled => "",
        }
    }

    /// Map a terminal command failure onto the public outcome.
    ///
    /// Returns `None` for failures that the calling step treats as
    /// retryable or best-effort.
    pub fn from_terminal(err: &CommandError) -> Option<Self> {
        match err {
            CommandError::DeviceGone => Some(ModemError::DeviceGone),
            CommandError::Cancelled => Some(ModemError::Cancelled),
            _ => None,
        }
    }
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

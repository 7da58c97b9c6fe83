//! Transport collaborator contract.
//!
//! The physical DTE (UART or USB CDC) and its AT framing live behind
//! [`ModemTransport`]. The core only issues commands through the
//! [`CommandExecutor`](crate::executor::CommandExecutor), which serializes
//! access and enforces the presence latch.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;

/// Whether the serial channel carries AT commands or the PPP byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModemMode {
    #[default]
    Command,
    Data,
}

impl fmt::Display for ModemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModemMode::Command => f.write_str("command"),
            ModemMode::Data => f.write_str("data"),
        }
    }
}

/// Received-signal-strength indicator and bit-error-rate (`+CSQ` indices).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalQuality {
    pub rssi: i32,
    pub ber: i32,
}

/// Terminal conditions a transport reports out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalError {
    /// The physical device disappeared (USB unplug, tty removed).
    DeviceGone,
}

/// Invoked by the transport, at most once, when the device is permanently gone.
pub type ErrorCallback = Box<dyn Fn(TerminalError) + Send + Sync>;

#[async_trait]
pub trait ModemTransport: Send + Sync {
    /// Liveness probe (`AT` → `OK`).
    async fn sync(&self) -> Result<(), TransportError>;

    /// Switch between command and data (PPP) mode.
    async fn set_mode(&self, mode: ModemMode) -> Result<(), TransportError>;

    /// Send one AT command and return the raw response text.
    ///
    /// Error results carry whatever raw text was received.
    async fn at(&self, command: &str, timeout: Duration) -> Result<String, TransportError>;

    async fn signal_quality(&self) -> Result<SignalQuality, TransportError>;

    /// Install the terminal-error callback, replacing any previous one.
    fn set_error_callback(&self, callback: ErrorCallback);
}

//! # strata-modem
//!
//! Connection lifecycle for cellular modems that carry IP over PPP.
//!
//! Brings a modem from an unknown state to an established packet-data
//! link, tracks link health from network-stack notifications, and recovers
//! from unregistered or hung modems through escalating resets. Built for
//! flaky hardware: commands time out, USB modems vanish mid-sequence, and
//! PPP notifications arrive in any order.
//!
//! ## Crate structure
//!
//! - [`modem`]: per-modem context ([`Modem`]) and cooperative shutdown
//! - [`executor`]: serialized AT command execution with presence and shutdown racing
//! - [`state`]: lock-free link state register with async waits
//! - [`bridge`]: PPP phase and IP notifications onto the register
//! - [`orchestrator`]: the `connect()` state machine
//! - [`registrar`]: operator discovery with escalating recovery
//! - [`operator`]: `+COPS`/`+CREG`/`+CSQ` parsing and the operator allow-list
//! - [`commands`]: AT command catalogue and timeouts
//! - [`transport`]: the transport collaborator trait
//! - [`serial`]: AT transport over a serial port
//! - [`netif`]: PPP interface monitor feeding the bridge
//! - [`sim`]: scriptable simulated modem
//! - [`config`]: TOML configuration
//! - [`error`]: error types

pub mod bridge;
pub mod commands;
pub mod config;
pub mod error;
pub mod executor;
pub mod modem;
pub mod netif;
pub mod operator;
pub mod orchestrator;
pub mod registrar;
pub mod serial;
pub mod sim;
pub mod state;
pub mod transport;

pub use config::ModemConfig;
pub use error::ModemError;
pub use modem::{Modem, Shutdown};
pub use operator::ConnectionInfo;

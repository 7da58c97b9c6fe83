//! Simulated modem transport.
//!
//! Scriptable stand-in for a real modem, used by the test suites and by
//! the agent's `--simulate` mode. Behaviour is set up front through
//! [`SimBehavior`]; everything the core sends is recorded so tests can
//! assert on the exact command sequence.
//!
//! With an [`EventSender`] attached, a successful switch to data mode plays
//! the PPP notifications a real network stack would emit (establish, then
//! running and got-IP after `ip_delay`).

use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::bridge::{EventSender, IpEvent, IpInfo, PhaseEvent};
use crate::commands;
use crate::error::TransportError;
use crate::transport::{ErrorCallback, ModemMode, ModemTransport, SignalQuality, TerminalError};

#[derive(Debug, Clone)]
pub struct SimBehavior {
    /// When false, every exchange runs into its timeout.
    pub responsive: bool,
    /// `AT+COPS?` answer once the modem is registered.
    pub operator_response: String,
    /// Operator polls answered with "no operator" before registering.
    pub unregistered_polls: u32,
    /// Data-mode switches that fail before one succeeds.
    pub data_mode_failures: u32,
    /// Whether the network completes PPP negotiation after `CONNECT`.
    pub grants_ip: bool,
    pub ip_delay: Duration,
    /// Whether the modem answers again after `AT+CFUN=1,1`.
    pub resyncs_after_reset: bool,
    /// Signal-quality reads that fail before one succeeds.
    pub signal_failures: u32,
    pub signal: SignalQuality,
    /// Commands answered with `ERROR`.
    pub rejected: Vec<String>,
    /// Simulate an unplug when this command is sent.
    pub unplug_on: Option<String>,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            responsive: true,
            operator_response: "+COPS: 0,0,\"vodafone GR\",7".into(),
            unregistered_polls: 0,
            data_mode_failures: 0,
            grants_ip: true,
            ip_delay: Duration::from_millis(300),
            resyncs_after_reset: true,
            signal_failures: 0,
            signal: SignalQuality { rssi: 20, ber: 0 },
            rejected: Vec::new(),
            unplug_on: None,
        }
    }
}

#[derive(Default)]
struct SimState {
    commands: Vec<String>,
    sync_count: u32,
    data_mode_switches: u32,
    command_mode_switches: u32,
    cops_polls: u32,
    signal_reads: u32,
    mode: ModemMode,
    gone: bool,
    /// Set by a functional reset the modem does not come back from.
    dead: bool,
}

pub struct SimulatedModem {
    behavior: SimBehavior,
    state: Mutex<SimState>,
    callback: Mutex<Option<ErrorCallback>>,
    events: Mutex<Option<EventSender>>,
}

impl SimulatedModem {
    pub fn new(behavior: SimBehavior) -> Self {
        Self {
            behavior,
            state: Mutex::new(SimState::default()),
            callback: Mutex::new(None),
            events: Mutex::new(None),
        }
    }

    /// Route PPP notifications to a bridge.
    pub fn set_event_sender(&self, sender: EventSender) {
        *lock_or_recover(&self.events) = Some(sender);
    }

    /// AT command lines received, in order. Probes and mode switches are counted separately.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn sync_count(&self) -> u32 {
        self.state().sync_count
    }

    pub fn data_mode_switches(&self) -> u32 {
        self.state().data_mode_switches
    }

    pub fn command_mode_switches(&self) -> u32 {
        self.state().command_mode_switches
    }

    pub fn cops_polls(&self) -> u32 {
        self.state().cops_polls
    }

    pub fn mode(&self) -> ModemMode {
        self.state().mode
    }

    /// Pull the plug. The error callback fires on the first call only.
    pub fn unplug(&self) {
        {
            let mut state = self.state();
            if state.gone {
                return;
            }
            state.gone = true;
        }
        tracing::info!("simulated modem unplugged");
        if let Some(callback) = lock_or_recover(&self.callback).as_ref() {
            callback(TerminalError::DeviceGone);
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        lock_or_recover(&self.state)
    }

    fn is_gone(&self) -> bool {
        self.state().gone
    }

    fn respond(&self, command: &str) -> Result<String, TransportError> {
        let mut state = self.state();
        state.commands.push(command.to_string());

        if self.behavior.rejected.iter().any(|c| c == command) {
            return Err(TransportError::Rejected {
                response: "\r\nERROR\r\n".into(),
            });
        }

        let body = match command {
            commands::OPERATOR_QUERY => {
                state.cops_polls += 1;
                if state.cops_polls > self.behavior.unregistered_polls {
                    self.behavior.operator_response.clone()
                } else {
                    "+COPS: 0".to_string()
                }
            }
            commands::REGISTRATION_QUERY => {
                if state.cops_polls > self.behavior.unregistered_polls {
                    "+CREG: 0,1".to_string()
                } else {
                    "+CREG: 0,2".to_string()
                }
            }
            commands::FULL_RESET => {
                state.mode = ModemMode::Command;
                state.dead = !self.behavior.resyncs_after_reset;
                String::new()
            }
            _ => String::new(),
        };

        Ok(if body.is_empty() {
            "\r\nOK\r\n".to_string()
        } else {
            format!("\r\n{body}\r\n\r\nOK\r\n")
        })
    }

    fn negotiate_ppp(&self) {
        let grants_ip = self.behavior.grants_ip;
        let delay = self.behavior.ip_delay;
        let Some(sender) = lock_or_recover(&self.events).clone() else {
            return;
        };
        tokio::spawn(async move {
            sender.phase(PhaseEvent::Establish);
            if !grants_ip {
                return;
            }
            tokio::time::sleep(delay).await;
            sender.phase(PhaseEvent::Running);
            sender.ip(IpEvent::GotIp(IpInfo {
                ip: Ipv4Addr::new(10, 64, 12, 7),
                netmask: Ipv4Addr::new(255, 255, 255, 255),
                gateway: Ipv4Addr::new(10, 64, 64, 64),
                dns: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)],
            }));
        });
    }
}

fn lock_or_recover<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl ModemTransport for SimulatedModem {
    async fn sync(&self) -> Result<(), TransportError> {
        let silent = {
            let mut state = self.state();
            if state.gone {
                return Err(TransportError::DeviceGone);
            }
            state.sync_count += 1;
            state.dead || !self.behavior.responsive || state.mode == ModemMode::Data
        };
        if silent {
            tokio::time::sleep(Duration::from_secs(1)).await;
            return Err(TransportError::Timeout {
                partial: String::new(),
            });
        }
        Ok(())
    }

    async fn set_mode(&self, mode: ModemMode) -> Result<(), TransportError> {
        let attempt = {
            let mut state = self.state();
            if state.gone {
                return Err(TransportError::DeviceGone);
            }
            if state.dead || !self.behavior.responsive {
                None
            } else {
                match mode {
                    ModemMode::Command => {
                        state.command_mode_switches += 1;
                        state.mode = ModemMode::Command;
                        Some(0)
                    }
                    ModemMode::Data => {
                        state.data_mode_switches += 1;
                        Some(state.data_mode_switches)
                    }
                }
            }
        };
        let Some(attempt) = attempt else {
            tokio::time::sleep(Duration::from_secs(1)).await;
            return Err(TransportError::Timeout {
                partial: String::new(),
            });
        };

        if mode == ModemMode::Data {
            if attempt <= self.behavior.data_mode_failures {
                return Err(TransportError::Rejected {
                    response: "\r\nNO CARRIER\r\n".into(),
                });
            }
            self.state().mode = ModemMode::Data;
            self.negotiate_ppp();
        }
        Ok(())
    }

    async fn at(&self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        if self.is_gone() {
            return Err(TransportError::DeviceGone);
        }
        if self.behavior.unplug_on.as_deref() == Some(command) {
            self.unplug();
            return Err(TransportError::DeviceGone);
        }
        let silent = {
            let state = self.state();
            state.dead || !self.behavior.responsive || state.mode == ModemMode::Data
        };
        if silent {
            self.state().commands.push(command.to_string());
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout {
                partial: String::new(),
            });
        }
        self.respond(command)
    }

    async fn signal_quality(&self) -> Result<SignalQuality, TransportError> {
        let mut state = self.state();
        if state.gone {
            return Err(TransportError::DeviceGone);
        }
        state.signal_reads += 1;
        if state.signal_reads <= self.behavior.signal_failures {
            return Err(TransportError::Rejected {
                response: "\r\nERROR\r\n".into(),
            });
        }
        Ok(self.behavior.signal)
    }

    fn set_error_callback(&self, callback: ErrorCallback) {
        *lock_or_recover(&self.callback) = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operator_appears_after_unregistered_polls() {
        let sim = SimulatedModem::new(SimBehavior {
            unregistered_polls: 2,
            ..SimBehavior::default()
        });
        let timeout = Duration::from_secs(3);
        assert!(!sim.at("AT+COPS?", timeout).await.unwrap().contains('"'));
        assert!(!sim.at("AT+COPS?", timeout).await.unwrap().contains('"'));
        assert!(sim.at("AT+COPS?", timeout).await.unwrap().contains("vodafone GR"));
        assert_eq!(sim.cops_polls(), 3);
    }

    #[tokio::test]
    async fn unplug_fires_callback_once() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let sim = SimulatedModem::new(SimBehavior::default());
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        sim.set_error_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        sim.unplug();
        sim.unplug();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(matches!(sim.sync().await, Err(TransportError::DeviceGone)));
    }

    #[tokio::test]
    async fn data_mode_failures_then_success() {
        let sim = SimulatedModem::new(SimBehavior {
            data_mode_failures: 1,
            ..SimBehavior::default()
        });
        assert!(sim.set_mode(ModemMode::Data).await.is_err());
        assert!(sim.set_mode(ModemMode::Data).await.is_ok());
        assert_eq!(sim.mode(), ModemMode::Data);
        assert_eq!(sim.data_mode_switches(), 2);
    }

    #[tokio::test]
    async fn rejected_commands_answer_error() {
        let sim = SimulatedModem::new(SimBehavior {
            rejected: vec!["AT+CSTT=\"internet\"".into()],
            ..SimBehavior::default()
        });
        let err = sim
            .at("AT+CSTT=\"internet\"", Duration::from_secs(4))
            .await
            .unwrap_err();
        assert!(err.raw_response().contains("ERROR"));
    }
}

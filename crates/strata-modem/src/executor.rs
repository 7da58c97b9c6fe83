//! Command Executor.
//!
//! The only path from the orchestrator and registrar to the transport.
//! Every exchange:
//! - fails fast with [`CommandError::DeviceGone`] once the presence latch
//!   is set, without touching the transport;
//! - holds the per-modem command lock, so at most one exchange is in flight;
//! - races the exchange against its deadline, the presence latch and the
//!   shutdown signal, so a vanished device or a shutdown never waits out
//!   a command timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::error::{CommandError, TransportError};
use crate::modem::Shutdown;
use crate::state::StateRegister;
use crate::transport::{ModemMode, ModemTransport, SignalQuality};

/// Extra time given to the transport to report its own timeout (with partial text).
const TRANSPORT_GRACE: Duration = Duration::from_millis(250);
const SYNC_TIMEOUT: Duration = Duration::from_millis(2000);
/// Covers `+++` guard times and `CONNECT` negotiation.
const MODE_SWITCH_TIMEOUT: Duration = Duration::from_millis(10_000);
const SIGNAL_QUALITY_TIMEOUT: Duration = Duration::from_millis(2000);

pub struct CommandExecutor {
    transport: Arc<dyn ModemTransport>,
    register: Arc<StateRegister>,
    shutdown: Shutdown,
    lock: Mutex<()>,
}

impl CommandExecutor {
    pub fn new(
        transport: Arc<dyn ModemTransport>,
        register: Arc<StateRegister>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            transport,
            register,
            shutdown,
            lock: Mutex::new(()),
        }
    }

    pub fn register(&self) -> &Arc<StateRegister> {
        &self.register
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Send `command` and wait for its complete response or `timeout`.
    pub async fn execute(&self, command: &str, timeout: Duration) -> Result<String, CommandError> {
        let result = self
            .exchange(
                command,
                timeout + TRANSPORT_GRACE,
                self.transport.at(command, timeout),
            )
            .await;
        match &result {
            Ok(response) => tracing::debug!(command, response = %response.trim(), "AT ok"),
            Err(e) => tracing::debug!(command, error = %e, response = %e.raw_response().trim(), "AT failed"),
        }
        result
    }

    /// Liveness probe.
    pub async fn sync(&self) -> Result<(), CommandError> {
        self.exchange("AT", SYNC_TIMEOUT, self.transport.sync())
            .await
    }

    pub async fn set_mode(&self, mode: ModemMode) -> Result<(), CommandError> {
        let label = match mode {
            ModemMode::Command => "set_mode(command)",
            ModemMode::Data => "set_mode(data)",
        };
        self.exchange(label, MODE_SWITCH_TIMEOUT, self.transport.set_mode(mode))
            .await
    }

    pub async fn signal_quality(&self) -> Result<SignalQuality, CommandError> {
        self.exchange(
            "AT+CSQ",
            SIGNAL_QUALITY_TIMEOUT,
            self.transport.signal_quality(),
        )
        .await
    }

    async fn exchange<T>(
        &self,
        label: &str,
        limit: Duration,
        op: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, CommandError> {
        if !self.register.transport_present() {
            return Err(CommandError::DeviceGone);
        }
        if self.shutdown.is_triggered() {
            return Err(CommandError::Cancelled);
        }

        let _guard = tokio::select! {
            guard = self.lock.lock() => guard,
            _ = self.register.transport_gone() => return Err(CommandError::DeviceGone),
            _ = self.shutdown.triggered() => return Err(CommandError::Cancelled),
        };

        let result = tokio::select! {
            biased;
            _ = self.register.transport_gone() => return Err(CommandError::DeviceGone),
            _ = self.shutdown.triggered() => return Err(CommandError::Cancelled),
            res = tokio::time::timeout(limit, op) => res,
        };

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(TransportError::DeviceGone)) => {
                self.register.latch_transport_gone();
                Err(CommandError::DeviceGone)
            }
            Ok(Err(e)) => Err(CommandError::from_transport(label, e)),
            Err(_) => Err(CommandError::Timeout {
                command: label.to_string(),
                partial: String::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBehavior, SimulatedModem};

    fn executor(sim: &Arc<SimulatedModem>) -> CommandExecutor {
        CommandExecutor::new(
            sim.clone(),
            Arc::new(StateRegister::new()),
            Shutdown::default(),
        )
    }

    #[tokio::test]
    async fn executes_through_transport() {
        let sim = Arc::new(SimulatedModem::new(SimBehavior::default()));
        let exec = executor(&sim);
        let resp = exec.execute("AT+CGACT=0", Duration::from_secs(2)).await.unwrap();
        assert!(resp.contains("OK"));
        assert_eq!(sim.commands(), ["AT+CGACT=0"]);
    }

    #[tokio::test]
    async fn device_gone_skips_transport() {
        let sim = Arc::new(SimulatedModem::new(SimBehavior::default()));
        let exec = executor(&sim);
        exec.register().latch_transport_gone();

        let err = exec.execute("AT+COPS?", Duration::from_secs(3)).await.unwrap_err();
        assert!(matches!(err, CommandError::DeviceGone));
        assert!(matches!(exec.sync().await, Err(CommandError::DeviceGone)));
        assert!(sim.commands().is_empty());
        assert_eq!(sim.sync_count(), 0);
    }

    #[tokio::test]
    async fn transport_reported_gone_latches_register() {
        let sim = Arc::new(SimulatedModem::new(SimBehavior::default()));
        let exec = executor(&sim);
        sim.unplug();
        let err = exec.execute("AT", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, CommandError::DeviceGone));
        assert!(!exec.register().transport_present());
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_modem_times_out() {
        let sim = Arc::new(SimulatedModem::new(SimBehavior {
            responsive: false,
            ..SimBehavior::default()
        }));
        let exec = executor(&sim);
        let err = exec.execute("AT+CREG?", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
    }

    #[tokio::test]
    async fn shutdown_cancels_before_transport() {
        let sim = Arc::new(SimulatedModem::new(SimBehavior::default()));
        let (tx, rx) = tokio::sync::watch::channel(false);
        let exec = CommandExecutor::new(
            sim.clone(),
            Arc::new(StateRegister::new()),
            Shutdown::new(rx),
        );
        tx.send(true).unwrap();
        let err = exec.execute("AT", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, CommandError::Cancelled));
        assert!(sim.commands().is_empty());
    }
}

//! Top-level modem context.
//!
//! A [`Modem`] owns everything one physical modem needs: the command
//! executor over its transport, the state register, the configuration and
//! the shutdown signal. Orchestrator and registrar borrow it per call, so
//! several modems can run side by side and dropping the `Modem` tears the
//! whole stack down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::bridge::{EventSender, IpInfo, IpLease, NotificationBridge};
use crate::config::ModemConfig;
use crate::error::ModemError;
use crate::executor::CommandExecutor;
use crate::operator::ConnectionInfo;
use crate::orchestrator::ConnectionOrchestrator;
use crate::registrar::OperatorRegistrar;
use crate::state::{LinkState, StateRegister};
use crate::transport::{ModemTransport, TerminalError};

/// Cooperative cancellation shared by every wait in the core.
///
/// Wraps the receiving side of a `watch<bool>` shutdown channel; `true`
/// means stop. The default instance never fires.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    rx: Option<watch::Receiver<bool>>,
}

impl Shutdown {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx: Some(rx) }
    }

    pub fn is_triggered(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves when shutdown is signalled. Pends forever if it never can be.
    pub async fn triggered(&self) {
        if let Some(rx) = &self.rx {
            let mut rx = rx.clone();
            if rx.wait_for(|stop| *stop).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }

    /// Sleep for `duration` unless shutdown fires first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ModemError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.triggered() => Err(ModemError::Cancelled),
        }
    }
}

pub struct Modem {
    executor: CommandExecutor,
    register: Arc<StateRegister>,
    lease: Arc<IpLease>,
    config: ModemConfig,
}

impl Modem {
    /// Build the context over `transport` and hook the transport's
    /// terminal-error callback to the presence latch.
    pub fn new(transport: Arc<dyn ModemTransport>, config: ModemConfig) -> Self {
        Self::with_shutdown(transport, config, Shutdown::default())
    }

    pub fn with_shutdown(
        transport: Arc<dyn ModemTransport>,
        config: ModemConfig,
        shutdown: Shutdown,
    ) -> Self {
        let register = Arc::new(StateRegister::new());
        let latch = register.clone();
        transport.set_error_callback(Box::new(move |err| match err {
            TerminalError::DeviceGone => {
                tracing::error!("modem transport reported device gone");
                latch.latch_transport_gone();
            }
        }));

        tracing::info!(
            model = %config.device.model,
            apn = %config.pdp.apn,
            context_id = config.pdp.context_id,
            "modem context created"
        );

        Self {
            executor: CommandExecutor::new(transport, register.clone(), shutdown),
            register,
            lease: Arc::default(),
            config,
        }
    }

    pub fn config(&self) -> &ModemConfig {
        &self.config
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn register(&self) -> &Arc<StateRegister> {
        &self.register
    }

    pub fn link_state(&self) -> LinkState {
        self.register.snapshot()
    }

    /// Addressing of the running session; `None` unless the link holds an IP.
    pub fn ip_lease(&self) -> Option<IpInfo> {
        if !self.register.ip_acquired() {
            return None;
        }
        self.lease.get()
    }

    /// Notification bridge feeding this modem's register, and its sender.
    pub fn notification_bridge(&self) -> (NotificationBridge, EventSender) {
        NotificationBridge::with_lease(self.register.clone(), self.lease.clone())
    }

    /// Bring up the packet-data link. Safe to call again after a failure;
    /// returns immediately when the link already holds an IP.
    pub async fn connect(&self) -> Result<(), ModemError> {
        ConnectionOrchestrator::new(self).run().await
    }

    /// Discover the serving operator and signal quality into `info`.
    /// Idempotent; may be retried from scratch any number of times.
    pub async fn register_operator(&self, info: &mut ConnectionInfo) -> Result<(), ModemError> {
        OperatorRegistrar::new(self).run(info).await
    }
}

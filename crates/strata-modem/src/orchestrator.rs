//! Connection Orchestrator.
//!
//! Drives one `connect()` call through:
//!
//! ```text
//! Idle → Syncing → Resetting → AwaitingMode → AwaitingIp → Connected
//!           │                       │              │
//!           ↓                       └──────┬───────┘
//!   Failed(SyncFailed)          outer retry (≤ outer_attempts)
//!                                          ↓
//!                                   Failed(Timeout)
//! ```
//!
//! Two retry levels: the data-mode switch is retried in place (a dropped
//! switch is usually line noise), while a missing IP after a successful
//! switch restarts the whole sequence with a freshly cleared context.
//!
//! A modem still in data mode from an earlier session ignores the liveness
//! probe; `Syncing` then forces command mode and probes once more, so
//! `connect()` can be re-invoked after any non-terminal failure.

use std::fmt;

use tokio::time::Instant;

use crate::commands;
use crate::config::ConnectConfig;
use crate::error::ModemError;
use crate::executor::CommandExecutor;
use crate::modem::Modem;
use crate::state::StateRegister;
use crate::transport::ModemMode;

/// Why a connect attempt ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    SyncFailed,
    Timeout,
    DeviceGone,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectState {
    #[default]
    Idle,
    Syncing,
    Resetting,
    AwaitingMode,
    AwaitingIp,
    Connected,
    Failed(FailureKind),
}

impl fmt::Display for ConnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectState::Idle => f.write_str("idle"),
            ConnectState::Syncing => f.write_str("syncing"),
            ConnectState::Resetting => f.write_str("resetting"),
            ConnectState::AwaitingMode => f.write_str("awaiting-mode"),
            ConnectState::AwaitingIp => f.write_str("awaiting-ip"),
            ConnectState::Connected => f.write_str("connected"),
            ConnectState::Failed(kind) => write!(f, "failed({kind:?})"),
        }
    }
}

/// Outcome of one sync → clear → mode switch → IP wait sequence.
enum Attempt {
    Connected,
    /// Retryable; the string describes the failing step.
    Retry(String),
}

pub struct ConnectionOrchestrator<'a> {
    executor: &'a CommandExecutor,
    register: &'a StateRegister,
    config: &'a ConnectConfig,
    state: ConnectState,
}

impl<'a> ConnectionOrchestrator<'a> {
    pub fn new(modem: &'a Modem) -> Self {
        Self {
            executor: modem.executor(),
            register: modem.register(),
            config: &modem.config().connect,
            state: ConnectState::Idle,
        }
    }

    pub fn state(&self) -> ConnectState {
        self.state
    }

    pub async fn run(&mut self) -> Result<(), ModemError> {
        let link = self.register.snapshot();
        if link.is_online() {
            tracing::debug!(phase = %link.phase, "link already holds an IP, nothing to do");
            self.transition(ConnectState::Connected);
            return Ok(());
        }
        if !link.transport_present {
            return self.fail(ModemError::DeviceGone);
        }

        let attempts = self.config.outer_attempts;
        let mut detail = String::new();
        for attempt in 1..=attempts {
            tracing::info!(attempt, max = attempts, "PPP connect attempt");
            match self.attempt().await {
                Ok(Attempt::Connected) => {
                    self.transition(ConnectState::Connected);
                    tracing::info!(attempt, "PPP connected");
                    return Ok(());
                }
                Ok(Attempt::Retry(reason)) => {
                    tracing::warn!(attempt, max = attempts, reason = %reason, "connect attempt failed");
                    detail = reason;
                    if attempt < attempts {
                        if let Err(e) = self.prepare_retry().await {
                            return self.fail(e);
                        }
                    }
                }
                Err(e) => return self.fail(e),
            }
        }

        tracing::error!(attempts, "failed to establish PPP connection");
        self.fail(ModemError::Timeout { attempts, detail })
    }

    async fn attempt(&mut self) -> Result<Attempt, ModemError> {
        self.transition(ConnectState::Syncing);
        self.register.clear_ip();
        self.sync().await?;

        self.transition(ConnectState::Resetting);
        for cmd in commands::context_clear() {
            if let Err(e) = self.executor.execute(&cmd.text, cmd.timeout).await {
                e.escalate()?;
                tracing::debug!(command = %cmd.text, error = %e, "context clear failed, continuing");
            }
            self.pause(self.config.step_delay).await?;
        }

        self.transition(ConnectState::AwaitingMode);
        if let Err(e) = self.enter_data_mode().await {
            return match e {
                ModemError::ModeSwitchFailed { .. } => Ok(Attempt::Retry(e.to_string())),
                other => Err(other),
            };
        }

        self.transition(ConnectState::AwaitingIp);
        let deadline = Instant::now() + self.config.ip_timeout;
        let waited = tokio::select! {
            res = self.register.wait_until(|s| s.ip_acquired || !s.transport_present, Some(deadline)) => res,
            _ = self.executor.shutdown().triggered() => return Err(ModemError::Cancelled),
        };
        match waited {
            Ok(s) if !s.transport_present => Err(ModemError::DeviceGone),
            Ok(_) => Ok(Attempt::Connected),
            Err(s) => {
                tracing::error!(
                    timeout_s = self.config.ip_timeout.as_secs(),
                    phase = %s.phase,
                    "no IP before deadline"
                );
                Ok(Attempt::Retry(format!(
                    "no IP within {:?} (phase {})",
                    self.config.ip_timeout, s.phase
                )))
            }
        }
    }

    /// Liveness probe. A modem left in data mode by an earlier session does
    /// not answer, so a failed probe forces command mode and probes again.
    async fn sync(&self) -> Result<(), ModemError> {
        let first = match self.executor.sync().await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        first.escalate()?;
        tracing::warn!(error = %first, "liveness probe failed, forcing command mode");
        if let Err(e) = self.executor.set_mode(ModemMode::Command).await {
            e.escalate()?;
            tracing::error!(error = %e, "modem did not answer liveness probe");
            return Err(ModemError::SyncFailed {
                last_response: first.raw_response().to_string(),
            });
        }
        if let Err(e) = self.executor.sync().await {
            e.escalate()?;
            tracing::error!(error = %e, "modem did not answer liveness probe");
            return Err(ModemError::SyncFailed {
                last_response: e.raw_response().to_string(),
            });
        }
        Ok(())
    }

    /// Switch to data mode, retrying in place with a command-mode fallback between attempts.
    pub async fn enter_data_mode(&mut self) -> Result<(), ModemError> {
        let attempts = self.config.mode_switch_attempts;
        let mut last_response = String::new();
        for attempt in 1..=attempts {
            match self.executor.set_mode(ModemMode::Data).await {
                Ok(()) => {
                    tracing::info!(attempt, "modem in data mode");
                    return Ok(());
                }
                Err(e) => {
                    e.escalate()?;
                    tracing::warn!(attempt, max = attempts, error = %e, "data mode switch failed");
                    last_response = e.raw_response().to_string();
                }
            }
            if attempt < attempts {
                if let Err(e) = self.executor.set_mode(ModemMode::Command).await {
                    e.escalate()?;
                    tracing::debug!(error = %e, "command mode fallback failed");
                }
                self.pause(self.config.mode_switch_delay).await?;
            }
        }
        tracing::error!(attempts, "data mode switch exhausted");
        Err(ModemError::ModeSwitchFailed {
            attempts,
            last_response,
        })
    }

    /// Best-effort return to command mode so the next attempt can probe the modem.
    async fn prepare_retry(&self) -> Result<(), ModemError> {
        if let Err(e) = self.executor.set_mode(ModemMode::Command).await {
            e.escalate()?;
            tracing::debug!(error = %e, "command mode fallback failed");
        }
        self.pause(self.config.step_delay).await
    }

    async fn pause(&self, duration: std::time::Duration) -> Result<(), ModemError> {
        self.executor.shutdown().sleep(duration).await
    }

    fn transition(&mut self, next: ConnectState) {
        if self.state != next {
            tracing::debug!(from = %self.state, to = %next, "connect state");
            self.state = next;
        }
    }

    fn fail(&mut self, err: ModemError) -> Result<(), ModemError> {
        let kind = match &err {
            ModemError::SyncFailed { .. } => FailureKind::SyncFailed,
            ModemError::DeviceGone => FailureKind::DeviceGone,
            ModemError::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Timeout,
        };
        self.transition(ConnectState::Failed(kind));
        Err(err)
    }
}

//! Operator Registrar.
//!
//! Finds the serving operator and signal quality, escalating when the
//! modem is not registered yet:
//!
//! 1. make sure the modem takes commands (probe, else force command mode)
//! 2. provision the access point (failures logged, not fatal)
//! 3. quick phase: poll `AT+COPS?` up to `quick_polls` times
//! 4. log the `AT+CREG?` registration state
//! 5. clear the packet-data context (best effort)
//! 6. full reset: radio off, functional reset, resync probes
//! 7. quick phase again
//!
//! The run keeps no state between calls, so a failed registration can be
//! retried from scratch.

use std::time::Duration;

use crate::commands;
use crate::config::{PdpConfig, RegistrarConfig};
use crate::error::ModemError;
use crate::executor::CommandExecutor;
use crate::modem::Modem;
use crate::operator::{self, ConnectionInfo, OperatorAllowList, SIGNAL_UNKNOWN};
use crate::transport::{ModemMode, SignalQuality};

pub struct OperatorRegistrar<'a> {
    executor: &'a CommandExecutor,
    config: &'a RegistrarConfig,
    pdp: &'a PdpConfig,
    operators: &'a OperatorAllowList,
    polls: u32,
    last_response: String,
}

impl<'a> OperatorRegistrar<'a> {
    pub fn new(modem: &'a Modem) -> Self {
        let config = modem.config();
        Self {
            executor: modem.executor(),
            config: &config.registrar,
            pdp: &config.pdp,
            operators: &config.operators,
            polls: 0,
            last_response: String::new(),
        }
    }

    /// Operator polls issued so far in this run.
    pub fn polls(&self) -> u32 {
        self.polls
    }

    pub async fn run(&mut self, info: &mut ConnectionInfo) -> Result<(), ModemError> {
        if !self.executor.register().transport_present() {
            tracing::error!("modem device gone, aborting operator registration");
            return Err(ModemError::DeviceGone);
        }

        self.ensure_command_mode().await?;
        self.provision().await?;

        if self.quick_phase(info).await? {
            tracing::info!(operator = %info.operator_name, "operator found with no reset needed");
            return Ok(());
        }
        tracing::warn!(polls = self.polls, "no operator in quick phase, escalating to full reset");

        self.check_registration().await?;
        self.clear_context().await?;

        let reset_failure = match self.full_reset().await {
            Ok(()) => None,
            Err(ModemError::ResetFailed { last_response }) => Some(last_response),
            Err(e) => return Err(e),
        };

        if self.quick_phase(info).await? {
            tracing::info!(operator = %info.operator_name, "operator found after full reset");
            return Ok(());
        }
        self.check_registration().await?;

        tracing::error!(
            polls = self.polls,
            reset_failed = reset_failure.is_some(),
            last_response = %self.last_response.trim(),
            "operator registration failed"
        );
        match reset_failure {
            Some(last_response) => Err(ModemError::ResetFailed { last_response }),
            None => Err(ModemError::NoOperatorFound {
                polls: self.polls,
                last_response: std::mem::take(&mut self.last_response),
            }),
        }
    }

    async fn ensure_command_mode(&mut self) -> Result<(), ModemError> {
        match self.executor.sync().await {
            Ok(()) => {
                tracing::info!("modem in command mode");
                return Ok(());
            }
            Err(e) => {
                e.escalate()?;
                tracing::warn!(error = %e, "liveness probe failed, forcing command mode");
            }
        }
        if let Err(e) = self.executor.set_mode(ModemMode::Command).await {
            e.escalate()?;
            tracing::error!(error = %e, "failed to enter command mode");
            return Err(ModemError::CommandModeUnavailable {
                last_response: e.raw_response().to_string(),
            });
        }
        tracing::info!("modem forced into command mode");
        Ok(())
    }

    async fn provision(&mut self) -> Result<(), ModemError> {
        for cmd in commands::provision(self.pdp) {
            if let Err(e) = self.executor.execute(&cmd.text, cmd.timeout).await {
                e.escalate()?;
                tracing::warn!(command = %cmd.text, error = %e, "provisioning command rejected, continuing");
            }
            self.pause(self.config.settle_delay).await?;
        }
        Ok(())
    }

    /// Poll the operator up to `quick_polls` times. `Ok(true)` once found.
    async fn quick_phase(&mut self, info: &mut ConnectionInfo) -> Result<bool, ModemError> {
        for _ in 0..self.config.quick_polls {
            if self.query_operator(info).await? {
                return Ok(true);
            }
            self.pause(self.config.poll_interval).await?;
        }
        Ok(false)
    }

    async fn query_operator(&mut self, info: &mut ConnectionInfo) -> Result<bool, ModemError> {
        self.polls += 1;
        let response = match self
            .executor
            .execute(commands::OPERATOR_QUERY, commands::OPERATOR_QUERY_TIMEOUT)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                e.escalate()?;
                tracing::info!(poll = self.polls, error = %e, "operator query failed");
                self.last_response = e.raw_response().to_string();
                return Ok(false);
            }
        };
        tracing::info!(poll = self.polls, response = %response.trim(), "operator query");

        let Some(name) = operator::extract_operator(&response, self.operators) else {
            self.last_response = response;
            return Ok(false);
        };

        let signal = self.read_signal_quality().await?;
        info.set_operator_name(&name);
        info.rssi = signal.rssi;
        info.ber = signal.ber;
        tracing::info!(
            operator = %info.operator_name,
            rssi = info.rssi,
            ber = info.ber,
            rssi_dbm = ?info.rssi_dbm(),
            "operator registered"
        );
        Ok(true)
    }

    /// Signal quality with one retry. Advisory: failure yields "unknown", not an error.
    async fn read_signal_quality(&self) -> Result<SignalQuality, ModemError> {
        match self.executor.signal_quality().await {
            Ok(q) => return Ok(q),
            Err(e) => {
                e.escalate()?;
                tracing::debug!(error = %e, "signal quality read failed, retrying once");
            }
        }
        self.pause(commands::SIGNAL_RETRY_DELAY).await?;
        match self.executor.signal_quality().await {
            Ok(q) => Ok(q),
            Err(e) => {
                e.escalate()?;
                tracing::warn!(error = %e, "signal quality unavailable");
                Ok(SignalQuality {
                    rssi: SIGNAL_UNKNOWN,
                    ber: SIGNAL_UNKNOWN,
                })
            }
        }
    }

    /// Log the network registration state. Never fails on its own.
    async fn check_registration(&mut self) -> Result<(), ModemError> {
        match self
            .executor
            .execute(
                commands::REGISTRATION_QUERY,
                commands::REGISTRATION_QUERY_TIMEOUT,
            )
            .await
        {
            Ok(response) => match operator::parse_registration(&response) {
                Some(status) if status.is_registered() => {
                    tracing::info!(status = %status, "modem is registered on the network");
                }
                status => {
                    tracing::warn!(
                        status = ?status,
                        response = %response.trim(),
                        "modem is not registered"
                    );
                }
            },
            Err(e) => {
                e.escalate()?;
                tracing::warn!(error = %e, response = %e.raw_response().trim(), "registration check failed");
            }
        }
        Ok(())
    }

    async fn clear_context(&mut self) -> Result<(), ModemError> {
        for cmd in commands::context_clear() {
            if let Err(e) = self.executor.execute(&cmd.text, cmd.timeout).await {
                e.escalate()?;
                tracing::debug!(command = %cmd.text, error = %e, "context clear failed, continuing");
            }
            self.pause(self.config.clear_delay).await?;
        }
        Ok(())
    }

    /// Radio off, functional reset with restart, then resync probes.
    async fn full_reset(&mut self) -> Result<(), ModemError> {
        match self
            .executor
            .execute(commands::RADIO_OFF, commands::RADIO_OFF_TIMEOUT)
            .await
        {
            Ok(resp) => tracing::info!(response = %resp.trim(), "radio off"),
            Err(e) => {
                e.escalate()?;
                tracing::warn!(error = %e, "radio off failed");
            }
        }
        self.pause(commands::RADIO_OFF_SETTLE).await?;

        if let Err(e) = self
            .executor
            .execute(commands::FULL_RESET, commands::FULL_RESET_TIMEOUT)
            .await
        {
            e.escalate()?;
            tracing::error!(error = %e, response = %e.raw_response().trim(), "functional reset failed");
            return Err(ModemError::ResetFailed {
                last_response: e.raw_response().to_string(),
            });
        }
        tracing::info!("waiting for modem to restart");
        self.pause(commands::FULL_RESET_SETTLE).await?;

        let attempts = self.config.resync_attempts;
        for attempt in 1..=attempts {
            tracing::info!(attempt, max = attempts, "resync after reset");
            match self.executor.sync().await {
                Ok(()) => {
                    tracing::info!(attempt, "modem resynced after reset");
                    return Ok(());
                }
                Err(e) => {
                    e.escalate()?;
                    self.last_response = e.raw_response().to_string();
                }
            }
            self.pause(self.config.resync_interval).await?;
        }

        tracing::error!(attempts, "modem not responding after reset");
        Err(ModemError::ResetFailed {
            last_response: self.last_response.clone(),
        })
    }

    async fn pause(&self, duration: Duration) -> Result<(), ModemError> {
        self.executor.shutdown().sleep(duration).await
    }
}

//! Link supervision.
//!
//! The library never reconnects on its own; this loop owns that decision:
//!
//! ```text
//! boot delay → flow control → ┬→ register operator → connect → wait for link loss ┐
//!                             └──────────────── backoff (1 s … max) ◀─────────────┘
//! ```
//!
//! A latched device loss ends the loop with an error. Shutdown ends it cleanly.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use strata_modem::commands;
use strata_modem::config::FlowControl;
use strata_modem::state::LinkPhase;
use strata_modem::{ConnectionInfo, Modem, ModemError, Shutdown};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const FLOW_CONTROL_TIMEOUT: Duration = Duration::from_millis(2000);

/// Contents of the status file.
#[derive(Debug, Serialize)]
pub struct LinkStatus<'a> {
    pub operator: &'a str,
    pub rssi: i32,
    pub ber: i32,
    pub rssi_dbm: Option<i32>,
    /// Address assigned to the running session.
    pub ip: Option<Ipv4Addr>,
    pub phase: LinkPhase,
    pub ip_acquired: bool,
    pub updated_unix_s: u64,
}

pub struct Supervisor {
    modem: Modem,
    shutdown: Shutdown,
    status_file: Option<PathBuf>,
    max_backoff: Duration,
}

impl Supervisor {
    pub fn new(
        modem: Modem,
        shutdown: Shutdown,
        status_file: Option<PathBuf>,
        max_backoff: Duration,
    ) -> Self {
        Self {
            modem,
            shutdown,
            status_file,
            max_backoff: max_backoff.max(INITIAL_BACKOFF),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        match self.prepare().await {
            Ok(()) => {}
            Err(ModemError::Cancelled) => return Ok(()),
            Err(e) => anyhow::bail!("modem setup failed: {e}"),
        }

        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.session().await {
                Ok(()) => {
                    tracing::warn!("data link lost");
                    backoff = INITIAL_BACKOFF;
                }
                Err(ModemError::Cancelled) => return Ok(()),
                Err(ModemError::DeviceGone) => {
                    self.write_status(&ConnectionInfo::default()).await;
                    anyhow::bail!("modem device gone");
                }
                Err(e) => {
                    tracing::warn!(error = %e, diagnostic = %e.diagnostic().trim(), "modem session failed");
                }
            }

            if self.shutdown.is_triggered() {
                return Ok(());
            }
            tracing::info!(backoff_s = backoff.as_secs(), "reconnecting");
            if self.shutdown.sleep(backoff).await.is_err() {
                return Ok(());
            }
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    /// One-time device setup after the transport opens.
    async fn prepare(&self) -> Result<(), ModemError> {
        let device = &self.modem.config().device;
        if !device.boot_delay.is_zero() {
            tracing::info!(delay_ms = device.boot_delay.as_millis() as u64, "waiting for modem to boot");
            self.shutdown.sleep(device.boot_delay).await?;
        }
        if device.flow_control == FlowControl::Hardware {
            match self
                .modem
                .executor()
                .execute(commands::HARDWARE_FLOW_CONTROL, FLOW_CONTROL_TIMEOUT)
                .await
            {
                Ok(_) => tracing::info!("hardware flow control enabled"),
                Err(e) => {
                    if let Some(err) = ModemError::from_terminal(&e) {
                        return Err(err);
                    }
                    tracing::warn!(error = %e, "could not enable hardware flow control");
                }
            }
        }
        Ok(())
    }

    /// Register, connect, then hold until the link drops.
    async fn session(&self) -> Result<(), ModemError> {
        let mut info = ConnectionInfo::default();
        self.modem.register_operator(&mut info).await?;
        self.modem.connect().await?;
        tracing::info!(operator = %info.operator_name, rssi = info.rssi, "data link up");
        self.write_status(&info).await;

        let register = self.modem.register();
        let state = tokio::select! {
            res = register.wait_until(|s| !s.is_online(), None) => res.unwrap_or_else(|s| s),
            _ = self.shutdown.triggered() => return Err(ModemError::Cancelled),
        };
        self.write_status(&info).await;
        if !state.transport_present {
            return Err(ModemError::DeviceGone);
        }
        Ok(())
    }

    async fn write_status(&self, info: &ConnectionInfo) {
        let Some(path) = &self.status_file else {
            return;
        };
        let link = self.modem.link_state();
        let status = LinkStatus {
            operator: &info.operator_name,
            rssi: info.rssi,
            ber: info.ber,
            rssi_dbm: info.rssi_dbm(),
            ip: self.modem.ip_lease().map(|lease| lease.ip),
            phase: link.phase,
            ip_acquired: link.ip_acquired,
            updated_unix_s: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        let json = match serde_json::to_vec_pretty(&status) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize status");
                return;
            }
        };
        // Write-then-rename so readers never see a partial file.
        let tmp = path.with_extension("tmp");
        let result = async {
            tokio::fs::write(&tmp, &json).await?;
            tokio::fs::rename(&tmp, path).await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "failed to write status file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use strata_modem::bridge::{IpEvent, NetifEvent};
    use strata_modem::config::ModemConfig;
    use strata_modem::sim::{SimBehavior, SimulatedModem};

    fn modem(behavior: SimBehavior) -> (Arc<SimulatedModem>, Modem) {
        let sim = Arc::new(SimulatedModem::new(behavior));
        let modem = Modem::new(sim.clone(), ModemConfig::default());
        let (bridge, events) = modem.notification_bridge();
        sim.set_event_sender(events);
        bridge.spawn();
        (sim, modem)
    }

    fn status_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("strata-modem-agent-{}-{name}.json", std::process::id()))
    }

    #[tokio::test(start_paused = true)]
    async fn session_writes_status_and_returns_on_ip_loss() {
        let (_sim, modem) = modem(SimBehavior::default());
        let register = modem.register().clone();
        let path = status_path("session");
        let supervisor = Supervisor::new(
            modem,
            Shutdown::default(),
            Some(path.clone()),
            Duration::from_secs(30),
        );

        let session = tokio::spawn(async move { supervisor.session().await });
        register
            .wait_until(|s| s.ip_acquired, None)
            .await
            .unwrap();
        // Let the session reach its link-loss wait.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let online: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(online["ip"], "10.64.12.7");
        assert_eq!(online["phase"], "running");
        assert_eq!(online["ip_acquired"], true);

        strata_modem::bridge::apply(&register, &NetifEvent::Ip(IpEvent::LostIp));

        session.await.unwrap().unwrap();
        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["operator"], "vodafone GR");
        assert_eq!(written["rssi"], 20);
        assert_eq!(written["ip_acquired"], false);
        assert!(written["ip"].is_null());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test(start_paused = true)]
    async fn device_loss_ends_supervision() {
        let (_sim, modem) = modem(SimBehavior {
            unplug_on: Some("AT+CGDCONT=1".into()),
            ..SimBehavior::default()
        });
        let supervisor = Supervisor::new(modem, Shutdown::default(), None, Duration::from_secs(30));

        let err = supervisor.run().await.unwrap_err();
        assert!(err.to_string().contains("device gone"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_supervision_cleanly() {
        let (tx, rx) = tokio::sync::watch::channel(false);
        let sim = Arc::new(SimulatedModem::new(SimBehavior {
            unregistered_polls: u32::MAX,
            ..SimBehavior::default()
        }));
        let shutdown = Shutdown::new(rx);
        let modem = Modem::with_shutdown(sim, ModemConfig::default(), shutdown.clone());
        let supervisor = Supervisor::new(modem, shutdown, None, Duration::from_secs(30));

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let _ = tx.send(true);
            tx
        });
        supervisor.run().await.unwrap();
        drop(stopper.await.unwrap());
    }
}

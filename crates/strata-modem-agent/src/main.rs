//! Strata Modem Agent
//!
//! Daemon keeping one cellular modem's PPP data link up.
//!
//! - Opens the modem's serial port (or a simulated modem with `--simulate`)
//! - Registers on the network and brings up the data link
//! - Watches the PPP interface and reconnects with exponential backoff
//! - Publishes operator, signal and link state to a JSON status file

mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use strata_modem::config::ModemConfig;
use strata_modem::netif::NetifMonitor;
use strata_modem::serial::{self, AtTransport};
use strata_modem::sim::{SimBehavior, SimulatedModem};
use strata_modem::transport::ModemTransport;
use strata_modem::{Modem, Shutdown};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Strata cellular modem agent.
#[derive(Parser, Debug)]
#[command(name = "strata-modem-agent", about = "Cellular modem link agent")]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial device override (e.g. /dev/ttyUSB2).
    #[arg(long)]
    device: Option<String>,

    /// Access point name override.
    #[arg(long)]
    apn: Option<String>,

    /// Run against a simulated modem instead of a serial device.
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// PPP network interface to monitor.
    #[arg(long, default_value = "ppp0")]
    netif: String,

    /// Where to write the JSON link status.
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Upper bound of the reconnect backoff, in seconds.
    #[arg(long, default_value_t = 30)]
    reconnect_max_backoff_s: u64,
}

fn load_config(cli: &Cli) -> anyhow::Result<ModemConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            ModemConfig::from_toml_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => ModemConfig::default(),
    };
    if let Some(device) = &cli.device {
        config.device.path = device.clone();
    }
    if let Some(apn) = &cli.apn {
        anyhow::ensure!(!apn.trim().is_empty(), "--apn must not be empty");
        config.pdp.apn = apn.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    tracing::info!(
        device = %config.device.path,
        apn = %config.pdp.apn,
        simulate = cli.simulate,
        netif = %cli.netif,
        "strata-modem-agent starting"
    );

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown = Shutdown::new(shutdown_rx);

    let sim = cli
        .simulate
        .then(|| Arc::new(SimulatedModem::new(SimBehavior::default())));
    let transport: Arc<dyn ModemTransport> = match &sim {
        Some(sim) => sim.clone(),
        None => {
            let port = serial::open_port(
                &config.device.path,
                config.device.baud_rate,
                config.device.flow_control,
            )
            .with_context(|| format!("opening {}", config.device.path))?;
            Arc::new(AtTransport::new(port, config.pdp.context_id))
        }
    };

    let modem = Modem::with_shutdown(transport, config, shutdown.clone());

    // ── Notification bridge ─────────────────────────────────────
    let (bridge, events) = modem.notification_bridge();
    let _bridge_handle = bridge.spawn();
    match &sim {
        Some(sim) => sim.set_event_sender(events),
        None => {
            let _netif_handle = NetifMonitor::new(cli.netif.clone(), events).spawn(shutdown.clone());
        }
    }

    // ── Supervision ─────────────────────────────────────────────
    let supervisor = supervisor::Supervisor::new(
        modem,
        shutdown,
        cli.status_file.clone(),
        Duration::from_secs(cli.reconnect_max_backoff_s),
    );
    let mut supervisor_handle = tokio::spawn(supervisor.run());

    // ── Shutdown handling ───────────────────────────────────────
    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
            let _ = shutdown_tx.send(true);
            (&mut supervisor_handle).await
        }
        result = &mut supervisor_handle => result,
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => Err(anyhow::anyhow!("supervisor task failed: {e}")),
    };
    match &outcome {
        Ok(()) => tracing::info!("strata-modem-agent stopped"),
        Err(e) => tracing::error!(error = %e, "strata-modem-agent stopped"),
    }
    outcome
}

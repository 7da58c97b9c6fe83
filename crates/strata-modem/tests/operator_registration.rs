//! `register_operator()` scenarios: quick discovery, the full-reset
//! escalation and its failure modes.

use std::sync::Arc;
use std::time::Duration;

use strata_modem::config::ModemConfig;
use strata_modem::modem::Shutdown;
use strata_modem::registrar::OperatorRegistrar;
use strata_modem::sim::{SimBehavior, SimulatedModem};
use strata_modem::transport::{ModemMode, SignalQuality};
use strata_modem::{ConnectionInfo, Modem, ModemError};

fn setup(behavior: SimBehavior) -> (Arc<SimulatedModem>, Modem) {
    let sim = Arc::new(SimulatedModem::new(behavior));
    let modem = Modem::new(sim.clone(), ModemConfig::default());
    (sim, modem)
}

fn count(sim: &SimulatedModem, command: &str) -> usize {
    sim.commands().iter().filter(|c| *c == command).count()
}

fn never_registers() -> SimBehavior {
    SimBehavior {
        unregistered_polls: u32::MAX,
        ..SimBehavior::default()
    }
}

// ─── Quick phase ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn quoted_plmn_code_found_on_first_poll() {
    let (sim, modem) = setup(SimBehavior {
        operator_response: "+COPS: 0,2,\"20210\",7".into(),
        ..SimBehavior::default()
    });
    let mut info = ConnectionInfo::default();

    modem.register_operator(&mut info).await.unwrap();

    assert_eq!(info.operator_name, "20210");
    assert_eq!((info.rssi, info.ber), (20, 0));
    assert_eq!(sim.cops_polls(), 1);
    assert_eq!(
        sim.commands(),
        [
            "AT+CGDCONT=1",
            "AT+CGDCONT=1,\"IP\",\"internet\"",
            "AT+CSTT=\"internet\"",
            "AT+CLTS=1",
            "AT&W",
            "AT+COPS?",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn unquoted_response_uses_allow_list() {
    let (_sim, modem) = setup(SimBehavior {
        operator_response: "+COPS: 0,0,vodafone GR,2".into(),
        ..SimBehavior::default()
    });
    let mut info = ConnectionInfo::default();

    modem.register_operator(&mut info).await.unwrap();
    assert_eq!(info.operator_name, "VODAFONE");
}

#[tokio::test(start_paused = true)]
async fn allow_list_order_breaks_ties() {
    let (_sim, modem) = setup(SimBehavior {
        operator_response: "+COPS: 0,2,20201 cosmote,7".into(),
        ..SimBehavior::default()
    });
    let mut info = ConnectionInfo::default();

    modem.register_operator(&mut info).await.unwrap();
    assert_eq!(info.operator_name, "COSMOTE");
}

#[tokio::test(start_paused = true)]
async fn registers_within_quick_phase_without_reset() {
    let (sim, modem) = setup(SimBehavior {
        unregistered_polls: 3,
        ..SimBehavior::default()
    });
    let mut info = ConnectionInfo::default();

    modem.register_operator(&mut info).await.unwrap();

    assert_eq!(info.operator_name, "vodafone GR");
    assert_eq!(sim.cops_polls(), 4);
    assert_eq!(count(&sim, "AT+CFUN=1,1"), 0);
}

#[tokio::test(start_paused = true)]
async fn provisioning_rejection_is_not_fatal() {
    let (sim, modem) = setup(SimBehavior {
        rejected: vec!["AT+CSTT=\"internet\"".into(), "AT&W".into()],
        ..SimBehavior::default()
    });
    let mut info = ConnectionInfo::default();

    modem.register_operator(&mut info).await.unwrap();
    assert_eq!(sim.cops_polls(), 1);
}

// ─── Signal quality ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn signal_quality_retried_once() {
    let (_sim, modem) = setup(SimBehavior {
        signal_failures: 1,
        signal: SignalQuality { rssi: 25, ber: 1 },
        ..SimBehavior::default()
    });
    let mut info = ConnectionInfo::default();

    modem.register_operator(&mut info).await.unwrap();
    assert_eq!((info.rssi, info.ber), (25, 1));
}

#[tokio::test(start_paused = true)]
async fn signal_quality_unknown_still_succeeds() {
    let (_sim, modem) = setup(SimBehavior {
        signal_failures: 2,
        ..SimBehavior::default()
    });
    let mut info = ConnectionInfo::default();

    modem.register_operator(&mut info).await.unwrap();
    assert_eq!(info.operator_name, "vodafone GR");
    assert_eq!((info.rssi, info.ber), (99, 99));
    assert_eq!(info.rssi_dbm(), None);
}

// ─── Escalation ──────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn registers_after_full_reset() {
    let (sim, modem) = setup(SimBehavior {
        unregistered_polls: 9,
        ..SimBehavior::default()
    });
    let mut info = ConnectionInfo::default();

    modem.register_operator(&mut info).await.unwrap();

    assert_eq!(sim.cops_polls(), 10);
    let commands = sim.commands();
    let pos = |c: &str| commands.iter().position(|x| x == c).unwrap();
    assert!(pos("AT+CREG?") < pos("AT+CIPSHUT"));
    assert!(pos("AT+SAPBR=0,1") < pos("AT+CFUN=0"));
    assert!(pos("AT+CFUN=0") < pos("AT+CFUN=1,1"));
    // Initial probe plus one resync after the reset.
    assert_eq!(sim.sync_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn never_registered_reports_no_operator() {
    let (sim, modem) = setup(never_registers());
    let mut info = ConnectionInfo::default();

    let err = modem.register_operator(&mut info).await.unwrap_err();

    assert!(matches!(err, ModemError::NoOperatorFound { polls: 16, .. }), "{err:?}");
    assert_eq!(count(&sim, "AT+COPS?"), 16);
    assert_eq!(count(&sim, "AT+CREG?"), 2);
    assert_eq!(count(&sim, "AT+CFUN=1,1"), 1);
    assert!(info.operator_name.is_empty());
}

#[tokio::test(start_paused = true)]
async fn modem_silent_after_reset_reports_reset_failed() {
    let (sim, modem) = setup(SimBehavior {
        resyncs_after_reset: false,
        ..never_registers()
    });
    let mut info = ConnectionInfo::default();

    let err = modem.register_operator(&mut info).await.unwrap_err();

    assert!(matches!(err, ModemError::ResetFailed { .. }), "{err:?}");
    // Initial probe plus five resync attempts.
    assert_eq!(sim.sync_count(), 6);
    // The second quick phase still runs.
    assert_eq!(count(&sim, "AT+COPS?"), 16);
}

#[tokio::test(start_paused = true)]
async fn rejected_functional_reset_skips_resync() {
    let (sim, modem) = setup(SimBehavior {
        rejected: vec!["AT+CFUN=1,1".into()],
        ..never_registers()
    });
    let mut info = ConnectionInfo::default();

    let mut registrar = OperatorRegistrar::new(&modem);
    let err = registrar.run(&mut info).await.unwrap_err();

    assert!(matches!(err, ModemError::ResetFailed { .. }), "{err:?}");
    assert!(err.diagnostic().contains("ERROR"));
    assert_eq!(registrar.polls(), 16);
    assert_eq!(sim.sync_count(), 1);
}

// ─── Command mode, device loss, cancellation ─────────────────────────────────

#[tokio::test(start_paused = true)]
async fn forces_command_mode_when_probe_fails() {
    let sim = Arc::new(SimulatedModem::new(SimBehavior::default()));
    let modem = Modem::new(sim.clone(), ModemConfig::default());
    modem.executor().set_mode(ModemMode::Data).await.unwrap();
    assert_eq!(sim.mode(), ModemMode::Data);

    let mut info = ConnectionInfo::default();
    modem.register_operator(&mut info).await.unwrap();

    assert_eq!(sim.mode(), ModemMode::Command);
    assert_eq!(sim.command_mode_switches(), 1);
}

#[tokio::test(start_paused = true)]
async fn unresponsive_modem_reports_command_mode_unavailable() {
    let (sim, modem) = setup(SimBehavior {
        responsive: false,
        ..SimBehavior::default()
    });
    let mut info = ConnectionInfo::default();

    let err = modem.register_operator(&mut info).await.unwrap_err();

    assert!(matches!(err, ModemError::CommandModeUnavailable { .. }), "{err:?}");
    assert!(sim.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unplug_during_provisioning_is_terminal() {
    let (sim, modem) = setup(SimBehavior {
        unplug_on: Some("AT+CLTS=1".into()),
        ..SimBehavior::default()
    });
    let mut info = ConnectionInfo::default();

    let err = modem.register_operator(&mut info).await.unwrap_err();

    assert!(matches!(err, ModemError::DeviceGone), "{err:?}");
    assert_eq!(sim.cops_polls(), 0);
    assert!(!modem.link_state().transport_present);
}

#[tokio::test(start_paused = true)]
async fn registration_is_repeatable() {
    let (sim, modem) = setup(SimBehavior::default());

    let mut first = ConnectionInfo::default();
    modem.register_operator(&mut first).await.unwrap();
    let mut second = ConnectionInfo::default();
    modem.register_operator(&mut second).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(sim.cops_polls(), 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_polling() {
    let (tx, rx) = tokio::sync::watch::channel(false);
    let sim = Arc::new(SimulatedModem::new(never_registers()));
    let modem = Modem::with_shutdown(sim.clone(), ModemConfig::default(), Shutdown::new(rx));
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        let _ = tx.send(true);
        tx
    });
    let mut info = ConnectionInfo::default();

    let err = modem.register_operator(&mut info).await.unwrap_err();

    assert!(matches!(err, ModemError::Cancelled), "{err:?}");
    assert!(sim.cops_polls() < 8);
    drop(stopper.await.unwrap());
}

//! Notification Bridge.
//!
//! The network stack reports PPP link-phase changes and IP acquisition
//! out of band. Producers hold an [`EventSender`]; sending never blocks
//! and never fails visibly (a closed bridge just drops the event). The
//! bridge task applies each event to the [`StateRegister`].
//!
//! Phase and IP events race each other. The register, not the arrival
//! order, keeps the IP flag from outliving a non-`Running` phase: every
//! non-`Running` transition clears it unconditionally.
//!
//! The bridge never reconnects on its own. Errors are logged and clear
//! the IP flag; whether to reconnect is up to the caller of `connect()`.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::state::{LinkPhase, StateRegister};

/// Error sub-events of the PPP phase channel, by PPP error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PppError {
    /// `PPPERR_USER`: the session was closed locally.
    UserInterrupted,
    /// `PPPERR_CONNECT`
    ConnectFailed,
    /// `PPPERR_AUTHFAIL`
    AuthFailed,
    /// `PPPERR_PROTOCOL`
    ProtocolError,
    /// Any other PPP error code.
    Other(i32),
}

impl PppError {
    pub fn from_code(code: i32) -> Self {
        match code {
            5 => PppError::UserInterrupted,
            6 => PppError::ConnectFailed,
            7 => PppError::AuthFailed,
            8 => PppError::ProtocolError,
            other => PppError::Other(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            PppError::UserInterrupted => 5,
            PppError::ConnectFailed => 6,
            PppError::AuthFailed => 7,
            PppError::ProtocolError => 8,
            PppError::Other(code) => *code,
        }
    }
}

impl fmt::Display for PppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(ppp_error_name(self.code()))
    }
}

/// lwIP-style name of a PPP error code, for logs.
pub fn ppp_error_name(code: i32) -> &'static str {
    match code {
        0 => "PPPERR_NONE",
        1 => "PPPERR_PARAM",
        2 => "PPPERR_OPEN",
        3 => "PPPERR_DEVICE",
        4 => "PPPERR_ALLOC",
        5 => "PPPERR_USER",
        6 => "PPPERR_CONNECT",
        7 => "PPPERR_AUTHFAIL",
        8 => "PPPERR_PROTOCOL",
        9 => "PPPERR_PEERDEAD",
        10 => "PPPERR_IDLETIMEOUT",
        11 => "PPPERR_CONNECTTIME",
        12 => "PPPERR_LOOPBACK",
        _ => "PPPERR_UNKNOWN",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    Initialize,
    Establish,
    Running,
    Terminate,
    Disconnect,
    Error(PppError),
}

/// Addressing assigned by the peer when IPCP completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpInfo {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    /// Up to two name servers, primary first.
    pub dns: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpEvent {
    GotIp(IpInfo),
    LostIp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetifEvent {
    Phase(PhaseEvent),
    Ip(IpEvent),
}

/// Fire-and-forget handle for network-stack producers.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<NetifEvent>,
}

impl EventSender {
    pub fn phase(&self, event: PhaseEvent) {
        self.send(NetifEvent::Phase(event));
    }

    pub fn ip(&self, event: IpEvent) {
        self.send(NetifEvent::Ip(event));
    }

    pub fn send(&self, event: NetifEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("notification bridge closed, event dropped");
        }
    }
}

/// Addressing of the current PPP session, as last announced by Got-IP.
///
/// Emptied whenever the register drops the IP flag.
#[derive(Debug, Default)]
pub struct IpLease {
    current: Mutex<Option<IpInfo>>,
}

impl IpLease {
    pub fn get(&self) -> Option<IpInfo> {
        self.lock().clone()
    }

    /// Follow `event` after it has been applied to `register`.
    fn track(&self, register: &StateRegister, event: &NetifEvent) {
        let held = register.ip_acquired();
        let mut current = self.lock();
        match event {
            NetifEvent::Ip(IpEvent::GotIp(info)) if held => *current = Some(info.clone()),
            _ if !held => *current = None,
            _ => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<IpInfo>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct NotificationBridge {
    register: Arc<StateRegister>,
    lease: Arc<IpLease>,
    rx: mpsc::UnboundedReceiver<NetifEvent>,
}

impl NotificationBridge {
    /// Create a bridge over `register` and the sender that feeds it.
    pub fn new(register: Arc<StateRegister>) -> (Self, EventSender) {
        Self::with_lease(register, Arc::default())
    }

    /// Like [`NotificationBridge::new`], also recording addressing into `lease`.
    pub fn with_lease(register: Arc<StateRegister>, lease: Arc<IpLease>) -> (Self, EventSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { register, lease, rx }, EventSender { tx })
    }

    /// Consume events until every sender is dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            apply(&self.register, &event);
            self.lease.track(&self.register, &event);
        }
        tracing::debug!("notification bridge stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

/// Apply one notification to the register.
pub fn apply(register: &StateRegister, event: &NetifEvent) {
    match event {
        NetifEvent::Phase(phase) => apply_phase(register, *phase),
        NetifEvent::Ip(ip) => apply_ip(register, ip),
    }
}

fn apply_phase(register: &StateRegister, event: PhaseEvent) {
    match event {
        PhaseEvent::Initialize => {
            tracing::info!("PPP phase: initialize");
            register.set_phase(LinkPhase::Initialize);
        }
        PhaseEvent::Establish => {
            tracing::info!("PPP phase: establish");
            register.set_phase(LinkPhase::Establish);
        }
        PhaseEvent::Running => {
            // Some stacks report running before the IP event; take it as acquired.
            tracing::info!("PPP phase: running");
            register.set_running_with_ip();
        }
        PhaseEvent::Terminate => {
            tracing::info!("PPP phase: terminating");
            register.set_phase(LinkPhase::Terminating);
        }
        PhaseEvent::Disconnect => {
            tracing::info!("PPP phase: disconnected");
            register.set_phase(LinkPhase::Disconnected);
        }
        PhaseEvent::Error(err @ PppError::UserInterrupted) => {
            tracing::info!(code = err.code(), error = %err, "PPP session interrupted by user");
            register.clear_ip();
        }
        PhaseEvent::Error(err) => {
            tracing::error!(code = err.code(), error = %err, "PPP error");
            register.clear_ip();
        }
    }
}

fn apply_ip(register: &StateRegister, event: &IpEvent) {
    match event {
        IpEvent::GotIp(info) => {
            let dns = |i: usize| {
                info.dns
                    .get(i)
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "-".into())
            };
            tracing::info!(
                ip = %info.ip,
                netmask = %info.netmask,
                gateway = %info.gateway,
                dns1 = %dns(0),
                dns2 = %dns(1),
                "PPP got IP"
            );
            if !register.set_ip_acquired() {
                tracing::warn!(
                    phase = %register.phase(),
                    "IP event outside running phase ignored"
                );
            }
        }
        IpEvent::LostIp => {
            tracing::info!("PPP lost IP");
            register.clear_ip();
        }
    }
}

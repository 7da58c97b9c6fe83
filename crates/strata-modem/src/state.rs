//! Link State Register.
//!
//! Shared between the notification bridge (writer) and the orchestrator
//! and executor (readers/waiters). Phase, IP flag and transport presence
//! are packed into one atomic byte so every update is a single
//! read-modify-write and no partially applied state is ever observable:
//!
//! ```text
//!  bit 7..5   4              3             2..0
//!  unused     transport_gone ip_acquired   link phase
//! ```
//!
//! Invariants enforced here rather than by callers:
//! - `ip_acquired` can only be set while the phase is `Running`.
//! - every transition to a phase other than `Running` clears `ip_acquired`.
//! - `transport_gone` is a latch; nothing clears it.
//!
//! Waiters park on a [`Notify`] that is signalled after every change, so
//! [`StateRegister::wait_until`] never polls.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

const PHASE_MASK: u8 = 0b0000_0111;
const IP_ACQUIRED: u8 = 0b0000_1000;
const TRANSPORT_GONE: u8 = 0b0001_0000;

/// Link-phase of the packet-data session as reported by the network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPhase {
    Initialize,
    Establish,
    Running,
    Terminating,
    #[default]
    Disconnected,
}

impl LinkPhase {
    fn to_bits(self) -> u8 {
        match self {
            LinkPhase::Initialize => 0,
            LinkPhase::Establish => 1,
            LinkPhase::Running => 2,
            LinkPhase::Terminating => 3,
            LinkPhase::Disconnected => 4,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & PHASE_MASK {
            0 => LinkPhase::Initialize,
            1 => LinkPhase::Establish,
            2 => LinkPhase::Running,
            3 => LinkPhase::Terminating,
            _ => LinkPhase::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkPhase::Initialize => "initialize",
            LinkPhase::Establish => "establish",
            LinkPhase::Running => "running",
            LinkPhase::Terminating => "terminating",
            LinkPhase::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consistent snapshot of the register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkState {
    pub phase: LinkPhase,
    pub ip_acquired: bool,
    pub transport_present: bool,
}

impl LinkState {
    fn from_bits(bits: u8) -> Self {
        Self {
            phase: LinkPhase::from_bits(bits),
            ip_acquired: bits & IP_ACQUIRED != 0,
            transport_present: bits & TRANSPORT_GONE == 0,
        }
    }

    /// Connected and usable: IP present on a live transport.
    pub fn is_online(&self) -> bool {
        self.ip_acquired && self.transport_present
    }
}

pub struct StateRegister {
    bits: AtomicU8,
    changed: Notify,
}

impl StateRegister {
    pub fn new() -> Self {
        Self {
            bits: AtomicU8::new(LinkPhase::Disconnected.to_bits()),
            changed: Notify::new(),
        }
    }

    pub fn snapshot(&self) -> LinkState {
        LinkState::from_bits(self.bits.load(Ordering::Acquire))
    }

    pub fn phase(&self) -> LinkPhase {
        self.snapshot().phase
    }

    pub fn ip_acquired(&self) -> bool {
        self.snapshot().ip_acquired
    }

    pub fn transport_present(&self) -> bool {
        self.snapshot().transport_present
    }

    /// Record a phase transition. Any phase other than `Running` clears the IP flag.
    pub fn set_phase(&self, phase: LinkPhase) -> LinkState {
        self.update(|bits| {
            let mut next = (bits & !PHASE_MASK) | phase.to_bits();
            if phase != LinkPhase::Running {
                next &= !IP_ACQUIRED;
            }
            next
        })
    }

    /// Enter `Running` with the IP flag set, as one update.
    pub fn set_running_with_ip(&self) -> LinkState {
        self.update(|bits| (bits & !PHASE_MASK) | LinkPhase::Running.to_bits() | IP_ACQUIRED)
    }

    /// Set the IP flag. Ignored unless the phase is `Running`; returns whether it was applied.
    pub fn set_ip_acquired(&self) -> bool {
        let state = self.update(|bits| {
            if LinkPhase::from_bits(bits) == LinkPhase::Running {
                bits | IP_ACQUIRED
            } else {
                bits
            }
        });
        state.ip_acquired
    }

    pub fn clear_ip(&self) -> LinkState {
        self.update(|bits| bits & !IP_ACQUIRED)
    }

    /// Latch the transport as permanently gone.
    pub fn latch_transport_gone(&self) -> LinkState {
        self.update(|bits| bits | TRANSPORT_GONE)
    }

    /// Wait until `predicate` holds or `deadline` passes.
    ///
    /// Returns the satisfying snapshot, or the last snapshot on timeout.
    /// `None` waits without a deadline.
    pub async fn wait_until<F>(&self, predicate: F, deadline: Option<Instant>) -> Result<LinkState, LinkState>
    where
        F: Fn(&LinkState) -> bool,
    {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register interest before reading so a concurrent update can't slip between.
            notified.as_mut().enable();

            let state = self.snapshot();
            if predicate(&state) {
                return Ok(state);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        let state = self.snapshot();
                        return if predicate(&state) { Ok(state) } else { Err(state) };
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Resolves once the transport presence latch is set.
    pub async fn transport_gone(&self) {
        let _ = self.wait_until(|s| !s.transport_present, None).await;
    }

    fn update(&self, f: impl Fn(u8) -> u8) -> LinkState {
        let prev = self
            .bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| Some(f(bits)))
            .unwrap_or_else(|bits| bits);
        let next = f(prev);
        if next != prev {
            self.changed.notify_waiters();
        }
        LinkState::from_bits(next)
    }
}

impl Default for StateRegister {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StateRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateRegister").field(&self.snapshot()).finish()
    }
}

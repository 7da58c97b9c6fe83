//! Property tests for the link state register under arbitrary
//! notification sequences.
//!
//! The register is checked against a plain model after every event, and
//! the IP flag must never be set outside the `Running` phase.

use std::net::Ipv4Addr;

use proptest::prelude::*;
use strata_modem::bridge::{apply, IpEvent, IpInfo, NetifEvent, PhaseEvent, PppError};
use strata_modem::state::{LinkPhase, StateRegister};

#[derive(Debug, Clone)]
enum Step {
    Event(NetifEvent),
    Unplug,
}

fn phase_event() -> impl Strategy<Value = PhaseEvent> {
    prop_oneof![
        Just(PhaseEvent::Initialize),
        Just(PhaseEvent::Establish),
        Just(PhaseEvent::Running),
        Just(PhaseEvent::Terminate),
        Just(PhaseEvent::Disconnect),
        (0i32..16).prop_map(|code| PhaseEvent::Error(PppError::from_code(code))),
    ]
}

fn ip_event() -> impl Strategy<Value = IpEvent> {
    prop_oneof![
        any::<u32>().prop_map(|ip| IpEvent::GotIp(IpInfo {
            ip: Ipv4Addr::from(ip),
            netmask: Ipv4Addr::new(255, 255, 255, 255),
            gateway: Ipv4Addr::new(10, 64, 64, 64),
            dns: Vec::new(),
        })),
        Just(IpEvent::LostIp),
    ]
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        6 => phase_event().prop_map(|e| Step::Event(NetifEvent::Phase(e))),
        4 => ip_event().prop_map(|e| Step::Event(NetifEvent::Ip(e))),
        1 => Just(Step::Unplug),
    ]
}

#[derive(Debug, Clone, Copy)]
struct Model {
    phase: LinkPhase,
    ip: bool,
    present: bool,
}

impl Model {
    fn apply(&mut self, step: &Step) {
        match step {
            Step::Unplug => self.present = false,
            Step::Event(NetifEvent::Phase(event)) => match event {
                PhaseEvent::Initialize => self.enter(LinkPhase::Initialize),
                PhaseEvent::Establish => self.enter(LinkPhase::Establish),
                PhaseEvent::Terminate => self.enter(LinkPhase::Terminating),
                PhaseEvent::Disconnect => self.enter(LinkPhase::Disconnected),
                PhaseEvent::Running => {
                    self.phase = LinkPhase::Running;
                    self.ip = true;
                }
                PhaseEvent::Error(_) => self.ip = false,
            },
            Step::Event(NetifEvent::Ip(IpEvent::GotIp(_))) => {
                if self.phase == LinkPhase::Running {
                    self.ip = true;
                }
            }
            Step::Event(NetifEvent::Ip(IpEvent::LostIp)) => self.ip = false,
        }
    }

    fn enter(&mut self, phase: LinkPhase) {
        self.phase = phase;
        self.ip = false;
    }
}

proptest! {
    #[test]
    fn register_tracks_model(steps in prop::collection::vec(step(), 0..64)) {
        let register = StateRegister::new();
        let mut model = Model {
            phase: LinkPhase::Disconnected,
            ip: false,
            present: true,
        };

        for step in &steps {
            match step {
                Step::Event(event) => apply(&register, event),
                Step::Unplug => {
                    register.latch_transport_gone();
                }
            }
            model.apply(step);

            let s = register.snapshot();
            prop_assert_eq!(s.phase, model.phase);
            prop_assert_eq!(s.ip_acquired, model.ip);
            prop_assert_eq!(s.transport_present, model.present);
            prop_assert!(!s.ip_acquired || s.phase == LinkPhase::Running);
        }
    }

    #[test]
    fn presence_latch_never_resets(
        before in prop::collection::vec(step(), 0..16),
        after in prop::collection::vec(phase_event(), 0..32),
    ) {
        let register = StateRegister::new();
        for step in &before {
            if let Step::Event(event) = step {
                apply(&register, event);
            }
        }
        register.latch_transport_gone();
        for event in after {
            apply(&register, &NetifEvent::Phase(event));
            prop_assert!(!register.transport_present());
            prop_assert!(!register.snapshot().is_online());
        }
    }
}

//! PPP interface monitor.
//!
//! Bridges the kernel's view of the PPP interface (brought up by `pppd`
//! once the modem is in data mode) onto the notification channel. The
//! interface is polled rather than watched over netlink:
//!
//! ```text
//! absent ──appears──▶ present ──up + IPv4──▶ online
//!   ▲                    │  ▲                  │
//!   └────disappears──────┘  └───address lost───┘
//! ```
//!
//! `appears` emits `Establish`, `online` emits `Running` and `Got-IP`,
//! `address lost` emits `Lost-IP` and `disappears` emits `Disconnect`.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::bridge::{EventSender, IpEvent, IpInfo, NetifEvent, PhaseEvent};
use crate::modem::Shutdown;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const RESOLV_CONF_PATHS: [&str; 2] = ["/etc/ppp/resolv.conf", "/etc/resolv.conf"];

/// IPv4 addressing of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfaceAddr {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Point-to-point peer, used as the gateway.
    pub peer: Option<Ipv4Addr>,
}

/// One poll of the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Observation {
    pub present: bool,
    pub up: bool,
    pub addr: Option<IfaceAddr>,
}

impl Observation {
    fn online(&self) -> bool {
        self.present && self.up && self.addr.is_some()
    }
}

pub struct NetifMonitor {
    iface: String,
    events: EventSender,
    interval: Duration,
    sysfs_root: PathBuf,
}

impl NetifMonitor {
    pub fn new(iface: impl Into<String>, events: EventSender) -> Self {
        Self {
            iface: iface.into(),
            events,
            interval: POLL_INTERVAL,
            sysfs_root: PathBuf::from("/sys/class/net"),
        }
    }

    /// Poll until `shutdown` fires.
    pub async fn run(self, shutdown: Shutdown) {
        tracing::info!(iface = %self.iface, "PPP interface monitor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut prev = Observation::default();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.triggered() => break,
            }
            let next = self.observe();
            for event in transitions(&prev, &next, read_dns) {
                self.events.send(event);
            }
            prev = next;
        }
        tracing::debug!(iface = %self.iface, "PPP interface monitor stopped");
    }

    pub fn spawn(self, shutdown: Shutdown) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    fn observe(&self) -> Observation {
        let dir = self.sysfs_root.join(&self.iface);
        if !dir.exists() {
            return Observation::default();
        }
        let up = std::fs::read_to_string(dir.join("operstate"))
            .ok()
            .and_then(|s| parse_operstate(&s))
            .unwrap_or(false);
        Observation {
            present: true,
            up,
            addr: iface_ipv4(&self.iface),
        }
    }
}

/// Events implied by moving from `prev` to `next`.
///
/// `dns` is only consulted when an address is announced.
pub fn transitions(
    prev: &Observation,
    next: &Observation,
    dns: impl FnOnce() -> Vec<Ipv4Addr>,
) -> Vec<NetifEvent> {
    let mut events = Vec::new();
    if !prev.present && next.present {
        events.push(NetifEvent::Phase(PhaseEvent::Establish));
    }
    if prev.present && !next.present {
        events.push(NetifEvent::Phase(PhaseEvent::Disconnect));
        return events;
    }

    match (prev.online(), next.online(), next.addr) {
        (false, true, Some(addr)) => {
            events.push(NetifEvent::Phase(PhaseEvent::Running));
            events.push(NetifEvent::Ip(IpEvent::GotIp(ip_info(addr, dns()))));
        }
        (true, true, Some(addr)) if prev.addr != next.addr => {
            events.push(NetifEvent::Ip(IpEvent::GotIp(ip_info(addr, dns()))));
        }
        (true, false, _) => events.push(NetifEvent::Ip(IpEvent::LostIp)),
        _ => {}
    }
    events
}

fn ip_info(addr: IfaceAddr, dns: Vec<Ipv4Addr>) -> IpInfo {
    IpInfo {
        ip: addr.ip,
        netmask: addr.netmask,
        gateway: addr.peer.unwrap_or(Ipv4Addr::UNSPECIFIED),
        dns,
    }
}

/// `up`, and `unknown` (what ppp interfaces report while running), count as up.
fn parse_operstate(contents: &str) -> Option<bool> {
    match contents.trim() {
        "up" | "unknown" => Some(true),
        "down" | "dormant" | "lowerlayerdown" => Some(false),
        _ => None,
    }
}

/// Up to two IPv4 `nameserver` entries, in file order.
pub fn parse_resolv_conf(contents: &str) -> Vec<Ipv4Addr> {
    contents
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            match (words.next(), words.next()) {
                (Some("nameserver"), Some(addr)) => addr.parse().ok(),
                _ => None,
            }
        })
        .take(2)
        .collect()
}

fn read_dns() -> Vec<Ipv4Addr> {
    RESOLV_CONF_PATHS
        .iter()
        .filter_map(|p| std::fs::read_to_string(Path::new(p)).ok())
        .map(|s| parse_resolv_conf(&s))
        .find(|dns| !dns.is_empty())
        .unwrap_or_default()
}

/// First IPv4 address of `iface`, with netmask and point-to-point peer.
fn iface_ipv4(iface: &str) -> Option<IfaceAddr> {
    // SAFETY: the list returned by getifaddrs is only read before freeifaddrs.
    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return None;
        }

        let mut current = ifaddrs;
        let mut result = None;

        while !current.is_null() {
            let ifa = &*current;
            if !ifa.ifa_addr.is_null() {
                let name = std::ffi::CStr::from_ptr(ifa.ifa_name).to_string_lossy();
                if name == iface && (*ifa.ifa_addr).sa_family == libc::AF_INET as u16 {
                    let peer = if ifa.ifa_flags & libc::IFF_POINTOPOINT as u32 != 0 {
                        sockaddr_ipv4(ifa.ifa_ifu)
                    } else {
                        None
                    };
                    result = Some(IfaceAddr {
                        ip: sockaddr_ipv4(ifa.ifa_addr).unwrap_or(Ipv4Addr::UNSPECIFIED),
                        netmask: sockaddr_ipv4(ifa.ifa_netmask).unwrap_or(Ipv4Addr::UNSPECIFIED),
                        peer,
                    });
                    break;
                }
            }
            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
        result
    }
}

/// # Safety
/// `addr` must be null or point to a valid `sockaddr`.
unsafe fn sockaddr_ipv4(addr: *const libc::sockaddr) -> Option<Ipv4Addr> {
    if addr.is_null() || (*addr).sa_family != libc::AF_INET as u16 {
        return None;
    }
    let addr = &*(addr as *const libc::sockaddr_in);
    Some(Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn online(ip: [u8; 4]) -> Observation {
        Observation {
            present: true,
            up: true,
            addr: Some(IfaceAddr {
                ip: Ipv4Addr::from(ip),
                netmask: Ipv4Addr::new(255, 255, 255, 255),
                peer: Some(Ipv4Addr::new(10, 64, 64, 64)),
            }),
        }
    }

    fn no_dns() -> Vec<Ipv4Addr> {
        Vec::new()
    }

    #[test]
    fn test_parse_operstate() {
        assert_eq!(parse_operstate("up\n"), Some(true));
        assert_eq!(parse_operstate("unknown\n"), Some(true));
        assert_eq!(parse_operstate("down"), Some(false));
        assert_eq!(parse_operstate(""), None);
    }

    #[test]
    fn resolv_conf_takes_first_two_ipv4_servers() {
        let conf = "# generated by pppd\nnameserver 8.8.8.8\nnameserver ::1\nsearch lan\nnameserver 1.1.1.1\nnameserver 9.9.9.9\n";
        assert_eq!(
            parse_resolv_conf(conf),
            [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)]
        );
        assert!(parse_resolv_conf("").is_empty());
    }

    #[test]
    fn interface_coming_up_with_address_reports_running_and_ip() {
        let events = transitions(&Observation::default(), &online([10, 1, 2, 3]), || {
            vec![Ipv4Addr::new(8, 8, 8, 8)]
        });
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], NetifEvent::Phase(PhaseEvent::Establish));
        assert_eq!(events[1], NetifEvent::Phase(PhaseEvent::Running));
        match &events[2] {
            NetifEvent::Ip(IpEvent::GotIp(info)) => {
                assert_eq!(info.ip, Ipv4Addr::new(10, 1, 2, 3));
                assert_eq!(info.gateway, Ipv4Addr::new(10, 64, 64, 64));
                assert_eq!(info.dns, [Ipv4Addr::new(8, 8, 8, 8)]);
            }
            other => panic!("expected GotIp, got {other:?}"),
        }
    }

    #[test]
    fn present_without_address_is_only_establish() {
        let next = Observation {
            present: true,
            up: false,
            addr: None,
        };
        assert_eq!(
            transitions(&Observation::default(), &next, no_dns),
            [NetifEvent::Phase(PhaseEvent::Establish)]
        );
    }

    #[test]
    fn address_loss_and_interface_removal() {
        let up = online([10, 1, 2, 3]);
        let down = Observation {
            addr: None,
            ..up
        };
        assert_eq!(
            transitions(&up, &down, no_dns),
            [NetifEvent::Ip(IpEvent::LostIp)]
        );
        assert_eq!(
            transitions(&up, &Observation::default(), no_dns),
            [NetifEvent::Phase(PhaseEvent::Disconnect)]
        );
    }

    #[test]
    fn readdressing_announces_new_ip_only() {
        let events = transitions(&online([10, 1, 2, 3]), &online([10, 9, 9, 9]), no_dns);
        assert!(matches!(
            events.as_slice(),
            [NetifEvent::Ip(IpEvent::GotIp(info))] if info.ip == Ipv4Addr::new(10, 9, 9, 9)
        ));
        assert!(transitions(&online([10, 1, 2, 3]), &online([10, 1, 2, 3]), no_dns).is_empty());
    }

    #[test]
    fn missing_interface_has_no_address() {
        assert!(iface_ipv4("strata-no-such-if0").is_none());
    }
}

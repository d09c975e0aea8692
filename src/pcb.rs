//! Per-(interface, address-family) protocol control blocks and the probe /
//! announce state machine bookkeeping.

use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use embassy_time::Duration;

use crate::MAX_SERVICES;

/// Address family of a PCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub(crate) const fn index(&self) -> usize {
        match self {
            Self::V4 => 0,
            Self::V6 => 1,
        }
    }

    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

/// Responder state of one PCB.
///
/// `Probe(n)` / `Announce(n)` mean the n-th probe / announcement is the
/// next transmission; after the third announcement goes out the PCB is
/// `Running`. `Dup` is the silent state of an interface whose subnet peer
/// owns the responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcbState {
    Off,
    Init,
    Probe(u8),
    Announce(u8),
    Running,
    Dup,
}

impl PcbState {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Off)
    }

    pub fn is_probing(&self) -> bool {
        matches!(self, Self::Init | Self::Probe(_))
    }

    /// Past the third probe: allowed to answer queries.
    pub fn after_probes(&self) -> bool {
        matches!(self, Self::Announce(_) | Self::Running)
    }
}

/// Gap between successive probes.
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_millis(250);
/// Gap between successive announcements.
pub(crate) const ANNOUNCE_INTERVAL: Duration = Duration::from_millis(1000);
/// Base retry delay after a lost probe tiebreak.
pub(crate) const PROBE_RETRY_BASE: Duration = Duration::from_millis(120);
/// Retry delay base once probing keeps failing.
pub(crate) const PROBE_RETRY_SLOW: Duration = Duration::from_millis(1000);
/// Probe attempts after which the retry delay backs off.
pub(crate) const PROBE_FAIL_FAST_LIMIT: u8 = 5;

/// One protocol control block.
#[derive(Debug, Clone)]
pub struct Pcb {
    pub state: PcbState,
    /// Service ids being probed on this PCB.
    pub(crate) probe_services: heapless::Vec<u16, MAX_SERVICES>,
    /// The hostname (and thus our A/AAAA records) is part of the probe.
    pub(crate) probe_ip: bool,
    pub(crate) failed_probes: u8,
}

impl Pcb {
    pub(crate) const fn new() -> Self {
        Self {
            state: PcbState::Off,
            probe_services: heapless::Vec::new(),
            probe_ip: false,
            failed_probes: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.state = PcbState::Off;
        self.probe_services.clear();
        self.probe_ip = false;
        self.failed_probes = 0;
    }

    pub(crate) fn merge_probe_services(&mut self, ids: &[u16]) {
        for id in ids {
            if !self.probe_services.contains(id) {
                self.probe_services.push(*id).ok();
            }
        }
    }
}

/// One entry of the static interface table.
#[derive(Debug, Clone)]
pub struct Netif {
    pub v4: Option<(Ipv4Addr, Ipv4Addr)>,
    pub v6: Option<Ipv6Addr>,
    /// Index of the interface this one duplicates (same IPv4 subnet); the
    /// peer owns all responses while this is set.
    pub(crate) duplicate_of: Option<u8>,
    pub(crate) pcbs: [Pcb; 2],
}

impl Netif {
    pub(crate) const fn new() -> Self {
        Self {
            v4: None,
            v6: None,
            duplicate_of: None,
            pcbs: [Pcb::new(), Pcb::new()],
        }
    }

    pub fn pcb(&self, family: Family) -> &Pcb {
        &self.pcbs[family.index()]
    }

    pub(crate) fn pcb_mut(&mut self, family: Family) -> &mut Pcb {
        &mut self.pcbs[family.index()]
    }

    pub fn addr(&self, family: Family) -> Option<IpAddr> {
        match family {
            Family::V4 => self.v4.map(|(addr, _)| IpAddr::V4(addr)),
            Family::V6 => self.v6.map(IpAddr::V6),
        }
    }

    /// Both interfaces configured on the same IPv4 subnet.
    pub(crate) fn same_v4_subnet(&self, other: &Netif) -> bool {
        match (self.v4, other.v4) {
            (Some((a, mask)), Some((b, _))) => {
                u32::from(a) & u32::from(mask) == u32::from(b) & u32::from(mask)
            }
            _ => false,
        }
    }
}

/// Interface lifecycle events fed by the network-interface collaborator.
#[derive(Debug, Clone)]
pub enum NetifAction {
    /// The interface came up with an IPv4 address (and netmask, used for
    /// subnet-duplicate detection).
    EnableV4 { addr: Ipv4Addr, mask: Ipv4Addr },
    /// The interface came up with an IPv6 address.
    EnableV6 { addr: Ipv6Addr },
    /// The address for the family went away.
    Disable(Family),
    /// Re-announce all records for the family.
    Announce(Family),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_predicates() {
        assert!(!PcbState::Off.is_enabled());
        assert!(PcbState::Init.is_probing());
        assert!(PcbState::Probe(3).is_probing());
        assert!(!PcbState::Probe(3).after_probes());
        assert!(PcbState::Announce(1).after_probes());
        assert!(PcbState::Running.after_probes());
        assert!(!PcbState::Dup.is_probing());
    }

    #[test]
    fn subnet_comparison() {
        let mut a = Netif::new();
        let mut b = Netif::new();

        a.v4 = Some((
            Ipv4Addr::new(192, 168, 1, 10),
            Ipv4Addr::new(255, 255, 255, 0),
        ));
        b.v4 = Some((
            Ipv4Addr::new(192, 168, 1, 20),
            Ipv4Addr::new(255, 255, 255, 0),
        ));
        assert!(a.same_v4_subnet(&b));

        b.v4 = Some((
            Ipv4Addr::new(192, 168, 2, 20),
            Ipv4Addr::new(255, 255, 255, 0),
        ));
        assert!(!a.same_v4_subnet(&b));

        b.v4 = None;
        assert!(!a.same_v4_subnet(&b));
    }

    #[test]
    fn probe_service_merge_dedupes() {
        let mut pcb = Pcb::new();

        pcb.merge_probe_services(&[1, 2]);
        pcb.merge_probe_services(&[2, 3]);

        assert_eq!(pcb.probe_services.as_slice(), &[1, 2, 3]);
    }
}

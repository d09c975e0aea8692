//! Outbound packets: compact record descriptors resolved against the data
//! model at encode time, and the time-ordered transmission queue that
//! drives the responder state machine.

use core::fmt::Write;
use core::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use embassy_time::Instant;

use crate::host::{write_txt_rdata, DelegatedHost, Service};
use crate::pcb::Family;
use crate::query::Search;
use crate::wire::{
    self, begin_record, end_record, write_question, BytesOut, Name, RecordType, CACHE_FLUSH,
    CLASS_IN, UNICAST_RESPONSE,
};
use crate::{
    Error, MAX_SERVICES, MAX_SUBTYPES, MULTICAST_IPV4, MULTICAST_IPV6, PORT, TX_QUEUE_DEPTH,
};

/// Default TTL of shared records (PTR, TXT, reverse PTR).
pub const TTL_SHARED: u32 = 4500;
/// Default TTL of host-specific records (SRV, A, AAAA).
pub const TTL_HOST: u32 = 120;

pub(crate) const ANSWERS_CAP: usize = MAX_SERVICES * 4 + MAX_SUBTYPES * 2 + 4;
pub(crate) const SERVERS_CAP: usize = MAX_SERVICES + 1;
pub(crate) const ADDITIONAL_CAP: usize = MAX_SERVICES * 2 + 4;
pub(crate) const QUESTIONS_CAP: usize = MAX_SERVICES + 2;

/// Identifier of a scheduled transmission; carried by `Action::TxHandle`.
pub type PacketId = u16;

/// Which host a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostRef {
    /// The self host; addresses come from the interface table.
    Own,
    /// A delegated host, by id.
    Delegated(u16),
}

/// The address a reverse PTR answers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReverseAddr {
    OwnV4,
    OwnV6,
    /// Index into the delegated host's address list.
    Delegated(u8),
}

/// A record descriptor. The owner names, addresses and TXT data are
/// looked up in the data model when the packet is encoded, so a record
/// whose service disappeared in the meantime is simply skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxRecordKind {
    /// `<svc>.<proto>.local PTR <instance>.<svc>.<proto>.local`
    ServicePtr { service: u16 },
    /// `<sub>._sub.<svc>.<proto>.local PTR <instance>.<svc>.<proto>.local`
    SubPtr { service: u16, subtype: u8 },
    /// `_services._dns-sd._udp.local PTR <svc>.<proto>.local`
    Sdptr { service: u16 },
    Srv { service: u16 },
    Txt { service: u16 },
    HostA { host: HostRef },
    HostAaaa { host: HostRef },
    /// `<reversed-addr>.in-addr.arpa PTR <hostname>.local`
    ReversePtr { host: HostRef, addr: ReverseAddr },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TxRecord {
    pub kind: TxRecordKind,
    /// Goodbye: emit with TTL 0.
    pub bye: bool,
    /// Set the cache-flush bit.
    pub flush: bool,
}

impl TxRecord {
    pub(crate) fn new(kind: TxRecordKind) -> Self {
        Self {
            kind,
            bye: false,
            flush: false,
        }
    }

    pub(crate) fn flush(kind: TxRecordKind) -> Self {
        Self {
            kind,
            bye: false,
            flush: true,
        }
    }

    pub(crate) fn bye(kind: TxRecordKind) -> Self {
        Self {
            kind,
            bye: true,
            flush: false,
        }
    }
}

/// Questions synthesized from our own state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxQuestion {
    /// ANY probe question for a service instance name.
    ProbeService(u16),
    /// ANY probe question for our hostname.
    ProbeHost,
    /// The question of an active one-shot search.
    Search(u8),
    /// The question of an active browse.
    Browse(u8),
}

/// An inbound legacy question echoed back in the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EchoQuestion {
    pub name: Name,
    pub rtype: u16,
}

/// A scheduled transmission.
#[derive(Debug, Clone)]
pub(crate) struct TxPacket {
    pub id: PacketId,
    pub netif: u8,
    pub family: Family,
    /// Unicast destination; `None` targets the multicast group.
    pub dst: Option<SocketAddr>,
    /// Transaction id on the wire (echoed for legacy replies).
    pub wire_id: u16,
    pub flags: u16,
    pub probe: bool,
    /// Part of the announcement train; drives Announce(n) advancement.
    pub announce: bool,
    /// Carries goodbyes for deleted services; purges them once sent.
    pub goodbye: bool,
    pub legacy: bool,
    pub questions: heapless::Vec<TxQuestion, QUESTIONS_CAP>,
    pub echo_questions: heapless::Vec<EchoQuestion, 4>,
    pub answers: heapless::Vec<TxRecord, ANSWERS_CAP>,
    pub servers: heapless::Vec<TxRecord, SERVERS_CAP>,
    pub additional: heapless::Vec<TxRecord, ADDITIONAL_CAP>,
    pub send_at: Instant,
    pub queued: bool,
}

impl TxPacket {
    pub(crate) fn new(netif: u8, family: Family) -> Self {
        Self {
            id: 0,
            netif,
            family,
            dst: None,
            wire_id: 0,
            flags: 0,
            probe: false,
            announce: false,
            goodbye: false,
            legacy: false,
            questions: heapless::Vec::new(),
            echo_questions: heapless::Vec::new(),
            answers: heapless::Vec::new(),
            servers: heapless::Vec::new(),
            additional: heapless::Vec::new(),
            send_at: Instant::from_ticks(0),
            queued: false,
        }
    }

    pub(crate) fn target(&self) -> SocketAddr {
        self.dst.unwrap_or(match self.family {
            Family::V4 => SocketAddr::new(IpAddr::V4(MULTICAST_IPV4), PORT),
            Family::V6 => SocketAddr::new(IpAddr::V6(MULTICAST_IPV6), PORT),
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.questions.is_empty()
            && self.echo_questions.is_empty()
            && self.answers.is_empty()
            && self.servers.is_empty()
            && self.additional.is_empty()
    }
}

/// The transmission queue, kept ordered by send-at time ascending with
/// FIFO order among equal times.
#[derive(Debug, Default)]
pub(crate) struct TxQueue {
    packets: heapless::Vec<TxPacket, TX_QUEUE_DEPTH>,
    next_id: PacketId,
}

impl TxQueue {
    pub(crate) const fn new() -> Self {
        Self {
            packets: heapless::Vec::new(),
            next_id: 1,
        }
    }

    /// Insert a packet to go out at `send_at`.
    pub(crate) fn schedule(
        &mut self,
        mut packet: TxPacket,
        send_at: Instant,
    ) -> Result<PacketId, Error> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);

        packet.id = id;
        packet.send_at = send_at;
        packet.queued = false;

        let index = self
            .packets
            .iter()
            .position(|p| p.send_at > send_at)
            .unwrap_or(self.packets.len());

        self.packets
            .insert(index, packet)
            .map_err(|_| Error::Overflow)?;

        Ok(id)
    }

    /// Put an already-numbered packet back (probe → probe reschedule).
    pub(crate) fn reinsert(&mut self, mut packet: TxPacket) -> Result<(), Error> {
        packet.queued = false;

        let index = self
            .packets
            .iter()
            .position(|p| p.send_at > packet.send_at)
            .unwrap_or(self.packets.len());

        self.packets
            .insert(index, packet)
            .map_err(|_| Error::Overflow)
    }

    /// The earliest due packet not yet claimed by the scheduler; marks it
    /// claimed.
    pub(crate) fn mark_due(&mut self, now: Instant) -> Option<PacketId> {
        for packet in self.packets.iter_mut() {
            if packet.send_at > now {
                break;
            }

            if !packet.queued {
                packet.queued = true;
                return Some(packet.id);
            }
        }

        None
    }

    pub(crate) fn unmark(&mut self, id: PacketId) {
        if let Some(packet) = self.get_mut(id) {
            packet.queued = false;
        }
    }

    pub(crate) fn get(&self, id: PacketId) -> Option<&TxPacket> {
        self.packets.iter().find(|p| p.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: PacketId) -> Option<&mut TxPacket> {
        self.packets.iter_mut().find(|p| p.id == id)
    }

    pub(crate) fn remove(&mut self, id: PacketId) -> Option<TxPacket> {
        let index = self.packets.iter().position(|p| p.id == id)?;

        Some(self.packets.remove(index))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub(crate) fn next_send_at(&self) -> Option<Instant> {
        self.packets
            .iter()
            .filter(|p| !p.queued)
            .map(|p| p.send_at)
            .next()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut TxPacket> {
        self.packets.iter_mut()
    }

    pub(crate) fn retain(&mut self, f: impl FnMut(&TxPacket) -> bool) {
        self.packets.retain(f);
    }

    #[cfg(test)]
    pub(crate) fn packets(&self) -> &[TxPacket] {
        &self.packets
    }
}

/// Everything the encoder needs to resolve record descriptors.
pub(crate) struct ModelView<'a> {
    pub hostname: &'a str,
    pub instance: Option<&'a str>,
    pub services: &'a [Service],
    pub delegated: &'a [DelegatedHost],
    /// Addresses of the packet's origin interface.
    pub v4: Option<Ipv4Addr>,
    pub v6: Option<Ipv6Addr>,
    pub searches: &'a [Option<Search>],
    pub browses: &'a [Option<Search>],
}

impl<'a> ModelView<'a> {
    fn service(&self, id: u16) -> Option<&'a Service> {
        self.services.iter().find(|s| s.id == id)
    }

    fn delegated_host(&self, id: u16) -> Option<&'a DelegatedHost> {
        self.delegated.iter().find(|h| h.id == id)
    }

    fn effective_instance(&self, service: &'a Service) -> &'a str {
        service
            .instance
            .as_deref()
            .or(self.instance)
            .unwrap_or(self.hostname)
    }

    fn host_labels(&self, host: HostRef) -> Option<[&'a str; 2]> {
        match host {
            HostRef::Own => Some([self.hostname, "local"]),
            HostRef::Delegated(id) => {
                self.delegated_host(id).map(|h| [h.hostname.as_str(), "local"])
            }
        }
    }
}

/// Encode a packet into `buf`, resolving every descriptor against the
/// model. Returns the number of bytes written; an empty result means
/// every descriptor went stale and nothing is worth sending.
pub(crate) fn encode_packet(
    view: &ModelView<'_>,
    packet: &TxPacket,
    buf: &mut [u8],
) -> Result<usize, Error> {
    let mut out = BytesOut::new(buf);

    wire::Header {
        id: packet.wire_id,
        flags: packet.flags,
        ..Default::default()
    }
    .encode(&mut out)
    .map_err(Error::Wire)?;

    let mut questions = 0u16;
    let mut answers = 0u16;

    for question in &packet.questions {
        questions += write_tx_question(view, &mut out, question)?;
    }

    for question in &packet.echo_questions {
        let labels = question.name.labels();
        write_question(&mut out, &labels, question.rtype, CLASS_IN).map_err(Error::Wire)?;
        questions += 1;
    }

    // Known-answer lists ride in the answer section of query packets
    for question in &packet.questions {
        let search = match question {
            TxQuestion::Search(id) => view.searches.get(*id as usize),
            TxQuestion::Browse(id) => view.browses.get(*id as usize),
            _ => None,
        };

        if let Some(Some(search)) = search {
            if search.spec.rtype == RecordType::Ptr {
                if let (Some(service), Some(proto)) = (&search.spec.service, search.spec.proto) {
                    for result in &search.results {
                        let frame = begin_record(
                            &mut out,
                            &[service.as_str(), proto.as_str(), "local"],
                            RecordType::Ptr.into(),
                            CLASS_IN,
                            result.ttl,
                        )
                        .map_err(Error::Wire)?;
                        wire::write_fqdn(
                            &mut out,
                            &[result.instance.as_str(), service.as_str(), proto.as_str(), "local"],
                            true,
                        )
                        .map_err(Error::Wire)?;
                        end_record(&mut out, frame);
                        answers += 1;
                    }
                }
            }
        }
    }

    for record in &packet.answers {
        answers += write_tx_record(view, &mut out, record)?;
    }

    let mut servers = 0u16;
    for record in &packet.servers {
        servers += write_tx_record(view, &mut out, record)?;
    }

    let mut additional = 0u16;
    for record in &packet.additional {
        additional += write_tx_record(view, &mut out, record)?;
    }

    if questions == 0 && answers == 0 && servers == 0 && additional == 0 {
        return Ok(0);
    }

    out.set_u16_at(4, questions);
    out.set_u16_at(6, answers);
    out.set_u16_at(8, servers);
    out.set_u16_at(10, additional);

    Ok(out.len())
}

fn write_tx_question(
    view: &ModelView<'_>,
    out: &mut BytesOut<'_>,
    question: &TxQuestion,
) -> Result<u16, Error> {
    let written = match question {
        TxQuestion::ProbeService(id) => match view.service(*id) {
            Some(service) => {
                write_question(
                    out,
                    &[
                        view.effective_instance(service),
                        service.service.as_str(),
                        service.proto.as_str(),
                        "local",
                    ],
                    RecordType::Any.into(),
                    CLASS_IN | UNICAST_RESPONSE,
                )
                .map_err(Error::Wire)?;

                1
            }
            None => 0,
        },
        TxQuestion::ProbeHost => {
            write_question(
                out,
                &[view.hostname, "local"],
                RecordType::Any.into(),
                CLASS_IN | UNICAST_RESPONSE,
            )
            .map_err(Error::Wire)?;

            1
        }
        TxQuestion::Search(id) | TxQuestion::Browse(id) => {
            let search = if matches!(question, TxQuestion::Search(_)) {
                view.searches.get(*id as usize)
            } else {
                view.browses.get(*id as usize)
            };

            match search {
                Some(Some(search)) => {
                    let spec = &search.spec;
                    let class = CLASS_IN | if spec.unicast { UNICAST_RESPONSE } else { 0 };

                    let mut labels = heapless::Vec::<&str, 4>::new();

                    match spec.rtype {
                        RecordType::A | RecordType::Aaaa => {
                            let Some(host) = spec.instance.as_deref() else {
                                return Ok(0);
                            };
                            labels.extend([host, "local"]);
                        }
                        _ => {
                            let (Some(service), Some(proto)) = (spec.service.as_deref(), spec.proto)
                            else {
                                return Ok(0);
                            };

                            if let Some(instance) = spec.instance.as_deref() {
                                if spec.rtype != RecordType::Ptr {
                                    labels.push(instance).ok();
                                }
                            }
                            labels.extend([service, proto.as_str(), "local"]);
                        }
                    }

                    write_question(out, &labels, spec.rtype.into(), class).map_err(Error::Wire)?;

                    1
                }
                _ => 0,
            }
        }
    };

    Ok(written)
}

fn write_tx_record(
    view: &ModelView<'_>,
    out: &mut BytesOut<'_>,
    record: &TxRecord,
) -> Result<u16, Error> {
    let class = CLASS_IN | if record.flush { CACHE_FLUSH } else { 0 };
    let shared_ttl = if record.bye { 0 } else { TTL_SHARED };
    let host_ttl = if record.bye { 0 } else { TTL_HOST };

    let written = match record.kind {
        TxRecordKind::ServicePtr { service } => match view.service(service) {
            Some(svc) => {
                let frame = begin_record(
                    out,
                    &[svc.service.as_str(), svc.proto.as_str(), "local"],
                    RecordType::Ptr.into(),
                    class,
                    shared_ttl,
                )
                .map_err(Error::Wire)?;
                wire::write_fqdn(
                    out,
                    &[
                        view.effective_instance(svc),
                        svc.service.as_str(),
                        svc.proto.as_str(),
                        "local",
                    ],
                    true,
                )
                .map_err(Error::Wire)?;
                end_record(out, frame);

                1
            }
            None => 0,
        },
        TxRecordKind::SubPtr { service, subtype } => match view.service(service) {
            Some(svc) => match svc.subtypes.get(subtype as usize) {
                Some(sub) => {
                    let frame = begin_record(
                        out,
                        &[sub.as_str(), "_sub", svc.service.as_str(), svc.proto.as_str(), "local"],
                        RecordType::Ptr.into(),
                        class,
                        shared_ttl,
                    )
                    .map_err(Error::Wire)?;
                    wire::write_fqdn(
                        out,
                        &[
                            view.effective_instance(svc),
                            svc.service.as_str(),
                            svc.proto.as_str(),
                            "local",
                        ],
                        true,
                    )
                    .map_err(Error::Wire)?;
                    end_record(out, frame);

                    1
                }
                None => 0,
            },
            None => 0,
        },
        TxRecordKind::Sdptr { service } => match view.service(service) {
            Some(svc) => {
                let frame = begin_record(
                    out,
                    &["_services", "_dns-sd", "_udp", "local"],
                    RecordType::Ptr.into(),
                    class,
                    shared_ttl,
                )
                .map_err(Error::Wire)?;
                wire::write_fqdn(out, &[svc.service.as_str(), svc.proto.as_str(), "local"], true)
                    .map_err(Error::Wire)?;
                end_record(out, frame);

                1
            }
            None => 0,
        },
        TxRecordKind::Srv { service } => match view.service(service) {
            Some(svc) => {
                let target = match &svc.hostname {
                    Some(hostname) => [hostname.as_str(), "local"],
                    None => [view.hostname, "local"],
                };

                let frame = begin_record(
                    out,
                    &[
                        view.effective_instance(svc),
                        svc.service.as_str(),
                        svc.proto.as_str(),
                        "local",
                    ],
                    RecordType::Srv.into(),
                    class,
                    host_ttl,
                )
                .map_err(Error::Wire)?;
                out.u16(svc.priority)
                    .and_then(|out| out.u16(svc.weight))
                    .and_then(|out| out.u16(svc.port))
                    .map_err(Error::Wire)?;
                wire::write_fqdn(out, &target, true).map_err(Error::Wire)?;
                end_record(out, frame);

                1
            }
            None => 0,
        },
        TxRecordKind::Txt { service } => match view.service(service) {
            Some(svc) => {
                let frame = begin_record(
                    out,
                    &[
                        view.effective_instance(svc),
                        svc.service.as_str(),
                        svc.proto.as_str(),
                        "local",
                    ],
                    RecordType::Txt.into(),
                    class,
                    shared_ttl,
                )
                .map_err(Error::Wire)?;
                write_txt_rdata(&svc.txt, out).map_err(Error::Wire)?;
                end_record(out, frame);

                1
            }
            None => 0,
        },
        TxRecordKind::HostA { host } => {
            let Some(labels) = view.host_labels(host) else {
                return Ok(0);
            };

            let mut written = 0;
            let addrs: heapless::Vec<Ipv4Addr, { crate::MAX_ADDRS }> = match host {
                HostRef::Own => view.v4.into_iter().collect(),
                HostRef::Delegated(id) => view
                    .delegated_host(id)
                    .map(|h| {
                        h.addrs
                            .iter()
                            .filter_map(|a| match a {
                                IpAddr::V4(v4) => Some(*v4),
                                IpAddr::V6(_) => None,
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            };

            for addr in addrs {
                let frame = begin_record(out, &labels, RecordType::A.into(), class, host_ttl)
                    .map_err(Error::Wire)?;
                out.push(&addr.octets()).map_err(Error::Wire)?;
                end_record(out, frame);
                written += 1;
            }

            written
        }
        TxRecordKind::HostAaaa { host } => {
            let Some(labels) = view.host_labels(host) else {
                return Ok(0);
            };

            let mut written = 0;
            let addrs: heapless::Vec<Ipv6Addr, { crate::MAX_ADDRS }> = match host {
                HostRef::Own => view.v6.into_iter().collect(),
                HostRef::Delegated(id) => view
                    .delegated_host(id)
                    .map(|h| {
                        h.addrs
                            .iter()
                            .filter_map(|a| match a {
                                IpAddr::V6(v6) => Some(*v6),
                                IpAddr::V4(_) => None,
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            };

            for addr in addrs {
                let frame = begin_record(out, &labels, RecordType::Aaaa.into(), class, host_ttl)
                    .map_err(Error::Wire)?;
                out.push(&addr.octets()).map_err(Error::Wire)?;
                end_record(out, frame);
                written += 1;
            }

            written
        }
        TxRecordKind::ReversePtr { host, addr } => {
            let Some(labels) = view.host_labels(host) else {
                return Ok(0);
            };

            let addr = match (host, addr) {
                (_, ReverseAddr::OwnV4) => view.v4.map(IpAddr::V4),
                (_, ReverseAddr::OwnV6) => view.v6.map(IpAddr::V6),
                (HostRef::Delegated(id), ReverseAddr::Delegated(index)) => view
                    .delegated_host(id)
                    .and_then(|h| h.addrs.get(index as usize))
                    .copied(),
                _ => None,
            };

            match addr {
                Some(addr) => {
                    write_reverse_owner(out, &addr).map_err(Error::Wire)?;
                    out.u16(RecordType::Ptr.into())
                        .and_then(|out| out.u16(class))
                        .and_then(|out| out.u32(shared_ttl))
                        .map_err(Error::Wire)?;

                    let frame = wire::RecordFrame::open(out).map_err(Error::Wire)?;
                    wire::write_fqdn(out, &labels, true).map_err(Error::Wire)?;
                    end_record(out, frame);

                    1
                }
                None => 0,
            }
        }
    };

    Ok(written)
}

/// Write the `d.c.b.a.in-addr.arpa` / nibble `ip6.arpa` owner for an
/// address. Reverse owners are never compressed.
fn write_reverse_owner(out: &mut BytesOut<'_>, addr: &IpAddr) -> Result<(), wire::Error> {
    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            let mut bufs: [heapless::String<3>; 4] = Default::default();

            for (index, buf) in bufs.iter_mut().enumerate() {
                write!(buf, "{}", octets[3 - index]).ok();
            }

            let labels = [
                bufs[0].as_str(),
                bufs[1].as_str(),
                bufs[2].as_str(),
                bufs[3].as_str(),
                "in-addr",
                "arpa",
            ];

            wire::write_fqdn(out, &labels, false)
        }
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            let mut bufs: [heapless::String<1>; 32] = Default::default();

            for (index, buf) in bufs.iter_mut().enumerate() {
                let pos = 31 - index;
                let nibble = if pos % 2 == 0 {
                    octets[pos / 2] >> 4
                } else {
                    octets[pos / 2] & 0xf
                };
                write!(buf, "{:x}", nibble).ok();
            }

            let mut labels = heapless::Vec::<&str, 34>::new();
            for buf in &bufs {
                labels.push(buf).ok();
            }
            labels.push("ip6").ok();
            labels.push("arpa").ok();

            wire::write_fqdn(out, &labels, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::wire::{read_record, BytesIn, RData, HEADER_SIZE};

    fn service(id: u16) -> Service {
        Service {
            id,
            deleted: false,
            instance: None,
            service: crate::NameString::try_from("_http").unwrap(),
            proto: crate::host::Proto::Tcp,
            hostname: None,
            port: 80,
            priority: 0,
            weight: 0,
            txt: heapless::Vec::new(),
            subtypes: heapless::Vec::new(),
        }
    }

    fn view<'a>(services: &'a [Service]) -> ModelView<'a> {
        ModelView {
            hostname: "alpha",
            instance: None,
            services,
            delegated: &[],
            v4: Some(Ipv4Addr::new(192, 0, 2, 1)),
            v6: None,
            searches: &[],
            browses: &[],
        }
    }

    #[test]
    fn queue_is_ordered_and_fifo_among_equals() {
        let mut queue = TxQueue::new();

        let at = |ms| Instant::from_millis(ms);
        let a = queue.schedule(TxPacket::new(0, Family::V4), at(300)).unwrap();
        let b = queue.schedule(TxPacket::new(0, Family::V4), at(100)).unwrap();
        let c = queue.schedule(TxPacket::new(0, Family::V4), at(300)).unwrap();
        let d = queue.schedule(TxPacket::new(0, Family::V4), at(200)).unwrap();

        let order: heapless::Vec<PacketId, 4> = queue.packets().iter().map(|p| p.id).collect();
        assert_eq!(order.as_slice(), &[b, d, a, c]);

        let mut send_at = None;
        for packet in queue.packets() {
            assert!(send_at.map(|at| packet.send_at >= at).unwrap_or(true));
            send_at = Some(packet.send_at);
        }
    }

    #[test]
    fn mark_due_claims_in_order_once() {
        let mut queue = TxQueue::new();

        let at = |ms| Instant::from_millis(ms);
        let a = queue.schedule(TxPacket::new(0, Family::V4), at(100)).unwrap();
        let b = queue.schedule(TxPacket::new(0, Family::V4), at(200)).unwrap();
        queue.schedule(TxPacket::new(0, Family::V4), at(900)).unwrap();

        assert_eq!(queue.mark_due(at(250)), Some(a));
        assert_eq!(queue.mark_due(at(250)), Some(b));
        assert_eq!(queue.mark_due(at(250)), None);

        queue.unmark(b);
        assert_eq!(queue.mark_due(at(250)), Some(b));
    }

    #[test]
    fn encode_goodbye_ptr_has_zero_ttl() {
        let services = [service(7)];
        let view = view(&services);

        let mut packet = TxPacket::new(0, Family::V4);
        packet.flags = wire::AUTHORITATIVE_RESPONSE;
        packet
            .answers
            .push(TxRecord::bye(TxRecordKind::ServicePtr { service: 7 }))
            .unwrap();

        let mut buf = [0; crate::MAX_PACKET_SIZE];
        let len = encode_packet(&view, &packet, &mut buf).unwrap();
        assert!(len > HEADER_SIZE);

        let mut bytes = BytesIn::new(&buf[..len]);
        let header = wire::Header::decode(&mut bytes).unwrap();
        assert_eq!(header.answers, 1);

        let record = read_record(&mut bytes, false).unwrap();
        assert_eq!(record.ttl, 0);
        assert_eq!(record.rtype, u16::from(RecordType::Ptr));

        let RData::Ptr(target) = record.rdata else {
            panic!("not a PTR");
        };
        // Instance falls back to the hostname
        assert_eq!(target.host, "alpha");
    }

    #[test]
    fn stale_service_descriptor_is_skipped() {
        let view = view(&[]);

        let mut packet = TxPacket::new(0, Family::V4);
        packet
            .answers
            .push(TxRecord::new(TxRecordKind::ServicePtr { service: 42 }))
            .unwrap();

        let mut buf = [0; crate::MAX_PACKET_SIZE];
        assert_eq!(encode_packet(&view, &packet, &mut buf).unwrap(), 0);
    }

    #[test]
    fn encode_announce_sets_flush() {
        let services = [service(1)];
        let view = view(&services);

        let mut packet = TxPacket::new(0, Family::V4);
        packet.flags = wire::AUTHORITATIVE_RESPONSE;
        packet
            .answers
            .push(TxRecord::flush(TxRecordKind::Srv { service: 1 }))
            .unwrap();
        packet
            .answers
            .push(TxRecord::flush(TxRecordKind::HostA { host: HostRef::Own }))
            .unwrap();

        let mut buf = [0; crate::MAX_PACKET_SIZE];
        let len = encode_packet(&view, &packet, &mut buf).unwrap();

        let mut bytes = BytesIn::new(&buf[..len]);
        let header = wire::Header::decode(&mut bytes).unwrap();
        assert_eq!(header.flags, wire::AUTHORITATIVE_RESPONSE);
        assert_eq!(header.answers, 2);

        let srv = read_record(&mut bytes, false).unwrap();
        assert!(srv.cache_flush());
        assert_eq!(srv.ttl, TTL_HOST);
        let RData::Srv { port, target, .. } = srv.rdata else {
            panic!("not an SRV");
        };
        assert_eq!(port, 80);
        assert_eq!(target.host, "alpha");

        let a = read_record(&mut bytes, false).unwrap();
        assert_eq!(a.rdata, RData::A(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(a.ttl, TTL_HOST);
    }

    #[test]
    fn reverse_owner_encodes_v4() {
        let mut buf = [0; 64];
        let mut out = BytesOut::new(&mut buf);

        write_reverse_owner(&mut out, &IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5))).unwrap();

        let name = wire::read_fqdn(&mut BytesIn::new(out.written()), true).unwrap();
        assert_eq!(name.reverse, Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5))));
    }
}

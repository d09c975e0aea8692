//! The responder core: data model ownership, the bounded action queue
//! serializing every mutation, the inbound parser/dispatcher, and the
//! probe/announce orchestration.
//!
//! The core is sans-io: it never touches sockets or the wall clock. The
//! `io` layer (or a test) drives it with [`Server::handle_rx`],
//! [`Server::tick`] and [`Server::poll_transmit`], passing `now`
//! explicitly.

use core::net::{IpAddr, SocketAddr};

use embassy_time::{Duration, Instant};

use heapless::Deque;

use log::{debug, warn};

use crate::host::{mangle, write_txt_rdata, DelegatedHost, Proto, Service, TxtItem};
use crate::packet::{
    encode_packet, HostRef, ModelView, PacketId, ReverseAddr, TxPacket, TxQueue, TxQuestion,
    TxRecord, TxRecordKind, EchoQuestion, TTL_SHARED,
};
use crate::pcb::{
    Family, Netif, NetifAction, PcbState, ANNOUNCE_INTERVAL, PROBE_FAIL_FAST_LIMIT, PROBE_INTERVAL,
    PROBE_RETRY_BASE, PROBE_RETRY_SLOW,
};
use crate::query::{QueryResult, QuerySpec, RecordView, Search, SearchState};
use crate::wire::{
    self, read_question, read_record, BytesIn, BytesOut, Name, Question, RData, RecordType,
    AUTHORITATIVE_RESPONSE, HEADER_SIZE,
};
use crate::{
    name_string, Config, Error, NameString, ACTION_QUEUE_DEPTH, MAX_ADDRS, MAX_BROWSES,
    MAX_DELEGATED_HOSTS, MAX_INTERFACES, MAX_RESULTS, MAX_SEARCHES, MAX_SERVICES, PORT,
};

const EVENT_QUEUE_DEPTH: usize = 8;

/// Actions consumed by the single-threaded executor. Every mutation of
/// the data model flows through here (service table edits excepted, which
/// happen under the same mutex the executor holds).
#[derive(Debug, Clone)]
pub enum Action {
    SystemEvent { netif: u8, action: NetifAction },
    HostnameSet(NameString),
    InstanceSet(NameString),
    SearchAdd(u8),
    SearchSend(u8),
    SearchEnd(u8),
    BrowseAdd(u8),
    BrowseSync(u8),
    BrowseEnd(u8),
    TxHandle(PacketId),
    DelegateHostnameAdd(DelegatedHost),
    DelegateHostnameRemove(NameString),
    DelegateHostnameSetAddr {
        hostname: NameString,
        addrs: heapless::Vec<IpAddr, MAX_ADDRS>,
    },
    Stop,
}

/// Notifications the executor surfaces to the waiting io layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    SearchDone(u8),
    BrowseSync(u8),
}

/// One encoded datagram ready to go out.
#[derive(Debug, Clone, Copy)]
pub struct Transmit {
    pub netif: u8,
    pub family: Family,
    pub target: SocketAddr,
    pub len: usize,
}

/// The mDNS responder and resolver core. One per process is typical, but
/// nothing prevents several (tests run a pair against each other).
pub struct Server {
    config: Config,
    rand: fn(&mut [u8]),
    hostname: NameString,
    instance: Option<NameString>,
    services: heapless::Vec<Service, MAX_SERVICES>,
    next_service_id: u16,
    delegated: heapless::Vec<DelegatedHost, MAX_DELEGATED_HOSTS>,
    next_delegated_id: u16,
    netifs: [Option<Netif>; MAX_INTERFACES],
    tx_queue: TxQueue,
    actions: Deque<Action, ACTION_QUEUE_DEPTH>,
    events: Deque<Event, EVENT_QUEUE_DEPTH>,
    searches: [Option<Search>; MAX_SEARCHES],
    browses: [Option<Search>; MAX_BROWSES],
    /// Rotating 4-step counter spreading shared answers over 25..100ms.
    answer_step: u8,
    stopped: bool,
}

impl Server {
    /// Create a responder owning `hostname`. The `rand` collaborator
    /// feeds all jitter so tests can pin it.
    pub fn new(hostname: &str, rand: fn(&mut [u8]), config: Config) -> Result<Self, Error> {
        let hostname = name_string(hostname)?;

        let mut step = [0u8; 1];
        rand(&mut step);

        Ok(Self {
            config,
            rand,
            hostname,
            instance: None,
            services: heapless::Vec::new(),
            next_service_id: 1,
            delegated: heapless::Vec::new(),
            next_delegated_id: 1,
            netifs: core::array::from_fn(|_| None),
            tx_queue: TxQueue::new(),
            actions: Deque::new(),
            events: Deque::new(),
            searches: core::array::from_fn(|_| None),
            browses: core::array::from_fn(|_| None),
            answer_step: step[0] & 0x03,
            stopped: false,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // --- name ownership ---

    pub fn hostname_get(&self) -> &str {
        &self.hostname
    }

    /// Queue a hostname change; all PCBs re-probe under the new name.
    pub fn hostname_set(&mut self, hostname: &str) -> Result<(), Error> {
        let hostname = name_string(hostname)?;

        self.enqueue(Action::HostnameSet(hostname))
    }

    pub fn instance_name_set(&mut self, instance: &str) -> Result<(), Error> {
        let instance = name_string(instance)?;

        self.enqueue(Action::InstanceSet(instance))
    }

    // --- delegated hosts ---

    pub fn delegate_hostname_add(&mut self, hostname: &str, addrs: &[IpAddr]) -> Result<(), Error> {
        let hostname = name_string(hostname)?;

        if hostname.eq_ignore_ascii_case(&self.hostname) || self.find_delegated(&hostname).is_some()
        {
            return Err(Error::Conflict);
        }

        let host = DelegatedHost {
            id: self.next_delegated_id,
            hostname,
            addrs: heapless::Vec::from_slice(addrs).map_err(|_| Error::Overflow)?,
        };
        self.next_delegated_id = self.next_delegated_id.wrapping_add(1).max(1);

        self.enqueue(Action::DelegateHostnameAdd(host))
    }

    pub fn delegate_hostname_remove(&mut self, hostname: &str) -> Result<(), Error> {
        let hostname = name_string(hostname)?;

        if self.find_delegated(&hostname).is_none() {
            return Err(Error::NotFound);
        }

        self.enqueue(Action::DelegateHostnameRemove(hostname))
    }

    pub fn delegate_hostname_set_addr(
        &mut self,
        hostname: &str,
        addrs: &[IpAddr],
    ) -> Result<(), Error> {
        let hostname = name_string(hostname)?;

        if self.find_delegated(&hostname).is_none() {
            return Err(Error::NotFound);
        }

        self.enqueue(Action::DelegateHostnameSetAddr {
            hostname,
            addrs: heapless::Vec::from_slice(addrs).map_err(|_| Error::Overflow)?,
        })
    }

    fn find_delegated(&self, hostname: &str) -> Option<&DelegatedHost> {
        self.delegated
            .iter()
            .find(|h| h.hostname.eq_ignore_ascii_case(hostname))
    }

    // --- services ---

    /// Register a service. A `hostname` names a delegated host; `None`
    /// is the self host. The new records are probed before they run.
    #[allow(clippy::too_many_arguments)]
    pub fn service_add(
        &mut self,
        now: Instant,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
        hostname: Option<&str>,
        port: u16,
        txt: &[(&str, Option<&[u8]>)],
    ) -> Result<(), Error> {
        if self.stopped {
            return Err(Error::InvalidState);
        }

        let service = name_string(service)?;
        let instance = instance.map(name_string).transpose()?;

        let hostname = match hostname {
            Some(h) if h.eq_ignore_ascii_case(&self.hostname) => None,
            Some(h) => {
                let h = name_string(h)?;
                if self.find_delegated(&h).is_none() {
                    return Err(Error::NotFound);
                }
                Some(h)
            }
            None => None,
        };

        let mut entry = Service {
            id: self.next_service_id,
            deleted: false,
            instance,
            service,
            proto,
            hostname,
            port,
            priority: 0,
            weight: 0,
            txt: heapless::Vec::new(),
            subtypes: heapless::Vec::new(),
        };

        for (key, value) in txt {
            entry.txt.push(TxtItem::new(key, *value)?).map_err(|_| Error::Overflow)?;
        }

        if self.services.iter().any(|s| !s.deleted && s.same_tuple(&entry)) {
            return Err(Error::Conflict);
        }

        let id = entry.id;
        self.services.push(entry).map_err(|_| Error::Overflow)?;
        self.next_service_id = self.next_service_id.wrapping_add(1).max(1);

        // New records must win their names before running
        self.reprobe(now, &[id], false, false);

        Ok(())
    }

    pub fn service_exists(&self, instance: Option<&str>, service: &str, proto: Proto) -> bool {
        self.services
            .iter()
            .any(|s| !s.deleted && s.matches(instance, service, proto))
    }

    /// Unregister a service; a PTR goodbye goes out immediately.
    pub fn service_remove(
        &mut self,
        now: Instant,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
    ) -> Result<(), Error> {
        let index = self
            .services
            .iter()
            .position(|s| !s.deleted && s.matches(instance, service, proto))
            .ok_or(Error::NotFound)?;

        let id = self.services[index].id;
        self.services[index].deleted = true;

        self.forget_service(id);
        self.schedule_goodbye(now, &[id]);

        Ok(())
    }

    pub fn service_remove_all(&mut self, now: Instant) {
        let mut ids = heapless::Vec::<u16, MAX_SERVICES>::new();

        for service in self.services.iter_mut().filter(|s| !s.deleted) {
            service.deleted = true;
            ids.push(service.id).ok();
        }

        for id in &ids {
            self.forget_service(*id);
        }

        if !ids.is_empty() {
            self.schedule_goodbye(now, &ids);
        }
    }

    pub fn service_port_set(
        &mut self,
        now: Instant,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
        port: u16,
    ) -> Result<(), Error> {
        let index = self.find_service(instance, service, proto)?;

        self.services[index].port = port;
        let id = self.services[index].id;
        self.announce_service(now, id);

        Ok(())
    }

    /// Replace the whole TXT item list.
    pub fn service_txt_set(
        &mut self,
        now: Instant,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
        txt: &[(&str, Option<&[u8]>)],
    ) -> Result<(), Error> {
        let index = self.find_service(instance, service, proto)?;

        let mut items = heapless::Vec::new();
        for (key, value) in txt {
            items.push(TxtItem::new(key, *value)?).map_err(|_| Error::Overflow)?;
        }

        self.services[index].txt = items;
        let id = self.services[index].id;
        self.announce_service(now, id);

        Ok(())
    }

    pub fn service_txt_item_set(
        &mut self,
        now: Instant,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
        key: &str,
        value: Option<&[u8]>,
    ) -> Result<(), Error> {
        let index = self.find_service(instance, service, proto)?;

        self.services[index].txt_set(TxtItem::new(key, value)?)?;
        let id = self.services[index].id;
        self.announce_service(now, id);

        Ok(())
    }

    pub fn service_txt_item_remove(
        &mut self,
        now: Instant,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
        key: &str,
    ) -> Result<(), Error> {
        let index = self.find_service(instance, service, proto)?;

        self.services[index].txt_remove(key)?;
        let id = self.services[index].id;
        self.announce_service(now, id);

        Ok(())
    }

    pub fn service_subtype_add(
        &mut self,
        now: Instant,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
        subtype: &str,
    ) -> Result<(), Error> {
        let subtype = name_string(subtype)?;
        let index = self.find_service(instance, service, proto)?;

        let svc = &mut self.services[index];
        if svc.subtypes.iter().any(|s| s.eq_ignore_ascii_case(&subtype)) {
            return Err(Error::Conflict);
        }

        svc.subtypes.push(subtype).map_err(|_| Error::Overflow)?;
        let id = svc.id;
        self.announce_service(now, id);

        Ok(())
    }

    /// Dropping a subtype stops answering for it; the published PTR ages
    /// out with its TTL.
    pub fn service_subtype_remove(
        &mut self,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
        subtype: &str,
    ) -> Result<(), Error> {
        let index = self.find_service(instance, service, proto)?;

        let svc = &mut self.services[index];
        let pos = svc
            .subtypes
            .iter()
            .position(|s| s.eq_ignore_ascii_case(subtype))
            .ok_or(Error::NotFound)?;

        svc.subtypes.remove(pos);

        Ok(())
    }

    /// Replace the subtype list wholesale.
    pub fn service_subtype_update(
        &mut self,
        now: Instant,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
        subtypes: &[&str],
    ) -> Result<(), Error> {
        let index = self.find_service(instance, service, proto)?;

        let mut list = heapless::Vec::new();
        for subtype in subtypes {
            list.push(name_string(subtype)?).map_err(|_| Error::Overflow)?;
        }

        self.services[index].subtypes = list;
        let id = self.services[index].id;
        self.announce_service(now, id);

        Ok(())
    }

    /// Rename a service instance; the new name is probed for uniqueness.
    pub fn service_instance_name_set(
        &mut self,
        now: Instant,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
        new_instance: &str,
    ) -> Result<(), Error> {
        let new_instance = name_string(new_instance)?;
        let index = self.find_service(instance, service, proto)?;

        self.services[index].instance = Some(new_instance);
        let id = self.services[index].id;
        self.reprobe(now, &[id], false, false);

        Ok(())
    }

    fn find_service(
        &self,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
    ) -> Result<usize, Error> {
        self.services
            .iter()
            .position(|s| !s.deleted && s.matches(instance, service, proto))
            .ok_or(Error::NotFound)
    }

    fn effective_instance<'a>(&'a self, service: &'a Service) -> &'a str {
        service
            .instance
            .as_deref()
            .or(self.instance.as_deref())
            .unwrap_or(&self.hostname)
    }

    /// Drop a deleted service from probe contexts and scheduled packets.
    fn forget_service(&mut self, id: u16) {
        for slot in self.netifs.iter_mut().flatten() {
            for pcb in slot.pcbs.iter_mut() {
                pcb.probe_services.retain(|s| *s != id);
            }
        }

        for packet in self.tx_queue.iter_mut() {
            if packet.queued {
                continue;
            }

            packet.questions.retain(
                |q| !matches!(q, TxQuestion::ProbeService(s) if *s == id),
            );

            let drop_record = |r: &TxRecord| {
                !matches!(
                    r.kind,
                    TxRecordKind::ServicePtr { service }
                    | TxRecordKind::SubPtr { service, .. }
                    | TxRecordKind::Sdptr { service }
                    | TxRecordKind::Srv { service }
                    | TxRecordKind::Txt { service } if service == id
                )
            };

            packet.answers.retain(drop_record);
            packet.servers.retain(drop_record);
            packet.additional.retain(drop_record);
        }

        self.tx_queue
            .retain(|p| p.queued || p.goodbye || !p.is_empty());
    }

    // --- searches and browses ---

    /// Start a one-shot search; the returned id is used to collect
    /// results and to delete the search.
    pub fn query_async_new(&mut self, now: Instant, spec: QuerySpec) -> Result<u8, Error> {
        if spec.max_results == 0 || spec.max_results as usize > MAX_RESULTS {
            return Err(Error::InvalidArgument);
        }

        let slot = self
            .searches
            .iter()
            .position(|s| s.is_none())
            .ok_or(Error::Overflow)?;

        self.searches[slot] = Some(Search::new(spec, false, now));

        match self.enqueue(Action::SearchAdd(slot as u8)) {
            Ok(()) => Ok(slot as u8),
            Err(err) => {
                self.searches[slot] = None;
                Err(err)
            }
        }
    }

    /// Copy out the current results of a running or finished search.
    pub fn query_async_get_results(
        &self,
        id: u8,
    ) -> Result<heapless::Vec<QueryResult, MAX_RESULTS>, Error> {
        let search = self
            .searches
            .get(id as usize)
            .and_then(|s| s.as_ref())
            .ok_or(Error::NotFound)?;

        Ok(search.results.clone())
    }

    /// Whether a search has ended (timeout or max results).
    pub fn search_done(&self, id: u8) -> bool {
        self.searches
            .get(id as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.state == SearchState::Off)
            .unwrap_or(true)
    }

    /// Take the results of a finished search and free its slot.
    pub fn search_take_results(
        &mut self,
        id: u8,
    ) -> Result<heapless::Vec<QueryResult, MAX_RESULTS>, Error> {
        let slot = self
            .searches
            .get_mut(id as usize)
            .ok_or(Error::NotFound)?;
        let search = slot.as_ref().ok_or(Error::NotFound)?;

        if search.state != SearchState::Off {
            return Err(Error::InvalidState);
        }

        let search = slot.take().unwrap();

        Ok(search.results)
    }

    /// Cancel a search; takes effect in queue order.
    pub fn query_async_delete(&mut self, id: u8) -> Result<(), Error> {
        let search = self
            .searches
            .get_mut(id as usize)
            .and_then(|s| s.as_mut())
            .ok_or(Error::NotFound)?;

        if search.state == SearchState::Off {
            self.searches[id as usize] = None;
            return Ok(());
        }

        search.detached = true;

        self.enqueue(Action::SearchEnd(id))
    }

    /// Start a continuous browse for `<service>.<proto>`.
    pub fn browse_new(&mut self, now: Instant, service: &str, proto: Proto) -> Result<u8, Error> {
        let service = name_string(service)?;

        let slot = self
            .browses
            .iter()
            .position(|b| b.is_none())
            .ok_or(Error::Overflow)?;

        let spec = QuerySpec {
            instance: None,
            service: Some(service),
            proto: Some(proto),
            rtype: RecordType::Ptr,
            unicast: false,
            timeout: Duration::from_millis(0),
            max_results: MAX_RESULTS as u8,
        };

        let mut browse = Search::new(spec, true, now);
        browse.state = SearchState::Off;
        self.browses[slot] = Some(browse);

        match self.enqueue(Action::BrowseAdd(slot as u8)) {
            Ok(()) => Ok(slot as u8),
            Err(err) => {
                self.browses[slot] = None;
                Err(err)
            }
        }
    }

    pub fn browse_delete(&mut self, id: u8) -> Result<(), Error> {
        if self
            .browses
            .get(id as usize)
            .and_then(|b| b.as_ref())
            .is_none()
        {
            return Err(Error::NotFound);
        }

        self.enqueue(Action::BrowseEnd(id))
    }

    /// Deliver the staged deltas of a browse: changed results first, then
    /// detached (TTL 0) ones.
    pub fn browse_take_changes(
        &mut self,
        id: u8,
        f: impl FnMut(&QueryResult),
    ) -> Result<(), Error> {
        let browse = self
            .browses
            .get_mut(id as usize)
            .and_then(|b| b.as_mut())
            .ok_or(Error::NotFound)?;

        browse.take_changes(f);

        Ok(())
    }

    // --- interfaces ---

    /// Claim a slot in the interface table.
    pub fn register_netif(&mut self) -> Result<u8, Error> {
        let slot = self
            .netifs
            .iter()
            .position(|n| n.is_none())
            .ok_or(Error::Overflow)?;

        self.netifs[slot] = Some(Netif::new());

        Ok(slot as u8)
    }

    pub fn unregister_netif(&mut self, now: Instant, netif: u8) -> Result<(), Error> {
        if self.netif(netif).is_none() {
            return Err(Error::NotFound);
        }

        self.drop_netif_packets(netif, None);
        self.netifs[netif as usize] = None;
        self.promote_duplicates_of(netif, now);

        Ok(())
    }

    pub fn netif_action(&mut self, netif: u8, action: NetifAction) -> Result<(), Error> {
        if self.netif(netif).is_none() {
            return Err(Error::NotFound);
        }

        self.enqueue(Action::SystemEvent { netif, action })
    }

    pub fn netif_state(&self, netif: u8, family: Family) -> Option<PcbState> {
        self.netif(netif).map(|n| n.pcb(family).state)
    }

    fn netif(&self, netif: u8) -> Option<&Netif> {
        self.netifs.get(netif as usize).and_then(|n| n.as_ref())
    }

    // --- executor surface ---

    /// Queue an action for the executor.
    fn enqueue(&mut self, action: Action) -> Result<(), Error> {
        if self.stopped {
            return Err(Error::InvalidState);
        }

        self.actions
            .push_back(action)
            .map_err(|_| Error::QueueFull)
    }

    fn push_internal(&mut self, action: Action) {
        if self.actions.push_back(action).is_err() {
            warn!("Action queue overflow, internal action dropped");
        }
    }

    fn push_event(&mut self, event: Event) {
        if self.events.push_back(event).is_err() {
            warn!("Event queue overflow, event dropped");
        }
    }

    pub fn pop_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Queue the shutdown: goodbyes for every service go out, then the
    /// executor is free to exit once [`Server::finished`] reports true.
    pub fn stop(&mut self) -> Result<(), Error> {
        self.enqueue(Action::Stop)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Nothing left to process or transmit.
    pub fn finished(&self) -> bool {
        self.stopped && self.actions.is_empty() && self.tx_queue.is_empty()
    }

    /// The next instant a scheduled transmission falls due.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.tx_queue.next_send_at()
    }

    /// The periodic timer body: one scheduler sweep, one search sweep.
    pub fn tick(&mut self, now: Instant) {
        self.run_scheduler(now);
        self.run_searches(now);
    }

    fn run_scheduler(&mut self, now: Instant) {
        loop {
            let Some(id) = self.tx_queue.mark_due(now) else {
                break;
            };

            if self.actions.push_back(Action::TxHandle(id)).is_err() {
                self.tx_queue.unmark(id);
                break;
            }
        }
    }

    fn run_searches(&mut self, now: Instant) {
        enum Sweep {
            Idle,
            End,
            Send,
        }

        for index in 0..MAX_SEARCHES {
            let op = {
                let Some(search) = self.searches[index].as_mut() else {
                    continue;
                };

                if search.state == SearchState::Off {
                    continue;
                }

                if search.timed_out(now) {
                    // Claimed here so the next sweep does not re-queue it
                    search.state = SearchState::Off;
                    Sweep::End
                } else {
                    let resend = match search.sent_at {
                        Some(sent_at) => now >= sent_at + Duration::from_millis(1000),
                        None => true,
                    };

                    if resend {
                        search.state = SearchState::Running;
                        search.sent_at = Some(now);
                        Sweep::Send
                    } else {
                        Sweep::Idle
                    }
                }
            };

            match op {
                Sweep::End => self.push_internal(Action::SearchEnd(index as u8)),
                Sweep::Send => self.push_internal(Action::SearchSend(index as u8)),
                Sweep::Idle => (),
            }
        }
    }

    /// Process queued actions and encode the next due transmission into
    /// `buf`. Returns `None` once the queue holds no more sendable work.
    pub fn poll_transmit(&mut self, now: Instant, buf: &mut [u8]) -> Option<Transmit> {
        self.poll_transmit_for(now, None, buf)
    }

    /// Like [`Server::poll_transmit`], but only claims packets for one
    /// interface; foreign transmit actions stay queued for the executor
    /// task that owns their socket.
    pub fn poll_transmit_for(
        &mut self,
        now: Instant,
        netif: Option<u8>,
        buf: &mut [u8],
    ) -> Option<Transmit> {
        self.run_scheduler(now);

        loop {
            let id = self.process_until_transmit(now, netif)?;

            let Some(packet) = self.tx_queue.remove(id) else {
                continue;
            };

            if self
                .netif(packet.netif)
                .map(|n| !n.pcb(packet.family).state.is_enabled())
                .unwrap_or(true)
            {
                continue;
            }

            let view = self.model_view(packet.netif);

            match encode_packet(&view, &packet, buf) {
                Ok(0) => {
                    self.after_transmit(packet, now);
                }
                Ok(len) => {
                    let transmit = Transmit {
                        netif: packet.netif,
                        family: packet.family,
                        target: packet.target(),
                        len,
                    };

                    self.after_transmit(packet, now);

                    return Some(transmit);
                }
                Err(err) => {
                    debug!("Dropping unencodable packet: {}", err);
                    self.after_transmit(packet, now);
                }
            }
        }
    }

    fn process_until_transmit(&mut self, now: Instant, netif: Option<u8>) -> Option<PacketId> {
        let mut deferred: heapless::Vec<PacketId, { crate::TX_QUEUE_DEPTH }> = heapless::Vec::new();
        let mut found = None;

        while let Some(action) = self.actions.pop_front() {
            match action {
                Action::TxHandle(id) => {
                    let ours = match netif {
                        Some(netif) => {
                            self.tx_queue.get(id).map(|p| p.netif) == Some(netif)
                        }
                        None => true,
                    };

                    if ours {
                        found = Some(id);
                        break;
                    }

                    deferred.push(id).ok();
                }
                action => {
                    self.apply_action(action, now);
                    self.run_scheduler(now);
                }
            }
        }

        for id in deferred {
            self.actions.push_back(Action::TxHandle(id)).ok();
        }

        found
    }

    fn model_view(&self, netif: u8) -> ModelView<'_> {
        let slot = self.netif(netif);

        ModelView {
            hostname: &self.hostname,
            instance: self.instance.as_deref(),
            services: &self.services,
            delegated: &self.delegated,
            v4: slot.and_then(|n| n.v4.map(|(addr, _)| addr)),
            v6: slot.and_then(|n| n.v6),
            searches: &self.searches,
            browses: &self.browses,
        }
    }

    fn apply_action(&mut self, action: Action, now: Instant) {
        match action {
            Action::SystemEvent { netif, action } => self.apply_netif_action(netif, action, now),
            Action::HostnameSet(hostname) => {
                debug!("Hostname set to {}", hostname);
                self.hostname = hostname;
                self.reset_failed_probes();
                self.reprobe_all(now, false);
            }
            Action::InstanceSet(instance) => {
                self.instance = Some(instance);
                self.reprobe_all(now, false);
            }
            Action::SearchAdd(id) => {
                if let Some(search) = self.searches.get_mut(id as usize).and_then(|s| s.as_mut()) {
                    if search.state == SearchState::Init {
                        search.started_at = now;
                    }
                }
            }
            Action::SearchSend(id) => self.send_search(id, false, now),
            Action::SearchEnd(id) => {
                let detached = match self.searches.get_mut(id as usize).and_then(|s| s.as_mut()) {
                    Some(search) => {
                        search.state = SearchState::Off;
                        search.detached
                    }
                    None => return,
                };

                if detached {
                    self.searches[id as usize] = None;
                }

                self.push_event(Event::SearchDone(id));
            }
            Action::BrowseAdd(id) => {
                if let Some(browse) = self.browses.get_mut(id as usize).and_then(|b| b.as_mut()) {
                    browse.state = SearchState::Running;
                    browse.sent_at = Some(now);
                    self.send_search(id, true, now);
                }
            }
            Action::BrowseSync(id) => {
                self.push_event(Event::BrowseSync(id));
            }
            Action::BrowseEnd(id) => {
                self.browses[id as usize] = None;
            }
            Action::TxHandle(_) => unreachable!("transmit actions handled by the poll loop"),
            Action::DelegateHostnameAdd(host) => {
                debug!("Delegating hostname {}", host.hostname);
                self.delegated.push(host).ok();
            }
            Action::DelegateHostnameRemove(hostname) => {
                self.delegated
                    .retain(|h| !h.hostname.eq_ignore_ascii_case(&hostname));
            }
            Action::DelegateHostnameSetAddr { hostname, addrs } => {
                if let Some(host) = self
                    .delegated
                    .iter_mut()
                    .find(|h| h.hostname.eq_ignore_ascii_case(&hostname))
                {
                    host.addrs = addrs;
                }
            }
            Action::Stop => {
                let mut ids = heapless::Vec::<u16, MAX_SERVICES>::new();
                for service in self.services.iter_mut().filter(|s| !s.deleted) {
                    service.deleted = true;
                    ids.push(service.id).ok();
                }

                if !ids.is_empty() {
                    self.schedule_goodbye(now, &ids);
                }

                // Pending non-goodbye traffic dies with the server
                self.tx_queue.retain(|p| p.goodbye || p.queued);
                self.stopped = true;
            }
        }
    }

    fn apply_netif_action(&mut self, netif: u8, action: NetifAction, now: Instant) {
        match action {
            NetifAction::EnableV4 { addr, mask } => {
                let Some(slot) = self.netifs.get_mut(netif as usize).and_then(|n| n.as_mut())
                else {
                    return;
                };
                slot.v4 = Some((addr, mask));

                // A second interface on an already-served IPv4 subnet
                // stays silent behind the first
                let dup_of = self
                    .netifs
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| *index != netif as usize)
                    .filter_map(|(index, n)| n.as_ref().map(|n| (index, n)))
                    .find(|(_, n)| {
                        n.pcb(Family::V4).state.is_enabled()
                            && !matches!(n.pcb(Family::V4).state, PcbState::Dup)
                            && n.same_v4_subnet(self.netifs[netif as usize].as_ref().unwrap())
                    })
                    .map(|(index, _)| index as u8);

                let slot = self.netifs[netif as usize].as_mut().unwrap();
                if let Some(peer) = dup_of {
                    debug!("Interface {} duplicates {}; staying silent", netif, peer);
                    slot.duplicate_of = Some(peer);
                    slot.pcb_mut(Family::V4).state = PcbState::Dup;
                } else {
                    slot.pcb_mut(Family::V4).state = PcbState::Init;
                    self.start_probe(netif, Family::V4, now);
                }
            }
            NetifAction::EnableV6 { addr } => {
                let Some(slot) = self.netifs.get_mut(netif as usize).and_then(|n| n.as_mut())
                else {
                    return;
                };
                slot.v6 = Some(addr);
                slot.pcb_mut(Family::V6).state = PcbState::Init;
                self.start_probe(netif, Family::V6, now);
            }
            NetifAction::Disable(family) => {
                let Some(slot) = self.netifs.get_mut(netif as usize).and_then(|n| n.as_mut())
                else {
                    return;
                };

                match family {
                    Family::V4 => slot.v4 = None,
                    Family::V6 => slot.v6 = None,
                }
                slot.pcb_mut(family).reset();
                if matches!(family, Family::V4) {
                    slot.duplicate_of = None;
                }

                self.drop_netif_packets(netif, Some(family));

                if matches!(family, Family::V4) {
                    self.promote_duplicates_of(netif, now);
                }
            }
            NetifAction::Announce(family) => {
                let running = self
                    .netif(netif)
                    .map(|n| matches!(n.pcb(family).state, PcbState::Running))
                    .unwrap_or(false);

                if running {
                    let packet = self.build_announce_packet(netif, family);
                    self.tx_queue.schedule(packet, now).ok();
                }
            }
        }
    }

    /// Begin probing everything this PCB should own.
    fn start_probe(&mut self, netif: u8, family: Family, now: Instant) {
        let ids: heapless::Vec<u16, MAX_SERVICES> = self
            .services
            .iter()
            .filter(|s| !s.deleted)
            .map(|s| s.id)
            .collect();

        self.init_pcb_probe(netif, family, &ids, true, now);
    }

    /// Merge `services` into the PCB's probe set and (re)schedule its
    /// probe packet.
    fn init_pcb_probe(
        &mut self,
        netif: u8,
        family: Family,
        services: &[u16],
        probe_ip: bool,
        now: Instant,
    ) {
        let rand = self.rand;

        let Some(slot) = self.netifs.get_mut(netif as usize).and_then(|n| n.as_mut()) else {
            return;
        };

        if slot.addr(family).is_none() {
            return;
        }

        let pcb = slot.pcb_mut(family);
        if matches!(pcb.state, PcbState::Off | PcbState::Dup) {
            return;
        }

        pcb.merge_probe_services(services);
        pcb.probe_ip |= probe_ip;
        pcb.state = PcbState::Probe(1);

        let probe_services = pcb.probe_services.clone();
        let probe_ip = pcb.probe_ip;
        let failed = pcb.failed_probes;

        // Pending probes and announcements for this PCB are superseded
        self.tx_queue.retain(|p| {
            !((p.probe || p.announce) && !p.queued && p.netif == netif && p.family == family)
        });

        let packet = build_probe_packet(netif, family, &probe_services, probe_ip);
        let delay = probe_delay(rand, failed);

        if self.tx_queue.schedule(packet, now + delay).is_err() {
            warn!("Tx queue full, probe delayed to next sweep");
        }
    }

    /// Restart probing for some services on every eligible PCB.
    fn reprobe(&mut self, now: Instant, services: &[u16], probe_ip: bool, failed: bool) {
        for netif in 0..MAX_INTERFACES as u8 {
            for family in [Family::V4, Family::V6] {
                let Some(slot) = self.netifs.get_mut(netif as usize).and_then(|n| n.as_mut())
                else {
                    continue;
                };

                if slot.addr(family).is_none() {
                    continue;
                }

                let pcb = slot.pcb_mut(family);
                if matches!(pcb.state, PcbState::Off | PcbState::Dup) {
                    continue;
                }

                if failed {
                    pcb.failed_probes = pcb.failed_probes.saturating_add(1);
                }

                self.init_pcb_probe(netif, family, services, probe_ip, now);
            }
        }
    }

    fn reprobe_all(&mut self, now: Instant, failed: bool) {
        let ids: heapless::Vec<u16, MAX_SERVICES> = self
            .services
            .iter()
            .filter(|s| !s.deleted)
            .map(|s| s.id)
            .collect();

        self.reprobe(now, &ids, true, failed);
    }

    fn reset_failed_probes(&mut self) {
        for slot in self.netifs.iter_mut().flatten() {
            for pcb in slot.pcbs.iter_mut() {
                pcb.failed_probes = 0;
            }
        }
    }

    fn drop_netif_packets(&mut self, netif: u8, family: Option<Family>) {
        self.tx_queue.retain(|p| {
            p.netif != netif || family.map(|f| p.family != f).unwrap_or(false)
        });
    }

    /// A Dup interface whose subnet peer went away takes over by
    /// re-probing.
    fn promote_duplicates_of(&mut self, gone: u8, now: Instant) {
        let mut promote = heapless::Vec::<u8, MAX_INTERFACES>::new();

        for (index, slot) in self.netifs.iter_mut().enumerate() {
            let Some(slot) = slot else {
                continue;
            };

            if slot.duplicate_of == Some(gone) {
                slot.duplicate_of = None;
                if matches!(slot.pcb(Family::V4).state, PcbState::Dup) {
                    slot.pcb_mut(Family::V4).state = PcbState::Init;
                    promote.push(index as u8).ok();
                }
            }
        }

        for netif in promote {
            debug!("Promoting duplicate interface {}", netif);
            self.start_probe(netif, Family::V4, now);
        }
    }

    fn announce_service(&mut self, now: Instant, id: u16) {
        for netif in 0..MAX_INTERFACES as u8 {
            for family in [Family::V4, Family::V6] {
                let running = self
                    .netif(netif)
                    .map(|n| matches!(n.pcb(family).state, PcbState::Running))
                    .unwrap_or(false);

                if !running {
                    continue;
                }

                let mut packet = TxPacket::new(netif, family);
                packet.flags = AUTHORITATIVE_RESPONSE;
                packet
                    .answers
                    .push(TxRecord::flush(TxRecordKind::Srv { service: id }))
                    .ok();
                packet
                    .answers
                    .push(TxRecord::flush(TxRecordKind::Txt { service: id }))
                    .ok();

                self.tx_queue.schedule(packet, now).ok();
            }
        }
    }

    fn schedule_goodbye(&mut self, now: Instant, ids: &[u16]) {
        for netif in 0..MAX_INTERFACES as u8 {
            for family in [Family::V4, Family::V6] {
                let eligible = self
                    .netif(netif)
                    .map(|n| n.pcb(family).state.after_probes())
                    .unwrap_or(false);

                if !eligible {
                    continue;
                }

                let mut packet = TxPacket::new(netif, family);
                packet.flags = AUTHORITATIVE_RESPONSE;
                packet.goodbye = true;

                for id in ids {
                    packet
                        .answers
                        .push(TxRecord::bye(TxRecordKind::ServicePtr { service: *id }))
                        .ok();
                }

                self.tx_queue.schedule(packet, now).ok();
            }
        }
    }

    fn send_search(&mut self, id: u8, browse: bool, now: Instant) {
        for netif in 0..MAX_INTERFACES as u8 {
            for family in [Family::V4, Family::V6] {
                let enabled = self
                    .netif(netif)
                    .map(|n| {
                        n.addr(family).is_some()
                            && n.pcb(family).state.is_enabled()
                            && !matches!(n.pcb(family).state, PcbState::Dup)
                    })
                    .unwrap_or(false);

                if !enabled {
                    continue;
                }

                let mut packet = TxPacket::new(netif, family);
                packet
                    .questions
                    .push(if browse {
                        TxQuestion::Browse(id)
                    } else {
                        TxQuestion::Search(id)
                    })
                    .ok();

                self.tx_queue.schedule(packet, now).ok();
            }
        }
    }

    /// State-machine advancement once a packet left (or was dropped): the
    /// probe train reschedules itself, the third probe synthesizes the
    /// announcement train, the third announcement enters Running.
    fn after_transmit(&mut self, packet: TxPacket, now: Instant) {
        if packet.goodbye {
            self.services.retain(|s| !s.deleted);
        }

        if !packet.probe && !packet.announce {
            return;
        }

        let Some(state) = self.netif_state(packet.netif, packet.family) else {
            return;
        };

        match (packet.probe, state) {
            (true, PcbState::Probe(n)) if n < 3 => {
                self.set_pcb_state(packet.netif, packet.family, PcbState::Probe(n + 1));

                let mut packet = packet;
                packet.send_at = now + PROBE_INTERVAL;
                self.tx_queue.reinsert(packet).ok();
            }
            (true, PcbState::Probe(_)) => {
                debug!(
                    "Probing done on {}/{:?}, announcing",
                    packet.netif, packet.family
                );
                self.set_pcb_state(packet.netif, packet.family, PcbState::Announce(1));

                let announce = self.build_announce_packet(packet.netif, packet.family);
                self.tx_queue
                    .schedule(announce, now + PROBE_INTERVAL)
                    .ok();
            }
            (false, PcbState::Announce(n)) if n < 3 => {
                self.set_pcb_state(packet.netif, packet.family, PcbState::Announce(n + 1));

                let mut packet = packet;
                packet.send_at = now + ANNOUNCE_INTERVAL;
                self.tx_queue.reinsert(packet).ok();
            }
            (false, PcbState::Announce(_)) => {
                debug!("{}/{:?} running", packet.netif, packet.family);
                self.set_pcb_state(packet.netif, packet.family, PcbState::Running);

                if let Some(slot) = self.netifs.get_mut(packet.netif as usize).and_then(|n| n.as_mut())
                {
                    let pcb = slot.pcb_mut(packet.family);
                    pcb.probe_services.clear();
                    pcb.probe_ip = false;
                    pcb.failed_probes = 0;
                }
            }
            _ => (),
        }
    }

    fn set_pcb_state(&mut self, netif: u8, family: Family, state: PcbState) {
        if let Some(slot) = self.netifs.get_mut(netif as usize).and_then(|n| n.as_mut()) {
            slot.pcb_mut(family).state = state;
        }
    }

    fn build_announce_packet(&self, netif: u8, family: Family) -> TxPacket {
        let mut packet = TxPacket::new(netif, family);
        packet.flags = AUTHORITATIVE_RESPONSE;
        packet.announce = true;

        for service in self.services.iter().filter(|s| !s.deleted) {
            let id = service.id;

            packet
                .answers
                .push(TxRecord::flush(TxRecordKind::Srv { service: id }))
                .ok();
            packet
                .answers
                .push(TxRecord::flush(TxRecordKind::Txt { service: id }))
                .ok();
            packet
                .answers
                .push(TxRecord::new(TxRecordKind::Sdptr { service: id }))
                .ok();
            packet
                .answers
                .push(TxRecord::new(TxRecordKind::ServicePtr { service: id }))
                .ok();

            for subtype in 0..service.subtypes.len() {
                packet
                    .answers
                    .push(TxRecord::new(TxRecordKind::SubPtr {
                        service: id,
                        subtype: subtype as u8,
                    }))
                    .ok();
            }
        }

        packet
            .answers
            .push(TxRecord::flush(TxRecordKind::HostA { host: HostRef::Own }))
            .ok();
        packet
            .answers
            .push(TxRecord::flush(TxRecordKind::HostAaaa { host: HostRef::Own }))
            .ok();

        packet
    }

    fn shared_delay(&mut self) -> Duration {
        let step = self.answer_step;
        self.answer_step = (self.answer_step + 1) & 0x03;

        Duration::from_millis(25 + step as u64 * 25)
    }
}

fn probe_delay(rand: fn(&mut [u8]), failed_probes: u8) -> Duration {
    let mut jitter = [0u8; 1];
    rand(&mut jitter);

    let base = if failed_probes <= PROBE_FAIL_FAST_LIMIT {
        PROBE_RETRY_BASE
    } else {
        PROBE_RETRY_SLOW
    };

    base + Duration::from_millis((jitter[0] & 0x7f) as u64)
}

fn build_probe_packet(netif: u8, family: Family, services: &[u16], probe_ip: bool) -> TxPacket {
    let mut packet = TxPacket::new(netif, family);
    packet.probe = true;

    for id in services {
        packet.questions.push(TxQuestion::ProbeService(*id)).ok();
        packet
            .servers
            .push(TxRecord::new(TxRecordKind::Srv { service: *id }))
            .ok();
    }

    if probe_ip {
        packet.questions.push(TxQuestion::ProbeHost).ok();
        packet
            .servers
            .push(TxRecord::new(match family {
                Family::V4 => TxRecordKind::HostA { host: HostRef::Own },
                Family::V6 => TxRecordKind::HostAaaa { host: HostRef::Own },
            }))
            .ok();
    }

    packet
}

/// A question the classifier decided we should answer.
struct MatchedQuestion {
    kind: QuestionMatch,
    rtype: u16,
    unicast: bool,
    name: Name,
}

enum QuestionMatch {
    /// `_services._dns-sd._udp.local` enumeration.
    Discovery,
    /// Service (or subtype) discovery PTR; (service id, subtype index).
    ServicePtr(heapless::Vec<(u16, Option<u8>), MAX_SERVICES>),
    ServiceSrv(u16),
    ServiceTxt(u16),
    /// ANY on an instance name: ship everything for it.
    ServiceAny(u16),
    HostAddr(HostRef),
    /// ANY on a hostname.
    HostAny(HostRef),
    Reverse { host: HostRef, addr: ReverseAddr },
}

impl Server {
    /// Parse and dispatch one received datagram: collision detection,
    /// search/browse aggregation, known-answer suppression and reply
    /// scheduling, all applied atomically.
    pub fn handle_rx(
        &mut self,
        now: Instant,
        netif: u8,
        family: Family,
        src: SocketAddr,
        data: &[u8],
    ) {
        if data.len() <= HEADER_SIZE {
            return;
        }

        let Some(slot) = self.netif(netif) else {
            return;
        };

        if self.config.suppress_own_queries && slot.addr(family) == Some(src.ip()) {
            return;
        }

        let mut bytes = BytesIn::new(data);
        let Ok(header) = wire::Header::decode(&mut bytes) else {
            return;
        };

        let legacy = src.port() != PORT;

        // An authoritative response must come from the mDNS port
        if header.flags == AUTHORITATIVE_RESPONSE && legacy {
            return;
        }

        let allow_arpa = self.config.respond_reverse_queries;
        let is_response = header.is_response();

        let mut matched: heapless::Vec<MatchedQuestion, 8> = heapless::Vec::new();
        let mut peer_probe = false;

        for _ in 0..header.questions {
            let Ok(question) = read_question(&mut bytes, allow_arpa) else {
                debug!("Dropping malformed datagram from {}", src);
                return;
            };

            if is_response || question.name.invalid || !question.class_in() {
                continue;
            }

            if question.rtype == u16::from(RecordType::Any) && !question.name.host.is_empty() {
                peer_probe = true;
            }

            if let Some(kind) = self.classify_question(&question, netif) {
                matched
                    .push(MatchedQuestion {
                        kind,
                        rtype: question.rtype,
                        unicast: question.unicast(),
                        name: question.name,
                    })
                    .ok();
            }
        }

        let mut suppressed: heapless::Vec<u16, 8> = heapless::Vec::new();
        let mut conflict = false;
        let mut browse_changed = [false; MAX_BROWSES];

        let records =
            header.answers as usize + header.servers as usize + header.additional as usize;

        for _ in 0..records {
            let Ok(record) = read_record(&mut bytes, allow_arpa) else {
                debug!("Dropping malformed datagram from {}", src);
                return;
            };

            if record.name.invalid {
                continue;
            }

            self.dispatch_record(
                now,
                netif,
                family,
                is_response,
                &record,
                &mut suppressed,
                &mut conflict,
                &mut browse_changed,
            );
        }

        for (index, changed) in browse_changed.iter().enumerate() {
            if *changed {
                self.push_internal(Action::BrowseSync(index as u8));
            }
        }

        if matched.is_empty() || conflict {
            return;
        }

        let answering = self
            .netif(netif)
            .map(|n| n.pcb(family).state.after_probes())
            .unwrap_or(false);

        if !answering {
            return;
        }

        self.build_response(
            now, netif, family, header.id, legacy, src, peer_probe, &matched, &suppressed,
        );
    }

    fn classify_question(&self, question: &Question, netif: u8) -> Option<QuestionMatch> {
        let rtype = RecordType::try_from(question.rtype).ok()?;
        let name = &question.name;

        if let Some(addr) = name.reverse {
            if !matches!(rtype, RecordType::Ptr | RecordType::Any) {
                return None;
            }

            return self.classify_reverse(addr, netif);
        }

        if !name.is_local() {
            return None;
        }

        if name.is_discovery() {
            return matches!(rtype, RecordType::Ptr | RecordType::Any)
                .then_some(QuestionMatch::Discovery);
        }

        match rtype {
            RecordType::Ptr => self.match_service_ptr(name),
            RecordType::Srv => self
                .match_owned_instance(name)
                .map(|index| QuestionMatch::ServiceSrv(self.services[index].id)),
            RecordType::Txt => self
                .match_owned_instance(name)
                .map(|index| QuestionMatch::ServiceTxt(self.services[index].id)),
            RecordType::A | RecordType::Aaaa => {
                self.match_host(name).map(QuestionMatch::HostAddr)
            }
            RecordType::Any => {
                if name.host.is_empty() {
                    self.match_service_ptr(name)
                } else if !name.service.is_empty() {
                    self.match_owned_instance(name)
                        .map(|index| QuestionMatch::ServiceAny(self.services[index].id))
                } else {
                    self.match_host(name).map(QuestionMatch::HostAny)
                }
            }
            _ => None,
        }
    }

    fn match_service_ptr(&self, name: &Name) -> Option<QuestionMatch> {
        let mut ids: heapless::Vec<(u16, Option<u8>), MAX_SERVICES> = heapless::Vec::new();

        for service in self.services.iter().filter(|s| !s.deleted) {
            if !name.matches_service(&service.service, service.proto.as_str()) {
                continue;
            }

            if name.sub && !name.host.is_empty() {
                if let Some(subtype) = service
                    .subtypes
                    .iter()
                    .position(|s| s.eq_ignore_ascii_case(&name.host))
                {
                    ids.push((service.id, Some(subtype as u8))).ok();
                }
            } else if name.host.is_empty() {
                ids.push((service.id, None)).ok();
            }
        }

        (!ids.is_empty()).then_some(QuestionMatch::ServicePtr(ids))
    }

    /// A service whose instance name equals the queried name.
    fn match_owned_instance(&self, name: &Name) -> Option<usize> {
        self.services.iter().position(|s| {
            !s.deleted
                && name.matches_service(&s.service, s.proto.as_str())
                && name.host.eq_ignore_ascii_case(self.effective_instance(s))
        })
    }

    fn match_host(&self, name: &Name) -> Option<HostRef> {
        if !name.service.is_empty() || !name.proto.is_empty() {
            return None;
        }

        if name.host.eq_ignore_ascii_case(&self.hostname) {
            return Some(HostRef::Own);
        }

        self.find_delegated(&name.host).map(|h| HostRef::Delegated(h.id))
    }

    fn classify_reverse(&self, addr: IpAddr, netif: u8) -> Option<QuestionMatch> {
        let slot = self.netif(netif)?;

        if slot.addr(Family::V4) == Some(addr) {
            return Some(QuestionMatch::Reverse {
                host: HostRef::Own,
                addr: ReverseAddr::OwnV4,
            });
        }

        if slot.addr(Family::V6) == Some(addr) {
            return Some(QuestionMatch::Reverse {
                host: HostRef::Own,
                addr: ReverseAddr::OwnV6,
            });
        }

        for host in &self.delegated {
            if let Some(index) = host.addrs.iter().position(|a| *a == addr) {
                return Some(QuestionMatch::Reverse {
                    host: HostRef::Delegated(host.id),
                    addr: ReverseAddr::Delegated(index as u8),
                });
            }
        }

        None
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_record(
        &mut self,
        now: Instant,
        netif: u8,
        family: Family,
        is_response: bool,
        record: &wire::Record<'_>,
        suppressed: &mut heapless::Vec<u16, 8>,
        conflict: &mut bool,
        browse_changed: &mut [bool; MAX_BROWSES],
    ) {
        if !record.class_in() {
            return;
        }

        match &record.rdata {
            RData::Ptr(target) => {
                // A peer already answering our PTR makes ours redundant
                let answered = self.services.iter().position(|s| {
                    !s.deleted
                        && record.name.host.is_empty()
                        && !record.name.sub
                        && record.name.matches_service(&s.service, s.proto.as_str())
                        && target.host.eq_ignore_ascii_case(self.effective_instance(s))
                });

                if let Some(index) = answered {
                    if record.ttl > TTL_SHARED / 2 {
                        let id = self.services[index].id;
                        if !suppressed.contains(&id) {
                            suppressed.push(id).ok();
                        }
                        self.scrub_scheduled_answers(id);
                    }
                }

                if is_response {
                    self.feed_searches(
                        RecordView::Ptr {
                            name: &record.name,
                            instance: &target.host,
                            ttl: record.ttl,
                        },
                        netif,
                        family,
                        browse_changed,
                    );
                }
            }
            RData::Srv {
                priority,
                weight,
                port,
                target,
            } => {
                let empty = target.host.is_empty() && target.domain.is_empty();

                // Goodbyes and empty data never force a rename
                if record.ttl > 0 && !empty {
                    if let Some(index) = self.match_owned_instance(&record.name) {
                        if self.srv_is_loser(index, *priority, *weight, *port, target) {
                            debug!("Lost SRV tiebreak on [{}], renaming", record.name);
                            *conflict = true;
                            self.rename_service(now, index);
                        }
                    }
                }

                if is_response {
                    self.feed_searches(
                        RecordView::Srv {
                            name: &record.name,
                            hostname: &target.host,
                            port: *port,
                            ttl: record.ttl,
                        },
                        netif,
                        family,
                        browse_changed,
                    );
                }
            }
            RData::Txt(rdata) => {
                if record.ttl > 0 && !rdata.is_empty() {
                    if let Some(index) = self.match_owned_instance(&record.name) {
                        if self.txt_is_loser(index, rdata) {
                            debug!("Lost TXT tiebreak on [{}], renaming", record.name);
                            *conflict = true;
                            self.rename_service(now, index);
                        }
                    }
                }

                if is_response {
                    self.feed_searches(
                        RecordView::Txt {
                            name: &record.name,
                            rdata,
                            ttl: record.ttl,
                        },
                        netif,
                        family,
                        browse_changed,
                    );
                }
            }
            RData::A(addr) => self.dispatch_addr(
                now,
                netif,
                family,
                is_response,
                record,
                IpAddr::V4(*addr),
                Family::V4,
                conflict,
                browse_changed,
            ),
            RData::Aaaa(addr) => self.dispatch_addr(
                now,
                netif,
                family,
                is_response,
                record,
                IpAddr::V6(*addr),
                Family::V6,
                conflict,
                browse_changed,
            ),
            RData::Ignored(_) => (),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_addr(
        &mut self,
        now: Instant,
        netif: u8,
        family: Family,
        is_response: bool,
        record: &wire::Record<'_>,
        addr: IpAddr,
        addr_family: Family,
        conflict: &mut bool,
        browse_changed: &mut [bool; MAX_BROWSES],
    ) {
        let name = &record.name;

        if name.service.is_empty()
            && name.host.eq_ignore_ascii_case(&self.hostname)
            && record.ttl > 0
        {
            let ours = self.netif(netif).and_then(|n| n.addr(addr_family));

            if ours != Some(addr) {
                let other = (0..MAX_INTERFACES as u8)
                    .filter(|i| *i != netif)
                    .find(|i| self.netif(*i).and_then(|n| n.addr(addr_family)) == Some(addr));

                if let Some(other) = other {
                    // Our own records echoed across a shared subnet: the
                    // peer interface owns the name
                    self.mark_duplicate(netif, addr_family, other);
                } else if let Some(ours) = ours {
                    let lost = match (ours, addr) {
                        (IpAddr::V4(a), IpAddr::V4(b)) => b.octets() > a.octets(),
                        (IpAddr::V6(a), IpAddr::V6(b)) => b.octets() > a.octets(),
                        _ => false,
                    };

                    if lost {
                        debug!("Lost address tiebreak for [{}], renaming host", name);
                        *conflict = true;
                        self.hostname = mangle(&self.hostname);
                        self.reprobe_all(now, true);
                    }
                }
            }
        }

        if is_response {
            self.feed_searches(
                RecordView::Addr {
                    host: &name.host,
                    addr,
                    ttl: record.ttl,
                },
                netif,
                family,
                browse_changed,
            );
        }
    }

    fn mark_duplicate(&mut self, netif: u8, family: Family, other: u8) {
        let Some(slot) = self.netifs.get_mut(netif as usize).and_then(|n| n.as_mut()) else {
            return;
        };

        if matches!(slot.pcb(family).state, PcbState::Dup | PcbState::Off) {
            return;
        }

        debug!("Interface {} duplicates {}; going silent", netif, other);

        slot.duplicate_of = Some(other);
        let pcb = slot.pcb_mut(family);
        pcb.reset();
        pcb.state = PcbState::Dup;

        self.drop_netif_packets(netif, Some(family));
    }

    fn feed_searches(
        &mut self,
        view: RecordView<'_>,
        netif: u8,
        family: Family,
        browse_changed: &mut [bool; MAX_BROWSES],
    ) {
        let mut ended: heapless::Vec<u8, MAX_SEARCHES> = heapless::Vec::new();

        for (index, slot) in self.searches.iter_mut().enumerate() {
            if let Some(search) = slot {
                let outcome = search.feed(&view, netif, family);

                if outcome.full {
                    ended.push(index as u8).ok();
                }
            }
        }

        for (index, slot) in self.browses.iter_mut().enumerate() {
            if let Some(browse) = slot {
                if browse.feed(&view, netif, family).changed {
                    browse_changed[index] = true;
                }
            }
        }

        for id in ended {
            if let Some(search) = self.searches[id as usize].as_mut() {
                search.state = SearchState::Off;
            }
            self.push_internal(Action::SearchEnd(id));
        }
    }

    /// RFC 6762 lexicographic tiebreak over the serialized rdata.
    fn srv_is_loser(
        &self,
        index: usize,
        priority: u16,
        weight: u16,
        port: u16,
        target: &Name,
    ) -> bool {
        let service = &self.services[index];

        let our_target = match &service.hostname {
            Some(hostname) => [hostname.as_str(), "local"],
            None => [self.hostname.as_str(), "local"],
        };

        let mut ours = [0u8; 320];
        let mut theirs = [0u8; 320];

        let Ok(ours_len) = srv_rdata(
            &mut ours,
            service.priority,
            service.weight,
            service.port,
            &our_target,
        ) else {
            return false;
        };
        let Ok(theirs_len) = srv_rdata(&mut theirs, priority, weight, port, &target.labels())
        else {
            return false;
        };

        ours[..ours_len].make_ascii_lowercase();
        theirs[..theirs_len].make_ascii_lowercase();

        theirs[..theirs_len] > ours[..ours_len]
    }

    fn txt_is_loser(&self, index: usize, theirs: &[u8]) -> bool {
        let mut buf = [0u8; 512];
        let mut out = BytesOut::new(&mut buf);

        if write_txt_rdata(&self.services[index].txt, &mut out).is_err() {
            return false;
        }

        let ours = out.written();

        match theirs.len().cmp(&ours.len()) {
            core::cmp::Ordering::Greater => true,
            core::cmp::Ordering::Less => false,
            core::cmp::Ordering::Equal => theirs > ours,
        }
    }

    /// Lost a tiebreak: mangle whichever name produced the instance and
    /// probe it again everywhere.
    fn rename_service(&mut self, now: Instant, index: usize) {
        enum Target {
            Instance,
            Default,
            FromHost,
        }

        let target = {
            let service = &self.services[index];
            if service.instance.is_some() {
                Target::Instance
            } else if self.instance.is_some() {
                Target::Default
            } else {
                Target::FromHost
            }
        };

        match target {
            Target::Instance => {
                let mangled = mangle(self.services[index].instance.as_ref().unwrap());
                self.services[index].instance = Some(mangled);
            }
            Target::Default => {
                let mangled = mangle(self.instance.as_ref().unwrap());
                self.instance = Some(mangled);
            }
            Target::FromHost => {
                self.services[index].instance = Some(mangle(&self.hostname));
            }
        }

        let id = self.services[index].id;
        self.reprobe(now, &[id], false, true);
    }

    /// RFC 6762 known-answer suppression against our own scheduled
    /// replies.
    fn scrub_scheduled_answers(&mut self, id: u16) {
        for packet in self.tx_queue.iter_mut() {
            if packet.probe || packet.announce || packet.goodbye || packet.queued {
                continue;
            }

            packet.answers.retain(
                |r| !matches!(r.kind, TxRecordKind::ServicePtr { service } if service == id),
            );
        }

        self.tx_queue
            .retain(|p| p.probe || p.announce || p.goodbye || p.queued || !p.is_empty());
    }

    #[allow(clippy::too_many_arguments)]
    fn build_response(
        &mut self,
        now: Instant,
        netif: u8,
        family: Family,
        wire_id: u16,
        legacy: bool,
        src: SocketAddr,
        peer_probe: bool,
        matched: &[MatchedQuestion],
        suppressed: &[u16],
    ) {
        let mut packet = TxPacket::new(netif, family);
        packet.flags = AUTHORITATIVE_RESPONSE;

        let mut shared = false;
        let mut unicast_all = true;

        for question in matched {
            unicast_all &= question.unicast || legacy;

            match &question.kind {
                QuestionMatch::Discovery => {
                    shared = true;

                    for service in self.services.iter().filter(|s| !s.deleted) {
                        push_unique(
                            &mut packet.answers,
                            TxRecord::new(TxRecordKind::Sdptr { service: service.id }),
                        );
                    }
                }
                QuestionMatch::ServicePtr(ids) => {
                    shared = true;

                    for (id, subtype) in ids {
                        if suppressed.contains(id) {
                            continue;
                        }

                        let kind = match subtype {
                            Some(subtype) => TxRecordKind::SubPtr {
                                service: *id,
                                subtype: *subtype,
                            },
                            None => TxRecordKind::ServicePtr { service: *id },
                        };

                        push_unique(&mut packet.answers, TxRecord::new(kind));
                        self.push_service_details(&mut packet, *id);
                    }
                }
                QuestionMatch::ServiceSrv(id) => {
                    let record = TxRecord {
                        kind: TxRecordKind::Srv { service: *id },
                        bye: false,
                        flush: !self.service_is_delegated(*id),
                    };

                    if self.service_is_delegated(*id) {
                        push_unique(&mut packet.additional, record);
                    } else {
                        push_unique(&mut packet.answers, record);
                    }

                    self.push_host_addrs(&mut packet, *id);
                }
                QuestionMatch::ServiceTxt(id) => {
                    let record = TxRecord {
                        kind: TxRecordKind::Txt { service: *id },
                        bye: false,
                        flush: !self.service_is_delegated(*id),
                    };

                    if self.service_is_delegated(*id) {
                        push_unique(&mut packet.additional, record);
                    } else {
                        push_unique(&mut packet.answers, record);
                    }
                }
                QuestionMatch::ServiceAny(id) => {
                    shared = true;

                    if self.service_is_delegated(*id) {
                        push_unique(
                            &mut packet.additional,
                            TxRecord::new(TxRecordKind::Srv { service: *id }),
                        );
                        push_unique(
                            &mut packet.additional,
                            TxRecord::new(TxRecordKind::Txt { service: *id }),
                        );
                    } else {
                        push_unique(
                            &mut packet.answers,
                            TxRecord::flush(TxRecordKind::Srv { service: *id }),
                        );
                        push_unique(
                            &mut packet.answers,
                            TxRecord::flush(TxRecordKind::Txt { service: *id }),
                        );
                    }

                    push_unique(
                        &mut packet.answers,
                        TxRecord::new(TxRecordKind::ServicePtr { service: *id }),
                    );
                    self.push_host_addrs(&mut packet, *id);
                }
                QuestionMatch::HostAddr(host) => {
                    let flush = matches!(host, HostRef::Own);

                    let kind = if question.rtype == u16::from(RecordType::A) {
                        TxRecordKind::HostA { host: *host }
                    } else {
                        TxRecordKind::HostAaaa { host: *host }
                    };

                    push_unique(
                        &mut packet.answers,
                        TxRecord {
                            kind,
                            bye: false,
                            flush,
                        },
                    );
                }
                QuestionMatch::HostAny(host) => {
                    let flush = matches!(host, HostRef::Own);

                    for kind in [
                        TxRecordKind::HostA { host: *host },
                        TxRecordKind::HostAaaa { host: *host },
                    ] {
                        push_unique(
                            &mut packet.answers,
                            TxRecord {
                                kind,
                                bye: false,
                                flush,
                            },
                        );
                    }
                }
                QuestionMatch::Reverse { host, addr } => {
                    push_unique(
                        &mut packet.answers,
                        TxRecord::new(TxRecordKind::ReversePtr {
                            host: *host,
                            addr: *addr,
                        }),
                    );
                }
            }
        }

        if packet.answers.is_empty() && packet.additional.is_empty() {
            return;
        }

        if legacy {
            packet.legacy = true;
            packet.wire_id = wire_id;

            for question in matched {
                packet
                    .echo_questions
                    .push(EchoQuestion {
                        name: question.name.clone(),
                        rtype: question.rtype,
                    })
                    .ok();
            }
        }

        if legacy || unicast_all {
            packet.dst = Some(src);
        }

        let delay = if legacy || unicast_all || peer_probe || !shared {
            Duration::from_millis(0)
        } else {
            self.shared_delay()
        };

        if self.tx_queue.schedule(packet, now + delay).is_err() {
            warn!("Tx queue full, dropping reply");
        }
    }

    /// SRV, TXT and address records riding along with a PTR answer.
    fn push_service_details(&self, packet: &mut TxPacket, id: u16) {
        let delegated = self.service_is_delegated(id);

        push_unique(
            &mut packet.additional,
            TxRecord {
                kind: TxRecordKind::Srv { service: id },
                bye: false,
                flush: !delegated,
            },
        );
        push_unique(
            &mut packet.additional,
            TxRecord {
                kind: TxRecordKind::Txt { service: id },
                bye: false,
                flush: !delegated,
            },
        );

        self.push_host_addrs(packet, id);
    }

    fn push_host_addrs(&self, packet: &mut TxPacket, id: u16) {
        let host = self.service_host_ref(id);
        let flush = matches!(host, HostRef::Own);

        for kind in [
            TxRecordKind::HostA { host },
            TxRecordKind::HostAaaa { host },
        ] {
            push_unique(
                &mut packet.additional,
                TxRecord {
                    kind,
                    bye: false,
                    flush,
                },
            );
        }
    }

    fn service_host_ref(&self, id: u16) -> HostRef {
        self.services
            .iter()
            .find(|s| s.id == id)
            .and_then(|s| s.hostname.as_ref())
            .and_then(|hostname| self.find_delegated(hostname))
            .map(|h| HostRef::Delegated(h.id))
            .unwrap_or(HostRef::Own)
    }

    fn service_is_delegated(&self, id: u16) -> bool {
        matches!(self.service_host_ref(id), HostRef::Delegated(_))
    }
}

fn push_unique<const N: usize>(records: &mut heapless::Vec<TxRecord, N>, record: TxRecord) {
    if !records.contains(&record) {
        records.push(record).ok();
    }
}

fn srv_rdata(
    buf: &mut [u8],
    priority: u16,
    weight: u16,
    port: u16,
    target: &[&str],
) -> Result<usize, wire::Error> {
    let mut out = BytesOut::new(buf);

    out.u16(priority)?.u16(weight)?.u16(port)?;
    wire::write_fqdn(&mut out, target, false)?;

    Ok(out.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    use core::net::Ipv4Addr;

    use crate::wire::CLASS_IN;
    use crate::MAX_PACKET_SIZE;

    const OUR_IP: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
    const MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

    fn zero_rand(buf: &mut [u8]) {
        buf.fill(0);
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 99)), port)
    }

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    fn server_with_netif() -> (Server, u8) {
        let mut server = Server::new("alpha", zero_rand, Config::default()).unwrap();
        let netif = server.register_netif().unwrap();
        server
            .netif_action(
                netif,
                NetifAction::EnableV4 {
                    addr: OUR_IP,
                    mask: MASK,
                },
            )
            .unwrap();

        (server, netif)
    }

    struct Out {
        transmit: Transmit,
        data: heapless::Vec<u8, 768>,
    }

    /// One executor turn: sweep, then flush everything sendable.
    fn drain(server: &mut Server, now: Instant) -> heapless::Vec<Out, 8> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut outs = heapless::Vec::new();

        server.tick(now);

        while let Some(transmit) = server.poll_transmit(now, &mut buf) {
            outs.push(Out {
                transmit,
                data: heapless::Vec::from_slice(&buf[..transmit.len]).unwrap(),
            })
            .ok();
        }

        outs
    }

    #[derive(Debug)]
    enum ORData {
        A(Ipv4Addr),
        Ptr(Name),
        Srv { port: u16, target: Name },
        Txt,
        Other,
    }

    struct DecodedRecord {
        name: Name,
        rtype: u16,
        ttl: u32,
        flush: bool,
        rdata: ORData,
    }

    fn decode(
        data: &[u8],
    ) -> (
        wire::Header,
        heapless::Vec<Question, 8>,
        heapless::Vec<DecodedRecord, 24>,
    ) {
        let mut bytes = BytesIn::new(data);
        let header = wire::Header::decode(&mut bytes).unwrap();

        let mut questions = heapless::Vec::new();
        for _ in 0..header.questions {
            questions.push(read_question(&mut bytes, true).unwrap()).ok();
        }

        let total = header.answers + header.servers + header.additional;
        let mut records = heapless::Vec::new();
        for _ in 0..total {
            let record = read_record(&mut bytes, true).unwrap();

            let rdata = match record.rdata {
                RData::A(addr) => ORData::A(addr),
                RData::Ptr(name) => ORData::Ptr(name),
                RData::Srv { port, target, .. } => ORData::Srv { port, target },
                RData::Txt(_) => ORData::Txt,
                _ => ORData::Other,
            };

            records
                .push(DecodedRecord {
                    name: record.name,
                    rtype: record.rtype,
                    ttl: record.ttl,
                    flush: record.class & wire::CACHE_FLUSH != 0,
                    rdata,
                })
                .ok();
        }

        (header, questions, records)
    }

    fn name_rdata(labels: &[&str]) -> heapless::Vec<u8, 128> {
        let mut tmp = [0u8; 128];
        let mut out = BytesOut::new(&mut tmp);
        wire::write_fqdn(&mut out, labels, false).unwrap();

        heapless::Vec::from_slice(out.written()).unwrap()
    }

    struct Rx {
        data: heapless::Vec<u8, 512>,
        questions: u16,
        answers: u16,
    }

    impl Rx {
        fn new(id: u16, flags: u16) -> Self {
            let mut data = heapless::Vec::new();
            data.extend_from_slice(&id.to_be_bytes()).unwrap();
            data.extend_from_slice(&flags.to_be_bytes()).unwrap();
            data.extend_from_slice(&[0; 8]).unwrap();

            Self {
                data,
                questions: 0,
                answers: 0,
            }
        }

        fn question(mut self, labels: &[&str], rtype: RecordType) -> Self {
            let mut tmp = [0u8; 256];
            let mut out = BytesOut::new(&mut tmp);
            wire::write_question(&mut out, labels, rtype.into(), CLASS_IN).unwrap();

            self.data.extend_from_slice(out.written()).unwrap();
            self.questions += 1;

            self
        }

        fn record(mut self, labels: &[&str], rtype: RecordType, ttl: u32, rdata: &[u8]) -> Self {
            let mut tmp = [0u8; 256];
            let mut out = BytesOut::new(&mut tmp);
            wire::write_fqdn(&mut out, labels, false).unwrap();
            out.u16(rtype.into()).unwrap();
            out.u16(CLASS_IN).unwrap();
            out.u32(ttl).unwrap();
            out.u16(rdata.len() as u16).unwrap();
            out.push(rdata).unwrap();

            self.data.extend_from_slice(out.written()).unwrap();
            self.answers += 1;

            self
        }

        fn ptr(self, owner: &[&str], target: &[&str], ttl: u32) -> Self {
            let rdata = name_rdata(target);
            self.record(owner, RecordType::Ptr, ttl, &rdata)
        }

        fn srv(self, owner: &[&str], port: u16, target: &[&str], ttl: u32) -> Self {
            let mut rdata = heapless::Vec::<u8, 160>::new();
            rdata.extend_from_slice(&[0, 0, 0, 0]).unwrap();
            rdata.extend_from_slice(&port.to_be_bytes()).unwrap();
            rdata.extend_from_slice(&name_rdata(target)).unwrap();

            self.record(owner, RecordType::Srv, ttl, &rdata)
        }

        fn a(self, owner: &[&str], addr: Ipv4Addr, ttl: u32) -> Self {
            self.record(owner, RecordType::A, ttl, &addr.octets())
        }

        fn txt(self, owner: &[&str], rdata: &[u8], ttl: u32) -> Self {
            self.record(owner, RecordType::Txt, ttl, rdata)
        }

        fn finish(mut self) -> heapless::Vec<u8, 512> {
            self.data[4..6].copy_from_slice(&self.questions.to_be_bytes());
            self.data[6..8].copy_from_slice(&self.answers.to_be_bytes());

            self.data
        }
    }

    fn ptr_query_spec() -> QuerySpec {
        QuerySpec {
            instance: None,
            service: Some(NameString::try_from("_http").unwrap()),
            proto: Some(Proto::Tcp),
            rtype: RecordType::Ptr,
            unicast: false,
            timeout: Duration::from_millis(2000),
            max_results: 10,
        }
    }

    /// Drive a fresh responder with one registered service to Running.
    fn running_with_service() -> (Server, u8) {
        let (mut server, netif) = server_with_netif();

        server
            .service_add(
                at(0),
                Some("foo"),
                "_http",
                Proto::Tcp,
                None,
                80,
                &[("path", Some(b"/"))],
            )
            .unwrap();

        assert!(drain(&mut server, at(0)).is_empty());

        for ms in [120, 370, 620, 870, 1870, 2870] {
            assert_eq!(drain(&mut server, at(ms)).len(), 1);
        }

        assert_eq!(server.netif_state(netif, Family::V4), Some(PcbState::Running));

        (server, netif)
    }

    #[test]
    fn probe_without_conflict_reaches_running() {
        let (mut server, netif) = server_with_netif();

        // Nothing leaves before the initial probe delay
        assert!(drain(&mut server, at(0)).is_empty());

        let mut probes = 0;
        for ms in [120, 370, 620] {
            let outs = drain(&mut server, at(ms));
            assert_eq!(outs.len(), 1);

            let (header, questions, records) = decode(&outs[0].data);
            assert_eq!(header.flags, 0);
            assert_eq!(questions.len(), 1);
            assert_eq!(questions[0].rtype, u16::from(RecordType::Any));
            assert_eq!(questions[0].name.host, "alpha");
            assert_eq!(questions[0].name.domain, "local");

            // The proposed A record rides in the authority section
            assert_eq!(header.servers, 1);
            assert!(records
                .iter()
                .any(|r| matches!(r.rdata, ORData::A(addr) if addr == OUR_IP)));

            probes += 1;
        }
        assert_eq!(probes, 3);

        assert_eq!(
            server.netif_state(netif, Family::V4),
            Some(PcbState::Announce(1))
        );

        // Announcement: authoritative, A record with the interface IP
        let outs = drain(&mut server, at(870));
        assert_eq!(outs.len(), 1);

        let (header, _, records) = decode(&outs[0].data);
        assert_eq!(header.flags, AUTHORITATIVE_RESPONSE);
        let a = records
            .iter()
            .find(|r| r.rtype == u16::from(RecordType::A))
            .unwrap();
        assert_eq!(a.ttl, 120);
        assert!(a.flush);
        assert!(matches!(a.rdata, ORData::A(addr) if addr == OUR_IP));

        assert_eq!(drain(&mut server, at(1870)).len(), 1);
        assert_eq!(drain(&mut server, at(2870)).len(), 1);

        assert_eq!(server.netif_state(netif, Family::V4), Some(PcbState::Running));
    }

    #[test]
    fn host_collision_renames_and_reprobes() {
        let (mut server, netif) = server_with_netif();

        assert!(drain(&mut server, at(0)).is_empty());
        assert_eq!(drain(&mut server, at(120)).len(), 1);

        // A lexicographically larger peer claims alpha.local mid-probe
        let packet = Rx::new(0, AUTHORITATIVE_RESPONSE)
            .a(&["alpha", "local"], Ipv4Addr::new(203, 0, 113, 9), 120)
            .finish();
        server.handle_rx(at(130), netif, Family::V4, peer(PORT), &packet);

        assert_eq!(server.hostname_get(), "alpha-2");
        assert_eq!(
            server.netif_state(netif, Family::V4),
            Some(PcbState::Probe(1))
        );

        // Retry lands 120ms after the conflict; the old probe is gone
        let outs = drain(&mut server, at(250));
        assert_eq!(outs.len(), 1);

        let (_, questions, _) = decode(&outs[0].data);
        assert_eq!(questions[0].name.host, "alpha-2");

        assert!(drain(&mut server, at(370)).is_empty());

        // A smaller peer loses the tiebreak; our name stays
        let packet = Rx::new(0, AUTHORITATIVE_RESPONSE)
            .a(&["alpha-2", "local"], Ipv4Addr::new(10, 0, 0, 1), 120)
            .finish();
        server.handle_rx(at(400), netif, Family::V4, peer(PORT), &packet);

        assert_eq!(server.hostname_get(), "alpha-2");
    }

    #[test]
    fn ptr_search_aggregates_across_packets() {
        let (mut server, netif) = server_with_netif();

        let id = server.query_async_new(at(0), ptr_query_spec()).unwrap();

        assert!(drain(&mut server, at(0)).is_empty());

        // The sweep promotes the search and sends its question
        let outs = drain(&mut server, at(100));
        assert_eq!(outs.len(), 1);
        let (header, questions, _) = decode(&outs[0].data);
        assert_eq!(header.flags, 0);
        assert_eq!(questions[0].rtype, u16::from(RecordType::Ptr));
        assert_eq!(questions[0].name.service, "_http");

        let stype = ["_http", "_tcp", "local"];
        let instance = ["kitchen", "_http", "_tcp", "local"];

        let packets = [
            Rx::new(0, AUTHORITATIVE_RESPONSE)
                .ptr(&stype, &instance, 4500)
                .finish(),
            Rx::new(0, AUTHORITATIVE_RESPONSE)
                .srv(&instance, 80, &["kitchen", "local"], 120)
                .finish(),
            Rx::new(0, AUTHORITATIVE_RESPONSE)
                .a(&["kitchen", "local"], Ipv4Addr::new(192, 0, 2, 5), 120)
                .finish(),
        ];

        for packet in &packets {
            server.handle_rx(at(200), netif, Family::V4, peer(PORT), packet);
        }

        let results = server.query_async_get_results(id).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].instance, "kitchen");
        assert_eq!(results[0].hostname, "kitchen");
        assert_eq!(results[0].port, 80);
        assert_eq!(
            results[0].addrs.as_slice(),
            &[IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5))]
        );
        assert!(results[0].ttl <= 4500);

        // Timeout ends the search and signals completion
        drain(&mut server, at(2200));
        assert_eq!(server.pop_event(), Some(Event::SearchDone(id)));
        assert!(server.search_done(id));

        let results = server.search_take_results(id).unwrap();
        assert_eq!(results.len(), 1);
        assert!(server.query_async_get_results(id).is_err());
    }

    #[test]
    fn known_answer_suppresses_reply() {
        let (mut server, netif) = running_with_service();

        // The peer already has our PTR with more than half the TTL left
        let packet = Rx::new(0, 0)
            .question(&["_http", "_tcp", "local"], RecordType::Ptr)
            .ptr(
                &["_http", "_tcp", "local"],
                &["foo", "_http", "_tcp", "local"],
                4000,
            )
            .finish();
        server.handle_rx(at(3000), netif, Family::V4, peer(PORT), &packet);

        assert!(drain(&mut server, at(3000)).is_empty());
        assert!(drain(&mut server, at(3200)).is_empty());

        // Without the known answer the same question is answered
        let packet = Rx::new(0, 0)
            .question(&["_http", "_tcp", "local"], RecordType::Ptr)
            .finish();
        server.handle_rx(at(3300), netif, Family::V4, peer(PORT), &packet);

        // Shared answers ride the rotating 25..100ms delay
        let outs = drain(&mut server, at(3325));
        assert_eq!(outs.len(), 1);
        assert!(outs[0].transmit.target.ip().is_multicast());

        let (header, _, records) = decode(&outs[0].data);
        assert_eq!(header.flags, AUTHORITATIVE_RESPONSE);

        let ptr = records
            .iter()
            .find(|r| r.rtype == u16::from(RecordType::Ptr))
            .unwrap();
        assert!(matches!(&ptr.rdata, ORData::Ptr(name) if name.host == "foo"));

        // SRV, TXT and A ride along in the additional section
        assert!(records.iter().any(|r| r.rtype == u16::from(RecordType::Srv)));
        assert!(records.iter().any(|r| r.rtype == u16::from(RecordType::Txt)));
        assert!(records.iter().any(|r| r.rtype == u16::from(RecordType::A)));
    }

    #[test]
    fn goodbye_on_service_remove() {
        let (mut server, _netif) = running_with_service();

        server
            .service_remove(at(4000), Some("foo"), "_http", Proto::Tcp)
            .unwrap();

        let outs = drain(&mut server, at(4000));
        assert_eq!(outs.len(), 1);

        let (header, _, records) = decode(&outs[0].data);
        assert_eq!(header.flags, AUTHORITATIVE_RESPONSE);
        assert_eq!(header.answers, 1);
        assert_eq!(records[0].ttl, 0);
        assert_eq!(records[0].rtype, u16::from(RecordType::Ptr));
        assert!(matches!(&records[0].rdata, ORData::Ptr(name) if name.host == "foo"));

        assert!(!server.service_exists(Some("foo"), "_http", Proto::Tcp));
    }

    #[test]
    fn service_lifecycle_is_observable() {
        let (mut server, _netif) = server_with_netif();

        assert!(!server.service_exists(Some("foo"), "_http", Proto::Tcp));

        server
            .service_add(at(0), Some("foo"), "_http", Proto::Tcp, None, 80, &[])
            .unwrap();
        assert!(server.service_exists(Some("foo"), "_http", Proto::Tcp));

        // The tuple is unique
        assert_eq!(
            server.service_add(at(0), Some("foo"), "_http", Proto::Tcp, None, 81, &[]),
            Err(Error::Conflict)
        );

        server
            .service_remove(at(10), Some("foo"), "_http", Proto::Tcp)
            .unwrap();
        assert!(!server.service_exists(Some("foo"), "_http", Proto::Tcp));
        assert_eq!(
            server.service_remove(at(10), Some("foo"), "_http", Proto::Tcp),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn hostname_change_flows_into_srv_targets() {
        let (mut server, _netif) = running_with_service();

        server.hostname_set("beta").unwrap();

        // The queued rename applies on the next turn and schedules the
        // re-probe 120ms out
        assert!(drain(&mut server, at(3000)).is_empty());

        let outs = drain(&mut server, at(3120));
        assert_eq!(outs.len(), 1);
        let (_, questions, _) = decode(&outs[0].data);
        assert!(questions.iter().any(|q| q.name.host == "beta"));

        drain(&mut server, at(3370));
        drain(&mut server, at(3620));

        let outs = drain(&mut server, at(3870));
        assert_eq!(outs.len(), 1);
        let (_, _, records) = decode(&outs[0].data);

        let srv = records
            .iter()
            .find(|r| r.rtype == u16::from(RecordType::Srv))
            .unwrap();
        assert!(matches!(&srv.rdata, ORData::Srv { target, .. } if target.host == "beta"));
    }

    #[test]
    fn browse_delivers_update_then_removal() {
        let (mut server, netif) = server_with_netif();

        let id = server.browse_new(at(0), "_http", Proto::Tcp).unwrap();

        // The browse question goes out as soon as the action processes
        let outs = drain(&mut server, at(0));
        assert_eq!(outs.len(), 1);
        let (_, questions, _) = decode(&outs[0].data);
        assert_eq!(questions[0].rtype, u16::from(RecordType::Ptr));

        let stype = ["_http", "_tcp", "local"];
        let instance = ["kitchen", "_http", "_tcp", "local"];

        let packet = Rx::new(0, AUTHORITATIVE_RESPONSE)
            .ptr(&stype, &instance, 4500)
            .srv(&instance, 80, &["kitchen", "local"], 120)
            .txt(&instance, b"\x06path=/", 4500)
            .a(&["kitchen", "local"], Ipv4Addr::new(192, 0, 2, 5), 120)
            .finish();
        server.handle_rx(at(500), netif, Family::V4, peer(PORT), &packet);

        drain(&mut server, at(500));
        assert_eq!(server.pop_event(), Some(Event::BrowseSync(id)));

        let mut delivered = 0;
        server
            .browse_take_changes(id, |result| {
                delivered += 1;
                assert_eq!(result.instance, "kitchen");
                assert_eq!(result.hostname, "kitchen");
                assert_eq!(result.port, 80);
                assert_eq!(result.txt.len(), 1);
                assert_eq!(result.txt[0].key, "path");
                assert_eq!(
                    result.addrs.as_slice(),
                    &[IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5))]
                );
                assert!(result.ttl <= 4500);
            })
            .unwrap();
        assert_eq!(delivered, 1);

        // Goodbye: the result is detached and delivered once with TTL 0
        let packet = Rx::new(0, AUTHORITATIVE_RESPONSE)
            .ptr(&stype, &instance, 0)
            .finish();
        server.handle_rx(at(600), netif, Family::V4, peer(PORT), &packet);

        drain(&mut server, at(600));
        assert_eq!(server.pop_event(), Some(Event::BrowseSync(id)));

        let mut removed = 0;
        server
            .browse_take_changes(id, |result| {
                removed += 1;
                assert_eq!(result.ttl, 0);
                assert_eq!(result.instance, "kitchen");
            })
            .unwrap();
        assert_eq!(removed, 1);

        server.browse_delete(id).unwrap();
        drain(&mut server, at(700));
        assert!(server.browse_take_changes(id, |_| ()).is_err());
    }

    #[test]
    fn legacy_query_is_echoed_unicast() {
        let (mut server, netif) = running_with_service();

        let packet = Rx::new(0x4242, 0)
            .question(&["foo", "_http", "_tcp", "local"], RecordType::Srv)
            .finish();

        let source = peer(4321);
        server.handle_rx(at(3000), netif, Family::V4, source, &packet);

        let outs = drain(&mut server, at(3000));
        assert_eq!(outs.len(), 1);
        assert_eq!(outs[0].transmit.target, source);

        let (header, questions, records) = decode(&outs[0].data);
        assert_eq!(header.id, 0x4242);
        assert_eq!(header.questions, 1);
        assert_eq!(questions[0].name.host, "foo");
        assert!(records.iter().any(|r| r.rtype == u16::from(RecordType::Srv)));
    }

    #[test]
    fn second_interface_on_same_subnet_goes_dup() {
        let (mut server, first) = server_with_netif();
        drain(&mut server, at(0));

        let second = server.register_netif().unwrap();
        server
            .netif_action(
                second,
                NetifAction::EnableV4 {
                    addr: Ipv4Addr::new(192, 0, 2, 2),
                    mask: MASK,
                },
            )
            .unwrap();
        drain(&mut server, at(10));

        assert_eq!(server.netif_state(second, Family::V4), Some(PcbState::Dup));

        // The owning interface going away promotes the duplicate
        server
            .netif_action(first, NetifAction::Disable(Family::V4))
            .unwrap();
        drain(&mut server, at(20));

        assert_eq!(
            server.netif_state(second, Family::V4),
            Some(PcbState::Probe(1))
        );
    }

    #[test]
    fn reverse_query_answered_when_enabled() {
        let mut config = Config::default();
        config.respond_reverse_queries = true;

        let mut server = Server::new("alpha", zero_rand, config).unwrap();
        let netif = server.register_netif().unwrap();
        server
            .netif_action(
                netif,
                NetifAction::EnableV4 {
                    addr: OUR_IP,
                    mask: MASK,
                },
            )
            .unwrap();

        drain(&mut server, at(0));
        for ms in [120, 370, 620, 870, 1870, 2870] {
            drain(&mut server, at(ms));
        }

        let packet = Rx::new(0, 0)
            .question(&["1", "2", "0", "192", "in-addr", "arpa"], RecordType::Ptr)
            .finish();
        server.handle_rx(at(3000), netif, Family::V4, peer(PORT), &packet);

        let outs = drain(&mut server, at(3000));
        assert_eq!(outs.len(), 1);

        let (_, _, records) = decode(&outs[0].data);
        assert_eq!(records[0].rtype, u16::from(RecordType::Ptr));
        assert!(records[0].name.reverse.is_some());
        assert!(matches!(&records[0].rdata, ORData::Ptr(name) if name.host == "alpha"));
    }

    #[test]
    fn stop_sends_goodbyes_and_finishes() {
        let (mut server, _netif) = running_with_service();

        server.stop().unwrap();

        let outs = drain(&mut server, at(5000));
        assert_eq!(outs.len(), 1);

        let (_, _, records) = decode(&outs[0].data);
        assert!(records.iter().all(|r| r.ttl == 0));

        assert!(server.is_stopped());
        assert!(server.finished());
        assert_eq!(server.hostname_set("x"), Err(Error::InvalidState));
    }
}

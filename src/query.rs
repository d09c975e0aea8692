//! The query and browse engines: filters, result aggregation across
//! fragmented response packets, and browse delta tracking.

use core::net::IpAddr;

use embassy_time::{Duration, Instant};

use crate::host::{Proto, TxtItem};
use crate::pcb::Family;
use crate::wire::{Name, RecordType};
use crate::{NameString, MAX_ADDRS, MAX_RESULTS, MAX_TXT_ITEMS};

/// What a search (or browse) is looking for.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    /// Instance name filter; for A/AAAA queries this is the hostname.
    pub instance: Option<NameString>,
    /// Service type, e.g. `_http`.
    pub service: Option<NameString>,
    pub proto: Option<Proto>,
    pub rtype: RecordType,
    /// Ask peers for a unicast reply.
    pub unicast: bool,
    pub timeout: Duration,
    pub max_results: u8,
}

/// One aggregated discovery result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    pub instance: NameString,
    pub hostname: NameString,
    pub port: u16,
    pub txt: heapless::Vec<TxtItem, MAX_TXT_ITEMS>,
    pub addrs: heapless::Vec<IpAddr, MAX_ADDRS>,
    /// Minimum TTL of the contributing records; 0 marks a browse removal.
    pub ttl: u32,
    pub netif: u8,
    pub family: Family,
}

impl QueryResult {
    fn new(instance: &str, ttl: u32, netif: u8, family: Family) -> Self {
        Self {
            instance: NameString::try_from(instance).unwrap_or_default(),
            hostname: NameString::new(),
            port: 0,
            txt: heapless::Vec::new(),
            addrs: heapless::Vec::new(),
            ttl,
            netif,
            family,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Init,
    Running,
    Off,
}

/// A distilled view of one received record, fed to the aggregator.
#[derive(Debug, Clone)]
pub(crate) enum RecordView<'a> {
    /// PTR answer: owner carries the service type, `instance` the target.
    Ptr { name: &'a Name, instance: &'a str, ttl: u32 },
    /// SRV answer owned by an instance name.
    Srv {
        name: &'a Name,
        hostname: &'a str,
        port: u16,
        ttl: u32,
    },
    /// TXT answer owned by an instance name.
    Txt {
        name: &'a Name,
        rdata: &'a [u8],
        ttl: u32,
    },
    /// A or AAAA answer for `host.local`.
    Addr { host: &'a str, addr: IpAddr, ttl: u32 },
}

/// Outcome of feeding one record into a search.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct FeedOutcome {
    /// A result was created or materially changed.
    pub changed: bool,
    /// The max-results cap has been reached.
    pub full: bool,
}

/// An active search or browse. Browses are PTR searches without a
/// timeout whose consumers are notified per delta.
#[derive(Debug, Clone)]
pub(crate) struct Search {
    pub(crate) spec: QuerySpec,
    pub(crate) browse: bool,
    pub(crate) state: SearchState,
    /// Free the slot on End without waiting for a result pickup.
    pub(crate) detached: bool,
    pub(crate) started_at: Instant,
    pub(crate) sent_at: Option<Instant>,
    pub(crate) results: heapless::Vec<QueryResult, MAX_RESULTS>,
    /// Browse results whose TTL dropped to zero, staged for one delivery.
    pub(crate) removed: heapless::Vec<QueryResult, 4>,
    /// Results changed since the last sync, by index.
    pub(crate) dirty: heapless::Vec<u8, MAX_RESULTS>,
}

impl Search {
    pub(crate) fn new(spec: QuerySpec, browse: bool, now: Instant) -> Self {
        Self {
            spec,
            browse,
            state: SearchState::Init,
            detached: false,
            started_at: now,
            sent_at: None,
            results: heapless::Vec::new(),
            removed: heapless::Vec::new(),
            dirty: heapless::Vec::new(),
        }
    }

    pub(crate) fn timed_out(&self, now: Instant) -> bool {
        !self.browse && now >= self.started_at + self.spec.timeout
    }

    fn service_matches(&self, name: &Name) -> bool {
        let Some(service) = &self.spec.service else {
            return false;
        };

        name.matches_service(
            service,
            self.spec.proto.map(|p| p.as_str()).unwrap_or(""),
        )
    }

    fn instance_matches(&self, instance: &str) -> bool {
        match &self.spec.instance {
            Some(filter) => filter.eq_ignore_ascii_case(instance),
            None => true,
        }
    }

    fn result_index(&self, instance: &str, netif: u8, family: Family) -> Option<usize> {
        self.results.iter().position(|r| {
            r.instance.eq_ignore_ascii_case(instance) && r.netif == netif && r.family == family
        })
    }

    fn mark_dirty(&mut self, index: usize) {
        if !self.dirty.contains(&(index as u8)) {
            self.dirty.push(index as u8).ok();
        }
    }

    /// Feed a record that the dispatcher already parsed. Returns what
    /// changed so the dispatcher can fire browse syncs and search ends.
    pub(crate) fn feed(
        &mut self,
        view: &RecordView<'_>,
        netif: u8,
        family: Family,
    ) -> FeedOutcome {
        if self.state == SearchState::Off {
            return FeedOutcome::default();
        }

        match view {
            RecordView::Ptr { name, instance, ttl } => {
                self.feed_ptr(name, instance, *ttl, netif, family)
            }
            RecordView::Srv {
                name,
                hostname,
                port,
                ttl,
            } => self.feed_srv(name, hostname, *port, *ttl, netif, family),
            RecordView::Txt { name, rdata, ttl } => {
                self.feed_txt(name, rdata, *ttl, netif, family)
            }
            RecordView::Addr { host, addr, ttl } => {
                self.feed_addr(host, *addr, *ttl, netif, family)
            }
        }
    }

    fn feed_ptr(
        &mut self,
        name: &Name,
        instance: &str,
        ttl: u32,
        netif: u8,
        family: Family,
    ) -> FeedOutcome {
        let mut outcome = FeedOutcome::default();

        if !matches!(self.spec.rtype, RecordType::Ptr | RecordType::Any)
            || !self.service_matches(name)
            || !self.instance_matches(instance)
        {
            return outcome;
        }

        if let Some(index) = self.result_index(instance, netif, family) {
            if ttl == 0 {
                let mut result = self.results.remove(index);
                result.ttl = 0;
                self.dirty.retain(|i| *i as usize != index);
                // Re-point the remaining dirty indices
                for i in self.dirty.iter_mut() {
                    if *i as usize > index {
                        *i -= 1;
                    }
                }
                self.removed.push(result).ok();
                outcome.changed = true;
            } else {
                self.results[index].ttl = self.results[index].ttl.min(ttl);
            }
        } else if ttl > 0 && self.results.len() < self.spec.max_results as usize {
            if self.results.push(QueryResult::new(instance, ttl, netif, family)).is_ok() {
                self.mark_dirty(self.results.len() - 1);
                outcome.changed = true;
                outcome.full = self.results.len() >= self.spec.max_results as usize;
            }
        }

        outcome
    }

    fn feed_srv(
        &mut self,
        name: &Name,
        hostname: &str,
        port: u16,
        ttl: u32,
        netif: u8,
        family: Family,
    ) -> FeedOutcome {
        let mut outcome = FeedOutcome::default();

        if !self.service_matches(name) {
            return outcome;
        }

        let index = match self.spec.rtype {
            // A PTR search fills in instances it has already discovered
            RecordType::Ptr => self.result_index(&name.host, netif, family),
            RecordType::Srv | RecordType::Any if self.instance_matches(&name.host) => {
                match self.result_index(&name.host, netif, family) {
                    Some(index) => Some(index),
                    None if self.results.len() < self.spec.max_results as usize => {
                        self.results
                            .push(QueryResult::new(&name.host, ttl, netif, family))
                            .ok()
                            .map(|_| self.results.len() - 1)
                    }
                    None => None,
                }
            }
            _ => None,
        };

        if let Some(index) = index {
            let result = &mut self.results[index];

            if !result.hostname.eq_ignore_ascii_case(hostname) || result.port != port {
                result.hostname = NameString::try_from(hostname).unwrap_or_default();
                result.port = port;
                result.ttl = result.ttl.min(ttl);
                self.mark_dirty(index);
                outcome.changed = true;

                if self.spec.rtype == RecordType::Srv {
                    outcome.full = self.results.len() >= self.spec.max_results as usize;
                }
            } else {
                result.ttl = result.ttl.min(ttl);
            }
        }

        outcome
    }

    fn feed_txt(
        &mut self,
        name: &Name,
        rdata: &[u8],
        ttl: u32,
        netif: u8,
        family: Family,
    ) -> FeedOutcome {
        let mut outcome = FeedOutcome::default();

        if !self.service_matches(name)
            || !matches!(self.spec.rtype, RecordType::Ptr | RecordType::Txt | RecordType::Any)
        {
            return outcome;
        }

        if let Some(index) = self.result_index(&name.host, netif, family) {
            let items = parse_txt_items(rdata);
            let result = &mut self.results[index];

            if result.txt != items {
                result.txt = items;
                result.ttl = result.ttl.min(ttl);
                self.mark_dirty(index);
                outcome.changed = true;
            } else {
                result.ttl = result.ttl.min(ttl);
            }
        }

        outcome
    }

    fn feed_addr(
        &mut self,
        host: &str,
        addr: IpAddr,
        ttl: u32,
        netif: u8,
        family: Family,
    ) -> FeedOutcome {
        let mut outcome = FeedOutcome::default();

        match self.spec.rtype {
            RecordType::A | RecordType::Aaaa | RecordType::Any => {
                if !self.instance_matches(host) {
                    return outcome;
                }

                let wanted_family = match self.spec.rtype {
                    RecordType::A => Family::V4,
                    RecordType::Aaaa => Family::V6,
                    _ => Family::of(&addr),
                };

                if Family::of(&addr) != wanted_family {
                    return outcome;
                }

                // Address-only results are keyed per (interface, family)
                // and carry one address list each
                let index = match self.result_index(host, netif, family) {
                    Some(index) => Some(index),
                    None if self.results.len() < self.spec.max_results as usize => self
                        .results
                        .push(QueryResult::new(host, ttl, netif, family))
                        .ok()
                        .map(|_| self.results.len() - 1),
                    None => None,
                };

                if let Some(index) = index {
                    let result = &mut self.results[index];
                    result.hostname = NameString::try_from(host).unwrap_or_default();

                    if !result.addrs.contains(&addr) && result.addrs.push(addr).is_ok() {
                        result.ttl = result.ttl.min(ttl);
                        self.mark_dirty(index);
                        outcome.changed = true;
                        outcome.full = self.results.len() >= self.spec.max_results as usize;
                    }
                }
            }
            RecordType::Ptr | RecordType::Srv => {
                for (index, result) in self.results.iter_mut().enumerate() {
                    if result.hostname.eq_ignore_ascii_case(host)
                        && !result.addrs.contains(&addr)
                        && result.addrs.push(addr).is_ok()
                    {
                        result.ttl = result.ttl.min(ttl);
                        self.dirty.push(index as u8).ok();
                        outcome.changed = true;
                    }
                }

                self.dirty.sort_unstable();
                let mut seen = heapless::Vec::<u8, MAX_RESULTS>::new();
                for i in self.dirty.iter() {
                    if !seen.contains(i) {
                        seen.push(*i).ok();
                    }
                }
                self.dirty = seen;
            }
            _ => (),
        }

        outcome
    }

    /// Copy out and clear the staged browse deltas.
    pub(crate) fn take_changes(
        &mut self,
        mut f: impl FnMut(&QueryResult),
    ) {
        let dirty = core::mem::take(&mut self.dirty);
        for index in dirty {
            if let Some(result) = self.results.get(index as usize) {
                f(result);
            }
        }

        let removed = core::mem::take(&mut self.removed);
        for result in &removed {
            f(result);
        }
    }
}

/// Split a raw TXT rdata into key/value items. Zero-length strings and
/// items that do not fit the bounded storage are skipped.
pub(crate) fn parse_txt_items(rdata: &[u8]) -> heapless::Vec<TxtItem, MAX_TXT_ITEMS> {
    let mut items = heapless::Vec::new();
    let mut rest = rdata;

    while let Some((&len, tail)) = rest.split_first() {
        let len = len as usize;
        if len == 0 || len > tail.len() {
            break;
        }

        let (chunk, tail) = tail.split_at(len);
        rest = tail;

        let (key, value) = match chunk.iter().position(|&b| b == b'=') {
            Some(eq) => (&chunk[..eq], Some(&chunk[eq + 1..])),
            None => (chunk, None),
        };

        if let Ok(key) = core::str::from_utf8(key) {
            if let Ok(item) = TxtItem::new(key, value) {
                items.push(item).ok();
            }
        }

        if items.is_full() {
            break;
        }
    }

    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr_spec(max_results: u8) -> QuerySpec {
        QuerySpec {
            instance: None,
            service: Some(NameString::try_from("_http").unwrap()),
            proto: Some(Proto::Tcp),
            rtype: RecordType::Ptr,
            unicast: false,
            timeout: Duration::from_millis(2000),
            max_results,
        }
    }

    fn http_name(host: &str) -> Name {
        Name {
            host: NameString::try_from(host).unwrap_or_default(),
            service: NameString::try_from("_http").unwrap(),
            proto: NameString::try_from("_tcp").unwrap(),
            domain: NameString::try_from("local").unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn ptr_then_srv_then_addr_aggregates() {
        let mut search = Search::new(ptr_spec(10), false, Instant::from_millis(0));
        search.state = SearchState::Running;

        let stype = http_name("");
        let outcome = search.feed(
            &RecordView::Ptr {
                name: &stype,
                instance: "kitchen",
                ttl: 4500,
            },
            0,
            Family::V4,
        );
        assert!(outcome.changed && !outcome.full);

        let instance = http_name("kitchen");
        search.feed(
            &RecordView::Srv {
                name: &instance,
                hostname: "kitchen",
                port: 80,
                ttl: 120,
            },
            0,
            Family::V4,
        );

        search.feed(
            &RecordView::Addr {
                host: "kitchen",
                addr: IpAddr::V4(core::net::Ipv4Addr::new(192, 0, 2, 5)),
                ttl: 120,
            },
            0,
            Family::V4,
        );

        assert_eq!(search.results.len(), 1);
        let result = &search.results[0];
        assert_eq!(result.instance, "kitchen");
        assert_eq!(result.hostname, "kitchen");
        assert_eq!(result.port, 80);
        assert_eq!(
            result.addrs.as_slice(),
            &[IpAddr::V4(core::net::Ipv4Addr::new(192, 0, 2, 5))]
        );
        assert!(result.ttl <= 4500);
    }

    #[test]
    fn results_capped_at_max() {
        let mut search = Search::new(ptr_spec(2), false, Instant::from_millis(0));
        search.state = SearchState::Running;

        let stype = http_name("");
        for (i, instance) in ["a", "b", "c"].iter().enumerate() {
            let outcome = search.feed(
                &RecordView::Ptr {
                    name: &stype,
                    instance,
                    ttl: 4500,
                },
                0,
                Family::V4,
            );

            if i == 1 {
                assert!(outcome.full);
            }
        }

        assert_eq!(search.results.len(), 2);
    }

    #[test]
    fn srv_search_creates_result() {
        let mut spec = ptr_spec(1);
        spec.rtype = RecordType::Srv;
        spec.instance = Some(NameString::try_from("kitchen").unwrap());

        let mut search = Search::new(spec, false, Instant::from_millis(0));
        search.state = SearchState::Running;

        let instance = http_name("kitchen");
        let outcome = search.feed(
            &RecordView::Srv {
                name: &instance,
                hostname: "galley",
                port: 8080,
                ttl: 120,
            },
            0,
            Family::V4,
        );

        assert!(outcome.changed && outcome.full);
        assert_eq!(search.results[0].hostname, "galley");
        assert_eq!(search.results[0].port, 8080);
    }

    #[test]
    fn browse_goodbye_stages_removal() {
        let mut search = Search::new(ptr_spec(10), true, Instant::from_millis(0));
        search.state = SearchState::Running;

        let stype = http_name("");
        search.feed(
            &RecordView::Ptr {
                name: &stype,
                instance: "kitchen",
                ttl: 4500,
            },
            0,
            Family::V4,
        );

        let outcome = search.feed(
            &RecordView::Ptr {
                name: &stype,
                instance: "kitchen",
                ttl: 0,
            },
            0,
            Family::V4,
        );
        assert!(outcome.changed);
        assert!(search.results.is_empty());

        let mut delivered = heapless::Vec::<u32, 4>::new();
        search.take_changes(|result| {
            delivered.push(result.ttl).ok();
        });

        assert_eq!(delivered.as_slice(), &[0]);
    }

    #[test]
    fn unchanged_records_do_not_dirty() {
        let mut search = Search::new(ptr_spec(10), true, Instant::from_millis(0));
        search.state = SearchState::Running;

        let stype = http_name("");
        let instance = http_name("kitchen");

        search.feed(
            &RecordView::Ptr {
                name: &stype,
                instance: "kitchen",
                ttl: 4500,
            },
            0,
            Family::V4,
        );
        search.feed(
            &RecordView::Srv {
                name: &instance,
                hostname: "kitchen",
                port: 80,
                ttl: 120,
            },
            0,
            Family::V4,
        );
        search.take_changes(|_| ());

        // Same data again: no new delta
        let outcome = search.feed(
            &RecordView::Srv {
                name: &instance,
                hostname: "kitchen",
                port: 80,
                ttl: 120,
            },
            0,
            Family::V4,
        );
        assert!(!outcome.changed);

        let mut count = 0;
        search.take_changes(|_| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn browse_does_not_time_out() {
        let search = Search::new(ptr_spec(10), true, Instant::from_millis(0));
        assert!(!search.timed_out(Instant::from_millis(1_000_000)));

        let search = Search::new(ptr_spec(10), false, Instant::from_millis(0));
        assert!(search.timed_out(Instant::from_millis(2_000)));
    }

    #[test]
    fn txt_items_parse() {
        let items = parse_txt_items(b"\x06path=/\x04bold\x00junk");

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].key, "path");
        assert_eq!(items[0].value.as_deref(), Some(b"/".as_slice()));
        assert_eq!(items[1].key, "bold");
        assert_eq!(items[1].value, None);
    }
}

//! The async layer: socket plumbing via `edge-nal`, the executor loop
//! serializing all mutations, and the awaitable query/browse API.

use core::cell::RefCell;
use core::fmt;
use core::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use embassy_futures::select::{select3, Either3};

use embassy_sync::blocking_mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::signal::Signal;

use embassy_time::{Instant, Timer};

use edge_nal::{MulticastV4, MulticastV6, Readable, UdpBind, UdpReceive, UdpSend};

use log::{debug, warn};

use crate::host::Proto;
use crate::pcb::{Family, NetifAction};
use crate::query::{QueryResult, QuerySpec};
use crate::server::{Event, Server};
use crate::{
    Error, NameString, MAX_BROWSES, MAX_INTERFACES, MAX_PACKET_SIZE, MAX_RESULTS, MAX_SEARCHES,
    MULTICAST_IPV4, MULTICAST_IPV6, PORT,
};

/// A quick-and-dirty socket address that binds to a "default" interface.
/// Don't use in production code.
pub const DEFAULT_SOCKET: SocketAddr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), PORT);

/// A wrapper for service and IO errors.
#[derive(Debug)]
pub enum IoError<E> {
    Service(Error),
    Io(E),
}

impl<E> From<Error> for IoError<E> {
    fn from(err: Error) -> Self {
        Self::Service(err)
    }
}

impl<E> fmt::Display for IoError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service(err) => write!(f, "mDNS error: {}", err),
            Self::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

#[cfg(feature = "std")]
impl<E> std::error::Error for IoError<E> where E: std::error::Error {}

/// A utility method to bind a socket suitable for mDNS, by using the
/// provided stack and address, and optionally joining the multicast
/// groups on the provided interfaces.
///
/// mDNS is pointless without multicast, so at least one - or both - of
/// the ipv4 and ipv6 interfaces should be provided.
pub async fn bind<S>(
    stack: &S,
    addr: SocketAddr,
    ipv4_interface: Option<Ipv4Addr>,
    ipv6_interface: Option<u32>,
) -> Result<S::Socket<'_>, IoError<S::Error>>
where
    S: UdpBind,
{
    let mut socket = stack.bind(addr).await.map_err(IoError::Io)?;

    if let Some(v4) = ipv4_interface {
        socket
            .join_v4(MULTICAST_IPV4, v4)
            .await
            .map_err(IoError::Io)?;
    }

    if let Some(v6) = ipv6_interface {
        socket
            .join_v6(MULTICAST_IPV6, v6)
            .await
            .map_err(IoError::Io)?;
    }

    Ok(socket)
}

/// The mDNS responder/resolver front-end.
///
/// Wraps the sans-io [`Server`] core in a blocking mutex, runs the
/// executor loop against a socket pair per interface, and exposes the
/// public API. API methods take effect in action-queue order; queries
/// and browses await their completion signal.
pub struct Mdns<M>
where
    M: RawMutex,
{
    server: blocking_mutex::Mutex<M, RefCell<Server>>,
    wakes: [Signal<M, ()>; MAX_INTERFACES],
    search_signals: [Signal<M, ()>; MAX_SEARCHES],
    browse_signals: [Signal<M, ()>; MAX_BROWSES],
}

impl<M> Mdns<M>
where
    M: RawMutex,
{
    /// Wrap a [`Server`] core.
    pub fn new(server: Server) -> Self {
        Self {
            server: blocking_mutex::Mutex::new(RefCell::new(server)),
            wakes: core::array::from_fn(|_| Signal::new()),
            search_signals: core::array::from_fn(|_| Signal::new()),
            browse_signals: core::array::from_fn(|_| Signal::new()),
        }
    }

    /// Run one executor task against the socket pair of one registered
    /// interface. Returns once [`Mdns::close`] has been processed and
    /// the goodbyes are out.
    pub async fn run<R, S>(
        &self,
        netif: u8,
        mut recv: R,
        mut send: S,
    ) -> Result<(), IoError<S::Error>>
    where
        R: UdpReceive + Readable,
        S: UdpSend<Error = R::Error>,
    {
        let mut rx_buf = [0; MAX_PACKET_SIZE];
        let mut tx_buf = [0; MAX_PACKET_SIZE];

        loop {
            let now = Instant::now();

            loop {
                let transmit =
                    self.with(|server| server.poll_transmit_for(now, Some(netif), &mut tx_buf));

                let Some(transmit) = transmit else {
                    break;
                };

                debug!("Sending {} bytes to {}", transmit.len, transmit.target);

                if let Err(err) = send.send(transmit.target, &tx_buf[..transmit.len]).await {
                    // Best-effort: the state machine re-sends on its own
                    // schedule
                    warn!("Failed to send mDNS packet: {:?}", err);
                }
            }

            while let Some(event) = self.with(|server| server.pop_event()) {
                match event {
                    Event::SearchDone(id) => self.search_signals[id as usize].signal(()),
                    Event::BrowseSync(id) => self.browse_signals[id as usize].signal(()),
                }
            }

            if self.with(|server| server.finished()) {
                break Ok(());
            }

            let now = Instant::now();
            let mut deadline = now + self.with(|server| server.config().tick);

            if let Some(next) = self.with(|server| server.next_wakeup()) {
                if next < deadline {
                    deadline = next;
                }
            }

            let wake = &self.wakes[netif as usize];

            match select3(wake.wait(), Timer::at(deadline), recv.readable()).await {
                Either3::First(_) | Either3::Second(_) => (),
                Either3::Third(result) => {
                    result.map_err(IoError::Io)?;

                    let (len, src) = recv.receive(&mut rx_buf).await.map_err(IoError::Io)?;
                    let len = len.min(rx_buf.len());

                    let family = match src {
                        SocketAddr::V4(_) => Family::V4,
                        SocketAddr::V6(_) => Family::V6,
                    };

                    debug!("Got {} bytes from {}", len, src);

                    let now = Instant::now();
                    self.with(|server| server.handle_rx(now, netif, family, src, &rx_buf[..len]));
                }
            }

            let now = Instant::now();
            self.with(|server| server.tick(now));
        }
    }

    /// Queue the shutdown: goodbyes go out for every service, after
    /// which every `run` task returns.
    pub fn close(&self) -> Result<(), Error> {
        self.with(|server| server.stop())?;
        self.wake_all();

        Ok(())
    }

    // --- names ---

    pub fn hostname_get(&self) -> NameString {
        self.with(|server| NameString::try_from(server.hostname_get()).unwrap_or_default())
    }

    pub fn hostname_set(&self, hostname: &str) -> Result<(), Error> {
        self.apply(|server| server.hostname_set(hostname))
    }

    pub fn instance_name_set(&self, instance: &str) -> Result<(), Error> {
        self.apply(|server| server.instance_name_set(instance))
    }

    // --- delegated hosts ---

    pub fn delegate_hostname_add(&self, hostname: &str, addrs: &[IpAddr]) -> Result<(), Error> {
        self.apply(|server| server.delegate_hostname_add(hostname, addrs))
    }

    pub fn delegate_hostname_remove(&self, hostname: &str) -> Result<(), Error> {
        self.apply(|server| server.delegate_hostname_remove(hostname))
    }

    pub fn delegate_hostname_set_addr(
        &self,
        hostname: &str,
        addrs: &[IpAddr],
    ) -> Result<(), Error> {
        self.apply(|server| server.delegate_hostname_set_addr(hostname, addrs))
    }

    // --- services ---

    pub fn service_add(
        &self,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
        hostname: Option<&str>,
        port: u16,
        txt: &[(&str, Option<&[u8]>)],
    ) -> Result<(), Error> {
        let now = Instant::now();
        self.apply(|server| server.service_add(now, instance, service, proto, hostname, port, txt))
    }

    pub fn service_remove(
        &self,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
    ) -> Result<(), Error> {
        let now = Instant::now();
        self.apply(|server| server.service_remove(now, instance, service, proto))
    }

    pub fn service_remove_all(&self) {
        let now = Instant::now();
        self.with(|server| server.service_remove_all(now));
        self.wake_all();
    }

    pub fn service_port_set(
        &self,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
        port: u16,
    ) -> Result<(), Error> {
        let now = Instant::now();
        self.apply(|server| server.service_port_set(now, instance, service, proto, port))
    }

    pub fn service_txt_set(
        &self,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
        txt: &[(&str, Option<&[u8]>)],
    ) -> Result<(), Error> {
        let now = Instant::now();
        self.apply(|server| server.service_txt_set(now, instance, service, proto, txt))
    }

    pub fn service_txt_item_set(
        &self,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
        key: &str,
        value: Option<&[u8]>,
    ) -> Result<(), Error> {
        let now = Instant::now();
        self.apply(|server| server.service_txt_item_set(now, instance, service, proto, key, value))
    }

    pub fn service_txt_item_remove(
        &self,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
        key: &str,
    ) -> Result<(), Error> {
        let now = Instant::now();
        self.apply(|server| server.service_txt_item_remove(now, instance, service, proto, key))
    }

    pub fn service_subtype_add(
        &self,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
        subtype: &str,
    ) -> Result<(), Error> {
        let now = Instant::now();
        self.apply(|server| server.service_subtype_add(now, instance, service, proto, subtype))
    }

    pub fn service_subtype_remove(
        &self,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
        subtype: &str,
    ) -> Result<(), Error> {
        self.apply(|server| server.service_subtype_remove(instance, service, proto, subtype))
    }

    pub fn service_subtype_update(
        &self,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
        subtypes: &[&str],
    ) -> Result<(), Error> {
        let now = Instant::now();
        self.apply(|server| server.service_subtype_update(now, instance, service, proto, subtypes))
    }

    pub fn service_instance_name_set(
        &self,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
        new_instance: &str,
    ) -> Result<(), Error> {
        let now = Instant::now();
        self.apply(|server| {
            server.service_instance_name_set(now, instance, service, proto, new_instance)
        })
    }

    // --- queries ---

    /// One-shot search: resolves once the timeout elapses or the result
    /// cap fills, whichever is first. A timeout with no results is an
    /// empty, successful result set.
    pub async fn query(
        &self,
        spec: QuerySpec,
    ) -> Result<heapless::Vec<QueryResult, MAX_RESULTS>, Error> {
        let now = Instant::now();
        let id = self.apply(|server| server.query_async_new(now, spec))?;

        loop {
            if self.with(|server| server.search_done(id)) {
                break;
            }

            self.search_signals[id as usize].wait().await;
        }

        self.with(|server| server.search_take_results(id))
    }

    pub fn query_async_new(&self, spec: QuerySpec) -> Result<u8, Error> {
        let now = Instant::now();
        self.apply(|server| server.query_async_new(now, spec))
    }

    pub fn query_async_get_results(
        &self,
        id: u8,
    ) -> Result<heapless::Vec<QueryResult, MAX_RESULTS>, Error> {
        self.with(|server| server.query_async_get_results(id))
    }

    pub fn query_async_delete(&self, id: u8) -> Result<(), Error> {
        self.apply(|server| server.query_async_delete(id))
    }

    // --- browses ---

    /// Start a continuous browse; deltas are awaited on the returned
    /// handle.
    pub fn browse_new(&self, service: &str, proto: Proto) -> Result<Browse<'_, M>, Error> {
        let now = Instant::now();
        let id = self.apply(|server| server.browse_new(now, service, proto))?;

        Ok(Browse { mdns: self, id })
    }

    pub fn browse_delete(&self, id: u8) -> Result<(), Error> {
        self.apply(|server| server.browse_delete(id))
    }

    // --- interfaces ---

    pub fn register_netif(&self) -> Result<u8, Error> {
        self.with(|server| server.register_netif())
    }

    pub fn unregister_netif(&self, netif: u8) -> Result<(), Error> {
        let now = Instant::now();
        self.apply(|server| server.unregister_netif(now, netif))
    }

    pub fn netif_action(&self, netif: u8, action: NetifAction) -> Result<(), Error> {
        self.apply(|server| server.netif_action(netif, action))
    }

    fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Server) -> R,
    {
        self.server.lock(|server| f(&mut server.borrow_mut()))
    }

    /// Lock, mutate, and wake every executor task.
    fn apply<F, R>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut Server) -> Result<R, Error>,
    {
        let result = self.with(f)?;
        self.wake_all();

        Ok(result)
    }

    fn wake_all(&self) {
        for wake in &self.wakes {
            wake.signal(());
        }
    }
}

/// A running browse subscription.
pub struct Browse<'a, M>
where
    M: RawMutex,
{
    mdns: &'a Mdns<M>,
    id: u8,
}

impl<M> Browse<'_, M>
where
    M: RawMutex,
{
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Wait for the next batch of deltas. Every returned result has at
    /// least one changed field; a TTL of zero is a removal.
    pub async fn changed(&self) -> heapless::Vec<QueryResult, MAX_RESULTS> {
        self.mdns.browse_signals[self.id as usize].wait().await;

        let mut results = heapless::Vec::new();

        self.mdns
            .with(|server| {
                server.browse_take_changes(self.id, |result| {
                    results.push(result.clone()).ok();
                })
            })
            .ok();

        results
    }

    /// End the subscription.
    pub fn delete(self) -> Result<(), Error> {
        self.mdns.browse_delete(self.id)
    }
}

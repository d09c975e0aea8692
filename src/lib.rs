#![cfg_attr(not(feature = "std"), no_std)]
#![allow(async_fn_in_trait)]
#![warn(clippy::large_futures)]

use core::fmt::{self, Display};
use core::net::{Ipv4Addr, Ipv6Addr};

use embassy_time::Duration;

pub mod host;
#[cfg(feature = "io")]
pub mod io;
pub mod packet;
pub mod pcb;
pub mod query;
pub mod server;
pub mod wire;

/// The mDNS port (RFC 6762).
pub const PORT: u16 = 5353;

/// The IPv4 mDNS multicast group (RFC 6762).
pub const MULTICAST_IPV4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
/// The IPv6 mDNS multicast group (RFC 6762).
pub const MULTICAST_IPV6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x00fb);

/// The largest UDP payload the responder will emit or accept.
///
/// mDNS is restricted to what fits into a single non-fragmented datagram;
/// the encoder fails with [`Error::Overflow`] rather than fragmenting.
pub const MAX_PACKET_SIZE: usize = 1460;

/// Byte capacity of a single name label buffer (including room for a
/// trailing NUL in the C sense; DNS labels themselves are at most 63 bytes).
pub const NAME_LEN: usize = 64;

/// Upper bound on concurrently registered services.
pub const MAX_SERVICES: usize = 16;
/// Static interface table size.
pub const MAX_INTERFACES: usize = 3;
/// Capacity of the action queue serializing all mutations.
pub const ACTION_QUEUE_DEPTH: usize = 16;
/// Capacity of the transmission queue.
pub const TX_QUEUE_DEPTH: usize = 16;
/// TXT items per service.
pub const MAX_TXT_ITEMS: usize = 8;
/// Subtypes per service.
pub const MAX_SUBTYPES: usize = 4;
/// Delegated hostnames answered for in addition to our own.
pub const MAX_DELEGATED_HOSTS: usize = 4;
/// Addresses per delegated host and per query result.
pub const MAX_ADDRS: usize = 4;
/// Concurrently active one-shot searches.
pub const MAX_SEARCHES: usize = 4;
/// Concurrently active browse subscriptions.
pub const MAX_BROWSES: usize = 4;
/// Results retained per search or browse.
pub const MAX_RESULTS: usize = 16;

/// An owned name label (hostname, service instance, subtype, TXT key).
pub type NameString = heapless::String<NAME_LEN>;

/// Runtime configuration. Capacities are compile-time constants (the
/// bounded `heapless` storage requires it); only behavior toggles and the
/// timer period live here.
#[derive(Debug, Clone)]
pub struct Config {
    /// Periodic timer driving the scheduler and search sweeps.
    pub tick: Duration,
    /// Answer PTR queries for `in-addr.arpa` / `ip6.arpa` names covering
    /// our own (or delegated) addresses.
    pub respond_reverse_queries: bool,
    /// Drop datagrams whose source IP is our own interface address.
    pub suppress_own_queries: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            respond_reverse_queries: false,
            suppress_own_queries: true,
        }
    }
}

/// Errors reported by the public API.
///
/// Inbound parse failures never surface here; the parser drops the
/// datagram and logs at debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Missing or malformed string, length over limit, empty required field.
    InvalidArgument,
    /// Operation not valid for the current state of the target.
    InvalidState,
    /// Service/hostname/search/browse lookup missed.
    NotFound,
    /// The service tuple is already registered.
    Conflict,
    /// A bounded collection or the packet buffer is full.
    Overflow,
    /// The action queue is at capacity; try again.
    QueueFull,
    /// Wire codec failure.
    Wire(wire::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "Invalid argument"),
            Self::InvalidState => write!(f, "Invalid state"),
            Self::NotFound => write!(f, "Not found"),
            Self::Conflict => write!(f, "Already registered"),
            Self::Overflow => write!(f, "Out of space"),
            Self::QueueFull => write!(f, "Action queue full"),
            Self::Wire(err) => write!(f, "Wire error: {}", err),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

impl From<wire::Error> for Error {
    fn from(err: wire::Error) -> Self {
        Self::Wire(err)
    }
}

pub(crate) fn name_string(s: &str) -> Result<NameString, Error> {
    if s.is_empty() || s.len() > wire::MAX_LABEL_LEN {
        return Err(Error::InvalidArgument);
    }

    NameString::try_from(s).map_err(|_| Error::InvalidArgument)
}

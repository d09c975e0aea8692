//! The owned data model: services with their TXT items and subtypes,
//! delegated hostnames, and the name-mangling used to resolve collisions.

use core::fmt::Write;
use core::net::IpAddr;

use crate::wire::{self, BytesOut, MAX_LABEL_LEN};
use crate::{Error, NameString, MAX_ADDRS, MAX_SUBTYPES, MAX_TXT_ITEMS};

/// Byte capacity of one TXT item value.
pub const TXT_VALUE_LEN: usize = 128;

/// Transport protocol of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
}

impl Proto {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "_tcp",
            Self::Udp => "_udp",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        if label.eq_ignore_ascii_case("_tcp") {
            Some(Self::Tcp)
        } else if label.eq_ignore_ascii_case("_udp") {
            Some(Self::Udp)
        } else {
            None
        }
    }
}

/// One key/value item of a service TXT record.
///
/// The key is non-empty and free of `=`; a valued item packs as
/// `key=value` and the whole packed string must fit the 255-byte DNS
/// character-string limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtItem {
    pub key: NameString,
    pub value: Option<heapless::Vec<u8, TXT_VALUE_LEN>>,
}

impl TxtItem {
    pub fn new(key: &str, value: Option<&[u8]>) -> Result<Self, Error> {
        if key.is_empty() || key.contains('=') {
            return Err(Error::InvalidArgument);
        }

        if let Some(value) = value {
            if value.len() > 255 - key.len() - 1 {
                return Err(Error::InvalidArgument);
            }
        }

        Ok(Self {
            key: NameString::try_from(key).map_err(|_| Error::InvalidArgument)?,
            value: match value {
                Some(value) => {
                    Some(heapless::Vec::from_slice(value).map_err(|_| Error::InvalidArgument)?)
                }
                None => None,
            },
        })
    }

    /// Packed length, excluding the leading length byte.
    pub fn packed_len(&self) -> usize {
        self.key.len() + self.value.as_ref().map(|v| v.len() + 1).unwrap_or(0)
    }

    pub fn write(&self, out: &mut BytesOut<'_>) -> Result<(), wire::Error> {
        out.byte(self.packed_len() as u8)?;
        out.push(self.key.as_bytes())?;

        if let Some(value) = &self.value {
            out.byte(b'=')?;
            out.push(value)?;
        }

        Ok(())
    }
}

/// Write the TXT rdata for an item list. An empty list emits the single
/// zero-length string the DNS requires.
pub fn write_txt_rdata(items: &[TxtItem], out: &mut BytesOut<'_>) -> Result<(), wire::Error> {
    if items.is_empty() {
        out.byte(0)?;
    } else {
        for item in items {
            item.write(out)?;
        }
    }

    Ok(())
}

/// A registered service.
#[derive(Debug, Clone)]
pub struct Service {
    pub(crate) id: u16,
    /// Goodbye pending; the service stays resolvable for the goodbye
    /// packet but no longer answers or probes.
    pub(crate) deleted: bool,
    /// Instance name; `None` falls back to the server default instance
    /// name, then to the hostname.
    pub instance: Option<NameString>,
    /// Service type, e.g. `_http`.
    pub service: NameString,
    pub proto: Proto,
    /// Hostname override; `None` means the self host (addresses come from
    /// the interface table), `Some` must match a delegated host.
    pub hostname: Option<NameString>,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
    pub txt: heapless::Vec<TxtItem, MAX_TXT_ITEMS>,
    pub subtypes: heapless::Vec<NameString, MAX_SUBTYPES>,
}

impl Service {
    /// The uniqueness key: (instance-or-default, service, protocol,
    /// hostname).
    pub(crate) fn same_tuple(&self, other: &Service) -> bool {
        eq_opt(&self.instance, &other.instance)
            && self.service.eq_ignore_ascii_case(&other.service)
            && self.proto == other.proto
            && eq_opt(&self.hostname, &other.hostname)
    }

    pub(crate) fn matches(
        &self,
        instance: Option<&str>,
        service: &str,
        proto: Proto,
    ) -> bool {
        let instance_matches = match (instance, &self.instance) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            (None, None) => true,
            _ => false,
        };

        instance_matches && self.service.eq_ignore_ascii_case(service) && self.proto == proto
    }

    /// Replace or append a TXT item, preserving key uniqueness.
    pub(crate) fn txt_set(&mut self, item: TxtItem) -> Result<(), Error> {
        if let Some(existing) = self
            .txt
            .iter_mut()
            .find(|i| i.key.eq_ignore_ascii_case(&item.key))
        {
            *existing = item;
            Ok(())
        } else {
            self.txt.push(item).map_err(|_| Error::Overflow)
        }
    }

    pub(crate) fn txt_remove(&mut self, key: &str) -> Result<(), Error> {
        let index = self
            .txt
            .iter()
            .position(|i| i.key.eq_ignore_ascii_case(key))
            .ok_or(Error::NotFound)?;

        self.txt.remove(index);

        Ok(())
    }
}

fn eq_opt(a: &Option<NameString>, b: &Option<NameString>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        (None, None) => true,
        _ => false,
    }
}

/// A hostname answered for on behalf of a non-local entity, with
/// statically provided addresses.
#[derive(Debug, Clone)]
pub struct DelegatedHost {
    pub(crate) id: u16,
    pub hostname: NameString,
    pub addrs: heapless::Vec<IpAddr, MAX_ADDRS>,
}

/// Derive the next candidate for a contended name: `foo` becomes `foo-2`,
/// `foo-2` becomes `foo-3`. The result is cut back to the 63-byte label
/// limit if the suffix pushed it over.
pub(crate) fn mangle(name: &str) -> NameString {
    let (base, next) = match name.rfind('-') {
        Some(pos)
            if pos + 1 < name.len()
                && name[pos + 1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            let n: u32 = name[pos + 1..].parse().unwrap_or(1);
            (&name[..pos], n.saturating_add(1))
        }
        _ => (name, 2),
    };

    let mut suffix = heapless::String::<12>::new();
    // The buffer fits any u32
    write!(suffix, "-{}", next).ok();

    let mut cut = base.len().min(MAX_LABEL_LEN - suffix.len());
    while !base.is_char_boundary(cut) {
        cut -= 1;
    }

    let mut mangled = NameString::new();
    mangled.push_str(&base[..cut]).ok();
    mangled.push_str(&suffix).ok();

    mangled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txt_item_validation() {
        assert!(TxtItem::new("path", Some(b"/admin")).is_ok());
        assert!(TxtItem::new("flag", None).is_ok());

        assert_eq!(TxtItem::new("", None), Err(Error::InvalidArgument));
        assert_eq!(TxtItem::new("a=b", None), Err(Error::InvalidArgument));

        let long = [b'x'; 250];
        assert_eq!(
            TxtItem::new("toolong", Some(&long)),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn txt_rdata_packing() {
        let items = [
            TxtItem::new("path", Some(b"/")).unwrap(),
            TxtItem::new("flag", None).unwrap(),
        ];

        let mut buf = [0; 64];
        let mut out = BytesOut::new(&mut buf);
        write_txt_rdata(&items, &mut out).unwrap();

        assert_eq!(out.written(), b"\x06path=/\x04flag");

        let mut out = BytesOut::new(&mut buf);
        write_txt_rdata(&[], &mut out).unwrap();
        assert_eq!(out.written(), &[0]);
    }

    #[test]
    fn mangling_appends_and_increments() {
        assert_eq!(mangle("alpha"), "alpha-2");
        assert_eq!(mangle("alpha-2"), "alpha-3");
        assert_eq!(mangle("alpha-9"), "alpha-10");
        assert_eq!(mangle("alpha-"), "alpha--2");

        let mut long = NameString::new();
        for _ in 0..63 {
            long.push('x').unwrap();
        }

        let mangled = mangle(&long);
        assert_eq!(mangled.len(), 63);
        assert!(mangled.ends_with("-2"));
    }

    #[test]
    fn proto_labels() {
        assert_eq!(Proto::from_label("_TCP"), Some(Proto::Tcp));
        assert_eq!(Proto::from_label("_udp"), Some(Proto::Udp));
        assert_eq!(Proto::from_label("_sctp"), None);
        assert_eq!(Proto::Tcp.as_str(), "_tcp");
    }
}

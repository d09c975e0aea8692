//! The DNS wire codec: header, names with compression, questions and
//! resource records.
//!
//! Names decode into the four-slot [`Name`] structure (host, service,
//! protocol, domain) used throughout the responder; compression pointers
//! are only ever emitted backwards, and the decoder rejects any pointer
//! whose target is not strictly before the pointer itself.

use core::fmt::{self, Display};
use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::NameString;

/// Fixed DNS header size.
pub const HEADER_SIZE: usize = 12;

/// Maximum bytes in a single label.
pub const MAX_LABEL_LEN: usize = 63;
/// Maximum encoded name length (labels plus length bytes).
pub const MAX_NAME_LEN: usize = 255;

/// QR bit: the message is a response.
pub const FLAG_RESPONSE: u16 = 0x8000;
/// AA bit: the response is authoritative.
pub const FLAG_AUTHORITATIVE: u16 = 0x0400;
/// Flags carried by every announcement and answer we emit.
pub const AUTHORITATIVE_RESPONSE: u16 = FLAG_RESPONSE | FLAG_AUTHORITATIVE;

/// The Internet class.
pub const CLASS_IN: u16 = 0x0001;
/// Mask extracting the class from the class field.
pub const CLASS_MASK: u16 = 0x7fff;
/// Top bit of a record's class: receivers should flush cached records.
pub const CACHE_FLUSH: u16 = 0x8000;
/// Top bit of a question's class: the querier asks for a unicast reply.
pub const UNICAST_RESPONSE: u16 = 0x8000;

/// Resource record types understood by the responder. NSEC and OPT are
/// parsed and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum RecordType {
    A = 1,
    Ptr = 12,
    Txt = 16,
    Aaaa = 28,
    Srv = 33,
    Opt = 41,
    Nsec = 47,
    Any = 255,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    DataUnderflow,
    BufferOverflow,
    InvalidLabel,
    ForwardPointer,
    NameTooLong,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataUnderflow => write!(f, "Data underflow"),
            Self::BufferOverflow => write!(f, "Buffer overflow"),
            Self::InvalidLabel => write!(f, "Invalid label"),
            Self::ForwardPointer => write!(f, "Forward compression pointer"),
            Self::NameTooLong => write!(f, "Name too long"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Bounds-checked reader over a received datagram.
///
/// The cursor always covers the whole packet so that compression pointers
/// can be chased from any position.
#[derive(Clone)]
pub struct BytesIn<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BytesIn<'a> {
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn position(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    pub fn seek(&mut self, pos: usize) -> Result<(), Error> {
        if pos > self.data.len() {
            return Err(Error::DataUnderflow);
        }

        self.offset = pos;

        Ok(())
    }

    /// A second cursor over the same packet, positioned at `pos`.
    pub fn at(&self, pos: usize) -> Result<BytesIn<'a>, Error> {
        let mut other = Self::new(self.data);
        other.seek(pos)?;

        Ok(other)
    }

    pub fn byte(&mut self) -> Result<u8, Error> {
        self.arr::<1>().map(|arr| arr[0])
    }

    pub fn slice(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if len > self.data.len() - self.offset {
            Err(Error::DataUnderflow)
        } else {
            let data = &self.data[self.offset..self.offset + len];
            self.offset += len;

            Ok(data)
        }
    }

    pub fn arr<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let slice = self.slice(N)?;

        let mut data = [0; N];
        data.copy_from_slice(slice);

        Ok(data)
    }

    pub fn u16(&mut self) -> Result<u16, Error> {
        self.arr().map(u16::from_be_bytes)
    }

    pub fn u32(&mut self) -> Result<u32, Error> {
        self.arr().map(u32::from_be_bytes)
    }
}

/// Bounds-checked writer assembling an outgoing datagram.
pub struct BytesOut<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl<'a> BytesOut<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn len(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    pub fn written(&self) -> &[u8] {
        &self.buf[..self.offset]
    }

    pub fn byte(&mut self, data: u8) -> Result<&mut Self, Error> {
        self.push(&[data])
    }

    pub fn push(&mut self, data: &[u8]) -> Result<&mut Self, Error> {
        if data.len() > self.buf.len() - self.offset {
            Err(Error::BufferOverflow)
        } else {
            self.buf[self.offset..self.offset + data.len()].copy_from_slice(data);
            self.offset += data.len();

            Ok(self)
        }
    }

    pub fn u16(&mut self, data: u16) -> Result<&mut Self, Error> {
        self.push(&u16::to_be_bytes(data))
    }

    pub fn u32(&mut self, data: u32) -> Result<&mut Self, Error> {
        self.push(&u32::to_be_bytes(data))
    }

    /// Patch an already-written 16-bit field (header counts, RDLENGTH).
    pub fn set_u16_at(&mut self, pos: usize, data: u16) {
        self.buf[pos..pos + 2].copy_from_slice(&u16::to_be_bytes(data));
    }
}

/// The 12-byte DNS header.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
    pub questions: u16,
    pub answers: u16,
    pub servers: u16,
    pub additional: u16,
}

impl Header {
    pub fn decode(bytes: &mut BytesIn<'_>) -> Result<Self, Error> {
        Ok(Self {
            id: bytes.u16()?,
            flags: bytes.u16()?,
            questions: bytes.u16()?,
            answers: bytes.u16()?,
            servers: bytes.u16()?,
            additional: bytes.u16()?,
        })
    }

    pub fn encode(&self, out: &mut BytesOut<'_>) -> Result<(), Error> {
        out.u16(self.id)?
            .u16(self.flags)?
            .u16(self.questions)?
            .u16(self.answers)?
            .u16(self.servers)?
            .u16(self.additional)?;

        Ok(())
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }
}

/// A fully qualified name split the way the responder thinks about it:
/// `<host>.<service>.<proto>.<domain>`, where any slot may be empty.
///
/// `kitchen._http._tcp.local` fills all four; `_http._tcp.local` leaves
/// `host` empty; `alpha.local` fills only `host` and `domain`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Name {
    pub host: NameString,
    pub service: NameString,
    pub proto: NameString,
    pub domain: NameString,
    /// The name contained a `_sub` selector label.
    pub sub: bool,
    /// More than four labels, a non-text label, or a foreign domain.
    pub invalid: bool,
    /// Set for `in-addr.arpa` / `ip6.arpa` forms; carries the decoded
    /// address the reverse name refers to.
    pub reverse: Option<IpAddr>,
}

impl Name {
    /// The non-empty labels of the name, in wire order (without the
    /// trailing root label).
    pub fn labels(&self) -> heapless::Vec<&str, 4> {
        let mut labels = heapless::Vec::new();

        for part in [&self.host, &self.service, &self.proto, &self.domain] {
            if !part.is_empty() {
                // Capacity equals the slot count
                labels.push(part.as_str()).ok();
            }
        }

        labels
    }

    /// Whether this is the DNS-SD service enumeration name
    /// `_services._dns-sd._udp.local`.
    pub fn is_discovery(&self) -> bool {
        self.host.eq_ignore_ascii_case("_services")
            && self.service.eq_ignore_ascii_case("_dns-sd")
            && self.proto.eq_ignore_ascii_case("_udp")
            && self.domain.eq_ignore_ascii_case("local")
    }

    pub fn is_local(&self) -> bool {
        self.domain.eq_ignore_ascii_case("local")
    }

    pub fn matches_service(&self, service: &str, proto: &str) -> bool {
        self.service.eq_ignore_ascii_case(service) && self.proto.eq_ignore_ascii_case(proto)
    }
}

impl Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for label in self.labels() {
            write!(f, "{}.", label)?;
        }

        Ok(())
    }
}

/// Walk the labels of an encoded name starting at `start`, feeding each
/// label's bytes to `f`. Returns the offset just past the name (i.e. past
/// the root byte, or past the first compression pointer).
///
/// Every pointer must target an offset strictly before the pointer itself,
/// and the cumulative label bytes are capped at [`MAX_NAME_LEN`]; together
/// these bound the walk even for hostile pointer graphs.
fn walk_labels<F>(data: &[u8], start: usize, mut f: F) -> Result<usize, Error>
where
    F: FnMut(&[u8]) -> Result<(), Error>,
{
    let mut pos = start;
    let mut next = None;
    let mut total = 0usize;

    loop {
        let len = *data.get(pos).ok_or(Error::DataUnderflow)? as usize;

        if len == 0 {
            pos += 1;
            break;
        }

        if len & 0xc0 == 0xc0 {
            let lo = *data.get(pos + 1).ok_or(Error::DataUnderflow)? as usize;
            let target = (len & 0x3f) << 8 | lo;

            if target >= pos {
                return Err(Error::ForwardPointer);
            }

            if next.is_none() {
                next = Some(pos + 2);
            }

            pos = target;
            continue;
        }

        if len & 0xc0 != 0 {
            return Err(Error::InvalidLabel);
        }

        total += len + 1;
        if total > MAX_NAME_LEN {
            return Err(Error::NameTooLong);
        }

        let label = data
            .get(pos + 1..pos + 1 + len)
            .ok_or(Error::DataUnderflow)?;

        f(label)?;

        pos += len + 1;
    }

    Ok(next.unwrap_or(pos))
}

/// Decode a name at the cursor into the four-slot [`Name`] form.
///
/// Labels land in host, service, proto, domain in reading order; `_sub`
/// sets the flag and is not stored. Names shorter than four labels are
/// then normalized from the tail (3 labels are service/proto/domain,
/// 2 are host/domain, 1 is just the domain). More than four labels mark
/// the name invalid, but the cursor still advances past the whole name.
pub fn read_fqdn(bytes: &mut BytesIn<'_>, allow_arpa: bool) -> Result<Name, Error> {
    let start = bytes.position();

    let mut name = Name::default();
    let mut slots: [NameString; 4] = Default::default();
    let mut parts = 0usize;
    let mut tail: [NameString; 2] = Default::default();

    let next = walk_labels(bytes.data(), start, |label| {
        let Ok(label) = core::str::from_utf8(label) else {
            name.invalid = true;
            return Ok(());
        };

        if label.eq_ignore_ascii_case("_sub") {
            name.sub = true;
            return Ok(());
        }

        if parts < 4 {
            slots[parts] = NameString::try_from(label).unwrap_or_default();
        } else {
            name.invalid = true;
        }

        tail[0] = core::mem::take(&mut tail[1]);
        tail[1] = NameString::try_from(label).unwrap_or_default();
        parts += 1;

        Ok(())
    })?;

    bytes.seek(next)?;

    if allow_arpa && tail[1].eq_ignore_ascii_case("arpa") {
        if tail[0].eq_ignore_ascii_case("in-addr") && parts == 6 {
            if let Some(ip) = reverse_v4(bytes.data(), start)? {
                name.domain = core::mem::take(&mut tail[1]);
                name.reverse = Some(IpAddr::V4(ip));
                return Ok(name);
            }
        } else if tail[0].eq_ignore_ascii_case("ip6") && parts == 34 {
            if let Some(ip) = reverse_v6(bytes.data(), start)? {
                name.domain = core::mem::take(&mut tail[1]);
                name.reverse = Some(IpAddr::V6(ip));
                return Ok(name);
            }
        }
    }

    let [a, b, c, d] = slots;

    match parts {
        0 => (),
        1 => name.domain = a,
        2 => {
            name.host = a;
            name.domain = b;
        }
        3 => {
            name.service = a;
            name.proto = b;
            name.domain = c;
        }
        _ => {
            name.host = a;
            name.service = b;
            name.proto = c;
            name.domain = d;
        }
    }

    if !(name.domain.eq_ignore_ascii_case("local")
        || allow_arpa && name.domain.eq_ignore_ascii_case("arpa"))
    {
        name.invalid = true;
    }

    Ok(name)
}

fn reverse_v4(data: &[u8], start: usize) -> Result<Option<Ipv4Addr>, Error> {
    let mut octets = [0u8; 4];
    let mut index = 0usize;
    let mut ok = true;

    walk_labels(data, start, |label| {
        if index < 4 {
            match core::str::from_utf8(label).ok().and_then(|s| s.parse().ok()) {
                // d.c.b.a.in-addr.arpa carries the octets in reverse
                Some(octet) => octets[3 - index] = octet,
                None => ok = false,
            }
        }

        index += 1;

        Ok(())
    })?;

    Ok((ok && index == 6).then(|| Ipv4Addr::from(octets)))
}

fn reverse_v6(data: &[u8], start: usize) -> Result<Option<Ipv6Addr>, Error> {
    let mut octets = [0u8; 16];
    let mut index = 0usize;
    let mut ok = true;

    walk_labels(data, start, |label| {
        if index < 32 {
            match label
                .first()
                .filter(|_| label.len() == 1)
                .and_then(|c| (*c as char).to_digit(16))
            {
                Some(nibble) => {
                    // Nibbles run from the least significant one backwards
                    let pos = 31 - index;
                    octets[pos / 2] |= (nibble as u8) << (if pos % 2 == 0 { 4 } else { 0 });
                }
                None => ok = false,
            }
        }

        index += 1;

        Ok(())
    })?;

    Ok((ok && index == 34).then(|| Ipv6Addr::from(octets)))
}

/// Append an FQDN, compressing against the already-written packet bytes.
///
/// The writer looks for the whole remaining label sequence among the bytes
/// emitted so far and writes a backward pointer on a match; otherwise it
/// emits the leading label literally and recurses on the remainder, so
/// every compressible suffix still compresses.
pub fn write_fqdn(out: &mut BytesOut<'_>, labels: &[&str], compress: bool) -> Result<(), Error> {
    let encoded: usize = labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1;
    if encoded > MAX_NAME_LEN {
        return Err(Error::NameTooLong);
    }

    let mut labels = labels;

    while !labels.is_empty() {
        if compress {
            if let Some(offset) = find_name(out.written(), labels) {
                out.u16(0xc000 | offset as u16)?;
                return Ok(());
            }
        }

        let label = labels[0];
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(Error::InvalidLabel);
        }

        out.byte(label.len() as u8)?;
        out.push(label.as_bytes())?;

        labels = &labels[1..];
    }

    out.byte(0)?;

    Ok(())
}

fn find_name(written: &[u8], labels: &[&str]) -> Option<usize> {
    // Nothing before the end of the header can be a name, and pointer
    // offsets are 14 bits wide.
    (HEADER_SIZE..written.len().min(0x3fff)).find(|&offset| match_name_at(written, offset, labels))
}

fn match_name_at(packet: &[u8], start: usize, labels: &[&str]) -> bool {
    let mut index = 0usize;
    let mut matched = true;

    let result = walk_labels(packet, start, |label| {
        if index < labels.len() && label.eq_ignore_ascii_case(labels[index].as_bytes()) {
            index += 1;
        } else {
            matched = false;
        }

        Ok(())
    });

    result.is_ok() && matched && index == labels.len()
}

/// A parsed question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: Name,
    pub rtype: u16,
    pub class: u16,
}

impl Question {
    pub fn unicast(&self) -> bool {
        self.class & UNICAST_RESPONSE != 0
    }

    pub fn class_in(&self) -> bool {
        matches!(self.class & CLASS_MASK, CLASS_IN | 255)
    }
}

pub fn read_question(bytes: &mut BytesIn<'_>, allow_arpa: bool) -> Result<Question, Error> {
    Ok(Question {
        name: read_fqdn(bytes, allow_arpa)?,
        rtype: bytes.u16()?,
        class: bytes.u16()?,
    })
}

pub fn write_question(
    out: &mut BytesOut<'_>,
    labels: &[&str],
    rtype: u16,
    class: u16,
) -> Result<(), Error> {
    write_fqdn(out, labels, true)?;
    out.u16(rtype)?.u16(class)?;

    Ok(())
}

/// Parsed record data for the types the responder acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData<'a> {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ptr(Name),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: Name,
    },
    Txt(&'a [u8]),
    Ignored(u16),
}

/// A parsed resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<'a> {
    pub name: Name,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: RData<'a>,
}

impl Record<'_> {
    pub fn cache_flush(&self) -> bool {
        self.class & CACHE_FLUSH != 0
    }

    pub fn class_in(&self) -> bool {
        self.class & CLASS_MASK == CLASS_IN
    }
}

pub fn read_record<'a>(
    bytes: &mut BytesIn<'a>,
    allow_arpa: bool,
) -> Result<Record<'a>, Error> {
    let name = read_fqdn(bytes, allow_arpa)?;
    let rtype = bytes.u16()?;
    let class = bytes.u16()?;
    let ttl = bytes.u32()?;
    let rdlen = bytes.u16()? as usize;

    let rstart = bytes.position();
    if rstart + rdlen > bytes.data().len() {
        return Err(Error::DataUnderflow);
    }

    let rdata = match RecordType::try_from(rtype) {
        Ok(RecordType::A) if rdlen == 4 => {
            RData::A(Ipv4Addr::from(bytes.at(rstart)?.arr::<4>()?))
        }
        Ok(RecordType::Aaaa) if rdlen == 16 => {
            RData::Aaaa(Ipv6Addr::from(bytes.at(rstart)?.arr::<16>()?))
        }
        Ok(RecordType::Ptr) => RData::Ptr(read_fqdn(&mut bytes.at(rstart)?, allow_arpa)?),
        Ok(RecordType::Srv) => {
            let mut inner = bytes.at(rstart)?;

            RData::Srv {
                priority: inner.u16()?,
                weight: inner.u16()?,
                port: inner.u16()?,
                target: read_fqdn(&mut inner, allow_arpa)?,
            }
        }
        Ok(RecordType::Txt) => RData::Txt(bytes.at(rstart)?.slice(rdlen)?),
        _ => RData::Ignored(rtype),
    };

    bytes.seek(rstart + rdlen)?;

    Ok(Record {
        name,
        rtype,
        class,
        ttl,
        rdata,
    })
}

/// Tracks the RDLENGTH position of a record under construction.
pub struct RecordFrame(usize);

impl RecordFrame {
    /// Write the RDLENGTH placeholder at the current position; the owner,
    /// type, class and TTL must already be in place.
    pub fn open(out: &mut BytesOut<'_>) -> Result<Self, Error> {
        let frame = Self(out.len());
        out.u16(0)?;

        Ok(frame)
    }
}

/// Write a record up to and including the RDLENGTH placeholder. The rdata
/// follows, then [`end_record`] patches the length in.
pub fn begin_record(
    out: &mut BytesOut<'_>,
    labels: &[&str],
    rtype: u16,
    class: u16,
    ttl: u32,
) -> Result<RecordFrame, Error> {
    write_fqdn(out, labels, true)?;
    out.u16(rtype)?.u16(class)?.u32(ttl)?;

    RecordFrame::open(out)
}

pub fn end_record(out: &mut BytesOut<'_>, frame: RecordFrame) {
    let rdlen = out.len() - frame.0 - 2;
    out.set_u16_at(frame.0, rdlen as u16);
}

#[cfg(test)]
mod tests {
    use super::*;

    // A captured-style response: one PTR answer for `_http._tcp.local`
    // pointing at `kitchen._http._tcp.local`, rdata compressed against
    // the owner name.
    const SAMPLE: &[u8] = &[
        0x00, 0x00, 0x84, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, // header
        0x05, b'_', b'h', b't', b't', b'p', 0x04, b'_', b't', b'c', b'p', 0x05, b'l', b'o', b'c',
        b'a', b'l', 0x00, // _http._tcp.local
        0x00, 0x0c, 0x00, 0x01, 0x00, 0x00, 0x11, 0x94, // PTR IN 4500
        0x00, 0x0a, // rdlen
        0x07, b'k', b'i', b't', b'c', b'h', b'e', b'n', 0xc0, 0x0c, // kitchen + ptr
    ];

    #[test]
    fn header_round_trip() {
        let header = Header {
            id: 0x1234,
            flags: AUTHORITATIVE_RESPONSE,
            questions: 1,
            answers: 2,
            servers: 0,
            additional: 3,
        };

        let mut buf = [0; HEADER_SIZE];
        let mut out = BytesOut::new(&mut buf);
        header.encode(&mut out).unwrap();

        assert_eq!(
            Header::decode(&mut BytesIn::new(&buf)).unwrap(),
            header
        );
    }

    #[test]
    fn parse_sample_record() {
        let mut bytes = BytesIn::new(SAMPLE);
        bytes.seek(HEADER_SIZE).unwrap();

        let record = read_record(&mut bytes, false).unwrap();

        assert_eq!(record.rtype, u16::from(RecordType::Ptr));
        assert_eq!(record.ttl, 4500);
        assert!(record.name.host.is_empty());
        assert_eq!(record.name.service, "_http");
        assert_eq!(record.name.proto, "_tcp");
        assert_eq!(record.name.domain, "local");

        let RData::Ptr(target) = record.rdata else {
            panic!("not a PTR");
        };

        assert_eq!(target.host, "kitchen");
        assert_eq!(target.service, "_http");
        assert!(!target.invalid);

        assert!(bytes.is_empty());
    }

    #[test]
    fn fqdn_compression_points_backwards() {
        let mut buf = [0; 128];
        let mut out = BytesOut::new(&mut buf);

        // Names only start after the header
        out.push(&[0; HEADER_SIZE]).unwrap();

        write_fqdn(&mut out, &["kitchen", "_http", "_tcp", "local"], true).unwrap();
        let first_len = out.len();

        write_fqdn(&mut out, &["oven", "_http", "_tcp", "local"], true).unwrap();

        // The second name shares everything past its own first label
        assert_eq!(out.len(), first_len + 1 + 4 + 2);
        assert_eq!(out.written()[first_len + 5] & 0xc0, 0xc0);

        let mut read = BytesIn::new(out.written());
        read.seek(first_len).unwrap();
        let name = read_fqdn(&mut read, false).unwrap();

        assert_eq!(name.host, "oven");
        assert_eq!(name.service, "_http");
        assert_eq!(name.proto, "_tcp");
        assert_eq!(name.domain, "local");
        assert!(!name.invalid);
    }

    #[test]
    fn full_name_compresses_to_single_pointer() {
        let mut buf = [0; 128];
        let mut out = BytesOut::new(&mut buf);

        out.push(&[0; HEADER_SIZE]).unwrap();
        write_fqdn(&mut out, &["alpha", "local"], true).unwrap();
        let first_len = out.len();

        write_fqdn(&mut out, &["alpha", "local"], true).unwrap();

        assert_eq!(out.len(), first_len + 2);
        assert_eq!(
            u16::from_be_bytes([out.written()[first_len], out.written()[first_len + 1]]),
            0xc000 | HEADER_SIZE as u16
        );
    }

    #[test]
    fn forward_pointer_rejected() {
        // Pointer at offset 0 referencing itself
        let data = [0xc0, 0x00];
        assert_eq!(
            read_fqdn(&mut BytesIn::new(&data), false),
            Err(Error::ForwardPointer)
        );
    }

    #[test]
    fn pointer_cycle_rejected() {
        // A label run that re-enters itself through a backward pointer:
        // offset 0: "ab" label, then a pointer back to offset 0.
        let data = [0x02, b'a', b'b', 0xc0, 0x00];
        assert_eq!(
            read_fqdn(&mut BytesIn::new(&data), false),
            Err(Error::NameTooLong)
        );
    }

    #[test]
    fn malformed_length_rejected() {
        let data = [0x48, b'x'];
        assert_eq!(
            read_fqdn(&mut BytesIn::new(&data), false),
            Err(Error::InvalidLabel)
        );
    }

    #[test]
    fn truncated_name_rejected() {
        let data = [0x05, b'a', b'b'];
        assert_eq!(
            read_fqdn(&mut BytesIn::new(&data), false),
            Err(Error::DataUnderflow)
        );
    }

    fn encode_labels(labels: &[&str]) -> heapless::Vec<u8, 256> {
        let mut buf = [0; 256];
        let mut out = BytesOut::new(&mut buf);
        write_fqdn(&mut out, labels, false).unwrap();

        heapless::Vec::from_slice(out.written()).unwrap()
    }

    #[test]
    fn uncompressed_names_round_trip_bytewise() {
        let data = encode_labels(&["kitchen", "_http", "_tcp", "local"]);

        let name = read_fqdn(&mut BytesIn::new(&data), false).unwrap();
        let labels = name.labels();

        let mut buf = [0; 256];
        let mut out = BytesOut::new(&mut buf);
        write_fqdn(&mut out, &labels, false).unwrap();

        assert_eq!(out.written(), data.as_slice());
    }

    #[test]
    fn sub_label_sets_flag() {
        let data = encode_labels(&["printer", "_sub", "_http", "_tcp", "local"]);
        let name = read_fqdn(&mut BytesIn::new(&data), false).unwrap();

        assert!(name.sub);
        assert!(!name.invalid);
        assert_eq!(name.host, "printer");
        assert_eq!(name.service, "_http");
        assert_eq!(name.proto, "_tcp");
    }

    #[test]
    fn short_names_normalize_from_the_tail() {
        let data = encode_labels(&["alpha", "local"]);
        let name = read_fqdn(&mut BytesIn::new(&data), false).unwrap();
        assert_eq!(name.host, "alpha");
        assert!(name.service.is_empty());
        assert_eq!(name.domain, "local");
        assert!(!name.invalid);

        let data = encode_labels(&["_http", "_tcp", "local"]);
        let name = read_fqdn(&mut BytesIn::new(&data), false).unwrap();
        assert!(name.host.is_empty());
        assert_eq!(name.service, "_http");
        assert_eq!(name.proto, "_tcp");
        assert!(!name.invalid);
    }

    #[test]
    fn excess_labels_mark_invalid_but_continue() {
        let data = encode_labels(&["a", "b", "c", "d", "e", "local"]);
        let mut bytes = BytesIn::new(&data);
        let name = read_fqdn(&mut bytes, false).unwrap();

        assert!(name.invalid);
        assert!(bytes.is_empty());
    }

    #[test]
    fn foreign_domain_marks_invalid() {
        let data = encode_labels(&["example", "com"]);
        assert!(read_fqdn(&mut BytesIn::new(&data), false).unwrap().invalid);
    }

    #[test]
    fn arpa_gated_on_reverse_config() {
        let data = encode_labels(&["5", "2", "0", "192", "in-addr", "arpa"]);

        let name = read_fqdn(&mut BytesIn::new(&data), true).unwrap();
        assert_eq!(
            name.reverse,
            Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5)))
        );
        assert!(!name.invalid);

        let name = read_fqdn(&mut BytesIn::new(&data), false).unwrap();
        assert!(name.invalid);
    }

    #[test]
    fn reverse_v6_name_decodes() {
        let mut labels: heapless::Vec<heapless::String<4>, 34> = heapless::Vec::new();

        // ::1 reversed: 31 zero nibbles then a one
        labels.push(heapless::String::try_from("1").unwrap()).unwrap();
        for _ in 0..31 {
            labels.push(heapless::String::try_from("0").unwrap()).unwrap();
        }
        labels.push(heapless::String::try_from("ip6").unwrap()).unwrap();
        labels.push(heapless::String::try_from("arpa").unwrap()).unwrap();

        let refs: heapless::Vec<&str, 34> = labels.iter().map(|s| s.as_str()).collect();
        let data = encode_labels(&refs);

        let name = read_fqdn(&mut BytesIn::new(&data), true).unwrap();
        assert_eq!(name.reverse, Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn question_unicast_bit() {
        let mut buf = [0; 64];
        let mut out = BytesOut::new(&mut buf);
        out.push(&[0; HEADER_SIZE]).unwrap();

        write_question(
            &mut out,
            &["alpha", "local"],
            RecordType::Any.into(),
            CLASS_IN | UNICAST_RESPONSE,
        )
        .unwrap();

        let mut bytes = BytesIn::new(out.written());
        bytes.seek(HEADER_SIZE).unwrap();
        let question = read_question(&mut bytes, false).unwrap();

        assert!(question.unicast());
        assert!(question.class_in());
        assert_eq!(question.rtype, u16::from(RecordType::Any));
    }

    #[test]
    fn record_frame_patches_rdlength() {
        let mut buf = [0; 64];
        let mut out = BytesOut::new(&mut buf);
        out.push(&[0; HEADER_SIZE]).unwrap();

        let frame = begin_record(
            &mut out,
            &["alpha", "local"],
            RecordType::A.into(),
            CLASS_IN | CACHE_FLUSH,
            120,
        )
        .unwrap();
        out.push(&[192, 0, 2, 1]).unwrap();
        end_record(&mut out, frame);

        let mut bytes = BytesIn::new(out.written());
        bytes.seek(HEADER_SIZE).unwrap();
        let record = read_record(&mut bytes, false).unwrap();

        assert_eq!(record.ttl, 120);
        assert!(record.cache_flush());
        assert!(record.class_in());
        assert_eq!(record.rdata, RData::A(Ipv4Addr::new(192, 0, 2, 1)));
    }
}

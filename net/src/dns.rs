//! DNS client: wire protocol, cache, and resolver state machine.
//!
//! A stub resolver for A-record lookups over UDP.  Synchronous and
//! asynchronous lookups share one fixed-capacity query table; completion is
//! signalled either through the stack event sink
//! ([`NetEvent::DnsCompleted`](super::stack::NetEvent)) or, for the
//! synchronous path, by parking the result in the query slot until the
//! polling caller picks it up.
//!
//! Name decompression follows RFC 1035 pointers with a hard bound on the
//! *total* number of pointer follows, so both cycles and absurdly deep
//! pointer chains fail cleanly instead of looping.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use oxbow_lib::klog_debug;

use super::stack::{NetEvent, StackInner};
use super::types::{DevIndex, Ipv4Addr, NetError, Port, SockAddr};
use super::udp;

/// Standard DNS UDP port.
pub const DNS_PORT: u16 = 53;
/// Maximum DNS name length (RFC 1035).
const DNS_NAME_MAX: usize = 253;
/// Maximum label length (RFC 1035).
const DNS_LABEL_MAX: usize = 63;
/// DNS header length.
pub const DNS_HEADER_LEN: usize = 12;
/// Maximum standard DNS UDP message size.
pub const DNS_MAX_MESSAGE: usize = 512;
/// Maximum total compression-pointer follows while decoding one name.
const MAX_POINTER_FOLLOWS: usize = 16;
/// Per-attempt timeout (ms).
pub const DNS_TIMEOUT_MS: u64 = 3000;
/// Attempts per lookup (initial send + retries).
pub const DNS_MAX_ATTEMPTS: u8 = 3;
/// Cache table size.
pub const DNS_CACHE_SIZE: usize = 16;
/// In-flight query table size.
pub const DNS_MAX_QUERIES: usize = 8;

// =============================================================================
// Wire types
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DnsType {
    A = 1,
    CNAME = 5,
}

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DnsClass {
    IN = 1,
}

/// Parsed DNS header (12 bytes).
#[derive(Clone, Copy, Default)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl DnsHeader {
    /// QR bit: 0 = query, 1 = response.
    pub fn qr(&self) -> bool {
        (self.flags & 0x8000) != 0
    }

    /// RCODE (low 4 bits of flags).
    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000F) as u8
    }

    fn to_bytes(self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.id.to_be_bytes());
        buf[2..4].copy_from_slice(&self.flags.to_be_bytes());
        buf[4..6].copy_from_slice(&self.qdcount.to_be_bytes());
        buf[6..8].copy_from_slice(&self.ancount.to_be_bytes());
        buf[8..10].copy_from_slice(&self.nscount.to_be_bytes());
        buf[10..12].copy_from_slice(&self.arcount.to_be_bytes());
    }

    fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < DNS_HEADER_LEN {
            return None;
        }
        Some(DnsHeader {
            id: u16::from_be_bytes([buf[0], buf[1]]),
            flags: u16::from_be_bytes([buf[2], buf[3]]),
            qdcount: u16::from_be_bytes([buf[4], buf[5]]),
            ancount: u16::from_be_bytes([buf[6], buf[7]]),
            nscount: u16::from_be_bytes([buf[8], buf[9]]),
            arcount: u16::from_be_bytes([buf[10], buf[11]]),
        })
    }
}

// =============================================================================
// Name encoding
// =============================================================================

/// Encode a hostname into DNS wire format (length-prefixed labels).
///
/// `"example.com"` → `[7, e,x,a,m,p,l,e, 3, c,o,m, 0]`
///
/// Returns the number of bytes written, or `None` on invalid input.
pub fn encode_name(hostname: &[u8], buf: &mut [u8]) -> Option<usize> {
    if hostname.len() > DNS_NAME_MAX {
        return None;
    }

    // A trailing dot denotes the root and is stripped.
    let hostname = match hostname.last() {
        Some(&b'.') => &hostname[..hostname.len() - 1],
        _ => hostname,
    };

    if hostname.is_empty() {
        if buf.is_empty() {
            return None;
        }
        buf[0] = 0;
        return Some(1);
    }

    let mut out_pos = 0usize;
    for label in hostname.split(|&b| b == b'.') {
        if label.is_empty() || label.len() > DNS_LABEL_MAX {
            return None;
        }
        // Room for length byte + label + at least the trailing zero.
        if out_pos + 1 + label.len() >= buf.len() {
            return None;
        }
        buf[out_pos] = label.len() as u8;
        out_pos += 1;
        buf[out_pos..out_pos + label.len()].copy_from_slice(label);
        out_pos += label.len();
    }

    buf[out_pos] = 0;
    Some(out_pos + 1)
}

// =============================================================================
// Query construction
// =============================================================================

/// Build a DNS query message for the given hostname and query type.
///
/// Returns the total message length, or `None` on error.
pub fn build_query(id: u16, hostname: &[u8], qtype: DnsType, buf: &mut [u8]) -> Option<usize> {
    if buf.len() < DNS_HEADER_LEN + 4 {
        return None;
    }

    // QR=0, OPCODE=0, RD=1.
    let header = DnsHeader {
        id,
        flags: 0x0100,
        qdcount: 1,
        ancount: 0,
        nscount: 0,
        arcount: 0,
    };
    header.to_bytes(&mut buf[..DNS_HEADER_LEN]);

    let name_len = encode_name(hostname, &mut buf[DNS_HEADER_LEN..])?;
    let q_start = DNS_HEADER_LEN + name_len;
    if q_start + 4 > buf.len() {
        return None;
    }

    buf[q_start..q_start + 2].copy_from_slice(&(qtype as u16).to_be_bytes());
    buf[q_start + 2..q_start + 4].copy_from_slice(&(DnsClass::IN as u16).to_be_bytes());
    Some(q_start + 4)
}

// =============================================================================
// Name decoding (with compression pointer support)
// =============================================================================

/// Decode a DNS name from wire format following compression pointers.
///
/// Returns `(decoded_name_len, wire_bytes_consumed)` or `None` on error.
/// The decoded name is written as a dotted string (e.g., `example.com`).
/// The total number of pointer follows is bounded, which rejects both
/// pointer cycles and over-deep chains.
pub fn decode_name(packet: &[u8], offset: usize, out: &mut [u8]) -> Option<(usize, usize)> {
    let mut pos = offset;
    let mut out_pos = 0usize;
    let mut jumped = false;
    let mut wire_consumed = 0usize;
    let mut pointer_count = 0usize;

    loop {
        if pos >= packet.len() {
            return None;
        }

        let len_or_ptr = packet[pos];

        if len_or_ptr == 0 {
            // Root label: end of name.
            if !jumped {
                wire_consumed = pos + 1 - offset;
            }
            break;
        }

        if (len_or_ptr & 0xC0) == 0xC0 {
            // Compression pointer.
            if pos + 1 >= packet.len() {
                return None;
            }
            if !jumped {
                wire_consumed = pos + 2 - offset;
            }
            let ptr_offset = ((len_or_ptr as usize & 0x3F) << 8) | (packet[pos + 1] as usize);
            if ptr_offset >= packet.len() {
                return None;
            }
            pointer_count += 1;
            if pointer_count > MAX_POINTER_FOLLOWS {
                return None;
            }
            pos = ptr_offset;
            jumped = true;
            continue;
        }

        if (len_or_ptr & 0xC0) != 0 {
            // Reserved label type.
            return None;
        }

        let label_len = len_or_ptr as usize;
        if label_len > DNS_LABEL_MAX {
            return None;
        }
        pos += 1;
        if pos + label_len > packet.len() {
            return None;
        }

        if out_pos > 0 {
            if out_pos >= out.len() {
                return None;
            }
            out[out_pos] = b'.';
            out_pos += 1;
        }
        if out_pos + label_len > out.len() || out_pos + label_len > DNS_NAME_MAX {
            return None;
        }
        out[out_pos..out_pos + label_len].copy_from_slice(&packet[pos..pos + label_len]);
        out_pos += label_len;
        pos += label_len;
    }

    Some((out_pos, wire_consumed))
}

/// Skip a DNS name in wire format, returning the offset just past it.
///
/// A compression pointer ends the name (2 bytes); label walks are bounded.
fn skip_name(packet: &[u8], mut pos: usize) -> Option<usize> {
    let mut labels = 0usize;
    loop {
        if pos >= packet.len() {
            return None;
        }
        let b = packet[pos];
        if b == 0 {
            return Some(pos + 1);
        }
        if (b & 0xC0) == 0xC0 {
            if pos + 1 >= packet.len() {
                return None;
            }
            return Some(pos + 2);
        }
        if (b & 0xC0) != 0 {
            return None;
        }
        pos += 1 + b as usize;
        labels += 1;
        if labels > MAX_POINTER_FOLLOWS {
            return None;
        }
    }
}

// =============================================================================
// Response parsing
// =============================================================================

/// Outcome of parsing a response that belongs to one of our queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DnsOutcome {
    /// First valid A record.
    Answer { addr: Ipv4Addr, ttl_secs: u32 },
    /// Error RCODE or a response without any A record.
    Failure,
}

/// Parse a DNS response for `expected_id`.
///
/// Returns `None` when the message is not a response to that query at all
/// (wrong id, not a response, malformed); `Some(outcome)` when the query is
/// thereby completed.
pub fn parse_response(packet: &[u8], expected_id: u16) -> Option<DnsOutcome> {
    let header = DnsHeader::from_bytes(packet)?;
    if !header.qr() || header.id != expected_id {
        return None;
    }
    if header.rcode() != 0 {
        return Some(DnsOutcome::Failure);
    }

    // Skip the question section.
    let mut pos = DNS_HEADER_LEN;
    for _ in 0..header.qdcount {
        pos = skip_name(packet, pos)?;
        if pos + 4 > packet.len() {
            return Some(DnsOutcome::Failure);
        }
        pos += 4;
    }

    // Walk the answer section; the first well-formed A record wins.
    for _ in 0..header.ancount {
        if pos >= packet.len() {
            break;
        }
        pos = match skip_name(packet, pos) {
            Some(p) => p,
            None => break,
        };
        if pos + 10 > packet.len() {
            break;
        }
        let rr_type = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
        let ttl = u32::from_be_bytes([
            packet[pos + 4],
            packet[pos + 5],
            packet[pos + 6],
            packet[pos + 7],
        ]);
        let rdlength = u16::from_be_bytes([packet[pos + 8], packet[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlength > packet.len() {
            break;
        }

        if rr_type == DnsType::A as u16 && rdlength == 4 {
            let addr = Ipv4Addr([packet[pos], packet[pos + 1], packet[pos + 2], packet[pos + 3]]);
            return Some(DnsOutcome::Answer { addr, ttl_secs: ttl });
        }
        // CNAME and anything else: skip the RDATA and keep walking — the A
        // record for the canonical name usually follows in the same section.
        pos += rdlength;
    }

    Some(DnsOutcome::Failure)
}

// =============================================================================
// Cache
// =============================================================================

fn name_eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.to_ascii_lowercase() == y.to_ascii_lowercase())
}

/// One resolved name.
#[derive(Clone, Debug)]
struct DnsCacheEntry {
    hostname: String,
    addr: Ipv4Addr,
    ttl_secs: u32,
    cached_at_ms: u64,
    valid: bool,
}

impl DnsCacheEntry {
    const EMPTY: Self = Self {
        hostname: String::new(),
        addr: Ipv4Addr::UNSPECIFIED,
        ttl_secs: 0,
        cached_at_ms: 0,
        valid: false,
    };
}

/// Fixed-size A-record cache.
///
/// Replacement: an existing entry for the same hostname is updated in
/// place; otherwise the first empty slot is used; otherwise the oldest
/// entry (largest age) is evicted.
struct DnsCache {
    entries: [DnsCacheEntry; DNS_CACHE_SIZE],
}

impl DnsCache {
    const fn new() -> Self {
        Self {
            entries: [const { DnsCacheEntry::EMPTY }; DNS_CACHE_SIZE],
        }
    }

    fn lookup(&mut self, hostname: &[u8], now_ms: u64) -> Option<Ipv4Addr> {
        for entry in self.entries.iter_mut() {
            if entry.valid && name_eq_ignore_case(entry.hostname.as_bytes(), hostname) {
                let age_ms = now_ms.saturating_sub(entry.cached_at_ms);
                if age_ms < entry.ttl_secs as u64 * 1000 {
                    return Some(entry.addr);
                }
                entry.valid = false;
                return None;
            }
        }
        None
    }

    fn insert(&mut self, hostname: &[u8], addr: Ipv4Addr, ttl_secs: u32, now_ms: u64) {
        let Ok(name) = core::str::from_utf8(hostname) else {
            return;
        };

        // Same hostname: refresh in place.
        for entry in self.entries.iter_mut() {
            if entry.valid && name_eq_ignore_case(entry.hostname.as_bytes(), hostname) {
                entry.addr = addr;
                entry.ttl_secs = ttl_secs;
                entry.cached_at_ms = now_ms;
                return;
            }
        }

        // First empty slot.
        for entry in self.entries.iter_mut() {
            if !entry.valid {
                *entry = DnsCacheEntry {
                    hostname: String::from(name),
                    addr,
                    ttl_secs,
                    cached_at_ms: now_ms,
                    valid: true,
                };
                return;
            }
        }

        // Oldest (largest age) slot.
        let mut oldest_idx = 0usize;
        let mut oldest_at = u64::MAX;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.cached_at_ms < oldest_at {
                oldest_at = entry.cached_at_ms;
                oldest_idx = i;
            }
        }
        self.entries[oldest_idx] = DnsCacheEntry {
            hostname: String::from(name),
            addr,
            ttl_secs,
            cached_at_ms: now_ms,
            valid: true,
        };
    }
}

// =============================================================================
// Query table
// =============================================================================

/// An in-flight lookup.
struct DnsQuery {
    hostname: String,
    id: u16,
    src_port: Port,
    sent_at_ms: u64,
    attempts: u8,
    /// Synchronous lookups park their result here instead of raising an
    /// event; the polling caller collects it via [`take_sync_result`].
    sync: bool,
    done: Option<Option<Ipv4Addr>>,
}

/// Resolver state: query table + cache + id generator.
pub(crate) struct DnsResolver {
    queries: [Option<DnsQuery>; DNS_MAX_QUERIES],
    cache: DnsCache,
    next_id: u16,
}

impl DnsResolver {
    pub(crate) const fn new() -> Self {
        Self {
            queries: [const { None }; DNS_MAX_QUERIES],
            cache: DnsCache::new(),
            next_id: 0x4242,
        }
    }

    fn next_id(&mut self) -> u16 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }
}

/// Result of starting a lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DnsLookup {
    /// Answered immediately (literal or cache hit).
    Address(Ipv4Addr),
    /// Query sent; completion arrives with this transaction id.
    Pending(u16),
}

/// Pick the DNS server: first configured device with a server address.
fn dns_server(inner: &StackInner) -> Option<(DevIndex, Ipv4Addr, Ipv4Addr)> {
    for i in 0..super::netdev::MAX_DEVICES {
        let dev = DevIndex(i);
        if let Some(cfg) = inner.devices.config(dev) {
            let server = cfg.dns[0];
            if !server.is_unspecified() {
                return Some((dev, cfg.addr, server));
            }
        }
    }
    None
}

fn transmit_query(
    inner: &mut StackInner,
    hostname: &[u8],
    id: u16,
    src_port: Port,
) -> Result<(), NetError> {
    let (dev, src_ip, server) = dns_server(inner).ok_or(NetError::NetworkUnreachable)?;
    let mut buf = [0u8; DNS_MAX_MESSAGE];
    let len = build_query(id, hostname, DnsType::A, &mut buf).ok_or(NetError::InvalidArgument)?;
    udp::send_raw(
        inner,
        dev,
        SockAddr::new(src_ip, src_port),
        SockAddr::new(server, Port(DNS_PORT)),
        &buf[..len],
    )
}

/// Start a lookup: IP literals and cache hits answer immediately, anything
/// else allocates a query slot and sends the first query.
pub(crate) fn lookup(
    inner: &mut StackInner,
    hostname: &[u8],
    sync: bool,
    now_ms: u64,
) -> Result<DnsLookup, NetError> {
    if hostname.is_empty() || hostname.len() > DNS_NAME_MAX {
        return Err(NetError::InvalidArgument);
    }
    if let Some(addr) = Ipv4Addr::parse(hostname) {
        return Ok(DnsLookup::Address(addr));
    }
    if let Some(addr) = inner.dns.cache.lookup(hostname, now_ms) {
        klog_debug!("dns: cache hit -> {}", addr);
        return Ok(DnsLookup::Address(addr));
    }
    let Ok(name) = core::str::from_utf8(hostname) else {
        return Err(NetError::InvalidArgument);
    };

    let slot = inner
        .dns
        .queries
        .iter()
        .position(|q| q.is_none())
        .ok_or(NetError::NoBufferSpace)?;
    let id = inner.dns.next_id();
    let src_port = inner.alloc_ephemeral_port();

    inner.dns.queries[slot] = Some(DnsQuery {
        hostname: String::from(name),
        id,
        src_port,
        sent_at_ms: now_ms,
        attempts: 1,
        sync,
        done: None,
    });

    if let Err(err) = transmit_query(inner, hostname, id, src_port) {
        inner.dns.queries[slot] = None;
        return Err(err);
    }
    klog_debug!("dns: query {:#06x} for {} sent", id, name);
    Ok(DnsLookup::Pending(id))
}

/// Cached address for a hostname, if still valid.
pub(crate) fn get_cached(inner: &mut StackInner, hostname: &[u8], now_ms: u64) -> Option<Ipv4Addr> {
    inner.dns.cache.lookup(hostname, now_ms)
}

/// Complete a query slot: cache the answer, then either park the result
/// (sync) or free the slot and raise the completion event.
fn complete(inner: &mut StackInner, slot: usize, result: Option<Ipv4Addr>) {
    let Some(query) = inner.dns.queries[slot].as_mut() else {
        return;
    };
    let id = query.id;
    if query.sync {
        query.done = Some(result);
    } else {
        inner.dns.queries[slot] = None;
        inner.events.push(NetEvent::DnsCompleted { id, addr: result });
    }
}

/// Handle a datagram from source port 53 (intercepted in the UDP RX path).
pub(crate) fn rx(
    inner: &mut StackInner,
    _src: Ipv4Addr,
    dst_port: Port,
    payload: &[u8],
    now_ms: u64,
) {
    let Some(header) = DnsHeader::from_bytes(payload) else {
        return;
    };

    let Some(slot) = inner.dns.queries.iter().position(|q| {
        q.as_ref()
            .is_some_and(|q| q.id == header.id && q.src_port == dst_port && q.done.is_none())
    }) else {
        return;
    };

    let Some(outcome) = parse_response(payload, header.id) else {
        return;
    };

    match outcome {
        DnsOutcome::Answer { addr, ttl_secs } => {
            let hostname = inner.dns.queries[slot]
                .as_ref()
                .map(|q| q.hostname.clone())
                .unwrap_or_default();
            klog_debug!("dns: {} -> {} (ttl={}s)", hostname, addr, ttl_secs);
            inner
                .dns
                .cache
                .insert(hostname.as_bytes(), addr, ttl_secs, now_ms);
            complete(inner, slot, Some(addr));
        }
        DnsOutcome::Failure => {
            klog_debug!("dns: query {:#06x} failed", header.id);
            complete(inner, slot, None);
        }
    }
}

/// Periodic task: retry timed-out queries, fail exhausted ones.
pub(crate) fn task(inner: &mut StackInner, now_ms: u64) {
    for slot in 0..DNS_MAX_QUERIES {
        let Some(query) = inner.dns.queries[slot].as_mut() else {
            continue;
        };
        if query.done.is_some() {
            continue;
        }
        if now_ms.saturating_sub(query.sent_at_ms) < DNS_TIMEOUT_MS {
            continue;
        }

        if query.attempts >= DNS_MAX_ATTEMPTS {
            klog_debug!("dns: query {:#06x} exhausted retries", query.id);
            complete(inner, slot, None);
            continue;
        }

        query.attempts += 1;
        query.sent_at_ms = now_ms;
        let (id, src_port, attempt) = (query.id, query.src_port, query.attempts);
        let hostname = query.hostname.clone();
        klog_debug!("dns: attempt #{} for {}", attempt, hostname);
        if transmit_query(inner, hostname.as_bytes(), id, src_port).is_err() {
            complete(inner, slot, None);
        }
    }
}

/// Collect the parked result of a synchronous query, freeing its slot.
///
/// Returns `None` while the query is still in flight.
pub(crate) fn take_sync_result(inner: &mut StackInner, id: u16) -> Option<Option<Ipv4Addr>> {
    let slot = inner
        .dns
        .queries
        .iter()
        .position(|q| q.as_ref().is_some_and(|q| q.id == id))?;
    let done = inner.dns.queries[slot].as_ref().and_then(|q| q.done);
    if done.is_some() {
        inner.dns.queries[slot] = None;
    }
    done
}

/// Drop a query slot (sync lookup timed out waiting).
pub(crate) fn cancel(inner: &mut StackInner, id: u16) {
    if let Some(slot) = inner
        .dns
        .queries
        .iter()
        .position(|q| q.as_ref().is_some_and(|q| q.id == id))
    {
        inner.dns.queries[slot] = None;
    }
}

//! UDP: datagram sockets, demultiplexing, and the wire codec.
//!
//! Sockets live in a fixed-size table addressed by [`UdpHandle`].  Demux
//! matches the destination port, preferring an exact local-address bind over
//! a wildcard bind.  Received datagrams surface as
//! [`NetEvent::UdpDatagram`](super::stack::NetEvent) carrying the source
//! address and payload.
//!
//! Two clients are intercepted ahead of socket demux: BOOTP replies
//! (destination port 68) feed the DHCP client, and responses from source
//! port 53 feed the DNS resolver.  Both are *also* delivered to any bound
//! socket — userland may legitimately own those ports.

extern crate alloc;

use bitflags::bitflags;
use oxbow_lib::{klog_debug, klog_warn};

use super::ipv4::{self, DEFAULT_TTL, Ipv4Header};
use super::packetbuf::PacketBuf;
use super::stack::{NetEvent, StackInner};
use super::types::{DevIndex, IpProtocol, Ipv4Addr, NetError, Port, SockAddr};
use super::{checksum, dhcp, dns};

use core::fmt;

/// UDP header length: src port(2) + dst port(2) + length(2) + checksum(2).
pub const UDP_HEADER_LEN: usize = 8;

/// Maximum number of simultaneously open UDP sockets.
pub const MAX_UDP_SOCKETS: usize = 32;

/// Largest payload fitting a standard Ethernet frame (1500 − 20 − 8).
pub const UDP_MAX_PAYLOAD: usize = 1472;

bitflags! {
    /// Per-socket option flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct UdpSocketFlags: u32 {
        /// Allow rebinding an (address, port) pair that is already bound.
        const REUSE_ADDR = 1 << 0;
        /// Permit sending to broadcast destinations.
        const BROADCAST  = 1 << 1;
    }
}

/// Stable handle addressing a UDP socket table slot.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpHandle(pub u32);

impl fmt::Debug for UdpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UdpHandle({})", self.0)
    }
}

// =============================================================================
// Socket table
// =============================================================================

/// One open UDP socket.
#[derive(Clone, Copy, Debug)]
struct UdpSocket {
    local: SockAddr,
    remote: Option<SockAddr>,
    flags: UdpSocketFlags,
}

/// Fixed-slot UDP socket table.
pub(crate) struct UdpTable {
    sockets: [Option<UdpSocket>; MAX_UDP_SOCKETS],
}

impl UdpTable {
    pub(crate) const fn new() -> Self {
        Self {
            sockets: [None; MAX_UDP_SOCKETS],
        }
    }

    fn get(&self, handle: UdpHandle) -> Option<&UdpSocket> {
        self.sockets.get(handle.0 as usize)?.as_ref()
    }

    fn get_mut(&mut self, handle: UdpHandle) -> Option<&mut UdpSocket> {
        self.sockets.get_mut(handle.0 as usize)?.as_mut()
    }

    /// Open a socket in the first free slot.
    pub(crate) fn open(&mut self, flags: UdpSocketFlags) -> Result<UdpHandle, NetError> {
        for (i, slot) in self.sockets.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(UdpSocket {
                    local: SockAddr::UNSPECIFIED,
                    remote: None,
                    flags,
                });
                return Ok(UdpHandle(i as u32));
            }
        }
        Err(NetError::NoBufferSpace)
    }

    /// Bind a socket to a local (address, port) pair.
    pub(crate) fn bind(
        &mut self,
        handle: UdpHandle,
        local: SockAddr,
    ) -> Result<(), NetError> {
        let reuse = self
            .get(handle)
            .ok_or(NetError::NotFound)?
            .flags
            .contains(UdpSocketFlags::REUSE_ADDR);

        for (i, slot) in self.sockets.iter().enumerate() {
            if i == handle.0 as usize {
                continue;
            }
            if let Some(other) = slot
                && other.local.port == local.port
                && other.local.port.0 != 0
                && (other.local.ip == local.ip
                    || other.local.ip.is_unspecified()
                    || local.ip.is_unspecified())
                && !(reuse && other.flags.contains(UdpSocketFlags::REUSE_ADDR))
            {
                return Err(NetError::AddressInUse);
            }
        }

        self.get_mut(handle).ok_or(NetError::NotFound)?.local = local;
        Ok(())
    }

    /// Fix the default destination of a socket.
    pub(crate) fn connect(&mut self, handle: UdpHandle, remote: SockAddr) -> Result<(), NetError> {
        self.get_mut(handle).ok_or(NetError::NotFound)?.remote = Some(remote);
        Ok(())
    }

    /// Close a socket.  Closing an already-closed handle is a no-op.
    pub(crate) fn close(&mut self, handle: UdpHandle) {
        if let Some(slot) = self.sockets.get_mut(handle.0 as usize) {
            *slot = None;
        }
    }

    /// Demux: exact local-address match first, then wildcard binds.
    fn lookup(&self, dst: SockAddr) -> Option<UdpHandle> {
        for (i, slot) in self.sockets.iter().enumerate() {
            if let Some(s) = slot
                && s.local.port == dst.port
                && s.local.ip == dst.ip
            {
                return Some(UdpHandle(i as u32));
            }
        }
        for (i, slot) in self.sockets.iter().enumerate() {
            if let Some(s) = slot
                && s.local.port == dst.port
                && s.local.ip.is_unspecified()
            {
                return Some(UdpHandle(i as u32));
            }
        }
        None
    }

    fn local(&self, handle: UdpHandle) -> Option<SockAddr> {
        self.get(handle).map(|s| s.local)
    }

    fn remote(&self, handle: UdpHandle) -> Option<SockAddr> {
        self.get(handle)?.remote
    }
}

// =============================================================================
// Wire codec
// =============================================================================

/// Parse a UDP header, returning `(src_port, dst_port, payload)`.
///
/// Validates the declared UDP length against the segment.
pub fn parse_header(segment: &[u8]) -> Option<(Port, Port, &[u8])> {
    if segment.len() < UDP_HEADER_LEN {
        return None;
    }
    let src_port = Port(u16::from_be_bytes([segment[0], segment[1]]));
    let dst_port = Port(u16::from_be_bytes([segment[2], segment[3]]));
    let udp_len = u16::from_be_bytes([segment[4], segment[5]]) as usize;
    if udp_len < UDP_HEADER_LEN || udp_len > segment.len() {
        return None;
    }
    Some((src_port, dst_port, &segment[UDP_HEADER_LEN..udp_len]))
}

/// Prepend a UDP header and patch in the pseudo-header checksum.
///
/// Per RFC 768, a computed checksum of zero is transmitted as `0xFFFF`.
pub fn push_header(
    pkt: &mut PacketBuf,
    src: SockAddr,
    dst: SockAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
) -> Result<(), NetError> {
    let udp_len = (UDP_HEADER_LEN + pkt.len()) as u16;
    {
        let hdr = pkt.push_header(UDP_HEADER_LEN)?;
        hdr[0..2].copy_from_slice(&src.port.to_network_bytes());
        hdr[2..4].copy_from_slice(&dst.port.to_network_bytes());
        hdr[4..6].copy_from_slice(&udp_len.to_be_bytes());
        hdr[6..8].copy_from_slice(&0u16.to_be_bytes());
    }
    let csum = checksum::transport_checksum(src_ip, dst_ip, IpProtocol::Udp, pkt.payload());
    let csum = if csum == 0 { 0xFFFF } else { csum };
    pkt.payload_mut()[6..8].copy_from_slice(&csum.to_be_bytes());
    Ok(())
}

// =============================================================================
// RX
// =============================================================================

/// Handle a received UDP segment (IP header already stripped).
pub(crate) fn rx(
    inner: &mut StackInner,
    dev: DevIndex,
    ip: &Ipv4Header,
    segment: &[u8],
    now_ms: u64,
) {
    let Some((src_port, dst_port, payload)) = parse_header(segment) else {
        klog_debug!("udp: malformed header from {}", ip.src);
        inner.count_rx_drop(dev);
        return;
    };

    // Checksum 0 means "not computed"; anything else must verify.
    let udp_len = UDP_HEADER_LEN + payload.len();
    let wire_csum = u16::from_be_bytes([segment[6], segment[7]]);
    if wire_csum != 0
        && !checksum::transport_verify(ip.src, ip.dst, IpProtocol::Udp, &segment[..udp_len])
    {
        klog_warn!("udp: bad checksum from {}:{}", ip.src, src_port);
        inner.count_rx_drop(dev);
        return;
    }

    // Client interception ahead of socket demux.
    if dst_port.0 == dhcp::UDP_PORT_CLIENT {
        dhcp::rx(inner, dev, payload, now_ms);
    }
    if src_port.0 == dns::DNS_PORT {
        dns::rx(inner, ip.src, dst_port, payload, now_ms);
    }

    let dst = SockAddr::new(ip.dst, dst_port);
    let Some(handle) = inner.udp.lookup(dst) else {
        klog_debug!("udp: drop, no socket for {}", dst);
        inner.count_rx_drop(dev);
        return;
    };

    inner.events.push(NetEvent::UdpDatagram {
        socket: handle,
        src: SockAddr::new(ip.src, src_port),
        data: payload.to_vec(),
    });
}

// =============================================================================
// TX
// =============================================================================

/// Send a datagram on a connected socket.
pub(crate) fn send(
    inner: &mut StackInner,
    handle: UdpHandle,
    payload: &[u8],
) -> Result<usize, NetError> {
    let dst = inner.udp.remote(handle).ok_or(NetError::NotConnected)?;
    send_to(inner, handle, dst, payload)
}

/// Send a datagram to an explicit destination.
///
/// A socket with no bound port is bound to an ephemeral port first.
pub(crate) fn send_to(
    inner: &mut StackInner,
    handle: UdpHandle,
    dst: SockAddr,
    payload: &[u8],
) -> Result<usize, NetError> {
    let mut local = inner.udp.local(handle).ok_or(NetError::NotFound)?;
    if payload.len() > UDP_MAX_PAYLOAD {
        return Err(NetError::InvalidArgument);
    }
    if dst.ip.is_broadcast()
        && !inner
            .udp
            .get(handle)
            .is_some_and(|s| s.flags.contains(UdpSocketFlags::BROADCAST))
    {
        return Err(NetError::InvalidArgument);
    }
    if local.port.0 == 0 {
        local.port = inner.alloc_ephemeral_port();
        inner.udp.bind(handle, local)?;
    }

    let dev = inner
        .devices
        .select_for(dst.ip)
        .ok_or(NetError::NetworkUnreachable)?;
    let src_ip = if local.ip.is_unspecified() {
        inner.devices.addr(dev).unwrap_or(Ipv4Addr::UNSPECIFIED)
    } else {
        local.ip
    };

    let mut pkt = PacketBuf::for_tx()?;
    pkt.append(payload)?;
    push_header(&mut pkt, SockAddr::new(src_ip, local.port), dst, src_ip, dst.ip)?;
    ipv4::send_from(inner, dev, src_ip, dst.ip, IpProtocol::Udp, DEFAULT_TTL, pkt)?;
    Ok(payload.len())
}

/// Raw datagram TX with explicit device/source, no socket involved.
///
/// The DHCP client sends through here while the interface is unconfigured;
/// the DNS resolver uses it for query transmission.
pub(crate) fn send_raw(
    inner: &mut StackInner,
    dev: DevIndex,
    src: SockAddr,
    dst: SockAddr,
    payload: &[u8],
) -> Result<(), NetError> {
    let mut pkt = PacketBuf::for_tx()?;
    pkt.append(payload)?;
    push_header(&mut pkt, src, dst, src.ip, dst.ip)?;
    ipv4::send_from(inner, dev, src.ip, dst.ip, IpProtocol::Udp, DEFAULT_TTL, pkt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_codec_round_trip_with_checksum() {
        let src_ip = Ipv4Addr([10, 0, 0, 1]);
        let dst_ip = Ipv4Addr([10, 0, 0, 2]);
        let mut pkt = PacketBuf::alloc(256, 64).unwrap();
        pkt.append(b"dns query bytes").unwrap();
        push_header(
            &mut pkt,
            SockAddr::new(src_ip, Port(49152)),
            SockAddr::new(dst_ip, Port(53)),
            src_ip,
            dst_ip,
        )
        .unwrap();

        let segment = pkt.payload();
        let (sp, dp, payload) = parse_header(segment).unwrap();
        assert_eq!(sp, Port(49152));
        assert_eq!(dp, Port(53));
        assert_eq!(payload, b"dns query bytes");
        assert!(checksum::transport_verify(
            src_ip,
            dst_ip,
            IpProtocol::Udp,
            segment
        ));
    }

    #[test]
    fn bad_declared_length_rejected() {
        let mut segment = [0u8; 16];
        segment[4..6].copy_from_slice(&32u16.to_be_bytes()); // longer than buffer
        assert!(parse_header(&segment).is_none());
        segment[4..6].copy_from_slice(&4u16.to_be_bytes()); // below header size
        assert!(parse_header(&segment).is_none());
    }

    #[test]
    fn bind_conflicts_and_reuse() {
        let mut table = UdpTable::new();
        let a = table.open(UdpSocketFlags::empty()).unwrap();
        let b = table.open(UdpSocketFlags::empty()).unwrap();

        table
            .bind(a, SockAddr::new(Ipv4Addr::UNSPECIFIED, Port(5000)))
            .unwrap();
        assert_eq!(
            table
                .bind(b, SockAddr::new(Ipv4Addr([10, 0, 0, 1]), Port(5000)))
                .unwrap_err(),
            NetError::AddressInUse
        );

        // Both ends opting into REUSE_ADDR allows the rebind.
        let c = table.open(UdpSocketFlags::REUSE_ADDR).unwrap();
        let d = table.open(UdpSocketFlags::REUSE_ADDR).unwrap();
        table
            .bind(c, SockAddr::new(Ipv4Addr::UNSPECIFIED, Port(6000)))
            .unwrap();
        table
            .bind(d, SockAddr::new(Ipv4Addr::UNSPECIFIED, Port(6000)))
            .unwrap();
    }

    #[test]
    fn demux_prefers_exact_address() {
        let mut table = UdpTable::new();
        let wild = table.open(UdpSocketFlags::empty()).unwrap();
        let exact = table.open(UdpSocketFlags::REUSE_ADDR).unwrap();
        // Different addresses, same port, REUSE on the second.
        table
            .bind(wild, SockAddr::new(Ipv4Addr::UNSPECIFIED, Port(53)))
            .unwrap();
        // Direct slot surgery is fine here; bind() would refuse the overlap
        // without both sockets opting into REUSE_ADDR.
        table.sockets[exact.0 as usize].as_mut().unwrap().local =
            SockAddr::new(Ipv4Addr([10, 0, 0, 7]), Port(53));

        assert_eq!(
            table.lookup(SockAddr::new(Ipv4Addr([10, 0, 0, 7]), Port(53))),
            Some(exact)
        );
        assert_eq!(
            table.lookup(SockAddr::new(Ipv4Addr([10, 0, 0, 8]), Port(53))),
            Some(wild)
        );
        assert_eq!(
            table.lookup(SockAddr::new(Ipv4Addr([10, 0, 0, 8]), Port(54))),
            None
        );
    }

    #[test]
    fn close_is_idempotent() {
        let mut table = UdpTable::new();
        let h = table.open(UdpSocketFlags::empty()).unwrap();
        table.close(h);
        // Second close of the same handle must not error or disturb others.
        table.close(h);
        assert!(table.get(h).is_none());
    }
}

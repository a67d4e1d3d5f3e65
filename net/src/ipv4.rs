//! IPv4 layer: header codec, RX validation and local-delivery decision,
//! protocol demux, and the TX path (device selection, next-hop resolution,
//! header construction).
//!
//! # RX validation
//!
//! 1. Minimum header length (20 bytes)
//! 2. Version must be 4
//! 3. IHL ≥ 5 and within the packet
//! 4. Header checksum must fold to zero
//! 5. Declared total length ≤ packet length (packet is trimmed down to it)
//! 6. No fragments: nonzero fragment offset or MF set → drop
//! 7. TTL > 0 (nothing is ever forwarded, so TTL = 0 is always invalid)
//!
//! Packets failing any check are dropped with a debug log.  Packets that
//! pass but are not addressed to the receiving interface (exact address,
//! limited broadcast, or subnet broadcast) are dropped silently — there is
//! no routing.

use oxbow_lib::{klog_debug, klog_warn};

use super::ethernet;
use super::packetbuf::PacketBuf;
use super::stack::StackInner;
use super::types::{DevIndex, EtherType, IpProtocol, Ipv4Addr, MacAddr, NetError};
use super::{checksum, icmp, tcp_socket, udp};

/// IPv4 header length without options.
pub const IPV4_HEADER_LEN: usize = 20;

/// Default TTL for locally originated datagrams.
pub const DEFAULT_TTL: u8 = 64;

/// "Don't fragment" flag in the flags/fragment-offset field.
const FLAG_DONT_FRAGMENT: u16 = 0x4000;
/// "More fragments" flag.
const FLAG_MORE_FRAGMENTS: u16 = 0x2000;
/// Fragment offset mask (13 bits).
const FRAG_OFFSET_MASK: u16 = 0x1FFF;

// =============================================================================
// Header
// =============================================================================

/// Parsed and validated IPv4 header.
#[derive(Clone, Copy, Debug)]
pub struct Ipv4Header {
    /// Header length in bytes (IHL × 4).
    pub ihl: usize,
    /// Declared total datagram length (header + payload).
    pub total_len: usize,
    pub ident: u16,
    pub ttl: u8,
    /// Raw protocol number; demux via [`IpProtocol::from_u8`].
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

/// Parse and validate the IPv4 header at the front of `data`.
///
/// Applies the full RX validation order from the module documentation.
/// Returns `None` (after a debug log) on any failure.
pub fn parse_and_validate(data: &[u8]) -> Option<Ipv4Header> {
    if data.len() < IPV4_HEADER_LEN {
        klog_debug!("ipv4: packet too short ({} < {})", data.len(), IPV4_HEADER_LEN);
        return None;
    }

    let version = (data[0] >> 4) & 0x0F;
    if version != 4 {
        klog_debug!("ipv4: bad version {}", version);
        return None;
    }

    let ihl = ((data[0] & 0x0F) as usize) * 4;
    if ihl < IPV4_HEADER_LEN || data.len() < ihl {
        klog_debug!("ipv4: bad IHL {} (packet len {})", ihl, data.len());
        return None;
    }

    if !checksum::verify(&data[..ihl]) {
        klog_warn!("ipv4: bad header checksum");
        return None;
    }

    let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if total_len < ihl || total_len > data.len() {
        klog_debug!("ipv4: total_len {} out of range (packet len {})", total_len, data.len());
        return None;
    }

    let frag = u16::from_be_bytes([data[6], data[7]]);
    if (frag & FLAG_MORE_FRAGMENTS) != 0 || (frag & FRAG_OFFSET_MASK) != 0 {
        klog_debug!("ipv4: fragmented datagram (frag=0x{:04x}), unsupported", frag);
        return None;
    }

    let ttl = data[8];
    if ttl == 0 {
        klog_debug!("ipv4: TTL=0, dropping");
        return None;
    }

    Some(Ipv4Header {
        ihl,
        total_len,
        ident: u16::from_be_bytes([data[4], data[5]]),
        ttl,
        protocol: data[9],
        src: Ipv4Addr([data[12], data[13], data[14], data[15]]),
        dst: Ipv4Addr([data[16], data[17], data[18], data[19]]),
    })
}

/// Prepend a 20-byte IPv4 header (version 4, DF set, no options) onto `pkt`
/// and patch in the computed checksum.
pub fn push_header(
    pkt: &mut PacketBuf,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: IpProtocol,
    ttl: u8,
    ident: u16,
) -> Result<(), NetError> {
    let total_len = (IPV4_HEADER_LEN + pkt.len()) as u16;
    let hdr = pkt.push_header(IPV4_HEADER_LEN)?;
    hdr[0] = 0x45; // version 4, IHL 5
    hdr[1] = 0; // ToS
    hdr[2..4].copy_from_slice(&total_len.to_be_bytes());
    hdr[4..6].copy_from_slice(&ident.to_be_bytes());
    hdr[6..8].copy_from_slice(&FLAG_DONT_FRAGMENT.to_be_bytes());
    hdr[8] = ttl;
    hdr[9] = protocol.as_u8();
    hdr[10..12].copy_from_slice(&0u16.to_be_bytes());
    hdr[12..16].copy_from_slice(src.as_bytes());
    hdr[16..20].copy_from_slice(dst.as_bytes());
    let csum = checksum::checksum(hdr);
    hdr[10..12].copy_from_slice(&csum.to_be_bytes());
    Ok(())
}

// =============================================================================
// RX
// =============================================================================

/// Handle a received IPv4 datagram (Ethernet header already consumed).
///
/// Validates the header, decides local delivery, strips the header, and
/// dispatches on protocol number.
pub(crate) fn rx(inner: &mut StackInner, dev: DevIndex, mut pkt: PacketBuf, now_ms: u64) {
    let Some(hdr) = parse_and_validate(pkt.payload()) else {
        inner.count_rx_drop(dev);
        return;
    };

    if !inner.devices.is_local_delivery(dev, hdr.dst) {
        // Not ours and we do not forward — silent drop.
        inner.count_rx_drop(dev);
        return;
    }

    // Trim link-layer padding beyond the declared total length, then strip
    // the header so payload() is the L4 segment.
    if pkt.trim_to(hdr.total_len).is_err() || pkt.pull_header(hdr.ihl).is_err() {
        inner.count_rx_drop(dev);
        return;
    }

    match IpProtocol::from_u8(hdr.protocol) {
        Some(IpProtocol::Icmp) => icmp::rx(inner, dev, &hdr, pkt.payload()),
        Some(IpProtocol::Tcp) => tcp_socket::rx(inner, dev, &hdr, pkt.payload(), now_ms),
        Some(IpProtocol::Udp) => udp::rx(inner, dev, &hdr, pkt.payload(), now_ms),
        None => {
            klog_debug!("ipv4: unknown protocol {}, dropping", hdr.protocol);
            inner.count_rx_drop(dev);
        }
    }
}

// =============================================================================
// TX
// =============================================================================

/// Send an IPv4 datagram, selecting the outgoing device for `dst`.
///
/// The source address is the selected device's configured address.
pub(crate) fn send(
    inner: &mut StackInner,
    dst: Ipv4Addr,
    protocol: IpProtocol,
    ttl: u8,
    pkt: PacketBuf,
) -> Result<DevIndex, NetError> {
    let dev = inner
        .devices
        .select_for(dst)
        .ok_or(NetError::NetworkUnreachable)?;
    let src = inner.devices.addr(dev).unwrap_or(Ipv4Addr::UNSPECIFIED);
    send_from(inner, dev, src, dst, protocol, ttl, pkt)?;
    Ok(dev)
}

/// Send an IPv4 datagram on an explicit device with an explicit source.
///
/// The DHCP client uses this form while the interface has no address yet
/// (src `0.0.0.0`, dst `255.255.255.255`).
pub(crate) fn send_from(
    inner: &mut StackInner,
    dev: DevIndex,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: IpProtocol,
    ttl: u8,
    mut pkt: PacketBuf,
) -> Result<(), NetError> {
    let ident = inner.next_ip_ident();
    push_header(&mut pkt, src, dst, protocol, ttl, ident)?;

    let our_mac = inner.devices.mac(dev).ok_or(NetError::NotFound)?;
    let dst_mac = next_hop_mac(inner, dev, dst);
    ethernet::push_header(&mut pkt, dst_mac, our_mac, EtherType::Ipv4)?;

    let frame_len = pkt.len();
    let result = inner
        .devices
        .device(dev)
        .ok_or(NetError::NotFound)?
        .transmit(pkt);

    if let Some(stats) = inner.devices.stats_mut(dev) {
        match result {
            Ok(()) => {
                stats.tx_packets += 1;
                stats.tx_bytes += frame_len as u64;
            }
            Err(_) => stats.tx_errors += 1,
        }
    }
    result
}

/// Resolve the destination MAC for `dst` on `dev`.
///
/// Broadcast destinations (limited or subnet) map to the broadcast MAC.
/// Otherwise the next hop is `dst` when on-subnet, else the gateway, and
/// the stack's [`MacResolver`](super::stack::MacResolver) is consulted with
/// a broadcast fallback.
fn next_hop_mac(inner: &StackInner, dev: DevIndex, dst: Ipv4Addr) -> MacAddr {
    if dst.is_broadcast() || dst.is_multicast() {
        return MacAddr::BROADCAST;
    }
    let next_hop = match inner.devices.config(dev) {
        Some(cfg) if dst == cfg.broadcast() => return MacAddr::BROADCAST,
        Some(cfg) if cfg.is_local(dst) || cfg.gateway.is_unspecified() => dst,
        Some(cfg) => cfg.gateway,
        None => dst,
    };
    inner
        .resolver
        .resolve(dev, next_hop)
        .unwrap_or(MacAddr::BROADCAST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn build_datagram(payload: &[u8], mutate: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut pkt = PacketBuf::alloc(256, IPV4_HEADER_LEN).unwrap();
        pkt.append(payload).unwrap();
        push_header(
            &mut pkt,
            Ipv4Addr([10, 0, 0, 1]),
            Ipv4Addr([10, 0, 0, 2]),
            IpProtocol::Udp,
            DEFAULT_TTL,
            0x0102,
        )
        .unwrap();
        let mut bytes = pkt.payload().to_vec();
        mutate(&mut bytes);
        bytes
    }

    #[test]
    fn valid_header_parses() {
        let bytes = build_datagram(b"hello", |_| {});
        let hdr = parse_and_validate(&bytes).unwrap();
        assert_eq!(hdr.ihl, IPV4_HEADER_LEN);
        assert_eq!(hdr.total_len, IPV4_HEADER_LEN + 5);
        assert_eq!(hdr.ident, 0x0102);
        assert_eq!(hdr.ttl, DEFAULT_TTL);
        assert_eq!(hdr.protocol, IpProtocol::Udp.as_u8());
        assert_eq!(hdr.src, Ipv4Addr([10, 0, 0, 1]));
        assert_eq!(hdr.dst, Ipv4Addr([10, 0, 0, 2]));
    }

    #[test]
    fn trailing_padding_is_tolerated() {
        // Ethernet minimum-frame padding: actual buffer longer than total_len.
        let mut bytes = build_datagram(b"hi", |_| {});
        bytes.extend_from_slice(&[0u8; 18]);
        let hdr = parse_and_validate(&bytes).unwrap();
        assert_eq!(hdr.total_len, IPV4_HEADER_LEN + 2);
    }

    #[test]
    fn short_packet_rejected() {
        assert!(parse_and_validate(&[0x45; 12]).is_none());
    }

    #[test]
    fn bad_version_rejected() {
        let bytes = build_datagram(b"x", |b| {
            b[0] = 0x65; // version 6
            // Checksum would now mismatch anyway; version check fires first.
        });
        assert!(parse_and_validate(&bytes).is_none());
    }

    #[test]
    fn bad_ihl_rejected() {
        let bytes = build_datagram(b"x", |b| {
            b[0] = 0x44; // IHL 4 -> 16 bytes, below minimum
        });
        assert!(parse_and_validate(&bytes).is_none());
    }

    #[test]
    fn corrupted_checksum_rejected() {
        let bytes = build_datagram(b"x", |b| {
            b[10] ^= 0xff;
        });
        assert!(parse_and_validate(&bytes).is_none());
    }

    #[test]
    fn flipping_any_header_bit_invalidates_checksum() {
        let good = build_datagram(b"payload", |_| {});
        for byte in 0..IPV4_HEADER_LEN {
            let mut bad = good.clone();
            bad[byte] ^= 0x01;
            // Every single-bit corruption must be caught by one of the
            // validation steps (checksum at minimum).
            assert!(
                parse_and_validate(&bad).is_none(),
                "corruption at byte {byte} slipped through"
            );
        }
    }

    #[test]
    fn overlong_declared_length_rejected() {
        let bytes = build_datagram(b"x", |b| {
            let bogus = (b.len() + 4) as u16;
            b[2..4].copy_from_slice(&bogus.to_be_bytes());
            // Repair checksum so only the length check can reject.
            b[10] = 0;
            b[11] = 0;
            let csum = checksum::checksum(&b[..IPV4_HEADER_LEN]);
            b[10..12].copy_from_slice(&csum.to_be_bytes());
        });
        assert!(parse_and_validate(&bytes).is_none());
    }

    #[test]
    fn fragments_rejected() {
        for frag in [FLAG_MORE_FRAGMENTS, 0x0001u16, FLAG_MORE_FRAGMENTS | 0x0100] {
            let bytes = build_datagram(b"x", |b| {
                b[6..8].copy_from_slice(&frag.to_be_bytes());
                b[10] = 0;
                b[11] = 0;
                let csum = checksum::checksum(&b[..IPV4_HEADER_LEN]);
                b[10..12].copy_from_slice(&csum.to_be_bytes());
            });
            assert!(parse_and_validate(&bytes).is_none(), "frag=0x{frag:04x} accepted");
        }
    }

    #[test]
    fn zero_ttl_rejected() {
        let bytes = build_datagram(b"x", |b| {
            b[8] = 0;
            b[10] = 0;
            b[11] = 0;
            let csum = checksum::checksum(&b[..IPV4_HEADER_LEN]);
            b[10..12].copy_from_slice(&csum.to_be_bytes());
        });
        assert!(parse_and_validate(&bytes).is_none());
    }
}

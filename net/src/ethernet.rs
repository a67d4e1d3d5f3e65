//! Ethernet II framing: header codec and ingress filtering rules.
//!
//! The frame pipeline itself lives in [`stack`](super::stack); this module
//! owns the byte-level encode/decode and the destination-MAC accept
//! decision.

use super::packetbuf::PacketBuf;
use super::types::{EtherType, MacAddr, NetError};

/// Ethernet header length: dst(6) + src(6) + ethertype(2).
pub const ETH_HEADER_LEN: usize = 14;

/// Parsed Ethernet header.
#[derive(Clone, Copy, Debug)]
pub struct EthHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    /// Raw EtherType value; demux via [`EtherType::from_u16`].
    pub ethertype: u16,
}

/// Parse the Ethernet header at the front of `frame`.
///
/// Returns `None` if the frame is shorter than [`ETH_HEADER_LEN`].
pub fn parse_header(frame: &[u8]) -> Option<EthHeader> {
    if frame.len() < ETH_HEADER_LEN {
        return None;
    }
    Some(EthHeader {
        dst: MacAddr([frame[0], frame[1], frame[2], frame[3], frame[4], frame[5]]),
        src: MacAddr([frame[6], frame[7], frame[8], frame[9], frame[10], frame[11]]),
        ethertype: u16::from_be_bytes([frame[12], frame[13]]),
    })
}

/// Destination filter: accept frames for our MAC, broadcast, multicast, or
/// anything when the device is promiscuous.
#[inline]
pub fn accepts(dst: MacAddr, our_mac: MacAddr, promiscuous: bool) -> bool {
    promiscuous || dst == our_mac || dst.is_broadcast() || dst.is_multicast()
}

/// Prepend an Ethernet header onto `pkt`.
///
/// The payload (the L3 datagram) must already be in place.
pub fn push_header(
    pkt: &mut PacketBuf,
    dst: MacAddr,
    src: MacAddr,
    ethertype: EtherType,
) -> Result<(), NetError> {
    let hdr = pkt.push_header(ETH_HEADER_LEN)?;
    hdr[0..6].copy_from_slice(dst.as_bytes());
    hdr[6..12].copy_from_slice(src.as_bytes());
    hdr[12..14].copy_from_slice(&ethertype.as_u16().to_be_bytes());
    Ok(())
}

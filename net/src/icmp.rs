//! ICMP: echo request/reply handling and the ping API.
//!
//! Echo Requests addressed to us are answered in place (type flipped,
//! checksum recomputed, payload echoed back).  Echo Replies surface as
//! [`NetEvent::EchoReply`](super::stack::NetEvent) on the stack's event
//! sink.  Every other message type is logged and ignored.

extern crate alloc;

use alloc::vec::Vec;

use oxbow_lib::{klog_debug, klog_warn};

use super::ipv4::{self, DEFAULT_TTL, Ipv4Header};
use super::packetbuf::PacketBuf;
use super::stack::{NetEvent, StackInner};
use super::types::{DevIndex, IpProtocol, Ipv4Addr, NetError};
use super::checksum;

/// Echo message header length: type(1) + code(1) + checksum(2) + id(2) + seq(2).
pub const ICMP_ECHO_HEADER_LEN: usize = 8;

pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
pub const ICMP_TYPE_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;
pub const ICMP_TYPE_TIME_EXCEEDED: u8 = 11;

/// Build an echo message (request or reply) with its checksum patched in.
fn build_echo(msg_type: u8, ident: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(ICMP_ECHO_HEADER_LEN + payload.len());
    msg.extend_from_slice(&[msg_type, 0, 0, 0]);
    msg.extend_from_slice(&ident.to_be_bytes());
    msg.extend_from_slice(&seq.to_be_bytes());
    msg.extend_from_slice(payload);
    let csum = checksum::checksum(&msg);
    msg[2..4].copy_from_slice(&csum.to_be_bytes());
    msg
}

/// Handle a received ICMP message (IP header already stripped).
pub(crate) fn rx(inner: &mut StackInner, dev: DevIndex, ip: &Ipv4Header, msg: &[u8]) {
    if msg.len() < 4 {
        klog_debug!("icmp: message too short ({})", msg.len());
        inner.count_rx_drop(dev);
        return;
    }
    if !checksum::verify(msg) {
        klog_warn!("icmp: bad checksum from {}", ip.src);
        inner.count_rx_drop(dev);
        return;
    }

    match msg[0] {
        ICMP_TYPE_ECHO_REQUEST => {
            if msg.len() < ICMP_ECHO_HEADER_LEN {
                inner.count_rx_drop(dev);
                return;
            }
            let ident = u16::from_be_bytes([msg[4], msg[5]]);
            let seq = u16::from_be_bytes([msg[6], msg[7]]);
            klog_debug!("icmp: echo request from {} id={} seq={}", ip.src, ident, seq);

            let reply = build_echo(
                ICMP_TYPE_ECHO_REPLY,
                ident,
                seq,
                &msg[ICMP_ECHO_HEADER_LEN..],
            );
            let Ok(mut pkt) = PacketBuf::for_tx() else {
                return;
            };
            if pkt.append(&reply).is_err() {
                return;
            }
            let src = inner.devices.addr(dev).unwrap_or(ip.dst);
            let _ = ipv4::send_from(inner, dev, src, ip.src, IpProtocol::Icmp, DEFAULT_TTL, pkt);
        }
        ICMP_TYPE_ECHO_REPLY => {
            if msg.len() < ICMP_ECHO_HEADER_LEN {
                inner.count_rx_drop(dev);
                return;
            }
            let ident = u16::from_be_bytes([msg[4], msg[5]]);
            let seq = u16::from_be_bytes([msg[6], msg[7]]);
            inner.events.push(NetEvent::EchoReply {
                src: ip.src,
                ident,
                seq,
                payload: msg[ICMP_ECHO_HEADER_LEN..].to_vec(),
            });
        }
        other => {
            klog_debug!("icmp: type {} from {} ignored", other, ip.src);
        }
    }
}

/// Send an ICMP Echo Request to `dst`.
pub(crate) fn ping(
    inner: &mut StackInner,
    dst: Ipv4Addr,
    ident: u16,
    seq: u16,
    payload: &[u8],
) -> Result<(), NetError> {
    let msg = build_echo(ICMP_TYPE_ECHO_REQUEST, ident, seq, payload);
    let mut pkt = PacketBuf::for_tx()?;
    pkt.append(&msg)?;
    ipv4::send(inner, dst, IpProtocol::Icmp, DEFAULT_TTL, pkt)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_builder_produces_verifiable_message() {
        let msg = build_echo(ICMP_TYPE_ECHO_REQUEST, 0xBEEF, 7, b"abcdefgh");
        assert_eq!(msg[0], ICMP_TYPE_ECHO_REQUEST);
        assert_eq!(msg.len(), ICMP_ECHO_HEADER_LEN + 8);
        assert!(checksum::verify(&msg));
        assert_eq!(u16::from_be_bytes([msg[4], msg[5]]), 0xBEEF);
        assert_eq!(u16::from_be_bytes([msg[6], msg[7]]), 7);
        assert_eq!(&msg[ICMP_ECHO_HEADER_LEN..], b"abcdefgh");
    }

    #[test]
    fn flipping_payload_bit_breaks_checksum() {
        let mut msg = build_echo(ICMP_TYPE_ECHO_REPLY, 1, 1, b"data");
        assert!(checksum::verify(&msg));
        msg[ICMP_ECHO_HEADER_LEN] ^= 0x04;
        assert!(!checksum::verify(&msg));
    }
}

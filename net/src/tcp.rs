//! TCP wire format and protocol arithmetic.
//!
//! Header parsing/construction, MSS option handling, the pseudo-header
//! checksum, wrapping sequence-number comparisons, and the connection state
//! enumeration.  The state *machine* — sockets, timers, buffers — lives in
//! [`tcp_socket`](super::tcp_socket); this module is pure protocol logic
//! with no tables and no I/O.

use super::checksum;
use super::types::{IpProtocol, Ipv4Addr, SockAddr};

// =============================================================================
// Constants
// =============================================================================

/// Minimum TCP header length (no options).
pub const TCP_HEADER_LEN: usize = 20;

/// Maximum TCP header length (with 40 bytes of options).
pub const TCP_HEADER_MAX_LEN: usize = 60;

/// Default Maximum Segment Size (Ethernet MTU 1500 − IP 20 − TCP 20).
pub const DEFAULT_MSS: u16 = 1460;

/// Default receive window size (16 KiB).
pub const DEFAULT_WINDOW_SIZE: u16 = 16384;

/// Initial retransmission timeout in milliseconds (RFC 6298 recommends 1s).
pub const INITIAL_RTO_MS: u32 = 1000;

/// Maximum retransmission timeout in milliseconds.
pub const MAX_RTO_MS: u32 = 60_000;

/// Maximum retransmission attempts before the connection is torn down.
pub const MAX_RETRANSMITS: u8 = 8;

/// TIME_WAIT duration in milliseconds (2 × MSL, MSL = 30 s).
pub const TIME_WAIT_MS: u64 = 60_000;

// ---------------------------------------------------------------------------
// Flag bits (byte 13 of the header)
// ---------------------------------------------------------------------------

pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_PSH: u8 = 0x08;
pub const TCP_FLAG_ACK: u8 = 0x10;
pub const TCP_FLAG_URG: u8 = 0x20;

// ---------------------------------------------------------------------------
// Option kinds
// ---------------------------------------------------------------------------

pub const TCP_OPT_END: u8 = 0;
pub const TCP_OPT_NOP: u8 = 1;
pub const TCP_OPT_MSS: u8 = 2;
pub const TCP_OPT_MSS_LEN: u8 = 4;

// =============================================================================
// Header
// =============================================================================

/// Parsed TCP header.
///
/// All multi-byte fields are stored in **host** byte order after parsing.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_num: u32,
    pub ack_num: u32,
    /// Data offset in 32-bit words (5–15).
    pub data_offset: u8,
    pub flags: u8,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    /// Header length in bytes (data_offset × 4).
    #[inline]
    pub const fn header_len(&self) -> usize {
        (self.data_offset as usize) * 4
    }

    #[inline]
    pub const fn is_syn(&self) -> bool {
        (self.flags & TCP_FLAG_SYN) != 0
    }

    #[inline]
    pub const fn is_ack(&self) -> bool {
        (self.flags & TCP_FLAG_ACK) != 0
    }

    #[inline]
    pub const fn is_fin(&self) -> bool {
        (self.flags & TCP_FLAG_FIN) != 0
    }

    #[inline]
    pub const fn is_rst(&self) -> bool {
        (self.flags & TCP_FLAG_RST) != 0
    }
}

/// Parse a TCP header from a byte slice.
///
/// Returns `None` if the slice is too short or the data offset is invalid.
pub fn parse_header(data: &[u8]) -> Option<TcpHeader> {
    if data.len() < TCP_HEADER_LEN {
        return None;
    }

    let data_offset = (data[12] >> 4) & 0x0F;
    if data_offset < 5 || (data_offset as usize) * 4 > data.len() {
        return None;
    }

    Some(TcpHeader {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq_num: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack_num: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        data_offset,
        flags: data[13] & 0x3F,
        window_size: u16::from_be_bytes([data[14], data[15]]),
        checksum: u16::from_be_bytes([data[16], data[17]]),
        urgent_ptr: u16::from_be_bytes([data[18], data[19]]),
    })
}

/// Parse the MSS option from a TCP options region.
pub fn parse_mss_option(options: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            TCP_OPT_END => break,
            TCP_OPT_NOP => i += 1,
            TCP_OPT_MSS => {
                if i + 3 < options.len() && options[i + 1] == TCP_OPT_MSS_LEN {
                    return Some(u16::from_be_bytes([options[i + 2], options[i + 3]]));
                }
                break;
            }
            _ => {
                // Unknown option: skip using its length byte.
                if i + 1 >= options.len() {
                    break;
                }
                let opt_len = options[i + 1] as usize;
                if opt_len < 2 || i + opt_len > options.len() {
                    break;
                }
                i += opt_len;
            }
        }
    }
    None
}

/// Write a TCP header (and optional MSS option) into `out`.
///
/// Returns the number of bytes written.  The checksum field is written as 0;
/// the caller computes and patches it over the full segment afterwards.
pub fn write_header(hdr: &TcpHeader, mss: Option<u16>, out: &mut [u8]) -> Option<usize> {
    let options_len = if mss.is_some() { 4 } else { 0 };
    let header_len = TCP_HEADER_LEN + options_len;
    if out.len() < header_len {
        return None;
    }

    out[0..2].copy_from_slice(&hdr.src_port.to_be_bytes());
    out[2..4].copy_from_slice(&hdr.dst_port.to_be_bytes());
    out[4..8].copy_from_slice(&hdr.seq_num.to_be_bytes());
    out[8..12].copy_from_slice(&hdr.ack_num.to_be_bytes());
    out[12] = (((header_len / 4) as u8) << 4) & 0xF0;
    out[13] = hdr.flags & 0x3F;
    out[14..16].copy_from_slice(&hdr.window_size.to_be_bytes());
    out[16..18].copy_from_slice(&0u16.to_be_bytes());
    out[18..20].copy_from_slice(&hdr.urgent_ptr.to_be_bytes());

    if let Some(mss) = mss {
        out[20] = TCP_OPT_MSS;
        out[21] = TCP_OPT_MSS_LEN;
        out[22..24].copy_from_slice(&mss.to_be_bytes());
    }

    Some(header_len)
}

/// Compute the TCP checksum over pseudo-header + segment.
///
/// `segment` must contain the full TCP segment (header + payload) with the
/// checksum field set to 0.
pub fn tcp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, segment: &[u8]) -> u16 {
    checksum::transport_checksum(src_ip, dst_ip, IpProtocol::Tcp, segment)
}

/// Verify a received TCP segment's checksum (folds to 0 with the field intact).
pub fn verify_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, segment: &[u8]) -> bool {
    checksum::transport_verify(src_ip, dst_ip, IpProtocol::Tcp, segment)
}

// =============================================================================
// State machine states (RFC 793 §3.2)
// =============================================================================

/// TCP connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// Human-readable name for logging.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
        }
    }

    /// `true` in states capable of accepting payload data from the peer.
    pub const fn can_receive_data(self) -> bool {
        matches!(self, Self::Established | Self::FinWait1 | Self::FinWait2)
    }
}

// =============================================================================
// Connection tuple
// =============================================================================

/// Four-tuple identifying a TCP connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpTuple {
    pub local: SockAddr,
    pub remote: SockAddr,
}

impl TcpTuple {
    pub const fn new(local: SockAddr, remote: SockAddr) -> Self {
        Self { local, remote }
    }
}

// =============================================================================
// Sequence number arithmetic (RFC 793 §3.3)
// =============================================================================

/// `a` is before `b` in sequence space (wrapping comparison).
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a` is before or equal to `b` in sequence space.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// `a` is after `b` in sequence space.
#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// `a` is after or equal to `b` in sequence space.
#[inline]
pub fn seq_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_codec_round_trip() {
        let hdr = TcpHeader {
            src_port: 49200,
            dst_port: 80,
            seq_num: 0xDEADBEEF,
            ack_num: 0x01020304,
            data_offset: 0, // filled by write_header
            flags: TCP_FLAG_SYN,
            window_size: 16384,
            checksum: 0,
            urgent_ptr: 0,
        };
        let mut buf = [0u8; TCP_HEADER_MAX_LEN];
        let len = write_header(&hdr, Some(1460), &mut buf).unwrap();
        assert_eq!(len, 24);

        let parsed = parse_header(&buf[..len]).unwrap();
        assert_eq!(parsed.src_port, 49200);
        assert_eq!(parsed.dst_port, 80);
        assert_eq!(parsed.seq_num, 0xDEADBEEF);
        assert_eq!(parsed.ack_num, 0x01020304);
        assert_eq!(parsed.header_len(), 24);
        assert!(parsed.is_syn());
        assert!(!parsed.is_ack());
        assert_eq!(parse_mss_option(&buf[20..len]), Some(1460));
    }

    #[test]
    fn parse_rejects_bad_data_offset() {
        let mut buf = [0u8; TCP_HEADER_LEN];
        buf[12] = 4 << 4; // offset 4 < 5
        assert!(parse_header(&buf).is_none());
        buf[12] = 15 << 4; // offset 15 -> 60 bytes, but only 20 present
        assert!(parse_header(&buf).is_none());
    }

    #[test]
    fn mss_option_walks_past_unknown_options() {
        // NOP, NOP, unknown(kind=8, len=10), MSS.
        let mut opts = [0u8; 18];
        opts[0] = TCP_OPT_NOP;
        opts[1] = TCP_OPT_NOP;
        opts[2] = 8;
        opts[3] = 10;
        opts[12] = TCP_OPT_MSS;
        opts[13] = TCP_OPT_MSS_LEN;
        opts[14..16].copy_from_slice(&1200u16.to_be_bytes());
        assert_eq!(parse_mss_option(&opts), Some(1200));

        // Truncated option list must not panic or loop.
        assert_eq!(parse_mss_option(&[8, 0]), None);
        assert_eq!(parse_mss_option(&[TCP_OPT_MSS]), None);
    }

    #[test]
    fn checksum_round_trip_and_corruption() {
        let src = Ipv4Addr([192, 168, 1, 2]);
        let dst = Ipv4Addr([192, 168, 1, 3]);
        let hdr = TcpHeader {
            src_port: 1234,
            dst_port: 80,
            seq_num: 1000,
            ack_num: 2000,
            data_offset: 0,
            flags: TCP_FLAG_ACK | TCP_FLAG_PSH,
            window_size: 8192,
            checksum: 0,
            urgent_ptr: 0,
        };
        let mut segment = [0u8; TCP_HEADER_LEN + 11];
        write_header(&hdr, None, &mut segment).unwrap();
        segment[TCP_HEADER_LEN..].copy_from_slice(b"hello world");

        let csum = tcp_checksum(src, dst, &segment);
        segment[16..18].copy_from_slice(&csum.to_be_bytes());
        assert!(verify_checksum(src, dst, &segment));

        let mut corrupted = segment;
        corrupted[TCP_HEADER_LEN + 3] ^= 0x10;
        assert!(!verify_checksum(src, dst, &corrupted));
    }

    #[test]
    fn sequence_arithmetic_wraps() {
        assert!(seq_lt(0xFFFF_FFF0, 0x10));
        assert!(seq_gt(0x10, 0xFFFF_FFF0));
        assert!(seq_le(5, 5));
        assert!(seq_ge(5, 5));
        assert!(!seq_lt(5, 5));
    }
}

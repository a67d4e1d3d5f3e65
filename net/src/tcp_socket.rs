//! TCP socket layer: connection arena, three-way handshake (active and
//! passive), data transfer, teardown, and retransmission.
//!
//! # Architecture
//!
//! The state machine is pure: [`tcp_input`] and its per-state helpers
//! operate on a [`TcpTable`] and emit their effects — segments to transmit
//! and application events — into a [`TcpIo`] scratchpad.  The stack entry
//! points run the machine first, then perform I/O and event delivery with
//! the socket borrow released.  This keeps the hardest logic in the stack
//! directly testable with synthetic segments and a simulated clock.
//!
//! # Retransmission
//!
//! Each socket keeps at most one unacknowledged segment (SYN, SYN-ACK, FIN,
//! or one data segment).  The RTO starts at [`INITIAL_RTO_MS`], is refined
//! from RTT samples (RFC 6298 shape), doubles on every retransmit, and a
//! bounded attempt count tears the connection down when exhausted.
//! Out-of-order segments are never buffered; each one triggers exactly one
//! duplicate ACK.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::fmt;

use oxbow_lib::{klog_debug, klog_warn};

use super::ipv4::{DEFAULT_TTL, Ipv4Header};
use super::packetbuf::PacketBuf;
use super::stack::{NetEvent, StackInner, TcpCloseReason};
use super::tcp::{
    self, DEFAULT_MSS, DEFAULT_WINDOW_SIZE, INITIAL_RTO_MS, MAX_RETRANSMITS, MAX_RTO_MS,
    TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_RST, TCP_FLAG_SYN, TCP_HEADER_LEN,
    TIME_WAIT_MS, TcpHeader, TcpState, TcpTuple, seq_ge, seq_gt, seq_le, seq_lt,
};
use super::types::{DevIndex, IpProtocol, NetError, SockAddr};
use super::ipv4;

/// Maximum number of simultaneous TCP sockets (listeners + connections).
pub const MAX_TCP_SOCKETS: usize = 64;

/// Capacity of each socket's circular receive buffer.
pub const TCP_RX_BUFFER: usize = DEFAULT_WINDOW_SIZE as usize;

/// Largest accepted listen backlog.
pub const BACKLOG_MAX: usize = 16;

/// Lower bound for the adaptive RTO.
const RTO_MIN_MS: u32 = 200;

/// Stable handle addressing a TCP socket table slot.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpHandle(pub u32);

impl fmt::Debug for TcpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TcpHandle({})", self.0)
    }
}

// =============================================================================
// Receive ring
// =============================================================================

/// Fixed-capacity circular byte buffer backing a socket's receive side.
struct RecvRing {
    buf: Vec<u8>,
    head: usize,
    len: usize,
}

impl RecvRing {
    fn new(capacity: usize) -> Self {
        let mut buf = Vec::new();
        buf.resize(capacity, 0);
        Self { buf, head: 0, len: 0 }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    fn free(&self) -> usize {
        self.capacity() - self.len
    }

    /// Append as much of `data` as fits; returns the number of bytes taken.
    fn push_slice(&mut self, data: &[u8]) -> usize {
        let take = data.len().min(self.free());
        let cap = self.capacity();
        let mut write = (self.head + self.len) % cap;
        for &b in &data[..take] {
            self.buf[write] = b;
            write = (write + 1) % cap;
        }
        self.len += take;
        take
    }

    /// Remove up to `out.len()` bytes from the front; returns bytes copied.
    fn pop_slice(&mut self, out: &mut [u8]) -> usize {
        let take = out.len().min(self.len);
        let cap = self.capacity();
        for item in out[..take].iter_mut() {
            *item = self.buf[self.head];
            self.head = (self.head + 1) % cap;
        }
        self.len -= take;
        take
    }
}

// =============================================================================
// Socket
// =============================================================================

/// The one retransmittable in-flight segment.
struct PendingSegment {
    seq: u32,
    flags: u8,
    payload: Vec<u8>,
}

impl PendingSegment {
    /// First sequence number after this segment (SYN/FIN consume one).
    fn end_seq(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if (self.flags & TCP_FLAG_SYN) != 0 || (self.flags & TCP_FLAG_FIN) != 0 {
            len += 1;
        }
        self.seq.wrapping_add(len)
    }
}

/// Backlog of a listening socket: children spawned by incoming SYNs that
/// have not been consumed by `accept()` yet.
struct ListenState {
    backlog: usize,
    pending: VecDeque<TcpHandle>,
}

/// Per-connection state.
struct TcpSocket {
    state: TcpState,
    tuple: TcpTuple,

    // --- Send sequence variables (RFC 793 §3.2) ---
    iss: u32,
    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u16,

    // --- Receive sequence variables ---
    irs: u32,
    rcv_nxt: u32,
    rcv_wnd: u16,

    /// Peer's advertised MSS (or [`DEFAULT_MSS`] if not specified).
    peer_mss: u16,

    // --- Retransmission context ---
    rto_ms: u32,
    srtt_ms: u32,
    rttvar_ms: u32,
    retransmits: u8,
    rtx: Option<PendingSegment>,
    /// Absolute deadline for the next retransmit (0 = timer disarmed).
    rtx_deadline_ms: u64,
    /// When the in-flight segment was first sent; 0 after a retransmit so
    /// retransmitted segments never produce RTT samples.
    rtx_sent_at_ms: u64,

    /// Timestamp of TIME_WAIT entry, for the 2×MSL expiry.
    time_wait_since_ms: u64,

    rx: RecvRing,
    listen: Option<ListenState>,
}

impl TcpSocket {
    fn new(tuple: TcpTuple) -> Self {
        Self {
            state: TcpState::Closed,
            tuple,
            iss: 0,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 0,
            irs: 0,
            rcv_nxt: 0,
            rcv_wnd: DEFAULT_WINDOW_SIZE,
            peer_mss: DEFAULT_MSS,
            rto_ms: INITIAL_RTO_MS,
            srtt_ms: 0,
            rttvar_ms: 0,
            retransmits: 0,
            rtx: None,
            rtx_deadline_ms: 0,
            rtx_sent_at_ms: 0,
            time_wait_since_ms: 0,
            rx: RecvRing::new(TCP_RX_BUFFER),
            listen: None,
        }
    }

    /// Feed an RTT sample into the RFC 6298 estimator and recompute the RTO.
    fn update_rtt(&mut self, sample_ms: u32) {
        if self.srtt_ms == 0 {
            self.srtt_ms = sample_ms;
            self.rttvar_ms = sample_ms / 2;
        } else {
            let delta = self.srtt_ms.abs_diff(sample_ms);
            self.rttvar_ms = (3 * self.rttvar_ms + delta) / 4;
            self.srtt_ms = (7 * self.srtt_ms + sample_ms) / 8;
        }
        self.rto_ms = (self.srtt_ms + 4 * self.rttvar_ms).clamp(RTO_MIN_MS, MAX_RTO_MS);
    }
}

// =============================================================================
// Output scratchpad
// =============================================================================

/// A segment the state machine wants transmitted.
pub(crate) struct OutSegment {
    pub tuple: TcpTuple,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    /// MSS option to include (SYN and SYN-ACK only).
    pub mss: Option<u16>,
    pub payload: Vec<u8>,
}

/// Effects produced by one state-machine step: segments to send and events
/// to deliver.  The caller performs both after releasing the table borrow.
#[derive(Default)]
pub(crate) struct TcpIo {
    pub out: Vec<OutSegment>,
    pub events: Vec<NetEvent>,
}

impl TcpIo {
    fn send(
        &mut self,
        tuple: TcpTuple,
        seq: u32,
        ack: u32,
        flags: u8,
        window: u16,
        mss: Option<u16>,
    ) {
        self.out.push(OutSegment {
            tuple,
            seq,
            ack,
            flags,
            window,
            mss,
            payload: Vec::new(),
        });
    }
}

// =============================================================================
// Table
// =============================================================================

/// Fixed-slot TCP socket arena.
pub(crate) struct TcpTable {
    sockets: [Option<TcpSocket>; MAX_TCP_SOCKETS],
    isn_counter: u32,
}

impl TcpTable {
    pub(crate) const fn new() -> Self {
        Self {
            sockets: [const { None }; MAX_TCP_SOCKETS],
            isn_counter: 0x6F78_626F,
        }
    }

    /// Monotonic ISN allocation, 64000 apart per connection.
    fn next_isn(&mut self) -> u32 {
        let isn = self.isn_counter;
        self.isn_counter = self.isn_counter.wrapping_add(64000);
        isn
    }

    fn alloc_slot(&self) -> Option<usize> {
        self.sockets.iter().position(|s| s.is_none())
    }

    fn get(&self, handle: TcpHandle) -> Option<&TcpSocket> {
        self.sockets.get(handle.0 as usize)?.as_ref()
    }

    fn get_mut(&mut self, handle: TcpHandle) -> Option<&mut TcpSocket> {
        self.sockets.get_mut(handle.0 as usize)?.as_mut()
    }

    /// Exact 4-tuple match for established-connection delivery.
    fn find_exact(&self, tuple: &TcpTuple) -> Option<TcpHandle> {
        for (i, slot) in self.sockets.iter().enumerate() {
            if let Some(s) = slot
                && s.state != TcpState::Listen
                && s.tuple == *tuple
            {
                return Some(TcpHandle(i as u32));
            }
        }
        None
    }

    /// Listening-socket match: bound port equals the destination port and
    /// the bound address is the wildcard or equals the destination address.
    fn find_listener(&self, local: SockAddr) -> Option<TcpHandle> {
        for (i, slot) in self.sockets.iter().enumerate() {
            if let Some(s) = slot
                && s.state == TcpState::Listen
                && s.tuple.local.port == local.port
                && (s.tuple.local.ip.is_unspecified() || s.tuple.local.ip == local.ip)
            {
                return Some(TcpHandle(i as u32));
            }
        }
        None
    }

    fn port_in_use(&self, local: SockAddr) -> bool {
        self.sockets.iter().any(|slot| {
            slot.as_ref().is_some_and(|s| {
                s.tuple.local.port == local.port
                    && (s.tuple.local.ip.is_unspecified()
                        || local.ip.is_unspecified()
                        || s.tuple.local.ip == local.ip)
            })
        })
    }

    /// Free a slot and scrub the handle from every listen backlog.
    fn release(&mut self, handle: TcpHandle) {
        if let Some(slot) = self.sockets.get_mut(handle.0 as usize) {
            *slot = None;
        }
        for slot in self.sockets.iter_mut().flatten() {
            if let Some(listen) = slot.listen.as_mut() {
                listen.pending.retain(|h| *h != handle);
            }
        }
    }

    /// Number of active sockets (diagnostic).
    pub(crate) fn active_count(&self) -> usize {
        self.sockets.iter().filter(|s| s.is_some()).count()
    }

    pub(crate) fn state(&self, handle: TcpHandle) -> Option<TcpState> {
        self.get(handle).map(|s| s.state)
    }

    pub(crate) fn remote(&self, handle: TcpHandle) -> Option<SockAddr> {
        self.get(handle).map(|s| s.tuple.remote)
    }
}

// =============================================================================
// Table-level operations (pure: no device I/O, effects go through TcpIo)
// =============================================================================

/// Active open: allocate a socket in SYN_SENT and emit the SYN.
pub(crate) fn connect_in_table(
    table: &mut TcpTable,
    local: SockAddr,
    remote: SockAddr,
    now_ms: u64,
    io: &mut TcpIo,
) -> Result<TcpHandle, NetError> {
    let idx = table.alloc_slot().ok_or(NetError::NoBufferSpace)?;
    let iss = table.next_isn();

    let tuple = TcpTuple::new(local, remote);
    let mut sock = TcpSocket::new(tuple);
    sock.state = TcpState::SynSent;
    sock.iss = iss;
    sock.snd_una = iss;
    sock.snd_nxt = iss.wrapping_add(1); // SYN consumes one sequence number
    sock.rtx = Some(PendingSegment {
        seq: iss,
        flags: TCP_FLAG_SYN,
        payload: Vec::new(),
    });
    sock.rtx_deadline_ms = now_ms + sock.rto_ms as u64;
    sock.rtx_sent_at_ms = now_ms;
    table.sockets[idx] = Some(sock);

    klog_debug!("tcp: CONNECT {} -> {} iss={} idx={}", local, remote, iss, idx);
    io.send(tuple, iss, 0, TCP_FLAG_SYN, DEFAULT_WINDOW_SIZE, Some(DEFAULT_MSS));
    Ok(TcpHandle(idx as u32))
}

/// Passive open: bind a listening socket.
pub(crate) fn listen_in_table(
    table: &mut TcpTable,
    local: SockAddr,
    backlog: usize,
) -> Result<TcpHandle, NetError> {
    if table.port_in_use(local) {
        return Err(NetError::AddressInUse);
    }
    let idx = table.alloc_slot().ok_or(NetError::NoBufferSpace)?;

    let mut sock = TcpSocket::new(TcpTuple::new(local, SockAddr::UNSPECIFIED));
    sock.state = TcpState::Listen;
    sock.listen = Some(ListenState {
        backlog: backlog.clamp(1, BACKLOG_MAX),
        pending: VecDeque::new(),
    });
    table.sockets[idx] = Some(sock);

    klog_debug!("tcp: LISTEN on {} idx={}", local, idx);
    Ok(TcpHandle(idx as u32))
}

/// Dequeue one fully established connection from a listener's backlog.
pub(crate) fn accept_in_table(
    table: &mut TcpTable,
    handle: TcpHandle,
) -> Result<Option<(TcpHandle, SockAddr)>, NetError> {
    let listener = table.get(handle).ok_or(NetError::NotFound)?;
    if listener.state != TcpState::Listen {
        return Err(NetError::InvalidState);
    }

    let pending: Vec<TcpHandle> = listener
        .listen
        .as_ref()
        .map(|l| l.pending.iter().copied().collect())
        .unwrap_or_default();

    for child in pending {
        let Some(remote) = table
            .get(child)
            .filter(|s| s.state == TcpState::Established)
            .map(|s| s.tuple.remote)
        else {
            continue;
        };
        if let Some(listen) = table.get_mut(handle).and_then(|s| s.listen.as_mut()) {
            listen.pending.retain(|h| *h != child);
        }
        return Ok(Some((child, remote)));
    }
    Ok(None)
}

/// Queue one data segment for transmission.
///
/// Only one segment may be in flight; callers get `WouldBlock` until the
/// previous one is acknowledged.  The write is clamped to the peer's MSS
/// and advertised window.
pub(crate) fn send_in_table(
    table: &mut TcpTable,
    handle: TcpHandle,
    data: &[u8],
    now_ms: u64,
    io: &mut TcpIo,
) -> Result<usize, NetError> {
    let sock = table.get_mut(handle).ok_or(NetError::NotFound)?;
    match sock.state {
        TcpState::Established | TcpState::CloseWait => {}
        TcpState::SynSent | TcpState::SynReceived => return Err(NetError::WouldBlock),
        _ => return Err(NetError::NotConnected),
    }
    if data.is_empty() {
        return Ok(0);
    }
    if sock.rtx.is_some() {
        return Err(NetError::WouldBlock);
    }
    let max = (sock.peer_mss as usize).min(sock.snd_wnd as usize);
    if max == 0 {
        return Err(NetError::WouldBlock);
    }
    let len = data.len().min(max);

    let seq = sock.snd_nxt;
    sock.snd_nxt = seq.wrapping_add(len as u32);
    sock.rtx = Some(PendingSegment {
        seq,
        flags: TCP_FLAG_PSH | TCP_FLAG_ACK,
        payload: data[..len].to_vec(),
    });
    sock.rtx_deadline_ms = now_ms + sock.rto_ms as u64;
    sock.rtx_sent_at_ms = now_ms;

    io.out.push(OutSegment {
        tuple: sock.tuple,
        seq,
        ack: sock.rcv_nxt,
        flags: TCP_FLAG_PSH | TCP_FLAG_ACK,
        window: sock.rcv_wnd,
        mss: None,
        payload: data[..len].to_vec(),
    });
    Ok(len)
}

/// Drain received bytes from the socket's circular buffer.
pub(crate) fn recv_in_table(
    table: &mut TcpTable,
    handle: TcpHandle,
    out: &mut [u8],
) -> Result<usize, NetError> {
    let sock = table.get_mut(handle).ok_or(NetError::NotFound)?;
    let n = sock.rx.pop_slice(out);
    sock.rcv_wnd = sock.rx.free().min(u16::MAX as usize) as u16;
    Ok(n)
}

/// Graceful close.  Repeated closes of a closing socket are no-ops.
pub(crate) fn close_in_table(
    table: &mut TcpTable,
    handle: TcpHandle,
    now_ms: u64,
    io: &mut TcpIo,
) -> Result<(), NetError> {
    let Some(sock) = table.get_mut(handle) else {
        // Already fully closed and released.
        return Ok(());
    };

    match sock.state {
        TcpState::Listen => {
            let children: Vec<TcpHandle> = sock
                .listen
                .as_ref()
                .map(|l| l.pending.iter().copied().collect())
                .unwrap_or_default();
            table.release(handle);
            for child in children {
                table.release(child);
            }
            Ok(())
        }
        TcpState::Closed | TcpState::SynSent => {
            table.release(handle);
            Ok(())
        }
        TcpState::SynReceived | TcpState::Established => {
            let seq = sock.snd_nxt;
            sock.snd_nxt = seq.wrapping_add(1); // FIN consumes one sequence number
            let prev = sock.state;
            sock.state = TcpState::FinWait1;
            sock.rtx = Some(PendingSegment {
                seq,
                flags: TCP_FLAG_FIN | TCP_FLAG_ACK,
                payload: Vec::new(),
            });
            sock.rtx_deadline_ms = now_ms + sock.rto_ms as u64;
            sock.rtx_sent_at_ms = now_ms;
            let (tuple, ack, wnd) = (sock.tuple, sock.rcv_nxt, sock.rcv_wnd);
            klog_debug!("tcp: CLOSE {} -> FIN_WAIT_1 fin_seq={}", prev.name(), seq);
            io.send(tuple, seq, ack, TCP_FLAG_FIN | TCP_FLAG_ACK, wnd, None);
            Ok(())
        }
        TcpState::CloseWait => {
            let seq = sock.snd_nxt;
            sock.snd_nxt = seq.wrapping_add(1);
            sock.state = TcpState::LastAck;
            sock.rtx = Some(PendingSegment {
                seq,
                flags: TCP_FLAG_FIN | TCP_FLAG_ACK,
                payload: Vec::new(),
            });
            sock.rtx_deadline_ms = now_ms + sock.rto_ms as u64;
            sock.rtx_sent_at_ms = now_ms;
            let (tuple, ack, wnd) = (sock.tuple, sock.rcv_nxt, sock.rcv_wnd);
            klog_debug!("tcp: CLOSE_WAIT -> LAST_ACK fin_seq={}", seq);
            io.send(tuple, seq, ack, TCP_FLAG_FIN | TCP_FLAG_ACK, wnd, None);
            Ok(())
        }
        // Already closing.
        TcpState::FinWait1
        | TcpState::FinWait2
        | TcpState::Closing
        | TcpState::LastAck
        | TcpState::TimeWait => Ok(()),
    }
}

/// Abort: send RST and release immediately.  No closed event — the caller
/// initiated the teardown.
pub(crate) fn abort_in_table(
    table: &mut TcpTable,
    handle: TcpHandle,
    io: &mut TcpIo,
) -> Result<(), NetError> {
    let Some(sock) = table.get(handle) else {
        return Ok(());
    };
    if sock.state != TcpState::Listen && sock.state != TcpState::Closed {
        io.send(sock.tuple, sock.snd_nxt, 0, TCP_FLAG_RST, 0, None);
    }
    table.release(handle);
    Ok(())
}

// =============================================================================
// Segment input
// =============================================================================

/// Process one validated incoming segment against the socket table.
pub(crate) fn tcp_input(
    table: &mut TcpTable,
    local: SockAddr,
    remote: SockAddr,
    hdr: &TcpHeader,
    options: &[u8],
    payload: &[u8],
    now_ms: u64,
    io: &mut TcpIo,
) {
    let tuple = TcpTuple::new(local, remote);

    if let Some(handle) = table.find_exact(&tuple) {
        let state = table.get(handle).map(|s| s.state).unwrap_or(TcpState::Closed);
        match state {
            TcpState::SynSent => process_syn_sent(table, handle, hdr, options, io),
            TcpState::SynReceived => process_syn_received(table, handle, hdr, options, io),
            TcpState::Established
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::CloseWait
            | TcpState::Closing
            | TcpState::LastAck => {
                process_established_and_closing(table, handle, hdr, payload, now_ms, io)
            }
            TcpState::TimeWait => process_time_wait(table, handle, hdr, now_ms, io),
            TcpState::Closed | TcpState::Listen => {}
        }
        return;
    }

    if hdr.is_syn()
        && !hdr.is_ack()
        && let Some(listener) = table.find_listener(local)
    {
        process_listen(table, listener, tuple, hdr, options, now_ms, io);
        return;
    }

    // No matching socket — answer with RST (unless the segment is one).
    if !hdr.is_rst() {
        let (seq, ack, flags) = if hdr.is_ack() {
            (hdr.ack_num, 0, TCP_FLAG_RST)
        } else {
            let seg_len = payload.len() as u32 + if hdr.is_syn() { 1 } else { 0 };
            (0, hdr.seq_num.wrapping_add(seg_len), TCP_FLAG_RST | TCP_FLAG_ACK)
        };
        io.send(tuple, seq, ack, flags, 0, None);
    }
}

/// LISTEN: spawn a child in SYN_RECEIVED if the backlog has room.
fn process_listen(
    table: &mut TcpTable,
    listener: TcpHandle,
    tuple: TcpTuple,
    hdr: &TcpHeader,
    options: &[u8],
    now_ms: u64,
    io: &mut TcpIo,
) {
    let backlog_full = table
        .get(listener)
        .and_then(|s| s.listen.as_ref())
        .is_none_or(|l| l.pending.len() >= l.backlog);
    if backlog_full {
        klog_debug!("tcp: LISTEN backlog full, dropping SYN from {}", tuple.remote);
        return;
    }
    let Some(idx) = table.alloc_slot() else {
        klog_debug!("tcp: socket table full, dropping SYN from {}", tuple.remote);
        return;
    };

    let iss = table.next_isn();
    let peer_mss = tcp::parse_mss_option(options).unwrap_or(DEFAULT_MSS);

    let mut child = TcpSocket::new(tuple);
    child.state = TcpState::SynReceived;
    child.iss = iss;
    child.snd_una = iss;
    child.snd_nxt = iss.wrapping_add(1);
    child.irs = hdr.seq_num;
    child.rcv_nxt = hdr.seq_num.wrapping_add(1);
    child.snd_wnd = hdr.window_size;
    child.peer_mss = peer_mss;
    child.rtx = Some(PendingSegment {
        seq: iss,
        flags: TCP_FLAG_SYN | TCP_FLAG_ACK,
        payload: Vec::new(),
    });
    child.rtx_deadline_ms = now_ms + child.rto_ms as u64;
    child.rtx_sent_at_ms = now_ms;
    let (ack, wnd) = (child.rcv_nxt, child.rcv_wnd);
    table.sockets[idx] = Some(child);

    if let Some(listen) = table.get_mut(listener).and_then(|s| s.listen.as_mut()) {
        listen.pending.push_back(TcpHandle(idx as u32));
    }

    klog_debug!(
        "tcp: LISTEN -> SYN_RECEIVED idx={} iss={} irs={}",
        idx,
        iss,
        hdr.seq_num
    );
    io.send(tuple, iss, ack, TCP_FLAG_SYN | TCP_FLAG_ACK, wnd, Some(DEFAULT_MSS));
}

/// SYN_SENT: expecting SYN+ACK (or a simultaneous-open SYN).
fn process_syn_sent(
    table: &mut TcpTable,
    handle: TcpHandle,
    hdr: &TcpHeader,
    options: &[u8],
    io: &mut TcpIo,
) {
    let Some(sock) = table.get(handle) else { return };
    let (iss, snd_nxt, tuple) = (sock.iss, sock.snd_nxt, sock.tuple);

    // Step 1: an ACK must acknowledge our SYN.
    if hdr.is_ack() && (seq_le(hdr.ack_num, iss) || seq_gt(hdr.ack_num, snd_nxt)) {
        if !hdr.is_rst() {
            io.send(tuple, hdr.ack_num, 0, TCP_FLAG_RST, 0, None);
        }
        return;
    }

    // Step 2: a valid RST means connection refused.
    if hdr.is_rst() {
        if hdr.is_ack() {
            klog_debug!("tcp: SYN_SENT {} — RST, connection refused", tuple.remote);
            table.release(handle);
            io.events.push(NetEvent::TcpClosed {
                socket: handle,
                reason: TcpCloseReason::Refused,
            });
        }
        return;
    }

    // Step 3: need a SYN from here on.
    if !hdr.is_syn() {
        return;
    }

    let peer_mss = tcp::parse_mss_option(options).unwrap_or(DEFAULT_MSS);
    let Some(sock) = table.get_mut(handle) else { return };
    sock.irs = hdr.seq_num;
    sock.rcv_nxt = hdr.seq_num.wrapping_add(1);
    sock.snd_wnd = hdr.window_size;
    sock.peer_mss = peer_mss;
    if hdr.is_ack() {
        sock.snd_una = hdr.ack_num;
    }

    if seq_gt(sock.snd_una, sock.iss) {
        // Our SYN is acknowledged: connection established.
        sock.state = TcpState::Established;
        sock.retransmits = 0;
        sock.rtx = None;
        sock.rtx_deadline_ms = 0;
        let (tuple, seq, ack, wnd) = (sock.tuple, sock.snd_nxt, sock.rcv_nxt, sock.rcv_wnd);
        klog_debug!("tcp: SYN_SENT -> ESTABLISHED irs={}", sock.irs);
        io.send(tuple, seq, ack, TCP_FLAG_ACK, wnd, None);
        io.events.push(NetEvent::TcpConnected { socket: handle });
    } else {
        // Simultaneous open.
        sock.state = TcpState::SynReceived;
        sock.rtx = Some(PendingSegment {
            seq: sock.iss,
            flags: TCP_FLAG_SYN | TCP_FLAG_ACK,
            payload: Vec::new(),
        });
        let (tuple, seq, ack, wnd) = (sock.tuple, sock.iss, sock.rcv_nxt, sock.rcv_wnd);
        klog_debug!("tcp: SYN_SENT -> SYN_RECEIVED (simultaneous open)");
        io.send(tuple, seq, ack, TCP_FLAG_SYN | TCP_FLAG_ACK, wnd, Some(DEFAULT_MSS));
    }
}

/// SYN_RECEIVED: expecting the final ACK of the handshake.
fn process_syn_received(
    table: &mut TcpTable,
    handle: TcpHandle,
    hdr: &TcpHeader,
    _options: &[u8],
    io: &mut TcpIo,
) {
    let Some(sock) = table.get(handle) else { return };
    let tuple = sock.tuple;

    if hdr.is_rst() {
        klog_debug!("tcp: SYN_RECEIVED {} — RST, closing", tuple.remote);
        table.release(handle);
        io.events.push(NetEvent::TcpClosed {
            socket: handle,
            reason: TcpCloseReason::Reset,
        });
        return;
    }

    // Duplicate SYN: the peer missed our SYN-ACK, retransmit it.
    if hdr.is_syn() && !hdr.is_ack() {
        let (seq, ack, wnd) = (sock.iss, sock.rcv_nxt, sock.rcv_wnd);
        io.send(tuple, seq, ack, TCP_FLAG_SYN | TCP_FLAG_ACK, wnd, Some(DEFAULT_MSS));
        return;
    }

    if !hdr.is_ack() {
        return;
    }

    if seq_lt(hdr.ack_num, sock.snd_una) || seq_gt(hdr.ack_num, sock.snd_nxt) {
        io.send(tuple, hdr.ack_num, 0, TCP_FLAG_RST, 0, None);
        return;
    }

    let Some(sock) = table.get_mut(handle) else { return };
    sock.snd_una = hdr.ack_num;
    sock.snd_wnd = hdr.window_size;
    sock.state = TcpState::Established;
    sock.retransmits = 0;
    sock.rtx = None;
    sock.rtx_deadline_ms = 0;
    klog_debug!("tcp: SYN_RECEIVED -> ESTABLISHED {}", tuple.remote);
    io.events.push(NetEvent::TcpConnected { socket: handle });
}

/// ESTABLISHED and the closing family: ACK bookkeeping, data, FIN.
fn process_established_and_closing(
    table: &mut TcpTable,
    handle: TcpHandle,
    hdr: &TcpHeader,
    payload: &[u8],
    now_ms: u64,
    io: &mut TcpIo,
) {
    let Some(sock) = table.get(handle) else { return };
    let state = sock.state;
    let tuple = sock.tuple;

    // Step 1: RST tears the connection down immediately.
    if hdr.is_rst() {
        klog_debug!("tcp: {} {} — RST received", state.name(), tuple.remote);
        table.release(handle);
        io.events.push(NetEvent::TcpClosed {
            socket: handle,
            reason: TcpCloseReason::Reset,
        });
        return;
    }

    // Step 2: a SYN here is a protocol violation — RST and close.
    if hdr.is_syn() {
        let snd_nxt = sock.snd_nxt;
        klog_debug!("tcp: {} — unexpected SYN, sending RST", state.name());
        table.release(handle);
        io.send(tuple, snd_nxt, 0, TCP_FLAG_RST, 0, None);
        io.events.push(NetEvent::TcpClosed {
            socket: handle,
            reason: TcpCloseReason::Reset,
        });
        return;
    }

    // Step 3: everything past the handshake carries an ACK.
    if !hdr.is_ack() {
        return;
    }

    let Some(sock) = table.get_mut(handle) else { return };

    // ACK bookkeeping: advance snd_una, retire the in-flight segment.
    if seq_gt(hdr.ack_num, sock.snd_una) && seq_le(hdr.ack_num, sock.snd_nxt) {
        sock.snd_una = hdr.ack_num;
        sock.snd_wnd = hdr.window_size;

        if let Some(rtx) = sock.rtx.as_ref()
            && seq_ge(hdr.ack_num, rtx.end_seq())
        {
            let data_len = rtx.payload.len();
            if sock.rtx_sent_at_ms != 0 {
                let sample = now_ms.saturating_sub(sock.rtx_sent_at_ms) as u32;
                sock.update_rtt(sample);
            }
            sock.rtx = None;
            sock.rtx_deadline_ms = 0;
            sock.retransmits = 0;
            if data_len > 0 {
                io.events.push(NetEvent::TcpSent {
                    socket: handle,
                    len: data_len,
                });
            }
        }
    } else if seq_gt(hdr.ack_num, sock.snd_nxt) {
        // ACK for data we never sent — acknowledge our actual position.
        let (seq, ack, wnd) = (sock.snd_nxt, sock.rcv_nxt, sock.rcv_wnd);
        io.send(tuple, seq, ack, TCP_FLAG_ACK, wnd, None);
        return;
    }

    // State-specific ACK-of-FIN transitions.
    let fin_acked = hdr.ack_num == sock.snd_nxt;
    match state {
        TcpState::FinWait1 if fin_acked => {
            if !hdr.is_fin() {
                sock.state = TcpState::FinWait2;
                klog_debug!("tcp: FIN_WAIT_1 -> FIN_WAIT_2");
            }
            // A FIN riding on this ACK is handled below and goes straight
            // to TIME_WAIT (simultaneous close resolution).
        }
        TcpState::Closing if fin_acked => {
            sock.state = TcpState::TimeWait;
            sock.time_wait_since_ms = now_ms;
            klog_debug!("tcp: CLOSING -> TIME_WAIT");
            return;
        }
        TcpState::LastAck if fin_acked => {
            klog_debug!("tcp: LAST_ACK -> CLOSED");
            table.release(handle);
            io.events.push(NetEvent::TcpClosed {
                socket: handle,
                reason: TcpCloseReason::Done,
            });
            return;
        }
        _ => {}
    }

    // Step 4: payload data.
    let Some(sock) = table.get_mut(handle) else { return };
    let mut in_order = true;
    if !payload.is_empty() && sock.state.can_receive_data() {
        if hdr.seq_num == sock.rcv_nxt {
            let accepted = sock.rx.push_slice(payload);
            sock.rcv_nxt = sock.rcv_nxt.wrapping_add(accepted as u32);
            sock.rcv_wnd = sock.rx.free().min(u16::MAX as usize) as u16;
            let (seq, ack, wnd) = (sock.snd_nxt, sock.rcv_nxt, sock.rcv_wnd);
            io.send(tuple, seq, ack, TCP_FLAG_ACK, wnd, None);
            io.events.push(NetEvent::TcpDataReady { socket: handle });
        } else {
            // Out of order: one duplicate ACK, nothing buffered.
            in_order = false;
            let (seq, ack, wnd) = (sock.snd_nxt, sock.rcv_nxt, sock.rcv_wnd);
            klog_debug!(
                "tcp: out-of-order seq={} (expected {}), dup ACK",
                hdr.seq_num,
                sock.rcv_nxt
            );
            io.send(tuple, seq, ack, TCP_FLAG_ACK, wnd, None);
        }
    }

    // Step 5: peer FIN, only honored in sequence.
    let fin_seq = hdr.seq_num.wrapping_add(payload.len() as u32);
    if hdr.is_fin() && in_order && fin_seq == sock.rcv_nxt {
        sock.rcv_nxt = sock.rcv_nxt.wrapping_add(1);
        let state = sock.state;
        let new_state = match state {
            TcpState::Established => {
                sock.state = TcpState::CloseWait;
                io.events.push(NetEvent::TcpClosed {
                    socket: handle,
                    reason: TcpCloseReason::PeerClosed,
                });
                TcpState::CloseWait
            }
            TcpState::FinWait1 => {
                if hdr.ack_num == sock.snd_nxt {
                    // Our FIN was acknowledged by this same segment.
                    sock.state = TcpState::TimeWait;
                    sock.time_wait_since_ms = now_ms;
                    TcpState::TimeWait
                } else {
                    sock.state = TcpState::Closing;
                    TcpState::Closing
                }
            }
            TcpState::FinWait2 => {
                sock.state = TcpState::TimeWait;
                sock.time_wait_since_ms = now_ms;
                TcpState::TimeWait
            }
            other => other,
        };
        let (seq, ack, wnd) = (sock.snd_nxt, sock.rcv_nxt, sock.rcv_wnd);
        klog_debug!("tcp: FIN in {} -> {}", state.name(), new_state.name());
        io.send(tuple, seq, ack, TCP_FLAG_ACK, wnd, None);
    }
}

/// TIME_WAIT: re-ACK retransmitted FINs, restart the 2×MSL timer.
fn process_time_wait(
    table: &mut TcpTable,
    handle: TcpHandle,
    hdr: &TcpHeader,
    now_ms: u64,
    io: &mut TcpIo,
) {
    let Some(sock) = table.get_mut(handle) else { return };

    if hdr.is_rst() {
        table.release(handle);
        return;
    }
    if hdr.is_fin() {
        sock.time_wait_since_ms = now_ms;
        let (tuple, seq, ack, wnd) = (sock.tuple, sock.snd_nxt, sock.rcv_nxt, sock.rcv_wnd);
        io.send(tuple, seq, ack, TCP_FLAG_ACK, wnd, None);
    }
}

// =============================================================================
// Timer
// =============================================================================

/// Advance all sockets' timers to `now_ms`: retransmit expired segments with
/// exponential backoff, tear down exhausted connections, reap TIME_WAIT.
pub(crate) fn timer_in_table(table: &mut TcpTable, now_ms: u64, io: &mut TcpIo) {
    for i in 0..MAX_TCP_SOCKETS {
        let handle = TcpHandle(i as u32);
        let Some(sock) = table.sockets[i].as_mut() else {
            continue;
        };

        if sock.state == TcpState::TimeWait {
            if now_ms.saturating_sub(sock.time_wait_since_ms) >= TIME_WAIT_MS {
                klog_debug!("tcp: TIME_WAIT expired idx={}", i);
                table.release(handle);
            }
            continue;
        }

        if sock.rtx.is_some() && sock.rtx_deadline_ms != 0 && now_ms >= sock.rtx_deadline_ms {
            sock.retransmits += 1;
            if sock.retransmits > MAX_RETRANSMITS {
                klog_warn!(
                    "tcp: retransmit limit reached in {} for {}, closing",
                    sock.state.name(),
                    sock.tuple.remote
                );
                table.release(handle);
                io.events.push(NetEvent::TcpClosed {
                    socket: handle,
                    reason: TcpCloseReason::TimedOut,
                });
                continue;
            }

            // Exponential backoff; retransmitted segments never feed the
            // RTT estimator.
            sock.rto_ms = (sock.rto_ms * 2).min(MAX_RTO_MS);
            sock.rtx_deadline_ms = now_ms + sock.rto_ms as u64;
            sock.rtx_sent_at_ms = 0;

            let Some(rtx) = sock.rtx.as_ref() else { continue };
            let is_syn = (rtx.flags & TCP_FLAG_SYN) != 0;
            let carries_ack = (rtx.flags & TCP_FLAG_ACK) != 0;
            klog_debug!(
                "tcp: retransmit #{} seq={} rto={}ms",
                sock.retransmits,
                rtx.seq,
                sock.rto_ms
            );
            io.out.push(OutSegment {
                tuple: sock.tuple,
                seq: rtx.seq,
                ack: if carries_ack { sock.rcv_nxt } else { 0 },
                flags: rtx.flags,
                window: sock.rcv_wnd,
                mss: if is_syn { Some(DEFAULT_MSS) } else { None },
                payload: rtx.payload.clone(),
            });
        }
    }
}

// =============================================================================
// Stack plumbing (I/O side)
// =============================================================================

/// Handle a received TCP segment (IP header already stripped).
pub(crate) fn rx(
    inner: &mut StackInner,
    dev: DevIndex,
    ip: &Ipv4Header,
    segment: &[u8],
    now_ms: u64,
) {
    let Some(hdr) = tcp::parse_header(segment) else {
        klog_debug!("tcp: malformed header from {}", ip.src);
        inner.count_rx_drop(dev);
        return;
    };
    if !tcp::verify_checksum(ip.src, ip.dst, segment) {
        klog_warn!("tcp: bad checksum from {}:{}", ip.src, hdr.src_port);
        inner.count_rx_drop(dev);
        return;
    }
    let hdr_len = hdr.header_len();
    let options = &segment[TCP_HEADER_LEN..hdr_len];
    let payload = &segment[hdr_len..];

    let local = SockAddr::new(ip.dst, super::types::Port(hdr.dst_port));
    let remote = SockAddr::new(ip.src, super::types::Port(hdr.src_port));

    let mut io = TcpIo::default();
    tcp_input(&mut inner.tcp, local, remote, &hdr, options, payload, now_ms, &mut io);
    flush_io(inner, io);
}

/// Transmit every queued segment and queue every event from one machine step.
pub(crate) fn flush_io(inner: &mut StackInner, mut io: TcpIo) {
    inner.events.append(&mut io.events);
    for seg in io.out {
        if let Err(err) = send_segment(inner, &seg) {
            klog_debug!("tcp: segment to {} not sent: {}", seg.tuple.remote, err);
        }
    }
}

/// Build the wire segment for `seg` and hand it to the IPv4 layer.
fn send_segment(inner: &mut StackInner, seg: &OutSegment) -> Result<(), NetError> {
    let dev = inner
        .devices
        .select_for(seg.tuple.remote.ip)
        .ok_or(NetError::NetworkUnreachable)?;

    let mut pkt = PacketBuf::for_tx()?;
    pkt.append(&seg.payload)?;

    let hdr = TcpHeader {
        src_port: seg.tuple.local.port.0,
        dst_port: seg.tuple.remote.port.0,
        seq_num: seg.seq,
        ack_num: seg.ack,
        data_offset: 0, // filled by write_header
        flags: seg.flags,
        window_size: seg.window,
        checksum: 0,
        urgent_ptr: 0,
    };
    let hdr_len = TCP_HEADER_LEN + if seg.mss.is_some() { 4 } else { 0 };
    {
        let hdr_slice = pkt.push_header(hdr_len)?;
        tcp::write_header(&hdr, seg.mss, hdr_slice).ok_or(NetError::NoBufferSpace)?;
    }
    let csum = tcp::tcp_checksum(seg.tuple.local.ip, seg.tuple.remote.ip, pkt.payload());
    pkt.payload_mut()[16..18].copy_from_slice(&csum.to_be_bytes());

    ipv4::send_from(
        inner,
        dev,
        seg.tuple.local.ip,
        seg.tuple.remote.ip,
        IpProtocol::Tcp,
        DEFAULT_TTL,
        pkt,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Ipv4Addr, Port};

    const LOCAL: SockAddr = SockAddr::new(Ipv4Addr([10, 0, 0, 1]), Port(40000));
    const REMOTE: SockAddr = SockAddr::new(Ipv4Addr([10, 0, 0, 2]), Port(80));

    fn header(seq: u32, ack: u32, flags: u8) -> TcpHeader {
        TcpHeader {
            src_port: REMOTE.port.0,
            dst_port: LOCAL.port.0,
            seq_num: seq,
            ack_num: ack,
            data_offset: 5,
            flags,
            window_size: 8192,
            checksum: 0,
            urgent_ptr: 0,
        }
    }

    fn inject(
        table: &mut TcpTable,
        hdr: &TcpHeader,
        payload: &[u8],
        now_ms: u64,
    ) -> TcpIo {
        let mut io = TcpIo::default();
        tcp_input(table, LOCAL, REMOTE, hdr, &[], payload, now_ms, &mut io);
        io
    }

    fn connected_events(io: &TcpIo) -> usize {
        io.events
            .iter()
            .filter(|e| matches!(e, NetEvent::TcpConnected { .. }))
            .count()
    }

    /// Drive a socket through the active-open handshake.
    fn establish(table: &mut TcpTable) -> (TcpHandle, u32, u32) {
        let mut io = TcpIo::default();
        let h = connect_in_table(table, LOCAL, REMOTE, 0, &mut io).unwrap();
        let iss = io.out[0].seq;
        let peer_iss = 90_000u32;
        let io = inject(
            table,
            &header(peer_iss, iss.wrapping_add(1), TCP_FLAG_SYN | TCP_FLAG_ACK),
            &[],
            10,
        );
        assert_eq!(table.state(h), Some(TcpState::Established));
        assert_eq!(connected_events(&io), 1);
        (h, iss, peer_iss)
    }

    #[test]
    fn active_open_handshake() {
        let mut table = TcpTable::new();
        let mut io = TcpIo::default();
        let h = connect_in_table(&mut table, LOCAL, REMOTE, 0, &mut io).unwrap();

        assert_eq!(table.state(h), Some(TcpState::SynSent));
        assert_eq!(io.out.len(), 1);
        let syn = &io.out[0];
        assert_eq!(syn.flags, TCP_FLAG_SYN);
        assert_eq!(syn.mss, Some(DEFAULT_MSS));

        // SYN+ACK with ack == iss+1 establishes and fires connected once.
        let reply = inject(
            &mut table,
            &header(5000, syn.seq.wrapping_add(1), TCP_FLAG_SYN | TCP_FLAG_ACK),
            &[],
            10,
        );
        assert_eq!(table.state(h), Some(TcpState::Established));
        assert_eq!(connected_events(&reply), 1);
        // The handshake completes with our ACK of their ISN+1.
        assert_eq!(reply.out.len(), 1);
        assert_eq!(reply.out[0].flags, TCP_FLAG_ACK);
        assert_eq!(reply.out[0].ack, 5001);
    }

    #[test]
    fn syn_ack_with_wrong_ack_gets_rst() {
        let mut table = TcpTable::new();
        let mut io = TcpIo::default();
        let h = connect_in_table(&mut table, LOCAL, REMOTE, 0, &mut io).unwrap();
        let iss = io.out[0].seq;

        let reply = inject(
            &mut table,
            &header(5000, iss.wrapping_add(7), TCP_FLAG_SYN | TCP_FLAG_ACK),
            &[],
            10,
        );
        assert_eq!(table.state(h), Some(TcpState::SynSent));
        assert_eq!(reply.out.len(), 1);
        assert_eq!(reply.out[0].flags, TCP_FLAG_RST);
        assert_eq!(connected_events(&reply), 0);
    }

    #[test]
    fn rst_in_syn_sent_is_connection_refused() {
        let mut table = TcpTable::new();
        let mut io = TcpIo::default();
        let h = connect_in_table(&mut table, LOCAL, REMOTE, 0, &mut io).unwrap();
        let iss = io.out[0].seq;

        let reply = inject(
            &mut table,
            &header(0, iss.wrapping_add(1), TCP_FLAG_RST | TCP_FLAG_ACK),
            &[],
            10,
        );
        assert_eq!(table.state(h), None);
        assert!(reply.events.iter().any(|e| matches!(
            e,
            NetEvent::TcpClosed { reason: TcpCloseReason::Refused, .. }
        )));
    }

    #[test]
    fn in_order_data_is_buffered_and_acked() {
        let mut table = TcpTable::new();
        let (h, _iss, peer_iss) = establish(&mut table);
        let rcv_nxt = peer_iss.wrapping_add(1);

        let io = inject(
            &mut table,
            &header(rcv_nxt, 0, TCP_FLAG_ACK | TCP_FLAG_PSH),
            b"hello stack",
            20,
        );
        assert!(io.events.iter().any(|e| matches!(e, NetEvent::TcpDataReady { .. })));
        assert_eq!(io.out.len(), 1);
        assert_eq!(io.out[0].ack, rcv_nxt.wrapping_add(11));

        let mut buf = [0u8; 32];
        let n = recv_in_table(&mut table, h, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello stack");
        // Buffer drained: nothing further to read.
        assert_eq!(recv_in_table(&mut table, h, &mut buf).unwrap(), 0);
    }

    #[test]
    fn out_of_order_data_triggers_one_dup_ack_only() {
        let mut table = TcpTable::new();
        let (h, _iss, peer_iss) = establish(&mut table);
        let rcv_nxt = peer_iss.wrapping_add(1);

        let io = inject(
            &mut table,
            &header(rcv_nxt.wrapping_add(100), 0, TCP_FLAG_ACK | TCP_FLAG_PSH),
            b"future data",
            20,
        );

        // No data surfaced, rcv_nxt not advanced, exactly one duplicate ACK.
        assert!(!io.events.iter().any(|e| matches!(e, NetEvent::TcpDataReady { .. })));
        assert_eq!(io.out.len(), 1);
        assert_eq!(io.out[0].flags, TCP_FLAG_ACK);
        assert_eq!(io.out[0].ack, rcv_nxt);

        let mut buf = [0u8; 32];
        assert_eq!(recv_in_table(&mut table, h, &mut buf).unwrap(), 0);
    }

    #[test]
    fn active_close_teardown_symmetry() {
        let mut table = TcpTable::new();
        let (h, _iss, peer_iss) = establish(&mut table);
        let rcv_nxt = peer_iss.wrapping_add(1);

        // close(): FIN+ACK out, FIN_WAIT_1.
        let mut io = TcpIo::default();
        close_in_table(&mut table, h, 100, &mut io).unwrap();
        assert_eq!(table.state(h), Some(TcpState::FinWait1));
        assert_eq!(io.out.len(), 1);
        let fin_seq = io.out[0].seq;
        assert_eq!(io.out[0].flags, TCP_FLAG_FIN | TCP_FLAG_ACK);

        // Peer ACKs our FIN: FIN_WAIT_2.
        inject(
            &mut table,
            &header(rcv_nxt, fin_seq.wrapping_add(1), TCP_FLAG_ACK),
            &[],
            110,
        );
        assert_eq!(table.state(h), Some(TcpState::FinWait2));

        // Peer FIN: ACK + TIME_WAIT.
        let io = inject(
            &mut table,
            &header(rcv_nxt, fin_seq.wrapping_add(1), TCP_FLAG_FIN | TCP_FLAG_ACK),
            &[],
            120,
        );
        assert_eq!(table.state(h), Some(TcpState::TimeWait));
        assert_eq!(io.out.len(), 1);
        assert_eq!(io.out[0].ack, rcv_nxt.wrapping_add(1));

        // 2×MSL later the slot is reclaimed.
        let mut io = TcpIo::default();
        timer_in_table(&mut table, 120 + TIME_WAIT_MS, &mut io);
        assert_eq!(table.state(h), None);
        assert_eq!(table.active_count(), 0);
    }

    #[test]
    fn simultaneous_close_goes_through_closing() {
        let mut table = TcpTable::new();
        let (h, _iss, peer_iss) = establish(&mut table);
        let rcv_nxt = peer_iss.wrapping_add(1);

        let mut io = TcpIo::default();
        close_in_table(&mut table, h, 100, &mut io).unwrap();
        let fin_seq = io.out[0].seq;

        // Peer FIN that does NOT ack our FIN: CLOSING.
        inject(
            &mut table,
            &header(rcv_nxt, fin_seq, TCP_FLAG_FIN | TCP_FLAG_ACK),
            &[],
            110,
        );
        assert_eq!(table.state(h), Some(TcpState::Closing));

        // ACK of our FIN: TIME_WAIT.
        inject(
            &mut table,
            &header(rcv_nxt.wrapping_add(1), fin_seq.wrapping_add(1), TCP_FLAG_ACK),
            &[],
            120,
        );
        assert_eq!(table.state(h), Some(TcpState::TimeWait));
    }

    #[test]
    fn passive_close_fires_callbacks_both_halves() {
        let mut table = TcpTable::new();
        let (h, _iss, peer_iss) = establish(&mut table);
        let rcv_nxt = peer_iss.wrapping_add(1);

        // Peer FIN: CLOSE_WAIT + peer-closed event + ACK.
        let io = inject(&mut table, &header(rcv_nxt, 0, TCP_FLAG_FIN | TCP_FLAG_ACK), &[], 10);
        assert_eq!(table.state(h), Some(TcpState::CloseWait));
        assert!(io.events.iter().any(|e| matches!(
            e,
            NetEvent::TcpClosed { reason: TcpCloseReason::PeerClosed, .. }
        )));

        // Our close: LAST_ACK with a FIN out.
        let mut io = TcpIo::default();
        close_in_table(&mut table, h, 20, &mut io).unwrap();
        assert_eq!(table.state(h), Some(TcpState::LastAck));
        let fin_seq = io.out[0].seq;

        // Final ACK: released, done event.
        let io = inject(
            &mut table,
            &header(rcv_nxt.wrapping_add(1), fin_seq.wrapping_add(1), TCP_FLAG_ACK),
            &[],
            30,
        );
        assert_eq!(table.state(h), None);
        assert!(io.events.iter().any(|e| matches!(
            e,
            NetEvent::TcpClosed { reason: TcpCloseReason::Done, .. }
        )));
    }

    #[test]
    fn rst_closes_from_any_state() {
        let mut table = TcpTable::new();
        let (h, _iss, peer_iss) = establish(&mut table);

        let io = inject(
            &mut table,
            &header(peer_iss.wrapping_add(1), 0, TCP_FLAG_RST),
            &[],
            10,
        );
        assert_eq!(table.state(h), None);
        assert!(io.events.iter().any(|e| matches!(
            e,
            NetEvent::TcpClosed { reason: TcpCloseReason::Reset, .. }
        )));
        // No response to a RST.
        assert!(io.out.is_empty());
    }

    #[test]
    fn listen_accept_and_backlog_overflow() {
        let mut table = TcpTable::new();
        let listen_addr = SockAddr::new(Ipv4Addr::UNSPECIFIED, Port(80));
        let listener = listen_in_table(&mut table, listen_addr, 1).unwrap();

        // The wildcard listener matches the address the SYN was sent to.
        let server = SockAddr::new(Ipv4Addr([10, 0, 0, 1]), Port(80));
        let client = SockAddr::new(Ipv4Addr([10, 0, 0, 2]), Port(40001));

        let seg = |src: SockAddr, seq: u32, ack: u32, flags: u8| TcpHeader {
            src_port: src.port.0,
            dst_port: 80,
            seq_num: seq,
            ack_num: ack,
            data_offset: 5,
            flags,
            window_size: 8192,
            checksum: 0,
            urgent_ptr: 0,
        };

        // First SYN spawns a child and answers SYN+ACK.
        let mut io = TcpIo::default();
        tcp_input(
            &mut table,
            server,
            client,
            &seg(client, 7000, 0, TCP_FLAG_SYN),
            &[],
            &[],
            0,
            &mut io,
        );
        assert_eq!(io.out.len(), 1);
        let syn_ack_seq = io.out[0].seq;
        assert_eq!(io.out[0].flags, TCP_FLAG_SYN | TCP_FLAG_ACK);
        assert_eq!(io.out[0].ack, 7001);
        assert_eq!(table.active_count(), 2);

        // Backlog of 1 is full: a SYN from another client is dropped silently.
        let other = SockAddr::new(Ipv4Addr([10, 0, 0, 9]), Port(4242));
        let mut io2 = TcpIo::default();
        tcp_input(
            &mut table,
            server,
            other,
            &seg(other, 9000, 0, TCP_FLAG_SYN),
            &[],
            &[],
            0,
            &mut io2,
        );
        assert!(io2.out.is_empty());
        assert_eq!(table.active_count(), 2);

        // Nothing established yet.
        assert!(accept_in_table(&mut table, listener).unwrap().is_none());

        // Handshake ACK completes the child; accept() returns it.
        let mut io3 = TcpIo::default();
        tcp_input(
            &mut table,
            server,
            client,
            &seg(client, 7001, syn_ack_seq.wrapping_add(1), TCP_FLAG_ACK),
            &[],
            &[],
            5,
            &mut io3,
        );
        assert_eq!(connected_events(&io3), 1);

        let (child, remote) = accept_in_table(&mut table, listener).unwrap().unwrap();
        assert_eq!(remote, client);
        assert_eq!(table.state(child), Some(TcpState::Established));
        // Backlog drained.
        assert!(accept_in_table(&mut table, listener).unwrap().is_none());
    }

    #[test]
    fn send_limits_one_segment_in_flight() {
        let mut table = TcpTable::new();
        let (h, _iss, peer_iss) = establish(&mut table);
        let rcv_nxt = peer_iss.wrapping_add(1);

        let mut io = TcpIo::default();
        let n = send_in_table(&mut table, h, b"request body", 100, &mut io).unwrap();
        assert_eq!(n, 12);
        assert_eq!(io.out.len(), 1);
        let seg = &io.out[0];
        assert_eq!(seg.flags, TCP_FLAG_PSH | TCP_FLAG_ACK);
        assert_eq!(seg.payload, b"request body");

        // Second send while unacknowledged: WouldBlock.
        let mut io2 = TcpIo::default();
        assert_eq!(
            send_in_table(&mut table, h, b"more", 110, &mut io2).unwrap_err(),
            NetError::WouldBlock
        );

        // ACK clears the in-flight segment and fires the sent event.
        let io3 = inject(
            &mut table,
            &header(rcv_nxt, seg.seq.wrapping_add(12), TCP_FLAG_ACK),
            &[],
            150,
        );
        assert!(io3
            .events
            .iter()
            .any(|e| matches!(e, NetEvent::TcpSent { len: 12, .. })));

        let mut io4 = TcpIo::default();
        assert!(send_in_table(&mut table, h, b"more", 200, &mut io4).is_ok());
    }

    #[test]
    fn retransmission_backs_off_and_eventually_gives_up() {
        let mut table = TcpTable::new();
        let mut io = TcpIo::default();
        let h = connect_in_table(&mut table, LOCAL, REMOTE, 0, &mut io).unwrap();
        let iss = io.out[0].seq;

        let mut now = 0u64;
        let mut rto = INITIAL_RTO_MS;
        for attempt in 1..=MAX_RETRANSMITS {
            now += rto as u64;
            let mut tick = TcpIo::default();
            timer_in_table(&mut table, now, &mut tick);
            assert_eq!(tick.out.len(), 1, "attempt {attempt} should retransmit");
            assert_eq!(tick.out[0].seq, iss);
            assert!(tick.out[0].flags & TCP_FLAG_SYN != 0);
            rto = (rto * 2).min(MAX_RTO_MS);
        }

        // One more expiry exceeds the bound: socket torn down.
        now += rto as u64;
        let mut tick = TcpIo::default();
        timer_in_table(&mut table, now, &mut tick);
        assert!(tick.out.is_empty());
        assert_eq!(table.state(h), None);
        assert!(tick.events.iter().any(|e| matches!(
            e,
            NetEvent::TcpClosed { reason: TcpCloseReason::TimedOut, .. }
        )));
    }

    #[test]
    fn close_is_idempotent_in_closing_states() {
        let mut table = TcpTable::new();
        let (h, _iss, _peer_iss) = establish(&mut table);

        let mut io = TcpIo::default();
        close_in_table(&mut table, h, 10, &mut io).unwrap();
        assert_eq!(io.out.len(), 1);
        assert_eq!(table.state(h), Some(TcpState::FinWait1));

        // A second close neither errors nor emits another FIN.
        let mut io2 = TcpIo::default();
        close_in_table(&mut table, h, 20, &mut io2).unwrap();
        assert!(io2.out.is_empty());
        assert_eq!(table.state(h), Some(TcpState::FinWait1));
    }

    #[test]
    fn segment_to_unknown_tuple_answers_rst() {
        let mut table = TcpTable::new();
        let io = inject(&mut table, &header(123, 456, TCP_FLAG_ACK), &[], 0);
        assert_eq!(io.out.len(), 1);
        assert_eq!(io.out[0].flags, TCP_FLAG_RST);
        assert_eq!(io.out[0].seq, 456);

        // A stray RST gets no answer.
        let io = inject(&mut table, &header(123, 0, TCP_FLAG_RST), &[], 0);
        assert!(io.out.is_empty());
    }
}

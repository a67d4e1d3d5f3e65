//! The network stack context object and its entry points.
//!
//! [`NetStack`] owns every piece of mutable stack state — device registry,
//! socket tables, DHCP clients, DNS resolver — behind a single lock, and is
//! the surface the host kernel talks to:
//!
//! - drivers push received frames into [`receive_frame`](NetStack::receive_frame)
//!   (or the stack pulls them in [`poll`](NetStack::poll));
//! - the main loop calls [`poll`](NetStack::poll) or the individual
//!   `*_timer`/`*_task` functions with a monotonic millisecond clock;
//! - applications use the socket, ping, DHCP, and DNS operations.
//!
//! Every entry point runs synchronously to completion.  Application
//! notification is collected while the lock is held and delivered through
//! the [`NetEvents`] sink **after** it is released, so a sink is free to
//! call straight back into the stack.
//!
//! Multiple independent stacks can coexist; nothing here is process-global.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use oxbow_lib::klog_debug;
use spin::Mutex;

use super::dhcp::{self, DhcpConfig, DhcpState, DhcpTable};
use super::dns::{self, DnsLookup, DnsResolver};
use super::ethernet::{self, ETH_HEADER_LEN};
use super::icmp;
use super::ipv4;
use super::netdev::{DeviceRegistry, IfaceConfig, NetDevice, NetDeviceFlags, NetDeviceStats};
use super::packetbuf::PacketBuf;
use super::tcp::TcpState;
use super::tcp_socket::{self, TcpHandle, TcpIo, TcpTable};
use super::types::{DevIndex, EtherType, Ipv4Addr, MacAddr, NetError, Port, SockAddr};
use super::udp::{self, UdpHandle, UdpSocketFlags, UdpTable};

/// Frames drained from one device per [`NetStack::poll`] call.
const POLL_RX_BUDGET: usize = 16;

// =============================================================================
// Events
// =============================================================================

/// Why a TCP socket's closed notification fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpCloseReason {
    /// Graceful teardown completed (LAST_ACK acknowledged).
    Done,
    /// The peer sent FIN; the connection is half-closed (CLOSE_WAIT).
    PeerClosed,
    /// A RST arrived (or a protocol violation forced one).
    Reset,
    /// RST during connection establishment.
    Refused,
    /// Retransmission attempts exhausted.
    TimedOut,
}

/// Application-visible stack events, delivered through [`NetEvents`].
#[derive(Clone, Debug)]
pub enum NetEvent {
    /// A TCP connection reached ESTABLISHED.
    TcpConnected { socket: TcpHandle },
    /// In-order TCP data was appended to the socket's receive buffer.
    TcpDataReady { socket: TcpHandle },
    /// An outgoing TCP data segment was fully acknowledged.
    TcpSent { socket: TcpHandle, len: usize },
    /// The connection closed (see [`TcpCloseReason`]).
    TcpClosed {
        socket: TcpHandle,
        reason: TcpCloseReason,
    },
    /// A UDP datagram arrived on a bound socket.
    UdpDatagram {
        socket: UdpHandle,
        src: SockAddr,
        data: Vec<u8>,
    },
    /// An ICMP Echo Reply arrived.
    EchoReply {
        src: Ipv4Addr,
        ident: u16,
        seq: u16,
        payload: Vec<u8>,
    },
    /// The DHCP client applied a lease to a device.
    DhcpConfigured { dev: DevIndex },
    /// An asynchronous DNS lookup completed (`None` = failure).
    DnsCompleted { id: u16, addr: Option<Ipv4Addr> },
}

/// The single application callback surface.
///
/// `on_event` takes `&self`; implementations use interior mutability.  It is
/// always invoked with the stack lock released.
pub trait NetEvents: Send + Sync {
    fn on_event(&self, event: NetEvent);
}

/// Sink that discards every event.
pub struct NullEvents;

impl NetEvents for NullEvents {
    fn on_event(&self, _event: NetEvent) {}
}

// =============================================================================
// MAC resolution capability
// =============================================================================

/// Next-hop MAC resolution.
///
/// Neighbor discovery is an external service; the stack only asks "what MAC
/// does `next_hop` have on `dev`?".  Returning `None` falls back to the
/// broadcast MAC.
pub trait MacResolver: Send + Sync {
    fn resolve(&self, dev: DevIndex, next_hop: Ipv4Addr) -> Option<MacAddr>;
}

/// Default resolver: always fall back to broadcast.
pub struct BroadcastResolver;

impl MacResolver for BroadcastResolver {
    fn resolve(&self, _dev: DevIndex, _next_hop: Ipv4Addr) -> Option<MacAddr> {
        None
    }
}

// =============================================================================
// StackInner
// =============================================================================

/// All mutable stack state, guarded by the stack's single lock.
pub(crate) struct StackInner {
    pub(crate) devices: DeviceRegistry,
    pub(crate) resolver: Box<dyn MacResolver>,
    pub(crate) udp: UdpTable,
    pub(crate) tcp: TcpTable,
    pub(crate) dhcp: DhcpTable,
    pub(crate) dns: DnsResolver,
    /// Events collected during the current entry point, delivered after the
    /// lock is released.
    pub(crate) events: Vec<NetEvent>,
    ip_ident: u16,
    ephemeral_port: u16,
    dhcp_xid: u32,
}

impl StackInner {
    pub(crate) fn new() -> Self {
        Self {
            devices: DeviceRegistry::new(),
            resolver: Box::new(BroadcastResolver),
            udp: UdpTable::new(),
            tcp: TcpTable::new(),
            dhcp: DhcpTable::new(),
            dns: DnsResolver::new(),
            events: Vec::new(),
            ip_ident: 1,
            ephemeral_port: 49152,
            dhcp_xid: 0x0D1C_0001,
        }
    }

    /// Monotonically increasing IPv4 identification field.
    pub(crate) fn next_ip_ident(&mut self) -> u16 {
        let ident = self.ip_ident;
        self.ip_ident = self.ip_ident.wrapping_add(1);
        ident
    }

    /// Next ephemeral port (49152–65535, wrapping).
    pub(crate) fn alloc_ephemeral_port(&mut self) -> Port {
        let port = self.ephemeral_port;
        self.ephemeral_port = if self.ephemeral_port >= 65535 {
            49152
        } else {
            self.ephemeral_port + 1
        };
        Port(port)
    }

    /// Next DHCP transaction id.
    pub(crate) fn next_dhcp_xid(&mut self) -> u32 {
        let xid = self.dhcp_xid;
        self.dhcp_xid = self.dhcp_xid.wrapping_add(1);
        xid
    }

    /// Account one dropped RX frame against a device.
    pub(crate) fn count_rx_drop(&mut self, dev: DevIndex) {
        if let Some(stats) = self.devices.stats_mut(dev) {
            stats.rx_dropped += 1;
        }
    }

    /// Run one frame through the full RX pipeline.
    pub(crate) fn receive_packet(&mut self, dev: DevIndex, mut pkt: PacketBuf, now_ms: u64) {
        let frame_len = pkt.len();
        if let Some(stats) = self.devices.stats_mut(dev) {
            stats.rx_packets += 1;
            stats.rx_bytes += frame_len as u64;
        }

        let Some(hdr) = ethernet::parse_header(pkt.payload()) else {
            klog_debug!("eth: frame too short ({} bytes)", frame_len);
            self.count_rx_drop(dev);
            return;
        };

        let Some(flags) = self.devices.flags(dev) else {
            return;
        };
        let our_mac = self.devices.mac(dev).unwrap_or(MacAddr::ZERO);
        let promiscuous = flags.contains(NetDeviceFlags::PROMISCUOUS);
        let loopback = flags.contains(NetDeviceFlags::LOOPBACK);
        if !loopback && !ethernet::accepts(hdr.dst, our_mac, promiscuous) {
            // Not addressed to us.
            return;
        }

        if pkt.pull_header(ETH_HEADER_LEN).is_err() {
            return;
        }

        match EtherType::from_u16(hdr.ethertype) {
            Some(EtherType::Ipv4) => ipv4::rx(self, dev, pkt, now_ms),
            Some(EtherType::Arp) | Some(EtherType::Ipv6) => {
                // Neither is handled here; neighbor resolution is external.
            }
            None => {
                klog_debug!("eth: unknown EtherType {:#06x}, dropping", hdr.ethertype);
                self.count_rx_drop(dev);
            }
        }
    }
}

// =============================================================================
// NetStack
// =============================================================================

/// The network stack.  See [module documentation](self).
pub struct NetStack {
    inner: Mutex<StackInner>,
    sink: Box<dyn NetEvents>,
}

impl NetStack {
    /// Create a stack delivering events to `sink`.
    pub fn new(sink: Box<dyn NetEvents>) -> Self {
        Self {
            inner: Mutex::new(StackInner::new()),
            sink,
        }
    }

    /// Replace the MAC resolution capability (default: broadcast fallback).
    pub fn set_mac_resolver(&self, resolver: Box<dyn MacResolver>) {
        self.inner.lock().resolver = resolver;
    }

    /// Run `f` under the stack lock, then deliver collected events.
    fn run<R>(&self, f: impl FnOnce(&mut StackInner) -> R) -> R {
        let (result, events) = {
            let mut inner = self.inner.lock();
            let result = f(&mut inner);
            (result, core::mem::take(&mut inner.events))
        };
        for event in events {
            self.sink.on_event(event);
        }
        result
    }

    // -------------------------------------------------------------------------
    // Devices
    // -------------------------------------------------------------------------

    /// Register a network device.  See [`DeviceRegistry::register`].
    pub fn register_device(
        &self,
        name: &'static str,
        dev: Box<dyn NetDevice>,
        flags: NetDeviceFlags,
    ) -> Result<DevIndex, NetError> {
        self.run(|inner| inner.devices.register(name, dev, flags))
    }

    /// Statically configure a device's IPv4 parameters.
    pub fn configure_device(&self, dev: DevIndex, config: IfaceConfig) -> Result<(), NetError> {
        self.run(|inner| inner.devices.configure(dev, config))
    }

    /// Nominate the default outgoing device.
    pub fn set_default_device(&self, dev: DevIndex) -> Result<(), NetError> {
        self.run(|inner| inner.devices.set_default(dev))
    }

    /// A device's current IPv4 configuration.
    pub fn device_config(&self, dev: DevIndex) -> Option<IfaceConfig> {
        self.run(|inner| inner.devices.config(dev))
    }

    /// A device's statistics snapshot.
    pub fn device_stats(&self, dev: DevIndex) -> Option<NetDeviceStats> {
        self.run(|inner| inner.devices.stats(dev))
    }

    // -------------------------------------------------------------------------
    // RX and periodic entry points
    // -------------------------------------------------------------------------

    /// Feed one received frame through the stack (driver RX callback).
    ///
    /// The whole pipeline — Ethernet demux, IPv4 validation, transport
    /// processing, event delivery — runs before this returns.
    pub fn receive_frame(&self, dev: DevIndex, frame: &[u8], now_ms: u64) {
        let pkt = PacketBuf::from_slice(frame);
        self.run(|inner| inner.receive_packet(dev, pkt, now_ms));
    }

    /// Drain pending device RX queues and run every periodic task.
    pub fn poll(&self, now_ms: u64) {
        self.run(|inner| {
            for i in 0..super::netdev::MAX_DEVICES {
                let dev = DevIndex(i);
                for _ in 0..POLL_RX_BUDGET {
                    let Some(pkt) = inner.devices.device(dev).and_then(|d| d.poll_rx()) else {
                        break;
                    };
                    inner.receive_packet(dev, pkt, now_ms);
                }
            }
            let mut io = TcpIo::default();
            tcp_socket::timer_in_table(&mut inner.tcp, now_ms, &mut io);
            tcp_socket::flush_io(inner, io);
            dhcp::task(inner, now_ms);
            dns::task(inner, now_ms);
        });
    }

    /// Advance TCP retransmission and TIME_WAIT timers.
    pub fn tcp_timer(&self, now_ms: u64) {
        self.run(|inner| {
            let mut io = TcpIo::default();
            tcp_socket::timer_in_table(&mut inner.tcp, now_ms, &mut io);
            tcp_socket::flush_io(inner, io);
        });
    }

    // -------------------------------------------------------------------------
    // ICMP
    // -------------------------------------------------------------------------

    /// Send an ICMP Echo Request.  The reply arrives as
    /// [`NetEvent::EchoReply`].
    pub fn ping(
        &self,
        dst: Ipv4Addr,
        ident: u16,
        seq: u16,
        payload: &[u8],
    ) -> Result<(), NetError> {
        self.run(|inner| icmp::ping(inner, dst, ident, seq, payload))
    }

    // -------------------------------------------------------------------------
    // UDP
    // -------------------------------------------------------------------------

    /// Open a UDP socket.
    pub fn udp_open(&self, flags: UdpSocketFlags) -> Result<UdpHandle, NetError> {
        self.run(|inner| inner.udp.open(flags))
    }

    /// Bind a UDP socket to a local address and port.
    pub fn udp_bind(&self, socket: UdpHandle, local: SockAddr) -> Result<(), NetError> {
        self.run(|inner| inner.udp.bind(socket, local))
    }

    /// Fix a UDP socket's default destination.
    pub fn udp_connect(&self, socket: UdpHandle, remote: SockAddr) -> Result<(), NetError> {
        self.run(|inner| inner.udp.connect(socket, remote))
    }

    /// Send on a connected UDP socket.
    pub fn udp_send(&self, socket: UdpHandle, payload: &[u8]) -> Result<usize, NetError> {
        self.run(|inner| udp::send(inner, socket, payload))
    }

    /// Send to an explicit destination.
    pub fn udp_send_to(
        &self,
        socket: UdpHandle,
        dst: SockAddr,
        payload: &[u8],
    ) -> Result<usize, NetError> {
        self.run(|inner| udp::send_to(inner, socket, dst, payload))
    }

    /// Close a UDP socket.  Closing twice is harmless.
    pub fn udp_close(&self, socket: UdpHandle) {
        self.run(|inner| inner.udp.close(socket));
    }

    // -------------------------------------------------------------------------
    // TCP
    // -------------------------------------------------------------------------

    /// Open an active connection to `remote`.
    ///
    /// Picks the outgoing device and an ephemeral port, sends the SYN, and
    /// returns the socket handle; [`NetEvent::TcpConnected`] fires when the
    /// handshake completes.
    pub fn tcp_connect(&self, remote: SockAddr, now_ms: u64) -> Result<TcpHandle, NetError> {
        self.run(|inner| {
            let dev = inner
                .devices
                .select_for(remote.ip)
                .ok_or(NetError::NetworkUnreachable)?;
            let src = inner.devices.addr(dev).ok_or(NetError::NetworkUnreachable)?;
            let local = SockAddr::new(src, inner.alloc_ephemeral_port());
            let mut io = TcpIo::default();
            let handle = tcp_socket::connect_in_table(&mut inner.tcp, local, remote, now_ms, &mut io)?;
            tcp_socket::flush_io(inner, io);
            Ok(handle)
        })
    }

    /// Open a passive (listening) socket.
    pub fn tcp_listen(
        &self,
        local: SockAddr,
        backlog: usize,
    ) -> Result<TcpHandle, NetError> {
        self.run(|inner| tcp_socket::listen_in_table(&mut inner.tcp, local, backlog))
    }

    /// Dequeue one established connection from a listener's backlog.
    pub fn tcp_accept(
        &self,
        socket: TcpHandle,
    ) -> Result<Option<(TcpHandle, SockAddr)>, NetError> {
        self.run(|inner| tcp_socket::accept_in_table(&mut inner.tcp, socket))
    }

    /// Queue data for transmission.  At most one segment is in flight;
    /// `WouldBlock` asks the caller to retry after [`NetEvent::TcpSent`].
    pub fn tcp_send(
        &self,
        socket: TcpHandle,
        data: &[u8],
        now_ms: u64,
    ) -> Result<usize, NetError> {
        self.run(|inner| {
            let mut io = TcpIo::default();
            let n = tcp_socket::send_in_table(&mut inner.tcp, socket, data, now_ms, &mut io)?;
            tcp_socket::flush_io(inner, io);
            Ok(n)
        })
    }

    /// Drain received bytes from the socket's circular buffer.
    pub fn tcp_recv(&self, socket: TcpHandle, out: &mut [u8]) -> Result<usize, NetError> {
        self.run(|inner| tcp_socket::recv_in_table(&mut inner.tcp, socket, out))
    }

    /// Begin a graceful close.  Safe to call repeatedly.
    pub fn tcp_close(&self, socket: TcpHandle, now_ms: u64) -> Result<(), NetError> {
        self.run(|inner| {
            let mut io = TcpIo::default();
            tcp_socket::close_in_table(&mut inner.tcp, socket, now_ms, &mut io)?;
            tcp_socket::flush_io(inner, io);
            Ok(())
        })
    }

    /// Abort: RST the peer and drop the socket immediately.
    pub fn tcp_abort(&self, socket: TcpHandle) -> Result<(), NetError> {
        self.run(|inner| {
            let mut io = TcpIo::default();
            tcp_socket::abort_in_table(&mut inner.tcp, socket, &mut io)?;
            tcp_socket::flush_io(inner, io);
            Ok(())
        })
    }

    /// Current state of a TCP socket (`None` once released).
    pub fn tcp_state(&self, socket: TcpHandle) -> Option<TcpState> {
        self.run(|inner| inner.tcp.state(socket))
    }

    /// Remote endpoint of a TCP socket.
    pub fn tcp_remote(&self, socket: TcpHandle) -> Option<SockAddr> {
        self.run(|inner| inner.tcp.remote(socket))
    }

    // -------------------------------------------------------------------------
    // DHCP
    // -------------------------------------------------------------------------

    /// Start lease acquisition on a device.
    pub fn dhcp_start(&self, dev: DevIndex, now_ms: u64) -> Result<(), NetError> {
        self.run(|inner| dhcp::start(inner, dev, now_ms))
    }

    /// Drive DHCP retransmission/renewal/rebinding timers.
    pub fn dhcp_task(&self, now_ms: u64) {
        self.run(|inner| dhcp::task(inner, now_ms));
    }

    /// The applied lease of a device, if any.
    pub fn dhcp_config(&self, dev: DevIndex) -> Option<DhcpConfig> {
        self.run(|inner| dhcp::config(inner, dev))
    }

    /// Current DHCP client state of a device.
    pub fn dhcp_state(&self, dev: DevIndex) -> Option<DhcpState> {
        self.run(|inner| dhcp::state(inner, dev))
    }

    /// Release the device's lease (BOUND only).
    pub fn dhcp_release(&self, dev: DevIndex, now_ms: u64) -> Result<(), NetError> {
        self.run(|inner| dhcp::release(inner, dev, now_ms))
    }

    // -------------------------------------------------------------------------
    // DNS
    // -------------------------------------------------------------------------

    /// Start an asynchronous lookup.  Cache hits and IP literals answer
    /// immediately; otherwise [`NetEvent::DnsCompleted`] fires later with
    /// the returned transaction id.
    pub fn dns_lookup(&self, hostname: &[u8], now_ms: u64) -> Result<DnsLookup, NetError> {
        self.run(|inner| dns::lookup(inner, hostname, false, now_ms))
    }

    /// Resolve synchronously: poll the stack until the query completes or
    /// `timeout_ms` elapses on the registered monotonic clock.
    ///
    /// This is the stack's only busy-wait; everything else is event-driven.
    pub fn dns_lookup_sync(
        &self,
        hostname: &[u8],
        timeout_ms: u64,
    ) -> Result<Ipv4Addr, NetError> {
        let start = oxbow_lib::clock::uptime_ms();
        let pending = self.run(|inner| dns::lookup(inner, hostname, true, start))?;
        let id = match pending {
            DnsLookup::Address(addr) => return Ok(addr),
            DnsLookup::Pending(id) => id,
        };

        loop {
            let now = oxbow_lib::clock::uptime_ms();
            self.poll(now);

            if let Some(result) = self.run(|inner| dns::take_sync_result(inner, id)) {
                return result.ok_or(NetError::TimedOut);
            }
            if now.saturating_sub(start) >= timeout_ms {
                self.run(|inner| dns::cancel(inner, id));
                return Err(NetError::TimedOut);
            }
            core::hint::spin_loop();
        }
    }

    /// Drive DNS query timeouts and retries.
    pub fn dns_task(&self, now_ms: u64) {
        self.run(|inner| dns::task(inner, now_ms));
    }

    /// Cached address for a hostname, if still valid.
    pub fn dns_cached(&self, hostname: &[u8], now_ms: u64) -> Option<Ipv4Addr> {
        self.run(|inner| dns::get_cached(inner, hostname, now_ms))
    }
}

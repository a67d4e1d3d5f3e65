//! DHCP client: BOOTP message codec and per-device lease state machine.
//!
//! One client record exists per managed device.  The machine is driven by
//! two inputs: BOOTP replies intercepted from the UDP RX path (destination
//! port 68) and the periodic [`task`] the host calls with the monotonic
//! clock.
//!
//! ```text
//! INIT --start--> SELECTING --OFFER/REQUEST--> REQUESTING --ACK--> BOUND
//!   ^                                            |                  |
//!   +------------------ NAK ---------------------+    renewal deadline
//!   |                                                              v
//!   +-- lease expiry -- REBINDING <-- rebind deadline -- RENEWING -+
//! ```
//!
//! Renewal defaults to half the lease, rebind to ⅞ of it, unless the server
//! supplies options 58/59.  Discovery and request retransmit on a fixed
//! 5-second timeout; RENEWING retries unicast and REBINDING broadcast on
//! the same cadence.

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

use oxbow_lib::{klog_debug, klog_info, klog_warn};

use super::netdev::IfaceConfig;
use super::stack::{NetEvent, StackInner};
use super::types::{DevIndex, Ipv4Addr, MacAddr, NetError, Port, SockAddr};
use super::udp;

pub const UDP_PORT_SERVER: u16 = 67;
pub const UDP_PORT_CLIENT: u16 = 68;

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;
const FLAGS_BROADCAST: u16 = 0x8000;
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const OPTION_PAD: u8 = 0;
const OPTION_SUBNET_MASK: u8 = 1;
const OPTION_ROUTER: u8 = 3;
const OPTION_DNS: u8 = 6;
const OPTION_REQUESTED_IP: u8 = 50;
const OPTION_LEASE_TIME: u8 = 51;
const OPTION_MSG_TYPE: u8 = 53;
const OPTION_SERVER_ID: u8 = 54;
const OPTION_PARAM_REQ_LIST: u8 = 55;
const OPTION_RENEWAL_TIME: u8 = 58;
const OPTION_REBIND_TIME: u8 = 59;
const OPTION_END: u8 = 255;

pub const MSG_DISCOVER: u8 = 1;
pub const MSG_OFFER: u8 = 2;
pub const MSG_REQUEST: u8 = 3;
pub const MSG_DECLINE: u8 = 4;
pub const MSG_ACK: u8 = 5;
pub const MSG_NAK: u8 = 6;
pub const MSG_RELEASE: u8 = 7;

/// Fixed BOOTP header (236 bytes) plus the 4-byte magic cookie.
pub const BOOTP_HEADER_LEN: usize = 240;

/// Build buffer size: header + generous option room.
pub const DHCP_PACKET_MAX: usize = 320;

/// Retransmit interval for DISCOVER/REQUEST, and the retry cadence in
/// RENEWING/REBINDING.
pub const DHCP_RETRY_MS: u64 = 5000;

// =============================================================================
// States
// =============================================================================

/// DHCP client state (RFC 2131 §4.4).
///
/// `InitReboot` and `Rebooting` complete the RFC set but are not entered by
/// this client — it always starts discovery from scratch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DhcpState {
    Init,
    Selecting,
    Requesting,
    Bound,
    Renewing,
    Rebinding,
    InitReboot,
    Rebooting,
}

impl DhcpState {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Selecting => "SELECTING",
            Self::Requesting => "REQUESTING",
            Self::Bound => "BOUND",
            Self::Renewing => "RENEWING",
            Self::Rebinding => "REBINDING",
            Self::InitReboot => "INIT_REBOOT",
            Self::Rebooting => "REBOOTING",
        }
    }
}

impl fmt::Display for DhcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Lease record
// =============================================================================

/// The applied lease of a bound (or renewing/rebinding) client.
#[derive(Clone, Copy, Debug)]
pub struct DhcpConfig {
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Ipv4Addr,
    pub server_id: Ipv4Addr,
    /// Total lease duration in seconds.
    pub lease_secs: u32,
    /// Seconds after acquisition at which renewal starts (default lease/2).
    pub renewal_secs: u32,
    /// Seconds after acquisition at which rebinding starts
    /// (default lease − lease/8).
    pub rebind_secs: u32,
    /// When the lease was acquired (monotonic ms).
    pub acquired_at_ms: u64,
    pub state: DhcpState,
}

// =============================================================================
// Message codec
// =============================================================================

/// Parsed option set from a BOOTP reply.
#[derive(Clone, Copy, Default)]
struct DhcpOptions {
    message_type: u8,
    server_id: [u8; 4],
    subnet_mask: [u8; 4],
    router: [u8; 4],
    dns: [u8; 4],
    lease_secs: u32,
    renewal_secs: u32,
    rebind_secs: u32,
}

/// A validated BOOTP reply: message type, offered address, options.
#[derive(Clone, Copy)]
struct DhcpReply {
    msg_type: u8,
    yiaddr: Ipv4Addr,
    options: DhcpOptions,
}

/// Write the common BOOTP header fields shared by all client messages.
/// Returns the byte offset where options begin (`BOOTP_HEADER_LEN`).
fn write_bootp_header(
    out: &mut [u8; DHCP_PACKET_MAX],
    mac: MacAddr,
    xid: u32,
    ciaddr: Ipv4Addr,
    broadcast: bool,
) -> usize {
    out.fill(0);
    out[0] = BOOTREQUEST;
    out[1] = 1; // htype: Ethernet
    out[2] = 6; // hlen:  6-byte MAC
    out[4..8].copy_from_slice(&xid.to_be_bytes());
    if broadcast {
        out[10..12].copy_from_slice(&FLAGS_BROADCAST.to_be_bytes());
    }
    out[12..16].copy_from_slice(ciaddr.as_bytes());
    out[28..34].copy_from_slice(mac.as_bytes());
    out[236..240].copy_from_slice(&MAGIC_COOKIE);
    BOOTP_HEADER_LEN
}

/// Append the standard parameter-request-list option and the END marker.
/// Returns the final packet length.
fn finish_options(out: &mut [u8; DHCP_PACKET_MAX], mut i: usize) -> usize {
    out[i] = OPTION_PARAM_REQ_LIST;
    out[i + 1] = 4;
    out[i + 2] = OPTION_SUBNET_MASK;
    out[i + 3] = OPTION_ROUTER;
    out[i + 4] = OPTION_DNS;
    out[i + 5] = OPTION_LEASE_TIME;
    i += 6;

    out[i] = OPTION_END;
    i + 1
}

fn put_msg_type(out: &mut [u8; DHCP_PACKET_MAX], i: usize, msg: u8) -> usize {
    out[i] = OPTION_MSG_TYPE;
    out[i + 1] = 1;
    out[i + 2] = msg;
    i + 3
}

fn put_addr_option(out: &mut [u8; DHCP_PACKET_MAX], i: usize, code: u8, addr: Ipv4Addr) -> usize {
    out[i] = code;
    out[i + 1] = 4;
    out[i + 2..i + 6].copy_from_slice(addr.as_bytes());
    i + 6
}

pub fn build_discover(mac: MacAddr, xid: u32, out: &mut [u8; DHCP_PACKET_MAX]) -> usize {
    let i = write_bootp_header(out, mac, xid, Ipv4Addr::UNSPECIFIED, true);
    let i = put_msg_type(out, i, MSG_DISCOVER);
    finish_options(out, i)
}

/// REQUEST in SELECTING: names the offered address and the chosen server.
pub fn build_request_selecting(
    mac: MacAddr,
    xid: u32,
    requested: Ipv4Addr,
    server: Ipv4Addr,
    out: &mut [u8; DHCP_PACKET_MAX],
) -> usize {
    let i = write_bootp_header(out, mac, xid, Ipv4Addr::UNSPECIFIED, true);
    let i = put_msg_type(out, i, MSG_REQUEST);
    let i = put_addr_option(out, i, OPTION_REQUESTED_IP, requested);
    let i = put_addr_option(out, i, OPTION_SERVER_ID, server);
    finish_options(out, i)
}

/// REQUEST in RENEWING/REBINDING: `ciaddr` carries the held address, no
/// requested-ip/server-id options.
pub fn build_request_renewing(
    mac: MacAddr,
    xid: u32,
    ciaddr: Ipv4Addr,
    broadcast: bool,
    out: &mut [u8; DHCP_PACKET_MAX],
) -> usize {
    let i = write_bootp_header(out, mac, xid, ciaddr, broadcast);
    let i = put_msg_type(out, i, MSG_REQUEST);
    finish_options(out, i)
}

pub fn build_release(
    mac: MacAddr,
    xid: u32,
    ciaddr: Ipv4Addr,
    server: Ipv4Addr,
    out: &mut [u8; DHCP_PACKET_MAX],
) -> usize {
    let i = write_bootp_header(out, mac, xid, ciaddr, false);
    let i = put_msg_type(out, i, MSG_RELEASE);
    let mut i = put_addr_option(out, i, OPTION_SERVER_ID, server);
    out[i] = OPTION_END;
    i += 1;
    i
}

/// Walk the TLV option region.  Unknown codes are skipped via their length
/// byte; truncated options end the walk.
fn parse_options(options: &[u8]) -> DhcpOptions {
    let mut opts = DhcpOptions::default();
    let mut i = 0usize;
    while i < options.len() {
        let code = options[i];
        if code == OPTION_END {
            break;
        }
        if code == OPTION_PAD {
            i += 1;
            continue;
        }
        if i + 1 >= options.len() {
            break;
        }
        let len = options[i + 1] as usize;
        if i + 2 + len > options.len() {
            break;
        }

        let data = &options[i + 2..i + 2 + len];
        match code {
            OPTION_MSG_TYPE if len >= 1 => opts.message_type = data[0],
            OPTION_SERVER_ID if len >= 4 => opts.server_id.copy_from_slice(&data[..4]),
            OPTION_SUBNET_MASK if len >= 4 => opts.subnet_mask.copy_from_slice(&data[..4]),
            OPTION_ROUTER if len >= 4 => opts.router.copy_from_slice(&data[..4]),
            OPTION_DNS if len >= 4 => opts.dns.copy_from_slice(&data[..4]),
            OPTION_LEASE_TIME if len >= 4 => {
                opts.lease_secs = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            }
            OPTION_RENEWAL_TIME if len >= 4 => {
                opts.renewal_secs = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            }
            OPTION_REBIND_TIME if len >= 4 => {
                opts.rebind_secs = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            }
            _ => {}
        }

        i += 2 + len;
    }

    opts
}

/// Validate a BOOTP reply: op, transaction id, magic cookie.
fn parse_reply(payload: &[u8], xid: u32) -> Option<DhcpReply> {
    if payload.len() < BOOTP_HEADER_LEN {
        return None;
    }
    if payload[0] != BOOTREPLY {
        return None;
    }
    if u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]) != xid {
        return None;
    }
    if payload[236..240] != MAGIC_COOKIE {
        return None;
    }

    let options = parse_options(&payload[BOOTP_HEADER_LEN..]);
    Some(DhcpReply {
        msg_type: options.message_type,
        yiaddr: Ipv4Addr([payload[16], payload[17], payload[18], payload[19]]),
        options,
    })
}

// =============================================================================
// Client records
// =============================================================================

/// Per-device client state.
struct DhcpClient {
    dev: DevIndex,
    state: DhcpState,
    xid: u32,
    /// Last DISCOVER/REQUEST transmission, for the retry cadence.
    last_tx_ms: u64,
    /// The offer being requested (SELECTING → REQUESTING).
    offered: Ipv4Addr,
    /// Lease terms once bound.
    lease: Option<DhcpConfig>,
}

/// All DHCP clients, one per started device.
pub(crate) struct DhcpTable {
    clients: Vec<DhcpClient>,
}

impl DhcpTable {
    pub(crate) const fn new() -> Self {
        Self { clients: Vec::new() }
    }

    fn client_mut(&mut self, dev: DevIndex) -> Option<&mut DhcpClient> {
        self.clients.iter_mut().find(|c| c.dev == dev)
    }
}

// =============================================================================
// Transmission helpers
// =============================================================================

fn broadcast_dst() -> SockAddr {
    SockAddr::new(Ipv4Addr::BROADCAST, Port(UDP_PORT_SERVER))
}

fn client_src(ip: Ipv4Addr) -> SockAddr {
    SockAddr::new(ip, Port(UDP_PORT_CLIENT))
}

fn send_discover(inner: &mut StackInner, dev: DevIndex, xid: u32) {
    let Some(mac) = inner.devices.mac(dev) else { return };
    let mut buf = [0u8; DHCP_PACKET_MAX];
    let len = build_discover(mac, xid, &mut buf);
    if let Err(err) = udp::send_raw(
        inner,
        dev,
        client_src(Ipv4Addr::UNSPECIFIED),
        broadcast_dst(),
        &buf[..len],
    ) {
        klog_debug!("dhcp: DISCOVER tx failed on dev{}: {}", dev.0, err);
    }
}

fn send_request_selecting(
    inner: &mut StackInner,
    dev: DevIndex,
    xid: u32,
    requested: Ipv4Addr,
    server: Ipv4Addr,
) {
    let Some(mac) = inner.devices.mac(dev) else { return };
    let mut buf = [0u8; DHCP_PACKET_MAX];
    let len = build_request_selecting(mac, xid, requested, server, &mut buf);
    if let Err(err) = udp::send_raw(
        inner,
        dev,
        client_src(Ipv4Addr::UNSPECIFIED),
        broadcast_dst(),
        &buf[..len],
    ) {
        klog_debug!("dhcp: REQUEST tx failed on dev{}: {}", dev.0, err);
    }
}

fn send_request_renewing(inner: &mut StackInner, dev: DevIndex, xid: u32, lease: &DhcpConfig, broadcast: bool) {
    let Some(mac) = inner.devices.mac(dev) else { return };
    let mut buf = [0u8; DHCP_PACKET_MAX];
    let len = build_request_renewing(mac, xid, lease.addr, broadcast, &mut buf);
    let dst = if broadcast {
        broadcast_dst()
    } else {
        SockAddr::new(lease.server_id, Port(UDP_PORT_SERVER))
    };
    if let Err(err) = udp::send_raw(inner, dev, client_src(lease.addr), dst, &buf[..len]) {
        klog_debug!("dhcp: renewal REQUEST tx failed on dev{}: {}", dev.0, err);
    }
}

// =============================================================================
// Public operations
// =============================================================================

/// Begin (or restart) lease acquisition on a device: broadcast DISCOVER and
/// enter SELECTING.
pub(crate) fn start(inner: &mut StackInner, dev: DevIndex, now_ms: u64) -> Result<(), NetError> {
    if inner.devices.mac(dev).is_none() {
        return Err(NetError::NotFound);
    }
    let xid = inner.next_dhcp_xid();

    match inner.dhcp.clients.iter().position(|c| c.dev == dev) {
        Some(i) => {
            let client = &mut inner.dhcp.clients[i];
            client.state = DhcpState::Selecting;
            client.xid = xid;
            client.last_tx_ms = now_ms;
            client.offered = Ipv4Addr::UNSPECIFIED;
            client.lease = None;
        }
        None => inner.dhcp.clients.push(DhcpClient {
            dev,
            state: DhcpState::Selecting,
            xid,
            last_tx_ms: now_ms,
            offered: Ipv4Addr::UNSPECIFIED,
            lease: None,
        }),
    }

    klog_info!("dhcp: dev{} INIT -> SELECTING (xid={:#010x})", dev.0, xid);
    send_discover(inner, dev, xid);
    Ok(())
}

/// The applied lease of a device, if it is in a bound-ish state.
pub(crate) fn config(inner: &StackInner, dev: DevIndex) -> Option<DhcpConfig> {
    let client = inner.dhcp.clients.iter().find(|c| c.dev == dev)?;
    let mut lease = client.lease?;
    lease.state = client.state;
    Some(lease)
}

/// Release the lease: RELEASE to the known server, back to INIT.
/// Only legal from BOUND.
pub(crate) fn release(inner: &mut StackInner, dev: DevIndex, _now_ms: u64) -> Result<(), NetError> {
    let client = inner.dhcp.client_mut(dev).ok_or(NetError::NotFound)?;
    if client.state != DhcpState::Bound {
        return Err(NetError::InvalidState);
    }
    let xid = client.xid;
    let lease = client.lease.take().ok_or(NetError::InvalidState)?;
    client.state = DhcpState::Init;
    client.offered = Ipv4Addr::UNSPECIFIED;

    if let Some(mac) = inner.devices.mac(dev) {
        let mut buf = [0u8; DHCP_PACKET_MAX];
        let len = build_release(mac, xid, lease.addr, lease.server_id, &mut buf);
        let dst = SockAddr::new(lease.server_id, Port(UDP_PORT_SERVER));
        let _ = udp::send_raw(inner, dev, client_src(lease.addr), dst, &buf[..len]);
    }
    inner.devices.clear_config(dev);
    klog_info!("dhcp: dev{} released {} -> INIT", dev.0, lease.addr);
    Ok(())
}

// =============================================================================
// Reply processing (UDP interception on port 68)
// =============================================================================

/// Handle a BOOTP reply delivered to the client port.
pub(crate) fn rx(inner: &mut StackInner, dev: DevIndex, payload: &[u8], now_ms: u64) {
    let Some(client) = inner.dhcp.client_mut(dev) else {
        return;
    };
    let Some(reply) = parse_reply(payload, client.xid) else {
        return;
    };

    match (client.state, reply.msg_type) {
        (DhcpState::Selecting, MSG_OFFER) => {
            let server = Ipv4Addr(reply.options.server_id);
            if server.is_unspecified() || reply.yiaddr.is_unspecified() {
                klog_debug!("dhcp: dev{} OFFER without server id, ignoring", dev.0);
                return;
            }
            client.offered = reply.yiaddr;
            client.state = DhcpState::Requesting;
            client.last_tx_ms = now_ms;
            // Stash the server for the REQUEST and a potential later NAK.
            client.lease = Some(DhcpConfig {
                addr: reply.yiaddr,
                netmask: Ipv4Addr(reply.options.subnet_mask),
                gateway: Ipv4Addr(reply.options.router),
                dns: Ipv4Addr(reply.options.dns),
                server_id: server,
                lease_secs: reply.options.lease_secs,
                renewal_secs: 0,
                rebind_secs: 0,
                acquired_at_ms: 0,
                state: DhcpState::Requesting,
            });
            let (xid, offered) = (client.xid, client.offered);
            klog_info!("dhcp: dev{} OFFER {} from {} -> REQUESTING", dev.0, reply.yiaddr, server);
            send_request_selecting(inner, dev, xid, offered, server);
        }

        (DhcpState::Requesting | DhcpState::Renewing | DhcpState::Rebinding, MSG_ACK) => {
            let lease_secs = if reply.options.lease_secs != 0 {
                reply.options.lease_secs
            } else {
                client.lease.map(|l| l.lease_secs).unwrap_or(0)
            };
            let renewal_secs = if reply.options.renewal_secs != 0 {
                reply.options.renewal_secs
            } else {
                lease_secs / 2
            };
            let rebind_secs = if reply.options.rebind_secs != 0 {
                reply.options.rebind_secs
            } else {
                lease_secs - lease_secs / 8
            };

            let prior = client.lease;
            let pick = |fresh: [u8; 4], held: Option<Ipv4Addr>| {
                let fresh = Ipv4Addr(fresh);
                if fresh.is_unspecified() {
                    held.unwrap_or(Ipv4Addr::UNSPECIFIED)
                } else {
                    fresh
                }
            };
            let addr = if reply.yiaddr.is_unspecified() {
                prior.map(|l| l.addr).unwrap_or(Ipv4Addr::UNSPECIFIED)
            } else {
                reply.yiaddr
            };
            let lease = DhcpConfig {
                addr,
                netmask: pick(reply.options.subnet_mask, prior.map(|l| l.netmask)),
                gateway: pick(reply.options.router, prior.map(|l| l.gateway)),
                dns: pick(reply.options.dns, prior.map(|l| l.dns)),
                server_id: pick(reply.options.server_id, prior.map(|l| l.server_id)),
                lease_secs,
                renewal_secs,
                rebind_secs,
                acquired_at_ms: now_ms,
                state: DhcpState::Bound,
            };
            let from = client.state;
            client.state = DhcpState::Bound;
            client.lease = Some(lease);

            klog_info!(
                "dhcp: dev{} {} -> BOUND {} lease={}s t1={}s t2={}s",
                dev.0,
                from.name(),
                lease.addr,
                lease.lease_secs,
                lease.renewal_secs,
                lease.rebind_secs
            );
            let _ = inner.devices.configure(
                dev,
                IfaceConfig {
                    addr: lease.addr,
                    netmask: lease.netmask,
                    gateway: lease.gateway,
                    dns: [lease.dns, Ipv4Addr::UNSPECIFIED],
                },
            );
            inner.events.push(NetEvent::DhcpConfigured { dev });
        }

        (
            DhcpState::Requesting | DhcpState::Bound | DhcpState::Renewing | DhcpState::Rebinding,
            MSG_NAK,
        ) => {
            klog_warn!("dhcp: dev{} NAK in {} -> restarting discovery", dev.0, client.state.name());
            client.lease = None;
            client.offered = Ipv4Addr::UNSPECIFIED;
            client.state = DhcpState::Init;
            inner.devices.clear_config(dev);
            let _ = start(inner, dev, now_ms);
        }

        _ => {
            klog_debug!(
                "dhcp: dev{} unexpected message type {} in {}",
                dev.0,
                reply.msg_type,
                client.state.name()
            );
        }
    }
}

// =============================================================================
// Periodic task
// =============================================================================

/// Advance every client's timers: retransmissions, renewal, rebind, expiry.
pub(crate) fn task(inner: &mut StackInner, now_ms: u64) {
    // Collect due work first; acting on it needs `inner` mutably.
    enum Due {
        Discover(u32),
        RequestSelecting(u32, Ipv4Addr, Ipv4Addr),
        RequestUnicast(u32, DhcpConfig),
        RequestBroadcast(u32, DhcpConfig),
        Restart,
    }

    let mut work: Vec<(DevIndex, Due)> = Vec::new();

    for client in inner.dhcp.clients.iter_mut() {
        match client.state {
            DhcpState::Selecting => {
                if now_ms.saturating_sub(client.last_tx_ms) >= DHCP_RETRY_MS {
                    client.last_tx_ms = now_ms;
                    work.push((client.dev, Due::Discover(client.xid)));
                }
            }
            DhcpState::Requesting => {
                if now_ms.saturating_sub(client.last_tx_ms) >= DHCP_RETRY_MS {
                    client.last_tx_ms = now_ms;
                    let server = client.lease.map(|l| l.server_id).unwrap_or(Ipv4Addr::UNSPECIFIED);
                    work.push((
                        client.dev,
                        Due::RequestSelecting(client.xid, client.offered, server),
                    ));
                }
            }
            DhcpState::Bound => {
                let Some(lease) = client.lease else { continue };
                let elapsed_secs = now_ms.saturating_sub(lease.acquired_at_ms) / 1000;
                if elapsed_secs >= lease.renewal_secs as u64 {
                    client.state = DhcpState::Renewing;
                    client.last_tx_ms = now_ms;
                    klog_info!("dhcp: dev{} BOUND -> RENEWING", client.dev.0);
                    work.push((client.dev, Due::RequestUnicast(client.xid, lease)));
                }
            }
            DhcpState::Renewing => {
                let Some(lease) = client.lease else { continue };
                let elapsed_secs = now_ms.saturating_sub(lease.acquired_at_ms) / 1000;
                if elapsed_secs >= lease.rebind_secs as u64 {
                    client.state = DhcpState::Rebinding;
                    client.last_tx_ms = now_ms;
                    klog_info!("dhcp: dev{} RENEWING -> REBINDING", client.dev.0);
                    work.push((client.dev, Due::RequestBroadcast(client.xid, lease)));
                } else if now_ms.saturating_sub(client.last_tx_ms) >= DHCP_RETRY_MS {
                    client.last_tx_ms = now_ms;
                    work.push((client.dev, Due::RequestUnicast(client.xid, lease)));
                }
            }
            DhcpState::Rebinding => {
                let Some(lease) = client.lease else { continue };
                let elapsed_secs = now_ms.saturating_sub(lease.acquired_at_ms) / 1000;
                if elapsed_secs >= lease.lease_secs as u64 {
                    klog_warn!("dhcp: dev{} lease expired, restarting discovery", client.dev.0);
                    client.lease = None;
                    client.offered = Ipv4Addr::UNSPECIFIED;
                    client.state = DhcpState::Init;
                    work.push((client.dev, Due::Restart));
                } else if now_ms.saturating_sub(client.last_tx_ms) >= DHCP_RETRY_MS {
                    client.last_tx_ms = now_ms;
                    work.push((client.dev, Due::RequestBroadcast(client.xid, lease)));
                }
            }
            DhcpState::Init | DhcpState::InitReboot | DhcpState::Rebooting => {}
        }
    }

    for (dev, due) in work {
        match due {
            Due::Discover(xid) => send_discover(inner, dev, xid),
            Due::RequestSelecting(xid, requested, server) => {
                send_request_selecting(inner, dev, xid, requested, server)
            }
            Due::RequestUnicast(xid, lease) => {
                send_request_renewing(inner, dev, xid, &lease, false)
            }
            Due::RequestBroadcast(xid, lease) => {
                send_request_renewing(inner, dev, xid, &lease, true)
            }
            Due::Restart => {
                inner.devices.clear_config(dev);
                let _ = start(inner, dev, now_ms);
            }
        }
    }
}

/// Current state of a device's client (diagnostic and tests).
pub(crate) fn state(inner: &StackInner, dev: DevIndex) -> Option<DhcpState> {
    inner.dhcp.clients.iter().find(|c| c.dev == dev).map(|c| c.state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethernet::ETH_HEADER_LEN;
    use crate::ipv4::IPV4_HEADER_LEN;
    use crate::loopback::LoopbackDev;
    use crate::netdev::NetDevice;
    use crate::netdev::NetDeviceFlags;
    use crate::stack::StackInner;
    use crate::udp::UDP_HEADER_LEN;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    const MAC: MacAddr = MacAddr([0x52, 0x54, 0, 0x12, 0x34, 0x56]);

    struct Harness {
        inner: StackInner,
        dev: DevIndex,
        nic: Arc<LoopbackDev>,
    }

    /// Shared-queue device so tests can observe what the stack transmits.
    struct TapDev(Arc<LoopbackDev>);

    impl crate::netdev::NetDevice for TapDev {
        fn open(&self) {}
        fn close(&self) {}
        fn transmit(&self, pkt: crate::PacketBuf) -> Result<(), NetError> {
            self.0.transmit(pkt)
        }
        fn poll_rx(&self) -> Option<crate::PacketBuf> {
            None
        }
        fn mac(&self) -> MacAddr {
            MAC
        }
        fn mtu(&self) -> u16 {
            1500
        }
    }

    fn harness() -> Harness {
        let nic = Arc::new(LoopbackDev::with_mac(MAC));
        let mut inner = StackInner::new();
        let dev = inner
            .devices
            .register(
                "eth0",
                Box::new(TapDev(nic.clone())),
                NetDeviceFlags::UP | NetDeviceFlags::BROADCAST,
            )
            .unwrap();
        Harness { inner, dev, nic }
    }

    impl Harness {
        /// Pop one transmitted frame and return the BOOTP payload.
        fn pop_bootp(&self) -> Option<Vec<u8>> {
            let frame = self.nic.poll_rx()?;
            let off = ETH_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN;
            Some(frame.payload()[off..].to_vec())
        }

        fn client_xid(&self) -> u32 {
            self.inner
                .dhcp
                .clients
                .iter()
                .find(|c| c.dev == self.dev)
                .map(|c| c.xid)
                .unwrap()
        }
    }

    /// Server-side reply builder.
    fn build_reply(xid: u32, msg_type: u8, yiaddr: Ipv4Addr, extra: &[(u8, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        out.resize(BOOTP_HEADER_LEN, 0);
        out[0] = BOOTREPLY;
        out[1] = 1;
        out[2] = 6;
        out[4..8].copy_from_slice(&xid.to_be_bytes());
        out[16..20].copy_from_slice(yiaddr.as_bytes());
        out[236..240].copy_from_slice(&MAGIC_COOKIE);
        out.extend_from_slice(&[OPTION_MSG_TYPE, 1, msg_type]);
        for (code, data) in extra {
            out.push(*code);
            out.push(data.len() as u8);
            out.extend_from_slice(data);
        }
        out.push(OPTION_END);
        out
    }

    fn offer_and_ack(h: &mut Harness, lease_secs: u32, now_offer: u64, now_ack: u64) {
        let xid = h.client_xid();
        let server = Ipv4Addr([192, 168, 1, 1]);
        let offer = build_reply(
            xid,
            MSG_OFFER,
            Ipv4Addr([192, 168, 1, 50]),
            &[
                (OPTION_SERVER_ID, server.as_bytes()),
                (OPTION_SUBNET_MASK, &[255, 255, 255, 0]),
                (OPTION_ROUTER, server.as_bytes()),
                (OPTION_DNS, &[192, 168, 1, 1]),
                (OPTION_LEASE_TIME, &lease_secs.to_be_bytes()),
            ],
        );
        rx(&mut h.inner, h.dev, &offer, now_offer);
        assert_eq!(state(&h.inner, h.dev), Some(DhcpState::Requesting));

        let ack = build_reply(
            xid,
            MSG_ACK,
            Ipv4Addr([192, 168, 1, 50]),
            &[
                (OPTION_SERVER_ID, server.as_bytes()),
                (OPTION_SUBNET_MASK, &[255, 255, 255, 0]),
                (OPTION_ROUTER, server.as_bytes()),
                (OPTION_DNS, &[192, 168, 1, 1]),
                (OPTION_LEASE_TIME, &lease_secs.to_be_bytes()),
            ],
        );
        rx(&mut h.inner, h.dev, &ack, now_ack);
        assert_eq!(state(&h.inner, h.dev), Some(DhcpState::Bound));
    }

    #[test]
    fn discover_message_shape() {
        let mut buf = [0u8; DHCP_PACKET_MAX];
        let len = build_discover(MAC, 0xABCD1234, &mut buf);
        assert!(len > BOOTP_HEADER_LEN);
        assert_eq!(buf[0], BOOTREQUEST);
        assert_eq!(buf[1], 1);
        assert_eq!(buf[2], 6);
        assert_eq!(&buf[4..8], &0xABCD1234u32.to_be_bytes());
        assert_eq!(&buf[28..34], MAC.as_bytes());
        assert_eq!(&buf[236..240], &MAGIC_COOKIE);
        assert_eq!(buf[240], OPTION_MSG_TYPE);
        assert_eq!(buf[242], MSG_DISCOVER);
        assert_eq!(buf[len - 1], OPTION_END);
    }

    #[test]
    fn reply_parser_validates_xid_and_cookie() {
        let good = build_reply(7, MSG_OFFER, Ipv4Addr([10, 0, 0, 5]), &[]);
        assert!(parse_reply(&good, 7).is_some());
        assert!(parse_reply(&good, 8).is_none());

        let mut bad_cookie = good.clone();
        bad_cookie[236] = 0;
        assert!(parse_reply(&bad_cookie, 7).is_none());

        let mut not_reply = good.clone();
        not_reply[0] = BOOTREQUEST;
        assert!(parse_reply(&not_reply, 7).is_none());

        assert!(parse_reply(&good[..100], 7).is_none());
    }

    #[test]
    fn options_walk_handles_pad_and_truncation() {
        let mut region = Vec::new();
        region.push(OPTION_PAD);
        region.extend_from_slice(&[OPTION_LEASE_TIME, 4, 0, 0, 1, 44]);
        region.extend_from_slice(&[OPTION_RENEWAL_TIME, 4, 0, 0, 0, 99]);
        region.push(OPTION_END);
        let opts = parse_options(&region);
        assert_eq!(opts.lease_secs, 300);
        assert_eq!(opts.renewal_secs, 99);

        // Truncated option must end the walk without panicking.
        let truncated = [OPTION_LEASE_TIME, 4, 0, 0];
        let opts = parse_options(&truncated);
        assert_eq!(opts.lease_secs, 0);
    }

    #[test]
    fn full_acquisition_applies_config() {
        let mut h = harness();
        start(&mut h.inner, h.dev, 0).unwrap();
        assert_eq!(state(&h.inner, h.dev), Some(DhcpState::Selecting));

        // DISCOVER went out.
        let discover = h.pop_bootp().unwrap();
        assert_eq!(discover[0], BOOTREQUEST);
        assert_eq!(parse_options(&discover[BOOTP_HEADER_LEN..]).message_type, MSG_DISCOVER);

        offer_and_ack(&mut h, 3600, 100, 200);

        // REQUEST went out between OFFER and ACK.
        let request = h.pop_bootp().unwrap();
        assert_eq!(parse_options(&request[BOOTP_HEADER_LEN..]).message_type, MSG_REQUEST);

        let cfg = h.inner.devices.config(h.dev).unwrap();
        assert_eq!(cfg.addr, Ipv4Addr([192, 168, 1, 50]));
        assert_eq!(cfg.netmask, Ipv4Addr([255, 255, 255, 0]));
        assert_eq!(cfg.gateway, Ipv4Addr([192, 168, 1, 1]));

        let lease = config(&h.inner, h.dev).unwrap();
        assert_eq!(lease.lease_secs, 3600);
        assert_eq!(lease.renewal_secs, 1800);
        assert_eq!(lease.rebind_secs, 3150);
        assert!(h
            .inner
            .events
            .iter()
            .any(|e| matches!(e, NetEvent::DhcpConfigured { .. })));
    }

    #[test]
    fn lease_timing_drives_renewal_then_rebind_then_expiry() {
        let mut h = harness();
        start(&mut h.inner, h.dev, 0).unwrap();
        h.pop_bootp();
        offer_and_ack(&mut h, 100, 100, 1000);
        h.pop_bootp();

        let lease = config(&h.inner, h.dev).unwrap();
        assert_eq!(lease.renewal_secs, 50);
        assert_eq!(lease.rebind_secs, 87);

        // Before the renewal deadline nothing happens.
        task(&mut h.inner, 1000 + 49_000);
        assert_eq!(state(&h.inner, h.dev), Some(DhcpState::Bound));
        assert!(h.pop_bootp().is_none());

        // At t1 the client unicasts a REQUEST and enters RENEWING.
        task(&mut h.inner, 1000 + 50_000);
        assert_eq!(state(&h.inner, h.dev), Some(DhcpState::Renewing));
        let renew = h.pop_bootp().unwrap();
        assert_eq!(parse_options(&renew[BOOTP_HEADER_LEN..]).message_type, MSG_REQUEST);
        // ciaddr carries the held address; no broadcast flag.
        assert_eq!(&renew[12..16], &[192, 168, 1, 50]);
        assert_eq!(u16::from_be_bytes([renew[10], renew[11]]), 0);

        // At t2 with no answer the client broadcasts and enters REBINDING.
        task(&mut h.inner, 1000 + 87_000);
        assert_eq!(state(&h.inner, h.dev), Some(DhcpState::Rebinding));
        let rebind = h.pop_bootp().unwrap();
        assert_eq!(u16::from_be_bytes([rebind[10], rebind[11]]), FLAGS_BROADCAST);

        // Full expiry clears the interface and restarts discovery.
        task(&mut h.inner, 1000 + 100_000);
        assert_eq!(state(&h.inner, h.dev), Some(DhcpState::Selecting));
        assert!(h.inner.devices.config(h.dev).is_none());
        let rediscover = h.pop_bootp().unwrap();
        assert_eq!(
            parse_options(&rediscover[BOOTP_HEADER_LEN..]).message_type,
            MSG_DISCOVER
        );
    }

    #[test]
    fn renewal_ack_rebinds_the_clock() {
        let mut h = harness();
        start(&mut h.inner, h.dev, 0).unwrap();
        h.pop_bootp();
        offer_and_ack(&mut h, 100, 0, 0);
        h.pop_bootp();

        task(&mut h.inner, 50_000);
        assert_eq!(state(&h.inner, h.dev), Some(DhcpState::Renewing));
        h.pop_bootp();

        // Server extends the lease: back to BOUND with a fresh epoch.
        let xid = h.client_xid();
        let server = Ipv4Addr([192, 168, 1, 1]);
        let ack = build_reply(
            xid,
            MSG_ACK,
            Ipv4Addr([192, 168, 1, 50]),
            &[
                (OPTION_SERVER_ID, server.as_bytes()),
                (OPTION_LEASE_TIME, &100u32.to_be_bytes()),
            ],
        );
        rx(&mut h.inner, h.dev, &ack, 55_000);
        assert_eq!(state(&h.inner, h.dev), Some(DhcpState::Bound));
        let lease = config(&h.inner, h.dev).unwrap();
        assert_eq!(lease.acquired_at_ms, 55_000);
        // Address and mask survive an ACK that omits them.
        assert_eq!(lease.addr, Ipv4Addr([192, 168, 1, 50]));
        assert_eq!(lease.netmask, Ipv4Addr([255, 255, 255, 0]));
    }

    #[test]
    fn nak_restarts_discovery() {
        let mut h = harness();
        start(&mut h.inner, h.dev, 0).unwrap();
        h.pop_bootp();
        offer_and_ack(&mut h, 600, 0, 0);
        h.pop_bootp();

        let nak = build_reply(h.client_xid(), MSG_NAK, Ipv4Addr::UNSPECIFIED, &[]);
        rx(&mut h.inner, h.dev, &nak, 10_000);

        assert_eq!(state(&h.inner, h.dev), Some(DhcpState::Selecting));
        assert!(h.inner.devices.config(h.dev).is_none());
        assert!(config(&h.inner, h.dev).is_none());
        // A fresh DISCOVER is on the wire.
        let rediscover = h.pop_bootp().unwrap();
        assert_eq!(
            parse_options(&rediscover[BOOTP_HEADER_LEN..]).message_type,
            MSG_DISCOVER
        );
    }

    #[test]
    fn selecting_retransmits_discover_on_timeout() {
        let mut h = harness();
        start(&mut h.inner, h.dev, 0).unwrap();
        h.pop_bootp();

        // No reply after 5 s: DISCOVER again.  Before that: silence.
        task(&mut h.inner, DHCP_RETRY_MS - 1);
        assert!(h.pop_bootp().is_none());
        task(&mut h.inner, DHCP_RETRY_MS);
        let again = h.pop_bootp().unwrap();
        assert_eq!(
            parse_options(&again[BOOTP_HEADER_LEN..]).message_type,
            MSG_DISCOVER
        );
    }

    #[test]
    fn release_only_from_bound() {
        let mut h = harness();
        start(&mut h.inner, h.dev, 0).unwrap();
        h.pop_bootp();
        assert_eq!(
            release(&mut h.inner, h.dev, 0).unwrap_err(),
            NetError::InvalidState
        );

        offer_and_ack(&mut h, 600, 0, 0);
        h.pop_bootp();
        release(&mut h.inner, h.dev, 1000).unwrap();
        assert_eq!(state(&h.inner, h.dev), Some(DhcpState::Init));
        assert!(h.inner.devices.config(h.dev).is_none());

        let rel = h.pop_bootp().unwrap();
        assert_eq!(parse_options(&rel[BOOTP_HEADER_LEN..]).message_type, MSG_RELEASE);
        // ciaddr holds the released address.
        assert_eq!(&rel[12..16], &[192, 168, 1, 50]);
    }
}

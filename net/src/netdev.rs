//! Network device abstraction: `NetDevice` trait, flags, statistics, and the
//! device registry.
//!
//! This module establishes the boundary between network drivers (which move
//! bytes) and the protocol stack (which understands protocols).  Only
//! [`PacketBuf`] crosses this boundary.
//!
//! Drivers implement [`NetDevice`] and register once at probe time; the
//! returned [`DevIndex`] is the stable handle every other layer uses.
//! Devices live for the kernel's lifetime — there is no unregistration.
//!
//! The registry itself carries per-device state the driver does not own:
//! administrative flags, the IPv4 interface configuration (written by DHCP
//! or static setup), and stack-side statistics.  All trait methods take
//! `&self`; drivers use interior mutability for their rings and counters.

extern crate alloc;

use alloc::boxed::Box;
use core::fmt;

use bitflags::bitflags;

use super::packetbuf::PacketBuf;
use super::types::{DevIndex, Ipv4Addr, MacAddr, NetError};

/// Maximum number of simultaneously registered network devices.
pub const MAX_DEVICES: usize = 8;

// =============================================================================
// NetDevice trait
// =============================================================================

/// Abstraction for a network device (NIC, loopback, etc.).
///
/// All methods take `&self`; implementations use interior mutability for
/// their internal state.
pub trait NetDevice: Send + Sync {
    /// Bring the link up (enable RX/TX rings, start interrupt delivery).
    fn open(&self);

    /// Bring the link down (drain queues, disable interrupt delivery).
    fn close(&self);

    /// Transmit one frame.  The packet is consumed (moved into the driver's
    /// TX ring).
    ///
    /// Returns `Err(NoBufferSpace)` if the TX ring is full.
    fn transmit(&self, pkt: PacketBuf) -> Result<(), NetError>;

    /// Drain one received frame from the RX ring, if any is pending.
    ///
    /// Polling-mode drivers queue frames internally; interrupt-driven
    /// drivers may always return `None` here and push frames into
    /// `NetStack::receive_frame` directly.
    fn poll_rx(&self) -> Option<PacketBuf>;

    /// Hardware MAC address.
    fn mac(&self) -> MacAddr;

    /// Maximum transmission unit (payload bytes, excluding Ethernet header).
    fn mtu(&self) -> u16;
}

// =============================================================================
// NetDeviceFlags
// =============================================================================

bitflags! {
    /// Administrative and capability flags for a registered device.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NetDeviceFlags: u32 {
        /// Interface is administratively up.
        const UP          = 1 << 0;
        /// Loopback device — frames are delivered back locally.
        const LOOPBACK    = 1 << 1;
        /// Device can send/receive link-level broadcast.
        const BROADCAST   = 1 << 2;
        /// Device can receive link-level multicast.
        const MULTICAST   = 1 << 3;
        /// Accept frames regardless of destination MAC.
        const PROMISCUOUS = 1 << 4;
    }
}

impl Default for NetDeviceFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for NetDeviceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "(none)");
        }
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                write!(f, " | ")?;
            }
            write!(f, "{name}")?;
            first = false;
        }
        Ok(())
    }
}

// =============================================================================
// NetDeviceStats
// =============================================================================

/// Cumulative per-device statistics.
///
/// Counters are monotonically increasing.  The stack increments the RX/TX
/// counters as frames cross the device boundary and the `dropped` counters
/// on demux/validation failures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetDeviceStats {
    /// Total packets received successfully.
    pub rx_packets: u64,
    /// Total packets transmitted successfully.
    pub tx_packets: u64,
    /// Total bytes received.
    pub rx_bytes: u64,
    /// Total bytes transmitted.
    pub tx_bytes: u64,
    /// RX errors (malformed frame, bad checksum, ...).
    pub rx_errors: u64,
    /// TX errors (ring full, driver failure, ...).
    pub tx_errors: u64,
    /// Packets dropped on RX (no matching socket, not for us, ...).
    pub rx_dropped: u64,
    /// Packets dropped on TX.
    pub tx_dropped: u64,
}

impl NetDeviceStats {
    /// Create a zeroed stats snapshot.
    pub const fn new() -> Self {
        Self {
            rx_packets: 0,
            tx_packets: 0,
            rx_bytes: 0,
            tx_bytes: 0,
            rx_errors: 0,
            tx_errors: 0,
            rx_dropped: 0,
            tx_dropped: 0,
        }
    }

    /// Total packets (rx + tx).
    #[inline]
    pub const fn total_packets(&self) -> u64 {
        self.rx_packets + self.tx_packets
    }

    /// Total errors (rx + tx).
    #[inline]
    pub const fn total_errors(&self) -> u64 {
        self.rx_errors + self.tx_errors
    }
}

impl fmt::Display for NetDeviceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx: {} pkts/{} bytes, tx: {} pkts/{} bytes, err: {}/{}, drop: {}/{}",
            self.rx_packets,
            self.rx_bytes,
            self.tx_packets,
            self.tx_bytes,
            self.rx_errors,
            self.tx_errors,
            self.rx_dropped,
            self.tx_dropped
        )
    }
}

// =============================================================================
// IfaceConfig
// =============================================================================

/// Per-interface IPv4 configuration.
///
/// Written by the DHCP client when a lease is obtained, or by static
/// configuration.  One config per registered device.
#[derive(Clone, Copy)]
pub struct IfaceConfig {
    /// IPv4 address assigned to this interface.
    pub addr: Ipv4Addr,
    /// Subnet mask (e.g. `255.255.255.0`).
    pub netmask: Ipv4Addr,
    /// Default gateway for this interface (`UNSPECIFIED` if none).
    pub gateway: Ipv4Addr,
    /// DNS server addresses (up to 2; unused slots are `UNSPECIFIED`).
    pub dns: [Ipv4Addr; 2],
}

impl IfaceConfig {
    /// Compute the directed broadcast address: `addr | !netmask`.
    #[inline]
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from_u32_be(self.addr.to_u32_be() | !self.netmask.to_u32_be())
    }

    /// `true` if `ip` is on the directly connected subnet.
    #[inline]
    pub fn is_local(&self, ip: Ipv4Addr) -> bool {
        Ipv4Addr::in_subnet(ip, self.addr, self.netmask)
    }

    /// Number of leading 1-bits in the netmask (prefix length).
    #[inline]
    pub fn prefix_len(&self) -> u8 {
        self.netmask.to_u32_be().leading_ones() as u8
    }
}

impl fmt::Debug for IfaceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IfaceConfig {{ {}/{} gw {} }}",
            self.addr,
            self.prefix_len(),
            self.gateway
        )
    }
}

// =============================================================================
// DeviceRegistry
// =============================================================================

/// One occupied registry slot.
struct DeviceSlot {
    name: &'static str,
    dev: Box<dyn NetDevice>,
    flags: NetDeviceFlags,
    config: Option<IfaceConfig>,
    stats: NetDeviceStats,
}

/// Fixed-slot storage for registered network devices.
///
/// The registry is plain data owned by the stack context; the stack's single
/// lock serializes all access.  Registration assigns the next free
/// [`DevIndex`]; devices are never unregistered.
pub struct DeviceRegistry {
    slots: [Option<DeviceSlot>; MAX_DEVICES],
    default_dev: Option<DevIndex>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_DEVICES],
            default_dev: None,
        }
    }

    /// Register a network device and obtain its stable [`DevIndex`].
    ///
    /// If `flags` contains [`UP`](NetDeviceFlags::UP), the device's
    /// [`open`](NetDevice::open) is invoked.  The first non-loopback device
    /// registered becomes the default device.
    ///
    /// Returns `Err(NoBufferSpace)` if all slots are occupied.
    pub fn register(
        &mut self,
        name: &'static str,
        dev: Box<dyn NetDevice>,
        flags: NetDeviceFlags,
    ) -> Result<DevIndex, NetError> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                if flags.contains(NetDeviceFlags::UP) {
                    dev.open();
                }
                *slot = Some(DeviceSlot {
                    name,
                    dev,
                    flags,
                    config: None,
                    stats: NetDeviceStats::new(),
                });
                let index = DevIndex(i);
                if self.default_dev.is_none() && !flags.contains(NetDeviceFlags::LOOPBACK) {
                    self.default_dev = Some(index);
                }
                oxbow_lib::klog_info!("netdev: registered {} as dev{} [{}]", name, i, flags);
                return Ok(index);
            }
        }
        Err(NetError::NoBufferSpace)
    }

    fn slot(&self, dev: DevIndex) -> Option<&DeviceSlot> {
        self.slots.get(dev.0)?.as_ref()
    }

    fn slot_mut(&mut self, dev: DevIndex) -> Option<&mut DeviceSlot> {
        self.slots.get_mut(dev.0)?.as_mut()
    }

    /// Number of registered devices.
    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Device name, for diagnostics.
    pub fn name(&self, dev: DevIndex) -> Option<&'static str> {
        self.slot(dev).map(|s| s.name)
    }

    /// Driver object for a registered device.
    pub fn device(&self, dev: DevIndex) -> Option<&dyn NetDevice> {
        self.slot(dev).map(|s| &*s.dev)
    }

    /// MAC address of a registered device.
    pub fn mac(&self, dev: DevIndex) -> Option<MacAddr> {
        self.slot(dev).map(|s| s.dev.mac())
    }

    /// MTU of a registered device.
    pub fn mtu(&self, dev: DevIndex) -> Option<u16> {
        self.slot(dev).map(|s| s.dev.mtu())
    }

    /// Flag set of a registered device.
    pub fn flags(&self, dev: DevIndex) -> Option<NetDeviceFlags> {
        self.slot(dev).map(|s| s.flags)
    }

    /// Administratively bring a device up or down.
    pub fn set_up(&mut self, dev: DevIndex, up: bool) -> Result<(), NetError> {
        let slot = self.slot_mut(dev).ok_or(NetError::NotFound)?;
        if up && !slot.flags.contains(NetDeviceFlags::UP) {
            slot.dev.open();
            slot.flags.insert(NetDeviceFlags::UP);
        } else if !up && slot.flags.contains(NetDeviceFlags::UP) {
            slot.dev.close();
            slot.flags.remove(NetDeviceFlags::UP);
        }
        Ok(())
    }

    /// Statistics snapshot for a device.
    pub fn stats(&self, dev: DevIndex) -> Option<NetDeviceStats> {
        self.slot(dev).map(|s| s.stats)
    }

    /// Mutable statistics for the data path.
    pub(crate) fn stats_mut(&mut self, dev: DevIndex) -> Option<&mut NetDeviceStats> {
        self.slot_mut(dev).map(|s| &mut s.stats)
    }

    // -------------------------------------------------------------------------
    // Interface configuration
    // -------------------------------------------------------------------------

    /// Set (or replace) the IPv4 configuration of a device.
    pub fn configure(&mut self, dev: DevIndex, config: IfaceConfig) -> Result<(), NetError> {
        let slot = self.slot_mut(dev).ok_or(NetError::NotFound)?;
        oxbow_lib::klog_info!(
            "netdev: dev{} configured {}/{} gw {}",
            dev.0,
            config.addr,
            config.prefix_len(),
            config.gateway
        );
        slot.config = Some(config);
        Ok(())
    }

    /// Remove the IPv4 configuration of a device (lease expiry).
    pub fn clear_config(&mut self, dev: DevIndex) {
        if let Some(slot) = self.slot_mut(dev) {
            slot.config = None;
            oxbow_lib::klog_info!("netdev: dev{} configuration cleared", dev.0);
        }
    }

    /// IPv4 configuration of a device, if any.
    pub fn config(&self, dev: DevIndex) -> Option<IfaceConfig> {
        self.slot(dev)?.config
    }

    /// Configured address of a device, if any.
    pub fn addr(&self, dev: DevIndex) -> Option<Ipv4Addr> {
        self.config(dev).map(|c| c.addr)
    }

    // -------------------------------------------------------------------------
    // Selection
    // -------------------------------------------------------------------------

    /// Nominate the default device used when no subnet matches.
    pub fn set_default(&mut self, dev: DevIndex) -> Result<(), NetError> {
        if self.slot(dev).is_none() {
            return Err(NetError::NotFound);
        }
        self.default_dev = Some(dev);
        Ok(())
    }

    /// The current default device.
    pub fn default_dev(&self) -> Option<DevIndex> {
        self.default_dev
    }

    /// Pick the outgoing device for `dst`: first UP device whose subnet
    /// contains `dst`, else the default device.
    pub fn select_for(&self, dst: Ipv4Addr) -> Option<DevIndex> {
        if dst.is_loopback() {
            for (i, slot) in self.slots.iter().enumerate() {
                if let Some(s) = slot
                    && s.flags.contains(NetDeviceFlags::UP | NetDeviceFlags::LOOPBACK)
                {
                    return Some(DevIndex(i));
                }
            }
        }
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(s) = slot
                && s.flags.contains(NetDeviceFlags::UP)
                && let Some(cfg) = s.config
                && cfg.is_local(dst)
            {
                return Some(DevIndex(i));
            }
        }
        self.default_dev
    }

    /// Local-delivery decision for a received datagram on `dev`.
    ///
    /// Accepts the device's exact address, the limited broadcast address,
    /// and the device's subnet broadcast.  An unconfigured device accepts
    /// only limited broadcast (the DHCP bootstrap case).
    pub fn is_local_delivery(&self, dev: DevIndex, dst: Ipv4Addr) -> bool {
        if dst.is_broadcast() {
            return true;
        }
        match self.config(dev) {
            Some(cfg) => dst == cfg.addr || dst == cfg.broadcast(),
            None => false,
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

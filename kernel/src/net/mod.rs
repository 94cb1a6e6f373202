//! Network stack: packet reception and dispatch.
//!
//! Ethernet demux into ARP and IPv4, an ARP cache with reply generation,
//! the IPv4 acceptance filter, ICMP echo, and UDP port demultiplexing.
//! The receive path is called from the NIC driver's IRQ handler with
//! interrupts disabled: everything it touches is behind IRQ-safe spinlocks
//! and it never blocks.

pub mod arp;
pub mod checksum;
pub mod ethernet;
pub mod icmp;
pub mod ip;
pub mod udp;

use alloc::vec::Vec;

use crate::{
    error::{KernelError, KernelResult},
    sync::IrqSpinLock,
};

/// MAC address (6 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: Self = Self([0xFF; 6]);
    pub const ZERO: Self = Self([0x00; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl core::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// IPv4 address (4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ipv4Address(pub [u8; 4]);

impl Ipv4Address {
    pub const BROADCAST: Self = Self([255, 255, 255, 255]);
    pub const UNSPECIFIED: Self = Self([0, 0, 0, 0]);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self([a, b, c, d])
    }

    pub fn from_u32(addr: u32) -> Self {
        Self(addr.to_be_bytes())
    }

    pub fn to_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }

    /// Same subnet as `other` under `netmask`?
    pub fn same_subnet(&self, other: Ipv4Address, netmask: Ipv4Address) -> bool {
        (self.to_u32() & netmask.to_u32()) == (other.to_u32() & netmask.to_u32())
    }
}

impl core::fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// A length-prefixed packet buffer. Ownership moves from the driver's RX
/// path into the dispatcher and ends there (or returns to the driver pool).
#[derive(Clone)]
pub struct Packet {
    data: Vec<u8>,
    length: usize,
}

impl Packet {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            length: bytes.len(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.length]
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

bitflags::bitflags! {
    /// Interface state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterfaceFlags: u32 {
        const UP        = 1 << 0;
        const BROADCAST = 1 << 1;
        const LOOPBACK  = 1 << 2;
    }
}

/// Per-interface counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rx_dropped: u64,
}

/// Frame transmit hook provided by the NIC driver.
pub type TxHandler = fn(&[u8]) -> KernelResult<()>;

/// A network interface.
pub struct NetInterface {
    pub name: &'static str,
    pub mac: MacAddress,
    pub ip: Ipv4Address,
    pub netmask: Ipv4Address,
    pub gateway: Ipv4Address,
    pub dns: Ipv4Address,
    pub flags: InterfaceFlags,
    tx: TxHandler,
    stats: NetworkStats,
}

impl NetInterface {
    pub fn new(name: &'static str, mac: MacAddress, tx: TxHandler) -> Self {
        Self {
            name,
            mac,
            ip: Ipv4Address::UNSPECIFIED,
            netmask: Ipv4Address::UNSPECIFIED,
            gateway: Ipv4Address::UNSPECIFIED,
            dns: Ipv4Address::UNSPECIFIED,
            flags: InterfaceFlags::UP | InterfaceFlags::BROADCAST,
            tx,
            stats: NetworkStats::default(),
        }
    }
}

/// Copy-out view of the default interface's addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub mac: MacAddress,
    pub ip: Ipv4Address,
    pub netmask: Ipv4Address,
    pub gateway: Ipv4Address,
    pub dns: Ipv4Address,
}

/// Minimum Ethernet frame length on the wire (without FCS); shorter frames
/// are zero-padded on transmit.
pub const MIN_FRAME_LEN: usize = 60;

struct InterfaceTable {
    interfaces: Vec<NetInterface>,
    /// Index of the default interface.
    default: usize,
}

static INTERFACES: IrqSpinLock<InterfaceTable> = IrqSpinLock::new(InterfaceTable {
    interfaces: Vec::new(),
    default: 0,
});

/// Register an interface; the first one becomes the default.
pub fn register_interface(iface: NetInterface) -> usize {
    let mut table = INTERFACES.lock();
    log::info!(target: "net", "interface {} ({})", iface.name, iface.mac);
    table.interfaces.push(iface);
    table.interfaces.len() - 1
}

/// Make an interface the default route.
pub fn set_default_interface(index: usize) -> KernelResult<()> {
    let mut table = INTERFACES.lock();
    if index >= table.interfaces.len() {
        return Err(KernelError::NotFound {
            resource: "interface",
            id: index as u64,
        });
    }
    table.default = index;
    Ok(())
}

/// Configure the default interface's IPv4 addressing (manual or DHCP-fed).
pub fn configure_default(
    ip: Ipv4Address,
    netmask: Ipv4Address,
    gateway: Ipv4Address,
    dns: Ipv4Address,
) -> KernelResult<()> {
    let mut table = INTERFACES.lock();
    let default = table.default;
    let iface = table
        .interfaces
        .get_mut(default)
        .ok_or(KernelError::NotInitialized { subsystem: "net" })?;
    iface.ip = ip;
    iface.netmask = netmask;
    iface.gateway = gateway;
    iface.dns = dns;
    log::info!(target: "net", "{}: {} mask {} gw {}", iface.name, ip, netmask, gateway);
    Ok(())
}

/// Addressing snapshot of the default interface.
pub fn default_interface() -> Option<InterfaceInfo> {
    let table = INTERFACES.lock();
    table.interfaces.get(table.default).map(|i| InterfaceInfo {
        mac: i.mac,
        ip: i.ip,
        netmask: i.netmask,
        gateway: i.gateway,
        dns: i.dns,
    })
}

/// Transmit a frame on the default interface, padding to the Ethernet
/// minimum.
pub fn transmit(frame: &[u8]) -> KernelResult<()> {
    let (tx, padded_len) = {
        let mut table = INTERFACES.lock();
        let default = table.default;
        let iface = table
            .interfaces
            .get_mut(default)
            .ok_or(KernelError::NotInitialized { subsystem: "net" })?;
        iface.stats.packets_sent += 1;
        iface.stats.bytes_sent += frame.len().max(MIN_FRAME_LEN) as u64;
        (iface.tx, frame.len().max(MIN_FRAME_LEN))
    };

    if padded_len > frame.len() {
        let mut padded = Vec::with_capacity(padded_len);
        padded.extend_from_slice(frame);
        padded.resize(padded_len, 0);
        tx(&padded)
    } else {
        tx(frame)
    }
}

/// Driver RX entry point: account the packet and hand it to the Ethernet
/// demultiplexer. Runs in IRQ context.
pub fn rx_packet(data: &[u8]) {
    let our_mac = {
        let mut table = INTERFACES.lock();
        let default = table.default;
        match table.interfaces.get_mut(default) {
            Some(iface) => {
                iface.stats.packets_received += 1;
                iface.stats.bytes_received += data.len() as u64;
                iface.mac
            }
            None => return,
        }
    };

    if let Err(e) = ethernet::dispatch_frame(data, our_mac) {
        count_rx_drop();
        log::debug!(target: "net", "rx drop: {}", e);
    }
}

/// Bump the default interface's drop counter.
pub(crate) fn count_rx_drop() {
    let mut table = INTERFACES.lock();
    let default = table.default;
    if let Some(iface) = table.interfaces.get_mut(default) {
        iface.stats.rx_dropped += 1;
    }
}

/// Counters of the default interface.
pub fn stats() -> NetworkStats {
    let table = INTERFACES.lock();
    table
        .interfaces
        .get(table.default)
        .map(|i| i.stats)
        .unwrap_or_default()
}

/// Bring up the stack. Interfaces register as their drivers probe.
pub fn init() {
    log::info!(target: "net", "network stack ready");
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_address_helpers() {
        let addr = Ipv4Address::new(192, 168, 1, 7);
        assert_eq!(addr.to_u32(), 0xC0A80107);
        assert_eq!(Ipv4Address::from_u32(0xC0A80107), addr);
        assert!(Ipv4Address::UNSPECIFIED.is_unspecified());

        let mask = Ipv4Address::new(255, 255, 255, 0);
        assert!(addr.same_subnet(Ipv4Address::new(192, 168, 1, 200), mask));
        assert!(!addr.same_subnet(Ipv4Address::new(192, 168, 2, 1), mask));
    }

    #[test]
    fn packet_wraps_bytes() {
        let pkt = Packet::from_bytes(b"hello");
        assert_eq!(pkt.data(), b"hello");
        assert_eq!(pkt.len(), 5);
        assert!(!pkt.is_empty());
    }

    #[test]
    fn short_frames_are_padded_on_transmit() {
        let _net = testutil::fresh_net();
        transmit(&[0xAA; 20]).unwrap();
        let frames = testutil::take_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), MIN_FRAME_LEN);
        assert_eq!(&frames[0][..20], &[0xAA; 20]);
        assert!(frames[0][20..].iter().all(|&b| b == 0));
    }

    #[test]
    fn long_frames_pass_through() {
        let _net = testutil::fresh_net();
        let frame = [0x55u8; 200];
        transmit(&frame).unwrap();
        let frames = testutil::take_frames();
        assert_eq!(frames[0].len(), 200);
    }
}

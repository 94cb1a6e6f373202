//! IPv4 layer.
//!
//! Header parse/build, the receive acceptance filter, and the transmit path
//! (routing via the ARP cache, header checksum, DF + TTL 64 policy). The
//! header checksum is not re-verified on receive -- the emulated NICs this
//! kernel runs against deliver correct checksums -- but is always computed
//! on send.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};

use super::{arp, checksum, ethernet, Ipv4Address, MacAddress};

/// IP protocol numbers the stack dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IpProtocol {
    Icmp = 1,
    Tcp = 6,
    Udp = 17,
}

/// IPv4 header (20 bytes, options unsupported).
#[derive(Debug, Clone)]
pub struct Ipv4Header {
    pub version: u8,
    pub ihl: u8,
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags: u8,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: Ipv4Address,
    pub destination: Ipv4Address,
}

/// Don't-fragment flag (bit 1 of the flags field).
pub const FLAG_DF: u8 = 0b010;

/// Default TTL for outbound packets.
pub const DEFAULT_TTL: u8 = 64;

impl Ipv4Header {
    pub const MIN_SIZE: usize = 20;

    pub fn new(src: Ipv4Address, dst: Ipv4Address, protocol: IpProtocol) -> Self {
        Self {
            version: 4,
            ihl: 5,
            tos: 0,
            total_length: 0,
            identification: 0,
            flags: FLAG_DF,
            fragment_offset: 0,
            ttl: DEFAULT_TTL,
            protocol: protocol as u8,
            checksum: 0,
            source: src,
            destination: dst,
        }
    }

    pub fn to_bytes(&self) -> [u8; 20] {
        let mut bytes = [0u8; 20];
        bytes[0] = (self.version << 4) | self.ihl;
        bytes[1] = self.tos;
        bytes[2..4].copy_from_slice(&self.total_length.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.identification.to_be_bytes());
        bytes[6] = (self.flags << 5) | ((self.fragment_offset >> 8) as u8);
        bytes[7] = (self.fragment_offset & 0xFF) as u8;
        bytes[8] = self.ttl;
        bytes[9] = self.protocol;
        bytes[10..12].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.source.0);
        bytes[16..20].copy_from_slice(&self.destination.0);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> KernelResult<Self> {
        if bytes.len() < Self::MIN_SIZE {
            return Err(KernelError::PacketRejected {
                reason: "ip header too short",
            });
        }
        let version = bytes[0] >> 4;
        if version != 4 {
            return Err(KernelError::PacketRejected {
                reason: "not ipv4",
            });
        }

        Ok(Self {
            version,
            ihl: bytes[0] & 0x0F,
            tos: bytes[1],
            total_length: u16::from_be_bytes([bytes[2], bytes[3]]),
            identification: u16::from_be_bytes([bytes[4], bytes[5]]),
            flags: bytes[6] >> 5,
            fragment_offset: u16::from_be_bytes([bytes[6] & 0x1F, bytes[7]]),
            ttl: bytes[8],
            protocol: bytes[9],
            checksum: u16::from_be_bytes([bytes[10], bytes[11]]),
            source: Ipv4Address([bytes[12], bytes[13], bytes[14], bytes[15]]),
            destination: Ipv4Address([bytes[16], bytes[17], bytes[18], bytes[19]]),
        })
    }

    /// Fill the checksum field: one's-complement sum over the header with
    /// the checksum field cleared.
    pub fn fill_checksum(&mut self) {
        self.checksum = 0;
        self.checksum = checksum::internet_checksum(&self.to_bytes());
    }
}

/// Outbound identification counter.
static NEXT_IDENT: AtomicU32 = AtomicU32::new(1);

/// A rejected packet is logged exactly once; after that the filter drops
/// silently (counting).
static REJECT_LOGGED: AtomicBool = AtomicBool::new(false);

/// The receive acceptance filter.
///
/// Accepts packets addressed to us, limited broadcasts, and -- while the
/// interface is still unconfigured (0.0.0.0, waiting for DHCP) -- anything,
/// so the DHCP offer can arrive at all.
pub fn should_accept(dst: Ipv4Address, our_ip: Ipv4Address, protocol: u8) -> bool {
    if dst == our_ip {
        return true;
    }
    if dst == Ipv4Address::BROADCAST {
        return true;
    }
    if our_ip.is_unspecified() {
        return true;
    }
    if protocol == IpProtocol::Udp as u8 && our_ip.is_unspecified() {
        return true;
    }
    false
}

/// Process a received IPv4 packet (Ethernet payload).
///
/// Runs in IRQ context. Rejected packets are dropped, never fatal.
pub fn process_packet(data: &[u8]) -> KernelResult<()> {
    let header = Ipv4Header::from_bytes(data)?;

    let header_len = (header.ihl as usize) * 4;
    let total_len = header.total_length as usize;
    if header_len < Ipv4Header::MIN_SIZE || total_len < header_len || data.len() < total_len {
        return Err(KernelError::PacketRejected {
            reason: "ip length fields inconsistent",
        });
    }

    let our_ip = super::default_interface()
        .map(|i| i.ip)
        .unwrap_or(Ipv4Address::UNSPECIFIED);

    if !should_accept(header.destination, our_ip, header.protocol) {
        if !REJECT_LOGGED.swap(true, Ordering::Relaxed) {
            log::info!(
                target: "net",
                "ip: dropping packet for {} (not ours)",
                header.destination
            );
        }
        super::count_rx_drop();
        return Ok(());
    }

    // Trim link-layer padding: upper layers must only see the datagram.
    let payload = &data[header_len..total_len];

    match header.protocol {
        p if p == IpProtocol::Icmp as u8 => super::icmp::process_packet(header.source, payload),
        p if p == IpProtocol::Udp as u8 => {
            super::udp::process_packet(header.source, header.destination, payload)
        }
        _ => {
            // TCP and everything else: no handler in the core, drop.
            super::count_rx_drop();
            Ok(())
        }
    }
}

/// Send an IPv4 packet to `dst`.
///
/// Fills total length, an incrementing identification, DF, TTL 64, the
/// interface source address, and the header checksum. The next hop is `dst`
/// itself on the local subnet, otherwise the gateway; an ARP miss sends a
/// request and fails with `WouldBlock` for the caller to retry.
pub fn send(dst: Ipv4Address, protocol: IpProtocol, payload: &[u8]) -> KernelResult<()> {
    let iface = super::default_interface().ok_or(KernelError::NotInitialized {
        subsystem: "net",
    })?;

    let dst_mac = if dst == Ipv4Address::BROADCAST {
        MacAddress::BROADCAST
    } else {
        let next_hop = if dst.same_subnet(iface.ip, iface.netmask) || iface.gateway.is_unspecified()
        {
            dst
        } else {
            iface.gateway
        };
        arp::resolve(next_hop).ok_or(KernelError::WouldBlock)?
    };

    let mut header = Ipv4Header::new(iface.ip, dst, protocol);
    header.total_length = (Ipv4Header::MIN_SIZE + payload.len()) as u16;
    header.identification = (NEXT_IDENT.fetch_add(1, Ordering::Relaxed) & 0xFFFF) as u16;
    header.fill_checksum();

    let mut datagram = Vec::with_capacity(Ipv4Header::MIN_SIZE + payload.len());
    datagram.extend_from_slice(&header.to_bytes());
    datagram.extend_from_slice(payload);

    let frame =
        ethernet::construct_frame(dst_mac, iface.mac, ethernet::ETHERTYPE_IPV4, &datagram);
    super::transmit(&frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::testutil;

    #[test]
    fn header_round_trip() {
        let src = Ipv4Address::new(10, 0, 2, 15);
        let dst = Ipv4Address::new(10, 0, 2, 2);
        let mut header = Ipv4Header::new(src, dst, IpProtocol::Udp);
        header.total_length = 28;
        header.identification = 7;
        header.fill_checksum();

        let parsed = Ipv4Header::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed.version, 4);
        assert_eq!(parsed.ihl, 5);
        assert_eq!(parsed.flags, FLAG_DF);
        assert_eq!(parsed.ttl, DEFAULT_TTL);
        assert_eq!(parsed.protocol, 17);
        assert_eq!(parsed.source, src);
        assert_eq!(parsed.destination, dst);
        assert_eq!(parsed.checksum, header.checksum);
    }

    #[test]
    fn checksum_verifies_to_zero() {
        let mut header = Ipv4Header::new(
            Ipv4Address::new(192, 168, 0, 1),
            Ipv4Address::new(192, 168, 0, 2),
            IpProtocol::Icmp,
        );
        header.total_length = 84;
        header.identification = 0x1C46;
        header.fill_checksum();

        // Summing the header including its checksum folds to 0xFFFF.
        let sum = checksum::fold(checksum::sum_words(&header.to_bytes()));
        assert_eq!(sum, 0xFFFF);
    }

    #[test]
    fn acceptance_filter_rules() {
        let ours = Ipv4Address::new(10, 0, 2, 15);
        let other = Ipv4Address::new(10, 0, 2, 99);

        assert!(should_accept(ours, ours, IpProtocol::Icmp as u8));
        assert!(should_accept(
            Ipv4Address::BROADCAST,
            ours,
            IpProtocol::Udp as u8
        ));
        // Unconfigured interface accepts (DHCP offer path).
        assert!(should_accept(
            other,
            Ipv4Address::UNSPECIFIED,
            IpProtocol::Udp as u8
        ));
        // Configured interface rejects traffic for others.
        assert!(!should_accept(other, ours, IpProtocol::Icmp as u8));
    }

    #[test]
    fn rejected_packet_is_dropped_not_fatal() {
        let _net = testutil::fresh_net();

        let mut header = Ipv4Header::new(
            Ipv4Address::new(10, 0, 2, 50),
            Ipv4Address::new(10, 0, 2, 60), // not us
            IpProtocol::Icmp,
        );
        header.total_length = 20;
        header.fill_checksum();

        process_packet(&header.to_bytes()).unwrap();
        assert!(testutil::take_frames().is_empty());
    }

    #[test]
    fn inconsistent_lengths_rejected() {
        let _net = testutil::fresh_net();

        let mut header = Ipv4Header::new(
            Ipv4Address::new(10, 0, 2, 2),
            testutil::OUR_IP,
            IpProtocol::Udp,
        );
        // Claims more bytes than the buffer holds.
        header.total_length = 100;
        header.fill_checksum();
        assert!(process_packet(&header.to_bytes()).is_err());
    }

    #[test]
    fn send_fills_policy_fields() {
        let _net = testutil::fresh_net();

        let dst = Ipv4Address::new(10, 0, 2, 2);
        arp::update_cache(dst, MacAddress([0x52, 0x55, 0x0A, 0x00, 0x02, 0x02]));

        send(dst, IpProtocol::Udp, &[0xAB; 8]).unwrap();
        let frames = testutil::take_frames();
        assert_eq!(frames.len(), 1);
        let ip = &frames[0][14..];

        let header = Ipv4Header::from_bytes(ip).unwrap();
        assert_eq!(header.ttl, DEFAULT_TTL);
        assert_eq!(header.flags, FLAG_DF);
        assert_eq!(header.total_length, 28);
        assert_eq!(header.source, testutil::OUR_IP);
        assert_eq!(header.destination, dst);
        let sum = checksum::fold(checksum::sum_words(&ip[..20]));
        assert_eq!(sum, 0xFFFF);
    }

    #[test]
    fn send_to_off_subnet_routes_via_gateway() {
        let _net = testutil::fresh_net();

        let gw_mac = MacAddress([0x66; 6]);
        arp::update_cache(testutil::GATEWAY, gw_mac);

        send(Ipv4Address::new(8, 8, 8, 8), IpProtocol::Udp, &[1, 2, 3]).unwrap();
        let frames = testutil::take_frames();
        assert_eq!(&frames[0][0..6], &gw_mac.0);
    }

    #[test]
    fn arp_miss_reports_would_block_and_requests() {
        let _net = testutil::fresh_net();

        let dst = Ipv4Address::new(10, 0, 2, 123);
        assert_eq!(
            send(dst, IpProtocol::Udp, &[0; 4]),
            Err(KernelError::WouldBlock)
        );
        // The only frame out is the ARP request for the next hop.
        let frames = testutil::take_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(u16::from_be_bytes([frames[0][12], frames[0][13]]), 0x0806);
    }

    #[test]
    fn identification_increments() {
        let _net = testutil::fresh_net();
        let dst = Ipv4Address::new(10, 0, 2, 2);
        arp::update_cache(dst, MacAddress([0x22; 6]));

        send(dst, IpProtocol::Udp, &[0; 4]).unwrap();
        send(dst, IpProtocol::Udp, &[0; 4]).unwrap();
        let frames = testutil::take_frames();
        let id0 = u16::from_be_bytes([frames[0][18], frames[0][19]]);
        let id1 = u16::from_be_bytes([frames[1][18], frames[1][19]]);
        assert_eq!(id1, id0.wrapping_add(1));
    }
}

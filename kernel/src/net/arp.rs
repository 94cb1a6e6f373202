//! ARP: cache and request/reply processing.
//!
//! A small fixed table from IPv4 address to MAC, populated by every ARP
//! packet we see (requests and replies alike), replaced FIFO when full.
//! Requests for our own address are answered on the spot. Runs in IRQ
//! context: the cache lock is IRQ-safe and nothing here blocks.

use alloc::vec::Vec;

use crate::{
    error::{KernelError, KernelResult},
    sync::IrqSpinLock,
};

use super::{ethernet, Ipv4Address, MacAddress};

const ARP_HTYPE_ETHERNET: u16 = 1;
const ARP_PTYPE_IPV4: u16 = 0x0800;
const ARP_OP_REQUEST: u16 = 1;
const ARP_OP_REPLY: u16 = 2;
/// Ethernet/IPv4 ARP packet size: 28 bytes.
pub const ARP_PACKET_SIZE: usize = 28;

/// Cache capacity. Small and fixed; a LAN segment does not need more.
const ARP_CACHE_SIZE: usize = 32;

/// One cache slot.
#[derive(Debug, Clone, Copy)]
struct ArpEntry {
    ip: Ipv4Address,
    mac: MacAddress,
    valid: bool,
}

impl ArpEntry {
    const fn empty() -> Self {
        Self {
            ip: Ipv4Address::UNSPECIFIED,
            mac: MacAddress::ZERO,
            valid: false,
        }
    }
}

/// Fixed table with FIFO replacement.
struct ArpCache {
    entries: [ArpEntry; ARP_CACHE_SIZE],
    /// Next slot to overwrite when no free or matching slot exists.
    next_victim: usize,
}

impl ArpCache {
    const fn new() -> Self {
        Self {
            entries: [ArpEntry::empty(); ARP_CACHE_SIZE],
            next_victim: 0,
        }
    }

    fn lookup(&self, ip: Ipv4Address) -> Option<MacAddress> {
        self.entries
            .iter()
            .find(|e| e.valid && e.ip == ip)
            .map(|e| e.mac)
    }

    fn update(&mut self, ip: Ipv4Address, mac: MacAddress) {
        // Refresh an existing mapping in place.
        if let Some(entry) = self.entries.iter_mut().find(|e| e.valid && e.ip == ip) {
            entry.mac = mac;
            return;
        }
        // Otherwise take a free slot, or evict FIFO.
        let slot = match self.entries.iter().position(|e| !e.valid) {
            Some(free) => free,
            None => {
                let victim = self.next_victim;
                self.next_victim = (self.next_victim + 1) % ARP_CACHE_SIZE;
                victim
            }
        };
        self.entries[slot] = ArpEntry {
            ip,
            mac,
            valid: true,
        };
    }

    fn clear(&mut self) {
        self.entries = [ArpEntry::empty(); ARP_CACHE_SIZE];
        self.next_victim = 0;
    }

    fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.valid).count()
    }
}

static ARP_CACHE: IrqSpinLock<ArpCache> = IrqSpinLock::new(ArpCache::new());

/// Look up a MAC address in the cache.
pub fn lookup(ip: Ipv4Address) -> Option<MacAddress> {
    ARP_CACHE.lock().lookup(ip)
}

/// Resolve an IPv4 address. A miss broadcasts a request and reports
/// absence; the caller retries once the reply has been learned.
pub fn resolve(ip: Ipv4Address) -> Option<MacAddress> {
    if let Some(mac) = lookup(ip) {
        return Some(mac);
    }
    send_request(ip).ok();
    None
}

/// Insert or refresh a cache entry.
pub fn update_cache(ip: Ipv4Address, mac: MacAddress) {
    ARP_CACHE.lock().update(ip, mac);
}

/// Drop every cache entry.
pub fn flush_cache() {
    ARP_CACHE.lock().clear();
}

/// Number of valid cache entries.
pub fn cache_len() -> usize {
    ARP_CACHE.lock().len()
}

/// Snapshot of the cache for diagnostics.
pub fn cache_entries() -> Vec<(Ipv4Address, MacAddress)> {
    let cache = ARP_CACHE.lock();
    cache
        .entries
        .iter()
        .filter(|e| e.valid)
        .map(|e| (e.ip, e.mac))
        .collect()
}

/// Process a received ARP packet (Ethernet payload, header stripped).
///
/// Every valid packet teaches us the sender's mapping; a request for our
/// address additionally emits a reply.
pub fn process_packet(data: &[u8]) -> KernelResult<()> {
    if data.len() < ARP_PACKET_SIZE {
        return Err(KernelError::PacketRejected {
            reason: "arp packet too short",
        });
    }

    let htype = u16::from_be_bytes([data[0], data[1]]);
    let ptype = u16::from_be_bytes([data[2], data[3]]);
    let hlen = data[4];
    let plen = data[5];
    let operation = u16::from_be_bytes([data[6], data[7]]);

    if htype != ARP_HTYPE_ETHERNET || ptype != ARP_PTYPE_IPV4 || hlen != 6 || plen != 4 {
        return Err(KernelError::PacketRejected {
            reason: "arp not ethernet/ipv4",
        });
    }

    let mut sender_mac = [0u8; 6];
    sender_mac.copy_from_slice(&data[8..14]);
    let sender_mac = MacAddress(sender_mac);
    let sender_ip = Ipv4Address([data[14], data[15], data[16], data[17]]);
    let target_ip = Ipv4Address([data[24], data[25], data[26], data[27]]);

    // Learn the sender regardless of the operation.
    update_cache(sender_ip, sender_mac);

    match operation {
        ARP_OP_REQUEST => {
            let Some(iface) = super::default_interface() else {
                return Ok(());
            };
            if target_ip == iface.ip && !iface.ip.is_unspecified() {
                let reply = build_packet(
                    ARP_OP_REPLY,
                    iface.mac,
                    iface.ip,
                    sender_mac,
                    sender_ip,
                );
                let frame =
                    ethernet::construct_frame(sender_mac, iface.mac, ethernet::ETHERTYPE_ARP, &reply);
                super::transmit(&frame)?;
            }
        }
        ARP_OP_REPLY => {
            log::debug!(target: "net", "arp: {} is at {}", sender_ip, sender_mac);
        }
        _ => {
            // Unknown operation: the cache update was still worth it.
        }
    }

    Ok(())
}

/// Broadcast a request for `target_ip`.
pub fn send_request(target_ip: Ipv4Address) -> KernelResult<()> {
    let iface = super::default_interface().ok_or(KernelError::NotInitialized {
        subsystem: "net",
    })?;

    let packet = build_packet(
        ARP_OP_REQUEST,
        iface.mac,
        iface.ip,
        MacAddress::ZERO,
        target_ip,
    );
    let frame = ethernet::construct_frame(
        MacAddress::BROADCAST,
        iface.mac,
        ethernet::ETHERTYPE_ARP,
        &packet,
    );
    super::transmit(&frame)
}

/// Build a 28-byte ARP packet.
fn build_packet(
    operation: u16,
    sender_mac: MacAddress,
    sender_ip: Ipv4Address,
    target_mac: MacAddress,
    target_ip: Ipv4Address,
) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(ARP_PACKET_SIZE);
    pkt.extend_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
    pkt.extend_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
    pkt.push(6);
    pkt.push(4);
    pkt.extend_from_slice(&operation.to_be_bytes());
    pkt.extend_from_slice(&sender_mac.0);
    pkt.extend_from_slice(&sender_ip.0);
    pkt.extend_from_slice(&target_mac.0);
    pkt.extend_from_slice(&target_ip.0);
    pkt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::testutil;

    #[test]
    fn cache_insert_lookup_fifo() {
        let _net = testutil::fresh_net();

        let ip = Ipv4Address::new(10, 0, 0, 1);
        let mac = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        update_cache(ip, mac);
        assert_eq!(lookup(ip), Some(mac));

        // Refresh replaces in place, no duplicate slot.
        let mac2 = MacAddress([0x11; 6]);
        update_cache(ip, mac2);
        assert_eq!(lookup(ip), Some(mac2));
        assert_eq!(cache_len(), 1);

        // Overflow evicts the oldest slot first.
        for i in 0..ARP_CACHE_SIZE {
            update_cache(
                Ipv4Address::new(10, 1, 0, i as u8),
                MacAddress([i as u8; 6]),
            );
        }
        assert_eq!(cache_len(), ARP_CACHE_SIZE);
        // The first entry (10.0.0.1, slot 0) was the FIFO victim.
        assert_eq!(lookup(ip), None);
        assert_eq!(
            lookup(Ipv4Address::new(10, 1, 0, 0)),
            Some(MacAddress([0; 6]))
        );
    }

    #[test]
    fn request_for_our_ip_emits_reply_and_learns_sender() {
        let _net = testutil::fresh_net();

        // ARP request: who-has 10.0.2.15? tell 10.0.2.2
        let sender_mac = MacAddress([0x52, 0x55, 0x0A, 0x00, 0x02, 0x02]);
        let sender_ip = Ipv4Address::new(10, 0, 2, 2);
        let request = build_packet(
            ARP_OP_REQUEST,
            sender_mac,
            sender_ip,
            MacAddress::ZERO,
            testutil::OUR_IP,
        );
        let frame = ethernet::construct_frame(
            MacAddress::BROADCAST,
            sender_mac,
            ethernet::ETHERTYPE_ARP,
            &request,
        );

        ethernet::dispatch_frame(&frame, testutil::OUR_MAC).unwrap();

        // Cache learned the sender.
        assert_eq!(lookup(sender_ip), Some(sender_mac));

        // Exactly one frame went out: a 60-byte Ethernet frame carrying the
        // reply.
        let frames = testutil::take_frames();
        assert_eq!(frames.len(), 1);
        let out = &frames[0];
        assert_eq!(out.len(), 60);

        // Ethernet: to the requester, from us, EtherType ARP.
        assert_eq!(&out[0..6], &sender_mac.0);
        assert_eq!(&out[6..12], &testutil::OUR_MAC.0);
        assert_eq!(u16::from_be_bytes([out[12], out[13]]), 0x0806);

        // ARP payload: reply, our MAC/IP as sender, requester as target.
        let arp = &out[14..14 + ARP_PACKET_SIZE];
        assert_eq!(u16::from_be_bytes([arp[6], arp[7]]), ARP_OP_REPLY);
        assert_eq!(&arp[8..14], &testutil::OUR_MAC.0);
        assert_eq!(&arp[14..18], &testutil::OUR_IP.0);
        assert_eq!(&arp[18..24], &sender_mac.0);
        assert_eq!(&arp[24..28], &sender_ip.0);
    }

    #[test]
    fn request_for_other_ip_learns_but_stays_quiet() {
        let _net = testutil::fresh_net();

        let sender_mac = MacAddress([0x02; 6]);
        let sender_ip = Ipv4Address::new(10, 0, 2, 77);
        let request = build_packet(
            ARP_OP_REQUEST,
            sender_mac,
            sender_ip,
            MacAddress::ZERO,
            Ipv4Address::new(10, 0, 2, 99),
        );

        process_packet(&request).unwrap();
        assert_eq!(lookup(sender_ip), Some(sender_mac));
        assert!(testutil::take_frames().is_empty());
    }

    #[test]
    fn reply_only_updates_cache() {
        let _net = testutil::fresh_net();

        let sender_mac = MacAddress([0x0A; 6]);
        let sender_ip = Ipv4Address::new(10, 0, 2, 3);
        let reply = build_packet(
            ARP_OP_REPLY,
            sender_mac,
            sender_ip,
            testutil::OUR_MAC,
            testutil::OUR_IP,
        );

        process_packet(&reply).unwrap();
        assert_eq!(lookup(sender_ip), Some(sender_mac));
        assert!(testutil::take_frames().is_empty());
    }

    #[test]
    fn short_or_foreign_packets_rejected() {
        let _net = testutil::fresh_net();
        assert!(process_packet(&[0u8; 27]).is_err());

        // hw_type = 2 (not Ethernet)
        let mut bad = build_packet(
            ARP_OP_REQUEST,
            MacAddress([1; 6]),
            Ipv4Address::new(1, 2, 3, 4),
            MacAddress::ZERO,
            testutil::OUR_IP,
        );
        bad[1] = 2;
        assert!(process_packet(&bad).is_err());
        assert_eq!(cache_len(), 0);
    }

    #[test]
    fn resolve_miss_broadcasts_request() {
        let _net = testutil::fresh_net();

        let target = Ipv4Address::new(10, 0, 2, 201);
        assert_eq!(resolve(target), None);

        let frames = testutil::take_frames();
        assert_eq!(frames.len(), 1);
        let out = &frames[0];
        // Broadcast destination, ARP EtherType, request op, our addressing.
        assert_eq!(&out[0..6], &[0xFF; 6]);
        assert_eq!(u16::from_be_bytes([out[12], out[13]]), 0x0806);
        let arp = &out[14..14 + ARP_PACKET_SIZE];
        assert_eq!(u16::from_be_bytes([arp[6], arp[7]]), ARP_OP_REQUEST);
        assert_eq!(&arp[24..28], &target.0);

        // Once the reply arrives, resolution succeeds without traffic.
        update_cache(target, MacAddress([0x0C; 6]));
        assert_eq!(resolve(target), Some(MacAddress([0x0C; 6])));
        assert!(testutil::take_frames().is_empty());
    }
}

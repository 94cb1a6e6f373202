//! Ethernet II frame handling.
//!
//! Parsing, construction, and the receive-side demultiplexer that routes
//! frames to ARP or IPv4 by EtherType. IPv6 is recognized and explicitly
//! ignored.

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};

use super::MacAddress;

/// Header: dst(6) + src(6) + ethertype(2).
pub const ETHERNET_HEADER_SIZE: usize = 14;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

/// A parsed frame; the payload borrows the receive buffer.
#[derive(Debug, Clone)]
pub struct EthernetFrame<'a> {
    pub dst_mac: MacAddress,
    pub src_mac: MacAddress,
    pub ethertype: u16,
    pub payload: &'a [u8],
}

/// Parse a frame. Anything shorter than the header is dropped.
pub fn parse_frame(data: &[u8]) -> KernelResult<EthernetFrame<'_>> {
    if data.len() < ETHERNET_HEADER_SIZE {
        return Err(KernelError::PacketRejected {
            reason: "ethernet frame too short",
        });
    }

    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&data[0..6]);
    src.copy_from_slice(&data[6..12]);

    Ok(EthernetFrame {
        dst_mac: MacAddress(dst),
        src_mac: MacAddress(src),
        ethertype: u16::from_be_bytes([data[12], data[13]]),
        payload: &data[ETHERNET_HEADER_SIZE..],
    })
}

/// Build a frame from its parts.
pub fn construct_frame(
    dst: MacAddress,
    src: MacAddress,
    ethertype: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETHERNET_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&dst.0);
    frame.extend_from_slice(&src.0);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub fn is_broadcast(mac: &MacAddress) -> bool {
    *mac == MacAddress::BROADCAST
}

/// Frame addressed to us, or to everyone?
pub fn is_for_us(frame_dst: &MacAddress, our_mac: &MacAddress) -> bool {
    *frame_dst == *our_mac || is_broadcast(frame_dst)
}

/// Route a received frame to its protocol handler.
///
/// Runs in IRQ context; every layer below here restricts itself to IRQ-safe
/// locks. Unknown EtherTypes (and IPv6) are silently ignored.
pub fn dispatch_frame(data: &[u8], our_mac: MacAddress) -> KernelResult<()> {
    let frame = parse_frame(data)?;

    if !is_for_us(&frame.dst_mac, &our_mac) {
        return Ok(());
    }

    match frame.ethertype {
        ETHERTYPE_ARP => super::arp::process_packet(frame.payload),
        ETHERTYPE_IPV4 => super::ip::process_packet(frame.payload),
        // Deliberately not handled.
        ETHERTYPE_IPV6 => Ok(()),
        _ => Ok(()),
    }
}

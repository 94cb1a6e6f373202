//! UDP: header handling and destination-port demultiplexing.
//!
//! Port handlers (the DHCP and DNS clients above the core) register here;
//! a received datagram is routed by destination port and dropped when no
//! handler is bound. Transmit leaves the UDP checksum zero -- legal for
//! IPv4 -- and rides the IP send path.

use alloc::{collections::BTreeMap, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    sync::IrqSpinLock,
};

use super::{ip::IpProtocol, Ipv4Address};

/// UDP header size.
pub const UDP_HEADER_SIZE: usize = 8;

/// Datagram callback: (source IP, source port, payload).
///
/// Runs in IRQ context; same rules as every RX-path handler (IRQ-safe locks
/// only, no blocking).
pub type UdpHandler = fn(Ipv4Address, u16, &[u8]);

/// Parsed UDP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub fn from_bytes(bytes: &[u8]) -> KernelResult<Self> {
        if bytes.len() < UDP_HEADER_SIZE {
            return Err(KernelError::PacketRejected {
                reason: "udp header too short",
            });
        }
        Ok(Self {
            src_port: u16::from_be_bytes([bytes[0], bytes[1]]),
            dst_port: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            checksum: u16::from_be_bytes([bytes[6], bytes[7]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.checksum.to_be_bytes());
        bytes
    }
}

/// Bound port handlers. Registration happens in thread context; the RX
/// path only reads.
static PORT_HANDLERS: IrqSpinLock<BTreeMap<u16, UdpHandler>> =
    IrqSpinLock::new(BTreeMap::new());

/// Bind a handler to a destination port.
pub fn bind(port: u16, handler: UdpHandler) -> KernelResult<()> {
    let mut handlers = PORT_HANDLERS.lock();
    if handlers.contains_key(&port) {
        return Err(KernelError::AlreadyExists {
            resource: "udp port",
            id: port as u64,
        });
    }
    handlers.insert(port, handler);
    log::debug!(target: "net", "udp: port {} bound", port);
    Ok(())
}

/// Release a port binding.
pub fn unbind(port: u16) -> KernelResult<()> {
    let mut handlers = PORT_HANDLERS.lock();
    handlers.remove(&port).ok_or(KernelError::NotFound {
        resource: "udp port",
        id: port as u64,
    })?;
    Ok(())
}

/// Process a received UDP datagram (IP payload). Unknown ports drop.
pub fn process_packet(
    src: Ipv4Address,
    _dst: Ipv4Address,
    data: &[u8],
) -> KernelResult<()> {
    let header = UdpHeader::from_bytes(data)?;
    let length = header.length as usize;
    if length < UDP_HEADER_SIZE || length > data.len() {
        return Err(KernelError::PacketRejected {
            reason: "udp length inconsistent",
        });
    }

    let handler = {
        let handlers = PORT_HANDLERS.lock();
        handlers.get(&header.dst_port).copied()
    };

    match handler {
        Some(handler) => {
            handler(src, header.src_port, &data[UDP_HEADER_SIZE..length]);
            Ok(())
        }
        None => {
            super::count_rx_drop();
            Ok(())
        }
    }
}

/// Send a UDP datagram.
pub fn send(
    dst: Ipv4Address,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> KernelResult<()> {
    let header = UdpHeader {
        src_port,
        dst_port,
        length: (UDP_HEADER_SIZE + payload.len()) as u16,
        // Zero = "no checksum" in IPv4 UDP.
        checksum: 0,
    };

    let mut datagram = Vec::with_capacity(UDP_HEADER_SIZE + payload.len());
    datagram.extend_from_slice(&header.to_bytes());
    datagram.extend_from_slice(payload);

    super::ip::send(dst, IpProtocol::Udp, &datagram)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{arp, testutil, MacAddress};
    use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    static RECEIVED_LEN: AtomicU64 = AtomicU64::new(0);
    static RECEIVED_COUNT: AtomicU32 = AtomicU32::new(0);

    fn capture_handler(_src: Ipv4Address, src_port: u16, payload: &[u8]) {
        RECEIVED_LEN.store(payload.len() as u64, Ordering::Relaxed);
        RECEIVED_COUNT.fetch_add(src_port as u32, Ordering::Relaxed);
    }

    fn datagram(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let header = UdpHeader {
            src_port,
            dst_port,
            length: (UDP_HEADER_SIZE + payload.len()) as u16,
            checksum: 0,
        };
        let mut bytes = Vec::from(header.to_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn header_round_trip() {
        let header = UdpHeader {
            src_port: 68,
            dst_port: 67,
            length: 308,
            checksum: 0,
        };
        let parsed = UdpHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn demux_by_destination_port() {
        let _net = testutil::fresh_net();

        bind(5353, capture_handler).unwrap();
        // Double bind fails.
        assert!(bind(5353, capture_handler).is_err());

        RECEIVED_LEN.store(0, Ordering::Relaxed);
        let src = Ipv4Address::new(10, 0, 2, 3);
        process_packet(src, testutil::OUR_IP, &datagram(40000, 5353, &[7u8; 11])).unwrap();
        assert_eq!(RECEIVED_LEN.load(Ordering::Relaxed), 11);

        unbind(5353).unwrap();
        assert!(unbind(5353).is_err());
    }

    #[test]
    fn unknown_port_drops_silently() {
        let _net = testutil::fresh_net();
        let src = Ipv4Address::new(10, 0, 2, 3);
        process_packet(src, testutil::OUR_IP, &datagram(1000, 9, &[1, 2, 3])).unwrap();
        // No error, no transmit.
        assert!(testutil::take_frames().is_empty());
    }

    #[test]
    fn length_field_is_validated() {
        let src = Ipv4Address::new(10, 0, 2, 3);
        let mut bad = datagram(1, 2, &[0u8; 4]);
        // Claim more than the buffer.
        bad[4..6].copy_from_slice(&100u16.to_be_bytes());
        assert!(process_packet(src, Ipv4Address::UNSPECIFIED, &bad).is_err());
    }

    #[test]
    fn send_produces_udp_over_ipv4() {
        let _net = testutil::fresh_net();

        let dst = Ipv4Address::new(10, 0, 2, 2);
        arp::update_cache(dst, MacAddress([0x44; 6]));

        send(dst, 68, 67, &[0xAA; 12]).unwrap();
        let frames = testutil::take_frames();
        assert_eq!(frames.len(), 1);
        let out = &frames[0];

        // Protocol 17 in the IP header.
        assert_eq!(out[14 + 9], 17);
        let udp = &out[34..];
        assert_eq!(u16::from_be_bytes([udp[0], udp[1]]), 68);
        assert_eq!(u16::from_be_bytes([udp[2], udp[3]]), 67);
        assert_eq!(u16::from_be_bytes([udp[4], udp[5]]), 20);
    }
}

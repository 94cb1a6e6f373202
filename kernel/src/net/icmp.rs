//! ICMP: echo service and ping bookkeeping.
//!
//! Echo requests addressed to us are answered in place: type flipped to
//! reply, checksum recomputed over the whole message, sent back to the
//! requester. Echo replies complete a pending `ping` session matched by
//! identifier. Destination-unreachable and time-exceeded are logged and
//! dropped.

use alloc::vec::Vec;

use crate::{
    error::{KernelError, KernelResult},
    sync::IrqSpinLock,
};

use super::{checksum, ip::IpProtocol, Ipv4Address};

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;

/// Echo header: type, code, checksum, identifier, sequence.
pub const ICMP_ECHO_HEADER_SIZE: usize = 8;

/// An in-flight ping awaiting its reply, matched by identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PingSession {
    ident: u16,
    received: bool,
}

static PING: IrqSpinLock<Option<PingSession>> = IrqSpinLock::new(None);

/// Process a received ICMP message (IP payload, already trimmed to the
/// datagram length). Runs in IRQ context.
pub fn process_packet(src: Ipv4Address, data: &[u8]) -> KernelResult<()> {
    if data.len() < ICMP_ECHO_HEADER_SIZE {
        return Err(KernelError::PacketRejected {
            reason: "icmp message too short",
        });
    }

    let msg_type = data[0];
    let code = data[1];

    match (msg_type, code) {
        (ICMP_ECHO_REQUEST, 0) => {
            let ident = u16::from_be_bytes([data[4], data[5]]);
            let seq = u16::from_be_bytes([data[6], data[7]]);
            send_echo(src, ICMP_ECHO_REPLY, ident, seq, &data[ICMP_ECHO_HEADER_SIZE..])
        }
        (ICMP_ECHO_REPLY, 0) => {
            let ident = u16::from_be_bytes([data[4], data[5]]);
            let mut ping = PING.lock();
            if let Some(session) = ping.as_mut() {
                if session.ident == ident {
                    session.received = true;
                }
            }
            Ok(())
        }
        (ICMP_DEST_UNREACHABLE, _) => {
            log::info!(target: "net", "icmp: destination unreachable from {} (code {})", src, code);
            Ok(())
        }
        (ICMP_TIME_EXCEEDED, _) => {
            log::info!(target: "net", "icmp: time exceeded from {} (code {})", src, code);
            Ok(())
        }
        _ => {
            log::debug!(target: "net", "icmp: type {} code {} from {}", msg_type, code, src);
            Ok(())
        }
    }
}

/// Send an echo message (request or reply) with the full-message checksum.
fn send_echo(
    dst: Ipv4Address,
    msg_type: u8,
    ident: u16,
    seq: u16,
    payload: &[u8],
) -> KernelResult<()> {
    let mut msg = Vec::with_capacity(ICMP_ECHO_HEADER_SIZE + payload.len());
    msg.push(msg_type);
    msg.push(0); // code
    msg.extend_from_slice(&[0, 0]); // checksum, filled below
    msg.extend_from_slice(&ident.to_be_bytes());
    msg.extend_from_slice(&seq.to_be_bytes());
    msg.extend_from_slice(payload);

    let cksum = checksum::internet_checksum(&msg);
    msg[2..4].copy_from_slice(&cksum.to_be_bytes());

    super::ip::send(dst, IpProtocol::Icmp, &msg)
}

/// Start a ping: send one echo request and remember the identifier.
///
/// The reply is recorded by the receive path; poll with [`ping_received`].
pub fn ping(dst: Ipv4Address, ident: u16, seq: u16, payload: &[u8]) -> KernelResult<()> {
    {
        let mut session = PING.lock();
        *session = Some(PingSession {
            ident,
            received: false,
        });
    }
    log::debug!(target: "net", "ping {} ident {:#x} seq {}", dst, ident, seq);
    send_echo(dst, ICMP_ECHO_REQUEST, ident, seq, payload)
}

/// Has the outstanding ping (if any) been answered?
pub fn ping_received(ident: u16) -> bool {
    PING.lock()
        .map(|s| s.ident == ident && s.received)
        .unwrap_or(false)
}

/// Forget the outstanding ping session.
pub fn ping_clear() {
    *PING.lock() = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{
        arp,
        ip::{self, Ipv4Header},
        testutil, MacAddress,
    };

    /// Wrap an ICMP message in an IPv4 datagram addressed to us and run it
    /// through the IP receive path.
    fn deliver_icmp(src: Ipv4Address, icmp: &[u8]) {
        let mut header = Ipv4Header::new(src, testutil::OUR_IP, IpProtocol::Icmp);
        header.total_length = (Ipv4Header::MIN_SIZE + icmp.len()) as u16;
        header.fill_checksum();

        let mut datagram = Vec::from(header.to_bytes());
        datagram.extend_from_slice(icmp);
        ip::process_packet(&datagram).unwrap();
    }

    fn echo_request(ident: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut msg = alloc::vec![ICMP_ECHO_REQUEST, 0, 0, 0];
        msg.extend_from_slice(&ident.to_be_bytes());
        msg.extend_from_slice(&seq.to_be_bytes());
        msg.extend_from_slice(payload);
        let cksum = checksum::internet_checksum(&msg);
        msg[2..4].copy_from_slice(&cksum.to_be_bytes());
        msg
    }

    #[test]
    fn echo_request_generates_reply() {
        let _net = testutil::fresh_net();

        // The requester's MAC is known (it ARPed us first).
        let peer_ip = Ipv4Address::new(10, 0, 2, 2);
        let peer_mac = MacAddress([0x52, 0x55, 0x0A, 0x00, 0x02, 0x02]);
        arp::update_cache(peer_ip, peer_mac);

        let payload = [0x61u8; 16];
        deliver_icmp(peer_ip, &echo_request(0x1234, 1, &payload));

        let frames = testutil::take_frames();
        assert_eq!(frames.len(), 1);
        let out = &frames[0];

        // Ethernet to the requester.
        assert_eq!(&out[0..6], &peer_mac.0);
        assert_eq!(u16::from_be_bytes([out[12], out[13]]), 0x0800);

        // IPv4: from us, to the requester, TTL 64, DF, valid checksum.
        let ip_hdr = Ipv4Header::from_bytes(&out[14..]).unwrap();
        assert_eq!(ip_hdr.source, testutil::OUR_IP);
        assert_eq!(ip_hdr.destination, peer_ip);
        assert_eq!(ip_hdr.ttl, 64);
        assert_eq!(ip_hdr.flags, ip::FLAG_DF);
        assert_eq!(
            checksum::fold(checksum::sum_words(&out[14..34])),
            0xFFFF
        );

        // ICMP: echo reply, same ident/seq/data, valid checksum.
        let total = ip_hdr.total_length as usize;
        let icmp = &out[34..14 + total];
        assert_eq!(icmp[0], ICMP_ECHO_REPLY);
        assert_eq!(icmp[1], 0);
        assert_eq!(u16::from_be_bytes([icmp[4], icmp[5]]), 0x1234);
        assert_eq!(u16::from_be_bytes([icmp[6], icmp[7]]), 1);
        assert_eq!(&icmp[8..], &payload);
        assert_eq!(checksum::fold(checksum::sum_words(icmp)), 0xFFFF);
    }

    #[test]
    fn echo_reply_completes_matching_ping() {
        let _net = testutil::fresh_net();

        let peer_ip = Ipv4Address::new(10, 0, 2, 2);
        arp::update_cache(peer_ip, MacAddress([0x33; 6]));

        ping(peer_ip, 0x4242, 1, b"abcdefgh").unwrap();
        assert!(!ping_received(0x4242));
        // A request frame went out.
        assert_eq!(testutil::take_frames().len(), 1);

        // Reply with the right identifier completes the session.
        let mut reply = alloc::vec![ICMP_ECHO_REPLY, 0, 0, 0];
        reply.extend_from_slice(&0x4242u16.to_be_bytes());
        reply.extend_from_slice(&1u16.to_be_bytes());
        reply.extend_from_slice(b"abcdefgh");
        let cksum = checksum::internet_checksum(&reply);
        reply[2..4].copy_from_slice(&cksum.to_be_bytes());
        deliver_icmp(peer_ip, &reply);

        assert!(ping_received(0x4242));
        // Mismatched identifier stays pending.
        assert!(!ping_received(0x9999));
        ping_clear();
    }

    #[test]
    fn unreachable_and_time_exceeded_are_dropped() {
        let _net = testutil::fresh_net();

        let peer_ip = Ipv4Address::new(10, 0, 2, 2);
        let msg = [ICMP_DEST_UNREACHABLE, 1, 0, 0, 0, 0, 0, 0];
        deliver_icmp(peer_ip, &msg);
        let msg = [ICMP_TIME_EXCEEDED, 0, 0, 0, 0, 0, 0, 0];
        deliver_icmp(peer_ip, &msg);

        assert!(testutil::take_frames().is_empty());
    }

    #[test]
    fn truncated_icmp_rejected() {
        assert!(process_packet(Ipv4Address::new(1, 1, 1, 1), &[8, 0, 0]).is_err());
    }
}

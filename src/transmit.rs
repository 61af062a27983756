//! Build the IPv4 + router-alert envelope around an IGMP payload and hand it
//! to the data-link send entry point (spec §4.7).

use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};

use crate::checksum;
use crate::collaborators::{NetworkLink, OutboundPacket};
use crate::error::IgmpError;

/// IPv4 header (20 bytes) + router-alert option (4 bytes) = 24 bytes,
/// matching the "IGMP IPv4 header (24 bytes)" subtracted in spec §3's
/// max-packet-size derivation.
pub const IP_HEADER_LEN: usize = 24;

const PROTO_IGMP: u8 = 2;
/// `0x94 0x04 0x00 0x00` — the router-alert option value (spec §6).
const ROUTER_ALERT: [u8; 4] = [0x94, 0x04, 0x00, 0x00];
/// Precedence "network control" in the top 3 bits of the ToS byte.
const TOS_NETWORK_CONTROL: u8 = 0b1110_0000;

/// The largest IGMP payload this link can carry in one packet, derived once
/// at Link creation (spec §3): link MTU minus data-link framing overhead
/// minus the 24-byte IGMP/IPv4 header.
pub fn max_packet_size(link: &dyn NetworkLink) -> usize {
    link.mtu()
        .saturating_sub(link.header_footer_overhead())
        .saturating_sub(IP_HEADER_LEN)
}

/// Prepend the IPv4 + router-alert header to `payload` and hand the result
/// to the link's send entry point. On failure the packet is simply dropped
/// (spec §7: "Transmit failure"); the IGMP robustness variable drives retry.
pub fn send(link: &dyn NetworkLink, dst: Ipv4Addr, payload: &[u8]) -> Result<(), IgmpError> {
    let packet = build_packet(link, dst, payload);
    link.send(packet)
}

fn build_packet(link: &dyn NetworkLink, dst: Ipv4Addr, payload: &[u8]) -> OutboundPacket {
    let mut bytes = vec![0u8; IP_HEADER_LEN + payload.len()];
    {
        let header = &mut bytes[..IP_HEADER_LEN];
        header[0] = (4 << 4) | 6; // version 4, IHL = 6 words (24 bytes)
        header[1] = TOS_NETWORK_CONTROL;
        BigEndian::write_u16(&mut header[2..4], (IP_HEADER_LEN + payload.len()) as u16);
        BigEndian::write_u16(&mut header[4..6], 0); // identification
        BigEndian::write_u16(&mut header[6..8], 0); // flags + fragment offset
        header[8] = 1; // TTL
        header[9] = PROTO_IGMP;
        // checksum filled below
        header[12..16].copy_from_slice(&link.ipv4_address().octets());
        header[16..20].copy_from_slice(&dst.octets());
        header[20..24].copy_from_slice(&ROUTER_ALERT);
    }
    bytes[IP_HEADER_LEN..].copy_from_slice(payload);

    if !link.has_checksum_offload() {
        checksum::fill(&mut bytes[..IP_HEADER_LEN], 10);
    }

    OutboundPacket { dst, bytes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::testutil::FakeLink;

    #[test]
    fn header_has_router_alert_and_ihl_six() {
        let mut link = FakeLink::new(1);
        link.addr = Ipv4Addr::new(10, 0, 0, 5);
        let dst = Ipv4Addr::new(224, 0, 0, 22);
        let payload = [0xAAu8; 8];

        send(&link, dst, &payload).unwrap();
        let sent = link.sent_packets();
        assert_eq!(sent.len(), 1);
        let pkt = &sent[0].bytes;
        assert_eq!(pkt[0], 0x46);
        assert_eq!(pkt[8], 1); // TTL
        assert_eq!(pkt[9], 2); // IGMP
        assert_eq!(&pkt[12..16], &[10, 0, 0, 5]);
        assert_eq!(&pkt[16..20], &dst.octets());
        assert_eq!(&pkt[20..24], &[0x94, 0x04, 0x00, 0x00]);
        assert_eq!(&pkt[24..], &payload);
        assert!(checksum::verify(&pkt[..IP_HEADER_LEN]));
    }

    #[test]
    fn checksum_offload_skips_header_checksum() {
        let mut link = FakeLink::new(1);
        link.fail_send = std::sync::atomic::AtomicBool::new(false);
        let offloaded = OffloadingLink(link);
        let dst = Ipv4Addr::new(224, 0, 0, 22);
        send(&offloaded, dst, &[0u8; 8]).unwrap();
        let sent = offloaded.0.sent_packets();
        assert_eq!(&sent[0].bytes[10..12], &[0, 0]);
    }

    #[test]
    fn max_packet_size_subtracts_overhead_and_ip_header() {
        let mut link = FakeLink::new(1);
        link.mtu = 1500;
        link.overhead = 14;
        assert_eq!(max_packet_size(&link), 1500 - 14 - IP_HEADER_LEN);
    }

    #[test]
    fn send_failure_propagates_error() {
        let mut link = FakeLink::new(1);
        link.fail_send = std::sync::atomic::AtomicBool::new(true);
        let dst = Ipv4Addr::new(224, 0, 0, 22);
        assert!(send(&link, dst, &[0u8; 8]).is_err());
    }

    #[derive(Debug)]
    struct OffloadingLink(FakeLink);

    impl NetworkLink for OffloadingLink {
        fn id(&self) -> crate::collaborators::LinkId {
            self.0.id()
        }
        fn ipv4_address(&self) -> Ipv4Addr {
            self.0.ipv4_address()
        }
        fn header_footer_overhead(&self) -> usize {
            self.0.header_footer_overhead()
        }
        fn mtu(&self) -> usize {
            self.0.mtu()
        }
        fn supports_multicast_filter(&self) -> bool {
            self.0.supports_multicast_filter()
        }
        fn set_multicast_filter(&self, group: Ipv4Addr, enabled: bool) -> Result<(), IgmpError> {
            self.0.set_multicast_filter(group, enabled)
        }
        fn has_checksum_offload(&self) -> bool {
            true
        }
        fn send(&self, packet: OutboundPacket) -> Result<(), IgmpError> {
            self.0.send(packet)
        }
    }
}

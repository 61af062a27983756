//! External interfaces this crate consumes but does not implement (spec §6).
//!
//! These mirror smoltcp's own `Device` trait: a thin boundary the core
//! protocol logic is generic over, so tests can swap in a fake and a real
//! driver crate can swap in hardware access.

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::IgmpError;

/// A stable identity for a network link, used as the link table's ordering
/// key (spec §4.1's "identity (pointer value / stable id)").
pub type LinkId = u64;

/// A fully-built outbound frame: an IPv4 datagram (router-alert header
/// already prepended by `transmit`) ready for the data-link layer.
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    pub dst: Ipv4Addr,
    pub bytes: Vec<u8>,
}

/// The network-interface collaborator (spec §6).
///
/// A real implementation backs this with an actual NIC driver; `testutil`
/// provides an in-memory fake that records sent packets.
pub trait NetworkLink: Send + Sync + fmt::Debug {
    /// Stable identity used as the link table's key.
    fn id(&self) -> LinkId;

    /// This link's configured IPv4 address, or `Ipv4Addr::UNSPECIFIED` if
    /// none is configured yet (spec §4.7).
    fn ipv4_address(&self) -> Ipv4Addr;

    /// This link's IPv4 subnet mask, used to decide whether a report's
    /// source address is "local-subnet" for the §4.2 report-reception
    /// security filter. Defaults to a host route (all ones): a link that
    /// doesn't otherwise know its prefix only ever accepts the unspecified
    /// source or an exact match on its own address.
    fn ipv4_netmask(&self) -> Ipv4Addr {
        Ipv4Addr::new(255, 255, 255, 255)
    }

    /// Bytes of link/data-link framing overhead to subtract when deriving
    /// `max_packet_size` (spec §3).
    fn header_footer_overhead(&self) -> usize;

    /// The link's MTU, before the overhead above is subtracted.
    fn mtu(&self) -> usize;

    /// Whether this link can be programmed to filter multicast frames
    /// (spec §4.1: creation requires this capability).
    fn supports_multicast_filter(&self) -> bool;

    /// Program (or un-program) the hardware multicast filter for `group`.
    /// A `false` `Ok` result is not possible; failure is surfaced as `Err`
    /// and must be rolled back by the caller (spec §7).
    fn set_multicast_filter(&self, group: Ipv4Addr, enabled: bool) -> Result<(), IgmpError>;

    /// Whether a transmit-side IP checksum offload is available, letting
    /// `transmit` skip computing the IPv4 header checksum (spec §4.7).
    fn has_checksum_offload(&self) -> bool {
        false
    }

    /// Hand a fully-built IPv4 datagram to the data-link send entry point.
    /// On failure the packet is dropped with no further action (spec §7);
    /// the IGMP robustness variable drives retry through the normal
    /// retransmission schedule.
    fn send(&self, packet: OutboundPacket) -> Result<(), IgmpError>;
}

/// The packet-allocator collaborator (spec §6): `allocate`/`free` with
/// header/footer reserves, for a driver that hands back pre-reserved,
/// zero-copy buffers instead of a plain heap allocation.
///
/// The default path in this crate (`transmit::send`) builds packets as a
/// plain `Vec<u8>` — Rust's global allocator already gives every packet its
/// own reserve-free buffer, so there is no header/footer-reserve gap to
/// bridge for the in-tree `NetworkLink` fakes. This trait exists for a
/// future zero-copy driver to plug into, mirroring the shape of the
/// allocator entry point in spec §6 even though nothing in this crate's
/// default path calls it yet.
pub trait PacketAllocator: Send + Sync {
    /// A buffer with `header_reserve` and `footer_reserve` bytes of unused
    /// space on either side of `body`.
    fn allocate(&self, header_reserve: usize, body: &[u8], footer_reserve: usize) -> Vec<u8>;

    /// Release a batch of packets, e.g. returning them to a pool. The
    /// default no-op is correct for any allocator backed by Rust's global
    /// allocator, where dropping the `Vec`s already frees them.
    fn free(&self, _packets: Vec<Vec<u8>>) {}
}

/// `PacketAllocator` backed directly by the global allocator via `Vec`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdPacketAllocator;

impl PacketAllocator for StdPacketAllocator {
    fn allocate(&self, header_reserve: usize, body: &[u8], footer_reserve: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(header_reserve + body.len() + footer_reserve);
        buf.resize(header_reserve, 0);
        buf.extend_from_slice(body);
        buf.resize(header_reserve + body.len() + footer_reserve, 0);
        buf
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::sync::Mutex;

    /// In-memory `NetworkLink` fake: records every packet handed to `send`,
    /// and can be told to fail `set_multicast_filter`/`send` to exercise
    /// the rollback and retry paths (spec §7).
    #[derive(Debug)]
    pub struct FakeLink {
        pub id: LinkId,
        pub addr: Ipv4Addr,
        pub netmask: Ipv4Addr,
        pub mtu: usize,
        pub overhead: usize,
        pub supports_filter: bool,
        pub sent: Mutex<Vec<OutboundPacket>>,
        pub fail_filter: std::sync::atomic::AtomicBool,
        pub fail_send: std::sync::atomic::AtomicBool,
    }

    impl FakeLink {
        pub fn new(id: LinkId) -> FakeLink {
            FakeLink {
                id,
                addr: Ipv4Addr::UNSPECIFIED,
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                mtu: 1500,
                overhead: 14,
                supports_filter: true,
                sent: Mutex::new(Vec::new()),
                fail_filter: std::sync::atomic::AtomicBool::new(false),
                fail_send: std::sync::atomic::AtomicBool::new(false),
            }
        }

        pub fn sent_packets(&self) -> Vec<OutboundPacket> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl NetworkLink for FakeLink {
        fn id(&self) -> LinkId {
            self.id
        }

        fn ipv4_address(&self) -> Ipv4Addr {
            self.addr
        }

        fn ipv4_netmask(&self) -> Ipv4Addr {
            self.netmask
        }

        fn header_footer_overhead(&self) -> usize {
            self.overhead
        }

        fn mtu(&self) -> usize {
            self.mtu
        }

        fn supports_multicast_filter(&self) -> bool {
            self.supports_filter
        }

        fn set_multicast_filter(&self, _group: Ipv4Addr, _enabled: bool) -> Result<(), IgmpError> {
            if self.fail_filter.load(std::sync::atomic::Ordering::SeqCst) {
                Err(IgmpError::HardwareProgramFailure { status: -1 })
            } else {
                Ok(())
            }
        }

        fn send(&self, packet: OutboundPacket) -> Result<(), IgmpError> {
            if self.fail_send.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(IgmpError::Exhausted);
            }
            self.sent.lock().unwrap().push(packet);
            Ok(())
        }
    }
}

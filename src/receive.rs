//! Inbound IGMP datagram validation and dispatch (spec §4.8).

use std::net::Ipv4Addr;

use crate::collaborators::LinkId;
use crate::link;
use crate::link_table;
use crate::wire::{self, IgmpRepr};

/// Everything the receive path needs about one inbound packet, bundled the
/// way the source's "receive context" groups network-link, packet, source,
/// and destination address.
pub struct ReceiveContext<'a> {
    pub link_id: LinkId,
    pub data: &'a [u8],
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    /// Whether the IPv4 router-alert option was present on this datagram.
    pub has_router_alert: bool,
}

/// Validate and dispatch one inbound IGMP datagram (spec §4.8).
///
/// Unsubscribed links, malformed packets, and message types this host
/// never acts on are silently dropped — per §7, receive-path errors are
/// absorbed rather than propagated.
pub fn receive(ctx: ReceiveContext<'_>) {
    let link = match link_table::lookup(ctx.link_id) {
        Some(link) => link,
        None => {
            #[cfg(feature = "log")]
            log::debug!("igmp: dropping packet for unsubscribed link {}", ctx.link_id);
            return;
        }
    };

    match wire::parse(ctx.data) {
        Ok(IgmpRepr::Query(query)) => {
            link::on_query_received(&link, query, ctx.dst, ctx.has_router_alert);
        }
        Ok(IgmpRepr::ReportV1 { group_addr }) => {
            // v1 predates the router-alert requirement.
            link::on_report_received(&link, group_addr, ctx.src, true, false);
        }
        Ok(IgmpRepr::ReportV2 { group_addr }) => {
            link::on_report_received(&link, group_addr, ctx.src, ctx.has_router_alert, true);
        }
        Ok(IgmpRepr::ReportV3) | Ok(IgmpRepr::Leave) | Ok(IgmpRepr::Other) => {
            // v3 reports and leaves target routers, not hosts; other types
            // this host doesn't act on.
        }
        Err(_err) => {
            #[cfg(feature = "log")]
            log::debug!("igmp: dropping malformed packet on link {}: {:?}", ctx.link_id, _err);
        }
    }

    link_table::release(&link);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum;
    use crate::collaborators::{testutil::FakeLink, NetworkLink};
    use crate::timer::testutil::ManualTimerService;
    use byteorder::{BigEndian, ByteOrder};
    use std::sync::Arc;

    fn fresh_link() -> (Arc<FakeLink>, LinkId) {
        let (fake, link_id, _timers) = fresh_link_with_timers();
        (fake, link_id)
    }

    fn fresh_link_with_timers() -> (Arc<FakeLink>, LinkId, Arc<ManualTimerService>) {
        link_table::clear_for_test();
        let mut fake = FakeLink::new(42);
        fake.addr = Ipv4Addr::new(10, 0, 0, 1);
        let fake = Arc::new(fake);
        let net_link: Arc<dyn NetworkLink> = fake.clone();
        let timers = ManualTimerService::new();
        let link = link_table::create_or_lookup(net_link, timers.clone()).unwrap();
        (fake, link.id(), timers)
    }

    fn v1_query() -> Vec<u8> {
        let mut buf = vec![0u8; 8];
        buf[0] = 0x11;
        checksum::fill(&mut buf, 2);
        buf
    }

    #[test]
    fn unknown_link_is_silently_dropped() {
        link_table::clear_for_test();
        receive(ReceiveContext {
            link_id: 999,
            data: &v1_query(),
            src: Ipv4Addr::UNSPECIFIED,
            dst: crate::addr::ALL_SYSTEMS,
            has_router_alert: true,
        });
        // No panic, nothing to assert beyond "didn't crash".
    }

    #[test]
    fn v1_query_to_all_systems_downgrades_link() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (_fake, link_id) = fresh_link();
        let link = link_table::lookup(link_id).unwrap();
        assert_eq!(link.compat_mode(), wire::IgmpVersion::V3);
        link_table::release(&link);

        receive(ReceiveContext {
            link_id,
            data: &v1_query(),
            src: Ipv4Addr::UNSPECIFIED,
            dst: crate::addr::ALL_SYSTEMS,
            has_router_alert: true,
        });

        let link = link_table::lookup(link_id).unwrap();
        assert_eq!(link.compat_mode(), wire::IgmpVersion::V1);
        link_table::release(&link);
    }

    #[test]
    fn report_for_unjoined_group_is_ignored() {
        let (_fake, link_id) = fresh_link();
        let mut buf = vec![0u8; 8];
        buf[0] = 0x16;
        BigEndian::write_u32(&mut buf[4..8], u32::from(crate::addr::ALL_ROUTERS_V2));
        checksum::fill(&mut buf, 2);
        receive(ReceiveContext {
            link_id,
            data: &buf,
            src: Ipv4Addr::UNSPECIFIED,
            dst: crate::addr::ALL_ROUTERS_V2,
            has_router_alert: true,
        });
    }

    /// Spec §8 scenario S3: a v2 report from another host for a group this
    /// host has already reported on cancels the pending timer and clears
    /// `LastReport`, with no additional report sent.
    #[test]
    fn v2_report_from_peer_suppresses_pending_report() {
        let (fake, link_id) = fresh_link();
        let link = link_table::lookup(link_id).unwrap();
        let group_addr = Ipv4Addr::new(239, 4, 5, 6);
        link::join(&link, group_addr).unwrap();
        assert_eq!(fake.sent_packets().len(), 1, "join's own state-change report");
        link_table::release(&link);

        let mut buf = vec![0u8; 8];
        buf[0] = 0x16;
        BigEndian::write_u32(&mut buf[4..8], u32::from(group_addr));
        checksum::fill(&mut buf, 2);
        receive(ReceiveContext {
            link_id,
            data: &buf,
            src: Ipv4Addr::new(10, 0, 0, 99), // same /24 as the fake link's address
            dst: group_addr,
            has_router_alert: true,
        });

        assert_eq!(fake.sent_packets().len(), 1, "suppressed: no extra report sent");
    }

    /// Spec §4.2: a report whose source address is off the link's subnet is
    /// logged and dropped rather than honored — it must not cancel this
    /// host's own pending retransmission. Proven behaviorally: if the spoofed
    /// report wrongly cancelled the timer, the scheduled unsolicited
    /// retransmission below would never fire and no second packet would ever
    /// be sent.
    #[test]
    fn off_subnet_report_does_not_cancel_pending_retransmission() {
        let (fake, link_id, timers) = fresh_link_with_timers();
        let link = link_table::lookup(link_id).unwrap();
        let group_addr = Ipv4Addr::new(239, 4, 5, 7);
        link::join(&link, group_addr).unwrap();
        assert_eq!(fake.sent_packets().len(), 1, "join's own state-change report");
        link_table::release(&link);

        let mut buf = vec![0u8; 8];
        buf[0] = 0x16;
        BigEndian::write_u32(&mut buf[4..8], u32::from(group_addr));
        checksum::fill(&mut buf, 2);
        receive(ReceiveContext {
            link_id,
            data: &buf,
            src: Ipv4Addr::new(192, 168, 1, 1), // different subnet than the fake link
            dst: group_addr,
            has_router_alert: true,
        });

        assert!(
            timers.fire_next(),
            "join's retransmission timer must still be armed"
        );
        assert_eq!(
            fake.sent_packets().len(),
            2,
            "the scheduled retransmission still fires"
        );
    }
}

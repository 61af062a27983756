//! Per-IPv4-socket multicast group membership table (spec §4.4), the layer
//! that turns the `JoinMulticastGroup`/`LeaveMulticastGroup` socket options
//! (spec §6) into IGMP join/leave calls.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use crate::collaborators::NetworkLink;
use crate::error::IgmpError;
use crate::link::{self, Link};
use crate::link_table;
use crate::timer::TimerService;

/// One (link, link-address, multicast-address) membership held by a socket.
struct SocketMembership {
    link: Arc<Link>,
    link_address: Ipv4Addr,
    group_address: Ipv4Addr,
}

/// Per-socket multicast membership list (spec §3, §4.4).
///
/// The source lazily allocates this table's lock on first use via atomic
/// compare-exchange, so a socket that never touches multicast pays nothing
/// for it. `std::sync::Mutex` has no such cost to dodge — constructing one
/// is a plain in-place write, not a syscall or allocation — so this table
/// is just a plain field, matching the *effect* (no per-socket multicast
/// overhead until first use) without needing the CAS trick.
#[derive(Default)]
pub struct SocketMulticastTable {
    entries: Mutex<Vec<SocketMembership>>,
}

/// Resolve a join/leave request's interface (spec §4.4): an unspecified
/// `link_address` selects the first candidate with a route to the
/// multicast address (here, simply the first candidate — this crate has no
/// routing table of its own); a specified `link_address` selects the
/// candidate whose configured IPv4 address matches it exactly.
fn select_link(candidates: &[Arc<dyn NetworkLink>], link_address: Ipv4Addr) -> Option<Arc<dyn NetworkLink>> {
    if link_address.is_unspecified() {
        candidates.first().cloned()
    } else {
        candidates.iter().find(|c| c.ipv4_address() == link_address).cloned()
    }
}

impl SocketMulticastTable {
    pub fn new() -> SocketMulticastTable {
        SocketMulticastTable::default()
    }

    /// A freshly forked/accepted socket never inherits multicast state
    /// (spec §4.4 "Fork/copy"): construct a new, empty table rather than
    /// cloning the parent's.
    pub fn forked() -> SocketMulticastTable {
        SocketMulticastTable::default()
    }

    /// `JoinMulticastGroup` (spec §4.4, §6).
    ///
    /// `candidates` is the set of network links this host could possibly
    /// join on (the interface table the socket layer sits on top of). With
    /// `link_address` unspecified, the first candidate is used — standing in
    /// for "select a link with a route to the multicast address," since the
    /// actual routing table is the IPv4 datagram engine's job and out of
    /// scope here. Otherwise the candidate whose configured IPv4 address
    /// equals `link_address` is used. Either way, no match is `NotFound`
    /// (the spec's "no-such-device"). Duplicate (link, link_address,
    /// group_address) tuples on the same socket also return `AddressInUse`.
    pub fn join(
        &self,
        candidates: &[Arc<dyn NetworkLink>],
        timer_service: Arc<dyn TimerService>,
        link_address: Ipv4Addr,
        group_address: Ipv4Addr,
    ) -> Result<(), IgmpError> {
        let net_link = select_link(candidates, link_address).ok_or(IgmpError::NotFound)?;
        let link = link_table::create_or_lookup(net_link, timer_service)?;

        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|e| {
            e.link.id() == link.id() && e.link_address == link_address && e.group_address == group_address
        }) {
            link_table::release(&link);
            return Err(IgmpError::AddressInUse);
        }

        // Program the hardware multicast filter before touching IGMP state
        // (spec §7 "hardware program failure"): on failure there is nothing
        // to roll back yet beyond the link reference just taken.
        if let Err(err) = link.net_link().set_multicast_filter(group_address, true) {
            #[cfg(feature = "log")]
            log::warn!("igmp: multicast filter enable failed for {}: {}", group_address, err);
            link_table::release(&link);
            return Err(err);
        }

        match link::join(&link, group_address) {
            Ok(()) => {
                entries.push(SocketMembership {
                    link,
                    link_address,
                    group_address,
                });
                Ok(())
            }
            Err(err) => {
                // Roll back: undo the filter we just programmed, free the
                // entry, don't hold a link reference.
                let _ = link.net_link().set_multicast_filter(group_address, false);
                link_table::release(&link);
                Err(err)
            }
        }
    }

    /// `LeaveMulticastGroup` (spec §4.4, §6). A missing entry returns
    /// `NotFound` (the spec's "invalid-address").
    pub fn leave(&self, link_address: Ipv4Addr, group_address: Ipv4Addr) -> Result<(), IgmpError> {
        let mut entries = self.entries.lock().unwrap();
        let index = entries
            .iter()
            .position(|e| e.link_address == link_address && e.group_address == group_address)
            .ok_or(IgmpError::NotFound)?;

        // Unprogram the filter before touching list membership and the
        // IGMP join counter, so a failure here leaves both untouched (spec
        // §7: "rolls back list membership and counter").
        if let Err(err) = entries[index].link.net_link().set_multicast_filter(group_address, false) {
            #[cfg(feature = "log")]
            log::warn!("igmp: multicast filter disable failed for {}: {}", group_address, err);
            return Err(err);
        }

        let entry = entries.remove(index);
        drop(entries);

        let result = link::leave(&entry.link, entry.group_address);
        link_table::release(&entry.link);
        result
    }

    /// Number of memberships currently held (diagnostic use).
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walk the list, issue an IGMP leave for each entry, and release its
    /// Link reference (spec §4.4 "Teardown"). Idempotent: a second call
    /// finds nothing to do.
    fn teardown(&self) {
        let entries: Vec<SocketMembership> = self.entries.lock().unwrap().drain(..).collect();
        for entry in entries {
            if let Err(_err) = entry.link.net_link().set_multicast_filter(entry.group_address, false) {
                #[cfg(feature = "log")]
                log::warn!(
                    "igmp: multicast filter disable failed for {} during teardown: {}",
                    entry.group_address,
                    _err
                );
            }
            let _ = link::leave(&entry.link, entry.group_address);
            link_table::release(&entry.link);
        }
    }
}

impl Drop for SocketMulticastTable {
    fn drop(&mut self) {
        self.teardown();
    }
}

//! One subscription of one link to one IPv4 multicast address (spec §4.3).

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::link::Link;
use crate::link_table;
use crate::timer::TimerHandle;

bitflags::bitflags! {
    /// Per-group flags (spec §3).
    pub struct GroupFlags: u8 {
        /// This host sent the most recent report for the group; it is
        /// obligated to send a leave when it departs.
        const LAST_REPORT = 0b001;
        /// The pending message is a state-change report, not a mere query
        /// response.
        const STATE_CHANGE = 0b010;
        /// The initial leave message for this group has already been sent.
        const LEAVE_SENT = 0b100;
    }
}

/// Mutable per-group protocol state (spec §3): join/send counters and flags.
///
/// Outlives removal from the owning `Link`'s group map — the leave
/// retransmission tail runs after a Group has already been unlinked (spec
/// §4.6), so this can't be keyed purely by map presence. Writers always
/// take the owning Link's lock first (spec §5's ordering guarantee is
/// expressed that way); this spinlock is the actual storage, following the
/// "Link lock before Group lock" convention used throughout this crate.
pub(crate) struct GroupState {
    pub join_count: u32,
    pub send_count: u8,
    pub flags: GroupFlags,
}

/// One subscription of one link to one IPv4 multicast address.
///
/// The map in the owning `Link`'s locked state holds an `Arc<Group>` for
/// exactly as long as the group is "on the list" (spec §3); a Group can
/// still be alive and retransmitting its leave sequence after that entry
/// is removed, kept alive by the timer callback's own cloned `Arc`.
pub struct Group {
    pub addr: Ipv4Addr,
    link: Arc<Link>,
    timer: TimerHandle,
    state: spin::Mutex<GroupState>,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group").field("addr", &self.addr).finish()
    }
}

impl Group {
    /// Allocate a new Group and take the Group→Link owning reference (spec
    /// §9: "Group → Link is an owning reference").
    ///
    /// `link` must already be a counted handle the caller obtained from
    /// [`crate::link_table`]; this call adds one more independent reference
    /// for the Group's own lifetime, released in `Drop`.
    pub(crate) fn create(link: &Arc<Link>, addr: Ipv4Addr) -> Arc<Group> {
        link.add_ref();
        #[cfg(feature = "log")]
        log::trace!("igmp: group {} created on link {}", addr, link.id());
        Arc::new(Group {
            addr,
            link: link.clone(),
            timer: TimerHandle::new(link.timer_service()),
            state: spin::Mutex::new(GroupState {
                join_count: 1,
                send_count: 0,
                flags: GroupFlags::empty(),
            }),
        })
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub fn timer(&self) -> &TimerHandle {
        &self.timer
    }

    pub(crate) fn state(&self) -> spin::MutexGuard<'_, GroupState> {
        self.state.lock()
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        #[cfg(feature = "log")]
        log::trace!("igmp: group {} destroyed on link {}", self.addr, self.link.id());
        link_table::release(&self.link);
    }
}

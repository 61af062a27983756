//! Per-network-interface IGMP state: compatibility mode, query parameters,
//! group list, and the timers that drive retransmission (spec §4.2).

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::addr;
use crate::collaborators::{LinkId, NetworkLink};
use crate::error::{CancelStatus, IgmpError};
use crate::group::{Group, GroupFlags};
use crate::link_table;
use crate::timer::{TimerHandle, TimerService};
use crate::transmit;
use crate::wire::{self, IgmpVersion, MessageType, QueryRepr, RecordType};

/// Unsolicited-report retransmission interval: 10 tenths-of-a-second (spec §4.2).
const UNSOLICITED_REPORT_INTERVAL: Duration = Duration::from_millis(1000);

/// Per-link tunables (spec §3), defaults per spec.
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    pub robustness_variable: u8,
    pub query_interval_secs: u32,
    pub max_response_time_deciseconds: u32,
}

impl Default for LinkConfig {
    fn default() -> LinkConfig {
        LinkConfig {
            robustness_variable: 2,
            query_interval_secs: 125,
            max_response_time_deciseconds: 100,
        }
    }
}

struct LinkState {
    config: LinkConfig,
    v1_timer: TimerHandle,
    v2_timer: TimerHandle,
    /// Whole-link report timer, used to answer a v3 general query with a
    /// single packet covering every group (spec §4.2).
    report_timer: TimerHandle,
    groups: BTreeMap<Ipv4Addr, Arc<Group>>,
}

/// Per-network-interface IGMP state (spec §3, §4.2).
pub struct Link {
    net_link: Arc<dyn NetworkLink>,
    timer_service: Arc<dyn TimerService>,
    max_packet_size: usize,
    /// Mirrors the spec's Link reference count: the table's slot plus one
    /// per `Arc<Link>` a Group or socket membership entry is holding.
    refcount: AtomicUsize,
    state: Mutex<LinkState>,
}

impl Link {
    pub(crate) fn new(net_link: Arc<dyn NetworkLink>, timer_service: Arc<dyn TimerService>) -> Arc<Link> {
        let max_packet_size = transmit::max_packet_size(&*net_link);
        Arc::new(Link {
            net_link,
            timer_service: timer_service.clone(),
            max_packet_size,
            refcount: AtomicUsize::new(1),
            state: Mutex::new(LinkState {
                config: LinkConfig::default(),
                v1_timer: TimerHandle::new(timer_service.clone()),
                v2_timer: TimerHandle::new(timer_service.clone()),
                report_timer: TimerHandle::new(timer_service),
                groups: BTreeMap::new(),
            }),
        })
    }

    pub fn id(&self) -> LinkId {
        self.net_link.id()
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    pub fn net_link(&self) -> &Arc<dyn NetworkLink> {
        &self.net_link
    }

    pub(crate) fn timer_service(&self) -> Arc<dyn TimerService> {
        self.timer_service.clone()
    }

    pub(crate) fn add_ref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement and return the pre-decrement count. Only `link_table`
    /// calls this, inside the table's exclusive lock (spec §4.1).
    pub(crate) fn dec_ref(&self) -> usize {
        self.refcount.fetch_sub(1, Ordering::AcqRel)
    }

    pub(crate) fn group_list_is_empty(&self) -> bool {
        self.state.lock().unwrap().groups.is_empty()
    }

    /// Current compatibility mode: the lowest-indexed version whose
    /// compatibility timer is still armed, else v3 (spec §4.2).
    pub fn compat_mode(&self) -> IgmpVersion {
        let state = self.state.lock().unwrap();
        compat_mode_locked(&state)
    }

    pub fn config(&self) -> LinkConfig {
        self.state.lock().unwrap().config
    }
}

fn compat_mode_locked(state: &LinkState) -> IgmpVersion {
    if state.v1_timer.is_armed() {
        IgmpVersion::V1
    } else if state.v2_timer.is_armed() {
        IgmpVersion::V2
    } else {
        IgmpVersion::V3
    }
}

fn compat_timer_duration(config: &LinkConfig) -> Duration {
    Duration::from_secs(config.robustness_variable as u64 * config.query_interval_secs as u64)
        + Duration::from_millis(config.max_response_time_deciseconds as u64 * 100)
}

/// Uniformly random delay in `(0, max_resp_deciseconds]`, converted from
/// 1/10-second units to milliseconds (spec §4.2, §9 "Randomized delays").
fn random_due(max_resp_deciseconds: u32) -> Instant {
    let max_millis = max_resp_deciseconds as u64 * 100;
    let delay_millis = if max_millis == 0 {
        0
    } else {
        rand::thread_rng().gen_range(1..=max_millis)
    };
    Instant::now() + Duration::from_millis(delay_millis)
}

/// Cancel every pending report timer (link-wide and per-group) after a
/// compatibility mode change (spec §4.2: "When the mode changes, all
/// pending report timers ... are cancelled so the next transmission uses
/// the new mode").
///
/// The link report timer's callback closure holds a counted reference to
/// `link` (spec §5: "the IGMP layer's timers hold their own references to
/// Group and Link"), taken when it was armed; a successful cancel here
/// means that callback will never run to release it, so this releases it
/// on the spot. A `TooLate` cancel leaves it alone — the callback is
/// already running (or about to) and will release it itself.
fn flush_report_timers_locked(link: &Arc<Link>, state: &mut LinkState) {
    if state.report_timer.is_armed() {
        let status = state.report_timer.cancel();
        if status != CancelStatus::TooLate {
            link_table::release(link);
        }
    }
    for group in state.groups.values() {
        group.timer().cancel();
    }
}

/// Handle an inbound query after the receive path has validated checksum
/// and length (spec §4.2's security filter, mode transitions, and
/// response scheduling).
pub fn on_query_received(link: &Arc<Link>, query: QueryRepr, dst: Ipv4Addr, has_router_alert: bool) {
    // Security filter.
    if query.group_addr == addr::ALL_SYSTEMS {
        return;
    }
    let is_general = query.group_addr == Ipv4Addr::UNSPECIFIED;
    if is_general && dst != addr::ALL_SYSTEMS {
        return;
    }
    if query.version != IgmpVersion::V1 && !has_router_alert {
        return;
    }

    let mut state = link.state.lock().unwrap();
    let previous_mode = compat_mode_locked(&state);

    match query.version {
        IgmpVersion::V1 => {
            let due = Instant::now() + compat_timer_duration(&state.config);
            // An armed timer's closure holds a counted reference to `link`
            // (spec §5); only take a fresh one the first time it's armed —
            // a rearm while already armed supersedes the pending callback
            // without handing out a second reference for it.
            if !state.v1_timer.is_armed() {
                link.add_ref();
            }
            let link_for_timer = link.clone();
            state.v1_timer.arm(due, move || on_v1_timer_expiry(link_for_timer));
        }
        IgmpVersion::V2 => {
            let due = Instant::now() + compat_timer_duration(&state.config);
            if !state.v2_timer.is_armed() {
                link.add_ref();
            }
            let link_for_timer = link.clone();
            state.v2_timer.arm(due, move || on_v2_timer_expiry(link_for_timer));
        }
        IgmpVersion::V3 => {
            if query.querier_robustness_variable != 0 {
                state.config.robustness_variable = query.querier_robustness_variable;
            }
            if query.querier_query_interval != 0 {
                state.config.query_interval_secs = query.querier_query_interval;
            }
        }
    }

    let current_mode = compat_mode_locked(&state);
    if current_mode != previous_mode {
        #[cfg(feature = "log")]
        log::debug!("igmp: link {} compat mode {:?} -> {:?}", link.id(), previous_mode, current_mode);
        flush_report_timers_locked(link, &mut state);
    }

    let max_resp = if query.max_resp_time_deciseconds == 0 {
        state.config.max_response_time_deciseconds
    } else {
        query.max_resp_time_deciseconds
    };

    if current_mode == IgmpVersion::V3 && is_general {
        let due = random_due(max_resp);
        if !state.report_timer.is_armed() {
            link.add_ref();
        }
        let link_for_timer = link.clone();
        state
            .report_timer
            .arm_if_sooner(due, move || on_report_timer_expiry(link_for_timer));
    } else {
        for (&group_addr, group) in state.groups.iter() {
            if is_general || group_addr == query.group_addr {
                let due = random_due(max_resp);
                {
                    let mut gstate = group.state();
                    gstate.flags.remove(GroupFlags::STATE_CHANGE);
                    if gstate.send_count == 0 {
                        gstate.send_count = 1;
                    }
                }
                let link = link.clone();
                let group = group.clone();
                group
                    .timer()
                    .arm_if_sooner(due, move || on_group_timer_expiry(link, group));
            }
        }
    }
}

/// Report reception (spec §4.2): cancel the pending report timer and clear
/// `LastReport` for any matching group, but only for a report whose source
/// is the unspecified address or shares this link's subnet — any other
/// source is logged and dropped rather than honored, since an off-subnet
/// peer cannot be a genuine member of this link. v3 reports target routers
/// and are never passed here; the receive path ignores them outright.
pub fn on_report_received(link: &Arc<Link>, group_addr: Ipv4Addr, src: Ipv4Addr, has_router_alert: bool, is_v2: bool) {
    if is_v2 && !has_router_alert {
        return;
    }
    if !addr::is_local_subnet_source(src, link.net_link.ipv4_address(), link.net_link.ipv4_netmask()) {
        #[cfg(feature = "log")]
        log::debug!("igmp: dropping report for {} from off-subnet source {} on link {}", group_addr, src, link.id());
        return;
    }
    let state = link.state.lock().unwrap();
    if let Some(group) = state.groups.get(&group_addr) {
        group.timer().cancel();
        group.state().flags.remove(GroupFlags::LAST_REPORT);
    }
}

/// The v1 compatibility timer fired. Releases the reference `on_query_received`
/// took when it first armed this timer (spec §5).
fn on_v1_timer_expiry(link: Arc<Link>) {
    let mut state = link.state.lock().unwrap();
    let previous_mode = compat_mode_locked(&state);
    state.v1_timer.clear_armed();
    let current_mode = compat_mode_locked(&state);
    if current_mode != previous_mode {
        #[cfg(feature = "log")]
        log::debug!("igmp: link {} compat mode {:?} -> {:?} (v1 timer expired)", link.id(), previous_mode, current_mode);
        flush_report_timers_locked(&link, &mut state);
    }
    drop(state);
    link_table::release(&link);
}

/// The v2 compatibility timer fired. Releases the reference `on_query_received`
/// took when it first armed this timer (spec §5).
fn on_v2_timer_expiry(link: Arc<Link>) {
    let mut state = link.state.lock().unwrap();
    let previous_mode = compat_mode_locked(&state);
    state.v2_timer.clear_armed();
    let current_mode = compat_mode_locked(&state);
    if current_mode != previous_mode {
        #[cfg(feature = "log")]
        log::debug!("igmp: link {} compat mode {:?} -> {:?} (v2 timer expired)", link.id(), previous_mode, current_mode);
        flush_report_timers_locked(&link, &mut state);
    }
    drop(state);
    link_table::release(&link);
}

/// The whole-link v3 report timer fired: build and send as many v3 report
/// packets as needed to cover every reportable group (spec §4.2
/// "Transmission — link report"). Releases the reference taken when this
/// timer was armed (spec §5), whether or not there was anything to send.
fn on_report_timer_expiry(link: Arc<Link>) {
    let groups: Vec<Ipv4Addr> = {
        let mut state = link.state.lock().unwrap();
        state.report_timer.clear_armed();
        state.groups.keys().copied().collect()
    };

    if !groups.is_empty() {
        let records: Vec<(RecordType, Ipv4Addr)> = groups
            .into_iter()
            .map(|a| (RecordType::ModeIsExclude, a))
            .collect();

        let max_records_per_packet =
            (link.max_packet_size / wire::GROUP_RECORD_LEN).max(1).min(65535);
        for chunk in records.chunks(max_records_per_packet) {
            let payload = wire::emit_report_v3_multi(chunk);
            let _ = transmit::send(&*link.net_link, addr::ALL_ROUTERS_V3, &payload);
        }
    }

    link_table::release(&link);
}

/// A group's pending-message timer fired: continue whichever sequence is
/// in progress (spec §4.3's timer worker).
///
/// Takes the `Group` itself rather than an address to look up: by the time
/// the leave retransmission tail fires, the group is no longer on the
/// link's list, so a fresh lookup would find nothing. The closure's own
/// cloned `Arc<Group>` is what keeps it alive between retransmissions.
fn on_group_timer_expiry(link: Arc<Link>, group: Arc<Group>) {
    group.timer().clear_armed();
    let leave_sent = group.state().flags.contains(GroupFlags::LEAVE_SENT);
    if leave_sent {
        send_group_leave(&link, group);
    } else {
        send_group_report(&link, &group);
    }
}

/// Build and send the report packet for `group` at the link's current
/// compatibility mode, then re-arm for another retransmission if the
/// robustness count has not been exhausted (spec §4.2 "Transmission — per
/// group").
fn send_group_report(link: &Arc<Link>, group: &Arc<Group>) {
    let mode = link.compat_mode();
    let state_change = group.state().flags.contains(GroupFlags::STATE_CHANGE);

    let (dst, payload) = match mode {
        IgmpVersion::V1 => (group.addr, wire::emit_short(MessageType::ReportV1, group.addr).to_vec()),
        IgmpVersion::V2 => (group.addr, wire::emit_short(MessageType::ReportV2, group.addr).to_vec()),
        IgmpVersion::V3 => {
            let record_type = if state_change {
                RecordType::ChangeToExclude
            } else {
                RecordType::ModeIsExclude
            };
            (addr::ALL_ROUTERS_V3, wire::emit_report_v3(record_type, group.addr))
        }
    };
    if let Err(_err) = transmit::send(&*link.net_link, dst, &payload) {
        #[cfg(feature = "log")]
        log::trace!("igmp: report send failed for {} on link {}: {}", group.addr, link.id(), _err);
    }

    let still_on_list = link.state.lock().unwrap().groups.contains_key(&group.addr);
    let mut gstate = group.state();
    gstate.flags.insert(GroupFlags::LAST_REPORT);
    gstate.send_count = gstate.send_count.saturating_sub(1);
    if gstate.send_count > 0 && still_on_list {
        let due = Instant::now() + UNSOLICITED_REPORT_INTERVAL;
        let link = link.clone();
        let group_for_timer = group.clone();
        drop(gstate);
        group.timer().arm(due, move || on_group_timer_expiry(link, group_for_timer));
    }
}

/// Build and send the leave message for `group` (spec §4.2 "Transmission —
/// per group leave"). Consumes the caller's reference: if this is the last
/// transmission, the `Arc<Group>` drop below may destroy the group.
fn send_group_leave(link: &Arc<Link>, group: Arc<Group>) {
    let last_report = group.state().flags.contains(GroupFlags::LAST_REPORT);
    if !last_report {
        // Not the last reporter: nothing to announce. Releasing `group`
        // here (the caller's reference) may destroy it.
        return;
    }

    let mode = link.compat_mode();
    if mode != IgmpVersion::V1 {
        let (dst, payload) = match mode {
            IgmpVersion::V2 => (addr::ALL_ROUTERS_V2, wire::emit_short(MessageType::LeaveV2, group.addr).to_vec()),
            IgmpVersion::V3 => (
                addr::ALL_ROUTERS_V3,
                wire::emit_report_v3(RecordType::ChangeToInclude, group.addr),
            ),
            IgmpVersion::V1 => unreachable!(),
        };
        if let Err(_err) = transmit::send(&*link.net_link, dst, &payload) {
            #[cfg(feature = "log")]
            log::trace!("igmp: leave send failed for {} on link {}: {}", group.addr, link.id(), _err);
        }
    }

    let mut gstate = group.state();
    gstate.flags.insert(GroupFlags::LEAVE_SENT);
    gstate.send_count = gstate.send_count.saturating_sub(1);
    if gstate.send_count > 0 {
        let due = Instant::now() + UNSOLICITED_REPORT_INTERVAL;
        let link = link.clone();
        let group_for_timer = group.clone();
        drop(gstate);
        group.timer().arm(due, move || on_group_timer_expiry(link, group_for_timer));
    }
    // When send_count reaches 0, nothing re-clones `group`: both the
    // caller's reference (dropped below) and the one-time rearm above are
    // gone, so this is the last hold and the Group is destroyed here.
}

/// IGMP join (spec §4.5): look up or create the Link, then the Group,
/// incrementing `join_count` on an existing membership or creating a fresh
/// one and emitting the initial state-change report.
pub fn join(link: &Arc<Link>, group_addr: Ipv4Addr) -> Result<(), IgmpError> {
    if !addr::is_reportable(group_addr) {
        return Ok(());
    }

    let group = loop {
        let mut state = link.state.lock().unwrap();
        if let Some(existing) = state.groups.get(&group_addr) {
            existing.state().join_count += 1;
            return Ok(());
        }
        // No allocation under the lock: release it, build the Group, then
        // retry in case another thread created one in the meantime.
        drop(state);
        let new_group = Group::create(link, group_addr);
        state = link.state.lock().unwrap();
        if state.groups.contains_key(&group_addr) {
            continue;
        }
        {
            let mut gstate = new_group.state();
            gstate.send_count = state.config.robustness_variable;
            gstate.flags.insert(GroupFlags::STATE_CHANGE | GroupFlags::LAST_REPORT);
        }
        state.groups.insert(group_addr, new_group.clone());
        break new_group;
        // `state` guard drops here, releasing the Link lock before the
        // report is sent (spec §4.5: "no report sent while holding the lock").
    };

    send_group_report(link, &group);
    Ok(())
}

/// IGMP leave (spec §4.6): decrement `join_count`; on the last leave,
/// unlink the Group from the list, cancel its timer, and emit the leave
/// sequence (or release it immediately if this host was never the last
/// reporter or the link is down).
pub fn leave(link: &Arc<Link>, group_addr: Ipv4Addr) -> Result<(), IgmpError> {
    if !addr::is_reportable(group_addr) {
        return Ok(());
    }

    let group = {
        let mut state = link.state.lock().unwrap();
        let group = state.groups.get(&group_addr).ok_or(IgmpError::NotFound)?.clone();
        {
            let mut gstate = group.state();
            gstate.join_count = gstate.join_count.saturating_sub(1);
            if gstate.join_count > 0 {
                return Ok(());
            }
            gstate.send_count = state.config.robustness_variable;
            gstate.flags.insert(GroupFlags::STATE_CHANGE);
        }
        state.groups.remove(&group_addr);
        group
    };

    // Cancel-then-flush before any subsequent mutation (spec §4.6, §5):
    // a `TooLate` cancel means the worker is already running and will
    // observe the state written above under the group's own lock.
    group.timer().cancel();

    send_group_leave(link, group);
    Ok(())
}

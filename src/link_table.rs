//! Process-wide mapping from network-link identity to `Link` (spec §4.1).
//!
//! Ordered container (`BTreeMap` standing in for the source's red-black
//! tree), protected by a reader/writer lock. The table's own slot in a
//! `Link`'s reference count is what makes `lookup`/`create_or_lookup`
//! return a *counted* handle: every caller that gets an `Arc<Link>` out of
//! this module owns one reference and must eventually call [`release`].

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::collaborators::{LinkId, NetworkLink};
use crate::error::IgmpError;
use crate::link::Link;
use crate::timer::TimerService;

type Table = RwLock<BTreeMap<LinkId, Arc<Link>>>;

static TABLE: OnceLock<Table> = OnceLock::new();

fn table() -> &'static Table {
    TABLE.get_or_init(|| RwLock::new(BTreeMap::new()))
}

/// Shared lock, returns a counted handle if the link is already registered.
pub fn lookup(id: LinkId) -> Option<Arc<Link>> {
    let guard = table().read().unwrap();
    let link = guard.get(&id)?.clone();
    link.add_ref();
    Some(link)
}

/// Exclusive lock: insert a freshly allocated `Link` if none exists for
/// `net_link`'s identity, else return the existing one. Either way the
/// returned handle carries one counted reference.
///
/// Fails with `Unsupported` if the network link cannot be programmed to
/// filter multicast frames (spec §4.1 creation precondition).
pub fn create_or_lookup(
    net_link: Arc<dyn NetworkLink>,
    timer_service: Arc<dyn TimerService>,
) -> Result<Arc<Link>, IgmpError> {
    let id = net_link.id();
    let mut guard = table().write().unwrap();
    if let Some(existing) = guard.get(&id) {
        existing.add_ref();
        return Ok(existing.clone());
    }
    if !net_link.supports_multicast_filter() {
        return Err(IgmpError::Unsupported);
    }
    let link = Link::new(net_link, timer_service);
    link.add_ref(); // the caller's returned handle, in addition to the table's own.
    #[cfg(feature = "log")]
    log::debug!("igmp: link {} created", id);
    guard.insert(id, link.clone());
    Ok(link)
}

/// Release one counted reference to `link` (spec §4.1 "Dereference").
///
/// When the post-decrement count is 1 (only the table's own reference
/// remains) and the link's group list is empty, the entry is removed from
/// the table and the table's own reference is dropped with it, which runs
/// `Link`'s destructor if that was the last `Arc` clone.
pub fn release(link: &Arc<Link>) {
    let mut guard = table().write().unwrap();
    let prev = link.dec_ref();
    if prev == 2 && link.group_list_is_empty() {
        #[cfg(feature = "log")]
        log::debug!("igmp: link {} removed from table", link.id());
        guard.remove(&link.id());
    }
}

#[cfg(test)]
pub(crate) fn clear_for_test() {
    table().write().unwrap().clear();
}

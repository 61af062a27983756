//! The timer triple: a safe path from timer expiry to task-context work
//! (spec §4, §5, §9 "Timer triple").
//!
//! The design note in spec §9 permits collapsing `Timer + DPC + WorkItem`
//! into one callback when the runtime allows allocating or blocking from a
//! timer expiry — true for a userspace background thread, so
//! [`StdTimerService`] runs callbacks directly on its worker thread rather
//! than bouncing through a separate work-queue.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::error::CancelStatus;

/// Opaque handle a `TimerService` hands back from `create_timer` (spec §6).
pub type TimerId = u64;

type Callback = Box<dyn FnOnce() + Send>;

/// The timer collaborator (spec §6): `create_timer`, `queue_timer`,
/// `cancel_timer`, `destroy_timer`.
pub trait TimerService: Send + Sync {
    fn create_timer(&self) -> TimerId;
    fn queue_timer(&self, id: TimerId, due: Instant, callback: Callback);
    fn cancel_timer(&self, id: TimerId) -> CancelStatus;
    fn destroy_timer(&self, id: TimerId);
}

/// A per-object timer built on a `TimerService`, tracking the currently
/// armed due time so callers can implement "don't reschedule if already
/// armed with a sooner due time" (spec §4.2).
pub struct TimerHandle {
    service: Arc<dyn TimerService>,
    id: TimerId,
    armed_due: Mutex<Option<Instant>>,
}

impl TimerHandle {
    pub fn new(service: Arc<dyn TimerService>) -> TimerHandle {
        let id = service.create_timer();
        TimerHandle {
            service,
            id,
            armed_due: Mutex::new(None),
        }
    }

    /// Unconditionally (re)arm at `due`, replacing any pending callback.
    pub fn arm(&self, due: Instant, callback: impl FnOnce() + Send + 'static) {
        *self.armed_due.lock().unwrap() = Some(due);
        self.service.queue_timer(self.id, due, Box::new(callback));
    }

    /// Arm at `due` unless already armed with an equal or sooner due time
    /// (the randomized-delay policy in spec §4.2).
    pub fn arm_if_sooner(&self, due: Instant, callback: impl FnOnce() + Send + 'static) {
        let mut guard = self.armed_due.lock().unwrap();
        if let Some(existing) = *guard {
            if existing <= due {
                return;
            }
        }
        *guard = Some(due);
        drop(guard);
        self.service.queue_timer(self.id, due, Box::new(callback));
    }

    /// Cancel the pending callback, if any. A `TooLate` result means the
    /// worker has already started (or is about to); the armed-due
    /// bookkeeping is left untouched so a racing worker still sees it.
    pub fn cancel(&self) -> CancelStatus {
        let status = self.service.cancel_timer(self.id);
        if status != CancelStatus::TooLate {
            *self.armed_due.lock().unwrap() = None;
        }
        status
    }

    /// Whether this handle believes it currently has a pending callback.
    pub fn is_armed(&self) -> bool {
        self.armed_due.lock().unwrap().is_some()
    }

    /// Called from within a fired callback to clear the armed bookkeeping
    /// before re-arming or releasing references (spec §5 ordering).
    pub fn clear_armed(&self) {
        *self.armed_due.lock().unwrap() = None;
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.service.destroy_timer(self.id);
    }
}

struct Entry {
    due: Instant,
    id: TimerId,
    seq: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due)
    }
}

struct Shared {
    heap: BinaryHeap<Reverse<Entry>>,
    callbacks: HashMap<(TimerId, u64), Callback>,
    active_seq: HashMap<TimerId, u64>,
    in_flight: HashSet<TimerId>,
    next_seq: u64,
    shutdown: bool,
}

/// A real, thread-backed `TimerService`: one background worker thread pops
/// the earliest due entry, runs its callback inline, and loops.
pub struct StdTimerService {
    shared: Arc<(Mutex<Shared>, Condvar)>,
    next_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StdTimerService {
    pub fn new() -> Arc<StdTimerService> {
        let shared = Arc::new((
            Mutex::new(Shared {
                heap: BinaryHeap::new(),
                callbacks: HashMap::new(),
                active_seq: HashMap::new(),
                in_flight: HashSet::new(),
                next_seq: 0,
                shutdown: false,
            }),
            Condvar::new(),
        ));

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("igmp-timer".into())
            .spawn(move || Self::run(worker_shared))
            .expect("failed to spawn igmp timer thread");

        Arc::new(StdTimerService {
            shared,
            next_id: AtomicU64::new(1),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn run(shared: Arc<(Mutex<Shared>, Condvar)>) {
        let (lock, condvar) = &*shared;
        let mut guard = lock.lock().unwrap();
        loop {
            if guard.shutdown {
                return;
            }
            match guard.heap.peek() {
                None => {
                    guard = condvar.wait(guard).unwrap();
                }
                Some(Reverse(top)) => {
                    let now = Instant::now();
                    if top.due > now {
                        let timeout = top.due - now;
                        let (g, _) = condvar.wait_timeout(guard, timeout).unwrap();
                        guard = g;
                    } else {
                        let Reverse(entry) = guard.heap.pop().unwrap();
                        if guard.active_seq.get(&entry.id) != Some(&entry.seq) {
                            // Stale: cancelled or superseded by a later arm.
                            continue;
                        }
                        guard.active_seq.remove(&entry.id);
                        let callback = guard.callbacks.remove(&(entry.id, entry.seq));
                        guard.in_flight.insert(entry.id);
                        drop(guard);
                        if let Some(callback) = callback {
                            callback();
                        }
                        guard = lock.lock().unwrap();
                        guard.in_flight.remove(&entry.id);
                    }
                }
            }
        }
    }
}

impl Drop for StdTimerService {
    fn drop(&mut self) {
        {
            let (lock, condvar) = &*self.shared;
            lock.lock().unwrap().shutdown = true;
            condvar.notify_all();
        }
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl TimerService for StdTimerService {
    fn create_timer(&self) -> TimerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn queue_timer(&self, id: TimerId, due: Instant, callback: Callback) {
        let (lock, condvar) = &*self.shared;
        let mut guard = lock.lock().unwrap();
        let seq = guard.next_seq;
        guard.next_seq += 1;
        guard.active_seq.insert(id, seq);
        guard.callbacks.insert((id, seq), callback);
        guard.heap.push(Reverse(Entry { due, id, seq }));
        condvar.notify_all();
    }

    fn cancel_timer(&self, id: TimerId) -> CancelStatus {
        let (lock, _) = &*self.shared;
        let mut guard = lock.lock().unwrap();
        if guard.in_flight.contains(&id) {
            return CancelStatus::TooLate;
        }
        match guard.active_seq.remove(&id) {
            Some(seq) => {
                guard.callbacks.remove(&(id, seq));
                CancelStatus::Cancelled
            }
            None => CancelStatus::NotArmed,
        }
    }

    fn destroy_timer(&self, id: TimerId) {
        let (lock, _) = &*self.shared;
        let mut guard = lock.lock().unwrap();
        if let Some(seq) = guard.active_seq.remove(&id) {
            guard.callbacks.remove(&(id, seq));
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// A deterministic `TimerService` for tests: callbacks never run on
    /// their own; test code drives time forward explicitly.
    pub struct ManualTimerService {
        shared: Mutex<Shared>,
    }

    impl ManualTimerService {
        pub fn new() -> Arc<ManualTimerService> {
            Arc::new(ManualTimerService {
                shared: Mutex::new(Shared {
                    heap: BinaryHeap::new(),
                    callbacks: HashMap::new(),
                    active_seq: HashMap::new(),
                    in_flight: HashSet::new(),
                    next_seq: 0,
                    shutdown: false,
                }),
            })
        }

        /// Number of currently-armed timers.
        pub fn pending_count(&self) -> usize {
            self.shared.lock().unwrap().active_seq.len()
        }

        /// Run every callback whose due time is `<= now`, earliest first.
        /// Returns how many ran.
        pub fn fire_due(&self, now: Instant) -> usize {
            let mut ran = 0;
            loop {
                let next = {
                    let mut guard = self.shared.lock().unwrap();
                    loop {
                        match guard.heap.peek() {
                            Some(Reverse(top)) if top.due <= now => {
                                let Reverse(entry) = guard.heap.pop().unwrap();
                                if guard.active_seq.get(&entry.id) != Some(&entry.seq) {
                                    continue;
                                }
                                guard.active_seq.remove(&entry.id);
                                let callback = guard.callbacks.remove(&(entry.id, entry.seq));
                                break callback;
                            }
                            _ => break None,
                        }
                    }
                };
                match next {
                    Some(callback) => {
                        callback();
                        ran += 1;
                    }
                    None => break,
                }
            }
            ran
        }

        /// Run the single earliest-armed callback regardless of its due
        /// time, as if time had been fast-forwarded to it. Returns whether
        /// one ran.
        pub fn fire_next(&self) -> bool {
            let next = {
                let mut guard = self.shared.lock().unwrap();
                loop {
                    match guard.heap.pop() {
                        Some(Reverse(entry)) => {
                            if guard.active_seq.get(&entry.id) != Some(&entry.seq) {
                                continue;
                            }
                            guard.active_seq.remove(&entry.id);
                            break guard.callbacks.remove(&(entry.id, entry.seq));
                        }
                        None => break None,
                    }
                }
            };
            match next {
                Some(callback) => {
                    callback();
                    true
                }
                None => false,
            }
        }
    }

    impl TimerService for ManualTimerService {
        fn create_timer(&self) -> TimerId {
            let mut guard = self.shared.lock().unwrap();
            guard.next_seq += 1;
            guard.next_seq
        }

        fn queue_timer(&self, id: TimerId, due: Instant, callback: Callback) {
            let mut guard = self.shared.lock().unwrap();
            let seq = guard.next_seq;
            guard.next_seq += 1;
            guard.active_seq.insert(id, seq);
            guard.callbacks.insert((id, seq), callback);
            guard.heap.push(Reverse(Entry { due, id, seq }));
        }

        fn cancel_timer(&self, id: TimerId) -> CancelStatus {
            let mut guard = self.shared.lock().unwrap();
            match guard.active_seq.remove(&id) {
                Some(seq) => {
                    guard.callbacks.remove(&(id, seq));
                    CancelStatus::Cancelled
                }
                None => CancelStatus::NotArmed,
            }
        }

        fn destroy_timer(&self, id: TimerId) {
            let mut guard = self.shared.lock().unwrap();
            if let Some(seq) = guard.active_seq.remove(&id) {
                guard.callbacks.remove(&(id, seq));
            }
        }
    }
}

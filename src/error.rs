//! Error taxonomy for the IGMP host stack (spec §7).

use std::fmt;

/// Errors returned by `join`/`leave` and the socket multicast table.
///
/// Receive-path and teardown code never returns this type: per §7 those
/// errors are absorbed (logged and dropped) rather than propagated.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgmpError {
    /// Allocation of a Link, Group, packet buffer, timer, or lock failed.
    #[error("insufficient resources to complete the request")]
    Exhausted,
    /// Leave on an address never joined, or lookup on an unknown link.
    #[error("no such multicast membership")]
    NotFound,
    /// Join with a (link, address) tuple already present on this socket.
    #[error("multicast group already joined on this socket")]
    AddressInUse,
    /// The network link cannot be programmed to filter multicast frames.
    #[error("link does not support multicast filtering")]
    Unsupported,
    /// The link's hardware multicast filter could not be updated.
    #[error("hardware multicast filter update failed: {status}")]
    HardwareProgramFailure {
        /// Opaque status code surfaced by the collaborator.
        status: i32,
    },
}

/// Alias kept for callers of the socket-option surface
/// (`join_multicast_group`/`leave_multicast_group`), matching the name
/// `smoltcp` itself uses for this error type.
pub type MulticastError = IgmpError;

/// Outcome of attempting to cancel an in-flight timer (spec §5, §6).
///
/// `TooLate` is not an error: the worker is already running (or about to
/// run) and will observe the latest link/group state under the link lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStatus {
    /// The timer was armed and has been disarmed; its callback will not run.
    Cancelled,
    /// The timer was not armed.
    NotArmed,
    /// The timer's callback has already started (or is about to); too late
    /// to cancel. Callers must rely on lock-protected state instead.
    TooLate,
}

impl fmt::Display for CancelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelStatus::Cancelled => write!(f, "cancelled"),
            CancelStatus::NotArmed => write!(f, "not armed"),
            CancelStatus::TooLate => write!(f, "too late"),
        }
    }
}

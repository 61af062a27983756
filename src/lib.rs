// SPDX-License-Identifier: 0BSD

//! IPv4 multicast group membership: the host side of IGMPv1, IGMPv2, and
//! IGMPv3.
//!
//! This crate owns the pieces a socket layer needs to implement
//! `IP_ADD_MEMBERSHIP`/`IP_DROP_MEMBERSHIP`: a per-link compatibility-mode
//! state machine ([`link`]), the per-group retransmission timers that keep
//! it honest ([`group`], [`timer`]), wire encoding/decoding for all three
//! protocol versions ([`wire`]), and the per-socket membership table
//! ([`socket`]) that turns socket-option calls into join/leave calls.
//!
//! Everything that touches the outside world — sending a frame, programming
//! a hardware multicast filter, scheduling a timer — goes through the
//! [`collaborators`] traits, so the protocol logic itself has no opinion
//! about what kind of network link it's running on.
//!
//! ```text
//! socket::SocketMulticastTable  (per-socket membership list)
//!     -> link_table              (process-wide Link lookup/creation)
//!         -> link::Link          (per-interface compat mode, query timers)
//!             -> group::Group    (per-membership report/leave timers)
//!                 -> transmit    (IPv4 + router-alert framing)
//!                     -> collaborators::NetworkLink  (caller-supplied)
//! ```

pub mod addr;
pub mod checksum;
pub mod collaborators;
pub mod error;
pub mod group;
pub mod link;
pub mod link_table;
pub mod receive;
pub mod socket;
pub mod timer;
pub mod transmit;
pub mod wire;

pub use collaborators::{LinkId, NetworkLink, OutboundPacket, PacketAllocator, StdPacketAllocator};
pub use error::{CancelStatus, IgmpError, MulticastError};
pub use link::{Link, LinkConfig};
pub use receive::{receive, ReceiveContext};
pub use socket::SocketMulticastTable;
pub use timer::{StdTimerService, TimerHandle, TimerId, TimerService};
pub use wire::IgmpVersion;

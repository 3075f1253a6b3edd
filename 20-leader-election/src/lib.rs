//! Single-coordinator leader election for a dynamic set of clients.
//!
//! One coordinator talks to many clients over independent, lossy,
//! bidirectional channels. It tracks which clients are alive through
//! heartbeats, keeps exactly one of them designated as the owner, and
//! re-elects whenever the owner goes away.
//!
//! - [`message`] defines the JSON line protocol in both directions and the
//!   boundary validator for inbound payloads.
//! - [`channel`] is the link abstraction: the coordinator-side
//!   [`channel::ClientChannel`] and the client-side [`channel::ClientEndpoint`].
//! - [`registry`] owns one [`registry::ClientRecord`] per live client.
//! - [`detector`] holds the per-client probe timers and the timeout sweep.
//! - [`election`] decides who owns and what everybody is told about it.
//! - [`coordinator`] is the event loop that serializes all of the above.
//! - [`transport`] exposes the coordinator over TCP, [`client`] is a small
//!   participant for trying it out, and [`cli`] wires both to the binary.

pub mod channel;
pub mod cli;
pub mod client;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod detector;
pub mod election;
pub mod message;
pub mod registry;
pub mod transport;

pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, CoordinatorHandle, CoordinatorStatus};
pub use message::{ClientId, ClientMessage, ServerMessage};

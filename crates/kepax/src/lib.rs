//! Key-based egalitarian Paxos.
//!
//! This crate provides per-key replicated agreement for a small, fixed set
//! of peer replicas. The API surface is intentionally small: higher layers
//! supply a [`Transport`], a [`CommitHandler`] and a [`RecoveryHandler`],
//! then drive mutations through [`Replica::submit`] and feed inbound frames
//! to [`Replica::receive`].
//!
//! Each key has its own sequence of committed mutations; there is no
//! cross-key ordering. A proposal commits after one round trip when every
//! responding replica agrees on the proposed sequence number (fast path),
//! or after an additional accept round when interference forces the
//! sequence number upward (slow path).

mod log;
mod replica;
mod state;
mod types;
mod wire;

pub use log::CommandLog;
pub use replica::Replica;
pub use types::{
    Ballot, CommitHandler, CommitPolicy, Config, DiffItem, LogEntry, Message, MessageKind,
    RecoveryHandler, Transport, MAX_REPLICAS,
};
pub use wire::{decode, encode, MSGLEN_MIN};

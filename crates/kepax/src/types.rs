//! Shared types for the replication engine.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by the protocol engine, the wire codec and the persistent log alike.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

/// Hard cap on group size: the replica index lives in the low byte of a ballot.
pub const MAX_REPLICAS: usize = 256;

/// Command time-to-live applied when the embedder passes a zero timeout.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Sweeper pass interval (roughly 20 Hz).
pub(crate) const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Ordering token used to resolve conflicts between competing proposals.
///
/// Packed as `(counter << 8) | replica_index` and compared numerically on the
/// full 64 bits, so at equal counters the replica with the higher index wins
/// ties deterministically. The counter is shared across all keys at a replica
/// and raised opportunistically on every inbound message.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ballot(u64);

impl Ballot {
    /// Highest counter value representable in the 56 counter bits.
    pub const COUNTER_MAX: u64 = (1 << 56) - 1;

    pub const fn new(counter: u64, replica: u8) -> Self {
        Self((counter << 8) | replica as u64)
    }

    /// Starting ballot for a fresh replica: counter 1, own index.
    pub const fn initial(replica: u8) -> Self {
        Self::new(1, replica)
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    pub const fn counter(self) -> u64 {
        self.0 >> 8
    }

    /// Index of the replica that issued this ballot.
    pub const fn replica(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.counter(), self.replica())
    }
}

/// Protocol frame discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    PreAccept = 1,
    PreAcceptResponse = 2,
    Accept = 3,
    AcceptResponse = 4,
    Commit = 5,
}

impl MessageKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::PreAccept),
            2 => Some(Self::PreAcceptResponse),
            3 => Some(Self::Accept),
            4 => Some(Self::AcceptResponse),
            5 => Some(Self::Commit),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Decoded protocol frame.
///
/// `ctype` is the opaque application command byte and travels only on COMMIT
/// frames; control frames carry zero. `data` is likewise empty except on
/// COMMIT.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub sender: String,
    pub ballot: Ballot,
    pub seq: u64,
    pub kind: MessageKind,
    pub ctype: u8,
    pub committed: bool,
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

impl Message {
    /// Build a control frame (no command type, no payload).
    pub fn control(
        sender: impl Into<String>,
        kind: MessageKind,
        ballot: Ballot,
        key: Vec<u8>,
        seq: u64,
        committed: bool,
    ) -> Self {
        Self {
            sender: sender.into(),
            ballot,
            seq,
            kind,
            ctype: 0,
            committed,
            key,
            data: Vec::new(),
        }
    }
}

/// Latest committed `(ballot, seq)` pair for a key. Zeroes when absent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogEntry {
    pub ballot: Ballot,
    pub seq: u64,
}

/// One row of a catch-up diff: a key whose ballot counter exceeds the
/// requested threshold, with its committed pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffItem {
    pub key: Vec<u8>,
    pub ballot: Ballot,
    pub seq: u64,
}

/// What the leader does when its own commit handler fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Destroy the command: no log update, no COMMIT broadcast. The
    /// submitter observes failure and higher layers retry.
    #[default]
    Abort,
    /// Record and broadcast regardless. Only safe when the embedder's apply
    /// is retryable or idempotent.
    BroadcastAnyway,
}

/// Per-replica configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory for the persistent per-key log.
    pub db_path: PathBuf,
    /// Opaque transport identifiers for every group member, self included.
    pub peers: Vec<String>,
    /// This replica's position in `peers`.
    pub my_index: u8,
    /// Command time-to-live; zero selects the 30 s default.
    pub timeout: Duration,
    /// Interval between expiry sweeps.
    pub sweep_interval: Duration,
    pub commit_policy: CommitPolicy,
}

impl Config {
    pub fn new(db_path: impl Into<PathBuf>, peers: Vec<String>, my_index: u8) -> Self {
        Self {
            db_path: db_path.into(),
            peers,
            my_index,
            timeout: DEFAULT_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            commit_policy: CommitPolicy::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.peers.is_empty(), "peer list is empty");
        anyhow::ensure!(
            self.peers.len() <= MAX_REPLICAS,
            "group of {} exceeds the {} replica cap",
            self.peers.len(),
            MAX_REPLICAS
        );
        anyhow::ensure!(
            (self.my_index as usize) < self.peers.len(),
            "replica index {} outside peer list of {}",
            self.my_index,
            self.peers.len()
        );
        anyhow::ensure!(
            !self.sweep_interval.is_zero(),
            "sweep interval must be non-zero"
        );
        Ok(())
    }

    /// Responses required from peers before a round can settle.
    ///
    /// This counts responses excluding self, so it is `floor(N/2)`: a strict
    /// majority once the proposer itself is included. With N=5 and two
    /// replicas down, the two surviving responses settle the round.
    pub fn quorum(&self) -> usize {
        self.peers.len() / 2
    }

    /// Transport identifier of this replica.
    pub fn local_id(&self) -> &str {
        &self.peers[self.my_index as usize]
    }

    /// Recipients for a broadcast: every member except self.
    pub fn peer_ids(&self) -> Vec<String> {
        self.peers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != self.my_index as usize)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Command time-to-live with the zero-means-default rule applied.
    pub fn effective_timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            self.timeout
        }
    }
}

/// Message transport for protocol frames.
///
/// The engine is transport-agnostic; concrete implementations can use TCP,
/// a mesh RPC layer, or in-memory delivery in tests. Delivery is best-effort
/// and may be arbitrarily reordered; correctness rests on ballot/seq
/// comparisons, not on delivery guarantees.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver `frame` to each named recipient, best effort.
    async fn send(&self, recipients: &[String], frame: Vec<u8>) -> anyhow::Result<()>;
}

/// Application commit handler: interpret and apply a mutation locally.
pub trait CommitHandler: Send + Sync + 'static {
    fn apply(&self, ctype: u8, key: &[u8], data: &[u8], leader: bool) -> anyhow::Result<()>;
}

/// Out-of-band catch-up helper.
///
/// Invoked when this replica suspects it holds a stale uncommitted record
/// for a key. The embedder pulls authoritative state from `peer` and reports
/// back through [`crate::Replica::recovered`].
#[async_trait]
pub trait RecoveryHandler: Send + Sync + 'static {
    async fn recover(&self, peer: &str, key: &[u8], seq: u64, ballot: Ballot)
        -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ballot_packs_counter_and_replica() {
        let b = Ballot::new(7, 3);
        assert_eq!(b.counter(), 7);
        assert_eq!(b.replica(), 3);
        assert_eq!(b.as_u64(), (7 << 8) | 3);
    }

    #[test]
    fn ballot_ties_break_on_replica_index() {
        assert!(Ballot::new(5, 4) > Ballot::new(5, 1));
        assert!(Ballot::new(6, 0) > Ballot::new(5, 255));
    }

    #[test]
    fn initial_ballot_is_counter_one() {
        assert_eq!(Ballot::initial(9).as_u64(), (1 << 8) | 9);
    }

    #[test]
    fn quorum_counts_peer_responses() {
        let cfg = Config::new(
            "/tmp/x",
            (1..=5).map(|i| format!("node{i}")).collect(),
            0,
        );
        assert_eq!(cfg.quorum(), 2);
        assert_eq!(cfg.peer_ids().len(), 4);
        assert!(!cfg.peer_ids().iter().any(|p| p == "node1"));
    }

    #[test]
    fn zero_timeout_selects_default() {
        let mut cfg = Config::new("/tmp/x", vec!["a".into(), "b".into(), "c".into()], 1);
        cfg.timeout = Duration::ZERO;
        assert_eq!(cfg.effective_timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn validate_rejects_bad_index() {
        let cfg = Config::new("/tmp/x", vec!["a".into(), "b".into()], 2);
        assert!(cfg.validate().is_err());
    }
}

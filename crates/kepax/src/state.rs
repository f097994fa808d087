//! In-memory command table.
//!
//! One active command per key. Commands are owned by the table; installing a
//! new command for a key returns the evicted predecessor, and dropping a
//! command fires its completion signal, which is how a blocked submitter is
//! woken on commit, eviction or expiry.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::types::Ballot;

/// Agreement progress of an in-flight command. Advances monotonically,
/// never rolls back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Status {
    PreAccepted,
    Accepted,
    Committed,
}

/// One response record collected by the command's driver.
#[derive(Clone, Debug)]
pub(crate) struct Vote {
    pub(crate) peer: String,
    pub(crate) seq: u64,
    pub(crate) ballot: Ballot,
}

/// In-flight command state for a single key.
pub(crate) struct Command {
    pub(crate) ctype: u8,
    pub(crate) data: Vec<u8>,
    pub(crate) status: Status,
    pub(crate) seq: u64,
    pub(crate) ballot: Ballot,
    pub(crate) votes: Vec<Vote>,
    pub(crate) max_seq: u64,
    pub(crate) max_seq_committed: bool,
    pub(crate) max_voter: Option<String>,
    pub(crate) updated_at: Instant,
    pub(crate) ttl: Duration,
    /// Completion signal for a blocked submitter. Dropped (and therefore
    /// fired) together with the command.
    pub(crate) waiter: Option<oneshot::Sender<()>>,
}

impl Command {
    /// Command installed by a local submission.
    pub(crate) fn new_local(
        ctype: u8,
        data: Vec<u8>,
        seq: u64,
        ballot: Ballot,
        ttl: Duration,
        waiter: oneshot::Sender<()>,
    ) -> Self {
        Self {
            ctype,
            data,
            status: Status::PreAccepted,
            seq,
            ballot,
            votes: Vec::new(),
            max_seq: 0,
            max_seq_committed: false,
            max_voter: None,
            updated_at: Instant::now(),
            ttl,
            waiter: Some(waiter),
        }
    }

    /// Command installed on behalf of another replica's proposal.
    pub(crate) fn new_remote(seq: u64, ballot: Ballot, ttl: Duration) -> Self {
        Self {
            ctype: 0,
            data: Vec::new(),
            status: Status::PreAccepted,
            seq,
            ballot,
            votes: Vec::new(),
            max_seq: 0,
            max_seq_committed: false,
            max_voter: None,
            updated_at: Instant::now(),
            ttl,
            waiter: None,
        }
    }

    /// Record a PRE_ACCEPT_RESPONSE vote and maintain the running maxima.
    ///
    /// `max_seq_committed` resets when a strictly higher seq arrives and
    /// accumulates (ORs) across votes that match the maximum.
    pub(crate) fn record_preaccept_vote(&mut self, vote: Vote, committed: bool) {
        if vote.seq > self.max_seq {
            self.max_seq = vote.seq;
            self.max_seq_committed = committed;
            self.max_voter = Some(vote.peer.clone());
        } else if vote.seq == self.max_seq {
            self.max_seq_committed |= committed;
            self.max_voter = Some(vote.peer.clone());
        }
        self.votes.push(vote);
    }

    /// Record an ACCEPT_RESPONSE vote.
    pub(crate) fn record_accept_vote(&mut self, vote: Vote) {
        if vote.seq >= self.max_seq {
            self.max_seq = vote.seq;
            self.max_voter = Some(vote.peer.clone());
        }
        self.votes.push(vote);
    }

    /// Votes agreeing exactly with the given proposal.
    pub(crate) fn count_matching(&self, seq: u64, ballot: Ballot) -> usize {
        self.votes
            .iter()
            .filter(|v| v.seq == seq && v.ballot == ballot)
            .count()
    }

    /// Discard collected votes and maxima before another round.
    pub(crate) fn reset_votes(&mut self) {
        self.votes.clear();
        self.max_seq = 0;
        self.max_voter = None;
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Instant::now();
    }

    pub(crate) fn expired(&self, now: Instant) -> bool {
        !self.ttl.is_zero() && now > self.updated_at + self.ttl
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        // The command is gone, whether committed, superseded or expired;
        // the submitter decides the outcome by consulting the log.
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(());
        }
    }
}

/// The command table: key -> active command.
pub(crate) struct State {
    pub(crate) commands: HashMap<Vec<u8>, Command>,
}

impl State {
    pub(crate) fn new() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }

    /// Install a command for `key`, returning the evicted predecessor if one
    /// was active. Dropping the returned command wakes its submitter, which
    /// then observes failure (an overwritten command fails silently).
    pub(crate) fn install(&mut self, key: Vec<u8>, cmd: Command) -> Option<Command> {
        self.commands.insert(key, cmd)
    }

    /// Remove the command for `key`, transferring ownership to the caller.
    pub(crate) fn remove(&mut self, key: &[u8]) -> Option<Command> {
        self.commands.remove(key)
    }

    /// Drain every command past its deadline.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<(Vec<u8>, Command)> {
        let keys: Vec<Vec<u8>> = self
            .commands
            .iter()
            .filter(|(_, cmd)| cmd.expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| {
                let cmd = self.commands.remove(&key)?;
                Some((key, cmd))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(seq: u64) -> Command {
        Command::new_remote(seq, Ballot::new(1, 0), Duration::from_secs(1))
    }

    fn vote(peer: &str, seq: u64, ballot: Ballot) -> Vote {
        Vote {
            peer: peer.to_string(),
            seq,
            ballot,
        }
    }

    #[test]
    fn install_evicts_previous_command_for_key() {
        let mut state = State::new();
        assert!(state.install(b"k".to_vec(), remote(1)).is_none());
        let prev = state.install(b"k".to_vec(), remote(2)).expect("evicted");
        assert_eq!(prev.seq, 1);
        assert_eq!(state.commands.len(), 1);
    }

    #[test]
    fn eviction_wakes_the_previous_waiter() {
        let mut state = State::new();
        let (tx, mut rx) = oneshot::channel();
        let cmd = Command::new_local(0, Vec::new(), 1, Ballot::new(1, 0), Duration::from_secs(1), tx);
        state.install(b"k".to_vec(), cmd);
        assert!(rx.try_recv().is_err());
        drop(state.install(b"k".to_vec(), remote(2)));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn preaccept_votes_track_maxima() {
        let mut cmd = remote(1);
        let b = Ballot::new(1, 0);
        cmd.record_preaccept_vote(vote("node2", 3, b), false);
        assert_eq!(cmd.max_seq, 3);
        assert!(!cmd.max_seq_committed);
        cmd.record_preaccept_vote(vote("node3", 3, b), true);
        assert!(cmd.max_seq_committed);
        assert_eq!(cmd.max_voter.as_deref(), Some("node3"));
        // A lower seq does not disturb the maxima.
        cmd.record_preaccept_vote(vote("node4", 2, b), false);
        assert_eq!(cmd.max_seq, 3);
        assert!(cmd.max_seq_committed);
        // A higher seq resets the committed flag.
        cmd.record_preaccept_vote(vote("node5", 4, b), false);
        assert_eq!(cmd.max_seq, 4);
        assert!(!cmd.max_seq_committed);
        assert_eq!(cmd.votes.len(), 4);
    }

    #[test]
    fn count_matching_requires_seq_and_ballot() {
        let mut cmd = remote(1);
        let b1 = Ballot::new(1, 0);
        let b2 = Ballot::new(2, 0);
        cmd.record_accept_vote(vote("node2", 5, b1));
        cmd.record_accept_vote(vote("node3", 5, b2));
        cmd.record_accept_vote(vote("node4", 6, b2));
        assert_eq!(cmd.count_matching(5, b2), 1);
        assert_eq!(cmd.count_matching(5, b1), 1);
    }

    #[test]
    fn expiry_only_claims_overdue_commands() {
        let mut state = State::new();
        let mut overdue = remote(1);
        overdue.updated_at = Instant::now() - Duration::from_secs(5);
        state.install(b"old".to_vec(), overdue);
        state.install(b"new".to_vec(), remote(2));
        let expired = state.take_expired(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, b"old");
        assert!(state.commands.contains_key(b"new".as_slice()));
    }
}

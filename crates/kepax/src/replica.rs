//! Protocol engine: submission, the five frame handlers, quorum counting,
//! the leader commit procedure and the expiry sweeper.
//!
//! A proposal travels PRE_ACCEPT -> responses -> commit (fast path) or
//! PRE_ACCEPT -> responses -> ACCEPT -> responses -> commit (slow path).
//! Handlers compute under the state lock and call out (transport, commit
//! handler, recovery) after releasing it; the persistent log is written only
//! while the state lock is held, which keeps it single-writer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::log::CommandLog;
use crate::state::{Command, State, Status, Vote};
use crate::types::{
    Ballot, CommitHandler, CommitPolicy, Config, DiffItem, LogEntry, Message, MessageKind,
    RecoveryHandler, Transport,
};
use crate::wire;

pub struct Replica {
    config: Config,
    timeout: Duration,
    recipients: Vec<String>,
    log: CommandLog,
    ballot: AtomicU64,
    state: Mutex<State>,
    transport: Arc<dyn Transport>,
    committer: Arc<dyn CommitHandler>,
    recovery: Arc<dyn RecoveryHandler>,
    sweeper_started: AtomicBool,
    quit: AtomicBool,
}

impl Replica {
    /// Open the persistent log, seed the ballot from it and start the
    /// expiry sweeper. Must be called from within a tokio runtime.
    pub fn open(
        config: Config,
        transport: Arc<dyn Transport>,
        committer: Arc<dyn CommitHandler>,
        recovery: Arc<dyn RecoveryHandler>,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        let log = CommandLog::open(&config.db_path)?;
        let replica = Arc::new(Self {
            timeout: config.effective_timeout(),
            recipients: config.peer_ids(),
            ballot: AtomicU64::new(Ballot::initial(config.my_index).as_u64()),
            log,
            state: Mutex::new(State::new()),
            transport,
            committer,
            recovery,
            sweeper_started: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            config,
        });

        // Outrank everything this replica has itself committed.
        let recorded = replica.log.max_ballot()?;
        if !recorded.is_zero() {
            replica.observe_ballot(recorded);
        }

        replica.spawn_sweeper();
        info!(
            replicas = replica.config.peers.len(),
            local = replica.config.local_id(),
            ballot = ?replica.ballot(),
            "replica context created"
        );
        Ok(replica)
    }

    /// Stop the sweeper. In-flight submitters are left to their deadlines.
    pub fn shutdown(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }

    /// Current ballot.
    pub fn ballot(&self) -> Ballot {
        Ballot::from_u64(self.ballot.load(Ordering::SeqCst))
    }

    /// Raise the local ballot above an externally observed one.
    ///
    /// Every inbound frame passes through here, so the local ballot tracks
    /// the network maximum; the replica index in the low byte breaks ties.
    /// Never lowers the ballot.
    fn observe_ballot(&self, external: Ballot) {
        let next = external.counter() + 1;
        if next > Ballot::COUNTER_MAX {
            // Counter space exhausted. Wrapping would reorder history, so
            // refuse to advance; epoch coordination is an operator concern.
            tracing::error!(ballot = ?external, "ballot counter exhausted, refusing to advance");
            return;
        }
        let candidate = Ballot::new(next, self.config.my_index);
        self.ballot.fetch_max(candidate.as_u64(), Ordering::SeqCst);
    }

    /// Submit a mutation for `key` and block until it commits, is superseded
    /// or times out. Success means the committed log reached our proposed
    /// sequence number (possibly through someone else's commit).
    pub async fn submit(&self, ctype: u8, key: &[u8], data: &[u8]) -> anyhow::Result<()> {
        let (seq, ballot, rx) = {
            let mut state = self.state.lock().await;
            let prev = self.log.last_seq_for_key(key)?.seq;
            // A superseded command for the same key fails silently at its
            // submitter; our proposal must outrank it.
            let seq = match state.commands.get(key) {
                Some(prior) => (prev + 1).max(prior.seq + 1),
                None => prev + 1,
            };
            let ballot = self.ballot();
            let (tx, rx) = oneshot::channel();
            let cmd = Command::new_local(ctype, data.to_vec(), seq, ballot, self.timeout, tx);
            let evicted = state.install(key.to_vec(), cmd);
            drop(state);
            drop(evicted);
            (seq, ballot, rx)
        };

        debug!(
            key = %key_str(key),
            ctype,
            seq,
            ballot = ?ballot,
            "new command, broadcasting pre_accept"
        );
        let frame = wire::encode(&Message::control(
            self.config.local_id(),
            MessageKind::PreAccept,
            ballot,
            key.to_vec(),
            seq,
            false,
        ));
        match self.transport.send(&self.recipients, frame).await {
            Ok(()) => {
                // Committed, superseded or expired: any of them fires the
                // completion signal.
                if time::timeout(self.timeout, rx).await.is_err() {
                    self.reap_own_command(key, seq).await;
                }
            }
            Err(err) => {
                warn!(error = ?err, key = %key_str(key), "pre_accept broadcast failed");
                self.reap_own_command(key, seq).await;
            }
        }

        let committed = self.log.last_seq_for_key(key)?.seq;
        anyhow::ensure!(
            committed >= seq,
            "command for key {} did not commit (proposed seq {}, committed {})",
            key_str(key),
            seq,
            committed
        );
        Ok(())
    }

    /// Feed one inbound frame to the engine.
    ///
    /// Returns `Some(frame)` when the transport must carry a response back
    /// to the sender. Stale or duplicate protocol messages are dropped
    /// silently; malformed frames are an error.
    pub async fn receive(&self, frame: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let msg = wire::decode(frame)?;
        self.observe_ballot(msg.ballot);
        let response = match msg.kind {
            MessageKind::PreAccept => self.handle_pre_accept(msg).await?,
            MessageKind::PreAcceptResponse => {
                self.handle_pre_accept_response(msg).await?;
                None
            }
            MessageKind::Accept => self.handle_accept(msg).await?,
            MessageKind::AcceptResponse => {
                self.handle_accept_response(msg).await?;
                None
            }
            MessageKind::Commit => {
                self.handle_commit(msg).await?;
                None
            }
        };
        Ok(response.map(|msg| wire::encode(&msg)))
    }

    async fn handle_pre_accept(&self, msg: Message) -> anyhow::Result<Option<Message>> {
        let mut recover_from: Option<(String, u64, Ballot)> = None;
        let (ballot, max_seq, committed) = {
            let mut state = self.state.lock().await;
            let local = self.log.last_seq_for_key(&msg.key)?;
            if local.seq == msg.seq && local.ballot == msg.ballot {
                // Already committed; nothing to answer.
                return Ok(None);
            }

            let mut interfering = 0u64;
            match state.commands.get_mut(&msg.key) {
                Some(cmd) => {
                    if msg.ballot < cmd.ballot {
                        debug!(
                            key = %key_str(&msg.key),
                            msg_ballot = ?msg.ballot,
                            cmd_ballot = ?cmd.ballot,
                            "dropping stale pre_accept"
                        );
                        return Ok(None);
                    }
                    cmd.ballot = cmd.ballot.max(msg.ballot);
                    interfering = cmd.seq;
                }
                None => {
                    state.install(
                        msg.key.clone(),
                        Command::new_remote(msg.seq, msg.ballot, self.timeout),
                    );
                }
            }

            let interfering = interfering.max(local.seq);
            let max_seq = msg.seq.max(interfering);
            let cmd = state
                .commands
                .get_mut(&msg.key)
                .expect("command installed above");
            if msg.seq >= interfering {
                if cmd.status == Status::Accepted && cmd.ballot.replica() != self.config.my_index {
                    // Our uncommitted accept may be stale; ask its leader.
                    if let Some(peer) = self.config.peers.get(cmd.ballot.replica() as usize) {
                        recover_from = Some((peer.clone(), cmd.seq, cmd.ballot));
                    }
                }
                cmd.status = Status::PreAccepted;
                cmd.seq = interfering;
            }
            (cmd.ballot, max_seq, max_seq == local.seq)
        };

        if let Some((peer, seq, ballot)) = recover_from {
            if let Err(err) = self.recovery.recover(&peer, &msg.key, seq, ballot).await {
                warn!(error = ?err, peer = %peer, "recovery request failed");
            }
        }

        Ok(Some(Message::control(
            self.config.local_id(),
            MessageKind::PreAcceptResponse,
            ballot,
            msg.key,
            max_seq,
            committed,
        )))
    }

    async fn handle_pre_accept_response(&self, msg: Message) -> anyhow::Result<()> {
        enum Next {
            Commit(Command),
            Accept(Ballot, u64),
        }

        let next = {
            let mut state = self.state.lock().await;
            let Some(cmd) = state.commands.get_mut(&msg.key) else {
                return Ok(());
            };
            if msg.ballot < cmd.ballot || cmd.status != Status::PreAccepted {
                return Ok(());
            }

            cmd.record_preaccept_vote(
                Vote {
                    peer: msg.sender.clone(),
                    seq: msg.seq,
                    ballot: msg.ballot,
                },
                msg.committed,
            );
            if cmd.votes.len() < self.config.quorum() {
                return Ok(());
            }

            if cmd.seq > cmd.max_seq || (cmd.seq == cmd.max_seq && !cmd.max_seq_committed) {
                // Every responder agreed with our proposal as-is.
                let cmd = state.remove(&msg.key).expect("command present above");
                debug!(key = %key_str(&msg.key), seq = cmd.seq, "fast path commit");
                Next::Commit(cmd)
            } else {
                // Interference: adopt the highest observed seq plus one and
                // run the accept round.
                debug!(
                    key = %key_str(&msg.key),
                    our_seq = cmd.seq,
                    max_seq = cmd.max_seq,
                    max_voter = cmd.max_voter.as_deref().unwrap_or(""),
                    "slow path, running accept round"
                );
                cmd.seq = cmd.max_seq + 1;
                cmd.reset_votes();
                cmd.ballot = self.ballot();
                cmd.status = Status::Accepted;
                Next::Accept(cmd.ballot, cmd.seq)
            }
        };

        match next {
            Next::Commit(cmd) => self.commit_as_leader(&msg.key, cmd).await,
            Next::Accept(ballot, seq) => self.send_accept(&msg.key, ballot, seq).await,
        }
    }

    async fn handle_accept(&self, msg: Message) -> anyhow::Result<Option<Message>> {
        let mut state = self.state.lock().await;
        let local = self.log.last_seq_for_key(&msg.key)?;

        let mut accepted_ballot = msg.ballot;
        let mut accepted_seq = msg.seq;
        match state.commands.get(&msg.key) {
            Some(cmd) => {
                if msg.ballot < cmd.ballot {
                    debug!(key = %key_str(&msg.key), "dropping stale accept");
                    return Ok(None);
                }
                if msg.seq < cmd.seq {
                    // Keep our own pair; the response tells the proposer.
                    accepted_ballot = cmd.ballot;
                    accepted_seq = cmd.seq;
                }
            }
            None => {
                state.install(
                    msg.key.clone(),
                    Command::new_remote(0, Ballot::zero(), self.timeout),
                );
            }
        }

        let cmd = state
            .commands
            .get_mut(&msg.key)
            .expect("command installed above");
        if msg.seq >= cmd.seq {
            cmd.seq = msg.seq;
            cmd.ballot = msg.ballot;
            cmd.status = Status::Accepted;
            cmd.touch();
            accepted_ballot = msg.ballot;
            accepted_seq = msg.seq;
        }
        let committed = accepted_seq == local.seq;
        drop(state);

        debug!(
            key = %key_str(&msg.key),
            seq = accepted_seq,
            ballot = ?accepted_ballot,
            committed,
            peer = %msg.sender,
            "accepted"
        );
        Ok(Some(Message::control(
            self.config.local_id(),
            MessageKind::AcceptResponse,
            accepted_ballot,
            msg.key,
            accepted_seq,
            committed,
        )))
    }

    async fn handle_accept_response(&self, msg: Message) -> anyhow::Result<()> {
        enum Next {
            Commit(Command),
            Retry(Ballot, u64),
        }

        let next = {
            let mut state = self.state.lock().await;
            let Some(cmd) = state.commands.get_mut(&msg.key) else {
                return Ok(());
            };
            if msg.ballot < cmd.ballot || cmd.status != Status::Accepted {
                return Ok(());
            }

            if cmd.seq == msg.seq && msg.committed {
                // Some replica already committed this seq under a different
                // command for the key; move past it and try again.
                cmd.seq += 1;
                cmd.ballot = self.ballot();
                cmd.reset_votes();
                Next::Retry(cmd.ballot, cmd.seq)
            } else {
                cmd.record_accept_vote(Vote {
                    peer: msg.sender.clone(),
                    seq: msg.seq,
                    ballot: msg.ballot,
                });
                let count_ok = cmd.count_matching(msg.seq, msg.ballot);
                let quorum = self.config.quorum();
                if count_ok >= quorum {
                    let cmd = state.remove(&msg.key).expect("command present above");
                    debug!(key = %key_str(&msg.key), seq = cmd.seq, "accept quorum reached");
                    Next::Commit(cmd)
                } else if cmd.votes.len() >= quorum {
                    // Enough responses, not enough agreement: raise and retry.
                    if cmd.seq <= cmd.max_seq {
                        cmd.seq += 1;
                    }
                    cmd.ballot = self.ballot();
                    cmd.reset_votes();
                    debug!(key = %key_str(&msg.key), seq = cmd.seq, "accept round disagreed, retrying");
                    Next::Retry(cmd.ballot, cmd.seq)
                } else {
                    return Ok(());
                }
            }
        };

        match next {
            Next::Commit(cmd) => self.commit_as_leader(&msg.key, cmd).await,
            Next::Retry(ballot, seq) => self.send_accept(&msg.key, ballot, seq).await,
        }
    }

    async fn handle_commit(&self, msg: Message) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if let Some(cmd) = state.commands.get(&msg.key) {
            if cmd.seq == msg.seq && cmd.ballot > msg.ballot {
                debug!(
                    key = %key_str(&msg.key),
                    cmd_ballot = ?cmd.ballot,
                    msg_ballot = ?msg.ballot,
                    "ignoring commit, ballot too old"
                );
                return Ok(());
            }
        }
        let local = self.log.last_seq_for_key(&msg.key)?;
        if msg.seq < local.seq {
            debug!(
                key = %key_str(&msg.key),
                msg_seq = msg.seq,
                local_seq = local.seq,
                "ignoring commit, seq too old"
            );
            return Ok(());
        }

        debug!(key = %key_str(&msg.key), seq = msg.seq, ballot = ?msg.ballot, "committing");
        if let Err(err) = self
            .committer
            .apply(msg.ctype, &msg.key, &msg.data, false)
        {
            warn!(error = ?err, key = %key_str(&msg.key), "commit handler failed");
        }
        self.log
            .set_last_seq_for_key(&msg.key, msg.ballot, msg.seq)?;

        if state
            .commands
            .get(&msg.key)
            .is_some_and(|cmd| cmd.seq <= msg.seq)
        {
            // Dropping the superseded command wakes its submitter, which
            // then observes the committed seq.
            state.remove(&msg.key);
        }
        Ok(())
    }

    /// Leader-side commit: apply locally, record in the log, broadcast
    /// COMMIT. The log entry must be durable before any peer can observe
    /// the broadcast. Dropping `cmd` at the end wakes the submitter.
    async fn commit_as_leader(&self, key: &[u8], mut cmd: Command) -> anyhow::Result<()> {
        cmd.status = Status::Committed;
        if let Err(err) = self.committer.apply(cmd.ctype, key, &cmd.data, true) {
            match self.config.commit_policy {
                CommitPolicy::Abort => {
                    warn!(error = ?err, key = %key_str(key), "commit handler failed, aborting instance");
                    return Ok(());
                }
                CommitPolicy::BroadcastAnyway => {
                    warn!(error = ?err, key = %key_str(key), "commit handler failed, broadcasting anyway");
                }
            }
        }

        {
            let _state = self.state.lock().await;
            self.log.set_last_seq_for_key(key, cmd.ballot, cmd.seq)?;
        }

        let frame = wire::encode(&Message {
            sender: self.config.local_id().to_string(),
            ballot: cmd.ballot,
            seq: cmd.seq,
            kind: MessageKind::Commit,
            ctype: cmd.ctype,
            committed: true,
            key: key.to_vec(),
            data: cmd.data.clone(),
        });
        if let Err(err) = self.transport.send(&self.recipients, frame).await {
            warn!(error = ?err, key = %key_str(key), "commit broadcast failed");
        }
        Ok(())
    }

    /// Broadcast an ACCEPT round. A transport failure is log-only: replicas
    /// that did get the frame may still answer, and the round otherwise dies
    /// by expiry, not by error.
    async fn send_accept(&self, key: &[u8], ballot: Ballot, seq: u64) -> anyhow::Result<()> {
        let frame = wire::encode(&Message::control(
            self.config.local_id(),
            MessageKind::Accept,
            ballot,
            key.to_vec(),
            seq,
            false,
        ));
        if let Err(err) = self.transport.send(&self.recipients, frame).await {
            warn!(error = ?err, key = %key_str(key), "accept broadcast failed");
        }
        Ok(())
    }

    /// Record state pulled out-of-band from a peer. Returns whether the log
    /// was updated (stale pulls are dropped).
    pub async fn recovered(&self, key: &[u8], ballot: Ballot, seq: u64) -> anyhow::Result<bool> {
        let _state = self.state.lock().await;
        let local = self.log.last_seq_for_key(key)?;
        if seq >= local.seq && ballot >= local.ballot {
            self.log.set_last_seq_for_key(key, ballot, seq)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Committed sequence number for `key`; zero when never committed.
    pub fn seq(&self, key: &[u8]) -> anyhow::Result<u64> {
        Ok(self.log.last_seq_for_key(key)?.seq)
    }

    /// Committed `(ballot, seq)` pair for `key`.
    pub fn entry(&self, key: &[u8]) -> anyhow::Result<LogEntry> {
        self.log.last_seq_for_key(key)
    }

    /// Entries committed under a ballot counter newer than `since`'s, for
    /// catch-up helpers. Empty when the caller is already current.
    pub fn diff(&self, since: Ballot) -> anyhow::Result<Vec<DiffItem>> {
        if since.counter() >= self.log.max_ballot()?.counter() {
            return Ok(Vec::new());
        }
        self.log.diff_from_ballot(since)
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        if self.sweeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        // The task holds a weak handle so it cannot keep the replica alive.
        let weak = Arc::downgrade(self);
        let sweep_interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                let Some(replica) = weak.upgrade() else {
                    break;
                };
                if replica.quit.load(Ordering::SeqCst) {
                    break;
                }
                replica.sweep_once().await;
            }
        });
    }

    /// Drop every command past its deadline; for those that were being
    /// driven by another replica, ask the recovery helper to pull state
    /// from it. Dropping an expired command wakes its submitter.
    async fn sweep_once(&self) {
        let expired = {
            let mut state = self.state.lock().await;
            state.take_expired(Instant::now())
        };
        for (key, cmd) in expired {
            debug!(key = %key_str(&key), seq = cmd.seq, status = ?cmd.status, "command expired");
            self.reap(&key, cmd).await;
        }
    }

    /// Remove this submitter's command after its deadline passed without a
    /// wake. A replacement command always carries a higher seq, so a seq
    /// match identifies our own.
    async fn reap_own_command(&self, key: &[u8], seq: u64) {
        let removed = {
            let mut state = self.state.lock().await;
            if state
                .commands
                .get(key)
                .is_some_and(|cmd| cmd.seq == seq)
            {
                state.remove(key)
            } else {
                None
            }
        };
        if let Some(cmd) = removed {
            self.reap(key, cmd).await;
        }
    }

    /// Final accounting for a dead command: if it never settled and was
    /// being driven under another replica's ballot, that replica may know
    /// more than we do - ask the recovery helper to pull from it.
    async fn reap(&self, key: &[u8], cmd: Command) {
        if matches!(cmd.status, Status::PreAccepted | Status::Accepted)
            && cmd.ballot.replica() != self.config.my_index
        {
            let Some(peer) = self.config.peers.get(cmd.ballot.replica() as usize) else {
                return;
            };
            if let Err(err) = self.recovery.recover(peer, key, cmd.seq, cmd.ballot).await {
                warn!(error = ?err, peer = %peer, "recovery request failed");
            }
        }
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Printable rendition of an opaque key for log lines.
fn key_str(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

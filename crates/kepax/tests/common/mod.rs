//! Shared helpers for in-process cluster tests.
//!
//! The harness wires five replicas through a loopback transport that
//! delivers frames inline, shuffling recipient order on every broadcast the
//! way a real mesh would reorder them. Each node has an online flag;
//! deliveries to offline nodes are dropped on the floor. Response frames
//! travel back to the sender immediately.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;

use kepax::{Ballot, CommitHandler, Config, RecoveryHandler, Replica, Transport};

pub const NODES: [&str; 5] = ["node1", "node2", "node3", "node4", "node5"];

/// Opt-in engine logs while debugging a failure:
/// `KEPAX_TEST_LOG=kepax=debug cargo test`.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_env("KEPAX_TEST_LOG"))
            .try_init();
    });
}

struct NetNode {
    name: String,
    online: AtomicBool,
    replica: OnceLock<Arc<Replica>>,
}

/// The simulated network plus the counters the scenarios assert on.
pub struct TestNet {
    nodes: Vec<NetNode>,
    /// Total frames handed to the transport (one per recipient).
    pub messages_sent: AtomicUsize,
    /// Number of `send` invocations (one per broadcast).
    pub sends: AtomicUsize,
    /// Commit-handler firings across every replica.
    pub commits: AtomicUsize,
}

impl TestNet {
    pub fn new(names: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            nodes: names
                .iter()
                .map(|name| NetNode {
                    name: name.to_string(),
                    online: AtomicBool::new(false),
                    replica: OnceLock::new(),
                })
                .collect(),
            messages_sent: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
        })
    }

    fn register(&self, index: usize, replica: Arc<Replica>) {
        if self.nodes[index].replica.set(replica).is_err() {
            panic!("replica {index} registered twice");
        }
    }

    pub fn node(&self, index: usize) -> &Arc<Replica> {
        self.nodes[index].replica.get().expect("replica registered")
    }

    pub fn set_online(&self, index: usize, online: bool) {
        self.nodes[index].online.store(online, Ordering::SeqCst);
    }

    fn is_online(&self, name: &str) -> bool {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .is_some_and(|n| n.online.load(Ordering::SeqCst))
    }

    fn replica_by_name(&self, name: &str) -> Option<&Arc<Replica>> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .and_then(|n| n.replica.get())
    }
}

/// Inline delivery: run each recipient's handler, then feed any response
/// frame straight back into the sender.
pub struct LoopbackTransport {
    net: Arc<TestNet>,
    me: String,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, recipients: &[String], frame: Vec<u8>) -> anyhow::Result<()> {
        self.net.sends.fetch_add(1, Ordering::SeqCst);
        self.net
            .messages_sent
            .fetch_add(recipients.len(), Ordering::SeqCst);

        let mut order: Vec<String> = recipients.to_vec();
        order.shuffle(&mut rand::thread_rng());

        for peer in order {
            if !self.net.is_online(&peer) {
                continue;
            }
            let Some(target) = self.net.replica_by_name(&peer) else {
                continue;
            };
            let response = match target.receive(&frame).await {
                Ok(response) => response,
                Err(_) => None,
            };
            if let Some(response) = response {
                if let Some(me) = self.net.replica_by_name(&self.me) {
                    let _ = me.receive(&response).await;
                }
            }
        }
        Ok(())
    }
}

/// Counts every applied mutation, cluster-wide.
pub struct CountingCommit {
    net: Arc<TestNet>,
}

impl CommitHandler for CountingCommit {
    fn apply(&self, _ctype: u8, _key: &[u8], _data: &[u8], _leader: bool) -> anyhow::Result<()> {
        self.net.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Recovery helper that acknowledges and does nothing.
pub struct NullRecovery;

#[async_trait]
impl RecoveryHandler for NullRecovery {
    async fn recover(
        &self,
        _peer: &str,
        _key: &[u8],
        _seq: u64,
        _ballot: Ballot,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct Cluster {
    pub net: Arc<TestNet>,
    // Held so the per-node log directories outlive the test body.
    _dirs: Vec<tempfile::TempDir>,
}

/// Build a five-node cluster over the loopback transport. Every node starts
/// offline.
pub async fn build_cluster(timeout: Duration) -> Cluster {
    let net = TestNet::new(&NODES);
    let mut dirs = Vec::new();
    for (index, name) in NODES.iter().enumerate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::new(
            dir.path(),
            NODES.iter().map(|n| n.to_string()).collect(),
            index as u8,
        );
        config.timeout = timeout;
        let replica = Replica::open(
            config,
            Arc::new(LoopbackTransport {
                net: net.clone(),
                me: name.to_string(),
            }),
            Arc::new(CountingCommit { net: net.clone() }),
            Arc::new(NullRecovery),
        )
        .expect("open replica");
        net.register(index, replica);
        dirs.push(dir);
    }
    Cluster { net, _dirs: dirs }
}

/// Whether the committed `(ballot, seq)` pair for `key` is identical across
/// the given replica indices.
pub fn logs_agree(net: &TestNet, key: &[u8], indices: impl IntoIterator<Item = usize>) -> bool {
    let mut first = None;
    for index in indices {
        let entry = net.node(index).entry(key).expect("read log entry");
        match &first {
            None => first = Some(entry),
            Some(expected) => {
                if entry != *expected {
                    return false;
                }
            }
        }
    }
    true
}

//! Persistent per-key commit log.
//!
//! Stores the latest committed `(ballot, seq)` pair for every key, plus the
//! maximum ballot seen across all keys. Backed by a fjall keyspace with two
//! partitions: `entries` (key -> pair) and `log_meta` (max ballot). Writes
//! are per-key atomic and flushed to disk before returning; atomicity across
//! keys is not provided. Writers are serialized by the caller, readers are
//! concurrent.

use std::path::Path;

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use tracing::warn;

use crate::types::{Ballot, DiffItem, LogEntry};

const META_MAX_BALLOT: &[u8] = b"max_ballot";

pub struct CommandLog {
    keyspace: Keyspace,
    entries: PartitionHandle,
    meta: PartitionHandle,
}

impl CommandLog {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path)
            .open()
            .context("open log keyspace")?;
        let entries = keyspace.open_partition("entries", PartitionCreateOptions::default())?;
        let meta = keyspace.open_partition("log_meta", PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            entries,
            meta,
        })
    }

    /// Latest committed pair for `key`; zeroes when the key was never committed.
    pub fn last_seq_for_key(&self, key: &[u8]) -> anyhow::Result<LogEntry> {
        match self.entries.get(key)? {
            Some(bytes) => decode_entry(&bytes),
            None => Ok(LogEntry::default()),
        }
    }

    /// Record the latest committed pair for `key`.
    ///
    /// The caller guarantees `seq` is not below the existing entry. Durable
    /// once this returns: the entry and the max-ballot marker go through one
    /// batch, then the journal is synced.
    pub fn set_last_seq_for_key(&self, key: &[u8], ballot: Ballot, seq: u64) -> anyhow::Result<()> {
        let mut batch = self.keyspace.batch();
        batch.insert(&self.entries, key, encode_entry(ballot, seq));
        if ballot > self.max_ballot()? {
            batch.insert(
                &self.meta,
                META_MAX_BALLOT,
                ballot.as_u64().to_be_bytes().to_vec(),
            );
        }
        batch.commit()?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    /// Highest ballot recorded across all keys.
    pub fn max_ballot(&self) -> anyhow::Result<Ballot> {
        match self.meta.get(META_MAX_BALLOT)? {
            Some(bytes) => {
                let mut offset = 0usize;
                Ok(Ballot::from_u64(read_u64_at(&bytes, &mut offset)?))
            }
            None => Ok(Ballot::zero()),
        }
    }

    /// All entries whose ballot counter strictly exceeds `since`'s counter.
    pub fn diff_from_ballot(&self, since: Ballot) -> anyhow::Result<Vec<DiffItem>> {
        let mut items = Vec::new();
        for pair in self.entries.iter() {
            let (key, value) = match pair {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = ?err, "log scan failed");
                    return Err(err.into());
                }
            };
            let entry = decode_entry(&value)?;
            if entry.ballot.counter() > since.counter() {
                items.push(DiffItem {
                    key: key.to_vec(),
                    ballot: entry.ballot,
                    seq: entry.seq,
                });
            }
        }
        Ok(items)
    }
}

fn encode_entry(ballot: Ballot, seq: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&ballot.as_u64().to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out
}

fn decode_entry(bytes: &[u8]) -> anyhow::Result<LogEntry> {
    let mut offset = 0usize;
    let ballot = Ballot::from_u64(read_u64_at(bytes, &mut offset)?);
    let seq = read_u64_at(bytes, &mut offset)?;
    Ok(LogEntry { ballot, seq })
}

fn read_u64_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "log entry short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

//! Persistent sync queue.
//!
//! An ordered log of local mutations waiting to reach the remote store. Every
//! change is written through the journal before it becomes visible, so a
//! crash never loses or reorders an acknowledged write.
//!
//! Consecutive mutations of one record coalesce into a single entry. An entry
//! leaves the queue only when the sender acknowledges its `seq`; if the entry
//! was coalesced while in flight it carries a new `seq` and stays queued.

mod journal;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use crate::crypto::{rewrap, Envelope, MasterKey, RotationReport};
use crate::error::Result;
use crate::models::{Payload, Record, RecordId};
use crate::util::now_millis;

pub use journal::{FileJournal, MemoryJournal, QueueJournal};

/// Default queue length that triggers compaction
pub const DEFAULT_CEILING: usize = 100;

/// Kind of pending mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Create,
    Update,
    Tombstone,
}

impl OpType {
    /// Operation type for a snapshot about to be queued
    pub const fn for_record(record: &Record) -> Self {
        if record.deleted_at.is_some() {
            Self::Tombstone
        } else if record.version == 1 {
            Self::Create
        } else {
            Self::Update
        }
    }

    /// The op that survives when `later` is folded into an entry holding `self`
    const fn absorb(self, later: Self) -> Option<Self> {
        match (self, later) {
            (Self::Create, Self::Update) => Some(Self::Create),
            (Self::Update, Self::Update) => Some(Self::Update),
            (Self::Create | Self::Update, Self::Tombstone) => Some(Self::Tombstone),
            _ => None,
        }
    }
}

/// One pending mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Monotonic sequence number, refreshed when the entry is coalesced
    pub seq: u64,
    pub op: OpType,
    pub record_id: RecordId,
    /// Record as it should be pushed (payload sealed)
    pub snapshot: Record,
    /// When the first mutation folded into this entry was queued (Unix ms)
    pub enqueued_at: i64,
}

/// Result of [`SyncQueue::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Appended,
    Coalesced,
    /// The ceiling was exceeded and compaction brought the queue back under it
    Compacted,
    /// Still above the ceiling after compaction; the write is kept
    Overflow { pending: usize, ceiling: usize },
}

/// Queue inspection without mutation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub oldest_enqueued_at: Option<i64>,
    pub oldest_age: Option<Duration>,
}

pub struct SyncQueue {
    entries: Vec<QueueEntry>,
    next_seq: u64,
    ceiling: usize,
    journal: Box<dyn QueueJournal>,
}

impl SyncQueue {
    /// Reload persisted entries in their original order
    pub fn open(journal: Box<dyn QueueJournal>, ceiling: usize) -> Result<Self> {
        let entries = journal.load()?;
        let next_seq = entries.iter().map(|entry| entry.seq).max().unwrap_or(0) + 1;
        if !entries.is_empty() {
            tracing::info!(pending = entries.len(), "Reloaded sync queue");
        }
        Ok(Self {
            entries,
            next_seq,
            ceiling: ceiling.max(1),
            journal,
        })
    }

    /// Queue a mutation, coalescing with a pending entry for the same record
    pub fn enqueue(&mut self, op: OpType, snapshot: Record) -> Result<EnqueueOutcome> {
        let mut next = self.entries.clone();
        let seq = self.next_seq;
        let record_id = snapshot.id;

        let pending = next
            .iter_mut()
            .rev()
            .find(|entry| entry.record_id == record_id);
        let mut outcome = match pending.and_then(|entry| entry.op.absorb(op).map(|op| (entry, op))) {
            Some((entry, merged)) => {
                entry.op = merged;
                entry.seq = seq;
                entry.snapshot = snapshot;
                EnqueueOutcome::Coalesced
            }
            None => {
                next.push(QueueEntry {
                    seq,
                    op,
                    record_id,
                    snapshot,
                    enqueued_at: now_millis(),
                });
                EnqueueOutcome::Appended
            }
        };

        if next.len() > self.ceiling {
            next = compacted(next);
            outcome = if next.len() > self.ceiling {
                tracing::warn!(
                    pending = next.len(),
                    ceiling = self.ceiling,
                    "Sync queue above ceiling after compaction"
                );
                EnqueueOutcome::Overflow {
                    pending: next.len(),
                    ceiling: self.ceiling,
                }
            } else {
                EnqueueOutcome::Compacted
            };
        }

        self.commit(next)?;
        self.next_seq = seq + 1;
        tracing::debug!(record_id = %record_id, ?op, ?outcome, "Queued mutation");
        Ok(outcome)
    }

    /// Deduplicate by record id, keeping the latest snapshot at the first-seen position
    pub fn compact(&mut self) -> Result<usize> {
        let before = self.entries.len();
        let next = compacted(self.entries.clone());
        let removed = before - next.len();
        if removed > 0 {
            self.commit(next)?;
        }
        Ok(removed)
    }

    /// Oldest pending entry
    pub fn peek(&self) -> Option<&QueueEntry> {
        self.entries.first()
    }

    /// Remove the head if it still carries `seq`. Returns whether it was removed.
    pub fn ack(&mut self, seq: u64) -> Result<bool> {
        if self.entries.first().map(|entry| entry.seq) != Some(seq) {
            return Ok(false);
        }
        let next = self.entries[1..].to_vec();
        self.commit(next)?;
        Ok(true)
    }

    /// Send entries strictly in order, stopping at the first failure.
    ///
    /// Each entry is removed only after `send` confirms it; the failing entry
    /// stays at the head. Returns the number of entries sent.
    pub async fn drain<F, Fut>(&mut self, mut send: F) -> Result<usize>
    where
        F: FnMut(QueueEntry) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut sent = 0;
        while let Some(entry) = self.peek().cloned() {
            let seq = entry.seq;
            send(entry).await?;
            self.ack(seq)?;
            sent += 1;
        }
        Ok(sent)
    }

    pub fn stats(&self) -> QueueStats {
        let oldest_enqueued_at = self.entries.iter().map(|entry| entry.enqueued_at).min();
        QueueStats {
            pending: self.entries.len(),
            oldest_enqueued_at,
            oldest_age: oldest_enqueued_at.map(|at| {
                Duration::from_millis(u64::try_from(now_millis() - at).unwrap_or(0))
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn contains(&self, record_id: &RecordId) -> bool {
        self.entries.iter().any(|entry| &entry.record_id == record_id)
    }

    /// Drop every pending entry for `record_id`, returning how many were removed.
    ///
    /// Used when the remote copy superseded the local one and the pending
    /// snapshots must not be pushed over it.
    pub fn discard(&mut self, record_id: &RecordId) -> Result<usize> {
        let next: Vec<QueueEntry> = self
            .entries
            .iter()
            .filter(|entry| &entry.record_id != record_id)
            .cloned()
            .collect();
        let removed = self.entries.len() - next.len();
        if removed > 0 {
            self.commit(next)?;
        }
        Ok(removed)
    }

    /// Re-wrap every snapshot sealed under `old`, persisting after each entry
    pub fn rewrap_all(&mut self, old: &MasterKey, new: &MasterKey) -> Result<RotationReport> {
        let mut report = RotationReport::default();
        for index in 0..self.entries.len() {
            let Payload::Sealed { envelope } = &self.entries[index].snapshot.payload else {
                report.skipped += 1;
                continue;
            };
            if &envelope.key_id == new.id() {
                report.skipped += 1;
                continue;
            }

            let envelope: Envelope = rewrap(envelope, old, new)?;
            let mut next = self.entries.clone();
            next[index].snapshot.payload = Payload::Sealed { envelope };
            self.commit(next)?;
            report.rewrapped += 1;
        }
        Ok(report)
    }

    fn commit(&mut self, next: Vec<QueueEntry>) -> Result<()> {
        self.journal.persist(&next)?;
        self.entries = next;
        Ok(())
    }
}

fn compacted(entries: Vec<QueueEntry>) -> Vec<QueueEntry> {
    let mut positions: HashMap<RecordId, usize> = HashMap::new();
    let mut result: Vec<QueueEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        if let Some(&index) = positions.get(&entry.record_id) {
            let slot = &mut result[index];
            slot.op = match (slot.op, entry.op) {
                (OpType::Create, OpType::Update) => OpType::Create,
                (_, later) => later,
            };
            slot.seq = entry.seq;
            slot.snapshot = entry.snapshot;
        } else {
            positions.insert(entry.record_id, result.len());
            result.push(entry);
        }
    }
    result
}

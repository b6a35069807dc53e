//! The sync engine: local writes, queue draining, remote polling and
//! conflict resolution, driven by [`SyncState`].

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::backoff::Backoff;
use super::machine::{SyncEvent, SyncState};
use crate::config::SyncConfig;
use crate::crypto::{self, open_record, seal_record, KeyId, KeyRing};
use crate::error::{Error, Result};
use crate::models::{
    ConflictStrategy, Content, DeviceId, Mutation, OwnerId, Payload, Record, RecordId,
    RecordKind, SyncConflict,
};
use crate::queue::{EnqueueOutcome, MemoryJournal, OpType, QueueJournal, SyncQueue};
use crate::resolver::{ConflictResolver, Outcome, Resolution};
use crate::store::{LocalStore, RecordFilter, RemoteStore};
use crate::util::{lock, now_millis};

/// Upper bound on the debounce wait, in debounce windows
const MAX_DEBOUNCE_WINDOWS: u32 = 5;

/// Fields of a record about to be created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub kind: RecordKind,
    pub title: String,
    pub body: String,
    pub parent_ref: Option<RecordId>,
    pub labels: BTreeSet<RecordId>,
}

impl NewRecord {
    pub fn note(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind: RecordKind::Note,
            title: title.into(),
            body: body.into(),
            parent_ref: None,
            labels: BTreeSet::new(),
        }
    }
}

/// A record left untouched because its copies disagree in a forbidden way
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultReport {
    pub record_id: RecordId,
    pub reason: String,
}

/// Summary of one sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Queue entries the remote confirmed
    pub pushed: usize,
    /// Remote records received
    pub pulled: usize,
    /// Remote copies saved locally as-is
    pub adopted: usize,
    /// Resolver results saved locally and queued for push
    pub rewritten: usize,
    /// Divergent copies settled by the resolver
    pub conflicts: usize,
    pub faults: Vec<FaultReport>,
    pub warnings: Vec<String>,
    /// Shutdown stopped the pass early; the watermark was not advanced
    pub cancelled: bool,
}

/// Diagnostics snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub online: bool,
    pub device: DeviceId,
    pub pending: usize,
    pub oldest_pending_at: Option<i64>,
    pub watermark: Option<i64>,
    pub key_id: Option<KeyId>,
    pub rotating: bool,
    pub last_report: Option<SyncReport>,
    pub last_error: Option<String>,
}

/// Outcome of [`SyncEngine::rotate_master_key`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KeyRotation {
    /// Queued snapshots re-wrapped under the new key
    pub rewrapped: usize,
    /// Remote copies re-wrapped in place at their stored version
    pub remote_rewrapped: usize,
    /// Remote copies still under the old key because a newer version
    /// replaced them mid-rotation
    pub remaining: usize,
}

/// How far one drain of the queue got
#[derive(Debug, Default)]
struct PushRound {
    pushed: usize,
    /// Record whose snapshot the remote refused to let revive a tombstone
    refused: Option<RecordId>,
}

pub struct SyncEngineBuilder {
    owner: OwnerId,
    device: DeviceId,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    journal: Option<Box<dyn QueueJournal>>,
    keys: Option<KeyRing>,
    config: SyncConfig,
    online: bool,
}

impl SyncEngineBuilder {
    pub fn new(
        owner: OwnerId,
        device: DeviceId,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
    ) -> Self {
        Self {
            owner,
            device,
            local,
            remote,
            journal: None,
            keys: None,
            config: SyncConfig::default(),
            online: true,
        }
    }

    /// Where the sync queue is persisted (in memory when unset)
    #[must_use]
    pub fn journal(mut self, journal: impl QueueJournal + 'static) -> Self {
        self.journal = Some(Box::new(journal));
        self
    }

    /// Seal payloads before they leave the device
    #[must_use]
    pub fn key_ring(mut self, keys: KeyRing) -> Self {
        self.keys = Some(keys);
        self
    }

    #[must_use]
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub const fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Open the queue, re-queue unsynced local writes and return the engine
    pub async fn build(self) -> Result<SyncEngine> {
        self.config.validate()?;
        if self.keys.is_none() {
            tracing::warn!("No master key configured; records will sync unencrypted");
        }

        let journal = self
            .journal
            .unwrap_or_else(|| Box::new(MemoryJournal::new()));
        let queue = SyncQueue::open(journal, self.config.queue_ceiling)?;

        let inner = Inner {
            resolver: ConflictResolver::new(self.device, self.config.concurrency_window()),
            backoff: Backoff::new(self.config.backoff_base(), self.config.backoff_max_exponent),
            owner: self.owner,
            device: self.device,
            local: self.local,
            remote: self.remote,
            queue: Mutex::new(queue),
            keys: Mutex::new(self.keys),
            config: self.config,
            write_lock: AsyncMutex::new(()),
            pass_lock: AsyncMutex::new(()),
            state: watch::channel(SyncState::Idle).0,
            wake: Notify::new(),
            online: AtomicBool::new(self.online),
            shutdown: AtomicBool::new(false),
            warnings: Mutex::new(Vec::new()),
            last_report: Mutex::new(None),
            last_error: Mutex::new(None),
        };
        let engine = SyncEngine {
            inner: Arc::new(inner),
        };

        let recovered = engine.recover_unsynced().await?;
        if recovered > 0 {
            tracing::info!(recovered, "Re-queued local writes missing from the sync queue");
        }
        if !lock(&engine.inner.queue).is_empty() {
            engine.transition(SyncEvent::LocalMutation);
        }
        Ok(engine)
    }
}

struct Inner {
    owner: OwnerId,
    device: DeviceId,
    config: SyncConfig,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    resolver: ConflictResolver,
    backoff: Backoff,
    queue: Mutex<SyncQueue>,
    keys: Mutex<Option<KeyRing>>,
    /// Single writer for the local store
    write_lock: AsyncMutex<()>,
    /// At most one pass at a time
    pass_lock: AsyncMutex<()>,
    state: watch::Sender<SyncState>,
    wake: Notify,
    online: AtomicBool,
    shutdown: AtomicBool,
    warnings: Mutex<Vec<String>>,
    last_report: Mutex<Option<SyncReport>>,
    last_error: Mutex<Option<String>>,
}

/// Cheap to clone; clones drive the same engine
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn device(&self) -> DeviceId {
        self.inner.device
    }

    pub fn owner(&self) -> &OwnerId {
        &self.inner.owner
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Local operations
    // ------------------------------------------------------------------

    pub async fn create(&self, draft: NewRecord) -> Result<Record> {
        let _write = self.inner.write_lock.lock().await;
        let record = Record::create(
            draft.kind,
            self.inner.owner.clone(),
            Content::new(draft.title, draft.body, now_millis()),
            draft.parent_ref,
            draft.labels,
            self.inner.device,
        )?;
        self.commit_local(&record).await?;
        Ok(record)
    }

    /// Apply `mutations` in order as one local write
    pub async fn edit(
        &self,
        id: &RecordId,
        mutations: impl IntoIterator<Item = Mutation> + Send,
    ) -> Result<Record> {
        let mutations: Vec<Mutation> = mutations.into_iter().collect();
        if mutations.is_empty() {
            return Err(Error::Validation(format!("no changes given for record {id}")));
        }

        let _write = self.inner.write_lock.lock().await;
        let mut record = self.require(id).await?;
        for mutation in mutations {
            record = record.apply_local_edit(mutation, self.inner.device)?;
        }
        self.commit_local(&record).await?;
        Ok(record)
    }

    pub async fn delete(&self, id: &RecordId) -> Result<Record> {
        let _write = self.inner.write_lock.lock().await;
        let record = self
            .require(id)
            .await?
            .tombstone(self.inner.device, self.inner.config.clear_payload_on_tombstone)?;
        self.commit_local(&record).await?;
        Ok(record)
    }

    pub async fn restore(&self, id: &RecordId) -> Result<Record> {
        let _write = self.inner.write_lock.lock().await;
        let record = self
            .require(id)
            .await?
            .apply_local_edit(Mutation::Restore, self.inner.device)?;
        self.commit_local(&record).await?;
        Ok(record)
    }

    pub async fn get(&self, id: &RecordId) -> Result<Option<Record>> {
        self.inner.local.get(id).await
    }

    pub async fn list(&self, filter: &RecordFilter) -> Result<Vec<Record>> {
        self.inner.local.list(filter).await
    }

    pub async fn conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.inner.local.list_conflicts(limit).await
    }

    async fn require(&self, id: &RecordId) -> Result<Record> {
        self.inner
            .local
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Save a local write and queue its sealed snapshot. Caller holds the write lock.
    async fn commit_local(&self, record: &Record) -> Result<()> {
        self.inner.local.save(record).await?;
        self.enqueue(record)?;
        tracing::debug!(record_id = %record.id, version = record.version, "Committed local write");
        self.transition(SyncEvent::LocalMutation);
        self.inner.wake.notify_one();
        Ok(())
    }

    fn enqueue(&self, record: &Record) -> Result<EnqueueOutcome> {
        let snapshot = self.seal(record)?;
        let outcome = lock(&self.inner.queue).enqueue(OpType::for_record(record), snapshot)?;
        if let EnqueueOutcome::Overflow { pending, ceiling } = outcome {
            lock(&self.inner.warnings).push(Error::QueueOverflow { pending, ceiling }.to_string());
        }
        Ok(outcome)
    }

    fn seal(&self, record: &Record) -> Result<Record> {
        match lock(&self.inner.keys).as_ref() {
            Some(keys) => seal_record(record, keys.current()),
            None => Ok(record.clone()),
        }
    }

    fn open(&self, record: &Record) -> Result<Record> {
        if !record.payload.is_sealed() {
            return Ok(record.clone());
        }
        let keys = lock(&self.inner.keys);
        let keys = keys.as_ref().ok_or_else(|| {
            Error::Decryption(format!(
                "record {} is sealed but no master key is configured",
                record.id
            ))
        })?;
        open_record(record, keys)
    }

    /// Queue every local write the remote has not confirmed and the queue does
    /// not already cover
    async fn recover_unsynced(&self) -> Result<usize> {
        let unsynced = self.inner.local.list_unsynced().await?;
        let mut recovered = 0;
        for record in unsynced {
            let covered = lock(&self.inner.queue).entries().iter().any(|entry| {
                entry.record_id == record.id && entry.snapshot.version >= record.version
            });
            if !covered {
                self.enqueue(&record)?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    // ------------------------------------------------------------------
    // State and control
    // ------------------------------------------------------------------

    pub fn state(&self) -> SyncState {
        *self.inner.state.borrow()
    }

    /// Receive every state change
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Report connectivity; coming back online wakes the engine
    pub fn set_online(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            tracing::info!("Connectivity restored");
            self.transition(SyncEvent::ConnectivityRestored);
            self.inner.wake.notify_one();
        } else if !online && was_online {
            tracing::info!("Connectivity lost");
        }
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        let watermark = self.inner.local.get_watermark().await?;
        let stats = lock(&self.inner.queue).stats();
        let (key_id, rotating) = lock(&self.inner.keys)
            .as_ref()
            .map_or((None, false), |keys| {
                (Some(keys.current().id().clone()), keys.is_rotating())
            });
        Ok(SyncStatus {
            state: self.state(),
            online: self.is_online(),
            device: self.inner.device,
            pending: stats.pending,
            oldest_pending_at: stats.oldest_enqueued_at,
            watermark,
            key_id,
            rotating,
            last_report: lock(&self.inner.last_report).clone(),
            last_error: lock(&self.inner.last_error).clone(),
        })
    }

    /// Run one pass now, whatever the current state
    pub async fn sync_now(&self) -> Result<SyncReport> {
        let _pass = self.inner.pass_lock.lock().await;
        self.transition(SyncEvent::ManualSync);
        let result = self.sync_pass().await;
        self.finish_pass(&result);
        result
    }

    /// Stop [`SyncEngine::run`] and any running pass at the next entry boundary
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    pub fn spawn(&self) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move { engine.run().await })
    }

    /// Drive the state machine until [`SyncEngine::shutdown`]
    pub async fn run(&self) {
        tracing::info!(device_id = %self.inner.device, "Sync engine started");
        let mut backoff_deadline: Option<(u32, Instant)> = None;

        while !self.is_shutting_down() {
            match self.state() {
                SyncState::Idle | SyncState::ManualSyncRequired => {
                    self.inner.wake.notified().await;
                }
                SyncState::Pending => {
                    if !self.is_online() {
                        self.inner.wake.notified().await;
                    } else if self.debounce().await {
                        self.transition(SyncEvent::DebounceElapsed);
                    }
                }
                SyncState::Syncing { .. } => self.scheduled_pass().await,
                SyncState::Backoff { attempt } => {
                    let deadline = match backoff_deadline {
                        Some((scheduled, at)) if scheduled == attempt => at,
                        _ => {
                            let delay = self.inner.backoff.delay(attempt);
                            tracing::warn!(
                                attempt,
                                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                                "Sync pass failed; backing off"
                            );
                            let at = Instant::now() + delay;
                            backoff_deadline = Some((attempt, at));
                            at
                        }
                    };
                    tokio::select! {
                        () = tokio::time::sleep_until(deadline) => {
                            backoff_deadline = None;
                            self.transition(SyncEvent::BackoffElapsed);
                        }
                        () = self.inner.wake.notified() => {}
                    }
                }
            }
        }
        tracing::info!("Sync engine stopped");
    }

    /// Wait out the debounce window, restarting it on every wake-up but never
    /// past [`MAX_DEBOUNCE_WINDOWS`] windows in total.
    /// Returns false when the wait was cut short by a state change or shutdown.
    async fn debounce(&self) -> bool {
        let window = self.inner.config.debounce();
        let deadline = Instant::now() + window * MAX_DEBOUNCE_WINDOWS;
        loop {
            let quiet_until = (Instant::now() + window).min(deadline);
            tokio::select! {
                () = tokio::time::sleep_until(quiet_until) => return true,
                () = self.inner.wake.notified() => {
                    if self.is_shutting_down()
                        || self.state() != SyncState::Pending
                        || !self.is_online()
                    {
                        return false;
                    }
                }
            }
        }
    }

    async fn scheduled_pass(&self) {
        let _pass = self.inner.pass_lock.lock().await;
        // A manual pass may have finished while we waited for the lock
        if !self.state().is_syncing() {
            return;
        }
        let result = self.sync_pass().await;
        self.finish_pass(&result);
    }

    fn transition(&self, event: SyncEvent) -> SyncState {
        let max_retries = self.inner.config.max_retries;
        self.inner.state.send_if_modified(|state| {
            let next = state.next(event, max_retries);
            if next == *state {
                return false;
            }
            tracing::debug!(from = %state, to = %next, ?event, "Sync state changed");
            *state = next;
            true
        });
        self.state()
    }

    fn finish_pass(&self, result: &Result<SyncReport>) {
        match result {
            Ok(report) => {
                *lock(&self.inner.last_report) = Some(report.clone());
                *lock(&self.inner.last_error) = None;
                if !report.cancelled {
                    self.transition(SyncEvent::PassSucceeded);
                }
            }
            Err(error) => {
                *lock(&self.inner.last_error) = Some(error.to_string());
                let state = self.transition(SyncEvent::PassFailed {
                    retryable: error.is_retryable(),
                });
                if state == SyncState::ManualSyncRequired {
                    tracing::warn!(%error, "Sync pass failed; manual sync required");
                } else {
                    tracing::debug!(%error, "Sync pass failed");
                }
            }
        }
        self.inner.wake.notify_one();
    }

    // ------------------------------------------------------------------
    // The pass
    // ------------------------------------------------------------------

    async fn sync_pass(&self) -> Result<SyncReport> {
        if !self.is_online() {
            return Err(Error::RemoteTransient("device is offline".to_string()));
        }

        let mut report = SyncReport::default();
        let first = self.push_queue(&mut report).await?;
        report.pushed += first.pushed;
        if let Some(record_id) = first.refused {
            tracing::info!(%record_id, "Remote copy is deleted; resolving before pushing again");
        }

        if !report.cancelled {
            let watermark = self.inner.local.get_watermark().await?;
            let page = self
                .remote_call(self.inner.remote.fetch_changed_since(watermark))
                .await?;
            tracing::debug!(changes = page.records.len(), ?watermark, "Fetched remote changes");

            for incoming in page.records {
                if self.is_shutting_down() {
                    report.cancelled = true;
                    break;
                }
                report.pulled += 1;
                self.apply_remote(&incoming, &mut report).await?;
            }

            // Push what the resolver re-issued before moving the watermark
            if !report.cancelled {
                let second = self.push_queue(&mut report).await?;
                report.pushed += second.pushed;
                if let Some(record_id) = second.refused {
                    report.warnings.push(format!(
                        "record {record_id} is deleted on the remote; its local change stays queued"
                    ));
                }
            }
            if !report.cancelled {
                if let Some(next) = page.watermark {
                    if watermark.map_or(true, |current| next > current) {
                        self.inner.local.set_watermark(next).await?;
                    }
                }
            }
        }

        report
            .warnings
            .extend(std::mem::take(&mut *lock(&self.inner.warnings)));
        for warning in &report.warnings {
            tracing::warn!(warning = %warning, "Sync warning");
        }
        tracing::info!(
            pushed = report.pushed,
            pulled = report.pulled,
            adopted = report.adopted,
            rewritten = report.rewritten,
            conflicts = report.conflicts,
            faults = report.faults.len(),
            cancelled = report.cancelled,
            "Sync pass finished"
        );
        Ok(report)
    }

    /// Push queued snapshots strictly in order until the queue is empty or
    /// the remote refuses to let the head revive a tombstone
    async fn push_queue(&self, report: &mut SyncReport) -> Result<PushRound> {
        let mut round = PushRound::default();
        loop {
            if self.is_shutting_down() {
                report.cancelled = true;
                break;
            }
            let head = lock(&self.inner.queue).peek().cloned();
            let Some(entry) = head else {
                break;
            };

            match self.remote_call(self.inner.remote.put(&entry.snapshot)).await {
                Ok(()) => {}
                Err(Error::RemoteTombstoned(_)) => {
                    round.refused = Some(entry.record_id);
                    break;
                }
                Err(error) => return Err(error),
            }
            // A coalesced head carries a new seq and is pushed again next round
            let acked = lock(&self.inner.queue).ack(entry.seq)?;
            self.inner
                .local
                .mark_synced(&entry.record_id, entry.snapshot.version)
                .await?;
            tracing::debug!(
                record_id = %entry.record_id,
                version = entry.snapshot.version,
                acked,
                "Pushed queued snapshot"
            );
            round.pushed += 1;
        }
        Ok(round)
    }

    async fn remote_call<T>(&self, call: impl Future<Output = Result<T>> + Send) -> Result<T> {
        let timeout = self.inner.config.remote_timeout();
        tokio::time::timeout(timeout, call).await.map_err(|_| {
            Error::RemoteTransient(format!(
                "remote call timed out after {} ms",
                timeout.as_millis()
            ))
        })?
    }

    async fn apply_remote(&self, incoming: &Record, report: &mut SyncReport) -> Result<()> {
        let remote = self.open(incoming)?;
        if let Err(error) = remote.validate() {
            return self.fault(None, &remote, error.to_string(), report).await;
        }
        if remote.owner_id != self.inner.owner {
            let reason = format!("record belongs to owner {}", remote.owner_id);
            return self.fault(None, &remote, reason, report).await;
        }

        let _write = self.inner.write_lock.lock().await;
        let Some(local) = self.inner.local.get(&remote.id).await? else {
            tracing::debug!(record_id = %remote.id, version = remote.version, "Adopting new remote record");
            self.adopt(&remote).await?;
            report.adopted += 1;
            return Ok(());
        };

        // Nothing local is waiting and the remote copy is strictly ahead.
        // Reviving a local tombstone is always left to the resolver.
        let pending = lock(&self.inner.queue).contains(&remote.id);
        if !pending
            && remote.version > local.version
            && remote.updated_at >= local.updated_at
            && !remote.revives(&local)
        {
            tracing::debug!(
                record_id = %remote.id,
                from = local.version,
                to = remote.version,
                "Fast-forwarding to remote copy"
            );
            self.adopt(&remote).await?;
            report.adopted += 1;
            return Ok(());
        }

        match self.inner.resolver.resolve(&local, &remote, now_millis()) {
            Ok(resolution) => self.apply_resolution(&local, &remote, resolution, report).await,
            Err(Error::ConsistencyFault { reason, .. }) => {
                self.fault(Some(&local), &remote, reason, report).await
            }
            Err(error) => Err(error),
        }
    }

    async fn apply_resolution(
        &self,
        local: &Record,
        remote: &Record,
        resolution: Resolution,
        report: &mut SyncReport,
    ) -> Result<()> {
        let record = &resolution.record;
        let detail = match resolution.outcome {
            Outcome::KeepLocal => format!("kept local v{}", record.version),
            Outcome::TakeRemote => {
                self.adopt(record).await?;
                report.adopted += 1;
                format!("took remote v{}", record.version)
            }
            Outcome::Rewrite(_) => {
                self.inner.local.save(record).await?;
                self.enqueue(record)?;
                report.rewritten += 1;
                format!("re-issued as v{}", record.version)
            }
        };

        if let Some(strategy) = resolution.conflict {
            report.conflicts += 1;
            tracing::info!(record_id = %record.id, %strategy, %detail, "Resolved sync conflict");
            self.journal_conflict(local, remote, strategy, detail).await?;
        }
        Ok(())
    }

    /// Save the remote copy and drop any local snapshot it supersedes
    async fn adopt(&self, remote: &Record) -> Result<()> {
        self.inner.local.save(remote).await?;
        self.inner.local.mark_synced(&remote.id, remote.version).await?;
        let discarded = lock(&self.inner.queue).discard(&remote.id)?;
        if discarded > 0 {
            tracing::debug!(record_id = %remote.id, discarded, "Dropped superseded queue entries");
        }
        Ok(())
    }

    async fn fault(
        &self,
        local: Option<&Record>,
        remote: &Record,
        reason: String,
        report: &mut SyncReport,
    ) -> Result<()> {
        tracing::error!(
            record_id = %remote.id,
            remote_version = remote.version,
            local_version = local.map(|record| record.version),
            %reason,
            "Consistency fault; keeping local copy"
        );
        self.journal_conflict(
            local.unwrap_or(remote),
            remote,
            ConflictStrategy::Fault,
            reason.clone(),
        )
        .await?;
        report.faults.push(FaultReport {
            record_id: remote.id,
            reason,
        });
        Ok(())
    }

    async fn journal_conflict(
        &self,
        local: &Record,
        remote: &Record,
        strategy: ConflictStrategy,
        detail: String,
    ) -> Result<()> {
        let conflict = SyncConflict {
            id: 0,
            record_id: remote.id.to_string(),
            local_version: local.version,
            incoming_version: remote.version,
            local_updated_at: local.updated_at,
            incoming_updated_at: remote.updated_at,
            resolved_at: now_millis(),
            strategy,
            detail: Some(detail),
        };
        self.inner.local.record_conflict(&conflict).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Key rotation
    // ------------------------------------------------------------------

    /// Switch to the current key of `keys`.
    ///
    /// Queued snapshots are re-wrapped in place, then every remote copy still
    /// under the old key is re-wrapped at its stored version. Versions and
    /// timestamps are left alone, so a rotation never outranks a concurrent
    /// edit. The old key is `keys.previous()`, or the engine's current key.
    /// Running it again after an interruption only finishes the remainder.
    pub async fn rotate_master_key(&self, keys: KeyRing) -> Result<KeyRotation> {
        let _pass = self.inner.pass_lock.lock().await;

        let old = keys
            .previous()
            .cloned()
            .or_else(|| {
                lock(&self.inner.keys)
                    .as_ref()
                    .map(|ring| ring.current().clone())
            })
            .ok_or_else(|| Error::Config("no master key configured to rotate from".to_string()))?;
        let new = keys.current().clone();

        let rewrapped = {
            let _write = self.inner.write_lock.lock().await;
            let rewrapped = lock(&self.inner.queue).rewrap_all(&old, &new)?.rewrapped;
            *lock(&self.inner.keys) = Some(keys);
            rewrapped
        };
        if rewrapped > 0 {
            self.transition(SyncEvent::LocalMutation);
            self.inner.wake.notify_one();
        }

        if !self.is_online() {
            return Err(Error::RemoteTransient(
                "device is offline; remote copies keep the old key".to_string(),
            ));
        }
        let page = self
            .remote_call(self.inner.remote.fetch_changed_since(None))
            .await?;
        let stale: Vec<Record> = page
            .records
            .into_iter()
            .filter(|record| {
                record.owner_id == self.inner.owner
                    && matches!(
                        &record.payload,
                        Payload::Sealed { envelope } if &envelope.key_id == old.id()
                    )
            })
            .collect();

        let mut remote_rewrapped = 0;
        let mut remaining = 0;
        for record in crypto::rotate_master_key(&old, &new, stale)? {
            if self.remote_call(self.inner.remote.rewrap(&record)).await? {
                remote_rewrapped += 1;
            } else {
                tracing::debug!(record_id = %record.id, version = record.version, "Remote copy moved on during rotation");
                remaining += 1;
            }
        }

        tracing::info!(
            key_id = %new.id(),
            rewrapped,
            remote_rewrapped,
            remaining,
            "Rotated master key"
        );
        Ok(KeyRotation {
            rewrapped,
            remote_rewrapped,
            remaining,
        })
    }
}

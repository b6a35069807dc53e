//! Deterministic reconciliation of a local and a remote copy of one record.
//!
//! The policy, in order:
//!
//! 1. Semantically equal copies keep the higher version.
//! 2. A copy whose merge provenance lists the other copy supersedes it.
//! 3. Equal versions with divergent content are a fault when they come from the
//!    same device, and a concurrent fork otherwise.
//! 4. A tombstone beats an edit unless the edit is an explicit restore made at
//!    or after the deletion.
//! 5. Edits further apart than the concurrency window: last writer wins.
//! 6. Otherwise the two copies are merged field by field.
//!
//! A winner that would not supersede the loser's version is re-issued at
//! `max(version) + 1` so versions never regress and equal versions never
//! diverge. The body merge is a containment heuristic, not a three-way merge.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::models::{
    ConflictStrategy, Content, DeviceId, MergeMetadata, MergeSource, Payload, Record,
};

/// Default distance between edits below which they count as concurrent
pub const DEFAULT_CONCURRENCY_WINDOW: Duration = Duration::from_secs(5);

/// What the caller must do with [`Resolution::record`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Local copy stands; nothing to write
    KeepLocal,
    /// Save the remote copy locally as-is
    TakeRemote,
    /// A new version was synthesized; save it locally and push it
    Rewrite(ConflictStrategy),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub record: Record,
    pub outcome: Outcome,
    /// How divergent content was settled; `None` when there was nothing to settle
    pub conflict: Option<ConflictStrategy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Local,
    Remote,
}

/// Pure conflict resolver for one device
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    device: DeviceId,
    window_ms: u64,
}

impl ConflictResolver {
    pub fn new(device: DeviceId, concurrency_window: Duration) -> Self {
        Self {
            device,
            window_ms: u64::try_from(concurrency_window.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Reconcile `local` with `remote`. Both payloads must be opened.
    pub fn resolve(&self, local: &Record, remote: &Record, now: i64) -> Result<Resolution> {
        if local.id != remote.id || local.owner_id != remote.owner_id || local.kind != remote.kind
        {
            return Err(Error::consistency(
                local.id,
                format!(
                    "identity mismatch: local {}/{}/{} vs remote {}/{}/{}",
                    local.id, local.owner_id, local.kind, remote.id, remote.owner_id, remote.kind
                ),
            ));
        }
        let local_content = local.content()?;
        let remote_content = remote.content()?;

        if local.same_content(remote) {
            let outcome = if remote.version > local.version {
                Outcome::TakeRemote
            } else {
                Outcome::KeepLocal
            };
            let record = if outcome == Outcome::TakeRemote { remote } else { local };
            return Ok(Resolution {
                record: record.clone(),
                outcome,
                conflict: None,
            });
        }

        if let Some(side) = Self::descendant(local, remote) {
            tracing::debug!(record_id = %local.id, ?side, "Merge provenance settles conflict");
            let (record, outcome) = match side {
                Side::Local => (local, Outcome::KeepLocal),
                Side::Remote => (remote, Outcome::TakeRemote),
            };
            return Ok(Resolution {
                record: record.clone(),
                outcome,
                conflict: None,
            });
        }

        if local.version == remote.version && local.origin_device == remote.origin_device {
            return Err(Error::consistency(
                local.id,
                format!(
                    "version {} from device {} diverges between local and remote",
                    local.version, local.origin_device
                ),
            ));
        }

        match (local.deleted_at, remote.deleted_at) {
            (Some(_), Some(_)) => {
                let winner = if remote.is_newer_than(local) {
                    Side::Remote
                } else {
                    Side::Local
                };
                return Ok(self.settle(winner, local, remote, ConflictStrategy::Tombstone, now));
            }
            (Some(deleted_at), None) => {
                return self.tombstone_against_edit(Side::Local, deleted_at, local, remote, now);
            }
            (None, Some(deleted_at)) => {
                return self.tombstone_against_edit(Side::Remote, deleted_at, local, remote, now);
            }
            (None, None) => {}
        }

        if local.updated_at.abs_diff(remote.updated_at) >= self.window_ms {
            let winner = if remote.updated_at > local.updated_at {
                Side::Remote
            } else {
                Side::Local
            };
            return Ok(self.settle(winner, local, remote, ConflictStrategy::LastWriterWins, now));
        }

        self.merge(local, local_content, remote, remote_content, now)
    }

    /// Which side, if any, was produced by merging the other
    fn descendant(local: &Record, remote: &Record) -> Option<Side> {
        let derived_from = |child: &Record, parent: &Record| {
            child.version > parent.version
                && child
                    .merge_metadata
                    .as_ref()
                    .is_some_and(|meta| meta.includes(parent.version, &parent.origin_device))
        };
        if derived_from(remote, local) {
            Some(Side::Remote)
        } else if derived_from(local, remote) {
            Some(Side::Local)
        } else {
            None
        }
    }

    fn tombstone_against_edit(
        &self,
        tombstone_side: Side,
        deleted_at: i64,
        local: &Record,
        remote: &Record,
        now: i64,
    ) -> Result<Resolution> {
        let (tombstone, active, active_side) = match tombstone_side {
            Side::Local => (local, remote, Side::Remote),
            Side::Remote => (remote, local, Side::Local),
        };

        if active.restored_at.is_some_and(|restored_at| restored_at >= deleted_at) {
            return Ok(self.settle(active_side, local, remote, ConflictStrategy::Restore, now));
        }

        if active.origin_device == tombstone.origin_device && active.version > tombstone.version {
            return Err(Error::consistency(
                local.id,
                format!(
                    "device {} edited version {} after deleting it at version {} without a restore",
                    active.origin_device, active.version, tombstone.version
                ),
            ));
        }

        Ok(self.settle(tombstone_side, local, remote, ConflictStrategy::Tombstone, now))
    }

    /// Pick `winner`, re-issuing it above the loser's version when needed
    fn settle(
        &self,
        winner: Side,
        local: &Record,
        remote: &Record,
        strategy: ConflictStrategy,
        now: i64,
    ) -> Resolution {
        let (chosen, other) = match winner {
            Side::Local => (local, remote),
            Side::Remote => (remote, local),
        };
        // Taking the remote copy at an equal version replaces local wholesale;
        // keeping the local copy at an equal version would leave two contents
        // under one version number.
        let supersedes = match winner {
            Side::Local => chosen.version > other.version,
            Side::Remote => chosen.version >= other.version,
        };

        if supersedes {
            tracing::debug!(record_id = %chosen.id, ?winner, %strategy, "Conflict settled");
            return Resolution {
                record: chosen.clone(),
                outcome: match winner {
                    Side::Local => Outcome::KeepLocal,
                    Side::Remote => Outcome::TakeRemote,
                },
                conflict: Some(strategy),
            };
        }

        let record = Record {
            version: local.version.max(remote.version) + 1,
            origin_device: self.device,
            merge_metadata: Some(self.provenance(local, remote, now)),
            ..chosen.clone()
        };
        tracing::debug!(record_id = %record.id, version = record.version, %strategy, "Re-issued conflict winner");
        Resolution {
            record,
            outcome: Outcome::Rewrite(strategy),
            conflict: Some(strategy),
        }
    }

    fn merge(
        &self,
        local: &Record,
        local_content: &Content,
        remote: &Record,
        remote_content: &Content,
        now: i64,
    ) -> Result<Resolution> {
        let remote_newer = remote.is_newer_than(local);

        let (title, title_updated_at) = if remote_content.title_updated_at
            > local_content.title_updated_at
            || (remote_content.title_updated_at == local_content.title_updated_at && remote_newer)
        {
            (&remote_content.title, remote_content.title_updated_at)
        } else {
            (&local_content.title, local_content.title_updated_at)
        };

        let parent_ref = if remote.updated_at > local.updated_at
            || (remote.updated_at == local.updated_at && remote_newer)
        {
            remote.parent_ref
        } else {
            local.parent_ref
        };

        let (older, older_content, newer, newer_content) = if remote_newer {
            (local, local_content, remote, remote_content)
        } else {
            (remote, remote_content, local, local_content)
        };
        let body = merge_body(&older_content.body, newer, &newer_content.body);

        let merged = Record {
            id: local.id,
            owner_id: local.owner_id.clone(),
            kind: local.kind,
            payload: Payload::plain(Content {
                title: title.clone(),
                body,
                title_updated_at,
                body_updated_at: older_content
                    .body_updated_at
                    .max(newer_content.body_updated_at),
            }),
            parent_ref,
            labels: local.labels.union(&remote.labels).copied().collect(),
            created_at: local.created_at.min(remote.created_at),
            updated_at: now.max(local.updated_at).max(remote.updated_at),
            deleted_at: None,
            restored_at: local.restored_at.max(remote.restored_at),
            version: local.version.max(remote.version) + 1,
            origin_device: self.device,
            merge_metadata: Some(self.provenance(local, remote, now)),
        };
        merged.validate()?;

        // A merge that reproduces one side adds nothing; keep that side
        if merged.same_content(older) || merged.same_content(newer) {
            let side = if merged.same_content(local) {
                Side::Local
            } else {
                Side::Remote
            };
            return Ok(self.settle(side, local, remote, ConflictStrategy::Merge, now));
        }

        tracing::debug!(
            record_id = %merged.id,
            local_version = local.version,
            remote_version = remote.version,
            version = merged.version,
            "Merged concurrent edits"
        );
        Ok(Resolution {
            record: merged,
            outcome: Outcome::Rewrite(ConflictStrategy::Merge),
            conflict: Some(ConflictStrategy::Merge),
        })
    }

    fn provenance(&self, local: &Record, remote: &Record, now: i64) -> MergeMetadata {
        let mut sources: Vec<MergeSource> = [local, remote]
            .into_iter()
            .map(|record| MergeSource {
                version: record.version,
                device: record.origin_device,
                updated_at: record.updated_at,
            })
            .collect();
        sources.sort_by(|a, b| (a.version, a.device).cmp(&(b.version, b.device)));
        MergeMetadata {
            sources,
            merged_at: now,
            merged_by: self.device,
        }
    }
}

/// Keep the longer body when one contains the other, else concatenate both
/// under an explicit marker, older first
fn merge_body(older: &str, newer: &Record, newer_body: &str) -> String {
    if newer_body.contains(older) {
        return newer_body.to_string();
    }
    if older.contains(newer_body) {
        return older.to_string();
    }
    format!(
        "{older}\n\n--- conflict: concurrent edit from device {} (v{}) ---\n\n{newer_body}",
        newer.origin_device, newer.version
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{seal_record, MasterKey};
    use crate::models::{OwnerId, RecordKind};
    use pretty_assertions::assert_eq;

    const T0: i64 = 1_700_000_000_000;

    fn device(n: u8) -> DeviceId {
        format!("00000000-0000-4000-8000-0000000000{n:02}")
            .parse()
            .unwrap()
    }

    fn base() -> Record {
        let mut record = Record::create(
            RecordKind::Note,
            OwnerId::new("acct").unwrap(),
            Content::new("Groceries", "milk", T0 - 60_000),
            None,
            [],
            device(1),
        )
        .unwrap();
        record.created_at = T0 - 60_000;
        record.updated_at = T0 - 60_000;
        record
    }

    /// Next version of `record` written by `by` at `at`
    fn edit(record: &Record, by: DeviceId, at: i64, change: impl FnOnce(&mut Content)) -> Record {
        let mut next = record.clone();
        next.version += 1;
        next.updated_at = at;
        next.origin_device = by;
        next.merge_metadata = None;
        if let Payload::Plain { content } = &mut next.payload {
            change(content);
        }
        next
    }

    fn set_title(title: &str, at: i64) -> impl FnOnce(&mut Content) + '_ {
        move |content| {
            content.title = title.to_string();
            content.title_updated_at = at;
        }
    }

    fn set_body(body: &str, at: i64) -> impl FnOnce(&mut Content) + '_ {
        move |content| {
            content.body = body.to_string();
            content.body_updated_at = at;
        }
    }

    fn tombstone(record: &Record, by: DeviceId, at: i64) -> Record {
        let mut next = edit(record, by, at, |_| {});
        next.deleted_at = Some(at);
        next
    }

    fn resolver(n: u8) -> ConflictResolver {
        ConflictResolver::new(device(n), DEFAULT_CONCURRENCY_WINDOW)
    }

    #[test]
    fn equal_content_keeps_higher_version() {
        let local = base();
        let mut remote = local.clone();
        remote.version = 3;
        remote.origin_device = device(2);

        let resolution = resolver(1).resolve(&local, &remote, T0).unwrap();
        assert_eq!(resolution.outcome, Outcome::TakeRemote);
        assert_eq!(resolution.record, remote);
        assert_eq!(resolution.conflict, None);

        let resolution = resolver(1).resolve(&remote, &local, T0).unwrap();
        assert_eq!(resolution.outcome, Outcome::KeepLocal);
    }

    #[test]
    fn identity_mismatch_is_a_fault() {
        let local = base();
        let mut remote = local.clone();
        remote.owner_id = OwnerId::new("someone-else").unwrap();
        let error = resolver(1).resolve(&local, &remote, T0).unwrap_err();
        assert!(matches!(error, Error::ConsistencyFault { .. }));
    }

    #[test]
    fn same_device_divergence_at_equal_version_is_a_fault() {
        let start = base();
        let local = edit(&start, device(1), T0 + 10, set_body("a", T0 + 10));
        let remote = edit(&start, device(1), T0 + 20, set_body("b", T0 + 20));
        let error = resolver(1).resolve(&local, &remote, T0 + 30).unwrap_err();
        assert!(matches!(error, Error::ConsistencyFault { .. }));
    }

    #[test]
    fn concurrent_title_and_body_edits_merge() {
        let start = base();
        let local = edit(&start, device(1), T0, set_title("Weekly groceries", T0));
        let remote = edit(
            &start,
            device(2),
            T0 + 2_000,
            set_body("milk\neggs", T0 + 2_000),
        );

        let resolution = resolver(1).resolve(&local, &remote, T0 + 3_000).unwrap();
        assert_eq!(resolution.outcome, Outcome::Rewrite(ConflictStrategy::Merge));

        let merged = &resolution.record;
        assert_eq!(merged.version, 3);
        assert_eq!(merged.origin_device, device(1));
        let content = merged.content().unwrap();
        assert_eq!(content.title, "Weekly groceries");
        assert_eq!(content.body, "milk\neggs");

        let meta = merged.merge_metadata.as_ref().unwrap();
        assert!(meta.includes(2, &device(1)));
        assert!(meta.includes(2, &device(2)));
    }

    #[test]
    fn merge_is_symmetric_in_content() {
        let start = base();
        let a = edit(&start, device(1), T0 + 100, set_body("apples", T0 + 100));
        let b = edit(&start, device(2), T0 + 200, set_body("pears", T0 + 200));

        let on_a = resolver(1).resolve(&a, &b, T0 + 300).unwrap().record;
        let on_b = resolver(2).resolve(&b, &a, T0 + 300).unwrap().record;
        assert_eq!(on_a.content().unwrap(), on_b.content().unwrap());
        assert_eq!(on_a.version, on_b.version);

        let body = &on_a.content().unwrap().body;
        assert!(body.starts_with("apples"));
        assert!(body.ends_with("pears"));
        assert!(body.contains("--- conflict: concurrent edit from device"));
    }

    #[test]
    fn merge_unions_labels() {
        let start = base();
        let tag_a = crate::models::RecordId::new();
        let tag_b = crate::models::RecordId::new();
        let mut local = edit(&start, device(1), T0 + 100, |_| {});
        local.labels.insert(tag_a);
        let mut remote = edit(&start, device(2), T0 + 200, |_| {});
        remote.labels.insert(tag_b);

        let resolution = resolver(1).resolve(&local, &remote, T0 + 300).unwrap();
        assert_eq!(resolution.record.labels.len(), 2);
    }

    #[test]
    fn sequential_edits_take_the_later_remote_unchanged() {
        let start = base();
        let local = edit(&start, device(1), T0, set_body("local", T0));
        let remote = edit(&start, device(2), T0 + 30_000, set_body("remote", T0 + 30_000));

        let resolution = resolver(1).resolve(&local, &remote, T0 + 31_000).unwrap();
        assert_eq!(resolution.outcome, Outcome::TakeRemote);
        assert_eq!(resolution.record, remote);
        assert_eq!(resolution.conflict, Some(ConflictStrategy::LastWriterWins));
    }

    #[test]
    fn later_local_at_equal_version_is_reissued() {
        let start = base();
        let local = edit(&start, device(1), T0 + 30_000, set_body("local", T0 + 30_000));
        let remote = edit(&start, device(2), T0, set_body("remote", T0));

        let resolution = resolver(1).resolve(&local, &remote, T0 + 31_000).unwrap();
        assert_eq!(
            resolution.outcome,
            Outcome::Rewrite(ConflictStrategy::LastWriterWins)
        );
        assert_eq!(resolution.record.version, 3);
        assert_eq!(resolution.record.updated_at, local.updated_at);
        assert_eq!(resolution.record.content().unwrap().body, "local");
    }

    #[test]
    fn remote_winner_below_local_version_never_regresses() {
        let start = base();
        let v2 = edit(&start, device(1), T0, set_body("one", T0));
        let local = edit(&v2, device(1), T0 + 1, set_body("two", T0 + 1));
        let remote = edit(&start, device(2), T0 + 60_000, set_body("remote", T0 + 60_000));

        let resolution = resolver(1).resolve(&local, &remote, T0 + 61_000).unwrap();
        assert_eq!(resolution.record.version, 4);
        assert_eq!(resolution.record.content().unwrap().body, "remote");
    }

    #[test]
    fn tombstone_beats_concurrent_edit() {
        let start = base();
        let local = edit(&start, device(2), T0 + 5_000, set_body("edited", T0 + 5_000));
        let remote = tombstone(&start, device(1), T0 + 1_000);

        let resolution = resolver(2).resolve(&local, &remote, T0 + 6_000).unwrap();
        assert_eq!(resolution.outcome, Outcome::TakeRemote);
        assert!(resolution.record.is_deleted());
        assert_eq!(resolution.conflict, Some(ConflictStrategy::Tombstone));
    }

    #[test]
    fn explicit_restore_beats_older_tombstone() {
        let start = base();
        let deleted = tombstone(&start, device(1), T0 + 1_000);
        let mut restored = edit(&deleted, device(1), T0 + 2_000, |_| {});
        restored.deleted_at = None;
        restored.restored_at = Some(T0 + 2_000);
        let remote = tombstone(&start, device(2), T0 + 1_500);

        let resolution = resolver(1).resolve(&restored, &remote, T0 + 3_000).unwrap();
        assert_eq!(resolution.outcome, Outcome::KeepLocal);
        assert!(!resolution.record.is_deleted());
        assert_eq!(resolution.conflict, Some(ConflictStrategy::Restore));
    }

    #[test]
    fn edit_after_own_tombstone_without_restore_is_a_fault() {
        let start = base();
        let deleted = tombstone(&start, device(1), T0 + 1_000);
        let mut edited = edit(&deleted, device(1), T0 + 2_000, set_body("zombie", T0 + 2_000));
        edited.deleted_at = None;

        let error = resolver(2).resolve(&deleted, &edited, T0 + 3_000).unwrap_err();
        assert!(matches!(error, Error::ConsistencyFault { .. }));
    }

    #[test]
    fn both_tombstoned_picks_newer() {
        let start = base();
        let local = tombstone(&start, device(1), T0 + 1_000);
        let remote = tombstone(&start, device(2), T0 + 2_000);

        let resolution = resolver(1).resolve(&local, &remote, T0 + 3_000).unwrap();
        assert_eq!(resolution.outcome, Outcome::TakeRemote);
        assert_eq!(resolution.record, remote);
    }

    #[test]
    fn merged_record_supersedes_its_sources() {
        let start = base();
        let a = edit(&start, device(1), T0 + 100, set_body("apples", T0 + 100));
        let b = edit(&start, device(2), T0 + 200, set_body("pears", T0 + 200));
        let merged = resolver(1).resolve(&a, &b, T0 + 300).unwrap().record;

        let on_b = resolver(2).resolve(&b, &merged, T0 + 400).unwrap();
        assert_eq!(on_b.outcome, Outcome::TakeRemote);
        assert_eq!(on_b.record, merged);

        let replay = resolver(1).resolve(&merged, &b, T0 + 500).unwrap();
        assert_eq!(replay.outcome, Outcome::KeepLocal);
        assert_eq!(replay.record, merged);
    }

    #[test]
    fn resolving_twice_is_idempotent() {
        let start = base();
        let local = edit(&start, device(1), T0, set_title("New title", T0));
        let remote = edit(&start, device(2), T0 + 2_000, set_body("milk and bread", T0 + 2_000));

        let first = resolver(1).resolve(&local, &remote, T0 + 3_000).unwrap();
        let second = resolver(1).resolve(&first.record, &remote, T0 + 4_000).unwrap();
        assert_eq!(second.outcome, Outcome::KeepLocal);
        assert_eq!(second.record, first.record);
    }

    #[test]
    fn merge_equal_to_one_side_keeps_that_side() {
        let start = base();
        let local = edit(&start, device(1), T0 + 100, set_body("milk and eggs", T0 + 100));
        let remote = edit(&start, device(2), T0 + 200, set_body("milk", T0 + 200));

        let resolution = resolver(1).resolve(&local, &remote, T0 + 300).unwrap();
        assert_eq!(resolution.record.content().unwrap().body, "milk and eggs");
        assert_eq!(resolution.record.version, 3);
        assert_eq!(
            resolution.outcome,
            Outcome::Rewrite(ConflictStrategy::Merge)
        );
    }

    #[test]
    fn sealed_payload_is_rejected() {
        let local = base();
        let remote = seal_record(&local, &MasterKey::generate()).unwrap();
        assert!(matches!(
            resolver(1).resolve(&local, &remote, T0),
            Err(Error::Validation(_))
        ));
    }
}

//! Record model

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::content::{Content, Payload};
use crate::error::{Error, Result};
use crate::util::now_millis;

/// A unique identifier for a record, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Create a new unique record ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identifies the device that produced a record version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Create a new random device ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// Lexicographic on the textual form so every device breaks ties the same way.
impl Ord for DeviceId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(&other.as_str())
    }
}

impl PartialOrd for DeviceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Account that owns a record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into().trim().to_string();
        if value.is_empty() {
            return Err(Error::Validation("owner id must not be empty".to_string()));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OwnerId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<OwnerId> for String {
    fn from(value: OwnerId) -> Self {
        value.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The closed set of record kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Note,
    Folder,
    Tag,
    Template,
}

impl RecordKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Note => "note",
            Self::Folder => "folder",
            Self::Tag => "tag",
            Self::Template => "template",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "note" => Ok(Self::Note),
            "folder" => Ok(Self::Folder),
            "tag" => Ok(Self::Tag),
            "template" => Ok(Self::Template),
            other => Err(Error::Validation(format!("unknown record kind '{other}'"))),
        }
    }
}

/// One side that contributed to a merged record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSource {
    pub version: u64,
    pub device: DeviceId,
    pub updated_at: i64,
}

/// Provenance of a record synthesized by the conflict resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeMetadata {
    pub sources: Vec<MergeSource>,
    pub merged_at: i64,
    pub merged_by: DeviceId,
}

impl MergeMetadata {
    /// Whether the given version was folded into this merge
    #[must_use]
    pub fn includes(&self, version: u64, device: &DeviceId) -> bool {
        self.sources
            .iter()
            .any(|source| source.version == version && &source.device == device)
    }
}

/// A local edit applied through [`Record::apply_local_edit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    SetTitle(String),
    SetBody(String),
    SetParent(Option<RecordId>),
    AddLabel(RecordId),
    RemoveLabel(RecordId),
    SetLabels(BTreeSet<RecordId>),
    /// Bring a tombstoned record back
    Restore,
}

/// The unit of sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Unique identifier
    pub id: RecordId,
    /// Owning account (immutable)
    pub owner_id: OwnerId,
    /// Record kind
    pub kind: RecordKind,
    /// Plaintext or sealed payload
    pub payload: Payload,
    /// Containing folder, if any
    pub parent_ref: Option<RecordId>,
    /// Tag record ids
    #[serde(default)]
    pub labels: BTreeSet<RecordId>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
    /// Tombstone timestamp; `None` while active
    pub deleted_at: Option<i64>,
    /// Set by an explicit restore of a tombstone
    #[serde(default)]
    pub restored_at: Option<i64>,
    /// Incremented on every accepted write
    pub version: u64,
    /// Device that produced this version
    pub origin_device: DeviceId,
    /// Present only on records produced by the conflict resolver
    #[serde(default)]
    pub merge_metadata: Option<MergeMetadata>,
}

impl Record {
    /// Create a new record at version 1
    pub fn create(
        kind: RecordKind,
        owner_id: OwnerId,
        content: Content,
        parent_ref: Option<RecordId>,
        labels: impl IntoIterator<Item = RecordId>,
        device: DeviceId,
    ) -> Result<Self> {
        let now = now_millis();
        let record = Self {
            id: RecordId::new(),
            owner_id,
            kind,
            payload: Payload::plain(content),
            parent_ref,
            labels: labels.into_iter().collect(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            restored_at: None,
            version: 1,
            origin_device: device,
            merge_metadata: None,
        };
        record.validate()?;
        Ok(record)
    }

    /// Check structural rules that every accepted write must satisfy
    pub fn validate(&self) -> Result<()> {
        if self.version == 0 {
            return Err(Error::Validation(format!("record {} has version 0", self.id)));
        }
        if self.parent_ref == Some(self.id) {
            return Err(Error::Validation(format!(
                "record {} cannot be its own parent",
                self.id
            )));
        }
        if self.labels.contains(&self.id) {
            return Err(Error::Validation(format!(
                "record {} cannot label itself",
                self.id
            )));
        }
        if self.updated_at < self.created_at {
            return Err(Error::Validation(format!(
                "record {} updated before it was created",
                self.id
            )));
        }
        Ok(())
    }

    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Plaintext content (fails while sealed)
    pub fn content(&self) -> Result<&Content> {
        self.payload.content()
    }

    /// Apply a local edit, producing the next version
    pub fn apply_local_edit(&self, mutation: Mutation, device: DeviceId) -> Result<Self> {
        let is_restore = matches!(mutation, Mutation::Restore);
        if self.is_deleted() && !is_restore {
            return Err(Error::Validation(format!(
                "invalid mutation: record {} is deleted; restore it first",
                self.id
            )));
        }

        let now = now_millis().max(self.updated_at);
        let mut next = self.next_version(now, device);

        match mutation {
            Mutation::SetTitle(title) => {
                let content = next.payload.content_mut()?;
                content.title = title;
                content.title_updated_at = now;
            }
            Mutation::SetBody(body) => {
                let content = next.payload.content_mut()?;
                content.body = body;
                content.body_updated_at = now;
            }
            Mutation::SetParent(parent) => next.parent_ref = parent,
            Mutation::AddLabel(label) => {
                next.labels.insert(label);
            }
            Mutation::RemoveLabel(label) => {
                next.labels.remove(&label);
            }
            Mutation::SetLabels(labels) => next.labels = labels,
            Mutation::Restore => {
                if !self.is_deleted() {
                    return Err(Error::Validation(format!(
                        "invalid mutation: record {} is not deleted",
                        self.id
                    )));
                }
                next.deleted_at = None;
                next.restored_at = Some(now);
            }
        }

        next.validate()?;
        Ok(next)
    }

    /// Mark the record deleted, producing the next version
    pub fn tombstone(&self, device: DeviceId, clear_payload: bool) -> Result<Self> {
        if self.is_deleted() {
            return Err(Error::Validation(format!(
                "record {} is already deleted",
                self.id
            )));
        }

        let now = now_millis().max(self.updated_at);
        let mut next = self.next_version(now, device);
        next.deleted_at = Some(now);
        if clear_payload {
            next.payload = Payload::plain(Content {
                title_updated_at: now,
                body_updated_at: now,
                ..Content::default()
            });
        }
        Ok(next)
    }

    /// Total order used to break ties identically on every device
    #[must_use]
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.order_key().cmp(&other.order_key()) == Ordering::Greater
    }

    /// Semantic equality, ignoring sync bookkeeping
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.id == other.id
            && self.owner_id == other.owner_id
            && self.kind == other.kind
            && self.parent_ref == other.parent_ref
            && self.labels == other.labels
            && self.deleted_at == other.deleted_at
            && self.restored_at == other.restored_at
            && self.payload.same_as(&other.payload)
    }

    fn order_key(&self) -> (u64, i64, String) {
        (self.version, self.updated_at, self.origin_device.as_str())
    }

    /// Whether storing `self` over `stored` would bring a tombstone back
    /// without a restore made at or after the deletion
    #[must_use]
    pub fn revives(&self, stored: &Self) -> bool {
        match (stored.deleted_at, self.deleted_at) {
            (Some(deleted_at), None) => !self
                .restored_at
                .is_some_and(|restored_at| restored_at >= deleted_at),
            _ => false,
        }
    }

    fn next_version(&self, now: i64, device: DeviceId) -> Self {
        Self {
            version: self.version + 1,
            updated_at: now,
            origin_device: device,
            merge_metadata: None,
            ..self.clone()
        }
    }
}

//! Sync conflict journal model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// How a conflicting pair of versions was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Clearly sequential edits, the later `updated_at` won
    LastWriterWins,
    /// Concurrent edits were merged field by field
    Merge,
    /// A deletion took precedence over an edit
    Tombstone,
    /// A restore took precedence over a deletion
    Restore,
    /// The pair violated the protocol and was left for manual inspection
    Fault,
}

impl ConflictStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LastWriterWins => "lww",
            Self::Merge => "merge",
            Self::Tombstone => "tombstone",
            Self::Restore => "restore",
            Self::Fault => "fault",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lww" => Ok(Self::LastWriterWins),
            "merge" => Ok(Self::Merge),
            "tombstone" => Ok(Self::Tombstone),
            "restore" => Ok(Self::Restore),
            "fault" => Ok(Self::Fault),
            other => Err(Error::Database(format!("unknown conflict strategy '{other}'"))),
        }
    }
}

/// Recorded sync conflict and how it was settled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier (0 until stored)
    pub id: i64,
    /// Record involved in the conflict
    pub record_id: String,
    /// Local version at the time of the conflict
    pub local_version: u64,
    /// Incoming remote version
    pub incoming_version: u64,
    /// Existing row's timestamp when conflict occurred
    pub local_updated_at: i64,
    /// Incoming row's timestamp
    pub incoming_updated_at: i64,
    /// Resolution timestamp (unix ms)
    pub resolved_at: i64,
    /// Resolution strategy
    pub strategy: ConflictStrategy,
    /// Free-form detail (fault reason, merged version)
    pub detail: Option<String>,
}

//! Record payloads

use serde::{Deserialize, Serialize};

use crate::crypto::Envelope;
use crate::error::{Error, Result};

/// Plaintext body of a record.
///
/// Titles and bodies carry their own edit stamps so concurrent edits to
/// different fields can both survive a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    /// Short scalar title (note title, folder/tag/template name)
    pub title: String,
    /// Free text
    pub body: String,
    /// When `title` was last changed (Unix ms)
    pub title_updated_at: i64,
    /// When `body` was last changed (Unix ms)
    pub body_updated_at: i64,
}

impl Content {
    /// Create content stamped at `now`
    #[must_use]
    pub fn new(title: impl Into<String>, body: impl Into<String>, now: i64) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            title_updated_at: now,
            body_updated_at: now,
        }
    }

    /// Whether the text fields match, ignoring edit stamps
    #[must_use]
    pub fn same_text(&self, other: &Self) -> bool {
        self.title == other.title && self.body == other.body
    }

    /// Serialize to the bytes that get sealed
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse bytes produced by [`Content::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Record payload: plaintext locally, sealed when it crosses the remote boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "snake_case")]
pub enum Payload {
    Plain { content: Content },
    Sealed { envelope: Envelope },
}

impl Payload {
    #[must_use]
    pub const fn plain(content: Content) -> Self {
        Self::Plain { content }
    }

    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        matches!(self, Self::Sealed { .. })
    }

    /// Borrow the plaintext content, failing if the payload is still sealed
    pub fn content(&self) -> Result<&Content> {
        match self {
            Self::Plain { content } => Ok(content),
            Self::Sealed { .. } => Err(Error::Validation(
                "payload is sealed; open it before reading content".to_string(),
            )),
        }
    }

    pub(crate) fn content_mut(&mut self) -> Result<&mut Content> {
        match self {
            Self::Plain { content } => Ok(content),
            Self::Sealed { .. } => Err(Error::Validation(
                "cannot edit a sealed payload".to_string(),
            )),
        }
    }

    /// Semantic comparison: text for plaintext, exact bytes for envelopes
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Plain { content: a }, Self::Plain { content: b }) => a.same_text(b),
            (Self::Sealed { envelope: a }, Self::Sealed { envelope: b }) => a == b,
            _ => false,
        }
    }
}

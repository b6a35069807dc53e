//! Data models for tern

mod conflict;
mod content;
mod record;

pub use conflict::{ConflictStrategy, SyncConflict};
pub use content::{Content, Payload};
pub use record::{
    DeviceId, MergeMetadata, MergeSource, Mutation, OwnerId, Record, RecordId, RecordKind,
};

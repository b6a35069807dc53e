use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] tern_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Record ID cannot be empty")]
    EmptyRecordId,
    #[error("Record title cannot be empty")]
    EmptyTitle,
    #[error("Record not found for id/prefix: {0}")]
    RecordNotFound(String),
    #[error("{0}")]
    AmbiguousRecordId(String),
    #[error("Edited record cannot be empty")]
    EmptyEditedContent,
    #[error("Editor command failed: {0}")]
    EditorFailed(String),
    #[error("No secret provided. Set {0} or pipe it on stdin.")]
    EmptySecret(&'static str),
    #[error("No master key stored for this device. Run `tern key init` first.")]
    KeyNotInitialized,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "No remote store configured. Pass --remote-dir or --remote-url, or set TERN_REMOTE_DIR / TERN_REMOTE_URL."
    )]
    RemoteNotConfigured,
    #[error(
        "Key rotation unfinished: {pending} records pending, {remaining} remote copies under the previous key. Run `tern key rotate` again."
    )]
    RotationUnfinished { pending: usize, remaining: usize },
}

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tern_core::RecordKind;

#[derive(Parser)]
#[command(name = "tern")]
#[command(about = "Offline-first, end-to-end encrypted record sync")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding the local database and sync queue
    #[arg(long, global = true, value_name = "PATH")]
    pub data_dir: Option<PathBuf>,

    /// Shared directory used as the remote store
    #[arg(long, global = true, value_name = "PATH", conflicts_with = "remote_url")]
    pub remote_dir: Option<PathBuf>,

    /// HTTP endpoint of the remote store
    #[arg(long, global = true, value_name = "URL")]
    pub remote_url: Option<String>,

    /// Sync configuration file (JSON)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a record
    #[command(alias = "new")]
    Add {
        /// Record title
        title: String,
        /// Record body (read from stdin when omitted and piped)
        body: Vec<String>,
        #[arg(long, value_enum, default_value_t = KindArg::Note)]
        kind: KindArg,
        /// Containing folder id
        #[arg(long, value_name = "ID")]
        parent: Option<String>,
        /// Tag record id (repeatable)
        #[arg(long = "label", value_name = "ID")]
        labels: Vec<String>,
    },
    /// Edit a record (opens $EDITOR when no field flags are given)
    Edit {
        /// Record ID or unique ID prefix
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        body: Option<String>,
        /// Move into a folder
        #[arg(long, value_name = "ID", conflicts_with = "no_parent")]
        parent: Option<String>,
        /// Move out of its folder
        #[arg(long)]
        no_parent: bool,
        #[arg(long = "add-label", value_name = "ID")]
        add_labels: Vec<String>,
        #[arg(long = "remove-label", value_name = "ID")]
        remove_labels: Vec<String>,
    },
    /// Delete a record (leaves a tombstone that syncs)
    Delete {
        /// Record ID or unique ID prefix
        id: String,
    },
    /// Bring back a deleted record
    Restore {
        /// Record ID or unique ID prefix
        id: String,
    },
    /// List records, most recently updated first
    List {
        /// Number of records to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
        /// Include deleted records
        #[arg(long)]
        include_deleted: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one record
    Show {
        /// Record ID or unique ID prefix
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one sync pass against the remote store
    Sync {
        /// Output the pass report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Keep syncing in the foreground until interrupted
    Watch {
        /// Seconds between polls for remote changes while idle
        #[arg(long, default_value = "30", value_name = "SECS")]
        interval: u64,
    },
    /// Show sync state and queue diagnostics
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recently resolved sync conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage the master key
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Derive the master key from TERN_SECRET (or stdin) and store it in the OS keychain
    Init,
    /// Show the stored key id and whether a rotation is unfinished
    Status,
    /// Switch to a key derived from TERN_NEW_SECRET (or stdin) and re-seal every record
    Rotate,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KindArg {
    Note,
    Folder,
    Tag,
    Template,
}

impl From<KindArg> for RecordKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Note => Self::Note,
            KindArg::Folder => Self::Folder,
            KindArg::Tag => Self::Tag,
            KindArg::Template => Self::Template,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

use std::env;
use std::io::{self, BufRead, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use serde::Serialize;
use tern_core::crypto::KeyRing;
use tern_core::db::LibSqlLocalStore;
use tern_core::models::{OwnerId, SyncConflict};
use tern_core::queue::FileJournal;
use tern_core::remote::{DirRemoteStore, HttpRemoteStore};
use tern_core::store::{MemoryRemoteStore, RecordFilter, RemoteStore};
use tern_core::{Record, RecordId, SyncConfig, SyncEngine, SyncEngineBuilder};

use crate::cli::Cli;
use crate::error::CliError;
use crate::keystore::KeychainStorage;

const DATABASE_FILE: &str = "tern.db";
const JOURNAL_FILE: &str = "queue.json";
const CONFIG_FILE: &str = "config.json";
const DEFAULT_OWNER: &str = "local";

pub const SECRET_ENV: &str = "TERN_SECRET";
pub const NEW_SECRET_ENV: &str = "TERN_NEW_SECRET";

/// Where a command reads and writes, resolved from flags and the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    pub data_dir: PathBuf,
    pub remote: Option<RemoteTarget>,
    pub config_path: PathBuf,
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteTarget {
    Dir(PathBuf),
    Url(String),
}

impl Context {
    pub fn from_cli(cli: &Cli) -> Result<Self, CliError> {
        let data_dir = resolve_data_dir(cli.data_dir.clone())?;
        let remote = resolve_remote(
            cli.remote_dir
                .clone()
                .or_else(|| env::var_os("TERN_REMOTE_DIR").map(PathBuf::from)),
            cli.remote_url
                .clone()
                .or_else(|| env::var("TERN_REMOTE_URL").ok()),
        );
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| data_dir.join(CONFIG_FILE));
        let owner = env::var("TERN_OWNER")
            .ok()
            .and_then(|value| normalize_text(&value))
            .unwrap_or_else(|| DEFAULT_OWNER.to_string());

        Ok(Self {
            data_dir,
            remote,
            config_path,
            owner,
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join(JOURNAL_FILE)
    }
}

/// A remote dir wins over a remote URL when both are set
pub fn resolve_remote(dir: Option<PathBuf>, url: Option<String>) -> Option<RemoteTarget> {
    dir.map(RemoteTarget::Dir)
        .or_else(|| url.and_then(|url| normalize_text(&url)).map(RemoteTarget::Url))
}

pub fn resolve_data_dir(cli_data_dir: Option<PathBuf>) -> Result<PathBuf, CliError> {
    cli_data_dir
        .or_else(|| env::var_os("TERN_DATA_DIR").map(PathBuf::from))
        .or_else(default_data_dir)
        .ok_or_else(|| {
            CliError::Config("cannot resolve a data directory; pass --data-dir".to_string())
        })
}

pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("tern"))
}

/// Whether the engine may talk to the remote store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineMode {
    /// Local commands; works without a remote configured
    Local,
    /// Sync commands; a remote store is required
    Sync,
}

/// Local store, queue journal, remote and keys for this device, wired into an engine
pub struct OpenedEngine {
    pub engine: SyncEngine,
    pub keys: KeychainStorage,
    pub key_ring: Option<KeyRing>,
}

pub async fn open_engine(context: &Context, mode: EngineMode) -> Result<OpenedEngine, CliError> {
    std::fs::create_dir_all(&context.data_dir)?;
    let config = SyncConfig::load(Some(&context.config_path))?;

    let local = Arc::new(LibSqlLocalStore::open(context.database_path()).await?);
    let device = local.device_id().await?;
    let keys = KeychainStorage::for_device(&device);
    let key_ring = KeyRing::load(&keys)?;

    let (remote, online): (Arc<dyn RemoteStore>, bool) = match (&context.remote, mode) {
        (Some(RemoteTarget::Dir(root)), _) => (Arc::new(DirRemoteStore::open(root)?), true),
        (Some(RemoteTarget::Url(url)), _) => {
            let store = HttpRemoteStore::new(url)?
                .with_bearer_token(env::var("TERN_REMOTE_TOKEN").ok());
            (Arc::new(store), true)
        }
        (None, EngineMode::Sync) => return Err(CliError::RemoteNotConfigured),
        // Local writes still land in the persistent queue for a later sync.
        (None, EngineMode::Local) => (Arc::new(MemoryRemoteStore::new()), false),
    };

    let owner = OwnerId::new(context.owner.clone())?;
    let mut builder = SyncEngineBuilder::new(owner, device, local, remote)
        .journal(FileJournal::new(context.journal_path()))
        .config(config)
        .online(online);
    if let Some(ring) = key_ring.clone() {
        builder = builder.key_ring(ring);
    }
    let engine = builder.build().await?;
    tracing::debug!(device_id = %device, data_dir = %context.data_dir.display(), "Opened engine");

    Ok(OpenedEngine {
        engine,
        keys,
        key_ring,
    })
}

#[derive(Debug, Serialize)]
pub struct RecordListItem {
    pub id: String,
    pub kind: String,
    pub title: String,
    pub preview: String,
    pub body: String,
    pub parent: Option<String>,
    pub labels: Vec<String>,
    pub version: u64,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    pub relative_time: String,
}

#[derive(Debug, Serialize)]
pub struct SyncConflictItem {
    pub id: i64,
    pub record_id: String,
    pub local_version: u64,
    pub incoming_version: u64,
    pub local_updated_at: i64,
    pub incoming_updated_at: i64,
    pub resolved_at: i64,
    pub resolved_at_iso: String,
    pub strategy: String,
    pub detail: Option<String>,
}

pub async fn resolve_record(query: &str, engine: &SyncEngine) -> Result<Record, CliError> {
    if let Ok(id) = query.parse::<RecordId>() {
        if let Some(record) = engine.get(&id).await? {
            return Ok(record);
        }
    }

    let filter = RecordFilter {
        include_deleted: true,
        ..RecordFilter::default()
    };
    let mut matching = engine
        .list(&filter)
        .await?
        .into_iter()
        .filter(|record| record.id.to_string().starts_with(query))
        .collect::<Vec<_>>();

    match matching.len() {
        0 => Err(CliError::RecordNotFound(query.to_string())),
        1 => Ok(matching.remove(0)),
        _ => {
            let options = matching
                .iter()
                .take(3)
                .map(|record| short_id(&record.id))
                .collect::<Vec<_>>()
                .join(", ");

            Err(CliError::AmbiguousRecordId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

pub fn parse_record_ids(values: &[String]) -> Result<Vec<RecordId>, CliError> {
    values
        .iter()
        .map(|value| {
            let value = normalize_record_identifier(value)?;
            value
                .parse::<RecordId>()
                .map_err(|_| CliError::RecordNotFound(value))
        })
        .collect()
}

pub fn short_id(id: &RecordId) -> String {
    id.to_string().chars().take(13).collect()
}

pub fn format_record_lines(records: &[Record]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let preview = record_preview(record, 40);
            let relative_time = format_relative_time(record.updated_at, now_ms);
            let marker = if record.is_deleted() { "  (deleted)" } else { "" };
            format!(
                "{:<13}  {:<8}  {preview:<40}  {relative_time}{marker}",
                short_id(&record.id),
                record.kind.as_str()
            )
        })
        .collect()
}

pub fn record_to_list_item(record: &Record) -> RecordListItem {
    let now_ms = Utc::now().timestamp_millis();
    let (title, body) = record
        .content()
        .map_or_else(|_| (String::new(), String::new()), |c| (c.title.clone(), c.body.clone()));

    RecordListItem {
        id: record.id.to_string(),
        kind: record.kind.to_string(),
        title,
        preview: record_preview(record, 80),
        body,
        parent: record.parent_ref.map(|id| id.to_string()),
        labels: record.labels.iter().map(ToString::to_string).collect(),
        version: record.version,
        created_at: record.created_at,
        updated_at: record.updated_at,
        deleted_at: record.deleted_at,
        relative_time: format_relative_time(record.updated_at, now_ms),
    }
}

/// Title, or the first body line for untitled records
pub fn record_preview(record: &Record, max_chars: usize) -> String {
    let Ok(content) = record.content() else {
        return "(sealed)".to_string();
    };
    let source = if content.title.trim().is_empty() {
        content.body.lines().next().unwrap_or("")
    } else {
        content.title.as_str()
    };
    let collapsed = source.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn sync_conflict_to_item(conflict: &SyncConflict) -> SyncConflictItem {
    SyncConflictItem {
        id: conflict.id,
        record_id: conflict.record_id.clone(),
        local_version: conflict.local_version,
        incoming_version: conflict.incoming_version,
        local_updated_at: conflict.local_updated_at,
        incoming_updated_at: conflict.incoming_updated_at,
        resolved_at: conflict.resolved_at,
        resolved_at_iso: format_sync_timestamp(conflict.resolved_at),
        strategy: conflict.strategy.to_string(),
        detail: conflict.detail.clone(),
    }
}

pub fn format_sync_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let mut line = format!(
                "{}  {:<9}  record={}  local=v{} incoming=v{}",
                format_sync_timestamp(conflict.resolved_at),
                conflict.strategy,
                conflict.record_id,
                conflict.local_version,
                conflict.incoming_version
            );
            if let Some(detail) = &conflict.detail {
                line.push_str("  ");
                line.push_str(detail);
            }
            line
        })
        .collect()
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

pub fn normalize_text(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn normalize_record_identifier(id: &str) -> Result<String, CliError> {
    normalize_text(id).ok_or(CliError::EmptyRecordId)
}

/// Editor buffer layout: title on the first line, then a blank line, then the body
pub fn render_editor_buffer(title: &str, body: &str) -> String {
    if body.is_empty() {
        format!("{title}\n")
    } else {
        format!("{title}\n\n{body}\n")
    }
}

/// Split an edited buffer back into `(title, body)`
pub fn parse_editor_buffer(buffer: &str) -> Option<(String, String)> {
    let buffer = buffer.trim();
    if buffer.is_empty() {
        return None;
    }
    let (title, body) = buffer.split_once('\n').unwrap_or((buffer, ""));
    Some((title.trim().to_string(), body.trim().to_string()))
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(normalize_text(&buffer))
}

/// Read a secret from `env_name`, or from one line of stdin
pub fn read_secret(env_name: &'static str, prompt: &str) -> Result<String, CliError> {
    if let Some(secret) = env::var(env_name).ok().and_then(|value| normalize_text(&value)) {
        return Ok(secret);
    }

    let stdin = io::stdin();
    if stdin.is_terminal() {
        eprint!("{prompt}: ");
        io::stderr().flush()?;
    }
    let mut line = String::new();
    stdin.lock().read_line(&mut line)?;
    normalize_text(&line).ok_or(CliError::EmptySecret(env_name))
}

pub fn capture_editor_input_with_initial(
    initial_content: &str,
) -> Result<Option<String>, CliError> {
    let editor = preferred_editor();
    let temp_file = create_temp_record_file_path();
    std::fs::write(&temp_file, initial_content)?;

    let launch_result = launch_editor(&editor, &temp_file);
    let edited = std::fs::read_to_string(&temp_file)?;
    let _ = std::fs::remove_file(&temp_file);

    launch_result?;
    Ok(normalize_text(&edited))
}

pub fn launch_editor(editor: &str, file_path: &Path) -> Result<(), CliError> {
    match Command::new(editor).arg(file_path).status() {
        Ok(status) => {
            if status.success() {
                Ok(())
            } else {
                Err(CliError::EditorFailed(format!(
                    "`{editor}` exited with status {status}"
                )))
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let mut parts = editor.split_whitespace();
            let Some(program) = parts.next() else {
                return Err(CliError::EditorFailed("empty EDITOR command".into()));
            };

            let mut command = Command::new(program);
            command.args(parts).arg(file_path);

            let status = command.status()?;
            if status.success() {
                Ok(())
            } else {
                Err(CliError::EditorFailed(format!(
                    "`{editor}` exited with status {status}"
                )))
            }
        }
        Err(err) => Err(CliError::Io(err)),
    }
}

pub fn preferred_editor() -> String {
    env::var("VISUAL")
        .or_else(|_| env::var("EDITOR"))
        .unwrap_or_else(|_| default_editor().to_string())
}

pub const fn default_editor() -> &'static str {
    if cfg!(windows) {
        "notepad"
    } else {
        "vi"
    }
}

pub fn create_temp_record_file_path() -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    env::temp_dir().join(format!("tern-record-{}-{now}.md", std::process::id()))
}

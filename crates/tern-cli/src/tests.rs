use std::path::{Path, PathBuf};

use clap::Parser;
use pretty_assertions::assert_eq;
use tern_core::crypto::KeyRing;
use tern_core::models::{ConflictStrategy, SyncConflict};
use tern_core::store::RecordFilter;
use tern_core::sync::{KeyRotation, NewRecord, SyncReport};
use tern_core::{Mutation, RecordId};

use crate::cli::{Cli, Commands, CompletionShell};
use crate::commands::common::{
    default_editor, format_relative_time, format_sync_conflict_lines, format_sync_timestamp,
    normalize_record_identifier, normalize_text, open_engine, parse_editor_buffer,
    parse_record_ids, record_preview, render_editor_buffer, resolve_record, resolve_remote,
    Context, EngineMode, RemoteTarget,
};
use crate::commands::completions::render_completions;
use crate::commands::edit::EditArgs;
use crate::commands::key::{ensure_rotation_complete, run_key_rotate};
use crate::commands::sync::{format_status_lines, format_sync_report};
use crate::error::CliError;

#[test]
fn normalize_text_trims_and_rejects_empty() {
    assert_eq!(normalize_text("  hello  "), Some("hello".to_string()));
    assert_eq!(normalize_text(" \n\t "), None);
    assert!(matches!(
        normalize_record_identifier("   "),
        Err(CliError::EmptyRecordId)
    ));
}

#[test]
fn default_editor_is_defined() {
    assert!(!default_editor().is_empty());
}

#[test]
fn editor_buffer_splits_title_from_body() {
    let buffer = render_editor_buffer("Shopping", "milk\neggs");
    assert_eq!(buffer, "Shopping\n\nmilk\neggs\n");
    assert_eq!(
        parse_editor_buffer(&buffer),
        Some(("Shopping".to_string(), "milk\neggs".to_string()))
    );
    assert_eq!(
        parse_editor_buffer("Only a title\n"),
        Some(("Only a title".to_string(), String::new()))
    );
    assert_eq!(parse_editor_buffer(" \n "), None);
}

#[test]
fn remote_dir_wins_over_url() {
    assert_eq!(
        resolve_remote(Some(PathBuf::from("/shared")), Some("https://sync.example.com".into())),
        Some(RemoteTarget::Dir(PathBuf::from("/shared")))
    );
    assert_eq!(
        resolve_remote(None, Some("  https://sync.example.com ".into())),
        Some(RemoteTarget::Url("https://sync.example.com".to_string()))
    );
    assert_eq!(resolve_remote(None, Some("  ".into())), None);
}

#[test]
fn remote_flags_are_mutually_exclusive() {
    let parsed = Cli::try_parse_from([
        "tern",
        "--remote-dir",
        "/shared",
        "--remote-url",
        "https://sync.example.com",
        "sync",
    ]);
    assert!(parsed.is_err());

    let cli = Cli::try_parse_from(["tern", "list", "--kind", "folder", "--json"]).unwrap();
    assert!(matches!(cli.command, Commands::List { json: true, .. }));
}

#[test]
fn record_ids_must_be_full_uuids() {
    let id = RecordId::new();
    assert_eq!(parse_record_ids(&[id.to_string()]).unwrap(), vec![id]);
    assert!(matches!(
        parse_record_ids(&["0190".to_string()]),
        Err(CliError::RecordNotFound(_))
    ));
}

#[test]
fn edit_args_become_mutations_in_order() {
    let folder = RecordId::new();
    let tag = RecordId::new();
    let args = EditArgs {
        title: Some("New title".to_string()),
        parent: Some(folder.to_string()),
        add_labels: vec![tag.to_string()],
        ..EditArgs::default()
    };
    assert!(!args.is_empty());
    assert_eq!(
        args.into_mutations().unwrap(),
        vec![
            Mutation::SetTitle("New title".to_string()),
            Mutation::SetParent(Some(folder)),
            Mutation::AddLabel(tag),
        ]
    );

    let detach = EditArgs {
        no_parent: true,
        ..EditArgs::default()
    };
    assert_eq!(detach.into_mutations().unwrap(), vec![Mutation::SetParent(None)]);
    assert!(EditArgs::default().is_empty());
}

#[test]
fn format_relative_time_units() {
    let now = 10_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
}

#[test]
fn format_sync_timestamp_returns_utc_label() {
    assert_eq!(format_sync_timestamp(0), "1970-01-01 00:00:00 UTC");
}

#[test]
fn format_sync_conflict_lines_include_key_fields() {
    let conflicts = vec![SyncConflict {
        id: 1,
        record_id: "11111111-1111-7111-8111-111111111111".to_string(),
        local_version: 3,
        incoming_version: 4,
        local_updated_at: 200,
        incoming_updated_at: 100,
        resolved_at: 300,
        strategy: ConflictStrategy::Merge,
        detail: Some("merged into v5".to_string()),
    }];

    let rendered = format_sync_conflict_lines(&conflicts);
    assert_eq!(rendered.len(), 1);
    assert!(rendered[0].contains("merge"));
    assert!(rendered[0].contains("record=11111111-1111-7111-8111-111111111111"));
    assert!(rendered[0].contains("local=v3 incoming=v4"));
    assert!(rendered[0].ends_with("merged into v5"));
}

#[test]
fn sync_report_lists_faults_and_warnings() {
    let report = SyncReport {
        pushed: 2,
        pulled: 1,
        warnings: vec!["queue over ceiling".to_string()],
        ..SyncReport::default()
    };
    let lines = format_sync_report(&report);
    assert_eq!(
        lines[0],
        "Sync completed: pushed 2, pulled 1, adopted 0, rewritten 0, conflicts 0"
    );
    assert_eq!(lines[1], "warning: queue over ceiling");
}

#[test]
fn rotation_is_finished_only_when_nothing_depends_on_the_old_key() {
    let clean = KeyRotation {
        rewrapped: 2,
        remote_rewrapped: 5,
        remaining: 0,
    };
    assert!(ensure_rotation_complete(&clean, 0).is_ok());

    assert!(matches!(
        ensure_rotation_complete(&clean, 1),
        Err(CliError::RotationUnfinished {
            pending: 1,
            remaining: 0
        })
    ));
    let raced = KeyRotation {
        remaining: 1,
        ..clean
    };
    let error = ensure_rotation_complete(&raced, 0).unwrap_err();
    assert!(error.to_string().contains("tern key rotate"));
}

#[test]
fn completions_name_the_binary() {
    let script = String::from_utf8(render_completions(CompletionShell::Bash)).unwrap();
    assert!(script.contains("tern"));
    assert!(script.contains("conflicts"));
}

fn context(data_dir: &Path, remote_dir: Option<&Path>) -> Context {
    let config_path = data_dir.join("config.json");
    std::fs::create_dir_all(data_dir).unwrap();
    std::fs::write(&config_path, r#"{"kdf_iterations": 100000}"#).unwrap();
    Context {
        data_dir: data_dir.to_path_buf(),
        remote: remote_dir.map(|dir| RemoteTarget::Dir(dir.to_path_buf())),
        config_path,
        owner: "acct".to_string(),
    }
}

#[cfg_attr(windows, ignore = "libsql integration is flaky on windows CI")]
#[tokio::test(flavor = "multi_thread")]
async fn resolve_record_accepts_unique_prefix() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(&tmp.path().join("device"), None);
    let opened = open_engine(&ctx, EngineMode::Local).await.unwrap();
    let record = opened
        .engine
        .create(NewRecord::note("Groceries", "milk"))
        .await
        .unwrap();

    let prefix = record.id.to_string()[..20].to_string();
    let resolved = resolve_record(&prefix, &opened.engine).await.unwrap();
    assert_eq!(resolved.id, record.id);
    assert_eq!(record_preview(&resolved, 40), "Groceries");

    assert!(matches!(
        resolve_record("ffffffff", &opened.engine).await,
        Err(CliError::RecordNotFound(_))
    ));
}

#[cfg_attr(windows, ignore = "libsql integration is flaky on windows CI")]
#[tokio::test(flavor = "multi_thread")]
async fn sync_without_remote_is_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(&tmp.path().join("device"), None);
    assert!(matches!(
        open_engine(&ctx, EngineMode::Sync).await,
        Err(CliError::RemoteNotConfigured)
    ));
}

#[cfg_attr(windows, ignore = "libsql integration is flaky on windows CI")]
#[tokio::test(flavor = "multi_thread")]
async fn key_rotation_without_remote_is_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(&tmp.path().join("device"), None);
    assert!(matches!(
        run_key_rotate(&ctx).await,
        Err(CliError::RemoteNotConfigured)
    ));
}

#[cfg_attr(windows, ignore = "libsql integration is flaky on windows CI")]
#[tokio::test(flavor = "multi_thread")]
async fn offline_writes_reach_a_second_device_through_a_shared_dir() {
    let tmp = tempfile::tempdir().unwrap();
    let shared = tmp.path().join("shared");
    let laptop = context(&tmp.path().join("laptop"), Some(&shared));
    let phone = context(&tmp.path().join("phone"), Some(&shared));

    // Written while no remote was configured
    let offline = Context {
        remote: None,
        ..laptop.clone()
    };
    let id = {
        let opened = open_engine(&offline, EngineMode::Local).await.unwrap();
        let record = opened
            .engine
            .create(NewRecord::note("Trip", "passport"))
            .await
            .unwrap();
        assert_eq!(opened.engine.status().await.unwrap().pending, 1);
        record.id
    };

    let laptop_engine = open_engine(&laptop, EngineMode::Sync).await.unwrap().engine;
    let report = laptop_engine.sync_now().await.unwrap();
    assert_eq!(report.pushed, 1);

    let phone_engine = open_engine(&phone, EngineMode::Sync).await.unwrap().engine;
    phone_engine.sync_now().await.unwrap();
    let received = phone_engine.get(&id).await.unwrap().unwrap();
    assert_eq!(received.content().unwrap().body, "passport");
    assert_eq!(
        phone_engine.list(&RecordFilter::default()).await.unwrap().len(),
        1
    );
}

#[cfg_attr(windows, ignore = "libsql integration is flaky on windows CI")]
#[tokio::test(flavor = "multi_thread")]
async fn stored_key_is_loaded_on_next_open() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(&tmp.path().join("device"), None);

    let first = open_engine(&ctx, EngineMode::Local).await.unwrap();
    assert!(first.key_ring.is_none());
    let ring = KeyRing::unlock_or_initialize(&first.keys, b"correct horse", 100_000).unwrap();
    drop(first);

    let second = open_engine(&ctx, EngineMode::Local).await.unwrap();
    let loaded = second.key_ring.unwrap();
    assert_eq!(loaded.current().id(), ring.current().id());
    let status = second.engine.status().await.unwrap();
    assert_eq!(status.key_id.as_ref(), Some(ring.current().id()));
    assert!(format_status_lines(&status)
        .iter()
        .any(|line| line == &format!("key:       {}", ring.current().id())));
}

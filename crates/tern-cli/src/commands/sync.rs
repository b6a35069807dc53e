use std::time::Duration;

use tern_core::sync::{SyncReport, SyncStatus};
use tern_core::SyncState;

use crate::commands::common::{
    format_sync_conflict_lines, format_sync_timestamp, open_engine, sync_conflict_to_item, Context,
    EngineMode, SyncConflictItem,
};
use crate::error::CliError;

pub async fn run_sync(as_json: bool, context: &Context) -> Result<(), CliError> {
    let opened = open_engine(context, EngineMode::Sync).await?;
    let report = opened.engine.sync_now().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in format_sync_report(&report) {
            println!("{line}");
        }
    }
    Ok(())
}

/// Drive the engine until Ctrl-C, polling the remote whenever it is idle
pub async fn run_watch(interval_secs: u64, context: &Context) -> Result<(), CliError> {
    let opened = open_engine(context, EngineMode::Sync).await?;
    let engine = opened.engine;
    let handle = engine.spawn();
    let mut states = engine.subscribe();
    let mut poll = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));

    println!("Watching; press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                println!("{}", format_state_line(state));
            }
            _ = poll.tick() => {
                if engine.state() != SyncState::Idle {
                    continue;
                }
                match engine.sync_now().await {
                    Ok(report) if report.pulled > 0 || report.pushed > 0 => {
                        for line in format_sync_report(&report) {
                            println!("{line}");
                        }
                    }
                    Ok(_) => {}
                    Err(error) => tracing::warn!(%error, "Poll for remote changes failed"),
                }
            }
        }
    }

    engine.shutdown();
    if let Err(error) = handle.await {
        tracing::error!(%error, "Sync engine task failed");
    }
    Ok(())
}

pub async fn run_status(as_json: bool, context: &Context) -> Result<(), CliError> {
    let opened = open_engine(context, EngineMode::Local).await?;
    let status = opened.engine.status().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        for line in format_status_lines(&status) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_conflicts(limit: usize, as_json: bool, context: &Context) -> Result<(), CliError> {
    let opened = open_engine(context, EngineMode::Local).await?;
    let conflicts = opened.engine.conflicts(limit).await?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(sync_conflict_to_item)
            .collect::<Vec<SyncConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_sync_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_state_line(state: SyncState) -> String {
    format!("{}  {state}", format_sync_timestamp(chrono::Utc::now().timestamp_millis()))
}

pub fn format_sync_report(report: &SyncReport) -> Vec<String> {
    let mut lines = vec![format!(
        "Sync completed: pushed {}, pulled {}, adopted {}, rewritten {}, conflicts {}",
        report.pushed, report.pulled, report.adopted, report.rewritten, report.conflicts
    )];
    if report.cancelled {
        lines.push("Pass was cancelled before the remote watermark advanced".to_string());
    }
    for fault in &report.faults {
        lines.push(format!("fault: record={} {}", fault.record_id, fault.reason));
    }
    for warning in &report.warnings {
        lines.push(format!("warning: {warning}"));
    }
    lines
}

pub fn format_status_lines(status: &SyncStatus) -> Vec<String> {
    let mut lines = vec![
        format!("state:     {}", status.state),
        format!("online:    {}", if status.online { "yes" } else { "no" }),
        format!("device:    {}", status.device),
        format!("pending:   {}", status.pending),
    ];
    if let Some(oldest) = status.oldest_pending_at {
        lines.push(format!("oldest:    {}", format_sync_timestamp(oldest)));
    }
    lines.push(format!(
        "watermark: {}",
        status
            .watermark
            .map_or_else(|| "none".to_string(), |watermark| watermark.to_string())
    ));
    lines.push(match &status.key_id {
        Some(key_id) if status.rotating => format!("key:       {key_id} (rotation unfinished)"),
        Some(key_id) => format!("key:       {key_id}"),
        None => "key:       none (records sync unencrypted)".to_string(),
    });
    if let Some(error) = &status.last_error {
        lines.push(format!("error:     {error}"));
    }
    lines
}

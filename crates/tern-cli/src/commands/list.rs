use tern_core::store::RecordFilter;
use tern_core::RecordKind;

use crate::commands::common::{
    format_record_lines, format_sync_timestamp, normalize_record_identifier, open_engine,
    record_to_list_item, resolve_record, Context, EngineMode, RecordListItem,
};
use crate::error::CliError;

pub async fn run_list(
    limit: usize,
    kind: Option<RecordKind>,
    include_deleted: bool,
    as_json: bool,
    context: &Context,
) -> Result<(), CliError> {
    let opened = open_engine(context, EngineMode::Local).await?;
    let records = opened
        .engine
        .list(&RecordFilter {
            kind,
            include_deleted,
            limit: Some(limit),
            ..RecordFilter::default()
        })
        .await?;

    if as_json {
        let json_items = records
            .iter()
            .map(record_to_list_item)
            .collect::<Vec<RecordListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else {
        for line in format_record_lines(&records) {
            println!("{line}");
        }
    }

    Ok(())
}

pub async fn run_show(id: &str, as_json: bool, context: &Context) -> Result<(), CliError> {
    let normalized_id = normalize_record_identifier(id)?;
    let opened = open_engine(context, EngineMode::Local).await?;
    let record = resolve_record(&normalized_id, &opened.engine).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    let content = record.content()?;
    println!("id:       {}", record.id);
    println!("kind:     {}", record.kind);
    println!("version:  {}", record.version);
    println!("updated:  {}", format_sync_timestamp(record.updated_at));
    if let Some(deleted_at) = record.deleted_at {
        println!("deleted:  {}", format_sync_timestamp(deleted_at));
    }
    if let Some(parent) = record.parent_ref {
        println!("parent:   {parent}");
    }
    if !record.labels.is_empty() {
        let labels = record
            .labels
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        println!("labels:   {labels}");
    }
    println!();
    println!("{}", content.title);
    if !content.body.is_empty() {
        println!();
        println!("{}", content.body);
    }
    Ok(())
}

use tern_core::sync::NewRecord;

use crate::cli::KindArg;
use crate::commands::common::{
    normalize_text, open_engine, parse_record_ids, read_piped_stdin, Context, EngineMode,
};
use crate::error::CliError;

pub async fn run_add(
    title: &str,
    body_parts: &[String],
    kind: KindArg,
    parent: Option<&str>,
    labels: &[String],
    context: &Context,
) -> Result<(), CliError> {
    let title = normalize_text(title).ok_or(CliError::EmptyTitle)?;
    let body = resolve_body(body_parts)?;
    let parent_ref = match parent {
        Some(parent) => parse_record_ids(&[parent.to_string()])?.pop(),
        None => None,
    };

    let opened = open_engine(context, EngineMode::Local).await?;
    let record = opened
        .engine
        .create(NewRecord {
            kind: kind.into(),
            title,
            body,
            parent_ref,
            labels: parse_record_ids(labels)?.into_iter().collect(),
        })
        .await?;

    println!("{}", record.id);
    Ok(())
}

/// Body from the arguments, else piped stdin, else empty
pub fn resolve_body(body_parts: &[String]) -> Result<String, CliError> {
    if let Some(body) = normalize_text(&body_parts.join(" ")) {
        return Ok(body);
    }
    Ok(read_piped_stdin()?.unwrap_or_default())
}

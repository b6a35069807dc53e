use crate::commands::common::{
    normalize_record_identifier, open_engine, resolve_record, Context, EngineMode,
};
use crate::error::CliError;

pub async fn run_delete(id: &str, context: &Context) -> Result<(), CliError> {
    let normalized_id = normalize_record_identifier(id)?;
    let opened = open_engine(context, EngineMode::Local).await?;
    let record = resolve_record(&normalized_id, &opened.engine).await?;

    let deleted = opened.engine.delete(&record.id).await?;
    println!("{}", deleted.id);
    Ok(())
}

pub async fn run_restore(id: &str, context: &Context) -> Result<(), CliError> {
    let normalized_id = normalize_record_identifier(id)?;
    let opened = open_engine(context, EngineMode::Local).await?;
    let record = resolve_record(&normalized_id, &opened.engine).await?;

    let restored = opened.engine.restore(&record.id).await?;
    println!("{}", restored.id);
    Ok(())
}

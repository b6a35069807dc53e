//! tern CLI - local records and sync from the command line

mod cli;
mod commands;
mod error;
mod keystore;
#[cfg(test)]
mod tests;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, KeyCommands};
use crate::commands::add::run_add;
use crate::commands::common::Context;
use crate::commands::completions::run_completions;
use crate::commands::delete::{run_delete, run_restore};
use crate::commands::edit::{run_edit, EditArgs};
use crate::commands::key::{run_key_init, run_key_rotate, run_key_status};
use crate::commands::list::{run_list, run_show};
use crate::commands::sync::{run_conflicts, run_status, run_sync, run_watch};
use crate::error::CliError;

const DEFAULT_LOG_FILTER: &str = "tern=info";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell, output } = &cli.command {
        return run_completions(*shell, output.as_deref());
    }

    let context = Context::from_cli(&cli)?;
    match cli.command {
        Commands::Add {
            title,
            body,
            kind,
            parent,
            labels,
        } => run_add(&title, &body, kind, parent.as_deref(), &labels, &context).await?,
        Commands::Edit {
            id,
            title,
            body,
            parent,
            no_parent,
            add_labels,
            remove_labels,
        } => {
            let args = EditArgs {
                title,
                body,
                parent,
                no_parent,
                add_labels,
                remove_labels,
            };
            run_edit(&id, args, &context).await?;
        }
        Commands::Delete { id } => run_delete(&id, &context).await?,
        Commands::Restore { id } => run_restore(&id, &context).await?,
        Commands::List {
            limit,
            kind,
            include_deleted,
            json,
        } => run_list(limit, kind.map(Into::into), include_deleted, json, &context).await?,
        Commands::Show { id, json } => run_show(&id, json, &context).await?,
        Commands::Sync { json } => run_sync(json, &context).await?,
        Commands::Watch { interval } => run_watch(interval, &context).await?,
        Commands::Status { json } => run_status(json, &context).await?,
        Commands::Conflicts { limit, json } => run_conflicts(limit, json, &context).await?,
        Commands::Key { command } => match command {
            KeyCommands::Init => run_key_init(&context).await?,
            KeyCommands::Status => run_key_status(&context).await?,
            KeyCommands::Rotate => run_key_rotate(&context).await?,
        },
        Commands::Completions { .. } => {}
    }

    Ok(())
}

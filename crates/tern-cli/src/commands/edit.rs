use tern_core::Mutation;

use crate::commands::common::{
    capture_editor_input_with_initial, normalize_record_identifier, open_engine,
    parse_editor_buffer, parse_record_ids, render_editor_buffer, resolve_record, Context,
    EngineMode,
};
use crate::error::CliError;

/// Field changes requested on the command line
#[derive(Debug, Default)]
pub struct EditArgs {
    pub title: Option<String>,
    pub body: Option<String>,
    pub parent: Option<String>,
    pub no_parent: bool,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
}

impl EditArgs {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.body.is_none()
            && self.parent.is_none()
            && !self.no_parent
            && self.add_labels.is_empty()
            && self.remove_labels.is_empty()
    }

    pub fn into_mutations(self) -> Result<Vec<Mutation>, CliError> {
        let mut mutations = Vec::new();
        if let Some(title) = self.title {
            mutations.push(Mutation::SetTitle(title));
        }
        if let Some(body) = self.body {
            mutations.push(Mutation::SetBody(body));
        }
        if let Some(parent) = self.parent {
            mutations.push(Mutation::SetParent(parse_record_ids(&[parent])?.pop()));
        } else if self.no_parent {
            mutations.push(Mutation::SetParent(None));
        }
        mutations.extend(
            parse_record_ids(&self.add_labels)?
                .into_iter()
                .map(Mutation::AddLabel),
        );
        mutations.extend(
            parse_record_ids(&self.remove_labels)?
                .into_iter()
                .map(Mutation::RemoveLabel),
        );
        Ok(mutations)
    }
}

pub async fn run_edit(id: &str, args: EditArgs, context: &Context) -> Result<(), CliError> {
    let normalized_id = normalize_record_identifier(id)?;
    let opened = open_engine(context, EngineMode::Local).await?;
    let record = resolve_record(&normalized_id, &opened.engine).await?;

    let mutations = if args.is_empty() {
        let content = record.content()?;
        let initial = render_editor_buffer(&content.title, &content.body);
        let Some(edited) = capture_editor_input_with_initial(&initial)? else {
            return Err(CliError::EmptyEditedContent);
        };
        let Some((title, body)) = parse_editor_buffer(&edited) else {
            return Err(CliError::EmptyEditedContent);
        };

        let mut mutations = Vec::new();
        if title != content.title {
            mutations.push(Mutation::SetTitle(title));
        }
        if body != content.body {
            mutations.push(Mutation::SetBody(body));
        }
        mutations
    } else {
        args.into_mutations()?
    };

    if mutations.is_empty() {
        println!("{}", record.id);
        return Ok(());
    }

    let updated = opened.engine.edit(&record.id, mutations).await?;
    println!("{}", updated.id);
    Ok(())
}

//! The four symbol-level edit tools.
//!
//! Each tool parses its arguments, runs the edit through the
//! [`EditExecutor`](crate::EditExecutor), then hands the result to the lineage
//! recorder. Recording never changes the tool's result.

use serde::Deserialize;
use serde_json::{Value, json};
use tether_types::{EditKind, SymbolLocator, TaskId};

use crate::error::EditError;
use crate::executor::EditRecord;
use crate::{ToolCtx, ToolExecutor, ToolFut, parse_args};

#[derive(Debug, Deserialize)]
struct BodyEditArgs {
    #[serde(alias = "namePath")]
    name_path: String,
    #[serde(alias = "relativePath")]
    relative_path: String,
    body: String,
    #[serde(default, alias = "taskId")]
    task_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RenameArgs {
    #[serde(alias = "namePath")]
    name_path: String,
    #[serde(alias = "relativePath")]
    relative_path: String,
    #[serde(alias = "newName")]
    new_name: String,
    #[serde(default, alias = "taskId")]
    task_id: Option<String>,
}

/// A blank task id is the same as none.
fn task_id(raw: Option<String>) -> Result<Option<TaskId>, EditError> {
    raw.filter(|t| !t.trim().is_empty())
        .map(TaskId::new)
        .transpose()
        .map_err(|e| EditError::bad_args(e.to_string()))
}

async fn finish(ctx: &ToolCtx, record: EditRecord, task: Option<TaskId>) -> Value {
    let outcome = ctx.recorder.record(record.change_set(task)).await;
    tracing::debug!(tool = record.kind.tool_name(), ?outcome, "Lineage outcome");
    record.to_json()
}

fn locator_properties() -> Value {
    json!({
        "name_path": {
            "type": "string",
            "description": "Symbol name path, e.g. `MyStruct/method` or `/top_level_fn`. A leading `/` anchors at the file's top level. Append `[n]` to pick the n-th of several matches."
        },
        "relative_path": {
            "type": "string",
            "description": "File containing the symbol, relative to the project root."
        },
        "task_id": {
            "type": "string",
            "description": "Task this change belongs to. Defaults to the active task, if any."
        }
    })
}

fn body_schema(body_description: &str) -> Value {
    let mut properties = locator_properties();
    properties["body"] = json!({ "type": "string", "description": body_description });
    json!({
        "type": "object",
        "properties": properties,
        "required": ["name_path", "relative_path", "body"]
    })
}

fn run_body_edit<'a>(kind: EditKind, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
    Box::pin(async move {
        let typed: BodyEditArgs = parse_args(&args)?;
        let task = task_id(typed.task_id)?;
        let locator = SymbolLocator::parse(&typed.relative_path, &typed.name_path)?;
        let record = match kind {
            EditKind::ReplaceBody => ctx.executor.replace_body(&locator, &typed.body).await?,
            EditKind::InsertBefore => ctx.executor.insert_before(&locator, &typed.body).await?,
            EditKind::InsertAfter => ctx.executor.insert_after(&locator, &typed.body).await?,
            EditKind::Rename => {
                return Err(EditError::bad_args("rename takes new_name, not body"));
            }
        };
        Ok(finish(ctx, record, task).await)
    })
}

#[derive(Debug, Default)]
pub struct ReplaceSymbolBodyTool;

#[derive(Debug, Default)]
pub struct InsertBeforeSymbolTool;

#[derive(Debug, Default)]
pub struct InsertAfterSymbolTool;

#[derive(Debug, Default)]
pub struct RenameSymbolTool;

impl ToolExecutor for ReplaceSymbolBodyTool {
    fn name(&self) -> &'static str {
        EditKind::ReplaceBody.tool_name()
    }

    fn description(&self) -> &'static str {
        "Replace the full definition of a symbol (signature and body) with new source"
    }

    fn schema(&self) -> Value {
        body_schema("New source for the whole symbol, including its signature.")
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
        run_body_edit(EditKind::ReplaceBody, args, ctx)
    }
}

impl ToolExecutor for InsertBeforeSymbolTool {
    fn name(&self) -> &'static str {
        EditKind::InsertBefore.tool_name()
    }

    fn description(&self) -> &'static str {
        "Insert source on new lines directly before a symbol's definition"
    }

    fn schema(&self) -> Value {
        body_schema("Source to insert. A trailing newline is added if missing.")
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
        run_body_edit(EditKind::InsertBefore, args, ctx)
    }
}

impl ToolExecutor for InsertAfterSymbolTool {
    fn name(&self) -> &'static str {
        EditKind::InsertAfter.tool_name()
    }

    fn description(&self) -> &'static str {
        "Insert source on new lines directly after the end of a symbol's definition"
    }

    fn schema(&self) -> Value {
        body_schema("Source to insert. A trailing newline is added if missing.")
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
        run_body_edit(EditKind::InsertAfter, args, ctx)
    }
}

impl ToolExecutor for RenameSymbolTool {
    fn name(&self) -> &'static str {
        EditKind::Rename.tool_name()
    }

    fn description(&self) -> &'static str {
        "Rename a symbol and all of its references across the project"
    }

    fn schema(&self) -> Value {
        let mut properties = locator_properties();
        properties["new_name"] = json!({
            "type": "string",
            "description": "The new identifier."
        });
        json!({
            "type": "object",
            "properties": properties,
            "required": ["name_path", "relative_path", "new_name"]
        })
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let typed: RenameArgs = parse_args(&args)?;
            let task = task_id(typed.task_id)?;
            let locator = SymbolLocator::parse(&typed.relative_path, &typed.name_path)?;
            let record = ctx.executor.rename(&locator, &typed.new_name).await?;
            Ok(finish(ctx, record, task).await)
        })
    }
}

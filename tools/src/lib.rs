//! Symbol-level edit tools over language-server sessions.
//!
//! [`EditExecutor`] turns a [`SymbolLocator`](tether_types::SymbolLocator)
//! into a file edit: resolve through the symbol cache or backend, check the
//! file has not changed since it was read, write atomically, and report an
//! [`EditRecord`] with before/after content hashes. The tools in
//! [`symbolic`] expose the four edits by name with JSON arguments and pass
//! each record to the lineage recorder.

mod error;
mod executor;
mod fs;
pub mod symbolic;
pub mod text;

pub use error::EditError;
pub use executor::{EditExecutor, EditRecord, FileEdit};

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use serde_json::Value;
use tether_lineage::LineageRecorder;

/// Tool execution future type alias.
pub type ToolFut<'a> = Pin<Box<dyn Future<Output = Result<Value, EditError>> + Send + 'a>>;

/// Shared state every tool call runs against.
#[derive(Clone)]
pub struct ToolCtx {
    pub executor: EditExecutor,
    pub recorder: LineageRecorder,
}

/// A named operation callable with JSON arguments.
pub trait ToolExecutor: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn schema(&self) -> Value;
    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a>;
}

pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T, EditError> {
    serde_json::from_value(args.clone()).map_err(|e| EditError::BadArgs {
        message: e.to_string(),
    })
}

/// Name, description, and argument schema of one tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },
    #[error("Duplicate tool registered: {name}")]
    DuplicateTool { name: String },
}

#[derive(Default)]
pub struct ToolRegistry {
    executors: HashMap<String, Box<dyn ToolExecutor>>,
}

impl ToolRegistry {
    /// Registry holding the four symbol edit tools.
    #[must_use]
    pub fn with_symbol_tools() -> Self {
        let mut executors: HashMap<String, Box<dyn ToolExecutor>> = HashMap::new();
        let tools: [Box<dyn ToolExecutor>; 4] = [
            Box::new(symbolic::ReplaceSymbolBodyTool),
            Box::new(symbolic::InsertBeforeSymbolTool),
            Box::new(symbolic::InsertAfterSymbolTool),
            Box::new(symbolic::RenameSymbolTool),
        ];
        for tool in tools {
            executors.insert(tool.name().to_string(), tool);
        }
        Self { executors }
    }

    pub fn register(&mut self, executor: Box<dyn ToolExecutor>) -> Result<(), RegistryError> {
        let name = executor.name().to_string();
        if self.executors.contains_key(&name) {
            return Err(RegistryError::DuplicateTool { name });
        }
        self.executors.insert(name, executor);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<&dyn ToolExecutor, RegistryError> {
        self.executors
            .get(name)
            .map(AsRef::as_ref)
            .ok_or_else(|| RegistryError::UnknownTool {
                name: name.to_string(),
            })
    }

    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .executors
            .values()
            .map(|exec| ToolDefinition {
                name: exec.name().to_string(),
                description: exec.description().to_string(),
                parameters: exec.schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

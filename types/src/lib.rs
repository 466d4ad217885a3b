//! Core domain types for Tether.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Symbol addressing, content hashes, and the identifiers shared by the session
//! layer, the edit pipeline, and the lineage recorder all live here.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod hash;
mod ids;
mod locator;

pub use hash::{ContentHash, ParseHashError};
pub use ids::{EmptyIdError, LanguageId, TaskId};
pub use locator::{LocatorError, NamePath, SymbolLocator};

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Edit & Change Kinds
// ============================================================================

/// The kind of change written to the lineage store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Modify,
    Rename,
    Delete,
}

impl ChangeKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Rename => "rename",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A symbolic edit operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    ReplaceBody,
    InsertBefore,
    InsertAfter,
    Rename,
}

impl EditKind {
    /// Name of the tool that performs this edit.
    #[must_use]
    pub const fn tool_name(self) -> &'static str {
        match self {
            Self::ReplaceBody => "replace_symbol_body",
            Self::InsertBefore => "insert_before_symbol",
            Self::InsertAfter => "insert_after_symbol",
            Self::Rename => "rename_symbol",
        }
    }

    /// Lineage classification. Insertions add new code next to an anchor symbol.
    #[must_use]
    pub const fn change_kind(self) -> ChangeKind {
        match self {
            Self::ReplaceBody => ChangeKind::Modify,
            Self::InsertBefore | Self::InsertAfter => ChangeKind::Create,
            Self::Rename => ChangeKind::Rename,
        }
    }
}

impl fmt::Display for EditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tool_name())
    }
}

//! Capability set negotiated during the `initialize` handshake.
//!
//! Backends differ in what they support; operations check the set before
//! issuing a request instead of discovering the gap through a server error.

use std::fmt;

use serde_json::Value;

/// An operation that a backend may or may not support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    DocumentSymbol,
    Rename,
    PrepareRename,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DocumentSymbol => "textDocument/documentSymbol",
            Self::Rename => "textDocument/rename",
            Self::PrepareRename => "textDocument/prepareRename",
        })
    }
}

/// How the backend wants document contents synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextSync {
    /// Server does not track open documents.
    None,
    #[default]
    Full,
    Incremental,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    document_symbol: bool,
    rename: bool,
    prepare_rename: bool,
    text_sync: TextSync,
}

impl Capabilities {
    /// Parse the `capabilities` object of an `initialize` result.
    ///
    /// Unknown shapes are treated as "not supported".
    #[must_use]
    pub fn from_server(capabilities: &Value) -> Self {
        let provider = |key: &str| match capabilities.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Object(_)) => true,
            _ => false,
        };

        let prepare_rename = capabilities
            .get("renameProvider")
            .and_then(|r| r.get("prepareProvider"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let sync_kind = match capabilities.get("textDocumentSync") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(obj @ Value::Object(_)) => obj
                .get("change")
                .and_then(Value::as_u64)
                .or(Some(if obj.get("openClose").and_then(Value::as_bool) == Some(true) {
                    1
                } else {
                    0
                })),
            _ => None,
        };
        let text_sync = match sync_kind {
            Some(0) => TextSync::None,
            Some(2) => TextSync::Incremental,
            _ => TextSync::Full,
        };

        Self {
            document_symbol: provider("documentSymbolProvider"),
            rename: provider("renameProvider"),
            prepare_rename,
            text_sync,
        }
    }

    #[must_use]
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::DocumentSymbol => self.document_symbol,
            Capability::Rename => self.rename,
            Capability::PrepareRename => self.prepare_rename,
        }
    }

    #[must_use]
    pub fn text_sync(&self) -> TextSync {
        self.text_sync
    }
}

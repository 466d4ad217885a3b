//! JSON-RPC message shapes and LSP request parameters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::LspError;

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Extract the `result` of a response frame, mapping JSON-RPC errors.
pub(crate) fn response_result(
    method: &str,
    mut body: serde_json::Value,
) -> Result<serde_json::Value, LspError> {
    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        return Err(LspError::Protocol {
            method: method.to_string(),
            code: error.get("code").and_then(serde_json::Value::as_i64),
            message: error
                .get("message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    match body.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(LspError::protocol(method, "response has neither result nor error")),
    }
}

pub(crate) fn initialize_params(root_uri: &str) -> serde_json::Value {
    serde_json::json!({
        "processId": std::process::id(),
        "clientInfo": { "name": "tether", "version": env!("CARGO_PKG_VERSION") },
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                },
                "documentSymbol": {
                    "dynamicRegistration": false,
                    "hierarchicalDocumentSymbolSupport": true
                },
                "rename": {
                    "dynamicRegistration": false,
                    "prepareSupport": true
                },
                "publishDiagnostics": {
                    "relatedInformation": false
                }
            },
            "workspace": {
                "workspaceEdit": { "documentChanges": true },
                "configuration": true,
                "workspaceFolders": true
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": "workspace"
        }]
    })
}

pub(crate) fn did_open_params(
    uri: &str,
    language_id: &str,
    version: i32,
    text: &str,
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "version": version
        },
        "contentChanges": [{
            "text": text
        }]
    })
}

pub(crate) fn document_symbol_params(uri: &str) -> serde_json::Value {
    serde_json::json!({ "textDocument": { "uri": uri } })
}

pub(crate) fn rename_params(uri: &str, position: Position, new_name: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri },
        "position": position,
        "newName": new_name
    })
}

pub(crate) fn cancel_params(id: u64) -> serde_json::Value {
    serde_json::json!({ "id": id })
}

/// Zero-based line and UTF-16 column, as LSP defines positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TextEdit {
    pub range: Range,
    #[serde(rename = "newText")]
    pub new_text: String,
}

/// Edits grouped per file, as returned by `textDocument/rename`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceEdit {
    pub files: Vec<(PathBuf, Vec<TextEdit>)>,
}

#[derive(Debug, Deserialize)]
struct RawWorkspaceEdit {
    #[serde(default)]
    changes: Option<HashMap<String, Vec<TextEdit>>>,
    #[serde(rename = "documentChanges", default)]
    document_changes: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct RawTextDocumentEdit {
    #[serde(rename = "textDocument")]
    text_document: RawDocumentId,
    edits: Vec<TextEdit>,
}

#[derive(Debug, Deserialize)]
struct RawDocumentId {
    uri: String,
}

impl WorkspaceEdit {
    /// Parse a `WorkspaceEdit` result.
    ///
    /// `documentChanges` wins over `changes` when both are present. Resource
    /// operations (create/rename/delete file) are rejected because symbol
    /// renames never need them.
    pub fn from_value(method: &str, value: serde_json::Value) -> Result<Self, LspError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        let raw: RawWorkspaceEdit = serde_json::from_value(value)
            .map_err(|e| LspError::protocol(method, format!("invalid WorkspaceEdit: {e}")))?;

        let mut grouped: Vec<(PathBuf, Vec<TextEdit>)> = Vec::new();
        let mut push = |uri: &str, edits: Vec<TextEdit>| -> Result<(), LspError> {
            let path = file_uri_to_path(uri)
                .ok_or_else(|| LspError::protocol(method, format!("not a file URI: {uri}")))?;
            match grouped.iter_mut().find(|(p, _)| *p == path) {
                Some((_, existing)) => existing.extend(edits),
                None => grouped.push((path, edits)),
            }
            Ok(())
        };

        if let Some(document_changes) = raw.document_changes {
            for change in document_changes {
                if change.get("kind").is_some() {
                    return Err(LspError::protocol(
                        method,
                        "resource operations in WorkspaceEdit are not supported",
                    ));
                }
                let edit: RawTextDocumentEdit = serde_json::from_value(change).map_err(|e| {
                    LspError::protocol(method, format!("invalid TextDocumentEdit: {e}"))
                })?;
                push(&edit.text_document.uri, edit.edits)?;
            }
        } else if let Some(changes) = raw.changes {
            let mut entries: Vec<_> = changes.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (uri, edits) in entries {
                push(&uri, edits)?;
            }
        }

        Ok(Self { files: grouped })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.iter().all(|(_, edits)| edits.is_empty())
    }
}

pub fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

#[must_use]
pub fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(windows))]
    const URI_A: &str = "file:///ws/src/a.rs";
    #[cfg(windows)]
    const URI_A: &str = "file:///C:/ws/src/a.rs";
    #[cfg(not(windows))]
    const URI_B: &str = "file:///ws/src/b.rs";
    #[cfg(windows)]
    const URI_B: &str = "file:///C:/ws/src/b.rs";

    fn edit(line: u32, from: u32, to: u32, text: &str) -> serde_json::Value {
        serde_json::json!({
            "range": {
                "start": { "line": line, "character": from },
                "end": { "line": line, "character": to }
            },
            "newText": text
        })
    }

    #[test]
    fn initialize_params_request_hierarchical_symbols() {
        let params = initialize_params("file:///workspace");
        assert!(params["processId"].is_number());
        assert_eq!(params["rootUri"], "file:///workspace");
        assert_eq!(
            params["capabilities"]["textDocument"]["documentSymbol"]
                ["hierarchicalDocumentSymbolSupport"],
            true
        );
    }

    #[test]
    fn request_omits_missing_params() {
        let json = serde_json::to_value(Request::new(1, "shutdown", None)).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 1);
        assert!(json.get("params").is_none(), "params must be omitted, not null");
    }

    #[test]
    fn notification_has_no_id() {
        let json =
            serde_json::to_value(Notification::new("initialized", Some(serde_json::json!({}))))
                .unwrap();
        assert!(json.get("id").is_none());
        assert_eq!(json["method"], "initialized");
    }

    #[test]
    fn response_result_maps_error_object() {
        let body = serde_json::json!({
            "jsonrpc": "2.0", "id": 3,
            "error": { "code": -32601, "message": "Method not found" }
        });
        match response_result("textDocument/rename", body) {
            Err(LspError::Protocol { code, message, .. }) => {
                assert_eq!(code, Some(-32601));
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn response_result_accepts_null_result() {
        let body = serde_json::json!({ "jsonrpc": "2.0", "id": 3, "result": null });
        assert!(response_result("shutdown", body).unwrap().is_null());
    }

    #[test]
    fn rename_params_shape() {
        let params = rename_params(
            "file:///a.rs",
            Position {
                line: 2,
                character: 4,
            },
            "renamed",
        );
        assert_eq!(params["position"]["line"], 2);
        assert_eq!(params["position"]["character"], 4);
        assert_eq!(params["newName"], "renamed");
    }

    #[test]
    fn workspace_edit_from_changes_map() {
        let value = serde_json::json!({
            "changes": {
                URI_B: [edit(0, 0, 3, "new")],
                URI_A: [edit(1, 4, 7, "new"), edit(5, 0, 3, "new")]
            }
        });
        let parsed = WorkspaceEdit::from_value("textDocument/rename", value).unwrap();
        assert_eq!(parsed.files.len(), 2);
        assert!(parsed.files[0].0.ends_with("a.rs"));
        assert_eq!(parsed.files[0].1.len(), 2);
    }

    #[test]
    fn workspace_edit_prefers_document_changes() {
        let value = serde_json::json!({
            "changes": { URI_B: [edit(0, 0, 1, "x")] },
            "documentChanges": [{
                "textDocument": { "uri": URI_A, "version": 1 },
                "edits": [edit(0, 0, 1, "y")]
            }]
        });
        let parsed = WorkspaceEdit::from_value("textDocument/rename", value).unwrap();
        assert_eq!(parsed.files.len(), 1);
        assert!(parsed.files[0].0.ends_with("a.rs"));
    }

    #[test]
    fn workspace_edit_rejects_resource_operations() {
        let value = serde_json::json!({
            "documentChanges": [{ "kind": "rename", "oldUri": URI_A, "newUri": URI_B }]
        });
        assert!(WorkspaceEdit::from_value("textDocument/rename", value).is_err());
    }

    #[test]
    fn null_workspace_edit_is_empty() {
        let parsed = WorkspaceEdit::from_value("textDocument/rename", serde_json::Value::Null)
            .unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn file_uri_round_trip() {
        #[cfg(windows)]
        let path = PathBuf::from(r"C:\Users\test\src\main.rs");
        #[cfg(not(windows))]
        let path = PathBuf::from("/home/test/src/main.rs");

        let uri = path_to_file_uri(&path).unwrap();
        assert_eq!(file_uri_to_path(uri.as_str()).unwrap(), path);
        assert!(file_uri_to_path("https://example.com/a.rs").is_none());
    }
}

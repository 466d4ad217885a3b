//! Symbol trees built from `textDocument/documentSymbol` results.
//!
//! Backends answer either with hierarchical `DocumentSymbol[]` or with flat
//! `SymbolInformation[]`. Flat answers are nested by range containment so
//! name paths resolve the same way for both.

use serde::Deserialize;
use tether_types::{NamePath, SymbolLocator};

use crate::error::LspError;
use crate::protocol::Range;

/// One symbol with its children, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolNode {
    pub name: String,
    /// LSP `SymbolKind` number.
    pub kind: u32,
    /// Full extent, including body and doc comments the server attaches.
    pub range: Range,
    /// The identifier itself.
    pub selection_range: Range,
    pub children: Vec<SymbolNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTree {
    roots: Vec<SymbolNode>,
}

/// A symbol picked out of a tree by a locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    /// Ancestry, outermost first, ending with the symbol itself.
    pub path: Vec<String>,
    pub kind: u32,
    pub range: Range,
    pub selection_range: Range,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no symbol matches {name_path}")]
    NotFound { name_path: String },
    #[error("{name_path} matches {} symbols ({}); add an index like [0]", candidates.len(), candidates.join(", "))]
    Ambiguous {
        name_path: String,
        candidates: Vec<String>,
    },
    #[error("{name_path} has {count} matches, index {index} is out of range")]
    IndexOutOfRange {
        name_path: String,
        index: usize,
        count: usize,
    },
}

#[derive(Debug, Deserialize)]
struct RawDocumentSymbol {
    name: String,
    kind: u32,
    range: Range,
    #[serde(rename = "selectionRange")]
    selection_range: Range,
    #[serde(default)]
    children: Vec<RawDocumentSymbol>,
}

#[derive(Debug, Deserialize)]
struct RawSymbolInformation {
    name: String,
    kind: u32,
    location: RawLocation,
}

#[derive(Debug, Deserialize)]
struct RawLocation {
    range: Range,
}

impl From<RawDocumentSymbol> for SymbolNode {
    fn from(raw: RawDocumentSymbol) -> Self {
        Self {
            name: raw.name,
            kind: raw.kind,
            range: raw.range,
            selection_range: raw.selection_range,
            children: raw.children.into_iter().map(Self::from).collect(),
        }
    }
}

fn contains(outer: &Range, inner: &Range) -> bool {
    outer.start <= inner.start && inner.end <= outer.end && outer != inner
}

fn nest(siblings: &mut Vec<SymbolNode>, node: SymbolNode) {
    if let Some(parent) = siblings
        .iter_mut()
        .rev()
        .find(|s| contains(&s.range, &node.range))
    {
        nest(&mut parent.children, node);
    } else {
        siblings.push(node);
    }
}

impl SymbolTree {
    #[must_use]
    pub fn new(roots: Vec<SymbolNode>) -> Self {
        Self { roots }
    }

    /// Parse a `documentSymbol` result. `null` means "no symbols".
    pub fn from_response(method: &str, value: serde_json::Value) -> Result<Self, LspError> {
        let items = match value {
            serde_json::Value::Null => return Ok(Self::default()),
            serde_json::Value::Array(items) => items,
            other => {
                return Err(LspError::protocol(
                    method,
                    format!("expected symbol array, got {other}"),
                ));
            }
        };
        let Some(first) = items.first() else {
            return Ok(Self::default());
        };

        let invalid = |e: serde_json::Error| LspError::protocol(method, format!("invalid symbol: {e}"));

        if first.get("location").is_some() {
            let mut flat: Vec<SymbolNode> = items
                .into_iter()
                .map(|item| {
                    serde_json::from_value::<RawSymbolInformation>(item).map(|raw| SymbolNode {
                        name: raw.name,
                        kind: raw.kind,
                        range: raw.location.range,
                        selection_range: raw.location.range,
                        children: Vec::new(),
                    })
                })
                .collect::<Result<_, _>>()
                .map_err(invalid)?;
            // Outer symbols first so containment nesting sees parents before children.
            flat.sort_by(|a, b| {
                a.range
                    .start
                    .cmp(&b.range.start)
                    .then_with(|| b.range.end.cmp(&a.range.end))
            });
            let mut roots = Vec::new();
            for node in flat {
                nest(&mut roots, node);
            }
            return Ok(Self { roots });
        }

        let roots = items
            .into_iter()
            .map(|item| serde_json::from_value::<RawDocumentSymbol>(item).map(SymbolNode::from))
            .collect::<Result<_, _>>()
            .map_err(invalid)?;
        Ok(Self { roots })
    }

    #[must_use]
    pub fn roots(&self) -> &[SymbolNode] {
        &self.roots
    }

    /// Total number of symbols at every depth.
    #[must_use]
    pub fn len(&self) -> usize {
        fn count(nodes: &[SymbolNode]) -> usize {
            nodes.iter().map(|n| 1 + count(&n.children)).sum()
        }
        count(&self.roots)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// All symbols addressed by `name_path`, in document order.
    #[must_use]
    pub fn find(&self, name_path: &NamePath) -> Vec<ResolvedSymbol> {
        fn walk(
            nodes: &[SymbolNode],
            ancestry: &mut Vec<String>,
            name_path: &NamePath,
            out: &mut Vec<ResolvedSymbol>,
        ) {
            for node in nodes {
                ancestry.push(node.name.clone());
                if name_path.matches(ancestry) {
                    out.push(ResolvedSymbol {
                        path: ancestry.clone(),
                        kind: node.kind,
                        range: node.range,
                        selection_range: node.selection_range,
                    });
                }
                walk(&node.children, ancestry, name_path, out);
                ancestry.pop();
            }
        }

        let mut out = Vec::new();
        walk(&self.roots, &mut Vec::new(), name_path, &mut out);
        out
    }

    /// Pick exactly one symbol for `locator`.
    pub fn resolve(&self, locator: &SymbolLocator) -> Result<ResolvedSymbol, ResolveError> {
        let name_path = locator.name_path();
        let mut matches = self.find(name_path);
        match (locator.index(), matches.len()) {
            (_, 0) => Err(ResolveError::NotFound {
                name_path: name_path.to_string(),
            }),
            (Some(index), count) if index >= count => Err(ResolveError::IndexOutOfRange {
                name_path: name_path.to_string(),
                index,
                count,
            }),
            (Some(index), _) => Ok(matches.swap_remove(index)),
            (None, 1) => Ok(matches.swap_remove(0)),
            (None, _) => Err(ResolveError::Ambiguous {
                name_path: name_path.to_string(),
                candidates: matches
                    .iter()
                    .map(|m| format!("{} (line {})", m.path.join("/"), m.range.start.line + 1))
                    .collect(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(sl: u32, sc: u32, el: u32, ec: u32) -> serde_json::Value {
        serde_json::json!({
            "start": { "line": sl, "character": sc },
            "end": { "line": el, "character": ec }
        })
    }

    fn hierarchical() -> SymbolTree {
        let value = serde_json::json!([
            {
                "name": "User", "kind": 5,
                "range": range(0, 0, 10, 1), "selectionRange": range(0, 7, 0, 11),
                "children": [
                    { "name": "new", "kind": 6, "range": range(1, 4, 3, 5), "selectionRange": range(1, 7, 1, 10) },
                    { "name": "login", "kind": 6, "range": range(4, 4, 9, 5), "selectionRange": range(4, 7, 4, 12) }
                ]
            },
            {
                "name": "Admin", "kind": 5,
                "range": range(12, 0, 16, 1), "selectionRange": range(12, 7, 12, 12),
                "children": [
                    { "name": "login", "kind": 6, "range": range(13, 4, 15, 5), "selectionRange": range(13, 7, 13, 12) }
                ]
            }
        ]);
        SymbolTree::from_response("textDocument/documentSymbol", value).unwrap()
    }

    fn locator(name_path: &str) -> SymbolLocator {
        SymbolLocator::parse("src/user.rs", name_path).unwrap()
    }

    #[test]
    fn parses_hierarchical_symbols() {
        let tree = hierarchical();
        assert_eq!(tree.roots().len(), 2);
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn resolves_nested_name_path() {
        let tree = hierarchical();
        let symbol = tree.resolve(&locator("User/login")).unwrap();
        assert_eq!(symbol.path, vec!["User", "login"]);
        assert_eq!(symbol.range.start.line, 4);
    }

    #[test]
    fn ambiguous_name_requires_index() {
        let tree = hierarchical();
        let err = tree.resolve(&locator("login")).unwrap_err();
        match err {
            ResolveError::Ambiguous { candidates, .. } => assert_eq!(candidates.len(), 2),
            other => panic!("expected ambiguity, got {other:?}"),
        }

        let second = tree.resolve(&locator("login[1]")).unwrap();
        assert_eq!(second.path, vec!["Admin", "login"]);
    }

    #[test]
    fn index_out_of_range() {
        let tree = hierarchical();
        assert!(matches!(
            tree.resolve(&locator("login[5]")),
            Err(ResolveError::IndexOutOfRange { count: 2, .. })
        ));
    }

    #[test]
    fn missing_symbol_not_found() {
        let tree = hierarchical();
        assert!(matches!(
            tree.resolve(&locator("User/logout")),
            Err(ResolveError::NotFound { .. })
        ));
    }

    #[test]
    fn absolute_path_skips_nested_match() {
        let tree = hierarchical();
        assert!(tree.resolve(&locator("/login")).is_err());
        assert!(tree.resolve(&locator("/Admin/login")).is_ok());
    }

    #[test]
    fn flat_symbol_information_is_nested_by_range() {
        let value = serde_json::json!([
            { "name": "login", "kind": 6, "location": { "uri": "file:///a.py", "range": range(4, 4, 9, 5) }, "containerName": "User" },
            { "name": "User", "kind": 5, "location": { "uri": "file:///a.py", "range": range(0, 0, 10, 1) } },
            { "name": "helper", "kind": 12, "location": { "uri": "file:///a.py", "range": range(12, 0, 14, 1) } }
        ]);
        let tree = SymbolTree::from_response("textDocument/documentSymbol", value).unwrap();
        assert_eq!(tree.roots().len(), 2);
        assert_eq!(tree.roots()[0].name, "User");
        assert_eq!(tree.roots()[0].children[0].name, "login");
        assert!(tree.resolve(&locator("User/login")).is_ok());
    }

    #[test]
    fn null_and_empty_results_are_empty_trees() {
        assert!(
            SymbolTree::from_response("m", serde_json::Value::Null)
                .unwrap()
                .is_empty()
        );
        assert!(
            SymbolTree::from_response("m", serde_json::json!([]))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn non_array_result_is_protocol_error() {
        assert!(matches!(
            SymbolTree::from_response("m", serde_json::json!({"oops": 1})),
            Err(LspError::Protocol { .. })
        ));
    }
}

//! In-process language server for tests.
//!
//! [`FakeBackend`] implements [`BackendSpawner`]; every spawn starts a task
//! that speaks real `Content-Length` framed JSON-RPC over a
//! [`tokio::io::duplex`] pipe, so sessions, the multiplexer, and the codec run
//! exactly as they do against an external process.
//!
//! The server understands a toy brace language close enough to Rust:
//! `fn`, `struct`, `enum`, `trait`, `impl` and `mod` items (optionally `pub`)
//! become document symbols, nested by braces. Rename replaces every
//! whole-word occurrence of the identifier in all open documents.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};
use tether_types::LanguageId;
use tokio::io::DuplexStream;
use tokio::sync::Notify;

use crate::codec::{FrameReader, FrameWriter};
use crate::error::LspError;
use crate::process::{BackendSpawner, SpawnFut, Transport};
use crate::types::LaunchSpec;

/// Requests with this method are never answered.
pub const STALL_METHOD: &str = "fake/stall";

const PIPE_CAPACITY: usize = 1 << 20;

#[derive(Debug, Clone, Copy)]
pub struct FakeOptions {
    /// Advertise and serve `textDocument/rename`.
    pub rename: bool,
    /// Advertise `documentSymbolProvider`.
    pub document_symbols: bool,
    /// Send `publishDiagnostics` after every open or change.
    pub diagnostics: bool,
    /// Hold `documentSymbol` and `rename` answers this long.
    pub response_delay: Duration,
}

impl Default for FakeOptions {
    fn default() -> Self {
        Self {
            rename: true,
            document_symbols: true,
            diagnostics: false,
            response_delay: Duration::ZERO,
        }
    }
}

struct FakeState {
    options: FakeOptions,
    spawns: AtomicUsize,
    failing_spawns: AtomicUsize,
    received: Mutex<Vec<String>>,
    kill_switch: Mutex<Option<Arc<Notify>>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Spawner for in-process fake language servers. Clones share counters.
#[derive(Clone)]
pub struct FakeBackend {
    state: Arc<FakeState>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(FakeOptions::default())
    }

    #[must_use]
    pub fn with_options(options: FakeOptions) -> Self {
        Self {
            state: Arc::new(FakeState {
                options,
                spawns: AtomicUsize::new(0),
                failing_spawns: AtomicUsize::new(0),
                received: Mutex::new(Vec::new()),
                kill_switch: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn spawner(&self) -> Arc<dyn BackendSpawner> {
        Arc::new(self.clone())
    }

    /// Launch attempts so far, failed ones included.
    #[must_use]
    pub fn spawn_count(&self) -> usize {
        self.state.spawns.load(Ordering::SeqCst)
    }

    /// Make the next `n` launches fail.
    pub fn fail_next_spawns(&self, n: usize) {
        self.state.failing_spawns.store(n, Ordering::SeqCst);
    }

    /// How many messages with `method` the servers have received.
    #[must_use]
    pub fn received(&self, method: &str) -> usize {
        locked(&self.state.received)
            .iter()
            .filter(|m| *m == method)
            .count()
    }

    #[must_use]
    pub fn document_symbol_requests(&self) -> usize {
        self.received("textDocument/documentSymbol")
    }

    /// Drop the live server's end of the pipe, as if the process died.
    ///
    /// Returns `false` when nothing is running.
    pub fn kill(&self) -> bool {
        match locked(&self.state.kill_switch).take() {
            Some(switch) => {
                switch.notify_one();
                true
            }
            None => false,
        }
    }
}

impl BackendSpawner for FakeBackend {
    fn spawn<'a>(&'a self, language: &'a LanguageId, _spec: &'a LaunchSpec) -> SpawnFut<'a> {
        Box::pin(async move {
            self.state.spawns.fetch_add(1, Ordering::SeqCst);
            let fail = self
                .state
                .failing_spawns
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(LspError::Launch {
                    language: language.clone(),
                    message: "fake launch failure".to_string(),
                });
            }

            let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
            let switch = Arc::new(Notify::new());
            *locked(&self.state.kill_switch) = Some(Arc::clone(&switch));
            tokio::spawn(serve(Arc::clone(&self.state), server, switch));

            let (reader, writer) = tokio::io::split(client);
            Ok(Transport {
                reader: Box::new(reader),
                writer: Box::new(writer),
                process: None,
            })
        })
    }
}

async fn serve(state: Arc<FakeState>, stream: DuplexStream, switch: Arc<Notify>) {
    let (read, write) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read);
    let mut writer = FrameWriter::new(write);
    let mut documents: HashMap<String, String> = HashMap::new();
    let options = state.options;

    loop {
        let frame = tokio::select! {
            () = switch.notified() => return,
            frame = reader.read_frame() => match frame {
                Ok(Some(frame)) => frame,
                _ => return,
            },
        };

        let method = frame
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if method.is_empty() {
            // Replies to requests we never send.
            continue;
        }
        locked(&state.received).push(method.clone());
        let id = frame.get("id").cloned();
        let params = frame.get("params").cloned().unwrap_or(Value::Null);
        let uri = params["textDocument"]["uri"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let reply = match method.as_str() {
            "initialize" => Ok(json!({
                "capabilities": {
                    "documentSymbolProvider": options.document_symbols,
                    "renameProvider": if options.rename { json!({ "prepareProvider": false }) } else { json!(false) },
                    "textDocumentSync": 1
                },
                "serverInfo": { "name": "fake-ls" }
            })),
            "textDocument/didOpen" | "textDocument/didChange" => {
                let text = if method == "textDocument/didOpen" {
                    params["textDocument"]["text"].as_str()
                } else {
                    params["contentChanges"]
                        .as_array()
                        .and_then(|c| c.last())
                        .and_then(|c| c["text"].as_str())
                };
                documents.insert(uri.clone(), text.unwrap_or_default().to_string());
                if options.diagnostics {
                    let note = json!({
                        "jsonrpc": "2.0",
                        "method": "textDocument/publishDiagnostics",
                        "params": { "uri": uri, "diagnostics": [] }
                    });
                    if writer.write_frame(&note).await.is_err() {
                        return;
                    }
                }
                continue;
            }
            "textDocument/documentSymbol" => Ok(documents
                .get(&uri)
                .map_or_else(|| json!([]), |text| symbols_json(text))),
            "textDocument/rename" if options.rename => {
                let new_name = params["newName"].as_str().unwrap_or_default();
                let line = params["position"]["line"].as_u64().unwrap_or(0);
                let character = params["position"]["character"].as_u64().unwrap_or(0);
                Ok(rename_edit(&documents, &uri, line, character, new_name))
            }
            "shutdown" => Ok(Value::Null),
            "exit" => return,
            STALL_METHOD => continue,
            _ if id.is_none() => continue,
            other => Err(json!({ "code": -32601, "message": format!("Method not found: {other}") })),
        };

        let Some(id) = id else { continue };
        let delayed = matches!(
            method.as_str(),
            "textDocument/documentSymbol" | "textDocument/rename"
        );
        if delayed && !options.response_delay.is_zero() {
            tokio::time::sleep(options.response_delay).await;
        }
        let response = match reply {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err(error) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
        };
        if writer.write_frame(&response).await.is_err() {
            return;
        }
    }
}

const KEYWORDS: &[(&str, u32)] = &[
    ("fn", 12),
    ("struct", 23),
    ("enum", 10),
    ("trait", 11),
    ("impl", 5),
    ("mod", 2),
];

struct FakeSymbol {
    name: String,
    kind: u32,
    range: [(usize, usize); 2],
    selection: [(usize, usize); 2],
    children: Vec<FakeSymbol>,
}

fn utf16_col(line: &str, byte: usize) -> usize {
    line[..byte].encode_utf16().count()
}

fn is_ident(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Item declared on `line`: (keyword kind, name byte start, name).
fn declaration(line: &str) -> Option<(u32, usize, String)> {
    let indent = line.len() - line.trim_start().len();
    let mut rest = &line[indent..];
    let mut offset = indent;
    if let Some(stripped) = rest.strip_prefix("pub ") {
        rest = stripped;
        offset += 4;
    }
    let (kind, keyword) = KEYWORDS.iter().find_map(|(kw, kind)| {
        rest.strip_prefix(kw)
            .filter(|after| after.starts_with(' '))
            .map(|_| (*kind, *kw))
    })?;
    let after = &rest[keyword.len()..];
    let name_offset = after.len() - after.trim_start().len();
    let name: String = after.trim_start().chars().take_while(|c| is_ident(*c)).collect();
    if name.is_empty() {
        return None;
    }
    Some((kind, offset + keyword.len() + name_offset, name))
}

fn parse_symbols(text: &str) -> Vec<FakeSymbol> {
    let lines: Vec<&str> = text.lines().collect();
    let mut flat = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        let Some((kind, name_at, name)) = declaration(line) else {
            continue;
        };
        let indent = line.len() - line.trim_start().len();
        let start = (i, utf16_col(line, indent));
        let selection = [
            (i, utf16_col(line, name_at)),
            (i, utf16_col(line, name_at + name.len())),
        ];

        let mut end = (i, utf16_col(line, line.len()));
        if line.contains('{') {
            let mut depth = 0i64;
            'scan: for (j, body_line) in lines.iter().enumerate().skip(i) {
                for (b, c) in body_line.char_indices() {
                    match c {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                end = (j, utf16_col(body_line, b + 1));
                                break 'scan;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        flat.push(FakeSymbol {
            name,
            kind,
            range: [start, end],
            selection,
            children: Vec::new(),
        });
    }

    let mut roots: Vec<FakeSymbol> = Vec::new();
    for symbol in flat {
        nest(&mut roots, symbol);
    }
    roots
}

fn nest(siblings: &mut Vec<FakeSymbol>, symbol: FakeSymbol) {
    let inside = |outer: &FakeSymbol| outer.range[0] <= symbol.range[0] && symbol.range[1] <= outer.range[1];
    if let Some(parent) = siblings.iter_mut().rev().find(|s| inside(s)) {
        nest(&mut parent.children, symbol);
    } else {
        siblings.push(symbol);
    }
}

fn range_json(range: [(usize, usize); 2]) -> Value {
    json!({
        "start": { "line": range[0].0, "character": range[0].1 },
        "end": { "line": range[1].0, "character": range[1].1 }
    })
}

fn symbol_json(symbol: &FakeSymbol) -> Value {
    json!({
        "name": symbol.name,
        "kind": symbol.kind,
        "range": range_json(symbol.range),
        "selectionRange": range_json(symbol.selection),
        "children": symbol.children.iter().map(symbol_json).collect::<Vec<_>>()
    })
}

fn symbols_json(text: &str) -> Value {
    Value::Array(parse_symbols(text).iter().map(symbol_json).collect())
}

/// Identifier covering UTF-16 column `character` on `line`.
fn identifier_at(text: &str, line: u64, character: u64) -> Option<String> {
    let line = text.lines().nth(usize::try_from(line).ok()?)?;
    let target = usize::try_from(character).ok()?;
    let mut col = 0;
    let mut byte = None;
    for (b, c) in line.char_indices() {
        if col >= target {
            byte = Some(b);
            break;
        }
        col += c.len_utf16();
    }
    let byte = byte?;
    let start = line[..byte]
        .char_indices()
        .rev()
        .take_while(|(_, c)| is_ident(*c))
        .last()
        .map_or(byte, |(b, _)| b);
    let word: String = line[start..].chars().take_while(|c| is_ident(*c)).collect();
    (!word.is_empty()).then_some(word)
}

fn rename_edit(
    documents: &HashMap<String, String>,
    uri: &str,
    line: u64,
    character: u64,
    new_name: &str,
) -> Value {
    let Some(old) = documents
        .get(uri)
        .and_then(|text| identifier_at(text, line, character))
    else {
        return Value::Null;
    };

    let mut changes = serde_json::Map::new();
    let mut uris: Vec<&String> = documents.keys().collect();
    uris.sort();
    for doc_uri in uris {
        let mut edits = Vec::new();
        for (i, text_line) in documents[doc_uri].lines().enumerate() {
            for (b, _) in text_line.match_indices(old.as_str()) {
                let before = text_line[..b].chars().next_back();
                let after = text_line[b + old.len()..].chars().next();
                if before.is_some_and(is_ident) || after.is_some_and(is_ident) {
                    continue;
                }
                edits.push(json!({
                    "range": range_json([
                        (i, utf16_col(text_line, b)),
                        (i, utf16_col(text_line, b + old.len())),
                    ]),
                    "newText": new_name
                }));
            }
        }
        if !edits.is_empty() {
            changes.insert(doc_uri.clone(), Value::Array(edits));
        }
    }
    json!({ "changes": changes })
}

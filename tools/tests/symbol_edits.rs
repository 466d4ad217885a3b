//! End-to-end symbolic edits against the in-process fake language server.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;
use tether_lineage::testing::{create_store, recorded_changes, set_active_task};
use tether_lineage::{LineageConfig, LineageRecorder, STORED_HASH_LEN};
use tether_lsp::testing::{FakeBackend, FakeOptions};
use tether_lsp::{LspConfig, SessionManager, SessionState};
use tether_tools::{EditError, EditExecutor, ToolCtx, ToolRegistry};
use tether_types::{ContentHash, LanguageId, SymbolLocator};

const LIB: &str = "\
pub struct Config {
    name: String,
}

impl Config {
    fn load() -> Self {
        todo!()
    }
}

fn helper() -> u32 {
    1
}
";

const MAIN: &str = "\
fn main() {
    let x = helper();
}
";

fn config() -> LspConfig {
    serde_json::from_value(json!({
        "request_timeout_ms": 5000,
        "health_check_interval_ms": 50,
        "restart": { "max_restarts": 3, "backoff_base_ms": 20, "backoff_max_ms": 80 },
        "servers": {
            "rust": { "command": "rust-analyzer", "language_id": "rust", "file_extensions": ["rs"] }
        }
    }))
    .unwrap()
}

struct Workspace {
    dir: TempDir,
    fake: FakeBackend,
    ctx: ToolCtx,
    registry: ToolRegistry,
}

impl Workspace {
    fn new() -> Self {
        Self::with_fake(FakeBackend::new())
    }

    fn with_fake(fake: FakeBackend) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), LIB).unwrap();
        let manager = Arc::new(SessionManager::with_spawner(
            config(),
            dir.path(),
            fake.spawner(),
        ));
        let ctx = ToolCtx {
            executor: EditExecutor::new(manager),
            recorder: LineageRecorder::new(LineageConfig::default(), dir.path()),
        };
        Self {
            dir,
            fake,
            ctx,
            registry: ToolRegistry::with_symbol_tools(),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root().join(rel)
    }

    fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.path(rel)).unwrap()
    }

    fn write(&self, rel: &str, text: &str) {
        std::fs::write(self.path(rel), text).unwrap();
    }

    fn manager(&self) -> &Arc<SessionManager> {
        self.ctx.executor.manager()
    }

    async fn call(&self, tool: &str, args: Value) -> Result<Value, EditError> {
        self.registry
            .lookup(tool)
            .unwrap()
            .execute(args, &self.ctx)
            .await
    }
}

fn rust() -> LanguageId {
    LanguageId::new("rust").unwrap()
}

fn hex(text: &str) -> String {
    ContentHash::of(text.as_bytes()).to_hex()
}

async fn until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn replace_symbol_body_reports_before_and_after_hashes() {
    let ws = Workspace::new();
    let payload = ws
        .call(
            "replace_symbol_body",
            json!({
                "name_path": "helper",
                "relative_path": "src/lib.rs",
                "body": "fn helper() -> u32 {\n    2\n}"
            }),
        )
        .await
        .unwrap();

    let after = ws.read("src/lib.rs");
    assert_eq!(after, LIB.replace("    1\n", "    2\n"));
    assert_eq!(payload["change_type"], "modify");
    assert_eq!(payload["symbol"], "src/lib.rs:helper");
    assert_eq!(payload["files"][0]["relative_path"], "src/lib.rs");
    assert_eq!(payload["files"][0]["old_hash"], hex(LIB));
    assert_eq!(payload["files"][0]["new_hash"], hex(&after));

    // The lease is released and the backend saw the new content.
    assert_eq!(ws.manager().session_state(&rust()), Some(SessionState::Ready));
    assert_eq!(ws.fake.received("textDocument/didChange"), 1);
}

#[tokio::test]
async fn nested_symbols_and_insertions() {
    let ws = Workspace::new();
    ws.call(
        "insert_before_symbol",
        json!({
            "namePath": "Config/load",
            "relativePath": "src/lib.rs",
            "body": "    fn default_name() -> String {\n        String::new()\n    }"
        }),
    )
    .await
    .unwrap();
    ws.call(
        "insert_after_symbol",
        json!({
            "namePath": "/helper",
            "relativePath": "src/lib.rs",
            "body": "\nfn extra() {}\n"
        }),
    )
    .await
    .unwrap();

    let text = ws.read("src/lib.rs");
    assert!(text.contains(
        "impl Config {\n    fn default_name() -> String {\n        String::new()\n    }\n    fn load() -> Self {"
    ));
    assert!(text.ends_with("fn helper() -> u32 {\n    1\n}\n\nfn extra() {}\n"));
}

#[tokio::test]
async fn unchanged_locator_resolves_from_cache() {
    let ws = Workspace::new();
    let locator = SymbolLocator::parse("src/lib.rs", "Config/load").unwrap();

    let first = ws.ctx.executor.locate(&locator).await.unwrap();
    let second = ws.ctx.executor.locate(&locator).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.path, vec!["Config".to_string(), "load".to_string()]);
    assert_eq!(ws.fake.document_symbol_requests(), 1);
    assert_eq!(ws.manager().cache().stats().hits, 1);

    // The edit resolves from the same entry, then drops it once written.
    ws.call(
        "replace_symbol_body",
        json!({ "name_path": "helper", "relative_path": "src/lib.rs", "body": "fn helper() -> u32 { 3 }" }),
    )
    .await
    .unwrap();
    assert_eq!(ws.fake.document_symbol_requests(), 1);
    ws.ctx.executor.locate(&locator).await.unwrap();
    assert_eq!(ws.fake.document_symbol_requests(), 2);
}

#[tokio::test]
async fn change_between_resolution_and_write_is_stale_read() {
    let ws = Workspace::with_fake(FakeBackend::with_options(FakeOptions {
        response_delay: Duration::from_millis(300),
        ..FakeOptions::default()
    }));
    let executor = ws.ctx.executor.clone();
    let edit = tokio::spawn(async move {
        let locator = SymbolLocator::parse("src/lib.rs", "helper").unwrap();
        executor.replace_body(&locator, "fn helper() -> u32 { 9 }").await
    });

    let fake = ws.fake.clone();
    until(move || fake.document_symbol_requests() == 1).await;
    let concurrent = LIB.replace("    1\n", "    42\n");
    ws.write("src/lib.rs", &concurrent);

    let err = edit.await.unwrap().unwrap_err();
    assert!(matches!(err, EditError::StaleRead { .. }), "{err:?}");
    assert_eq!(err.tag(), "StaleRead");
    assert_eq!(ws.read("src/lib.rs"), concurrent);
}

#[tokio::test]
async fn rename_checks_every_file_before_writing() {
    let ws = Workspace::with_fake(FakeBackend::with_options(FakeOptions {
        response_delay: Duration::from_millis(300),
        ..FakeOptions::default()
    }));
    ws.write("src/main.rs", MAIN);
    let main = SymbolLocator::parse("src/main.rs", "main").unwrap();
    ws.ctx.executor.locate(&main).await.unwrap();

    let executor = ws.ctx.executor.clone();
    let edit = tokio::spawn(async move {
        let locator = SymbolLocator::parse("src/lib.rs", "helper").unwrap();
        executor.rename(&locator, "assist").await
    });

    let fake = ws.fake.clone();
    until(move || fake.received("textDocument/rename") == 1).await;
    let concurrent = format!("{LIB}\nfn other() {{}}\n");
    ws.write("src/lib.rs", &concurrent);

    let err = edit.await.unwrap().unwrap_err();
    assert!(matches!(err, EditError::StaleRead { .. }), "{err:?}");
    // Neither file was touched.
    assert_eq!(ws.read("src/lib.rs"), concurrent);
    assert_eq!(ws.read("src/main.rs"), MAIN);
}

#[tokio::test]
async fn rename_rewrites_references_in_open_files() {
    let ws = Workspace::new();
    ws.write("src/main.rs", MAIN);
    ws.ctx
        .executor
        .locate(&SymbolLocator::parse("src/main.rs", "main").unwrap())
        .await
        .unwrap();

    let payload = ws
        .call(
            "rename_symbol",
            json!({ "name_path": "helper", "relative_path": "src/lib.rs", "new_name": "assist" }),
        )
        .await
        .unwrap();

    assert!(ws.read("src/lib.rs").contains("fn assist() -> u32"));
    assert_eq!(ws.read("src/main.rs"), MAIN.replace("helper", "assist"));
    let files = payload["files"].as_array().unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0]["relative_path"], "src/lib.rs");
    assert_eq!(files[1]["relative_path"], "src/main.rs");
    assert_eq!(files[1]["old_hash"], hex(MAIN));
    assert_eq!(payload["change_type"], "rename");
}

#[tokio::test]
async fn all_edits_succeed_without_a_store() {
    let ws = Workspace::new();
    let locate = json!({ "name_path": "helper", "relative_path": "src/lib.rs" });
    let with = |key: &str, value: &str| {
        let mut args = locate.clone();
        args[key] = json!(value);
        args
    };

    ws.call("replace_symbol_body", with("body", "fn helper() -> u32 {\n    5\n}"))
        .await
        .unwrap();
    ws.call("insert_before_symbol", with("body", "const BEFORE: u32 = 0;"))
        .await
        .unwrap();
    ws.call("insert_after_symbol", with("body", "const AFTER: u32 = 0;"))
        .await
        .unwrap();
    ws.call("rename_symbol", with("new_name", "assist"))
        .await
        .unwrap();

    let text = ws.read("src/lib.rs");
    assert!(text.contains("const BEFORE: u32 = 0;\nfn assist() -> u32 {\n    5\n}\nconst AFTER: u32 = 0;\n"));
    assert!(!ws.path(".spectrena").exists());
    assert!(!ws.ctx.recorder.store().is_open());
}

#[tokio::test]
async fn explicit_task_rename_is_recorded_once() {
    let ws = Workspace::new();
    let db = create_store(ws.root());

    ws.call(
        "rename_symbol",
        json!({
            "namePath": "helper",
            "relativePath": "src/lib.rs",
            "newName": "assist",
            "taskId": "CORE-001-T01"
        }),
    )
    .await
    .unwrap();

    let rows = recorded_changes(&db);
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.task_id, "CORE-001-T01");
    assert_eq!(row.change_type, "rename");
    assert_eq!(row.tool_used.as_deref(), Some("rename_symbol"));
    assert_eq!(row.file_path, "src/lib.rs");
    assert_eq!(row.symbol_fqn.as_deref(), Some("src/lib.rs:helper"));
    // The store keeps a fixed-width prefix of the full payload hash.
    let stored = |text: &str| ContentHash::of(text.as_bytes()).hex_prefix(STORED_HASH_LEN);
    assert_eq!(row.old_content_hash.as_deref(), Some(stored(LIB).as_str()));
    assert_eq!(
        row.new_content_hash.as_deref(),
        Some(stored(&ws.read("src/lib.rs")).as_str())
    );
}

#[tokio::test]
async fn implicit_task_comes_from_active_phase() {
    let ws = Workspace::new();
    let db = create_store(ws.root());
    set_active_task(&db, "T7", Some("Add config loader"), Some(("PLAN-1", "SPEC-1")));

    ws.call(
        "insert_after_symbol",
        json!({ "name_path": "Config/load", "relative_path": "src/lib.rs", "body": "    fn save(&self) {}" }),
    )
    .await
    .unwrap();

    let rows = recorded_changes(&db);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].task_id, "T7");
    assert_eq!(rows[0].change_type, "create");
    assert_eq!(rows[0].tool_used.as_deref(), Some("insert_after_symbol"));
    assert_eq!(rows[0].symbol_fqn.as_deref(), Some("src/lib.rs:Config.load"));
}

#[tokio::test]
async fn broken_store_never_fails_the_edit() {
    let ws = Workspace::new();
    std::fs::create_dir_all(ws.path(".spectrena")).unwrap();
    std::fs::write(ws.path(".spectrena/lineage.db"), b"definitely not sqlite").unwrap();

    ws.call(
        "replace_symbol_body",
        json!({ "name_path": "helper", "relative_path": "src/lib.rs", "body": "fn helper() -> u32 { 7 }", "task_id": "T1" }),
    )
    .await
    .unwrap();
    assert!(ws.read("src/lib.rs").contains("fn helper() -> u32 { 7 }"));
}

#[tokio::test]
async fn edit_succeeds_after_backend_recovers() {
    let ws = Workspace::new();
    let session = ws.manager().get_session(&rust()).await.unwrap();
    let mut states = session.subscribe();

    assert!(ws.fake.kill());
    states.wait_for(|s| !s.is_usable()).await.unwrap();
    session.wait_ready(Duration::from_secs(5)).await.unwrap();
    assert_eq!(session.restart_count(), 1);

    ws.call(
        "replace_symbol_body",
        json!({ "name_path": "helper", "relative_path": "src/lib.rs", "body": "fn helper() -> u32 { 11 }" }),
    )
    .await
    .unwrap();
    assert!(ws.read("src/lib.rs").contains("{ 11 }"));
    assert_eq!(ws.fake.spawn_count(), 2);
}

#[tokio::test]
async fn unresolvable_locators_are_symbol_not_found() {
    let ws = Workspace::new();
    let missing = ws
        .call(
            "replace_symbol_body",
            json!({ "name_path": "nowhere", "relative_path": "src/lib.rs", "body": "" }),
        )
        .await
        .unwrap_err();
    assert_eq!(missing.tag(), "SymbolNotFound");

    // `Config` names both the struct and its impl block.
    let ambiguous = ws
        .call(
            "insert_before_symbol",
            json!({ "name_path": "Config", "relative_path": "src/lib.rs", "body": "// x" }),
        )
        .await
        .unwrap_err();
    assert_eq!(ambiguous.tag(), "SymbolNotFound");
    assert!(ambiguous.to_string().contains("[0]"), "{ambiguous}");
    assert_eq!(ws.read("src/lib.rs"), LIB);

    // An index picks one of them.
    ws.call(
        "insert_before_symbol",
        json!({ "name_path": "Config[1]", "relative_path": "src/lib.rs", "body": "// impl follows" }),
    )
    .await
    .unwrap();
    assert!(ws.read("src/lib.rs").contains("// impl follows\nimpl Config {"));
}

#[tokio::test]
async fn argument_and_routing_failures() {
    let ws = Workspace::new();
    let err = ws
        .call("rename_symbol", json!({ "name_path": "helper", "relative_path": "src/lib.rs" }))
        .await
        .unwrap_err();
    assert_eq!(err.tag(), "BadArgs");

    let err = ws
        .call(
            "rename_symbol",
            json!({ "name_path": "helper", "relative_path": "../outside.rs", "new_name": "x" }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.tag(), "BadArgs");

    ws.write("notes.md", "# notes\n");
    let err = ws
        .call(
            "replace_symbol_body",
            json!({ "name_path": "notes", "relative_path": "notes.md", "body": "" }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.tag(), "BackendUnavailable");
    assert!(!err.is_retryable());
    assert_eq!(ws.fake.spawn_count(), 0);
}

//! Fixtures for tests that need a lineage store on disk.
//!
//! The schema mirrors the tables the recorder reads and writes in a real
//! store. Helpers panic on failure; they are only meant for tests.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, params};

pub const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS plans (
        plan_id TEXT PRIMARY KEY,
        spec_id TEXT
    );

    CREATE TABLE IF NOT EXISTS tasks (
        task_id TEXT PRIMARY KEY,
        title TEXT,
        plan_id TEXT
    );

    CREATE TABLE IF NOT EXISTS phase_state (
        id INTEGER PRIMARY KEY,
        current_task_id TEXT
    );

    CREATE TABLE IF NOT EXISTS code_changes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL,
        file_path TEXT NOT NULL,
        symbol_fqn TEXT,
        change_type TEXT NOT NULL
            CHECK (change_type IN ('create', 'modify', 'rename', 'delete')),
        tool_used TEXT,
        old_content_hash TEXT,
        new_content_hash TEXT,
        timestamp TEXT NOT NULL
    );
";

/// One row of `code_changes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChange {
    pub task_id: String,
    pub file_path: String,
    pub symbol_fqn: Option<String>,
    pub change_type: String,
    pub tool_used: Option<String>,
    pub old_content_hash: Option<String>,
    pub new_content_hash: Option<String>,
    pub timestamp: String,
}

/// Create `<root>/.spectrena/lineage.db` with the full schema.
pub fn create_store(root: &Path) -> PathBuf {
    let dir = root.join(".spectrena");
    std::fs::create_dir_all(&dir).expect("create marker dir");
    let db = dir.join("lineage.db");
    let conn = Connection::open(&db).expect("open fixture store");
    conn.execute_batch(SCHEMA).expect("create fixture schema");
    db
}

/// Point the phase state at `task_id`, creating the task (and its plan).
pub fn set_active_task(db: &Path, task_id: &str, title: Option<&str>, plan: Option<(&str, &str)>) {
    let conn = Connection::open(db).expect("open fixture store");
    if let Some((plan_id, spec_id)) = plan {
        conn.execute(
            "INSERT OR REPLACE INTO plans (plan_id, spec_id) VALUES (?1, ?2)",
            params![plan_id, spec_id],
        )
        .expect("insert plan");
    }
    conn.execute(
        "INSERT OR REPLACE INTO tasks (task_id, title, plan_id) VALUES (?1, ?2, ?3)",
        params![task_id, title, plan.map(|(plan_id, _)| plan_id)],
    )
    .expect("insert task");
    drop(conn);
    set_phase_task(db, Some(task_id));
}

/// Set (or clear) `phase_state.current_task_id` without touching `tasks`.
pub fn set_phase_task(db: &Path, task_id: Option<&str>) {
    let conn = Connection::open(db).expect("open fixture store");
    conn.execute(
        "INSERT OR REPLACE INTO phase_state (id, current_task_id) VALUES (1, ?1)",
        params![task_id],
    )
    .expect("set phase state");
}

/// Every recorded change, oldest first.
pub fn recorded_changes(db: &Path) -> Vec<StoredChange> {
    let conn = Connection::open(db).expect("open fixture store");
    let mut stmt = conn
        .prepare(
            "SELECT task_id, file_path, symbol_fqn, change_type, tool_used,
                    old_content_hash, new_content_hash, timestamp
             FROM code_changes ORDER BY id",
        )
        .expect("prepare change query");
    let changes = stmt
        .query_map([], |row| {
            Ok(StoredChange {
                task_id: row.get(0)?,
                file_path: row.get(1)?,
                symbol_fqn: row.get(2)?,
                change_type: row.get(3)?,
                tool_used: row.get(4)?,
                old_content_hash: row.get(5)?,
                new_content_hash: row.get(6)?,
                timestamp: row.get(7)?,
            })
        })
        .expect("query changes")
        .collect::<Result<_, _>>()
        .expect("read changes");
    changes
}

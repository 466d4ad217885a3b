//! Appending change records to the lineage store.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use rusqlite::params;
use tether_types::{ContentHash, EditKind, TaskId};

use crate::context::{TaskContext, TaskContextResolver, TaskSource, resolve_with};
use crate::error::RecordingFailure;
use crate::store::{LineageConfig, LineageStore, StoreAccess};

const INSERT_CHANGE: &str = r"
    INSERT INTO code_changes
        (task_id, file_path, symbol_fqn, change_type, tool_used,
         old_content_hash, new_content_hash, timestamp)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
";

/// Hex characters of each content hash kept in `code_changes`. Other writers
/// of the same table store this prefix, so rows compare across tools.
pub const STORED_HASH_LEN: usize = 16;

/// One file touched by an edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    /// Workspace-relative, `/`-separated.
    pub file_path: String,
    /// `relative/path:Name.Path`.
    pub symbol_fqn: String,
    pub old_hash: ContentHash,
    pub new_hash: ContentHash,
}

/// Everything one completed edit contributes to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub edit: EditKind,
    pub explicit_task: Option<TaskId>,
    pub files: Vec<FileChange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    NoChanges,
    NoStore,
    EmbeddedStore,
    NoTask,
}

/// What happened to a recording attempt. Informational only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded {
        task_id: TaskId,
        source: TaskSource,
        rows: usize,
    },
    Skipped(SkipReason),
    Failed {
        reason: String,
    },
}

impl RecordOutcome {
    #[must_use]
    pub fn is_recorded(&self) -> bool {
        matches!(self, Self::Recorded { .. })
    }
}

/// Best-effort provenance writer shared by every edit tool.
#[derive(Debug, Clone)]
pub struct LineageRecorder {
    enabled: bool,
    store: Arc<LineageStore>,
}

impl LineageRecorder {
    /// Recorder for the store found above `start_dir`.
    pub fn new(config: LineageConfig, start_dir: impl Into<PathBuf>) -> Self {
        let enabled = config.enabled;
        Self {
            enabled,
            store: Arc::new(LineageStore::new(config, start_dir)),
        }
    }

    /// Recorder that never touches the filesystem.
    pub fn disabled() -> Self {
        Self::new(
            LineageConfig {
                enabled: false,
                ..LineageConfig::default()
            },
            PathBuf::new(),
        )
    }

    #[must_use]
    pub fn store(&self) -> &Arc<LineageStore> {
        &self.store
    }

    #[must_use]
    pub fn resolver(&self) -> TaskContextResolver {
        TaskContextResolver::new(Arc::clone(&self.store))
    }

    /// Record `changes`. Never fails; the outcome is for logs and tests.
    pub async fn record(&self, changes: ChangeSet) -> RecordOutcome {
        if !self.enabled {
            return RecordOutcome::Skipped(SkipReason::Disabled);
        }
        if changes.files.is_empty() {
            return RecordOutcome::Skipped(SkipReason::NoChanges);
        }

        let tool = changes.edit.tool_name();
        let store = Arc::clone(&self.store);
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let job = tokio::task::spawn_blocking(move || {
            store.with_access(|access| write_changes(&access, &changes, &timestamp))
        });
        let result = match job.await {
            Ok(result) => result,
            Err(e) => Err(RecordingFailure::Worker(e.to_string())),
        };

        match result {
            Ok(outcome) => {
                match &outcome {
                    RecordOutcome::Recorded { task_id, rows, .. } => {
                        tracing::info!(task_id = %task_id, tool, rows, "Recorded change");
                    }
                    RecordOutcome::Skipped(reason) => {
                        tracing::debug!(tool, ?reason, "Skipped change recording");
                    }
                    RecordOutcome::Failed { .. } => {}
                }
                outcome
            }
            Err(failure) => {
                tracing::warn!(tool, "Failed to record change to lineage store: {failure}");
                RecordOutcome::Failed {
                    reason: failure.to_string(),
                }
            }
        }
    }
}

fn write_changes(
    access: &StoreAccess<'_>,
    changes: &ChangeSet,
    timestamp: &str,
) -> Result<RecordOutcome, RecordingFailure> {
    let conn = match access {
        StoreAccess::Absent => return Ok(RecordOutcome::Skipped(SkipReason::NoStore)),
        StoreAccess::Embedded(_) => return Ok(RecordOutcome::Skipped(SkipReason::EmbeddedStore)),
        StoreAccess::Relational(conn) => *conn,
    };

    let context = resolve_with(access, changes.explicit_task.clone());
    let Some(task_id) = context.task_id().cloned() else {
        return Ok(RecordOutcome::Skipped(SkipReason::NoTask));
    };
    let source = context.source();

    let change_type = changes.edit.change_kind().as_str();
    let tool = changes.edit.tool_name();
    let tx = conn.unchecked_transaction()?;
    {
        let mut insert = tx.prepare_cached(INSERT_CHANGE)?;
        for file in &changes.files {
            insert.execute(params![
                task_id.as_str(),
                file.file_path,
                file.symbol_fqn,
                change_type,
                tool,
                file.old_hash.hex_prefix(STORED_HASH_LEN),
                file.new_hash.hex_prefix(STORED_HASH_LEN),
                timestamp,
            ])?;
        }
    }
    tx.commit()?;

    if let TaskContext::LookedUp(active) = &context {
        tracing::debug!(
            task_id = %active.task_id,
            plan_id = ?active.plan_id,
            spec_id = ?active.spec_id,
            "Attributed change to active task"
        );
    }
    Ok(RecordOutcome::Recorded {
        task_id,
        source,
        rows: changes.files.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn change(path: &str, fqn: &str, old: &str, new: &str) -> FileChange {
        FileChange {
            file_path: path.to_string(),
            symbol_fqn: fqn.to_string(),
            old_hash: ContentHash::of(old.as_bytes()),
            new_hash: ContentHash::of(new.as_bytes()),
        }
    }

    fn rename_set(task: Option<&str>) -> ChangeSet {
        ChangeSet {
            edit: EditKind::Rename,
            explicit_task: task.map(|t| TaskId::new(t).unwrap()),
            files: vec![
                change("src/a.rs", "src/a.rs:old_name", "fn old_name() {}", "fn new_name() {}"),
                change("src/b.rs", "src/a.rs:old_name", "old_name();", "new_name();"),
            ],
        }
    }

    #[tokio::test]
    async fn explicit_task_writes_one_row_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = testing::create_store(dir.path());
        let recorder = LineageRecorder::new(LineageConfig::default(), dir.path());

        let outcome = recorder.record(rename_set(Some("CORE-001-T01"))).await;
        assert_eq!(
            outcome,
            RecordOutcome::Recorded {
                task_id: TaskId::new("CORE-001-T01").unwrap(),
                source: TaskSource::Explicit,
                rows: 2,
            }
        );

        let rows = testing::recorded_changes(&db);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.task_id == "CORE-001-T01"));
        assert!(rows.iter().all(|r| r.change_type == "rename"));
        assert!(rows.iter().all(|r| r.tool_used.as_deref() == Some("rename_symbol")));
        assert_eq!(rows[1].file_path, "src/b.rs");
        assert_eq!(
            rows[0].old_content_hash.as_deref(),
            Some(ContentHash::of(b"fn old_name() {}").hex_prefix(16).as_str())
        );
        assert_eq!(rows[0].new_content_hash.as_ref().map(String::len), Some(16));
        assert!(chrono::DateTime::parse_from_rfc3339(&rows[0].timestamp).is_ok());
        assert!(rows[0].timestamp.ends_with('Z'));
    }

    #[tokio::test]
    async fn active_task_used_when_no_explicit_id() {
        let dir = tempfile::tempdir().unwrap();
        let db = testing::create_store(dir.path());
        testing::set_active_task(&db, "T7", Some("Add helpers"), None);
        let recorder = LineageRecorder::new(LineageConfig::default(), dir.path());

        let outcome = recorder
            .record(ChangeSet {
                edit: EditKind::InsertAfter,
                explicit_task: None,
                files: vec![change("lib.rs", "lib.rs:anchor", "a", "ab")],
            })
            .await;
        assert!(matches!(
            outcome,
            RecordOutcome::Recorded {
                source: TaskSource::LookedUp,
                rows: 1,
                ..
            }
        ));
        let rows = testing::recorded_changes(&db);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].task_id, "T7");
        assert_eq!(rows[0].change_type, "create");
        assert_eq!(rows[0].symbol_fqn.as_deref(), Some("lib.rs:anchor"));
    }

    #[tokio::test]
    async fn no_store_is_a_skip() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = LineageRecorder::new(LineageConfig::default(), dir.path());
        let outcome = recorder.record(rename_set(Some("T1"))).await;
        assert_eq!(outcome, RecordOutcome::Skipped(SkipReason::NoStore));
        assert!(!dir.path().join(".spectrena").exists());
    }

    #[tokio::test]
    async fn no_active_task_is_a_skip() {
        let dir = tempfile::tempdir().unwrap();
        let db = testing::create_store(dir.path());
        let recorder = LineageRecorder::new(LineageConfig::default(), dir.path());
        let outcome = recorder.record(rename_set(None)).await;
        assert_eq!(outcome, RecordOutcome::Skipped(SkipReason::NoTask));
        assert!(testing::recorded_changes(&db).is_empty());
    }

    #[tokio::test]
    async fn embedded_store_is_a_skip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".spectrena/lineage")).unwrap();
        let recorder = LineageRecorder::new(LineageConfig::default(), dir.path());
        let outcome = recorder.record(rename_set(Some("T1"))).await;
        assert_eq!(outcome, RecordOutcome::Skipped(SkipReason::EmbeddedStore));
    }

    #[tokio::test]
    async fn disabled_recorder_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db = testing::create_store(dir.path());
        let recorder = LineageRecorder::new(
            LineageConfig {
                enabled: false,
                ..LineageConfig::default()
            },
            dir.path(),
        );
        let outcome = recorder.record(rename_set(Some("T1"))).await;
        assert_eq!(outcome, RecordOutcome::Skipped(SkipReason::Disabled));
        assert!(testing::recorded_changes(&db).is_empty());
        assert!(!recorder.store().is_open());
    }

    #[tokio::test]
    async fn missing_table_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".spectrena")).unwrap();
        rusqlite::Connection::open(dir.path().join(".spectrena/lineage.db"))
            .unwrap()
            .execute_batch("CREATE TABLE unrelated (x INTEGER);")
            .unwrap();
        let recorder = LineageRecorder::new(LineageConfig::default(), dir.path());

        let outcome = recorder.record(rename_set(Some("T1"))).await;
        let RecordOutcome::Failed { reason } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(reason.contains("code_changes"), "{reason}");
    }

    #[tokio::test]
    async fn failed_batch_leaves_no_partial_rows() {
        let dir = tempfile::tempdir().unwrap();
        let db = testing::create_store(dir.path());
        let recorder = LineageRecorder::new(LineageConfig::default(), dir.path());
        // The first row inserts; the second is rejected.
        rusqlite::Connection::open(&db)
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_b BEFORE INSERT ON code_changes
                 WHEN NEW.file_path = 'src/b.rs'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();

        assert!(matches!(
            recorder.record(rename_set(Some("T1"))).await,
            RecordOutcome::Failed { .. }
        ));
        assert!(testing::recorded_changes(&db).is_empty());
    }

    #[tokio::test]
    async fn concurrent_records_share_one_handle() {
        let dir = tempfile::tempdir().unwrap();
        let db = testing::create_store(dir.path());
        let recorder = LineageRecorder::new(LineageConfig::default(), dir.path());

        let jobs: Vec<_> = (0..8)
            .map(|i| {
                let recorder = recorder.clone();
                tokio::spawn(async move {
                    recorder
                        .record(ChangeSet {
                            edit: EditKind::ReplaceBody,
                            explicit_task: Some(TaskId::new(format!("T{i}")).unwrap()),
                            files: vec![change("a.rs", "a.rs:f", "x", "y")],
                        })
                        .await
                })
            })
            .collect();
        for job in jobs {
            assert!(job.await.unwrap().is_recorded());
        }
        assert_eq!(testing::recorded_changes(&db).len(), 8);
        assert!(recorder.store().is_open());
    }
}

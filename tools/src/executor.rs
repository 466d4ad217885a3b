//! Symbol resolution, stale-read protection, and edit application.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde_json::{Value, json};
use tether_lineage::{ChangeSet, FileChange};
use tether_lsp::{BackendSession, ResolvedSymbol, SessionManager};
use tether_types::{ContentHash, EditKind, SymbolLocator, TaskId};

use crate::error::EditError;
use crate::fs::{self, Snapshot};
use crate::text::{self, TextError};

/// One file written by an edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEdit {
    /// Workspace-relative, `/`-separated.
    pub relative_path: String,
    pub path: PathBuf,
    /// Hash of the content immediately before the write.
    pub old_hash: ContentHash,
    pub new_hash: ContentHash,
}

/// A completed edit. Handed to the lineage recorder, never persisted here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditRecord {
    pub kind: EditKind,
    pub locator: SymbolLocator,
    /// Full ancestry of the edited symbol as the backend reported it.
    pub symbol_path: Vec<String>,
    pub files: Vec<FileEdit>,
}

impl EditRecord {
    /// `relative/path:Outer.inner`.
    #[must_use]
    pub fn symbol_fqn(&self) -> String {
        format!("{}:{}", self.locator.display_path(), self.symbol_path.join("."))
    }

    #[must_use]
    pub fn change_set(&self, explicit_task: Option<TaskId>) -> ChangeSet {
        let symbol_fqn = self.symbol_fqn();
        ChangeSet {
            edit: self.kind,
            explicit_task,
            files: self
                .files
                .iter()
                .map(|f| FileChange {
                    file_path: f.relative_path.clone(),
                    symbol_fqn: symbol_fqn.clone(),
                    old_hash: f.old_hash,
                    new_hash: f.new_hash,
                })
                .collect(),
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "tool": self.kind.tool_name(),
            "change_type": self.kind.change_kind().as_str(),
            "symbol": self.symbol_fqn(),
            "files": self.files.iter().map(|f| json!({
                "relative_path": f.relative_path,
                "old_hash": f.old_hash.to_hex(),
                "new_hash": f.new_hash.to_hex(),
            })).collect::<Vec<_>>(),
        })
    }
}

/// One file of a rename, computed before anything is written.
struct PlannedWrite {
    path: PathBuf,
    relative: String,
    before: Snapshot,
    updated: String,
}

fn display_relative(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Applies symbolic edits through the session manager.
///
/// Every edit holds its session's edit lease from symbol resolution until
/// the backend has been told about the new content, so a backend restart
/// never interleaves with a half-finished edit.
#[derive(Clone)]
pub struct EditExecutor {
    manager: Arc<SessionManager>,
}

impl EditExecutor {
    #[must_use]
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    fn absolute(&self, locator: &SymbolLocator) -> PathBuf {
        self.manager.workspace_root().join(locator.relative_path())
    }

    async fn session_for(&self, path: &Path) -> Result<Arc<BackendSession>, EditError> {
        let language = self.manager.language_for_path(path).ok_or_else(|| {
            EditError::BackendUnavailable {
                message: format!("no language backend handles {}", path.display()),
                retryable: false,
            }
        })?;
        Ok(self.manager.get_session(&language).await?)
    }

    async fn resolve_in(
        &self,
        session: &BackendSession,
        path: &Path,
        locator: &SymbolLocator,
    ) -> Result<(Snapshot, ResolvedSymbol), EditError> {
        let snapshot = fs::snapshot(path).await?;
        let tree = self
            .manager
            .symbol_tree(session, path, &snapshot.text, &snapshot.hash)
            .await?;
        let symbol = tree
            .resolve(locator)
            .map_err(|e| EditError::not_found(locator, &e))?;
        Ok((snapshot, symbol))
    }

    /// Find the symbol `locator` names without changing anything.
    pub async fn locate(&self, locator: &SymbolLocator) -> Result<ResolvedSymbol, EditError> {
        let path = self.absolute(locator);
        let session = self.session_for(&path).await?;
        let (_, symbol) = self.resolve_in(&session, &path, locator).await?;
        Ok(symbol)
    }

    /// Replace the symbol's full range with `body`.
    pub async fn replace_body(
        &self,
        locator: &SymbolLocator,
        body: &str,
    ) -> Result<EditRecord, EditError> {
        self.edit_in_place(EditKind::ReplaceBody, locator, |text, symbol| {
            text::replace_range(text, symbol.range, body)
        })
        .await
    }

    /// Insert `body` on its own lines before the symbol's first line.
    pub async fn insert_before(
        &self,
        locator: &SymbolLocator,
        body: &str,
    ) -> Result<EditRecord, EditError> {
        self.edit_in_place(EditKind::InsertBefore, locator, |text, symbol| {
            text::insert_before(text, symbol.range, body)
        })
        .await
    }

    /// Insert `body` on its own lines after the symbol's last line.
    pub async fn insert_after(
        &self,
        locator: &SymbolLocator,
        body: &str,
    ) -> Result<EditRecord, EditError> {
        self.edit_in_place(EditKind::InsertAfter, locator, |text, symbol| {
            text::insert_after(text, symbol.range, body)
        })
        .await
    }

    async fn edit_in_place(
        &self,
        kind: EditKind,
        locator: &SymbolLocator,
        apply: impl FnOnce(&str, &ResolvedSymbol) -> Result<String, TextError>,
    ) -> Result<EditRecord, EditError> {
        let path = self.absolute(locator);
        let session = self.session_for(&path).await?;
        let _lease = session.edit_lease().await?;

        let (before, symbol) = self.resolve_in(&session, &path, locator).await?;
        let updated =
            apply(&before.text, &symbol).map_err(|e| EditError::mismatched_range(&path, &e))?;
        let written = self
            .commit(&session, &path, locator.display_path(), before.hash, updated)
            .await?;

        tracing::info!(
            tool = kind.tool_name(),
            locator = %locator,
            old = %written.old_hash.short(),
            new = %written.new_hash.short(),
            "Applied symbolic edit"
        );
        Ok(EditRecord {
            kind,
            locator: locator.clone(),
            symbol_path: symbol.path,
            files: vec![written],
        })
    }

    /// Rename the symbol and every reference the backend knows about.
    pub async fn rename(
        &self,
        locator: &SymbolLocator,
        new_name: &str,
    ) -> Result<EditRecord, EditError> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(EditError::bad_args("new_name must not be empty"));
        }
        let path = self.absolute(locator);
        let session = self.session_for(&path).await?;
        let _lease = session.edit_lease().await?;

        let (before, symbol) = self.resolve_in(&session, &path, locator).await?;
        let edit = session
            .rename(&path, &before.text, symbol.selection_range.start, new_name)
            .await?;

        let root = self.manager.workspace_root();
        let mut planned: Vec<PlannedWrite> = Vec::new();
        for (file, edits) in edit.files {
            if edits.is_empty() {
                continue;
            }
            let relative = file
                .strip_prefix(root)
                .map_err(|_| EditError::BackendUnavailable {
                    message: format!("rename touches {} outside the workspace", file.display()),
                    retryable: false,
                })?;
            let relative = display_relative(relative);
            let snapshot = if file == path {
                before.clone()
            } else {
                fs::snapshot(&file).await?
            };
            let updated = text::apply_edits(&snapshot.text, &edits)
                .map_err(|e| EditError::mismatched_range(&file, &e))?;
            planned.push(PlannedWrite {
                path: file,
                relative,
                before: snapshot,
                updated,
            });
        }

        // Nothing is written unless every file is still as read.
        for write in &planned {
            if fs::current_hash(&write.path).await? != write.before.hash {
                return Err(EditError::StaleRead {
                    path: write.path.clone(),
                });
            }
        }
        let files = self.commit_all(&session, &planned).await?;

        tracing::info!(
            locator = %locator,
            new_name,
            files = files.len(),
            "Renamed symbol"
        );
        Ok(EditRecord {
            kind: EditKind::Rename,
            locator: locator.clone(),
            symbol_path: symbol.path,
            files,
        })
    }

    /// Write every planned file in order.
    ///
    /// A file can still change between the up-front checks and its own write.
    /// When any write fails, files already written get their old content back
    /// and the original error is returned. Files that could not be put back are
    /// reported as a `PartialWrite`.
    async fn commit_all(
        &self,
        session: &BackendSession,
        planned: &[PlannedWrite],
    ) -> Result<Vec<FileEdit>, EditError> {
        let mut files = Vec::with_capacity(planned.len());
        for write in planned {
            let result = self
                .commit(
                    session,
                    &write.path,
                    write.relative.clone(),
                    write.before.hash,
                    write.updated.clone(),
                )
                .await;
            match result {
                Ok(file) => files.push(file),
                Err(err) => {
                    let unrestored = self.restore(session, planned, &files).await;
                    if unrestored.is_empty() {
                        return Err(err);
                    }
                    return Err(EditError::PartialWrite {
                        paths: unrestored,
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok(files)
    }

    /// Put back the pre-edit content of `written`. Returns the paths left as
    /// they are, either because someone else changed them after our write or
    /// because the write back failed.
    async fn restore(
        &self,
        session: &BackendSession,
        planned: &[PlannedWrite],
        written: &[FileEdit],
    ) -> Vec<PathBuf> {
        let mut unrestored = Vec::new();
        for (write, file) in planned.iter().zip(written) {
            let ours = matches!(fs::current_hash(&file.path).await, Ok(hash) if hash == file.new_hash);
            let restored =
                ours && fs::write_file(&file.path, write.before.text.clone()).await.is_ok();
            if restored {
                tracing::info!(path = %file.path.display(), "Restored file after failed rename");
                self.after_write(session, &file.path, &write.before.text).await;
            } else {
                tracing::error!(path = %file.path.display(), "Could not restore file after failed rename");
                unrestored.push(file.path.clone());
            }
        }
        unrestored
    }

    /// Stale check, write, then bring the backend and cache up to date.
    async fn commit(
        &self,
        session: &BackendSession,
        path: &Path,
        relative_path: String,
        expected: ContentHash,
        updated: String,
    ) -> Result<FileEdit, EditError> {
        if fs::current_hash(path).await? != expected {
            tracing::debug!(path = %path.display(), "Refusing stale write");
            return Err(EditError::StaleRead {
                path: path.to_path_buf(),
            });
        }
        let new_hash = ContentHash::of(updated.as_bytes());
        fs::write_file(path, updated.clone()).await?;
        self.after_write(session, path, &updated).await;
        Ok(FileEdit {
            relative_path,
            path: path.to_path_buf(),
            old_hash: expected,
            new_hash,
        })
    }

    async fn after_write(&self, session: &BackendSession, path: &Path, text: &str) {
        self.manager.cache().invalidate_path(path);
        if let Err(e) = session.document_changed(path, text).await {
            tracing::warn!(path = %path.display(), "Backend not told about new content: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_lsp::LspConfig;
    use tether_lsp::testing::FakeBackend;
    use tether_types::LanguageId;

    fn record(files: Vec<FileEdit>) -> EditRecord {
        EditRecord {
            kind: EditKind::Rename,
            locator: SymbolLocator::parse("src/lib.rs", "helper").unwrap(),
            symbol_path: vec!["Outer".into(), "helper".into()],
            files,
        }
    }

    fn file(rel: &str, old: &str, new: &str) -> FileEdit {
        FileEdit {
            relative_path: rel.into(),
            path: PathBuf::from("/ws").join(rel),
            old_hash: ContentHash::of(old.as_bytes()),
            new_hash: ContentHash::of(new.as_bytes()),
        }
    }

    #[test]
    fn fqn_uses_resolved_ancestry() {
        assert_eq!(record(vec![]).symbol_fqn(), "src/lib.rs:Outer.helper");
    }

    #[test]
    fn change_set_has_one_entry_per_file() {
        let rec = record(vec![file("src/lib.rs", "a", "b"), file("src/main.rs", "c", "d")]);
        let set = rec.change_set(Some(TaskId::new("T1").unwrap()));
        assert_eq!(set.edit, EditKind::Rename);
        assert_eq!(set.files.len(), 2);
        assert_eq!(set.files[1].file_path, "src/main.rs");
        assert!(set.files.iter().all(|f| f.symbol_fqn == "src/lib.rs:Outer.helper"));
        assert_eq!(set.files[0].old_hash, ContentHash::of(b"a"));
    }

    #[test]
    fn json_payload_lists_hashes() {
        let rec = record(vec![file("src/lib.rs", "a", "b")]);
        let json = rec.to_json();
        assert_eq!(json["tool"], "rename_symbol");
        assert_eq!(json["change_type"], "rename");
        assert_eq!(json["files"][0]["old_hash"], ContentHash::of(b"a").to_hex());
    }

    async fn fake_session(root: &Path) -> (EditExecutor, Arc<BackendSession>) {
        let config: LspConfig = serde_json::from_value(json!({
            "servers": {
                "rust": { "command": "rust-analyzer", "language_id": "rust", "file_extensions": ["rs"] }
            }
        }))
        .unwrap();
        let fake = FakeBackend::new();
        let manager = Arc::new(SessionManager::with_spawner(config, root, fake.spawner()));
        let session = manager
            .get_session(&LanguageId::new("rust").unwrap())
            .await
            .unwrap();
        (EditExecutor::new(manager), session)
    }

    fn planned(path: PathBuf, before: &str, updated: &str) -> PlannedWrite {
        PlannedWrite {
            relative: path.file_name().unwrap().to_string_lossy().into_owned(),
            path,
            before: Snapshot {
                text: before.to_string(),
                hash: ContentHash::of(before.as_bytes()),
            },
            updated: updated.to_string(),
        }
    }

    #[tokio::test]
    async fn failed_later_write_restores_earlier_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.rs");
        let b = dir.path().join("b.rs");
        std::fs::write(&a, "fn old() {}\n").unwrap();
        std::fs::write(&b, "old();\n").unwrap();
        let (executor, session) = fake_session(dir.path()).await;
        let writes = vec![
            planned(a.clone(), "fn old() {}\n", "fn new() {}\n"),
            planned(b.clone(), "old();\n", "new();\n"),
        ];

        // b.rs changes after the up-front checks but before its own write.
        std::fs::write(&b, "old(); // edited\n").unwrap();
        let err = executor.commit_all(&session, &writes).await.unwrap_err();

        assert!(matches!(&err, EditError::StaleRead { path } if *path == b), "{err:?}");
        assert_eq!(std::fs::read_to_string(&a).unwrap(), "fn old() {}\n");
        assert_eq!(std::fs::read_to_string(&b).unwrap(), "old(); // edited\n");
    }

    #[tokio::test]
    async fn all_planned_files_written_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.rs");
        let b = dir.path().join("b.rs");
        std::fs::write(&a, "fn old() {}\n").unwrap();
        std::fs::write(&b, "old();\n").unwrap();
        let (executor, session) = fake_session(dir.path()).await;
        let writes = vec![
            planned(a.clone(), "fn old() {}\n", "fn new() {}\n"),
            planned(b.clone(), "old();\n", "new();\n"),
        ];

        let files = executor.commit_all(&session, &writes).await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].relative_path, "b.rs");
        assert_eq!(files[1].new_hash, ContentHash::of(b"new();\n"));
        assert_eq!(std::fs::read_to_string(&b).unwrap(), "new();\n");
    }

    #[test]
    fn relative_display_uses_forward_slashes() {
        assert_eq!(display_relative(Path::new("src/deep/mod.rs")), "src/deep/mod.rs");
    }
}

//! Attributing an edit to a task.

use std::sync::Arc;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension, Row};
use tether_types::TaskId;

use crate::error::RecordingFailure;
use crate::store::{LineageStore, StoreAccess};

const ACTIVE_TASK_QUERY: &str = r"
    SELECT ps.current_task_id, t.title, t.plan_id, p.spec_id
    FROM phase_state ps
    LEFT JOIN tasks t ON ps.current_task_id = t.task_id
    LEFT JOIN plans p ON t.plan_id = p.plan_id
    WHERE ps.id = 1 AND ps.current_task_id IS NOT NULL
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSource {
    Explicit,
    LookedUp,
    None,
}

/// The task recorded in the store's phase state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTask {
    pub task_id: TaskId,
    pub title: Option<String>,
    pub plan_id: Option<String>,
    pub spec_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskContext {
    Explicit(TaskId),
    LookedUp(ActiveTask),
    None,
}

impl TaskContext {
    #[must_use]
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::Explicit(id) => Some(id),
            Self::LookedUp(task) => Some(&task.task_id),
            Self::None => None,
        }
    }

    #[must_use]
    pub fn source(&self) -> TaskSource {
        match self {
            Self::Explicit(_) => TaskSource::Explicit,
            Self::LookedUp(_) => TaskSource::LookedUp,
            Self::None => TaskSource::None,
        }
    }
}

/// Resolve against an already opened store. A lookup failure means no context.
pub(crate) fn resolve_with(access: &StoreAccess<'_>, explicit: Option<TaskId>) -> TaskContext {
    if let Some(id) = explicit {
        return TaskContext::Explicit(id);
    }
    match access {
        StoreAccess::Relational(conn) => match active_task(conn) {
            Ok(Some(task)) => TaskContext::LookedUp(task),
            Ok(None) => TaskContext::None,
            Err(e) => {
                tracing::debug!("Active task lookup failed: {e}");
                TaskContext::None
            }
        },
        StoreAccess::Embedded(path) => {
            tracing::debug!(path = %path.display(), "Embedded lineage store has no task lookup");
            TaskContext::None
        }
        StoreAccess::Absent => TaskContext::None,
    }
}

fn active_task(conn: &Connection) -> rusqlite::Result<Option<ActiveTask>> {
    let row = conn
        .query_row(ACTIVE_TASK_QUERY, [], |row| {
            Ok((
                text_column(row, 0)?,
                text_column(row, 1)?,
                text_column(row, 2)?,
                text_column(row, 3)?,
            ))
        })
        .optional()?;
    Ok(row.and_then(|(task_id, title, plan_id, spec_id)| {
        let task_id = TaskId::new(task_id?).ok()?;
        Some(ActiveTask {
            task_id,
            title,
            plan_id,
            spec_id,
        })
    }))
}

/// Ids in stores written by other tools are not always TEXT.
fn text_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<String>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    })
}

/// Determines which task an edit belongs to.
#[derive(Debug, Clone)]
pub struct TaskContextResolver {
    store: Arc<LineageStore>,
}

impl TaskContextResolver {
    #[must_use]
    pub fn new(store: Arc<LineageStore>) -> Self {
        Self { store }
    }

    /// An explicit id is returned unchanged without touching the store.
    /// Otherwise the active task is looked up; any problem yields
    /// [`TaskContext::None`].
    pub async fn resolve(&self, explicit: Option<TaskId>) -> TaskContext {
        if let Some(id) = explicit {
            return TaskContext::Explicit(id);
        }
        let store = Arc::clone(&self.store);
        let job = tokio::task::spawn_blocking(move || {
            store.with_access(|access| Ok(resolve_with(&access, None)))
        });
        let result = match job.await {
            Ok(result) => result,
            Err(e) => Err(RecordingFailure::Worker(e.to_string())),
        };
        result.unwrap_or_else(|e| {
            tracing::debug!("Task context unavailable: {e}");
            TaskContext::None
        })
    }
}

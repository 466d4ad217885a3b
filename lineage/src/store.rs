//! Process-wide handle to the lineage store.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use serde::Deserialize;

use crate::error::RecordingFailure;
use crate::marker::{StoreKind, StoreMarker, find_store_marker};

/// `[lineage]` configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LineageConfig {
    pub enabled: bool,
    /// Directory name searched for upward from the working directory.
    pub marker_dir: String,
    pub busy_timeout_ms: u64,
}

impl Default for LineageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            marker_dir: ".spectrena".to_string(),
            busy_timeout_ms: 2000,
        }
    }
}

impl LineageConfig {
    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// What the store looks like for one access.
pub(crate) enum StoreAccess<'a> {
    Absent,
    Embedded(&'a Path),
    Relational(&'a Connection),
}

#[derive(Default)]
struct HandleState {
    marker: Option<StoreMarker>,
    conn: Option<Connection>,
}

/// Lazily opened connection to the store found above `start_dir`.
///
/// The marker is re-detected on every access. The connection is opened on
/// first use, closed when the marker disappears or moves, and reopened when
/// it comes back. All SQLite work happens under the handle's mutex, so
/// callers must run [`LineageStore::with_access`] off the async executor.
pub struct LineageStore {
    config: LineageConfig,
    start_dir: PathBuf,
    state: Mutex<HandleState>,
}

impl fmt::Debug for LineageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineageStore")
            .field("start_dir", &self.start_dir)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl LineageStore {
    pub fn new(config: LineageConfig, start_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            start_dir: start_dir.into(),
            state: Mutex::new(HandleState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn config(&self) -> &LineageConfig {
        &self.config
    }

    #[must_use]
    pub fn start_dir(&self) -> &Path {
        &self.start_dir
    }

    /// Current marker on disk, without touching the connection.
    #[must_use]
    pub fn detect(&self) -> Option<StoreMarker> {
        find_store_marker(&self.start_dir, &self.config.marker_dir)
    }

    /// Whether a SQLite connection is currently held.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state().conn.is_some()
    }

    /// Run `f` against the store as it exists right now. Blocking.
    pub(crate) fn with_access<T>(
        &self,
        f: impl FnOnce(StoreAccess<'_>) -> Result<T, RecordingFailure>,
    ) -> Result<T, RecordingFailure> {
        let found = self.detect();
        let mut guard = self.state();
        let HandleState { marker, conn } = &mut *guard;

        if *marker != found {
            if conn.take().is_some() {
                tracing::info!("Lineage store marker changed; closed handle");
            }
            *marker = found;
        }

        match marker.as_ref() {
            None => f(StoreAccess::Absent),
            Some(StoreMarker {
                kind: StoreKind::EmbeddedGraph,
                path,
            }) => f(StoreAccess::Embedded(path)),
            Some(StoreMarker {
                kind: StoreKind::Relational,
                path,
            }) => {
                if conn.is_none() {
                    *conn = Some(open_store(path, self.config.busy_timeout())?);
                    tracing::info!(path = %path.display(), "Opened lineage store");
                }
                match conn.as_ref() {
                    Some(conn) => f(StoreAccess::Relational(conn)),
                    None => f(StoreAccess::Absent),
                }
            }
        }
    }
}

/// Open an existing store. The store belongs to another tool, so it is never
/// created or migrated here.
fn open_store(path: &Path, busy_timeout: Duration) -> Result<Connection, RecordingFailure> {
    let open_err = |source| RecordingFailure::Open {
        path: path.to_path_buf(),
        source,
    };
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(open_err)?;
    conn.busy_timeout(busy_timeout).map_err(open_err)?;
    Ok(conn)
}

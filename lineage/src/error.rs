use std::path::PathBuf;

/// Why a recording attempt did not reach the store.
///
/// Never crosses the crate boundary; the recorder logs it and reports a
/// [`crate::RecordOutcome::Failed`] instead.
#[derive(Debug, thiserror::Error)]
pub(crate) enum RecordingFailure {
    #[error("failed to open lineage store at {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("lineage store query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("lineage worker failed: {0}")]
    Worker(String),
}

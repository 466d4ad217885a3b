use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tether_lsp::{LspError, ResolveError};
use tether_types::LocatorError;

use crate::text::TextError;

/// Failure of a symbolic edit. Exactly one is reported per failed call.
#[derive(Debug, thiserror::Error)]
pub enum EditError {
    #[error("symbol not found: {message}")]
    SymbolNotFound { locator: String, message: String },
    #[error("{} changed since it was read; nothing was written", path.display())]
    StaleRead { path: PathBuf },
    #[error("language backend unavailable: {message}")]
    BackendUnavailable { message: String, retryable: bool },
    #[error("{operation} timed out after {}ms", elapsed.as_millis())]
    Timeout { operation: String, elapsed: Duration },
    #[error("bad arguments: {message}")]
    BadArgs { message: String },
    /// A multi-file edit failed midway and some written files could not be
    /// put back.
    #[error("edit failed after writing; left changed: {}: {message}", display_paths(paths))]
    PartialWrite { paths: Vec<PathBuf>, message: String },
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl EditError {
    /// Stable discriminant reported to callers.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::SymbolNotFound { .. } => "SymbolNotFound",
            Self::StaleRead { .. } => "StaleRead",
            Self::BackendUnavailable { .. } => "BackendUnavailable",
            Self::Timeout { .. } => "Timeout",
            Self::BadArgs { .. } => "BadArgs",
            Self::PartialWrite { .. } => "PartialWrite",
            Self::Io { .. } => "Io",
        }
    }

    /// Whether the same call may succeed if simply repeated.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::BackendUnavailable { retryable, .. } => *retryable,
            Self::StaleRead { .. } | Self::Timeout { .. } => true,
            Self::SymbolNotFound { .. }
            | Self::BadArgs { .. }
            | Self::PartialWrite { .. }
            | Self::Io { .. } => false,
        }
    }

    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn bad_args(message: impl Into<String>) -> Self {
        Self::BadArgs {
            message: message.into(),
        }
    }

    pub(crate) fn not_found(locator: &impl ToString, err: &ResolveError) -> Self {
        Self::SymbolNotFound {
            locator: locator.to_string(),
            message: err.to_string(),
        }
    }

    /// The backend reported a span that does not fit the file we hold.
    pub(crate) fn mismatched_range(path: &Path, err: &TextError) -> Self {
        tracing::warn!(path = %path.display(), "Backend range does not fit file: {err}");
        Self::StaleRead {
            path: path.to_path_buf(),
        }
    }
}

impl From<LspError> for EditError {
    fn from(err: LspError) -> Self {
        match err {
            LspError::Timeout { method, elapsed } => Self::Timeout {
                operation: method,
                elapsed,
            },
            other => Self::BackendUnavailable {
                retryable: other.is_retryable(),
                message: other.to_string(),
            },
        }
    }
}

impl From<LocatorError> for EditError {
    fn from(err: LocatorError) -> Self {
        Self::bad_args(err.to_string())
    }
}

//! Error taxonomy for backend sessions.

use std::time::Duration;

use tether_types::LanguageId;

use crate::capabilities::Capability;

/// Failure of a backend operation.
///
/// Transport and process failures are handled by the session supervisor;
/// callers see them as retryable until the restart budget is exhausted, at
/// which point the session reports [`LspError::Unavailable`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum LspError {
    #[error("failed to launch {language} backend: {message}")]
    Launch {
        language: LanguageId,
        message: String,
    },
    #[error("{language} backend closed its channel")]
    ChannelClosed { language: LanguageId },
    #[error("{method} timed out after {}ms", elapsed.as_millis())]
    Timeout { method: String, elapsed: Duration },
    #[error("protocol error in {method}: {message}")]
    Protocol {
        method: String,
        code: Option<i64>,
        message: String,
    },
    #[error("request {id} ({method}) was cancelled")]
    Cancelled { id: u64, method: String },
    #[error("{language} backend crashed and is restarting")]
    Crashed { language: LanguageId },
    #[error("{language} backend unavailable: {reason}")]
    Unavailable { language: LanguageId, reason: String },
    #[error("{language} backend does not support {capability}")]
    Unsupported {
        language: LanguageId,
        capability: Capability,
    },
}

impl LspError {
    /// Whether re-issuing the same request later can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ChannelClosed { .. }
            | Self::Timeout { .. }
            | Self::Protocol { .. }
            | Self::Crashed { .. } => true,
            Self::Launch { .. }
            | Self::Cancelled { .. }
            | Self::Unavailable { .. }
            | Self::Unsupported { .. } => false,
        }
    }

    pub(crate) fn protocol(method: &str, message: impl Into<String>) -> Self {
        Self::Protocol {
            method: method.to_string(),
            code: None,
            message: message.into(),
        }
    }
}

//! Backend subprocesses and the transports that carry their frames.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use tether_types::LanguageId;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::error::LspError;
use crate::types::LaunchSpec;

const TERMINATE_TIMEOUT: Duration = Duration::from_secs(2);

/// Environment variables never passed to a backend.
pub const ENV_SECRET_DENYLIST: &[&str] = &[
    "*_KEY",
    "*_TOKEN",
    "*_SECRET",
    "*_PASSWORD",
    "AWS_*",
    "*_CREDENTIAL*",
];

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The byte streams of one backend instance.
///
/// `process` is `None` for in-process backends; their liveness is observed
/// only through the streams.
pub struct Transport {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub process: Option<BackendProcess>,
}

pub type SpawnFut<'a> = Pin<Box<dyn Future<Output = Result<Transport, LspError>> + Send + 'a>>;

/// Launches backend instances. Called once per start and once per restart.
pub trait BackendSpawner: Send + Sync {
    fn spawn<'a>(&'a self, language: &'a LanguageId, spec: &'a LaunchSpec) -> SpawnFut<'a>;
}

/// Spawns real executables.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSpawner;

impl BackendSpawner for ProcessSpawner {
    fn spawn<'a>(&'a self, language: &'a LanguageId, spec: &'a LaunchSpec) -> SpawnFut<'a> {
        Box::pin(async move {
            let mut process = BackendProcess::start(language, spec)?;
            let launch_error = |message: &str| LspError::Launch {
                language: language.clone(),
                message: message.to_string(),
            };
            let stdout = process
                .child
                .stdout
                .take()
                .ok_or_else(|| launch_error("no stdout from child"))?;
            let stdin = process
                .child
                .stdin
                .take()
                .ok_or_else(|| launch_error("no stdin from child"))?;
            Ok(Transport {
                reader: Box::new(stdout),
                writer: Box::new(stdin),
                process: Some(process),
            })
        })
    }
}

/// Minimal glob matcher for env var denylist patterns.
/// Handles `*_SUFFIX`, `PREFIX_*`, `*_INFIX*`, and exact match.
/// Both pattern and key are compared in uppercase.
fn env_glob_matches(pattern: &str, key_upper: &str) -> bool {
    let pat = pattern.to_uppercase();
    match (pat.strip_prefix('*'), pat.strip_suffix('*')) {
        (Some(rest), Some(_)) => rest
            .strip_suffix('*')
            .is_some_and(|inner| key_upper.contains(inner)),
        (Some(suffix), None) => key_upper.ends_with(suffix),
        (None, Some(prefix)) => key_upper.starts_with(prefix),
        (None, None) => key_upper == pat,
    }
}

fn is_secret_env(key: &str) -> bool {
    let upper = key.to_uppercase();
    ENV_SECRET_DENYLIST
        .iter()
        .any(|pat| env_glob_matches(pat, &upper))
}

/// One running backend executable.
pub struct BackendProcess {
    language: LanguageId,
    child: Child,
}

impl BackendProcess {
    /// Spawn `spec.program` with piped stdio and a scrubbed environment.
    pub fn start(language: &LanguageId, spec: &LaunchSpec) -> Result<Self, LspError> {
        let launch_error = |message: String| LspError::Launch {
            language: language.clone(),
            message,
        };

        let program = which::which(&spec.program)
            .map_err(|e| launch_error(format!("{} not found in PATH: {e}", spec.program)))?;
        let mut cmd = Command::new(&program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        for (key, _) in std::env::vars_os() {
            if let Some(key) = key.to_str()
                && is_secret_env(key)
            {
                cmd.env_remove(key);
            }
        }

        let child = cmd
            .spawn()
            .map_err(|e| launch_error(format!("spawning {}: {e}", spec.program)))?;
        tracing::info!(
            language = %language,
            program = %program.display(),
            pid = child.id(),
            "Backend process started"
        );
        Ok(Self {
            language: language.clone(),
            child,
        })
    }

    /// Whether the process has not exited yet.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait briefly for a voluntary exit, then kill.
    ///
    /// The graceful `shutdown`/`exit` exchange is the session's job; this
    /// only reaps the process.
    pub async fn terminate(&mut self) {
        if tokio::time::timeout(TERMINATE_TIMEOUT, self.child.wait())
            .await
            .is_err()
        {
            tracing::debug!(language = %self.language, "Backend didn't exit in time, killing");
            let _ = self.child.kill().await;
        }
    }

    /// Kill without waiting for a graceful exit.
    pub async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }
}

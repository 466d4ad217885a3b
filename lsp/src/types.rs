//! Configuration and lifecycle types shared by sessions and the manager.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tether_types::LanguageId;

/// Configuration for the backend session subsystem.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LspConfig {
    /// Per-language server configurations, keyed by language (e.g. "rust").
    pub servers: BTreeMap<String, ServerConfig>,
    /// Deadline for every backend request.
    pub request_timeout_ms: u64,
    /// How often the watchdog polls the backend process.
    pub health_check_interval_ms: u64,
    /// Symbol cache bound. `0` means unbounded.
    pub cache_max_entries: usize,
    pub restart: RestartPolicy,
}

impl Default for LspConfig {
    fn default() -> Self {
        Self {
            servers: BTreeMap::new(),
            request_timeout_ms: 30_000,
            health_check_interval_ms: 5_000,
            cache_max_entries: 0,
            restart: RestartPolicy::default(),
        }
    }
}

impl LspConfig {
    /// Fill in the built-in server table when nothing is configured.
    #[must_use]
    pub fn or_builtin_servers(mut self) -> Self {
        if self.servers.is_empty() {
            self.servers = builtin_servers();
        }
        self
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }
}

/// Configuration for a single language server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// Executable command (e.g. "rust-analyzer").
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// LSP `languageId` sent with `didOpen` (e.g. "typescript").
    pub language_id: String,
    /// File extensions this server handles, without the dot.
    #[serde(default)]
    pub file_extensions: Vec<String>,
    /// Working directory for the process. Defaults to the workspace root.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl ServerConfig {
    fn builtin(command: &str, args: &[&str], language_id: &str, extensions: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            language_id: language_id.to_string(),
            file_extensions: extensions.iter().map(ToString::to_string).collect(),
            working_dir: None,
        }
    }
}

/// Servers used when the configuration names none.
#[must_use]
pub fn builtin_servers() -> BTreeMap<String, ServerConfig> {
    let table = [
        ("bash", ServerConfig::builtin("bash-language-server", &["start"], "shellscript", &["sh", "bash"])),
        ("c", ServerConfig::builtin("clangd", &[], "cpp", &["c", "h", "cc", "cpp", "cxx", "hpp", "hh"])),
        ("csharp", ServerConfig::builtin("csharp-ls", &[], "csharp", &["cs"])),
        ("dart", ServerConfig::builtin("dart", &["language-server"], "dart", &["dart"])),
        ("elixir", ServerConfig::builtin("elixir-ls", &[], "elixir", &["ex", "exs"])),
        ("go", ServerConfig::builtin("gopls", &[], "go", &["go"])),
        ("haskell", ServerConfig::builtin("haskell-language-server-wrapper", &["--lsp"], "haskell", &["hs"])),
        ("java", ServerConfig::builtin("jdtls", &[], "java", &["java"])),
        ("kotlin", ServerConfig::builtin("kotlin-language-server", &[], "kotlin", &["kt", "kts"])),
        ("lua", ServerConfig::builtin("lua-language-server", &[], "lua", &["lua"])),
        ("php", ServerConfig::builtin("intelephense", &["--stdio"], "php", &["php"])),
        ("python", ServerConfig::builtin("pyright-langserver", &["--stdio"], "python", &["py", "pyi"])),
        ("ruby", ServerConfig::builtin("ruby-lsp", &[], "ruby", &["rb"])),
        ("rust", ServerConfig::builtin("rust-analyzer", &[], "rust", &["rs"])),
        ("scala", ServerConfig::builtin("metals", &[], "scala", &["scala", "sc"])),
        ("swift", ServerConfig::builtin("sourcekit-lsp", &[], "swift", &["swift"])),
        (
            "typescript",
            ServerConfig::builtin(
                "typescript-language-server",
                &["--stdio"],
                "typescript",
                &["ts", "tsx", "js", "jsx", "mjs", "cjs"],
            ),
        ),
        ("zig", ServerConfig::builtin("zls", &[], "zig", &["zig"])),
    ];
    table
        .into_iter()
        .map(|(name, server)| (name.to_string(), server))
        .collect()
}

/// Restart budget for a crashed backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            backoff_base_ms: 250,
            backoff_max_ms: 8_000,
        }
    }
}

impl RestartPolicy {
    /// Delay before restart `attempt` (1-based): `min(base * 2^(attempt-1), max)`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

/// Everything needed to (re)launch a backend. Reused verbatim on restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// LSP `languageId` for documents opened on this backend.
    pub language_id: String,
}

/// Maps a language to how its backend is launched.
pub trait LaunchResolver: Send + Sync {
    /// `None` when no backend is configured for `language`.
    fn launch_spec(&self, language: &LanguageId, workspace_root: &Path) -> Option<LaunchSpec>;
}

impl LaunchResolver for LspConfig {
    fn launch_spec(&self, language: &LanguageId, workspace_root: &Path) -> Option<LaunchSpec> {
        let server = self.servers.get(language.as_str())?;
        Some(LaunchSpec {
            program: server.command.clone(),
            args: server.args.clone(),
            working_dir: server
                .working_dir
                .as_ref()
                .map_or_else(|| workspace_root.to_path_buf(), |dir| workspace_root.join(dir)),
            language_id: server.language_id.clone(),
        })
    }
}

/// Health of a backend session.
///
/// `Starting -> Ready -> (Busy)* -> Crashed -> Restarting -> Ready | Stopped`.
/// `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Starting,
    Ready,
    /// Ready, with at least one edit holding the session lease.
    Busy,
    Crashed,
    Restarting,
    Stopped,
}

impl SessionState {
    /// Whether requests can be issued.
    #[must_use]
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Stopped
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Crashed => "crashed",
            Self::Restarting => "restarting",
            Self::Stopped => "stopped",
        })
    }
}

//! Configuration loading for Tether.
//!
//! A single TOML file with an `[lsp]` and a `[lineage]` table. Both tables
//! are optional and every field has a default, so an empty or missing file
//! is a valid configuration.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tether_lineage::LineageConfig;
use tether_lsp::LspConfig;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "TETHER_CONFIG";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub lsp: LspConfig,
    pub lineage: LineageConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Replace `${VAR}` with the variable's value (empty when unset).
///
/// An unclosed `${` or an empty name is left as written.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find('}') {
            Some(0) => {
                out.push_str("${}");
                rest = &after[1..];
            }
            Some(close) => {
                out.push_str(&env::var(&after[..close]).unwrap_or_default());
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

impl TetherConfig {
    /// Parse `content` as read from `path`.
    pub fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        let mut config: TetherConfig =
            toml::from_str(content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        for server in config.lsp.servers.values_mut() {
            server.command = expand_env_vars(&server.command);
            for arg in &mut server.args {
                *arg = expand_env_vars(arg);
            }
        }
        Ok(config)
    }

    /// Load the file at `path`. A missing file yields `None`.
    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };
        match Self::parse(path, &content) {
            Ok(config) => Ok(Some(config)),
            Err(err) => {
                tracing::warn!("{err}");
                Err(err)
            }
        }
    }

    /// Load from `$TETHER_CONFIG`, else `~/.tether/config.toml`, else defaults.
    ///
    /// An explicitly named file must exist. The built-in server table fills in
    /// when no servers are configured.
    pub fn load() -> Result<Self, ConfigError> {
        let config = match env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
            Some(explicit) => {
                let path = PathBuf::from(explicit);
                match Self::load_from(&path)? {
                    Some(config) => config,
                    None => {
                        return Err(ConfigError::Read {
                            source: io::Error::new(
                                io::ErrorKind::NotFound,
                                format!("{CONFIG_ENV} names a missing file"),
                            ),
                            path,
                        });
                    }
                }
            }
            None => match config_path() {
                Some(path) => Self::load_from(&path)?.unwrap_or_default(),
                None => Self::default(),
            },
        };
        Ok(config.with_builtin_servers())
    }

    #[must_use]
    pub fn with_builtin_servers(mut self) -> Self {
        self.lsp = self.lsp.or_builtin_servers();
        self
    }
}

/// `~/.tether`, when a home directory is known.
#[must_use]
pub fn tether_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".tether"))
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    tether_dir().map(|dir| dir.join("config.toml"))
}

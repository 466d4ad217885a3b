//! Backend-independent symbol addressing.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocatorError {
    #[error("name path must not be empty")]
    EmptyNamePath,
    #[error("name path segment {index} is empty in {raw:?}")]
    EmptySegment { raw: String, index: usize },
    #[error("invalid symbol index in {raw:?}")]
    InvalidIndex { raw: String },
    #[error("relative path must not be empty")]
    EmptyPath,
    #[error("path must be relative to the project root: {}", path.display())]
    AbsolutePath { path: PathBuf },
    #[error("path escapes the project root: {}", path.display())]
    PathEscapes { path: PathBuf },
}

/// A symbol's name path, e.g. `Outer/inner` or `Outer.inner`.
///
/// A leading `/` makes the path absolute: it must match from a top-level
/// symbol. Otherwise it matches any symbol whose ancestry ends with these
/// segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamePath {
    segments: Vec<String>,
    absolute: bool,
}

impl NamePath {
    /// Parse a name path. `/` separates segments when present, otherwise `.`.
    pub fn parse(raw: &str) -> Result<Self, LocatorError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "/" {
            return Err(LocatorError::EmptyNamePath);
        }
        let (absolute, body) = match trimmed.strip_prefix('/') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let separator = if body.contains('/') { '/' } else { '.' };
        let mut segments = Vec::new();
        for (index, segment) in body.split(separator).enumerate() {
            let segment = segment.trim();
            if segment.is_empty() {
                return Err(LocatorError::EmptySegment {
                    raw: raw.to_string(),
                    index,
                });
            }
            segments.push(segment.to_string());
        }
        Ok(Self { segments, absolute })
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    #[must_use]
    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    /// Last segment: the symbol's own name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.segments.last().map_or("", String::as_str)
    }

    /// Whether a symbol with the given ancestry (outermost first, including
    /// the symbol itself) is addressed by this path.
    #[must_use]
    pub fn matches<S: AsRef<str>>(&self, ancestry: &[S]) -> bool {
        if ancestry.len() < self.segments.len() {
            return false;
        }
        if self.absolute && ancestry.len() != self.segments.len() {
            return false;
        }
        let offset = ancestry.len() - self.segments.len();
        ancestry[offset..]
            .iter()
            .zip(&self.segments)
            .all(|(have, want)| have.as_ref() == want)
    }

    /// Dotted form used in fully-qualified names.
    #[must_use]
    pub fn dotted(&self) -> String {
        self.segments.join(".")
    }
}

impl fmt::Display for NamePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.absolute {
            f.write_str("/")?;
        }
        f.write_str(&self.segments.join("/"))
    }
}

/// Addresses one symbol in one file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolLocator {
    relative_path: PathBuf,
    name_path: NamePath,
    index: Option<usize>,
}

impl SymbolLocator {
    /// Build a locator from tool arguments.
    ///
    /// A trailing `[n]` on the name path selects the n-th (0-based) of several
    /// symbols with the same path, e.g. `Overloaded/run[1]`.
    pub fn parse(relative_path: impl AsRef<Path>, name_path: &str) -> Result<Self, LocatorError> {
        let relative_path = validate_relative(relative_path.as_ref())?;
        let (path_part, index) = split_index(name_path)?;
        Ok(Self {
            relative_path,
            name_path: NamePath::parse(path_part)?,
            index,
        })
    }

    #[must_use]
    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    #[must_use]
    pub fn relative_path(&self) -> &Path {
        &self.relative_path
    }

    #[must_use]
    pub fn name_path(&self) -> &NamePath {
        &self.name_path
    }

    #[must_use]
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// `relative/path.rs:Outer.inner`, with `/` separators on every platform.
    #[must_use]
    pub fn fqn(&self) -> String {
        format!("{}:{}", self.display_path(), self.name_path.dotted())
    }

    #[must_use]
    pub fn display_path(&self) -> String {
        self.relative_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl fmt::Display for SymbolLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.display_path(), self.name_path)?;
        if let Some(index) = self.index {
            write!(f, "[{index}]")?;
        }
        Ok(())
    }
}

fn split_index(raw: &str) -> Result<(&str, Option<usize>), LocatorError> {
    let trimmed = raw.trim();
    let Some(without_bracket) = trimmed.strip_suffix(']') else {
        return Ok((trimmed, None));
    };
    let Some(open) = without_bracket.rfind('[') else {
        return Err(LocatorError::InvalidIndex {
            raw: raw.to_string(),
        });
    };
    let index = without_bracket[open + 1..]
        .trim()
        .parse::<usize>()
        .map_err(|_| LocatorError::InvalidIndex {
            raw: raw.to_string(),
        })?;
    Ok((&without_bracket[..open], Some(index)))
}

fn validate_relative(path: &Path) -> Result<PathBuf, LocatorError> {
    if path.as_os_str().is_empty() {
        return Err(LocatorError::EmptyPath);
    }
    if path.is_absolute() || path.has_root() {
        return Err(LocatorError::AbsolutePath {
            path: path.to_path_buf(),
        });
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(LocatorError::PathEscapes {
                    path: path.to_path_buf(),
                });
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(LocatorError::EmptyPath);
    }
    Ok(out)
}

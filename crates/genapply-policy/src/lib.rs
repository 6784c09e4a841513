use genapply_core::{AppConfig, ApplyConfig, ErrorClass};
use glob::{MatchOptions, Pattern};
use std::collections::BTreeSet;

mod command;

pub use command::CommandPolicy;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("empty path")]
    EmptyPath,
    #[error("path too long ({len} > {max})")]
    PathTooLong { len: usize, max: usize },
    #[error("path traversal")]
    PathTraversal,
    #[error("absolute path")]
    AbsolutePath,
    #[error("escapes project root")]
    EscapesRoot,
    #[error("protected file")]
    ProtectedFile,
    #[error("protected directory")]
    ProtectedDirectory,
    #[error("extension not allowed (.{extension})")]
    ExtensionNotAllowed { extension: String },
    #[error("command is not allowlisted")]
    CommandNotAllowed,
}

impl PolicyError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::PolicyViolation
    }
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Decides whether a project-relative path may be written.
///
/// Every check is lexical; nothing here touches the filesystem.
#[derive(Debug, Clone)]
pub struct PathPolicy {
    protected_files: Vec<Pattern>,
    protected_dirs: BTreeSet<String>,
    allowed_extensions: BTreeSet<String>,
}

impl PathPolicy {
    pub fn new(cfg: &genapply_core::PolicyConfig) -> Self {
        Self {
            protected_files: cfg
                .protected_files
                .iter()
                .filter_map(|raw| Pattern::new(raw).ok())
                .collect(),
            protected_dirs: cfg.protected_dirs.iter().cloned().collect(),
            allowed_extensions: cfg
                .allowed_extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_app_config(cfg: &AppConfig) -> Self {
        Self::new(&cfg.policy)
    }

    /// Returns the canonical project-relative form of `path` or the first
    /// rule it breaks. Rules run in a fixed order and short-circuit.
    pub fn classify(&self, path: &str) -> Result<String, PolicyError> {
        if path.trim().is_empty() {
            return Err(PolicyError::EmptyPath);
        }
        if has_parent_segment(path) {
            return Err(PolicyError::PathTraversal);
        }
        if is_absolute(path) {
            return Err(PolicyError::AbsolutePath);
        }
        let resolved = resolve_relative(path)?;
        let Some((file_name, dirs)) = resolved.split_last() else {
            return Err(PolicyError::EmptyPath);
        };

        if self
            .protected_files
            .iter()
            .any(|pattern| pattern.matches_with(file_name, MATCH_OPTIONS))
        {
            return Err(PolicyError::ProtectedFile);
        }
        if dirs
            .iter()
            .chain(std::iter::once(file_name))
            .any(|segment| self.protected_dirs.contains(*segment))
        {
            return Err(PolicyError::ProtectedDirectory);
        }
        if let Some(extension) = extension_of(file_name)
            && !self
                .allowed_extensions
                .contains(&extension.to_ascii_lowercase())
        {
            return Err(PolicyError::ExtensionNotAllowed {
                extension: extension.to_string(),
            });
        }

        Ok(resolved.join("/"))
    }
}

impl Default for PathPolicy {
    fn default() -> Self {
        Self::new(&genapply_core::PolicyConfig::default())
    }
}

/// Schema-level gate run over a whole batch before any file is processed.
/// Narrower than [`PathPolicy::classify`]: shape only, no project rules.
pub fn structural_check(path: &str, max_len: usize) -> Result<(), PolicyError> {
    if path.trim().is_empty() {
        return Err(PolicyError::EmptyPath);
    }
    let len = path.chars().count();
    if len > max_len {
        return Err(PolicyError::PathTooLong { len, max: max_len });
    }
    if has_parent_segment(path) {
        return Err(PolicyError::PathTraversal);
    }
    if is_absolute(path) {
        return Err(PolicyError::AbsolutePath);
    }
    Ok(())
}

/// Rewrites generated paths into project-relative form and places paths
/// that name neither a conventional top-level directory nor a root config
/// file under the default source directory.
#[derive(Debug, Clone)]
pub struct PathNormalizer {
    default_source_dir: String,
    root_dirs: BTreeSet<String>,
    root_files: BTreeSet<String>,
}

impl PathNormalizer {
    pub fn new(cfg: &ApplyConfig) -> Self {
        Self {
            default_source_dir: cfg.default_source_dir.trim_matches('/').to_string(),
            root_dirs: cfg
                .root_dirs
                .iter()
                .map(|dir| dir.trim_matches('/').to_string())
                .collect(),
            root_files: cfg.root_files.iter().cloned().collect(),
        }
    }

    pub fn normalize(&self, raw: &str) -> String {
        let unified = raw.trim().replace('\\', "/");
        if has_drive_prefix(&unified) {
            return unified;
        }
        let mut rest = unified.as_str();
        loop {
            if let Some(stripped) = rest.strip_prefix("./") {
                rest = stripped;
            } else if let Some(stripped) = rest.strip_prefix('/') {
                rest = stripped;
            } else {
                break;
            }
        }

        if rest.is_empty() || self.default_source_dir.is_empty() {
            return rest.to_string();
        }
        let first = rest.split('/').next().unwrap_or_default();
        let under_root_dir = rest.contains('/') && self.root_dirs.contains(first);
        if under_root_dir || first == self.default_source_dir || self.root_files.contains(rest) {
            return rest.to_string();
        }
        format!("{}/{}", self.default_source_dir, rest)
    }
}

impl Default for PathNormalizer {
    fn default() -> Self {
        Self::new(&ApplyConfig::default())
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(['/', '\\'])
}

fn has_parent_segment(path: &str) -> bool {
    segments(path).any(|segment| segment == "..")
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn is_absolute(path: &str) -> bool {
    path.starts_with('/') || path.starts_with('\\') || has_drive_prefix(path)
}

/// Folds the path against a virtual project root. Any segment that would
/// climb out of it is reported as an escape.
fn resolve_relative(path: &str) -> Result<Vec<&str>, PolicyError> {
    let mut resolved = Vec::new();
    for segment in segments(path) {
        match segment {
            "" | "." => {}
            ".." => {
                if resolved.pop().is_none() {
                    return Err(PolicyError::EscapesRoot);
                }
            }
            other if other.contains(':') => return Err(PolicyError::EscapesRoot),
            other => resolved.push(other),
        }
    }
    Ok(resolved)
}

/// Dotfiles such as `.prettierrc` have no extension.
fn extension_of(file_name: &str) -> Option<&str> {
    let (stem, extension) = file_name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    Some(extension)
}

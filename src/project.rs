//! Project root handling.
//!
//! Every file the core touches is addressed relative to one project root.
//! [`ProjectRoot`] turns model-supplied path spellings into normalized
//! root-relative paths (for manifests and checkpoints) and into canonical
//! absolute paths (for scheduler resource keys).

use std::path::{Component, Path, PathBuf};

use ignore::WalkBuilder;

use crate::error::StoreError;

/// Name of the per-project state directory holding patch sets and checkpoints.
pub const DEFAULT_STATE_DIR: &str = ".patchloop";

/// Extra ignore file honored by project walks, in `.gitignore` syntax.
pub const IGNORE_FILE_NAME: &str = ".patchloopignore";

/// A project root plus the location of its state directory.
#[derive(Debug, Clone)]
pub struct ProjectRoot {
    root: PathBuf,
    /// Canonical form of `root` when it exists on disk, otherwise `root`.
    canonical_root: PathBuf,
    state_dir_name: String,
}

impl ProjectRoot {
    /// Create a project root using the default state directory name.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_state_dir(root, DEFAULT_STATE_DIR)
    }

    pub fn with_state_dir(root: impl Into<PathBuf>, state_dir_name: impl Into<String>) -> Self {
        let root = root.into();
        let canonical_root = std::fs::canonicalize(&root).unwrap_or_else(|_| root.clone());
        Self {
            root,
            canonical_root,
            state_dir_name: state_dir_name.into(),
        }
    }

    /// The root path as supplied by the caller.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding all persisted state for this project.
    pub fn state_dir(&self) -> PathBuf {
        self.canonical_root.join(&self.state_dir_name)
    }

    /// Canonical form of the root, used for every on-disk path.
    pub fn canonical(&self) -> &Path {
        &self.canonical_root
    }

    pub fn state_dir_name(&self) -> &str {
        &self.state_dir_name
    }

    /// Absolute path for a normalized relative path.
    pub fn absolute(&self, relative: &str) -> PathBuf {
        self.canonical_root.join(relative)
    }

    /// Normalize a user or model supplied path into a root-relative path.
    ///
    /// Accepts relative paths and absolute paths under the root. The result
    /// uses `/` separators, has no `.` or `..` components and no leading `/`.
    pub fn relative(&self, input: &str) -> Result<String, StoreError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid_path(input, "path is empty"));
        }

        let path = Path::new(trimmed);
        let relative_part: PathBuf = if path.is_absolute() {
            let normalized = lexical_normalize(path)
                .ok_or_else(|| invalid_path(input, "path escapes the filesystem root"))?;
            self.strip_root(&normalized)
                .ok_or_else(|| invalid_path(input, "path is outside the project root"))?
        } else {
            path.to_path_buf()
        };

        let mut parts: Vec<String> = Vec::new();
        for component in relative_part.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::CurDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(invalid_path(input, "path escapes the project root"));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid_path(input, "unexpected root component"));
                }
            }
        }

        if parts.is_empty() {
            return Err(invalid_path(input, "path refers to the project root itself"));
        }
        if parts[0] == self.state_dir_name {
            return Err(invalid_path(
                input,
                "path is inside the patch and checkpoint state directory",
            ));
        }

        let relative = parts.join("/");
        self.contained(&relative)?;
        Ok(relative)
    }

    /// Absolute path for a normalized relative path, after checking that
    /// symlinks on the way do not lead outside the root or into the state
    /// directory. The check is skipped while the root does not exist.
    pub fn contained(&self, relative: &str) -> Result<PathBuf, StoreError> {
        let absolute = self.absolute(relative);
        if !self.canonical_root.is_dir() {
            return Ok(absolute);
        }

        let dangling = std::fs::symlink_metadata(&absolute)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false)
            && std::fs::canonicalize(&absolute).is_err();
        if dangling {
            return Err(invalid_path(relative, "path is a dangling symlink"));
        }

        let resolved = resolve_existing_prefix(&absolute);
        let Ok(rest) = resolved.strip_prefix(&self.canonical_root) else {
            return Err(invalid_path(
                relative,
                "path resolves outside the project root through a symlink",
            ));
        };
        match rest.components().next() {
            None => Err(invalid_path(relative, "path resolves to the project root itself")),
            Some(first) if first.as_os_str() == self.state_dir_name.as_str() => Err(invalid_path(
                relative,
                "path resolves into the patch and checkpoint state directory",
            )),
            Some(_) => Ok(absolute),
        }
    }

    /// Canonical absolute key for a path spelling.
    ///
    /// Relative inputs are joined onto the root; the result is normalized
    /// lexically and then the longest existing ancestor is resolved through
    /// the filesystem so symlinked spellings collide. Returns `None` for
    /// empty input.
    pub fn resource_key(&self, input: &str) -> Option<PathBuf> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return None;
        }
        let path = Path::new(trimmed);
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.canonical_root.join(path)
        };
        let normalized = lexical_normalize(&joined)?;
        Some(resolve_existing_prefix(&normalized))
    }

    /// Relative display form of an absolute path under the root.
    pub fn display_relative(&self, path: &Path) -> String {
        self.strip_root(path)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_else(|| path.to_string_lossy().into_owned())
    }

    /// Gitignore-aware walker starting at `start`, never entering the state
    /// directory or following symlinks.
    pub fn walker(&self, start: &Path, max_depth: Option<usize>) -> WalkBuilder {
        let mut builder = WalkBuilder::new(start);
        builder.standard_filters(true);
        builder.git_ignore(true);
        builder.git_global(true);
        builder.git_exclude(true);
        builder.require_git(false);
        builder.follow_links(false);
        builder.add_custom_ignore_filename(IGNORE_FILE_NAME);
        builder.max_depth(max_depth);

        let state_dir_name = self.state_dir_name.clone();
        builder.filter_entry(move |entry| {
            entry.file_name() != state_dir_name.as_str() && entry.file_name() != ".git"
        });
        builder
    }

    fn strip_root(&self, path: &Path) -> Option<PathBuf> {
        if let Ok(rest) = path.strip_prefix(&self.canonical_root) {
            return Some(rest.to_path_buf());
        }
        if let Ok(rest) = path.strip_prefix(&self.root) {
            return Some(rest.to_path_buf());
        }
        // The input may spell the root through a symlink (e.g. /tmp vs /private/tmp).
        let resolved = resolve_existing_prefix(path);
        resolved
            .strip_prefix(&self.canonical_root)
            .ok()
            .map(Path::to_path_buf)
    }
}

fn invalid_path(input: &str, reason: &str) -> StoreError {
    StoreError::InvalidPath {
        path: input.to_string(),
        reason: reason.to_string(),
    }
}

/// Resolve `.` and `..` without touching the filesystem.
///
/// Returns `None` when `..` would climb above the first component.
pub(crate) fn lexical_normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
        }
    }
    Some(out)
}

/// Canonicalize the longest existing ancestor of `path` and re-append the rest.
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut remainder: Vec<std::ffi::OsString> = Vec::new();

    loop {
        if let Ok(canonical) = std::fs::canonicalize(&existing) {
            let mut resolved = canonical;
            for part in remainder.iter().rev() {
                resolved.push(part);
            }
            return resolved;
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                remainder.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

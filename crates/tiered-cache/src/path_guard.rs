//! Lexical validation of cache keys against the cache root.
//!
//! Every filesystem operation in this crate takes a [`ResolvedPath`], and the
//! only way to obtain one is through [`PathGuard`]. Validation never touches
//! the filesystem, so keys that escape the root are refused even when nothing
//! exists at the escaped location.

use crate::error::{CacheError, InvalidPathReason};
use crate::util::is_temp_file_name;
use std::path::{Component, Path, PathBuf};

/// File name of the persisted access-time index, directly under the cache root.
pub const ACCESS_TIME_INDEX_FILENAME: &str = "access_time.bin";

/// A cache key that has been proven to resolve strictly inside the cache root.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResolvedPath {
    key: PathBuf,
    path: PathBuf,
}

impl ResolvedPath {
    /// The normalized key, relative to the cache root.
    pub fn key(&self) -> &Path {
        &self.key
    }

    /// The absolute (root-joined) location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `/`-separated form of the key used by the access-time index.
    pub fn index_key(&self) -> String {
        index_key_for(&self.key)
    }

    /// Directories between the entry and the root, deepest first. Never
    /// includes the root itself.
    pub(crate) fn ancestor_dirs<'a>(&'a self, root: &'a Path) -> impl Iterator<Item = PathBuf> + 'a {
        self.key
            .ancestors()
            .skip(1)
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(move |dir| root.join(dir))
    }
}

#[derive(Clone, Debug)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validates a key supplied by an external caller.
    ///
    /// Rejects absolute keys, keys whose `.`/`..` normalization leaves the
    /// root (or lands on it), staging-file names, and the index file name.
    pub fn validate(&self, key: impl AsRef<Path>) -> Result<ResolvedPath, CacheError> {
        let key = key.as_ref();
        let normalized = normalize_key(key)?;

        let file_name = normalized
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default();
        if is_temp_file_name(&file_name) {
            return Err(CacheError::invalid_path(
                key,
                InvalidPathReason::ReservedTempName,
            ));
        }
        if normalized.as_os_str() == ACCESS_TIME_INDEX_FILENAME {
            return Err(CacheError::invalid_path(
                key,
                InvalidPathReason::ReservedIndexName,
            ));
        }

        Ok(self.resolve_normalized(normalized))
    }

    /// Validates a path discovered while scanning the cache tree.
    ///
    /// Unlike [`Self::validate`], staging files are accepted so internal
    /// cleanup can remove them.
    pub(crate) fn validate_scanned(&self, path: &Path) -> Result<ResolvedPath, CacheError> {
        // Lexical check only; do not follow symlinks.
        let relative = path.strip_prefix(&self.root).map_err(|_| {
            CacheError::invalid_path(path, InvalidPathReason::OutsideCacheDir)
        })?;
        let normalized = normalize_key(relative)?;
        Ok(self.resolve_normalized(normalized))
    }

    pub(crate) fn index_path(&self) -> PathBuf {
        self.root.join(ACCESS_TIME_INDEX_FILENAME)
    }

    fn resolve_normalized(&self, key: PathBuf) -> ResolvedPath {
        let path = self.root.join(&key);
        ResolvedPath { key, path }
    }
}

/// Collapses `.` and `..` segments without consulting the filesystem.
fn normalize_key(key: &Path) -> Result<PathBuf, CacheError> {
    let mut normalized = PathBuf::new();
    for component in key.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(CacheError::invalid_path(
                    key,
                    InvalidPathReason::OutsideCacheDir,
                ));
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(CacheError::invalid_path(
                        key,
                        InvalidPathReason::OutsideCacheDir,
                    ));
                }
            }
            Component::Normal(segment) => normalized.push(segment),
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(CacheError::invalid_path(key, InvalidPathReason::Empty));
    }
    Ok(normalized)
}

pub(crate) fn index_key_for(relative: &Path) -> String {
    let mut out = String::new();
    for component in relative.components() {
        if let Component::Normal(segment) = component {
            if !out.is_empty() {
                out.push('/');
            }
            out.push_str(&segment.to_string_lossy());
        }
    }
    out
}

use std::fmt;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Why a cache key was refused by [`crate::PathGuard`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidPathReason {
    /// The key is absolute or climbs above the cache root via `..`.
    OutsideCacheDir,
    /// The final segment uses the staging-file naming convention.
    ReservedTempName,
    /// The key names the persisted access-time index.
    ReservedIndexName,
    /// The key normalizes to nothing (the cache root itself).
    Empty,
}

impl fmt::Display for InvalidPathReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::OutsideCacheDir => "outside of cache_dir",
            Self::ReservedTempName => "reserved temp name",
            Self::ReservedIndexName => "reserved index name",
            Self::Empty => "empty key",
        };
        f.write_str(text)
    }
}

/// Errors produced by the cache engine.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("invalid cache key {}, which is {reason}", key.display())]
    InvalidPath {
        key: PathBuf,
        reason: InvalidPathReason,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("invalid cache config: {message}")]
    Config { message: String },

    #[error("failed to read cache config {path}: {source}")]
    ConfigIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse toml config: {0}")]
    Toml(String),

    #[error("cache task failed: {message}")]
    Runtime { message: String },
}

impl CacheError {
    pub(crate) fn invalid_path(key: impl Into<PathBuf>, reason: InvalidPathReason) -> Self {
        Self::InvalidPath {
            key: key.into(),
            reason,
        }
    }

    /// Returns `true` for key validation failures.
    ///
    /// These are caller bugs, never transient, and must not be retried.
    pub fn is_invalid_path(&self) -> bool {
        matches!(self, Self::InvalidPath { .. })
    }

    /// Returns the validation reason when this is an [`CacheError::InvalidPath`].
    pub fn invalid_path_reason(&self) -> Option<InvalidPathReason> {
        match self {
            Self::InvalidPath { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for CacheError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` carries a source snippet; keep only the message.
        Self::Toml(err.message().to_owned())
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Runtime {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_path_message_names_key_and_reason() {
        let err = CacheError::invalid_path(
            "../test_cache_dir_put/file.txt",
            InvalidPathReason::OutsideCacheDir,
        );
        let message = err.to_string();
        assert!(
            message.contains("test_cache_dir_put/file.txt, which is outside of cache_dir"),
            "unexpected message: {message}"
        );
        assert!(err.is_invalid_path());
        assert_eq!(
            err.invalid_path_reason(),
            Some(InvalidPathReason::OutsideCacheDir)
        );
    }

    #[test]
    fn io_errors_are_not_invalid_path() {
        let err = CacheError::from(std::io::Error::other("disk full"));
        assert!(!err.is_invalid_path());
        assert_eq!(err.invalid_path_reason(), None);
    }

    #[test]
    fn toml_errors_do_not_echo_input() {
        let err = toml::from_str::<toml::Value>("secret = \"abc").unwrap_err();
        let message = CacheError::from(err).to_string();
        assert!(message.starts_with("failed to parse toml config"));
        assert!(!message.contains("secret = "), "{message}");
    }
}

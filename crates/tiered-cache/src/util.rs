use crate::error::CacheError;
use crate::LOG_TARGET;
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tokio::io::{AsyncRead, AsyncWriteExt};

/// Suffix of every staging file created by [`atomic_write_stream`].
pub const TEMP_FILE_SUFFIX: &str = ".part";

/// Hard upper bound for the persisted access-time index.
///
/// A corrupted length prefix should degrade to an empty index, not an
/// out-of-memory crash.
pub const BINCODE_PAYLOAD_LIMIT_BYTES: usize = 256 * 1024 * 1024;

/// Attempts at creating the staging file when a concurrent prune removes its
/// parent directory between `create_dir_all` and `open`.
const MAX_CREATE_ATTEMPTS: usize = 8;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Returns `true` when `file_name` follows the staging-file naming convention.
pub fn is_temp_file_name(file_name: &str) -> bool {
    file_name.ends_with(TEMP_FILE_SUFFIX)
}

pub(crate) fn bincode_options() -> impl bincode::Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

pub(crate) fn bincode_serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, CacheError> {
    Ok(bincode_options().serialize(value)?)
}

pub(crate) fn bincode_deserialize<T: for<'de> Deserialize<'de>>(
    bytes: &[u8],
) -> Result<T, CacheError> {
    Ok(bincode_options()
        .with_limit(BINCODE_PAYLOAD_LIMIT_BYTES as u64)
        .deserialize(bytes)?)
}

/// Streams `reader` into a uniquely named sibling of `dest`, then renames it
/// over `dest`.
///
/// Readers of `dest` observe either the previous complete file or the new
/// complete file. On failure the staging file is removed and `dest` is left
/// untouched. `before_publish` runs after the payload is durable and
/// immediately before the rename.
pub(crate) async fn atomic_write_stream<R>(
    dest: &Path,
    reader: &mut R,
    before_publish: impl FnOnce(),
) -> Result<u64, CacheError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let parent = parent_dir(dest)?;
    let (tmp_path, mut file) = open_unique_tmp_file(dest, parent).await?;
    // Removes the staging file on error and when this future is dropped
    // before the rename (e.g. a caller-side timeout).
    let mut staging = StagingFile::new(tmp_path);

    let copied = tokio::io::copy(reader, &mut file).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    before_publish();
    tokio::fs::rename(staging.path(), dest).await?;
    staging.disarm();

    sync_dir_best_effort(parent, "atomic_write_stream.sync_parent_dir").await;
    Ok(copied)
}

/// Owns a staging file until it has been renamed into place.
struct StagingFile {
    path: PathBuf,
    armed: bool,
}

impl StagingFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => tracing::debug!(
                target: LOG_TARGET,
                path = %self.path.display(),
                error = %err,
                "failed to remove staging file"
            ),
        }
    }
}

pub(crate) async fn atomic_write(dest: &Path, bytes: &[u8]) -> Result<u64, CacheError> {
    let mut reader = bytes;
    atomic_write_stream(dest, &mut reader, || {}).await
}

fn parent_dir(path: &Path) -> Result<&Path, CacheError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(parent),
        Some(_) => Ok(Path::new(".")),
        None => Err(io::Error::other("path has no parent").into()),
    }
}

async fn open_unique_tmp_file(
    dest: &Path,
    parent: &Path,
) -> io::Result<(PathBuf, tokio::fs::File)> {
    let file_name = dest
        .file_name()
        .ok_or_else(|| io::Error::other("destination path has no file name"))?;
    let pid = std::process::id();

    let mut attempts = 0usize;
    loop {
        tokio::fs::create_dir_all(parent).await?;

        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut tmp_name = OsString::from(file_name);
        tmp_name.push(format!(".{pid}.{counter}{TEMP_FILE_SUFFIX}"));
        let tmp_path = parent.join(tmp_name);

        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .await
        {
            Ok(file) => return Ok((tmp_path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // The parent was pruned by a concurrent invalidation.
                attempts += 1;
                if attempts >= MAX_CREATE_ATTEMPTS {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Removes `path`, treating an already-missing file as success.
pub(crate) async fn remove_file_best_effort(path: &Path, reason: &'static str) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            tracing::debug!(
                target: LOG_TARGET,
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove cache file"
            );
            false
        }
    }
}

#[track_caller]
fn report_sync_dir_error(dir: &Path, reason: &'static str, err: &io::Error) {
    static SYNC_DIR_ERROR_LOGGED: OnceLock<()> = OnceLock::new();
    if SYNC_DIR_ERROR_LOGGED.set(()).is_ok() {
        let loc = std::panic::Location::caller();
        tracing::debug!(
            target: LOG_TARGET,
            dir = %dir.display(),
            reason,
            file = loc.file(),
            line = loc.line(),
            error = %err,
            "failed to sync directory (best effort)"
        );
    }
}

async fn sync_dir_best_effort(dir: &Path, reason: &'static str) {
    if !cfg!(unix) {
        return;
    }

    let result = match tokio::fs::File::open(dir).await {
        Ok(dir) => dir.sync_all().await,
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => report_sync_dir_error(dir, reason, &err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leftover_temp_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| is_temp_file_name(name))
            .collect()
    }

    #[test]
    fn temp_file_names_are_recognized() {
        assert!(is_temp_file_name("segment.log.1234.7.part"));
        assert!(is_temp_file_name(".part"));
        assert!(!is_temp_file_name("segment.log"));
        assert!(!is_temp_file_name("segment.part.log"));
    }

    #[tokio::test]
    async fn atomic_write_creates_parents_and_replaces_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("a").join("b").join("file.bin");

        atomic_write(&dest, b"first").await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"first");

        let written = atomic_write(&dest, b"second!").await.unwrap();
        assert_eq!(written, 7);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"second!");
        assert!(leftover_temp_files(dest.parent().unwrap()).is_empty());
    }

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Err(io::Error::other("upstream reset")))
        }
    }

    #[tokio::test]
    async fn failed_write_leaves_destination_and_no_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("file.bin");
        atomic_write(&dest, b"original").await.unwrap();

        let mut published = false;
        let err = atomic_write_stream(&dest, &mut FailingReader, || published = true)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Io(_)), "unexpected error: {err:?}");
        assert!(!published);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"original");
        assert!(leftover_temp_files(tmp.path()).is_empty());
    }

    /// Yields one chunk, then never makes progress again.
    struct StallingReader {
        sent: bool,
    }

    impl AsyncRead for StallingReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            if self.sent {
                return std::task::Poll::Pending;
            }
            self.sent = true;
            let n = buf.remaining().min(4096);
            buf.put_slice(&vec![1u8; n]);
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn dropped_write_removes_staging_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("file.bin");
        atomic_write(&dest, b"original").await.unwrap();

        let mut reader = StallingReader { sent: false };
        let mut published = false;
        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            atomic_write_stream(&dest, &mut reader, || published = true),
        )
        .await;
        assert!(timed_out.is_err());
        assert!(!published);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"original");
        assert!(leftover_temp_files(tmp.path()).is_empty());
    }

    #[test]
    fn huge_length_prefix_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        let decoded = bincode_deserialize::<Vec<u8>>(&bytes);
        assert!(decoded.is_err());
    }
}

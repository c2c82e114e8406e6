//! Cursor persistence + retry policy for Héra backfills.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use hera_core::CursorRecord;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "hera-storage";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("cursor i/o on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding cursor: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Load/save/clear contract for a backfill's resume cursor.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// `Ok(None)` means start fresh.
    async fn load(&self) -> Result<Option<CursorRecord>, CheckpointError>;
    async fn save(&self, record: &CursorRecord) -> Result<(), CheckpointError>;
    /// Clearing an absent cursor is not an error.
    async fn clear(&self) -> Result<(), CheckpointError>;
}

/// One JSON cursor file per backfill, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_backfill(cursor_dir: impl AsRef<Path>, backfill: &str) -> Self {
        Self::new(cursor_dir.as_ref().join(format!("{backfill}.cursor.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent_dir(&self) -> &Path {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> CheckpointError {
    CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<CursorRecord>, CheckpointError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&self.path, err)),
        };

        match serde_json::from_str(&text) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "cursor file is unreadable; starting from the beginning"
                );
                Ok(None)
            }
        }
    }

    /// Write to a temp file beside the cursor, then rename over it.
    async fn save(&self, record: &CursorRecord) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec_pretty(record)?;
        let dir = self.parent_dir();
        fs::create_dir_all(dir)
            .await
            .map_err(|err| io_error(dir, err))?;

        let temp_path = dir.join(format!(".{}.cursor.tmp", Uuid::new_v4()));
        let written = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;

        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_error(&temp_path, err));
        }

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_error(&self.path, err));
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), CheckpointError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&self.path, err)),
        }
    }
}

/// In-process cursor, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    record: Mutex<Option<CursorRecord>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: CursorRecord) -> Self {
        Self {
            record: Mutex::new(Some(record)),
        }
    }

    pub async fn snapshot(&self) -> Option<CursorRecord> {
        self.record.lock().await.clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<Option<CursorRecord>, CheckpointError> {
        Ok(self.record.lock().await.clone())
    }

    async fn save(&self, record: &CursorRecord) -> Result<(), CheckpointError> {
        *self.record.lock().await = Some(record.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), CheckpointError> {
        *self.record.lock().await = None;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Errors that know whether repeating the call could succeed.
pub trait Classify {
    fn disposition(&self) -> RetryDisposition;
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl BackoffPolicy {
    /// Fail on the first error; re-running the process is the retry.
    pub fn none() -> Self {
        Self::with_retries(0)
    }

    pub fn with_retries(max_retries: usize) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Run `call`, repeating it while it fails with a retryable error and the policy allows.
pub async fn with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, E>
where
    E: Classify + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0usize;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err)
                if err.disposition() == RetryDisposition::Retryable
                    && attempt < policy.max_retries =>
            {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying store call"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn record(last_key: &str, round: u64) -> CursorRecord {
        CursorRecord {
            last_key: last_key.to_string(),
            round,
            total_updated: round * 10,
            total_skipped: round,
            last_updated_at: DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
        }
    }

    #[tokio::test]
    async fn file_store_round_trips_and_clears() {
        let dir = tempdir().expect("tempdir");
        let store = FileCheckpointStore::for_backfill(dir.path().join("state"), "locations");

        assert_eq!(store.load().await.expect("load empty"), None);

        store.save(&record("job-0500", 1)).await.expect("save");
        store.save(&record("job-1000", 2)).await.expect("save again");
        assert_eq!(
            store.load().await.expect("load"),
            Some(record("job-1000", 2))
        );

        let leftovers = std::fs::read_dir(dir.path().join("state"))
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);

        store.clear().await.expect("clear");
        assert!(!store.path().exists());
        store.clear().await.expect("clear twice");
    }

    #[tokio::test]
    async fn corrupt_cursor_file_reads_as_fresh_start() {
        let dir = tempdir().expect("tempdir");
        let store = FileCheckpointStore::for_backfill(dir.path(), "locations");
        std::fs::write(store.path(), b"{\"lastKey\": \"job-").expect("write partial");

        assert_eq!(store.load().await.expect("load"), None);
    }

    #[tokio::test]
    async fn non_missing_io_errors_are_reported() {
        let dir = tempdir().expect("tempdir");
        // A directory where the cursor file should be cannot be read as text.
        let store = FileCheckpointStore::new(dir.path());
        let err = store.load().await.expect_err("directory is not a cursor");
        assert!(matches!(err, CheckpointError::Io { .. }));
    }

    #[tokio::test]
    async fn memory_store_tracks_latest_record() {
        let store = MemoryCheckpointStore::new();
        store.save(&record("b", 2)).await.expect("save");
        assert_eq!(store.snapshot().await, Some(record("b", 2)));
        store.clear().await.expect("clear");
        assert_eq!(store.load().await.expect("load"), None);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[derive(Debug)]
    struct Flaky(RetryDisposition);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky: {:?}", self.0)
        }
    }

    impl Classify for Flaky {
        fn disposition(&self) -> RetryDisposition {
            self.0
        }
    }

    fn fast_policy(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn retryable_errors_are_repeated_until_success() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = with_backoff(&fast_policy(3), "find", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Flaky(RetryDisposition::Retryable))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.expect("eventually ok"), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn default_policy_and_fatal_errors_fail_fast() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), _> = with_backoff(&BackoffPolicy::default(), "find", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Flaky(RetryDisposition::Retryable))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let result: Result<(), _> = with_backoff(&fast_policy(3), "write", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Flaky(RetryDisposition::NonRetryable))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::error::{UploadError, UploadResult};

const META_FILE: &str = "meta.json";

/// Persisted state of one chunked upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadSession {
    pub filename: String,
    pub total_chunks: u32,
    pub received: BTreeSet<u32>,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl UploadSession {
    pub fn is_complete(&self) -> bool {
        self.received.len() == self.total_chunks as usize
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        let ratio = self.received.len() as f64 / self.total_chunks as f64;
        (ratio * 1000.0).round() / 10.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ChunkReceipt {
    pub received: usize,
    pub total: u32,
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AssembledUpload {
    pub path: PathBuf,
    pub filename: String,
    /// Hex SHA-256 of the assembled bytes.
    pub hash: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UploadStatus {
    pub upload_id: String,
    pub filename: String,
    pub received: usize,
    pub total: u32,
    pub percent_complete: f64,
    pub complete: bool,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    /// Seconds since the last chunk arrived.
    pub age_seconds: i64,
    /// Seconds since the first chunk arrived.
    pub elapsed_seconds: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CleanupOutcome {
    Deleted,
    Kept,
    Failed,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CleanupEntry {
    pub upload_id: String,
    pub outcome: CleanupOutcome,
    pub age_seconds: Option<i64>,
    /// Set when the age came from the directory rather than the metadata.
    pub metadata_unreadable: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub results: Vec<CleanupEntry>,
    /// Assembled files removed because no episode claimed them.
    pub assembled_removed: usize,
}

impl CleanupReport {
    fn record(&mut self, entry: CleanupEntry) {
        match entry.outcome {
            CleanupOutcome::Deleted => self.deleted += 1,
            CleanupOutcome::Kept => self.skipped += 1,
            CleanupOutcome::Failed => self.failed += 1,
        }
        self.results.push(entry);
    }
}

/// Disk-backed store of in-flight chunked uploads.
///
/// Each session lives in `<uploads>/sessions/<id>/` holding `meta.json` and
/// one `chunk_NNNNNN` file per received index.
#[derive(Debug)]
pub struct UploadStore {
    sessions_dir: PathBuf,
    assembled_dir: PathBuf,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UploadStore {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(uploads_dir: P, assembled_dir: Q) -> Self {
        Self {
            sessions_dir: uploads_dir.into().join("sessions"),
            assembled_dir: assembled_dir.into(),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn assembled_dir(&self) -> &Path {
        &self.assembled_dir
    }

    pub async fn put_chunk(
        &self,
        upload_id: &str,
        chunk_index: u32,
        total_chunks: u32,
        filename: &str,
        bytes: &[u8],
    ) -> UploadResult<ChunkReceipt> {
        validate_upload_id(upload_id)?;
        if chunk_index >= total_chunks {
            return Err(UploadError::InvalidChunkIndex {
                index: chunk_index,
                total: total_chunks,
            });
        }
        let _guard = self.lock_session(upload_id).await;
        let dir = self.session_dir(upload_id);
        fs::create_dir_all(&dir).await.map_err(io_error(&dir))?;

        let now = Utc::now();
        let mut session = match self.read_session(upload_id).await {
            Ok(session) => session,
            Err(UploadError::NotFound { .. }) => UploadSession {
                filename: safe_filename(filename),
                total_chunks,
                received: BTreeSet::new(),
                created_at: now,
                last_update: now,
            },
            Err(err) => return Err(err),
        };
        if session.total_chunks != total_chunks {
            return Err(UploadError::TotalMismatch {
                upload_id: upload_id.to_string(),
                expected: session.total_chunks,
                declared: total_chunks,
            });
        }

        let chunk_path = dir.join(chunk_file_name(chunk_index));
        write_atomic(&chunk_path, bytes).await?;
        session.received.insert(chunk_index);
        session.last_update = now;
        self.write_session(upload_id, &session).await?;

        debug!(
            upload = upload_id,
            chunk = chunk_index,
            received = session.received.len(),
            total = total_chunks,
            "stored upload chunk"
        );
        Ok(ChunkReceipt {
            received: session.received.len(),
            total: total_chunks,
            complete: session.is_complete(),
        })
    }

    /// Concatenates all chunks in index order and drops the session.
    pub async fn assemble(&self, upload_id: &str) -> UploadResult<AssembledUpload> {
        validate_upload_id(upload_id)?;
        let guard = self.lock_session(upload_id).await;
        let session = self.read_session(upload_id).await?;
        if !session.is_complete() {
            return Err(UploadError::Incomplete {
                upload_id: upload_id.to_string(),
                received: session.received.len(),
                total: session.total_chunks,
            });
        }
        let dir = self.session_dir(upload_id);
        for index in 0..session.total_chunks {
            if fs::metadata(dir.join(chunk_file_name(index))).await.is_err() {
                return Err(UploadError::MissingChunk {
                    upload_id: upload_id.to_string(),
                    index,
                });
            }
        }

        fs::create_dir_all(&self.assembled_dir)
            .await
            .map_err(io_error(&self.assembled_dir))?;
        let output = self
            .assembled_dir
            .join(format!("{upload_id}_{}", session.filename));
        let (hash, size_bytes) = match concat_chunks(&dir, session.total_chunks, &output).await {
            Ok(summary) => summary,
            Err(err) => {
                let _ = fs::remove_file(&output).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::remove_dir_all(&dir).await {
            warn!(upload = upload_id, error = %err, "failed to remove assembled session");
        }
        self.release_session(upload_id, guard);
        info!(
            upload = upload_id,
            file = %output.display(),
            size = size_bytes,
            "assembled upload"
        );
        Ok(AssembledUpload {
            path: output,
            filename: session.filename,
            hash,
            size_bytes,
        })
    }

    pub async fn status(&self, upload_id: &str) -> UploadResult<UploadStatus> {
        validate_upload_id(upload_id)?;
        let session = self.read_session(upload_id).await?;
        let now = Utc::now();
        Ok(UploadStatus {
            upload_id: upload_id.to_string(),
            filename: session.filename.clone(),
            received: session.received.len(),
            total: session.total_chunks,
            percent_complete: session.percent_complete(),
            complete: session.is_complete(),
            created_at: session.created_at,
            last_update: session.last_update,
            age_seconds: (now - session.last_update).num_seconds().max(0),
            elapsed_seconds: (now - session.created_at).num_seconds().max(0),
        })
    }

    pub async fn cleanup(&self, ttl: Duration) -> UploadResult<CleanupReport> {
        self.cleanup_at(Utc::now(), ttl).await
    }

    /// Removes sessions whose last update is older than `ttl` as seen from `now`.
    pub async fn cleanup_at(&self, now: DateTime<Utc>, ttl: Duration) -> UploadResult<CleanupReport> {
        let mut report = CleanupReport::default();
        let ttl_seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);

        for upload_id in self.session_ids().await? {
            let guard = self.lock_session(&upload_id).await;
            let dir = self.session_dir(&upload_id);
            let (last_update, metadata_unreadable) = match self.read_session(&upload_id).await {
                Ok(session) => (Some(session.last_update), false),
                Err(err) => {
                    debug!(upload = %upload_id, error = %err, "falling back to directory mtime");
                    (dir_modified(&dir).await, true)
                }
            };
            let Some(last_update) = last_update else {
                report.record(CleanupEntry {
                    upload_id,
                    outcome: CleanupOutcome::Failed,
                    age_seconds: None,
                    metadata_unreadable,
                    error: Some("could not determine session age".into()),
                });
                continue;
            };
            let age = (now - last_update).num_seconds();
            if age <= ttl_seconds {
                report.record(CleanupEntry {
                    upload_id,
                    outcome: CleanupOutcome::Kept,
                    age_seconds: Some(age),
                    metadata_unreadable,
                    error: None,
                });
                continue;
            }
            match fs::remove_dir_all(&dir).await {
                Ok(()) => {
                    info!(upload = %upload_id, age_seconds = age, "removed stale upload session");
                    self.release_session(&upload_id, guard);
                    report.record(CleanupEntry {
                        upload_id,
                        outcome: CleanupOutcome::Deleted,
                        age_seconds: Some(age),
                        metadata_unreadable,
                        error: None,
                    });
                }
                Err(err) => {
                    warn!(upload = %upload_id, error = %err, "failed to remove upload session");
                    report.record(CleanupEntry {
                        upload_id,
                        outcome: CleanupOutcome::Failed,
                        age_seconds: Some(age),
                        metadata_unreadable,
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        report.assembled_removed = self.prune_assembled(now, ttl_seconds).await?;
        Ok(report)
    }

    async fn session_ids(&self) -> UploadResult<Vec<String>> {
        let mut entries = match fs::read_dir(&self.sessions_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(&self.sessions_dir)(err)),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_error(&self.sessions_dir))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Removes assembled files nobody claimed within the TTL.
    async fn prune_assembled(&self, now: DateTime<Utc>, ttl_seconds: i64) -> UploadResult<usize> {
        let mut entries = match fs::read_dir(&self.assembled_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(io_error(&self.assembled_dir)(err)),
        };
        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_error(&self.assembled_dir))?
        {
            let path = entry.path();
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            let age = (now - DateTime::<Utc>::from(modified)).num_seconds();
            if !meta.is_file() || age <= ttl_seconds {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    info!(file = %path.display(), age_seconds = age, "removed unclaimed assembled upload");
                    removed += 1;
                }
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "failed to remove assembled upload");
                }
            }
        }
        Ok(removed)
    }

    fn session_dir(&self, upload_id: &str) -> PathBuf {
        self.sessions_dir.join(upload_id)
    }

    async fn lock_session(&self, upload_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poison| poison.into_inner());
            locks
                .entry(upload_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drops the session guard and forgets its lock unless another task
    /// still holds or awaits it.
    fn release_session(&self, upload_id: &str, guard: OwnedMutexGuard<()>) {
        let mut locks = self.locks.lock().unwrap_or_else(|poison| poison.into_inner());
        drop(guard);
        let idle = locks
            .get(upload_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(upload_id);
        }
    }

    async fn read_session(&self, upload_id: &str) -> UploadResult<UploadSession> {
        let path = self.session_dir(upload_id).join(META_FILE);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(UploadError::NotFound {
                    upload_id: upload_id.to_string(),
                })
            }
            Err(err) => return Err(io_error(&path)(err)),
        };
        serde_json::from_slice(&raw).map_err(|err| UploadError::Corrupted {
            upload_id: upload_id.to_string(),
            reason: err.to_string(),
        })
    }

    async fn write_session(&self, upload_id: &str, session: &UploadSession) -> UploadResult<()> {
        let path = self.session_dir(upload_id).join(META_FILE);
        let payload = serde_json::to_vec_pretty(session)?;
        write_atomic(&path, &payload).await
    }
}

async fn concat_chunks(dir: &Path, total: u32, output: &Path) -> UploadResult<(String, u64)> {
    let mut file = fs::File::create(output).await.map_err(io_error(output))?;
    let mut hasher = Sha256::new();
    let mut size_bytes = 0u64;
    for index in 0..total {
        let chunk_path = dir.join(chunk_file_name(index));
        let bytes = fs::read(&chunk_path).await.map_err(io_error(&chunk_path))?;
        hasher.update(&bytes);
        size_bytes += bytes.len() as u64;
        file.write_all(&bytes).await.map_err(io_error(output))?;
    }
    file.flush().await.map_err(io_error(output))?;
    file.sync_all().await.map_err(io_error(output))?;
    Ok((hex::encode(hasher.finalize()), size_bytes))
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> UploadResult<()> {
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".part");
    let tmp = path.with_file_name(tmp_name);
    fs::write(&tmp, bytes).await.map_err(io_error(&tmp))?;
    if let Err(err) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(io_error(path)(err));
    }
    Ok(())
}

async fn dir_modified(dir: &Path) -> Option<DateTime<Utc>> {
    let modified = fs::metadata(dir).await.ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

fn chunk_file_name(index: u32) -> String {
    format!("chunk_{index:06}")
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> UploadError + '_ {
    move |source| UploadError::Io {
        source,
        path: path.to_path_buf(),
    }
}

/// Upload ids become directory names, so only a conservative alphabet is allowed.
pub fn validate_upload_id(upload_id: &str) -> UploadResult<()> {
    let valid = !upload_id.is_empty()
        && upload_id.len() <= 128
        && upload_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(UploadError::InvalidUploadId(upload_id.to_string()))
    }
}

/// Reduces a client supplied name to a plain basename.
pub fn safe_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "upload.bin".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> UploadStore {
        UploadStore::new(dir.path().join("uploads"), dir.path().join("assembled"))
    }

    #[tokio::test]
    async fn duplicate_chunks_are_counted_once() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put_chunk("u1", 0, 2, "a.mp3", b"first").await.unwrap();
        let receipt = store.put_chunk("u1", 0, 2, "a.mp3", b"again").await.unwrap();
        assert_eq!(receipt.received, 1);
        assert!(!receipt.complete);

        let receipt = store.put_chunk("u1", 1, 2, "a.mp3", b"!").await.unwrap();
        assert!(receipt.complete);
        let assembled = store.assemble("u1").await.unwrap();
        assert_eq!(std::fs::read(&assembled.path).unwrap(), b"again!");
    }

    #[tokio::test]
    async fn out_of_range_index_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = store(&dir).put_chunk("u1", 3, 3, "a.mp3", b"x").await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidChunkIndex { index: 3, total: 3 }));
    }

    #[tokio::test]
    async fn conflicting_total_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put_chunk("u1", 0, 3, "a.mp3", b"x").await.unwrap();
        let err = store.put_chunk("u1", 1, 4, "a.mp3", b"y").await.unwrap_err();
        assert!(matches!(err, UploadError::TotalMismatch { expected: 3, declared: 4, .. }));
    }

    #[tokio::test]
    async fn path_like_ids_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        for bad in ["", "../escape", "a/b", "dots.."] {
            assert!(matches!(
                store.put_chunk(bad, 0, 1, "a.mp3", b"x").await,
                Err(UploadError::InvalidUploadId(_))
            ));
        }
    }

    #[tokio::test]
    async fn missing_chunk_file_fails_before_writing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put_chunk("u1", 0, 2, "a.mp3", b"x").await.unwrap();
        store.put_chunk("u1", 1, 2, "a.mp3", b"y").await.unwrap();
        std::fs::remove_file(dir.path().join("uploads/sessions/u1/chunk_000001")).unwrap();

        let err = store.assemble("u1").await.unwrap_err();
        assert!(matches!(err, UploadError::MissingChunk { index: 1, .. }));
        assert!(!dir.path().join("assembled").exists());
        assert!(dir.path().join("uploads/sessions/u1/meta.json").exists());
    }

    #[tokio::test]
    async fn status_reports_progress() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put_chunk("u1", 2, 3, "show.wav", b"x").await.unwrap();
        let status = store.status("u1").await.unwrap();
        assert_eq!(status.filename, "show.wav");
        assert_eq!(status.received, 1);
        assert_eq!(status.total, 3);
        assert!((status.percent_complete - 33.3).abs() < f64::EPSILON);
        assert!(!status.complete);

        assert!(matches!(
            store.status("nobody").await,
            Err(UploadError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn cleanup_keeps_fresh_sessions() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put_chunk("fresh", 0, 2, "a.mp3", b"x").await.unwrap();
        let report = store.cleanup(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(report.deleted, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.results[0].outcome, CleanupOutcome::Kept);
        assert!(dir.path().join("uploads/sessions/fresh").exists());
    }

    #[tokio::test]
    async fn cleanup_without_sessions_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let report = store(&dir).cleanup(Duration::from_secs(1)).await.unwrap();
        assert_eq!(report, CleanupReport::default());
    }

    #[tokio::test]
    async fn waiting_writer_keeps_the_session_lock() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store(&dir));
        store.put_chunk("u1", 0, 2, "a.mp3", b"x").await.unwrap();

        let guard = store.lock_session("u1").await;
        let waiting = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.put_chunk("u1", 1, 2, "a.mp3", b"y").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.release_session("u1", guard);
        assert!(store.locks.lock().unwrap().contains_key("u1"));

        let receipt = waiting.await.unwrap().unwrap();
        assert_eq!(receipt.received, 2);

        let guard = store.lock_session("u1").await;
        store.release_session("u1", guard);
        assert!(!store.locks.lock().unwrap().contains_key("u1"));
    }

    #[test]
    fn filenames_are_reduced_to_basenames() {
        assert_eq!(safe_filename("../../etc/passwd"), "passwd");
        assert_eq!(safe_filename("C:\\music\\ep 1.wav"), "ep 1.wav");
        assert_eq!(safe_filename("..."), "upload.bin");
        assert_eq!(safe_filename("a?b.mp3"), "a_b.mp3");
    }
}

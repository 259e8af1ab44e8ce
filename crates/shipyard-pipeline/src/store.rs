//! Durable run records.
//!
//! A [`RunStore`] holds one [`PipelineRunRecord`] per run, keyed by
//! `pipeline_run_id`. Updates are optimistic: `save` only succeeds when the
//! stored version is the one the caller loaded, so two writers can never
//! silently interleave transitions on the same run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use shipyard_types::{PipelineRunRecord, Result, ShipyardError};

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Store a brand-new record. Fails if the run id is already taken.
    async fn insert(&self, record: &PipelineRunRecord) -> Result<()>;

    async fn load(&self, run_id: &str) -> Result<Option<PipelineRunRecord>>;

    /// Replace the stored record, provided its version is still
    /// `expected_version`.
    async fn save(&self, record: &PipelineRunRecord, expected_version: u64) -> Result<()>;

    async fn list(&self) -> Result<Vec<PipelineRunRecord>>;
}

fn check_version(run_id: &str, expected: u64, found: u64) -> Result<()> {
    if expected != found {
        return Err(ShipyardError::VersionConflict {
            run_id: run_id.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// MemoryRunStore
// ---------------------------------------------------------------------------

/// In-process store. Records are lost when the process exits.
#[derive(Default)]
pub struct MemoryRunStore {
    records: RwLock<HashMap<String, PipelineRunRecord>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn insert(&self, record: &PipelineRunRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(record.run_id()) {
            return Err(ShipyardError::Other(format!(
                "Pipeline run '{}' already exists",
                record.run_id()
            )));
        }
        records.insert(record.run_id().to_string(), record.clone());
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<PipelineRunRecord>> {
        Ok(self.records.read().await.get(run_id).cloned())
    }

    async fn save(&self, record: &PipelineRunRecord, expected_version: u64) -> Result<()> {
        let mut records = self.records.write().await;
        let current = records
            .get(record.run_id())
            .ok_or_else(|| ShipyardError::RunNotFound {
                run_id: record.run_id().to_string(),
            })?;
        check_version(record.run_id(), expected_version, current.version)?;
        records.insert(record.run_id().to_string(), record.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PipelineRunRecord>> {
        let mut all: Vec<_> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// FileRunStore
// ---------------------------------------------------------------------------

/// One pretty-printed JSON file per run: `<root>/<run_id>.json`.
///
/// Writes go to a uniquely named temporary file that is renamed into place,
/// so a crash never leaves a half-written record behind. `insert` and `save`
/// hold an exclusive lock on `<root>/.<run_id>.lock` across read, version
/// check and rename, so separate stores (and separate processes) over the
/// same directory serialize their writes to a run.
pub struct FileRunStore {
    root: PathBuf,
}

impl FileRunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, run_id: &str) -> Result<PathBuf> {
        check_run_id(run_id)?;
        Ok(self.root.join(format!("{run_id}.json")))
    }
}

/// Run ids become file names; anything that could escape the root or
/// collide with lock and temp files is refused.
fn check_run_id(run_id: &str) -> Result<()> {
    let invalid = run_id.is_empty()
        || run_id.starts_with('.')
        || run_id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(ShipyardError::InvalidName {
            kind: "run id",
            value: run_id.to_string(),
        });
    }
    Ok(())
}

/// Run blocking file I/O off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ShipyardError::Other(format!("Run store task failed: {e}")))?
}

/// Call `f` while holding the run's lock file. Blocking.
fn with_run_lock<T>(root: &Path, run_id: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    std::fs::create_dir_all(root)?;
    let lock = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(root.join(format!(".{run_id}.lock")))?;
    lock_exclusive(&lock)?;
    // released when `lock` is closed
    f()
}

#[cfg(unix)]
fn lock_exclusive(file: &std::fs::File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    loop {
        // SAFETY: flock is a standard POSIX call and the descriptor is owned
        // by `file` for the duration of the call.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if result == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &std::fs::File) -> std::io::Result<()> {
    Ok(())
}

fn read_record(path: &Path) -> Result<Option<PipelineRunRecord>> {
    match std::fs::read_to_string(path) {
        Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_record(root: &Path, path: &Path, record: &PipelineRunRecord) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(root)?;
    serde_json::to_writer_pretty(&mut tmp, record)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    tracing::debug!(path = %path.display(), version = record.version, "Run record saved");
    Ok(())
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn insert(&self, record: &PipelineRunRecord) -> Result<()> {
        let path = self.path_for(record.run_id())?;
        let root = self.root.clone();
        let record = record.clone();
        blocking(move || {
            with_run_lock(&root, record.run_id(), || {
                if path.exists() {
                    return Err(ShipyardError::Other(format!(
                        "Pipeline run '{}' already exists",
                        record.run_id()
                    )));
                }
                write_record(&root, &path, &record)
            })
        })
        .await
    }

    async fn load(&self, run_id: &str) -> Result<Option<PipelineRunRecord>> {
        let path = self.path_for(run_id)?;
        blocking(move || read_record(&path)).await
    }

    async fn save(&self, record: &PipelineRunRecord, expected_version: u64) -> Result<()> {
        let path = self.path_for(record.run_id())?;
        let root = self.root.clone();
        let record = record.clone();
        blocking(move || {
            with_run_lock(&root, record.run_id(), || {
                let current =
                    read_record(&path)?.ok_or_else(|| ShipyardError::RunNotFound {
                        run_id: record.run_id().to_string(),
                    })?;
                check_version(record.run_id(), expected_version, current.version)?;
                write_record(&root, &path, &record)
            })
        })
        .await
    }

    async fn list(&self) -> Result<Vec<PipelineRunRecord>> {
        let root = self.root.clone();
        blocking(move || {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut all = Vec::new();
            for entry in std::fs::read_dir(&root)? {
                let entry = entry?;
                let path = entry.path();
                let is_record = path.extension().is_some_and(|ext| ext == "json")
                    && !entry.file_name().to_string_lossy().starts_with('.');
                if !is_record {
                    continue;
                }
                match read_record(&path) {
                    Ok(Some(record)) => all.push(record),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "Skipping unreadable run record");
                    }
                }
            }
            all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            Ok(all)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{RunStore, WaiterTransition};
use crate::engine::error::PersistenceError;
use crate::engine::types::{
    content_hash, CallbackToken, CallbackWaiter, RunId, StepRecord, WaiterResolution, WorkflowRun,
};

/// Metadata stamped on every run file for operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub integrity_hash: String,
    pub hostname: String,
    pub pid: u32,
    pub persisted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRun {
    run: WorkflowRun,
    metadata: StoreMetadata,
}

/// File system implementation of the run store.
///
/// Layout under the root directory:
///
/// ```text
/// runs/<run_id>.json       active run headers
/// archive/<run_id>.json    terminal run headers
/// ledgers/<run_id>.jsonl   append-only step ledger
/// waiters/<token>.json     callback waiters
/// waiters/<token>.resolution          first resolution, hard-linked into place
/// waiters/by-run/<run_id>/<token>     per-run waiter index
/// ```
///
/// A ledger entry is committed once its trailing newline is on disk.
#[derive(Debug, Clone)]
pub struct FileSystemStore {
    root: PathBuf,
}

impl FileSystemStore {
    /// Open a store rooted at `root`, creating the directory layout.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let store = Self { root: root.into() };
        for dir in [store.runs_dir(), store.archive_dir(), store.ledgers_dir(), store.waiters_dir()] {
            fs::create_dir_all(&dir).await?;
        }
        info!(root = ?store.root, "Opened file system run store");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    fn ledgers_dir(&self) -> PathBuf {
        self.root.join("ledgers")
    }

    fn waiters_dir(&self) -> PathBuf {
        self.root.join("waiters")
    }

    fn run_path(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir().join(format!("{}.json", file_stem(run_id.as_str())))
    }

    fn archived_run_path(&self, run_id: &RunId) -> PathBuf {
        self.archive_dir().join(format!("{}.json", file_stem(run_id.as_str())))
    }

    fn ledger_path(&self, run_id: &RunId) -> PathBuf {
        self.ledgers_dir().join(format!("{}.jsonl", file_stem(run_id.as_str())))
    }

    fn waiter_path(&self, token: &CallbackToken) -> PathBuf {
        self.waiters_dir().join(format!("{}.json", file_stem(token.as_str())))
    }

    fn resolution_path(&self, token: &CallbackToken) -> PathBuf {
        self.waiters_dir().join(format!("{}.resolution", file_stem(token.as_str())))
    }

    fn run_waiters_dir(&self, run_id: &RunId) -> PathBuf {
        self.waiters_dir().join("by-run").join(file_stem(run_id.as_str()))
    }

    fn integrity_hash(run: &WorkflowRun) -> Result<String, PersistenceError> {
        Ok(content_hash(&serde_json::to_value(run)?))
    }

    async fn read_run_file(&self, path: &Path) -> Result<Option<WorkflowRun>, PersistenceError> {
        let contents = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let stored: StoredRun = serde_json::from_str(&contents)?;
        let expected = Self::integrity_hash(&stored.run)?;
        if expected != stored.metadata.integrity_hash {
            return Err(PersistenceError::StateCorruption {
                reason: format!("integrity check failed for {}", path.display()),
            });
        }
        Ok(Some(stored.run))
    }

    /// Waiter file with the claimed resolution, if any, applied on top.
    async fn read_waiter_file(&self, path: &Path) -> Result<Option<CallbackWaiter>, PersistenceError> {
        let contents = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut waiter: CallbackWaiter = serde_json::from_str(&contents)?;
        if let Some(resolution) = self.read_resolution(&waiter.callback_token).await? {
            waiter.resolution = resolution;
        }
        Ok(Some(waiter))
    }

    async fn read_resolution(
        &self,
        token: &CallbackToken,
    ) -> Result<Option<WaiterResolution>, PersistenceError> {
        match fs::read_to_string(self.resolution_path(token)).await {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Hard-link a fully written resolution into place. Fails with
    /// `AlreadyExists` when another writer claimed the waiter first.
    async fn claim_resolution(
        &self,
        token: &CallbackToken,
        resolution: &WaiterResolution,
    ) -> std::io::Result<()> {
        let path = self.resolution_path(token);
        let temp_file = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        let serialized = serde_json::to_vec(resolution).map_err(std::io::Error::other)?;

        let mut file = fs::File::create(&temp_file).await?;
        file.write_all(&serialized).await?;
        file.sync_data().await?;
        drop(file);

        let claimed = fs::hard_link(&temp_file, &path).await;
        if let Err(e) = fs::remove_file(&temp_file).await {
            debug!(path = ?temp_file, error = %e, "Could not remove resolution temp file");
        }
        claimed
    }
}

/// Length of the ledger prefix made of complete, newline-terminated entries.
async fn committed_len(file: &mut fs::File) -> Result<u64, PersistenceError> {
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(0);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1)).await?;
    file.read_exact(&mut last).await?;
    if last[0] == b'\n' {
        return Ok(len);
    }

    let mut contents = Vec::new();
    file.seek(SeekFrom::Start(0)).await?;
    file.read_to_end(&mut contents).await?;
    Ok(contents
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map_or(0, |index| index as u64 + 1))
}

/// Replace path separators so an identifier always maps to a single file.
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}

/// Write to a temporary file first, then rename (atomic on POSIX).
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), PersistenceError> {
    let temp_file = path.with_extension("json.tmp");
    fs::write(&temp_file, contents).await?;
    fs::rename(&temp_file, path).await?;
    Ok(())
}

#[async_trait]
impl RunStore for FileSystemStore {
    async fn save_run(&self, run: &WorkflowRun) -> Result<(), PersistenceError> {
        let stored = StoredRun {
            run: run.clone(),
            metadata: StoreMetadata {
                integrity_hash: Self::integrity_hash(run)?,
                hostname: hostname::get()
                    .unwrap_or_default()
                    .to_string_lossy()
                    .to_string(),
                pid: std::process::id(),
                persisted_at: Utc::now(),
            },
        };
        let serialized = serde_json::to_vec_pretty(&stored)?;
        write_atomic(&self.run_path(&run.run_id), &serialized).await?;

        debug!(run_id = %run.run_id, status = %run.status, "Run saved");
        Ok(())
    }

    async fn load_run(&self, run_id: &RunId) -> Result<Option<WorkflowRun>, PersistenceError> {
        if let Some(run) = self.read_run_file(&self.run_path(run_id)).await? {
            return Ok(Some(run));
        }
        self.read_run_file(&self.archived_run_path(run_id)).await
    }

    async fn list_runs(&self) -> Result<Vec<WorkflowRun>, PersistenceError> {
        let mut runs = Vec::new();
        let mut entries = fs::read_dir(self.runs_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(run) = self.read_run_file(&path).await? {
                runs.push(run);
            }
        }
        runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(runs)
    }

    async fn archive_run(&self, run_id: &RunId) -> Result<(), PersistenceError> {
        fs::rename(self.run_path(run_id), self.archived_run_path(run_id)).await?;
        info!(run_id = %run_id, "Run archived");
        Ok(())
    }

    async fn append_step(&self, run_id: &RunId, record: &StepRecord) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(self.ledger_path(run_id))
            .await?;

        let len = file.metadata().await?.len();
        let committed = committed_len(&mut file).await?;
        if committed < len {
            warn!(
                run_id = %run_id,
                dropped_bytes = len - committed,
                "Truncating incomplete trailing ledger entry"
            );
            file.set_len(committed).await?;
        }
        file.seek(SeekFrom::Start(committed)).await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn read_steps(&self, run_id: &RunId) -> Result<Vec<StepRecord>, PersistenceError> {
        let contents = match fs::read_to_string(self.ledger_path(run_id)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        // Anything after the last newline is an append that never completed.
        let committed = match contents.rfind('\n') {
            Some(index) => &contents[..=index],
            None => "",
        };
        if committed.len() < contents.len() {
            warn!(run_id = %run_id, "Ignoring incomplete trailing ledger entry");
        }

        let mut records = Vec::new();
        for (index, line) in committed.lines().filter(|l| !l.trim().is_empty()).enumerate() {
            let record = serde_json::from_str::<StepRecord>(line).map_err(|e| {
                PersistenceError::StateCorruption {
                    reason: format!("ledger for {run_id} entry {index} unreadable: {e}"),
                }
            })?;
            records.push(record);
        }
        Ok(records)
    }

    async fn save_waiter(&self, waiter: &CallbackWaiter) -> Result<(), PersistenceError> {
        let serialized = serde_json::to_vec_pretty(waiter)?;
        write_atomic(&self.waiter_path(&waiter.callback_token), &serialized).await?;

        let index_dir = self.run_waiters_dir(&waiter.run_id);
        fs::create_dir_all(&index_dir).await?;
        fs::write(index_dir.join(file_stem(waiter.callback_token.as_str())), b"").await?;
        Ok(())
    }

    async fn resolve_waiter(
        &self,
        token: &CallbackToken,
        resolution: &WaiterResolution,
    ) -> Result<WaiterTransition, PersistenceError> {
        let Some(mut waiter) = self.load_waiter(token).await? else {
            return Ok(WaiterTransition::Missing);
        };
        if !waiter.resolution.is_pending() {
            return Ok(WaiterTransition::AlreadyResolved(waiter));
        }

        match self.claim_resolution(token, resolution).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if let Some(resolved) = self.read_resolution(token).await? {
                    waiter.resolution = resolved;
                }
                debug!(callback_token = %token, "Waiter claimed by another writer");
                return Ok(WaiterTransition::AlreadyResolved(waiter));
            }
            Err(e) => return Err(e.into()),
        }

        // The claim is authoritative; the rewrite keeps the waiter file
        // readable on its own.
        waiter.resolution = resolution.clone();
        let serialized = serde_json::to_vec_pretty(&waiter)?;
        write_atomic(&self.waiter_path(token), &serialized).await?;
        Ok(WaiterTransition::Applied(waiter))
    }

    async fn load_waiter(
        &self,
        token: &CallbackToken,
    ) -> Result<Option<CallbackWaiter>, PersistenceError> {
        self.read_waiter_file(&self.waiter_path(token)).await
    }

    async fn list_waiters(&self) -> Result<Vec<CallbackWaiter>, PersistenceError> {
        let mut waiters = Vec::new();
        let mut entries = fs::read_dir(self.waiters_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(waiter) = self.read_waiter_file(&path).await? {
                waiters.push(waiter);
            }
        }
        waiters.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        Ok(waiters)
    }

    async fn list_waiters_for_run(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<CallbackWaiter>, PersistenceError> {
        let mut entries = match fs::read_dir(self.run_waiters_dir(run_id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut waiters = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let token = CallbackToken(entry.file_name().to_string_lossy().into_owned());
            if let Some(waiter) = self.load_waiter(&token).await? {
                waiters.push(waiter);
            }
        }
        waiters.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        Ok(waiters)
    }
}

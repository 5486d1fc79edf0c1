//! Local journal for outcomes the store could not accept. One JSON object
//! per line, fsync'd on append, replayed once the store is reachable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::Engine;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeRecord {
    Completed { result: Value },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOutcome {
    pub task_id: Uuid,
    pub worker_id: String,
    pub outcome: OutcomeRecord,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    pub applied: usize,
    /// Rejected by the store (claim lost, task gone); dropped.
    pub discarded: usize,
    /// Store still unavailable; kept for the next replay.
    pub kept: usize,
}

pub struct FallbackJournal {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FallbackJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &PendingOutcome) -> io::Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// True when the journal file exists. Replay removes it once drained.
    pub async fn has_pending(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Records currently in the journal. Unreadable lines are skipped.
    pub async fn pending(&self) -> io::Result<Vec<PendingOutcome>> {
        let _guard = self.lock.lock().await;
        self.read_all().await
    }

    async fn read_all(&self) -> io::Result<Vec<PendingOutcome>> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut out = Vec::new();
        for (n, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PendingOutcome>(line) {
                Ok(r) => out.push(r),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = n + 1,
                    error = %e,
                    "skipping unreadable fallback record"
                ),
            }
        }
        Ok(out)
    }

    async fn rewrite(&self, records: &[PendingOutcome]) -> io::Result<()> {
        if records.is_empty() {
            return match fs::remove_file(&self.path).await {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            };
        }

        let mut buf = Vec::new();
        for r in records {
            serde_json::to_writer(&mut buf, r)?;
            buf.push(b'\n');
        }

        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&buf).await?;
        file.sync_all().await?;
        fs::rename(&tmp, &self.path).await
    }

    /// Pushes journaled outcomes into the store.
    pub async fn replay(&self, engine: &Engine) -> io::Result<ReplayReport> {
        let _guard = self.lock.lock().await;
        let records = self.read_all().await?;
        if records.is_empty() {
            return Ok(ReplayReport::default());
        }

        let mut report = ReplayReport::default();
        let mut kept = Vec::new();

        for record in records {
            let worker = Some(record.worker_id.as_str());
            let res = match &record.outcome {
                OutcomeRecord::Completed { result } => engine
                    .complete(record.task_id, worker, result.clone())
                    .await
                    .map(|_| ()),
                OutcomeRecord::Failed { error } => {
                    engine.fail(record.task_id, worker, error).await.map(|_| ())
                }
            };

            match res {
                Ok(()) => report.applied += 1,
                Err(e) if e.is_transient() => {
                    report.kept += 1;
                    kept.push(record);
                }
                Err(e) => {
                    warn!(
                        task_id = %record.task_id,
                        worker_id = %record.worker_id,
                        error = %e,
                        "discarding journaled outcome"
                    );
                    report.discarded += 1;
                }
            }
        }

        self.rewrite(&kept).await?;
        if report.applied > 0 || report.discarded > 0 {
            info!(
                applied = report.applied,
                discarded = report.discarded,
                kept = report.kept,
                "replayed fallback journal"
            );
        }
        Ok(report)
    }
}

use super::record::JobRecord;
use crate::workspace::path_component;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

/// One lifecycle note about a job, attributed to the acting user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityNote {
    pub job_id: String,
    pub user_id: String,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Persistence for job result fields and the activity log.
pub trait JobStore: Send + Sync {
    /// Persist the current result fields of a job.
    fn save<'a>(
        &'a self,
        record: &'a JobRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Append a lifecycle note for a job.
    fn add_activity<'a>(
        &'a self,
        job_id: &'a str,
        user_id: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// In-process store; keeps the latest record per job plus every save.
#[derive(Default)]
pub struct MemoryJobStore {
    records: Mutex<HashMap<String, JobRecord>>,
    history: Mutex<Vec<JobRecord>>,
    activity: Mutex<Vec<ActivityNote>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(job_id)
            .cloned()
    }

    /// Every saved status for `job_id`, oldest first.
    pub fn status_history(&self, job_id: &str) -> Vec<super::JobStatus> {
        self.history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|record| record.id == job_id)
            .map(|record| record.status)
            .collect()
    }

    pub fn activity(&self) -> Vec<ActivityNote> {
        self.activity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl JobStore for MemoryJobStore {
    fn save<'a>(
        &'a self,
        record: &'a JobRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.history
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(record.clone());
            self.records
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(record.id.clone(), record.clone());
            Ok(())
        })
    }

    fn add_activity<'a>(
        &'a self,
        job_id: &'a str,
        user_id: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.activity
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(ActivityNote {
                    job_id: job_id.to_string(),
                    user_id: user_id.to_string(),
                    text: text.to_string(),
                    at: Utc::now(),
                });
            Ok(())
        })
    }
}

/// File-backed store: `<dir>/<job id>.json` per job, `<dir>/activity.jsonl`.
pub struct JsonJobStore {
    dir: PathBuf,
}

impl JsonJobStore {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create job store {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn record_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", path_component(job_id)))
    }

    pub fn load(&self, job_id: &str) -> Result<JobRecord> {
        let path = self.record_path(job_id);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&raw).context("Failed to parse job record")
    }
}

impl JobStore for JsonJobStore {
    fn save<'a>(
        &'a self,
        record: &'a JobRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.record_path(&record.id);
            let tmp = path.with_extension("json.tmp");
            let body = serde_json::to_vec_pretty(record).context("Failed to encode job record")?;
            tokio::fs::write(&tmp, body)
                .await
                .with_context(|| format!("Failed to write {}", tmp.display()))?;
            tokio::fs::rename(&tmp, &path)
                .await
                .with_context(|| format!("Failed to replace {}", path.display()))?;
            Ok(())
        })
    }

    fn add_activity<'a>(
        &'a self,
        job_id: &'a str,
        user_id: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let note = ActivityNote {
                job_id: job_id.to_string(),
                user_id: user_id.to_string(),
                text: text.to_string(),
                at: Utc::now(),
            };
            let mut line = serde_json::to_vec(&note).context("Failed to encode activity")?;
            line.push(b'\n');
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join("activity.jsonl"))
                .await
                .context("Failed to open activity log")?;
            file.write_all(&line)
                .await
                .context("Failed to append activity")?;
            Ok(())
        })
    }
}

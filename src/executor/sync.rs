use super::output::OutputBuffer;
use crate::jobs::{JobStatus, PhaseSignal, Project};
use crate::workspace::WorkspaceStager;
use anyhow::{Result, bail};
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::watch;

const STDERR_TAIL: usize = 4096;

/// A launched repository-sync job that a run waits on.
pub struct SyncHandle {
    pub id: String,
    pub name: String,
    /// Latest status of the sync job.
    pub status: watch::Receiver<JobStatus>,
    /// Kill channel of the sync job itself.
    pub cancel: PhaseSignal,
}

impl SyncHandle {
    pub fn current(&self) -> JobStatus {
        *self.status.borrow()
    }
}

/// Launches project update jobs for update-on-launch projects.
pub trait ProjectSync: Send + Sync {
    fn update<'a>(
        &'a self,
        project: &'a Project,
    ) -> Pin<Box<dyn Future<Output = Result<SyncHandle>> + Send + 'a>>;
}

/// Runs the configured SCM update command inside the project checkout.
pub struct ScmProjectSync {
    command: Vec<String>,
    checkouts: Arc<WorkspaceStager>,
}

impl ScmProjectSync {
    pub fn new(command: Vec<String>, checkouts: Arc<WorkspaceStager>) -> Self {
        Self { command, checkouts }
    }
}

impl ProjectSync for ScmProjectSync {
    fn update<'a>(
        &'a self,
        project: &'a Project,
    ) -> Pin<Box<dyn Future<Output = Result<SyncHandle>> + Send + 'a>> {
        Box::pin(async move {
            let Some((program, args)) = self.command.split_first() else {
                bail!("no project update command configured");
            };
            let dir = self.checkouts.project_dir(&project.id);
            let id = uuid::Uuid::new_v4().to_string();
            let name = format!("{} update", project.name);

            let mut child = Command::new(program)
                .args(args)
                .current_dir(&dir)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| anyhow::anyhow!("failed to start project update {id}: {e}"))?;

            let (tx, rx) = watch::channel(JobStatus::Running);
            let cancel = PhaseSignal::new();
            let signal = cancel.clone();
            let job_id = id.clone();
            tokio::spawn(async move {
                let errors = OutputBuffer::new(STDERR_TAIL);
                let reader = child.stderr.take().map(|pipe| errors.capture(pipe));
                let status = tokio::select! {
                    exit = child.wait() => match exit {
                        Ok(exit) if exit.success() => JobStatus::Successful,
                        Ok(exit) => {
                            if let Some(reader) = reader {
                                reader.await.ok();
                            }
                            tracing::warn!(sync_id = %job_id, "project update {exit}: {}", errors.text().trim());
                            JobStatus::Failed
                        }
                        Err(e) => {
                            tracing::warn!(sync_id = %job_id, "project update wait failed: {e}");
                            JobStatus::Error
                        }
                    },
                    () = signal.received() => {
                        child.kill().await.ok();
                        signal.acknowledge();
                        JobStatus::Canceled
                    }
                };
                tracing::debug!(sync_id = %job_id, %status, "project update finished");
                tx.send_replace(status);
            });

            Ok(SyncHandle {
                id,
                name,
                status: rx,
                cancel,
            })
        })
    }
}

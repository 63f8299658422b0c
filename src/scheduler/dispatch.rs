use crate::executor::{ExecutorContext, JobExecutor};
use crate::jobs::{JobRecord, JobRequest, JobSignals, JobStatus};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, warn};

use super::pool::Command;

/// Deregisters a run from the scheduler when dropped, including when the
/// task holding it panics.
pub struct CompletionGuard {
    id: String,
    run: u64,
    tx: mpsc::UnboundedSender<Command>,
}

impl CompletionGuard {
    pub(super) fn new(id: String, run: u64, tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { id, run, tx }
    }

    pub fn job_id(&self) -> &str {
        &self.id
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        // The scheduler may already be gone at shutdown.
        let _ = self.tx.send(Command::Finished {
            id: std::mem::take(&mut self.id),
            run: self.run,
        });
    }
}

/// Everything a dispatched run needs; the guard must live as long as the run.
pub struct DispatchedRun {
    pub request: JobRequest,
    pub signals: JobSignals,
    pub phase: watch::Sender<JobStatus>,
    pub guard: CompletionGuard,
}

/// Starts runs handed over by the scheduler. Must not block.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, run: DispatchedRun);
}

/// Production dispatcher: one [`JobExecutor`] per run on its own task.
pub struct ExecutorDispatch {
    ctx: Arc<ExecutorContext>,
    results: Option<mpsc::UnboundedSender<JobRecord>>,
}

impl ExecutorDispatch {
    pub fn new(ctx: Arc<ExecutorContext>) -> Self {
        Self { ctx, results: None }
    }

    /// Also publish each terminal record on `results`.
    pub fn with_results(mut self, results: mpsc::UnboundedSender<JobRecord>) -> Self {
        self.results = Some(results);
        self
    }
}

impl Dispatch for ExecutorDispatch {
    fn dispatch(&self, run: DispatchedRun) {
        let ctx = Arc::clone(&self.ctx);
        let results = self.results.clone();
        tokio::spawn(async move {
            let DispatchedRun {
                request,
                signals,
                phase,
                guard,
            } = run;
            let id = request.id().to_string();
            let store = Arc::clone(&ctx.store);
            let executor = JobExecutor::new(request, ctx, signals, phase);
            let record = match tokio::spawn(executor.run()).await {
                Ok(record) => record,
                Err(e) => {
                    error!(job_id = %id, "executor task failed: {e}");
                    let mut record = JobRecord::new(id);
                    record.explanation = format!("executor task failed: {e}");
                    record.transition(JobStatus::Error);
                    if let Err(e) = store.save(&record).await {
                        warn!(job_id = %record.id, "failed to persist job record: {e:#}");
                    }
                    record
                }
            };
            drop(guard);
            if let Some(results) = results {
                let _ = results.send(record);
            }
        });
    }
}

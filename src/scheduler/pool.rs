use super::dispatch::{CompletionGuard, Dispatch, DispatchedRun};
use crate::jobs::{JobRecord, JobRequest, JobSignals, JobStatus, JobStore};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// What drives dispatch of the queue head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickSource {
    Interval(Duration),
    /// Only explicit [`SchedulerHandle::tick`] calls dispatch queued jobs.
    Manual,
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    /// Queued job ids, head first.
    pub queued: Vec<String>,
    /// Running job ids, sorted.
    pub running: Vec<String>,
}

pub(super) enum Command {
    Submit(JobRequest),
    Cancel {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    CanCancel {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Tick {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<SchedulerSnapshot>,
    },
    Finished {
        id: String,
        run: u64,
    },
}

struct RunningEntry {
    template_id: String,
    allow_simultaneous: bool,
    signals: JobSignals,
    phase: watch::Receiver<JobStatus>,
    run: u64,
}

/// Cheap, cloneable entry point to the scheduler's control loop.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    /// Queue a request, or start it right away when its template allows
    /// simultaneous runs.
    pub fn submit(&self, request: JobRequest) {
        if self.tx.send(Command::Submit(request)).is_err() {
            warn!("scheduler is stopped; submission dropped");
        }
    }

    /// Cancel a queued or running job. Returns `false` for unknown ids.
    pub async fn cancel(&self, id: &str) -> bool {
        self.ask(|reply| Command::Cancel {
            id: id.to_string(),
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn can_cancel(&self, id: &str) -> bool {
        self.ask(|reply| Command::CanCancel {
            id: id.to_string(),
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Run one dispatch check now and wait for it to complete.
    pub async fn tick(&self) {
        self.ask(|reply| Command::Tick { reply }).await;
    }

    pub async fn snapshot(&self) -> SchedulerSnapshot {
        self.ask(|reply| Command::Snapshot { reply })
            .await
            .unwrap_or_default()
    }

    async fn ask<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(command(reply)).ok()?;
        rx.await.ok()
    }
}

/// Owner of the queue and the running registry. Only the control loop
/// touches either.
pub struct Scheduler {
    queue: VecDeque<JobRequest>,
    running: HashMap<String, RunningEntry>,
    dispatch: Arc<dyn Dispatch>,
    store: Arc<dyn JobStore>,
    tx: mpsc::UnboundedSender<Command>,
    next_run: u64,
}

impl Scheduler {
    /// Start the control loop on the current runtime. It runs for the life
    /// of the runtime, like the other background loops.
    pub fn spawn(
        dispatch: Arc<dyn Dispatch>,
        store: Arc<dyn JobStore>,
        ticks: TickSource,
    ) -> SchedulerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            queue: VecDeque::new(),
            running: HashMap::new(),
            dispatch,
            store,
            tx: tx.clone(),
            next_run: 0,
        };
        tokio::spawn(scheduler.run(rx, ticks));
        SchedulerHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, ticks: TickSource) {
        let mut interval = match ticks {
            TickSource::Interval(period) => {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                Some(interval)
            }
            TickSource::Manual => None,
        };
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                () = next_tick(interval.as_mut()) => self.tick(),
            }
        }
        debug!("scheduler stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit(request) => self.submit(request),
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(&id));
            }
            Command::CanCancel { id, reply } => {
                let _ = reply.send(self.is_known(&id));
            }
            Command::Tick { reply } => {
                self.tick();
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Finished { id, run } => self.finished(&id, run),
        }
    }

    fn is_known(&self, id: &str) -> bool {
        self.running.contains_key(id) || self.queue.iter().any(|queued| queued.id() == id)
    }

    fn submit(&mut self, request: JobRequest) {
        if self.is_known(request.id()) {
            warn!(job_id = %request.id(), "job is already queued or running; ignoring");
            return;
        }
        if request.allow_simultaneous() {
            self.start(request);
        } else {
            info!(job_id = %request.id(), template_id = %request.template_id(), "job queued");
            self.queue.push_back(request);
        }
    }

    /// Dispatch the queue head unless a run of the same template is active.
    /// A blocked head blocks everything behind it.
    fn tick(&mut self) {
        let Some(head) = self.queue.front() else {
            return;
        };
        let template_id = head.template_id();
        if self
            .running
            .values()
            .any(|entry| entry.template_id == template_id)
        {
            debug!(job_id = %head.id(), %template_id, "queue head waits on a running template");
            return;
        }
        if let Some(request) = self.queue.pop_front() {
            self.start(request);
        }
    }

    fn start(&mut self, request: JobRequest) {
        self.next_run += 1;
        let run = self.next_run;
        let id = request.id().to_string();
        let signals = JobSignals::new();
        let (phase, phase_rx) = watch::channel(JobStatus::New);

        self.running.insert(
            id.clone(),
            RunningEntry {
                template_id: request.template_id().to_string(),
                allow_simultaneous: request.allow_simultaneous(),
                signals: signals.clone(),
                phase: phase_rx,
                run,
            },
        );
        info!(job_id = %id, "job dispatched");
        self.dispatch.dispatch(DispatchedRun {
            request,
            signals,
            phase,
            guard: CompletionGuard::new(id, run, self.tx.clone()),
        });
    }

    fn cancel(&mut self, id: &str) -> bool {
        if let Some(pos) = self.queue.iter().position(|queued| queued.id() == id) {
            if let Some(request) = self.queue.remove(pos) {
                self.persist_canceled(&request);
            }
            info!(job_id = %id, "queued job canceled");
            return true;
        }

        let Some(entry) = self.running.remove(id) else {
            debug!(job_id = %id, "cancel for unknown job");
            return false;
        };
        let phase = *entry.phase.borrow();
        if phase == JobStatus::Waiting {
            entry.signals.sync.send();
        } else {
            entry.signals.main.send();
        }
        info!(
            job_id = %id,
            %phase,
            simultaneous = entry.allow_simultaneous,
            "running job canceled"
        );
        true
    }

    fn persist_canceled(&self, request: &JobRequest) {
        let store = Arc::clone(&self.store);
        let mut record = JobRecord::new(request.id());
        record.transition(JobStatus::Canceled);
        tokio::spawn(async move {
            if let Err(e) = store.save(&record).await {
                warn!(job_id = %record.id, "could not save canceled job: {e:#}");
            }
        });
    }

    fn finished(&mut self, id: &str, run: u64) {
        // A canceled run was already removed; its id may since be reused.
        if self.running.get(id).is_some_and(|entry| entry.run == run) {
            self.running.remove(id);
            debug!(job_id = %id, "job deregistered");
        }
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        let mut running: Vec<String> = self.running.keys().cloned().collect();
        running.sort();
        SchedulerSnapshot {
            queued: self.queue.iter().map(|r| r.id().to_string()).collect(),
            running,
        }
    }
}

async fn next_tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

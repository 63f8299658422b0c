use super::output::OutputBuffer;
use super::sync::{ProjectSync, ScmProjectSync, SyncHandle};
use crate::agent::{AgentSession, KeyAgent, SshAgent};
use crate::command::{AgentEndpoint, CommandSettings, ResolvedCommand, build_command};
use crate::config::Config;
use crate::credentials::{Decrypt, KeyDecoder, KeyMaterial, PemKeyDecoder, SecretStore, kinit};
use crate::error::ProcessError;
use crate::jobs::{
    Credential, JobRecord, JobRequest, JobSignals, JobStatus, JobStore, MISSING_STDOUT,
};
use crate::workspace::{JobPaths, WorkspaceStager};
use anyhow::Result;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long output readers may keep draining after the process is gone.
const READER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub command: CommandSettings,
    pub poll_interval: Duration,
    pub kinit: String,
    pub retain_workspace: bool,
    pub output_cap: usize,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            command: CommandSettings::from_config(config),
            poll_interval: Duration::from_millis(config.dependency.poll_ms),
            kinit: config.executables.kinit.clone(),
            retain_workspace: config.workspace.retain_after_run,
            output_cap: config.output.max_bytes,
        }
    }
}

/// Collaborators shared by every run.
pub struct ExecutorContext {
    pub store: Arc<dyn JobStore>,
    pub secrets: Arc<dyn Decrypt>,
    pub keys: Arc<dyn KeyDecoder>,
    pub agent: Arc<dyn KeyAgent>,
    pub sync: Arc<dyn ProjectSync>,
    pub stager: Arc<WorkspaceStager>,
    pub settings: ExecutorSettings,
}

impl ExecutorContext {
    /// Production wiring: OpenSSH agent, PEM key decoding, SCM sync and the
    /// secret store under the state directory.
    pub fn from_config(config: &Config, store: Arc<dyn JobStore>) -> Self {
        let stager = Arc::new(WorkspaceStager::from_config(config));
        Self {
            store,
            secrets: Arc::new(SecretStore::new(&config.state_dir, config.secrets.encrypt)),
            keys: Arc::new(PemKeyDecoder),
            agent: Arc::new(SshAgent::from_config(config)),
            sync: Arc::new(ScmProjectSync::new(
                config.scm.update_command.clone(),
                Arc::clone(&stager),
            )),
            stager,
            settings: ExecutorSettings::from_config(config),
        }
    }
}

enum Outcome {
    Successful,
    Failed(String),
    Canceled,
}

/// Run-scoped resources released by the finalizer.
#[derive(Default)]
struct Held {
    session: Option<Box<dyn AgentSession>>,
    paths: Option<JobPaths>,
}

/// Drives one job request from `pending` to a terminal status.
pub struct JobExecutor {
    request: JobRequest,
    ctx: Arc<ExecutorContext>,
    signals: JobSignals,
    phase: watch::Sender<JobStatus>,
    record: JobRecord,
}

impl JobExecutor {
    pub fn new(
        request: JobRequest,
        ctx: Arc<ExecutorContext>,
        signals: JobSignals,
        phase: watch::Sender<JobStatus>,
    ) -> Self {
        let record = JobRecord::new(request.id());
        Self {
            request,
            ctx,
            signals,
            phase,
            record,
        }
    }

    /// Execute the run and return its terminal record.
    pub async fn run(mut self) -> JobRecord {
        self.advance(JobStatus::Pending).await;
        let mut held = Held::default();
        let outcome = self.execute(&mut held).await;
        self.finish(outcome, held).await
    }

    async fn execute(&mut self, held: &mut Held) -> Outcome {
        if self.request.project.scm_update_on_launch {
            self.advance(JobStatus::Waiting).await;
            if let Some(outcome) = self.wait_for_sync().await {
                return outcome;
            }
        }

        // The scheduler may have routed the kill to the sync phase just
        // before the waiting loop returned.
        if self.kill_requested() {
            return Outcome::Canceled;
        }

        self.advance(JobStatus::Running).await;
        self.note(&format!("Job {} is running", self.request.id())).await;

        let paths = held.paths.insert(
            self.ctx
                .stager
                .stage(self.request.id(), &self.request.project.id),
        );

        let started = self.ctx.agent.start(&paths.credentials).await;
        let session = match started {
            Ok(session) => held.session.insert(session),
            Err(e) => return self.setup_failed("agent start", e.to_string()),
        };

        let loaded = self.load_keys(&**session).await;
        if let Err(e) = loaded {
            return self.setup_failed("key load", format!("{e:#}"));
        }

        let agent = AgentEndpoint {
            socket: session.socket_path(),
            pid: session.pid(),
        };
        let command = match build_command(
            &self.request,
            paths,
            agent,
            &self.ctx.settings.command,
            self.ctx.secrets.as_ref(),
        ) {
            Ok(command) => command,
            Err(e) => return self.setup_failed("command build", format!("{e:#}")),
        };
        self.record.job_args = vec![command.display_args()];
        self.record.job_env = command.persisted_env();

        if let Some(ticket) = &command.kerberos {
            let acquired = kinit(&self.ctx.settings.kinit, &ticket.principal, &ticket.password).await;
            if let Err(e) = acquired {
                return self.setup_failed("kerberos", e.to_string());
            }
        }

        self.supervise(&command).await
    }

    /// Wait on the antecedent sync job. `None` means it succeeded.
    async fn wait_for_sync(&mut self) -> Option<Outcome> {
        let launched = self.ctx.sync.update(&self.request.project).await;
        let handle = match launched {
            Ok(handle) => handle,
            Err(e) => {
                self.record.stdout = MISSING_STDOUT.to_string();
                return Some(Outcome::Failed(format!("Previous Task Failed: {e:#}")));
            }
        };
        debug!(job_id = %self.request.id(), sync_id = %handle.id, "waiting on project update");

        let signals = self.signals.clone();
        let mut poll = tokio::time::interval(self.ctx.settings.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = signals.sync.received() => {
                    signals.sync.acknowledge();
                    return Some(self.cancel_sync(&handle));
                }
                () = signals.main.received() => {
                    signals.main.acknowledge();
                    return Some(self.cancel_sync(&handle));
                }
                _ = poll.tick() => match handle.current() {
                    JobStatus::Successful => return None,
                    JobStatus::Failed | JobStatus::Error | JobStatus::Canceled => {
                        self.record.stdout = MISSING_STDOUT.to_string();
                        return Some(Outcome::Failed(dependency_failure(&handle)));
                    }
                    _ => {}
                },
            }
        }
    }

    fn cancel_sync(&self, handle: &SyncHandle) -> Outcome {
        if handle.cancel.send() {
            info!(job_id = %self.request.id(), sync_id = %handle.id, "project update canceled");
        }
        Outcome::Canceled
    }

    async fn load_keys(&self, session: &dyn AgentSession) -> Result<()> {
        let credentials = [
            self.request.machine_credential.as_ref(),
            self.request.network_credential.as_ref(),
        ];
        for credential in credentials.into_iter().flatten().filter(|c| c.has_key()) {
            let key = self.decode_key(credential)?;
            session.add_key(&key).await?;
        }
        Ok(())
    }

    fn decode_key(&self, credential: &Credential) -> Result<KeyMaterial> {
        let data = self.ctx.secrets.decrypt(&credential.ssh_key_data)?;
        let key = if credential.ssh_key_unlock.is_empty() {
            self.ctx.keys.decode(data.as_bytes())?
        } else {
            let passphrase = self.ctx.secrets.decrypt(&credential.ssh_key_unlock)?;
            self.ctx.keys.decode_encrypted(data.as_bytes(), &passphrase)?
        };
        Ok(key)
    }

    async fn supervise(&mut self, command: &ResolvedCommand) -> Outcome {
        if self.kill_requested() {
            return Outcome::Canceled;
        }

        let signals = self.signals.clone();
        let mut process = command.to_command();
        process
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = match process.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = ProcessError::Launch {
                    program: command.program.clone(),
                    message: e.to_string(),
                };
                return self.setup_failed("launch", err.to_string());
            }
        };
        info!(job_id = %self.request.id(), pid = child.id().unwrap_or_default(), "playbook started");

        let output = OutputBuffer::new(self.ctx.settings.output_cap);
        let readers: Vec<JoinHandle<()>> = [
            child.stdout.take().map(|pipe| output.capture(pipe)),
            child.stderr.take().map(|pipe| output.capture(pipe)),
        ]
        .into_iter()
        .flatten()
        .collect();

        let exit = tokio::select! {
            exit = child.wait() => Some(exit),
            () = signals.main.received() => None,
            () = signals.sync.received() => None,
        };

        let Some(exit) = exit else {
            if let Err(e) = child.kill().await {
                warn!(job_id = %self.request.id(), "{}", ProcessError::Kill(e.to_string()));
            }
            self.kill_requested();
            drain(readers).await;
            self.record.stdout = output.text();
            return Outcome::Canceled;
        };

        drain(readers).await;
        self.record.stdout = output.text();

        // A kill request that raced a natural exit still wins.
        if self.kill_requested() {
            return Outcome::Canceled;
        }

        match exit {
            Ok(status) if status.success() => Outcome::Successful,
            Ok(status) => Outcome::Failed(ProcessError::Exit(status.to_string()).to_string()),
            Err(e) => Outcome::Failed(format!("wait: {e}")),
        }
    }

    fn setup_failed(&mut self, stage: &str, explanation: String) -> Outcome {
        if self.kill_requested() {
            info!(job_id = %self.request.id(), stage, "run canceled during setup: {explanation}");
            return Outcome::Canceled;
        }
        warn!(job_id = %self.request.id(), stage, "run setup failed: {explanation}");
        self.record.stdout = MISSING_STDOUT.to_string();
        Outcome::Failed(explanation)
    }

    /// Consume a kill request sent on either phase signal.
    fn kill_requested(&self) -> bool {
        let mut requested = false;
        for signal in [&self.signals.main, &self.signals.sync] {
            if signal.is_sent() {
                signal.acknowledge();
                requested = true;
            }
        }
        requested
    }

    async fn finish(mut self, outcome: Outcome, held: Held) -> JobRecord {
        if let Some(session) = held.session {
            session.shutdown().await;
        }
        if let Some(paths) = held.paths {
            if !self.ctx.settings.retain_workspace {
                self.ctx.stager.cleanup(&paths);
            }
        }

        match outcome {
            Outcome::Successful => self.record.transition(JobStatus::Successful),
            Outcome::Failed(explanation) => self.record.fail(explanation),
            Outcome::Canceled => self.record.transition(JobStatus::Canceled),
        };
        self.phase.send_replace(self.record.status);
        self.persist().await;
        self.note(&format!("Job {} finished", self.request.id())).await;

        info!(
            job_id = %self.request.id(),
            status = %self.record.status,
            "job finished"
        );
        self.record
    }

    async fn advance(&mut self, status: JobStatus) {
        if self.record.transition(status) {
            self.phase.send_replace(status);
            self.persist().await;
            debug!(job_id = %self.request.id(), %status, "job status changed");
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.ctx.store.save(&self.record).await {
            warn!(job_id = %self.request.id(), "could not save job record: {e:#}");
        }
    }

    async fn note(&self, text: &str) {
        if let Err(e) = self
            .ctx
            .store
            .add_activity(self.request.id(), &self.request.user.id, text)
            .await
        {
            warn!(job_id = %self.request.id(), "could not write activity: {e:#}");
        }
    }
}

fn dependency_failure(handle: &SyncHandle) -> String {
    let name = serde_json::Value::String(handle.name.clone());
    let id = serde_json::Value::String(handle.id.clone());
    format!(
        r#"Previous Task Failed: {{"job_type": "project_update", "job_name": {name}, "job_id": {id}}}"#
    )
}

async fn drain(readers: Vec<JoinHandle<()>>) {
    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout(READER_GRACE, reader).await.is_err() {
            abort.abort();
        }
    }
}

use crate::cli::commands::{Cli, Commands, ConfigCommands, SecretsCommands};
use anyhow::{Context, Result, bail};
use playrun::Config;
use playrun::command::{AgentEndpoint, CommandSettings, build_command};
use playrun::credentials::SecretStore;
use playrun::executor::ExecutorContext;
use playrun::jobs::{JobRequest, JobStatus, JobStore, JsonJobStore};
use playrun::scheduler::{ExecutorDispatch, Scheduler, TickSource};
use playrun::workspace::WorkspaceStager;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub async fn dispatch(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Run { requests, records } => run_requests(&config, &requests, records).await,
        Commands::Plan { requests } => plan_requests(&config, &requests),
        Commands::Secrets {
            secrets_command: SecretsCommands::Encrypt { value },
        } => {
            let store = SecretStore::new(&config.state_dir, config.secrets.encrypt);
            println!("{}", store.encrypt(&value)?);
            Ok(())
        }
        Commands::Config {
            config_command: ConfigCommands::Show,
        } => {
            println!("# {}", config.config_path.display());
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Accepts either a single request object or an array of them.
fn load_requests(path: &Path) -> Result<Vec<JobRequest>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {}", path.display()))?;
    let requests = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    Ok(requests)
}

async fn run_requests(config: &Config, path: &Path, records: Option<PathBuf>) -> Result<()> {
    let requests = load_requests(path)?;
    if requests.is_empty() {
        bail!("No job requests in {}", path.display());
    }

    let records = records.unwrap_or_else(|| config.state_dir.join("jobs"));
    let store: Arc<dyn JobStore> = Arc::new(JsonJobStore::new(&records)?);
    let ctx = Arc::new(ExecutorContext::from_config(config, Arc::clone(&store)));
    let (results_tx, mut results) = mpsc::unbounded_channel();
    let scheduler = Scheduler::spawn(
        Arc::new(ExecutorDispatch::new(ctx).with_results(results_tx)),
        store,
        TickSource::Interval(Duration::from_millis(config.scheduler.tick_ms)),
    );

    let mut pending: BTreeSet<String> = BTreeSet::new();
    for request in requests {
        if !pending.insert(request.id().to_string()) {
            warn!(job_id = %request.id(), "duplicate job id in request file; skipping");
            continue;
        }
        scheduler.submit(request);
    }
    let total = pending.len();
    info!(jobs = total, "submitted");

    let mut failures = 0usize;
    while !pending.is_empty() {
        tokio::select! {
            record = results.recv() => {
                let Some(record) = record else { break };
                pending.remove(&record.id);
                if record.status != JobStatus::Successful {
                    failures += 1;
                }
                println!("{}\t{}\t{}", record.id, record.status, record.explanation);
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted; canceling remaining jobs");
                let snapshot = scheduler.snapshot().await;
                for id in &snapshot.queued {
                    if scheduler.cancel(id).await && pending.remove(id) {
                        failures += 1;
                        println!("{id}\t{}\t", JobStatus::Canceled);
                    }
                }
                for id in &snapshot.running {
                    scheduler.cancel(id).await;
                }
            }
        }
    }

    println!("Job records written to {}", records.display());
    if failures > 0 {
        bail!("{failures} of {total} jobs did not succeed");
    }
    Ok(())
}

fn plan_requests(config: &Config, path: &Path) -> Result<()> {
    let requests = load_requests(path)?;
    let settings = CommandSettings::from_config(config);
    let stager = WorkspaceStager::from_config(config);
    let secrets = SecretStore::new(&config.state_dir, config.secrets.encrypt);

    for request in &requests {
        let paths = stager.paths(&request.project.id);
        let socket = paths.credentials.join("agent.sock");
        let agent = AgentEndpoint {
            socket: &socket,
            pid: 0,
        };
        let command = build_command(request, &paths, agent, &settings, &secrets)
            .with_context(|| format!("Job {}", request.id()))?;

        println!("# job {}", request.id());
        println!("cd {}", command.working_dir.display());
        if let Some(ticket) = &command.kerberos {
            println!("{} {}", config.executables.kinit, ticket.principal);
        }
        println!("{} {}", command.program, command.display_args());
        for line in command.persisted_env() {
            println!("  {line}");
        }
        println!();
    }
    Ok(())
}

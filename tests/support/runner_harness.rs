#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use playrun::Config;
use playrun::executor::ExecutorContext;
use playrun::jobs::{Job, JobRecord, JobRequest, JobTemplate, JsonJobStore, Project};
use playrun::scheduler::{ExecutorDispatch, Scheduler, SchedulerHandle, TickSource};

pub const PROJECT_ID: &str = "proj-1";

/// Write an executable `/bin/sh` script into `dir` and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A runner wired to fake `ssh-agent`, `ssh-add`, `kinit` and playbook
/// executables inside a temp directory.
pub struct RunnerHarness {
    pub tmp: TempDir,
    pub config: Config,
}

impl RunnerHarness {
    pub fn new(playbook_body: &str) -> Self {
        let tmp = TempDir::new().unwrap();
        let bin = tmp.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();

        let playbook = write_script(&bin, "ansible-playbook", playbook_body);
        let agent = write_script(&bin, "ssh-agent", "touch \"$3\"\nexec sleep 30\n");
        let add = write_script(&bin, "ssh-add", "cat >> \"$SSH_AUTH_SOCK.keys\"\n");
        let kinit = write_script(&bin, "kinit", "cat >/dev/null\n");

        let mut config = Config::default();
        config.state_dir = tmp.path().join("state");
        config.paths.tmp_root = tmp.path().join("runs");
        config.paths.project_root = tmp.path().join("projects");
        config.executables.ansible_playbook = playbook.to_string_lossy().into_owned();
        config.executables.ssh_agent = agent.to_string_lossy().into_owned();
        config.executables.ssh_add = add.to_string_lossy().into_owned();
        config.executables.kinit = kinit.to_string_lossy().into_owned();
        config.scheduler.tick_ms = 20;
        config.dependency.poll_ms = 20;
        config.secrets.encrypt = false;
        std::fs::create_dir_all(config.paths.project_root.join(PROJECT_ID)).unwrap();

        Self { tmp, config }
    }

    pub fn project_dir(&self) -> PathBuf {
        self.config.paths.project_root.join(PROJECT_ID)
    }

    pub fn records_dir(&self) -> PathBuf {
        self.tmp.path().join("records")
    }

    /// Start a scheduler backed by real executors; terminal records arrive
    /// on the returned channel.
    pub fn start(
        &self,
        ticks: TickSource,
    ) -> (
        SchedulerHandle,
        mpsc::UnboundedReceiver<JobRecord>,
        Arc<JsonJobStore>,
    ) {
        let store = Arc::new(JsonJobStore::new(&self.records_dir()).unwrap());
        let ctx = Arc::new(ExecutorContext::from_config(&self.config, store.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Scheduler::spawn(
            Arc::new(ExecutorDispatch::new(ctx).with_results(tx)),
            store.clone(),
            ticks,
        );
        (handle, rx, store)
    }
}

pub fn request(id: &str, template: &str, simultaneous: bool) -> JobRequest {
    JobRequest {
        job: Job {
            id: id.into(),
            name: format!("{template} run"),
            job_type: "run".into(),
            launch_type: "manual".into(),
            allow_simultaneous: simultaneous,
            playbook: "site.yml".into(),
            ..Job::default()
        },
        template: JobTemplate {
            id: template.into(),
            name: template.into(),
        },
        project: Project {
            id: PROJECT_ID.into(),
            name: "infra".into(),
            scm_update_on_launch: false,
        },
        token: "api-token".into(),
        ..JobRequest::default()
    }
}

pub async fn next_record(rx: &mut mpsc::UnboundedReceiver<JobRecord>) -> JobRecord {
    tokio::time::timeout(Duration::from_secs(20), rx.recv())
        .await
        .expect("no job finished in time")
        .expect("result channel closed")
}

pub async fn wait_for_file(path: &Path) {
    for _ in 0..1000 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never appeared", path.display());
}

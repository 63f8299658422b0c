//! Per-run temporary directories.

use crate::config::Config;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const DIR_MODE: u32 = 0o770;

/// Every directory one run may touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    /// Parent of the isolated tree (etc, tmp, var/...).
    pub run_root: PathBuf,
    pub etc: PathBuf,
    pub tmp: PathBuf,
    pub var_lib: PathBuf,
    pub var_lib_job_status: PathBuf,
    pub var_lib_projects: PathBuf,
    pub var_log: PathBuf,
    pub scratch: PathBuf,
    /// Holds the key agent socket.
    pub credentials: PathBuf,
    /// Project checkout; shared between runs and never staged or removed here.
    pub project_root: PathBuf,
}

impl JobPaths {
    fn staged(&self) -> [&Path; 9] {
        [
            &self.etc,
            &self.credentials,
            &self.tmp,
            &self.scratch,
            &self.var_lib,
            &self.var_lib_job_status,
            &self.var_lib_projects,
            &self.var_log,
            &self.run_root,
        ]
    }

    fn disposable_roots(&self) -> [&Path; 3] {
        [&self.run_root, &self.scratch, &self.credentials]
    }
}

pub struct WorkspaceStager {
    tmp_root: PathBuf,
    project_root: PathBuf,
}

fn unique() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Keep a record id usable as a single path component.
pub(crate) fn path_component(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        format!("_{cleaned}")
    } else {
        cleaned
    }
}

impl WorkspaceStager {
    pub fn new(tmp_root: &Path, project_root: &Path) -> Self {
        Self {
            tmp_root: tmp_root.to_path_buf(),
            project_root: project_root.to_path_buf(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.paths.tmp_root, &config.paths.project_root)
    }

    /// Checkout directory for a project.
    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.project_root.join(path_component(project_id))
    }

    /// Derive fresh paths; every call yields new random suffixes.
    pub fn paths(&self, project_id: &str) -> JobPaths {
        let run_root = self.tmp_root.join(format!("playrun_proot_{}", unique()));
        JobPaths {
            etc: run_root.join(unique()),
            tmp: run_root.join(unique()),
            var_lib: run_root.join(unique()),
            var_lib_job_status: run_root.join(unique()),
            var_lib_projects: run_root.join(unique()),
            var_log: run_root.join(unique()),
            scratch: self.tmp_root.join(format!("playrun__{}", unique())),
            credentials: self.tmp_root.join(format!("playrun_{}", unique())),
            project_root: self.project_dir(project_id),
            run_root,
        }
    }

    /// Derive and create the run's directories. Creation failures are logged
    /// and otherwise ignored; the playbook may create them lazily.
    pub fn stage(&self, job_id: &str, project_id: &str) -> JobPaths {
        let paths = self.paths(project_id);
        for dir in paths.staged() {
            if let Err(e) = create_dir(dir) {
                tracing::warn!(job_id = %job_id, dir = %dir.display(), "Unable to create directory: {e}");
            }
        }
        tracing::debug!(job_id = %job_id, root = %paths.run_root.display(), "workspace staged");
        paths
    }

    /// Remove the run's temporary trees. The project checkout is left alone.
    pub fn cleanup(&self, paths: &JobPaths) {
        for root in paths.disposable_roots() {
            match std::fs::remove_dir_all(root) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(dir = %root.display(), "Unable to remove directory: {e}");
                }
            }
        }
    }
}

#[cfg(unix)]
fn create_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(dir)
}

#[cfg(not(unix))]
fn create_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

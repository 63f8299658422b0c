use crate::error::ConfigError;
use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const STATE_DIR_NAME: &str = ".playrun";

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,
    /// Runner state directory (secret key, job records) - not serialized
    #[serde(skip)]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub dependency: DependencyConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub executables: ExecutablesConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub environment: EnvironmentConfig,

    #[serde(default)]
    pub workspace: WorkspaceConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub scm: ScmConfig,

    #[serde(default)]
    pub extras: ExtrasConfig,
}

// ── Scheduler ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between dispatch checks of the queue head (default: 2000ms)
    #[serde(default = "default_interval_ms")]
    pub tick_ms: u64,
}

fn default_interval_ms() -> u64 {
    2000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_interval_ms(),
        }
    }
}

// ── Dependency (project sync) ───────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyConfig {
    /// Interval between status polls of the antecedent sync job (default: 2000ms)
    #[serde(default = "default_interval_ms")]
    pub poll_ms: u64,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            poll_ms: default_interval_ms(),
        }
    }
}

// ── Filesystem layout ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Parent of every per-run temporary directory
    #[serde(default = "default_tmp_root")]
    pub tmp_root: PathBuf,
    /// Project checkouts live at `<project_root>/<project id>`
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,
    /// Exported to the playbook as HOME_PATH
    #[serde(default = "default_home_path")]
    pub home_path: PathBuf,
    /// Dynamic inventory script passed with `-i`
    #[serde(default = "default_inventory_plugin")]
    pub inventory_plugin: PathBuf,
    /// Exported as ANSIBLE_CALLBACK_PLUGINS
    #[serde(default = "default_callback_plugins")]
    pub callback_plugins: PathBuf,
}

fn default_tmp_root() -> PathBuf {
    std::env::temp_dir()
}

fn default_project_root() -> PathBuf {
    PathBuf::from("/opt/playrun/projects")
}

fn default_home_path() -> PathBuf {
    PathBuf::from("/opt/playrun/")
}

fn default_inventory_plugin() -> PathBuf {
    PathBuf::from("/opt/playrun/plugins/inventory/restinventory.py")
}

fn default_callback_plugins() -> PathBuf {
    PathBuf::from("/opt/playrun/plugins/callback")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            tmp_root: default_tmp_root(),
            project_root: default_project_root(),
            home_path: default_home_path(),
            inventory_plugin: default_inventory_plugin(),
            callback_plugins: default_callback_plugins(),
        }
    }
}

impl PathsConfig {
    fn expand_in_place(&mut self) {
        for path in [
            &mut self.tmp_root,
            &mut self.project_root,
            &mut self.home_path,
            &mut self.inventory_plugin,
            &mut self.callback_plugins,
        ] {
            *path = expand_path(path);
        }
    }
}

// ── External executables ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutablesConfig {
    #[serde(default = "default_ansible_playbook")]
    pub ansible_playbook: String,
    #[serde(default = "default_ssh_agent")]
    pub ssh_agent: String,
    #[serde(default = "default_ssh_add")]
    pub ssh_add: String,
    #[serde(default = "default_kinit")]
    pub kinit: String,
}

fn default_ansible_playbook() -> String {
    "ansible-playbook".into()
}

fn default_ssh_agent() -> String {
    "ssh-agent".into()
}

fn default_ssh_add() -> String {
    "ssh-add".into()
}

fn default_kinit() -> String {
    "kinit".into()
}

impl Default for ExecutablesConfig {
    fn default() -> Self {
        Self {
            ansible_playbook: default_ansible_playbook(),
            ssh_agent: default_ssh_agent(),
            ssh_add: default_ssh_add(),
            kinit: default_kinit(),
        }
    }
}

// ── Key agent ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// How long to wait for the agent socket to appear (default: 5000ms)
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
}

fn default_socket_timeout_ms() -> u64 {
    5000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            socket_timeout_ms: default_socket_timeout_ms(),
        }
    }
}

// ── Playbook process environment ────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Exported as REST_API_URL for the inventory and callback plugins
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_search_path")]
    pub path: String,
    #[serde(default = "default_home")]
    pub home: String,
    /// Keep the plaintext API token in the persisted environment record
    #[serde(default)]
    pub persist_api_token: bool,
    /// Additional variables overlaid on the base map
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

fn default_api_url() -> String {
    "http://localhost:8010".into()
}

fn default_search_path() -> String {
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".into()
}

fn default_home() -> String {
    "/root".into()
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            path: default_search_path(),
            home: default_home(),
            persist_api_token: false,
            extra: BTreeMap::new(),
        }
    }
}

// ── Workspace lifecycle ─────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Keep staged directories after the run for postmortem inspection
    #[serde(default)]
    pub retain_after_run: bool,
}

// ── Output capture ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Cap on captured output; 0 keeps everything
    #[serde(default)]
    pub max_bytes: usize,
}

// ── Secrets (encrypted credential fields) ───────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Encrypt values produced by `playrun secrets encrypt`
    #[serde(default = "default_true")]
    pub encrypt: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self { encrypt: true }
    }
}

// ── SCM project sync ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScmConfig {
    /// Command run inside the project checkout for update-on-launch
    #[serde(default = "default_update_command")]
    pub update_command: Vec<String>,
}

fn default_update_command() -> Vec<String> {
    vec!["git".into(), "pull".into(), "--ff-only".into()]
}

impl Default for ScmConfig {
    fn default() -> Self {
        Self {
            update_command: default_update_command(),
        }
    }
}

// ── Machine-readable extra vars ─────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtrasConfig {
    #[serde(default = "default_extras_prefix")]
    pub prefix: String,
    #[serde(default = "default_operator_name")]
    pub operator_name: String,
}

fn default_extras_prefix() -> String {
    "playrun_".into()
}

fn default_operator_name() -> String {
    "admin".into()
}

impl Default for ExtrasConfig {
    fn default() -> Self {
        Self {
            prefix: default_extras_prefix(),
            operator_name: default_operator_name(),
        }
    }
}

// ── Loading / saving ────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            state_dir: PathBuf::new(),
            scheduler: SchedulerConfig::default(),
            dependency: DependencyConfig::default(),
            paths: PathsConfig::default(),
            executables: ExecutablesConfig::default(),
            agent: AgentConfig::default(),
            environment: EnvironmentConfig::default(),
            workspace: WorkspaceConfig::default(),
            output: OutputConfig::default(),
            secrets: SecretsConfig::default(),
            scm: ScmConfig::default(),
            extras: ExtrasConfig::default(),
        }
    }
}

fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).into_owned())
}

impl Config {
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        let state_dir = home.join(STATE_DIR_NAME);
        let config_path = state_dir.join("config.toml");

        if !state_dir.exists() {
            fs::create_dir_all(&state_dir).context("Failed to create .playrun directory")?;
        }

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Self {
                config_path,
                state_dir,
                ..Self::default()
            };
            config.validate()?;
            config.save()?;
            Ok(config)
        }
    }

    /// Load an explicit config file; its directory becomes the state directory.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("{}: {e}", path.display())))?;
        let mut config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
        config.config_path = path.to_path_buf();
        config.state_dir = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        config.paths.expand_in_place();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&self.config_path, toml_str).context("Failed to write config file")?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PLAYRUN_API_URL") {
            if !url.is_empty() {
                self.environment.api_url = url;
            }
        }

        if let Ok(bin) = std::env::var("PLAYRUN_ANSIBLE_PLAYBOOK") {
            if !bin.is_empty() {
                self.executables.ansible_playbook = bin;
            }
        }

        if let Ok(root) = std::env::var("PLAYRUN_PROJECT_ROOT") {
            if !root.is_empty() {
                self.paths.project_root = expand_path(Path::new(&root));
            }
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.scheduler.tick_ms == 0 {
            return Err(ConfigError::Validation(
                "scheduler.tick_ms must be greater than 0".into(),
            ));
        }
        if self.dependency.poll_ms == 0 {
            return Err(ConfigError::Validation(
                "dependency.poll_ms must be greater than 0".into(),
            ));
        }

        let executables = [
            ("executables.ansible_playbook", &self.executables.ansible_playbook),
            ("executables.ssh_agent", &self.executables.ssh_agent),
            ("executables.ssh_add", &self.executables.ssh_add),
            ("executables.kinit", &self.executables.kinit),
        ];
        for (key, value) in executables {
            if value.trim().is_empty() {
                return Err(ConfigError::Validation(format!("{key} must not be empty")));
            }
        }

        if self.scm.update_command.is_empty() {
            return Err(ConfigError::Validation(
                "scm.update_command must name a program".into(),
            ));
        }
        Ok(())
    }
}

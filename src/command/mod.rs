//! Translate a job request into the playbook invocation.
//!
//! The argument list is split in two: arguments that are safe to persist
//! and display, and secret arguments carrying decrypted passwords that only
//! ever reach the live process.

use crate::config::Config;
use crate::credentials::Decrypt;
use crate::error::{CredentialError, RunnerError};
use crate::jobs::{CredentialKind, JobRequest};
use crate::workspace::JobPaths;
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const REDACTED: &str = "<redacted>";
const TOKEN_VAR: &str = "REST_API_TOKEN";

/// Everything the builder needs from configuration.
#[derive(Debug, Clone)]
pub struct CommandSettings {
    pub program: String,
    pub inventory_plugin: PathBuf,
    pub callback_plugins: PathBuf,
    pub home_path: PathBuf,
    pub api_url: String,
    pub search_path: String,
    pub home: String,
    pub extra_env: BTreeMap<String, String>,
    pub persist_api_token: bool,
    pub extras_prefix: String,
    pub operator_name: String,
}

impl CommandSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.executables.ansible_playbook.clone(),
            inventory_plugin: config.paths.inventory_plugin.clone(),
            callback_plugins: config.paths.callback_plugins.clone(),
            home_path: config.paths.home_path.clone(),
            api_url: config.environment.api_url.clone(),
            search_path: config.environment.path.clone(),
            home: config.environment.home.clone(),
            extra_env: config.environment.extra.clone(),
            persist_api_token: config.environment.persist_api_token,
            extras_prefix: config.extras.prefix.clone(),
            operator_name: config.extras.operator_name.clone(),
        }
    }
}

/// Where the playbook finds the job's key agent.
#[derive(Debug, Clone, Copy)]
pub struct AgentEndpoint<'a> {
    pub socket: &'a Path,
    pub pid: u32,
}

/// Windows credentials authenticate through a Kerberos ticket obtained
/// before the playbook starts.
pub struct KerberosRequest {
    pub principal: String,
    pub password: Zeroizing<String>,
}

impl fmt::Debug for KerberosRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KerberosRequest")
            .field("principal", &self.principal)
            .field("password", &REDACTED)
            .finish()
    }
}

pub struct ResolvedCommand {
    pub program: String,
    /// Non-secret arguments, in order.
    pub args: Vec<String>,
    secret_args: Vec<Zeroizing<String>>,
    /// Machine-readable job metadata, always last before the playbook.
    pub extras: Vec<String>,
    pub playbook: String,
    pub env: Vec<(String, String)>,
    pub working_dir: PathBuf,
    pub kerberos: Option<KerberosRequest>,
    persist_api_token: bool,
}

impl ResolvedCommand {
    /// Arguments as recorded on the job: secret arguments excluded.
    pub fn display_args(&self) -> String {
        self.args
            .iter()
            .chain(self.extras.iter())
            .map(String::as_str)
            .chain(std::iter::once(self.playbook.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn secret_args(&self) -> impl Iterator<Item = &str> {
        self.secret_args.iter().map(|arg| arg.as_str())
    }

    /// The real process argument vector.
    pub fn live_args(&self) -> impl Iterator<Item = &str> {
        self.args
            .iter()
            .map(String::as_str)
            .chain(self.secret_args())
            .chain(self.extras.iter().map(String::as_str))
            .chain(std::iter::once(self.playbook.as_str()))
    }

    /// Environment as `KEY=value` lines for the job record.
    pub fn persisted_env(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(key, value)| {
                if key == TOKEN_VAR && !self.persist_api_token {
                    format!("{key}={REDACTED}")
                } else {
                    format!("{key}={value}")
                }
            })
            .collect()
    }

    /// A ready-to-spawn command with a clean environment.
    pub fn to_command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(self.live_args())
            .current_dir(&self.working_dir)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        command
    }
}

impl fmt::Debug for ResolvedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCommand")
            .field("program", &self.program)
            .field("args", &self.display_args())
            .field("secret_args", &self.secret_args.len())
            .field("working_dir", &self.working_dir)
            .field("kerberos", &self.kerberos)
            .finish_non_exhaustive()
    }
}

fn verbosity_flag(level: u8) -> Option<&'static str> {
    // Level 5 shares level 4's flag.
    match level {
        0 => None,
        1 => Some("-v"),
        2 => Some("-vv"),
        3 => Some("-vvv"),
        _ => Some("-vvvv"),
    }
}

fn playbook_params(request: &JobRequest, settings: &CommandSettings) -> Result<Vec<String>> {
    let job = &request.job;
    let mut params = vec![
        "-i".to_string(),
        settings.inventory_plugin.to_string_lossy().into_owned(),
    ];

    if job.job_type == "check" {
        params.push("--check".into());
    }

    if job.forks != 0 {
        params.push("-f".into());
        params.push(job.forks.to_string());
    }

    if !job.limit.is_empty() {
        params.push("-l".into());
        params.push(job.limit.clone());
    }

    if let Some(flag) = verbosity_flag(job.verbosity) {
        params.push(flag.into());
    }

    if !job.extra_vars.is_empty() {
        let vars = serde_json::to_string(&job.extra_vars).context("Could not marshal extra vars")?;
        params.push("-e".into());
        params.push(vars);
    }

    if !job.job_tags.is_empty() {
        params.push("-t".into());
        params.push(job.job_tags.clone());
    }

    if !job.skip_tags.is_empty() {
        params.push(format!("--skip-tags={}", job.skip_tags));
    }

    if job.force_handlers {
        params.push("--force-handlers".into());
    }

    if !job.start_at_task.is_empty() {
        params.push(format!("--start-at-task={}", job.start_at_task));
    }

    Ok(params)
}

fn system_extras(request: &JobRequest, settings: &CommandSettings) -> Result<String> {
    let prefix = &settings.extras_prefix;
    let mut extras = Map::new();
    let mut put = |key: &str, value: &str| {
        extras.insert(format!("{prefix}{key}"), Value::String(value.to_string()));
    };
    put("job_template_name", &request.template.name);
    put("job_id", &request.job.id);
    put("user_id", &request.job.created_by_id);
    put("job_template_id", &request.template.id);
    put("user_name", &settings.operator_name);
    put("job_launch_type", &request.job.launch_type);
    serde_json::to_string(&extras).context("Error while marshalling parameters")
}

fn environment(
    request: &JobRequest,
    paths: &JobPaths,
    agent: AgentEndpoint<'_>,
    settings: &CommandSettings,
) -> Vec<(String, String)> {
    let project = paths.project_root.to_string_lossy().into_owned();
    let mut env: Vec<(String, String)> = [
        ("TERM", "xterm".to_string()),
        ("PROJECT_PATH", project.clone()),
        ("HOME_PATH", settings.home_path.to_string_lossy().into_owned()),
        ("PWD", project),
        ("SHLVL", "1".to_string()),
        ("HOME", settings.home.clone()),
        ("PATH", settings.search_path.clone()),
        (TOKEN_VAR, request.token.clone()),
        ("ANSIBLE_PARAMIKO_RECORD_HOST_KEYS", "False".to_string()),
        (
            "ANSIBLE_CALLBACK_PLUGINS",
            settings.callback_plugins.to_string_lossy().into_owned(),
        ),
        ("ANSIBLE_HOST_KEY_CHECKING", "False".to_string()),
        ("JOB_ID", request.job.id.clone()),
        ("ANSIBLE_FORCE_COLOR", "True".to_string()),
        ("REST_API_URL", settings.api_url.clone()),
        ("INVENTORY_HOSTVARS", "True".to_string()),
        ("INVENTORY_ID", request.inventory.id.clone()),
        ("SSH_AUTH_SOCK", agent.socket.to_string_lossy().into_owned()),
        ("SSH_AGENT_PID", agent.pid.to_string()),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value))
    .collect();

    for (key, value) in &settings.extra_env {
        match env.iter_mut().find(|(existing, _)| existing == key) {
            Some(slot) => slot.1.clone_from(value),
            None => env.push((key.clone(), value.clone())),
        }
    }
    env
}

/// Build the playbook invocation for one run.
///
/// Only decryption happens here; Kerberos tickets are left to the caller via
/// [`ResolvedCommand::kerberos`].
/// Decryption failures keep their credential classification for callers.
fn decrypt_with(secrets: &dyn Decrypt, value: &str) -> crate::Result<Zeroizing<String>> {
    secrets
        .decrypt(value)
        .map_err(|err| match err.downcast::<CredentialError>() {
            Ok(credential) => RunnerError::Credential(credential),
            Err(other) => RunnerError::Other(other),
        })
}

pub fn build_command(
    request: &JobRequest,
    paths: &JobPaths,
    agent: AgentEndpoint<'_>,
    settings: &CommandSettings,
    secrets: &dyn Decrypt,
) -> crate::Result<ResolvedCommand> {
    let mut args = playbook_params(request, settings)?;
    let mut secret_args: Vec<Zeroizing<String>> = Vec::new();
    let mut kerberos = None;

    if let Some(cred) = request
        .machine_credential
        .as_ref()
        .filter(|c| !c.username.is_empty())
    {
        args.push("-u".into());
        args.push(cred.principal());

        if !cred.password.is_empty() {
            match cred.kind {
                CredentialKind::Ssh => {
                    let password = decrypt_with(secrets, &cred.password)?;
                    secret_args.push(Zeroizing::new("-e".into()));
                    secret_args.push(Zeroizing::new(format!(
                        "ansible_ssh_pass={}",
                        password.as_str()
                    )));
                }
                CredentialKind::Windows => {
                    kerberos = Some(KerberosRequest {
                        principal: cred.principal(),
                        password: decrypt_with(secrets, &cred.password)?,
                    });
                }
                CredentialKind::Network | CredentialKind::Scm => {}
            }
        }
    }

    if request.job.become_enabled {
        args.push("-b".into());
        if let Some(cred) = request.machine_credential.as_ref() {
            // Defaults (sudo, root) are left to the playbook engine.
            if !cred.become_method.is_empty() {
                args.push(format!("--become-method={}", cred.become_method));
            }
            if !cred.become_username.is_empty() {
                args.push(format!("--become-user={}", cred.become_username));
            }
            if !cred.become_password.is_empty() {
                let password = decrypt_with(secrets, &cred.become_password)?;
                secret_args.push(Zeroizing::new("-e".into()));
                secret_args.push(Zeroizing::new(format!(
                    "ansible_become_pass={}",
                    password.as_str()
                )));
            }
        }
    }

    let extras = vec!["-e".to_string(), system_extras(request, settings)?];

    Ok(ResolvedCommand {
        program: settings.program.clone(),
        args,
        secret_args,
        extras,
        playbook: request.job.playbook.clone(),
        env: environment(request, paths, agent, settings),
        working_dir: paths.project_root.clone(),
        kerberos,
        persist_api_token: settings.persist_api_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Credential, Job, JobTemplate};
    use crate::workspace::WorkspaceStager;
    use std::path::Path;

    /// Decrypts `ENC:<plain>` by stripping the prefix.
    struct PrefixDecrypt;

    impl Decrypt for PrefixDecrypt {
        fn decrypt(&self, ciphertext: &str) -> Result<Zeroizing<String>> {
            let plain = ciphertext
                .strip_prefix("ENC:")
                .ok_or_else(|| anyhow::anyhow!("cipher: message authentication failed"))?;
            Ok(Zeroizing::new(plain.to_string()))
        }
    }

    fn settings() -> CommandSettings {
        CommandSettings::from_config(&Config::default())
    }

    fn request() -> JobRequest {
        JobRequest {
            job: Job {
                id: "job-1".into(),
                name: "deploy web".into(),
                job_type: "run".into(),
                launch_type: "manual".into(),
                playbook: "site.yml".into(),
                created_by_id: "user-7".into(),
                ..Job::default()
            },
            template: JobTemplate {
                id: "tmpl-3".into(),
                name: "deploy".into(),
            },
            token: "api-token-xyz".into(),
            ..JobRequest::default()
        }
    }

    fn build(request: &JobRequest) -> ResolvedCommand {
        let stager = WorkspaceStager::new(Path::new("/tmp"), Path::new("/opt/playrun/projects"));
        let paths = stager.paths("proj-1");
        let agent = AgentEndpoint {
            socket: Path::new("/tmp/playrun_x/agent.sock"),
            pid: 4242,
        };
        build_command(request, &paths, agent, &settings(), &PrefixDecrypt).unwrap()
    }

    fn v_count(command: &ResolvedCommand) -> usize {
        command
            .args
            .iter()
            .find(|a| a.starts_with("-v"))
            .map_or(0, |a| a.len() - 1)
    }

    #[test]
    fn inventory_is_always_first() {
        let command = build(&request());
        assert_eq!(command.args[0], "-i");
        assert_eq!(command.args[1], "/opt/playrun/plugins/inventory/restinventory.py");
        assert_eq!(command.args.len(), 2);
    }

    #[test]
    fn verbosity_levels_map_to_flag_counts() {
        let expected = [0, 1, 2, 3, 4, 4];
        for (level, count) in expected.iter().enumerate() {
            let mut req = request();
            req.job.verbosity = u8::try_from(level).unwrap();
            assert_eq!(v_count(&build(&req)), *count, "verbosity {level}");
        }
    }

    #[test]
    fn optional_flags_follow_job_fields_in_order() {
        let mut req = request();
        req.job.job_type = "check".into();
        req.job.forks = 10;
        req.job.limit = "web*".into();
        req.job.verbosity = 2;
        req.job.extra_vars.insert("release".into(), serde_json::json!("1.4.2"));
        req.job.job_tags = "deploy".into();
        req.job.skip_tags = "slow".into();
        req.job.force_handlers = true;
        req.job.start_at_task = "restart app".into();

        let command = build(&req);
        assert_eq!(
            command.args,
            vec![
                "-i",
                "/opt/playrun/plugins/inventory/restinventory.py",
                "--check",
                "-f",
                "10",
                "-l",
                "web*",
                "-vv",
                "-e",
                r#"{"release":"1.4.2"}"#,
                "-t",
                "deploy",
                "--skip-tags=slow",
                "--force-handlers",
                "--start-at-task=restart app",
            ]
        );
    }

    #[test]
    fn extras_come_last_before_playbook() {
        let command = build(&request());
        let live: Vec<&str> = command.live_args().collect();
        let n = live.len();
        assert_eq!(live[n - 1], "site.yml");
        assert_eq!(live[n - 3], "-e");
        let extras: serde_json::Value = serde_json::from_str(live[n - 2]).unwrap();
        assert_eq!(extras["playrun_job_id"], "job-1");
        assert_eq!(extras["playrun_job_template_id"], "tmpl-3");
        assert_eq!(extras["playrun_job_template_name"], "deploy");
        assert_eq!(extras["playrun_user_id"], "user-7");
        assert_eq!(extras["playrun_user_name"], "admin");
        assert_eq!(extras["playrun_job_launch_type"], "manual");
    }

    #[test]
    fn ssh_password_is_secret_only() {
        let mut req = request();
        req.machine_credential = Some(Credential {
            kind: CredentialKind::Ssh,
            username: "deploy".into(),
            domain: "corp".into(),
            password: "ENC:hunter2".into(),
            ..Credential::default()
        });

        let command = build(&req);
        let secrets: Vec<&str> = command.secret_args().collect();
        assert_eq!(secrets, vec!["-e", "ansible_ssh_pass=hunter2"]);
        assert!(!command.display_args().contains("hunter2"));
        assert!(command.display_args().contains("-u deploy@corp"));
        assert!(command.live_args().any(|a| a == "ansible_ssh_pass=hunter2"));
        assert!(command.kerberos.is_none());
    }

    #[test]
    fn windows_password_requests_kerberos_ticket() {
        let mut req = request();
        req.machine_credential = Some(Credential {
            kind: CredentialKind::Windows,
            username: "svc".into(),
            domain: "CORP.EXAMPLE".into(),
            password: "ENC:winpass".into(),
            ..Credential::default()
        });

        let command = build(&req);
        assert_eq!(command.secret_args().count(), 0);
        let ticket = command.kerberos.as_ref().unwrap();
        assert_eq!(ticket.principal, "svc@CORP.EXAMPLE");
        assert_eq!(ticket.password.as_str(), "winpass");
        assert!(!format!("{command:?}").contains("winpass"));
    }

    #[test]
    fn become_settings_and_secret_password() {
        let mut req = request();
        req.job.become_enabled = true;
        req.machine_credential = Some(Credential {
            username: "deploy".into(),
            become_method: "su".into(),
            become_username: "app".into(),
            become_password: "ENC:rootpw".into(),
            ..Credential::default()
        });

        let command = build(&req);
        let display = command.display_args();
        assert!(display.contains("-b --become-method=su --become-user=app"));
        assert!(!display.contains("rootpw"));
        let secrets: Vec<&str> = command.secret_args().collect();
        assert_eq!(secrets, vec!["-e", "ansible_become_pass=rootpw"]);
    }

    #[test]
    fn display_string_excludes_every_secret() {
        let mut req = request();
        req.job.become_enabled = true;
        req.machine_credential = Some(Credential {
            kind: CredentialKind::Ssh,
            username: "deploy".into(),
            password: "ENC:sshpw".into(),
            become_password: "ENC:becomepw".into(),
            ..Credential::default()
        });

        let command = build(&req);
        let display = command.display_args();
        assert!(!display.contains("sshpw"));
        assert!(!display.contains("becomepw"));
        assert!(display.ends_with(" site.yml"));

        let live: Vec<&str> = command.live_args().collect();
        assert!(live.contains(&"ansible_ssh_pass=sshpw"));
        assert!(live.contains(&"ansible_become_pass=becomepw"));
    }

    #[test]
    fn decrypt_failure_is_an_error() {
        let mut req = request();
        req.machine_credential = Some(Credential {
            username: "deploy".into(),
            password: "garbage".into(),
            ..Credential::default()
        });
        let stager = WorkspaceStager::new(Path::new("/tmp"), Path::new("/opt"));
        let paths = stager.paths("p");
        let agent = AgentEndpoint {
            socket: Path::new("/tmp/s"),
            pid: 1,
        };
        let err = build_command(&req, &paths, agent, &settings(), &PrefixDecrypt).unwrap_err();
        assert!(matches!(err, RunnerError::Other(_)));
        assert!(err.to_string().contains("message authentication failed"));
    }

    #[test]
    fn secret_store_failure_is_a_credential_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = crate::credentials::SecretStore::new(tmp.path(), true);
        let mut req = request();
        req.machine_credential = Some(Credential {
            username: "deploy".into(),
            become_password: "ENC:zz".into(),
            ..Credential::default()
        });
        req.job.become_enabled = true;
        let stager = WorkspaceStager::new(Path::new("/tmp"), Path::new("/opt"));
        let paths = stager.paths("p");
        let agent = AgentEndpoint {
            socket: Path::new("/tmp/s"),
            pid: 1,
        };

        let err = build_command(&req, &paths, agent, &settings(), &store).unwrap_err();
        assert!(matches!(
            err,
            RunnerError::Credential(CredentialError::Decrypt(_))
        ));
        assert!(err.to_string().starts_with("credential: decryption failed"));
    }

    #[test]
    fn environment_carries_run_values() {
        let mut req = request();
        req.inventory.id = "inv-5".into();
        let command = build(&req);
        let env: BTreeMap<&str, &str> = command
            .env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        assert_eq!(env["JOB_ID"], "job-1");
        assert_eq!(env["INVENTORY_ID"], "inv-5");
        assert_eq!(env["SSH_AUTH_SOCK"], "/tmp/playrun_x/agent.sock");
        assert_eq!(env["SSH_AGENT_PID"], "4242");
        assert_eq!(env["PROJECT_PATH"], "/opt/playrun/projects/proj-1");
        assert_eq!(env["PWD"], "/opt/playrun/projects/proj-1");
        assert_eq!(env["REST_API_TOKEN"], "api-token-xyz");
        assert_eq!(env["ANSIBLE_HOST_KEY_CHECKING"], "False");
        assert_eq!(
            command.working_dir,
            Path::new("/opt/playrun/projects/proj-1")
        );
    }

    #[test]
    fn persisted_env_masks_token_unless_enabled() {
        let command = build(&request());
        let persisted = command.persisted_env();
        assert!(persisted.contains(&"REST_API_TOKEN=<redacted>".to_string()));
        assert!(persisted.contains(&"JOB_ID=job-1".to_string()));
        assert_eq!(persisted.len(), command.env.len());

        let mut s = settings();
        s.persist_api_token = true;
        let stager = WorkspaceStager::new(Path::new("/tmp"), Path::new("/opt"));
        let paths = stager.paths("p");
        let agent = AgentEndpoint {
            socket: Path::new("/tmp/s"),
            pid: 1,
        };
        let command = build_command(&request(), &paths, agent, &s, &PrefixDecrypt).unwrap();
        assert!(
            command
                .persisted_env()
                .contains(&"REST_API_TOKEN=api-token-xyz".to_string())
        );
    }

    #[test]
    fn extra_env_overrides_and_extends_base_map() {
        let mut s = settings();
        s.extra_env.insert("TERM".into(), "dumb".into());
        s.extra_env.insert("ANSIBLE_TIMEOUT".into(), "30".into());
        let stager = WorkspaceStager::new(Path::new("/tmp"), Path::new("/opt"));
        let paths = stager.paths("p");
        let agent = AgentEndpoint {
            socket: Path::new("/tmp/s"),
            pid: 1,
        };
        let command = build_command(&request(), &paths, agent, &s, &PrefixDecrypt).unwrap();

        assert_eq!(command.env[0], ("TERM".to_string(), "dumb".to_string()));
        assert_eq!(
            command.env.last().unwrap(),
            &("ANSIBLE_TIMEOUT".to_string(), "30".to_string())
        );
    }
}

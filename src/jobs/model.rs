use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of one job run.
///
/// `successful`, `failed`, `error` and `canceled` are terminal and absorbing.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    #[default]
    New,
    Pending,
    Waiting,
    Running,
    Successful,
    Failed,
    Error,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Successful | Self::Failed | Self::Error | Self::Canceled
        )
    }
}

/// Credential flavour; decides how a password reaches the playbook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    /// Posix host reached over ssh; a password becomes `ansible_ssh_pass`.
    #[default]
    Ssh,
    /// Windows host; a password is exchanged for a Kerberos ticket.
    Windows,
    Network,
    Scm,
}

/// Credential as stored; every secret field holds ciphertext.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credential {
    pub id: String,
    pub kind: CredentialKind,
    pub username: String,
    pub domain: String,
    pub password: String,
    pub ssh_key_data: String,
    pub ssh_key_unlock: String,
    pub become_method: String,
    pub become_username: String,
    pub become_password: String,
}

impl Credential {
    /// `user` or `user@domain`.
    pub fn principal(&self) -> String {
        if self.domain.is_empty() {
            self.username.clone()
        } else {
            format!("{}@{}", self.username, self.domain)
        }
    }

    pub fn has_key(&self) -> bool {
        !self.ssh_key_data.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("username", &self.username)
            .field("domain", &self.domain)
            .field("has_password", &!self.password.is_empty())
            .field("has_key", &self.has_key())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Job {
    pub id: String,
    pub name: String,
    /// "run" or "check"
    pub job_type: String,
    pub launch_type: String,
    pub forks: u32,
    pub limit: String,
    pub verbosity: u8,
    pub extra_vars: serde_json::Map<String, serde_json::Value>,
    pub job_tags: String,
    pub skip_tags: String,
    pub force_handlers: bool,
    pub start_at_task: String,
    pub become_enabled: bool,
    pub allow_simultaneous: bool,
    pub playbook: String,
    pub created_by_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTemplate {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Inventory {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub scm_update_on_launch: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: String,
    pub username: String,
}

/// Complete, immutable input to one execution attempt.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRequest {
    pub job: Job,
    pub template: JobTemplate,
    pub machine_credential: Option<Credential>,
    pub network_credential: Option<Credential>,
    pub inventory: Inventory,
    pub project: Project,
    pub user: User,
    /// API token handed to the inventory/callback plugins.
    pub token: String,
}

impl JobRequest {
    pub fn id(&self) -> &str {
        &self.job.id
    }

    pub fn template_id(&self) -> &str {
        &self.template.id
    }

    pub fn allow_simultaneous(&self) -> bool {
        self.job.allow_simultaneous
    }
}

impl fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRequest")
            .field("job", &self.job)
            .field("template", &self.template)
            .field("machine_credential", &self.machine_credential)
            .field("network_credential", &self.network_credential)
            .field("inventory", &self.inventory)
            .field("project", &self.project)
            .field("user", &self.user)
            .field("token", &"<redacted>")
            .finish()
    }
}

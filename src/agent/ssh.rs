use super::traits::{AgentSession, KeyAgent};
use crate::config::Config;
use crate::credentials::KeyMaterial;
use crate::error::AgentError;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Environment variable through which `ssh-add` gets a key passphrase back
/// from the askpass hook (see [`askpass_reply`]).
pub const ASKPASS_ENV: &str = "PLAYRUN_ASKPASS_SECRET";

const SOCKET_POLL: Duration = Duration::from_millis(20);

/// When this binary is invoked as `SSH_ASKPASS`, the passphrase to print.
pub fn askpass_reply() -> Option<String> {
    std::env::var(ASKPASS_ENV).ok()
}

/// Key agent backed by OpenSSH `ssh-agent` / `ssh-add`.
pub struct SshAgent {
    ssh_agent: String,
    ssh_add: String,
    socket_timeout: Duration,
}

impl SshAgent {
    pub fn new(ssh_agent: impl Into<String>, ssh_add: impl Into<String>, socket_timeout: Duration) -> Self {
        Self {
            ssh_agent: ssh_agent.into(),
            ssh_add: ssh_add.into(),
            socket_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.executables.ssh_agent.clone(),
            config.executables.ssh_add.clone(),
            Duration::from_millis(config.agent.socket_timeout_ms),
        )
    }

    async fn wait_for_socket(&self, child: &mut Child, socket: &Path) -> Result<(), AgentError> {
        let deadline = Instant::now() + self.socket_timeout;
        loop {
            if socket.exists() {
                return Ok(());
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(AgentError::Start(format!(
                    "{} exited early with {status}",
                    self.ssh_agent
                )));
            }
            if Instant::now() >= deadline {
                return Err(AgentError::SocketTimeout(socket.display().to_string()));
            }
            tokio::time::sleep(SOCKET_POLL).await;
        }
    }
}

impl KeyAgent for SshAgent {
    fn start<'a>(
        &'a self,
        socket_dir: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn AgentSession>, AgentError>> + Send + 'a>> {
        Box::pin(async move {
            std::fs::create_dir_all(socket_dir)
                .map_err(|e| AgentError::Start(format!("{}: {e}", socket_dir.display())))?;
            let socket = socket_dir.join(format!("agent.{}.sock", uuid::Uuid::new_v4().simple()));

            // -D keeps the agent in the foreground so it dies with our handle.
            let mut child = Command::new(&self.ssh_agent)
                .arg("-D")
                .arg("-a")
                .arg(&socket)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| AgentError::Start(format!("{}: {e}", self.ssh_agent)))?;

            let pid = child
                .id()
                .ok_or_else(|| AgentError::Start("agent exited before reporting a pid".into()))?;

            if let Err(err) = self.wait_for_socket(&mut child, &socket).await {
                child.kill().await.ok();
                return Err(err);
            }

            tracing::debug!(pid, socket = %socket.display(), "key agent started");
            Ok(Box::new(SshAgentSession {
                child: Mutex::new(Some(child)),
                socket,
                pid,
                ssh_add: self.ssh_add.clone(),
            }) as Box<dyn AgentSession>)
        })
    }
}

struct SshAgentSession {
    child: Mutex<Option<Child>>,
    socket: PathBuf,
    pid: u32,
    ssh_add: String,
}

impl AgentSession for SshAgentSession {
    fn socket_path(&self) -> &Path {
        &self.socket
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn add_key<'a>(
        &'a self,
        key: &'a KeyMaterial,
    ) -> Pin<Box<dyn Future<Output = Result<(), AgentError>> + Send + 'a>> {
        Box::pin(async move {
            let mut command = Command::new(&self.ssh_add);
            command
                .arg("-")
                .env("SSH_AUTH_SOCK", &self.socket)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            if let Some(passphrase) = key.passphrase() {
                let askpass = std::env::current_exe()
                    .map_err(|e| AgentError::AddKey(format!("askpass hook unavailable: {e}")))?;
                command
                    .env("SSH_ASKPASS", askpass)
                    .env("SSH_ASKPASS_REQUIRE", "force")
                    .env(ASKPASS_ENV, passphrase);
                if std::env::var_os("DISPLAY").is_none() {
                    command.env("DISPLAY", ":0");
                }
            }

            let mut child = command
                .spawn()
                .map_err(|e| AgentError::AddKey(format!("{}: {e}", self.ssh_add)))?;
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| AgentError::AddKey("stdin was not captured".into()))?;
            stdin
                .write_all(key.pem())
                .await
                .map_err(|e| AgentError::AddKey(e.to_string()))?;
            drop(stdin);

            let output = child
                .wait_with_output()
                .await
                .map_err(|e| AgentError::AddKey(e.to_string()))?;
            if output.status.success() {
                Ok(())
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(AgentError::AddKey(format!(
                    "{}: {}",
                    output.status,
                    stderr.trim()
                )))
            }
        })
    }

    fn shutdown(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let mut guard = self.child.lock().await;
            if let Some(mut child) = guard.take() {
                child.kill().await.ok();
                child.wait().await.ok();
                tracing::debug!(pid = self.pid, "key agent stopped");
            }
            if let Err(e) = std::fs::remove_file(&self.socket) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(socket = %self.socket.display(), "could not remove agent socket: {e}");
                }
            }
        })
    }
}

impl Drop for SshAgentSession {
    fn drop(&mut self) {
        // The child is killed by kill_on_drop; only the socket file remains.
        let _ = std::fs::remove_file(&self.socket);
    }
}

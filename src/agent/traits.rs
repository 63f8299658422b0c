use crate::credentials::KeyMaterial;
use crate::error::AgentError;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

/// A running, job-scoped key agent.
///
/// Keys added here never touch disk; the spawned playbook reaches them
/// through `SSH_AUTH_SOCK`.
pub trait AgentSession: Send + Sync {
    /// Unix socket the agent listens on.
    fn socket_path(&self) -> &Path;

    /// Process id of the agent, exported as `SSH_AGENT_PID`.
    fn pid(&self) -> u32;

    /// Load one private key into the agent.
    fn add_key<'a>(
        &'a self,
        key: &'a KeyMaterial,
    ) -> Pin<Box<dyn Future<Output = Result<(), AgentError>> + Send + 'a>>;

    /// Stop the agent and remove its socket. Safe to call more than once.
    fn shutdown(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Starts agent sessions.
pub trait KeyAgent: Send + Sync {
    /// Start a fresh agent whose socket lives inside `socket_dir`.
    fn start<'a>(
        &'a self,
        socket_dir: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn AgentSession>, AgentError>> + Send + 'a>>;
}

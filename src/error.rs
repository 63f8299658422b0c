use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for `playrun`.
///
/// Each subsystem defines its own error variant. Library callers can match on
/// these to decide recovery strategy; internal code continues to use
/// `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum RunnerError {
    // ── Config ───────────────────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── Credentials ─────────────────────────────────────────────────────
    #[error("credential: {0}")]
    Credential(#[from] CredentialError),

    // ── Key agent ───────────────────────────────────────────────────────
    #[error("agent: {0}")]
    Agent(#[from] AgentError),

    // ── External processes ──────────────────────────────────────────────
    #[error("process: {0}")]
    Process(#[from] ProcessError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Credential errors ──────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("ssh: no key found")]
    NoKeyFound,

    #[error("ssh: passphrase required for encrypted key")]
    PassphraseRequired,

    #[error("kerberos ticket acquisition failed at {stage}: {message}")]
    Kerberos { stage: &'static str, message: String },
}

// ─── Key agent errors ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to start key agent: {0}")]
    Start(String),

    #[error("key agent socket {0} did not appear")]
    SocketTimeout(String),

    #[error("failed to add key to agent: {0}")]
    AddKey(String),
}

// ─── Process errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start {program}: {message}")]
    Launch { program: String, message: String },

    #[error("{0}")]
    Exit(String),

    #[error("could not kill process: {0}")]
    Kill(String),
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, RunnerError>;

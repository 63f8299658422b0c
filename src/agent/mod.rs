pub mod ssh;
pub mod traits;

pub use ssh::{ASKPASS_ENV, SshAgent, askpass_reply};
pub use traits::{AgentSession, KeyAgent};

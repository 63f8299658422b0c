use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// `playrun` - playbook job runner with per-template concurrency control.
#[derive(Parser, Debug)]
#[command(name = "playrun")]
#[command(version)]
#[command(about = "Run playbook jobs with queued, per-template admission.", long_about = None)]
pub struct Cli {
    /// Config file to use instead of ~/.playrun/config.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit every request in a JSON file and wait until all are finished
    Run {
        /// JSON file holding one job request or an array of them
        requests: PathBuf,

        /// Directory for job records (default: <state dir>/jobs)
        #[arg(long)]
        records: Option<PathBuf>,
    },

    /// Print the command line and environment each request would run with
    Plan {
        /// JSON file holding one job request or an array of them
        requests: PathBuf,
    },

    /// Manage encrypted credential fields
    Secrets {
        #[command(subcommand)]
        secrets_command: SecretsCommands,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum SecretsCommands {
    /// Encrypt a value for use in a credential field
    Encrypt {
        /// Plaintext to encrypt
        value: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
}

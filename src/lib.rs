#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod agent;
pub mod command;
pub mod config;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod scheduler;
pub mod workspace;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{Result, RunnerError};
pub use executor::{ExecutorContext, JobExecutor};
pub use jobs::{JobRecord, JobRequest, JobStatus};
pub use scheduler::{Scheduler, SchedulerHandle, TickSource};

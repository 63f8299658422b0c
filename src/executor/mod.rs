//! Per-run state machine: dependency wait, credential injection, process
//! supervision and the terminal finalizer.

pub mod output;
pub mod run;
pub mod sync;

pub use output::OutputBuffer;
pub use run::{ExecutorContext, ExecutorSettings, JobExecutor};
pub use sync::{ProjectSync, ScmProjectSync, SyncHandle};

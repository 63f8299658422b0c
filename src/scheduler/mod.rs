//! Admission control: the FIFO queue, simultaneous-run exclusion per
//! template and cancellation routing.

pub mod dispatch;
pub mod pool;

pub use dispatch::{CompletionGuard, Dispatch, DispatchedRun, ExecutorDispatch};
pub use pool::{Scheduler, SchedulerHandle, SchedulerSnapshot, TickSource};

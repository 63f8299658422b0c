pub mod model;
pub mod record;
pub mod signal;
pub mod store;

pub use model::{
    Credential, CredentialKind, Inventory, Job, JobRequest, JobStatus, JobTemplate, Project, User,
};
pub use record::{JobRecord, MISSING_STDOUT};
pub use signal::{JobSignals, PhaseSignal, SignalState};
pub use store::{ActivityNote, JobStore, JsonJobStore, MemoryJobStore};

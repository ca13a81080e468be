// # Import Module
//
// Client side of bulk article imports run by the backend:
//
// - **ProgressStore**: Observable snapshot of the import currently on screen
// - **ProgressPoller**: Polls one backend session into the store
// - **ImportRegistry**: Persistent bookkeeping of import jobs
// - **Discovery**: Re-attaches to sessions still running on the backend
// - **Housekeeping**: Removes imports that stopped making progress
// - **ImportService**: Orchestrates the above
//
// Public API:
// - `ImportService`: Start, follow, dismiss and recover imports
// - `ProgressStore` / `ProgressSnapshot`: What the UI renders
// - `ImportRegistry` / `ImportJob`: What survives a restart

pub mod discovery;
pub mod housekeeping;
pub mod poller;
pub mod registry;
pub mod service;
pub mod snapshot;
pub mod types;

// Public API exports
pub use discovery::{recover_sessions, DiscoveryOutcome};
pub use housekeeping::{stuck_job_ids, sweep_stuck_jobs};
pub use poller::{PollerCallbacks, ProgressPoller, ProgressUpdate};
pub use registry::{
    ImportRegistry, JobRepository, JsonFileRepository, RegistryError, RegistryState,
};
pub use service::{ImportError, ImportService, ImportSettings};
pub use snapshot::{ProgressSnapshot, ProgressStore, SnapshotPatch, Subscription};
pub use types::{
    calculate_percentage, ImportJob, ImportResults, JobProgress, JobProgressPatch, JobStatus,
    NewImportJob, Provider,
};

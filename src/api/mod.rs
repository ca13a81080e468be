// # Backend API
//
// Typed access to the import endpoints, built on the `NetFetch` bridge.

mod client;
mod models;

pub use client::{parse_progress, ApiError, ImportApi};
pub use models::{ImportOptions, ProgressReport, ProgressStatus, RemoteSession};

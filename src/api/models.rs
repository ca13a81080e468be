use crate::import::{ImportResults, JobProgress, Provider};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// Session status as reported by the progress endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    NotFound,
    /// A status this client does not know; never treated as running
    Unknown(String),
}

impl ProgressStatus {
    pub fn parse(status: Option<&str>) -> Self {
        let Some(status) = status else {
            return ProgressStatus::Pending;
        };
        match status.to_ascii_lowercase().as_str() {
            "completed" | "complete" => ProgressStatus::Completed,
            "failed" | "error" => ProgressStatus::Failed,
            "cancelled" | "canceled" => ProgressStatus::Cancelled,
            "not_found" => ProgressStatus::NotFound,
            "running" | "processing" | "importing" => ProgressStatus::Running,
            "pending" | "queued" | "starting" | "" => ProgressStatus::Pending,
            _ => ProgressStatus::Unknown(status.to_string()),
        }
    }
}

/// One progress observation of a backend session
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub status: ProgressStatus,
    pub total: u64,
    pub current: u64,
    pub current_action: String,
    pub time_remaining: Option<u64>,
    pub results: Option<ImportResults>,
    pub error: Option<String>,
}

impl ProgressReport {
    pub fn not_found() -> Self {
        ProgressReport {
            status: ProgressStatus::NotFound,
            total: 0,
            current: 0,
            current_action: String::new(),
            time_remaining: None,
            results: None,
            error: None,
        }
    }
}

/// Progress counters as the backend sends them, under either naming
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawProgress {
    #[serde(default, alias = "totalArticles")]
    pub total: Option<u64>,
    #[serde(default, alias = "articlesProcessed")]
    pub current: Option<u64>,
    #[serde(default, alias = "currentAction")]
    pub action: Option<String>,
    #[serde(default, alias = "timeRemaining")]
    pub estimated_time_remaining: Option<u64>,
}

impl RawProgress {
    pub fn into_job_progress(self) -> JobProgress {
        let mut progress = JobProgress::default();
        progress.apply(crate::import::JobProgressPatch {
            total: Some(self.total.unwrap_or(0)),
            current: Some(self.current.unwrap_or(0)),
            percentage: None,
            current_action: self.action,
            time_remaining: self.estimated_time_remaining,
        });
        progress
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawSession {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub progress: Option<RawProgress>,
    #[serde(default)]
    pub results: Option<ImportResults>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NestedProgressResponse {
    pub session: RawSession,
}

/// Older backends answer with the counters at the top level
#[derive(Debug, Deserialize)]
pub(crate) struct FlatProgressResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub progress: RawProgress,
    #[serde(default)]
    pub results: Option<ImportResults>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A session the backend still considers active
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSession {
    pub id: String,
    pub provider: Provider,
    pub status: ProgressStatus,
    pub progress: JobProgress,
    pub metadata: Option<Value>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawRemoteSession {
    pub id: String,
    pub source: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub progress: Option<RawProgress>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DiscoverResponse {
    #[serde(default)]
    pub active_sessions: Vec<RawRemoteSession>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StartImportResponse {
    pub session_id: String,
}

/// Options sent when starting an import
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Provider access token obtained through the provider's OAuth flow
    pub provider_token: Option<String>,
    /// Only import items saved after this point
    pub since: Option<DateTime<Utc>>,
}

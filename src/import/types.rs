use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// External bookmarking service an import pulls articles from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Pocket,
    Instapaper,
    Readwise,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Pocket => "pocket",
            Provider::Instapaper => "instapaper",
            Provider::Readwise => "readwise",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pocket" => Ok(Provider::Pocket),
            "instapaper" => Ok(Provider::Instapaper),
            "readwise" => Ok(Provider::Readwise),
            other => Err(format!("Unknown import provider: {}", other)),
        }
    }
}

/// Lifecycle status of an import job
///
/// Jobs start `Running`. `Completed` and `Failed` are terminal: nothing
/// transitions out of them, but the job can still be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether jobs in this status belong in the persisted subset
    pub fn is_persisted(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Paused)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Paused)
                | (JobStatus::Paused, JobStatus::Running)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress counters for a single job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub total: u64,
    pub current: u64,
    pub percentage: u8,
    pub current_action: String,
    /// Estimated milliseconds until completion
    pub time_remaining: u64,
}

impl Default for JobProgress {
    fn default() -> Self {
        JobProgress {
            total: 0,
            current: 0,
            percentage: 0,
            current_action: "Starting import...".to_string(),
            time_remaining: 0,
        }
    }
}

/// Partial update merged into a job's [`JobProgress`].
///
/// When `total` or `current` change and no explicit `percentage` is given,
/// the percentage is recomputed from the merged counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobProgressPatch {
    pub total: Option<u64>,
    pub current: Option<u64>,
    pub percentage: Option<u8>,
    pub current_action: Option<String>,
    pub time_remaining: Option<u64>,
}

impl JobProgress {
    pub fn apply(&mut self, patch: JobProgressPatch) {
        let counters_changed = patch.total.is_some() || patch.current.is_some();

        if let Some(total) = patch.total {
            self.total = total;
        }
        if let Some(current) = patch.current {
            self.current = current;
        }
        if self.total > 0 && self.current > self.total {
            self.current = self.total;
        }
        match patch.percentage {
            Some(percentage) => self.percentage = percentage.min(100),
            None if counters_changed => {
                self.percentage = calculate_percentage(self.current, self.total)
            }
            None => {}
        }
        if let Some(action) = patch.current_action {
            self.current_action = action;
        }
        if let Some(remaining) = patch.time_remaining {
            self.time_remaining = remaining;
        }
    }
}

/// Final counts reported by the backend when an import finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportResults {
    #[serde(default)]
    pub imported: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub total: u64,
}

impl ImportResults {
    pub fn summary(&self) -> String {
        format!(
            "Imported {} articles ({} skipped, {} failed)",
            self.imported, self.skipped, self.failed
        )
    }
}

/// Client-side bookkeeping record for one backend import session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: String,
    pub session_id: String,
    pub provider: Provider,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<ImportResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Parameters for registering a new job
#[derive(Debug, Clone)]
pub struct NewImportJob {
    pub session_id: String,
    pub provider: Provider,
    /// Initial progress; defaults to zero counters with a placeholder action
    pub progress: Option<JobProgress>,
    /// Defaults to now
    pub start_time: Option<DateTime<Utc>>,
}

impl NewImportJob {
    pub fn new(provider: Provider, session_id: impl Into<String>) -> Self {
        NewImportJob {
            session_id: session_id.into(),
            provider,
            progress: None,
            start_time: None,
        }
    }
}

/// Integer percentage of `current` over `total`, rounded to nearest.
///
/// Zero when nothing is known about the total.
pub fn calculate_percentage(current: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let current = current.min(total) as u128;
    let total = total as u128;
    // Half rounds up, in integer math to stay exact
    ((current * 200 + total) / (total * 2)) as u8
}

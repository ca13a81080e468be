// Cleanup of imports that stopped making progress. The registry itself
// never expires jobs; this runs beside it.

use crate::import::registry::ImportRegistry;
use crate::import::types::{ImportJob, JobStatus};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::warn;

/// Running jobs with no activity for longer than `threshold`.
///
/// Activity is the last progress sync, or the start time before any sync.
pub fn stuck_job_ids(jobs: &[ImportJob], now: DateTime<Utc>, threshold: Duration) -> Vec<String> {
    let Ok(threshold) = chrono::Duration::from_std(threshold) else {
        return Vec::new();
    };

    jobs.iter()
        .filter(|job| job.status == JobStatus::Running)
        .filter(|job| {
            let last_activity = job.last_sync_time.unwrap_or(job.start_time);
            now.signed_duration_since(last_activity) > threshold
        })
        .map(|job| job.id.clone())
        .collect()
}

/// Remove stuck jobs from the registry, returning their ids
pub fn sweep_stuck_jobs(
    registry: &ImportRegistry,
    now: DateTime<Utc>,
    threshold: Duration,
) -> Vec<String> {
    let stuck = stuck_job_ids(&registry.jobs(), now, threshold);
    for job_id in &stuck {
        warn!(
            "Import job {} made no progress for over {:?}, removing",
            job_id, threshold
        );
        registry.remove_import(job_id);
    }
    stuck
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::types::{JobProgress, Provider};

    fn job(id: &str, status: JobStatus, started_mins_ago: i64, synced_mins_ago: Option<i64>) -> ImportJob {
        let now = Utc::now();
        ImportJob {
            id: id.to_string(),
            session_id: format!("session-{}", id),
            provider: Provider::Pocket,
            status,
            progress: JobProgress::default(),
            start_time: now - chrono::Duration::minutes(started_mins_ago),
            end_time: None,
            last_sync_time: synced_mins_ago.map(|m| now - chrono::Duration::minutes(m)),
            results: None,
            error: None,
        }
    }

    #[test]
    fn test_only_idle_running_jobs_are_stuck() {
        let jobs = vec![
            job("fresh", JobStatus::Running, 2, None),
            job("stale", JobStatus::Running, 15, None),
            job("long-but-active", JobStatus::Running, 45, Some(1)),
            job("long-and-idle", JobStatus::Running, 45, Some(12)),
            job("paused", JobStatus::Paused, 60, None),
            job("failed", JobStatus::Failed, 60, None),
        ];

        let stuck = stuck_job_ids(&jobs, Utc::now(), Duration::from_secs(600));
        assert_eq!(stuck, vec!["stale".to_string(), "long-and-idle".to_string()]);
    }

    #[test]
    fn test_threshold_is_configurable() {
        let jobs = vec![job("a", JobStatus::Running, 3, None)];
        assert!(stuck_job_ids(&jobs, Utc::now(), Duration::from_secs(600)).is_empty());
        assert_eq!(
            stuck_job_ids(&jobs, Utc::now(), Duration::from_secs(120)),
            vec!["a".to_string()]
        );
    }
}

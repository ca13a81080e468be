use crate::import::types::{
    ImportJob, ImportResults, JobProgress, JobProgressPatch, JobStatus, NewImportJob, Provider,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// All jobs plus whether the progress UI should be shown
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryState {
    #[serde(default)]
    pub jobs: Vec<ImportJob>,
    #[serde(default)]
    pub show_progress: bool,
}

/// The part of the registry that survives a restart: running and paused jobs only.
/// With none of those left there is nothing to show after a restart.
pub fn persisted_subset(state: &RegistryState) -> RegistryState {
    let jobs: Vec<ImportJob> = state
        .jobs
        .iter()
        .filter(|job| job.status.is_persisted())
        .cloned()
        .collect();
    let show_progress = state.show_progress && !jobs.is_empty();
    RegistryState {
        jobs,
        show_progress,
    }
}

/// Durable storage for the registry, rewritten wholesale on each save
pub trait JobRepository: Send + Sync {
    fn load(&self) -> Result<RegistryState, RegistryError>;
    fn save(&self, state: &RegistryState) -> Result<(), RegistryError>;
}

/// Stores the registry as a single JSON file
#[derive(Debug, Clone)]
pub struct JsonFileRepository {
    path: PathBuf,
}

impl JsonFileRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JobRepository for JsonFileRepository {
    fn load(&self) -> Result<RegistryState, RegistryError> {
        if !self.path.exists() {
            debug!("No job registry at {}, starting empty", self.path.display());
            return Ok(RegistryState::default());
        }
        let json = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&json)?)
    }

    fn save(&self, state: &RegistryState) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(state)?;

        // Write then rename so a crash never leaves a half-written blob
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

struct RegistryInner {
    state: RegistryState,
    /// Last subset handed to the repository, to skip redundant writes
    last_persisted: Option<RegistryState>,
}

/// Bookkeeping of import jobs across process restarts.
///
/// Clones share the same registry. All operations are synchronous; unknown
/// job ids are ignored. Every change is published to [`subscribe`](Self::subscribe)
/// and, when it touches the persisted subset, written to the repository.
#[derive(Clone)]
pub struct ImportRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    repository: Arc<dyn JobRepository>,
    changes: Arc<watch::Sender<RegistryState>>,
    auto_remove_delay: Duration,
}

impl ImportRegistry {
    /// Open the registry, restoring whatever the repository holds.
    ///
    /// A repository that cannot be read is logged and treated as empty.
    pub fn open(repository: Arc<dyn JobRepository>, auto_remove_delay: Duration) -> Self {
        let state = match repository.load() {
            Ok(state) => {
                info!("Restored {} import job(s)", state.jobs.len());
                state
            }
            Err(e) => {
                warn!("Could not load import jobs, starting empty: {}", e);
                RegistryState::default()
            }
        };

        let (changes, _) = watch::channel(state.clone());

        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                last_persisted: Some(persisted_subset(&state)),
                state,
            })),
            repository,
            changes: Arc::new(changes),
            auto_remove_delay,
        }
    }

    /// Register a newly started import and return its job id.
    ///
    /// Any other running job for the same provider is evicted.
    pub fn start_import(&self, spec: NewImportJob) -> String {
        self.insert(spec, JobStatus::Running)
    }

    /// Register a job for a session found on the backend, in the given status.
    pub fn adopt_session(&self, spec: NewImportJob, status: JobStatus) -> String {
        self.insert(spec, status)
    }

    fn insert(&self, spec: NewImportJob, status: JobStatus) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let job = ImportJob {
            id: id.clone(),
            session_id: spec.session_id,
            provider: spec.provider,
            status,
            progress: spec.progress.unwrap_or_default(),
            start_time: spec.start_time.unwrap_or(now),
            end_time: None,
            last_sync_time: None,
            results: None,
            error: None,
        };

        info!(
            "Registered {} import job {} for session {} ({})",
            job.provider, job.id, job.session_id, job.status
        );

        self.mutate(|state| {
            if status == JobStatus::Running {
                state.jobs.retain(|existing| {
                    let superseded =
                        existing.provider == job.provider && existing.status == JobStatus::Running;
                    if superseded {
                        info!(
                            "Job {} superseded by new {} import",
                            existing.id, existing.provider
                        );
                    }
                    !superseded
                });
            }
            state.jobs.push(job);
            state.show_progress = true;
        });

        id
    }

    /// Merge progress into a job. Terminal jobs are left untouched.
    pub fn update_progress(&self, job_id: &str, patch: JobProgressPatch) -> bool {
        self.mutate(|state| {
            let Some(job) = state.jobs.iter_mut().find(|job| job.id == job_id) else {
                debug!("Progress for unknown job {} ignored", job_id);
                return false;
            };
            if job.status.is_terminal() {
                debug!("Progress for {} job {} ignored", job.status, job_id);
                return false;
            }
            job.progress.apply(patch);
            job.last_sync_time = Some(Utc::now());
            true
        })
    }

    /// Replace a job's progress with what the backend reported
    pub fn sync_progress(&self, job_id: &str, progress: JobProgress) -> bool {
        self.update_progress(
            job_id,
            JobProgressPatch {
                total: Some(progress.total),
                current: Some(progress.current),
                percentage: Some(progress.percentage),
                current_action: Some(progress.current_action),
                time_remaining: Some(progress.time_remaining),
            },
        )
    }

    /// Finish a job: `failed` when `error` is given, `completed` otherwise.
    ///
    /// Completed jobs are removed after the auto-remove delay unless
    /// something else removed or changed them first.
    pub fn complete_import(
        &self,
        job_id: &str,
        results: Option<ImportResults>,
        error: Option<String>,
    ) -> bool {
        let target = if error.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };

        let finished = self.mutate(|state| {
            let Some(job) = state.jobs.iter_mut().find(|job| job.id == job_id) else {
                debug!("Completion for unknown job {} ignored", job_id);
                return false;
            };
            if !job.status.can_transition_to(target) {
                warn!(
                    "Job {} cannot move from {} to {}",
                    job_id, job.status, target
                );
                return false;
            }

            job.status = target;
            job.end_time = Some(Utc::now());
            job.progress.percentage = 100;
            match &error {
                Some(reason) => {
                    job.progress.current_action = format!("Import failed: {}", reason);
                    job.error = Some(reason.clone());
                }
                None => {
                    let results = results.unwrap_or(ImportResults {
                        imported: job.progress.current,
                        skipped: 0,
                        failed: 0,
                        total: job.progress.total,
                    });
                    job.progress.current_action = results.summary();
                    job.results = Some(results);
                }
            }
            true
        });

        if !finished {
            return false;
        }

        match &error {
            Some(reason) => warn!("Import job {} failed: {}", job_id, reason),
            None => {
                info!("Import job {} completed", job_id);
                self.schedule_auto_removal(job_id);
            }
        }
        true
    }

    fn schedule_auto_removal(&self, job_id: &str) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("No async runtime; job {} will not be auto-removed", job_id);
                return;
            }
        };

        let registry = self.clone();
        let job_id = job_id.to_string();
        let delay = self.auto_remove_delay;
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            registry.remove_if_completed(&job_id);
        });
    }

    fn remove_if_completed(&self, job_id: &str) {
        let removed = self.mutate(|state| {
            let before = state.jobs.len();
            state
                .jobs
                .retain(|job| !(job.id == job_id && job.status == JobStatus::Completed));
            let removed = state.jobs.len() != before;
            if removed {
                state.show_progress = !state.jobs.is_empty();
            }
            removed
        });
        if removed {
            debug!("Auto-removed completed job {}", job_id);
        }
    }

    /// Delete a job regardless of its status
    pub fn remove_import(&self, job_id: &str) -> bool {
        let removed = self.mutate(|state| {
            let before = state.jobs.len();
            state.jobs.retain(|job| job.id != job_id);
            state.show_progress = !state.jobs.is_empty();
            state.jobs.len() != before
        });
        if removed {
            info!("Removed import job {}", job_id);
        }
        removed
    }

    pub fn pause_import(&self, job_id: &str) -> bool {
        self.transition(job_id, JobStatus::Paused)
    }

    /// Resume a paused job. Other running jobs of the same provider are evicted.
    pub fn resume_import(&self, job_id: &str) -> bool {
        self.transition(job_id, JobStatus::Running)
    }

    fn transition(&self, job_id: &str, next: JobStatus) -> bool {
        self.mutate(|state| {
            let Some(index) = state.jobs.iter().position(|job| job.id == job_id) else {
                return false;
            };
            let current = state.jobs[index].status;
            if !current.can_transition_to(next) {
                warn!("Job {} cannot move from {} to {}", job_id, current, next);
                return false;
            }

            let provider = state.jobs[index].provider;
            state.jobs[index].status = next;
            if next == JobStatus::Running {
                state.jobs.retain(|job| {
                    job.id == job_id
                        || !(job.provider == provider && job.status == JobStatus::Running)
                });
            }
            debug!("Job {} is now {}", job_id, next);
            true
        })
    }

    pub fn set_show_progress(&self, show: bool) {
        self.mutate(|state| state.show_progress = show);
    }

    pub fn show_progress(&self) -> bool {
        self.inner.lock().unwrap().state.show_progress
    }

    pub fn jobs(&self) -> Vec<ImportJob> {
        self.inner.lock().unwrap().state.jobs.clone()
    }

    pub fn job(&self, job_id: &str) -> Option<ImportJob> {
        self.find(|job| job.id == job_id)
    }

    pub fn job_by_session(&self, session_id: &str) -> Option<ImportJob> {
        self.find(|job| job.session_id == session_id)
    }

    pub fn running_job(&self, provider: Provider) -> Option<ImportJob> {
        self.find(|job| job.provider == provider && job.status == JobStatus::Running)
    }

    pub fn running_jobs(&self) -> Vec<ImportJob> {
        self.jobs()
            .into_iter()
            .filter(|job| job.status == JobStatus::Running)
            .collect()
    }

    /// Watch the full registry state; the receiver sees every change
    pub fn subscribe(&self) -> watch::Receiver<RegistryState> {
        self.changes.subscribe()
    }

    fn find<P>(&self, predicate: P) -> Option<ImportJob>
    where
        P: Fn(&ImportJob) -> bool,
    {
        self.inner
            .lock()
            .unwrap()
            .state
            .jobs
            .iter()
            .find(|job| predicate(job))
            .cloned()
    }

    /// Apply `f` to the state, then persist and publish if anything changed
    fn mutate<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut RegistryState) -> R,
    {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.state.clone();
        let result = f(&mut inner.state);
        if inner.state == before {
            return result;
        }

        let subset = persisted_subset(&inner.state);
        if inner.last_persisted.as_ref() != Some(&subset) {
            match self.repository.save(&subset) {
                Ok(()) => inner.last_persisted = Some(subset),
                Err(e) => warn!("Failed to persist import jobs: {}", e),
            }
        }

        self.changes.send_replace(inner.state.clone());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryJobRepository;

    fn registry() -> (ImportRegistry, Arc<MemoryJobRepository>) {
        let repository = Arc::new(MemoryJobRepository::new());
        let registry = ImportRegistry::open(repository.clone(), Duration::from_secs(5));
        (registry, repository)
    }

    fn results() -> ImportResults {
        ImportResults {
            imported: 48,
            skipped: 2,
            failed: 0,
            total: 50,
        }
    }

    #[test]
    fn test_start_import_replaces_running_job_for_provider() {
        let (registry, _) = registry();

        let first = registry.start_import(NewImportJob::new(Provider::Pocket, "s1"));
        let other = registry.start_import(NewImportJob::new(Provider::Readwise, "r1"));
        let second = registry.start_import(NewImportJob::new(Provider::Pocket, "s2"));

        assert!(registry.job(&first).is_none());
        assert!(registry.job(&other).is_some());
        assert_eq!(registry.running_job(Provider::Pocket).unwrap().id, second);

        for _ in 0..5 {
            registry.start_import(NewImportJob::new(Provider::Pocket, "again"));
            let running = registry
                .jobs()
                .into_iter()
                .filter(|j| j.provider == Provider::Pocket && j.status == JobStatus::Running)
                .count();
            assert_eq!(running, 1);
        }
        assert!(registry.show_progress());
    }

    #[test]
    fn test_new_job_defaults() {
        let (registry, _) = registry();
        let id = registry.start_import(NewImportJob::new(Provider::Instapaper, "s1"));
        let job = registry.job(&id).unwrap();

        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.session_id, "s1");
        assert_eq!(job.progress, JobProgress::default());
        assert!(job.end_time.is_none());
    }

    #[test]
    fn test_update_progress_bumps_sync_time_and_ignores_unknown() {
        let (registry, _) = registry();
        let id = registry.start_import(NewImportJob::new(Provider::Pocket, "s1"));

        assert!(!registry.update_progress("missing", JobProgressPatch::default()));

        assert!(registry.update_progress(
            &id,
            JobProgressPatch {
                total: Some(100),
                current: Some(50),
                ..Default::default()
            }
        ));
        let job = registry.job(&id).unwrap();
        assert_eq!(job.progress.percentage, 50);
        assert!(job.last_sync_time.is_some());
    }

    #[test]
    fn test_terminal_jobs_ignore_progress_and_transitions() {
        let (registry, _) = registry();
        let done = registry.start_import(NewImportJob::new(Provider::Pocket, "s1"));
        let failed = registry.start_import(NewImportJob::new(Provider::Readwise, "s2"));

        assert!(registry.complete_import(&done, Some(results()), None));
        assert!(registry.complete_import(&failed, None, Some("token revoked".to_string())));

        for id in [&done, &failed] {
            let before = registry.job(id).unwrap();
            assert!(!registry.update_progress(
                id,
                JobProgressPatch {
                    current: Some(1),
                    ..Default::default()
                }
            ));
            assert!(!registry.complete_import(id, None, None));
            assert!(!registry.resume_import(id));
            assert!(!registry.pause_import(id));
            assert_eq!(registry.job(id).unwrap(), before);
        }

        let failed_job = registry.job(&failed).unwrap();
        assert_eq!(failed_job.status, JobStatus::Failed);
        assert_eq!(failed_job.error.as_deref(), Some("token revoked"));
        assert_eq!(failed_job.progress.percentage, 100);
        assert!(failed_job.results.is_none());
    }

    #[test]
    fn test_complete_sets_summary() {
        let (registry, _) = registry();
        let id = registry.start_import(NewImportJob::new(Provider::Pocket, "s1"));
        registry.complete_import(&id, Some(results()), None);

        let job = registry.job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.results, Some(results()));
        assert_eq!(job.progress.percentage, 100);
        assert_eq!(
            job.progress.current_action,
            "Imported 48 articles (2 skipped, 0 failed)"
        );
        assert!(job.end_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_job_is_removed_after_delay() {
        let (registry, _) = registry();
        let id = registry.start_import(NewImportJob::new(Provider::Pocket, "s1"));
        registry.complete_import(&id, Some(results()), None);

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(registry.job(&id).is_some());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.job(&id).is_none());
        assert!(!registry.show_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_is_not_auto_removed() {
        let (registry, _) = registry();
        let id = registry.start_import(NewImportJob::new(Provider::Pocket, "s1"));
        registry.complete_import(&id, None, Some("boom".to_string()));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(registry.job(&id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_removal_after_manual_removal_is_harmless() {
        let (registry, _) = registry();
        let id = registry.start_import(NewImportJob::new(Provider::Pocket, "s1"));
        let keep = registry.start_import(NewImportJob::new(Provider::Readwise, "s2"));
        registry.complete_import(&id, Some(results()), None);
        assert!(registry.remove_import(&id));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(registry.job(&keep).is_some());
        assert!(registry.show_progress());
    }

    #[test]
    fn test_remove_recomputes_visibility() {
        let (registry, _) = registry();
        let a = registry.start_import(NewImportJob::new(Provider::Pocket, "s1"));
        let b = registry.start_import(NewImportJob::new(Provider::Readwise, "s2"));

        assert!(registry.remove_import(&a));
        assert!(registry.show_progress());
        assert!(!registry.remove_import(&a));
        assert!(registry.remove_import(&b));
        assert!(!registry.show_progress());
    }

    #[test]
    fn test_pause_and_resume() {
        let (registry, _) = registry();
        let id = registry.start_import(NewImportJob::new(Provider::Pocket, "s1"));

        assert!(registry.pause_import(&id));
        assert_eq!(registry.job(&id).unwrap().status, JobStatus::Paused);
        assert!(!registry.pause_import(&id));

        // Resuming evicts the newer running import of the same provider
        let newer = registry.start_import(NewImportJob::new(Provider::Pocket, "s2"));
        assert!(registry.job(&id).is_some());
        assert!(registry.resume_import(&id));
        assert!(registry.job(&newer).is_none());
        assert_eq!(registry.running_job(Provider::Pocket).unwrap().id, id);
    }

    #[test]
    fn test_persisted_subset_excludes_terminal_jobs() {
        let (registry, repository) = registry();
        let running = registry.start_import(NewImportJob::new(Provider::Pocket, "s1"));
        let paused = registry.start_import(NewImportJob::new(Provider::Readwise, "s2"));
        registry.pause_import(&paused);
        let done = registry.start_import(NewImportJob::new(Provider::Instapaper, "s3"));
        registry.complete_import(&done, Some(results()), None);

        let saved = repository.saved().unwrap();
        let ids: Vec<_> = saved.jobs.iter().map(|j| j.id.clone()).collect();
        assert_eq!(ids, vec![running.clone(), paused.clone()]);
        assert!(saved.show_progress);

        // Pure filter agrees with what was saved
        let all = RegistryState {
            jobs: registry.jobs(),
            show_progress: true,
        };
        assert_eq!(persisted_subset(&all), saved);
    }

    #[test]
    fn test_finished_jobs_do_not_reopen_progress_ui() {
        let repository = Arc::new(MemoryJobRepository::new());
        let registry = ImportRegistry::open(repository.clone(), Duration::from_secs(5));
        let id = registry.start_import(NewImportJob::new(Provider::Pocket, "s1"));
        registry.complete_import(&id, Some(results()), None);

        // Still visible in this run, but nothing worth showing after a restart
        assert!(registry.show_progress());
        let saved = repository.saved().unwrap();
        assert!(saved.jobs.is_empty());
        assert!(!saved.show_progress);

        let reopened = ImportRegistry::open(repository, Duration::from_secs(5));
        assert!(reopened.jobs().is_empty());
        assert!(!reopened.show_progress());
    }

    #[test]
    fn test_saves_only_when_persisted_subset_changes() {
        let (registry, repository) = registry();
        let id = registry.start_import(NewImportJob::new(Provider::Pocket, "s1"));
        let saves = repository.save_count();

        registry.update_progress(
            &id,
            JobProgressPatch {
                current: Some(3),
                total: Some(9),
                ..Default::default()
            },
        );
        assert_eq!(repository.save_count(), saves + 1);
        assert_eq!(repository.saved().unwrap().jobs[0].progress.current, 3);

        // Nothing changed, nothing written
        registry.set_show_progress(true);
        assert_eq!(repository.save_count(), saves + 1);
    }

    #[test]
    fn test_reopen_restores_running_jobs() {
        let repository = Arc::new(MemoryJobRepository::new());
        let id = {
            let registry = ImportRegistry::open(repository.clone(), Duration::from_secs(5));
            registry.start_import(NewImportJob::new(Provider::Pocket, "s1"))
        };

        let reopened = ImportRegistry::open(repository, Duration::from_secs(5));
        let job = reopened.job(&id).unwrap();
        assert_eq!(job.session_id, "s1");
        assert_eq!(job.status, JobStatus::Running);
        assert!(reopened.show_progress());
    }

    #[test]
    fn test_subscribers_see_changes() {
        let (registry, _) = registry();
        let mut rx = registry.subscribe();
        assert!(!rx.has_changed().unwrap());

        let id = registry.start_import(NewImportJob::new(Provider::Pocket, "s1"));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().jobs[0].id, id);
    }

    #[test]
    fn test_json_file_repository_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("import-jobs.json");
        let repository = JsonFileRepository::new(&path);

        assert_eq!(repository.load().unwrap(), RegistryState::default());

        let registry = ImportRegistry::open(Arc::new(repository.clone()), Duration::from_secs(5));
        let id = registry.start_import(NewImportJob::new(Provider::Pocket, "s1"));

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"sessionId\": \"s1\""));
        assert!(raw.contains("\"showProgress\": true"));

        let restored = repository.load().unwrap();
        assert_eq!(restored.jobs[0].id, id);
        assert_eq!(restored.jobs[0].start_time, registry.job(&id).unwrap().start_time);
    }

    #[test]
    fn test_corrupt_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("import-jobs.json");
        std::fs::write(&path, "{ not json").unwrap();

        let registry = ImportRegistry::open(
            Arc::new(JsonFileRepository::new(&path)),
            Duration::from_secs(5),
        );
        assert!(registry.jobs().is_empty());
    }
}

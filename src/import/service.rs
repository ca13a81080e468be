// # Import Service - Orchestrator
//
// Ties the backend API, the job registry and the progress pollers together:
// - start_import: asks the backend for a session, registers a job, polls it
// - recover: folds backend sessions into the registry and resumes polling
// - housekeeping: periodically drops jobs that stopped making progress
//
// Each running job gets its own poller. Poll results land in the shared
// snapshot store and in the job itself. When a poller stops, the service
// hands the snapshot to a surviving poller or clears it.

use crate::api::{ApiError, ImportApi, ImportOptions};
use crate::config::Config;
use crate::credentials::{auth_token, CredentialStore};
use crate::import::discovery::{recover_sessions, DiscoveryOutcome};
use crate::import::housekeeping;
use crate::import::poller::{
    PollerCallbacks, ProgressPoller, ProgressUpdate, DEFAULT_POLL_INTERVAL,
};
use crate::import::registry::ImportRegistry;
use crate::import::snapshot::ProgressStore;
use crate::import::types::{ImportResults, JobProgressPatch, JobStatus, NewImportJob, Provider};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Not signed in")]
    NotAuthenticated,
    #[error("API error: {0}")]
    Api(#[from] ApiError),
    #[error("Unknown import job: {0}")]
    UnknownJob(String),
    #[error("Import job {0} is not running")]
    NotRunning(String),
    #[error("Import job {0} is not paused")]
    NotPaused(String),
}

/// Timing knobs for the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSettings {
    pub poll_interval: Duration,
    pub stuck_import_threshold: Duration,
    pub housekeeping_interval: Duration,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            stuck_import_threshold: Duration::from_secs(600),
            housekeeping_interval: DEFAULT_HOUSEKEEPING_INTERVAL,
        }
    }
}

impl From<&Config> for ImportSettings {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval,
            stuck_import_threshold: config.stuck_import_threshold,
            housekeeping_interval: config.housekeeping_interval,
        }
    }
}

struct ServiceInner {
    api: ImportApi,
    credentials: Arc<dyn CredentialStore>,
    store: ProgressStore,
    registry: ImportRegistry,
    settings: ImportSettings,
    /// Pollers by job id. Finished pollers are pruned lazily.
    pollers: Mutex<HashMap<String, ProgressPoller>>,
}

/// Handle to the import orchestrator. Clones share the same service.
#[derive(Clone)]
pub struct ImportService {
    inner: Arc<ServiceInner>,
}

impl ImportService {
    pub fn new(
        api: ImportApi,
        credentials: Arc<dyn CredentialStore>,
        store: ProgressStore,
        registry: ImportRegistry,
        settings: ImportSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                api,
                credentials,
                store,
                registry,
                settings,
                pollers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &ImportRegistry {
        &self.inner.registry
    }

    pub fn progress_store(&self) -> &ProgressStore {
        &self.inner.store
    }

    /// Start an import on the backend and follow it. Returns the job id.
    pub async fn start_import(
        &self,
        provider: Provider,
        options: &ImportOptions,
    ) -> Result<String, ImportError> {
        let token =
            auth_token(self.inner.credentials.as_ref()).ok_or(ImportError::NotAuthenticated)?;

        let session_id = self.inner.api.start_import(provider, &token, options).await?;
        let job_id = self
            .inner
            .registry
            .start_import(NewImportJob::new(provider, session_id.clone()));

        info!("Started {} import job {} (session {})", provider, job_id, session_id);
        self.watch(&job_id, &session_id);
        Ok(job_id)
    }

    /// Poll an existing running job, e.g. one restored at startup
    pub fn follow(&self, job_id: &str) -> Result<(), ImportError> {
        let job = self
            .inner
            .registry
            .job(job_id)
            .ok_or_else(|| ImportError::UnknownJob(job_id.to_string()))?;
        if job.status != JobStatus::Running {
            return Err(ImportError::NotRunning(job_id.to_string()));
        }

        self.watch(&job.id, &job.session_id);
        Ok(())
    }

    /// Stop following a job and forget it.
    ///
    /// A still-running session is cancelled on the backend first; failing
    /// to do so is logged and does not keep the job around.
    pub async fn dismiss(&self, job_id: &str) -> Result<(), ImportError> {
        let job = self
            .inner
            .registry
            .job(job_id)
            .ok_or_else(|| ImportError::UnknownJob(job_id.to_string()))?;

        self.unwatch(job_id);

        if job.status == JobStatus::Running {
            match auth_token(self.inner.credentials.as_ref()) {
                Some(token) => {
                    if let Err(e) = self.inner.api.cancel_import(&job.session_id, &token).await {
                        warn!("Could not cancel session {}: {}", job.session_id, e);
                    }
                }
                None => debug!("No auth token, not cancelling session {}", job.session_id),
            }
        }

        self.inner.registry.remove_import(job_id);
        info!("Dismissed import job {}", job_id);
        Ok(())
    }

    /// Pause a running job locally and stop polling it
    pub fn pause(&self, job_id: &str) -> Result<(), ImportError> {
        if self.inner.registry.job(job_id).is_none() {
            return Err(ImportError::UnknownJob(job_id.to_string()));
        }
        if !self.inner.registry.pause_import(job_id) {
            return Err(ImportError::NotRunning(job_id.to_string()));
        }
        self.unwatch(job_id);
        Ok(())
    }

    /// Resume a paused job and poll it again
    pub fn resume(&self, job_id: &str) -> Result<(), ImportError> {
        let job = self
            .inner
            .registry
            .job(job_id)
            .ok_or_else(|| ImportError::UnknownJob(job_id.to_string()))?;
        if !self.inner.registry.resume_import(job_id) {
            return Err(ImportError::NotPaused(job_id.to_string()));
        }
        self.watch(&job.id, &job.session_id);
        Ok(())
    }

    /// Reconcile with the backend, then poll every running job
    pub async fn recover(&self) -> Result<DiscoveryOutcome, ImportError> {
        let outcome = recover_sessions(
            &self.inner.api,
            self.inner.credentials.as_ref(),
            &self.inner.registry,
        )
        .await?;

        for job in self.inner.registry.running_jobs() {
            if !self.is_following(&job.id) {
                self.watch(&job.id, &job.session_id);
            }
        }

        Ok(outcome)
    }

    /// Remove running jobs that have been idle past the configured threshold
    pub fn sweep_stuck_jobs(&self) -> Vec<String> {
        let removed = housekeeping::sweep_stuck_jobs(
            &self.inner.registry,
            Utc::now(),
            self.inner.settings.stuck_import_threshold,
        );
        for job_id in &removed {
            self.unwatch(job_id);
        }
        removed
    }

    /// Run [`sweep_stuck_jobs`](Self::sweep_stuck_jobs) on an interval until `cancel` fires
    pub fn spawn_housekeeping(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        let mut period = self.inner.settings.housekeeping_interval;
        if period.is_zero() {
            warn!("Zero housekeeping interval, using {:?}", DEFAULT_HOUSEKEEPING_INTERVAL);
            period = DEFAULT_HOUSEKEEPING_INTERVAL;
        }

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // Nothing can be stuck right at startup
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    _ = ticker.tick() => {
                        let removed = service.sweep_stuck_jobs();
                        if !removed.is_empty() {
                            info!("Housekeeping removed {} stuck import(s)", removed.len());
                        }
                    }
                }
            }

            debug!("Housekeeping stopped");
        })
    }

    /// Whether a live poller exists for `job_id`
    pub fn is_following(&self, job_id: &str) -> bool {
        self.inner
            .pollers
            .lock()
            .unwrap()
            .get(job_id)
            .map(ProgressPoller::is_running)
            .unwrap_or(false)
    }

    /// Stop every poller and clear the snapshot
    pub fn shutdown(&self) {
        let mut pollers = self.inner.pollers.lock().unwrap();
        for (_, mut poller) in pollers.drain() {
            poller.stop();
        }
        self.inner.store.clear_progress();
    }

    fn watch(&self, job_id: &str, session_id: &str) {
        let registry = &self.inner.registry;
        let mut pollers = self.inner.pollers.lock().unwrap();

        // Drop pollers that finished or whose job was evicted
        let mut pruned = false;
        pollers.retain(|id, poller| {
            let keep = poller.is_running() && registry.job(id).is_some();
            if !keep {
                poller.stop();
                pruned = true;
            }
            keep
        });
        if pruned {
            self.inner.settle_snapshot(&pollers);
        }

        let poller = pollers
            .entry(job_id.to_string())
            .or_insert_with(|| self.new_poller(job_id));
        poller.update(session_id, true);
    }

    fn unwatch(&self, job_id: &str) {
        let mut pollers = self.inner.pollers.lock().unwrap();
        if let Some(mut poller) = pollers.remove(job_id) {
            poller.stop();
            self.inner.settle_snapshot(&pollers);
        }
    }

    fn new_poller(&self, job_id: &str) -> ProgressPoller {
        let on_progress = {
            let registry = self.inner.registry.clone();
            let job_id = job_id.to_string();
            move |update: &ProgressUpdate| {
                registry.update_progress(&job_id, progress_patch(update));
            }
        };
        let on_complete = {
            let registry = self.inner.registry.clone();
            let job_id = job_id.to_string();
            move |results: ImportResults| {
                registry.complete_import(&job_id, Some(results), None);
            }
        };
        let on_failed = {
            let registry = self.inner.registry.clone();
            let job_id = job_id.to_string();
            move |reason: String| {
                registry.complete_import(&job_id, None, Some(reason));
            }
        };

        // Weak so a poller owned by the service does not keep it alive
        let on_finished = {
            let inner: Weak<ServiceInner> = Arc::downgrade(&self.inner);
            move || {
                if let Some(inner) = inner.upgrade() {
                    let pollers = inner.pollers.lock().unwrap();
                    inner.settle_snapshot(&pollers);
                }
            }
        };

        let callbacks = PollerCallbacks::new()
            .on_progress(on_progress)
            .on_complete(on_complete)
            .on_failed(on_failed)
            .on_finished(on_finished);

        ProgressPoller::new(
            self.inner.api.clone(),
            self.inner.credentials.clone(),
            self.inner.store.clone(),
            callbacks,
        )
        .with_interval(self.inner.settings.poll_interval)
        .keep_snapshot_on_stop()
    }
}

impl ServiceInner {
    /// After a poller stopped, show another live poller's progress, or
    /// clear the snapshot when none is left.
    fn settle_snapshot(&self, pollers: &HashMap<String, ProgressPoller>) {
        let handed_over = pollers
            .iter()
            .filter(|(_, poller)| poller.is_running())
            .any(|(job_id, poller)| {
                let republished = poller.republish();
                if republished {
                    debug!("Snapshot handed to job {}", job_id);
                }
                republished
            });
        if !handed_over {
            self.store.clear_progress();
        }
    }
}

fn progress_patch(update: &ProgressUpdate) -> JobProgressPatch {
    JobProgressPatch {
        total: Some(update.total),
        current: Some(update.current),
        percentage: Some(update.percentage),
        current_action: Some(update.current_action.clone()),
        time_remaining: update.time_remaining,
    }
}

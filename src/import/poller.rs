use crate::api::{ApiError, ImportApi, ProgressReport, ProgressStatus};
use crate::credentials::{auth_token, CredentialStore};
use crate::import::snapshot::{ProgressStore, SnapshotPatch};
use crate::import::types::{calculate_percentage, ImportResults};
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Progress values extracted from one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub total: u64,
    pub current: u64,
    pub percentage: u8,
    pub current_action: String,
    pub time_remaining: Option<u64>,
}

impl ProgressUpdate {
    pub fn from_report(report: &ProgressReport) -> Self {
        let current = if report.total > 0 {
            report.current.min(report.total)
        } else {
            report.current
        };
        ProgressUpdate {
            total: report.total,
            current,
            percentage: calculate_percentage(current, report.total),
            current_action: report.current_action.clone(),
            time_remaining: report.time_remaining,
        }
    }
}

/// Content key used to drop repeated identical updates
pub fn progress_key(update: &ProgressUpdate) -> String {
    format!(
        "{}-{}-{}-{}",
        update.total, update.current, update.percentage, update.current_action
    )
}

/// Decide whether `update` differs from what was last sent.
///
/// Returns the decision together with the key to remember.
pub fn should_update(previous_key: Option<&str>, update: &ProgressUpdate) -> (bool, String) {
    let key = progress_key(update);
    (previous_key != Some(key.as_str()), key)
}

type ProgressCallback = Box<dyn Fn(&ProgressUpdate) + Send + Sync>;
type CompleteCallback = Box<dyn Fn(ImportResults) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(String) + Send + Sync>;
type FinishedCallback = Box<dyn Fn() + Send + Sync>;

/// Callbacks a poller reports to. All default to doing nothing.
///
/// `on_complete` and the terminal `on_error` fire at most once per poll run;
/// `on_error` also fires for transient fetch failures, after which polling
/// continues. `on_failed` fires only for the terminal case, right after
/// `on_error`. `on_finished` fires last whenever the loop ends on its own,
/// including a session that no longer exists.
pub struct PollerCallbacks {
    on_progress: ProgressCallback,
    on_complete: CompleteCallback,
    on_error: ErrorCallback,
    on_failed: ErrorCallback,
    on_finished: FinishedCallback,
}

impl PollerCallbacks {
    pub fn new() -> Self {
        Self {
            on_progress: Box::new(|_| {}),
            on_complete: Box::new(|_| {}),
            on_error: Box::new(|_| {}),
            on_failed: Box::new(|_| {}),
            on_finished: Box::new(|| {}),
        }
    }

    /// Called with each update that passed de-duplication
    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.on_progress = Box::new(f);
        self
    }

    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(ImportResults) + Send + Sync + 'static,
    {
        self.on_complete = Box::new(f);
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.on_error = Box::new(f);
        self
    }

    /// Called once when the backend reports the session failed
    pub fn on_failed<F>(mut self, f: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.on_failed = Box::new(f);
        self
    }

    pub fn on_finished<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_finished = Box::new(f);
        self
    }
}

impl Default for PollerCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

/// What the loop does after handling one fetch result
#[derive(Debug, PartialEq)]
enum Reaction {
    Continue,
    /// Terminal state reached; end the loop
    Finish,
}

/// Callback to deliver once the store is updated
#[derive(Debug, PartialEq)]
enum Notice {
    Progress(ProgressUpdate),
    Completed(ImportResults),
    Error(String),
    Failed(String),
}

struct ActivePoll {
    session_id: String,
    cancel: CancellationToken,
    /// Held while the loop writes to the store and while stopping, so no
    /// write can land after a stop. Holds the last patch written.
    apply_lock: Arc<Mutex<Option<SnapshotPatch>>>,
    task: JoinHandle<()>,
}

/// Periodically fetches one session's progress into the [`ProgressStore`].
///
/// Driven like a reactive hook: call [`update`](Self::update) whenever the
/// session id or the enabled flag may have changed. At most one fetch is in
/// flight at a time; ticks that fire meanwhile are skipped. Dropping the
/// poller cancels its loop.
///
/// By default stopping clears the snapshot. Owners running several pollers
/// over one store use [`keep_snapshot_on_stop`](Self::keep_snapshot_on_stop)
/// and settle the snapshot themselves.
pub struct ProgressPoller {
    api: ImportApi,
    credentials: Arc<dyn CredentialStore>,
    store: ProgressStore,
    callbacks: Arc<PollerCallbacks>,
    interval: Duration,
    clear_on_stop: bool,
    active: Option<ActivePoll>,
}

impl ProgressPoller {
    pub fn new(
        api: ImportApi,
        credentials: Arc<dyn CredentialStore>,
        store: ProgressStore,
        callbacks: PollerCallbacks,
    ) -> Self {
        Self {
            api,
            credentials,
            store,
            callbacks: Arc::new(callbacks),
            interval: DEFAULT_POLL_INTERVAL,
            clear_on_stop: true,
            active: None,
        }
    }

    /// Poll every `interval`. A zero interval is ignored.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        if interval.is_zero() {
            warn!("Ignoring zero poll interval, keeping {:?}", self.interval);
        } else {
            self.interval = interval;
        }
        self
    }

    /// Leave the snapshot as it is when polling stops or finishes
    pub fn keep_snapshot_on_stop(mut self) -> Self {
        self.clear_on_stop = false;
        self
    }

    /// Apply new inputs. Polling runs while `enabled` is set and `session_id`
    /// is non-empty; switching to another session restarts the loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn update(&mut self, session_id: &str, enabled: bool) {
        if !enabled || session_id.is_empty() {
            self.stop();
            return;
        }

        if let Some(active) = &self.active {
            // A loop that ended on a terminal state is started again
            if active.session_id == session_id && self.is_running() {
                return;
            }
        }

        self.stop();
        self.active = Some(self.spawn(session_id.to_string()));
    }

    /// Stop polling. Clears the snapshot unless it is kept. Safe to call
    /// repeatedly.
    pub fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        let _guard = active.apply_lock.lock().unwrap();
        if !active.cancel.is_cancelled() {
            active.cancel.cancel();
            if self.clear_on_stop {
                self.store.clear_progress();
            }
            debug!("Stopped polling session {}", active.session_id);
        }
    }

    /// Write this poller's latest progress to the store again.
    ///
    /// Returns false when the loop is not running or has not published
    /// anything yet.
    pub fn republish(&self) -> bool {
        let Some(active) = &self.active else {
            return false;
        };

        let published = active.apply_lock.lock().unwrap();
        if active.cancel.is_cancelled() {
            return false;
        }
        match published.as_ref() {
            Some(patch) => {
                self.store.update_progress(patch.clone());
                true
            }
            None => false,
        }
    }

    /// Whether a poll loop is currently alive
    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .map(|active| !active.cancel.is_cancelled() && !active.task.is_finished())
            .unwrap_or(false)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.session_id.as_str())
    }

    fn spawn(&self, session_id: String) -> ActivePoll {
        let cancel = CancellationToken::new();
        let apply_lock = Arc::new(Mutex::new(None));

        let poll_loop = PollLoop {
            session_id: session_id.clone(),
            api: self.api.clone(),
            credentials: self.credentials.clone(),
            store: self.store.clone(),
            callbacks: self.callbacks.clone(),
            cancel: cancel.clone(),
            apply_lock: apply_lock.clone(),
            clear_on_stop: self.clear_on_stop,
            last_key: None,
        };

        info!("Polling progress of session {} every {:?}", session_id, self.interval);
        let task = tokio::spawn(poll_loop.run(self.interval));

        ActivePoll {
            session_id,
            cancel,
            apply_lock,
            task,
        }
    }
}

impl Drop for ProgressPoller {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.cancel.cancel();
        }
    }
}

type PendingFetch = BoxFuture<'static, Result<ProgressReport, ApiError>>;

struct PollLoop {
    session_id: String,
    api: ImportApi,
    credentials: Arc<dyn CredentialStore>,
    store: ProgressStore,
    callbacks: Arc<PollerCallbacks>,
    cancel: CancellationToken,
    apply_lock: Arc<Mutex<Option<SnapshotPatch>>>,
    clear_on_stop: bool,
    last_key: Option<String>,
}

impl PollLoop {
    async fn run(mut self, period: Duration) {
        // First tick completes immediately
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut pending: Option<PendingFetch> = None;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                result = wait_pending(&mut pending), if pending.is_some() => {
                    pending = None;
                    if self.handle(result) {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if pending.is_some() {
                        trace!("Fetch for {} still in flight, skipping tick", self.session_id);
                        continue;
                    }
                    let Some(token) = auth_token(self.credentials.as_ref()) else {
                        debug!("No auth token, skipping poll of {}", self.session_id);
                        continue;
                    };
                    let api = self.api.clone();
                    let session_id = self.session_id.clone();
                    pending = Some(Box::pin(async move {
                        api.get_progress(&session_id, &token).await
                    }));
                }
            }
        }

        debug!("Poll loop for {} exited", self.session_id);
    }

    /// Apply one fetch result. Returns true when the loop should end.
    ///
    /// Store writes happen under `apply_lock`; callbacks run after it is
    /// released so they may freely call back into the poller's owner.
    fn handle(&mut self, result: Result<ProgressReport, ApiError>) -> bool {
        let apply_lock = self.apply_lock.clone();
        let (reaction, notice) = {
            let mut published = apply_lock.lock().unwrap();
            if self.cancel.is_cancelled() {
                return true;
            }
            self.apply(result, &mut published)
        };

        match notice {
            Some(Notice::Progress(update)) => (self.callbacks.on_progress)(&update),
            Some(Notice::Error(message)) => (self.callbacks.on_error)(message),
            Some(Notice::Completed(results)) => (self.callbacks.on_complete)(results),
            Some(Notice::Failed(reason)) => {
                (self.callbacks.on_error)(reason.clone());
                (self.callbacks.on_failed)(reason);
            }
            None => {}
        }

        if reaction == Reaction::Continue {
            return false;
        }

        {
            let _guard = apply_lock.lock().unwrap();
            if self.cancel.is_cancelled() {
                return true;
            }
            self.cancel.cancel();
            if self.clear_on_stop {
                self.store.clear_progress();
            }
        }
        (self.callbacks.on_finished)();
        true
    }

    /// Reconcile a fetch result into the store. Runs under `apply_lock`.
    fn apply(
        &mut self,
        result: Result<ProgressReport, ApiError>,
        published: &mut Option<SnapshotPatch>,
    ) -> (Reaction, Option<Notice>) {
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                warn!("Polling session {} failed: {}", self.session_id, e);
                return (Reaction::Continue, Some(Notice::Error(e.to_string())));
            }
        };

        match report.status {
            ProgressStatus::NotFound => {
                info!("Session {} no longer exists, stopping", self.session_id);
                *published = None;
                (Reaction::Finish, None)
            }
            ProgressStatus::Completed => {
                let update = ProgressUpdate::from_report(&report);
                self.store.update_progress(SnapshotPatch {
                    is_active: Some(false),
                    ..self.patch_for(&update)
                });
                *published = None;

                let results = report.results.unwrap_or(ImportResults {
                    imported: update.current,
                    skipped: 0,
                    failed: 0,
                    total: update.total,
                });
                info!("Session {} completed: {}", self.session_id, results.summary());
                (Reaction::Finish, Some(Notice::Completed(results)))
            }
            ProgressStatus::Failed | ProgressStatus::Cancelled => {
                self.store.update_progress(SnapshotPatch::inactive());
                *published = None;
                let fallback = if report.status == ProgressStatus::Cancelled {
                    "Import was cancelled"
                } else {
                    "Import failed"
                };
                let reason = report.error.unwrap_or_else(|| fallback.to_string());
                warn!("Session {} failed: {}", self.session_id, reason);
                (Reaction::Finish, Some(Notice::Failed(reason)))
            }
            ProgressStatus::Unknown(ref status) => {
                warn!(
                    "Session {} reported unknown status '{}', ignoring",
                    self.session_id, status
                );
                (Reaction::Continue, None)
            }
            ProgressStatus::Running | ProgressStatus::Pending => {
                let update = ProgressUpdate::from_report(&report);
                let (changed, key) = should_update(self.last_key.as_deref(), &update);
                if !changed {
                    return (Reaction::Continue, None);
                }
                let patch = SnapshotPatch {
                    is_active: Some(true),
                    ..self.patch_for(&update)
                };
                self.store.update_progress(patch.clone());
                *published = Some(patch);
                self.last_key = Some(key);
                (Reaction::Continue, Some(Notice::Progress(update)))
            }
        }
    }

    fn patch_for(&self, update: &ProgressUpdate) -> SnapshotPatch {
        SnapshotPatch {
            total: Some(update.total),
            current: Some(update.current),
            percentage: Some(update.percentage),
            current_action: Some(update.current_action.clone()),
            session_id: Some(self.session_id.clone()),
            is_active: None,
        }
    }
}

async fn wait_pending(pending: &mut Option<PendingFetch>) -> Result<ProgressReport, ApiError> {
    match pending {
        Some(fetch) => fetch.await,
        None => std::future::pending().await,
    }
}

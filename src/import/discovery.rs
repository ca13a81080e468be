use crate::api::{ApiError, ImportApi, ProgressStatus};
use crate::credentials::{auth_token, CredentialStore};
use crate::import::registry::ImportRegistry;
use crate::import::types::{JobStatus, NewImportJob};
use tracing::{debug, info};

/// What a discovery pass did to the registry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryOutcome {
    /// False when there was no auth token and nothing was fetched
    pub authenticated: bool,
    /// Number of active sessions the backend reported
    pub discovered: usize,
    /// Job ids created for sessions the registry did not know
    pub created: Vec<String>,
    /// Job ids whose progress was refreshed from the backend
    pub refreshed: Vec<String>,
}

/// Fold the backend's active sessions into the registry.
///
/// Known sessions only get their progress refreshed; unknown ones become
/// new jobs (`running` if the backend says so, `paused` otherwise). Local
/// jobs missing from the backend's list are left alone.
pub async fn recover_sessions(
    api: &ImportApi,
    credentials: &dyn CredentialStore,
    registry: &ImportRegistry,
) -> Result<DiscoveryOutcome, ApiError> {
    let Some(token) = auth_token(credentials) else {
        debug!("No auth token, skipping session discovery");
        return Ok(DiscoveryOutcome::default());
    };

    let sessions = api.discover_sessions(&token).await?;
    let mut outcome = DiscoveryOutcome {
        authenticated: true,
        discovered: sessions.len(),
        ..Default::default()
    };

    for session in sessions {
        if let Some(job) = registry.job_by_session(&session.id) {
            registry.sync_progress(&job.id, session.progress);
            outcome.refreshed.push(job.id);
            continue;
        }

        let status = if session.status == ProgressStatus::Running {
            JobStatus::Running
        } else {
            JobStatus::Paused
        };

        let job_id = registry.adopt_session(
            NewImportJob {
                session_id: session.id.clone(),
                provider: session.provider,
                progress: Some(session.progress),
                start_time: session.created_at,
            },
            status,
        );
        info!(
            "Recovered {} session {} as job {} ({})",
            session.provider, session.id, job_id, status
        );
        outcome.created.push(job_id);
    }

    if outcome.discovered > 0 {
        registry.set_show_progress(true);
    }

    Ok(outcome)
}

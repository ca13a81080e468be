use crate::api::models::{
    DiscoverResponse, FlatProgressResponse, ImportOptions, NestedProgressResponse,
    ProgressReport, ProgressStatus, RemoteSession, StartImportResponse,
};
use crate::import::Provider;
use crate::net::{NetFetch, NetRequest, NetResponse};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("{0}")]
    Transport(String),
    #[error("Not authorized - please sign in again")]
    Unauthorized,
    #[error("Server returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// Typed client for the import endpoints of the backend
#[derive(Clone)]
pub struct ImportApi {
    fetch: Arc<dyn NetFetch>,
    base_url: String,
}

impl ImportApi {
    pub fn new(fetch: Arc<dyn NetFetch>, base_url: impl Into<String>) -> Self {
        Self {
            fetch,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Fetch current progress of a session.
    ///
    /// A 404, or a body reporting `not_found`, yields a report with
    /// [`ProgressStatus::NotFound`] rather than an error.
    pub async fn get_progress(
        &self,
        session_id: &str,
        token: &str,
    ) -> Result<ProgressReport, ApiError> {
        let url = format!("{}/progress/{}", self.base_url, session_id);
        let response = self.fetch.fetch(NetRequest::get(url).bearer(token)).await;

        if response.status == Some(404) {
            debug!("Session {} not found on server", session_id);
            return Ok(ProgressReport::not_found());
        }

        let data = expect_data(response)?;
        parse_progress(&data)
    }

    /// List sessions the backend still considers active
    pub async fn discover_sessions(&self, token: &str) -> Result<Vec<RemoteSession>, ApiError> {
        let url = format!("{}/sessions/discover", self.base_url);
        let response = self.fetch.fetch(NetRequest::get(url).bearer(token)).await;
        let data = expect_data(response)?;

        let parsed: DiscoverResponse =
            serde_json::from_value(data).map_err(|e| ApiError::Malformed(e.to_string()))?;

        let mut sessions = Vec::with_capacity(parsed.active_sessions.len());
        for raw in parsed.active_sessions {
            let provider: Provider = match raw.source.parse() {
                Ok(provider) => provider,
                Err(e) => {
                    warn!("Skipping session {}: {}", raw.id, e);
                    continue;
                }
            };

            sessions.push(RemoteSession {
                id: raw.id,
                provider,
                status: ProgressStatus::parse(raw.status.as_deref()),
                progress: raw.progress.unwrap_or_default().into_job_progress(),
                metadata: raw.metadata,
                created_at: raw.created_at,
            });
        }

        Ok(sessions)
    }

    /// Ask the backend to start importing from `provider`; returns the session id
    pub async fn start_import(
        &self,
        provider: Provider,
        token: &str,
        options: &ImportOptions,
    ) -> Result<String, ApiError> {
        let url = format!("{}/import/{}", self.base_url, provider);

        let mut body = json!({});
        if let Some(provider_token) = &options.provider_token {
            body["accessToken"] = json!(provider_token);
        }
        if let Some(since) = options.since {
            body["since"] = json!(since.to_rfc3339());
        }

        let response = self
            .fetch
            .fetch(NetRequest::post(url, body).bearer(token))
            .await;
        let data = expect_data(response)?;

        let parsed: StartImportResponse =
            serde_json::from_value(data).map_err(|e| ApiError::Malformed(e.to_string()))?;
        if parsed.session_id.is_empty() {
            return Err(ApiError::Malformed("empty sessionId".to_string()));
        }

        info!("Backend started {} import as session {}", provider, parsed.session_id);
        Ok(parsed.session_id)
    }

    /// Ask the backend to stop a running session
    pub async fn cancel_import(&self, session_id: &str, token: &str) -> Result<(), ApiError> {
        let url = format!("{}/sessions/{}/cancel", self.base_url, session_id);
        let response = self
            .fetch
            .fetch(NetRequest::post(url, json!({})).bearer(token))
            .await;

        if response.success {
            Ok(())
        } else {
            Err(response_error(response))
        }
    }
}

/// Parse a progress body in either the nested (`session.progress`) or the
/// older flat shape.
pub fn parse_progress(data: &Value) -> Result<ProgressReport, ApiError> {
    if data.get("session").map(Value::is_object).unwrap_or(false) {
        let nested: NestedProgressResponse = serde_json::from_value(data.clone())
            .map_err(|e| ApiError::Malformed(e.to_string()))?;
        let session = nested.session;
        let progress = session.progress.unwrap_or_default();

        return Ok(ProgressReport {
            status: ProgressStatus::parse(session.status.as_deref()),
            total: progress.total.unwrap_or(0),
            current: progress.current.unwrap_or(0),
            current_action: progress.action.unwrap_or_default(),
            time_remaining: progress.estimated_time_remaining,
            results: session.results,
            error: session.error,
        });
    }

    if !data.is_object() {
        return Err(ApiError::Malformed("expected a JSON object".to_string()));
    }

    debug!("Progress response in flat shape");
    let flat: FlatProgressResponse =
        serde_json::from_value(data.clone()).map_err(|e| ApiError::Malformed(e.to_string()))?;

    Ok(ProgressReport {
        status: ProgressStatus::parse(flat.status.as_deref()),
        total: flat.progress.total.unwrap_or(0),
        current: flat.progress.current.unwrap_or(0),
        current_action: flat.progress.action.unwrap_or_default(),
        time_remaining: flat.progress.estimated_time_remaining,
        results: flat.results,
        error: flat.error,
    })
}

fn expect_data(response: NetResponse) -> Result<Value, ApiError> {
    if !response.success {
        return Err(response_error(response));
    }
    response
        .data
        .ok_or_else(|| ApiError::Malformed("empty response body".to_string()))
}

fn response_error(response: NetResponse) -> ApiError {
    match response.status {
        Some(401) | Some(403) => ApiError::Unauthorized,
        Some(status) => {
            // Prefer the server's own message when it sent one
            let message = response
                .data
                .as_ref()
                .and_then(|d| d.get("error").or_else(|| d.get("message")))
                .and_then(Value::as_str)
                .map(str::to_string)
                .or(response.error)
                .unwrap_or_else(|| "request failed".to_string());
            ApiError::Http { status, message }
        }
        None => ApiError::Transport(
            response
                .error
                .unwrap_or_else(|| "Network request failed".to_string()),
        ),
    }
}

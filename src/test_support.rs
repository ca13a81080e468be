// Test support utilities for both unit and integration tests

use crate::credentials::{CredentialError, CredentialStore, AUTH_TOKEN_KEY};
use crate::import::registry::{JobRepository, RegistryError, RegistryState};
use crate::net::{NetFetch, NetRequest, NetResponse};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Scripted stand-in for the native network bridge
///
/// Responses are served in the order they were pushed; the last one keeps
/// being served once the queue is down to it. With nothing queued every
/// request gets a transport error. Routed responses take precedence and are
/// served for every request whose url ends with the route.
#[derive(Default)]
pub struct MockNetFetch {
    responses: Mutex<VecDeque<NetResponse>>,
    routes: Mutex<Vec<(String, NetResponse)>>,
    requests: Mutex<Vec<NetRequest>>,
    delay: Mutex<Option<Duration>>,
}

impl MockNetFetch {
    #[allow(unused)] // Used in tests
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: NetResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    /// Answer every request whose url ends with `suffix`, replacing any
    /// earlier response for the same route
    pub fn respond_to(&self, suffix: &str, response: NetResponse) {
        let mut routes = self.routes.lock().unwrap();
        routes.retain(|(route, _)| route != suffix);
        routes.push((suffix.to_string(), response));
    }

    /// Make each fetch take `delay` before answering
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn requests(&self) -> Vec<NetRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next_response(&self) -> NetResponse {
        let mut responses = self.responses.lock().unwrap();
        if responses.len() > 1 {
            return responses.pop_front().unwrap();
        }
        responses
            .front()
            .cloned()
            .unwrap_or_else(|| NetResponse::transport_error("No mock response queued"))
    }
}

#[async_trait::async_trait]
impl NetFetch for MockNetFetch {
    async fn fetch(&self, request: NetRequest) -> NetResponse {
        let routed = self
            .routes
            .lock()
            .unwrap()
            .iter()
            .find(|(suffix, _)| request.url.ends_with(suffix.as_str()))
            .map(|(_, response)| response.clone());
        self.requests.lock().unwrap().push(request);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        routed.unwrap_or_else(|| self.next_response())
    }
}

/// In-memory credential store
#[derive(Default)]
pub struct MemoryCredentialStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: &str) -> Self {
        let store = Self::new();
        store.set_token(token);
        store
    }

    pub fn set_token(&self, token: &str) {
        self.values
            .lock()
            .unwrap()
            .insert(AUTH_TOKEN_KEY.to_string(), token.to_string());
    }

    pub fn clear(&self) {
        self.values.lock().unwrap().clear();
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Result<Option<String>, CredentialError> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CredentialError> {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CredentialError> {
        self.values.lock().unwrap().remove(key);
        Ok(())
    }
}

/// In-memory job repository that records what was saved
#[derive(Default)]
pub struct MemoryJobRepository {
    stored: Mutex<Option<RegistryState>>,
    saves: AtomicUsize,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository that already holds `state`, as after a previous run
    pub fn with_state(state: RegistryState) -> Self {
        Self {
            stored: Mutex::new(Some(state)),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn saved(&self) -> Option<RegistryState> {
        self.stored.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl JobRepository for MemoryJobRepository {
    fn load(&self) -> Result<RegistryState, RegistryError> {
        Ok(self.stored.lock().unwrap().clone().unwrap_or_default())
    }

    fn save(&self, state: &RegistryState) -> Result<(), RegistryError> {
        *self.stored.lock().unwrap() = Some(state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

use keyring::Entry;
use thiserror::Error;
use tracing::{info, warn};

const KEYRING_SERVICE: &str = "saver";

pub const AUTH_TOKEN_KEY: &str = "authToken";
pub const USER_EMAIL_KEY: &str = "userEmail";

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// Synchronous key-value store holding the signed-in user's credentials
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CredentialError>;
    fn set(&self, key: &str, value: &str) -> Result<(), CredentialError>;
    fn delete(&self, key: &str) -> Result<(), CredentialError>;
}

/// Credential store backed by the OS keychain
#[derive(Debug, Clone, Default)]
pub struct KeyringCredentialStore;

impl KeyringCredentialStore {
    pub fn new() -> Self {
        KeyringCredentialStore
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn get(&self, key: &str) -> Result<Option<String>, CredentialError> {
        let entry = Entry::new(KEYRING_SERVICE, key)?;
        match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(CredentialError::Keyring(e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CredentialError> {
        let entry = Entry::new(KEYRING_SERVICE, key)?;
        entry.set_password(value)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CredentialError> {
        let entry = Entry::new(KEYRING_SERVICE, key)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(CredentialError::Keyring(e)),
        }
    }
}

/// Current bearer token, if any.
///
/// A missing token is a normal signed-out state. Store failures are logged
/// and also reported as "no token" so callers simply skip their cycle.
pub fn auth_token(store: &dyn CredentialStore) -> Option<String> {
    match store.get(AUTH_TOKEN_KEY) {
        Ok(Some(token)) if !token.is_empty() => Some(token),
        Ok(_) => None,
        Err(e) => {
            warn!("Could not read auth token: {}", e);
            None
        }
    }
}

pub fn sign_in(store: &dyn CredentialStore, token: &str, email: &str) -> Result<(), CredentialError> {
    store.set(AUTH_TOKEN_KEY, token)?;
    store.set(USER_EMAIL_KEY, email)?;
    info!("Stored credentials for {}", email);
    Ok(())
}

pub fn sign_out(store: &dyn CredentialStore) -> Result<(), CredentialError> {
    store.delete(AUTH_TOKEN_KEY)?;
    store.delete(USER_EMAIL_KEY)?;
    info!("Cleared stored credentials");
    Ok(())
}

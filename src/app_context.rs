use crate::api::ImportApi;
use crate::config::Config;
use crate::credentials::{CredentialStore, KeyringCredentialStore};
use crate::import::{
    ImportRegistry, ImportService, ImportSettings, JsonFileRepository, ProgressStore,
};
use crate::net::{NetFetch, ReqwestNetFetch};
use std::sync::Arc;

/// Process-wide collaborators, constructed once at startup
#[derive(Clone)]
pub struct AppContext {
    pub config: Config,
    pub credentials: Arc<dyn CredentialStore>,
    pub progress_store: ProgressStore,
    pub registry: ImportRegistry,
    pub import_service: ImportService,
}

impl AppContext {
    /// Wire the given bridge and credential store together
    pub fn new(
        config: Config,
        fetch: Arc<dyn NetFetch>,
        credentials: Arc<dyn CredentialStore>,
        registry: ImportRegistry,
    ) -> Self {
        let progress_store = ProgressStore::new();
        let import_service = ImportService::new(
            ImportApi::new(fetch, config.api_base_url.clone()),
            credentials.clone(),
            progress_store.clone(),
            registry.clone(),
            ImportSettings::from(&config),
        );

        Self {
            config,
            credentials,
            progress_store,
            registry,
            import_service,
        }
    }

    /// Production wiring: reqwest, the OS keychain and the on-disk registry
    pub fn from_config(config: Config) -> Self {
        let repository = JsonFileRepository::new(config.job_registry_path());
        let registry = ImportRegistry::open(Arc::new(repository), config.auto_remove_delay);

        Self::new(
            config,
            Arc::new(ReqwestNetFetch::new()),
            Arc::new(KeyringCredentialStore::new()),
            registry,
        )
    }
}

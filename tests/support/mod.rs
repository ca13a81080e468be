use saver::config::Config;
use saver::import::{ImportRegistry, JsonFileRepository};
use saver::net::NetFetch;
use saver::test_support::MemoryCredentialStore;
use saver::AppContext;
use std::path::Path;
use std::sync::Arc;

/// Initialize tracing for tests with proper test output handling
pub fn tracing_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Config pointing at a scratch data directory and a fake backend
pub fn test_config(data_dir: &Path) -> Config {
    let data_dir = data_dir.to_string_lossy().to_string();
    Config::from_lookup(|key| match key {
        "SAVER_API_BASE_URL" => Some("http://backend/api".to_string()),
        "SAVER_DATA_DIR" => Some(data_dir.clone()),
        _ => None,
    })
    .unwrap()
}

/// Context backed by a JSON registry file under `data_dir`, as after a restart
pub fn open_context(
    data_dir: &Path,
    fetch: Arc<dyn NetFetch>,
    credentials: Arc<MemoryCredentialStore>,
) -> AppContext {
    let config = test_config(data_dir);
    let repository = JsonFileRepository::new(config.job_registry_path());
    let registry = ImportRegistry::open(Arc::new(repository), config.auto_remove_delay);
    AppContext::new(config, fetch, credentials, registry)
}

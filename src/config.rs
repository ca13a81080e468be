use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const DEFAULT_API_BASE_URL: &str = "http://localhost:3003/api";
const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
const DEFAULT_AUTO_REMOVE_DELAY_MS: u64 = 5000;
const DEFAULT_STUCK_IMPORT_THRESHOLD_SECS: u64 = 10 * 60;
const DEFAULT_HOUSEKEEPING_INTERVAL_SECS: u64 = 60;

/// File inside the data directory holding the persisted job registry
pub const JOB_REGISTRY_FILE: &str = "import-jobs.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
    #[error("Could not determine a data directory; set SAVER_DATA_DIR")]
    NoDataDir,
}

/// Application configuration
/// In debug builds: loads a .env file first, then reads the environment
/// In release builds: reads the environment only
#[derive(Clone, Debug)]
pub struct Config {
    /// Backend base URL, without trailing slash
    pub api_base_url: String,
    /// How often the progress poller fetches a session
    pub poll_interval: Duration,
    /// How long a completed job stays in the registry before removal
    pub auto_remove_delay: Duration,
    /// Running jobs older than this are treated as abandoned
    pub stuck_import_threshold: Duration,
    /// How often housekeeping sweeps for abandoned jobs
    pub housekeeping_interval: Duration,
    /// Directory holding persisted client state
    pub data_dir: PathBuf,
}

impl Config {
    /// Load configuration based on build mode
    pub fn load() -> Result<Self, ConfigError> {
        #[cfg(debug_assertions)]
        {
            if dotenvy::dotenv().is_ok() {
                info!("Config: Dev mode activated - loaded .env file");
            } else {
                info!("Config: No .env file found, using environment only");
            }
        }

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (the environment in production)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_base_url = lookup("SAVER_API_BASE_URL")
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let poll_interval = Duration::from_millis(parse_u64(
            &lookup,
            "SAVER_POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL_MS,
        )?);
        let auto_remove_delay = Duration::from_millis(parse_u64(
            &lookup,
            "SAVER_AUTO_REMOVE_DELAY_MS",
            DEFAULT_AUTO_REMOVE_DELAY_MS,
        )?);
        let stuck_import_threshold = Duration::from_secs(parse_u64(
            &lookup,
            "SAVER_STUCK_IMPORT_THRESHOLD_SECS",
            DEFAULT_STUCK_IMPORT_THRESHOLD_SECS,
        )?);
        let housekeeping_interval = Duration::from_secs(parse_u64(
            &lookup,
            "SAVER_HOUSEKEEPING_INTERVAL_SECS",
            DEFAULT_HOUSEKEEPING_INTERVAL_SECS,
        )?);

        let data_dir = match lookup("SAVER_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .map(|home| home.join(".saver"))
                .ok_or(ConfigError::NoDataDir)?,
        };

        // Both drive tokio intervals, which reject a zero period
        for (key, period) in [
            ("SAVER_POLL_INTERVAL_MS", poll_interval),
            ("SAVER_HOUSEKEEPING_INTERVAL_SECS", housekeeping_interval),
        ] {
            if period.is_zero() {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    value: "0".to_string(),
                });
            }
        }

        info!(
            "Config: API at {}, polling every {:?}, data in {}",
            api_base_url,
            poll_interval,
            data_dir.display()
        );

        Ok(Config {
            api_base_url,
            poll_interval,
            auto_remove_delay,
            stuck_import_threshold,
            housekeeping_interval,
            data_dir,
        })
    }

    /// Path of the persisted job registry blob
    pub fn job_registry_path(&self) -> PathBuf {
        self.data_dir.join(JOB_REGISTRY_FILE)
    }
}

fn parse_u64<F>(lookup: &F, key: &str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup_from(&[("SAVER_DATA_DIR", "/tmp/saver")])).unwrap();

        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.poll_interval, Duration::from_millis(2000));
        assert_eq!(config.auto_remove_delay, Duration::from_secs(5));
        assert_eq!(config.stuck_import_threshold, Duration::from_secs(600));
        assert_eq!(
            config.job_registry_path(),
            PathBuf::from("/tmp/saver/import-jobs.json")
        );
    }

    #[test]
    fn test_overrides_and_trailing_slash() {
        let config = Config::from_lookup(lookup_from(&[
            ("SAVER_DATA_DIR", "/tmp/saver"),
            ("SAVER_API_BASE_URL", "https://saver.example.com/api/"),
            ("SAVER_POLL_INTERVAL_MS", "500"),
            ("SAVER_STUCK_IMPORT_THRESHOLD_SECS", "120"),
        ]))
        .unwrap();

        assert_eq!(config.api_base_url, "https://saver.example.com/api");
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.stuck_import_threshold, Duration::from_secs(120));
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let result = Config::from_lookup(lookup_from(&[
            ("SAVER_DATA_DIR", "/tmp/saver"),
            ("SAVER_POLL_INTERVAL_MS", "soon"),
        ]));
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));

        let result = Config::from_lookup(lookup_from(&[
            ("SAVER_DATA_DIR", "/tmp/saver"),
            ("SAVER_POLL_INTERVAL_MS", "0"),
        ]));
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));

        let result = Config::from_lookup(lookup_from(&[
            ("SAVER_DATA_DIR", "/tmp/saver"),
            ("SAVER_HOUSEKEEPING_INTERVAL_SECS", "0"),
        ]));
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { ref key, .. }) if key == "SAVER_HOUSEKEEPING_INTERVAL_SECS"
        ));
    }
}

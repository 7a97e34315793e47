use std::path::PathBuf;
use std::time::Duration;

use crate::db::PoolSettings;
use crate::notify::EmailConfig;
use crate::queue::{QueueSettings, DEFAULT_QUEUE};
use crate::runner::RunnerSettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no database configured: set DATABASE_URL or DB_HOST and DB_NAME")]
    MissingDatabase,

    #[error("{key}={value:?} is not a valid value")]
    Invalid { key: &'static str, value: String },

    #[error("{key}={value} is out of range {min}..={max}")]
    OutOfRange {
        key: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("conversion timeout ({convert_secs}s) must be shorter than the queue lease ({lease_secs}s)")]
    TimeoutNotBelowLease { convert_secs: u64, lease_secs: u64 },
}

/// Runtime settings for the worker and the operator tools, read once at
/// startup and passed down to constructors.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    /// Broker connection; the queue lives in Postgres too.
    pub queue_database_url: String,
    pub queue: String,
    pub worker_id: String,
    pub workers: usize,
    pub lease_seconds: u64,
    pub convert_timeout_seconds: u64,
    pub poll_interval_ms: u64,
    pub reap_interval_ms: u64,
    pub upload_folder: PathBuf,
    pub converted_folder: PathBuf,
    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
    pub log_json: bool,
    pub pool: PoolSettings,
    /// `None` disables notifications.
    pub email: Option<EmailConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        // blank values count as unset
        let get = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());

        let database_url = match get("DATABASE_URL") {
            Some(url) => url,
            None => database_url_from_parts(&get, None)?,
        };

        let queue_database_url = match get("QUEUE_DATABASE_URL") {
            Some(url) => url,
            None => match get("QUEUE_HOST") {
                Some(host) => database_url_from_parts(&get, Some(&host))?,
                None => database_url.clone(),
            },
        };

        let queue = env_or_fallback(&get, "IMAGEFLOW_QUEUE", "QUEUE")
            .unwrap_or_else(|| DEFAULT_QUEUE.to_string());

        let worker_id = env_or_fallback(&get, "IMAGEFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| get("HOSTNAME"))
            .unwrap_or_else(|| "worker-1".to_string());

        let workers = ranged(&get, "IMAGEFLOW_WORKERS", 1, 1, 64)? as usize;
        let lease_seconds = ranged(&get, "IMAGEFLOW_LEASE_SECONDS", 300, 1, 86_400)?;
        let convert_timeout_seconds =
            ranged(&get, "IMAGEFLOW_CONVERT_TIMEOUT_SECONDS", 120, 1, 86_400)?;
        if convert_timeout_seconds >= lease_seconds {
            return Err(ConfigError::TimeoutNotBelowLease {
                convert_secs: convert_timeout_seconds,
                lease_secs: lease_seconds,
            });
        }

        let poll_interval_ms = ranged(&get, "IMAGEFLOW_POLL_INTERVAL_MS", 250, 10, 60_000)?;
        let reap_interval_ms = ranged(&get, "IMAGEFLOW_REAP_INTERVAL_MS", 5_000, 100, 600_000)?;

        let upload_folder = get("UPLOAD_FOLDER").unwrap_or_else(|| "uploads".to_string());
        let converted_folder =
            get("CONVERTED_FOLDER").unwrap_or_else(|| "converted_images".to_string());

        let admin_addr = env_or_fallback(&get, "IMAGEFLOW_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool(&get, "IMAGEFLOW_MIGRATE_ON_STARTUP")?.unwrap_or(false);
        let log_json = env_bool(&get, "IMAGEFLOW_LOG_JSON")?.unwrap_or(false);

        let pool = PoolSettings {
            max_connections: ranged(&get, "IMAGEFLOW_DB_MAX_CONNECTIONS", 4, 1, 32)? as u32,
            acquire_timeout: Duration::from_secs(ranged(
                &get,
                "IMAGEFLOW_DB_ACQUIRE_TIMEOUT_SECS",
                10,
                1,
                60,
            )?),
        };

        let email = EmailConfig::from_lookup(&get);

        Ok(Self {
            database_url,
            queue_database_url,
            queue,
            worker_id,
            workers,
            lease_seconds,
            convert_timeout_seconds,
            poll_interval_ms,
            reap_interval_ms,
            upload_folder: PathBuf::from(upload_folder),
            converted_folder: PathBuf::from(converted_folder),
            admin_addr,
            migrate_on_startup,
            log_json,
            pool,
            email,
        })
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            queue: self.queue.clone(),
            lease: Duration::from_secs(self.lease_seconds),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            reap_interval: Duration::from_millis(self.reap_interval_ms),
        }
    }

    /// Settings for the first loop; further loops get their own consumer id.
    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            consumer_id: self.worker_id.clone(),
            convert_timeout: Duration::from_secs(self.convert_timeout_seconds),
            error_backoff: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

fn database_url_from_parts(
    get: &impl Fn(&str) -> Option<String>,
    host_override: Option<&str>,
) -> Result<String, ConfigError> {
    let host = host_override
        .map(str::to_string)
        .or_else(|| get("DB_HOST"))
        .ok_or(ConfigError::MissingDatabase)?;
    let name = get("DB_NAME").ok_or(ConfigError::MissingDatabase)?;

    let auth = match (get("DB_USER"), get("DB_PASSWORD")) {
        (Some(user), Some(password)) => format!("{user}:{password}@"),
        (Some(user), None) => format!("{user}@"),
        _ => String::new(),
    };

    Ok(format!("postgres://{auth}{host}/{name}"))
}

fn env_or_fallback(
    get: &impl Fn(&str) -> Option<String>,
    primary: &str,
    fallback: &str,
) -> Option<String> {
    get(primary).or_else(|| get(fallback))
}

fn env_bool(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<bool>, ConfigError> {
    let Some(v) = get(key) else {
        return Ok(None);
    };
    match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::Invalid { key, value: v }),
    }
}

fn ranged(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    let value: u64 = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { key, value: raw.clone() })?;
    if !(min..=max).contains(&value) {
        return Err(ConfigError::OutOfRange {
            key,
            value,
            min,
            max,
        });
    }
    Ok(value)
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}

//! Configuration types.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Which backend holds task records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local map, lost on restart.
    Memory,
    /// Networked Redis (or compatible) key-value store.
    Redis { url: String },
    /// libSQL database file.
    LibSql { path: PathBuf },
}

/// Background executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of conversions running at once.
    pub concurrency: usize,
    /// Deadline applied to submissions that don't carry their own.
    pub default_deadline: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            default_deadline: Some(Duration::from_secs(600)),
        }
    }
}

/// Retention sweeper settings.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Records whose `updated_at` is older than this are deleted.
    pub retention: Duration,
    /// How often the sweep runs.
    pub sweep_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

/// External converter and source fetching settings.
#[derive(Debug, Clone)]
pub struct ConverterConfig {
    /// Converter binary, resolved through `PATH`.
    pub program: String,
    /// Arguments placed before the converter's own flags.
    pub prefix_args: Vec<String>,
    /// Zoom factor passed to the converter.
    pub zoom: f32,
    /// Timeout for downloading remote documents.
    pub download_timeout: Duration,
    /// Authorities (`host[:port]`) whose `/uploads/` URLs are read from disk.
    pub same_origin_hosts: Vec<String>,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            program: "pdf2htmlEX".to_string(),
            prefix_args: Vec::new(),
            zoom: 1.3,
            download_timeout: Duration::from_secs(30),
            same_origin_hosts: vec!["localhost:8090".to_string(), "127.0.0.1:8090".to_string()],
        }
    }
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind: SocketAddr,
    pub uploads_dir: PathBuf,
    pub converts_dir: PathBuf,
    pub store: StoreBackend,
    pub executor: ExecutorConfig,
    pub retention: RetentionConfig,
    pub converter: ConverterConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let uploads_dir = PathBuf::from("./uploads");
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8090)),
            converts_dir: uploads_dir.join("converts"),
            uploads_dir,
            store: StoreBackend::Memory,
            executor: ExecutorConfig::default(),
            retention: RetentionConfig::default(),
            converter: ConverterConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind = parse_or(get("PDF2HTML_BIND"), "PDF2HTML_BIND", defaults.bind)?;

        let uploads_dir = get("UPLOADS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.uploads_dir);
        let converts_dir = get("CONVERTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| uploads_dir.join("converts"));

        let store = match get("TASK_STORE").as_deref().map(str::to_ascii_lowercase) {
            None => StoreBackend::Memory,
            Some(kind) => match kind.as_str() {
                "memory" => StoreBackend::Memory,
                "redis" => StoreBackend::Redis {
                    url: get("REDIS_URL").unwrap_or_else(|| "redis://localhost".to_string()),
                },
                "libsql" => StoreBackend::LibSql {
                    path: get("TASK_DB_PATH")
                        .map(PathBuf::from)
                        .unwrap_or_else(|| PathBuf::from("./data/tasks.db")),
                },
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "TASK_STORE".to_string(),
                        message: format!("unknown backend '{other}' (expected memory, redis or libsql)"),
                    });
                }
            },
        };

        let concurrency: usize = parse_or(
            get("EXECUTOR_CONCURRENCY"),
            "EXECUTOR_CONCURRENCY",
            defaults.executor.concurrency,
        )?;
        if concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "EXECUTOR_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        let timeout_secs: u64 = parse_or(get("CONVERSION_TIMEOUT_SECS"), "CONVERSION_TIMEOUT_SECS", 600)?;

        let retention_hours: u64 = parse_or(get("RETENTION_HOURS"), "RETENTION_HOURS", 24)?;
        let retention_secs = retention_hours
            .checked_mul(3600)
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "RETENTION_HOURS".to_string(),
                message: format!("'{retention_hours}' hours is out of range"),
            })?;
        let sweep_secs: u64 = parse_or(get("SWEEP_INTERVAL_SECS"), "SWEEP_INTERVAL_SECS", 3600)?;
        if sweep_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SWEEP_INTERVAL_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let same_origin_hosts = match get("SAME_ORIGIN_HOSTS") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.converter.same_origin_hosts,
        };
        let download_secs: u64 = parse_or(get("DOWNLOAD_TIMEOUT_SECS"), "DOWNLOAD_TIMEOUT_SECS", 30)?;

        Ok(Self {
            bind,
            uploads_dir,
            converts_dir,
            store,
            executor: ExecutorConfig {
                concurrency,
                default_deadline: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            },
            retention: RetentionConfig {
                retention: Duration::from_secs(retention_secs),
                sweep_interval: Duration::from_secs(sweep_secs),
            },
            converter: ConverterConfig {
                program: get("CONVERTER_PROGRAM").unwrap_or(defaults.converter.program),
                prefix_args: get("CONVERTER_PREFIX_ARGS")
                    .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
                zoom: parse_or(get("CONVERTER_ZOOM"), "CONVERTER_ZOOM", defaults.converter.zoom)?,
                download_timeout: Duration::from_secs(download_secs),
                same_origin_hosts,
            },
        })
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{value}': {e}"),
        }),
    }
}

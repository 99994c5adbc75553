use crate::db::{DEFAULT_QUERY_LIMIT, MAX_QUERY_LIMIT};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Process settings read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: PathBuf,
    pub cleanup_days: u32,
    pub cleanup_interval: Duration,
    /// `None` disables periodic backups.
    pub backup_interval: Option<Duration>,
    pub backup_dir: PathBuf,
    pub log_level: String,
    pub rate_limit_enabled: bool,
    pub rate_limit_per_minute: u32,
    pub cors_origins: Vec<String>,
    pub default_query_limit: u32,
    pub max_query_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            database_path: PathBuf::from("data/meter_data.db"),
            cleanup_days: 30,
            cleanup_interval: Duration::from_secs(86_400),
            backup_interval: Some(Duration::from_secs(3600)),
            backup_dir: PathBuf::from("data/backups"),
            log_level: "info".to_string(),
            rate_limit_enabled: true,
            rate_limit_per_minute: 60,
            cors_origins: vec!["*".to_string()],
            default_query_limit: DEFAULT_QUERY_LIMIT,
            max_query_limit: MAX_QUERY_LIMIT,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or unparseable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backup_secs: u64 = parse_or(
            get("DATABASE_BACKUP_INTERVAL"),
            defaults.backup_interval.map_or(0, |d| d.as_secs()),
        );

        Self {
            host: get("HOST").unwrap_or(defaults.host),
            port: parse_or(get("PORT"), defaults.port),
            database_path: get("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            cleanup_days: parse_or(get("DATABASE_CLEANUP_DAYS"), defaults.cleanup_days),
            cleanup_interval: Duration::from_secs(parse_or(
                get("CLEANUP_INTERVAL_SECS"),
                defaults.cleanup_interval.as_secs(),
            )),
            backup_interval: (backup_secs > 0).then(|| Duration::from_secs(backup_secs)),
            backup_dir: get("BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.backup_dir),
            log_level: get("LOG_LEVEL")
                .map(|level| level.to_lowercase())
                .unwrap_or(defaults.log_level),
            rate_limit_enabled: get("RATE_LIMIT_ENABLED")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.rate_limit_enabled),
            rate_limit_per_minute: parse_or(
                get("RATE_LIMIT_PER_MINUTE"),
                defaults.rate_limit_per_minute,
            ),
            cors_origins: get("CORS_ORIGINS")
                .map(|origins| {
                    origins
                        .split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.cors_origins),
            default_query_limit: parse_or(get("DEFAULT_QUERY_LIMIT"), defaults.default_query_limit),
            max_query_limit: parse_or(get("MAX_QUERY_LIMIT"), defaults.max_query_limit),
        }
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

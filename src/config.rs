use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;

/// Runtime settings, read from `LESSOND_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// Unset means negotiations wait for the organizer forever.
    pub negotiation_ttl: Option<TimeDelta>,
    pub reaper_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7878,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            negotiation_ttl: None,
            reaper_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.var, self.value)
    }
}

impl std::error::Error for ConfigError {}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { var, value }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let ttl_secs: Option<u32> = parse(&lookup, "LESSOND_NEGOTIATION_TTL_SECS")?;
        let reaper_secs: Option<u64> = parse(&lookup, "LESSOND_REAPER_INTERVAL_SECS")?;
        if reaper_secs == Some(0) {
            return Err(ConfigError {
                var: "LESSOND_REAPER_INTERVAL_SECS",
                value: "0".into(),
            });
        }
        Ok(Self {
            bind: lookup("LESSOND_BIND").unwrap_or(defaults.bind),
            port: parse(&lookup, "LESSOND_PORT")?.unwrap_or(defaults.port),
            data_dir: lookup("LESSOND_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_connections: parse(&lookup, "LESSOND_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            compact_threshold: parse(&lookup, "LESSOND_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parse(&lookup, "LESSOND_METRICS_PORT")?,
            negotiation_ttl: ttl_secs.map(|s| TimeDelta::seconds(i64::from(s))),
            reaper_interval: reaper_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.reaper_interval),
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("lessond.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

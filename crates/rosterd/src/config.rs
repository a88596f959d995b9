use roster_core::{MatchError, Threshold};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid similarity threshold: {0}")]
    Threshold(#[from] MatchError),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(Self::Session),
            "system" => Ok(Self::System),
            _ => Err(()),
        }
    }
}

/// Optional TOML file contents. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    similarity_threshold: Option<f64>,
    extractor: Option<Vec<String>>,
    extract_timeout_secs: Option<u64>,
    bus: Option<BusKind>,
}

/// Daemon configuration: optional TOML file, overridden by `ROSTER_*` environment variables.
#[derive(Debug)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity a candidate must strictly exceed to be recognized.
    pub similarity_threshold: Threshold,
    /// External extractor command line; the image path is appended as the last argument.
    pub extractor: Option<Vec<String>>,
    /// Upper bound on a single extraction.
    pub extract_timeout_secs: u64,
    pub bus: BusKind,
}

impl Config {
    /// Load from `ROSTER_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var_os("ROSTER_CONFIG") {
            Some(path) => {
                let path = PathBuf::from(path);
                let text = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Read { path, source })?;
                Some(text)
            }
            None => None,
        };
        Self::from_sources(file.as_deref(), |key| std::env::var(key).ok())
    }

    /// Build from TOML text and an environment lookup. Environment wins.
    pub fn from_sources(
        file: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let file: FileConfig = match file {
            Some(text) => toml::from_str(text)?,
            None => FileConfig::default(),
        };

        let db_path = env("ROSTER_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| default_data_dir(&env).join("roster.db"));

        let threshold = match env("ROSTER_SIMILARITY_THRESHOLD") {
            Some(v) => parse_value("ROSTER_SIMILARITY_THRESHOLD", &v)?,
            None => file.similarity_threshold.unwrap_or(0.6),
        };

        let extractor = env("ROSTER_EXTRACTOR")
            .map(|v| v.split_whitespace().map(String::from).collect::<Vec<_>>())
            .or(file.extractor)
            .filter(|argv| !argv.is_empty());

        let extract_timeout_secs = match env("ROSTER_EXTRACT_TIMEOUT_SECS") {
            Some(v) => parse_value("ROSTER_EXTRACT_TIMEOUT_SECS", &v)?,
            None => file.extract_timeout_secs.unwrap_or(30),
        };

        let bus = match env("ROSTER_BUS") {
            Some(v) => parse_value("ROSTER_BUS", &v)?,
            None => file.bus.unwrap_or(BusKind::Session),
        };

        Ok(Self {
            db_path,
            similarity_threshold: Threshold::new(threshold)?,
            extractor,
            extract_timeout_secs,
            bus,
        })
    }
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("roster")
}

fn parse_value<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use warden_core::{ConfigError, MatchConfig};

/// Which message bus the administrative interface is published on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    System,
    Session,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "system" => Ok(Self::System),
            "session" => Ok(Self::Session),
            other => Err(format!("unknown bus {other:?}, expected system or session")),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid matching configuration: {0}")]
    Invalid(#[from] ConfigError),
}

/// Daemon configuration: a TOML file plus `WARDEN_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Newline-delimited JSON detection streams; `-` reads stdin.
    pub sources: Vec<PathBuf>,
    pub bus: BusKind,
    pub matching: MatchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: data_dir().join("warden.db"),
            sources: Vec::new(),
            bus: BusKind::default(),
            matching: MatchConfig::default(),
        }
    }
}

impl Config {
    /// Load `$WARDEN_CONFIG` (or the XDG default), apply environment
    /// overrides, then validate the matching knobs.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load() -> Result<Self, ConfigLoadError> {
        let path = config_path();
        let mut config = match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_toml(&text).map_err(|source| ConfigLoadError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                Self::default()
            }
            Err(source) => return Err(ConfigLoadError::Read { path, source }),
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.matching.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("WARDEN_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(sources) = var("WARDEN_SOURCES") {
            self.sources = sources
                .split(':')
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        env_parse(&var, "WARDEN_BUS", &mut self.bus);

        let m = &mut self.matching;
        env_parse(&var, "WARDEN_MATCH_THRESHOLD", &mut m.match_threshold);
        env_parse(&var, "WARDEN_DEDUP_THRESHOLD", &mut m.dedup_threshold);
        env_parse(&var, "WARDEN_WINDOW_SIZE", &mut m.window_size);
        env_parse(&var, "WARDEN_ANN_SWITCHOVER", &mut m.ann_switchover);
        if let Some(v) = var("WARDEN_ADAPTIVE_ENABLED") {
            m.adaptive_enabled = v != "0" && !v.eq_ignore_ascii_case("false");
        }
    }
}

/// Overwrite `slot` with the parsed value of `key`; unparsable values are
/// logged and ignored.
fn env_parse<T>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = var(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(e) => tracing::warn!(key, value = %raw, error = %e, "ignoring unparsable override"),
    }
}

fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("WARDEN_CONFIG") {
        return PathBuf::from(path);
    }
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".config"))
        .join("warden")
        .join("warden.toml")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".local/share"))
        .join("warden")
}

fn home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| Path::new("/tmp").to_path_buf())
}

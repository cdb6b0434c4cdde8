//! Logging setup shared by SerinDB processes.
//!
//! Library crates only emit `tracing` events; whoever owns the process calls
//! [`init`] once with a [`LogConfig`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

/// Log file name prefix inside [`LogConfig::dir`].
pub const LOG_FILE_PREFIX: &str = "serin.log";

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directives, e.g. `info` or `serin_txn=debug,info`.
    pub level: String,
    /// Write hourly-rotated files here instead of stdout.
    pub dir: Option<PathBuf>,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), dir: None, json: false }
    }
}

impl LogConfig {
    /// Load from a YAML file. Missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading log config {}", path.display()))?;
        let config = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing log config {}", path.display()))?;
        Ok(config)
    }

    /// Overlay `SERIN_LOG_LEVEL` and `SERIN_LOG_DIR` when set.
    pub fn from_env(mut self) -> Self {
        if let Ok(level) = std::env::var("SERIN_LOG_LEVEL") {
            self.level = level;
        }
        if let Ok(dir) = std::env::var("SERIN_LOG_DIR") {
            self.dir = Some(PathBuf::from(dir));
        }
        self
    }

    fn filter(&self) -> Result<EnvFilter> {
        EnvFilter::try_new(&self.level).with_context(|| format!("invalid log level {:?}", self.level))
    }
}

/// Keeps the subscriber's background writer alive and allows runtime level changes.
pub struct LogHandle {
    reload: reload::Handle<EnvFilter, Registry>,
    _guard: Option<WorkerGuard>,
}

impl LogHandle {
    /// Replace the active filter directives.
    pub fn set_level(&self, directives: &str) -> Result<()> {
        let filter = EnvFilter::try_new(directives)
            .with_context(|| format!("invalid log level {directives:?}"))?;
        self.reload.reload(filter)?;
        Ok(())
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(config: &LogConfig) -> Result<LogHandle> {
    let (filter, reload) = reload::Layer::new(config.filter()?);
    let registry = tracing_subscriber::registry().with(filter);

    let guard = match &config.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::hourly(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            if config.json {
                registry.with(fmt::layer().json().with_writer(writer)).try_init()?;
            } else {
                registry.with(fmt::layer().with_ansi(false).with_writer(writer)).try_init()?;
            }
            Some(guard)
        }
        None => {
            if config.json {
                registry.with(fmt::layer().json()).try_init()?;
            } else {
                registry.with(fmt::layer()).try_init()?;
            }
            None
        }
    };
    Ok(LogHandle { reload, _guard: guard })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn yaml_overrides_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.yaml");
        std::fs::write(&path, "level: serin_txn=debug,warn\njson: true\n").unwrap();
        let config = LogConfig::load(&path).unwrap();
        assert_eq!(config.level, "serin_txn=debug,warn");
        assert!(config.json);
        assert_eq!(config.dir, None);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = LogConfig::load("/nonexistent/serin/log.yaml").unwrap_err();
        assert!(err.to_string().contains("reading log config"));
    }

    #[test]
    fn env_overlay() {
        std::env::set_var("SERIN_LOG_DIR", "/tmp/serin-logs");
        let config = LogConfig::default().from_env();
        std::env::remove_var("SERIN_LOG_DIR");
        assert_eq!(config.dir, Some(PathBuf::from("/tmp/serin-logs")));
    }

    #[test]
    fn init_once_then_reload() {
        let handle = init(&LogConfig::default()).unwrap();
        handle.set_level("debug").unwrap();
        tracing::debug!("visible after reload");
        assert!(init(&LogConfig::default()).is_err());
    }
}

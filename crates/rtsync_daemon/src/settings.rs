//! Daemon settings: an optional JSON file overlaid by command-line flags.

use crate::error::{DaemonError, DaemonResult};
use rtsync_engine::{Domains, EngineConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings for one daemon instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Store endpoint. For the bundled store this is a JSON seed document.
    pub database: Option<PathBuf>,
    /// Unix socket for the administrative channel.
    pub control_socket: Option<PathBuf>,
    /// Pidfile, locked for the lifetime of the process.
    pub pidfile: Option<PathBuf>,
    /// Store lock name.
    pub lock_name: String,
    /// Domains to reconcile.
    pub domains: Domains,
    /// Delay before retrying a failed wait registration.
    pub registration_retry_ms: u64,
    /// Poll timeout the store reports when nothing is pending. Zero
    /// disables it.
    pub poll_interval_ms: u64,
    /// Whether the store exposes a readiness descriptor.
    pub notifier: bool,
    /// Repetitive warnings let through per interval.
    pub log_burst: u32,
    /// Rate-limit interval for repetitive warnings.
    pub log_interval_secs: u64,
    /// Backoff after the first failed commit.
    pub retry_initial_ms: u64,
    /// Upper bound of the commit backoff.
    pub retry_max_ms: u64,
    /// Backoff multiplier.
    pub retry_multiplier: f64,
    /// Whether to add jitter to the backoff.
    pub retry_jitter: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        let retry = RetryConfig::default();
        Self {
            database: None,
            control_socket: None,
            pidfile: None,
            lock_name: engine.lock_name,
            domains: engine.domains,
            registration_retry_ms: millis(engine.registration_retry),
            poll_interval_ms: millis(rtsync_store::DEFAULT_POLL_INTERVAL),
            notifier: true,
            log_burst: engine.log_burst,
            log_interval_secs: engine.log_interval.as_secs(),
            retry_initial_ms: millis(retry.initial_delay),
            retry_max_ms: millis(retry.max_delay),
            retry_multiplier: retry.backoff_multiplier,
            retry_jitter: retry.add_jitter,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Settings {
    /// Reads settings from a JSON file. Missing keys take their defaults.
    pub fn load(path: &Path) -> DaemonResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| DaemonError::settings(path, e.to_string()))?;
        let settings: Self =
            serde_json::from_str(&text).map_err(|e| DaemonError::settings(path, e.to_string()))?;
        settings.validate(path)?;
        Ok(settings)
    }

    fn validate(&self, path: &Path) -> DaemonResult<()> {
        if self.lock_name.is_empty() {
            return Err(DaemonError::settings(path, "lock_name must not be empty"));
        }
        if self.registration_retry_ms == 0 {
            return Err(DaemonError::settings(
                path,
                "registration_retry_ms must be positive",
            ));
        }
        if self.retry_multiplier.is_nan() || self.retry_multiplier < 1.0 {
            return Err(DaemonError::settings(path, "retry_multiplier must be >= 1"));
        }
        Ok(())
    }

    /// Replaces paths with the ones given on the command line.
    pub fn overlay(
        &mut self,
        database: Option<PathBuf>,
        control_socket: Option<PathBuf>,
        pidfile: Option<PathBuf>,
    ) {
        if database.is_some() {
            self.database = database;
        }
        if control_socket.is_some() {
            self.control_socket = control_socket;
        }
        if pidfile.is_some() {
            self.pidfile = pidfile;
        }
    }

    /// The store endpoint, which has no default.
    pub fn database(&self) -> DaemonResult<&Path> {
        self.database
            .as_deref()
            .ok_or(DaemonError::MissingOption("--database"))
    }

    /// Poll interval for the store, `None` when disabled.
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_ms > 0).then(|| Duration::from_millis(self.poll_interval_ms))
    }

    /// Engine configuration derived from these settings.
    pub fn engine_config(&self) -> EngineConfig {
        let retry = RetryConfig::new()
            .with_initial_delay(Duration::from_millis(self.retry_initial_ms))
            .with_max_delay(Duration::from_millis(self.retry_max_ms))
            .with_backoff_multiplier(self.retry_multiplier)
            .with_jitter(self.retry_jitter);
        EngineConfig::new()
            .with_lock_name(self.lock_name.clone())
            .with_retry(retry)
            .with_registration_retry(Duration::from_millis(self.registration_retry_ms))
            .with_log_rate(self.log_burst, Duration::from_secs(self.log_interval_secs))
            .with_domains(self.domains)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_match_engine() {
        let settings = Settings::default();
        let config = settings.engine_config();
        assert_eq!(config.lock_name, "rtsync");
        assert_eq!(config.registration_retry, Duration::from_secs(1));
        assert_eq!(settings.poll_interval(), Some(Duration::from_millis(500)));
        assert!(settings.database().is_err());
    }

    #[test]
    fn partial_file() {
        let file =
            write(r#"{"lock_name": "zebra", "domains": {"ospf": false}, "poll_interval_ms": 0}"#);
        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.lock_name, "zebra");
        assert!(settings.domains.bgp);
        assert!(!settings.domains.ospf);
        assert_eq!(settings.poll_interval(), None);
        assert_eq!(settings.engine_config().lock_name, "zebra");
    }

    #[test]
    fn unknown_key_rejected() {
        let file = write(r#"{"lock": "x"}"#);
        let err = Settings::load(file.path()).unwrap_err();
        assert!(matches!(err, DaemonError::Settings { .. }));
    }

    #[test]
    fn invalid_values_rejected() {
        let file = write(r#"{"registration_retry_ms": 0}"#);
        assert!(Settings::load(file.path()).is_err());

        let file = write(r#"{"retry_multiplier": 0.5}"#);
        assert!(Settings::load(file.path()).is_err());
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(err.to_string().contains("absent.json"));
    }

    #[test]
    fn command_line_wins() {
        let file = write(r#"{"database": "/var/lib/a.json", "pidfile": "/run/a.pid"}"#);
        let mut settings = Settings::load(file.path()).unwrap();
        settings.overlay(Some(PathBuf::from("/tmp/b.json")), None, None);
        assert_eq!(settings.database().unwrap(), Path::new("/tmp/b.json"));
        assert_eq!(settings.pidfile.as_deref(), Some(Path::new("/run/a.pid")));
    }
}

//! Configuration for the engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Protocol domains the engine reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Domains {
    /// BGP routers and neighbors.
    pub bgp: bool,
    /// OSPF routers, areas and interfaces.
    pub ospf: bool,
    /// Static routes.
    pub rib: bool,
}

impl Default for Domains {
    fn default() -> Self {
        Self {
            bgp: true,
            ospf: true,
            rib: true,
        }
    }
}

/// Configuration for the reconciliation engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name of the store lock that serializes engine instances.
    pub lock_name: String,
    /// Backoff after failed commits.
    pub retry: RetryConfig,
    /// Delay before retrying a failed wait registration.
    pub registration_retry: Duration,
    /// Messages let through per rate-limit interval.
    pub log_burst: u32,
    /// Rate-limit interval for repetitive warnings.
    pub log_interval: Duration,
    /// Enabled domains.
    pub domains: Domains,
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self {
            lock_name: "rtsync".to_string(),
            retry: RetryConfig::default(),
            registration_retry: Duration::from_secs(1),
            log_burst: 5,
            log_interval: Duration::from_secs(60),
            domains: Domains::default(),
        }
    }

    /// Sets the lock name.
    pub fn with_lock_name(mut self, name: impl Into<String>) -> Self {
        self.lock_name = name.into();
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the registration retry delay.
    pub fn with_registration_retry(mut self, delay: Duration) -> Self {
        self.registration_retry = delay;
        self
    }

    /// Sets the log rate limit.
    pub fn with_log_rate(mut self, burst: u32, interval: Duration) -> Self {
        self.log_burst = burst;
        self.log_interval = interval;
        self
    }

    /// Sets the enabled domains.
    pub fn with_domains(mut self, domains: Domains) -> Self {
        self.domains = domains;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for commit backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound of the delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with defaults.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration without backoff.
    pub fn no_backoff() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Calculates the delay after `failures` consecutive failures.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(failures.saturating_sub(1).min(i32::MAX as u32) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_builder() {
        let config = EngineConfig::new()
            .with_lock_name("routing")
            .with_registration_retry(Duration::from_millis(250))
            .with_log_rate(2, Duration::from_secs(10))
            .with_domains(Domains {
                ospf: false,
                ..Domains::default()
            });

        assert_eq!(config.lock_name, "routing");
        assert_eq!(config.registration_retry, Duration::from_millis(250));
        assert_eq!(config.log_burst, 2);
        assert!(config.domains.bgp);
        assert!(!config.domains.ospf);
    }

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.registration_retry, Duration::from_secs(1));
        assert_eq!(config.lock_name, "rtsync");
    }

    #[test]
    fn no_backoff() {
        let config = RetryConfig::no_backoff();
        assert_eq!(config.delay_for_attempt(5), Duration::ZERO);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(150));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }

    #[test]
    fn domains_deserialize_with_defaults() {
        let domains: Domains = serde_json::from_str(r#"{"rib": false}"#).unwrap();
        assert!(domains.bgp);
        assert!(!domains.rib);
    }
}

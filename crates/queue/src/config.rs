//! Per-queue configuration.
//!
//! Defaults live in code; the environment overrides them. Per-queue keys
//! are prefixed `QUEUE_<NAME>_` with the queue name uppercased and dashes
//! mapped to underscores.

use std::time::Duration;

/// Configuration for one named queue dispatcher.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    /// Worker pool size. Defaults to the host CPU count.
    pub parallelism: usize,
    /// How long one `pop` blocks waiting for a ready event.
    pub pop_timeout: Duration,
    /// Queue-length gauge reporting interval.
    pub check_queue_length_interval: Duration,
    /// Redis connection URL (redis-backed queues only).
    pub redis_url: String,
    /// Application name used in the channel key template.
    pub app: String,
    /// Environment name used in the channel key template.
    pub env: String,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parallelism: num_cpus::get(),
            pop_timeout: Duration::from_secs(1),
            check_queue_length_interval: Duration::from_secs(15),
            redis_url: "redis://localhost:6379".to_string(),
            app: "trellis".to_string(),
            env: "dev".to_string(),
        }
    }

    /// Read configuration for the named queue from the environment,
    /// falling back to defaults for anything unset.
    pub fn from_env(name: impl Into<String>) -> Self {
        let mut config = Self::new(name);
        let prefix = format!(
            "QUEUE_{}",
            config.name.to_uppercase().replace('-', "_")
        );

        if let Some(parallelism) = env_parse(&format!("{prefix}_PARALLELISM")) {
            config.parallelism = parallelism;
        }
        if let Some(secs) = env_parse(&format!("{prefix}_POP_TIMEOUT_SECS")) {
            config.pop_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse(&format!("{prefix}_CHECK_LENGTH_INTERVAL_SECS")) {
            config.check_queue_length_interval = Duration::from_secs(secs);
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(app) = std::env::var("TRELLIS_APP") {
            config.app = app;
        }
        if let Ok(env) = std::env::var("TRELLIS_ENV") {
            config.env = env;
        }
        config
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_pop_timeout(mut self, pop_timeout: Duration) -> Self {
        self.pop_timeout = pop_timeout;
        self
    }

    pub fn with_check_queue_length_interval(mut self, interval: Duration) -> Self {
        self.check_queue_length_interval = interval;
        self
    }
}

fn env_parse<T: core::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = QueueConfig::new("default");
        assert!(config.parallelism >= 1);
        assert_eq!(config.pop_timeout, Duration::from_secs(1));
        assert_eq!(config.check_queue_length_interval, Duration::from_secs(15));
        assert_eq!(config.app, "trellis");
    }

    #[test]
    fn builders_override_defaults() {
        let config = QueueConfig::new("emails")
            .with_parallelism(2)
            .with_pop_timeout(Duration::from_millis(200));
        assert_eq!(config.parallelism, 2);
        assert_eq!(config.pop_timeout, Duration::from_millis(200));
    }
}

use std::{env, str::FromStr, time::Duration};

pub mod backoff;
pub use backoff::Backoff;

/// Longest watch the apiserver accepts before it rejects `timeoutSeconds`.
const MAX_WATCH_TIMEOUT: Duration = Duration::from_secs(290);

/// Parameters for [`Warden`](crate::Warden).
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on a single list call.
    pub list_timeout: Duration,
    /// Server-side lifetime of one watch request.
    pub watch_timeout: Duration,
    /// First delay after a failed watch or list.
    pub backoff_initial: Duration,
    /// Ceiling for the doubling delay.
    pub backoff_max: Duration,
    /// Consecutive failures after which a session gives up. `None` retries forever.
    pub max_retries: Option<u32>,
    /// Capacity of the queue between sessions and the reconciler.
    pub intake_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            list_timeout: Duration::from_secs(60),
            watch_timeout: Duration::from_secs(60),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            max_retries: None,
            intake_capacity: 1024,
        }
    }
}

impl Config {
    /// Reads overrides from `WARDEN_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(secs) = parse(&lookup, "WARDEN_LIST_TIMEOUT_SECS")? {
            config.list_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "WARDEN_WATCH_TIMEOUT_SECS")? {
            config.watch_timeout = Duration::from_secs(secs);
        }
        if let Some(millis) = parse(&lookup, "WARDEN_BACKOFF_INITIAL_MS")? {
            config.backoff_initial = Duration::from_millis(millis);
        }
        if let Some(secs) = parse(&lookup, "WARDEN_BACKOFF_MAX_SECS")? {
            config.backoff_max = Duration::from_secs(secs);
        }
        if let Some(retries) = parse(&lookup, "WARDEN_MAX_RETRIES")? {
            config.max_retries = Some(retries);
        }
        if let Some(capacity) = parse(&lookup, "WARDEN_INTAKE_CAPACITY")? {
            config.intake_capacity = capacity;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watch_timeout.is_zero() || self.watch_timeout > MAX_WATCH_TIMEOUT {
            return Err(ConfigError::WatchTimeout(self.watch_timeout));
        }
        if self.list_timeout.is_zero() {
            return Err(ConfigError::Zero("list_timeout"));
        }
        if self.intake_capacity == 0 {
            return Err(ConfigError::Zero("intake_capacity"));
        }
        if self.backoff_initial.is_zero() {
            return Err(ConfigError::Zero("backoff_initial"));
        }
        if self.backoff_initial > self.backoff_max {
            return Err(ConfigError::Backoff {
                initial: self.backoff_initial,
                max: self.backoff_max,
            });
        }
        Ok(())
    }

    pub fn with_list_timeout(mut self, timeout: Duration) -> Self {
        self.list_timeout = timeout;
        self
    }

    pub fn with_watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_intake_capacity(mut self, capacity: usize) -> Self {
        self.intake_capacity = capacity;
        self
    }

    pub(crate) fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_initial, self.backoff_max, self.max_retries)
    }
}

fn parse<T: FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value })
        })
        .transpose()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} has invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("watch timeout {0:?} is outside 1s..=290s")]
    WatchTimeout(Duration),
    #[error("{0} must be nonzero")]
    Zero(&'static str),
    #[error("initial backoff {initial:?} exceeds its ceiling {max:?}")]
    Backoff { initial: Duration, max: Duration },
}

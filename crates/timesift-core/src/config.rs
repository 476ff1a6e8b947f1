use std::time::Duration;

pub const HOST_ENV: &str = "TIMESIFT_ELASTIC_HOST";
pub const PORT_ENV: &str = "TIMESIFT_ELASTIC_PORT";
pub const FLUSH_INTERVAL_ENV: &str = "TIMESIFT_ELASTIC_FLUSH_INTERVAL";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// Connection and batching parameters for the search backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatastoreConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Pending documents that trigger an automatic bulk flush.
    pub flush_interval: usize,
    /// Hits fetched per scroll page.
    pub scroll_size: usize,
    /// How long the backend keeps a scroll context alive between pages.
    pub scroll_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            scheme: "http".into(),
            host: "127.0.0.1".into(),
            port: 9200,
            flush_interval: 1000,
            scroll_size: 500,
            scroll_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl DatastoreConfig {
    /// Defaults overridden by `TIMESIFT_ELASTIC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(host) = lookup(HOST_ENV) {
            config.host = host;
        }
        if let Some(port) = lookup(PORT_ENV) {
            config.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                var: PORT_ENV,
                value: port.clone(),
            })?;
        }
        if let Some(interval) = lookup(FLUSH_INTERVAL_ENV) {
            config.flush_interval = interval
                .parse()
                .ok()
                .filter(|n: &usize| *n > 0)
                .ok_or(ConfigError::InvalidValue {
                    var: FLUSH_INTERVAL_ENV,
                    value: interval.clone(),
                })?;
        }
        Ok(config)
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// Scroll keep-alive in backend time-unit syntax, e.g. `1m`.
    pub fn scroll_keep_alive(&self) -> String {
        let secs = self.scroll_timeout.as_secs().max(1);
        if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }
}

use ::config::Config;
use std::time::Duration;

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_i32(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<i32, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<i32>(key))
}

const DEFAULT_CONNECT_RETRY_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_CONNECT_RETRY_INTERVAL_MS: u64 = 1_000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_PROGRESS_FREQUENCY_MS: u64 = 500;
const DEFAULT_MAX_READ_SIZE: usize = 64 * 1024;
const DEFAULT_POLL_CAPACITY: usize = 128;

/// Tunables for a [`ConnectionManager`](crate::ConnectionManager).
///
/// # Configuration Keys
///
/// - `connect_retry_timeout_ms`: total window for outbound connects (60000)
/// - `connect_retry_interval_ms`: pause between connect attempts (1000)
/// - `handshake_timeout_ms`: how long a handshake may take (10000)
/// - `receive_timeout_ms`: bound on blocking replies, 0 waits forever (0)
/// - `progress_frequency_ms`: minimum spacing of progress reports (500)
/// - `max_read_size`: bytes read from a socket per call (65536)
/// - `poll_capacity`: readiness events fetched per poll (128)
/// - `connect_id`: token both sides must agree on during the handshake (0)
///
/// # Example
///
/// ```toml
/// # Global defaults
/// connect_retry_timeout_ms = 5000
///
/// # Specific to the "render" manager
/// [render]
/// connect_id = 42
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub connect_retry_timeout: Duration,
    pub connect_retry_interval: Duration,
    pub handshake_timeout: Duration,
    pub receive_timeout: Option<Duration>,
    pub progress_frequency: Duration,
    pub max_read_size: usize,
    pub poll_capacity: usize,
    pub connect_id: i32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_retry_timeout: Duration::from_millis(DEFAULT_CONNECT_RETRY_TIMEOUT_MS),
            connect_retry_interval: Duration::from_millis(DEFAULT_CONNECT_RETRY_INTERVAL_MS),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            receive_timeout: None,
            progress_frequency: Duration::from_millis(DEFAULT_PROGRESS_FREQUENCY_MS),
            max_read_size: DEFAULT_MAX_READ_SIZE,
            poll_capacity: DEFAULT_POLL_CAPACITY,
            connect_id: 0,
        }
    }
}

impl ConnectionSettings {
    /// Reads settings from `config`, falling back to defaults for missing keys.
    pub fn from_config(config: &Config) -> Self {
        Self::from_config_named(config, "")
    }

    /// Reads settings with configuration namespacing.
    ///
    /// Lookup order is `{name}.{key}`, then `{key}`, then the built-in default.
    pub fn from_config_named(config: &Config, name: &str) -> Self {
        let ms = |key: &str, default: u64| {
            Duration::from_millis(get_namespaced_u64(config, name, key).unwrap_or(default))
        };
        let receive_timeout_ms = get_namespaced_u64(config, name, "receive_timeout_ms").unwrap_or(0);

        Self {
            connect_retry_timeout: ms("connect_retry_timeout_ms", DEFAULT_CONNECT_RETRY_TIMEOUT_MS),
            connect_retry_interval: ms(
                "connect_retry_interval_ms",
                DEFAULT_CONNECT_RETRY_INTERVAL_MS,
            ),
            handshake_timeout: ms("handshake_timeout_ms", DEFAULT_HANDSHAKE_TIMEOUT_MS),
            receive_timeout: (receive_timeout_ms > 0)
                .then(|| Duration::from_millis(receive_timeout_ms)),
            progress_frequency: ms("progress_frequency_ms", DEFAULT_PROGRESS_FREQUENCY_MS),
            max_read_size: get_namespaced_usize(config, name, "max_read_size")
                .unwrap_or(DEFAULT_MAX_READ_SIZE),
            poll_capacity: get_namespaced_usize(config, name, "poll_capacity")
                .unwrap_or(DEFAULT_POLL_CAPACITY),
            connect_id: get_namespaced_i32(config, name, "connect_id").unwrap_or(0),
        }
    }

    pub fn with_connect_retry(mut self, timeout: Duration, interval: Duration) -> Self {
        self.connect_retry_timeout = timeout;
        self.connect_retry_interval = interval;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_progress_frequency(mut self, frequency: Duration) -> Self {
        self.progress_frequency = frequency;
        self
    }

    pub fn with_connect_id(mut self, connect_id: i32) -> Self {
        self.connect_id = connect_id;
        self
    }
}

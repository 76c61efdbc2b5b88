//! Client configuration with defaults and environment loading.

use std::time::Duration;

use frames::Transport;

use crate::error::ConfigError;

/// Well-known remote relay; frames exchanged with it are byte-stuffed.
pub const DEFAULT_RELAY_HOST: &str = "mediation.tydom.com";
pub const DEFAULT_USER_AGENT: &str = "DeltaDoreApplication-prod/686 CFNetwork/1404.0.5 Darwin/22.3.0";
pub const DEFAULT_KEEP_ALIVE_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: i64 = 5_000;
pub const DEFAULT_FOLLOW_UP_DEBOUNCE_MS: u64 = 400;

const MIN_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);
const COMMAND_CEILING_FACTOR: u32 = 3;

/// Options recognized by [`crate::Client`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Gateway MAC address, also used as the digest username.
    pub username: String,
    pub password: String,
    /// Host (optionally `host:port`) to reach; the relay host by default.
    pub hostname: String,
    pub user_agent: String,
    pub keep_alive: bool,
    pub keep_alive_interval: Duration,
    /// Whether the host process should call `shutdown()` on termination signals.
    pub close_on_exit: bool,
    /// Per-request deadline; `None` disables request timeouts.
    pub request_timeout: Option<Duration>,
    /// Quiet period that ends a command's follow-up stream.
    pub follow_up_debounce: Duration,
    pub retry_on_close: bool,
    /// `https`/`wss` when true, `http`/`ws` otherwise.
    pub secure: bool,
    /// Skip certificate verification (local gateways use self-signed certs).
    pub accept_invalid_certs: bool,
}

impl ClientConfig {
    /// Build a config with every option at its default.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            hostname: DEFAULT_RELAY_HOST.to_owned(),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            keep_alive: true,
            keep_alive_interval: Duration::from_millis(DEFAULT_KEEP_ALIVE_INTERVAL_MS),
            close_on_exit: true,
            request_timeout: request_timeout_from_ms(DEFAULT_REQUEST_TIMEOUT_MS),
            follow_up_debounce: Duration::from_millis(DEFAULT_FOLLOW_UP_DEBOUNCE_MS),
            retry_on_close: true,
            secure: true,
            accept_invalid_certs: false,
        }
    }

    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `TYDOM_USERNAME`
    /// - `TYDOM_PASSWORD`
    ///
    /// Optional:
    /// - `TYDOM_HOSTNAME`: default `mediation.tydom.com`
    /// - `TYDOM_USER_AGENT`
    /// - `TYDOM_KEEP_ALIVE`: default true
    /// - `TYDOM_KEEP_ALIVE_INTERVAL_MS`: default 30000
    /// - `TYDOM_CLOSE_ON_EXIT`: default true
    /// - `TYDOM_REQUEST_TIMEOUT_MS`: default 5000, `<= 0` disables
    /// - `TYDOM_FOLLOW_UP_DEBOUNCE_MS`: default 400
    /// - `TYDOM_RETRY_ON_CLOSE`: default true
    /// - `TYDOM_INSECURE`: default false
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let username = lookup("TYDOM_USERNAME")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingVar("TYDOM_USERNAME"))?;
        let password = lookup("TYDOM_PASSWORD")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingVar("TYDOM_PASSWORD"))?;

        let mut config = Self::new(username, password);
        if let Some(hostname) = lookup("TYDOM_HOSTNAME").filter(|v| !v.is_empty()) {
            config.hostname = hostname;
        }
        if let Some(user_agent) = lookup("TYDOM_USER_AGENT").filter(|v| !v.is_empty()) {
            config.user_agent = user_agent;
        }
        config.keep_alive = parse_var(&lookup, "TYDOM_KEEP_ALIVE", config.keep_alive)?;
        config.keep_alive_interval =
            Duration::from_millis(parse_var(&lookup, "TYDOM_KEEP_ALIVE_INTERVAL_MS", DEFAULT_KEEP_ALIVE_INTERVAL_MS)?);
        config.close_on_exit = parse_var(&lookup, "TYDOM_CLOSE_ON_EXIT", config.close_on_exit)?;
        config.request_timeout =
            request_timeout_from_ms(parse_var(&lookup, "TYDOM_REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS)?);
        config.follow_up_debounce =
            Duration::from_millis(parse_var(&lookup, "TYDOM_FOLLOW_UP_DEBOUNCE_MS", DEFAULT_FOLLOW_UP_DEBOUNCE_MS)?);
        config.retry_on_close = parse_var(&lookup, "TYDOM_RETRY_ON_CLOSE", config.retry_on_close)?;
        config.accept_invalid_certs = parse_var(&lookup, "TYDOM_INSECURE", config.accept_invalid_certs)?;
        Ok(config)
    }

    /// Framing for the configured host: relay framing only for the remote relay.
    #[must_use]
    pub fn transport(&self) -> Transport {
        Transport::for_host(&self.hostname, DEFAULT_RELAY_HOST)
    }

    /// Path used for both the challenge probe and the socket upgrade.
    #[must_use]
    pub fn login_path(&self) -> String {
        format!("/mediation/client?mac={}&appli=1", self.username)
    }

    #[must_use]
    pub fn probe_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}{}", self.hostname, self.login_path())
    }

    #[must_use]
    pub fn socket_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}{}", self.hostname, self.login_path())
    }

    /// Keep-alive period, never shorter than one second.
    #[must_use]
    pub fn keep_alive_period(&self) -> Duration {
        self.keep_alive_interval.max(MIN_KEEP_ALIVE_INTERVAL)
    }

    /// Hard bound on a command's follow-up collection.
    #[must_use]
    pub fn command_ceiling(&self) -> Duration {
        let base = self
            .request_timeout
            .unwrap_or(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS.unsigned_abs()));
        base * COMMAND_CEILING_FACTOR
    }
}

/// Map a millisecond timeout to a deadline; zero or negative disables it.
#[must_use]
pub fn request_timeout_from_ms(ms: i64) -> Option<Duration> {
    u64::try_from(ms).ok().filter(|ms| *ms > 0).map(Duration::from_millis)
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match lookup(var).filter(|v| !v.is_empty()) {
        Some(value) => value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue { var, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;

//! Per-service HA settings.

use std::time::Duration;

use tracing::warn;

use super::HaError;

pub const DEFAULT_MAX_FAILOVER_ATTEMPTS: u32 = 3;
pub const DEFAULT_FAILOVER_SLEEP: Duration = Duration::from_millis(1000);
pub const DEFAULT_STICKY_COOKIE_NAME: &str = "GATEWAY_BACKEND";
/// Largest `maxFailoverAttempts` the proxy can honour: Pingora runs at most
/// 16 upstream attempts per request.
pub const MAX_FAILOVER_ATTEMPTS_LIMIT: u32 = 15;

/// HA behaviour of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaServiceConfig {
    pub enabled: bool,
    /// Failovers allowed after the first attempt.
    pub max_failover_attempts: u32,
    /// Pause before each failover attempt.
    pub failover_sleep: Duration,
    /// Surface connection failures immediately, without rotating.
    pub no_fallback: bool,
    /// User-agent substrings that are never load balanced.
    pub disable_lb_user_agents: Vec<String>,
    pub load_balancing: bool,
    pub sticky_session: bool,
    pub sticky_cookie_name: String,
}

impl Default for HaServiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failover_attempts: DEFAULT_MAX_FAILOVER_ATTEMPTS,
            failover_sleep: DEFAULT_FAILOVER_SLEEP,
            no_fallback: false,
            disable_lb_user_agents: Vec::new(),
            load_balancing: false,
            sticky_session: false,
            sticky_cookie_name: DEFAULT_STICKY_COOKIE_NAME.to_string(),
        }
    }
}

impl HaServiceConfig {
    /// Config for a service without HA: one attempt, no failover.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Builds a config from provider parameters. Keys are matched
    /// case-insensitively; unknown keys are logged and skipped.
    pub fn from_params<I, K, V>(params: I) -> Result<Self, HaError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in params {
            let (key, value) = (key.as_ref().trim(), value.as_ref().trim());
            match key.to_ascii_lowercase().as_str() {
                "enabled" => config.enabled = parse_bool(key, value)?,
                "maxfailoverattempts" => {
                    let attempts: u32 = parse_num(key, value)?;
                    if attempts > MAX_FAILOVER_ATTEMPTS_LIMIT {
                        warn!(
                            requested = attempts,
                            limit = MAX_FAILOVER_ATTEMPTS_LIMIT,
                            "Clamping maxFailoverAttempts"
                        );
                    }
                    config.max_failover_attempts = attempts.min(MAX_FAILOVER_ATTEMPTS_LIMIT);
                }
                "failoversleep" => config.failover_sleep = Duration::from_millis(parse_num(key, value)?),
                "nofallback" => config.no_fallback = parse_bool(key, value)?,
                "disableloadbalancingforuseragents" => {
                    config.disable_lb_user_agents = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect();
                }
                "enableloadbalancing" => config.load_balancing = parse_bool(key, value)?,
                "enablestickysession" => config.sticky_session = parse_bool(key, value)?,
                "stickysessioncookiename" => {
                    if value.is_empty() {
                        return Err(invalid(key, value));
                    }
                    config.sticky_cookie_name = value.to_string();
                }
                _ => warn!(key = %key, "Ignoring unknown HA parameter"),
            }
        }
        Ok(config)
    }

    /// Parses the `key=value;key=value` form.
    pub fn from_param_string(params: &str) -> Result<Self, HaError> {
        let mut pairs = Vec::new();
        for item in params.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = item.split_once('=').ok_or_else(|| invalid(item, ""))?;
            pairs.push((key, value));
        }
        Self::from_params(pairs)
    }

    /// Whether `user_agent` must bypass load balancing.
    pub fn is_user_agent_excluded(&self, user_agent: &str) -> bool {
        self.disable_lb_user_agents
            .iter()
            .any(|agent| user_agent.contains(agent.as_str()))
    }
}

fn invalid(key: &str, value: &str) -> HaError {
    HaError::InvalidConfig {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, HaError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, HaError> {
    value.parse().map_err(|_| invalid(key, value))
}

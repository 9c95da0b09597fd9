//! Configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). Every loader has a `from_lookup`
//! variant taking the variable source as a function, which is what the
//! tests use.
//!
//! | Variable                        | Default          |
//! |---------------------------------|------------------|
//! | `ZEROBOT_IDENTITY`              | `broker`         |
//! | `ZEROBOT_FRONTEND_ADDR`         | `tcp://*:5000`   |
//! | `ZEROBOT_BACKEND_ADDR`          | `tcp://*:5001`   |
//! | `ZEROBOT_MIRROR_ADDR`           | `tcp://*:5002`   |
//! | `ZEROBOT_EVENT_INTAKE_ADDR`     | `tcp://*:5003`   |
//! | `ZEROBOT_EVENT_PUBLISH_ADDR`    | `tcp://*:5004`   |
//! | `ZEROBOT_LEGACY_SUFFIX_ROUTING` | `false`          |
//! | `ZEROBOT_STATUS_ADDR`           | `0.0.0.0:8080`   |
//! | `ZEROBOT_CHANNEL_CAPACITY`      | `1024`           |
//! | `ZEROBOT_CALLBACK_CONCURRENCY`  | `64`             |
//! | `ZEROBOT_LOG_JSON`              | `false`          |
//!
//! An empty value for an event address or the status address disables that
//! endpoint. Pool variables are read by
//! [`PoolConfig::from_env`](crate::service::PoolConfig::from_env).

use std::net::SocketAddr;

use crate::context::{ContextSettings, DEFAULT_CALLBACK_CONCURRENCY, DEFAULT_CHANNEL_CAPACITY};
use crate::error::{Result, ZerobotError};
use crate::transport::Address;

/// Source of configuration variables.
pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Bind addresses and routing options of a [`Broker`](crate::broker::Broker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Name used in logs.
    pub identity: String,
    /// Client-facing addressable channel.
    pub frontend_addr: String,
    /// Worker-facing addressable channel.
    pub backend_addr: String,
    /// Broadcast channel mirroring all traffic.
    pub mirror_addr: String,
    /// Addressable channel receiving events; `None` disables events.
    pub event_intake_addr: Option<String>,
    /// Broadcast channel republishing events by topic.
    pub event_publish_addr: Option<String>,
    /// Accept 2-frame envelopes, deriving the recipient from the sender
    /// identity suffix.
    pub legacy_suffix_routing: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            identity: "broker".to_string(),
            frontend_addr: "tcp://*:5000".to_string(),
            backend_addr: "tcp://*:5001".to_string(),
            mirror_addr: "tcp://*:5002".to_string(),
            event_intake_addr: Some("tcp://*:5003".to_string()),
            event_publish_addr: Some("tcp://*:5004".to_string()),
            legacy_suffix_routing: false,
        }
    }
}

impl BrokerConfig {
    /// Binds every channel on loopback with ephemeral ports. Used by tests
    /// and embedded brokers.
    #[must_use]
    pub fn ephemeral() -> Self {
        let any = "tcp://127.0.0.1:0".to_string();
        Self {
            identity: "broker".to_string(),
            frontend_addr: any.clone(),
            backend_addr: any.clone(),
            mirror_addr: any.clone(),
            event_intake_addr: Some(any.clone()),
            event_publish_addr: Some(any),
            legacy_suffix_routing: false,
        }
    }

    /// Loads the broker section from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::InvalidConfig`] if an address is malformed.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(&env_lookup)
    }

    /// Like [`BrokerConfig::from_env`], reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::InvalidConfig`] if an address is malformed.
    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            identity: lookup("ZEROBOT_IDENTITY").unwrap_or(defaults.identity),
            frontend_addr: lookup("ZEROBOT_FRONTEND_ADDR").unwrap_or(defaults.frontend_addr),
            backend_addr: lookup("ZEROBOT_BACKEND_ADDR").unwrap_or(defaults.backend_addr),
            mirror_addr: lookup("ZEROBOT_MIRROR_ADDR").unwrap_or(defaults.mirror_addr),
            event_intake_addr: optional(lookup, "ZEROBOT_EVENT_INTAKE_ADDR", defaults.event_intake_addr),
            event_publish_addr: optional(lookup, "ZEROBOT_EVENT_PUBLISH_ADDR", defaults.event_publish_addr),
            legacy_suffix_routing: parse_var_bool(lookup, "ZEROBOT_LEGACY_SUFFIX_ROUTING", false),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks every address parses.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::InvalidConfig`] naming the bad address.
    pub fn validate(&self) -> Result<()> {
        let required = [&self.frontend_addr, &self.backend_addr, &self.mirror_addr];
        let optional = [&self.event_intake_addr, &self.event_publish_addr];
        for addr in required.into_iter().chain(optional.into_iter().flatten()) {
            addr.parse::<Address>()
                .map_err(|err| ZerobotError::InvalidConfig(err.to_string()))?;
        }
        Ok(())
    }
}

/// Everything the broker daemon needs.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Broker addresses and options.
    pub broker: BrokerConfig,
    /// HTTP status endpoint; `None` disables it.
    pub status_addr: Option<SocketAddr>,
    /// Runtime context tunables.
    pub context: ContextSettings,
    /// Emit logs as JSON lines.
    pub log_json: bool,
}

impl DaemonConfig {
    /// Loads the daemon configuration from the process environment.
    ///
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::InvalidConfig`] if an address is malformed.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(&env_lookup)
    }

    /// Like [`DaemonConfig::from_env`], reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::InvalidConfig`] if an address is malformed.
    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self> {
        let status_addr = match lookup("ZEROBOT_STATUS_ADDR") {
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => Some(raw.trim().parse().map_err(|_| {
                ZerobotError::InvalidConfig(format!("ZEROBOT_STATUS_ADDR: bad socket address {raw}"))
            })?),
            None => Some(SocketAddr::from(([0, 0, 0, 0], 8080))),
        };
        Ok(Self {
            broker: BrokerConfig::from_lookup(lookup)?,
            status_addr,
            context: ContextSettings {
                callback_concurrency: parse_var(
                    lookup,
                    "ZEROBOT_CALLBACK_CONCURRENCY",
                    DEFAULT_CALLBACK_CONCURRENCY,
                ),
                channel_capacity: parse_var(lookup, "ZEROBOT_CHANNEL_CAPACITY", DEFAULT_CHANNEL_CAPACITY),
            },
            log_json: parse_var_bool(lookup, "ZEROBOT_LOG_JSON", false),
        })
    }
}

pub(crate) fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Optional address: unset keeps the default, empty disables.
fn optional(lookup: Lookup<'_>, key: &str, default: Option<String>) -> Option<String> {
    match lookup(key) {
        Some(value) if value.trim().is_empty() => None,
        Some(value) => Some(value),
        None => default,
    }
}

/// Parses a variable as `T`, returning `default` on missing or invalid
/// values.
pub(crate) fn parse_var<T: std::str::FromStr>(lookup: Lookup<'_>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Parses a variable as a boolean. Accepts `"true"`, `"1"`, `"false"`,
/// `"0"` (case-insensitive). Returns `default` otherwise.
pub(crate) fn parse_var_bool(lookup: Lookup<'_>, key: &str, default: bool) -> bool {
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("true" | "1") => true,
        Some("false" | "0") => false,
        _ => default,
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let lookup = vars(&[]);
        let Ok(config) = DaemonConfig::from_lookup(&lookup) else {
            panic!("defaults are valid");
        };
        assert_eq!(config.broker, BrokerConfig::default());
        assert_eq!(config.status_addr, Some(SocketAddr::from(([0, 0, 0, 0], 8080))));
        assert_eq!(config.context.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert!(!config.log_json);
    }

    #[test]
    fn overrides_and_disables() {
        let lookup = vars(&[
            ("ZEROBOT_FRONTEND_ADDR", "tcp://127.0.0.1:6000"),
            ("ZEROBOT_EVENT_INTAKE_ADDR", ""),
            ("ZEROBOT_LEGACY_SUFFIX_ROUTING", "TRUE"),
            ("ZEROBOT_STATUS_ADDR", ""),
            ("ZEROBOT_CALLBACK_CONCURRENCY", "8"),
        ]);
        let Ok(config) = DaemonConfig::from_lookup(&lookup) else {
            panic!("valid overrides");
        };
        assert_eq!(config.broker.frontend_addr, "tcp://127.0.0.1:6000");
        assert_eq!(config.broker.event_intake_addr, None);
        assert!(config.broker.event_publish_addr.is_some());
        assert!(config.broker.legacy_suffix_routing);
        assert_eq!(config.status_addr, None);
        assert_eq!(config.context.callback_concurrency, 8);
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let lookup = vars(&[("ZEROBOT_CHANNEL_CAPACITY", "lots")]);
        let Ok(config) = DaemonConfig::from_lookup(&lookup) else {
            panic!("numbers never fail");
        };
        assert_eq!(config.context.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        let lookup = vars(&[("ZEROBOT_BACKEND_ADDR", "ipc:///tmp/backend")]);
        assert!(matches!(
            BrokerConfig::from_lookup(&lookup),
            Err(ZerobotError::InvalidConfig(_))
        ));
        let lookup = vars(&[("ZEROBOT_STATUS_ADDR", "not-an-addr")]);
        assert!(DaemonConfig::from_lookup(&lookup).is_err());
    }
}

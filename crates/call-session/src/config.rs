//! Call session configuration.
//!
//! Configuration is loaded from environment variables. TURN credentials are
//! redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default rendezvous server endpoint.
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:5000/signaling";

/// Default public STUN servers.
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:global.stun.twilio.com:3478",
];

/// Default bound on consecutive signaling reconnection attempts.
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Default fixed delay between reconnection attempts in milliseconds.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;

/// Default timeout for a single connection attempt in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default bound on a negotiation in progress in milliseconds (0 disables).
pub const DEFAULT_NEGOTIATION_TIMEOUT_MS: u64 = 30_000;

/// Default delay before a failed peer is rebuilt, in milliseconds.
pub const DEFAULT_PEER_RECREATE_DELAY_MS: u64 = 500;

/// Default artificial scan delay of the verification trigger in milliseconds.
pub const DEFAULT_VERIFICATION_SCAN_DELAY_MS: u64 = 3000;

/// Default session actor tick for deadline checks in milliseconds.
pub const DEFAULT_MAINTENANCE_TICK_MS: u64 = 250;

/// Default base URL used to build invitation links.
pub const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:3000";

/// Call session configuration.
#[derive(Clone)]
pub struct Config {
    /// Rendezvous server WebSocket URL.
    pub signaling_url: String,

    /// STUN/TURN server URLs handed to every peer connection.
    pub ice_servers: Vec<String>,

    /// TURN username, if a relay is configured.
    pub turn_username: Option<String>,

    /// TURN credential. Protected by `SecretString` to prevent accidental logging.
    pub turn_credential: Option<SecretString>,

    /// Reconnection attempts before the channel reports terminal failure.
    pub reconnect_max_attempts: u32,

    /// Fixed delay between reconnection attempts.
    pub reconnect_delay: Duration,

    /// Timeout of a single connection attempt.
    pub connect_timeout: Duration,

    /// Bound on a peer stuck in negotiation; `None` relies solely on the
    /// transport's own failure signal.
    pub negotiation_timeout: Option<Duration>,

    /// Delay before a failed peer is destroyed and recreated.
    pub peer_recreate_delay: Duration,

    /// Artificial delay between frame capture and the oracle call.
    pub verification_scan_delay: Duration,

    /// Session actor tick driving recreate and timeout deadlines.
    pub maintenance_tick: Duration,

    /// HTTP endpoint of the verification oracle.
    pub verification_url: Option<String>,

    /// Base URL for invitation links.
    pub public_base_url: String,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("signaling_url", &self.signaling_url)
            .field("ice_servers", &self.ice_servers)
            .field("turn_username", &self.turn_username)
            .field(
                "turn_credential",
                &self.turn_credential.as_ref().map(|_| "[REDACTED]"),
            )
            .field("reconnect_max_attempts", &self.reconnect_max_attempts)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("connect_timeout", &self.connect_timeout)
            .field("negotiation_timeout", &self.negotiation_timeout)
            .field("peer_recreate_delay", &self.peer_recreate_delay)
            .field("verification_scan_delay", &self.verification_scan_delay)
            .field("maintenance_tick", &self.maintenance_tick)
            .field("verification_url", &self.verification_url)
            .field("public_base_url", &self.public_base_url)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(ToString::to_string).collect(),
            turn_username: None,
            turn_credential: None,
            reconnect_max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            negotiation_timeout: Some(Duration::from_millis(DEFAULT_NEGOTIATION_TIMEOUT_MS)),
            peer_recreate_delay: Duration::from_millis(DEFAULT_PEER_RECREATE_DELAY_MS),
            verification_scan_delay: Duration::from_millis(DEFAULT_VERIFICATION_SCAN_DELAY_MS),
            maintenance_tick: Duration::from_millis(DEFAULT_MAINTENANCE_TICK_MS),
            verification_url: None,
            public_base_url: DEFAULT_PUBLIC_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let signaling_url = vars
            .get("CS_SIGNALING_URL")
            .cloned()
            .unwrap_or(defaults.signaling_url);
        if !(signaling_url.starts_with("ws://") || signaling_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue {
                name: "CS_SIGNALING_URL".to_string(),
                reason: "expected a ws:// or wss:// URL".to_string(),
            });
        }

        let ice_servers = match vars.get("CS_ICE_SERVERS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect(),
            None => defaults.ice_servers,
        };

        let reconnect_max_attempts = parse_number(
            vars,
            "CS_RECONNECT_MAX_ATTEMPTS",
            u64::from(DEFAULT_RECONNECT_MAX_ATTEMPTS),
        )?;
        let reconnect_max_attempts = u32::try_from(reconnect_max_attempts)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| ConfigError::InvalidValue {
                name: "CS_RECONNECT_MAX_ATTEMPTS".to_string(),
                reason: "must be between 1 and u32::MAX".to_string(),
            })?;

        let negotiation_timeout_ms = parse_number(
            vars,
            "CS_NEGOTIATION_TIMEOUT_MS",
            DEFAULT_NEGOTIATION_TIMEOUT_MS,
        )?;

        let maintenance_tick_ms =
            parse_number(vars, "CS_MAINTENANCE_TICK_MS", DEFAULT_MAINTENANCE_TICK_MS)?;
        if maintenance_tick_ms == 0 {
            return Err(ConfigError::InvalidValue {
                name: "CS_MAINTENANCE_TICK_MS".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(Config {
            signaling_url,
            ice_servers,
            turn_username: vars.get("CS_TURN_USERNAME").cloned(),
            turn_credential: vars
                .get("CS_TURN_CREDENTIAL")
                .map(|c| SecretString::from(c.clone())),
            reconnect_max_attempts,
            reconnect_delay: Duration::from_millis(parse_number(
                vars,
                "CS_RECONNECT_DELAY_MS",
                DEFAULT_RECONNECT_DELAY_MS,
            )?),
            connect_timeout: Duration::from_millis(parse_number(
                vars,
                "CS_CONNECT_TIMEOUT_MS",
                DEFAULT_CONNECT_TIMEOUT_MS,
            )?),
            negotiation_timeout: (negotiation_timeout_ms > 0)
                .then(|| Duration::from_millis(negotiation_timeout_ms)),
            peer_recreate_delay: Duration::from_millis(parse_number(
                vars,
                "CS_PEER_RECREATE_DELAY_MS",
                DEFAULT_PEER_RECREATE_DELAY_MS,
            )?),
            verification_scan_delay: Duration::from_millis(parse_number(
                vars,
                "CS_VERIFICATION_SCAN_DELAY_MS",
                DEFAULT_VERIFICATION_SCAN_DELAY_MS,
            )?),
            maintenance_tick: Duration::from_millis(maintenance_tick_ms),
            verification_url: vars
                .get("CS_VERIFICATION_URL")
                .filter(|u| !u.is_empty())
                .cloned(),
            public_base_url: vars
                .get("CS_PUBLIC_BASE_URL")
                .cloned()
                .unwrap_or(defaults.public_base_url),
        })
    }
}

fn parse_number(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
            name: name.to_string(),
            reason: format!("{e}"),
        }),
        None => Ok(default),
    }
}

//! Battle configuration.
//!
//! Defaults match the stock game; every field can be overridden from a
//! `SIEGE_*` environment variable via [`BattleConfig::from_env`].

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::error::{Result, SiegeError};

/// Serialize `Duration` as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Tunables for one battle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BattleConfig {
    /// Tower health at the start of a run
    pub initial_health: u32,
    /// Health removed per recorded hit
    pub damage_per_request: u32,
    /// Health monitor cadence
    #[serde(with = "duration_ms")]
    pub health_poll_interval: Duration,
    /// Pause after a failed reasoning call
    #[serde(with = "duration_ms")]
    pub provider_retry_delay: Duration,
    /// Command output kept for logs and tool results
    pub output_tail_chars: usize,
    /// Port the tower service listens on inside its sandbox
    pub tower_port: u16,
    #[serde(with = "duration_ms")]
    pub sandbox_timeout: Duration,
    pub sandbox_vcpus: u32,
    /// Tower start command; `{port}` is replaced with `tower_port`
    pub tower_command: String,
    pub tower_ready_attempts: u32,
    #[serde(with = "duration_ms")]
    pub tower_ready_delay: Duration,
    /// Completion budget per reasoning step
    pub max_tokens: u32,
    /// Stream gateway backfill tick while no live events arrive
    #[serde(with = "duration_ms")]
    pub stream_idle_tick: Duration,
    /// How long a stream on a terminal run waits for `battle:end`
    #[serde(with = "duration_ms")]
    pub stream_terminal_grace: Duration,
}

impl Default for BattleConfig {
    fn default() -> Self {
        Self {
            initial_health: 1000,
            damage_per_request: 1,
            health_poll_interval: Duration::from_millis(500),
            provider_retry_delay: Duration::from_secs(2),
            output_tail_chars: 500,
            tower_port: 3000,
            sandbox_timeout: Duration::from_secs(10 * 60),
            sandbox_vcpus: 2,
            tower_command: "siege-tower --port {port}".to_string(),
            tower_ready_attempts: 10,
            tower_ready_delay: Duration::from_millis(500),
            max_tokens: 4096,
            stream_idle_tick: Duration::from_secs(5),
            stream_terminal_grace: Duration::from_secs(30),
        }
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| SiegeError::Config(format!("{key}={raw:?}: {e}"))),
    }
}

fn parse_ms(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    Ok(parse::<u64>(lookup, key)?.map(Duration::from_millis))
}

impl BattleConfig {
    /// Defaults overridden by `SIEGE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `SIEGE_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(v) = parse(&lookup, "SIEGE_INITIAL_HEALTH")? {
            cfg.initial_health = v;
        }
        if let Some(v) = parse(&lookup, "SIEGE_DAMAGE_PER_REQUEST")? {
            cfg.damage_per_request = v;
        }
        if let Some(v) = parse_ms(&lookup, "SIEGE_HEALTH_POLL_MS")? {
            cfg.health_poll_interval = v;
        }
        if let Some(v) = parse_ms(&lookup, "SIEGE_PROVIDER_RETRY_MS")? {
            cfg.provider_retry_delay = v;
        }
        if let Some(v) = parse(&lookup, "SIEGE_OUTPUT_TAIL_CHARS")? {
            cfg.output_tail_chars = v;
        }
        if let Some(v) = parse(&lookup, "SIEGE_TOWER_PORT")? {
            cfg.tower_port = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "SIEGE_SANDBOX_TIMEOUT_SECS")? {
            cfg.sandbox_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse(&lookup, "SIEGE_SANDBOX_VCPUS")? {
            cfg.sandbox_vcpus = v;
        }
        if let Some(v) = lookup("SIEGE_TOWER_COMMAND") {
            cfg.tower_command = v;
        }
        if let Some(v) = parse(&lookup, "SIEGE_TOWER_READY_ATTEMPTS")? {
            cfg.tower_ready_attempts = v;
        }
        if let Some(v) = parse_ms(&lookup, "SIEGE_TOWER_READY_DELAY_MS")? {
            cfg.tower_ready_delay = v;
        }
        if let Some(v) = parse(&lookup, "SIEGE_MAX_TOKENS")? {
            cfg.max_tokens = v;
        }
        if let Some(v) = parse_ms(&lookup, "SIEGE_STREAM_IDLE_TICK_MS")? {
            cfg.stream_idle_tick = v;
        }
        if let Some(v) = parse_ms(&lookup, "SIEGE_STREAM_TERMINAL_GRACE_MS")? {
            cfg.stream_terminal_grace = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_health == 0 {
            return Err(SiegeError::Config(
                "initial_health must be positive".to_string(),
            ));
        }
        if self.damage_per_request == 0 {
            return Err(SiegeError::Config(
                "damage_per_request must be positive".to_string(),
            ));
        }
        if self.health_poll_interval.is_zero() {
            return Err(SiegeError::Config(
                "health_poll_interval must be positive".to_string(),
            ));
        }
        if self.stream_idle_tick.is_zero() {
            return Err(SiegeError::Config(
                "stream_idle_tick must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The tower start command with the port filled in.
    pub fn tower_start_command(&self) -> String {
        self.tower_command
            .replace("{port}", &self.tower_port.to_string())
    }
}

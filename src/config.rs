//! Process configuration, read from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{SimResult, SimulatorError};

pub const DEFAULT_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_MOVEMENT_SPEED: f64 = 0.001;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_EVICTION_THRESHOLD: u32 = 2;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Where trips come from and positions go to.
#[derive(Debug, Clone, PartialEq)]
pub enum Backend {
    /// Hosted REST backend.
    Rest { url: String, key: String },
    /// Offline mode: CSV fixtures loaded into memory.
    Fixture { dir: PathBuf },
}

/// Knobs of the simulation loop itself.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationSettings {
    pub interval: Duration,
    /// Step size per tick, in degrees.
    pub movement_speed: f64,
    pub request_timeout: Duration,
    /// Consecutive cycles a trip must be missing before its state is dropped.
    pub eviction_threshold: u32,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            movement_speed: DEFAULT_MOVEMENT_SPEED,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            eviction_threshold: DEFAULT_EVICTION_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    pub backend: Backend,
    pub settings: SimulationSettings,
    pub log_level: String,
    pub status_addr: Option<SocketAddr>,
}

impl SimulatorConfig {
    pub fn from_env() -> SimResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> SimResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let backend = match get("SIMULATOR_FIXTURE_DIR") {
            Some(dir) => Backend::Fixture { dir: dir.into() },
            None => {
                let url = get("SUPABASE_URL").ok_or_else(|| {
                    SimulatorError::Config("SUPABASE_URL is not set".to_string())
                })?;
                let key = get("SUPABASE_SERVICE_KEY")
                    .or_else(|| get("SUPABASE_ANON_KEY"))
                    .ok_or_else(|| {
                        SimulatorError::Config(
                            "SUPABASE_SERVICE_KEY or SUPABASE_ANON_KEY must be set".to_string(),
                        )
                    })?;
                Backend::Rest {
                    url: url.trim_end_matches('/').to_string(),
                    key,
                }
            }
        };

        let interval_ms: u64 = parse_or(get("SIMULATION_INTERVAL_MS"), "SIMULATION_INTERVAL_MS", DEFAULT_INTERVAL_MS)?;
        if interval_ms == 0 {
            return Err(SimulatorError::Config(
                "SIMULATION_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }

        let movement_speed: f64 = parse_or(get("MOVEMENT_SPEED"), "MOVEMENT_SPEED", DEFAULT_MOVEMENT_SPEED)?;
        if !movement_speed.is_finite() || movement_speed <= 0.0 {
            return Err(SimulatorError::Config(format!(
                "MOVEMENT_SPEED must be a positive number, got {}",
                movement_speed
            )));
        }

        let timeout_ms: u64 = parse_or(get("REQUEST_TIMEOUT_MS"), "REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS)?;
        if timeout_ms == 0 {
            return Err(SimulatorError::Config(
                "REQUEST_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }

        let eviction_threshold: u32 = parse_or(get("EVICTION_THRESHOLD"), "EVICTION_THRESHOLD", DEFAULT_EVICTION_THRESHOLD)?;

        let status_addr = get("STATUS_ADDR")
            .map(|addr| {
                addr.parse::<SocketAddr>().map_err(|e| {
                    SimulatorError::Config(format!("STATUS_ADDR '{}' is invalid: {}", addr, e))
                })
            })
            .transpose()?;

        Ok(Self {
            backend,
            settings: SimulationSettings {
                interval: Duration::from_millis(interval_ms),
                movement_speed,
                request_timeout: Duration::from_millis(timeout_ms),
                eviction_threshold: eviction_threshold.max(1),
            },
            log_level: get("LOG_LEVEL").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            status_addr,
        })
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> SimResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| {
            SimulatorError::Config(format!("{} '{}' is invalid: {}", key, raw, e))
        }),
    }
}

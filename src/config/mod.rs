/// Configuration management for the loopway engine
///
/// Handles loop defaults, scheduling limits, sandbox limits and log filtering.

use crate::runtime::sandbox::DEFAULT_MEMORY_LIMIT;
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Engine configuration
    pub engine: EngineConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Scheduling and loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bound used by loops that do not set `iterations`
    pub default_iterations: usize,
    /// Hard cap on scheduling passes per run
    pub max_passes: usize,
    /// Heap cap for each sandboxed Lua evaluation, in bytes (0 disables)
    pub lua_memory_limit: usize,
}

/// Log output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive (e.g. "info", "loopway=debug")
    pub filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_iterations: 5,
            max_passes: 500,
            lua_memory_limit: DEFAULT_MEMORY_LIMIT,
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR overrides
    fn default() -> Self {
        let defaults = EngineConfig::default();
        Self {
            engine: EngineConfig {
                default_iterations: env_or("LOOPWAY_DEFAULT_ITERATIONS", defaults.default_iterations),
                max_passes: env_or("LOOPWAY_MAX_PASSES", defaults.max_passes),
                lua_memory_limit: env_or("LOOPWAY_LUA_MEMORY_LIMIT", defaults.lua_memory_limit),
            },
            logging: LoggingConfig {
                filter: std::env::var("LOOPWAY_LOG").unwrap_or_else(|_| "info".to_string()),
            },
        }
    }
}

/// Parse an env var, keeping `default` when unset or invalid
fn env_or(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("⚠️ Ignoring invalid {}={:?}, using {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}

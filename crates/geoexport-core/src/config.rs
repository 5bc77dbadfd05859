//! Tunables recognized by the engine, independent of any one step's
//! `StepConfig`. Resolved from the environment with documented defaults,
//! mirroring how [`geoexport_db::config::DbConfig`] resolves the connection
//! string.

use std::env;

/// Feature count below which the engine forces single-threaded dispatch.
pub const DEFAULT_PARALLELISM_MIN_THRESHOLD: i64 = 200_000;

/// Upper bound on fan-out when the engine sizes its own thread count rather
/// than deferring to the database precalculation function.
pub const DEFAULT_PARALLELISM_THREAD_COUNT: usize = 8;

/// Default tile subdivision level for changed-tiles exports.
pub const DEFAULT_TARGET_LEVEL: i32 = 11;

/// Engine-wide tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    pub parallelism_min_threshold: i64,
    pub parallelism_thread_count: usize,
    pub default_target_level: i32,
}

impl EngineConfig {
    /// Resolve from the environment, falling back to the documented
    /// defaults for any variable that is unset or unparseable.
    pub fn from_env() -> Self {
        Self {
            parallelism_min_threshold: env_parsed(
                "GEOEXPORT_PARALLELISM_MIN_THRESHOLD",
                DEFAULT_PARALLELISM_MIN_THRESHOLD,
            ),
            parallelism_thread_count: env_parsed(
                "GEOEXPORT_PARALLELISM_THREAD_COUNT",
                DEFAULT_PARALLELISM_THREAD_COUNT,
            ),
            default_target_level: env_parsed(
                "GEOEXPORT_DEFAULT_TARGET_LEVEL",
                DEFAULT_TARGET_LEVEL,
            ),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism_min_threshold: DEFAULT_PARALLELISM_MIN_THRESHOLD,
            parallelism_thread_count: DEFAULT_PARALLELISM_THREAD_COUNT,
            default_target_level: DEFAULT_TARGET_LEVEL,
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

//! Configuration management

use crate::coordinator::CoordinatorConfig;
use crate::planner::PlannerConfig;
use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Decomposition depth bound
    pub max_depth: usize,

    /// Time-point count below which full Floyd-Warshall is used
    pub fw_threshold: usize,

    /// Concurrently dispatched intents
    pub max_in_flight: usize,

    /// Repair budget per run
    pub max_replans: usize,

    /// Dispatcher boundary timeout
    pub dispatch_timeout: Duration,

    /// Wall-clock seconds per plan second in the local executor
    pub time_scale: f64,

    /// Order top-level goals one after another
    pub sequential_goals: bool,
}

impl Default for Config {
    fn default() -> Self {
        let planner = PlannerConfig::default();
        let coordinator = CoordinatorConfig::default();
        Self {
            max_depth: planner.max_depth,
            fw_threshold: planner.fw_threshold,
            max_in_flight: coordinator.max_in_flight,
            max_replans: coordinator.max_replans,
            dispatch_timeout: coordinator.dispatch_timeout,
            time_scale: 0.0,
            sequential_goals: planner.sequential_goals,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let time_scale: f64 = env_or("PLANNER_TIME_SCALE", defaults.time_scale)?;
        if !time_scale.is_finite() || time_scale < 0.0 {
            anyhow::bail!("PLANNER_TIME_SCALE must be a non-negative number, got {}", time_scale);
        }

        let sequential_goals = std::env::var("PLANNER_SEQUENTIAL_GOALS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(defaults.sequential_goals);

        Ok(Self {
            max_depth: env_or("PLANNER_MAX_DEPTH", defaults.max_depth)?,
            fw_threshold: env_or("PLANNER_FW_THRESHOLD", defaults.fw_threshold)?,
            max_in_flight: env_or("PLANNER_MAX_IN_FLIGHT", defaults.max_in_flight)?,
            max_replans: env_or("PLANNER_MAX_REPLANS", defaults.max_replans)?,
            dispatch_timeout: Duration::from_secs(env_or(
                "PLANNER_DISPATCH_TIMEOUT_SECS",
                defaults.dispatch_timeout.as_secs(),
            )?),
            time_scale,
            sequential_goals,
        })
    }

    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            max_depth: self.max_depth,
            fw_threshold: self.fw_threshold,
            sequential_goals: self.sequential_goals,
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_in_flight: self.max_in_flight,
            max_replans: self.max_replans,
            dispatch_timeout: self.dispatch_timeout,
            ..CoordinatorConfig::default()
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {}: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_components() {
        let config = Config::default();
        assert_eq!(config.max_depth, 32);
        assert_eq!(config.max_in_flight, 8);
        assert_eq!(config.max_replans, 16);
        assert_eq!(config.dispatch_timeout, Duration::from_secs(30));
        assert!(config.sequential_goals);

        let planner = config.planner_config();
        assert_eq!(planner.fw_threshold, config.fw_threshold);
    }

    #[test]
    fn test_env_override_and_parse_error() {
        std::env::set_var("PLANNER_TEST_DEPTH", "7");
        assert_eq!(env_or("PLANNER_TEST_DEPTH", 32usize).unwrap(), 7);

        std::env::set_var("PLANNER_TEST_DEPTH", "deep");
        assert!(env_or("PLANNER_TEST_DEPTH", 32usize).is_err());

        std::env::remove_var("PLANNER_TEST_DEPTH");
        assert_eq!(env_or("PLANNER_TEST_DEPTH", 32usize).unwrap(), 32);
    }
}

//! Configuration loading: built-in defaults, optional settings file,
//! `FLURFETCH__`-prefixed environment overrides.

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

const CONFIG_FILE: &str = "config/settings";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub fetch: FetchConfig,
    pub catalog: CatalogConfig,
}

/// Tuning knobs for the poll-and-backoff download engine.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct FetchConfig {
    /// Seconds slept before the first status re-poll of a job.
    pub initial_wait_secs: f64,
    /// Multiplicative backoff growth applied after every wait.
    pub backoff_multiplier: f64,
    /// Poll attempts per job before the whole run aborts.
    pub attempt_ceiling: u32,
    /// Records per batch of simultaneously tracked remote jobs.
    pub chunk_size: usize,
    /// Seconds slept between batches.
    pub chunk_pause_secs: f64,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct CatalogConfig {
    /// Client-side rate cap for the details endpoint.
    pub requests_per_second: u32,
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let builder = Config::builder()
        .set_default("fetch.initial_wait_secs", 5.0)?
        .set_default("fetch.backoff_multiplier", 1.2)?
        .set_default("fetch.attempt_ceiling", 50)?
        .set_default("fetch.chunk_size", 20)?
        .set_default("fetch.chunk_pause_secs", 5.0)?
        .set_default("catalog.requests_per_second", 10)?
        .add_source(File::with_name(CONFIG_FILE).required(false))
        .add_source(Environment::with_prefix("FLURFETCH").separator("__"));

    let cfg = builder.build()?.try_deserialize()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::load;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = load().expect("default config must build");
        assert_eq!(cfg.fetch.initial_wait_secs, 5.0);
        assert_eq!(cfg.fetch.backoff_multiplier, 1.2);
        assert_eq!(cfg.fetch.attempt_ceiling, 50);
        assert_eq!(cfg.fetch.chunk_size, 20);
        assert_eq!(cfg.fetch.chunk_pause_secs, 5.0);
        assert_eq!(cfg.catalog.requests_per_second, 10);
    }
}

//! Configuration for the ouro substrate.
//!
//! Two concerns, one crate:
//!
//! - [`OuroConfig`]: the typed `config.toml` document (providers and keys,
//!   failover chain, circuit breaker, rate limits, memory paths, watcher
//!   debounce, dev/prod environments, security allow-lists).
//! - [`load_and_apply`]: overlay env values onto the process environment with
//!   priority **existing env > project `.env` > XDG `config.toml` `[env]`**.

mod document;
mod env_overlay;

use std::path::Path;
use thiserror::Error;

pub use document::{
    BreakerConfig, BreakerOverride, ChainEntryConfig, EnvConfig, EnvsConfig, MemoryConfig,
    OuroConfig, ProviderConfig, ResourceLimits, SecurityConfig, WatcherConfig,
};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("read xdg config: {0}")]
    XdgRead(std::io::Error),
    #[error("parse config toml: {0}")]
    XdgParse(#[from] toml::de::Error),
    #[error("read .env: {0}")]
    DotenvRead(std::io::Error),
}

/// Overlays `.env` and XDG `config.toml` `[env]` values onto the process
/// environment. A key already present in the environment is never touched, so
/// the effective priority is env > `.env` > XDG.
///
/// * `app_name`: XDG path component, i.e. `~/.config/<app_name>/config.toml`.
/// * `override_dir`: look for `.env` here instead of the current directory.
pub fn load_and_apply(app_name: &str, override_dir: Option<&Path>) -> Result<(), LoadError> {
    let xdg = env_overlay::xdg_env_map(app_name)?;
    let dotenv = env_overlay::dotenv_map(override_dir)?;

    let mut keys: std::collections::HashSet<&String> = xdg.keys().collect();
    keys.extend(dotenv.keys());

    for key in keys {
        if std::env::var(key).is_ok() {
            continue;
        }
        if let Some(value) = dotenv.get(key).or_else(|| xdg.get(key)) {
            std::env::set_var(key, value);
        }
    }
    Ok(())
}

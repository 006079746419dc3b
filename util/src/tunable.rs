//! Operational knobs for the agent, overridable from an optional
//! toml/json/yaml file (`--config-file`).  Each knob is read once, where it
//! is used: `wait_interval_secs` paces the backend's retry loops and the
//! maintenance tick, `data_pieces`/`parity_pieces` shape the erasure-coded
//! uploads, `minimum_redundancy` is the bar for calling an upload complete,
//! and `long_operation_secs` decides when a slow remote call gets logged.

use anyhow::{Context, Result};
use config::{Config, ConfigError};
use lazy_static::lazy_static;
use log::*;
use serde::Deserialize;
use std::fmt::Debug;
use std::sync::RwLock;

lazy_static! {
    static ref TUNABLES: RwLock<Config> = Default::default();
}

/// Look up a tunable, falling back to the built-in default.  Knobs are
/// typically read into a `lazy_static`, so overrides loaded after the
/// first use of a knob do not take effect.
pub fn get_tunable<'de, T>(name: &str, default: T) -> T
where
    T: Deserialize<'de> + Debug,
{
    match TUNABLES.read().unwrap().get(name) {
        Ok(value) => {
            info!("tunable {} set to {:?} by config file", name, value);
            value
        }
        Err(ConfigError::NotFound(_)) => default,
        Err(e) => {
            warn!("tunable {}: {}; using default {:?}", name, e, default);
            default
        }
    }
}

/// Load tunable overrides.  Must run at startup, before anything reads a
/// knob; an unreadable file is a configuration error, not something to
/// limp past.
pub fn read_tunable_config(file_name: &str) -> Result<()> {
    let mut tunables = TUNABLES.write().unwrap();
    tunables
        .merge(config::File::with_name(file_name))
        .with_context(|| format!("loading tunables from {}", file_name))?;
    debug!("tunables: {:?}", tunables.cache);
    Ok(())
}

//! Settings and configuration for relay binaries.
//!
//! ## Configuration
//!
//! Settings are layered, later sources override earlier ones:
//!
//! 1. Every `*.json` file in `./config`, if that directory exists.
//! 2. Each file in the comma separated `CONFIG_FILES` environment variable.
//! 3. Environment variables starting with `<PREFIX>_`. Nested fields are
//!    separated by a double underscore, e.g. `RELAY_SERVER_TRACING__LEVEL=debug`.
//!
//! Keys are snake_case in every source.

use std::{env, error::Error, path::PathBuf};

use config::{Config, Environment, File};
use eyre::{eyre, Context, Result};
use serde::de::DeserializeOwned;

pub use trace::*;

/// Tracing subscriber configuration
pub mod trace;

/// Deserialize a settings object from the config locations.
pub fn load_settings<T: DeserializeOwned>(env_prefix: &str) -> Result<T> {
    let mut config_sources = vec![];
    let mut builder = Config::builder();

    let config_dir = PathBuf::from("./config");
    if config_dir.is_dir() {
        let mut paths = config_dir
            .read_dir()
            .context("Failed to open config directory")?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && path.extension() == Some("json".as_ref()))
            .collect::<Vec<_>>();
        paths.sort();
        for path in paths {
            config_sources.push(format!("{:?}", path));
            builder = builder.add_source(File::from(path));
        }
    }

    // Load a set of additional user specified config files
    let config_file_paths: Vec<String> = env::var("CONFIG_FILES")
        .map(|s| s.split(',').map(|s| s.to_owned()).collect())
        .unwrap_or_default();

    for path in &config_file_paths {
        let p = PathBuf::from(path);
        if !p.is_file() {
            return Err(eyre!(
                "Provided config path via CONFIG_FILES is not a file ({p:?})"
            ));
        }
        config_sources.push(path.clone());
        builder = builder.add_source(File::from(p));
    }

    let config_deserializer = builder
        .add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    match config_deserializer.try_deserialize::<T>() {
        Ok(settings) => Ok(settings),
        Err(err) => {
            let mut err = if let Some(source_err) = err.source() {
                let source = format!("Config error source: {source_err}");
                Err(err).context(source)
            } else {
                Err(err.into())
            };
            for cfg_path in &config_sources {
                err = err.with_context(|| format!("Config loaded: {cfg_path}"));
            }
            err.context("Config deserialization error")
        }
    }
}

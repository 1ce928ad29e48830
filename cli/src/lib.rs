//! Helpers of the `sysdig-query` binary: logging and config file handling.

use std::path::Path;

use anyhow::Context;
use env_logger::Env;
use sysdig_datasource::DatasourceConfig;

/// Initializes the global logger.
///
/// The default level is `info`, use `RUST_LOG` to change it.
pub fn init_logger() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
}

/// Serializes the default configuration to TOML.
pub fn default_config_string() -> anyhow::Result<String> {
    toml::to_string_pretty(&DatasourceConfig::default()).context("could not serialize the default config")
}

/// Writes the default configuration to `path`, overwriting the file if it exists.
pub fn regen_config(path: &Path) -> anyhow::Result<()> {
    let config = default_config_string()?;
    std::fs::write(path, config).with_context(|| format!("could not write config file {}", path.display()))
}

/// Loads the configuration from `path`.
///
/// If the file does not exist and `allow_default` is true, the default configuration
/// is written to `path` and returned.
pub fn load_config(path: &Path, allow_default: bool) -> anyhow::Result<DatasourceConfig> {
    let exists = path
        .try_exists()
        .with_context(|| format!("could not access config file {}", path.display()))?;
    if !exists {
        if !allow_default {
            anyhow::bail!("config file {} does not exist", path.display());
        }
        regen_config(path)?;
        log::info!("Default configuration file written to: {}", path.display());
        return Ok(DatasourceConfig::default());
    }

    let content =
        std::fs::read_to_string(path).with_context(|| format!("could not read config file {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("invalid config file {}", path.display()))
}

/// Applies the command-line overrides of the connection settings.
pub fn apply_overrides(config: &mut DatasourceConfig, url: Option<String>, token: Option<String>) {
    if let Some(url) = url {
        config.url = url;
    }
    if let Some(token) = token {
        config.api_token = token;
    }
}

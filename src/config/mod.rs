//! Configuration for the store client, the embedded store server and the
//! content watchers built on top of them.
//!
//! Hierarchical loading with override support:
//! 1. Default values from code
//! 2. Configuration file named by `CONFIG_PATH`
//! 3. Environment variables with the `COORD__` prefix (highest priority)

mod client;
mod retry;
mod server;
mod watch;
pub use client::*;
pub use retry::*;
pub use server::*;
pub use watch::*;

#[cfg(test)]
mod config_test;

use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

const ENV_PREFIX: &str = "COORD";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StoreConfig {
    /// Session and request parameters of the store client
    #[serde(default)]
    pub client: ClientConfig,
    /// Embedded store server used by tests and local tooling
    #[serde(default)]
    pub server: ServerConfig,
    /// Retry policies for reconnection
    #[serde(default)]
    pub retry: RetryPolicies,
    /// Content watch delivery parameters
    #[serde(default)]
    pub watch: WatchConfig,
}

impl StoreConfig {
    /// Loads defaults, then `CONFIG_PATH`, then `COORD__*` variables.
    ///
    /// Does not validate; call [`StoreConfig::validate`] once all overrides
    /// are applied.
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(environment());

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Layers the file at `path` over the current values. Environment
    /// variables still win.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn validate(self) -> Result<Self> {
        self.client.validate()?;
        self.server.validate()?;
        self.retry.validate()?;
        self.watch.validate()?;
        Ok(self)
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
}

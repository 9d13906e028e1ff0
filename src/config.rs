//! Runtime configuration loaded from TOML.
//!
//! Every section and field is optional; missing values fall back to the
//! defaults of [`BusConfig`], [`BatcherConfig`] and [`ResolverConfig`].
//!
//! ```toml
//! [bus]
//! subscriber_capacity = 512
//!
//! [batcher]
//! flush_interval_ms = 2000
//!
//! [resolver]
//! overview_metrics_interval_ms = 5000
//! default_period = "5m"
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::Result;
use crate::eventbus::BusConfig;
use crate::measurements::BatcherConfig;
use crate::resolver::{parse_period, ResolverConfig};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bus: BusConfig,
    pub batcher: BatcherConfig,
    pub resolver: ResolverConfig,
}

impl Config {
    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(s)?;
        // fail at load time rather than on the first blank-period request
        parse_period(&cfg.resolver.default_period)?;
        Ok(cfg)
    }
}

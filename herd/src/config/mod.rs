//! Configuration.

pub use herd_config::{Config, Error, General, Provision, Store};

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;

static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Current configuration.
pub fn config() -> Arc<Config> {
    CONFIG.load().clone()
}

/// Load the configuration file from disk and install it.
pub fn load(path: &Path) -> Result<Arc<Config>, Error> {
    let config = Config::load(path)?;
    set(config.clone());
    Ok(Arc::new(config))
}

pub fn set(config: Config) {
    CONFIG.store(Arc::new(config));
}

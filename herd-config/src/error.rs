use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config file \"{0}\": {1}")]
    Parse(PathBuf, toml::de::Error),

    #[error("{0}")]
    Toml(#[from] toml::de::Error),

    #[error("[general] workers must be at least 1")]
    NoWorkers,

    #[error("[store] address is empty")]
    NoStoreAddress,
}

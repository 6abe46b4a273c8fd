use serde::{Deserialize, Serialize};
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::error::Error;
use super::general::General;
use super::provision::Provision;
use super::store::Store;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub general: General,

    #[serde(default)]
    pub store: Store,

    #[serde(default)]
    pub provision: Provision,
}

impl Config {
    /// Load configuration from disk or use defaults.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let config = if let Ok(raw) = read_to_string(path) {
            let config = match toml::from_str(&raw) {
                Ok(config) => config,
                Err(err) => return Err(Error::Parse(PathBuf::from(path), err)),
            };
            info!("loaded \"{}\"", path.display());
            config
        } else {
            warn!(
                "\"{}\" doesn't exist, loading defaults instead",
                path.display()
            );
            Config::default()
        };

        config.check()?;

        Ok(config)
    }

    /// Validate settings that have no sensible fallback.
    pub fn check(&self) -> Result<(), Error> {
        if self.general.workers == 0 {
            return Err(Error::NoWorkers);
        }

        if self.store.address.is_empty() {
            return Err(Error::NoStoreAddress);
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.general.workers, 2);
        assert_eq!(config.store.database, "herd");
        config.check().unwrap();
    }

    #[test]
    fn test_parse() {
        let config: Config = toml::from_str(
            r#"
            [general]
            workers = 8
            pool_size = 3

            [store]
            address = "10.0.0.5:3306"
            user = "fleet"
            password = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.general.workers, 8);
        assert_eq!(config.general.pool_size, 3);
        assert_eq!(config.store.address, "10.0.0.5:3306");
        assert_eq!(config.provision.mysql, PathBuf::from("mysql"));
    }

    #[test]
    fn test_rejects_zero_workers() {
        let config: Config = toml::from_str("[general]\nworkers = 0\n").unwrap();
        assert!(config.check().is_err());
    }
}

use serde::{Deserialize, Serialize};

/// State store connection settings. The state store is a MySQL server that
/// holds all topology and sharding metadata.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Store {
    /// host:port of the state store backend.
    #[serde(default = "Store::address")]
    pub address: String,

    /// User the control plane connects as.
    #[serde(default = "Store::user")]
    pub user: String,

    /// Password for the state store user.
    #[serde(default)]
    pub password: String,

    /// Database holding the metadata tables.
    #[serde(default = "Store::database")]
    pub database: String,
}

impl Store {
    fn address() -> String {
        "127.0.0.1:3306".into()
    }

    fn user() -> String {
        "herd".into()
    }

    fn database() -> String {
        "herd".into()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self {
            address: Self::address(),
            user: Self::user(),
            password: String::new(),
            database: Self::database(),
        }
    }
}

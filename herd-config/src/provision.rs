use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Settings for the logical dump/restore step of shard move and split.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Provision {
    /// Path to the mysqldump binary.
    #[serde(default = "Provision::mysqldump")]
    pub mysqldump: PathBuf,

    /// Path to the mysql client binary.
    #[serde(default = "Provision::mysql")]
    pub mysql: PathBuf,

    /// Directory dump images are written to.
    #[serde(default = "Provision::work_dir")]
    pub work_dir: PathBuf,
}

impl Provision {
    fn mysqldump() -> PathBuf {
        "mysqldump".into()
    }

    fn mysql() -> PathBuf {
        "mysql".into()
    }

    fn work_dir() -> PathBuf {
        "/tmp".into()
    }
}

impl Default for Provision {
    fn default() -> Self {
        Self {
            mysqldump: Self::mysqldump(),
            mysql: Self::mysql(),
            work_dir: Self::work_dir(),
        }
    }
}

//! Engine errors. Each subsystem has its own error enum; this one is what
//! procedure steps return and what ends up in step diagnosis records.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database: {0}")]
    Database(#[from] crate::store::Error),

    #[error("server: {0}")]
    Server(String),

    #[error("group: {0}")]
    Group(String),

    #[error("sharding: {0}")]
    Sharding(#[from] crate::sharding::Error),

    #[error("replication: {0}")]
    Replication(#[from] crate::replication::Error),

    #[error("pool: {0}")]
    Pool(#[from] crate::pool::Error),

    #[error("credentials rejected by backend {0}")]
    Credential(Uuid),

    #[error("backend at {address} reports uuid {got}, expected {expected}")]
    Uuid {
        address: String,
        expected: Uuid,
        got: Uuid,
    },

    #[error("procedure cancelled")]
    Cancelled,
}

impl Error {
    pub fn server(message: impl Into<String>) -> Self {
        Error::Server(message.into())
    }

    pub fn group(message: impl Into<String>) -> Self {
        Error::Group(message.into())
    }

    /// Coarse classification recorded in step diagnosis. Replication
    /// primitive failures (timeouts, bad GTIDs) count as server errors;
    /// everything reaching a backend over SQL counts as a database error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Database(_) => ErrorKind::Database,
            Error::Server(_) => ErrorKind::Server,
            Error::Group(_) => ErrorKind::Group,
            Error::Sharding(_) => ErrorKind::Sharding,
            Error::Replication(err) => err.kind(),
            Error::Pool(crate::pool::Error::Credential(_)) => ErrorKind::Credential,
            Error::Pool(_) => ErrorKind::Database,
            Error::Credential(_) => ErrorKind::Credential,
            Error::Uuid { .. } => ErrorKind::Uuid,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Database,
    Server,
    Group,
    Sharding,
    Credential,
    Uuid,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ErrorKind::*;
        match self {
            Database => write!(f, "database"),
            Server => write!(f, "server"),
            Group => write!(f, "group"),
            Sharding => write!(f, "sharding"),
            Credential => write!(f, "credential"),
            Uuid => write!(f, "uuid"),
            Cancelled => write!(f, "cancelled"),
        }
    }
}

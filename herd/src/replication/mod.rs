//! Replication control primitives. The HA machine and the sharding engine
//! drive backends exclusively through the `ReplicationDriver` trait; the
//! MySQL implementation lives in `driver`, tests plug in a fleet simulator.

pub mod driver;
pub mod gtid;

pub use gtid::GtidSet;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::sharding::{PruneWindow, ShardingType};
use crate::sql::Value;
use crate::topology::{Backend, Observed};

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Sql(#[from] crate::sql::Error),

    #[error("{0}")]
    Gtid(#[from] gtid::ParseError),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("backend ({0}) is not configured as a slave")]
    NotASlave(Uuid),

    #[error("dump failed: {0}")]
    Dump(String),

    #[error("unexpected reply: {0}")]
    Protocol(String),
}

impl Error {
    /// Replication primitive failures surface as server errors; anything
    /// that failed at the SQL layer is a database error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Sql(crate::sql::Error::Credential(_)) => ErrorKind::Credential,
            Error::Sql(_) => ErrorKind::Database,
            _ => ErrorKind::Server,
        }
    }
}

/// Reasons a backend cannot serve as a master.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MasterIssues {
    pub binlog_disabled: bool,
    pub gtid_disabled: bool,
    pub not_writable_user: bool,
}

impl MasterIssues {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl std::fmt::Display for MasterIssues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut reasons = vec![];
        if self.binlog_disabled {
            reasons.push("binary log disabled");
        }
        if self.gtid_disabled {
            reasons.push("gtid mode disabled");
        }
        if self.not_writable_user {
            reasons.push("user lacks replication privileges");
        }
        write!(f, "{}", reasons.join(", "))
    }
}

/// Reasons a backend is not replicating properly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlaveIssues {
    pub not_configured: bool,
    pub io_not_running: bool,
    pub sql_not_running: bool,
    pub last_error: Option<String>,
}

impl SlaveIssues {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl std::fmt::Display for SlaveIssues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut reasons = vec![];
        if self.not_configured {
            reasons.push("not configured as a slave".to_string());
        }
        if self.io_not_running {
            reasons.push("io thread stopped".to_string());
        }
        if self.sql_not_running {
            reasons.push("sql thread stopped".to_string());
        }
        if let Some(err) = &self.last_error {
            reasons.push(err.clone());
        }
        write!(f, "{}", reasons.join(", "))
    }
}

/// A logical dump produced by `backup` and consumed by `restore`.
#[derive(Debug, Clone)]
pub enum DumpImage {
    /// Path to a mysqldump file on the control plane host.
    File(PathBuf),
    /// Row snapshot per table; produced by the fleet simulator.
    Rows(HashMap<String, Vec<Value>>),
}

/// Control primitives on managed backends.
#[async_trait]
pub trait ReplicationDriver: Send + Sync + 'static {
    /// Liveness probe plus the observed server attributes.
    async fn probe(&self, backend: &Backend) -> Result<Observed, Error>;

    /// The uuid a server at `address` reports about itself.
    async fn discover_uuid(&self, address: &str, user: &str, password: &str)
        -> Result<Uuid, Error>;

    async fn gtid_executed(&self, backend: &Backend) -> Result<GtidSet, Error>;

    /// Transactions received by the io thread, whether or not applied yet.
    async fn gtid_retrieved(&self, backend: &Backend) -> Result<GtidSet, Error>;

    async fn check_master_issues(&self, backend: &Backend) -> Result<MasterIssues, Error>;

    async fn check_slave_issues(&self, backend: &Backend) -> Result<SlaveIssues, Error>;

    /// Uuid of the master this slave replicates from, if configured.
    async fn slave_has_master(&self, backend: &Backend) -> Result<Option<Uuid>, Error>;

    /// Stop threads, reset, CHANGE MASTER, start threads.
    async fn switch_master(&self, slave: &Backend, master: &Backend) -> Result<(), Error>;

    async fn start_slave(&self, backend: &Backend, wait: bool) -> Result<(), Error>;

    async fn stop_slave(&self, backend: &Backend, wait: bool) -> Result<(), Error>;

    async fn reset_slave(&self, backend: &Backend, clean: bool) -> Result<(), Error>;

    /// Block until the slave has executed `gtids`, or time out.
    async fn wait_for_gtid(
        &self,
        slave: &Backend,
        gtids: &GtidSet,
        timeout: Duration,
    ) -> Result<(), Error>;

    /// Failover catch-up: apply whatever the relay log already received.
    async fn process_backlog(&self, slave: &Backend, timeout: Duration) -> Result<(), Error>;

    async fn set_read_only(&self, backend: &Backend, read_only: bool) -> Result<(), Error>;

    // Data primitives used by shard move/split/prune.

    async fn backup(&self, source: &Backend) -> Result<DumpImage, Error>;

    async fn restore(&self, destination: &Backend, image: &DumpImage) -> Result<(), Error>;

    /// Delete rows outside the shard's window on a group master. Returns
    /// the number of rows removed.
    async fn prune_rows(
        &self,
        master: &Backend,
        table: &str,
        column: &str,
        kind: ShardingType,
        window: &PruneWindow,
    ) -> Result<u64, Error>;

    /// Largest md5 of the sharding column present in a table; drives the
    /// split point of the last HASH shard on the ring.
    async fn max_hashed_key(
        &self,
        master: &Backend,
        table: &str,
        column: &str,
    ) -> Result<Option<[u8; 16]>, Error>;
}

/// Bring `slave` up to everything `master` has executed.
pub async fn synchronize(
    driver: &dyn ReplicationDriver,
    slave: &Backend,
    master: &Backend,
    timeout: Duration,
) -> Result<(), Error> {
    let executed = driver.gtid_executed(master).await?;
    if executed.is_empty() {
        return Ok(());
    }
    driver.wait_for_gtid(slave, &executed, timeout).await
}

//! MySQL implementation of the replication driver. Control statements go
//! through the per-backend connection pools; dumps shell out to the
//! mysqldump/mysql binaries configured in `[provision]`.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use super::{DumpImage, Error, GtidSet, MasterIssues, ReplicationDriver, SlaveIssues};
use crate::pool::Pools;
use crate::sharding::{PruneWindow, ShardingType};
use crate::sql::{Connector, Rows, Value};
use crate::topology::{Backend, Observed};

const THREAD_POLL: Duration = Duration::from_millis(250);

pub struct SqlDriver {
    pools: Pools,
    connector: Arc<dyn Connector>,
    provision: herd_config::Provision,
    connect_timeout: Duration,
}

impl SqlDriver {
    pub fn new(
        pools: Pools,
        connector: Arc<dyn Connector>,
        provision: herd_config::Provision,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            pools,
            connector,
            provision,
            connect_timeout,
        }
    }

    async fn slave_status(&self, backend: &Backend) -> Result<Rows, Error> {
        let mut conn = self.pools.get(backend).await.map_err(pool_error)?;
        Ok(conn.query("SHOW SLAVE STATUS", &[]).await?)
    }

    /// Poll SHOW SLAVE STATUS until both threads reach the wanted state.
    async fn wait_for_threads(&self, backend: &Backend, running: bool) -> Result<(), Error> {
        let deadline = Instant::now() + self.connect_timeout;
        loop {
            let status = self.slave_status(backend).await?;
            let io = yes(status.get(0, "Slave_IO_Running"));
            let sql = yes(status.get(0, "Slave_SQL_Running"));

            let done = if running {
                io && sql
            } else {
                !io && !sql
            };
            if done || status.is_empty() {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "slave threads on ({})",
                    backend.uuid
                )));
            }
            sleep(THREAD_POLL).await;
        }
    }
}

fn pool_error(err: crate::pool::Error) -> Error {
    match err {
        crate::pool::Error::Sql(err) => Error::Sql(err),
        crate::pool::Error::Credential(uuid) => {
            Error::Sql(crate::sql::Error::Credential(uuid.to_string()))
        }
        crate::pool::Error::CheckoutTimeout(uuid) => {
            Error::Timeout(format!("connection checkout for ({})", uuid))
        }
        crate::pool::Error::ConnectTimeout(uuid) => Error::Timeout(format!("connect to ({})", uuid)),
    }
}

fn yes(value: Option<&Value>) -> bool {
    value
        .and_then(Value::as_str)
        .map(|s| s.eq_ignore_ascii_case("yes"))
        .unwrap_or(false)
}

fn on(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Text(s)) => s.eq_ignore_ascii_case("on") || s == "1",
        Some(other) => other.as_bool().unwrap_or(false),
        None => false,
    }
}

fn quoted(raw: &str) -> String {
    format!("'{}'", raw.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn identifier(raw: &str) -> String {
    format!("`{}`", raw.replace('`', ""))
}

fn host_port(address: &str) -> (String, u16) {
    match address.rsplit_once(':') {
        Some((host, port)) => (host.to_owned(), port.parse().unwrap_or(3306)),
        None => (address.to_owned(), 3306),
    }
}

#[async_trait]
impl ReplicationDriver for SqlDriver {
    async fn probe(&self, backend: &Backend) -> Result<Observed, Error> {
        let mut conn = self.pools.get(backend).await.map_err(pool_error)?;
        let rows = conn
            .query(
                "SELECT @@GLOBAL.server_uuid, @@GLOBAL.server_id, VERSION(), \
                 @@GLOBAL.gtid_mode, @@GLOBAL.log_bin, @@GLOBAL.read_only",
                &[],
            )
            .await?;

        let row = rows
            .rows
            .first()
            .ok_or_else(|| Error::Protocol("empty probe reply".into()))?;

        Ok(Observed {
            uuid: row.first().and_then(Value::as_uuid),
            server_id: row.get(1).and_then(Value::as_u64).unwrap_or(0) as u32,
            version: row
                .get(2)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            gtid_enabled: on(row.get(3)),
            binlog_enabled: on(row.get(4)),
            read_only: on(row.get(5)),
        })
    }

    async fn discover_uuid(
        &self,
        address: &str,
        user: &str,
        password: &str,
    ) -> Result<Uuid, Error> {
        let connect = self.connector.connect(address, user, password);
        let mut conn = timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| Error::Timeout(format!("connect to {}", address)))??;

        let rows = conn.query("SELECT @@GLOBAL.server_uuid", &[]).await?;
        rows.rows
            .first()
            .and_then(|r| r.first())
            .and_then(Value::as_uuid)
            .ok_or_else(|| Error::Protocol(format!("no server_uuid from {}", address)))
    }

    async fn gtid_executed(&self, backend: &Backend) -> Result<GtidSet, Error> {
        let mut conn = self.pools.get(backend).await.map_err(pool_error)?;
        let rows = conn.query("SELECT @@GLOBAL.gtid_executed", &[]).await?;
        let raw = rows
            .rows
            .first()
            .and_then(|r| r.first())
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(GtidSet::parse(raw)?)
    }

    async fn gtid_retrieved(&self, backend: &Backend) -> Result<GtidSet, Error> {
        let status = self.slave_status(backend).await?;
        let raw = status
            .get(0, "Retrieved_Gtid_Set")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(GtidSet::parse(raw)?)
    }

    async fn check_master_issues(&self, backend: &Backend) -> Result<MasterIssues, Error> {
        let observed = self.probe(backend).await?;
        Ok(MasterIssues {
            binlog_disabled: !observed.binlog_enabled,
            gtid_disabled: !observed.gtid_enabled,
            not_writable_user: false,
        })
    }

    async fn check_slave_issues(&self, backend: &Backend) -> Result<SlaveIssues, Error> {
        let status = self.slave_status(backend).await?;
        if status.is_empty() {
            return Ok(SlaveIssues {
                not_configured: true,
                ..Default::default()
            });
        }

        let last_error = status
            .get(0, "Last_IO_Error")
            .or_else(|| status.get(0, "Last_SQL_Error"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_owned);

        Ok(SlaveIssues {
            not_configured: false,
            io_not_running: !yes(status.get(0, "Slave_IO_Running")),
            sql_not_running: !yes(status.get(0, "Slave_SQL_Running")),
            last_error,
        })
    }

    async fn slave_has_master(&self, backend: &Backend) -> Result<Option<Uuid>, Error> {
        let status = self.slave_status(backend).await?;
        Ok(status.get(0, "Master_UUID").and_then(Value::as_uuid))
    }

    async fn switch_master(&self, slave: &Backend, master: &Backend) -> Result<(), Error> {
        let (host, port) = host_port(&master.address);
        let mut conn = self.pools.get(slave).await.map_err(pool_error)?;

        conn.execute("STOP SLAVE", &[]).await?;
        conn.execute("RESET SLAVE", &[]).await?;
        // CHANGE MASTER does not take placeholders.
        conn.execute(
            &format!(
                "CHANGE MASTER TO MASTER_HOST = {}, MASTER_PORT = {}, \
                 MASTER_USER = {}, MASTER_PASSWORD = {}, MASTER_AUTO_POSITION = 1",
                quoted(&host),
                port,
                quoted(&master.user),
                quoted(&master.password),
            ),
            &[],
        )
        .await?;
        conn.execute("START SLAVE", &[]).await?;
        drop(conn);

        info!(
            "backend ({}) now replicates from ({}) [{}]",
            slave.uuid, master.uuid, master.address
        );
        Ok(())
    }

    async fn start_slave(&self, backend: &Backend, wait: bool) -> Result<(), Error> {
        {
            let mut conn = self.pools.get(backend).await.map_err(pool_error)?;
            conn.execute("START SLAVE", &[]).await?;
        }
        if wait {
            self.wait_for_threads(backend, true).await?;
        }
        Ok(())
    }

    async fn stop_slave(&self, backend: &Backend, wait: bool) -> Result<(), Error> {
        {
            let mut conn = self.pools.get(backend).await.map_err(pool_error)?;
            conn.execute("STOP SLAVE", &[]).await?;
        }
        if wait {
            self.wait_for_threads(backend, false).await?;
        }
        Ok(())
    }

    async fn reset_slave(&self, backend: &Backend, clean: bool) -> Result<(), Error> {
        let mut conn = self.pools.get(backend).await.map_err(pool_error)?;
        conn.execute("STOP SLAVE", &[]).await?;
        let reset = if clean { "RESET SLAVE ALL" } else { "RESET SLAVE" };
        conn.execute(reset, &[]).await?;
        Ok(())
    }

    async fn wait_for_gtid(
        &self,
        slave: &Backend,
        gtids: &GtidSet,
        wait: Duration,
    ) -> Result<(), Error> {
        let mut conn = self.pools.get(slave).await.map_err(pool_error)?;
        let rows = conn
            .query(
                "SELECT WAIT_UNTIL_SQL_THREAD_AFTER_GTIDS(?, ?)",
                &[gtids.to_string().into(), (wait.as_secs() as i64).into()],
            )
            .await?;

        match rows.rows.first().and_then(|r| r.first()) {
            Some(value) if value.is_null() => Err(Error::NotASlave(slave.uuid)),
            Some(value) if value.as_i64() == Some(-1) => {
                Err(Error::Timeout(format!("gtid wait on ({})", slave.uuid)))
            }
            Some(_) => Ok(()),
            None => Err(Error::Protocol("empty gtid wait reply".into())),
        }
    }

    async fn process_backlog(&self, slave: &Backend, wait: Duration) -> Result<(), Error> {
        let retrieved = self.gtid_retrieved(slave).await?;
        if retrieved.is_empty() {
            return Ok(());
        }

        {
            let mut conn = self.pools.get(slave).await.map_err(pool_error)?;
            conn.execute("START SLAVE SQL_THREAD", &[]).await?;
        }
        self.wait_for_gtid(slave, &retrieved, wait).await
    }

    async fn set_read_only(&self, backend: &Backend, read_only: bool) -> Result<(), Error> {
        let mut conn = self.pools.get(backend).await.map_err(pool_error)?;
        let flag = if read_only { "ON" } else { "OFF" };
        conn.execute(&format!("SET GLOBAL read_only = {}", flag), &[])
            .await?;
        Ok(())
    }

    async fn backup(&self, source: &Backend) -> Result<DumpImage, Error> {
        let (host, port) = host_port(&source.address);
        let path: PathBuf = self
            .provision
            .work_dir
            .join(format!("herd-dump-{}.sql", Uuid::new_v4()));
        let file = std::fs::File::create(&path).map_err(|e| Error::Dump(e.to_string()))?;

        debug!("dumping ({}) to {}", source.uuid, path.display());

        let status = Command::new(&self.provision.mysqldump)
            .arg("--single-transaction")
            .arg("--all-databases")
            .arg("--triggers")
            .arg("--routines")
            .arg("--events")
            .arg("-h")
            .arg(&host)
            .arg("-P")
            .arg(port.to_string())
            .arg("-u")
            .arg(&source.user)
            .env("MYSQL_PWD", &source.password)
            .stdout(Stdio::from(file))
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| Error::Dump(e.to_string()))?;

        if !status.success() {
            return Err(Error::Dump(format!("mysqldump exited with {}", status)));
        }

        Ok(DumpImage::File(path))
    }

    async fn restore(&self, destination: &Backend, image: &DumpImage) -> Result<(), Error> {
        let path = match image {
            DumpImage::File(path) => path,
            DumpImage::Rows(_) => {
                return Err(Error::Dump("row image requires the simulator driver".into()))
            }
        };
        let (host, port) = host_port(&destination.address);
        let file = std::fs::File::open(path).map_err(|e| Error::Dump(e.to_string()))?;

        let status = Command::new(&self.provision.mysql)
            .arg("-h")
            .arg(&host)
            .arg("-P")
            .arg(port.to_string())
            .arg("-u")
            .arg(&destination.user)
            .env("MYSQL_PWD", &destination.password)
            .stdin(Stdio::from(file))
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| Error::Dump(e.to_string()))?;

        if !status.success() {
            return Err(Error::Dump(format!("mysql exited with {}", status)));
        }

        Ok(())
    }

    async fn prune_rows(
        &self,
        master: &Backend,
        table: &str,
        column: &str,
        kind: ShardingType,
        window: &PruneWindow,
    ) -> Result<u64, Error> {
        let table = identifier(table);
        let column = identifier(column);
        let key = if kind.is_hash() {
            format!("UNHEX(MD5({}))", column)
        } else {
            column
        };

        let (sql, params): (String, Vec<Value>) = match (&window.upper, window.wrap) {
            (Some(upper), false) => (
                format!("DELETE FROM {} WHERE {} < ? OR {} >= ?", table, key, key),
                vec![window.lower.encode(), upper.encode()],
            ),
            (Some(upper), true) => (
                // Wrapped HASH window: rows to keep are >= lower OR < upper.
                format!("DELETE FROM {} WHERE {} < ? AND {} >= ?", table, key, key),
                vec![window.lower.encode(), upper.encode()],
            ),
            (None, _) => (
                format!("DELETE FROM {} WHERE {} < ?", table, key),
                vec![window.lower.encode()],
            ),
        };

        let mut conn = self.pools.get(master).await.map_err(pool_error)?;
        let result = conn.execute(&sql, &params).await?;
        Ok(result.rows_affected)
    }

    async fn max_hashed_key(
        &self,
        master: &Backend,
        table: &str,
        column: &str,
    ) -> Result<Option<[u8; 16]>, Error> {
        let sql = format!(
            "SELECT MAX(UNHEX(MD5({}))) FROM {}",
            identifier(column),
            identifier(table)
        );
        let mut conn = self.pools.get(master).await.map_err(pool_error)?;
        let rows = conn.query(&sql, &[]).await?;

        Ok(rows
            .rows
            .first()
            .and_then(|r| r.first())
            .and_then(Value::as_bytes)
            .and_then(|b| <[u8; 16]>::try_from(b).ok()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_host_port() {
        assert_eq!(host_port("db1:3307"), ("db1".into(), 3307));
        assert_eq!(host_port("db1"), ("db1".into(), 3306));
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quoted("pa's"), "'pa\\'s'");
        assert_eq!(identifier("t`1"), "`t1`");
    }
}

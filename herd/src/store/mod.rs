//! State store gateway. All topology and sharding metadata lives in MySQL
//! tables on a designated backend; every mutation happens inside a
//! transaction scoped to one procedure step.

pub mod catalog;
#[cfg(feature = "mysql")]
pub mod driver;
pub mod memory;
pub mod schema;
pub mod sql;

pub use catalog::{Catalog, CatalogTxn};
pub use memory::MemCatalog;
pub use sql::SqlCatalog;

use std::sync::Arc;

use thiserror::Error;

use crate::sql::{Connector, ExecResult, Rows, SqlRunner, Value};

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Sql(#[from] crate::sql::Error),

    #[error("transaction already finished")]
    Done,

    #[error("malformed row: {0}")]
    Row(String),
}

/// Connection settings for the state store backend.
#[derive(Debug, Clone)]
pub struct StoreTarget {
    pub address: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl StoreTarget {
    pub fn from_config(config: &herd_config::Store) -> Self {
        Self {
            address: config.address.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            database: config.database.clone(),
        }
    }
}

/// Gateway to the state store. Opens one connection per transaction; a
/// transaction dropped without commit is rolled back by the server when
/// the connection closes.
pub struct Store {
    connector: Arc<dyn Connector>,
    target: StoreTarget,
}

impl Store {
    pub fn new(connector: Arc<dyn Connector>, target: StoreTarget) -> Self {
        Self { connector, target }
    }

    pub async fn begin(&self) -> Result<StoreTxn, Error> {
        let mut conn = self
            .connector
            .connect(&self.target.address, &self.target.user, &self.target.password)
            .await?;
        conn.execute(&format!("USE `{}`", self.target.database), &[])
            .await?;
        conn.execute("BEGIN", &[]).await?;

        Ok(StoreTxn {
            conn,
            last_insert_id: 0,
            done: false,
        })
    }
}

/// One open state-store transaction.
pub struct StoreTxn {
    conn: Box<dyn SqlRunner>,
    last_insert_id: u64,
    done: bool,
}

impl StoreTxn {
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Rows, Error> {
        if self.done {
            return Err(Error::Done);
        }
        Ok(self.conn.query(sql, params).await?)
    }

    pub async fn exec(&mut self, sql: &str, params: &[Value]) -> Result<ExecResult, Error> {
        if self.done {
            return Err(Error::Done);
        }
        let result = self.conn.execute(sql, params).await?;
        if result.last_insert_id != 0 {
            self.last_insert_id = result.last_insert_id;
        }
        Ok(result)
    }

    /// Id generated by the last INSERT into an auto-increment table.
    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    pub async fn commit(&mut self) -> Result<(), Error> {
        if self.done {
            return Err(Error::Done);
        }
        self.conn.execute("COMMIT", &[]).await?;
        self.done = true;
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<(), Error> {
        if self.done {
            return Err(Error::Done);
        }
        self.conn.execute("ROLLBACK", &[]).await?;
        self.done = true;
        Ok(())
    }
}

//! SQL client contracts. The engine never links a wire driver directly;
//! it talks to backends through these traits. A sqlx-backed implementation
//! ships behind the `mysql` feature, tests drive an in-process fleet.

pub mod value;

pub use value::Value;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("access denied: {0}")]
    Credential(String),

    #[error("statement failed: {0}")]
    Statement(String),

    #[error("unexpected value in column {0}")]
    Decode(usize),

    #[error("connect timeout")]
    ConnectTimeout,
}

/// Result of a statement that does not return rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: u64,
}

/// A result set with its column names.
#[derive(Debug, Clone, Default)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Rows {
    /// Value at (row, named column), if both exist.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))?;
        self.rows.get(row)?.get(index)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One open connection to a MySQL server.
#[async_trait]
pub trait SqlRunner: Send {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Rows, Error>;

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecResult, Error>;

    /// Cheap liveness probe; used by the pool before handing the
    /// connection out.
    async fn ping(&mut self) -> Result<(), Error>;
}

/// Opens connections to a backend. The single seam between the engine and
/// the low-level driver.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        address: &str,
        user: &str,
        password: &str,
    ) -> Result<Box<dyn SqlRunner>, Error>;
}

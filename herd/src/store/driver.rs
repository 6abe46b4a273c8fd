//! Default SQL driver over sqlx. One [`MySqlConnector`] serves both the
//! state store gateway and the per-backend pools.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{Column, ConnectOptions, Connection, Row, TypeInfo};

use crate::sql::{Connector, Error, ExecResult, Rows, SqlRunner, Value};

#[derive(Debug, Default, Clone)]
pub struct MySqlConnector;

fn host_port(address: &str) -> (String, u16) {
    match address.rsplit_once(':') {
        Some((host, port)) => (host.to_owned(), port.parse().unwrap_or(3306)),
        None => (address.to_owned(), 3306),
    }
}

fn map_error(err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::Database(db) => {
            // 1045: access denied.
            if db.code().as_deref() == Some("28000") {
                Error::Credential(db.message().to_owned())
            } else {
                Error::Statement(db.message().to_owned())
            }
        }
        sqlx::Error::Io(io) => Error::Unreachable(io.to_string()),
        sqlx::Error::Tls(tls) => Error::Unreachable(tls.to_string()),
        sqlx::Error::PoolTimedOut => Error::ConnectTimeout,
        other => Error::Statement(other.to_string()),
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(
        &self,
        address: &str,
        user: &str,
        password: &str,
    ) -> Result<Box<dyn SqlRunner>, Error> {
        let (host, port) = host_port(address);
        let options = MySqlConnectOptions::new()
            .host(&host)
            .port(port)
            .username(user)
            .password(password);

        let conn = options.connect().await.map_err(map_error)?;
        Ok(Box::new(SqlxRunner { conn }))
    }
}

struct SqlxRunner {
    conn: MySqlConnection,
}

fn bind<'q>(
    query: sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>,
    param: &'q Value,
) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
    match param {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::UInt(u) => query.bind(*u),
        Value::Float(f) => query.bind(*f),
        Value::Text(s) => query.bind(s.as_str()),
        Value::Bytes(b) => query.bind(b.as_slice()),
        Value::DateTime(dt) => query.bind(*dt),
    }
}

fn decode_column(row: &MySqlRow, index: usize) -> Result<Value, Error> {
    let type_name = row.columns()[index].type_info().name().to_ascii_uppercase();

    let value = match type_name.as_str() {
        "FLOAT" | "DOUBLE" => row
            .try_get::<Option<f64>, _>(index)
            .map_err(|_| Error::Decode(index))?
            .map(Value::Float),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => row
            .try_get::<Option<i64>, _>(index)
            .map_err(|_| Error::Decode(index))?
            .map(Value::Int),
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" | "BIT" => row
            .try_get::<Option<u64>, _>(index)
            .map_err(|_| Error::Decode(index))?
            .map(Value::UInt),
        "DATETIME" | "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)
            .map_err(|_| Error::Decode(index))?
            .map(Value::DateTime),
        "VARBINARY" | "BINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .map_err(|_| Error::Decode(index))?
            .map(Value::Bytes),
        _ => row
            .try_get::<Option<String>, _>(index)
            .map_err(|_| Error::Decode(index))?
            .map(Value::Text),
    };

    Ok(value.unwrap_or(Value::Null))
}

#[async_trait]
impl SqlRunner for SqlxRunner {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Rows, Error> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind(query, param);
        }

        let rows: Vec<MySqlRow> = query.fetch_all(&mut self.conn).await.map_err(map_error)?;

        let columns = rows
            .first()
            .map(|row| {
                row.columns()
                    .iter()
                    .map(|c| c.name().to_owned())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut decoded = Vec::with_capacity(row.columns().len());
            for index in 0..row.columns().len() {
                decoded.push(decode_column(row, index)?);
            }
            out.push(decoded);
        }

        Ok(Rows { columns, rows: out })
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecResult, Error> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind(query, param);
        }

        let result = query.execute(&mut self.conn).await.map_err(map_error)?;
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_id(),
        })
    }

    async fn ping(&mut self) -> Result<(), Error> {
        self.conn.ping().await.map_err(map_error)
    }
}

//! SQLite source
//!
//! Metadata comes from `sqlite_master` and `PRAGMA table_info`. Declared
//! column types are free text in SQLite, so they are parsed here into a
//! standard type where one fits and reported as `SqlType::Other` otherwise.

use super::{ColumnMetadata, RowStream, SourceDatabase, TableKind};
use crate::error::{AppError, AppResult};
use crate::introspection::{ColumnDefinition, IdentifierCase, TableSchema};
use crate::snapshot::value::render;
use crate::snapshot::Value;
use crate::store::SqlBuilder;
use crate::type_mapper::{CanonicalType, SqlType};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use futures_util::{stream, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// `NAME`, `NAME(size)` or `NAME(size, digits)`
static DECLARED_TYPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_ ]*?)\s*(?:\(\s*(\d+)\s*(?:,\s*(\d+)\s*)?\))?\s*$")
        .expect("declared type pattern is valid")
});

/// Rows buffered between the cursor and the copy loop
const SCAN_BUFFER: usize = 256;

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Source backed by a SQLite database file
#[derive(Clone)]
pub struct SqliteSource {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSource {
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        Ok(Self::from_connection(conn))
    }

    /// In-memory source (for testing)
    pub fn in_memory() -> AppResult<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run statements directly against the source database
    pub fn execute_batch(&self, sql: &str) -> AppResult<()> {
        let conn = self.lock_sync()?;
        conn.execute_batch(sql)?;
        Ok(())
    }

    fn lock_sync(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("sqlite source lock poisoned".to_string()))
    }

    /// Run `f` against the connection on the blocking pool
    async fn call<T, F>(&self, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> AppResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| AppError::Internal("sqlite source lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| AppError::Internal(format!("spawn_blocking panic: {e}")))?
    }
}

/// Parse a declared column type into (standard type, base name, size, digits)
pub(crate) fn parse_declared_type(declared: &str) -> (SqlType, String, i32, i32) {
    let Some(caps) = DECLARED_TYPE.captures(declared) else {
        return (SqlType::Other, declared.trim().to_string(), 0, -1);
    };

    let name = caps[1].trim().to_ascii_uppercase();
    let size = caps
        .get(2)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    let digits = caps
        .get(3)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(-1);

    let sql_type = match name.as_str() {
        "INTEGER" | "INT" | "MEDIUMINT" => SqlType::Integer,
        "BIGINT" | "UNSIGNED BIG INT" | "INT8" => SqlType::BigInt,
        "SMALLINT" | "INT2" => SqlType::SmallInt,
        "TINYINT" => SqlType::TinyInt,
        "BOOLEAN" | "BOOL" => SqlType::Boolean,
        "REAL" => SqlType::Real,
        "DOUBLE" | "DOUBLE PRECISION" | "FLOAT" => SqlType::Double,
        "NUMERIC" | "DECIMAL" => SqlType::Decimal,
        "CHAR" | "CHARACTER" | "NCHAR" | "NATIVE CHARACTER" => SqlType::Char,
        "VARCHAR" | "NVARCHAR" | "CHARACTER VARYING" | "VARYING CHARACTER" => SqlType::Varchar,
        "TEXT" => SqlType::LongVarchar,
        "CLOB" => SqlType::Clob,
        "BLOB" => SqlType::Blob,
        "DATE" => SqlType::Date,
        "TIME" => SqlType::Time,
        "DATETIME" | "TIMESTAMP" => SqlType::Timestamp,
        _ => SqlType::Other,
    };

    (sql_type, name, size, digits)
}

/// Timestamp accessor: temporal cells become `NaiveDateTime` whatever text
/// form they were stored in.
fn read_timestamp(table: &str, column: &str, value: ValueRef<'_>) -> AppResult<Value> {
    let parsed = match value {
        ValueRef::Null => return Ok(Value::Null),
        ValueRef::Integer(secs) => DateTime::from_timestamp(secs, 0).map(|dt| dt.naive_utc()),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            let text = text.trim();
            TIMESTAMP_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
                .or_else(|| {
                    NaiveDate::parse_from_str(text, "%Y-%m-%d")
                        .ok()
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                })
        }
        ValueRef::Real(_) | ValueRef::Blob(_) => None,
    };

    parsed.map(Value::Timestamp).ok_or_else(|| {
        AppError::Conversion(format!(
            "Cannot read {}.{} value {:?} as a timestamp",
            table,
            column,
            render(value)
        ))
    })
}

fn read_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        // string accessor for character data, CLOBs included
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

#[async_trait]
impl SourceDatabase for SqliteSource {
    fn dialect(&self) -> &'static str {
        "sqlite"
    }

    async fn identifier_case(&self) -> AppResult<IdentifierCase> {
        Ok(IdentifierCase::Preserve)
    }

    async fn list_tables(&self, kinds: &[TableKind]) -> AppResult<Vec<String>> {
        let wanted: Vec<&'static str> = kinds
            .iter()
            .filter_map(|kind| match kind {
                TableKind::Table => Some("table"),
                TableKind::View => Some("view"),
                _ => None,
            })
            .collect();
        let include_system = kinds.contains(&TableKind::SystemTable);

        self.call(move |conn| {
            let mut stmt = conn.prepare("SELECT name, type FROM sqlite_master ORDER BY name")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut tables = Vec::new();
            for row in rows {
                let (name, kind) = row?;
                let is_system = name.starts_with("sqlite_");
                if (is_system && include_system && kind == "table")
                    || (!is_system && wanted.contains(&kind.as_str()))
                {
                    tables.push(name);
                }
            }
            Ok(tables)
        })
        .await
    }

    async fn columns(&self, table: &str) -> AppResult<Vec<ColumnMetadata>> {
        let table = table.to_string();
        self.call(move |conn| {
            let create_sql: Option<String> = conn
                .query_row(
                    "SELECT sql FROM sqlite_master WHERE name = ?1 AND type = 'table'",
                    params![table],
                    |row| row.get(0),
                )
                .ok()
                .flatten();
            let has_autoincrement = create_sql
                .map(|sql| sql.to_ascii_uppercase().contains("AUTOINCREMENT"))
                .unwrap_or(false);

            let pragma = format!("PRAGMA table_info({})", SqlBuilder::quote_ident(&table));
            let mut stmt = conn.prepare(&pragma)?;
            let raw = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        row.get::<_, bool>(3)?,
                        row.get::<_, i64>(5)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let pk_count = raw.iter().filter(|(_, _, _, pk)| *pk > 0).count();
            let columns = raw
                .into_iter()
                .map(|(name, declared, not_null, pk)| {
                    let (sql_type, type_name, column_size, decimal_digits) =
                        parse_declared_type(&declared);
                    // a lone `INTEGER PRIMARY KEY` aliases the rowid; any other
                    // key column accepts NULL unless declared NOT NULL
                    let rowid_alias = pk > 0 && pk_count == 1 && type_name == "INTEGER";
                    let auto_increment = has_autoincrement && rowid_alias;
                    ColumnMetadata {
                        name,
                        sql_type,
                        type_name,
                        column_size,
                        decimal_digits,
                        nullable: !not_null && !rowid_alias,
                        auto_increment,
                    }
                })
                .collect();
            Ok(columns)
        })
        .await
    }

    async fn primary_keys(&self, table: &str) -> AppResult<Vec<String>> {
        let table = table.to_string();
        self.call(move |conn| {
            let pragma = format!("PRAGMA table_info({})", SqlBuilder::quote_ident(&table));
            let mut stmt = conn.prepare(&pragma)?;
            let mut keys = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(5)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            keys.retain(|(pk, _)| *pk > 0);
            keys.sort_by_key(|(pk, _)| *pk);
            Ok(keys.into_iter().map(|(_, name)| name).collect())
        })
        .await
    }

    async fn scan(&self, table: &str, schema: &TableSchema) -> AppResult<RowStream> {
        let table = table.to_string();
        let columns = schema.columns.clone();
        let conn = Arc::clone(&self.conn);
        let (tx, rx) = mpsc::channel::<AppResult<Vec<Value>>>(SCAN_BUFFER);

        // rusqlite cursors borrow the connection, so the cursor lives on the
        // blocking pool and rows cross over a bounded channel
        tokio::task::spawn_blocking(move || {
            let result = conn
                .lock()
                .map_err(|_| AppError::Internal("sqlite source lock poisoned".to_string()))
                .and_then(|guard| send_rows(&guard, &table, &columns, &tx));
            if let Err(e) = result {
                // the receiver may already be gone
                let _ = tx.blocking_send(Err(e));
            }
        });

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|row| (row, rx))
        })
        .boxed())
    }
}

/// Push every row of `table` into `tx`; stops early once the receiver is dropped
fn send_rows(
    conn: &Connection,
    table: &str,
    columns: &[ColumnDefinition],
    tx: &mpsc::Sender<AppResult<Vec<Value>>>,
) -> AppResult<()> {
    let sql = SqlBuilder::select_all(table, &schema_names(columns));
    let mut stmt = conn.prepare(&sql)?;
    let mut cursor = stmt.query([])?;

    while let Some(row) = cursor.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            let raw = row.get_ref(i)?;
            let value = if column.column_type.is_temporal() {
                read_timestamp(table, &column.name, raw)?
            } else if column.column_type == CanonicalType::Boolean {
                match raw {
                    ValueRef::Integer(i) => Value::Bool(i != 0),
                    other => read_value(other),
                }
            } else {
                read_value(raw)
            };
            values.push(value);
        }
        if tx.blocking_send(Ok(values)).is_err() {
            debug!("Scan of {} abandoned by its reader", table);
            break;
        }
    }
    Ok(())
}

fn schema_names(columns: &[ColumnDefinition]) -> Vec<String> {
    columns.iter().map(|c| c.name.clone()).collect()
}

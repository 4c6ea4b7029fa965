//! Source database capability
//!
//! The engine reads metadata and rows from a source only through
//! [`SourceDatabase`]. Vendor specifics live in the submodules.

pub mod postgres;
pub mod sqlite;

use crate::error::{AppError, AppResult};
use crate::introspection::{IdentifierCase, TableSchema};
use crate::snapshot::Value;
use crate::type_mapper::SqlType;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub use postgres::PostgresSource;
pub use sqlite::SqliteSource;

/// Cursor over the rows of one table, values in schema order
pub type RowStream = BoxStream<'static, AppResult<Vec<Value>>>;

/// Kind of catalog object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Table,
    View,
    MaterializedView,
    ForeignTable,
    SystemTable,
}

impl FromStr for TableKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "table" => Ok(TableKind::Table),
            "view" => Ok(TableKind::View),
            "materialized_view" => Ok(TableKind::MaterializedView),
            "foreign_table" => Ok(TableKind::ForeignTable),
            "system_table" => Ok(TableKind::SystemTable),
            other => Err(AppError::Validation(format!("Unknown table kind: {}", other))),
        }
    }
}

/// Column metadata as the source reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    pub sql_type: SqlType,
    /// Vendor type name
    pub type_name: String,
    /// Length or numeric precision; `0` when not reported
    pub column_size: i32,
    /// Fractional digits; negative when not applicable
    pub decimal_digits: i32,
    pub nullable: bool,
    pub auto_increment: bool,
}

/// Generic metadata/query capability of a relational source
#[async_trait]
pub trait SourceDatabase: Send + Sync {
    /// Short dialect name for logs
    fn dialect(&self) -> &'static str;

    /// How the source folds unquoted identifiers
    async fn identifier_case(&self) -> AppResult<IdentifierCase>;

    /// Names of catalog objects of the given kinds
    async fn list_tables(&self, kinds: &[TableKind]) -> AppResult<Vec<String>>;

    /// Columns of `table` in the source's stable order
    async fn columns(&self, table: &str) -> AppResult<Vec<ColumnMetadata>>;

    /// Primary key column names of `table`
    async fn primary_keys(&self, table: &str) -> AppResult<Vec<String>>;

    /// Open a cursor over every row of `table`.
    ///
    /// The connection backing the cursor is released when the stream drops.
    async fn scan(&self, table: &str, schema: &TableSchema) -> AppResult<RowStream>;
}

/// Which driver a source URL selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Postgres(String),
    Sqlite(String),
}

impl SourceKind {
    pub fn from_url(url: &str) -> AppResult<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(SourceKind::Postgres(url.to_string()))
        } else if let Some(path) = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
        {
            if path.is_empty() {
                return Err(AppError::Config("Missing path in sqlite source URL".to_string()));
            }
            Ok(SourceKind::Sqlite(path.to_string()))
        } else {
            Err(AppError::Config(
                "Unsupported source URL. Use postgres:// or sqlite://".to_string(),
            ))
        }
    }
}

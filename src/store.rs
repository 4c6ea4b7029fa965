//! Local snapshot store
//!
//! One SQLite connection holds every snapshot table and the version ledger.
//! Calls run on the blocking pool; the connection sits behind an async mutex
//! so a [`StoreSession`] can keep it across awaits while a table is copied.

use crate::error::{AppError, AppResult};
use crate::introspection::TableSchema;
use crate::type_mapper::CanonicalType;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// SQL builder for the local store
pub struct SqlBuilder;

impl SqlBuilder {
    /// Quote an identifier (table/column name) safely
    pub fn quote_ident(ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn column_list(columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| Self::quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Build the CREATE TABLE of a snapshot table shaped like `schema`.
    ///
    /// A lone integral auto-increment key keeps its auto-increment property;
    /// every other key becomes a table-level constraint.
    pub fn create_table(name: &str, schema: &TableSchema) -> String {
        let pk: Vec<_> = schema.columns.iter().filter(|c| c.primary_key).collect();
        let inline_pk = pk.len() == 1 && pk[0].auto_increment && pk[0].column_type.is_integral();

        let mut defs: Vec<String> = schema
            .columns
            .iter()
            .map(|c| {
                if inline_pk && c.primary_key {
                    format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", Self::quote_ident(&c.name))
                } else {
                    let mut def = format!(
                        "{} {}",
                        Self::quote_ident(&c.name),
                        Self::column_type(c.column_type, c.precision, c.scale)
                    );
                    if !c.nullable {
                        def.push_str(" NOT NULL");
                    }
                    def
                }
            })
            .collect();

        if !pk.is_empty() && !inline_pk {
            let keys: Vec<String> = pk.iter().map(|c| c.name.clone()).collect();
            defs.push(format!("PRIMARY KEY ({})", Self::column_list(&keys)));
        }

        format!("CREATE TABLE {} ({})", Self::quote_ident(name), defs.join(", "))
    }

    /// Declared type of a snapshot column.
    ///
    /// SQLite gives `DECIMAL`, `UUID` and `JSON` NUMERIC affinity, which turns
    /// text into REAL/INTEGER and keeps only ~15 significant digits. Those
    /// columns are stored as TEXT so values compare exactly in `EXCEPT`.
    fn column_type(column_type: CanonicalType, precision: i32, scale: i32) -> String {
        match column_type {
            CanonicalType::Decimal | CanonicalType::Uuid | CanonicalType::Json => {
                "TEXT".to_string()
            }
            other => other.ddl(precision, scale),
        }
    }

    /// Build a positional INSERT for every column
    pub fn insert(name: &str, columns: &[String]) -> String {
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            Self::quote_ident(name),
            Self::column_list(columns),
            placeholders.join(", ")
        )
    }

    pub fn select_all(name: &str, columns: &[String]) -> String {
        format!(
            "SELECT {} FROM {}",
            Self::column_list(columns),
            Self::quote_ident(name)
        )
    }

    /// Rows of `left` absent from `right`, compared on every column
    pub fn except(left: &str, right: &str, columns: &[String]) -> String {
        format!(
            "{} EXCEPT {}",
            Self::select_all(left, columns),
            Self::select_all(right, columns)
        )
    }

    pub fn drop_table(name: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", Self::quote_ident(name))
    }
}

/// Handle to the local snapshot database
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
}

impl LocalStore {
    /// Open (or create) the store at a file path
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;
            "#,
        )?;
        debug!("Opened local store at {}", path.as_ref().display());
        Ok(Self::from_connection(conn))
    }

    /// In-memory store (for testing)
    pub fn in_memory() -> AppResult<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` against the connection on the blocking pool
    pub async fn call<T, F>(&self, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> AppResult<T> + Send + 'static,
    {
        let mut session = self.session().await;
        session.call(f).await
    }

    /// Take exclusive use of the connection until the session drops
    pub async fn session(&self) -> StoreSession {
        StoreSession {
            guard: Some(Arc::clone(&self.conn).lock_owned().await),
        }
    }

    pub async fn table_exists(&self, name: &str) -> AppResult<bool> {
        let name = name.to_string();
        self.call(move |conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    params![name],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    pub async fn drop_table(&self, name: &str) -> AppResult<()> {
        let sql = SqlBuilder::drop_table(name);
        self.call(move |conn| {
            conn.execute_batch(&sql)?;
            Ok(())
        })
        .await
    }
}

/// Exclusive hold on the store connection.
///
/// An open transaction left behind when the session drops is rolled back.
pub struct StoreSession {
    guard: Option<OwnedMutexGuard<Connection>>,
}

impl StoreSession {
    /// Run `f` on the blocking pool, keeping the connection afterwards
    pub async fn call<T, F>(&mut self, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> AppResult<T> + Send + 'static,
    {
        let mut guard = self
            .guard
            .take()
            .ok_or_else(|| AppError::Internal("store session lost its connection".to_string()))?;

        let (guard, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut guard);
            (guard, result)
        })
        .await
        .map_err(|e| AppError::Internal(format!("spawn_blocking panic: {e}")))?;

        self.guard = Some(guard);
        result
    }

    pub async fn begin(&mut self) -> AppResult<()> {
        self.call(|conn| Ok(conn.execute_batch("BEGIN IMMEDIATE")?))
            .await
    }

    pub async fn commit(&mut self) -> AppResult<()> {
        self.call(|conn| Ok(conn.execute_batch("COMMIT")?)).await
    }

    pub async fn rollback(&mut self) -> AppResult<()> {
        self.call(|conn| {
            if !conn.is_autocommit() {
                conn.execute_batch("ROLLBACK")?;
            }
            Ok(())
        })
        .await
    }
}

impl Drop for StoreSession {
    fn drop(&mut self) {
        if let Some(conn) = self.guard.as_ref() {
            if !conn.is_autocommit() {
                let _ = conn.execute_batch("ROLLBACK");
            }
        }
    }
}

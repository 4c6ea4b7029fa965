//! Snapshot Version Store
//!
//! Durable ledger of snapshot versions, kept in the local store next to the
//! snapshot tables. A version id is allocated once per `take` and recorded
//! against every table captured in it. "Current" and "previous" are resolved
//! by creation order, never by comparing ids.

use crate::error::{AppError, AppResult};
use crate::store::LocalStore;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub type VersionId = i64;

const INIT_LEDGER: &str = r#"
    CREATE TABLE IF NOT EXISTS snapshot_versions (
        version_id  INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at  TEXT    NOT NULL
    );
    CREATE TABLE IF NOT EXISTS snapshot_version_tables (
        seq         INTEGER PRIMARY KEY AUTOINCREMENT,
        version_id  INTEGER NOT NULL REFERENCES snapshot_versions(version_id),
        table_name  TEXT    NOT NULL,
        UNIQUE(version_id, table_name)
    );
    CREATE INDEX IF NOT EXISTS idx_version_tables_name_seq
        ON snapshot_version_tables(table_name, seq DESC);
"#;

const DROP_LEDGER: &str = r#"
    DROP TABLE IF EXISTS snapshot_version_tables;
    DROP TABLE IF EXISTS snapshot_versions;
"#;

const SELECT_RECORDS: &str = r#"
    SELECT t.table_name, t.version_id, t.seq, v.created_at
    FROM snapshot_version_tables t
    JOIN snapshot_versions v ON v.version_id = t.version_id
"#;

/// Physical name of the snapshot of `table` taken in `version`
pub fn snapshot_table(table: &str, version: VersionId) -> String {
    format!("{}_{}", table, version)
}

fn allocate(
    conn: &mut Connection,
    created_at: &str,
    tables: &[String],
) -> rusqlite::Result<VersionId> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO snapshot_versions (created_at) VALUES (?1)",
        params![created_at],
    )?;
    let version = tx.last_insert_rowid();
    {
        let mut stmt = tx.prepare(
            "INSERT INTO snapshot_version_tables (version_id, table_name) VALUES (?1, ?2)",
        )?;
        for table in tables {
            stmt.execute(params![version, table])?;
        }
    }
    tx.commit()?;
    Ok(version)
}

/// One table's membership in one version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    pub table_name: String,
    pub version_id: VersionId,
    /// Creation order across the whole ledger
    pub seq: i64,
    pub created_at: String,
}

impl VersionRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            table_name: row.get(0)?,
            version_id: row.get(1)?,
            seq: row.get(2)?,
            created_at: row.get(3)?,
        })
    }
}

/// Allocates and resolves snapshot versions
#[derive(Clone)]
pub struct VersionStore {
    store: LocalStore,
}

impl VersionStore {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Ensure the ledger tables exist
    pub async fn init(&self) -> AppResult<()> {
        self.store
            .call(|conn| Ok(conn.execute_batch(INIT_LEDGER)?))
            .await
    }

    /// Drop the ledger entirely
    pub(crate) async fn destroy(&self) -> AppResult<()> {
        self.store
            .call(|conn| Ok(conn.execute_batch(DROP_LEDGER)?))
            .await
    }

    /// Allocate one version id and record it for every table, all or nothing
    pub async fn next_version(&self, tables: &[String]) -> AppResult<VersionId> {
        let tables = tables.to_vec();
        let created_at = Utc::now().to_rfc3339();

        let version = self
            .store
            .call(move |conn| {
                allocate(conn, &created_at, &tables).map_err(AppError::VersionAllocation)
            })
            .await?;

        debug!("Allocated snapshot version {}", version);
        Ok(version)
    }

    /// Most recently allocated version of `table`
    pub async fn current_version(&self, table: &str) -> AppResult<VersionId> {
        self.nth_latest(table, 0).await
    }

    /// Second most recently allocated version of `table`
    pub async fn previous_version(&self, table: &str) -> AppResult<VersionId> {
        self.nth_latest(table, 1).await
    }

    async fn nth_latest(&self, table: &str, offset: usize) -> AppResult<VersionId> {
        let name = table.to_string();
        let (found, count) = self
            .store
            .call(move |conn| {
                let found: Option<VersionId> = conn
                    .query_row(
                        "SELECT version_id FROM snapshot_version_tables \
                         WHERE table_name = ?1 ORDER BY seq DESC LIMIT 1 OFFSET ?2",
                        params![name, offset as i64],
                        |row| row.get(0),
                    )
                    .optional()?;
                let count = match found {
                    Some(_) => 0,
                    None => conn.query_row(
                        "SELECT COUNT(*) FROM snapshot_version_tables WHERE table_name = ?1",
                        params![name],
                        |row| row.get::<_, i64>(0),
                    )?,
                };
                Ok((found, count))
            })
            .await?;

        found.ok_or_else(|| AppError::NoVersion {
            table: table.to_string(),
            required: offset + 1,
            found: count as usize,
        })
    }

    /// Ledger records of `table`, newest first
    pub async fn versions(&self, table: &str) -> AppResult<Vec<VersionRecord>> {
        let name = table.to_string();
        self.store
            .call(move |conn| {
                let sql = format!("{} WHERE t.table_name = ?1 ORDER BY t.seq DESC", SELECT_RECORDS);
                let mut stmt = conn.prepare(&sql)?;
                let records = stmt
                    .query_map(params![name], VersionRecord::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await
    }

    /// Every ledger record in creation order
    pub async fn all_records(&self) -> AppResult<Vec<VersionRecord>> {
        self.store
            .call(|conn| {
                let sql = format!("{} ORDER BY t.seq", SELECT_RECORDS);
                let mut stmt = conn.prepare(&sql)?;
                let records = stmt
                    .query_map([], VersionRecord::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await
    }
}

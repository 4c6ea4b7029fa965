//! Snapshot Engine
//!
//! Captures tables from the source into version-qualified tables in the
//! local store, and hands pairs of captures to the diff engine.

use super::diff::{Diff, DiffEngine};
use super::value::Value;
use super::versions::{snapshot_table, VersionId, VersionRecord, VersionStore};
use crate::error::{AppError, AppResult};
use crate::introspection::{IdentifierCase, SchemaIntrospector, TableSchema};
use crate::source::{SourceDatabase, TableKind};
use crate::store::{LocalStore, SqlBuilder, StoreSession};
use crate::type_mapper::{CanonicalType, TypeMapper};
use futures_util::TryStreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Tuning knobs of a [`SnapshotEngine`]
#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    /// Rows buffered before an insert flush
    pub batch_size: usize,
    /// Pins the identifier convention instead of asking the source
    pub identifier_case: Option<IdentifierCase>,
    /// Vendor type name -> canonical type
    pub type_overrides: HashMap<String, CanonicalType>,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            identifier_case: None,
            type_overrides: TypeMapper::default_overrides(),
        }
    }
}

/// Outcome of copying one table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CopyStats {
    pub rows: u64,
    pub flushes: usize,
}

pub struct SnapshotEngine {
    source: Arc<dyn SourceDatabase>,
    store: LocalStore,
    introspector: SchemaIntrospector,
    versions: VersionStore,
    differ: DiffEngine,
    batch_size: usize,
}

impl SnapshotEngine {
    pub async fn new(
        source: Arc<dyn SourceDatabase>,
        store: LocalStore,
        options: SnapshotOptions,
    ) -> AppResult<Self> {
        if options.batch_size == 0 {
            return Err(AppError::Config("batch size must be greater than 0".to_string()));
        }

        let introspector = SchemaIntrospector::new(
            Arc::clone(&source),
            TypeMapper::new(options.type_overrides),
            options.identifier_case,
        )
        .await?;

        let versions = VersionStore::new(store.clone());
        versions.init().await?;
        let differ = DiffEngine::new(store.clone(), versions.clone());

        Ok(Self {
            source,
            store,
            introspector,
            versions,
            differ,
            batch_size: options.batch_size,
        })
    }

    pub fn introspector(&self) -> &SchemaIntrospector {
        &self.introspector
    }

    /// Capture every table in `tables` under one new version.
    ///
    /// Tables are copied one after another; the first failure stops the
    /// call and names the table it happened on.
    pub async fn take(&self, tables: &[String]) -> AppResult<VersionId> {
        let mut names: Vec<String> = Vec::with_capacity(tables.len());
        for table in tables {
            let name = self.introspector.normalize(table.trim());
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
        if names.is_empty() {
            return Err(AppError::Validation(
                "At least one table name is required".to_string(),
            ));
        }

        let version = self.versions.next_version(&names).await?;
        info!("Taking snapshot version {} of {:?}", version, names);

        for name in &names {
            let started = Instant::now();
            let stats = self
                .capture(name, version)
                .await
                .map_err(|e| AppError::snapshot(name.as_str(), e))?;
            info!(
                "Captured {} rows of {} into {} ({} batches) in {:?}",
                stats.rows,
                name,
                snapshot_table(name, version),
                stats.flushes,
                started.elapsed()
            );
        }

        Ok(version)
    }

    async fn capture(&self, table: &str, version: VersionId) -> AppResult<CopyStats> {
        let schema = self.introspector.read_schema(table).await?;
        let target = snapshot_table(&schema.name, version);

        let mut session = self.store.session().await;
        match self.copy_table(&mut session, &schema, &target).await {
            Ok(stats) => Ok(stats),
            Err(e) => {
                if let Err(rollback) = session.rollback().await {
                    error!("Rollback of {} failed: {}", target, rollback);
                }
                Err(e)
            }
        }
    }

    /// Create `target` and fill it from the source, inside one transaction
    async fn copy_table(
        &self,
        session: &mut StoreSession,
        schema: &TableSchema,
        target: &str,
    ) -> AppResult<CopyStats> {
        let ddl = SqlBuilder::create_table(target, schema);
        let insert = SqlBuilder::insert(target, &schema.column_names());
        debug!("{}", ddl);

        session.begin().await?;
        session
            .call(move |conn| Ok(conn.execute_batch(&ddl)?))
            .await?;

        let width = schema.columns.len();
        let mut rows = self.source.scan(&schema.name, schema).await?;
        let mut batch: Vec<Vec<Value>> = Vec::with_capacity(self.batch_size);
        let mut stats = CopyStats { rows: 0, flushes: 0 };

        while let Some(row) = rows.try_next().await? {
            if row.len() != width {
                return Err(AppError::Conversion(format!(
                    "Row of {} has {} values, schema has {} columns",
                    schema.name,
                    row.len(),
                    width
                )));
            }
            batch.push(row);
            if batch.len() >= self.batch_size {
                stats.rows += flush(session, &insert, std::mem::take(&mut batch)).await?;
                stats.flushes += 1;
            }
        }
        // release the source connection before committing
        drop(rows);

        if !batch.is_empty() {
            stats.rows += flush(session, &insert, batch).await?;
            stats.flushes += 1;
        }
        session.commit().await?;
        Ok(stats)
    }

    /// Diff the two newest captures of `table`
    pub async fn diff_from_previous(&self, table: &str) -> AppResult<Diff> {
        let schema = self.introspector.read_schema(table).await?;
        self.differ.diff_from_previous(&schema).await
    }

    pub async fn list_candidates(&self, kinds: &[TableKind]) -> AppResult<Vec<String>> {
        self.introspector.list_candidate_tables(kinds).await
    }

    pub async fn schema(&self, table: &str) -> AppResult<TableSchema> {
        self.introspector.read_schema(table).await
    }

    /// Ledger records of `table`, newest first
    pub async fn versions(&self, table: &str) -> AppResult<Vec<VersionRecord>> {
        self.versions
            .versions(&self.introspector.normalize(table))
            .await
    }

    /// Drop the snapshot tables of `table` beyond the newest `keep` versions.
    ///
    /// Ledger records stay; returns the names of the dropped tables.
    pub async fn prune(&self, table: &str, keep: usize) -> AppResult<Vec<String>> {
        if keep == 0 {
            return Err(AppError::Validation("keep must be at least 1".to_string()));
        }

        let mut dropped = Vec::new();
        for record in self.versions(table).await?.into_iter().skip(keep) {
            let name = snapshot_table(&record.table_name, record.version_id);
            if self.store.table_exists(&name).await? {
                self.store.drop_table(&name).await?;
                dropped.push(name);
            }
        }

        info!("Pruned {} snapshot table(s) of {}", dropped.len(), table);
        Ok(dropped)
    }

    /// Drop every snapshot table and start a fresh ledger
    pub async fn clear(&self) -> AppResult<usize> {
        let records = self.versions.all_records().await?;
        for record in &records {
            self.store
                .drop_table(&snapshot_table(&record.table_name, record.version_id))
                .await?;
        }
        self.versions.destroy().await?;
        self.versions.init().await?;

        info!("Cleared {} snapshot table(s)", records.len());
        Ok(records.len())
    }
}

async fn flush(session: &mut StoreSession, sql: &str, batch: Vec<Vec<Value>>) -> AppResult<u64> {
    let sql = sql.to_string();
    let count = session
        .call(move |conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            for row in &batch {
                stmt.execute(rusqlite::params_from_iter(row.iter()))?;
            }
            Ok(batch.len() as u64)
        })
        .await?;
    debug!("Flushed {} rows", count);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::diff::DiffCell;
    use crate::source::SqliteSource;
    use pretty_assertions::assert_eq;

    struct Fixture {
        engine: SnapshotEngine,
        source: SqliteSource,
        store: LocalStore,
    }

    async fn fixture(sql: &str, batch_size: usize) -> Fixture {
        let source = SqliteSource::in_memory().unwrap();
        source.execute_batch(sql).unwrap();
        let store = LocalStore::in_memory().unwrap();
        let engine = SnapshotEngine::new(
            Arc::new(source.clone()),
            store.clone(),
            SnapshotOptions {
                batch_size,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        Fixture {
            engine,
            source,
            store,
        }
    }

    const EMP: &str = "CREATE TABLE emp (
            id INTEGER PRIMARY KEY,
            name VARCHAR(20),
            age INTEGER
        );
        INSERT INTO emp VALUES (1, 'kawasima', 3);";

    fn tables(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn s(v: &str) -> Option<String> {
        Some(v.to_string())
    }

    async fn count_rows(store: &LocalStore, table: &str) -> i64 {
        let sql = format!("SELECT COUNT(*) FROM {}", SqlBuilder::quote_ident(table));
        store
            .call(move |conn| Ok(conn.query_row(&sql, [], |row| row.get(0))?))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn updated_row_is_reported_as_modification() {
        let fx = fixture(EMP, DEFAULT_BATCH_SIZE).await;
        fx.engine.take(&tables(&["emp"])).await.unwrap();
        fx.source
            .execute_batch("UPDATE emp SET age = 17 WHERE id = 1;")
            .unwrap();
        fx.engine.take(&tables(&["emp"])).await.unwrap();

        let diff = fx.engine.diff_from_previous("emp").await.unwrap();
        assert_eq!(diff.headers, vec!["id", "name", "age"]);
        assert!(diff.add.is_empty());
        assert!(diff.delete.is_empty());
        assert_eq!(
            diff.modify,
            vec![vec![
                DiffCell::Unchanged(s("1")),
                DiffCell::Unchanged(s("kawasima")),
                DiffCell::Changed(s("3"), s("17")),
            ]]
        );
    }

    #[tokio::test]
    async fn inserted_row_is_reported_as_add() {
        let fx = fixture(EMP, DEFAULT_BATCH_SIZE).await;
        fx.engine.take(&tables(&["emp"])).await.unwrap();
        fx.source
            .execute_batch("INSERT INTO emp VALUES (2, 'sato', 30);")
            .unwrap();
        fx.engine.take(&tables(&["emp"])).await.unwrap();

        let diff = fx.engine.diff_from_previous("emp").await.unwrap();
        assert_eq!(diff.add.len(), 1);
        assert_eq!(diff.add[0].values(), &[s("2"), s("sato"), s("30")]);
        assert!(diff.modify.is_empty());
        assert!(diff.delete.is_empty());
    }

    #[tokio::test]
    async fn deleted_row_is_reported_as_delete() {
        let fx = fixture(EMP, DEFAULT_BATCH_SIZE).await;
        fx.engine.take(&tables(&["emp"])).await.unwrap();
        fx.source.execute_batch("DELETE FROM emp;").unwrap();
        fx.engine.take(&tables(&["emp"])).await.unwrap();

        let diff = fx.engine.diff_from_previous("emp").await.unwrap();
        assert_eq!(diff.delete.len(), 1);
        assert!(diff.add.is_empty() && diff.modify.is_empty());
    }

    #[tokio::test]
    async fn single_capture_has_no_previous_version() {
        let fx = fixture(EMP, DEFAULT_BATCH_SIZE).await;
        fx.engine.take(&tables(&["emp"])).await.unwrap();

        assert!(matches!(
            fx.engine.diff_from_previous("emp").await,
            Err(AppError::NoVersion { required: 2, found: 1, .. })
        ));
    }

    #[tokio::test]
    async fn pruned_previous_snapshot_gives_empty_diff() {
        let fx = fixture(EMP, DEFAULT_BATCH_SIZE).await;
        let v1 = fx.engine.take(&tables(&["emp"])).await.unwrap();
        fx.source
            .execute_batch("UPDATE emp SET age = 17 WHERE id = 1;")
            .unwrap();
        fx.engine.take(&tables(&["emp"])).await.unwrap();

        let dropped = fx.engine.prune("emp", 1).await.unwrap();
        assert_eq!(dropped, vec![snapshot_table("emp", v1)]);

        let diff = fx.engine.diff_from_previous("emp").await.unwrap();
        assert_eq!(diff, Diff::empty(tables(&["id", "name", "age"])));
        assert!(diff.is_empty());
        // the ledger keeps its history
        assert_eq!(fx.engine.versions("emp").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn diff_is_repeatable() {
        let fx = fixture(EMP, DEFAULT_BATCH_SIZE).await;
        fx.engine.take(&tables(&["emp"])).await.unwrap();
        fx.source
            .execute_batch(
                "UPDATE emp SET name = NULL WHERE id = 1;
                 INSERT INTO emp VALUES (2, 'sato', 30);",
            )
            .unwrap();
        fx.engine.take(&tables(&["emp"])).await.unwrap();

        let first = fx.engine.diff_from_previous("emp").await.unwrap();
        let second = fx.engine.diff_from_previous("emp").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.modify[0][1], DiffCell::Changed(s("kawasima"), None));
    }

    #[tokio::test]
    async fn null_filled_in_is_a_modification() {
        let fx = fixture(
            "CREATE TABLE emp (id INTEGER PRIMARY KEY, name VARCHAR(20), age INTEGER);
             INSERT INTO emp VALUES (1, 'kawasima', NULL);",
            DEFAULT_BATCH_SIZE,
        )
        .await;
        fx.engine.take(&tables(&["emp"])).await.unwrap();
        fx.source
            .execute_batch("UPDATE emp SET age = 40 WHERE id = 1;")
            .unwrap();
        fx.engine.take(&tables(&["emp"])).await.unwrap();

        let diff = fx.engine.diff_from_previous("emp").await.unwrap();
        assert!(diff.add.is_empty() && diff.delete.is_empty());
        assert_eq!(diff.modify[0][2], DiffCell::Changed(None, s("40")));
    }

    #[tokio::test]
    async fn table_without_key_only_adds_and_deletes() {
        let fx = fixture(
            "CREATE TABLE audit (who TEXT, what TEXT);
             INSERT INTO audit VALUES ('kawasima', 'login');",
            DEFAULT_BATCH_SIZE,
        )
        .await;
        fx.engine.take(&tables(&["audit"])).await.unwrap();
        fx.source
            .execute_batch("UPDATE audit SET what = 'logout';")
            .unwrap();
        fx.engine.take(&tables(&["audit"])).await.unwrap();

        let diff = fx.engine.diff_from_previous("audit").await.unwrap();
        assert_eq!(diff.add.len(), 1);
        assert_eq!(diff.delete.len(), 1);
        assert!(diff.modify.is_empty());
    }

    #[tokio::test]
    async fn rows_are_copied_across_several_batches() {
        let fx = fixture(
            "CREATE TABLE n (id INTEGER PRIMARY KEY, label TEXT);
             INSERT INTO n VALUES (1, 'a'), (2, 'b'), (3, 'c'), (4, 'd'), (5, 'e');",
            2,
        )
        .await;

        // two full batches and the remainder
        let stats = fx.engine.capture("n", 1).await.unwrap();
        assert_eq!(stats, CopyStats { rows: 5, flushes: 3 });
        assert_eq!(count_rows(&fx.store, &snapshot_table("n", 1)).await, 5);

        fx.source.execute_batch("DELETE FROM n WHERE id = 5;").unwrap();
        let stats = fx.engine.capture("n", 2).await.unwrap();
        assert_eq!(stats, CopyStats { rows: 4, flushes: 2 });
    }

    #[tokio::test]
    async fn wide_decimal_change_is_not_rounded_away() {
        let source = SqliteSource::in_memory().unwrap();
        // TEXT affinity keeps the source value exact; the override maps it to DECIMAL
        source
            .execute_batch(
                "CREATE TABLE acct (id INTEGER PRIMARY KEY, balance DECTEXT(30, 2));
                 INSERT INTO acct VALUES (1, '12345678901234567.12');",
            )
            .unwrap();
        let mut type_overrides = TypeMapper::default_overrides();
        type_overrides.insert("DECTEXT".to_string(), CanonicalType::Decimal);
        let engine = SnapshotEngine::new(
            Arc::new(source.clone()),
            LocalStore::in_memory().unwrap(),
            SnapshotOptions {
                type_overrides,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(
            engine.schema("acct").await.unwrap().columns[1].column_type,
            CanonicalType::Decimal
        );

        engine.take(&tables(&["acct"])).await.unwrap();
        source
            .execute_batch("UPDATE acct SET balance = '12345678901234567.13';")
            .unwrap();
        engine.take(&tables(&["acct"])).await.unwrap();

        let diff = engine.diff_from_previous("acct").await.unwrap();
        assert_eq!(
            diff.modify,
            vec![vec![
                DiffCell::Unchanged(s("1")),
                DiffCell::Changed(s("12345678901234567.12"), s("12345678901234567.13")),
            ]]
        );
    }

    #[tokio::test]
    async fn null_keyed_rows_are_captured_and_never_paired() {
        let fx = fixture(
            "CREATE TABLE t (code TEXT PRIMARY KEY, v INTEGER);
             INSERT INTO t VALUES (NULL, 1), ('a', 2);",
            DEFAULT_BATCH_SIZE,
        )
        .await;
        let version = fx.engine.take(&tables(&["t"])).await.unwrap();
        assert_eq!(count_rows(&fx.store, &snapshot_table("t", version)).await, 2);

        fx.source
            .execute_batch("UPDATE t SET v = 5 WHERE code IS NULL;")
            .unwrap();
        fx.engine.take(&tables(&["t"])).await.unwrap();

        let diff = fx.engine.diff_from_previous("t").await.unwrap();
        assert!(diff.modify.is_empty());
        assert_eq!(diff.add.len(), 1);
        assert_eq!(diff.add[0].values(), &[None, s("5")]);
        assert_eq!(diff.delete.len(), 1);
        assert_eq!(diff.delete[0].values(), &[None, s("1")]);
    }

    #[tokio::test]
    async fn one_version_covers_every_table_of_a_take() {
        let fx = fixture(
            "CREATE TABLE emp (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE dept (id INTEGER PRIMARY KEY, title TEXT);
             INSERT INTO dept VALUES (10, 'sales');",
            DEFAULT_BATCH_SIZE,
        )
        .await;
        let version = fx
            .engine
            .take(&tables(&["emp", "dept", "emp"]))
            .await
            .unwrap();

        assert!(fx.store.table_exists(&snapshot_table("emp", version)).await.unwrap());
        assert_eq!(count_rows(&fx.store, &snapshot_table("dept", version)).await, 1);
        assert_eq!(fx.engine.versions("emp").await.unwrap()[0].version_id, version);
        assert_eq!(fx.engine.versions("dept").await.unwrap()[0].version_id, version);
    }

    #[tokio::test]
    async fn failing_table_leaves_no_partial_snapshot() {
        let fx = fixture(
            "CREATE TABLE ev (id INTEGER PRIMARY KEY, at TIMESTAMP);
             INSERT INTO ev VALUES (1, '2024-01-01 10:00:00'), (2, 'not a time');",
            1,
        )
        .await;

        let err = fx.engine.take(&tables(&["ev"])).await.unwrap_err();
        match &err {
            AppError::Snapshot { table, source } => {
                assert_eq!(table, "ev");
                assert!(matches!(**source, AppError::Conversion(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!fx.store.table_exists(&snapshot_table("ev", 1)).await.unwrap());
    }

    #[tokio::test]
    async fn empty_take_is_rejected() {
        let fx = fixture(EMP, DEFAULT_BATCH_SIZE).await;
        assert!(matches!(
            fx.engine.take(&[]).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn zero_batch_size_is_a_config_error() {
        let source = SqliteSource::in_memory().unwrap();
        let result = SnapshotEngine::new(
            Arc::new(source),
            LocalStore::in_memory().unwrap(),
            SnapshotOptions {
                batch_size: 0,
                ..Default::default()
            },
        )
        .await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn clear_drops_snapshots_and_restarts_the_ledger() {
        let fx = fixture(EMP, DEFAULT_BATCH_SIZE).await;
        let v1 = fx.engine.take(&tables(&["emp"])).await.unwrap();
        fx.engine.take(&tables(&["emp"])).await.unwrap();

        assert_eq!(fx.engine.clear().await.unwrap(), 2);
        assert!(!fx.store.table_exists(&snapshot_table("emp", v1)).await.unwrap());
        assert!(fx.engine.versions("emp").await.unwrap().is_empty());

        fx.engine.take(&tables(&["emp"])).await.unwrap();
        assert_eq!(fx.engine.versions("emp").await.unwrap().len(), 1);
    }
}

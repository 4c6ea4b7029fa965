//! Schema Introspection Module
//!
//! Reads column and primary-key metadata for source tables and turns it into
//! ordered [`TableSchema`]s. Column order is the contract every later step
//! relies on: snapshot DDL, row copy and diff rows are all positional.

use crate::error::{AppError, AppResult};
use crate::source::{SourceDatabase, TableKind};
use crate::type_mapper::{CanonicalType, TypeMapper};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Marker some sources use in the names of internal objects
const SYSTEM_OBJECT_MARKER: char = '$';

/// How a source folds unquoted identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierCase {
    UpperCase,
    LowerCase,
    Preserve,
}

impl IdentifierCase {
    pub fn apply(self, name: &str) -> String {
        match self {
            IdentifierCase::UpperCase => name.to_uppercase(),
            IdentifierCase::LowerCase => name.to_lowercase(),
            IdentifierCase::Preserve => name.to_string(),
        }
    }
}

impl FromStr for IdentifierCase {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upper" | "uppercase" | "upper_case" => Ok(IdentifierCase::UpperCase),
            "lower" | "lowercase" | "lower_case" => Ok(IdentifierCase::LowerCase),
            "preserve" | "mixed" => Ok(IdentifierCase::Preserve),
            other => Err(AppError::Config(format!("Unknown identifier case: {}", other))),
        }
    }
}

/// One column of a snapshotted table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDefinition {
    pub name: String,
    pub column_type: CanonicalType,
    /// Vendor type name as the source reported it
    pub source_type: String,
    /// Length or numeric precision, `-1` when not applicable
    pub precision: i32,
    /// Fractional digits, `-1` when not applicable
    pub scale: i32,
    pub nullable: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
}

/// Ordered column list of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
}

impl TableSchema {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Positions of the primary-key columns, in schema order
    pub fn primary_key_positions(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary_key)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Reads and caches table schemas from a source
pub struct SchemaIntrospector {
    source: Arc<dyn SourceDatabase>,
    mapper: TypeMapper,
    case: IdentifierCase,
    /// Lower-cased normalized table name -> schema
    cache: RwLock<HashMap<String, TableSchema>>,
}

impl SchemaIntrospector {
    /// Build an introspector. The identifier convention is asked from the
    /// source once, unless `case_override` pins it.
    pub async fn new(
        source: Arc<dyn SourceDatabase>,
        mapper: TypeMapper,
        case_override: Option<IdentifierCase>,
    ) -> AppResult<Self> {
        let case = match case_override {
            Some(case) => case,
            None => source.identifier_case().await?,
        };
        debug!("{} source folds identifiers as {:?}", source.dialect(), case);

        Ok(Self {
            source,
            mapper,
            case,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn identifier_case(&self) -> IdentifierCase {
        self.case
    }

    /// Apply the source's identifier convention to a table name
    pub fn normalize(&self, table: &str) -> String {
        self.case.apply(table)
    }

    /// Schema of `table`, introspected on first use and cached afterwards
    pub async fn read_schema(&self, table: &str) -> AppResult<TableSchema> {
        let table = self.normalize(table);
        let key = table.to_lowercase();

        if let Some(schema) = self.cache.read().await.get(&key) {
            return Ok(schema.clone());
        }

        let schema = self.introspect(&table).await?;
        self.cache.write().await.insert(key, schema.clone());
        Ok(schema)
    }

    async fn introspect(&self, table: &str) -> AppResult<TableSchema> {
        let metadata = self.source.columns(table).await?;
        if metadata.is_empty() {
            return Err(AppError::NotFound(format!(
                "Table '{}' not found or has no columns",
                table
            )));
        }

        let mut columns = Vec::with_capacity(metadata.len());
        for meta in metadata {
            let column_type =
                self.mapper
                    .map_type(table, &meta.name, meta.sql_type, &meta.type_name)?;
            columns.push(ColumnDefinition {
                column_type,
                source_type: meta.type_name,
                precision: if meta.column_size == 0 { -1 } else { meta.column_size },
                scale: if meta.decimal_digits < 0 { -1 } else { meta.decimal_digits },
                nullable: meta.nullable,
                primary_key: false,
                auto_increment: meta.auto_increment,
                name: meta.name,
            });
        }

        for pk in self.source.primary_keys(table).await? {
            if let Some(column) = columns.iter_mut().find(|c| c.name.eq_ignore_ascii_case(&pk)) {
                column.primary_key = true;
            }
        }

        let schema = TableSchema {
            name: table.to_string(),
            columns,
        };

        debug!(
            "Introspected {} with {} columns ({} in primary key)",
            table,
            schema.columns.len(),
            schema.primary_key_positions().len()
        );

        Ok(schema)
    }

    /// Source tables of the given kinds, without internal objects, sorted
    pub async fn list_candidate_tables(&self, kinds: &[TableKind]) -> AppResult<Vec<String>> {
        let kinds = if kinds.is_empty() {
            &[TableKind::Table][..]
        } else {
            kinds
        };

        let mut tables: Vec<String> = self
            .source
            .list_tables(kinds)
            .await?
            .into_iter()
            .filter(|name| !name.contains(SYSTEM_OBJECT_MARKER))
            .collect();
        tables.sort();
        tables.dedup();
        Ok(tables)
    }

    /// Every cached schema, sorted by table name
    pub async fn schemas(&self) -> Vec<TableSchema> {
        let mut schemas: Vec<TableSchema> = self.cache.read().await.values().cloned().collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Forget the cached schema of `table`
    pub async fn invalidate(&self, table: &str) -> bool {
        let key = self.normalize(table).to_lowercase();
        self.cache.write().await.remove(&key).is_some()
    }

    /// Write cached schemas as a JSON table-definitions file
    pub async fn export_definitions(&self, path: impl AsRef<Path>) -> AppResult<usize> {
        let schemas = self.schemas().await;
        let json = serde_json::to_vec_pretty(&schemas)?;
        tokio::fs::write(path.as_ref(), json).await?;

        info!(
            "Wrote {} table definitions to {}",
            schemas.len(),
            path.as_ref().display()
        );
        Ok(schemas.len())
    }

    /// Seed the cache from a table-definitions file
    pub async fn load_definitions(&self, path: impl AsRef<Path>) -> AppResult<usize> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        let schemas: Vec<TableSchema> = serde_json::from_slice(&bytes)?;
        let count = schemas.len();

        let mut cache = self.cache.write().await;
        for schema in schemas {
            cache.insert(schema.name.to_lowercase(), schema);
        }

        info!(
            "Loaded {} table definitions from {}",
            count,
            path.as_ref().display()
        );
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SqliteSource;
    use pretty_assertions::assert_eq;

    fn source(sql: &str) -> Arc<dyn SourceDatabase> {
        let source = SqliteSource::in_memory().unwrap();
        source.execute_batch(sql).unwrap();
        Arc::new(source)
    }

    #[test]
    fn identifier_case_folds_names() {
        assert_eq!(IdentifierCase::UpperCase.apply("emp"), "EMP");
        assert_eq!(IdentifierCase::LowerCase.apply("Emp"), "emp");
        assert_eq!(IdentifierCase::Preserve.apply("Emp"), "Emp");
        assert_eq!("LOWER".parse::<IdentifierCase>().unwrap(), IdentifierCase::LowerCase);
    }

    #[tokio::test]
    async fn reads_columns_in_order_with_primary_key() {
        let source = source(
            "CREATE TABLE emp (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name VARCHAR(100),
                salary DECIMAL(10,2) NOT NULL,
                registered_at TIMESTAMP
            );",
        );
        let introspector = SchemaIntrospector::new(source, TypeMapper::default(), None)
            .await
            .unwrap();

        let schema = introspector.read_schema("emp").await.unwrap();
        assert_eq!(schema.column_names(), vec!["id", "name", "salary", "registered_at"]);
        assert_eq!(schema.primary_key_positions(), vec![0]);

        let id = &schema.columns[0];
        assert_eq!(id.column_type, CanonicalType::Integer);
        assert!(id.auto_increment);
        assert_eq!((id.precision, id.scale), (-1, -1));

        let name = &schema.columns[1];
        assert_eq!(name.column_type, CanonicalType::Varchar);
        assert_eq!(name.precision, 100);
        assert!(name.nullable);

        let salary = &schema.columns[2];
        assert_eq!(salary.column_type, CanonicalType::Decimal);
        assert_eq!((salary.precision, salary.scale), (10, 2));
        assert!(!salary.nullable);

        assert_eq!(schema.columns[3].column_type, CanonicalType::Timestamp);
    }

    #[tokio::test]
    async fn composite_primary_key_marks_every_member() {
        let source = source(
            "CREATE TABLE assignment (
                emp_id INTEGER NOT NULL,
                note TEXT,
                project_id INTEGER NOT NULL,
                PRIMARY KEY (project_id, emp_id)
            );",
        );
        let introspector = SchemaIntrospector::new(source, TypeMapper::default(), None)
            .await
            .unwrap();

        let schema = introspector.read_schema("assignment").await.unwrap();
        assert_eq!(schema.primary_key_positions(), vec![0, 2]);
    }

    #[tokio::test]
    async fn schema_is_cached_for_the_introspector_lifetime() {
        let sqlite = SqliteSource::in_memory().unwrap();
        sqlite
            .execute_batch("CREATE TABLE emp (id INTEGER PRIMARY KEY, name TEXT);")
            .unwrap();
        let sqlite = Arc::new(sqlite);
        let introspector = SchemaIntrospector::new(sqlite.clone(), TypeMapper::default(), None)
            .await
            .unwrap();

        let first = introspector.read_schema("emp").await.unwrap();
        sqlite.execute_batch("DROP TABLE emp;").unwrap();
        let second = introspector.read_schema("emp").await.unwrap();
        assert_eq!(first, second);

        assert!(introspector.invalidate("emp").await);
        assert!(matches!(
            introspector.read_schema("emp").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unknown_type_aborts_the_table() {
        let source = source("CREATE TABLE shapes (id INTEGER PRIMARY KEY, outline GEOMETRY);");
        let introspector = SchemaIntrospector::new(source, TypeMapper::default(), None)
            .await
            .unwrap();

        let err = introspector.read_schema("shapes").await.unwrap_err();
        assert!(matches!(err, AppError::UnknownType { ref column, .. } if column == "outline"));
        assert!(introspector.schemas().await.is_empty());
    }

    #[tokio::test]
    async fn vendor_named_floats_use_override_table() {
        let source = source("CREATE TABLE m (id INTEGER PRIMARY KEY, v BINARY_DOUBLE, w BINARY_FLOAT);");
        let introspector = SchemaIntrospector::new(source, TypeMapper::default(), None)
            .await
            .unwrap();

        let schema = introspector.read_schema("m").await.unwrap();
        assert_eq!(schema.columns[1].column_type, CanonicalType::Double);
        assert_eq!(schema.columns[2].column_type, CanonicalType::Real);
    }

    #[tokio::test]
    async fn candidates_skip_system_objects_and_are_sorted() {
        let source = source(
            "CREATE TABLE zeta (id INTEGER);
             CREATE TABLE alpha (id INTEGER);
             CREATE TABLE \"bin$abc\" (id INTEGER);
             CREATE VIEW alpha_view AS SELECT id FROM alpha;",
        );
        let introspector = SchemaIntrospector::new(source, TypeMapper::default(), None)
            .await
            .unwrap();

        let tables = introspector.list_candidate_tables(&[]).await.unwrap();
        assert_eq!(tables, vec!["alpha", "zeta"]);

        let views = introspector
            .list_candidate_tables(&[TableKind::View])
            .await
            .unwrap();
        assert_eq!(views, vec!["alpha_view"]);
    }

    #[tokio::test]
    async fn case_override_is_applied_to_names() {
        let source = source("CREATE TABLE EMP (ID INTEGER PRIMARY KEY);");
        let introspector = SchemaIntrospector::new(
            source,
            TypeMapper::default(),
            Some(IdentifierCase::UpperCase),
        )
        .await
        .unwrap();

        assert_eq!(introspector.normalize("emp"), "EMP");
        let schema = introspector.read_schema("emp").await.unwrap();
        assert_eq!(schema.name, "EMP");
    }

    #[tokio::test]
    async fn definitions_survive_export_and_load() {
        let source_db = source("CREATE TABLE emp (id INTEGER PRIMARY KEY, name TEXT);");
        let exporter = SchemaIntrospector::new(source_db, TypeMapper::default(), None)
            .await
            .unwrap();
        let schema = exporter.read_schema("emp").await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tabledefs.json");
        assert_eq!(exporter.export_definitions(&path).await.unwrap(), 1);

        // a source without the table: only the loaded definitions can answer
        let importer = SchemaIntrospector::new(
            Arc::new(SqliteSource::in_memory().unwrap()),
            TypeMapper::default(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(importer.load_definitions(&path).await.unwrap(), 1);
        assert_eq!(importer.read_schema("emp").await.unwrap(), schema);
    }
}

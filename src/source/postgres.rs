//! PostgreSQL source
//!
//! Metadata is read from `information_schema` and `pg_catalog`; rows are
//! streamed from one pooled connection with `query_raw`.

use super::{ColumnMetadata, RowStream, SourceDatabase, TableKind};
use crate::error::{AppError, AppResult};
use crate::introspection::{IdentifierCase, TableSchema};
use crate::snapshot::Value;
use crate::store::SqlBuilder;
use crate::type_mapper::SqlType;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use futures_util::StreamExt;
use tokio_postgres::Row;
use tracing::info;

/// Relations of the wanted kinds in one schema
const LIST_RELATIONS: &str = r#"
    SELECT c.relname::text AS name
    FROM pg_catalog.pg_class c
        JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE (n.nspname = $1 AND c.relkind::text = ANY($2))
        OR ($3 AND n.nspname = 'pg_catalog' AND c.relkind = 'r')
    ORDER BY name
"#;

/// Column metadata of a table, in ordinal order
const GET_COLUMNS: &str = r#"
    SELECT
        c.column_name::text AS name,
        c.udt_name::text AS type_name,
        c.data_type::text AS data_type,
        COALESCE(c.character_maximum_length, c.numeric_precision, 0)::int4 AS column_size,
        COALESCE(c.numeric_scale, -1)::int4 AS decimal_digits,
        c.is_nullable = 'YES' AS nullable,
        (COALESCE(c.column_default, '') LIKE 'nextval(%' OR c.is_identity = 'YES') AS auto_increment
    FROM information_schema.columns c
    WHERE c.table_schema = $1
        AND c.table_name = $2
    ORDER BY c.ordinal_position
"#;

/// Primary key columns of a table
const GET_PRIMARY_KEYS: &str = r#"
    SELECT kcu.column_name::text
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
        ON tc.constraint_name = kcu.constraint_name
        AND tc.table_schema = kcu.table_schema
    WHERE tc.constraint_type = 'PRIMARY KEY'
        AND tc.table_schema = $1
        AND tc.table_name = $2
    ORDER BY kcu.ordinal_position
"#;

/// How one column is read off a result row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Accessor {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Text,
    Bytes,
    Date,
    Timestamp,
    TimestampTz,
    Uuid,
    Json,
    /// No native reader: selected as `::text`
    Cast,
}

impl Accessor {
    fn for_type(udt_name: &str) -> Self {
        match udt_name.to_ascii_lowercase().as_str() {
            "bool" => Accessor::Bool,
            "int2" => Accessor::Int2,
            "int4" => Accessor::Int4,
            "int8" => Accessor::Int8,
            "float4" => Accessor::Float4,
            "float8" => Accessor::Float8,
            "text" | "varchar" | "bpchar" | "name" => Accessor::Text,
            "bytea" => Accessor::Bytes,
            "date" => Accessor::Date,
            "timestamp" => Accessor::Timestamp,
            "timestamptz" => Accessor::TimestampTz,
            "uuid" => Accessor::Uuid,
            "json" | "jsonb" => Accessor::Json,
            _ => Accessor::Cast,
        }
    }

    fn select_expr(self, column: &str) -> String {
        let ident = SqlBuilder::quote_ident(column);
        match self {
            Accessor::Cast => format!("{}::text", ident),
            _ => ident,
        }
    }

    fn read(self, row: &Row, idx: usize) -> Result<Value, tokio_postgres::Error> {
        let value: Value = match self {
            Accessor::Bool => row.try_get::<_, Option<bool>>(idx)?.into(),
            Accessor::Int2 => row.try_get::<_, Option<i16>>(idx)?.into(),
            Accessor::Int4 => row.try_get::<_, Option<i32>>(idx)?.into(),
            Accessor::Int8 => row.try_get::<_, Option<i64>>(idx)?.into(),
            Accessor::Float4 => row.try_get::<_, Option<f32>>(idx)?.into(),
            Accessor::Float8 => row.try_get::<_, Option<f64>>(idx)?.into(),
            Accessor::Text | Accessor::Cast => row.try_get::<_, Option<String>>(idx)?.into(),
            Accessor::Bytes => row.try_get::<_, Option<Vec<u8>>>(idx)?.into(),
            Accessor::Date => row
                .try_get::<_, Option<NaiveDate>>(idx)?
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .into(),
            Accessor::Timestamp => row.try_get::<_, Option<NaiveDateTime>>(idx)?.into(),
            Accessor::TimestampTz => row
                .try_get::<_, Option<DateTime<Utc>>>(idx)?
                .map(|ts| ts.naive_utc())
                .into(),
            Accessor::Uuid => row
                .try_get::<_, Option<uuid::Uuid>>(idx)?
                .map(|u| u.to_string())
                .into(),
            Accessor::Json => row
                .try_get::<_, Option<serde_json::Value>>(idx)?
                .map(|v| v.to_string())
                .into(),
        };
        Ok(value)
    }
}

/// Standard type of a Postgres column, from its udt name
fn sql_type_for(udt_name: &str, data_type: &str) -> SqlType {
    if data_type.eq_ignore_ascii_case("ARRAY") {
        return SqlType::Array;
    }
    match udt_name.to_ascii_lowercase().as_str() {
        "bool" => SqlType::Boolean,
        "int2" => SqlType::SmallInt,
        "int4" => SqlType::Integer,
        "int8" => SqlType::BigInt,
        "float4" => SqlType::Real,
        "float8" => SqlType::Double,
        "numeric" => SqlType::Numeric,
        "bpchar" => SqlType::Char,
        "varchar" | "text" => SqlType::Varchar,
        "bytea" => SqlType::Binary,
        "date" => SqlType::Date,
        "time" => SqlType::Time,
        "timetz" => SqlType::TimeWithTimezone,
        "timestamp" => SqlType::Timestamp,
        "timestamptz" => SqlType::TimestampWithTimezone,
        _ => SqlType::Other,
    }
}

fn relkinds(kinds: &[TableKind]) -> Vec<String> {
    kinds
        .iter()
        .flat_map(|kind| match kind {
            TableKind::Table => &["r", "p"][..],
            TableKind::View => &["v"][..],
            TableKind::MaterializedView => &["m"][..],
            TableKind::ForeignTable => &["f"][..],
            TableKind::SystemTable => &[][..],
        })
        .map(|k| k.to_string())
        .collect()
}

/// Source backed by a PostgreSQL connection pool
#[derive(Clone)]
pub struct PostgresSource {
    pool: Pool,
    schema: String,
}

impl PostgresSource {
    pub fn from_pool(pool: Pool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    /// Build a pool from a connection URL and verify it with one query.
    ///
    /// TLS is used when the URL asks for `sslmode=require` or points at a
    /// host that only accepts TLS.
    pub async fn connect(url: &str, schema: &str, max_connections: usize) -> AppResult<Self> {
        let config = url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| AppError::Config(format!("Failed to parse SOURCE_URL: {}", e)))?;

        let host = match config.get_hosts().first() {
            Some(tokio_postgres::config::Host::Tcp(host)) => host.clone(),
            Some(tokio_postgres::config::Host::Unix(_)) => {
                return Err(AppError::Config(
                    "Unix socket connections are not supported".to_string(),
                ));
            }
            None => return Err(AppError::Config("No host in SOURCE_URL".to_string())),
        };
        let port = config.get_ports().first().copied().unwrap_or(5432);
        let user = config
            .get_user()
            .map(|u| u.to_string())
            .ok_or_else(|| AppError::Config("No user in SOURCE_URL".to_string()))?;
        let password = config
            .get_password()
            .map(|p| String::from_utf8_lossy(p).to_string())
            .unwrap_or_default();
        let dbname = config
            .get_dbname()
            .map(|db| db.to_string())
            .ok_or_else(|| AppError::Config("No database name in SOURCE_URL".to_string()))?;

        let use_tls = host.contains("neon.tech") || url.contains("sslmode=require");

        let mut cfg = Config::new();
        cfg.host = Some(host);
        cfg.port = Some(port);
        cfg.user = Some(user);
        cfg.password = Some(password);
        cfg.dbname = Some(dbname);
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(max_connections));

        let pool = if use_tls {
            let certs = rustls_native_certs::load_native_certs();
            let mut root_store = rustls::RootCertStore::empty();
            for cert in certs.certs {
                root_store.add(cert).ok();
            }
            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();
            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
            cfg.create_pool(Some(Runtime::Tokio1), tls)
        } else {
            cfg.create_pool(Some(Runtime::Tokio1), tokio_postgres::NoTls)
        };
        let pool = pool.map_err(|e| AppError::Config(format!("Failed to create pool: {}", e)))?;

        let client = pool.get().await?;
        client.query_one("SELECT 1", &[]).await?;

        info!("Connected to source database (TLS: {}, schema: {})", use_tls, schema);
        Ok(Self::from_pool(pool, schema))
    }
}

#[async_trait]
impl SourceDatabase for PostgresSource {
    fn dialect(&self) -> &'static str {
        "postgres"
    }

    async fn identifier_case(&self) -> AppResult<IdentifierCase> {
        // unquoted identifiers fold to lower case
        Ok(IdentifierCase::LowerCase)
    }

    async fn list_tables(&self, kinds: &[TableKind]) -> AppResult<Vec<String>> {
        let client = self.pool.get().await?;
        let include_system = kinds.contains(&TableKind::SystemTable);
        let rows = client
            .query(LIST_RELATIONS, &[&self.schema, &relkinds(kinds), &include_system])
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn columns(&self, table: &str) -> AppResult<Vec<ColumnMetadata>> {
        let client = self.pool.get().await?;
        let rows = client.query(GET_COLUMNS, &[&self.schema, &table]).await?;

        let columns = rows
            .iter()
            .map(|row| {
                let type_name: String = row.get("type_name");
                let data_type: String = row.get("data_type");
                ColumnMetadata {
                    name: row.get("name"),
                    sql_type: sql_type_for(&type_name, &data_type),
                    type_name,
                    column_size: row.get("column_size"),
                    decimal_digits: row.get("decimal_digits"),
                    nullable: row.get("nullable"),
                    auto_increment: row.get("auto_increment"),
                }
            })
            .collect();
        Ok(columns)
    }

    async fn primary_keys(&self, table: &str) -> AppResult<Vec<String>> {
        let client = self.pool.get().await?;
        let rows = client.query(GET_PRIMARY_KEYS, &[&self.schema, &table]).await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn scan(&self, table: &str, schema: &TableSchema) -> AppResult<RowStream> {
        let accessors: Vec<Accessor> = schema
            .columns
            .iter()
            .map(|c| Accessor::for_type(&c.source_type))
            .collect();
        let exprs: Vec<String> = schema
            .columns
            .iter()
            .zip(&accessors)
            .map(|(c, accessor)| accessor.select_expr(&c.name))
            .collect();
        let sql = format!(
            "SELECT {} FROM {}.{}",
            exprs.join(", "),
            SqlBuilder::quote_ident(&self.schema),
            SqlBuilder::quote_ident(table)
        );

        let client = self.pool.get().await?;
        let rows = client.query_raw(sql.as_str(), Vec::<String>::new()).await?;

        // the stream owns the pooled client so the connection stays checked
        // out until the cursor is dropped
        let stream = rows.map(move |row| {
            let _held = &client;
            let row = row?;
            accessors
                .iter()
                .enumerate()
                .map(|(idx, accessor)| accessor.read(&row, idx).map_err(AppError::from))
                .collect::<AppResult<Vec<Value>>>()
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_follow_udt_names() {
        assert_eq!(Accessor::for_type("int4"), Accessor::Int4);
        assert_eq!(Accessor::for_type("BPCHAR"), Accessor::Text);
        assert_eq!(Accessor::for_type("timestamptz"), Accessor::TimestampTz);
        assert_eq!(Accessor::for_type("numeric"), Accessor::Cast);
        assert_eq!(Accessor::for_type("interval"), Accessor::Cast);
    }

    #[test]
    fn cast_columns_are_selected_as_text() {
        assert_eq!(Accessor::Cast.select_expr("amount"), "\"amount\"::text");
        assert_eq!(Accessor::Int8.select_expr("id"), "\"id\"");
    }

    #[test]
    fn udt_names_map_to_standard_types() {
        assert_eq!(sql_type_for("int8", "bigint"), SqlType::BigInt);
        assert_eq!(sql_type_for("text", "text"), SqlType::Varchar);
        assert_eq!(sql_type_for("uuid", "uuid"), SqlType::Other);
        assert_eq!(sql_type_for("_int4", "ARRAY"), SqlType::Array);
    }

    #[test]
    fn table_kinds_map_to_relkinds() {
        assert_eq!(relkinds(&[TableKind::Table]), vec!["r", "p"]);
        assert_eq!(
            relkinds(&[TableKind::View, TableKind::SystemTable]),
            vec!["v"]
        );
    }
}

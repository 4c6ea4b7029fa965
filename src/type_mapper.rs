//! Type Mapper
//!
//! Translates the column types a source reports into the canonical types the
//! local snapshot store understands. Resolution order:
//! 1. the standard SQL type code,
//! 2. the vendor type name against the named-type catalog,
//! 3. the injected override table for vendor idioms.

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Standard SQL type codes, numbered as JDBC numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SqlType {
    Bit,
    Boolean,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Float,
    Real,
    Double,
    Numeric,
    Decimal,
    Char,
    Varchar,
    LongVarchar,
    NChar,
    NVarchar,
    LongNVarchar,
    Clob,
    NClob,
    Binary,
    Varbinary,
    LongVarbinary,
    Blob,
    Date,
    Time,
    TimeWithTimezone,
    Timestamp,
    TimestampWithTimezone,
    Array,
    Struct,
    Null,
    /// Vendor specific; resolved by type name.
    Other,
}

impl SqlType {
    /// Numeric code of this type (`java.sql.Types` numbering).
    pub fn code(self) -> i32 {
        match self {
            SqlType::Bit => -7,
            SqlType::Boolean => 16,
            SqlType::TinyInt => -6,
            SqlType::SmallInt => 5,
            SqlType::Integer => 4,
            SqlType::BigInt => -5,
            SqlType::Float => 6,
            SqlType::Real => 7,
            SqlType::Double => 8,
            SqlType::Numeric => 2,
            SqlType::Decimal => 3,
            SqlType::Char => 1,
            SqlType::Varchar => 12,
            SqlType::LongVarchar => -1,
            SqlType::NChar => -15,
            SqlType::NVarchar => -9,
            SqlType::LongNVarchar => -16,
            SqlType::Clob => 2005,
            SqlType::NClob => 2011,
            SqlType::Binary => -2,
            SqlType::Varbinary => -3,
            SqlType::LongVarbinary => -4,
            SqlType::Blob => 2004,
            SqlType::Date => 91,
            SqlType::Time => 92,
            SqlType::TimeWithTimezone => 2013,
            SqlType::Timestamp => 93,
            SqlType::TimestampWithTimezone => 2014,
            SqlType::Array => 2003,
            SqlType::Struct => 2002,
            SqlType::Null => 0,
            SqlType::Other => 1111,
        }
    }
}

/// Canonical logical type of a snapshot column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CanonicalType {
    Boolean,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Decimal,
    Real,
    Double,
    Char,
    Varchar,
    Clob,
    Blob,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Uuid,
    Json,
}

impl CanonicalType {
    /// Type name used in the local store's `CREATE TABLE`.
    ///
    /// `precision` and `scale` are the normalized values, `-1` meaning
    /// "not applicable".
    pub fn ddl(self, precision: i32, scale: i32) -> String {
        match self {
            CanonicalType::Boolean => "BOOLEAN".to_string(),
            CanonicalType::TinyInt => "TINYINT".to_string(),
            CanonicalType::SmallInt => "SMALLINT".to_string(),
            CanonicalType::Integer => "INTEGER".to_string(),
            CanonicalType::BigInt => "BIGINT".to_string(),
            CanonicalType::Decimal => match (precision > 0, scale >= 0) {
                (true, true) => format!("DECIMAL({}, {})", precision, scale),
                (true, false) => format!("DECIMAL({})", precision),
                _ => "DECIMAL".to_string(),
            },
            CanonicalType::Real => "REAL".to_string(),
            CanonicalType::Double => "DOUBLE".to_string(),
            CanonicalType::Char if precision > 0 => format!("CHAR({})", precision),
            CanonicalType::Char => "CHAR".to_string(),
            CanonicalType::Varchar if precision > 0 => format!("VARCHAR({})", precision),
            CanonicalType::Varchar => "VARCHAR".to_string(),
            CanonicalType::Clob => "CLOB".to_string(),
            CanonicalType::Blob => "BLOB".to_string(),
            CanonicalType::Date => "DATE".to_string(),
            CanonicalType::Time => "TIME".to_string(),
            CanonicalType::Timestamp => "TIMESTAMP".to_string(),
            CanonicalType::TimestampTz => "TIMESTAMP WITH TIME ZONE".to_string(),
            CanonicalType::Uuid => "UUID".to_string(),
            CanonicalType::Json => "JSON".to_string(),
        }
    }

    pub fn is_temporal(self) -> bool {
        matches!(
            self,
            CanonicalType::Date | CanonicalType::Timestamp | CanonicalType::TimestampTz
        )
    }

    pub fn is_integral(self) -> bool {
        matches!(
            self,
            CanonicalType::TinyInt
                | CanonicalType::SmallInt
                | CanonicalType::Integer
                | CanonicalType::BigInt
        )
    }

    /// Resolve a type through the named-type catalog.
    pub fn from_name(name: &str) -> Option<Self> {
        let base = name.trim().to_ascii_uppercase();
        let canonical = match base.as_str() {
            "BOOL" | "BOOLEAN" | "BIT" => CanonicalType::Boolean,
            "TINYINT" => CanonicalType::TinyInt,
            "INT2" | "SMALLINT" => CanonicalType::SmallInt,
            "INT" | "INT4" | "INTEGER" | "MEDIUMINT" => CanonicalType::Integer,
            "INT8" | "BIGINT" => CanonicalType::BigInt,
            "NUMERIC" | "DECIMAL" | "NUMBER" | "MONEY" => CanonicalType::Decimal,
            "FLOAT4" | "REAL" => CanonicalType::Real,
            "FLOAT8" | "FLOAT" | "DOUBLE" | "DOUBLE PRECISION" => CanonicalType::Double,
            "CHAR" | "BPCHAR" | "NCHAR" | "CHARACTER" => CanonicalType::Char,
            "VARCHAR" | "VARCHAR2" | "NVARCHAR" | "NVARCHAR2" | "CHARACTER VARYING"
            | "TEXT" | "CITEXT" | "NAME" | "INET" | "CIDR" | "MACADDR" | "INTERVAL" => {
                CanonicalType::Varchar
            }
            "CLOB" | "NCLOB" | "XML" | "LONGTEXT" => CanonicalType::Clob,
            "BLOB" | "BYTEA" | "BINARY" | "VARBINARY" | "LONGBLOB" => CanonicalType::Blob,
            "DATE" => CanonicalType::Date,
            "TIME" | "TIMETZ" => CanonicalType::Time,
            "TIMESTAMP" | "DATETIME" => CanonicalType::Timestamp,
            "TIMESTAMPTZ" => CanonicalType::TimestampTz,
            "UUID" | "UNIQUEIDENTIFIER" => CanonicalType::Uuid,
            "JSON" | "JSONB" => CanonicalType::Json,
            _ => return None,
        };
        Some(canonical)
    }
}

impl fmt::Display for CanonicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ddl(-1, -1))
    }
}

impl FromStr for CanonicalType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CanonicalType::from_name(s)
            .ok_or_else(|| AppError::Config(format!("Unknown canonical type: {}", s)))
    }
}

/// Maps source column types onto canonical types
#[derive(Debug, Clone)]
pub struct TypeMapper {
    /// Upper-cased vendor type name -> canonical type
    overrides: HashMap<String, CanonicalType>,
}

impl TypeMapper {
    pub fn new(overrides: HashMap<String, CanonicalType>) -> Self {
        let overrides = overrides
            .into_iter()
            .map(|(name, ty)| (name.to_ascii_uppercase(), ty))
            .collect();
        Self { overrides }
    }

    /// Default vendor idioms: floating types reported by name only.
    pub fn default_overrides() -> HashMap<String, CanonicalType> {
        HashMap::from([
            ("BINARY_DOUBLE".to_string(), CanonicalType::Double),
            ("BINARY_FLOAT".to_string(), CanonicalType::Real),
        ])
    }

    /// Resolve the canonical type of `table.column`.
    pub fn map_type(
        &self,
        table: &str,
        column: &str,
        sql_type: SqlType,
        type_name: &str,
    ) -> AppResult<CanonicalType> {
        let by_code = match sql_type {
            SqlType::Other => None,
            standard => Self::from_standard(standard),
        };

        by_code
            .or_else(|| CanonicalType::from_name(type_name))
            .or_else(|| self.overrides.get(&type_name.to_ascii_uppercase()).copied())
            .ok_or_else(|| AppError::UnknownType {
                table: table.to_string(),
                column: column.to_string(),
                code: sql_type.code(),
                type_name: type_name.to_string(),
            })
    }

    fn from_standard(sql_type: SqlType) -> Option<CanonicalType> {
        let canonical = match sql_type {
            SqlType::Bit | SqlType::Boolean => CanonicalType::Boolean,
            SqlType::TinyInt => CanonicalType::TinyInt,
            SqlType::SmallInt => CanonicalType::SmallInt,
            SqlType::Integer => CanonicalType::Integer,
            SqlType::BigInt => CanonicalType::BigInt,
            SqlType::Real => CanonicalType::Real,
            SqlType::Float | SqlType::Double => CanonicalType::Double,
            SqlType::Numeric | SqlType::Decimal => CanonicalType::Decimal,
            SqlType::Char | SqlType::NChar => CanonicalType::Char,
            SqlType::Varchar | SqlType::NVarchar => CanonicalType::Varchar,
            SqlType::LongVarchar
            | SqlType::LongNVarchar
            | SqlType::Clob
            | SqlType::NClob => CanonicalType::Clob,
            SqlType::Binary
            | SqlType::Varbinary
            | SqlType::LongVarbinary
            | SqlType::Blob => CanonicalType::Blob,
            SqlType::Date => CanonicalType::Date,
            SqlType::Time | SqlType::TimeWithTimezone => CanonicalType::Time,
            SqlType::Timestamp => CanonicalType::Timestamp,
            SqlType::TimestampWithTimezone => CanonicalType::TimestampTz,
            SqlType::Array | SqlType::Struct | SqlType::Null | SqlType::Other => return None,
        };
        Some(canonical)
    }
}

impl Default for TypeMapper {
    fn default() -> Self {
        Self::new(Self::default_overrides())
    }
}

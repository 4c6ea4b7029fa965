//! Source table route handlers

use crate::error::AppResult;
use crate::models::{ListTablesQuery, SchemaData, SuccessResponse, TableListData};
use crate::source::TableKind;
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use tracing::debug;

/// Parse a comma separated `kind` parameter
fn parse_kinds(raw: Option<&str>) -> AppResult<Vec<TableKind>> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::parse::<TableKind>)
        .collect()
}

/// List candidate tables of the source
pub async fn list_tables(
    State(state): State<SharedState>,
    Query(query): Query<ListTablesQuery>,
) -> AppResult<Json<SuccessResponse<TableListData>>> {
    let kinds = parse_kinds(query.kind.as_deref())?;
    let tables = state.engine.list_candidates(&kinds).await?;
    debug!("Listed {} tables", tables.len());

    Ok(Json(SuccessResponse::with_data(
        format!("Found {} tables", tables.len()),
        TableListData { tables },
    )))
}

/// Introspected schema of one table
pub async fn get_schema(
    State(state): State<SharedState>,
    Path(table): Path<String>,
) -> AppResult<Json<SuccessResponse<SchemaData>>> {
    let schema = state.engine.schema(&table).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("{} has {} columns", schema.name, schema.columns.len()),
        SchemaData { schema },
    )))
}

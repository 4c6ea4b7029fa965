//! Data models and DTOs (Data Transfer Objects)
//!
//! Request/response structures used by the HTTP API.

use crate::introspection::TableSchema;
use crate::snapshot::{VersionId, VersionRecord};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Generic success response
#[derive(Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub data: Option<T>,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn with_data(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Request to capture tables
#[derive(Debug, Deserialize, Validate)]
pub struct TakeSnapshotRequest {
    #[validate(length(min = 1, message = "At least one table is required"))]
    pub tables: Vec<String>,
}

/// Request to drop old snapshot tables
#[derive(Debug, Deserialize, Validate)]
pub struct PruneRequest {
    #[validate(range(min = 1, message = "keep must be at least 1"))]
    pub keep: usize,
}

/// `?kind=table,view`
#[derive(Debug, Default, Deserialize)]
pub struct ListTablesQuery {
    pub kind: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TableListData {
    pub tables: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SchemaData {
    pub schema: TableSchema,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TakeSnapshotData {
    pub version_id: VersionId,
    pub tables: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct VersionListData {
    pub versions: Vec<VersionRecord>,
}

#[derive(Debug, Serialize)]
pub struct PruneData {
    pub dropped: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ClearData {
    pub dropped: usize,
}

//! Row Diff Engine
//!
//! Compares the two newest snapshots of a table. Rows are first split with
//! set differences in both directions, then rows that left and rows that
//! arrived are paired up by primary key into modifications.

use super::value::render;
use super::versions::{snapshot_table, VersionStore};
use crate::error::AppResult;
use crate::introspection::TableSchema;
use crate::store::{LocalStore, SqlBuilder};
use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One row read back from a snapshot, values rendered as text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    values: Vec<Option<String>>,
    pk_positions: Arc<[usize]>,
}

impl Row {
    pub fn new(values: Vec<Option<String>>, pk_positions: Arc<[usize]>) -> Self {
        Self {
            values,
            pk_positions,
        }
    }

    pub fn values(&self) -> &[Option<String>] {
        &self.values
    }

    /// Whether both rows identify the same record.
    ///
    /// Without a primary key no two rows are the same. A null key value
    /// matches nothing.
    pub fn same(&self, other: &Row) -> bool {
        if self.pk_positions.is_empty() {
            return false;
        }
        self.pk_positions.iter().all(|&i| {
            match (self.values.get(i), other.values.get(i)) {
                (Some(Some(a)), Some(Some(b))) => a == b,
                _ => false,
            }
        })
    }

    /// Cells going from `self` (previous) to `current`
    pub fn diff(&self, current: &Row) -> Vec<DiffCell> {
        self.values
            .iter()
            .zip(&current.values)
            .map(|(old, new)| {
                if old == new {
                    DiffCell::Unchanged(old.clone())
                } else {
                    DiffCell::Changed(old.clone(), new.clone())
                }
            })
            .collect()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.values.len()))?;
        for value in &self.values {
            seq.serialize_element(value)?;
        }
        seq.end()
    }
}

/// One column of a modified row
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(untagged)]
pub enum DiffCell {
    /// Same value in both versions, null included
    Unchanged(Option<String>),
    /// `(old, new)`; either side may be null
    Changed(Option<String>, Option<String>),
}

/// Changes between two snapshots of one table
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Diff {
    pub headers: Vec<String>,
    pub add: Vec<Row>,
    pub modify: Vec<Vec<DiffCell>>,
    pub delete: Vec<Row>,
}

impl Diff {
    /// A diff that observed no changes
    pub fn empty(headers: Vec<String>) -> Self {
        Self {
            headers,
            add: Vec::new(),
            modify: Vec::new(),
            delete: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.modify.is_empty() && self.delete.is_empty()
    }

    /// Pair rows that disappeared with rows that appeared.
    ///
    /// Every row only in the current snapshot starts as an add. Each row only
    /// in the previous snapshot takes the first add with the same key and
    /// becomes a modification, or is a delete when none matches.
    pub fn reconcile(
        headers: Vec<String>,
        only_in_current: Vec<Row>,
        only_in_previous: Vec<Row>,
    ) -> Self {
        let mut diff = Self::empty(headers);
        diff.add = only_in_current;

        for prev in only_in_previous {
            match diff.add.iter().position(|added| added.same(&prev)) {
                Some(idx) => {
                    let added = diff.add.remove(idx);
                    diff.modify.push(prev.diff(&added));
                }
                None => diff.delete.push(prev),
            }
        }
        diff
    }
}

/// Reads snapshots back from the local store and diffs them
#[derive(Clone)]
pub struct DiffEngine {
    store: LocalStore,
    versions: VersionStore,
}

impl DiffEngine {
    pub fn new(store: LocalStore, versions: VersionStore) -> Self {
        Self { store, versions }
    }

    /// Diff the current snapshot of `schema.name` against the previous one
    pub async fn diff_from_previous(&self, schema: &TableSchema) -> AppResult<Diff> {
        let table = schema.name.as_str();
        let current = self.versions.current_version(table).await?;
        let previous = self.versions.previous_version(table).await?;
        let headers = schema.column_names();

        let current_table = snapshot_table(table, current);
        let previous_table = snapshot_table(table, previous);

        for name in [&previous_table, &current_table] {
            if !self.store.table_exists(name).await? {
                warn!(
                    "Snapshot table {} is gone; reporting no changes for {}",
                    name, table
                );
                return Ok(Diff::empty(headers));
            }
        }

        let added_sql = SqlBuilder::except(&current_table, &previous_table, &headers);
        let removed_sql = SqlBuilder::except(&previous_table, &current_table, &headers);
        debug!("Diff queries: {} / {}", added_sql, removed_sql);

        let (added, removed) = self
            .store
            .call(move |conn| {
                let added = read_rows(conn, &added_sql)?;
                let removed = read_rows(conn, &removed_sql)?;
                Ok((added, removed))
            })
            .await?;

        let pk: Arc<[usize]> = schema.primary_key_positions().into();
        let to_rows = |raw: Vec<Vec<Option<String>>>| -> Vec<Row> {
            raw.into_iter()
                .map(|values| Row::new(values, Arc::clone(&pk)))
                .collect()
        };

        let diff = Diff::reconcile(headers, to_rows(added), to_rows(removed));
        info!(
            "Diff of {} ({} -> {}): {} added, {} modified, {} deleted",
            table,
            previous,
            current,
            diff.add.len(),
            diff.modify.len(),
            diff.delete.len()
        );
        Ok(diff)
    }
}

fn read_rows(conn: &rusqlite::Connection, sql: &str) -> AppResult<Vec<Vec<Option<String>>>> {
    let mut stmt = conn.prepare(sql)?;
    let width = stmt.column_count();
    let mut rows = stmt.query([])?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(render(row.get_ref(i)?));
        }
        out.push(values);
    }
    Ok(out)
}

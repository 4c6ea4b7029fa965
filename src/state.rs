//! Application state management
//!
//! Contains shared state accessible across all handlers and CLI commands.

use crate::config::Settings;
use crate::error::AppResult;
use crate::snapshot::SnapshotEngine;
use crate::source::{PostgresSource, SourceDatabase, SourceKind, SqliteSource};
use crate::store::LocalStore;
use std::sync::Arc;
use tracing::info;

/// Application state shared across all handlers
pub struct AppState {
    pub engine: SnapshotEngine,
}

impl AppState {
    pub fn new(engine: SnapshotEngine) -> Self {
        Self { engine }
    }

    /// Connect the source, open the local store and build the engine
    pub async fn from_settings(settings: &Settings) -> AppResult<Self> {
        let source = connect_source(settings).await?;
        let store = LocalStore::open(&settings.store.path)?;
        info!("Local store: {}", settings.store.path.display());

        let engine = SnapshotEngine::new(source, store, settings.snapshot.clone()).await?;
        if let Some(path) = &settings.store.table_definitions {
            engine.introspector().load_definitions(path).await?;
        }

        Ok(Self::new(engine))
    }
}

async fn connect_source(settings: &Settings) -> AppResult<Arc<dyn SourceDatabase>> {
    let source: Arc<dyn SourceDatabase> = match SourceKind::from_url(&settings.source.url)? {
        SourceKind::Postgres(url) => Arc::new(
            PostgresSource::connect(
                &url,
                &settings.source.schema,
                settings.source.max_connections,
            )
            .await?,
        ),
        SourceKind::Sqlite(path) if path == ":memory:" => Arc::new(SqliteSource::in_memory()?),
        SourceKind::Sqlite(path) => Arc::new(SqliteSource::open(path)?),
    };
    info!("Source dialect: {}", source.dialect());
    Ok(source)
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;

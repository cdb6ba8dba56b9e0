//! MBTiles archive inspection through SQLite

use super::{ArchiveInspector, ArchiveSnapshot};
use crate::error::ValidationError;
use crate::types::{ArchiveLayout, ArchiveStats};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

/// Reads MBTiles archives with a read-only SQLite connection
#[derive(Clone, Debug)]
pub struct SqliteInspector {
    busy_timeout: Duration,
}

impl Default for SqliteInspector {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(30),
        }
    }
}

impl SqliteInspector {
    /// Inspector waiting up to 30 seconds on a locked archive
    pub fn new() -> Self {
        Self::default()
    }

    /// How long to wait for a lock held by a writer
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

#[async_trait]
impl ArchiveInspector for SqliteInspector {
    async fn inspect(&self, path: &Path) -> Result<ArchiveSnapshot, ValidationError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .create_if_missing(false)
            .busy_timeout(self.busy_timeout);

        let mut conn = options
            .connect()
            .await
            .map_err(|e| classify_sqlx(path, e))?;

        let snapshot = read_snapshot(&mut conn, path).await;

        if let Err(e) = conn.close().await {
            tracing::debug!(path = %path.display(), error = %e, "Failed to close archive connection");
        }
        snapshot
    }
}

async fn read_snapshot(
    conn: &mut SqliteConnection,
    path: &Path,
) -> Result<ArchiveSnapshot, ValidationError> {
    let err = |e| classify_sqlx(path, e);

    let integrity: Vec<String> = sqlx::query_scalar("PRAGMA integrity_check")
        .fetch_all(&mut *conn)
        .await
        .map_err(err)?;
    if integrity.first().map(String::as_str) != Some("ok") {
        return Err(ValidationError::Corrupt {
            path: path.to_path_buf(),
            detail: integrity.join("; "),
        });
    }

    let tables: BTreeSet<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
            .fetch_all(&mut *conn)
            .await
            .map_err(err)?
            .into_iter()
            .collect();
    tracing::debug!(path = %path.display(), tables = ?tables, "Archive tables");

    let mut metadata = BTreeMap::new();
    if tables.contains("metadata") {
        let rows: Vec<(String, Option<String>)> =
            sqlx::query_as("SELECT name, value FROM metadata")
                .fetch_all(&mut *conn)
                .await
                .map_err(err)?;
        for (name, value) in rows {
            if let Some(value) = value {
                metadata.insert(name, value);
            }
        }
    }

    // A `tiles` view over `map`+`images` is not listed as a table
    let layout = if tables.contains("tiles") {
        Some(ArchiveLayout::Tiles)
    } else if tables.contains("map") && tables.contains("images") {
        Some(ArchiveLayout::MapImages)
    } else {
        None
    };

    let mut snapshot = ArchiveSnapshot {
        tables,
        metadata,
        layout,
        ..ArchiveSnapshot::default()
    };
    let Some(layout) = layout else {
        return Ok(snapshot);
    };

    let (index_table, data_table) = match layout {
        ArchiveLayout::Tiles => ("tiles", "tiles"),
        ArchiveLayout::MapImages => ("map", "images"),
    };

    let count_sql = format!("SELECT COUNT(*) FROM {index_table}");
    let tile_count: i64 = sqlx::query_scalar(&count_sql)
        .fetch_one(&mut *conn)
        .await
        .map_err(err)?;
    snapshot.tile_count = u64::try_from(tile_count).unwrap_or(0);

    let zoom_sql = format!("SELECT MIN(zoom_level), MAX(zoom_level) FROM {index_table}");
    let (min_zoom, max_zoom): (Option<i64>, Option<i64>) = sqlx::query_as(&zoom_sql)
        .fetch_one(&mut *conn)
        .await
        .map_err(err)?;
    snapshot.zoom_range = match (min_zoom, max_zoom) {
        (Some(min), Some(max)) => u8::try_from(min).ok().zip(u8::try_from(max).ok()),
        _ => None,
    };

    let per_zoom_sql = format!(
        "SELECT zoom_level, COUNT(*) FROM {index_table} GROUP BY zoom_level ORDER BY zoom_level"
    );
    let per_zoom: Vec<(i64, i64)> = sqlx::query_as(&per_zoom_sql)
        .fetch_all(&mut *conn)
        .await
        .map_err(err)?;

    let sample_sql = format!("SELECT tile_data FROM {data_table} LIMIT 1");
    let sample: Option<Option<Vec<u8>>> = sqlx::query_scalar(&sample_sql)
        .fetch_optional(&mut *conn)
        .await
        .map_err(err)?;
    snapshot.sample_bytes = sample.flatten().map(|data| data.len() as u64);

    let size_sql = format!(
        "SELECT AVG(LENGTH(tile_data)), MIN(LENGTH(tile_data)), MAX(LENGTH(tile_data)) FROM {data_table}"
    );
    let (avg, min, max): (Option<f64>, Option<i64>, Option<i64>) = sqlx::query_as(&size_sql)
        .fetch_one(&mut *conn)
        .await
        .map_err(err)?;

    snapshot.stats = ArchiveStats {
        avg_tile_bytes: avg.unwrap_or(0.0),
        min_tile_bytes: min.and_then(|v| u64::try_from(v).ok()).unwrap_or(0),
        max_tile_bytes: max.and_then(|v| u64::try_from(v).ok()).unwrap_or(0),
        tiles_per_zoom: per_zoom
            .into_iter()
            .filter_map(|(zoom, count)| {
                Some((u8::try_from(zoom).ok()?, u64::try_from(count).ok()?))
            })
            .collect(),
    };

    Ok(snapshot)
}

/// Corruption is terminal; anything else (locks, half-written files) may clear up
fn classify_sqlx(path: &Path, error: sqlx::Error) -> ValidationError {
    if let sqlx::Error::Database(db) = &error {
        let message = db.message().to_lowercase();
        // SQLITE_CORRUPT = 11, SQLITE_NOTADB = 26
        let corrupt_code = matches!(db.code().as_deref(), Some("11") | Some("26"));
        if corrupt_code || message.contains("not a database") || message.contains("malformed") {
            return ValidationError::Corrupt {
                path: path.to_path_buf(),
                detail: db.message().to_string(),
            };
        }
    }
    ValidationError::Unavailable(format!("{}: {error}", path.display()))
}

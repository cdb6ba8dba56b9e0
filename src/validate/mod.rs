//! Tile archive validation
//!
//! The tile builder may still be flushing its archive when it exits, so the
//! checks that can fail transiently (tables, format, tile count, zoom range,
//! sample record) are repeated a few times with a fixed delay. Zero-length
//! files and integrity-check failures are rejected immediately.

mod sqlite;

pub use sqlite::SqliteInspector;

use crate::config::ValidationConfig;
use crate::error::ValidationError;
use crate::retry::{IsRetryable, RetryPolicy, retry_with_policy};
use crate::types::{ArchiveLayout, ArchiveStats, Event, ValidatedArtifact};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Raw facts read from an archive, before any judgement
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArchiveSnapshot {
    /// Table names
    pub tables: BTreeSet<String>,
    /// Metadata key/value pairs
    pub metadata: BTreeMap<String, String>,
    /// Detected layout, if any
    pub layout: Option<ArchiveLayout>,
    /// Tile records
    pub tile_count: u64,
    /// Lowest and highest zoom level
    pub zoom_range: Option<(u8, u8)>,
    /// Payload size of the first tile record, None if there is none
    pub sample_bytes: Option<u64>,
    /// Size statistics
    pub stats: ArchiveStats,
}

/// Reads an archive into an [`ArchiveSnapshot`]
#[async_trait]
pub trait ArchiveInspector: Send + Sync + std::fmt::Debug {
    /// Inspect the archive at `path`
    async fn inspect(&self, path: &Path) -> Result<ArchiveSnapshot, ValidationError>;
}

/// Validates generated tile archives
#[derive(Clone, Debug)]
pub struct ArtifactValidator {
    config: ValidationConfig,
    inspector: Arc<dyn ArchiveInspector>,
    expected_zoom: Option<(u8, u8)>,
    event_tx: Option<broadcast::Sender<Event>>,
}

impl ArtifactValidator {
    /// Validator reading MBTiles archives through SQLite
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            config,
            inspector: Arc::new(SqliteInspector::new()),
            expected_zoom: None,
            event_tx: None,
        }
    }

    /// Replace the archive reader
    pub fn with_inspector(mut self, inspector: Arc<dyn ArchiveInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    /// Warn when the archive's zoom range leaves `min..=max`
    pub fn with_expected_zoom(mut self, min: u8, max: u8) -> Self {
        self.expected_zoom = Some((min, max));
        self
    }

    /// Publish an event for every validated archive
    pub fn with_events(mut self, tx: broadcast::Sender<Event>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Read an archive without judging it
    pub async fn inspect(&self, path: &Path) -> Result<ArchiveSnapshot, ValidationError> {
        self.inspector.inspect(path).await
    }

    /// Validate the archive at `path`
    pub async fn validate(&self, path: &Path) -> Result<ValidatedArtifact, ValidationError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.len() == 0 => {
                return Err(ValidationError::Empty {
                    path: path.to_path_buf(),
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ValidationError::NotFound {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => {
                return Err(ValidationError::Unavailable(format!(
                    "{}: {e}",
                    path.display()
                )));
            }
        }

        let policy = RetryPolicy::fixed(self.config.retry_delay, self.config.max_attempts);
        let (result, state) = retry_with_policy(&policy, |attempt| {
            if attempt > 0 {
                tracing::info!(
                    path = %path.display(),
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    "Retrying archive validation"
                );
            }
            self.check(path)
        })
        .await;

        match result {
            Ok(mut artifact) => {
                artifact.validation_retries = state.attempt();
                tracing::info!(
                    path = %path.display(),
                    tiles = artifact.tile_count,
                    min_zoom = artifact.min_zoom,
                    max_zoom = artifact.max_zoom,
                    retries = artifact.validation_retries,
                    "Archive validated"
                );
                if let Some(tx) = &self.event_tx {
                    tx.send(Event::ArtifactValidated {
                        path: artifact.path.clone(),
                        tile_count: artifact.tile_count,
                    })
                    .ok();
                }
                Ok(artifact)
            }
            Err(e) if e.is_retryable() => {
                tracing::error!(path = %path.display(), error = %e, "Archive still incomplete");
                Err(ValidationError::StillIncomplete {
                    attempts: state.attempts_made(),
                    last: Box::new(e),
                })
            }
            Err(e) => {
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    attempts = state.attempts_made(),
                    "Archive rejected"
                );
                Err(e.after_attempts(state.attempts_made()))
            }
        }
    }

    async fn check(&self, path: &Path) -> Result<ValidatedArtifact, ValidationError> {
        let snapshot = self.inspector.inspect(path).await?;
        let size_bytes = tokio::fs::metadata(path)
            .await
            .map(|m| m.len())
            .map_err(|e| ValidationError::Unavailable(format!("{}: {e}", path.display())))?;
        self.evaluate(path, size_bytes, snapshot)
    }

    fn evaluate(
        &self,
        path: &Path,
        size_bytes: u64,
        snapshot: ArchiveSnapshot,
    ) -> Result<ValidatedArtifact, ValidationError> {
        if !snapshot.tables.contains("metadata") {
            return Err(ValidationError::MissingTables(vec!["metadata".to_string()]));
        }
        let Some(layout) = snapshot.layout else {
            return Err(ValidationError::UnrecognizedLayout(
                snapshot.tables.into_iter().collect(),
            ));
        };
        let format = match snapshot.metadata.get("format") {
            Some(format) if !format.trim().is_empty() => format.clone(),
            _ => return Err(ValidationError::MissingFormat),
        };
        if format != "pbf" {
            tracing::warn!(path = %path.display(), format = %format, "Unexpected tile format");
        }
        if snapshot.tile_count == 0 {
            return Err(ValidationError::NoTiles);
        }
        let Some((min_zoom, max_zoom)) = snapshot.zoom_range else {
            return Err(ValidationError::InvalidZoom);
        };
        if let Some((expected_min, expected_max)) = self.expected_zoom {
            if min_zoom < expected_min {
                tracing::warn!(min_zoom, expected_min, "Archive has tiles below the configured minimum zoom");
            }
            if max_zoom > expected_max {
                tracing::warn!(max_zoom, expected_max, "Archive has tiles above the configured maximum zoom");
            }
        }
        if !matches!(snapshot.sample_bytes, Some(n) if n > 0) {
            return Err(ValidationError::UnreadableSample);
        }

        Ok(ValidatedArtifact {
            path: path.to_path_buf(),
            format,
            layout,
            tile_count: snapshot.tile_count,
            min_zoom,
            max_zoom,
            size_bytes,
            validation_retries: 0,
            stats: snapshot.stats,
        })
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Returns queued results in order, repeating the last one
    #[derive(Debug)]
    struct ScriptedInspector {
        results: Mutex<Vec<Result<ArchiveSnapshot, ValidationError>>>,
        calls: AtomicU32,
    }

    impl ScriptedInspector {
        fn new(mut results: Vec<Result<ArchiveSnapshot, ValidationError>>) -> Arc<Self> {
            results.reverse();
            Arc::new(Self {
                results: Mutex::new(results),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ArchiveInspector for ScriptedInspector {
        async fn inspect(&self, _path: &Path) -> Result<ArchiveSnapshot, ValidationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                return results.pop().unwrap();
            }
            // ValidationError is not Clone; repeat the last entry by shape
            match results.last().unwrap() {
                Ok(snapshot) => Ok(snapshot.clone()),
                Err(ValidationError::NoTiles) => Err(ValidationError::NoTiles),
                Err(e) => Err(ValidationError::Unavailable(e.to_string())),
            }
        }
    }

    fn good_snapshot() -> ArchiveSnapshot {
        ArchiveSnapshot {
            tables: ["metadata", "tiles"].iter().map(|s| s.to_string()).collect(),
            metadata: [("format".to_string(), "pbf".to_string())].into_iter().collect(),
            layout: Some(ArchiveLayout::Tiles),
            tile_count: 12,
            zoom_range: Some((0, 5)),
            sample_bytes: Some(100),
            stats: ArchiveStats::default(),
        }
    }

    fn fast_config() -> ValidationConfig {
        ValidationConfig {
            max_attempts: 3,
            retry_delay: Duration::from_millis(10),
        }
    }

    async fn archive_file(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("tiles.mbtiles");
        tokio::fs::write(&path, b"not empty").await.unwrap();
        path
    }

    #[tokio::test]
    async fn missing_and_empty_files_fail_immediately() {
        let dir = TempDir::new().unwrap();
        let inspector = ScriptedInspector::new(vec![Ok(good_snapshot())]);
        let validator = ArtifactValidator::new(fast_config()).with_inspector(inspector.clone());

        let missing = validator.validate(&dir.path().join("nope.mbtiles")).await;
        assert!(matches!(missing, Err(ValidationError::NotFound { .. })));

        let empty = dir.path().join("empty.mbtiles");
        tokio::fs::write(&empty, b"").await.unwrap();
        let result = validator.validate(&empty).await;
        assert!(matches!(result, Err(ValidationError::Empty { .. })));

        assert_eq!(inspector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let path = archive_file(&dir).await;
        let inspector = ScriptedInspector::new(vec![
            Ok(ArchiveSnapshot {
                tile_count: 0,
                ..good_snapshot()
            }),
            Err(ValidationError::Unavailable("database is locked".into())),
            Ok(good_snapshot()),
        ]);
        let (tx, mut rx) = broadcast::channel(8);
        let validator = ArtifactValidator::new(fast_config())
            .with_inspector(inspector.clone())
            .with_events(tx);

        let artifact = validator.validate(&path).await.unwrap();

        assert_eq!(artifact.validation_retries, 2);
        assert_eq!(artifact.tile_count, 12);
        assert_eq!(artifact.format, "pbf");
        assert_eq!((artifact.min_zoom, artifact.max_zoom), (0, 5));
        assert_eq!(artifact.size_bytes, 9);
        assert_eq!(inspector.calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::ArtifactValidated { tile_count: 12, .. }
        ));
    }

    #[tokio::test]
    async fn persistent_zero_count_exhausts_retries() {
        let dir = TempDir::new().unwrap();
        let path = archive_file(&dir).await;
        let inspector = ScriptedInspector::new(vec![Err(ValidationError::NoTiles)]);
        let validator = ArtifactValidator::new(fast_config()).with_inspector(inspector.clone());

        let err = validator.validate(&path).await.unwrap_err();
        match err {
            ValidationError::StillIncomplete { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, ValidationError::NoTiles));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(inspector.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn corruption_is_never_retried() {
        let dir = TempDir::new().unwrap();
        let path = archive_file(&dir).await;
        let inspector = ScriptedInspector::new(vec![
            Err(ValidationError::Corrupt {
                path: path.clone(),
                detail: "database disk image is malformed".into(),
            }),
            Ok(good_snapshot()),
        ]);
        let validator = ArtifactValidator::new(fast_config()).with_inspector(inspector.clone());

        let err = validator.validate(&path).await.unwrap_err();
        assert!(matches!(err, ValidationError::Corrupt { .. }));
        assert_eq!(inspector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn corruption_after_a_race_retry_reports_both_attempts() {
        let dir = TempDir::new().unwrap();
        let path = archive_file(&dir).await;
        let inspector = ScriptedInspector::new(vec![
            Err(ValidationError::NoTiles),
            Err(ValidationError::Corrupt {
                path: path.clone(),
                detail: "file is not a database".into(),
            }),
            Ok(good_snapshot()),
        ]);
        let validator = ArtifactValidator::new(fast_config()).with_inspector(inspector.clone());

        let err = validator.validate(&path).await.unwrap_err();
        match &err {
            ValidationError::Aborted { attempts, last } => {
                assert_eq!(*attempts, 2);
                assert!(matches!(**last, ValidationError::Corrupt { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_retryable());
        assert_eq!(crate::Error::from(err).attempts(), 2);
        assert_eq!(inspector.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn evaluation_order_matches_check_order() {
        let validator = ArtifactValidator::new(fast_config());
        let path = Path::new("x.mbtiles");

        let no_metadata = ArchiveSnapshot {
            tables: ["tiles".to_string()].into_iter().collect(),
            ..good_snapshot()
        };
        assert!(matches!(
            validator.evaluate(path, 1, no_metadata),
            Err(ValidationError::MissingTables(t)) if t == vec!["metadata".to_string()]
        ));

        let no_layout = ArchiveSnapshot {
            layout: None,
            ..good_snapshot()
        };
        assert!(matches!(
            validator.evaluate(path, 1, no_layout),
            Err(ValidationError::UnrecognizedLayout(_))
        ));

        let no_format = ArchiveSnapshot {
            metadata: BTreeMap::new(),
            ..good_snapshot()
        };
        assert!(matches!(
            validator.evaluate(path, 1, no_format),
            Err(ValidationError::MissingFormat)
        ));

        let no_zoom = ArchiveSnapshot {
            zoom_range: None,
            ..good_snapshot()
        };
        assert!(matches!(
            validator.evaluate(path, 1, no_zoom),
            Err(ValidationError::InvalidZoom)
        ));

        let empty_sample = ArchiveSnapshot {
            sample_bytes: Some(0),
            ..good_snapshot()
        };
        assert!(matches!(
            validator.evaluate(path, 1, empty_sample),
            Err(ValidationError::UnreadableSample)
        ));

        let non_pbf = ArchiveSnapshot {
            metadata: [("format".to_string(), "png".to_string())].into_iter().collect(),
            ..good_snapshot()
        };
        let artifact = validator.evaluate(path, 1, non_pbf).unwrap();
        assert_eq!(artifact.format, "png");
    }
}

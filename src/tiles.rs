//! Vector tile generation with the external tile builder
//!
//! [`TileGenerator`] checks the per-category GeoJSON inputs, builds the tile
//! builder command line and runs it through the [`ProcessOrchestrator`].
//! Resource-exhaustion failures are retried with progressively more
//! aggressive feature dropping and simplification; every other failure is
//! returned as-is.

use crate::config::{Config, TileConfig};
use crate::error::{Classify, ProcessError};
use crate::process::{Invocation, ProcessOrchestrator};
use crate::retry::{IsRetryable, RetryPolicy};
use crate::types::{BoundingBox, Category, Event};
use crate::utils::{format_bytes, remove_file_if_exists};
use serde::Serialize;
use serde::de::IgnoredAny;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// One per-category GeoJSON input, becomes one named layer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerInput {
    /// Layer name
    pub category: Category,
    /// GeoJSON FeatureCollection file
    pub path: PathBuf,
}

impl LayerInput {
    /// Pair a category with its GeoJSON file
    pub fn new(category: impl Into<Category>, path: impl Into<PathBuf>) -> Self {
        Self {
            category: category.into(),
            path: path.into(),
        }
    }
}

/// A tileset to build
#[derive(Clone, Debug)]
pub struct TileJob {
    /// Tileset name, used for temporary file names
    pub name: String,
    /// Clip tiles to this box
    pub bbox: Option<BoundingBox>,
    /// Layers in output order
    pub layers: Vec<LayerInput>,
}

/// Simplification and dropping settings for one attempt
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct GenerationParams {
    /// Geometry simplification factor
    pub simplification: f64,
    /// Feature drop rate
    pub drop_rate: f64,
    /// Pass `--no-feature-limit`
    pub no_feature_limit: bool,
    /// Pass `--no-tile-size-limit`
    pub no_tile_size_limit: bool,
}

impl GenerationParams {
    /// Quality profile settings with explicit overrides applied
    pub fn from_config(tiles: &TileConfig) -> Self {
        let profile = tiles.quality_profile.settings();
        Self {
            simplification: tiles.simplification.unwrap_or(profile.simplification),
            drop_rate: tiles.drop_rate.unwrap_or(profile.drop_rate),
            no_feature_limit: profile.no_feature_limit,
            no_tile_size_limit: profile.no_tile_size_limit,
        }
    }

    /// Parameters for retry attempt `attempt` (0 = unchanged)
    ///
    /// Drop rate and simplification grow by `escalation_factor` per attempt and
    /// stop at the configured ceilings; a value already above its ceiling is
    /// never lowered.
    pub fn escalated(&self, attempt: u32, tiles: &TileConfig) -> Self {
        if attempt == 0 {
            return *self;
        }
        let factor = tiles.escalation_factor.powi(attempt as i32);
        Self {
            simplification: (self.simplification * factor)
                .min(tiles.max_simplification)
                .max(self.simplification),
            drop_rate: (self.drop_rate * factor)
                .min(tiles.max_drop_rate)
                .max(self.drop_rate),
            ..*self
        }
    }
}

/// Build the tile builder command line
pub fn build_command(
    tool: &Path,
    tiles: &TileConfig,
    job: &TileJob,
    params: &GenerationParams,
    output: &Path,
    read_parallel: bool,
) -> Vec<String> {
    let mut argv = vec![
        tool.display().to_string(),
        format!("--minimum-zoom={}", tiles.min_zoom),
        format!("--maximum-zoom={}", tiles.max_zoom),
        format!("--full-detail={}", tiles.detail),
        format!("--low-detail={}", tiles.detail),
        format!("--minimum-detail={}", tiles.detail.saturating_sub(5).max(1)),
        format!("--buffer={}", tiles.buffer),
        format!("--drop-rate={}", params.drop_rate),
    ];
    if params.no_feature_limit {
        argv.push("--no-feature-limit".to_string());
    }
    if params.no_tile_size_limit {
        argv.push("--no-tile-size-limit".to_string());
    }
    argv.push("--drop-densest-as-needed".to_string());
    argv.push(format!("--simplification={}", params.simplification));
    if let Some(at_max) = tiles.simplification_at_max_zoom {
        argv.push(format!("--simplification-at-maximum-zoom={at_max}"));
    }

    for layer in &job.layers {
        argv.push("-L".to_string());
        argv.push(format!("{}:{}", layer.category, layer.path.display()));
    }

    argv.extend([
        "--force".to_string(),
        "--quiet".to_string(),
        "--progress-interval=1".to_string(),
        "--output".to_string(),
        output.display().to_string(),
    ]);

    if let Some(bbox) = &job.bbox {
        argv.push(format!("--clip-bounding-box={bbox}"));
    }
    if read_parallel {
        argv.push("--read-parallel".to_string());
    }
    argv
}

#[derive(serde::Deserialize)]
struct FeatureCollectionHead {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    features: Vec<IgnoredAny>,
}

/// Count the features of a GeoJSON FeatureCollection file
fn count_features(path: &Path) -> Result<usize, String> {
    let file = std::fs::File::open(path).map_err(|e| format!("unreadable ({e})"))?;
    let head: FeatureCollectionHead = serde_json::from_reader(std::io::BufReader::new(file))
        .map_err(|e| format!("invalid GeoJSON ({e})"))?;
    if head.kind.as_deref() != Some("FeatureCollection") {
        return Err("not a FeatureCollection".to_string());
    }
    Ok(head.features.len())
}

/// Drop layers whose input is empty; fail when nothing usable remains
///
/// Missing or malformed files are reported as invalid, zero-byte files and
/// collections without features as empty. Surviving paths are made absolute.
pub async fn validate_layer_inputs(layers: &[LayerInput]) -> Result<Vec<LayerInput>, ProcessError> {
    let mut usable = Vec::with_capacity(layers.len());
    let mut empty = Vec::new();
    let mut invalid = Vec::new();

    for layer in layers {
        let category = layer.category.clone();
        match tokio::fs::metadata(&layer.path).await {
            Err(_) => {
                invalid.push(format!(
                    "{category}: file not found ({})",
                    layer.path.display()
                ));
                continue;
            }
            Ok(meta) if meta.len() == 0 => {
                tracing::warn!(category = %category, path = %layer.path.display(), "Skipping empty feature file");
                empty.push(category.to_string());
                continue;
            }
            Ok(_) => {}
        }

        let path = layer.path.clone();
        let verdict = tokio::task::spawn_blocking(move || count_features(&path))
            .await
            .unwrap_or_else(|e| Err(format!("check failed ({e})")));

        match verdict {
            Ok(0) => {
                tracing::warn!(category = %category, path = %layer.path.display(), "Skipping feature file with no features");
                empty.push(category.to_string());
            }
            Ok(features) => {
                let path = tokio::fs::canonicalize(&layer.path)
                    .await
                    .unwrap_or_else(|_| layer.path.clone());
                tracing::info!(category = %category, features, "Validated layer input");
                usable.push(LayerInput { category, path });
            }
            Err(reason) => invalid.push(format!("{category}: {reason}")),
        }
    }

    if usable.is_empty() {
        return Err(ProcessError::NoUsableInput { empty, invalid });
    }
    if !empty.is_empty() || !invalid.is_empty() {
        tracing::info!(
            usable = usable.len(),
            empty = %empty.join(", "),
            invalid = %invalid.join("; "),
            "Skipping unusable layers"
        );
    }
    Ok(usable)
}

/// What a successful generation took
#[derive(Clone, Debug, Serialize)]
pub struct GenerationReport {
    /// Final archive path
    pub output: PathBuf,
    /// Attempts made, including the successful one
    pub attempts: u32,
    /// Failed attempts that were retried
    pub retries: u32,
    /// Parameters used by each attempt, in order
    pub params_history: Vec<GenerationParams>,
    /// Layers that went into the archive
    pub layers: Vec<Category>,
    /// Highest memory usage the monitor saw (percent)
    pub peak_memory_percent: Option<f64>,
    /// Total size of the layer inputs
    pub input_bytes: u64,
    /// Archive size
    pub output_bytes: u64,
    /// Wall-clock time including retry delays
    #[serde(with = "crate::config::duration_serde")]
    pub duration: Duration,
}

/// Generates tile archives from per-category GeoJSON
#[derive(Clone, Debug)]
pub struct TileGenerator {
    tiles: TileConfig,
    orchestrator: ProcessOrchestrator,
    retry: RetryPolicy,
    timeout: Duration,
    read_parallel_min_bytes: u64,
    temp_dir: PathBuf,
    event_tx: Option<broadcast::Sender<Event>>,
}

impl TileGenerator {
    /// Create a generator from the full configuration
    pub fn new(config: &Config) -> Self {
        Self {
            tiles: config.tiles.clone(),
            orchestrator: ProcessOrchestrator::new(config.process.clone()),
            retry: RetryPolicy::from_config(&config.process.retry),
            timeout: config.process.timeout,
            read_parallel_min_bytes: config.process.read_parallel_min_bytes,
            temp_dir: config.output.base_dir.join("tmp"),
            event_tx: None,
        }
    }

    /// Replace the orchestrator (custom probe, cancellation)
    pub fn with_orchestrator(mut self, orchestrator: ProcessOrchestrator) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    /// Publish retry events on `tx`
    pub fn with_events(mut self, tx: broadcast::Sender<Event>) -> Self {
        self.orchestrator = self.orchestrator.with_events(tx.clone());
        self.event_tx = Some(tx);
        self
    }

    /// Directory for in-progress archives
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Parameters of the first attempt
    pub fn base_params(&self) -> GenerationParams {
        GenerationParams::from_config(&self.tiles)
    }

    /// Build the archive for `job` at `dest`
    pub async fn generate(
        &self,
        job: &TileJob,
        dest: &Path,
    ) -> Result<GenerationReport, ProcessError> {
        let tool = self.orchestrator.resolve_tool()?;
        let layers = validate_layer_inputs(&job.layers).await?;

        let mut input_bytes = 0u64;
        for layer in &layers {
            if let Ok(meta) = tokio::fs::metadata(&layer.path).await {
                input_bytes += meta.len();
            }
        }

        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|source| ProcessError::Io {
                path: self.temp_dir.clone(),
                source,
            })?;
        // The builder runs inside the temp dir, so its output path must be absolute
        let temp_dir = tokio::fs::canonicalize(&self.temp_dir)
            .await
            .map_err(|source| ProcessError::Io {
                path: self.temp_dir.clone(),
                source,
            })?;

        let job = TileJob {
            name: job.name.clone(),
            bbox: job.bbox,
            layers,
        };
        let base = self.base_params();
        let read_parallel = self
            .orchestrator
            .probe()
            .available_bytes()
            .is_some_and(|bytes| bytes >= self.read_parallel_min_bytes);

        tracing::info!(
            name = %job.name,
            layers = job.layers.len(),
            input = %format_bytes(input_bytes),
            "Generating vector tiles"
        );

        let started = Instant::now();
        let mut state = self.retry.start();
        let mut history = Vec::new();
        let mut peak_memory: Option<f64> = None;

        loop {
            let attempt = state.attempt();
            let params = base.escalated(attempt, &self.tiles);
            history.push(params);

            let temp_output = temp_dir.join(format!(
                "{}_{}_{attempt}.mbtiles",
                file_stem(&job.name),
                chrono::Utc::now().timestamp_millis()
            ));
            let invocation = Invocation {
                argv: build_command(&tool, &self.tiles, &job, &params, &temp_output, read_parallel),
                work_dir: temp_dir.clone(),
                temp_output,
                final_output: dest.to_path_buf(),
                monitor_memory: attempt == 0,
            };

            let error = match self.orchestrator.run(&invocation, self.timeout).await {
                Ok(outcome) => {
                    if let Some(report) = &outcome.memory {
                        peak_memory = Some(peak_memory.unwrap_or(0.0).max(report.peak_percent));
                    }
                    let output_bytes = tokio::fs::metadata(&outcome.output)
                        .await
                        .map(|m| m.len())
                        .unwrap_or(0);
                    let report = GenerationReport {
                        output: outcome.output,
                        attempts: state.attempts_made(),
                        retries: state.attempt(),
                        params_history: history,
                        layers: job.layers.iter().map(|l| l.category.clone()).collect(),
                        peak_memory_percent: peak_memory,
                        input_bytes,
                        output_bytes,
                        duration: started.elapsed(),
                    };
                    tracing::info!(
                        output = %report.output.display(),
                        attempts = report.attempts,
                        retries = report.retries,
                        input = %format_bytes(report.input_bytes),
                        output_size = %format_bytes(report.output_bytes),
                        peak_memory_percent = ?report.peak_memory_percent,
                        duration_secs = report.duration.as_secs_f64(),
                        "Tile generation complete"
                    );
                    return Ok(report);
                }
                Err(e) => e,
            };

            if let ProcessError::CriticalMemoryPressure { percent } = &error {
                peak_memory = Some(peak_memory.unwrap_or(0.0).max(*percent));
            }
            state.record_failure(error.classification());

            if !error.is_retryable() {
                tracing::error!(attempt, error = %error, "Tile generation failed");
                return Err(error.after_attempts(state.attempts_made()));
            }
            if !state.can_retry() {
                tracing::error!(
                    attempts = state.attempts_made(),
                    error = %error,
                    "Tile generation failed after all retry attempts"
                );
                return Err(ProcessError::RetriesExhausted {
                    attempts: state.attempts_made(),
                    last: Box::new(error),
                });
            }

            let delay = self.retry.delay_for(attempt);
            let next = base.escalated(attempt + 1, &self.tiles);
            tracing::warn!(
                attempt,
                classification = error.classification(),
                delay_ms = delay.as_millis() as u64,
                drop_rate = next.drop_rate,
                simplification = next.simplification,
                "Tile builder ran out of resources, retrying with more aggressive simplification"
            );
            if let Some(tx) = &self.event_tx {
                tx.send(Event::ProcessRetry {
                    attempt,
                    classification: error.classification().to_string(),
                    drop_rate: next.drop_rate,
                    simplification: next.simplification,
                })
                .ok();
            }
            tokio::time::sleep(delay).await;
            state.advance(delay);
        }
    }

    /// Remove everything left in the temp directory; returns the entries removed
    pub async fn cleanup_temp_files(&self) -> std::io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.temp_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let result = if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                remove_file_if_exists(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove temporary file")
                }
            }
        }
        tracing::debug!(dir = %self.temp_dir.display(), removed, "Cleaned up temporary files");
        Ok(removed)
    }
}

pub(crate) fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        "tileset".to_string()
    } else {
        stem
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QualityProfile;
    use tempfile::TempDir;

    fn job(layers: Vec<LayerInput>) -> TileJob {
        TileJob {
            name: "test".to_string(),
            bbox: Some(BoundingBox::new(-1.0, 50.0, 1.0, 51.0).unwrap()),
            layers,
        }
    }

    #[test]
    fn params_follow_profile_and_overrides() {
        let tiles = TileConfig {
            quality_profile: QualityProfile::Fast,
            ..TileConfig::default()
        };
        let params = GenerationParams::from_config(&tiles);
        assert_eq!(params.simplification, 2.0);
        assert_eq!(params.drop_rate, 4.0);
        assert!(params.no_tile_size_limit);

        let tiles = TileConfig {
            drop_rate: Some(3.0),
            ..TileConfig::default()
        };
        assert_eq!(GenerationParams::from_config(&tiles).drop_rate, 3.0);
    }

    #[test]
    fn escalation_grows_and_caps() {
        let tiles = TileConfig::default();
        let base = GenerationParams::from_config(&tiles);

        assert_eq!(base.escalated(0, &tiles), base);
        let first = base.escalated(1, &tiles);
        let second = base.escalated(2, &tiles);
        assert!((first.drop_rate - base.drop_rate * 1.5).abs() < 1e-9);
        assert!(second.drop_rate > first.drop_rate);
        assert!(second.simplification > first.simplification);

        let capped = base.escalated(20, &tiles);
        assert_eq!(capped.drop_rate, tiles.max_drop_rate);
        assert_eq!(capped.simplification, tiles.max_simplification);

        let above_cap = GenerationParams {
            drop_rate: 12.0,
            ..base
        };
        assert_eq!(above_cap.escalated(1, &tiles).drop_rate, 12.0);
    }

    #[test]
    fn command_line_contains_layers_and_options() {
        let tiles = TileConfig {
            simplification_at_max_zoom: Some(0.5),
            ..TileConfig::default()
        };
        let params = GenerationParams::from_config(&tiles);
        let job = job(vec![
            LayerInput::new("water", "/data/water.geojson"),
            LayerInput::new("roads", "/data/roads.geojson"),
        ]);

        let argv = build_command(
            Path::new("/usr/bin/tippecanoe"),
            &tiles,
            &job,
            &params,
            Path::new("/tmp/out.mbtiles"),
            true,
        );

        assert_eq!(argv[0], "/usr/bin/tippecanoe");
        for expected in [
            "--minimum-zoom=0",
            "--maximum-zoom=14",
            "--full-detail=12",
            "--low-detail=12",
            "--minimum-detail=7",
            "--buffer=64",
            "--drop-rate=2.5",
            "--simplification=1",
            "--simplification-at-maximum-zoom=0.5",
            "--no-feature-limit",
            "--drop-densest-as-needed",
            "--force",
            "--clip-bounding-box=-1,50,1,51",
            "--read-parallel",
        ] {
            assert!(argv.iter().any(|a| a == expected), "missing {expected} in {argv:?}");
        }
        assert!(!argv.iter().any(|a| a == "--no-tile-size-limit"));

        let layer_pos = argv.iter().position(|a| a == "water:/data/water.geojson").unwrap();
        assert_eq!(argv[layer_pos - 1], "-L");
        assert!(argv.iter().any(|a| a == "roads:/data/roads.geojson"));

        let out_pos = argv.iter().position(|a| a == "--output").unwrap();
        assert_eq!(argv[out_pos + 1], "/tmp/out.mbtiles");
    }

    #[tokio::test]
    async fn layer_validation_skips_empty_and_reports_invalid() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("water.geojson");
        let empty_file = dir.path().join("parks.geojson");
        let no_features = dir.path().join("shops.geojson");
        let not_collection = dir.path().join("roads.geojson");
        let garbage = dir.path().join("rail.geojson");
        tokio::fs::write(
            &good,
            br#"{"type":"FeatureCollection","features":[{"type":"Feature","geometry":null,"properties":{}}]}"#,
        )
        .await
        .unwrap();
        tokio::fs::write(&empty_file, b"").await.unwrap();
        tokio::fs::write(&no_features, br#"{"type":"FeatureCollection","features":[]}"#)
            .await
            .unwrap();
        tokio::fs::write(&not_collection, br#"{"type":"Feature","geometry":null}"#)
            .await
            .unwrap();
        tokio::fs::write(&garbage, b"<osm></osm>").await.unwrap();

        let layers = vec![
            LayerInput::new("water", &good),
            LayerInput::new("parks", &empty_file),
            LayerInput::new("shops", &no_features),
            LayerInput::new("roads", &not_collection),
            LayerInput::new("rail", &garbage),
            LayerInput::new("forest", dir.path().join("missing.geojson")),
        ];

        let usable = validate_layer_inputs(&layers).await.unwrap();
        assert_eq!(usable.len(), 1);
        assert_eq!(usable[0].category.as_str(), "water");
        assert!(usable[0].path.is_absolute());

        let err = validate_layer_inputs(&layers[1..]).await.unwrap_err();
        match err {
            ProcessError::NoUsableInput { empty, invalid } => {
                assert_eq!(empty, vec!["parks".to_string(), "shops".to_string()]);
                assert_eq!(invalid.len(), 3);
                assert!(invalid[0].starts_with("roads: not a FeatureCollection"));
                assert!(invalid[1].starts_with("rail: invalid GeoJSON"));
                assert!(invalid[2].starts_with("forest: file not found"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cleanup_removes_leftovers() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            output: crate::config::OutputConfig {
                base_dir: dir.path().to_path_buf(),
            },
            ..Config::default()
        };
        let generator = TileGenerator::new(&config);
        assert_eq!(generator.cleanup_temp_files().await.unwrap(), 0);

        tokio::fs::create_dir_all(generator.temp_dir()).await.unwrap();
        tokio::fs::write(generator.temp_dir().join("a_1_0.mbtiles"), b"x")
            .await
            .unwrap();
        tokio::fs::create_dir_all(generator.temp_dir().join("nested"))
            .await
            .unwrap();

        assert_eq!(generator.cleanup_temp_files().await.unwrap(), 2);
        assert!(generator.temp_dir().exists());
    }

    #[test]
    fn file_stem_is_filesystem_safe() {
        assert_eq!(file_stem("my map/v2"), "my_map_v2");
        assert_eq!(file_stem(""), "tileset");
    }
}

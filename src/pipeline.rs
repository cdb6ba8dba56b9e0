//! Cache-first orchestration of fetch, extract, generate and validate
//!
//! Each stage first consults the [`ContentStore`]. A repeated request with the
//! same bounding box, categories and settings is served entirely from the
//! store: no download and no tile builder run. Terminal failures surface as
//! [`StageFailure`]s naming the stage, cause and attempt count.

use crate::cache::{CacheKey, ContentStore, Fingerprint};
use crate::config::{Config, TileConfig};
use crate::error::{Error, Result, StageFailure};
use crate::fetch::{CategoryFilter, StreamingFetcher, overpass_query};
use crate::tiles::{
    GenerationParams, GenerationReport, LayerInput, TileGenerator, TileJob, file_stem,
};
use crate::types::{BoundingBox, Category, Event, Stage, ValidatedArtifact};
use crate::utils::{FileStamp, file_stamp};
use crate::validate::ArtifactValidator;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Turns raw map data into one GeoJSON FeatureCollection per category
#[async_trait]
pub trait FeatureExtractor: Send + Sync {
    /// Write the features of `raw_data` accepted by `filter` to `dest`
    async fn extract(&self, raw_data: &Path, filter: &CategoryFilter, dest: &Path) -> Result<()>;
}

/// One tileset request
#[derive(Clone, Debug)]
pub struct TileRequest {
    /// Tileset name; the archive is written as `<name>.mbtiles`
    pub name: String,
    /// Area to fetch and clip to
    pub bbox: BoundingBox,
    /// Categories, one layer each
    pub categories: Vec<CategoryFilter>,
}

/// Everything a successful run produced
#[derive(Clone, Debug)]
pub struct PipelineOutput {
    /// Raw map data used
    pub raw_data: PathBuf,
    /// Per-category inputs handed to the tile builder
    pub layers: Vec<LayerInput>,
    /// The validated archive, owned by the caller
    pub artifact: ValidatedArtifact,
    /// Generation statistics; None when the archive came from the store
    pub generation: Option<GenerationReport>,
    /// Stages whose work was served from the store
    pub cache_hits: Vec<Stage>,
}

/// Runs requests through fetch, extract, generate and validate
pub struct TilePipeline {
    config: Config,
    store: ContentStore,
    fetcher: StreamingFetcher,
    extractor: Arc<dyn FeatureExtractor>,
    generator: TileGenerator,
    validator: ArtifactValidator,
    event_tx: broadcast::Sender<Event>,
}

impl std::fmt::Debug for TilePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TilePipeline")
            .field("store", &self.store)
            .field("fetcher", &self.fetcher)
            .field("generator", &self.generator)
            .field("validator", &self.validator)
            .finish_non_exhaustive()
    }
}

fn failed<E: Into<Error>>(stage: Stage) -> impl FnOnce(E) -> Error {
    move |e| Error::Stage(StageFailure::new(stage, e))
}

/// Key of the raw map data for `bbox` and the requested categories
///
/// Filters are sorted by category, so request order does not matter.
pub(crate) fn raw_data_key(
    bbox: &BoundingBox,
    categories: &[CategoryFilter],
) -> serde_json::Result<CacheKey> {
    let mut filters = categories.to_vec();
    filters.sort_by(|a, b| a.category.cmp(&b.category));
    Ok(Fingerprint::new(&format!("rawdata:{bbox}"))
        .params("filters", &filters)?
        .finish()
        .with_extension("osm"))
}

/// Key of one category's features, derived from the raw data it was cut from
pub(crate) fn features_key(
    bbox: &BoundingBox,
    filter: &CategoryFilter,
    raw: FileStamp,
) -> serde_json::Result<CacheKey> {
    Ok(Fingerprint::new(&format!("features:{}:{bbox}", filter.category))
        .input("raw", raw)
        .params("filter", &filter.filter)?
        .finish()
        .with_extension("geojson"))
}

/// Key of a tileset built from `layers` with the given settings
pub(crate) fn tiles_key(
    name: &str,
    bbox: &BoundingBox,
    layers: &[(Category, FileStamp)],
    tiles: &TileConfig,
    params: &GenerationParams,
) -> serde_json::Result<CacheKey> {
    let mut fingerprint = Fingerprint::new(&format!("tiles:{}:{bbox}", file_stem(name)));
    for (category, stamp) in layers {
        fingerprint = fingerprint.input(category.as_str(), *stamp);
    }
    Ok(fingerprint
        .params("tiles", tiles)?
        .params("generation", params)?
        .finish()
        .with_extension("mbtiles"))
}

impl TilePipeline {
    /// Build a pipeline from validated configuration
    pub fn new(config: Config, extractor: Arc<dyn FeatureExtractor>) -> Result<Self> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(1024);

        let fetcher = StreamingFetcher::new(config.fetch.clone())?.with_events(event_tx.clone());
        let generator = TileGenerator::new(&config).with_events(event_tx.clone());
        let validator = ArtifactValidator::new(config.validation.clone())
            .with_expected_zoom(config.tiles.min_zoom, config.tiles.max_zoom)
            .with_events(event_tx.clone());

        Ok(Self {
            store: ContentStore::from_config(&config),
            config,
            fetcher,
            extractor,
            generator,
            validator,
            event_tx,
        })
    }

    /// Replace the content store
    pub fn with_store(mut self, store: ContentStore) -> Self {
        self.store = store;
        self
    }

    /// Replace the tile generator (custom orchestrator or probe)
    pub fn with_generator(mut self, generator: TileGenerator) -> Self {
        self.generator = generator.with_events(self.event_tx.clone());
        self
    }

    /// Subscribe to pipeline events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Content store in use
    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn cache_hit(&self, stage: Stage, key: &CacheKey, hits: &mut Vec<Stage>) {
        tracing::info!(stage = %stage, key = %key, "Using cached result");
        self.event_tx
            .send(Event::CacheHit {
                stage,
                key: key.to_string(),
            })
            .ok();
        hits.push(stage);
    }

    /// Run one request to a validated archive
    pub async fn run(&self, request: &TileRequest) -> Result<PipelineOutput> {
        if request.categories.is_empty() {
            return Err(Error::Config {
                message: "at least one category is required".to_string(),
                key: Some("categories".to_string()),
            });
        }
        self.config.output.ensure_dirs().await?;

        tracing::info!(
            name = %request.name,
            bbox = %request.bbox,
            categories = request.categories.len(),
            "Starting tile pipeline"
        );

        let mut cache_hits = Vec::new();
        let raw_data = self.raw_data(request, &mut cache_hits).await?;
        let layers = self.extract_layers(request, &raw_data, &mut cache_hits).await?;
        let (artifact, generation) = self.tiles(request, &layers, &mut cache_hits).await?;

        tracing::info!(
            path = %artifact.path.display(),
            tiles = artifact.tile_count,
            cache_hits = cache_hits.len(),
            "Tile pipeline finished"
        );
        Ok(PipelineOutput {
            raw_data,
            layers,
            artifact,
            generation,
            cache_hits,
        })
    }

    async fn raw_data(&self, request: &TileRequest, hits: &mut Vec<Stage>) -> Result<PathBuf> {
        let key = raw_data_key(&request.bbox, &request.categories).map_err(failed(Stage::Fetch))?;

        if let Some(path) = self.store.get(&key).await {
            self.cache_hit(Stage::Fetch, &key, hits);
            return Ok(path);
        }

        let query = overpass_query(
            &request.bbox,
            &request.categories,
            self.config.fetch.query_timeout_secs,
        );
        let dest = self
            .config
            .output
            .data_dir()
            .join(format!("osm_{}.osm", &key.digest()[..16]));
        let path = self
            .fetcher
            .fetch(&query, &dest)
            .await
            .map_err(failed(Stage::Fetch))?;
        Ok(self.store.put(&key, &path).await)
    }

    async fn extract_layers(
        &self,
        request: &TileRequest,
        raw_data: &Path,
        hits: &mut Vec<Stage>,
    ) -> Result<Vec<LayerInput>> {
        let raw_stamp = file_stamp(raw_data).await.map_err(failed(Stage::Extract))?;
        let mut layers = Vec::with_capacity(request.categories.len());

        for filter in &request.categories {
            let key = features_key(&request.bbox, filter, raw_stamp).map_err(failed(Stage::Extract))?;

            let path = match self.store.get(&key).await {
                Some(path) => {
                    self.cache_hit(Stage::Extract, &key, hits);
                    path
                }
                None => {
                    let dest = self
                        .config
                        .output
                        .data_dir()
                        .join(format!("{}.geojson", file_stem(filter.category.as_str())));
                    self.extractor
                        .extract(raw_data, filter, &dest)
                        .await
                        .map_err(failed(Stage::Extract))?;
                    tracing::info!(category = %filter.category, path = %dest.display(), "Extracted features");
                    self.store.put(&key, &dest).await
                }
            };
            layers.push(LayerInput {
                category: filter.category.clone(),
                path,
            });
        }
        Ok(layers)
    }

    async fn tiles(
        &self,
        request: &TileRequest,
        layers: &[LayerInput],
        hits: &mut Vec<Stage>,
    ) -> Result<(ValidatedArtifact, Option<GenerationReport>)> {
        let mut inputs = Vec::with_capacity(layers.len());
        for layer in layers {
            let stamp = file_stamp(&layer.path)
                .await
                .map_err(failed(Stage::Generate))?;
            inputs.push((layer.category.clone(), stamp));
        }
        let key = tiles_key(
            &request.name,
            &request.bbox,
            &inputs,
            &self.config.tiles,
            &self.generator.base_params(),
        )
        .map_err(failed(Stage::Generate))?;

        let final_path = self
            .config
            .output
            .tiles_dir()
            .join(format!("{}.mbtiles", file_stem(&request.name)));

        if let Some(cached) = self.store.get(&key).await {
            match self.validator.validate(&cached).await {
                Ok(mut artifact) => {
                    self.cache_hit(Stage::Generate, &key, hits);
                    self.store
                        .export(&cached, &final_path)
                        .await
                        .map_err(failed(Stage::Cache))?;
                    artifact.path = final_path;
                    return Ok((artifact, None));
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Cached archive failed validation, regenerating");
                }
            }
        }

        let job = TileJob {
            name: request.name.clone(),
            bbox: Some(request.bbox),
            layers: layers.to_vec(),
        };
        let report = self
            .generator
            .generate(&job, &final_path)
            .await
            .map_err(failed(Stage::Generate))?;
        let artifact = self
            .validator
            .validate(&report.output)
            .await
            .map_err(failed(Stage::Validate))?;

        // The caller owns the final archive; the store keeps its own copy
        self.store.put(&key, &artifact.path).await;
        Ok((artifact, Some(report)))
    }

    /// Remove temporary tile builder files
    pub async fn cleanup(&self) {
        if let Err(e) = self.generator.cleanup_temp_files().await {
            tracing::warn!(error = %e, "Failed to clean up temporary files");
        }
    }
}

//! Core types for tilecraft

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Geographic bounding box in WGS84 degrees
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Western longitude
    pub west: f64,
    /// Southern latitude
    pub south: f64,
    /// Eastern longitude
    pub east: f64,
    /// Northern latitude
    pub north: f64,
}

impl BoundingBox {
    /// Create a validated bounding box
    ///
    /// Longitudes must lie in [-180, 180], latitudes in [-90, 90], and the box
    /// must have a positive extent in both directions.
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Result<Self> {
        let invalid = |message: String| Error::Config {
            message,
            key: Some("bbox".to_string()),
        };

        for (name, value) in [("west", west), ("south", south), ("east", east), ("north", north)]
        {
            if !value.is_finite() {
                return Err(invalid(format!("{name} coordinate is not a finite number")));
            }
        }
        if !(-180.0..=180.0).contains(&west) || !(-180.0..=180.0).contains(&east) {
            return Err(invalid(format!(
                "longitudes must be within [-180, 180], got west={west} east={east}"
            )));
        }
        if !(-90.0..=90.0).contains(&south) || !(-90.0..=90.0).contains(&north) {
            return Err(invalid(format!(
                "latitudes must be within [-90, 90], got south={south} north={north}"
            )));
        }
        if west >= east {
            return Err(invalid(format!("west ({west}) must be less than east ({east})")));
        }
        if south >= north {
            return Err(invalid(format!(
                "south ({south}) must be less than north ({north})"
            )));
        }

        Ok(Self {
            west,
            south,
            east,
            north,
        })
    }

    /// Coordinates in Overpass order: `south,west,north,east`
    pub fn to_overpass(&self) -> String {
        format!("{},{},{},{}", self.south, self.west, self.north, self.east)
    }

    /// Area in square degrees
    pub fn area_degrees(&self) -> f64 {
        (self.east - self.west) * (self.north - self.south)
    }
}

/// Formats as `west,south,east,north`, the form used in cache keys and tool arguments
impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{},{}", self.west, self.south, self.east, self.north)
    }
}

impl std::str::FromStr for BoundingBox {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Config {
                message: format!("invalid bounding box '{s}': {e}"),
                key: Some("bbox".to_string()),
            })?;

        match parts.as_slice() {
            [west, south, east, north] => Self::new(*west, *south, *east, *north),
            _ => Err(Error::Config {
                message: format!(
                    "bounding box must have 4 comma-separated values (west,south,east,north), got {}",
                    parts.len()
                ),
                key: Some("bbox".to_string()),
            }),
        }
    }
}

/// Feature category name (e.g. "water", "roads")
///
/// Also used as the layer name handed to the tile builder.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(pub String);

impl Category {
    /// Create a category from any string-like value
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Category name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Category {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Category {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Pipeline stage, used in terminal failure reports and cache events
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Downloading raw map data
    Fetch,
    /// Extracting per-category features
    Extract,
    /// Running the tile builder
    Generate,
    /// Certifying the produced archive
    Validate,
    /// Adopting artifacts into the content store
    Cache,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Fetch => "fetch",
            Stage::Extract => "extract",
            Stage::Generate => "generate",
            Stage::Validate => "validate",
            Stage::Cache => "cache",
        };
        f.write_str(name)
    }
}

/// Stage of a single tile builder run, derived from its output lines
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStage {
    /// Spawned, no recognizable output yet
    #[default]
    Initializing,
    /// Reading input features
    Reading,
    /// Sorting features
    Sorting,
    /// Choosing a maximum zoom
    OptimizingZoom,
    /// Writing tiles
    GeneratingTiles,
    /// Output written, finishing up
    Finalizing,
    /// Exited successfully
    Done,
    /// Exited unsuccessfully, timed out or was aborted
    Failed,
}

impl std::fmt::Display for ProcessStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProcessStage::Initializing => "initializing",
            ProcessStage::Reading => "reading features",
            ProcessStage::Sorting => "sorting features",
            ProcessStage::OptimizingZoom => "optimizing zoom levels",
            ProcessStage::GeneratingTiles => "generating tiles",
            ProcessStage::Finalizing => "finalizing output",
            ProcessStage::Done => "done",
            ProcessStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Event emitted while a request moves through the pipeline
///
/// Published on a broadcast channel; slow subscribers may lag and miss events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A download attempt started
    FetchStarted {
        /// Endpoint being queried
        endpoint: String,
        /// Attempt index (0-based)
        attempt: u32,
    },

    /// Download progress
    FetchProgress {
        /// Bytes written so far
        downloaded: u64,
        /// Declared response length, if the server sent one
        #[serde(skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
    },

    /// A download attempt failed and will be retried
    FetchRetry {
        /// Endpoint that failed
        endpoint: String,
        /// Attempt index that failed (0-based)
        attempt: u32,
        /// Classification tag of the failure
        classification: String,
        /// Delay before the next attempt in milliseconds
        delay_ms: u64,
    },

    /// Download finished
    FetchComplete {
        /// Destination file
        path: PathBuf,
        /// Bytes written
        bytes: u64,
    },

    /// The tile builder moved to a new stage
    ProcessStageChanged {
        /// New stage
        stage: ProcessStage,
        /// Tile progress percentage, when the builder reports one
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<f32>,
    },

    /// A tile builder attempt failed and will be retried with escalated parameters
    ProcessRetry {
        /// Attempt that failed (0-based)
        attempt: u32,
        /// Classification tag of the failure
        classification: String,
        /// Drop rate for the next attempt
        drop_rate: f64,
        /// Simplification for the next attempt
        simplification: f64,
    },

    /// Memory usage sample from the monitor
    MemoryUsage {
        /// System memory usage percentage
        percent: f64,
    },

    /// An artifact was served from the content store
    CacheHit {
        /// Stage whose work was skipped
        stage: Stage,
        /// Cache key
        key: String,
    },

    /// An archive passed validation
    ArtifactValidated {
        /// Archive path
        path: PathBuf,
        /// Number of tiles
        tile_count: u64,
    },
}

/// Table layout of an MBTiles archive
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveLayout {
    /// A plain `tiles` table
    Tiles,
    /// Deduplicated `map` + `images` tables (with a `tiles` view)
    MapImages,
}

/// Informational statistics about an archive's tile records
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveStats {
    /// Average tile payload size in bytes
    pub avg_tile_bytes: f64,
    /// Smallest tile payload in bytes
    pub min_tile_bytes: u64,
    /// Largest tile payload in bytes
    pub max_tile_bytes: u64,
    /// Tile count per zoom level
    pub tiles_per_zoom: BTreeMap<u8, u64>,
}

/// An archive that passed validation
///
/// Immutable once created. The caller owns the file at `path`; the content
/// store keeps its own copy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidatedArtifact {
    /// Archive location
    pub path: PathBuf,
    /// Declared tile format from metadata (normally "pbf")
    pub format: String,
    /// Detected table layout
    pub layout: ArchiveLayout,
    /// Number of tiles
    pub tile_count: u64,
    /// Lowest zoom level present
    pub min_zoom: u8,
    /// Highest zoom level present
    pub max_zoom: u8,
    /// Archive size on disk
    pub size_bytes: u64,
    /// Race-window retries consumed before the archive checked out
    pub validation_retries: u32,
    /// Tile size statistics
    pub stats: ArchiveStats,
}

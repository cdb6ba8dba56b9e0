//! Configuration types for tilecraft

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Output directory layout
///
/// Everything lives under one configurable base directory:
/// `tiles/`, `styles/`, `data/` (per-category features) and `cache/`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Base output directory (default: "./output")
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
        }
    }
}

impl OutputConfig {
    /// Directory for generated tile archives
    pub fn tiles_dir(&self) -> PathBuf {
        self.base_dir.join("tiles")
    }

    /// Directory for style documents
    pub fn styles_dir(&self) -> PathBuf {
        self.base_dir.join("styles")
    }

    /// Directory for per-category feature files
    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join("data")
    }

    /// Default content store root
    pub fn cache_dir(&self) -> PathBuf {
        self.base_dir.join("cache")
    }

    /// Create all output directories
    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.tiles_dir(),
            self.styles_dir(),
            self.data_dir(),
            self.cache_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }
}

/// Content store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable the content store (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cache root (None = `<base_dir>/cache`)
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Free space required before a copy, as a multiple of the source size (default: 2.0)
    #[serde(default = "default_space_multiplier")]
    pub space_multiplier: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            space_multiplier: default_space_multiplier(),
        }
    }
}

/// Backoff and attempt limits for one retrying call site
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (default: 2 seconds)
    #[serde(default = "default_base_delay", with = "duration_serde")]
    pub base_delay: Duration,

    /// Upper bound for any delay, jitter included (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Lower bound for any delay, jitter included (default: 1 second)
    #[serde(default = "default_min_delay", with = "duration_serde")]
    pub min_delay: Duration,

    /// Apply ±25% random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            min_delay: default_min_delay(),
            jitter: true,
        }
    }
}

/// Streaming fetcher configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Equivalent Overpass interpreter endpoints, tried round-robin
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Whole-request timeout (default: 600 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// Server-side query timeout embedded in the query (default: 300 seconds)
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u32,

    /// Minimum spacing between consecutive requests (default: 1 second)
    #[serde(default = "default_min_request_interval", with = "duration_serde")]
    pub min_request_interval: Duration,

    /// Fixed wait after a rate-limit response (default: 30 seconds)
    #[serde(default = "default_rate_limit_wait", with = "duration_serde")]
    pub rate_limit_wait: Duration,

    /// Additional wait per attempt after a rate-limit response (default: 15 seconds)
    #[serde(default = "default_rate_limit_increment", with = "duration_serde")]
    pub rate_limit_increment: Duration,

    /// User agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Emit a progress event every this many bytes (default: 256 KiB)
    #[serde(default = "default_progress_interval_bytes")]
    pub progress_interval_bytes: u64,

    /// Retry policy for downloads
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            request_timeout: default_request_timeout(),
            query_timeout_secs: default_query_timeout_secs(),
            min_request_interval: default_min_request_interval(),
            rate_limit_wait: default_rate_limit_wait(),
            rate_limit_increment: default_rate_limit_increment(),
            user_agent: default_user_agent(),
            progress_interval_bytes: default_progress_interval_bytes(),
            retry: RetryConfig::default(),
        }
    }
}

/// Named bundle of generalization settings for the tile builder
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityProfile {
    /// Aggressive simplification, no limits
    Fast,
    /// Moderate simplification (default)
    #[default]
    Balanced,
    /// Light simplification, builder limits enforced
    HighQuality,
}

/// Generation settings implied by a [`QualityProfile`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QualitySettings {
    /// Geometry simplification factor
    pub simplification: f64,
    /// Feature drop rate
    pub drop_rate: f64,
    /// Pass `--no-feature-limit`
    pub no_feature_limit: bool,
    /// Pass `--no-tile-size-limit`
    pub no_tile_size_limit: bool,
}

impl QualityProfile {
    /// Settings for this profile
    pub fn settings(self) -> QualitySettings {
        match self {
            QualityProfile::Fast => QualitySettings {
                simplification: 2.0,
                drop_rate: 4.0,
                no_feature_limit: true,
                no_tile_size_limit: true,
            },
            QualityProfile::Balanced => QualitySettings {
                simplification: 1.0,
                drop_rate: 2.5,
                no_feature_limit: true,
                no_tile_size_limit: false,
            },
            QualityProfile::HighQuality => QualitySettings {
                simplification: 0.5,
                drop_rate: 1.5,
                no_feature_limit: false,
                no_tile_size_limit: false,
            },
        }
    }

    /// Profile name as used in configuration files
    pub fn as_str(self) -> &'static str {
        match self {
            QualityProfile::Fast => "fast",
            QualityProfile::Balanced => "balanced",
            QualityProfile::HighQuality => "high_quality",
        }
    }
}

/// Vector tile generation settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TileConfig {
    /// Minimum zoom level (default: 0)
    #[serde(default)]
    pub min_zoom: u8,

    /// Maximum zoom level (default: 14)
    #[serde(default = "default_max_zoom")]
    pub max_zoom: u8,

    /// Tile buffer in pixels (default: 64)
    #[serde(default = "default_buffer")]
    pub buffer: u32,

    /// Tile detail level, 7 to 15 (default: 12)
    #[serde(default = "default_detail")]
    pub detail: u8,

    /// Quality profile (default: balanced)
    #[serde(default)]
    pub quality_profile: QualityProfile,

    /// Simplification override (None = taken from the quality profile)
    #[serde(default)]
    pub simplification: Option<f64>,

    /// Drop rate override (None = taken from the quality profile)
    #[serde(default)]
    pub drop_rate: Option<f64>,

    /// Simplification at the maximum zoom level (None = builder default)
    #[serde(default)]
    pub simplification_at_max_zoom: Option<f64>,

    /// Multiplier applied per retry attempt to drop rate and simplification (default: 1.5)
    #[serde(default = "default_escalation_factor")]
    pub escalation_factor: f64,

    /// Ceiling for the escalated drop rate (default: 10.0)
    #[serde(default = "default_escalation_cap")]
    pub max_drop_rate: f64,

    /// Ceiling for the escalated simplification (default: 10.0)
    #[serde(default = "default_escalation_cap")]
    pub max_simplification: f64,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            min_zoom: 0,
            max_zoom: default_max_zoom(),
            buffer: default_buffer(),
            detail: default_detail(),
            quality_profile: QualityProfile::default(),
            simplification: None,
            drop_rate: None,
            simplification_at_max_zoom: None,
            escalation_factor: default_escalation_factor(),
            max_drop_rate: default_escalation_cap(),
            max_simplification: default_escalation_cap(),
        }
    }
}

/// Supervised tile builder execution settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Tile builder binary name looked up on PATH (default: "tippecanoe")
    #[serde(default = "default_tool")]
    pub tool: String,

    /// Explicit tile builder path (overrides PATH lookup)
    #[serde(default)]
    pub tool_path: Option<PathBuf>,

    /// Per-attempt timeout (default: 3600 seconds)
    #[serde(default = "default_process_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Retry policy for resource-exhaustion failures
    #[serde(default = "default_process_retry")]
    pub retry: RetryConfig,

    /// Memory usage that triggers a single warning (default: 85%)
    #[serde(default = "default_memory_warning_percent")]
    pub memory_warning_percent: f64,

    /// Memory usage that aborts the run (default: 95%)
    #[serde(default = "default_memory_critical_percent")]
    pub memory_critical_percent: f64,

    /// Interval between memory samples (default: 10 seconds)
    #[serde(default = "default_memory_check_interval", with = "duration_serde")]
    pub memory_check_interval: Duration,

    /// Sub-interval the monitor sleeps in, bounding cancellation latency (default: 0.25 seconds)
    #[serde(default = "default_memory_poll_step", with = "duration_serde")]
    pub memory_poll_step: Duration,

    /// Number of trailing output lines kept for failure classification (default: 20)
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,

    /// Wait between the graceful terminate signal and a forced kill (default: 5 seconds)
    #[serde(default = "default_termination_grace", with = "duration_serde")]
    pub termination_grace: Duration,

    /// Timeout for the `--version` probe (default: 10 seconds)
    #[serde(default = "default_version_probe_timeout", with = "duration_serde")]
    pub version_probe_timeout: Duration,

    /// Available memory above which `--read-parallel` is passed (default: 8 GiB)
    #[serde(default = "default_read_parallel_min_bytes")]
    pub read_parallel_min_bytes: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            tool: default_tool(),
            tool_path: None,
            timeout: default_process_timeout(),
            retry: default_process_retry(),
            memory_warning_percent: default_memory_warning_percent(),
            memory_critical_percent: default_memory_critical_percent(),
            memory_check_interval: default_memory_check_interval(),
            memory_poll_step: default_memory_poll_step(),
            tail_lines: default_tail_lines(),
            termination_grace: default_termination_grace(),
            version_probe_timeout: default_version_probe_timeout(),
            read_parallel_min_bytes: default_read_parallel_min_bytes(),
        }
    }
}

/// Archive validation settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Attempts for race-prone checks (default: 3)
    #[serde(default = "default_validation_attempts")]
    pub max_attempts: u32,

    /// Fixed delay between attempts (default: 2 seconds)
    #[serde(default = "default_validation_delay", with = "duration_serde")]
    pub retry_delay: Duration,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_validation_attempts(),
            retry_delay: default_validation_delay(),
        }
    }
}

/// Main configuration for tilecraft
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Output directory layout
    #[serde(default)]
    pub output: OutputConfig,

    /// Content store
    #[serde(default)]
    pub cache: CacheConfig,

    /// Raw data download
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Tile generation parameters
    #[serde(default)]
    pub tiles: TileConfig,

    /// Tile builder supervision
    #[serde(default)]
    pub process: ProcessConfig,

    /// Archive validation
    #[serde(default)]
    pub validation: ValidationConfig,
}

impl Config {
    /// Load and validate a JSON configuration file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Content store root
    pub fn cache_dir(&self) -> PathBuf {
        self.cache
            .dir
            .clone()
            .unwrap_or_else(|| self.output.cache_dir())
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        let tiles = &self.tiles;
        if tiles.max_zoom > 24 {
            return Err(config_error("maximum zoom must be <= 24", "tiles.max_zoom"));
        }
        if tiles.max_zoom < tiles.min_zoom {
            return Err(config_error(
                "maximum zoom must be >= minimum zoom",
                "tiles.max_zoom",
            ));
        }
        if !(7..=15).contains(&tiles.detail) {
            return Err(config_error(
                "detail must be between 7 and 15",
                "tiles.detail",
            ));
        }
        if tiles.escalation_factor <= 1.0 {
            return Err(config_error(
                "escalation factor must be greater than 1",
                "tiles.escalation_factor",
            ));
        }
        for (value, key) in [
            (tiles.simplification, "tiles.simplification"),
            (tiles.drop_rate, "tiles.drop_rate"),
        ] {
            if let Some(v) = value
                && (!v.is_finite() || v <= 0.0)
            {
                return Err(config_error("must be a positive number", key));
            }
        }

        if self.fetch.endpoints.is_empty() {
            return Err(config_error(
                "at least one endpoint is required",
                "fetch.endpoints",
            ));
        }
        for endpoint in &self.fetch.endpoints {
            if let Err(e) = url::Url::parse(endpoint) {
                return Err(config_error(
                    &format!("invalid endpoint URL '{endpoint}': {e}"),
                    "fetch.endpoints",
                ));
            }
        }

        validate_retry(&self.fetch.retry, "fetch.retry")?;
        validate_retry(&self.process.retry, "process.retry")?;

        let process = &self.process;
        if !(0.0 < process.memory_warning_percent
            && process.memory_warning_percent < process.memory_critical_percent
            && process.memory_critical_percent <= 100.0)
        {
            return Err(config_error(
                "memory thresholds must satisfy 0 < warning < critical <= 100",
                "process.memory_critical_percent",
            ));
        }
        if process.memory_poll_step.is_zero() {
            return Err(config_error(
                "poll step must be positive",
                "process.memory_poll_step",
            ));
        }
        if process.tail_lines == 0 {
            return Err(config_error(
                "at least one output line must be kept",
                "process.tail_lines",
            ));
        }

        if self.validation.max_attempts == 0 {
            return Err(config_error(
                "at least one validation attempt is required",
                "validation.max_attempts",
            ));
        }

        if self.cache.space_multiplier.is_nan() || self.cache.space_multiplier < 1.0 {
            return Err(config_error(
                "space multiplier must be at least 1",
                "cache.space_multiplier",
            ));
        }

        Ok(())
    }
}

fn validate_retry(retry: &RetryConfig, prefix: &str) -> Result<()> {
    if retry.max_attempts == 0 {
        return Err(config_error(
            "at least one attempt is required",
            &format!("{prefix}.max_attempts"),
        ));
    }
    if retry.min_delay > retry.max_delay {
        return Err(config_error(
            "minimum delay must not exceed maximum delay",
            &format!("{prefix}.min_delay"),
        ));
    }
    if retry.base_delay > retry.max_delay {
        return Err(config_error(
            "base delay must not exceed maximum delay",
            &format!("{prefix}.base_delay"),
        ));
    }
    Ok(())
}

fn config_error(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("./output")
}

fn default_true() -> bool {
    true
}

fn default_space_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_min_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_endpoints() -> Vec<String> {
    vec![
        "https://overpass-api.de/api/interpreter".to_string(),
        "https://lz4.overpass-api.de/api/interpreter".to_string(),
        "https://z.overpass-api.de/api/interpreter".to_string(),
    ]
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_query_timeout_secs() -> u32 {
    300
}

fn default_min_request_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_rate_limit_wait() -> Duration {
    Duration::from_secs(30)
}

fn default_rate_limit_increment() -> Duration {
    Duration::from_secs(15)
}

fn default_user_agent() -> String {
    format!("Tilecraft OSM Downloader/{}", env!("CARGO_PKG_VERSION"))
}

fn default_progress_interval_bytes() -> u64 {
    256 * 1024
}

fn default_max_zoom() -> u8 {
    14
}

fn default_buffer() -> u32 {
    64
}

fn default_detail() -> u8 {
    12
}

fn default_escalation_factor() -> f64 {
    1.5
}

fn default_escalation_cap() -> f64 {
    10.0
}

fn default_tool() -> String {
    "tippecanoe".to_string()
}

fn default_process_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_process_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_delay: Duration::from_secs(5),
        max_delay: Duration::from_secs(60),
        min_delay: Duration::from_secs(1),
        jitter: true,
    }
}

fn default_memory_warning_percent() -> f64 {
    85.0
}

fn default_memory_critical_percent() -> f64 {
    95.0
}

fn default_memory_check_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_memory_poll_step() -> Duration {
    Duration::from_millis(250)
}

fn default_tail_lines() -> usize {
    20
}

fn default_termination_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_version_probe_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_read_parallel_min_bytes() -> u64 {
    8 * 1024 * 1024 * 1024
}

fn default_validation_attempts() -> u32 {
    3
}

fn default_validation_delay() -> Duration {
    Duration::from_secs(2)
}

// Durations are written as (fractional) seconds
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

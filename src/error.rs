//! Error types for tilecraft
//!
//! Every component boundary raises its own narrow error type:
//! - [`FetchError`] for the streaming downloader
//! - [`ProcessError`] for the supervised tile builder
//! - [`ValidationError`] for archive certification
//! - [`CacheError`] for the content store (never surfaced by the pipeline)
//!
//! All of them implement [`Classify`], which maps each failure to a short
//! machine-readable tag plus a human-readable remediation hint, and
//! [`IsRetryable`](crate::retry::IsRetryable), which drives the retry loops.

use crate::types::Stage;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for tilecraft operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tilecraft
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "tiles.max_zoom")
        key: Option<String>,
    },

    /// Raw data download failed
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Tile builder execution failed
    #[error("tile generation error: {0}")]
    Process(#[from] ProcessError),

    /// Produced archive failed validation
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Cache operation failed
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Feature extraction collaborator failed
    #[error("extraction failed for {category}: {reason}")]
    Extraction {
        /// Category being extracted
        category: String,
        /// What went wrong
        reason: String,
    },

    /// A pipeline stage failed terminally
    #[error(transparent)]
    Stage(#[from] StageFailure),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Number of attempts consumed before this error surfaced
    pub fn attempts(&self) -> u32 {
        match self {
            Error::Fetch(FetchError::RetriesExhausted { attempts, .. }) => *attempts,
            Error::Process(ProcessError::RetriesExhausted { attempts, .. }) => *attempts,
            Error::Fetch(FetchError::Aborted { attempts, .. }) => *attempts,
            Error::Process(ProcessError::Aborted { attempts, .. }) => *attempts,
            Error::Validation(ValidationError::StillIncomplete { attempts, .. }) => *attempts,
            Error::Validation(ValidationError::Aborted { attempts, .. }) => *attempts,
            Error::Stage(failure) => failure.attempts,
            _ => 1,
        }
    }
}

/// Terminal failure of one pipeline stage
///
/// Reports which stage failed, the classified cause and how many attempts were
/// made, so an operator can tell "transient, try again" from "permanent, fix input".
#[derive(Debug, Error)]
#[error("{stage} stage failed after {attempts} attempt(s) [{}]: {source}", .source.classification())]
pub struct StageFailure {
    /// The stage that failed
    pub stage: Stage,
    /// Attempts made before giving up
    pub attempts: u32,
    /// The classified cause
    #[source]
    pub source: Box<Error>,
}

impl StageFailure {
    /// Wrap an error as the terminal failure of `stage`
    pub fn new(stage: Stage, source: impl Into<Error>) -> Self {
        let source = source.into();
        Self {
            stage,
            attempts: source.attempts(),
            source: Box::new(source),
        }
    }
}

/// Errors raised by the streaming fetcher
#[derive(Debug, Error)]
pub enum FetchError {
    /// Upstream rejected the request with a rate limit (HTTP 429)
    #[error("rate limited by {endpoint}: {message}")]
    RateLimited {
        /// Endpoint that rate-limited us
        endpoint: String,
        /// Summary of the upstream error body
        message: String,
    },

    /// Request did not complete within the configured timeout
    #[error("request to {endpoint} timed out after {after:?}")]
    Timeout {
        /// Endpoint that timed out
        endpoint: String,
        /// Configured request timeout
        after: Duration,
    },

    /// 5xx response or broken connection
    #[error("transient service error from {endpoint}{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    TransientService {
        /// Endpoint that failed
        endpoint: String,
        /// HTTP status, if a response was received
        status: Option<u16>,
        /// Summary of the failure
        message: String,
    },

    /// 4xx response other than rate limiting; retrying cannot help
    #[error("permanent error from {endpoint} (HTTP {status}): {message}")]
    Permanent {
        /// Endpoint that rejected the request
        endpoint: String,
        /// HTTP status code
        status: u16,
        /// Summary of the upstream error body
        message: String,
    },

    /// Upstream answered successfully but with an empty document
    ///
    /// Overpass answers even an empty area with an `<osm>` envelope, so a
    /// zero-byte body is treated as a truncated transfer and retried.
    #[error("empty response from {endpoint}")]
    EmptyResponse {
        /// Endpoint that returned nothing
        endpoint: String,
    },

    /// Local write of the downloaded document failed
    #[error("failed to write {path}: {source}")]
    Io {
        /// Destination being written
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// HTTP client could not be constructed
    #[error("failed to build HTTP client: {0}")]
    Client(String),

    /// The retry budget ran out; carries the last classified error
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
        /// Last error seen
        last: Box<FetchError>,
    },

    /// A permanent error ended the loop after earlier transient failures
    #[error("stopped after {attempts} attempts: {last}")]
    Aborted {
        /// Attempts made, including the one that failed permanently
        attempts: u32,
        /// The permanent error
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// Attach the attempt count to a permanent error that ended a retry loop
    pub(crate) fn after_attempts(self, attempts: u32) -> Self {
        if attempts > 1 {
            FetchError::Aborted {
                attempts,
                last: Box::new(self),
            }
        } else {
            self
        }
    }
}

/// Why a tile builder run exited unsuccessfully, derived from its final output lines
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCause {
    /// The builder ran out of memory
    OutOfMemory,
    /// The builder was killed (usually by the OOM killer)
    Killed,
    /// An input file was missing
    MissingInput,
    /// An input file could not be parsed
    MalformedInput,
    /// Inputs contained nothing to process
    EmptyInput,
    /// None of the known signatures matched
    Unknown,
}

impl FailureCause {
    /// Machine-readable tag
    pub fn tag(self) -> &'static str {
        match self {
            FailureCause::OutOfMemory => "out-of-memory",
            FailureCause::Killed => "killed",
            FailureCause::MissingInput => "missing-input",
            FailureCause::MalformedInput => "malformed-input",
            FailureCause::EmptyInput => "empty-input",
            FailureCause::Unknown => "unknown",
        }
    }

    /// Human-readable explanation
    pub fn describe(self) -> &'static str {
        match self {
            FailureCause::OutOfMemory => {
                "out of memory - try reducing the dataset size or using a machine with more RAM"
            }
            FailureCause::Killed => "process was killed - likely due to memory constraints",
            FailureCause::MissingInput => "input file not found",
            FailureCause::MalformedInput => "invalid GeoJSON format in input file",
            FailureCause::EmptyInput => "empty input file or no features to process",
            FailureCause::Unknown => "unknown tile builder error",
        }
    }

    /// Whether a more conservative retry can plausibly succeed
    pub fn is_resource_exhaustion(self) -> bool {
        matches!(self, FailureCause::OutOfMemory | FailureCause::Killed)
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Errors raised while driving the external tile builder
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Builder binary could not be found
    #[error("{tool} not found: {help}")]
    ToolNotFound {
        /// Tool name or path that was searched for
        tool: String,
        /// Installation instructions
        help: String,
    },

    /// Builder binary exists but is not executable
    #[error("{path} is not executable")]
    NotExecutable {
        /// Resolved binary path
        path: PathBuf,
    },

    /// Spawning the child process failed
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        /// Tool being spawned
        tool: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Builder exited unsuccessfully
    #[error("tile builder failed (exit code {}): {}{}", .exit_code.map(|c| c.to_string()).unwrap_or_else(|| "none".into()), .cause.describe(), .detail.as_ref().map(|d| format!(" ({d})")).unwrap_or_default())]
    Failed {
        /// Classified cause
        cause: FailureCause,
        /// Exit code if the process exited normally
        exit_code: Option<i32>,
        /// First meaningful output line, for unknown failures
        detail: Option<String>,
    },

    /// Run exceeded its timeout and was terminated
    #[error("tile builder timed out after {after:?}")]
    TimedOut {
        /// The timeout that expired
        after: Duration,
    },

    /// Run was cancelled by the caller
    #[error("tile builder run was cancelled")]
    Cancelled,

    /// Memory monitor aborted the run
    #[error("critical memory usage: {percent:.1}%")]
    CriticalMemoryPressure {
        /// System memory usage when the run was aborted
        percent: f64,
    },

    /// Builder reported success but its output is missing
    #[error("tile builder completed but output {path} was not found")]
    MissingOutput {
        /// Expected temporary output
        path: PathBuf,
    },

    /// No per-category input had usable features
    #[error("no valid feature files with data found (empty: [{}], invalid: [{}])", .empty.join(", "), .invalid.join(", "))]
    NoUsableInput {
        /// Categories whose files had no features
        empty: Vec<String>,
        /// Descriptions of files that were missing or malformed
        invalid: Vec<String>,
    },

    /// Filesystem operation around the run failed
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The retry budget ran out; carries the last classified error
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
        /// Last error seen
        last: Box<ProcessError>,
    },

    /// A non-retryable failure ended the loop after earlier retries
    #[error("stopped after {attempts} attempts: {last}")]
    Aborted {
        /// Attempts made, including the final one
        attempts: u32,
        /// The non-retryable error
        last: Box<ProcessError>,
    },
}

impl ProcessError {
    /// Attach the attempt count to a non-retryable error that ended a retry loop
    pub(crate) fn after_attempts(self, attempts: u32) -> Self {
        if attempts > 1 {
            ProcessError::Aborted {
                attempts,
                last: Box::new(self),
            }
        } else {
            self
        }
    }
}

/// Errors raised by the artifact validator
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Archive does not exist
    #[error("output file not found: {path}")]
    NotFound {
        /// Expected archive path
        path: PathBuf,
    },

    /// Archive has zero length
    #[error("output file is empty: {path}")]
    Empty {
        /// Archive path
        path: PathBuf,
    },

    /// Integrity check failed or the file is not a database
    #[error("archive {path} is corrupted: {detail}")]
    Corrupt {
        /// Archive path
        path: PathBuf,
        /// What the integrity check reported
        detail: String,
    },

    /// Archive could not be opened or read (locked, still being written)
    #[error("archive unavailable: {0}")]
    Unavailable(String),

    /// Required tables are absent
    #[error("missing required tables: {}", .0.join(", "))]
    MissingTables(Vec<String>),

    /// Neither the `tiles` layout nor the `map`+`images` layout is present
    #[error("unrecognized archive layout (expected 'tiles' table or 'map'+'images' tables, found: {})", .0.join(", "))]
    UnrecognizedLayout(Vec<String>),

    /// Metadata has no `format` entry
    #[error("missing format in metadata")]
    MissingFormat,

    /// Archive contains no tiles
    #[error("no tiles generated")]
    NoTiles,

    /// Zoom range could not be determined
    #[error("invalid zoom levels in tiles")]
    InvalidZoom,

    /// First tile record is empty or unreadable
    #[error("invalid tile data found")]
    UnreadableSample,

    /// Race-window retries ran out; carries the last reason
    #[error("archive still incomplete after {attempts} attempts: {last}")]
    StillIncomplete {
        /// Attempts made
        attempts: u32,
        /// Last failed check
        last: Box<ValidationError>,
    },

    /// A definitive failure followed earlier race-window retries
    #[error("archive rejected after {attempts} attempts: {last}")]
    Aborted {
        /// Attempts made, including the final one
        attempts: u32,
        /// The definitive failure
        last: Box<ValidationError>,
    },
}

impl ValidationError {
    /// Attach the attempt count to a definitive failure that ended a retry loop
    pub(crate) fn after_attempts(self, attempts: u32) -> Self {
        if attempts > 1 {
            ValidationError::Aborted {
                attempts,
                last: Box::new(self),
            }
        } else {
            self
        }
    }
}

/// Errors raised by the content store
#[derive(Debug, Error)]
pub enum CacheError {
    /// Not enough free space for a safe copy
    #[error("insufficient disk space: need {required} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Bytes required (twice the source size)
        required: u64,
        /// Bytes currently available
        available: u64,
    },

    /// Filesystem error while reading, copying or renaming
    #[error("cache I/O error on {path}: {source}")]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Copy task panicked or was cancelled
    #[error("cache copy task failed: {0}")]
    Task(String),
}

/// Map failures to a machine-relevant classification tag and a remediation hint
///
/// The tag set is closed: rate-limited, timeout, transient-service-error,
/// permanent-error, out-of-memory, killed, malformed-input, missing-input,
/// empty-input, validation-error, plus a few local ones (config-error,
/// tool-missing, io-error, cache-error, extraction-error, cancelled, unknown).
pub trait Classify {
    /// Short machine-readable classification
    fn classification(&self) -> &'static str;

    /// Human-readable remediation hint
    fn remediation(&self) -> &'static str;
}

impl Classify for FetchError {
    fn classification(&self) -> &'static str {
        match self {
            FetchError::RateLimited { .. } => "rate-limited",
            FetchError::Timeout { .. } => "timeout",
            FetchError::TransientService { .. } | FetchError::EmptyResponse { .. } => {
                "transient-service-error"
            }
            FetchError::Permanent { .. } => "permanent-error",
            FetchError::Io { .. } => "io-error",
            FetchError::Client(_) => "config-error",
            FetchError::RetriesExhausted { last, .. } | FetchError::Aborted { last, .. } => {
                last.classification()
            }
        }
    }

    fn remediation(&self) -> &'static str {
        match self {
            FetchError::RateLimited { .. } => {
                "the data service is throttling requests; wait a few minutes and try again"
            }
            FetchError::Timeout { .. } => {
                "the query took too long; try a smaller bounding box or fewer categories"
            }
            FetchError::TransientService { .. } => {
                "the data service is temporarily unavailable; try again later"
            }
            FetchError::Permanent { .. } => {
                "the request was rejected; check the bounding box and category filters"
            }
            FetchError::EmptyResponse { .. } => {
                "the service returned no data; try again later or verify the bounding box covers mapped land"
            }
            FetchError::Io { .. } => "check free space and permissions of the output directory",
            FetchError::Client(_) => "check the fetch configuration (timeouts, user agent)",
            FetchError::RetriesExhausted { last, .. } | FetchError::Aborted { last, .. } => {
                last.remediation()
            }
        }
    }
}

impl Classify for ProcessError {
    fn classification(&self) -> &'static str {
        match self {
            ProcessError::ToolNotFound { .. } | ProcessError::NotExecutable { .. } => {
                "tool-missing"
            }
            ProcessError::Spawn { .. } | ProcessError::Io { .. } => "io-error",
            ProcessError::Failed { cause, .. } => cause.tag(),
            ProcessError::TimedOut { .. } => "timeout",
            ProcessError::Cancelled => "cancelled",
            ProcessError::CriticalMemoryPressure { .. } => "out-of-memory",
            ProcessError::MissingOutput { .. } => "unknown",
            ProcessError::NoUsableInput { .. } => "empty-input",
            ProcessError::RetriesExhausted { last, .. } | ProcessError::Aborted { last, .. } => {
                last.classification()
            }
        }
    }

    fn remediation(&self) -> &'static str {
        match self {
            ProcessError::ToolNotFound { .. } => {
                "install tippecanoe (brew install tippecanoe / apt install tippecanoe) or set process.tool_path"
            }
            ProcessError::NotExecutable { .. } => "mark the tile builder binary as executable",
            ProcessError::Spawn { .. } => "check system resource limits and permissions",
            ProcessError::Failed { cause, .. } => match cause {
                FailureCause::OutOfMemory | FailureCause::Killed => {
                    "reduce the bounding box, pick the 'fast' quality profile or add memory"
                }
                FailureCause::MissingInput => "re-run extraction; an input layer file is missing",
                FailureCause::MalformedInput => {
                    "an input layer is not valid GeoJSON; clear the cache and re-extract"
                }
                FailureCause::EmptyInput => "the selected categories have no features in this area",
                FailureCause::Unknown => "inspect the tile builder output for details",
            },
            ProcessError::TimedOut { .. } => {
                "the dataset is too large for the timeout; shrink the area or raise process.timeout"
            }
            ProcessError::Cancelled => "the run was cancelled; start it again when ready",
            ProcessError::CriticalMemoryPressure { .. } => {
                "free memory or use a smaller bounding box before retrying"
            }
            ProcessError::MissingOutput { .. } => "check free space in the temporary directory",
            ProcessError::NoUsableInput { .. } => {
                "try a different bounding box or more common categories (roads, buildings, water)"
            }
            ProcessError::Io { .. } => "check free space and permissions of the output directory",
            ProcessError::RetriesExhausted { last, .. } | ProcessError::Aborted { last, .. } => {
                last.remediation()
            }
        }
    }
}

impl Classify for ValidationError {
    fn classification(&self) -> &'static str {
        "validation-error"
    }

    fn remediation(&self) -> &'static str {
        match self {
            ValidationError::Corrupt { .. } => "delete the archive and regenerate it",
            ValidationError::Aborted { last, .. } => last.remediation(),
            ValidationError::NoTiles | ValidationError::Empty { .. } => {
                "the tile builder produced no tiles; check the zoom range and inputs"
            }
            _ => "regenerate the archive; the tile builder may have been interrupted",
        }
    }
}

impl Classify for CacheError {
    fn classification(&self) -> &'static str {
        "cache-error"
    }

    fn remediation(&self) -> &'static str {
        "free disk space or disable caching"
    }
}

impl Classify for Error {
    fn classification(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config-error",
            Error::Fetch(e) => e.classification(),
            Error::Process(e) => e.classification(),
            Error::Validation(e) => e.classification(),
            Error::Cache(e) => e.classification(),
            Error::Extraction { .. } => "extraction-error",
            Error::Stage(failure) => failure.source.classification(),
            Error::Io(_) => "io-error",
            Error::Serialization(_) => "malformed-input",
        }
    }

    fn remediation(&self) -> &'static str {
        match self {
            Error::Config { .. } => "fix the named configuration key",
            Error::Fetch(e) => e.remediation(),
            Error::Process(e) => e.remediation(),
            Error::Validation(e) => e.remediation(),
            Error::Cache(e) => e.remediation(),
            Error::Extraction { .. } => "check the downloaded data and category filters",
            Error::Stage(failure) => failure.source.remediation(),
            Error::Io(_) => "check free space and permissions of the output directory",
            Error::Serialization(_) => "the file is not valid JSON",
        }
    }
}

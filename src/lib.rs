//! # tilecraft
//!
//! Resilient vector tile pipeline: fetch map data for a bounding box, split
//! it into per-category GeoJSON layers, build an MBTiles archive with an
//! external tile builder and validate the result.
//!
//! ## Design Philosophy
//!
//! - **Cache first** - every stage is served from a content-addressed store
//!   when its inputs and settings are unchanged
//! - **Classified failures** - every error carries a machine tag and a
//!   remediation hint; only transient failures are retried
//! - **Supervised child processes** - the tile builder runs under a memory
//!   monitor and a timeout, and never outlives a failed run
//! - **Library-first** - no CLI; progress is published as [`Event`]s
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use tilecraft::{CategoryFilter, Config, FeatureExtractor, TagFilter, TilePipeline, TileRequest};
//!
//! struct MyExtractor;
//!
//! #[async_trait::async_trait]
//! impl FeatureExtractor for MyExtractor {
//!     async fn extract(
//!         &self,
//!         _raw_data: &Path,
//!         _filter: &CategoryFilter,
//!         dest: &Path,
//!     ) -> tilecraft::Result<()> {
//!         // Parse the raw data and keep the features the filter accepts
//!         tokio::fs::write(dest, br#"{"type":"FeatureCollection","features":[]}"#).await?;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = TilePipeline::new(Config::default(), Arc::new(MyExtractor))?;
//!
//!     // Subscribe to events
//!     let mut events = pipeline.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let request = TileRequest {
//!         name: "bay".to_string(),
//!         bbox: "-122.5,37.7,-122.3,37.8".parse()?,
//!         categories: vec![CategoryFilter::new(
//!             "water",
//!             TagFilter::new().values("natural", &["water"]),
//!         )],
//!     };
//!     let output = pipeline.run(&request).await?;
//!     println!("{} tiles in {}", output.artifact.tile_count, output.artifact.path.display());
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Content-addressed artifact cache
pub mod cache;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Overpass downloads with throttling, retry and endpoint rotation
pub mod fetch;
/// End-to-end orchestration
pub mod pipeline;
/// Supervised tile builder execution
pub mod process;
/// Retry logic with exponential backoff
pub mod retry;
/// Tile generation with parameter escalation
pub mod tiles;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;
/// Tile archive validation
pub mod validate;

// Re-export commonly used types
pub use cache::{CacheKey, ContentStore, Fingerprint};
pub use config::{Config, QualityProfile};
pub use error::{
    CacheError, Classify, Error, FailureCause, FetchError, ProcessError, Result, StageFailure,
    ValidationError,
};
pub use fetch::{CategoryFilter, StreamingFetcher, TagFilter, overpass_query};
pub use pipeline::{FeatureExtractor, PipelineOutput, TilePipeline, TileRequest};
pub use process::{Invocation, MemoryProbe, ProcessOrchestrator, RunOutcome};
pub use retry::{IsRetryable, RetryPolicy};
pub use tiles::{GenerationParams, GenerationReport, LayerInput, TileGenerator, TileJob};
pub use types::{
    ArchiveLayout, ArchiveStats, BoundingBox, Category, Event, ProcessStage, Stage,
    ValidatedArtifact,
};
pub use validate::{ArchiveInspector, ArtifactValidator, SqliteInspector};

use tokio_util::sync::CancellationToken;

/// Cancel `token` when the process receives a termination signal
///
/// Pass the same token to [`ProcessOrchestrator::with_cancellation`] so a
/// running tile builder is stopped and its partial output removed.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use tilecraft::{Config, ProcessOrchestrator, cancel_on_signal};
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() {
///     let token = CancellationToken::new();
///     let orchestrator = ProcessOrchestrator::new(Config::default().process)
///         .with_cancellation(token.clone());
///     tokio::spawn(cancel_on_signal(token));
///     # drop(orchestrator);
/// }
/// ```
pub async fn cancel_on_signal(token: CancellationToken) {
    tokio::select! {
        _ = wait_for_signal() => {
            tracing::info!("Cancelling in-flight work");
            token.cancel();
        }
        _ = token.cancelled() => {}
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}

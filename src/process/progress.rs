//! Line-level interpretation of tile builder output

use crate::error::FailureCause;
use crate::types::ProcessStage;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::OnceLock;

/// `  12.3%  5/10/20` style progress lines
#[allow(clippy::expect_used)]
fn percent_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // percent, then zoom/x/y of the tile being written
        Regex::new(r"(\d+(?:\.\d+)?)%\s+(\d+)/(\d+)/(\d+)").expect("static pattern is valid")
    })
}

/// Map an output line to the stage it announces, if any
pub fn stage_for_line(line: &str) -> Option<ProcessStage> {
    let lower = line.to_lowercase();
    if lower.contains("reading features") {
        Some(ProcessStage::Reading)
    } else if lower.contains("sorting") {
        Some(ProcessStage::Sorting)
    } else if lower.contains("choosing a maxzoom") {
        Some(ProcessStage::OptimizingZoom)
    } else if (lower.contains("tile ") && line.contains('/')) || percent_regex().is_match(line) {
        Some(ProcessStage::GeneratingTiles)
    } else if lower.contains("wrote") {
        Some(ProcessStage::Finalizing)
    } else {
        None
    }
}

/// Tile progress percentage reported on a line
pub fn tile_percent(line: &str) -> Option<f32> {
    percent_regex()
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f32>().ok())
}

/// Classify why a run failed from its final output lines
///
/// Signatures are checked in priority order; unknown failures carry the first
/// non-empty line as detail.
pub fn classify_failure<S: AsRef<str>>(lines: &[S]) -> (FailureCause, Option<String>) {
    let joined = lines
        .iter()
        .map(|l| l.as_ref())
        .collect::<Vec<_>>()
        .join("\n")
        .to_lowercase();

    let cause = if joined.contains("out of memory") {
        FailureCause::OutOfMemory
    } else if joined.contains("killed") {
        FailureCause::Killed
    } else if joined.contains("no such file") {
        FailureCause::MissingInput
    } else if joined.contains("invalid geojson") {
        FailureCause::MalformedInput
    } else if joined.contains("empty") {
        FailureCause::EmptyInput
    } else {
        FailureCause::Unknown
    };

    let detail = if cause == FailureCause::Unknown {
        lines
            .iter()
            .map(|l| l.as_ref().trim())
            .find(|l| !l.is_empty())
            .map(str::to_string)
    } else {
        None
    };
    (cause, detail)
}

/// Live state of one tile builder run
#[derive(Clone, Debug)]
pub struct ProcessRun {
    /// Full command vector
    pub argv: Vec<String>,
    /// Working directory
    pub work_dir: PathBuf,
    /// When the run was started
    pub started_at: DateTime<Utc>,
    stage: ProcessStage,
    percent: Option<f32>,
    tail: VecDeque<String>,
    tail_capacity: usize,
    lines_seen: u64,
}

impl ProcessRun {
    /// Start tracking a run that keeps at most `tail_capacity` recent lines
    pub fn new(argv: Vec<String>, work_dir: PathBuf, tail_capacity: usize) -> Self {
        let tail_capacity = tail_capacity.max(1);
        Self {
            argv,
            work_dir,
            started_at: Utc::now(),
            stage: ProcessStage::Initializing,
            percent: None,
            tail: VecDeque::with_capacity(tail_capacity),
            tail_capacity,
            lines_seen: 0,
        }
    }

    /// Record one output line; returns the new stage when it changed
    pub fn observe(&mut self, line: &str) -> Option<ProcessStage> {
        let line = line.trim_end();
        self.lines_seen += 1;
        if self.tail.len() == self.tail_capacity {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());

        if let Some(percent) = tile_percent(line) {
            self.percent = Some(percent);
        }

        match stage_for_line(line) {
            Some(stage) if stage != self.stage => {
                self.stage = stage;
                Some(stage)
            }
            _ => None,
        }
    }

    /// Force a terminal stage
    pub fn finish(&mut self, stage: ProcessStage) {
        self.stage = stage;
    }

    /// Current stage
    pub fn stage(&self) -> ProcessStage {
        self.stage
    }

    /// Last reported tile percentage
    pub fn percent(&self) -> Option<f32> {
        self.percent
    }

    /// Most recent lines, oldest first
    pub fn tail(&self) -> Vec<String> {
        self.tail.iter().cloned().collect()
    }

    /// Total lines observed
    pub fn lines_seen(&self) -> u64 {
        self.lines_seen
    }

    /// Classify the run's failure from its tail
    pub fn classify_failure(&self) -> (FailureCause, Option<String>) {
        classify_failure(&self.tail())
    }
}

//! Supervised execution of the external tile builder
//!
//! [`ProcessOrchestrator::run`] spawns the builder in its own process group,
//! streams its combined output through a [`ProcessRun`] tracker, watches a
//! memory monitor task and a wall-clock timeout, and only moves the builder's
//! temporary output to its final location after a clean exit. Whatever the
//! outcome, the monitor is cancelled and joined before `run` returns and a
//! failed run never leaves its temporary output behind.

mod memory;
mod progress;
mod tool;

pub use memory::{
    MemInfo, MemoryProbe, MonitorReport, MonitorSettings, SystemMemoryProbe, monitor_memory,
    parse_meminfo,
};
pub use progress::{ProcessRun, classify_failure, stage_for_line, tile_percent};
pub use tool::{INSTALL_HELP, ToolCheck, check_tool, locate_tool};

use crate::config::ProcessConfig;
use crate::error::{FailureCause, ProcessError};
use crate::types::{Event, ProcessStage};
use crate::utils::remove_file_if_exists;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One tile builder invocation
#[derive(Clone, Debug)]
pub struct Invocation {
    /// Command vector; the first element is the binary name or path
    pub argv: Vec<String>,
    /// Working directory for the child
    pub work_dir: PathBuf,
    /// Where the builder writes its output
    pub temp_output: PathBuf,
    /// Where the output is moved after a clean exit
    pub final_output: PathBuf,
    /// Run the memory monitor alongside the child
    pub monitor_memory: bool,
}

/// Result of a successful run
#[derive(Clone, Debug)]
pub struct RunOutcome {
    /// Final artifact location
    pub output: PathBuf,
    /// Child exit code
    pub exit_code: Option<i32>,
    /// Last output lines
    pub tail: Vec<String>,
    /// Total output lines
    pub lines: u64,
    /// Monitor findings, when memory was monitored
    pub memory: Option<MonitorReport>,
    /// Wall-clock duration
    pub duration: Duration,
}

/// How supervision of a running child ended
enum Exit {
    Exited(std::io::Result<ExitStatus>),
    CriticalMemory(f64),
    Cancelled,
    TimedOut,
}

/// Runs the tile builder under memory and time supervision
#[derive(Clone, Debug)]
pub struct ProcessOrchestrator {
    config: ProcessConfig,
    probe: Arc<dyn MemoryProbe>,
    event_tx: Option<broadcast::Sender<Event>>,
    cancel: CancellationToken,
}

impl ProcessOrchestrator {
    /// Create an orchestrator sampling real system memory
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            probe: Arc::new(SystemMemoryProbe),
            event_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the memory probe
    pub fn with_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Publish stage changes and memory samples on `tx`
    pub fn with_events(mut self, tx: broadcast::Sender<Event>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Abort in-flight runs when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Process configuration
    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Memory probe used by the monitor
    pub fn probe(&self) -> &Arc<dyn MemoryProbe> {
        &self.probe
    }

    /// Resolve the configured tile builder binary
    pub fn resolve_tool(&self) -> Result<PathBuf, ProcessError> {
        locate_tool(&self.config.tool, self.config.tool_path.as_deref())
    }

    /// Locate the tile builder and probe its version
    pub async fn check_tool(&self) -> Result<ToolCheck, ProcessError> {
        check_tool(
            &self.config.tool,
            self.config.tool_path.as_deref(),
            self.config.version_probe_timeout,
        )
        .await
    }

    fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            warning_percent: self.config.memory_warning_percent,
            critical_percent: self.config.memory_critical_percent,
            check_interval: self.config.memory_check_interval,
            poll_step: self.config.memory_poll_step,
        }
    }

    fn emit(&self, event: Event) {
        if let Some(tx) = &self.event_tx {
            tx.send(event).ok();
        }
    }

    /// Run one invocation to completion
    ///
    /// Returns the final artifact path on a clean exit that produced output.
    pub async fn run(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<RunOutcome, ProcessError> {
        let Some(program) = invocation.argv.first() else {
            return Err(ProcessError::Spawn {
                tool: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };
        let program_path = Path::new(program);
        let binary = if program_path.components().count() > 1 {
            locate_tool(program, Some(program_path))?
        } else {
            locate_tool(program, None)?
        };

        // A stale output from an earlier crash must not be mistaken for ours
        remove_file_if_exists(&invocation.temp_output)
            .await
            .map_err(|source| ProcessError::Io {
                path: invocation.temp_output.clone(),
                source,
            })?;

        tracing::info!(
            command = %invocation.argv.join(" "),
            work_dir = %invocation.work_dir.display(),
            timeout_secs = timeout.as_secs(),
            "Starting tile builder"
        );

        let mut command = Command::new(&binary);
        command
            .args(&invocation.argv[1..])
            .current_dir(&invocation.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            tool: binary.display().to_string(),
            source,
        })?;

        let started = Instant::now();
        let mut run = ProcessRun::new(
            invocation.argv.clone(),
            invocation.work_dir.clone(),
            self.config.tail_lines,
        );

        let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
        let mut forwarders: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(tokio::spawn(forward_lines(stdout, line_tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(tokio::spawn(forward_lines(stderr, line_tx.clone())));
        }
        drop(line_tx);

        let (alert_tx, mut alert_rx) = watch::channel::<Option<f64>>(None);
        let monitor_cancel = CancellationToken::new();
        let mut idle_alert = None;
        let monitor = if invocation.monitor_memory {
            Some(tokio::spawn(monitor_memory(
                Arc::clone(&self.probe),
                self.monitor_settings(),
                alert_tx,
                monitor_cancel.clone(),
                self.event_tx.clone(),
            )))
        } else {
            // Keep the sender alive so the alert branch simply never fires
            idle_alert = Some(alert_tx);
            None
        };

        let supervise = async {
            let mut lines_open = true;
            let mut alert_open = true;
            loop {
                tokio::select! {
                    line = line_rx.recv(), if lines_open => match line {
                        Some(line) => {
                            tracing::debug!(line = %line, "tile builder");
                            if let Some(stage) = run.observe(&line) {
                                tracing::info!(stage = %stage, "Tile builder stage changed");
                                self.emit(Event::ProcessStageChanged { stage, percent: run.percent() });
                            }
                        }
                        None => lines_open = false,
                    },
                    changed = alert_rx.changed(), if alert_open => match changed {
                        Ok(()) => {
                            if let Some(percent) = *alert_rx.borrow() {
                                return Exit::CriticalMemory(percent);
                            }
                        }
                        Err(_) => alert_open = false,
                    },
                    status = child.wait(), if !lines_open => return Exit::Exited(status),
                    _ = self.cancel.cancelled() => return Exit::Cancelled,
                }
            }
        };

        let exit = match tokio::time::timeout(timeout, supervise).await {
            Ok(exit) => exit,
            Err(_) => Exit::TimedOut,
        };

        if !matches!(exit, Exit::Exited(_)) {
            self.terminate(&mut child).await;
        }

        for handle in forwarders {
            handle.abort();
            handle.await.ok();
        }
        monitor_cancel.cancel();
        let memory = match monitor {
            Some(handle) => handle.await.ok(),
            None => None,
        };
        drop(idle_alert);

        let duration = started.elapsed();
        let result = match exit {
            Exit::Exited(Ok(status)) if status.success() => {
                self.commit_output(invocation).await.map(|output| RunOutcome {
                    output,
                    exit_code: status.code(),
                    tail: run.tail(),
                    lines: run.lines_seen(),
                    memory,
                    duration,
                })
            }
            Exit::Exited(Ok(status)) => {
                let (mut cause, detail) = run.classify_failure();
                if cause == FailureCause::Unknown && killed_by_signal(&status) {
                    cause = FailureCause::Killed;
                }
                tracing::error!(
                    exit_code = ?status.code(),
                    cause = %cause,
                    tail = %run.tail().join("\n"),
                    "Tile builder failed"
                );
                Err(ProcessError::Failed {
                    cause,
                    exit_code: status.code(),
                    detail,
                })
            }
            Exit::Exited(Err(source)) => Err(ProcessError::Io {
                path: binary.clone(),
                source,
            }),
            Exit::CriticalMemory(percent) => Err(ProcessError::CriticalMemoryPressure { percent }),
            Exit::Cancelled => {
                tracing::warn!("Tile builder run cancelled");
                Err(ProcessError::Cancelled)
            }
            Exit::TimedOut => {
                tracing::error!(timeout_secs = timeout.as_secs(), "Tile builder timed out");
                Err(ProcessError::TimedOut { after: timeout })
            }
        };

        match &result {
            Ok(outcome) => {
                run.finish(ProcessStage::Done);
                tracing::info!(
                    output = %outcome.output.display(),
                    duration_secs = duration.as_secs_f64(),
                    lines = outcome.lines,
                    "Tile builder finished"
                );
            }
            Err(_) => {
                run.finish(ProcessStage::Failed);
                if let Err(e) = remove_file_if_exists(&invocation.temp_output).await {
                    tracing::warn!(
                        path = %invocation.temp_output.display(),
                        error = %e,
                        "Failed to remove partial tile output"
                    );
                }
            }
        }
        self.emit(Event::ProcessStageChanged {
            stage: run.stage(),
            percent: run.percent(),
        });

        result
    }

    /// Ask the process group to stop, then force it after the grace period
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // SAFETY: signalling a process group we created; no memory is shared
                unsafe {
                    libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
                }
            }
        }
        #[cfg(not(unix))]
        child.start_kill().ok();

        match tokio::time::timeout(self.config.termination_grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(
                    grace_secs = self.config.termination_grace.as_secs_f64(),
                    "Tile builder ignored termination request, killing"
                );
                #[cfg(unix)]
                {
                    if let Some(pid) = child.id() {
                        // SAFETY: see above
                        unsafe {
                            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
                        }
                    }
                }
                child.kill().await.ok();
            }
        }
    }

    /// Move the builder's output into place
    async fn commit_output(&self, invocation: &Invocation) -> Result<PathBuf, ProcessError> {
        let temp = &invocation.temp_output;
        let dest = &invocation.final_output;

        if !tokio::fs::try_exists(temp).await.unwrap_or(false) {
            return Err(ProcessError::MissingOutput { path: temp.clone() });
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ProcessError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        if let Err(e) = tokio::fs::rename(temp, dest).await {
            // Different filesystems: fall back to copy and delete
            tracing::debug!(error = %e, "Rename failed, copying tile output instead");
            tokio::fs::copy(temp, dest)
                .await
                .map_err(|source| ProcessError::Io {
                    path: dest.clone(),
                    source,
                })?;
            remove_file_if_exists(temp).await.ok();
        }
        Ok(dest.clone())
    }
}

/// Forward a child stream line by line; carriage returns split progress updates
async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                for piece in text.split(['\r', '\n']).filter(|p| !p.trim().is_empty()) {
                    if tx.send(piece.to_string()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
fn killed_by_signal(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(libc::SIGKILL)
}

#[cfg(not(unix))]
fn killed_by_signal(_status: &ExitStatus) -> bool {
    false
}

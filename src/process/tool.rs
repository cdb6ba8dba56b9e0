//! Tile builder discovery and version probe

use crate::error::ProcessError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Installation instructions shown when the tile builder is missing
pub const INSTALL_HELP: &str = "install tippecanoe from https://github.com/felt/tippecanoe#installation \
     (macOS: brew install tippecanoe, Debian/Ubuntu: apt install tippecanoe) \
     or set process.tool_path";

/// Result of a tile builder availability check
#[derive(Clone, Debug, Serialize)]
pub struct ToolCheck {
    /// Resolved binary path
    pub path: PathBuf,
    /// First line of `--version` output, if the probe succeeded
    pub version: Option<String>,
}

/// Resolve the tile builder binary
///
/// An explicit path wins over a PATH lookup of `name`. The resolved file must
/// exist and be executable.
pub fn locate_tool(name: &str, explicit: Option<&Path>) -> Result<PathBuf, ProcessError> {
    let path = match explicit {
        Some(path) => {
            if !path.is_file() {
                return Err(ProcessError::ToolNotFound {
                    tool: path.display().to_string(),
                    help: INSTALL_HELP.to_string(),
                });
            }
            path.to_path_buf()
        }
        None => which::which(name).map_err(|_| ProcessError::ToolNotFound {
            tool: name.to_string(),
            help: INSTALL_HELP.to_string(),
        })?,
    };

    if !is_executable(&path) {
        return Err(ProcessError::NotExecutable { path });
    }
    Ok(path)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Locate the tile builder and probe its version
///
/// A failed or slow version probe is not an error; the check then reports no version.
pub async fn check_tool(
    name: &str,
    explicit: Option<&Path>,
    probe_timeout: Duration,
) -> Result<ToolCheck, ProcessError> {
    let path = locate_tool(name, explicit)?;

    let probe = Command::new(&path)
        .arg("--version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let version = match tokio::time::timeout(probe_timeout, probe).await {
        Ok(Ok(output)) => {
            // tippecanoe prints its version on stderr
            let text = format!(
                "{}\n{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            text.lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string)
        }
        Ok(Err(e)) => {
            tracing::warn!(path = %path.display(), error = %e, "Tile builder version probe failed");
            None
        }
        Err(_) => {
            tracing::warn!(path = %path.display(), "Tile builder version probe timed out");
            None
        }
    };

    tracing::debug!(path = %path.display(), version = ?version, "Tile builder located");
    Ok(ToolCheck { path, version })
}

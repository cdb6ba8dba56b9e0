//! Utility functions for file operations

use std::path::Path;
use std::time::UNIX_EPOCH;

/// Size and modification time of a file, used to fingerprint derived artifacts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStamp {
    /// File size in bytes
    pub size: u64,
    /// Modification time as nanoseconds since the Unix epoch (0 if unavailable)
    pub mtime_nanos: u128,
}

/// Read the size and modification time of `path`
pub async fn file_stamp(path: &Path) -> std::io::Result<FileStamp> {
    let metadata = tokio::fs::metadata(path).await?;
    let mtime_nanos = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    Ok(FileStamp {
        size: metadata.len(),
        mtime_nanos,
    })
}

/// Remove a file, treating "already gone" as success
pub async fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Get available disk space for a given path
///
/// Returns the number of bytes available to unprivileged users on the
/// filesystem containing `path`. The path must exist.
///
/// # Platform Support
///
/// - Unix (Linux, macOS, BSD): uses `statvfs`
/// - Windows: uses `GetDiskFreeSpaceExW`
/// - Other platforms: returns an `Unsupported` error
///
/// # Examples
///
/// ```ignore
/// let available = get_available_space(Path::new("./output/cache"))?;
/// println!("Available space: {} GB", available / (1024 * 1024 * 1024));
/// ```
pub fn get_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is a valid NUL-terminated string, stat is zero-initialized
        // and only read after statvfs reports success.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            // f_bavail is the count available to unprivileged users; f_frsize is the fragment size
            #[allow(clippy::unnecessary_cast)]
            let available_bytes = (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64);
            Ok(available_bytes)
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: wide_path is NUL-terminated and every output pointer refers to a
        // live, aligned u64 that is only read after the call succeeds.
        unsafe {
            let mut free_bytes_available: u64 = 0;
            let mut _total_bytes: u64 = 0;
            let mut _total_free_bytes: u64 = 0;

            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                &mut free_bytes_available as *mut u64 as *mut _,
                &mut _total_bytes as *mut u64 as *mut _,
                &mut _total_free_bytes as *mut u64 as *mut _,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }

            Ok(free_bytes_available)
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = path;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Disk space checking is not supported on this platform",
        ))
    }
}

/// Format a byte count for log messages (e.g. "1.5 MB")
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_stamp_reports_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.geojson");
        tokio::fs::write(&path, b"12345").await.unwrap();

        let stamp = file_stamp(&path).await.unwrap();
        assert_eq!(stamp.size, 5);
        assert!(stamp.mtime_nanos > 0);
    }

    #[tokio::test]
    async fn test_file_stamp_missing_file_errors() {
        let dir = TempDir::new().unwrap();
        assert!(file_stamp(&dir.path().join("missing")).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_file_if_exists_tolerates_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.osm");
        remove_file_if_exists(&path).await.unwrap();

        tokio::fs::write(&path, b"x").await.unwrap();
        remove_file_if_exists(&path).await.unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_get_available_space() {
        let dir = TempDir::new().unwrap();
        let result = get_available_space(dir.path());
        assert!(result.is_ok(), "should get available space: {result:?}");
        assert!(result.unwrap() > 0);
    }

    #[test]
    fn test_get_available_space_nonexistent_path() {
        assert!(get_available_space(Path::new("/nonexistent/path/12345")).is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}

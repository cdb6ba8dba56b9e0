//! Content-addressed file cache
//!
//! Entries are addressed by a SHA-256 digest of their semantic identity
//! (`rawdata:<bbox>`, `features:<category>:<bbox>`, `tiles:<...>`) plus, for
//! derived artifacts, the size and mtime of every upstream input and the
//! serialized generation parameters. Raw filesystem paths never enter a key.
//!
//! Writers copy into a hidden sibling temp file and rename it into place, so a
//! reader sees either no entry or a complete one. Cache failures never abort
//! the pipeline: [`ContentStore::put`] logs and hands the source path back.

use crate::config::Config;
use crate::error::CacheError;
use crate::utils::{FileStamp, format_bytes, get_available_space};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Prefix of in-flight temp files; skipped by readers
const INCOMING_PREFIX: &str = ".incoming-";

/// Stable address of a cache entry
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    digest: String,
    extension: Option<String>,
}

impl CacheKey {
    /// Key for a plain semantic identity (e.g. `rawdata:<bbox>`)
    pub fn new(semantic: &str) -> Self {
        let digest = format!("{:x}", Sha256::digest(semantic.as_bytes()));
        Self {
            digest,
            extension: None,
        }
    }

    /// Attach a file extension to the stored entry
    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = Some(extension.trim_start_matches('.').to_string());
        self
    }

    /// Hex digest
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// File name of the stored entry
    pub fn file_name(&self) -> String {
        match &self.extension {
            Some(ext) => format!("{}.{ext}", self.digest),
            None => self.digest.clone(),
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form is enough to tell entries apart in logs
        f.write_str(&self.digest[..16.min(self.digest.len())])
    }
}

/// Builder for keys of derived artifacts
///
/// ```
/// use tilecraft::cache::Fingerprint;
/// use tilecraft::utils::FileStamp;
///
/// let key = Fingerprint::new("features:water:0,0,1,1")
///     .input("raw", FileStamp { size: 10, mtime_nanos: 1 })
///     .param("filter", "natural=water")
///     .finish();
/// assert_eq!(key.digest().len(), 64);
/// ```
#[derive(Clone, Debug)]
pub struct Fingerprint {
    parts: Vec<String>,
}

impl Fingerprint {
    /// Start a fingerprint from a semantic identity
    pub fn new(semantic: &str) -> Self {
        Self {
            parts: vec![semantic.to_string()],
        }
    }

    /// Mix in an upstream input by label, size and modification time
    pub fn input(mut self, label: &str, stamp: FileStamp) -> Self {
        self.parts
            .push(format!("input:{label}:{}:{}", stamp.size, stamp.mtime_nanos));
        self
    }

    /// Mix in a named parameter
    pub fn param(mut self, name: &str, value: impl std::fmt::Display) -> Self {
        self.parts.push(format!("param:{name}={value}"));
        self
    }

    /// Mix in a serializable parameter set
    pub fn params<T: Serialize>(mut self, name: &str, value: &T) -> serde_json::Result<Self> {
        let json = serde_json::to_string(value)?;
        self.parts.push(format!("params:{name}={json}"));
        Ok(self)
    }

    /// Semantic string that will be hashed
    pub fn semantic(&self) -> String {
        self.parts.join("\n")
    }

    /// Finish into a key
    pub fn finish(self) -> CacheKey {
        CacheKey::new(&self.semantic())
    }
}

/// Content-addressed file store rooted at one directory
#[derive(Clone, Debug)]
pub struct ContentStore {
    root: PathBuf,
    enabled: bool,
    space_multiplier: f64,
    commit_delay: Option<Duration>,
}

impl ContentStore {
    /// Create a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            enabled: true,
            space_multiplier: 2.0,
            commit_delay: None,
        }
    }

    /// Create a store from configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            root: config.cache_dir(),
            enabled: config.cache.enabled,
            space_multiplier: config.cache.space_multiplier,
            commit_delay: None,
        }
    }

    /// Disable or enable the store; a disabled store always misses
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Required free space as a multiple of the source size
    pub fn with_space_multiplier(mut self, multiplier: f64) -> Self {
        self.space_multiplier = multiplier;
        self
    }

    /// Pause between writing the temp file and renaming it into place
    ///
    /// Widens the commit window so reader/writer races can be observed in tests.
    #[doc(hidden)]
    pub fn with_commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = Some(delay);
        self
    }

    /// Store root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the store is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Where `key` lives (whether or not it exists)
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    /// Look up an entry
    pub async fn get(&self, key: &CacheKey) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }
        let path = self.entry_path(key);
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => {
                debug!(key = %key, path = %path.display(), "Cache hit");
                Some(path)
            }
            _ => {
                debug!(key = %key, "Cache miss");
                None
            }
        }
    }

    /// Adopt `source` under `key`, returning the cached path
    ///
    /// On any failure (disk full, permissions, missing source) the source path
    /// is returned unchanged and a warning is logged.
    pub async fn put(&self, key: &CacheKey, source: &Path) -> PathBuf {
        if !self.enabled {
            return source.to_path_buf();
        }
        match self.try_put(key, source).await {
            Ok(path) => path,
            Err(e) => {
                warn!(
                    key = %key,
                    source = %source.display(),
                    error = %e,
                    "Cache write failed, continuing without cache"
                );
                source.to_path_buf()
            }
        }
    }

    /// Adopt `source` under `key`, surfacing failures
    pub async fn try_put(&self, key: &CacheKey, source: &Path) -> Result<PathBuf, CacheError> {
        let source_len = tokio::fs::metadata(source)
            .await
            .map_err(|e| CacheError::Io {
                path: source.to_path_buf(),
                source: e,
            })?
            .len();

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CacheError::Io {
                path: self.root.clone(),
                source: e,
            })?;

        let required = (source_len as f64 * self.space_multiplier).ceil() as u64;
        match get_available_space(&self.root) {
            Ok(available) if available < required => {
                return Err(CacheError::InsufficientSpace {
                    required,
                    available,
                });
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Could not determine free space, copying anyway");
            }
        }

        let root = self.root.clone();
        let source = source.to_path_buf();
        let dest = self.entry_path(key);
        let commit_delay = self.commit_delay;

        let path = tokio::task::spawn_blocking(move || {
            copy_then_rename(&root, &source, &dest, commit_delay)
        })
        .await
        .map_err(|e| CacheError::Task(e.to_string()))??;

        debug!(key = %key, bytes = source_len, path = %path.display(), "Cached artifact");
        Ok(path)
    }

    /// Publish a copy of `entry` at `dest` by rename
    ///
    /// The copy is written next to `dest` under a hidden temp name, so readers
    /// of `dest` see either the previous file or the complete new one.
    pub async fn export(&self, entry: &Path, dest: &Path) -> Result<PathBuf, CacheError> {
        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CacheError::Io {
                path: dir.clone(),
                source: e,
            })?;

        let entry = entry.to_path_buf();
        let dest = dest.to_path_buf();
        let commit_delay = self.commit_delay;
        let path = tokio::task::spawn_blocking(move || {
            copy_then_rename(&dir, &entry, &dest, commit_delay)
        })
        .await
        .map_err(|e| CacheError::Task(e.to_string()))??;

        debug!(path = %path.display(), "Published cached artifact");
        Ok(path)
    }

    /// Remove every entry
    pub async fn clear(&self) -> Result<(), CacheError> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CacheError::Io {
                    path: self.root.clone(),
                    source: e,
                });
            }
        }
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CacheError::Io {
                path: self.root.clone(),
                source: e,
            })?;
        info!(root = %self.root.display(), "Cache cleared");
        Ok(())
    }

    /// Total size of stored entries in bytes
    ///
    /// In-flight temp files and entries that disappear between listing and
    /// stat are skipped.
    pub async fn size(&self) -> Result<u64, CacheError> {
        let mut total = 0u64;
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(CacheError::Io { path: dir, source: e }),
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                    Err(e) => {
                        return Err(CacheError::Io {
                            path: dir.clone(),
                            source: e,
                        });
                    }
                };

                if entry.file_name().to_string_lossy().starts_with(INCOMING_PREFIX) {
                    continue;
                }
                let path = entry.path();
                let metadata = match tokio::fs::metadata(&path).await {
                    Ok(metadata) => metadata,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(CacheError::Io { path, source: e }),
                };

                if metadata.is_dir() {
                    pending.push(path);
                } else {
                    total = total.saturating_add(metadata.len());
                }
            }
        }

        debug!(size = %format_bytes(total), "Cache size computed");
        Ok(total)
    }
}

fn copy_then_rename(
    root: &Path,
    source: &Path,
    dest: &Path,
    commit_delay: Option<Duration>,
) -> Result<PathBuf, CacheError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |e: std::io::Error| CacheError::Io { path, source: e }
    };

    let temp = tempfile::Builder::new()
        .prefix(INCOMING_PREFIX)
        .tempfile_in(root)
        .map_err(io_err(root))?;

    {
        let input = std::fs::File::open(source).map_err(io_err(source))?;
        let mut reader = BufReader::new(input);
        let mut writer = BufWriter::new(temp.as_file());
        std::io::copy(&mut reader, &mut writer).map_err(io_err(temp.path()))?;
        writer.flush().map_err(io_err(temp.path()))?;
    }
    temp.as_file().sync_all().map_err(io_err(temp.path()))?;

    if let Some(delay) = commit_delay {
        std::thread::sleep(delay);
    }

    temp.persist(dest).map_err(|e| CacheError::Io {
        path: dest.to_path_buf(),
        source: e.error,
    })?;
    Ok(dest.to_path_buf())
}

//! Bounded file-content cache keyed by path.
//!
//! Entries are fingerprinted by mtime; a stat that matches the cached
//! fingerprint is a hit, anything else re-reads the file. Telemetry is
//! tracked per namespace so callers (prompt compiler, merkle scanner,
//! ledger) can see their own hit rates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("stat failed for {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("read failed for {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Fingerprint {
    pub mtime_ms: i128,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    content: String,
    fingerprint: Fingerprint,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NamespaceTelemetry {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheTelemetrySnapshot {
    pub namespaces: HashMap<String, NamespaceTelemetry>,
    pub totals: NamespaceTelemetry,
}

#[derive(Debug, Clone)]
pub struct FileCacheConfig {
    pub max_entries: usize,
    /// In legacy mode stat errors evict and return `None` instead of
    /// propagating.
    pub legacy_error_mode: bool,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            legacy_error_mode: false,
        }
    }
}

struct CacheInner {
    entries: HashMap<PathBuf, CacheEntry>,
    /// LRU order, least recent first.
    order: Vec<PathBuf>,
    telemetry: HashMap<String, NamespaceTelemetry>,
}

pub struct FileContentCache {
    inner: Mutex<CacheInner>,
    config: FileCacheConfig,
}

enum Outcome {
    Hit,
    Miss,
    Error,
}

impl FileContentCache {
    pub fn new(config: FileCacheConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: Vec::new(),
                telemetry: HashMap::new(),
            }),
            config,
        }
    }

    /// Read through the cache. `None` means the file does not exist.
    pub async fn get(
        &self,
        path: impl AsRef<Path>,
        namespace: Option<&str>,
    ) -> Result<Option<String>, CacheError> {
        let path = path.as_ref().to_path_buf();
        let namespace = namespace.unwrap_or(DEFAULT_NAMESPACE).to_string();

        let fingerprint = match stat_fingerprint(&path).await {
            Ok(Some(fingerprint)) => fingerprint,
            Ok(None) => {
                let mut inner = self.inner.lock().await;
                inner.evict(&path);
                inner.record(&namespace, Outcome::Miss);
                return Ok(None);
            }
            Err(source) => {
                let mut inner = self.inner.lock().await;
                inner.record(&namespace, Outcome::Error);
                tracing::warn!(path = %path.display(), error = %source, "stat failed");
                if self.config.legacy_error_mode {
                    inner.evict(&path);
                    return Ok(None);
                }
                return Err(CacheError::Stat { path, source });
            }
        };

        {
            let mut inner = self.inner.lock().await;
            if let Some(entry) = inner.entries.get(&path) {
                if entry.fingerprint == fingerprint {
                    let content = entry.content.clone();
                    inner.touch(&path);
                    inner.record(&namespace, Outcome::Hit);
                    return Ok(Some(content));
                }
            }
        }

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                let mut inner = self.inner.lock().await;
                inner.evict(&path);
                inner.record(&namespace, Outcome::Miss);
                return Ok(None);
            }
            Err(source) => {
                let mut inner = self.inner.lock().await;
                inner.record(&namespace, Outcome::Error);
                if self.config.legacy_error_mode {
                    inner.evict(&path);
                    return Ok(None);
                }
                return Err(CacheError::Read { path, source });
            }
        };

        let mut inner = self.inner.lock().await;
        inner.record(&namespace, Outcome::Miss);
        inner.insert(
            path,
            CacheEntry {
                content: content.clone(),
                fingerprint,
            },
            self.config.max_entries,
        );
        Ok(Some(content))
    }

    pub async fn get_fingerprint(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Option<Fingerprint>, CacheError> {
        let path = path.as_ref().to_path_buf();
        stat_fingerprint(&path)
            .await
            .map_err(|source| CacheError::Stat { path, source })
    }

    pub async fn invalidate(&self, path: impl AsRef<Path>) {
        let mut inner = self.inner.lock().await;
        inner.evict(path.as_ref());
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.entries.clear();
        inner.order.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get_telemetry(&self) -> CacheTelemetrySnapshot {
        let inner = self.inner.lock().await;
        let mut totals = NamespaceTelemetry::default();
        for telemetry in inner.telemetry.values() {
            totals.hits += telemetry.hits;
            totals.misses += telemetry.misses;
            totals.errors += telemetry.errors;
        }
        CacheTelemetrySnapshot {
            namespaces: inner.telemetry.clone(),
            totals,
        }
    }
}

impl Default for FileContentCache {
    fn default() -> Self {
        Self::new(FileCacheConfig::default())
    }
}

impl CacheInner {
    fn record(&mut self, namespace: &str, outcome: Outcome) {
        let telemetry = self.telemetry.entry(namespace.to_string()).or_default();
        match outcome {
            Outcome::Hit => telemetry.hits += 1,
            Outcome::Miss => telemetry.misses += 1,
            Outcome::Error => telemetry.errors += 1,
        }
    }

    fn touch(&mut self, path: &Path) {
        self.order.retain(|p| p != path);
        self.order.push(path.to_path_buf());
    }

    fn evict(&mut self, path: &Path) {
        self.entries.remove(path);
        self.order.retain(|p| p != path);
    }

    fn insert(&mut self, path: PathBuf, entry: CacheEntry, max_entries: usize) {
        self.entries.insert(path.clone(), entry);
        self.touch(&path);
        while self.entries.len() > max_entries {
            let Some(oldest) = self.order.first().cloned() else {
                break;
            };
            self.evict(&oldest);
        }
    }
}

async fn stat_fingerprint(path: &Path) -> Result<Option<Fingerprint>, std::io::Error> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => {
            let mtime_ms = metadata
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i128)
                .unwrap_or(0);
            Ok(Some(Fingerprint { mtime_ms }))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

//! Persistent prefix cache with TTL-bounded entries.
//!
//! Two cooperating stores share one disk root:
//!
//! 1. the **content cache** (`content:<fingerprint>`) holds whole call
//!    results, letting the engine skip an LLM call entirely on a hit;
//! 2. the **response-id cache** (`response_id:<fingerprint>`) holds provider
//!    response ids that chain server-side prefix caching across turns.
//!
//! Memory folding stores compressed-history artefacts under a third
//! namespace (`fold:<hash>:<strategy>`). Every entry carries an absolute
//! expiry timestamp; expired entries are evicted lazily on read. Entries
//! survive process restarts.
//!
//! Disk I/O is best-effort: a corrupt or unreadable entry behaves like a
//! miss and is logged, never raised.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::error::{LlmError, Result};

/// Default TTL for cache entries: 24 hours.
pub const DEFAULT_TTL: Duration = Duration::from_secs(86_400);

#[derive(Debug, Serialize, Deserialize)]
struct DiskEntry {
    value: Value,
    /// Absolute expiry, seconds since the unix epoch.
    expires_at: u64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Disk-backed prefix cache.
pub struct PrefixCache {
    root: PathBuf,
    default_ttl: Duration,
    enabled: bool,
}

impl PrefixCache {
    /// Open (or create) a cache rooted at `root`.
    ///
    /// With `root = None` the cache lives under `~/.mindforge/cache`,
    /// falling back to the system temp directory when no home is available.
    pub fn new(root: Option<PathBuf>, default_ttl: Duration, enabled: bool) -> Result<Self> {
        let root = root.unwrap_or_else(Self::default_root);
        std::fs::create_dir_all(&root).map_err(|e| {
            LlmError::Generic(format!(
                "failed to create cache directory {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self {
            root,
            default_ttl,
            enabled,
        })
    }

    /// Open a cache with the default TTL, enabled.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::new(Some(root.into()), DEFAULT_TTL, true)
    }

    /// A disabled cache: every read misses, every write is dropped.
    pub fn disabled() -> Self {
        Self {
            root: std::env::temp_dir(),
            default_ttl: DEFAULT_TTL,
            enabled: false,
        }
    }

    fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".mindforge")
            .join("cache")
    }

    /// Cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the cache serves hits.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    // Keys contain ':' separators; filenames use '-' instead.
    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", key.replace(':', "-")))
    }

    /// Fetch a value by namespaced key, evicting it if expired.
    pub async fn get(&self, key: &str) -> Option<Value> {
        if !self.enabled {
            return None;
        }
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(_) => return None,
        };
        let entry: DiskEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "dropping unreadable cache entry");
                let _ = tokio::fs::remove_file(&path).await;
                return None;
            }
        };
        if unix_now() >= entry.expires_at {
            debug!(key, "evicting expired cache entry");
            let _ = tokio::fs::remove_file(&path).await;
            return None;
        }
        Some(entry.value)
    }

    /// Store a value under a namespaced key.
    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        if !self.enabled {
            return;
        }
        let entry = DiskEntry {
            value,
            expires_at: unix_now() + ttl.unwrap_or(self.default_ttl).as_secs(),
        };
        let path = self.path_for(key);
        match serde_json::to_vec(&entry) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    warn!(key, error = %e, "failed to persist cache entry");
                }
            }
            Err(e) => warn!(key, error = %e, "failed to serialize cache entry"),
        }
    }

    /// Fetch a cached call result for a fingerprint.
    pub async fn get_content(&self, fp: &str) -> Option<Value> {
        self.get(&format!("content:{}", fp)).await
    }

    /// Store a call result for a fingerprint.
    pub async fn set_content(&self, fp: &str, value: Value) {
        self.set(&format!("content:{}", fp), value, None).await
    }

    /// Fetch the provider response id chained to a fingerprint.
    pub async fn get_response_id(&self, fp: &str) -> Option<String> {
        self.get(&format!("response_id:{}", fp))
            .await
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// Persist a provider response id for a fingerprint.
    pub async fn set_response_id(&self, fp: &str, response_id: &str) {
        self.set(
            &format!("response_id:{}", fp),
            Value::String(response_id.to_string()),
            None,
        )
        .await
    }

    /// Fetch a folded-history artefact.
    pub async fn get_fold(&self, hash: &str, strategy: &str) -> Option<String> {
        self.get(&format!("fold:{}:{}", hash, strategy))
            .await
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// Store a folded-history artefact with its own TTL.
    pub async fn set_fold(&self, hash: &str, strategy: &str, artefact: &str, ttl: Duration) {
        self.set(
            &format!("fold:{}:{}", hash, strategy),
            Value::String(artefact.to_string()),
            Some(ttl),
        )
        .await
    }

    /// Number of live (non-expired) entries in a namespace.
    pub async fn count_namespace(&self, namespace: &str) -> usize {
        let prefix = format!("{}-", namespace);
        let mut count = 0;
        let Ok(mut dir) = tokio::fs::read_dir(&self.root).await else {
            return 0;
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&prefix) {
                continue;
            }
            if let Ok(bytes) = tokio::fs::read(entry.path()).await {
                if let Ok(disk) = serde_json::from_slice::<DiskEntry>(&bytes) {
                    if unix_now() < disk.expires_at {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    /// Remove every entry, all namespaces included.
    pub async fn clear(&self) {
        let Ok(mut dir) = tokio::fs::read_dir(&self.root).await else {
            return;
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }
}

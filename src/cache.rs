use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TaxoError;
use crate::fs_util::write_bytes_atomic;

const META_SUFFIX: &str = ".meta.json";
const META_VERSION: u32 = 1;
pub const FINGERPRINT_SUFFIX_LENGTH: usize = 16;

/// Sidecar record validating a cached value: an entry is only served when
/// its recorded checksum matches the caller's and it is younger than the
/// configured maximum age.
#[derive(Debug, Serialize, Deserialize)]
struct CacheMeta {
    checksum: String,
    created_at: String,
    version: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub namespace: String,
    pub entry_count: usize,
    pub meta_count: usize,
    pub total_size_bytes: u64,
    pub prefix_counts: BTreeMap<String, usize>,
    pub hits: u64,
    pub misses: u64,
}

/// Content-addressed memoization of expensive, purely functional stages.
///
/// Each run works inside a namespace derived from the command name, the
/// crate version, and a fingerprint of the input files; any change to inputs
/// or version lands in a fresh namespace, never silently reusing stale
/// results. Explicitly threaded through the run, lifecycle bounded to one
/// invocation.
#[derive(Debug)]
pub struct CacheContext {
    namespace_dir: Utf8PathBuf,
    max_age_secs: Option<u64>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheContext {
    /// Namespace path: `{base}/{command}_v{version}_{16-hex-fingerprint}/`.
    pub fn for_command(
        base: &Utf8Path,
        command: &str,
        version: &str,
        fingerprint: &str,
        max_age_secs: Option<u64>,
    ) -> Result<Self, TaxoError> {
        let suffix = if fingerprint.is_empty() {
            "default"
        } else {
            &fingerprint[..fingerprint.len().min(FINGERPRINT_SUFFIX_LENGTH)]
        };
        let namespace_dir = base.join(format!("{command}_v{version}_{suffix}"));
        fs::create_dir_all(namespace_dir.as_std_path())
            .map_err(|err| TaxoError::Filesystem(err.to_string()))?;
        Ok(Self {
            namespace_dir,
            max_age_secs,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn namespace(&self) -> &Utf8Path {
        &self.namespace_dir
    }

    /// Load a cached value if its checksum matches and it has not expired.
    pub fn load<T: DeserializeOwned>(&self, key: &str, checksum: &str) -> Option<T> {
        let meta_path = self.meta_path(key);
        let value_path = self.value_path(key);

        let meta: Option<CacheMeta> = fs::read_to_string(meta_path.as_std_path())
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok());
        let Some(meta) = meta else {
            debug!(key, "cache miss (no metadata)");
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if meta.version != META_VERSION || meta.checksum != checksum {
            debug!(key, "cache miss (checksum mismatch)");
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        if let Some(max_age) = self.max_age_secs {
            let created = DateTime::parse_from_rfc3339(&meta.created_at).ok()?;
            let age = Utc::now().signed_duration_since(created.with_timezone(&Utc));
            if age.num_seconds() < 0 || age.num_seconds() as u64 > max_age {
                debug!(key, "cache miss (expired)");
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        let value = fs::read_to_string(value_path.as_std_path())
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok());
        match value {
            Some(value) => {
                debug!(key, "cache hit");
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn save<T: Serialize>(&self, key: &str, checksum: &str, value: &T) -> Result<(), TaxoError> {
        let serialized = serde_json::to_vec(value)
            .map_err(|err| TaxoError::Filesystem(err.to_string()))?;
        let meta = CacheMeta {
            checksum: checksum.to_string(),
            created_at: Utc::now().to_rfc3339(),
            version: META_VERSION,
        };
        let meta_bytes = serde_json::to_vec(&meta)
            .map_err(|err| TaxoError::Filesystem(err.to_string()))?;

        write_bytes_atomic(&self.value_path(key), &serialized)?;
        write_bytes_atomic(&self.meta_path(key), &meta_bytes)?;
        debug!(key, "saved cache entry");
        Ok(())
    }

    /// Remove every entry in this namespace. Returns the number of files
    /// removed.
    pub fn clear(&self) -> Result<usize, TaxoError> {
        let mut removed = 0usize;
        if !self.namespace_dir.as_std_path().exists() {
            return Ok(0);
        }
        let entries = fs::read_dir(self.namespace_dir.as_std_path())
            .map_err(|err| TaxoError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| TaxoError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_file() {
                fs::remove_file(&path).map_err(|err| TaxoError::Filesystem(err.to_string()))?;
                removed += 1;
            }
        }
        debug!(removed, namespace = %self.namespace_dir, "cleared cache namespace");
        Ok(removed)
    }

    /// Remove every namespace under the base directory.
    pub fn clear_all(base: &Utf8Path) -> Result<usize, TaxoError> {
        if !base.as_std_path().exists() {
            return Ok(0);
        }
        let mut removed = 0usize;
        let entries = fs::read_dir(base.as_std_path())
            .map_err(|err| TaxoError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| TaxoError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)
                    .map_err(|err| TaxoError::Filesystem(err.to_string()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Read-only diagnostics: entry counts by key prefix, sizes, and this
    /// session's hit/miss counters. Never mutates cache state.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            namespace: self.namespace_dir.to_string(),
            entry_count: 0,
            meta_count: 0,
            total_size_bytes: 0,
            prefix_counts: BTreeMap::new(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        };

        let Ok(entries) = fs::read_dir(self.namespace_dir.as_std_path()) else {
            return stats;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                stats.total_size_bytes += meta.len();
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(META_SUFFIX) {
                stats.meta_count += 1;
                continue;
            }
            stats.entry_count += 1;
            let prefix = name
                .split(['.', '_'])
                .next()
                .unwrap_or("other")
                .to_string();
            *stats.prefix_counts.entry(prefix).or_insert(0) += 1;
        }
        stats
    }

    fn value_path(&self, key: &str) -> Utf8PathBuf {
        self.namespace_dir.join(format!("{key}.json"))
    }

    fn meta_path(&self, key: &str) -> Utf8PathBuf {
        self.namespace_dir.join(format!("{key}{META_SUFFIX}"))
    }
}

/// Default cache base directory under the user's cache root.
pub fn default_cache_base() -> Result<Utf8PathBuf, TaxoError> {
    directories::BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("taxoresolve")).ok()
        })
        .ok_or_else(|| TaxoError::Filesystem("unable to resolve cache directory".to_string()))
}

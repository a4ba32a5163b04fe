use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use datapipe_core::{ArgValue, ResultRef};

pub const CACHE_VERSION: u32 = 1;

/// Shared per-base_dir namespace directory: result cache plus per-app
/// source snapshots and task-spec scratch files.
pub fn namespace_dir(base_dir: &Path) -> PathBuf {
    base_dir.join(".datapipe")
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Self-describing cached payload, one file per fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResult {
    pub version: u32,
    pub fingerprint: String,
    pub value: ArgValue,
    pub out: String,
    pub err: String,
}

/// Content-addressed result store under
/// `${base_dir}/.datapipe/cache/<fingerprint>.json`.
///
/// Write-once per fingerprint; writers go through temp-file-then-rename
/// so readers never see a partial payload.
#[derive(Debug, Clone)]
pub struct ResultCache {
    dir: PathBuf,
}

impl ResultCache {
    pub fn open(base_dir: &Path) -> Result<Self, CacheError> {
        let dir = namespace_dir(base_dir).join("cache");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.json"))
    }

    pub fn has(&self, fingerprint: &str) -> bool {
        self.path_for(fingerprint).exists()
    }

    /// Store a payload. An existing entry is kept as-is (re-computation
    /// for the same fingerprint writes identical bytes, so skipping on
    /// hit is sound).
    pub fn put(&self, entry: &CachedResult) -> Result<ResultRef, CacheError> {
        let path = self.path_for(&entry.fingerprint);
        if !path.exists() {
            let tmp = self
                .dir
                .join(format!("{}.tmp.{}", entry.fingerprint, std::process::id()));
            std::fs::write(&tmp, serde_json::to_vec(entry)?)?;
            std::fs::rename(&tmp, &path)?;
        }
        Ok(ResultRef {
            path,
            fingerprint: entry.fingerprint.clone(),
        })
    }

    /// Load a payload; a missing, unreadable, or mismatched entry is a
    /// miss (the record just re-runs).
    pub fn get(&self, fingerprint: &str) -> Result<Option<CachedResult>, CacheError> {
        let path = self.path_for(fingerprint);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<CachedResult>(&bytes) {
            Ok(entry) if entry.fingerprint == fingerprint => Ok(Some(entry)),
            Ok(entry) => {
                warn!(
                    fingerprint,
                    found = entry.fingerprint,
                    "cache entry fingerprint mismatch; treating as miss"
                );
                Ok(None)
            }
            Err(e) => {
                warn!(fingerprint, error = %e, "corrupt cache entry; treating as miss");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(fp: &str, value: f64) -> CachedResult {
        CachedResult {
            version: CACHE_VERSION,
            fingerprint: fp.to_string(),
            value: ArgValue::Float(value),
            out: String::new(),
            err: String::new(),
        }
    }

    #[test]
    fn put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        assert!(!cache.has("fp"));

        let r = cache.put(&entry("fp", 0.5)).unwrap();
        assert!(cache.has("fp"));
        assert_eq!(r.fingerprint, "fp");

        let loaded = cache.get("fp").unwrap().unwrap();
        assert_eq!(loaded.value, ArgValue::Float(0.5));
    }

    #[test]
    fn put_is_write_once() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        cache.put(&entry("fp", 1.0)).unwrap();
        cache.put(&entry("fp", 2.0)).unwrap();
        // first write wins
        let loaded = cache.get("fp").unwrap().unwrap();
        assert_eq!(loaded.value, ArgValue::Float(1.0));
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        std::fs::write(cache.path_for("fp"), b"not json").unwrap();
        assert!(cache.get("fp").unwrap().is_none());
    }

    #[test]
    fn repeated_payloads_are_byte_identical() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        cache.put(&entry("fp", 0.25)).unwrap();
        let first = std::fs::read(cache.path_for("fp")).unwrap();

        let other = TempDir::new().unwrap();
        let cache2 = ResultCache::open(other.path()).unwrap();
        cache2.put(&entry("fp", 0.25)).unwrap();
        let second = std::fs::read(cache2.path_for("fp")).unwrap();
        assert_eq!(first, second);
    }
}

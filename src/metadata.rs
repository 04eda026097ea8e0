use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{CacheError, Result};
use crate::range_set::{ByteRange, RangeSet};

/// Deterministic identity of a cached resource: lowercase-hex SHA-256 of
/// the canonical request URL (or a host-supplied derivation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn for_url(url: &Url) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_str().as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ResourceKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ResourceKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Eviction priority. `Permanent` entries are never evicted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Permanent,
}

impl Priority {
    /// The next level up, saturating at `Permanent`.
    pub fn bumped(self) -> Self {
        match self {
            Self::Low => Self::Normal,
            Self::Normal => Self::High,
            Self::High => Self::Permanent,
            Self::Permanent => Self::Permanent,
        }
    }
}

/// Metadata for one cached resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub key: ResourceKey,
    pub original_url: String,
    pub content_type: Option<String>,
    pub total_length: Option<i64>,
    pub supports_range: bool,
    pub ranges: RangeSet,
    pub cached_bytes: i64,
    pub is_complete: bool,
    pub last_access: DateTime<Utc>,
    pub access_count: u64,
    pub priority: Priority,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ResourceMetadata {
    pub fn new(key: ResourceKey, original_url: impl Into<String>) -> Self {
        Self {
            key,
            original_url: original_url.into(),
            content_type: None,
            total_length: None,
            supports_range: false,
            ranges: RangeSet::new(),
            cached_bytes: 0,
            is_complete: false,
            last_access: Utc::now(),
            access_count: 0,
            priority: Priority::Normal,
            expires_at: None,
        }
    }

    /// Record a read hit.
    pub fn mark_accessed(&mut self) {
        self.last_access = Utc::now();
        self.access_count += 1;
    }

    /// Record a write without counting it as an access.
    pub fn touch(&mut self) {
        self.last_access = Utc::now();
    }

    /// Add a freshly written range; returns the exact growth in cached
    /// bytes (overlap with existing ranges does not grow the set).
    pub fn add_range(&mut self, r: ByteRange) -> i64 {
        let before = self.cached_bytes;
        self.ranges.add(r);
        self.cached_bytes = self.ranges.total_len();
        self.touch();
        self.cached_bytes - before
    }

    /// True iff the range set covers exactly `[0, total_length - 1]`.
    /// Completion itself is only recorded after an fsync, by the cache core.
    pub fn covers_all(&self) -> bool {
        match self.total_length {
            Some(total) if total > 0 => {
                let ranges = self.ranges.as_slice();
                ranges.len() == 1 && ranges[0].start == 0 && ranges[0].end == total - 1
            }
            Some(_) => self.ranges.is_empty(),
            None => false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline < now)
    }
}

const RECORD_VERSION: u32 = 1;

/// On-disk shape of a metadata record. Versioned; unknown fields are
/// skipped on read so newer writers stay readable.
#[derive(Debug, Serialize, Deserialize)]
struct MetadataRecord {
    version: u32,
    #[serde(flatten)]
    metadata: ResourceMetadata,
}

/// In-memory map of resource metadata with a small durable record per
/// entry, rewritten atomically on every mutation.
#[derive(Debug)]
pub struct MetadataStore {
    dir: PathBuf,
    extension: String,
    entries: HashMap<ResourceKey, ResourceMetadata>,
}

impl MetadataStore {
    /// Create a store rooted at `<dir>`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| CacheError::Io(format!("failed to create {}: {e}", dir.display())))?;
        Ok(Self {
            dir,
            extension: extension.into(),
            entries: HashMap::new(),
        })
    }

    fn record_path(&self, key: &ResourceKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key, self.extension))
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&ResourceMetadata> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &ResourceKey) -> Option<&mut ResourceMetadata> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceKey, &ResourceMetadata)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.entries.keys()
    }

    /// Replace the entry in memory and rewrite its durable record.
    pub fn put(&mut self, metadata: ResourceMetadata) -> Result<()> {
        let key = metadata.key.clone();
        self.persist_record(&metadata)?;
        self.entries.insert(key, metadata);
        Ok(())
    }

    /// Rewrite the durable record for an entry mutated in place.
    pub fn persist(&self, key: &ResourceKey) -> Result<()> {
        let metadata = self
            .entries
            .get(key)
            .ok_or_else(|| CacheError::NotFound(format!("no metadata for {key}")))?;
        self.persist_record(metadata)
    }

    // Atomic replace: temp file in the same directory, fsync, rename.
    fn persist_record(&self, metadata: &ResourceMetadata) -> Result<()> {
        let record = MetadataRecord {
            version: RECORD_VERSION,
            metadata: metadata.clone(),
        };
        let contents = serde_json::to_vec(&record)?;

        let path = self.record_path(&metadata.key);
        let tmp = path.with_extension(format!("{}.tmp", self.extension));
        let mut f = File::create(&tmp)
            .map_err(|e| CacheError::Io(format!("create {} failed: {e}", tmp.display())))?;
        f.write_all(&contents)
            .and_then(|_| f.sync_all())
            .map_err(|e| CacheError::Io(format!("write {} failed: {e}", tmp.display())))?;
        fs::rename(&tmp, &path)
            .map_err(|e| CacheError::Io(format!("rename {} failed: {e}", path.display())))?;
        Ok(())
    }

    /// Remove the entry and delete its on-disk record.
    pub fn remove(&mut self, key: &ResourceKey) -> Option<ResourceMetadata> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            let path = self.record_path(key);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to delete metadata record {}: {e}", path.display());
                }
            }
        }
        removed
    }

    /// Load every record from disk and reconcile it with the data files in
    /// `data_dir`. Returns the total cached bytes across all entries.
    ///
    /// Reconciliation:
    /// - record whose data file is missing: ranges reset, not complete;
    /// - data file with no record: metadata synthesized from the file size
    ///   and marked complete;
    /// - record with no total length whose data file exists: the length is
    ///   filled from the file size, completing the entry when the cached
    ///   ranges cover exactly that much;
    /// - cached ranges extending past the data file: reset, the file can no
    ///   longer back them.
    pub fn load_all(&mut self, data_dir: &Path, data_extension: &str) -> Result<i64> {
        self.entries.clear();

        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(0);
            }
            Err(e) => {
                return Err(CacheError::Io(format!(
                    "failed to list {}: {e}",
                    self.dir.display()
                )));
            }
        };

        for dir_entry in read_dir.flatten() {
            let path = dir_entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(self.extension.as_str()) {
                continue;
            }
            let mut metadata = match Self::decode_record(&path) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Skipping unreadable metadata record {}: {e}", path.display());
                    continue;
                }
            };

            let data_path = data_dir.join(format!("{}.{}", metadata.key, data_extension));
            let file_len = fs::metadata(&data_path).map(|m| m.len() as i64).ok();
            match file_len {
                None => {
                    if metadata.is_complete || metadata.cached_bytes > 0 {
                        debug!(
                            "Data file missing for {}, resetting cached ranges",
                            metadata.key
                        );
                    }
                    metadata.ranges = RangeSet::new();
                    metadata.cached_bytes = 0;
                    metadata.is_complete = false;
                }
                Some(len) => {
                    let max_end = metadata.ranges.as_slice().last().map(|r| r.end);
                    if max_end.is_some_and(|end| end >= len) {
                        warn!(
                            "Data file for {} shorter than recorded ranges, resetting",
                            metadata.key
                        );
                        metadata.ranges = RangeSet::new();
                        metadata.cached_bytes = 0;
                        metadata.is_complete = false;
                    } else {
                        metadata.cached_bytes = metadata.ranges.total_len();
                        // A record whose origin never declared a length
                        // learns it from the file, and completes when the
                        // cached ranges cover exactly that much.
                        if metadata.total_length.is_none() && len > 0 {
                            metadata.total_length = Some(len);
                            metadata.is_complete = metadata.covers_all();
                            info!(
                                "Filled total length for {} from data file ({len} bytes)",
                                metadata.key
                            );
                            self.persist_record(&metadata)?;
                        }
                    }
                }
            }

            self.entries.insert(metadata.key.clone(), metadata);
        }

        // Data files with no surviving record become complete entries.
        if let Ok(data_entries) = fs::read_dir(data_dir) {
            for dir_entry in data_entries.flatten() {
                let path = dir_entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(data_extension) {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let key = ResourceKey::from(stem);
                if self.entries.contains_key(&key) {
                    continue;
                }
                let Ok(file_meta) = fs::metadata(&path) else {
                    continue;
                };
                let len = file_meta.len() as i64;

                let mut metadata = ResourceMetadata::new(key.clone(), String::new());
                if len > 0 {
                    metadata.total_length = Some(len);
                    metadata.ranges = RangeSet::merge([ByteRange { start: 0, end: len - 1 }]);
                    metadata.cached_bytes = len;
                    metadata.is_complete = true;
                }
                info!("Recovered orphan data file for {key} ({len} bytes)");
                self.persist_record(&metadata)?;
                self.entries.insert(key, metadata);
            }
        }

        let total: i64 = self.entries.values().map(|m| m.cached_bytes).sum();
        info!(
            "Metadata store loaded: {} entries, {} cached bytes",
            self.entries.len(),
            total
        );
        Ok(total)
    }

    fn decode_record(path: &Path) -> Result<ResourceMetadata> {
        let contents = fs::read(path)
            .map_err(|e| CacheError::Io(format!("read {} failed: {e}", path.display())))?;
        let record: MetadataRecord = serde_json::from_slice(&contents)?;
        Ok(record.metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(n: u8) -> ResourceKey {
        ResourceKey::from(format!("{:064x}", n))
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Permanent);
        assert_eq!(Priority::High.bumped(), Priority::Permanent);
        assert_eq!(Priority::Permanent.bumped(), Priority::Permanent);
    }

    #[test]
    fn test_key_for_url_is_stable_hex() {
        let url = Url::parse("https://example.com/video.mp4").unwrap();
        let a = ResourceKey::for_url(&url);
        let b = ResourceKey::for_url(&url);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_add_range_returns_exact_delta() {
        let mut m = ResourceMetadata::new(key(1), "http://test");
        let d1 = m.add_range(ByteRange::try_new(100, 299).unwrap());
        assert_eq!(d1, 200);
        // Overlapping write grows the set by the uncovered part only.
        let d2 = m.add_range(ByteRange::try_new(200, 399).unwrap());
        assert_eq!(d2, 100);
        assert_eq!(m.cached_bytes, 300);
    }

    #[test]
    fn test_covers_all() {
        let mut m = ResourceMetadata::new(key(1), "http://test");
        m.total_length = Some(1000);
        assert!(!m.covers_all());
        m.add_range(ByteRange::try_new(0, 499).unwrap());
        assert!(!m.covers_all());
        m.add_range(ByteRange::try_new(500, 999).unwrap());
        assert!(m.covers_all());
    }

    #[test]
    fn test_record_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut store = MetadataStore::new(dir.path().join("Metadata"), "bmm").unwrap();

        let mut m = ResourceMetadata::new(key(2), "https://example.com/a.mp4");
        m.total_length = Some(1048576);
        m.supports_range = true;
        m.content_type = Some("video/mp4".into());
        m.add_range(ByteRange::try_new(0, 65535).unwrap());
        m.priority = Priority::High;
        store.put(m.clone()).unwrap();

        // Reload against an empty data dir resets the ranges (no backing
        // file), so reconcile against a dir holding the file instead.
        let data_dir = dir.path().join("data");
        fs::create_dir_all(&data_dir).unwrap();
        fs::write(data_dir.join(format!("{}.bmv", key(2))), vec![0u8; 65536]).unwrap();

        let mut reloaded = MetadataStore::new(dir.path().join("Metadata"), "bmm").unwrap();
        let total = reloaded.load_all(&data_dir, "bmv").unwrap();
        assert_eq!(total, 65536);

        let got = reloaded.get(&key(2)).unwrap();
        assert_eq!(got.total_length, Some(1048576));
        assert_eq!(got.content_type.as_deref(), Some("video/mp4"));
        assert_eq!(got.ranges, m.ranges);
        assert_eq!(got.priority, Priority::High);
        assert!(!got.is_complete);
    }

    #[test]
    fn test_load_resets_entry_with_missing_file() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        fs::create_dir_all(&data_dir).unwrap();
        let mut store = MetadataStore::new(dir.path().join("Metadata"), "bmm").unwrap();

        let mut m = ResourceMetadata::new(key(3), "https://example.com/b.mp4");
        m.total_length = Some(8192);
        m.add_range(ByteRange::try_new(0, 8191).unwrap());
        m.is_complete = true;
        store.put(m).unwrap();

        let mut reloaded = MetadataStore::new(dir.path().join("Metadata"), "bmm").unwrap();
        let total = reloaded.load_all(&data_dir, "bmv").unwrap();
        assert_eq!(total, 0);

        let got = reloaded.get(&key(3)).unwrap();
        assert!(!got.is_complete);
        assert!(got.ranges.is_empty());
        assert_eq!(got.cached_bytes, 0);
    }

    #[test]
    fn test_load_fills_missing_total_length_from_file() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        fs::create_dir_all(&data_dir).unwrap();
        let mut store = MetadataStore::new(dir.path().join("Metadata"), "bmm").unwrap();

        // An origin that never declared a length, persisted mid-stream.
        let mut m = ResourceMetadata::new(key(7), "https://example.com/nolen.bin");
        m.add_range(ByteRange::try_new(0, 8191).unwrap());
        store.put(m).unwrap();
        fs::write(data_dir.join(format!("{}.bmv", key(7))), vec![2u8; 8192]).unwrap();

        let mut reloaded = MetadataStore::new(dir.path().join("Metadata"), "bmm").unwrap();
        reloaded.load_all(&data_dir, "bmv").unwrap();

        let got = reloaded.get(&key(7)).unwrap();
        assert_eq!(got.total_length, Some(8192));
        assert!(got.is_complete);
        assert_eq!(got.cached_bytes, 8192);

        // The learned length is durable across a second reload.
        let mut again = MetadataStore::new(dir.path().join("Metadata"), "bmm").unwrap();
        again.load_all(&data_dir, "bmv").unwrap();
        assert_eq!(again.get(&key(7)).unwrap().total_length, Some(8192));
    }

    #[test]
    fn test_load_fills_total_length_without_completing_partial() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        fs::create_dir_all(&data_dir).unwrap();
        let mut store = MetadataStore::new(dir.path().join("Metadata"), "bmm").unwrap();

        // Only the first half of the file is recorded as cached.
        let mut m = ResourceMetadata::new(key(8), "https://example.com/partial.bin");
        m.add_range(ByteRange::try_new(0, 4095).unwrap());
        store.put(m).unwrap();
        fs::write(data_dir.join(format!("{}.bmv", key(8))), vec![2u8; 8192]).unwrap();

        let mut reloaded = MetadataStore::new(dir.path().join("Metadata"), "bmm").unwrap();
        reloaded.load_all(&data_dir, "bmv").unwrap();

        let got = reloaded.get(&key(8)).unwrap();
        assert_eq!(got.total_length, Some(8192));
        assert!(!got.is_complete);
        assert_eq!(got.cached_bytes, 4096);
    }

    #[test]
    fn test_load_recovers_orphan_data_file() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        fs::create_dir_all(&data_dir).unwrap();
        fs::write(data_dir.join(format!("{}.bmv", key(4))), vec![7u8; 8192]).unwrap();

        let mut store = MetadataStore::new(dir.path().join("Metadata"), "bmm").unwrap();
        let total = store.load_all(&data_dir, "bmv").unwrap();
        assert_eq!(total, 8192);

        let got = store.get(&key(4)).unwrap();
        assert_eq!(got.total_length, Some(8192));
        assert!(got.is_complete);
        assert_eq!(got.priority, Priority::Normal);
        assert_eq!(
            got.ranges.as_slice(),
            &[ByteRange::try_new(0, 8191).unwrap()]
        );
    }

    #[test]
    fn test_remove_deletes_record() {
        let dir = TempDir::new().unwrap();
        let mut store = MetadataStore::new(dir.path(), "bmm").unwrap();
        let m = ResourceMetadata::new(key(5), "https://example.com/c.mp4");
        store.put(m).unwrap();
        let record = dir.path().join(format!("{}.bmm", key(5)));
        assert!(record.exists());

        store.remove(&key(5)).unwrap();
        assert!(!record.exists());
        assert!(store.get(&key(5)).is_none());
    }

    #[test]
    fn test_unknown_fields_skipped() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        fs::create_dir_all(&data_dir).unwrap();
        let meta_dir = dir.path().join("Metadata");
        fs::create_dir_all(&meta_dir).unwrap();

        let record = serde_json::json!({
            "version": 2,
            "key": key(6).as_str(),
            "original_url": "https://example.com/d.mp4",
            "content_type": null,
            "total_length": null,
            "supports_range": false,
            "ranges": [],
            "cached_bytes": 0,
            "is_complete": false,
            "last_access": Utc::now(),
            "access_count": 0,
            "priority": "normal",
            "expires_at": null,
            "field_from_the_future": {"nested": true}
        });
        fs::write(
            meta_dir.join(format!("{}.bmm", key(6))),
            serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();

        let mut store = MetadataStore::new(&meta_dir, "bmm").unwrap();
        store.load_all(&data_dir, "bmv").unwrap();
        assert!(store.get(&key(6)).is_some());
    }
}

//! Cache directory budget, integrity checks and entry creation.
//!
//! Entries live directly under the cache root, one directory per source
//! archive. An entry counts as valid only while its descriptor is present,
//! parses, matches the directory it sits in and points at a source archive
//! that still exists. Anything else is leftover from an interrupted launch
//! and is removed by [`CacheManager::verify_cache_integrity`].
//!
//! Eviction is least-recently-used by the descriptor's `LastUsed` timestamp,
//! falling back to the directory's modification time. Entries belonging to
//! the launch in progress are never evicted.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::PolicyStore;
use crate::extractor::Extractor;
use crate::game::GameRecord;
use crate::paths;

/// One directory under the cache root.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub dir: PathBuf,
    pub size: u64,
    pub last_used: DateTime<Utc>,
    /// `None` when the descriptor is missing or unreadable.
    pub record: Option<GameRecord>,
}

/// Snapshot of cache usage.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub cache_root: PathBuf,
    pub capacity: u64,
    pub used: u64,
    pub entries: Vec<CacheEntry>,
}

/// Where an archive's payload is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Destination {
    /// A persistent cache entry.
    Cache(PathBuf),
    /// Scratch space cleared when the game exits; no descriptor is written.
    Temp(PathBuf),
}

impl Destination {
    pub fn dir(&self) -> &Path {
        match self {
            Destination::Cache(dir) | Destination::Temp(dir) => dir,
        }
    }

    pub fn is_cache(&self) -> bool {
        matches!(self, Destination::Cache(_))
    }
}

#[derive(Debug, Clone)]
pub struct CacheManager {
    cache_root: PathBuf,
    temp_dir: PathBuf,
    /// Size ceiling in bytes.
    capacity: u64,
    /// Archives smaller than this many bytes go to the temp directory.
    min_archive_size: u64,
}

impl CacheManager {
    pub fn new(cache_root: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>, capacity: u64, min_archive_size: u64) -> Self {
        Self {
            cache_root: cache_root.into(),
            temp_dir: temp_dir.into(),
            capacity,
            min_archive_size,
        }
    }

    /// Manager for the configured cache root, with scratch space under the system temp dir.
    pub fn from_policy(policy: &PolicyStore) -> Self {
        Self::new(
            policy.cache_root(),
            std::env::temp_dir().join("archive-cache"),
            policy.global().cache_size_bytes(),
            policy.global().min_archive_size_bytes(),
        )
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Remove entries that can't be trusted as cache hits. Returns how many were removed.
    pub fn verify_cache_integrity(&self) -> Result<usize> {
        if !self.cache_root.is_dir() {
            return Ok(0);
        }

        let mut removed = 0;
        for dir in self.entry_dirs()? {
            let Some(reason) = invalid_reason(&dir) else {
                continue;
            };

            match fs::remove_dir_all(&dir) {
                Ok(()) => {
                    info!("Removed {} from cache: {}.", dir.display(), reason);
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove invalid cache entry {}: {}", dir.display(), e),
            }
        }

        if removed > 0 {
            info!("Cache integrity check removed {} entries.", removed);
        }
        Ok(removed)
    }

    /// Every entry directory with its size and last use, oldest first.
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        if !self.cache_root.is_dir() {
            return Ok(Vec::new());
        }

        let mut entries: Vec<CacheEntry> = self
            .entry_dirs()?
            .into_iter()
            .map(|dir| {
                let record = GameRecord::load(&paths::descriptor_path(&dir)).ok();
                let last_used = record
                    .as_ref()
                    .and_then(|r| r.last_used)
                    .unwrap_or_else(|| modified_time(&dir));
                CacheEntry {
                    size: dir_size(&dir),
                    dir,
                    last_used,
                    record,
                }
            })
            .collect();

        entries.sort_by_key(|e| e.last_used);
        Ok(entries)
    }

    /// Total bytes currently held by the cache.
    pub fn usage(&self) -> Result<u64> {
        Ok(self.entries()?.iter().map(|e| e.size).sum())
    }

    pub fn status(&self) -> Result<CacheStatus> {
        let entries = self.entries()?;
        Ok(CacheStatus {
            cache_root: self.cache_root.clone(),
            capacity: self.capacity,
            used: entries.iter().map(|e| e.size).sum(),
            entries,
        })
    }

    /// Evict least-recently-used entries until `needed` more bytes fit.
    ///
    /// Directories in `active` are never touched. Returns false when the
    /// budget can't be met even after evicting everything else.
    pub fn make_space(&self, needed: u64, active: &[PathBuf]) -> Result<bool> {
        let entries = self.entries()?;
        let mut used: u64 = entries.iter().map(|e| e.size).sum();
        let fits = |used: u64| used.saturating_add(needed) <= self.capacity;

        for entry in entries.iter().filter(|e| !active.contains(&e.dir)) {
            if fits(used) {
                break;
            }

            info!(
                "Evicting {} ({} bytes, last used {}) to free space.",
                entry.dir.display(),
                entry.size,
                entry.last_used.to_rfc3339()
            );
            fs::remove_dir_all(&entry.dir)
                .with_context(|| format!("Failed to evict {}", entry.dir.display()))?;
            used = used.saturating_sub(entry.size);
        }

        Ok(fits(used))
    }

    /// Decide where an archive goes and clear room for it.
    ///
    /// `source_size` is the on-disk size of the source archive(s), `needed`
    /// the decompressed size. Small archives and anything that can't fit the
    /// budget go to the temp directory.
    pub fn plan_destination(
        &self,
        entry_dir: &Path,
        source_size: u64,
        needed: u64,
        active: &[PathBuf],
    ) -> Result<Destination> {
        let temp = || {
            let name = entry_dir.file_name().unwrap_or(entry_dir.as_os_str());
            Destination::Temp(self.temp_dir.join(name))
        };

        if source_size < self.min_archive_size {
            info!(
                "Archive size {} bytes is below the minimum of {} bytes, extracting to temp.",
                source_size, self.min_archive_size
            );
            return Ok(temp());
        }

        if needed > self.capacity {
            warn!(
                "Decompressed size {} bytes exceeds the cache size of {} bytes, extracting to temp.",
                needed, self.capacity
            );
            return Ok(temp());
        }

        if !self.make_space(needed, active)? {
            warn!("Could not free {} bytes in the cache, extracting to temp.", needed);
            return Ok(temp());
        }

        Ok(Destination::Cache(entry_dir.to_path_buf()))
    }

    /// Extract an archive into a fresh entry directory.
    ///
    /// `entry_dir` is wiped first; `dest` is where the payload goes (the
    /// entry itself or a subdirectory of it). On failure the entry is removed
    /// so a partial payload never survives. The descriptor is left to the
    /// caller, to be written once this returns successfully.
    pub fn create_entry(
        &self,
        extractor: &dyn Extractor,
        archive_path: &Path,
        entry_dir: &Path,
        dest: &Path,
        include: &[String],
    ) -> Result<()> {
        if entry_dir.exists() {
            fs::remove_dir_all(entry_dir)
                .with_context(|| format!("Failed to clear {}", entry_dir.display()))?;
        }
        fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;

        info!("Extracting {} to {} using {}.", archive_path.display(), dest.display(), extractor.name());
        if !extractor.extract(archive_path, dest, include, &[]) {
            if let Err(e) = fs::remove_dir_all(entry_dir) {
                warn!("Failed to remove partial entry {}: {}", entry_dir.display(), e);
            }
            bail!("{} failed to extract {}", extractor.name(), archive_path.display());
        }

        Ok(())
    }

    /// Remove everything extracted to the temp directory.
    pub fn clear_temp(&self) -> Result<()> {
        if self.temp_dir.exists() {
            fs::remove_dir_all(&self.temp_dir)
                .with_context(|| format!("Failed to clear {}", self.temp_dir.display()))?;
            info!("Cleared temporary extraction directory {}.", self.temp_dir.display());
        }
        Ok(())
    }

    fn entry_dirs(&self) -> Result<Vec<PathBuf>> {
        let read = fs::read_dir(&self.cache_root)
            .with_context(|| format!("Failed to read cache directory {}", self.cache_root.display()))?;

        Ok(read
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect())
    }
}

fn invalid_reason(dir: &Path) -> Option<String> {
    let descriptor = paths::descriptor_path(dir);
    if !descriptor.is_file() {
        return Some("descriptor missing".to_string());
    }

    let record = match GameRecord::load(&descriptor) {
        Ok(record) => record,
        Err(e) => return Some(format!("descriptor unreadable ({})", e)),
    };

    if !Path::new(&record.archive_path).exists() {
        return Some(format!("source archive {} no longer exists", record.archive_path));
    }

    let expected = paths::archive_cache_dir_name(&record.archive_path);
    if dir.file_name().map(|n| n.to_string_lossy() != expected).unwrap_or(true) {
        return Some(format!("descriptor belongs to {}", record.archive_path));
    }

    None
}

fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn modified_time(dir: &Path) -> DateTime<Utc> {
    fs::metadata(dir)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::testing::MockExtractor;
    use chrono::TimeZone;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        dir: TempDir,
        manager: CacheManager,
    }

    impl Fixture {
        fn new(capacity: u64, min_archive_size: u64) -> Self {
            let dir = tempdir().unwrap();
            let manager = CacheManager::new(dir.path().join("cache"), dir.path().join("temp"), capacity, min_archive_size);
            fs::create_dir_all(manager.cache_root()).unwrap();
            Self { dir, manager }
        }

        /// A valid entry with `size` payload bytes, last used `hour` o'clock.
        fn entry(&self, name: &str, size: usize, hour: u32) -> PathBuf {
            let source = self.dir.path().join("roms").join(format!("{}.zip", name));
            fs::create_dir_all(source.parent().unwrap()).unwrap();
            fs::write(&source, b"zip").unwrap();

            let source = source.to_string_lossy().into_owned();
            let entry = paths::archive_cache_dir(self.manager.cache_root(), &source);
            fs::create_dir_all(&entry).unwrap();
            fs::write(entry.join("payload.bin"), vec![0u8; size]).unwrap();

            let mut record = GameRecord::new(name, source);
            record.last_used = Some(Utc.with_ymd_and_hms(2026, 1, 1, hour, 0, 0).unwrap());
            record.save(&paths::descriptor_path(&entry)).unwrap();
            entry
        }
    }

    #[test]
    fn test_verify_removes_invalid_entries() -> Result<()> {
        let fx = Fixture::new(u64::MAX, 0);
        let valid = fx.entry("valid", 10, 1);

        let no_descriptor = fx.manager.cache_root().join("interrupted");
        fs::create_dir_all(&no_descriptor)?;
        fs::write(no_descriptor.join("half.bin"), b"x")?;

        let corrupt = fx.entry("corrupt", 10, 1);
        fs::write(paths::descriptor_path(&corrupt), "garbage without section\n")?;

        let orphan = fx.entry("orphan", 10, 1);
        fs::remove_file(fx.dir.path().join("roms").join("orphan.zip"))?;

        assert_eq!(fx.manager.verify_cache_integrity()?, 3);
        assert!(valid.exists());
        assert!(!no_descriptor.exists());
        assert!(!corrupt.exists());
        assert!(!orphan.exists());
        Ok(())
    }

    #[test]
    fn test_verify_missing_root() -> Result<()> {
        let dir = tempdir()?;
        let manager = CacheManager::new(dir.path().join("nope"), dir.path().join("temp"), 1, 0);
        assert_eq!(manager.verify_cache_integrity()?, 0);
        Ok(())
    }

    #[test]
    fn test_eviction_is_lru() -> Result<()> {
        let fx = Fixture::new(u64::MAX, 0);
        let oldest = fx.entry("oldest", 4000, 1);
        let middle = fx.entry("middle", 4000, 2);
        let newest = fx.entry("newest", 4000, 3);
        // Descriptors take a little space on top of the payloads
        let overhead = fx.manager.usage()? - 12_000;
        let manager = CacheManager::new(fx.manager.cache_root(), fx.manager.temp_dir(), 10_000 + overhead, 0);

        assert!(manager.make_space(4000, &[])?);
        assert!(!oldest.exists());
        assert!(!middle.exists());
        assert!(newest.exists());
        Ok(())
    }

    #[test]
    fn test_eviction_skips_active_entries() -> Result<()> {
        let fx = Fixture::new(u64::MAX, 0);
        let oldest = fx.entry("oldest", 4000, 1);
        let middle = fx.entry("middle", 4000, 2);
        let newest = fx.entry("newest", 4000, 3);
        let overhead = fx.manager.usage()? - 12_000;
        let manager = CacheManager::new(fx.manager.cache_root(), fx.manager.temp_dir(), 10_000 + overhead, 0);

        assert!(manager.make_space(4000, &[oldest.clone()])?);
        assert!(oldest.exists());
        assert!(!middle.exists());
        assert!(!newest.exists());
        Ok(())
    }

    #[test]
    fn test_cannot_fit_when_only_active_entries_remain() -> Result<()> {
        let fx = Fixture::new(u64::MAX, 0);
        let only = fx.entry("only", 400, 1);
        let manager = CacheManager::new(fx.manager.cache_root(), fx.manager.temp_dir(), 500, 0);

        assert!(!manager.make_space(400, &[only.clone()])?);
        assert!(only.exists());
        Ok(())
    }

    #[test]
    fn test_small_archive_goes_to_temp() -> Result<()> {
        let fx = Fixture::new(10_000, 100);
        let entry = fx.manager.cache_root().join("tiny-abc");

        let dest = fx.manager.plan_destination(&entry, 99, 50, &[])?;
        assert_eq!(dest, Destination::Temp(fx.manager.temp_dir().join("tiny-abc")));

        let dest = fx.manager.plan_destination(&entry, 100, 50, &[])?;
        assert_eq!(dest, Destination::Cache(entry));
        Ok(())
    }

    #[test]
    fn test_oversized_archive_goes_to_temp() -> Result<()> {
        let fx = Fixture::new(1000, 0);
        let entry = fx.manager.cache_root().join("huge-abc");
        assert!(!fx.manager.plan_destination(&entry, 5000, 5000, &[])?.is_cache());
        Ok(())
    }

    #[test]
    fn test_failed_extraction_leaves_nothing() -> Result<()> {
        let fx = Fixture::new(u64::MAX, 0);
        let mock = MockExtractor {
            fail_extract: true,
            ..MockExtractor::default()
        };
        let entry = fx.manager.cache_root().join("broken-abc");

        let result = fx
            .manager
            .create_entry(&mock, Path::new("/roms/broken.zip"), &entry, &entry, &[]);
        assert!(result.is_err());
        assert!(!entry.exists());
        Ok(())
    }

    #[test]
    fn test_create_entry_replaces_stale_payload() -> Result<()> {
        let fx = Fixture::new(u64::MAX, 0);
        let mock = MockExtractor::default().with_archive("game.zip", &["game.bin"], 7);
        let entry = fx.manager.cache_root().join("game-abc");
        fs::create_dir_all(&entry)?;
        fs::write(entry.join("stale.tmp"), b"x")?;

        fx.manager
            .create_entry(&mock, Path::new("/roms/game.zip"), &entry, &entry.join("Title"), &[])?;
        assert!(!entry.join("stale.tmp").exists());
        assert!(entry.join("Title").join("game.bin").exists());
        assert!(!paths::descriptor_path(&entry).exists());
        Ok(())
    }

    #[test]
    fn test_clear_temp() -> Result<()> {
        let fx = Fixture::new(u64::MAX, 0);
        fs::create_dir_all(fx.manager.temp_dir().join("game-abc"))?;
        fx.manager.clear_temp()?;
        assert!(!fx.manager.temp_dir().exists());
        // Clearing twice is fine
        fx.manager.clear_temp()?;
        Ok(())
    }

    #[test]
    fn test_status_orders_entries_by_last_use() -> Result<()> {
        let fx = Fixture::new(u64::MAX, 0);
        fx.entry("b", 1, 5);
        fx.entry("a", 1, 2);

        let status = fx.manager.status()?;
        let ids: Vec<_> = status
            .entries
            .iter()
            .map(|e| e.record.as_ref().unwrap().id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(status.used, fx.manager.usage()?);
        Ok(())
    }
}

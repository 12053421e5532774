//! Persistent disk cache for encoded images
//!
//! Each entry is a PNG file named after the SHA-256 digest of its cache key.
//! Size accounting scans the cache directory; when the aggregate size reaches
//! the capacity, a batch of the oldest files (by modification time) is
//! deleted before the new entry is written.

use crate::buffer::{PixelFormat, PooledBuffer};
use crate::key::CacheKey;
use image::{ColorType, ImageEncoder, ImageFormat};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

/// Default disk capacity: 50 MB
pub const DEFAULT_DISK_CACHE_SIZE: u64 = 50 * 1024 * 1024;

/// Default number of files deleted per eviction pass
pub const DEFAULT_EVICT_BATCH: usize = 10;

const ENTRY_EXTENSION: &str = "png";

/// Statistics for monitoring disk cache performance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskCacheStats {
    /// Number of successful reads
    pub hits: u64,
    /// Number of absent or unreadable entries
    pub misses: u64,
    /// Number of files deleted to free space
    pub evictions: u64,
    /// Number of successful writes
    pub writes: u64,
}

impl DiskCacheStats {
    /// Calculate cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

/// Size-bounded, persistent key to file store
///
/// Reads take no lock; the size check, eviction and write of `put` run under
/// one coarse lock so concurrent writers cannot overshoot the capacity by more
/// than a single entry.
pub struct DiskCache {
    dir: PathBuf,
    capacity: u64,
    evict_batch: usize,
    write_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writes: AtomicU64,
}

impl DiskCache {
    /// Open a disk cache rooted at `dir`, creating the directory if needed
    pub fn new<P: AsRef<Path>>(dir: P, capacity: u64) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            capacity,
            evict_batch: DEFAULT_EVICT_BATCH,
            write_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    /// Open a disk cache with its capacity given in megabytes
    pub fn with_mb_limit<P: AsRef<Path>>(dir: P, megabytes: u64) -> io::Result<Self> {
        Self::new(dir, megabytes * 1024 * 1024)
    }

    /// Set how many files a single eviction pass may delete (at least one)
    pub fn with_evict_batch(mut self, batch: usize) -> Self {
        self.evict_batch = batch.max(1);
        self
    }

    /// File that stores (or would store) `key`
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir
            .join(format!("{}.{}", key.digest(), ENTRY_EXTENSION))
    }

    /// Read and decode the entry for `key`
    ///
    /// Absence and decode failures both yield `None`.
    pub fn get(&self, key: &CacheKey) -> Option<PooledBuffer> {
        let path = self.path_for(key);

        match read_entry(&path) {
            Ok(buffer) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%key, "disk cache hit");
                Some(buffer)
            }
            Err(err) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                if path.exists() {
                    tracing::warn!(%key, error = %err, "unreadable disk cache entry");
                }
                None
            }
        }
    }

    /// Encode `buffer` and store it under `key`
    ///
    /// When the cache is at or over capacity, up to one batch of the oldest
    /// files is deleted first. Returns whether the entry was written.
    pub fn put(&self, key: &CacheKey, buffer: &PooledBuffer) -> bool {
        let _guard = self.write_lock.lock().unwrap();

        if let Err(err) = fs::create_dir_all(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), error = %err, "cannot create disk cache directory");
            return false;
        }

        match self.scan() {
            Ok(files) => {
                let total: u64 = files.iter().map(|f| f.size).sum();
                if total >= self.capacity {
                    self.evict_oldest(files, total);
                }
            }
            Err(err) => tracing::warn!(error = %err, "disk cache scan failed"),
        }

        let path = self.path_for(key);
        match write_entry(&path, buffer) {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%key, path = %path.display(), "disk cache write");
                true
            }
            Err(err) => {
                tracing::warn!(%key, error = %err, "disk cache write failed");
                let _ = fs::remove_file(&path);
                false
            }
        }
    }

    /// Delete the entry for `key`; returns whether a file was removed
    pub fn remove(&self, key: &CacheKey) -> bool {
        let _guard = self.write_lock.lock().unwrap();
        fs::remove_file(self.path_for(key)).is_ok()
    }

    /// Delete every entry in the cache directory
    pub fn clear(&self) -> io::Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        for file in self.scan()? {
            if let Err(err) = fs::remove_file(&file.path) {
                if err.kind() != io::ErrorKind::NotFound {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Check if an entry exists without reading it
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.path_for(key).is_file()
    }

    /// Aggregate size of all entries in bytes, by directory scan
    pub fn size_on_disk(&self) -> u64 {
        self.scan()
            .map(|files| files.iter().map(|f| f.size).sum())
            .unwrap_or(0)
    }

    /// Number of entries on disk
    pub fn entry_count(&self) -> usize {
        self.scan().map(|files| files.len()).unwrap_or(0)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stats(&self) -> DiskCacheStats {
        DiskCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    /// Delete the oldest files, at most one batch, until under capacity
    fn evict_oldest(&self, mut files: Vec<CacheFile>, mut total: u64) {
        files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));

        for file in files.into_iter().take(self.evict_batch) {
            if total < self.capacity {
                break;
            }
            match fs::remove_file(&file.path) {
                Ok(()) => {
                    total = total.saturating_sub(file.size);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(path = %file.path.display(), bytes = file.size, "disk cache eviction");
                }
                Err(err) => {
                    tracing::warn!(path = %file.path.display(), error = %err, "disk cache eviction failed");
                }
            }
        }
    }

    fn scan(&self) -> io::Result<Vec<CacheFile>> {
        let mut files = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(files),
            Err(err) => return Err(err),
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };
            files.push(CacheFile {
                path,
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(files)
    }
}

/// Encode as PNG: RGBA for Rgba8888, RGB for Rgb565
fn write_entry(path: &Path, buffer: &PooledBuffer) -> io::Result<()> {
    let rgba = buffer
        .to_rgba_image()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "buffer has no pixel data"))?;

    let file = File::create(path)?;
    let encoder = image::codecs::png::PngEncoder::new(BufWriter::new(file));
    let result = match buffer.format() {
        PixelFormat::Rgba8888 => encoder.write_image(
            rgba.as_raw(),
            rgba.width(),
            rgba.height(),
            ColorType::Rgba8.into(),
        ),
        PixelFormat::Rgb565 => {
            let rgb = image::DynamicImage::ImageRgba8(rgba).to_rgb8();
            encoder.write_image(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8.into())
        }
    };
    result.map_err(|err| io::Error::new(io::ErrorKind::Other, err))
}

fn read_entry(path: &Path) -> io::Result<PooledBuffer> {
    let file = File::open(path)?;
    let decoded = image::load(BufReader::new(file), ImageFormat::Png)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

    let format = match decoded.color() {
        ColorType::Rgb8 => PixelFormat::Rgb565,
        _ => PixelFormat::Rgba8888,
    };
    Ok(PooledBuffer::from_rgba_image(decoded.to_rgba8(), format))
}

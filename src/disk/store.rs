//! Disk Backing Store
//!
//! Owns one data file and its index. Elements are encoded into a buffer,
//! given a region by the [`FileAllocator`], and written with positional I/O.
//! The allocator lock covers allocation, free and index flush only; the
//! reads and writes themselves run without it.
//!
//! # Files
//!
//! - `<dir>/<name>.data`  : element encodings at arbitrary offsets, no framing
//! - `<dir>/<name>.index` : key -> marker map plus free regions (see [`index`](super::index))
//!
//! # Lifecycle
//!
//! ```text
//! open ──> [non-persistent] delete data + index
//!      └─> [persistent] data missing/empty  -> delete index
//!                       data newer than index + tolerance -> delete index (stale)
//! load_index ──> no index / corrupt -> truncate data, start cold
//!            └─> ok -> rebuild allocator, delete index, shrink data file
//! write_index (flush/dispose) ──> index written atomically
//! close ──> [non-persistent] delete data + index
//! ```

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use super::allocator::FileAllocator;
use super::index::{self, IndexContents};
use super::marker::{DiskMarker, MarkerRecord};
use super::region::Region;
use crate::config::DiskConfig;
use crate::element::{decode_element, encode_element, Element};
use crate::error::{Error, Result};

/// Data files currently open in this process
static OPEN_DATA_FILES: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Initial guess for the encoding buffer before any element was written
const INITIAL_BUFFER_SIZE: usize = 512;

/// Exclusive claim on a data file path, released on drop
#[derive(Debug)]
struct DataFileClaim(PathBuf);

impl DataFileClaim {
    fn acquire(path: PathBuf) -> Result<Self> {
        let mut open = OPEN_DATA_FILES.lock();
        if !open.insert(path.clone()) {
            return Err(Error::Config(format!(
                "data file {} is already in use by another store",
                path.display()
            )));
        }
        Ok(Self(path))
    }
}

impl Drop for DataFileClaim {
    fn drop(&mut self) {
        OPEN_DATA_FILES.lock().remove(&self.0);
    }
}

/// Overflow tier backed by a single data file
pub struct DiskBackingStore<K> {
    name: String,
    data_path: PathBuf,
    index_path: PathBuf,
    file: File,
    allocator: Mutex<FileAllocator>,
    persistent: bool,
    cache_written: bool,
    /// Running average of encoded element sizes
    avg_element_size: AtomicUsize,
    /// Bytes held by live markers
    bytes_on_disk: AtomicU64,
    /// Released by [`close`](Self::close)
    claim: Mutex<Option<DataFileClaim>>,
    _key: PhantomData<fn() -> K>,
}

impl<K> std::fmt::Debug for DiskBackingStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskBackingStore")
            .field("name", &self.name)
            .field("data_path", &self.data_path)
            .field("persistent", &self.persistent)
            .field("bytes_on_disk", &self.bytes_on_disk())
            .finish()
    }
}

impl<K> DiskBackingStore<K>
where
    K: Serialize + DeserializeOwned + Clone,
{
    /// Open (or create) the data file for store `name`
    pub fn open(name: &str, config: &DiskConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.directory).map_err(|e| {
            Error::Config(format!(
                "cannot create disk directory {}: {}",
                config.directory.display(),
                e
            ))
        })?;
        let directory = config.directory.canonicalize().map_err(|e| {
            Error::Config(format!(
                "cannot resolve disk directory {}: {}",
                config.directory.display(),
                e
            ))
        })?;
        let metadata = std::fs::metadata(&directory)?;
        if !metadata.is_dir() {
            return Err(Error::Config(format!(
                "disk path {} is not a directory",
                directory.display()
            )));
        }
        if metadata.permissions().readonly() {
            return Err(Error::Config(format!(
                "disk directory {} is not writable",
                directory.display()
            )));
        }

        let data_path = directory.join(format!("{}.data", name));
        let index_path = directory.join(format!("{}.index", name));
        let claim = DataFileClaim::acquire(data_path.clone())?;

        if config.persistent {
            Self::discard_stale_index(&data_path, &index_path, config.staleness_tolerance())?;
        } else {
            index::remove_if_exists(&data_path)?;
            index::remove_if_exists(&index_path)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&data_path)
            .map_err(|e| {
                Error::Config(format!(
                    "cannot open data file {}: {}",
                    data_path.display(),
                    e
                ))
            })?;

        info!(
            store = name,
            path = %data_path.display(),
            persistent = config.persistent,
            "opened disk store"
        );

        Ok(Self {
            name: name.to_string(),
            data_path,
            index_path,
            file,
            allocator: Mutex::new(FileAllocator::new()),
            persistent: config.persistent,
            cache_written: config.cache_written_elements,
            avg_element_size: AtomicUsize::new(0),
            bytes_on_disk: AtomicU64::new(0),
            claim: Mutex::new(Some(claim)),
            _key: PhantomData,
        })
    }

    fn discard_stale_index(data_path: &Path, index_path: &Path, tolerance: Duration) -> Result<()> {
        let data_len = std::fs::metadata(data_path).map(|m| m.len()).unwrap_or(0);
        if data_len == 0 {
            index::remove_if_exists(index_path)?;
        } else if index_path.exists() && index::index_is_stale(data_path, index_path, tolerance) {
            warn!(
                index = %index_path.display(),
                "data file is newer than index, discarding stale index"
            );
            index::remove_if_exists(index_path)?;
        }
        Ok(())
    }

    // =========================================================================
    // Raw byte I/O
    // =========================================================================

    /// Write `bytes` into a freshly allocated region
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<Region> {
        let region = self.allocator.lock().alloc(bytes.len() as u64)?;
        if let Err(e) = self.file.write_all_at(bytes, region.start()) {
            self.allocator.lock().free(region);
            return Err(e.into());
        }
        self.bytes_on_disk
            .fetch_add(region.size(), Ordering::Relaxed);
        Ok(region)
    }

    /// Read the bytes a marker points at
    pub fn read_bytes(&self, marker: &DiskMarker<K>) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; marker.length() as usize];
        self.file.read_exact_at(&mut buf, marker.offset())?;
        Ok(buf)
    }

    // =========================================================================
    // Element I/O
    // =========================================================================

    /// Encode and write an element, returning its marker
    pub fn write(&self, element: &Arc<Element<K>>) -> Result<Arc<DiskMarker<K>>> {
        let estimate = match self.avg_element_size.load(Ordering::Relaxed) {
            0 => INITIAL_BUFFER_SIZE,
            avg => avg,
        };
        let mut buf = Vec::with_capacity(estimate);
        encode_element(element, &mut buf)?;
        if buf.is_empty() || buf.len() > u32::MAX as usize {
            return Err(Error::Serialization(format!(
                "encoded element of {} bytes cannot be stored",
                buf.len()
            )));
        }
        self.record_size(buf.len());

        let region = self.write_bytes(&buf)?;
        let marker = DiskMarker::new(region, element.expiration_time());
        if self.cache_written {
            marker.set_cached(Arc::clone(element));
        }
        debug!(store = %self.name, offset = region.start(), len = region.size(), "wrote element");
        Ok(Arc::new(marker))
    }

    /// Read an element back. Decode failures come back as [`Error::Serialization`].
    pub fn read(&self, marker: &DiskMarker<K>) -> Result<Arc<Element<K>>> {
        let element = match marker.take_cached() {
            Some(cached) => cached,
            None => Arc::new(decode_element::<K>(&self.read_bytes(marker)?)?),
        };
        element.restore_access(marker.last_access(), marker.hit_count());
        Ok(element)
    }

    /// Release a marker's region
    pub fn free(&self, marker: &DiskMarker<K>) {
        marker.take_cached();
        if self.allocator.lock().free(marker.region()).is_some() {
            self.bytes_on_disk
                .fetch_sub(u64::from(marker.length()), Ordering::Relaxed);
        }
    }

    fn record_size(&self, len: usize) {
        let old = self.avg_element_size.load(Ordering::Relaxed);
        let new = if old == 0 { len } else { (old * 7 + len) / 8 };
        self.avg_element_size.store(new.max(1), Ordering::Relaxed);
    }

    // =========================================================================
    // Index
    // =========================================================================

    /// Persist `entries` and the free-region set
    pub fn write_index(&self, entries: &[(K, MarkerRecord)]) -> Result<()> {
        if !self.persistent {
            return Ok(());
        }
        let allocator = self.allocator.lock();
        let free: Vec<Region> = allocator.free_regions().collect();
        self.file.sync_data()?;
        if self.file.metadata()?.len() > allocator.file_size() {
            self.file.set_len(allocator.file_size())?;
        }
        index::write_index(&self.index_path, allocator.file_size(), entries, &free)?;
        info!(
            store = %self.name,
            entries = entries.len(),
            file_size = allocator.file_size(),
            "wrote index"
        );
        Ok(())
    }

    /// Load the index if one exists, rebuilding allocator state from it.
    ///
    /// Never fails on a bad index: the store starts cold instead. The index
    /// file is deleted after a successful load.
    pub fn load_index(&self) -> Result<Vec<(K, Arc<DiskMarker<K>>)>> {
        if !self.persistent {
            return Ok(Vec::new());
        }
        if !self.index_path.exists() {
            info!(store = %self.name, "no index, starting cold");
            self.start_cold()?;
            return Ok(Vec::new());
        }

        let rebuilt = index::read_index::<K>(&self.index_path)
            .and_then(|contents| self.rebuild(contents));
        let (allocator, entries) = match rebuilt {
            Ok(r) => r,
            Err(e) => {
                warn!(store = %self.name, error = %e, "discarding unusable index, starting cold");
                index::remove_if_exists(&self.index_path)?;
                self.start_cold()?;
                return Ok(Vec::new());
            }
        };

        self.file.set_len(allocator.file_size())?;
        self.bytes_on_disk
            .store(allocator.allocated(), Ordering::Relaxed);
        *self.allocator.lock() = allocator;
        index::remove_if_exists(&self.index_path)?;

        info!(store = %self.name, entries = entries.len(), "loaded index");
        Ok(entries
            .into_iter()
            .map(|(key, record)| (key, Arc::new(DiskMarker::from_record(record))))
            .collect())
    }

    #[allow(clippy::type_complexity)]
    fn rebuild(
        &self,
        contents: IndexContents<K>,
    ) -> Result<(FileAllocator, Vec<(K, MarkerRecord)>)> {
        let corrupt = |reason: String| Error::CorruptIndex {
            path: self.index_path.clone(),
            reason,
        };

        let data_len = self.file.metadata()?.len();
        if data_len < contents.file_size {
            return Err(corrupt(format!(
                "data file is {} bytes, index expects {}",
                data_len, contents.file_size
            )));
        }

        let mut allocator = FileAllocator::with_free_file(contents.file_size);
        for (_, record) in &contents.entries {
            if record.length == 0 {
                return Err(corrupt(format!("zero-length marker at {}", record.offset)));
            }
            let region = Region::with_len(record.offset, u64::from(record.length));
            allocator
                .mark(region)
                .map_err(|e| corrupt(format!("marker {}: {}", region, e)))?;
        }

        // every hole the writer recorded must still be a hole
        for hole in &contents.free {
            let ok = hole.start() <= hole.end()
                && allocator
                    .free_regions()
                    .any(|r| r.encloses(hole));
            if !ok {
                return Err(corrupt(format!("free region {} is in use", hole)));
            }
        }

        allocator.trim_tail();
        Ok((allocator, contents.entries))
    }

    fn start_cold(&self) -> Result<()> {
        self.allocator.lock().reset();
        self.bytes_on_disk.store(0, Ordering::Relaxed);
        self.file.set_len(0)?;
        Ok(())
    }

    /// Release the store: sync a persistent file, delete a temporary one,
    /// and give up the claim on the data file path
    pub fn close(&self) -> Result<()> {
        let result = if self.persistent {
            self.file.sync_all().map_err(Error::from)
        } else {
            index::remove_if_exists(&self.data_path)
                .and_then(|_| index::remove_if_exists(&self.index_path))
        };
        self.claim.lock().take();
        debug!(store = %self.name, "closed disk store");
        result
    }
}

impl<K> DiskBackingStore<K> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Bytes held by live markers
    pub fn bytes_on_disk(&self) -> u64 {
        self.bytes_on_disk.load(Ordering::Relaxed)
    }

    /// Logical data file size
    pub fn file_size(&self) -> u64 {
        self.allocator.lock().file_size()
    }

    /// Bytes in holes inside the data file
    pub fn free_bytes(&self) -> u64 {
        self.allocator.lock().free_bytes()
    }

    /// Running average encoded element size
    pub fn average_element_size(&self) -> usize {
        self.avg_element_size.load(Ordering::Relaxed)
    }
}

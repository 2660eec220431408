//! Index File
//!
//! The index makes a persistent data file usable after a restart: it maps each
//! key to its marker and records the free-region set at the time of writing.
//!
//! # Format (bincode, fixed-width integers)
//!
//! ```text
//! IndexHeader { magic, version, entry_count, file_size }
//! (K, MarkerRecord) x entry_count
//! Vec<Region>                       free regions, ascending
//! ```
//!
//! Written to `<name>.index.tmp`, synced, then renamed over `<name>.index`.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::marker::MarkerRecord;
use super::region::Region;
use crate::error::{Error, Result};

/// "TSIX"
pub const INDEX_MAGIC: u32 = 0x5453_4958;

/// Current index format version
pub const INDEX_VERSION: u32 = 2;

/// Upper bound for a single decoded record, guards against corrupt lengths
const MAX_RECORD_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct IndexHeader {
    magic: u32,
    version: u32,
    entry_count: u64,
    file_size: u64,
}

/// Decoded index file
#[derive(Debug, Clone)]
pub struct IndexContents<K> {
    pub file_size: u64,
    pub entries: Vec<(K, MarkerRecord)>,
    pub free: Vec<Region>,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(MAX_RECORD_BYTES)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write an index atomically
pub fn write_index<K: Serialize>(
    path: &Path,
    file_size: u64,
    entries: &[(K, MarkerRecord)],
    free: &[Region],
) -> Result<()> {
    let tmp = temp_path(path);
    {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        let header = IndexHeader {
            magic: INDEX_MAGIC,
            version: INDEX_VERSION,
            entry_count: entries.len() as u64,
            file_size,
        };
        codec().serialize_into(&mut writer, &header)?;
        for (key, record) in entries {
            codec().serialize_into(&mut writer, &(key, record))?;
        }
        codec().serialize_into(&mut writer, free)?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?
            .sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read an index. Any decode problem is reported as [`Error::CorruptIndex`].
pub fn read_index<K: DeserializeOwned>(path: &Path) -> Result<IndexContents<K>> {
    let corrupt = |reason: String| Error::CorruptIndex {
        path: path.to_path_buf(),
        reason,
    };

    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let header: IndexHeader = codec()
        .deserialize_from(&mut reader)
        .map_err(|e| corrupt(format!("header: {}", e)))?;
    if header.magic != INDEX_MAGIC {
        return Err(corrupt(format!("bad magic {:#x}", header.magic)));
    }
    if header.version != INDEX_VERSION {
        return Err(corrupt(format!("unsupported version {}", header.version)));
    }

    let mut entries = Vec::with_capacity(header.entry_count.min(1 << 16) as usize);
    for i in 0..header.entry_count {
        let entry: (K, MarkerRecord) = codec()
            .deserialize_from(&mut reader)
            .map_err(|e| corrupt(format!("entry {}: {}", i, e)))?;
        entries.push(entry);
    }

    let free: Vec<Region> = codec()
        .deserialize_from(&mut reader)
        .map_err(|e| corrupt(format!("free regions: {}", e)))?;

    Ok(IndexContents {
        file_size: header.file_size,
        entries,
        free,
    })
}

/// True if the data file was modified more than `tolerance` after the index.
/// A missing file on either side counts as stale.
pub fn index_is_stale(data_path: &Path, index_path: &Path, tolerance: Duration) -> bool {
    let mtime = |p: &Path| fs::metadata(p).and_then(|m| m.modified());
    match (mtime(data_path), mtime(index_path)) {
        (Ok(data), Ok(index)) => data > index + tolerance,
        _ => true,
    }
}

/// Remove a file, treating "not found" as success
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

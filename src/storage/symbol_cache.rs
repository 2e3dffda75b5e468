//! Hash-bucketed symbol cache for O(1) identifier resolution
//!
//! This module resolves any spelling of a chunk identifier (or a bare symbol
//! name) to the canonical [`ChunkId`] stored in the metadata store. Keys are
//! 64-bit FNV-1a hashes distributed over a power-of-two number of buckets.
//! The cache is a pure accelerator: every entry it holds is also recorded in
//! the metadata store, and a failed load simply yields an empty cache.
//!
//! # File Format
//!
//! - Header (32 bytes): magic, version, bucket count, id count, symbol count
//! - Identifier buckets: `u32` entry count, then `(hash:u64, len:u32, bytes)`
//! - Symbol-name buckets (version 2 only): same layout as identifier buckets

use crate::types::ChunkId;
use memmap2::MmapOptions;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Magic bytes to identify symbol cache files
const MAGIC_BYTES: &[u8; 4] = b"SYMC";

/// Version written by this build. Version 1 files carry no symbol-name buckets.
const VERSION: u32 = 2;

/// Default number of hash buckets (power of 2 for fast modulo)
pub const DEFAULT_BUCKET_COUNT: usize = 256;

/// Header size in bytes
const HEADER_SIZE: usize = 32;

/// FNV-1a hash function for good distribution
pub fn fnv1a_hash(data: &[u8]) -> u64 {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Deterministic identity hash of a chunk identifier.
///
/// Computed over the normalized spelling so every separator variant of the
/// same identifier hashes identically.
pub fn identity_hash(id: &ChunkId) -> u64 {
    fnv1a_hash(id.normalized().as_bytes())
}

/// Hash of a bare symbol name.
fn symbol_hash(name: &str) -> u64 {
    fnv1a_hash(name.as_bytes())
}

/// Bucketed hash directory from key hash to canonical identifier
#[derive(Debug)]
pub struct SymbolHashCache {
    path: PathBuf,
    bucket_count: usize,
    id_buckets: Vec<HashMap<u64, ChunkId>>,
    symbol_buckets: Vec<HashMap<u64, ChunkId>>,
}

impl SymbolHashCache {
    /// Create an empty cache persisted at `path`
    pub fn new(path: impl AsRef<Path>, bucket_count: usize) -> Self {
        let bucket_count = bucket_count.max(1).next_power_of_two();
        Self {
            path: path.as_ref().to_path_buf(),
            bucket_count,
            id_buckets: vec![HashMap::new(); bucket_count],
            symbol_buckets: vec![HashMap::new(); bucket_count],
        }
    }

    /// Load a cache from disk. A missing or corrupt file yields an empty cache.
    pub fn load(path: impl AsRef<Path>, bucket_count: usize) -> Self {
        let mut cache = Self::new(path, bucket_count);
        if !cache.path.exists() {
            return cache;
        }

        match cache.read_file() {
            Ok(()) => debug!(
                "Loaded symbol cache: {} identifiers, {} symbol names",
                cache.len(),
                cache.symbol_count()
            ),
            Err(e) => {
                warn!(
                    "Ignoring unreadable symbol cache {}: {e}",
                    cache.path.display()
                );
                cache.clear();
            }
        }
        cache
    }

    /// Get the path to the cache file
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Number of cached identifiers
    pub fn len(&self) -> usize {
        self.id_buckets.iter().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of cached symbol names
    pub fn symbol_count(&self) -> usize {
        self.symbol_buckets.iter().map(HashMap::len).sum()
    }

    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) & (self.bucket_count - 1)
    }

    /// Record `canonical` as the resolution of every spelling of itself.
    pub fn add(&mut self, canonical: &ChunkId) {
        self.add_alias(canonical.as_str(), canonical);
    }

    /// Record `canonical` as the resolution of `key` (any spelling).
    pub fn add_alias(&mut self, key: &str, canonical: &ChunkId) {
        let hash = identity_hash(&ChunkId::new(key));
        let bucket = self.bucket_of(hash);
        self.id_buckets[bucket].insert(hash, canonical.clone());
    }

    /// Map a bare symbol name to the chunk that defines it.
    pub fn add_symbol(&mut self, name: &str, canonical: &ChunkId) {
        let hash = symbol_hash(name);
        let bucket = self.bucket_of(hash);
        self.symbol_buckets[bucket].insert(hash, canonical.clone());
    }

    /// Drop the identifier and every symbol name resolving to it.
    pub fn remove(&mut self, canonical: &ChunkId) {
        for bucket in &mut self.id_buckets {
            bucket.retain(|_, id| id != canonical);
        }
        for bucket in &mut self.symbol_buckets {
            bucket.retain(|_, id| id != canonical);
        }
    }

    /// Resolve any spelling of an identifier
    pub fn get(&self, key: &str) -> Option<ChunkId> {
        let hash = identity_hash(&ChunkId::new(key));
        self.id_buckets[self.bucket_of(hash)].get(&hash).cloned()
    }

    /// Resolve a bare symbol name
    pub fn get_by_symbol_name(&self, name: &str) -> Option<ChunkId> {
        let hash = symbol_hash(name);
        self.symbol_buckets[self.bucket_of(hash)].get(&hash).cloned()
    }

    pub fn clear(&mut self) {
        self.id_buckets.iter_mut().for_each(HashMap::clear);
        self.symbol_buckets.iter_mut().for_each(HashMap::clear);
    }

    /// Persist both bucket sets (truncate-then-write).
    pub fn save(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);

        // Write header
        writer.write_all(MAGIC_BYTES)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&(self.bucket_count as u32).to_le_bytes())?;
        writer.write_all(&(self.len() as u64).to_le_bytes())?;
        writer.write_all(&(self.symbol_count() as u64).to_le_bytes())?;
        writer.write_all(&[0u8; 4])?; // Reserved

        write_buckets(&mut writer, &self.id_buckets)?;
        write_buckets(&mut writer, &self.symbol_buckets)?;

        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }

    fn read_file(&mut self) -> io::Result<()> {
        let file = File::open(&self.path)?;
        if file.metadata()?.len() < HEADER_SIZE as u64 {
            return Err(invalid("cache file too small"));
        }
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        if &mmap[0..4] != MAGIC_BYTES {
            return Err(invalid("invalid cache file format"));
        }
        let version = read_u32(&mmap, 4)?;
        if version == 0 || version > VERSION {
            return Err(invalid(&format!("unsupported cache version: {version}")));
        }
        let stored_buckets = read_u32(&mmap, 8)? as usize;
        if stored_buckets != self.bucket_count {
            debug!(
                "Symbol cache bucket count changed ({stored_buckets} -> {}), rehashing",
                self.bucket_count
            );
        }

        let mut pos = HEADER_SIZE;
        let ids = read_buckets(&mmap, &mut pos, stored_buckets)?;
        for (hash, id) in ids {
            let bucket = self.bucket_of(hash);
            self.id_buckets[bucket].insert(hash, id);
        }

        if version >= 2 {
            // An unreadable symbol section keeps the identifier entries
            match read_buckets(&mmap, &mut pos, stored_buckets) {
                Ok(symbols) => {
                    for (hash, id) in symbols {
                        let bucket = self.bucket_of(hash);
                        self.symbol_buckets[bucket].insert(hash, id);
                    }
                }
                Err(e) => debug!("Symbol-name buckets unreadable, skipping: {e}"),
            }
        }

        Ok(())
    }
}

fn write_buckets<W: Write>(writer: &mut W, buckets: &[HashMap<u64, ChunkId>]) -> io::Result<()> {
    for bucket in buckets {
        writer.write_all(&(bucket.len() as u32).to_le_bytes())?;
        for (hash, id) in bucket {
            let bytes = id.as_str().as_bytes();
            writer.write_all(&hash.to_le_bytes())?;
            writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
            writer.write_all(bytes)?;
        }
    }
    Ok(())
}

fn read_buckets(
    data: &[u8],
    pos: &mut usize,
    bucket_count: usize,
) -> io::Result<Vec<(u64, ChunkId)>> {
    let mut entries = Vec::new();
    for _ in 0..bucket_count {
        let count = read_u32(data, *pos)? as usize;
        *pos += 4;
        for _ in 0..count {
            let hash = read_u64(data, *pos)?;
            let len = read_u32(data, *pos + 8)? as usize;
            *pos += 12;
            let raw = data
                .get(*pos..*pos + len)
                .ok_or_else(|| invalid("truncated identifier"))?;
            let id = std::str::from_utf8(raw).map_err(|_| invalid("identifier is not UTF-8"))?;
            entries.push((hash, ChunkId::new(id)));
            *pos += len;
        }
    }
    Ok(entries)
}

fn read_u32(data: &[u8], pos: usize) -> io::Result<u32> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| invalid("unexpected end of file"))
}

fn read_u64(data: &[u8], pos: usize) -> io::Result<u64> {
    data.get(pos..pos + 8)
        .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
        .ok_or_else(|| invalid("unexpected end of file"))
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

/// Thread-safe wrapper for concurrent access
#[derive(Debug, Clone)]
pub struct ConcurrentSymbolCache {
    inner: Arc<RwLock<SymbolHashCache>>,
}

impl ConcurrentSymbolCache {
    pub fn new(cache: SymbolHashCache) -> Self {
        Self {
            inner: Arc::new(RwLock::new(cache)),
        }
    }

    pub fn get(&self, key: &str) -> Option<ChunkId> {
        self.inner.read().get(key)
    }

    pub fn get_by_symbol_name(&self, name: &str) -> Option<ChunkId> {
        self.inner.read().get_by_symbol_name(name)
    }

    pub fn add(&self, canonical: &ChunkId) {
        self.inner.write().add(canonical);
    }

    pub fn add_alias(&self, key: &str, canonical: &ChunkId) {
        self.inner.write().add_alias(key, canonical);
    }

    pub fn add_symbol(&self, name: &str, canonical: &ChunkId) {
        self.inner.write().add_symbol(name, canonical);
    }

    pub fn remove(&self, canonical: &ChunkId) {
        self.inner.write().remove(canonical);
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn save(&self) -> io::Result<()> {
        self.inner.read().save()
    }
}

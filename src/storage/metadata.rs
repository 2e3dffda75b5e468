//! Authoritative per-chunk metadata: identifier to (position, attributes).
//!
//! Backed by SQLite in WAL mode. Writes open a transaction lazily and are
//! made durable by [`MetadataStore::commit`], which also persists the
//! symbol hash cache. Lookups never fail: an absent or unreadable record
//! is reported as `None`.

use crate::error::{StoreError, StoreResult};
use crate::storage::symbol_cache::{ConcurrentSymbolCache, SymbolHashCache};
use crate::types::{ATTR_NAME, ATTR_SYMBOLS, Attributes, ChunkId, Position};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// One row of the metadata store
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub chunk_id: ChunkId,
    pub position: Position,
    pub attributes: Attributes,
}

impl ChunkRecord {
    /// String attribute by key
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }
}

/// Symbol names a record should be reachable by.
pub fn symbol_names(attributes: &Attributes) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(name) = attributes.get(ATTR_NAME).and_then(|v| v.as_str()) {
        names.push(name.to_string());
    }
    if let Some(symbols) = attributes.get(ATTR_SYMBOLS).and_then(|v| v.as_array()) {
        for symbol in symbols.iter().filter_map(|v| v.as_str()) {
            if !names.iter().any(|n| n == symbol) {
                names.push(symbol.to_string());
            }
        }
    }
    names
}

pub struct MetadataStore {
    path: PathBuf,
    conn: Option<Connection>,
    symbol_cache: ConcurrentSymbolCache,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("path", &self.path)
            .field("open", &self.conn.is_some())
            .field("cached_ids", &self.symbol_cache.len())
            .finish()
    }
}

impl MetadataStore {
    /// Open (or create) the store at `path`, with its symbol cache at
    /// `symbol_cache_path`.
    pub fn open(
        path: impl AsRef<Path>,
        symbol_cache_path: impl AsRef<Path>,
        bucket_count: usize,
    ) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                attributes TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_position ON chunks(position);
            "#,
        )?;

        let symbol_cache = SymbolHashCache::load(symbol_cache_path, bucket_count);
        debug!(
            "Opened metadata store at {} (journal_mode={mode}, {} cached ids)",
            path.display(),
            symbol_cache.len()
        );

        Ok(Self {
            path,
            conn: Some(conn),
            symbol_cache: ConcurrentSymbolCache::new(symbol_cache),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    pub fn symbol_cache(&self) -> &ConcurrentSymbolCache {
        &self.symbol_cache
    }

    fn conn(&self) -> StoreResult<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| StoreError::InvalidInput("metadata store is closed".to_string()))
    }

    /// Connection with a write transaction open.
    fn writer(&self) -> StoreResult<&Connection> {
        let conn = self.conn()?;
        if conn.is_autocommit() {
            conn.execute_batch("BEGIN")?;
        }
        Ok(conn)
    }

    fn fetch(&self, key: &str) -> StoreResult<Option<ChunkRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT chunk_id, position, attributes FROM chunks WHERE chunk_id = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(decode_record).transpose()
    }

    /// Insert or replace the record for `chunk_id`.
    pub fn set(
        &self,
        chunk_id: &ChunkId,
        position: Position,
        attributes: &Attributes,
    ) -> StoreResult<()> {
        let json = serde_json::to_string(attributes).map_err(|e| {
            StoreError::Serialization(format!("Failed to serialize attributes: {e}"))
        })?;

        self.writer()?.execute(
            "INSERT OR REPLACE INTO chunks (chunk_id, position, attributes) VALUES (?1, ?2, ?3)",
            params![chunk_id.as_str(), position as i64, json],
        )?;

        self.symbol_cache.add(chunk_id);
        for name in symbol_names(attributes) {
            self.symbol_cache.add_symbol(&name, chunk_id);
        }
        Ok(())
    }

    /// Resolve any spelling of an identifier to its record.
    ///
    /// Tries the symbol cache first, then each lookup variant in order. The
    /// first variant hit is cached for the spelling that was asked for.
    pub fn get(&self, key: &str) -> Option<ChunkRecord> {
        if let Some(canonical) = self.symbol_cache.get(key) {
            match self.fetch(canonical.as_str()) {
                Ok(Some(record)) => return Some(record),
                Ok(None) => debug!("Stale symbol cache entry for {key}"),
                Err(e) => {
                    debug!("Metadata lookup for {key} failed: {e}");
                    return None;
                }
            }
        }

        for variant in ChunkId::new(key).lookup_variants() {
            match self.fetch(&variant) {
                Ok(Some(record)) => {
                    self.symbol_cache.add_alias(key, &record.chunk_id);
                    return Some(record);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("Metadata lookup for {variant} failed: {e}");
                    return None;
                }
            }
        }
        None
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Resolve a bare symbol name through the symbol buckets, falling back
    /// to a scan of the `name`/`symbols` attributes.
    pub fn find_by_symbol(&self, name: &str) -> Option<ChunkRecord> {
        if let Some(canonical) = self.symbol_cache.get_by_symbol_name(name) {
            if let Ok(Some(record)) = self.fetch(canonical.as_str()) {
                return Some(record);
            }
        }

        let conn = self.conn().ok()?;
        let row = conn
            .query_row(
                r#"SELECT chunk_id, position, attributes FROM chunks
                   WHERE json_extract(attributes, '$.name') = ?1
                      OR EXISTS (
                          SELECT 1 FROM json_each(chunks.attributes, '$.symbols')
                          WHERE json_each.value = ?1
                      )
                   ORDER BY position LIMIT 1"#,
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional();

        match row {
            Ok(Some(raw)) => match decode_record(raw) {
                Ok(record) => {
                    self.symbol_cache.add_symbol(name, &record.chunk_id);
                    Some(record)
                }
                Err(e) => {
                    debug!("Skipping undecodable record for symbol {name}: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                debug!("Symbol lookup for {name} failed: {e}");
                None
            }
        }
    }

    /// Delete one record. Returns whether a row was removed.
    pub fn delete(&self, chunk_id: &ChunkId) -> StoreResult<bool> {
        let removed = self.writer()?.execute(
            "DELETE FROM chunks WHERE chunk_id = ?1",
            params![chunk_id.as_str()],
        )?;
        self.symbol_cache.remove(chunk_id);
        Ok(removed > 0)
    }

    /// Rewrite the position of one record.
    pub fn update_index_id(&self, chunk_id: &ChunkId, position: Position) -> StoreResult<bool> {
        let updated = self.writer()?.execute(
            "UPDATE chunks SET position = ?2 WHERE chunk_id = ?1",
            params![chunk_id.as_str(), position as i64],
        )?;
        Ok(updated > 0)
    }

    /// Rewrite positions for many records with one prepared statement.
    /// Returns the identifiers that have no record to update.
    pub fn update_index_ids<'a>(
        &self,
        updates: impl IntoIterator<Item = (&'a ChunkId, Position)>,
    ) -> StoreResult<Vec<ChunkId>> {
        let conn = self.writer()?;
        let mut stmt = conn.prepare_cached("UPDATE chunks SET position = ?2 WHERE chunk_id = ?1")?;
        let mut missing = Vec::new();
        for (chunk_id, position) in updates {
            if stmt.execute(params![chunk_id.as_str(), position as i64])? == 0 {
                missing.push(chunk_id.clone());
            }
        }
        Ok(missing)
    }

    pub fn count(&self) -> StoreResult<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Every record, ordered by position.
    pub fn records(&self) -> StoreResult<Vec<ChunkRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT chunk_id, position, attributes FROM chunks ORDER BY position, chunk_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(decode_record(row?)?);
        }
        Ok(records)
    }

    /// Remove every record and cached identifier.
    pub fn clear(&self) -> StoreResult<()> {
        self.writer()?.execute("DELETE FROM chunks", [])?;
        self.symbol_cache.clear();
        Ok(())
    }

    /// Flush pending writes and persist the symbol cache.
    ///
    /// Failures are logged and reported as `false`; metadata can always be
    /// re-derived by reindexing.
    pub fn commit(&self) -> bool {
        let Some(conn) = self.conn.as_ref() else {
            debug!("Commit skipped: metadata store is closed");
            return false;
        };

        let mut ok = true;
        if !conn.is_autocommit() {
            if let Err(e) = conn.execute_batch("COMMIT") {
                warn!("Metadata commit failed: {e}");
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    debug!("Rollback after failed commit also failed: {e}");
                }
                ok = false;
            }
        }

        if let Err(e) = self.symbol_cache.save() {
            warn!("Failed to persist symbol cache: {e}");
            ok = false;
        }
        ok
    }

    /// Commit, checkpoint the WAL and release the database handle.
    /// Safe to call more than once.
    pub fn close(&mut self) {
        if self.conn.is_none() {
            return;
        }
        self.commit();

        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
                debug!("WAL checkpoint failed: {e}");
            }
            if let Err((_, e)) = conn.close() {
                warn!("Failed to close metadata store {}: {e}", self.path.display());
            }
        }
    }
}

impl Drop for MetadataStore {
    fn drop(&mut self) {
        self.close();
    }
}

fn decode_record((chunk_id, position, json): (String, i64, String)) -> StoreResult<ChunkRecord> {
    let attributes: Attributes = serde_json::from_str(&json).map_err(|e| {
        StoreError::Serialization(format!("Invalid attributes for {chunk_id}: {e}"))
    })?;
    let position = usize::try_from(position).map_err(|_| {
        StoreError::InvalidInput(format!("Negative position {position} for {chunk_id}"))
    })?;
    Ok(ChunkRecord {
        chunk_id: ChunkId::new(chunk_id),
        position,
        attributes,
    })
}

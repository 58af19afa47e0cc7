//! Content-addressed object store: SHA-256 keyed, 256-way sharded directory
//! layout, zstd compression (kept only when it actually shrinks the data),
//! dedup via metadata merge on a repeat `store`, and named refs pointing at a
//! hash.
//!
//! Grounded on `storage/cas.py`'s `CASStorage`, translated from its async
//! `aiosqlite`/`aiofiles` calls to the teacher's synchronous `rusqlite`
//! convention (`storage/mod.rs`'s `SqliteStorage`, which opens a fresh
//! `Connection` per call rather than holding one open across awaits).

use crate::error::CoreError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const SHARD_COUNT: usize = 256;

#[derive(Debug, Clone)]
pub struct ObjectMetadata {
    pub hash: String,
    pub original_size: u64,
    pub stored_size: u64,
    pub compression_ratio: f64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub user_metadata: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct CasStats {
    pub object_count: u64,
    pub total_original_bytes: u64,
    pub total_stored_bytes: u64,
    pub storage_efficiency_percent: f64,
    pub average_compression_ratio: f64,
    pub deduplication_enabled: bool,
    pub compression_enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct VacuumReport {
    pub orphaned_objects_removed: u64,
    pub missing_objects_cleaned: u64,
    pub temp_files_cleaned: u64,
}

pub struct CasStorage {
    storage_path: PathBuf,
    objects_dir: PathBuf,
    refs_dir: PathBuf,
    temp_dir: PathBuf,
    db_path: PathBuf,
    compression_enabled: bool,
    compression_level: i32,
    deduplication: bool,
}

impl CasStorage {
    /// Create (or reopen) a store rooted at `storage_path`: lays out the
    /// `objects/`, `refs/`, `temp/` directories, the 256 shard
    /// subdirectories, and the metadata database.
    pub fn new(
        storage_path: impl Into<PathBuf>,
        compression_enabled: bool,
        compression_level: i32,
        deduplication: bool,
    ) -> Result<Self, CoreError> {
        let storage_path = storage_path.into();
        let objects_dir = storage_path.join("objects");
        let refs_dir = storage_path.join("refs");
        let temp_dir = storage_path.join("temp");
        let db_path = storage_path.join("cas.db");

        for dir in [&objects_dir, &refs_dir, &temp_dir] {
            std::fs::create_dir_all(dir).map_err(CoreError::Io)?;
        }
        for i in 0..SHARD_COUNT {
            std::fs::create_dir_all(objects_dir.join(format!("{i:02x}"))).map_err(CoreError::Io)?;
        }

        let this = Self {
            storage_path,
            objects_dir,
            refs_dir,
            temp_dir,
            db_path,
            compression_enabled,
            compression_level,
            deduplication,
        };
        this.create_schema()?;
        Ok(this)
    }

    fn conn(&self) -> Result<Connection, CoreError> {
        Connection::open(&self.db_path).map_err(CoreError::Storage)
    }

    fn create_schema(&self) -> Result<(), CoreError> {
        let conn = self.conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS objects (
                hash TEXT PRIMARY KEY,
                original_size INTEGER NOT NULL,
                stored_size INTEGER NOT NULL,
                compression_ratio REAL NOT NULL,
                created_at TEXT NOT NULL,
                last_accessed TEXT NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 1,
                metadata TEXT
            )",
            [],
        )
        .map_err(CoreError::Storage)?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_objects_created ON objects(created_at)",
            [],
        )
        .map_err(CoreError::Storage)?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_objects_accessed ON objects(last_accessed)",
            [],
        )
        .map_err(CoreError::Storage)?;
        Ok(())
    }

    fn object_path(&self, hash: &str) -> PathBuf {
        self.objects_dir.join(&hash[..2]).join(hash)
    }

    fn exists_in_db(&self, hash: &str) -> Result<bool, CoreError> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM objects WHERE hash = ?", params![hash], |r| r.get(0))
            .optional()
            .map_err(CoreError::Storage)?;
        Ok(found.is_some())
    }

    /// Store `data`, returning its content hash. If dedup is enabled and the
    /// hash already exists, `metadata` is merged into the existing record's
    /// user metadata instead of rewriting the object.
    pub fn store(&self, data: &[u8], metadata: Option<Value>) -> Result<String, CoreError> {
        let hash = hex_sha256(data);

        if self.deduplication && self.exists_in_db(&hash)? {
            if let Some(metadata) = metadata {
                self.merge_metadata(&hash, metadata)?;
            } else {
                self.bump_access(&hash)?;
            }
            return Ok(hash);
        }

        let mut stored = data.to_vec();
        let mut ratio = 1.0;
        if self.compression_enabled {
            let compressed =
                zstd::stream::encode_all(data, self.compression_level).map_err(CoreError::Io)?;
            if compressed.len() < data.len() {
                ratio = data.len() as f64 / compressed.len() as f64;
                stored = compressed;
            }
        }

        self.write_object_atomically(&hash, &stored)?;

        let now = Utc::now();
        let metadata_json = metadata.as_ref().map(|m| m.to_string());
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO objects
                (hash, original_size, stored_size, compression_ratio, created_at, last_accessed, access_count, metadata)
             VALUES (?, ?, ?, ?, ?, ?, 1, ?)",
            params![
                hash,
                data.len() as i64,
                stored.len() as i64,
                ratio,
                now.to_rfc3339(),
                now.to_rfc3339(),
                metadata_json,
            ],
        )
        .map_err(CoreError::Storage)?;

        Ok(hash)
    }

    fn write_object_atomically(&self, hash: &str, data: &[u8]) -> Result<(), CoreError> {
        let final_path = self.object_path(hash);
        let temp_path = self.temp_dir.join(format!("{hash}.tmp"));
        std::fs::write(&temp_path, data).map_err(CoreError::Io)?;
        std::fs::rename(&temp_path, &final_path).map_err(CoreError::Io)?;
        Ok(())
    }

    /// Retrieve an object by hash, decompressing if it was stored
    /// compressed. Bumps `last_accessed`/`access_count` as a side effect.
    pub fn retrieve(&self, hash: &str) -> Result<Option<Vec<u8>>, CoreError> {
        let object_path = self.object_path(hash);
        if !object_path.exists() {
            return Ok(None);
        }
        let stored = std::fs::read(&object_path).map_err(CoreError::Io)?;

        let Some(meta) = self.get_metadata(hash)? else {
            return Ok(Some(stored));
        };

        if meta.compression_ratio > 1.0 {
            match zstd::stream::decode_all(stored.as_slice()) {
                Ok(original) => Ok(Some(original)),
                Err(e) => {
                    tracing::error!(hash, error = %e, "decompression failed, returning stored bytes as-is");
                    Ok(Some(stored))
                }
            }
        } else {
            Ok(Some(stored))
        }
    }

    pub fn delete(&self, hash: &str) -> Result<bool, CoreError> {
        let object_path = self.object_path(hash);
        let deleted = object_path.exists();
        if deleted {
            std::fs::remove_file(&object_path).map_err(CoreError::Io)?;
        }
        self.conn()?
            .execute("DELETE FROM objects WHERE hash = ?", params![hash])
            .map_err(CoreError::Storage)?;
        Ok(deleted)
    }

    pub fn exists(&self, hash: &str) -> Result<bool, CoreError> {
        self.exists_in_db(hash)
    }

    /// Fetch metadata for `hash`, bumping `last_accessed`/`access_count` as a
    /// side effect of the lookup (mirrors the upstream source's `_get_metadata`).
    pub fn get_metadata(&self, hash: &str) -> Result<Option<ObjectMetadata>, CoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT hash, original_size, stored_size, compression_ratio, created_at, last_accessed, access_count, metadata
                 FROM objects WHERE hash = ?",
                params![hash],
                row_to_metadata,
            )
            .optional()
            .map_err(CoreError::Storage)?;

        let Some(meta) = row else { return Ok(None) };

        conn.execute(
            "UPDATE objects SET last_accessed = ?, access_count = access_count + 1 WHERE hash = ?",
            params![Utc::now().to_rfc3339(), hash],
        )
        .map_err(CoreError::Storage)?;

        Ok(Some(meta))
    }

    fn bump_access(&self, hash: &str) -> Result<(), CoreError> {
        self.conn()?
            .execute(
                "UPDATE objects SET last_accessed = ?, access_count = access_count + 1 WHERE hash = ?",
                params![Utc::now().to_rfc3339(), hash],
            )
            .map_err(CoreError::Storage)?;
        Ok(())
    }

    fn merge_metadata(&self, hash: &str, new_metadata: Value) -> Result<(), CoreError> {
        let Some(existing) = self.get_metadata(hash)? else { return Ok(()) };
        let mut merged = existing.user_metadata.unwrap_or_else(|| Value::Object(Default::default()));
        if let (Value::Object(merged_map), Value::Object(new_map)) = (&mut merged, &new_metadata) {
            for (k, v) in new_map {
                merged_map.insert(k.clone(), v.clone());
            }
        } else {
            merged = new_metadata;
        }
        self.conn()?
            .execute(
                "UPDATE objects SET metadata = ? WHERE hash = ?",
                params![merged.to_string(), hash],
            )
            .map_err(CoreError::Storage)?;
        Ok(())
    }

    pub fn list_objects(&self, prefix: Option<&str>, limit: Option<u32>) -> Result<Vec<ObjectMetadata>, CoreError> {
        let conn = self.conn()?;
        let mut sql = String::from(
            "SELECT hash, original_size, stored_size, compression_ratio, created_at, last_accessed, access_count, metadata FROM objects",
        );
        if prefix.is_some() {
            sql.push_str(" WHERE hash LIKE ?1");
        }
        sql.push_str(" ORDER BY created_at DESC");
        if limit.is_some() {
            sql.push_str(if prefix.is_some() { " LIMIT ?2" } else { " LIMIT ?1" });
        }

        let mut stmt = conn.prepare(&sql).map_err(CoreError::Storage)?;
        let like = prefix.map(|p| format!("{p}%"));

        let rows = match (&like, limit) {
            (Some(p), Some(l)) => stmt.query_map(params![p, l], row_to_metadata),
            (Some(p), None) => stmt.query_map(params![p], row_to_metadata),
            (None, Some(l)) => stmt.query_map(params![l], row_to_metadata),
            (None, None) => stmt.query_map([], row_to_metadata),
        }
        .map_err(CoreError::Storage)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(CoreError::Storage)?);
        }
        Ok(out)
    }

    pub fn stats(&self) -> Result<CasStats, CoreError> {
        let conn = self.conn()?;
        let object_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM objects", [], |r| r.get(0))
            .map_err(CoreError::Storage)?;
        let (total_original, total_stored, avg_ratio): (Option<i64>, Option<i64>, Option<f64>) = conn
            .query_row(
                "SELECT SUM(original_size), SUM(stored_size), AVG(compression_ratio) FROM objects",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .map_err(CoreError::Storage)?;

        let total_original = total_original.unwrap_or(0) as f64;
        let total_stored = total_stored.unwrap_or(0) as f64;
        let efficiency = if total_original > 0.0 {
            (total_original - total_stored) / total_original * 100.0
        } else {
            0.0
        };

        Ok(CasStats {
            object_count: object_count as u64,
            total_original_bytes: total_original as u64,
            total_stored_bytes: total_stored as u64,
            storage_efficiency_percent: efficiency,
            average_compression_ratio: avg_ratio.unwrap_or(1.0),
            deduplication_enabled: self.deduplication,
            compression_enabled: self.compression_enabled,
        })
    }

    /// Remove object files with no metadata row, metadata rows with no
    /// object file, and stray temp files; then compact the database.
    pub fn vacuum(&self) -> Result<VacuumReport, CoreError> {
        let mut report = VacuumReport::default();

        for shard in std::fs::read_dir(&self.objects_dir).map_err(CoreError::Io)? {
            let shard = shard.map_err(CoreError::Io)?.path();
            if !shard.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&shard).map_err(CoreError::Io)? {
                let entry = entry.map_err(CoreError::Io)?.path();
                if !entry.is_file() {
                    continue;
                }
                let hash = entry.file_name().unwrap().to_string_lossy().to_string();
                if !self.exists_in_db(&hash)? {
                    std::fs::remove_file(&entry).map_err(CoreError::Io)?;
                    report.orphaned_objects_removed += 1;
                }
            }
        }

        let conn = self.conn()?;
        let hashes: Vec<String> = {
            let mut stmt = conn.prepare("SELECT hash FROM objects").map_err(CoreError::Storage)?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0)).map_err(CoreError::Storage)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r.map_err(CoreError::Storage)?);
            }
            out
        };
        for hash in hashes {
            if !self.object_path(&hash).exists() {
                conn.execute("DELETE FROM objects WHERE hash = ?", params![hash])
                    .map_err(CoreError::Storage)?;
                report.missing_objects_cleaned += 1;
            }
        }
        conn.execute("VACUUM", []).map_err(CoreError::Storage)?;

        for entry in std::fs::read_dir(&self.temp_dir).map_err(CoreError::Io)? {
            let entry = entry.map_err(CoreError::Io)?.path();
            if std::fs::remove_file(&entry).is_ok() {
                report.temp_files_cleaned += 1;
            }
        }

        Ok(report)
    }

    pub fn create_ref(&self, name: &str, hash: &str) -> Result<(), CoreError> {
        if !self.exists_in_db(hash)? {
            return Err(CoreError::digest_not_found(hash));
        }
        let ref_path = self.refs_dir.join(name);
        if let Some(parent) = ref_path.parent() {
            std::fs::create_dir_all(parent).map_err(CoreError::Io)?;
        }
        std::fs::write(&ref_path, hash).map_err(CoreError::Io)?;
        Ok(())
    }

    pub fn get_ref(&self, name: &str) -> Result<Option<String>, CoreError> {
        let ref_path = self.refs_dir.join(name);
        if !ref_path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(&ref_path).map_err(CoreError::Io)?.trim().to_string()))
    }

    pub fn delete_ref(&self, name: &str) -> Result<bool, CoreError> {
        let ref_path = self.refs_dir.join(name);
        if ref_path.exists() {
            std::fs::remove_file(&ref_path).map_err(CoreError::Io)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn list_refs(&self) -> Result<Vec<(String, String)>, CoreError> {
        let mut out = Vec::new();
        walk_refs(&self.refs_dir, &self.refs_dir, &mut out)?;
        Ok(out)
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }
}

fn walk_refs(root: &Path, dir: &Path, out: &mut Vec<(String, String)>) -> Result<(), CoreError> {
    for entry in std::fs::read_dir(dir).map_err(CoreError::Io)? {
        let path = entry.map_err(CoreError::Io)?.path();
        if path.is_dir() {
            walk_refs(root, &path, out)?;
        } else if let Ok(hash) = std::fs::read_to_string(&path) {
            let name = path.strip_prefix(root).unwrap_or(&path).to_string_lossy().to_string();
            out.push((name, hash.trim().to_string()));
        }
    }
    Ok(())
}

fn row_to_metadata(row: &rusqlite::Row) -> rusqlite::Result<ObjectMetadata> {
    let created_at: String = row.get(4)?;
    let last_accessed: String = row.get(5)?;
    let metadata: Option<String> = row.get(7)?;
    Ok(ObjectMetadata {
        hash: row.get(0)?,
        original_size: row.get::<_, i64>(1)? as u64,
        stored_size: row.get::<_, i64>(2)? as u64,
        compression_ratio: row.get(3)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        last_accessed: DateTime::parse_from_rfc3339(&last_accessed)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        access_count: row.get::<_, i64>(6)? as u64,
        user_metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
    })
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_dir;

    fn store() -> (CasStorage, tempfile::TempDir) {
        let dir = temp_dir();
        let store = CasStorage::new(dir.path(), true, 6, true).unwrap();
        (store, dir)
    }

    #[test]
    fn store_and_retrieve_round_trips() {
        let (cas, _dir) = store();
        let hash = cas.store(b"hello world", None).unwrap();
        let back = cas.retrieve(&hash).unwrap().unwrap();
        assert_eq!(back, b"hello world");
    }

    #[test]
    fn dedup_hit_without_metadata_still_bumps_access_count() {
        let (cas, _dir) = store();
        cas.store(b"abc", None).unwrap();
        cas.store(b"abc", None).unwrap();

        let objects = cas.list_objects(None, None).unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].access_count, 2);
    }

    #[test]
    fn hash_is_stable_sha256() {
        let (cas, _dir) = store();
        let hash = cas.store(b"hello world", None).unwrap();
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn dedup_merges_metadata_instead_of_rewriting() {
        let (cas, _dir) = store();
        let h1 = cas.store(b"same bytes", Some(serde_json::json!({"a": 1}))).unwrap();
        let h2 = cas.store(b"same bytes", Some(serde_json::json!({"b": 2}))).unwrap();
        assert_eq!(h1, h2);
        let meta = cas.get_metadata(&h1).unwrap().unwrap();
        let user = meta.user_metadata.unwrap();
        assert_eq!(user["a"], 1);
        assert_eq!(user["b"], 2);
    }

    #[test]
    fn incompressible_data_is_stored_uncompressed() {
        let (cas, _dir) = store();
        // Random-looking small input; zstd may not shrink it.
        let data: Vec<u8> = (0u8..=255).collect();
        let hash = cas.store(&data, None).unwrap();
        let back = cas.retrieve(&hash).unwrap().unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn missing_hash_returns_none() {
        let (cas, _dir) = store();
        assert!(cas.retrieve(&"0".repeat(64)).unwrap().is_none());
    }

    #[test]
    fn delete_removes_object_and_metadata() {
        let (cas, _dir) = store();
        let hash = cas.store(b"to delete", None).unwrap();
        assert!(cas.delete(&hash).unwrap());
        assert!(cas.retrieve(&hash).unwrap().is_none());
        assert!(!cas.delete(&hash).unwrap());
    }

    #[test]
    fn refs_round_trip() {
        let (cas, _dir) = store();
        let hash = cas.store(b"referenced", None).unwrap();
        cas.create_ref("latest", &hash).unwrap();
        assert_eq!(cas.get_ref("latest").unwrap(), Some(hash.clone()));
        assert!(cas.delete_ref("latest").unwrap());
        assert_eq!(cas.get_ref("latest").unwrap(), None);
    }

    #[test]
    fn create_ref_rejects_unknown_hash() {
        let (cas, _dir) = store();
        let err = cas.create_ref("bad", &"f".repeat(64)).unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[test]
    fn vacuum_removes_orphaned_object_file() {
        let (cas, _dir) = store();
        let hash = "a".repeat(64);
        let orphan_path = cas.object_path(&hash);
        std::fs::write(&orphan_path, b"orphan").unwrap();

        let report = cas.vacuum().unwrap();
        assert_eq!(report.orphaned_objects_removed, 1);
        assert!(!orphan_path.exists());
    }

    #[test]
    fn stats_reflect_stored_objects() {
        let (cas, _dir) = store();
        cas.store(b"one", None).unwrap();
        cas.store(b"two", None).unwrap();
        let stats = cas.stats().unwrap();
        assert_eq!(stats.object_count, 2);
    }
}

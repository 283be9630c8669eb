//! SQLite implementation of [`super::Store`].
//!
//! One DB file per indexed root. WAL mode for concurrent readers while a
//! single writer holds the active transaction, mirroring
//! `cmdr::indexing::store::IndexStore::open`'s pragma/schema-version
//! dance, including its delete-and-recreate recovery on corruption or a
//! schema-version mismatch.
//!
//! Unlike `cmdr` (one long-lived read connection plus a dedicated writer
//! thread owning a second connection), this store is a single connection
//! used for both: the crawler contract in this crate already serializes
//! all writes behind one `Store` handle per run, so a second connection
//! would add nothing but complexity.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};

use crate::entry::{Entry, EntryKind, IndexJob, JobMetadata, JobStatus, PathScanInfo, RunId};
use crate::error::StoreError;

use super::Store;

const SCHEMA_VERSION: &str = "1";

const CREATE_TABLES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS entries (
        path         TEXT PRIMARY KEY,
        parent       TEXT,
        size         INTEGER NOT NULL,
        kind         TEXT    NOT NULL,
        ctime        INTEGER NOT NULL,
        mtime        INTEGER NOT NULL,
        last_scanned INTEGER NOT NULL
    ) WITHOUT ROWID;

    CREATE INDEX IF NOT EXISTS idx_entries_parent ON entries (parent);
    CREATE INDEX IF NOT EXISTS idx_entries_last_scanned ON entries (last_scanned);

    CREATE TABLE IF NOT EXISTS index_jobs (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        root_path    TEXT    NOT NULL,
        status       TEXT    NOT NULL,
        progress     INTEGER NOT NULL DEFAULT 0,
        created_at   INTEGER NOT NULL,
        started_at   INTEGER,
        completed_at INTEGER,
        error        TEXT,
        metadata     TEXT    NOT NULL DEFAULT '{}'
    );

    CREATE TABLE IF NOT EXISTS indexing_lock (
        id        INTEGER PRIMARY KEY CHECK (id = 1),
        locked_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    ) WITHOUT ROWID;
";

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA foreign_keys = OFF;",
    )?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(CREATE_TABLES_SQL)?;
    Ok(())
}

fn reset_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "DROP TABLE IF EXISTS entries;
         DROP TABLE IF EXISTS index_jobs;
         DROP TABLE IF EXISTS indexing_lock;
         DROP TABLE IF EXISTS meta;",
    )?;
    create_tables(conn)?;
    stamp_schema_version(conn)
}

fn stamp_schema_version(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION],
    )?;
    Ok(())
}

fn read_schema_version(conn: &Connection) -> Result<Option<String>, StoreError> {
    conn.query_row(
        "SELECT value FROM meta WHERE key = 'schema_version'",
        [],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

/// A path-under-root LIKE pattern, with `%`/`_`/`\` escaped so only the
/// trailing wildcard this function appends is significant.
fn under_root_pattern(root: &str) -> String {
    let mut escaped = String::with_capacity(root.len());
    for c in root.chars() {
        if c == '\\' || c == '%' || c == '_' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    if escaped.ends_with('/') {
        format!("{escaped}%")
    } else {
        format!("{escaped}/%")
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entry> {
    Ok(Entry {
        path: row.get(0)?,
        parent: row.get(1)?,
        size: row.get(2)?,
        kind: EntryKind::from_str(&row.get::<_, String>(3)?),
        ctime: row.get(4)?,
        mtime: row.get(5)?,
        last_scanned: row.get(6)?,
    })
}

/// Sqlite-backed [`Store`]. Not `Sync`; callers use one per crawl run,
/// consistent with the single-writer discipline the crawler enforces.
pub struct SqliteStore {
    conn: Connection,
    db_path: PathBuf,
    in_transaction: bool,
}

impl SqliteStore {
    /// Open (or create) the index database at `db_path`. On schema
    /// corruption or version mismatch the file (and WAL/SHM sidecars)
    /// is deleted and recreated.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        match Self::try_open(db_path) {
            Ok(store) => Ok(store),
            Err(e) => {
                log::warn!("index db open failed ({e}), deleting and recreating");
                Self::delete_and_recreate(db_path)
            }
        }
    }

    fn try_open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        apply_pragmas(&conn)?;
        create_tables(&conn)?;

        match read_schema_version(&conn)? {
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                log::warn!("schema version mismatch (expected {SCHEMA_VERSION}, found {v}), resetting");
                reset_schema(&conn)?;
            }
            None => stamp_schema_version(&conn)?,
        }

        Ok(Self {
            conn,
            db_path: db_path.to_path_buf(),
            in_transaction: false,
        })
    }

    fn delete_and_recreate(db_path: &Path) -> Result<Self, StoreError> {
        if db_path.exists() {
            std::fs::remove_file(db_path)?;
        }
        for ext in ["db-wal", "db-shm"] {
            let sidecar = db_path.with_extension(ext);
            if sidecar.exists() {
                let _ = std::fs::remove_file(&sidecar);
            }
        }

        let conn = Connection::open(db_path)?;
        apply_pragmas(&conn)?;
        create_tables(&conn)?;
        stamp_schema_version(&conn)?;

        Ok(Self {
            conn,
            db_path: db_path.to_path_buf(),
            in_transaction: false,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

impl Store for SqliteStore {
    fn begin(&mut self) -> Result<(), StoreError> {
        if self.in_transaction {
            return Ok(());
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.conn.execute_batch("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK")?;
        self.in_transaction = false;
        Ok(())
    }

    fn lock_indexing(&mut self) -> Result<(), StoreError> {
        let now = now_secs();
        let result = self.conn.execute(
            "INSERT INTO indexing_lock (id, locked_at) VALUES (1, ?1)",
            params![now],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::AlreadyLocked)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn unlock_indexing(&mut self) -> Result<(), StoreError> {
        self.conn.execute("DELETE FROM indexing_lock WHERE id = 1", [])?;
        Ok(())
    }

    fn insert_or_update(&mut self, entry: &Entry) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO entries (path, parent, size, kind, ctime, mtime, last_scanned)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(path) DO UPDATE SET
                parent = excluded.parent,
                size = excluded.size,
                kind = excluded.kind,
                ctime = excluded.ctime,
                mtime = excluded.mtime,
                last_scanned = excluded.last_scanned",
            params![
                entry.path,
                entry.parent,
                entry.size,
                entry.kind.as_str(),
                entry.ctime,
                entry.mtime,
                entry.last_scanned
            ],
        )?;
        Ok(())
    }

    fn insert_or_update_with_change(&mut self, entry: &Entry) -> Result<bool, StoreError> {
        let existed: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM entries WHERE path = ?1", params![entry.path], |r| r.get(0))
            .optional()?;
        self.insert_or_update(entry)?;
        Ok(existed.is_none())
    }

    fn get_stale_entries(&self, root: &str, run_id: RunId) -> Result<Vec<Entry>, StoreError> {
        let pattern = under_root_pattern(root);
        let mut stmt = self.conn.prepare_cached(
            "SELECT path, parent, size, kind, ctime, mtime, last_scanned
             FROM entries
             WHERE (path = ?1 OR path LIKE ?2 ESCAPE '\\') AND last_scanned < ?3",
        )?;
        let rows = stmt.query_map(params![root, pattern, run_id], row_to_entry)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn delete_stale(&mut self, root: &str, run_id: RunId) -> Result<u64, StoreError> {
        let pattern = under_root_pattern(root);
        let changed = self.conn.execute(
            "DELETE FROM entries
             WHERE (path = ?1 OR path LIKE ?2 ESCAPE '\\') AND last_scanned < ?3",
            params![root, pattern, run_id],
        )?;
        Ok(changed as u64)
    }

    fn compute_aggregates(&mut self, root: &str) -> Result<(), StoreError> {
        let pattern = under_root_pattern(root);
        let mut stmt = self.conn.prepare_cached(
            "SELECT path, parent, size, kind FROM entries WHERE path = ?1 OR path LIKE ?2 ESCAPE '\\'",
        )?;
        let rows = stmt.query_map(params![root, pattern], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, i64>(2)?,
                EntryKind::from_str(&row.get::<_, String>(3)?),
            ))
        })?;
        let all: Vec<(String, Option<String>, i64, EntryKind)> = rows.collect::<Result<_, _>>()?;
        drop(stmt);

        let mut size_of: HashMap<String, i64> = HashMap::with_capacity(all.len());
        let mut children_of: HashMap<String, Vec<String>> = HashMap::new();
        let mut dirs: Vec<String> = Vec::new();

        for (path, parent, size, kind) in &all {
            size_of.insert(path.clone(), *size);
            if let Some(parent) = parent {
                children_of.entry(parent.clone()).or_default().push(path.clone());
            }
            if kind.is_directory() {
                dirs.push(path.clone());
            }
        }

        dirs.sort_by_key(|p| std::cmp::Reverse(depth(p)));

        let mut updates: Vec<(String, i64)> = Vec::with_capacity(dirs.len());
        for dir in &dirs {
            let total: i64 = children_of
                .get(dir)
                .map(|children| children.iter().filter_map(|c| size_of.get(c)).sum())
                .unwrap_or(0);
            size_of.insert(dir.clone(), total);
            updates.push((dir.clone(), total));
        }

        for chunk in updates.chunks(1000) {
            for (path, size) in chunk {
                self.conn
                    .execute("UPDATE entries SET size = ?1 WHERE path = ?2", params![size, path])?;
            }
        }

        Ok(())
    }

    fn get_path_scan_info(&self, root: &str) -> Result<PathScanInfo, StoreError> {
        let last_scanned: Option<i64> = self
            .conn
            .query_row("SELECT last_scanned FROM entries WHERE path = ?1", params![root], |r| r.get(0))
            .optional()?;
        let entry_count = self.get_entry_count(root)?;
        Ok(PathScanInfo {
            exists: last_scanned.is_some(),
            last_scanned,
            entry_count,
        })
    }

    fn create_index_job(&mut self, root_path: &str, created_at: i64) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO index_jobs (root_path, status, progress, created_at, metadata)
             VALUES (?1, ?2, 0, ?3, '{}')",
            params![root_path, JobStatus::Pending.as_str(), created_at],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn start_index_job(&mut self, job_id: i64, started_at: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE index_jobs SET status = ?1, started_at = ?2 WHERE id = ?3",
            params![JobStatus::Running.as_str(), started_at, job_id],
        )?;
        Ok(())
    }

    fn update_index_job_progress(
        &mut self,
        job_id: i64,
        progress: u8,
        metadata: &JobMetadata,
    ) -> Result<(), StoreError> {
        let metadata_json = serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_string());
        self.conn.execute(
            "UPDATE index_jobs SET progress = ?1, metadata = ?2 WHERE id = ?3",
            params![progress, metadata_json, job_id],
        )?;
        Ok(())
    }

    fn update_index_job_status(
        &mut self,
        job_id: i64,
        status: JobStatus,
        completed_at: Option<i64>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE index_jobs SET status = ?1, completed_at = ?2, error = ?3 WHERE id = ?4",
            params![status.as_str(), completed_at, error, job_id],
        )?;
        Ok(())
    }

    fn get_index_job(&self, job_id: i64) -> Result<Option<IndexJob>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, root_path, status, progress, created_at, started_at, completed_at, error, metadata
                 FROM index_jobs WHERE id = ?1",
                params![job_id],
                |row| {
                    let metadata_json: String = row.get(8)?;
                    let metadata = serde_json::from_str(&metadata_json).unwrap_or_default();
                    Ok(IndexJob {
                        id: row.get(0)?,
                        root_path: row.get(1)?,
                        status: JobStatus::from_str(&row.get::<_, String>(2)?),
                        progress: row.get(3)?,
                        created_at: row.get(4)?,
                        started_at: row.get(5)?,
                        completed_at: row.get(6)?,
                        error: row.get(7)?,
                        metadata,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    fn get_entry_count(&self, root: &str) -> Result<u64, StoreError> {
        let pattern = under_root_pattern(root);
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE path = ?1 OR path LIKE ?2 ESCAPE '\\'",
            params![root, pattern],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }
}

fn depth(path: &str) -> usize {
    path.chars().filter(|&c| c == '/').count()
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryKind;

    fn temp_store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("index.db");
        let store = SqliteStore::open(&db_path).unwrap();
        (store, dir)
    }

    fn entry(path: &str, parent: Option<&str>, size: i64, kind: EntryKind, run_id: RunId) -> Entry {
        Entry {
            path: path.to_string(),
            parent: parent.map(str::to_string),
            size,
            kind,
            ctime: 1000,
            mtime: 1000,
            last_scanned: run_id,
        }
    }

    #[test]
    fn insert_or_update_is_idempotent() {
        let (mut store, _dir) = temp_store();
        let e = entry("/tmp/t", None, 0, EntryKind::Directory, 1);
        store.insert_or_update(&e).unwrap();
        store.insert_or_update(&e).unwrap();
        assert_eq!(store.get_entry_count("/tmp/t").unwrap(), 1);
    }

    #[test]
    fn insert_or_update_with_change_reports_new_vs_refreshed() {
        let (mut store, _dir) = temp_store();
        let e = entry("/tmp/t/f.txt", Some("/tmp/t"), 12, EntryKind::File, 1);
        assert!(store.insert_or_update_with_change(&e).unwrap());
        assert!(!store.insert_or_update_with_change(&e).unwrap());
    }

    #[test]
    fn lock_indexing_is_exclusive() {
        let (mut store, _dir) = temp_store();
        store.lock_indexing().unwrap();
        assert!(matches!(store.lock_indexing(), Err(StoreError::AlreadyLocked)));
        store.unlock_indexing().unwrap();
        store.lock_indexing().unwrap();
    }

    #[test]
    fn lock_indexing_is_exclusive_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("index.db");
        let mut a = SqliteStore::open(&db_path).unwrap();
        let mut b = SqliteStore::open(&db_path).unwrap();
        a.lock_indexing().unwrap();
        assert!(matches!(b.lock_indexing(), Err(StoreError::AlreadyLocked)));
    }

    #[test]
    fn compute_aggregates_sums_direct_children() {
        let (mut store, _dir) = temp_store();
        store.insert_or_update(&entry("/tmp/t", None, 0, EntryKind::Directory, 1)).unwrap();
        store
            .insert_or_update(&entry("/tmp/t/file.txt", Some("/tmp/t"), 12, EntryKind::File, 1))
            .unwrap();
        store.insert_or_update(&entry("/tmp/t/sub", Some("/tmp/t"), 0, EntryKind::Directory, 1)).unwrap();
        store
            .insert_or_update(&entry("/tmp/t/sub/file2.txt", Some("/tmp/t/sub"), 14, EntryKind::File, 1))
            .unwrap();

        store.compute_aggregates("/tmp/t").unwrap();

        let stale = store.get_stale_entries("/tmp/t", 2).unwrap();
        let sizes: HashMap<_, _> = stale.iter().map(|e| (e.path.clone(), e.size)).collect();
        assert_eq!(sizes["/tmp/t"], 26);
        assert_eq!(sizes["/tmp/t/sub"], 14);
    }

    #[test]
    fn delete_stale_removes_only_old_entries() {
        let (mut store, _dir) = temp_store();
        store.insert_or_update(&entry("/tmp/t", None, 0, EntryKind::Directory, 1)).unwrap();
        store
            .insert_or_update(&entry("/tmp/t/old.txt", Some("/tmp/t"), 1, EntryKind::File, 1))
            .unwrap();
        store
            .insert_or_update(&entry("/tmp/t/new.txt", Some("/tmp/t"), 1, EntryKind::File, 2))
            .unwrap();

        let removed = store.delete_stale("/tmp/t", 2).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.get_entry_count("/tmp/t").unwrap(), 2);
    }

    #[test]
    fn get_path_scan_info_reflects_freshness() {
        let (mut store, _dir) = temp_store();
        let info = store.get_path_scan_info("/tmp/t").unwrap();
        assert!(!info.exists);

        store.insert_or_update(&entry("/tmp/t", None, 0, EntryKind::Directory, 42)).unwrap();
        let info = store.get_path_scan_info("/tmp/t").unwrap();
        assert!(info.exists);
        assert_eq!(info.last_scanned, Some(42));
    }

    #[test]
    fn index_job_lifecycle_round_trips() {
        let (mut store, _dir) = temp_store();
        let job_id = store.create_index_job("/tmp/t", 100).unwrap();
        store.start_index_job(job_id, 101).unwrap();

        let mut metadata = JobMetadata::new();
        metadata.insert("files_processed".to_string(), serde_json::json!(2));
        store.update_index_job_progress(job_id, 50, &metadata).unwrap();
        store
            .update_index_job_status(job_id, JobStatus::Completed, Some(110), None)
            .unwrap();

        let job = store.get_index_job(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 50);
        assert_eq!(job.completed_at, Some(110));
    }

    #[test]
    fn under_root_pattern_does_not_match_sibling_with_shared_prefix() {
        let (mut store, _dir) = temp_store();
        store.insert_or_update(&entry("/tmp/t", None, 0, EntryKind::Directory, 1)).unwrap();
        store.insert_or_update(&entry("/tmp/t2", None, 0, EntryKind::Directory, 1)).unwrap();
        assert_eq!(store.get_entry_count("/tmp/t").unwrap(), 1);
    }
}

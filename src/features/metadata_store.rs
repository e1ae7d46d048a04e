//! Write-once persistence for [`SignatureMetadata`] records.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use sqlite::{Connection, State};

use crate::config::{MetadataBackend, PipelineConfig};
use crate::error::{Error, Result};
use crate::features::footprint::SignatureMetadata;

/// Implementations are shared between request threads.
pub trait MetadataStore: Send + Sync {
    /// Persist a new record. Fails with [`Error::DuplicateSignatureId`] if the id exists.
    fn save(&self, metadata: &SignatureMetadata) -> Result<()>;

    fn find_by_id(&self, signature_id: &str) -> Result<Option<SignatureMetadata>>;

    /// All records for an opportunity, newest first.
    fn find_by_opportunity(&self, opportunity_id: &str) -> Result<Vec<SignatureMetadata>>;
}

fn persistence(context: &str, err: impl std::fmt::Display) -> Error {
    Error::MetadataPersistence(format!("{context}:{err}"))
}

fn sort_newest_first(records: &mut [SignatureMetadata]) {
    records.sort_by(|a, b| {
        b.signed_at
            .cmp(&a.signed_at)
            .then_with(|| b.signature_id.cmp(&a.signature_id))
    });
}

fn is_file_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// One pretty-printed `<signatureId>.json` file per record.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, signature_id: &str) -> Result<PathBuf> {
        if !is_file_safe_id(signature_id) {
            return Err(Error::MetadataPersistence(format!(
                "invalid_signature_id:{signature_id}"
            )));
        }
        Ok(self.dir.join(format!("{signature_id}.json")))
    }

    fn read_record(path: &Path) -> Result<SignatureMetadata> {
        let content = fs::read_to_string(path).map_err(|e| persistence("read_failed", e))?;
        serde_json::from_str(&content).map_err(|e| persistence("json_err", e))
    }
}

impl MetadataStore for JsonFileStore {
    fn save(&self, metadata: &SignatureMetadata) -> Result<()> {
        let path = self.record_path(&metadata.signature_id)?;
        fs::create_dir_all(&self.dir).map_err(|e| persistence("mkdir_failed", e))?;
        let content =
            serde_json::to_string_pretty(metadata).map_err(|e| persistence("json_err", e))?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::DuplicateSignatureId(metadata.signature_id.clone()))
            }
            Err(e) => return Err(persistence("open_failed", e)),
        };
        if let Err(e) = file.write_all(content.as_bytes()).and_then(|_| file.sync_all()) {
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(persistence("write_failed", e));
        }
        log::debug!("Stored signature metadata {}", path.display());
        Ok(())
    }

    fn find_by_id(&self, signature_id: &str) -> Result<Option<SignatureMetadata>> {
        let path = self.record_path(signature_id)?;
        if !path.exists() {
            return Ok(None);
        }
        Self::read_record(&path).map(Some)
    }

    fn find_by_opportunity(&self, opportunity_id: &str) -> Result<Vec<SignatureMetadata>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| persistence("read_dir_failed", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| persistence("entry_error", e))?;
            let path = entry.path();
            if path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            match Self::read_record(&path) {
                Ok(record) if record.opportunity_id == opportunity_id => records.push(record),
                Ok(_) => {}
                Err(e) => log::warn!("Skipping unreadable metadata file {}: {}", path.display(), e),
            }
        }
        sort_newest_first(&mut records);
        Ok(records)
    }
}

/// Records in a single SQLite table keyed by signature id.
///
/// Statements run one at a time under a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS signature_metadata (
        signature_id TEXT PRIMARY KEY NOT NULL,
        opportunity_id TEXT NOT NULL,
        signed_at_ms INTEGER NOT NULL,
        record TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_signature_metadata_opportunity
        ON signature_metadata (opportunity_id, signed_at_ms);";

const SELECT_BY_ID_SQL: &str = "SELECT record FROM signature_metadata WHERE signature_id = ?";

fn query_records(conn: &Connection, sql: &str, key: &str) -> Result<Vec<SignatureMetadata>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| persistence("sqlite_prepare_failed", e))?;
    stmt.bind((1, key))
        .map_err(|e| persistence("sqlite_bind_failed", e))?;
    let mut records = Vec::new();
    loop {
        match stmt.next() {
            Ok(State::Row) => {
                let raw = stmt
                    .read::<String, usize>(0)
                    .map_err(|e| persistence("sqlite_read_failed", e))?;
                records.push(serde_json::from_str(&raw).map_err(|e| persistence("json_err", e))?);
            }
            Ok(State::Done) => break,
            Err(e) => return Err(persistence("sqlite_step_failed", e)),
        }
    }
    Ok(records)
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| persistence("mkdir_failed", e))?;
        }
        let conn = Connection::open(path).map_err(|e| persistence("sqlite_open_failed", e))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open(":memory:").map_err(|e| persistence("sqlite_open_failed", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(CREATE_TABLE_SQL)
            .map_err(|e| persistence("sqlite_schema_failed", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MetadataStore for SqliteStore {
    fn save(&self, metadata: &SignatureMetadata) -> Result<()> {
        let conn = self.lock();
        if !query_records(&conn, SELECT_BY_ID_SQL, &metadata.signature_id)?.is_empty() {
            return Err(Error::DuplicateSignatureId(metadata.signature_id.clone()));
        }
        let record = serde_json::to_string(metadata).map_err(|e| persistence("json_err", e))?;
        let mut stmt = conn
            .prepare(
                "INSERT INTO signature_metadata (signature_id, opportunity_id, signed_at_ms, record)
                 VALUES (?, ?, ?, ?)",
            )
            .map_err(|e| persistence("sqlite_prepare_failed", e))?;
        stmt.bind((1, metadata.signature_id.as_str()))
            .and_then(|_| stmt.bind((2, metadata.opportunity_id.as_str())))
            .and_then(|_| stmt.bind((3, metadata.signed_at.timestamp_millis())))
            .and_then(|_| stmt.bind((4, record.as_str())))
            .map_err(|e| persistence("sqlite_bind_failed", e))?;
        loop {
            match stmt.next() {
                Ok(State::Done) => break,
                Ok(State::Row) => continue,
                Err(e) => return Err(persistence("sqlite_insert_failed", e)),
            }
        }
        Ok(())
    }

    fn find_by_id(&self, signature_id: &str) -> Result<Option<SignatureMetadata>> {
        let mut records = query_records(&self.lock(), SELECT_BY_ID_SQL, signature_id)?;
        Ok(records.pop())
    }

    fn find_by_opportunity(&self, opportunity_id: &str) -> Result<Vec<SignatureMetadata>> {
        let mut records = query_records(
            &self.lock(),
            "SELECT record FROM signature_metadata WHERE opportunity_id = ?
             ORDER BY signed_at_ms DESC, signature_id DESC",
            opportunity_id,
        )?;
        sort_newest_first(&mut records);
        Ok(records)
    }
}

/// Store selected by `config.metadata_backend`, rooted at `config.metadata_dir`.
pub fn open_store(config: &PipelineConfig) -> Result<Box<dyn MetadataStore>> {
    match config.metadata_backend {
        MetadataBackend::Json => Ok(Box::new(JsonFileStore::new(config.metadata_dir.clone()))),
        MetadataBackend::Sqlite => Ok(Box::new(SqliteStore::open(
            &config.metadata_dir.join("signatures.sqlite3"),
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::footprint::fixtures::sample_footprint;
    use crate::features::footprint::{generate_signature_id, SignaturePosition};
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::tempdir;

    fn record(opportunity: &str, minutes: i64) -> SignatureMetadata {
        SignatureMetadata::create(
            generate_signature_id(),
            opportunity,
            "Jane Doe",
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + Duration::minutes(minutes),
            sample_footprint(),
            "data:image/png;base64,iVBORw0KGgo",
            "/srv/docs/contract_signed.pdf",
            SignaturePosition { x: 72.5, y: 610.0, w: 80.0, h: 40.0, page: 23 },
        )
        .unwrap()
    }

    fn exercise(store: &dyn MetadataStore) {
        let first = record("opp-1", 0);
        let second = record("opp-1", 5);
        let other = record("opp-2", 1);
        store.save(&first).unwrap();
        store.save(&second).unwrap();
        store.save(&other).unwrap();

        let found = store.find_by_opportunity("opp-1").unwrap();
        assert_eq!(found, vec![second.clone(), first.clone()]);
        assert_eq!(store.find_by_id(&other.signature_id).unwrap(), Some(other));
        assert_eq!(store.find_by_id("sig_0_missing00").unwrap(), None);
        assert!(store.find_by_opportunity("opp-3").unwrap().is_empty());

        let err = store.save(&first).unwrap_err();
        assert!(matches!(err, Error::DuplicateSignatureId(id) if id == first.signature_id));
    }

    #[test]
    fn json_store_round_trips_and_enforces_uniqueness() {
        let dir = tempdir().unwrap();
        exercise(&JsonFileStore::new(dir.path().join("signatures")));
    }

    #[test]
    fn sqlite_store_round_trips_and_enforces_uniqueness() {
        exercise(&SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn sqlite_store_is_durable_across_connections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta").join("signatures.sqlite3");
        let meta = record("opp-9", 0);
        SqliteStore::open(&path).unwrap().save(&meta).unwrap();
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.find_by_opportunity("opp-9").unwrap(), vec![meta]);
    }

    #[test]
    fn sqlite_store_accepts_writers_from_several_threads() {
        let store = std::sync::Arc::new(SqliteStore::in_memory().unwrap());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for n in 0..5 {
                        store.save(&record("opp-threads", i * 10 + n)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.find_by_opportunity("opp-threads").unwrap().len(), 20);
    }

    #[test]
    fn json_store_rejects_path_like_ids() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let mut meta = record("opp-1", 0);
        meta.signature_id = "../escape".into();
        assert!(matches!(store.save(&meta), Err(Error::MetadataPersistence(_))));
    }

    #[test]
    fn json_store_skips_malformed_files() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let meta = record("opp-1", 0);
        store.save(&meta).unwrap();
        fs::write(dir.path().join("garbage.json"), "{not json").unwrap();
        assert_eq!(store.find_by_opportunity("opp-1").unwrap(), vec![meta]);
    }

    #[test]
    fn open_store_follows_config() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig::default()
            .with_metadata_dir(dir.path())
            .with_metadata_backend(MetadataBackend::Sqlite);
        let store = open_store(&config).unwrap();
        store.save(&record("opp-1", 0)).unwrap();
        assert!(dir.path().join("signatures.sqlite3").exists());
    }
}

//! SQLite-backed store.
//!
//! Identifier tables, diff archive and work queue share one database file,
//! so a queue append commits atomically with any other write in the same
//! transaction. Connections are opened per handle; every handle applies the
//! same pragmas and busy timeout.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use uuid::Uuid;

use crate::model::{
    ConflictRecord, Diff, DiffId, DiffOp, DiffOpId, Document, EntityName, ForeignKey, InternalKey,
    SourceName, WorkItem,
};

use super::{
    AbandonOutcome, DeadLetter, Lease, LeasedItem, Store, StoreError, StoreHandle,
};

const SCHEMA_VERSION: u32 = 1;
const BUSY_TIMEOUT_MS: u64 = 5_000;
const DEQUEUE_POLL: Duration = Duration::from_millis(50);

pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the store at `path` and validate its schema
    /// version.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }
        }

        let conn = open_connection(path, true)?;
        let is_new = !table_exists(&conn, "meta")?;
        if is_new {
            initialize_schema(&conn)?;
            set_meta(&conn, "schema_version", &SCHEMA_VERSION.to_string())?;
        } else {
            validate_schema_version(&conn)?;
        }
        drop(conn);

        Ok(Self {
            db_path: path.to_path_buf(),
        })
    }
}

impl Store for SqliteStore {
    fn handle(&self) -> Result<Box<dyn StoreHandle>, StoreError> {
        let conn = open_connection(&self.db_path, false)?;
        Ok(Box::new(SqliteHandle { conn }))
    }
}

struct SqliteHandle {
    conn: Connection,
}

/// Explicit transaction guard; rolls back unless committed.
struct Txn<'a> {
    conn: &'a Connection,
    done: bool,
}

impl<'a> Txn<'a> {
    fn begin(conn: &'a Connection) -> Result<Self, StoreError> {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Self { conn, done: false })
    }

    fn commit(mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        self.done = true;
        Ok(())
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

impl StoreHandle for SqliteHandle {
    fn create_internal_key(&mut self, entity: &EntityName) -> Result<InternalKey, StoreError> {
        let txn = Txn::begin(&self.conn)?;
        let next: Option<i64> = self
            .conn
            .query_row(
                "SELECT next_id FROM entity_counters WHERE entity = ?1",
                params![entity.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let id = next.unwrap_or(1);
        self.conn.execute(
            "INSERT INTO entity_counters (entity, next_id) VALUES (?1, ?2) \
             ON CONFLICT(entity) DO UPDATE SET next_id = excluded.next_id",
            params![entity.as_str(), id + 1],
        )?;
        self.conn.execute(
            "INSERT INTO internal_keys (entity, id) VALUES (?1, ?2)",
            params![entity.as_str(), id],
        )?;
        txn.commit()?;
        Ok(InternalKey::new(entity.clone(), id as u64))
    }

    fn lookup_internal(&mut self, fk: &ForeignKey) -> Result<Option<InternalKey>, StoreError> {
        let id: Option<i64> = self
            .conn
            .query_row(
                "SELECT internal_id FROM foreign_keys \
                 WHERE entity = ?1 AND source = ?2 AND foreign_id = ?3",
                params![fk.entity.as_str(), fk.source.as_str(), fk.id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(|id| InternalKey::new(fk.entity.clone(), id as u64)))
    }

    fn record_foreign(&mut self, key: &InternalKey, fk: &ForeignKey) -> Result<(), StoreError> {
        let txn = Txn::begin(&self.conn)?;

        let known: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM internal_keys WHERE entity = ?1 AND id = ?2",
                params![key.entity.as_str(), key.id as i64],
                |row| row.get(0),
            )
            .optional()?;
        if known.is_none() {
            return Err(StoreError::Invariant(format!(
                "recordForeign for unknown internal key {key}"
            )));
        }

        let bound: Option<String> = self
            .conn
            .query_row(
                "SELECT foreign_id FROM foreign_keys \
                 WHERE entity = ?1 AND source = ?2 AND internal_id = ?3",
                params![key.entity.as_str(), fk.source.as_str(), key.id as i64],
                |row| row.get(0),
            )
            .optional()?;
        match bound {
            Some(existing) if existing == fk.id => {
                txn.commit()?;
                return Ok(());
            }
            Some(_) => {
                return Err(StoreError::ForeignKeyConflict {
                    key: key.clone(),
                    source: fk.source.clone(),
                });
            }
            None => {}
        }

        let claimed: Option<i64> = self
            .conn
            .query_row(
                "SELECT internal_id FROM foreign_keys \
                 WHERE entity = ?1 AND source = ?2 AND foreign_id = ?3",
                params![key.entity.as_str(), fk.source.as_str(), fk.id],
                |row| row.get(0),
            )
            .optional()?;
        if claimed.is_some_and(|other| other as u64 != key.id) {
            return Err(StoreError::ForeignKeyConflict {
                key: key.clone(),
                source: fk.source.clone(),
            });
        }

        self.conn.execute(
            "INSERT OR IGNORE INTO foreign_keys (entity, source, foreign_id, internal_id) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                key.entity.as_str(),
                fk.source.as_str(),
                fk.id,
                key.id as i64
            ],
        )?;
        txn.commit()?;
        Ok(())
    }

    fn lookup_foreign(
        &mut self,
        key: &InternalKey,
        source: &SourceName,
    ) -> Result<Option<ForeignKey>, StoreError> {
        let id: Option<String> = self
            .conn
            .query_row(
                "SELECT foreign_id FROM foreign_keys \
                 WHERE entity = ?1 AND source = ?2 AND internal_id = ?3",
                params![key.entity.as_str(), source.as_str(), key.id as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(|id| ForeignKey::new(key.entity.clone(), source.clone(), id)))
    }

    fn delete_internal(&mut self, key: &InternalKey) -> Result<u64, StoreError> {
        let txn = Txn::begin(&self.conn)?;
        let mut removed = 0usize;
        removed += self.conn.execute(
            "DELETE FROM diff_ops WHERE diff_id IN \
             (SELECT diff_id FROM diffs WHERE entity = ?1 AND internal_id = ?2)",
            params![key.entity.as_str(), key.id as i64],
        )?;
        removed += self.conn.execute(
            "DELETE FROM diffs WHERE entity = ?1 AND internal_id = ?2",
            params![key.entity.as_str(), key.id as i64],
        )?;
        removed += self.conn.execute(
            "DELETE FROM initial_documents WHERE entity = ?1 AND internal_id = ?2",
            params![key.entity.as_str(), key.id as i64],
        )?;
        removed += self.conn.execute(
            "DELETE FROM foreign_keys WHERE entity = ?1 AND internal_id = ?2",
            params![key.entity.as_str(), key.id as i64],
        )?;
        removed += self.conn.execute(
            "DELETE FROM internal_keys WHERE entity = ?1 AND id = ?2",
            params![key.entity.as_str(), key.id as i64],
        )?;
        txn.commit()?;
        Ok(removed as u64)
    }

    fn put_initial(&mut self, key: &InternalKey, doc: &Document) -> Result<(), StoreError> {
        let body = encode_json(doc)?;
        self.conn.execute(
            "INSERT INTO initial_documents (entity, internal_id, document) VALUES (?1, ?2, ?3) \
             ON CONFLICT(entity, internal_id) DO UPDATE SET document = excluded.document",
            params![key.entity.as_str(), key.id as i64, body],
        )?;
        Ok(())
    }

    fn get_initial(&mut self, key: &InternalKey) -> Result<Option<Document>, StoreError> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT document FROM initial_documents WHERE entity = ?1 AND internal_id = ?2",
                params![key.entity.as_str(), key.id as i64],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|body| decode_json(&body)).transpose()
    }

    fn put_diff(
        &mut self,
        key: &InternalKey,
        ops: &[(DiffOp<()>, bool)],
    ) -> Result<DiffId, StoreError> {
        let txn = Txn::begin(&self.conn)?;
        self.conn.execute(
            "INSERT INTO diffs (entity, internal_id, resolved, created_at_ms) \
             VALUES (?1, ?2, 0, ?3)",
            params![key.entity.as_str(), key.id as i64, now_ms()],
        )?;
        let diff_id = self.conn.last_insert_rowid();
        for (seq, (op, accepted)) in ops.iter().enumerate() {
            self.conn.execute(
                "INSERT INTO diff_ops (diff_id, seq, op, accepted) VALUES (?1, ?2, ?3, ?4)",
                params![diff_id, seq as i64, encode_json(op)?, *accepted],
            )?;
        }
        txn.commit()?;
        Ok(DiffId(diff_id))
    }

    fn diff_owner(&mut self, diff: DiffId) -> Result<Option<InternalKey>, StoreError> {
        let row: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT entity, internal_id FROM diffs WHERE diff_id = ?1",
                params![diff.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(entity, id)| {
            let entity = EntityName::new(entity)
                .map_err(|e| StoreError::RowDecode(format!("diff entity: {e}")))?;
            Ok(InternalKey::new(entity, id as u64))
        })
        .transpose()
    }

    fn list_conflicts(&mut self) -> Result<Vec<ConflictRecord>, StoreError> {
        let heads: Vec<(i64, String, i64, Option<String>)> = {
            let mut stmt = self.conn.prepare(
                "SELECT d.diff_id, d.entity, d.internal_id, i.document \
                 FROM diffs d \
                 LEFT JOIN initial_documents i \
                   ON i.entity = d.entity AND i.internal_id = d.internal_id \
                 WHERE d.resolved = 0 AND EXISTS \
                   (SELECT 1 FROM diff_ops o WHERE o.diff_id = d.diff_id AND o.accepted = 0) \
                 ORDER BY d.diff_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };

        let mut out = Vec::with_capacity(heads.len());
        for (diff_id, entity, internal_id, document) in heads {
            let entity = EntityName::new(entity)
                .map_err(|e| StoreError::RowDecode(format!("diff entity: {e}")))?;
            let key = InternalKey::new(entity, internal_id as u64);
            let initial = document
                .map(|body| decode_json(&body))
                .transpose()?
                .unwrap_or_default();

            let mut accepted = Vec::new();
            let mut conflicts = Vec::new();
            let mut stmt = self.conn.prepare(
                "SELECT op_id, op, accepted FROM diff_ops WHERE diff_id = ?1 ORDER BY seq",
            )?;
            let ops = stmt.query_map(params![diff_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                ))
            })?;
            for row in ops {
                let (op_id, body, is_accepted) = row?;
                let op: DiffOp<()> = decode_json(&body)?;
                if is_accepted {
                    accepted.push(op);
                } else {
                    conflicts.push((DiffOpId(op_id), op));
                }
            }

            out.push(ConflictRecord {
                diff_id: DiffId(diff_id),
                key,
                initial,
                diff: Diff::new((), accepted),
                conflicts,
            });
        }
        Ok(out)
    }

    fn resolve_ops(&mut self, diff: DiffId, ops: &[DiffOpId]) -> Result<Diff<()>, StoreError> {
        let resolved: Option<bool> = self
            .conn
            .query_row(
                "SELECT resolved FROM diffs WHERE diff_id = ?1",
                params![diff.0],
                |row| row.get(0),
            )
            .optional()?;
        match resolved {
            None | Some(true) => return Err(StoreError::ConflictResolved(diff)),
            Some(false) => {}
        }

        let mut selected = Vec::with_capacity(ops.len());
        for op_id in ops {
            let row: Option<(i64, String)> = self
                .conn
                .query_row(
                    "SELECT seq, op FROM diff_ops WHERE op_id = ?1 AND diff_id = ?2",
                    params![op_id.0, diff.0],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (seq, body) = row.ok_or(StoreError::ForeignOp {
                diff,
                op: *op_id,
            })?;
            selected.push((seq, decode_json::<DiffOp<()>>(&body)?));
        }
        selected.sort_by_key(|(seq, _)| *seq);
        Ok(Diff::new((), selected.into_iter().map(|(_, op)| op).collect()))
    }

    fn mark_resolved(&mut self, diff: DiffId, ops: &[DiffOpId]) -> Result<(), StoreError> {
        let txn = Txn::begin(&self.conn)?;
        let resolved: Option<bool> = self
            .conn
            .query_row(
                "SELECT resolved FROM diffs WHERE diff_id = ?1",
                params![diff.0],
                |row| row.get(0),
            )
            .optional()?;
        match resolved {
            None | Some(true) => return Err(StoreError::ConflictResolved(diff)),
            Some(false) => {}
        }
        for op_id in ops {
            let updated = self.conn.execute(
                "UPDATE diff_ops SET accepted = 1 WHERE op_id = ?1 AND diff_id = ?2",
                params![op_id.0, diff.0],
            )?;
            if updated == 0 {
                return Err(StoreError::ForeignOp { diff, op: *op_id });
            }
        }
        self.conn.execute(
            "UPDATE diffs SET resolved = 1 WHERE diff_id = ?1",
            params![diff.0],
        )?;
        txn.commit()?;
        Ok(())
    }

    fn enqueue(&mut self, item: &WorkItem) -> Result<(), StoreError> {
        let delivery_key = self.delivery_key(item)?;
        self.conn.execute(
            "INSERT INTO work_queue (delivery_key, body, attempts) VALUES (?1, ?2, 0)",
            params![delivery_key, encode_json(item)?],
        )?;
        Ok(())
    }

    fn dequeue(
        &mut self,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LeasedItem>, StoreError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(item) = self.try_dequeue(lease)? {
                return Ok(Some(item));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(DEQUEUE_POLL.min(deadline - now));
        }
    }

    fn complete(&mut self, lease: &Lease) -> Result<(), StoreError> {
        let removed = self.conn.execute(
            "DELETE FROM work_queue WHERE item_id = ?1 AND lease_token = ?2",
            params![lease.item_id, lease.token.as_bytes().to_vec()],
        )?;
        if removed == 0 {
            return Err(StoreError::LeaseLost(lease.token));
        }
        Ok(())
    }

    fn abandon(
        &mut self,
        lease: &Lease,
        error: &str,
        retry_cap: u32,
    ) -> Result<AbandonOutcome, StoreError> {
        let txn = Txn::begin(&self.conn)?;
        let row: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT body, attempts FROM work_queue \
                 WHERE item_id = ?1 AND lease_token = ?2",
                params![lease.item_id, lease.token.as_bytes().to_vec()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((body, attempts)) = row else {
            return Err(StoreError::LeaseLost(lease.token));
        };
        let attempts = attempts as u32 + 1;

        if attempts >= retry_cap {
            self.conn.execute(
                "INSERT INTO dead_letters (item_id, body, attempts, error, failed_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![lease.item_id, body, attempts, error, now_ms()],
            )?;
            self.conn.execute(
                "DELETE FROM work_queue WHERE item_id = ?1",
                params![lease.item_id],
            )?;
            txn.commit()?;
            return Ok(AbandonOutcome::DeadLettered);
        }

        self.conn.execute(
            "UPDATE work_queue SET attempts = ?2, lease_token = NULL, leased_until_ms = NULL \
             WHERE item_id = ?1",
            params![lease.item_id, attempts],
        )?;
        txn.commit()?;
        Ok(AbandonOutcome::Requeued { attempts })
    }

    fn dead_letters(&mut self) -> Result<Vec<DeadLetter>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT body, attempts, error FROM dead_letters ORDER BY item_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (body, attempts, error) = row?;
            out.push(DeadLetter {
                item: decode_json(&body)?,
                attempts: attempts as u32,
                error,
            });
        }
        Ok(out)
    }

    fn queue_depth(&mut self) -> Result<u64, StoreError> {
        let depth: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM work_queue \
             WHERE lease_token IS NULL OR leased_until_ms < ?1",
            params![now_ms()],
            |row| row.get(0),
        )?;
        Ok(depth as u64)
    }
}

impl SqliteHandle {
    /// Items sharing a delivery key dequeue in insertion order; the key is
    /// the internal key when it is resolvable at enqueue time.
    fn delivery_key(&mut self, item: &WorkItem) -> Result<String, StoreError> {
        match item {
            WorkItem::Process(notification) => {
                let fk = notification.foreign_key();
                match self.lookup_internal(&fk)? {
                    Some(key) => Ok(format!("ik:{key}")),
                    None => Ok(format!("fk:{fk}")),
                }
            }
            WorkItem::Apply { diff_id, .. } => match self.diff_owner(*diff_id)? {
                Some(key) => Ok(format!("ik:{key}")),
                None => Ok(format!("diff:{diff_id}")),
            },
        }
    }

    fn try_dequeue(&mut self, lease: Duration) -> Result<Option<LeasedItem>, StoreError> {
        let txn = Txn::begin(&self.conn)?;
        let now = now_ms();
        let row: Option<(i64, String, i64)> = self
            .conn
            .query_row(
                "SELECT w.item_id, w.body, w.attempts FROM work_queue w \
                 WHERE (w.lease_token IS NULL OR w.leased_until_ms < ?1) \
                   AND NOT EXISTS (SELECT 1 FROM work_queue w2 \
                                   WHERE w2.delivery_key = w.delivery_key \
                                     AND w2.item_id < w.item_id) \
                 ORDER BY w.item_id LIMIT 1",
                params![now],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((item_id, body, attempts)) = row else {
            return Ok(None);
        };

        let token = Uuid::new_v4();
        let until = now + lease.as_millis() as i64;
        self.conn.execute(
            "UPDATE work_queue SET lease_token = ?2, leased_until_ms = ?3 WHERE item_id = ?1",
            params![item_id, token.as_bytes().to_vec(), until],
        )?;
        txn.commit()?;

        Ok(Some(LeasedItem {
            lease: Lease { token, item_id },
            item: decode_json(&body)?,
            attempts: attempts as u32,
        }))
    }
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::RowDecode(format!("encode: {e}")))
}

fn decode_json<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, StoreError> {
    serde_json::from_str(body).map_err(|e| StoreError::RowDecode(format!("decode: {e}")))
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn open_connection(path: &Path, create: bool) -> Result<Connection, StoreError> {
    let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE;
    if create {
        flags |= OpenFlags::SQLITE_OPEN_CREATE;
    }
    let conn = Connection::open_with_flags(path, flags)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(conn)
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool, StoreError> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn validate_schema_version(conn: &Connection) -> Result<(), StoreError> {
    let got: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    let got: u32 = got
        .as_deref()
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| StoreError::RowDecode("missing schema_version".to_string()))?;
    if got != SCHEMA_VERSION {
        return Err(StoreError::SchemaVersionMismatch {
            expected: SCHEMA_VERSION,
            got,
        });
    }
    Ok(())
}

fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
           key TEXT PRIMARY KEY,
           value TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS internal_keys (
           entity TEXT NOT NULL,
           id INTEGER NOT NULL,
           PRIMARY KEY (entity, id)
         );
         CREATE TABLE IF NOT EXISTS entity_counters (
           entity TEXT PRIMARY KEY,
           next_id INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS foreign_keys (
           entity TEXT NOT NULL,
           source TEXT NOT NULL,
           foreign_id TEXT NOT NULL,
           internal_id INTEGER NOT NULL,
           PRIMARY KEY (entity, source, foreign_id)
         );
         CREATE UNIQUE INDEX IF NOT EXISTS foreign_keys_by_internal
           ON foreign_keys (entity, source, internal_id);
         CREATE TABLE IF NOT EXISTS initial_documents (
           entity TEXT NOT NULL,
           internal_id INTEGER NOT NULL,
           document TEXT NOT NULL,
           PRIMARY KEY (entity, internal_id)
         );
         CREATE TABLE IF NOT EXISTS diffs (
           diff_id INTEGER PRIMARY KEY AUTOINCREMENT,
           entity TEXT NOT NULL,
           internal_id INTEGER NOT NULL,
           resolved INTEGER NOT NULL DEFAULT 0,
           created_at_ms INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS diffs_by_internal
           ON diffs (entity, internal_id);
         CREATE TABLE IF NOT EXISTS diff_ops (
           op_id INTEGER PRIMARY KEY AUTOINCREMENT,
           diff_id INTEGER NOT NULL,
           seq INTEGER NOT NULL,
           op TEXT NOT NULL,
           accepted INTEGER NOT NULL DEFAULT 0
         );
         CREATE INDEX IF NOT EXISTS diff_ops_by_diff
           ON diff_ops (diff_id, seq);
         CREATE TABLE IF NOT EXISTS work_queue (
           item_id INTEGER PRIMARY KEY AUTOINCREMENT,
           delivery_key TEXT NOT NULL,
           body TEXT NOT NULL,
           attempts INTEGER NOT NULL DEFAULT 0,
           lease_token BLOB,
           leased_until_ms INTEGER
         );
         CREATE INDEX IF NOT EXISTS work_queue_by_delivery
           ON work_queue (delivery_key, item_id);
         CREATE TABLE IF NOT EXISTS dead_letters (
           item_id INTEGER PRIMARY KEY,
           body TEXT NOT NULL,
           attempts INTEGER NOT NULL,
           error TEXT NOT NULL,
           failed_at_ms INTEGER NOT NULL
         );",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeNotification, DocumentPath};

    fn entity() -> EntityName {
        EntityName::new("customer").expect("entity name")
    }

    fn source(name: &str) -> SourceName {
        SourceName::new(name).expect("source name")
    }

    fn open_store() -> (tempfile::TempDir, Box<dyn StoreHandle>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(&dir.path().join("retcon.sqlite")).expect("open");
        let handle = store.handle().expect("handle");
        (dir, handle)
    }

    fn sample_doc(value: &str) -> Document {
        let mut doc = Document::new();
        doc.insert(
            DocumentPath::new(["name"]).expect("path"),
            value.to_string(),
        );
        doc
    }

    fn insert_op(path: &str, value: &str) -> DiffOp<()> {
        DiffOp::Insert {
            label: (),
            path: DocumentPath::new([path]).expect("path"),
            value: value.to_string(),
        }
    }

    fn notification(fid: &str) -> WorkItem {
        WorkItem::Process(ChangeNotification {
            entity: entity(),
            source: source("db1"),
            foreign_id: fid.to_string(),
        })
    }

    #[test]
    fn record_foreign_then_lookup_both_ways() {
        let (_dir, mut store) = open_store();
        let key = store.create_internal_key(&entity()).expect("create");
        let fk = ForeignKey::new(entity(), source("db1"), "41");
        store.record_foreign(&key, &fk).expect("record");

        assert_eq!(store.lookup_internal(&fk).expect("lookup"), Some(key.clone()));
        assert_eq!(
            store.lookup_foreign(&key, &source("db1")).expect("lookup"),
            Some(fk.clone())
        );
        // Re-recording the same binding is a no-op.
        store.record_foreign(&key, &fk).expect("idempotent");

        let other = ForeignKey::new(entity(), source("db1"), "42");
        assert!(matches!(
            store.record_foreign(&key, &other),
            Err(StoreError::ForeignKeyConflict { .. })
        ));
    }

    #[test]
    fn record_foreign_requires_internal_key() {
        let (_dir, mut store) = open_store();
        let ghost = InternalKey::new(entity(), 999);
        let fk = ForeignKey::new(entity(), source("db1"), "1");
        assert!(matches!(
            store.record_foreign(&ghost, &fk),
            Err(StoreError::Invariant(_))
        ));
    }

    #[test]
    fn internal_keys_are_unique_per_entity() {
        let (_dir, mut store) = open_store();
        let a = store.create_internal_key(&entity()).expect("create");
        let b = store.create_internal_key(&entity()).expect("create");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn delete_internal_cascades() {
        let (_dir, mut store) = open_store();
        let key = store.create_internal_key(&entity()).expect("create");
        let fk = ForeignKey::new(entity(), source("db1"), "1");
        store.record_foreign(&key, &fk).expect("record");
        store.put_initial(&key, &sample_doc("Alice")).expect("initial");
        store
            .put_diff(&key, &[(insert_op("name", "Bob"), false)])
            .expect("diff");

        let removed = store.delete_internal(&key).expect("delete");
        assert!(removed >= 4);
        assert_eq!(store.lookup_internal(&fk).expect("lookup"), None);
        assert_eq!(store.get_initial(&key).expect("initial"), None);
        assert!(store.list_conflicts().expect("conflicts").is_empty());
    }

    #[test]
    fn put_initial_upserts() {
        let (_dir, mut store) = open_store();
        let key = store.create_internal_key(&entity()).expect("create");
        store.put_initial(&key, &sample_doc("Alice")).expect("put");
        store.put_initial(&key, &sample_doc("Bob")).expect("overwrite");
        assert_eq!(store.get_initial(&key).expect("get"), Some(sample_doc("Bob")));
    }

    #[test]
    fn conflicts_list_only_unresolved_with_unaccepted_ops() {
        let (_dir, mut store) = open_store();
        let key = store.create_internal_key(&entity()).expect("create");
        store.put_initial(&key, &sample_doc("Alice")).expect("initial");

        // All ops accepted: never a conflict.
        store
            .put_diff(&key, &[(insert_op("city", "B"), true)])
            .expect("diff");
        assert!(store.list_conflicts().expect("list").is_empty());

        let diff_id = store
            .put_diff(
                &key,
                &[
                    (insert_op("x", "1"), false),
                    (insert_op("x", "2"), false),
                ],
            )
            .expect("diff");
        let conflicts = store.list_conflicts().expect("list");
        assert_eq!(conflicts.len(), 1);
        let record = &conflicts[0];
        assert_eq!(record.diff_id, diff_id);
        assert_eq!(record.key, key);
        assert_eq!(record.initial, sample_doc("Alice"));
        assert!(record.diff.is_empty());
        assert_eq!(record.conflicts.len(), 2);

        let chosen = record.conflicts[0].0;
        let resolution = store.resolve_ops(diff_id, &[chosen]).expect("resolve ops");
        assert_eq!(resolution.ops.len(), 1);

        store.mark_resolved(diff_id, &[chosen]).expect("mark");
        assert!(store.list_conflicts().expect("list").is_empty());
        assert!(matches!(
            store.resolve_ops(diff_id, &[chosen]),
            Err(StoreError::ConflictResolved(_))
        ));
    }

    #[test]
    fn resolve_ops_validates_ownership() {
        let (_dir, mut store) = open_store();
        let key = store.create_internal_key(&entity()).expect("create");
        let first = store
            .put_diff(&key, &[(insert_op("x", "1"), false)])
            .expect("diff");
        let second = store
            .put_diff(&key, &[(insert_op("x", "2"), false)])
            .expect("diff");

        let stray = store.list_conflicts().expect("list")[1].conflicts[0].0;
        assert!(matches!(
            store.resolve_ops(first, &[stray]),
            Err(StoreError::ForeignOp { .. })
        ));
        let _ = second;
    }

    #[test]
    fn queue_is_fifo_per_delivery_key() {
        let (_dir, mut store) = open_store();
        store.enqueue(&notification("1")).expect("enqueue");
        store.enqueue(&notification("1")).expect("enqueue");

        let wait = Duration::from_millis(10);
        let lease = Duration::from_secs(30);
        let first = store.dequeue(wait, lease).expect("dequeue").expect("item");
        // Second item shares the delivery key; hidden while the first is
        // leased.
        assert!(store.dequeue(wait, lease).expect("dequeue").is_none());

        store.complete(&first.lease).expect("complete");
        let second = store.dequeue(wait, lease).expect("dequeue").expect("item");
        assert!(first.lease.item_id < second.lease.item_id);
    }

    #[test]
    fn items_for_different_keys_interleave() {
        let (_dir, mut store) = open_store();
        store.enqueue(&notification("1")).expect("enqueue");
        store.enqueue(&notification("2")).expect("enqueue");

        let wait = Duration::from_millis(10);
        let lease = Duration::from_secs(30);
        let first = store.dequeue(wait, lease).expect("dequeue").expect("item");
        let second = store.dequeue(wait, lease).expect("dequeue").expect("item");
        assert_ne!(first.lease.item_id, second.lease.item_id);
    }

    #[test]
    fn abandon_requeues_then_dead_letters_at_cap() {
        let (_dir, mut store) = open_store();
        store.enqueue(&notification("1")).expect("enqueue");

        let wait = Duration::from_millis(10);
        let lease = Duration::from_secs(30);
        let cap = 3;
        for attempt in 1..cap {
            let item = store.dequeue(wait, lease).expect("dequeue").expect("item");
            assert_eq!(item.attempts, attempt - 1);
            assert_eq!(
                store
                    .abandon(&item.lease, "source timeout", cap)
                    .expect("abandon"),
                AbandonOutcome::Requeued { attempts: attempt }
            );
        }

        let item = store.dequeue(wait, lease).expect("dequeue").expect("item");
        assert_eq!(
            store
                .abandon(&item.lease, "source timeout", cap)
                .expect("abandon"),
            AbandonOutcome::DeadLettered
        );
        assert!(store.dequeue(wait, lease).expect("dequeue").is_none());

        let dead = store.dead_letters().expect("dead letters");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, cap);
        assert_eq!(dead[0].error, "source timeout");
    }

    #[test]
    fn expired_leases_are_redelivered() {
        let (_dir, mut store) = open_store();
        store.enqueue(&notification("1")).expect("enqueue");

        let wait = Duration::from_millis(10);
        let first = store
            .dequeue(wait, Duration::from_millis(0))
            .expect("dequeue")
            .expect("item");
        std::thread::sleep(Duration::from_millis(5));

        let again = store
            .dequeue(wait, Duration::from_secs(30))
            .expect("dequeue")
            .expect("item");
        assert_eq!(again.lease.item_id, first.lease.item_id);
        assert!(matches!(
            store.complete(&first.lease),
            Err(StoreError::LeaseLost(_))
        ));
        store.complete(&again.lease).expect("complete");
    }

    #[test]
    fn reopen_validates_schema_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("retcon.sqlite");
        let store = SqliteStore::open(&path).expect("open");
        drop(store);
        SqliteStore::open(&path).expect("reopen");
    }
}

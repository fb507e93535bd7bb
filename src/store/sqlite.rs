//! SQLite implementation of the recovery log and lease stores.
//!
//! One database file can hold any number of failure scopes; several
//! servers sharing a file (or several [`SqliteStore`]s in one
//! process) coordinate through SQLite's own locking. Every write runs
//! in an `IMMEDIATE` transaction so racing writers are serialized by
//! the database and lease compare-and-swaps are exact.

use std::path::Path;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::TransactionBehavior;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use super::*;
use crate::codec;
use crate::config::StoreConfig;
use crate::errors::LogException;

// The `'static` lifetime within [`Migrations`] is saying that the
// [`str`]s composing the migrations are `'static`.
static MIGRATIONS: OnceLock<Migrations<'static>> = OnceLock::new();

fn get_migrations() -> &'static Migrations<'static> {
    MIGRATIONS.get_or_init(|| {
        Migrations::new(vec![
            // One row per section ever opened; names the generation
            // that holds its live rows.
            M::up(
                "CREATE TABLE section_heads ( \
                 created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 scope TEXT NOT NULL, \
                 section_id INTEGER NOT NULL CHECK (section_id >= 0), \
                 generation INTEGER NOT NULL CHECK (generation >= 0), \
                 PRIMARY KEY (scope, section_id) \
                 ) STRICT",
            ),
            // A NULL payload is a discard.
            M::up(
                "CREATE TABLE log_records ( \
                 scope TEXT NOT NULL, \
                 section_id INTEGER NOT NULL, \
                 generation INTEGER NOT NULL, \
                 unit_id INTEGER NOT NULL, \
                 seq INTEGER NOT NULL CHECK (seq > 0), \
                 payload BLOB, \
                 last_updated TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 PRIMARY KEY (scope, section_id, generation, unit_id, seq) \
                 ) STRICT",
            ),
            M::up(
                "CREATE TABLE leases ( \
                 scope TEXT NOT NULL PRIMARY KEY, \
                 owner_id TEXT NOT NULL, \
                 expiry_ms INTEGER NOT NULL, \
                 lease_version INTEGER NOT NULL CHECK (lease_version > 0), \
                 last_updated TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP \
                 ) STRICT",
            ),
            // Keypoints drop discards, so the highest sequence number
            // a section ever committed is kept on its head.
            M::up(
                "ALTER TABLE section_heads \
                 ADD COLUMN high_water INTEGER NOT NULL DEFAULT 0 CHECK (high_water >= 0)",
            ),
            M::up(
                "UPDATE section_heads SET high_water = ( \
                 SELECT COALESCE(MAX(seq), 0) FROM log_records \
                 WHERE log_records.scope = section_heads.scope \
                 AND log_records.section_id = section_heads.section_id \
                 )",
            ),
        ])
    })
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// Unit ids use the whole `u64` range; SQLite integers are signed, so
/// they are stored bit-for-bit as `i64`.
fn unit_to_sql(id: RecoveryUnitId) -> i64 {
    id.0 as i64
}

fn unit_from_sql(id: i64) -> RecoveryUnitId {
    RecoveryUnitId(id as u64)
}

fn expiry_from_sql(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| RecoveryLogError::Schema(format!("lease expiry {ms} out of range")))
}

/// Wrapper around an SQLite DB connection with methods for our
/// recovery log operations.
pub struct SqliteStore {
    /// `rusqlite` connections are not `Sync`; every call takes this
    /// lock for the span of one transaction.
    conn: Mutex<Connection>,
    read_batch_size: usize,
}

impl SqliteStore {
    /// Open the database at `file`, creating it and the schema if
    /// needed.
    pub fn open(file: &Path, config: &StoreConfig) -> Result<Self> {
        tracing::info!("Opening recovery log store at {file:?}");
        let conn = Connection::open_with_flags(
            file,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .reraise("can't open recovery log DB")?;
        Self::setup(conn, config)
    }

    /// Private, non-durable database. Mostly for tests.
    pub fn open_in_memory(config: &StoreConfig) -> Result<Self> {
        let conn = Connection::open_in_memory().reraise("can't open in-memory recovery log DB")?;
        Self::setup(conn, config)
    }

    /// Setup our connection-level pragmas and bring the schema up to
    /// date.
    fn setup(mut conn: Connection, config: &StoreConfig) -> Result<Self> {
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // Litestream's recommendation; WAL also lets readers run
        // alongside the single writer.
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!("Recovery log journal mode is {mode}");
        conn.pragma_update(None, "synchronous", "FULL")?;

        tracing::debug!("Running any pending recovery log migrations");
        get_migrations()
            .to_latest(&mut conn)
            .reraise("recovery log schema is missing or newer than this build")?;

        Ok(Self {
            conn: Mutex::new(conn),
            read_batch_size: config.read_batch_size.max(1),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_err| RecoveryLogError::Store("recovery log connection lock poisoned".to_owned()))
    }

    /// First half of a keypoint: copy the winning row of every live
    /// unit into the next generation.
    ///
    /// Nothing reads the new generation until
    /// [`Self::swap_generation`], so stopping here leaves the section
    /// as it was; the copy is deleted on the next open.
    fn stage_keypoint(&self, cursor: &SectionCursor) -> Result<StagedKeypoint> {
        let mut conn = self.conn()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let from = head_generation(&txn, &cursor.scope, cursor.section_id)?;
        let to = from + 1;
        let source = generation_summary(&txn, &cursor.scope, cursor.section_id, from)?;

        txn.execute(
            "DELETE FROM log_records \
             WHERE scope = ?1 AND section_id = ?2 AND generation = ?3",
            (&cursor.scope.0, cursor.section_id.0, to),
        )?;
        let live_rows = txn.execute(
            "WITH newest AS ( \
             SELECT unit_id, MAX(seq) AS seq \
             FROM log_records \
             WHERE scope = ?1 AND section_id = ?2 AND generation = ?3 \
             GROUP BY unit_id \
             ) \
             INSERT INTO log_records \
             (scope, section_id, generation, unit_id, seq, payload, last_updated) \
             SELECT scope, section_id, ?4, unit_id, seq, payload, last_updated \
             FROM log_records \
             JOIN newest USING (unit_id, seq) \
             WHERE scope = ?1 AND section_id = ?2 AND generation = ?3 \
             AND payload IS NOT NULL",
            (&cursor.scope.0, cursor.section_id.0, from, to),
        )? as u64;
        txn.commit()?;

        tracing::debug!(
            "Staged keypoint of section {} of {}: {} rows -> {live_rows} rows in generation {to}",
            cursor.section_id,
            cursor.scope,
            source.rows
        );
        Ok(StagedKeypoint {
            from,
            to,
            source,
            live_rows,
        })
    }

    /// Second half of a keypoint: atomically point the section at the
    /// staged generation.
    ///
    /// If anything was committed to the old generation after staging,
    /// the staged copy is stale; it is dropped and `false` returned.
    fn swap_generation(&self, cursor: &SectionCursor, staged: &StagedKeypoint) -> Result<bool> {
        let mut conn = self.conn()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let head = head_generation(&txn, &cursor.scope, cursor.section_id)?;
        let source = generation_summary(&txn, &cursor.scope, cursor.section_id, staged.from)?;

        let swapped = if head == staged.from && source == staged.source {
            txn.execute(
                "UPDATE section_heads SET generation = ?3 \
                 WHERE scope = ?1 AND section_id = ?2",
                (&cursor.scope.0, cursor.section_id.0, staged.to),
            )?;
            true
        } else {
            tracing::warn!(
                "Abandoning keypoint of section {} of {}; it changed while staging",
                cursor.section_id,
                cursor.scope
            );
            txn.execute(
                "DELETE FROM log_records \
                 WHERE scope = ?1 AND section_id = ?2 AND generation = ?3",
                (&cursor.scope.0, cursor.section_id.0, staged.to),
            )?;
            false
        };
        txn.commit()?;
        Ok(swapped)
    }

    fn drop_generation(&self, cursor: &SectionCursor, generation: u64) -> Result<u64> {
        let conn = self.conn()?;
        let dropped = conn.execute(
            "DELETE FROM log_records \
             WHERE scope = ?1 AND section_id = ?2 AND generation = ?3",
            (&cursor.scope.0, cursor.section_id.0, generation),
        )?;
        Ok(dropped as u64)
    }
}

/// Row count and top sequence number of one generation; enough to
/// notice that it was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GenerationSummary {
    rows: u64,
    high_water: Option<u64>,
}

#[derive(Debug)]
struct StagedKeypoint {
    from: u64,
    to: u64,
    source: GenerationSummary,
    live_rows: u64,
}

fn head_generation(conn: &Connection, scope: &FailureScope, section_id: SectionId) -> Result<u64> {
    conn.query_row(
        "SELECT generation FROM section_heads \
         WHERE scope = ?1 AND section_id = ?2",
        (&scope.0, section_id.0),
        |row| row.get::<_, u64>(0),
    )
    .optional()?
    .ok_or_else(|| {
        RecoveryLogError::Schema(format!("section {section_id} of {scope} was never opened"))
    })
}

fn head_high_water(conn: &Connection, scope: &FailureScope, section_id: SectionId) -> Result<u64> {
    let high_water = conn.query_row(
        "SELECT high_water FROM section_heads \
         WHERE scope = ?1 AND section_id = ?2",
        (&scope.0, section_id.0),
        |row| row.get::<_, u64>(0),
    )?;
    Ok(high_water)
}

fn generation_summary(
    conn: &Connection,
    scope: &FailureScope,
    section_id: SectionId,
    generation: u64,
) -> Result<GenerationSummary> {
    let summary = conn.query_row(
        "SELECT COUNT(*), MAX(seq) FROM log_records \
         WHERE scope = ?1 AND section_id = ?2 AND generation = ?3",
        (&scope.0, section_id.0, generation),
        |row| {
            Ok(GenerationSummary {
                rows: row.get(0)?,
                high_water: row.get(1)?,
            })
        },
    )?;
    Ok(summary)
}

/// Write every change of a batch inside an already open transaction.
///
/// Re-applying a batch rewrites the same `(unit, seq)` rows with the
/// same contents.
fn apply_batch(conn: &Connection, scope: &FailureScope, batch: &Batch) -> Result<()> {
    let generation = head_generation(conn, scope, batch.section_id)?;
    let mut stmt = conn.prepare_cached(
        "INSERT INTO log_records \
         (scope, section_id, generation, unit_id, seq, payload) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT (scope, section_id, generation, unit_id, seq) DO UPDATE \
         SET payload = excluded.payload, last_updated = CURRENT_TIMESTAMP",
    )?;
    for change in &batch.changes {
        let payload = match change {
            Change::Upsert(record) => {
                if record.section_id != batch.section_id {
                    return Err(RecoveryLogError::Store(format!(
                        "record for section {} in a batch for section {}",
                        record.section_id, batch.section_id
                    )));
                }
                Some(codec::encode(record))
            }
            Change::Discard(..) => None,
        };
        tracing::trace!(
            "Writing unit {} at {:?} to section {} of {scope} ({})",
            change.recovery_unit_id(),
            change.sequence_number(),
            batch.section_id,
            payload
                .as_ref()
                .map_or_else(|| "discard".to_owned(), |p| format!("{} bytes", p.len()))
        );
        stmt.execute((
            &scope.0,
            batch.section_id.0,
            generation,
            unit_to_sql(change.recovery_unit_id()),
            change.sequence_number().0,
            payload,
        ))?;
    }
    if let Some(top) = batch.changes.iter().map(Change::sequence_number).max() {
        conn.execute(
            "UPDATE section_heads SET high_water = MAX(high_water, ?3) \
             WHERE scope = ?1 AND section_id = ?2",
            (&scope.0, batch.section_id.0, top.0),
        )?;
    }
    Ok(())
}

impl RecoveryLogStore for SqliteStore {
    fn list_sections(&self, scope: &FailureScope) -> Result<Vec<SectionId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT section_id FROM section_heads \
             WHERE scope = ?1 ORDER BY section_id",
        )?;
        let sections = stmt
            .query_map((&scope.0,), |row| Ok(SectionId(row.get(0)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sections)
    }

    fn open_section(&self, scope: &FailureScope, section_id: SectionId) -> Result<SectionCursor> {
        let mut conn = self.conn()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        txn.execute(
            "INSERT INTO section_heads (scope, section_id, generation) \
             VALUES (?1, ?2, 0) \
             ON CONFLICT (scope, section_id) DO NOTHING",
            (&scope.0, section_id.0),
        )?;
        let generation = head_generation(&txn, scope, section_id)?;
        let purged = txn.execute(
            "DELETE FROM log_records \
             WHERE scope = ?1 AND section_id = ?2 AND generation != ?3",
            (&scope.0, section_id.0, generation),
        )?;
        if purged > 0 {
            tracing::warn!(
                "Removed {purged} rows of section {section_id} of {scope} left by an interrupted keypoint"
            );
        }
        let summary = generation_summary(&txn, scope, section_id, generation)?;
        let high_water = head_high_water(&txn, scope, section_id)?
            .max(summary.high_water.unwrap_or(0));
        txn.commit()?;

        tracing::debug!(
            "Opened section {section_id} of {scope} at generation {generation} with {} rows",
            summary.rows
        );
        Ok(SectionCursor {
            scope: scope.clone(),
            section_id,
            high_water: SequenceNumber(high_water),
            stored_rows: summary.rows,
        })
    }

    fn read_all<'a>(&'a self, cursor: &SectionCursor) -> Result<RecordIter<'a>> {
        let generation = {
            let conn = self.conn()?;
            head_generation(&conn, &cursor.scope, cursor.section_id)?
        };
        Ok(Box::new(SqliteRecordLoader {
            store: self,
            scope: cursor.scope.clone(),
            section_id: cursor.section_id,
            generation,
            cursor: Cursor::Uninit,
            buffer: Vec::new().into_iter(),
        }))
    }

    fn commit_batch(&self, cursor: &SectionCursor, batch: &Batch) -> Result<()> {
        self.commit_batches(&[(cursor, batch)])
    }

    fn supports_cross_section_commit(&self) -> bool {
        true
    }

    fn commit_batches(&self, batches: &[(&SectionCursor, &Batch)]) -> Result<()> {
        let mut conn = self.conn()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for (cursor, batch) in batches {
            apply_batch(&txn, &cursor.scope, batch)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn keypoint(&self, cursor: &SectionCursor) -> Result<u64> {
        let staged = self.stage_keypoint(cursor)?;
        if self.swap_generation(cursor, &staged)? {
            let dropped = self.drop_generation(cursor, staged.from)?;
            tracing::info!(
                "Keypointed section {} of {}: dropped {dropped} rows, kept {}",
                cursor.section_id,
                cursor.scope,
                staged.live_rows
            );
            Ok(staged.live_rows)
        } else {
            Ok(staged.source.rows)
        }
    }

    fn retire_scope(
        &self,
        scope: &FailureScope,
        owner: &OwnerId,
        lease_version: u64,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let held = txn.execute(
            "DELETE FROM leases \
             WHERE scope = ?1 AND owner_id = ?2 AND lease_version = ?3",
            (&scope.0, &owner.0, lease_version),
        )?;
        if held != 1 {
            // Dropping the transaction rolls it back.
            return Ok(false);
        }
        let rows = txn.execute("DELETE FROM log_records WHERE scope = ?1", (&scope.0,))?;
        txn.execute("DELETE FROM section_heads WHERE scope = ?1", (&scope.0,))?;
        txn.commit()?;
        tracing::info!("Retired {scope}; deleted {rows} rows");
        Ok(true)
    }
}

impl LeaseStore for SqliteStore {
    fn read_lease(&self, scope: &FailureScope) -> Result<Option<StoredLease>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT owner_id, expiry_ms, lease_version FROM leases WHERE scope = ?1",
                (&scope.0,),
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, u64>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(owner, expiry_ms, version)| {
            Ok(StoredLease {
                scope: scope.clone(),
                owner: OwnerId(owner),
                expiry: expiry_from_sql(expiry_ms)?,
                version,
            })
        })
        .transpose()
    }

    fn read_leases(&self) -> Result<Vec<StoredLease>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT scope, owner_id, expiry_ms, lease_version FROM leases ORDER BY scope",
        )?;
        let rows = stmt
            .query_map((), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, u64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(scope, owner, expiry_ms, version)| {
                Ok(StoredLease {
                    scope: FailureScope(scope),
                    owner: OwnerId(owner),
                    expiry: expiry_from_sql(expiry_ms)?,
                    version,
                })
            })
            .collect()
    }

    fn insert_lease(&self, lease: &StoredLease) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO leases (scope, owner_id, expiry_ms, lease_version) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (scope) DO NOTHING",
            (
                &lease.scope.0,
                &lease.owner.0,
                lease.expiry.timestamp_millis(),
                lease.version,
            ),
        )?;
        Ok(inserted == 1)
    }

    fn swap_lease(&self, expected_version: u64, lease: &StoredLease) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE leases \
             SET owner_id = ?2, expiry_ms = ?3, lease_version = ?4, \
             last_updated = CURRENT_TIMESTAMP \
             WHERE scope = ?1 AND lease_version = ?5",
            (
                &lease.scope.0,
                &lease.owner.0,
                lease.expiry.timestamp_millis(),
                lease.version,
                expected_version,
            ),
        )?;
        Ok(updated == 1)
    }

    fn delete_lease(&self, scope: &FailureScope, owner: &OwnerId, version: u64) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM leases \
             WHERE scope = ?1 AND owner_id = ?2 AND lease_version = ?3",
            (&scope.0, &owner.0, version),
        )?;
        Ok(deleted == 1)
    }
}

enum Cursor<T> {
    /// We haven't started reading the table.
    Uninit,
    /// We should read after position T next.
    InProgress(T),
    /// We're done reading the table.
    Done,
}

/// Iterator that keeps a store ref so we don't keep the connection
/// locked the entire time we're replaying a section.
struct SqliteRecordLoader<'a> {
    store: &'a SqliteStore,
    scope: FailureScope,
    section_id: SectionId,
    generation: u64,
    cursor: Cursor<i64>,
    buffer: std::vec::IntoIter<Result<RecoveryRecord>>,
}

impl<'a> SqliteRecordLoader<'a> {
    fn select(&self, after: Option<i64>) -> Result<(Vec<Result<RecoveryRecord>>, Cursor<i64>)> {
        let batch_size = self.store.read_batch_size;
        let conn = self.store.conn()?;
        // Only the newest row per unit matters, and only if it is not
        // a discard. Units are paged in `unit_id` order, using the
        // last one read as the resume position.
        let mut stmt = conn.prepare_cached(
            "WITH newest AS ( \
             SELECT unit_id, MAX(seq) AS seq \
             FROM log_records \
             WHERE scope = ?1 AND section_id = ?2 AND generation = ?3 \
             GROUP BY unit_id \
             ) \
             SELECT unit_id, seq, payload \
             FROM log_records \
             JOIN newest USING (unit_id, seq) \
             WHERE scope = ?1 AND section_id = ?2 AND generation = ?3 \
             AND payload IS NOT NULL \
             AND (?4 IS NULL OR unit_id > ?4) \
             ORDER BY unit_id \
             LIMIT ?5",
        )?;
        let rows = stmt
            .query_map(
                (
                    &self.scope.0,
                    self.section_id.0,
                    self.generation,
                    after,
                    batch_size,
                ),
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, u64>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let next_cursor = match rows.last() {
            Some((unit_id, _, _)) if rows.len() == batch_size => Cursor::InProgress(*unit_id),
            _ => Cursor::Done,
        };
        let batch = rows
            .into_iter()
            .map(|(unit_id, seq, payload)| self.check_row(unit_id, seq, &payload))
            .collect();
        Ok((batch, next_cursor))
    }

    /// Decode a row and make sure its key columns agree with the
    /// record inside the blob.
    fn check_row(&self, unit_id: i64, seq: u64, payload: &[u8]) -> Result<RecoveryRecord> {
        let record = codec::decode(payload)?;
        let unit_id = unit_from_sql(unit_id);
        if record.section_id != self.section_id
            || record.recovery_unit_id != unit_id
            || record.sequence_number != SequenceNumber(seq)
        {
            return Err(RecoveryLogError::CorruptRecord(format!(
                "row (section {}, unit {unit_id}, seq {seq}) holds record \
                 (section {}, unit {}, seq {})",
                self.section_id,
                record.section_id,
                record.recovery_unit_id,
                record.sequence_number.0
            )));
        }
        tracing::trace!(
            "Read unit {unit_id} at seq {seq} from section {} of {} ({} bytes)",
            self.section_id,
            self.scope,
            record.payload.len()
        );
        Ok(record)
    }
}

impl<'a> Iterator for SqliteRecordLoader<'a> {
    type Item = Result<RecoveryRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffer.next() {
                return Some(item);
            }
            let after = match &self.cursor {
                Cursor::Uninit => None,
                Cursor::InProgress(unit_id) => Some(*unit_id),
                Cursor::Done => return None,
            };
            match self.select(after) {
                Ok((batch, next_cursor)) => {
                    self.cursor = next_cursor;
                    self.buffer = batch.into_iter();
                }
                Err(err) => {
                    self.cursor = Cursor::Done;
                    return Some(Err(err));
                }
            }
        }
    }
}

#[cfg(test)]
fn test_config() -> StoreConfig {
    StoreConfig {
        busy_timeout_ms: 5_000,
        read_batch_size: 2,
    }
}

#[cfg(test)]
fn upsert(section: u32, unit: u64, seq: u64, payload: &[u8]) -> Change {
    Change::Upsert(RecoveryRecord {
        section_id: SectionId(section),
        recovery_unit_id: RecoveryUnitId(unit),
        sequence_number: SequenceNumber(seq),
        payload: payload.to_vec(),
    })
}

#[cfg(test)]
fn read_units(store: &SqliteStore, cursor: &SectionCursor) -> Vec<(u64, u64, Vec<u8>)> {
    store
        .read_all(cursor)
        .unwrap()
        .map(|res| {
            let record = res.unwrap();
            (
                record.recovery_unit_id.0,
                record.sequence_number.0,
                record.payload,
            )
        })
        .collect()
}

#[test]
fn committed_batch_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.sqlite3");
    let scope = FailureScope::new("server1");

    {
        let store = SqliteStore::open(&path, &test_config()).unwrap();
        let cursor = store.open_section(&scope, SectionId(1)).unwrap();
        let batch = Batch {
            section_id: SectionId(1),
            changes: vec![upsert(1, 42, 1, b"P")],
        };
        store.commit_batch(&cursor, &batch).unwrap();
    }

    let store = SqliteStore::open(&path, &test_config()).unwrap();
    assert_eq!(store.list_sections(&scope).unwrap(), vec![SectionId(1)]);
    let cursor = store.open_section(&scope, SectionId(1)).unwrap();
    assert_eq!(cursor.high_water, SequenceNumber(1));
    assert_eq!(read_units(&store, &cursor), vec![(42, 1, b"P".to_vec())]);
}

#[test]
fn discard_hides_unit_and_raises_high_water() {
    let store = SqliteStore::open_in_memory(&test_config()).unwrap();
    let scope = FailureScope::new("server1");
    let cursor = store.open_section(&scope, SectionId(1)).unwrap();
    store
        .commit_batch(
            &cursor,
            &Batch {
                section_id: SectionId(1),
                changes: vec![upsert(1, 42, 1, b"P"), upsert(1, 43, 2, b"Q")],
            },
        )
        .unwrap();
    store
        .commit_batch(
            &cursor,
            &Batch {
                section_id: SectionId(1),
                changes: vec![Change::Discard(RecoveryUnitId(42), SequenceNumber(3))],
            },
        )
        .unwrap();

    let cursor = store.open_section(&scope, SectionId(1)).unwrap();
    assert_eq!(cursor.high_water, SequenceNumber(3));
    assert_eq!(cursor.stored_rows, 3);
    assert_eq!(read_units(&store, &cursor), vec![(43, 2, b"Q".to_vec())]);
}

#[test]
fn uncommitted_transaction_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.sqlite3");
    let scope = FailureScope::new("server1");

    {
        let store = SqliteStore::open(&path, &test_config()).unwrap();
        let cursor = store.open_section(&scope, SectionId(1)).unwrap();
        store
            .commit_batch(
                &cursor,
                &Batch {
                    section_id: SectionId(1),
                    changes: vec![upsert(1, 1, 1, b"before")],
                },
            )
            .unwrap();

        // Apply most of a batch and "crash" before commit.
        let mut conn = store.conn().unwrap();
        let txn = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .unwrap();
        let batch = Batch {
            section_id: SectionId(1),
            changes: vec![
                upsert(1, 1, 2, b"after"),
                upsert(1, 2, 3, b"new"),
                Change::Discard(RecoveryUnitId(1), SequenceNumber(4)),
            ],
        };
        apply_batch(&txn, &scope, &batch).unwrap();
        drop(txn);
    }

    let store = SqliteStore::open(&path, &test_config()).unwrap();
    let cursor = store.open_section(&scope, SectionId(1)).unwrap();
    assert_eq!(read_units(&store, &cursor), vec![(1, 1, b"before".to_vec())]);
    assert_eq!(cursor.high_water, SequenceNumber(1));
}

#[test]
fn recommitting_a_batch_is_idempotent() {
    let store = SqliteStore::open_in_memory(&test_config()).unwrap();
    let scope = FailureScope::new("server1");
    let cursor = store.open_section(&scope, SectionId(1)).unwrap();
    let batch = Batch {
        section_id: SectionId(1),
        changes: vec![upsert(1, 7, 1, b"x"), upsert(1, 8, 2, b"y")],
    };
    store.commit_batch(&cursor, &batch).unwrap();
    store.commit_batch(&cursor, &batch).unwrap();

    let cursor = store.open_section(&scope, SectionId(1)).unwrap();
    assert_eq!(cursor.stored_rows, 2);
    let first = read_units(&store, &cursor);
    let second = read_units(&store, &cursor);
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
}

#[test]
fn pages_through_more_than_one_batch() {
    let store = SqliteStore::open_in_memory(&test_config()).unwrap();
    let scope = FailureScope::new("server1");
    let cursor = store.open_section(&scope, SectionId(1)).unwrap();
    let changes = (1..=5).map(|i| upsert(1, i, i, b"p")).collect();
    store
        .commit_batch(
            &cursor,
            &Batch {
                section_id: SectionId(1),
                changes,
            },
        )
        .unwrap();

    let units: Vec<_> = read_units(&store, &cursor)
        .into_iter()
        .map(|(unit, _, _)| unit)
        .collect();
    assert_eq!(units, vec![1, 2, 3, 4, 5]);
}

#[test]
fn cross_section_commit_is_one_transaction() {
    let store = SqliteStore::open_in_memory(&test_config()).unwrap();
    let scope = FailureScope::new("server1");
    let one = store.open_section(&scope, SectionId(1)).unwrap();
    let two = store.open_section(&scope, SectionId(2)).unwrap();
    let good = Batch {
        section_id: SectionId(1),
        changes: vec![upsert(1, 1, 1, b"a")],
    };
    // Mislabeled record makes the second batch fail mid-transaction.
    let bad = Batch {
        section_id: SectionId(2),
        changes: vec![upsert(3, 1, 1, b"b")],
    };
    assert!(store.commit_batches(&[(&one, &good), (&two, &bad)]).is_err());
    assert!(read_units(&store, &one).is_empty());
}

#[test]
fn keypoint_keeps_only_live_rows() {
    let store = SqliteStore::open_in_memory(&test_config()).unwrap();
    let scope = FailureScope::new("server1");
    let cursor = store.open_section(&scope, SectionId(1)).unwrap();
    store
        .commit_batch(
            &cursor,
            &Batch {
                section_id: SectionId(1),
                changes: vec![
                    upsert(1, 1, 1, b"a1"),
                    upsert(1, 2, 2, b"b1"),
                    upsert(1, 1, 3, b"a2"),
                    Change::Discard(RecoveryUnitId(2), SequenceNumber(4)),
                    upsert(1, 3, 5, b"c1"),
                ],
            },
        )
        .unwrap();
    let before = read_units(&store, &cursor);

    assert_eq!(store.keypoint(&cursor).unwrap(), 2);

    let cursor = store.open_section(&scope, SectionId(1)).unwrap();
    assert_eq!(cursor.stored_rows, 2);
    assert_eq!(read_units(&store, &cursor), before);
}

#[test]
fn keypoint_keeps_high_water_of_dropped_discard() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.sqlite3");
    let scope = FailureScope::new("server1");

    {
        let store = SqliteStore::open(&path, &test_config()).unwrap();
        let cursor = store.open_section(&scope, SectionId(1)).unwrap();
        store
            .commit_batch(
                &cursor,
                &Batch {
                    section_id: SectionId(1),
                    changes: vec![
                        upsert(1, 1, 1, b"a"),
                        upsert(1, 2, 2, b"b"),
                        Change::Discard(RecoveryUnitId(2), SequenceNumber(3)),
                    ],
                },
            )
            .unwrap();
        assert_eq!(store.keypoint(&cursor).unwrap(), 1);
    }

    let store = SqliteStore::open(&path, &test_config()).unwrap();
    let cursor = store.open_section(&scope, SectionId(1)).unwrap();
    assert_eq!(cursor.stored_rows, 1);
    assert_eq!(cursor.high_water, SequenceNumber(3));
}

#[test]
fn crash_before_swap_keeps_previous_generation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.sqlite3");
    let scope = FailureScope::new("server1");

    let before = {
        let store = SqliteStore::open(&path, &test_config()).unwrap();
        let cursor = store.open_section(&scope, SectionId(1)).unwrap();
        store
            .commit_batch(
                &cursor,
                &Batch {
                    section_id: SectionId(1),
                    changes: vec![
                        upsert(1, 1, 1, b"a1"),
                        upsert(1, 1, 2, b"a2"),
                        upsert(1, 2, 3, b"b1"),
                    ],
                },
            )
            .unwrap();
        let before = read_units(&store, &cursor);
        store.stage_keypoint(&cursor).unwrap();
        before
    };

    let store = SqliteStore::open(&path, &test_config()).unwrap();
    let cursor = store.open_section(&scope, SectionId(1)).unwrap();
    assert_eq!(cursor.stored_rows, 3);
    assert_eq!(read_units(&store, &cursor), before);
    // The half-done copy is gone.
    let total: i64 = store
        .conn()
        .unwrap()
        .query_row("SELECT COUNT(*) FROM log_records", (), |row| row.get(0))
        .unwrap();
    assert_eq!(total, 3);
}

#[test]
fn crash_after_swap_finishes_cleanup_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.sqlite3");
    let scope = FailureScope::new("server1");

    let before = {
        let store = SqliteStore::open(&path, &test_config()).unwrap();
        let cursor = store.open_section(&scope, SectionId(1)).unwrap();
        store
            .commit_batch(
                &cursor,
                &Batch {
                    section_id: SectionId(1),
                    changes: vec![upsert(1, 1, 1, b"a1"), upsert(1, 1, 2, b"a2")],
                },
            )
            .unwrap();
        let before = read_units(&store, &cursor);
        let staged = store.stage_keypoint(&cursor).unwrap();
        assert!(store.swap_generation(&cursor, &staged).unwrap());
        before
    };

    let store = SqliteStore::open(&path, &test_config()).unwrap();
    let cursor = store.open_section(&scope, SectionId(1)).unwrap();
    assert_eq!(cursor.stored_rows, 1);
    assert_eq!(read_units(&store, &cursor), before);
}

#[test]
fn commit_during_staging_abandons_keypoint() {
    let store = SqliteStore::open_in_memory(&test_config()).unwrap();
    let scope = FailureScope::new("server1");
    let cursor = store.open_section(&scope, SectionId(1)).unwrap();
    store
        .commit_batch(
            &cursor,
            &Batch {
                section_id: SectionId(1),
                changes: vec![upsert(1, 1, 1, b"a1")],
            },
        )
        .unwrap();

    let staged = store.stage_keypoint(&cursor).unwrap();
    store
        .commit_batch(
            &cursor,
            &Batch {
                section_id: SectionId(1),
                changes: vec![upsert(1, 2, 2, b"b1")],
            },
        )
        .unwrap();
    assert!(!store.swap_generation(&cursor, &staged).unwrap());

    let units: Vec<_> = read_units(&store, &cursor)
        .into_iter()
        .map(|(unit, _, _)| unit)
        .collect();
    assert_eq!(units, vec![1, 2]);
}

#[test]
fn corrupt_blob_is_reported_not_skipped() {
    let store = SqliteStore::open_in_memory(&test_config()).unwrap();
    let scope = FailureScope::new("server1");
    let cursor = store.open_section(&scope, SectionId(1)).unwrap();
    store
        .commit_batch(
            &cursor,
            &Batch {
                section_id: SectionId(1),
                changes: vec![upsert(1, 1, 1, b"a"), upsert(1, 2, 2, b"b")],
            },
        )
        .unwrap();
    store
        .conn()
        .unwrap()
        .execute(
            "UPDATE log_records SET payload = X'01DEADBEEF' WHERE unit_id = 1",
            (),
        )
        .unwrap();

    let results: Vec<_> = store.read_all(&cursor).unwrap().collect();
    assert_eq!(results.len(), 2);
    assert!(matches!(
        results[0],
        Err(RecoveryLogError::CorruptRecord(..))
    ));
    assert_eq!(results[1].as_ref().unwrap().payload, b"b".to_vec());
}

#[test]
fn large_unit_ids_round_trip() {
    let store = SqliteStore::open_in_memory(&test_config()).unwrap();
    let scope = FailureScope::new("server1");
    let cursor = store.open_section(&scope, SectionId(1)).unwrap();
    store
        .commit_batch(
            &cursor,
            &Batch {
                section_id: SectionId(1),
                changes: vec![upsert(1, u64::MAX, 1, b"max")],
            },
        )
        .unwrap();
    assert_eq!(
        read_units(&store, &cursor),
        vec![(u64::MAX, 1, b"max".to_vec())]
    );
}

#[test]
fn not_a_database_is_schema_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.sqlite3");
    std::fs::write(&path, vec![0x5a; 8192]).unwrap();

    let err = SqliteStore::open(&path, &test_config())
        .err()
        .unwrap();
    assert!(matches!(err.root(), RecoveryLogError::Schema(..)));
}

#[test]
fn lease_writes_are_conditional() {
    let store = SqliteStore::open_in_memory(&test_config()).unwrap();
    let scope = FailureScope::new("server1");
    let expiry = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 30).unwrap();
    let first = StoredLease {
        scope: scope.clone(),
        owner: OwnerId::new("a"),
        expiry,
        version: 1,
    };
    assert!(store.insert_lease(&first).unwrap());
    assert!(!store.insert_lease(&first).unwrap());

    let second = StoredLease {
        owner: OwnerId::new("b"),
        version: 2,
        ..first.clone()
    };
    assert!(store.swap_lease(1, &second).unwrap());
    // Stale expectation loses.
    assert!(!store.swap_lease(1, &first).unwrap());
    assert_eq!(store.read_lease(&scope).unwrap(), Some(second.clone()));

    assert!(!store.delete_lease(&scope, &OwnerId::new("a"), 2).unwrap());
    assert!(store.delete_lease(&scope, &OwnerId::new("b"), 2).unwrap());
    assert_eq!(store.read_lease(&scope).unwrap(), None);
}

#[test]
fn retire_requires_current_lease() {
    let store = SqliteStore::open_in_memory(&test_config()).unwrap();
    let scope = FailureScope::new("server1");
    let cursor = store.open_section(&scope, SectionId(1)).unwrap();
    store
        .commit_batch(
            &cursor,
            &Batch {
                section_id: SectionId(1),
                changes: vec![upsert(1, 1, 1, b"a")],
            },
        )
        .unwrap();
    store
        .insert_lease(&StoredLease {
            scope: scope.clone(),
            owner: OwnerId::new("a"),
            expiry: Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 30).unwrap(),
            version: 3,
        })
        .unwrap();

    assert!(!store.retire_scope(&scope, &OwnerId::new("a"), 2).unwrap());
    assert_eq!(store.list_sections(&scope).unwrap(), vec![SectionId(1)]);

    assert!(store.retire_scope(&scope, &OwnerId::new("a"), 3).unwrap());
    assert!(store.list_sections(&scope).unwrap().is_empty());
    assert_eq!(store.read_lease(&scope).unwrap(), None);
}

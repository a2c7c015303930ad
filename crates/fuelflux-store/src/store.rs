//! SQLite-backed store implementation.

use crate::{StoreError, StoreResult};
use fuelflux_core::{MessageMethod, UserCacheEntry};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// One stored reportable transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    /// SQLite rowid; backlog FIFO order.
    pub id: i64,
    pub uid: String,
    pub method: MessageMethod,
    /// Serialized request payload, replayed verbatim on resend.
    pub data: String,
}

struct StoreInner {
    conn: Connection,
    active_is_a: bool,
    population_in_progress: bool,
}

/// Durable message store over a single SQLite file.
///
/// Thread-safe: every public call takes the store-wide mutex.
pub struct MessageStore {
    inner: Mutex<StoreInner>,
}

impl MessageStore {
    /// Open (creating if needed) the store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory store for testing.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            "
            PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS backlog (
                uid TEXT NOT NULL,
                method TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS dead_messages (
                uid TEXT NOT NULL,
                method TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS user_cache_a (
                uid TEXT PRIMARY KEY,
                allowance REAL NOT NULL,
                role_id INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS user_cache_b (
                uid TEXT PRIMARY KEY,
                allowance REAL NOT NULL,
                role_id INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS user_cache_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;

        // Read or seed the active-table indicator.
        let active: Option<String> = conn
            .query_row(
                "SELECT value FROM user_cache_meta WHERE key = 'active_table'",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let active_is_a = match active {
            Some(value) => value == "A",
            None => {
                conn.execute(
                    "INSERT INTO user_cache_meta (key, value) VALUES ('active_table', 'A')",
                    [],
                )?;
                true
            }
        };

        debug!(active_is_a, "Message store opened");

        Ok(Self {
            inner: Mutex::new(StoreInner {
                conn,
                active_is_a,
                population_in_progress: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("lock poisoned")
    }

    // ==========================================
    // Backlog / dead queues
    // ==========================================

    /// Append a reportable transaction to the backlog.
    pub fn add_backlog(&self, uid: &str, method: MessageMethod, data: &str) -> StoreResult<()> {
        if uid.is_empty() {
            return Err(StoreError::InvalidData("empty uid".to_string()));
        }
        let inner = self.lock();
        inner.conn.execute(
            "INSERT INTO backlog (uid, method, data) VALUES (?1, ?2, ?3)",
            params![uid, method.as_str(), data],
        )?;
        Ok(())
    }

    /// Append a terminally rejected transaction to the dead queue.
    pub fn add_dead(&self, uid: &str, method: MessageMethod, data: &str) -> StoreResult<()> {
        if uid.is_empty() {
            return Err(StoreError::InvalidData("empty uid".to_string()));
        }
        let inner = self.lock();
        inner.conn.execute(
            "INSERT INTO dead_messages (uid, method, data) VALUES (?1, ?2, ?3)",
            params![uid, method.as_str(), data],
        )?;
        Ok(())
    }

    /// Oldest backlog item, or `None` when the backlog is empty.
    ///
    /// A row whose method tag no longer parses is treated as unreadable
    /// and reported as empty.
    pub fn next_backlog(&self) -> StoreResult<Option<StoredMessage>> {
        let inner = self.lock();
        let mut stmt = inner.conn.prepare(
            "SELECT rowid, uid, method, data FROM backlog ORDER BY rowid ASC LIMIT 1",
        )?;

        let row = stmt.query_row([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        });

        match row {
            Ok((id, uid, method, data)) => match MessageMethod::parse(&method) {
                Some(method) => Ok(Some(StoredMessage {
                    id,
                    uid,
                    method,
                    data,
                })),
                None => {
                    warn!(id, method = %method, "Unreadable backlog row");
                    Ok(None)
                }
            },
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a backlog item by rowid.
    pub fn remove_backlog(&self, id: i64) -> StoreResult<()> {
        let inner = self.lock();
        inner
            .conn
            .execute("DELETE FROM backlog WHERE rowid = ?1", params![id])?;
        Ok(())
    }

    /// Number of backlog items.
    pub fn backlog_count(&self) -> StoreResult<i64> {
        let inner = self.lock();
        let count = inner
            .conn
            .query_row("SELECT COUNT(*) FROM backlog", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Number of dead-letter items.
    pub fn dead_count(&self) -> StoreResult<i64> {
        let inner = self.lock();
        let count = inner
            .conn
            .query_row("SELECT COUNT(*) FROM dead_messages", [], |row| row.get(0))?;
        Ok(count)
    }

    // ==========================================
    // User allowance cache (A/B pair)
    // ==========================================

    /// Look up a user in the active cache table.
    pub fn cache_get(&self, uid: &str) -> StoreResult<Option<UserCacheEntry>> {
        let inner = self.lock();
        let sql = format!(
            "SELECT uid, allowance, role_id FROM {} WHERE uid = ?1",
            active_table(inner.active_is_a)
        );
        let result = inner.conn.query_row(&sql, params![uid], |row| {
            Ok(UserCacheEntry {
                uid: row.get(0)?,
                allowance: row.get(1)?,
                role_id: row.get(2)?,
            })
        });
        match result {
            Ok(entry) => Ok(Some(entry)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Upsert a user in the active cache table.
    pub fn cache_update(&self, uid: &str, allowance: f64, role_id: i64) -> StoreResult<()> {
        let inner = self.lock();
        let sql = format!(
            "INSERT OR REPLACE INTO {} (uid, allowance, role_id) VALUES (?1, ?2, ?3)",
            active_table(inner.active_is_a)
        );
        inner.conn.execute(&sql, params![uid, allowance, role_id])?;
        Ok(())
    }

    /// Number of entries in the active cache table.
    pub fn cache_count(&self) -> StoreResult<i64> {
        let inner = self.lock();
        let sql = format!("SELECT COUNT(*) FROM {}", active_table(inner.active_is_a));
        let count = inner.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count)
    }

    /// Begin a cache population: clears the standby table.
    ///
    /// Rejects a concurrent begin while a population is in progress.
    pub fn begin_population(&self) -> StoreResult<()> {
        let mut inner = self.lock();
        if inner.population_in_progress {
            return Err(StoreError::PopulationInProgress);
        }
        let sql = format!("DELETE FROM {}", standby_table(inner.active_is_a));
        inner.conn.execute(&sql, [])?;
        inner.population_in_progress = true;
        Ok(())
    }

    /// Write one entry into the standby table.
    ///
    /// Rejected unless a population is in progress.
    pub fn add_population_entry(
        &self,
        uid: &str,
        allowance: f64,
        role_id: i64,
    ) -> StoreResult<()> {
        let inner = self.lock();
        if !inner.population_in_progress {
            return Err(StoreError::PopulationNotStarted);
        }
        let sql = format!(
            "INSERT OR REPLACE INTO {} (uid, allowance, role_id) VALUES (?1, ?2, ?3)",
            standby_table(inner.active_is_a)
        );
        inner.conn.execute(&sql, params![uid, allowance, role_id])?;
        Ok(())
    }

    /// Commit the population: atomically make the standby table active.
    ///
    /// The flip is recorded in `user_cache_meta` inside a transaction; the
    /// in-memory indicator follows only after the transaction commits, so
    /// a failure leaves the previous active table in force.
    pub fn commit_population(&self) -> StoreResult<()> {
        let mut inner = self.lock();
        if !inner.population_in_progress {
            return Err(StoreError::PopulationNotStarted);
        }

        let new_value = if inner.active_is_a { "B" } else { "A" };
        let inner = &mut *inner;
        let tx = inner.conn.transaction()?;
        tx.execute(
            "UPDATE user_cache_meta SET value = ?1 WHERE key = 'active_table'",
            params![new_value],
        )?;
        tx.commit()?;

        inner.active_is_a = !inner.active_is_a;
        inner.population_in_progress = false;
        debug!(active = new_value, "Cache population committed");
        Ok(())
    }

    /// Abort a population in progress.
    ///
    /// The standby table is left as-is; the next begin clears it.
    pub fn abort_population(&self) {
        let mut inner = self.lock();
        inner.population_in_progress = false;
    }

    /// Whether a population is currently in progress.
    pub fn population_in_progress(&self) -> bool {
        self.lock().population_in_progress
    }
}

fn active_table(active_is_a: bool) -> &'static str {
    if active_is_a {
        "user_cache_a"
    } else {
        "user_cache_b"
    }
}

fn standby_table(active_is_a: bool) -> &'static str {
    if active_is_a {
        "user_cache_b"
    } else {
        "user_cache_a"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MessageStore {
        MessageStore::open_in_memory().unwrap()
    }

    // =========================================================================
    // Backlog / dead queue tests
    // =========================================================================

    #[test]
    fn backlog_starts_empty() {
        let store = store();
        assert_eq!(store.backlog_count().unwrap(), 0);
        assert!(store.next_backlog().unwrap().is_none());
    }

    #[test]
    fn backlog_is_fifo_by_rowid() {
        let store = store();
        store
            .add_backlog("u1", MessageMethod::Refuel, "{\"a\":1}")
            .unwrap();
        store
            .add_backlog("u2", MessageMethod::Intake, "{\"b\":2}")
            .unwrap();
        assert_eq!(store.backlog_count().unwrap(), 2);

        let first = store.next_backlog().unwrap().unwrap();
        assert_eq!(first.uid, "u1");
        assert_eq!(first.method, MessageMethod::Refuel);
        assert_eq!(first.data, "{\"a\":1}");

        store.remove_backlog(first.id).unwrap();
        let second = store.next_backlog().unwrap().unwrap();
        assert_eq!(second.uid, "u2");
        assert_eq!(second.method, MessageMethod::Intake);
        assert_eq!(store.backlog_count().unwrap(), 1);
    }

    #[test]
    fn next_backlog_keeps_rowid_until_removed() {
        let store = store();
        store.add_backlog("u1", MessageMethod::Refuel, "{}").unwrap();

        let a = store.next_backlog().unwrap().unwrap();
        let b = store.next_backlog().unwrap().unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn add_backlog_rejects_empty_uid() {
        let store = store();
        assert!(matches!(
            store.add_backlog("", MessageMethod::Refuel, "{}"),
            Err(StoreError::InvalidData(_))
        ));
    }

    #[test]
    fn dead_queue_counts() {
        let store = store();
        store.add_dead("u1", MessageMethod::Refuel, "{}").unwrap();
        store.add_dead("u1", MessageMethod::Intake, "{}").unwrap();
        assert_eq!(store.dead_count().unwrap(), 2);
        assert_eq!(store.backlog_count().unwrap(), 0);
    }

    #[test]
    fn unreadable_method_reads_as_empty() {
        let store = store();
        {
            let inner = store.lock();
            inner
                .conn
                .execute(
                    "INSERT INTO backlog (uid, method, data) VALUES ('u', 'Bogus', '{}')",
                    [],
                )
                .unwrap();
        }
        assert!(store.next_backlog().unwrap().is_none());
    }

    // =========================================================================
    // Cache tests
    // =========================================================================

    #[test]
    fn cache_get_missing_is_none() {
        let store = store();
        assert!(store.cache_get("nobody").unwrap().is_none());
    }

    #[test]
    fn cache_update_then_get() {
        let store = store();
        store.cache_update("u1", 120.5, 1).unwrap();
        let entry = store.cache_get("u1").unwrap().unwrap();
        assert_eq!(entry.uid, "u1");
        assert_eq!(entry.allowance, 120.5);
        assert_eq!(entry.role_id, 1);

        store.cache_update("u1", 70.0, 1).unwrap();
        let entry = store.cache_get("u1").unwrap().unwrap();
        assert_eq!(entry.allowance, 70.0);
        assert_eq!(store.cache_count().unwrap(), 1);
    }

    // =========================================================================
    // Population tests
    // =========================================================================

    #[test]
    fn population_flips_active_table() {
        let store = store();
        store.cache_update("old", 5.0, 1).unwrap();

        store.begin_population().unwrap();
        store.add_population_entry("new", 42.0, 2).unwrap();
        store.commit_population().unwrap();

        // The committed population replaces the previous contents wholesale.
        assert!(store.cache_get("old").unwrap().is_none());
        let entry = store.cache_get("new").unwrap().unwrap();
        assert_eq!(entry.allowance, 42.0);
        assert_eq!(entry.role_id, 2);
        assert_eq!(store.cache_count().unwrap(), 1);
    }

    #[test]
    fn double_begin_is_rejected() {
        let store = store();
        store.begin_population().unwrap();
        assert!(matches!(
            store.begin_population(),
            Err(StoreError::PopulationInProgress)
        ));
    }

    #[test]
    fn population_entry_requires_begin() {
        let store = store();
        assert!(matches!(
            store.add_population_entry("u", 1.0, 1),
            Err(StoreError::PopulationNotStarted)
        ));
        assert!(matches!(
            store.commit_population(),
            Err(StoreError::PopulationNotStarted)
        ));
    }

    #[test]
    fn abort_allows_new_begin() {
        let store = store();
        store.begin_population().unwrap();
        store.add_population_entry("u", 1.0, 1).unwrap();
        store.abort_population();
        assert!(!store.population_in_progress());

        // Aborted entries never reach the active table, and the next
        // population starts from a clean standby.
        assert!(store.cache_get("u").unwrap().is_none());
        store.begin_population().unwrap();
        store.commit_population().unwrap();
        assert_eq!(store.cache_count().unwrap(), 0);
    }

    #[test]
    fn updates_during_population_hit_active_table_and_are_superseded() {
        let store = store();
        store.cache_update("u1", 100.0, 1).unwrap();

        store.begin_population().unwrap();
        store.add_population_entry("u1", 80.0, 1).unwrap();

        // Mid-population, the active table still serves reads and updates.
        store.cache_update("u1", 55.0, 1).unwrap();
        assert_eq!(store.cache_get("u1").unwrap().unwrap().allowance, 55.0);

        store.commit_population().unwrap();

        // After the flip the population value wins; nothing stale survives.
        assert_eq!(store.cache_get("u1").unwrap().unwrap().allowance, 80.0);
    }

    #[test]
    fn updates_after_commit_land_on_new_active_table() {
        let store = store();
        store.begin_population().unwrap();
        store.add_population_entry("u1", 80.0, 1).unwrap();
        store.commit_population().unwrap();

        store.cache_update("u1", 30.0, 1).unwrap();
        assert_eq!(store.cache_get("u1").unwrap().unwrap().allowance, 30.0);
    }

    #[test]
    fn second_population_flips_back() {
        let store = store();
        store.begin_population().unwrap();
        store.add_population_entry("gen1", 1.0, 1).unwrap();
        store.commit_population().unwrap();

        store.begin_population().unwrap();
        store.add_population_entry("gen2", 2.0, 1).unwrap();
        store.commit_population().unwrap();

        assert!(store.cache_get("gen1").unwrap().is_none());
        assert!(store.cache_get("gen2").unwrap().is_some());
    }

    #[test]
    fn active_table_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.db");

        {
            let store = MessageStore::open(&path).unwrap();
            store.begin_population().unwrap();
            store.add_population_entry("u1", 12.0, 1).unwrap();
            store.commit_population().unwrap();
            store
                .add_backlog("u1", MessageMethod::Refuel, "{}")
                .unwrap();
        }

        let store = MessageStore::open(&path).unwrap();
        assert_eq!(store.cache_get("u1").unwrap().unwrap().allowance, 12.0);
        assert_eq!(store.backlog_count().unwrap(), 1);
    }
}
